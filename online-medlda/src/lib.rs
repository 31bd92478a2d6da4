//! Online max-margin supervised topic model (MedLDA).
//!
//! Mini-batches of labeled documents are folded into a posterior over
//! topic-word distributions φ (Dirichlet) and classifier weights η
//! (Gaussian). Each round alternates Gibbs sweeps over topic
//! assignments and hinge-loss augmentation scales with a closed-form
//! update of the posterior. Old batches fade through a forgetting
//! schedule and any alive batch can be ejected again.
//!
//! ```no_run
//! use online_medlda::{Document, MedLdaOptions, OnlineMedLda};
//!
//! let mut model = OnlineMedLda::new(MedLdaOptions {
//!     num_topics: 2,
//!     vocab_size: 4,
//!     ..Default::default()
//! })?;
//! model.init()?;
//! let docs = vec![Document::new(vec![(0, 3), (1, 1)])];
//! let cost = model.train(&docs, &[1])?;
//! let acc = model.inference(&docs, &[1], 0, None)?.accuracy;
//! # let _ = (cost, acc);
//! # Ok::<(), anyhow::Error>(())
//! ```

#![deny(missing_docs)]
#![deny(warnings)]

/// Commit points of the learning curve
pub mod commit;

/// Documents, labels and the corpus provider interface
pub mod corpus;

/// Error taxonomy
pub mod error;

/// Forgetting-factor schedules
pub mod forget;

/// Gibbs E-step over topic assignments and augmentation scales
pub mod gibbs;

/// Online controller
pub mod online;

/// Model options
pub mod options;

/// Per-document assignments and posterior draws
pub mod sample;

/// Decayed sufficient statistics and the posterior of η
pub mod sufficient_stats;

/// Sparse sets of touched topic-word cells
pub mod touched;

/// Closed-form M-step
pub mod variational;

pub use commit::CommitPoint;
pub use corpus::{CorpusProvider, Document, InMemoryCorpus};
pub use error::{kind_of, MedLdaError};
pub use forget::ForgetSchedule;
pub use online::{InferenceResult, OnlineMedLda};
pub use options::MedLdaOptions;
pub use sample::{Sample, SampleZ};
pub use sufficient_stats::GlobalStats;
