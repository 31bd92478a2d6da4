//! Random streams and samplers shared by the online MedLDA engine.
//!
//! Everything here draws from an explicitly passed `Rng`, so a caller
//! owning a single [`prng::Prng`] gets reproducible runs end to end.

#![deny(missing_docs)]
#![deny(warnings)]

/// Seedable, injectable pseudo-random stream
pub mod prng;

/// Inverse Gaussian draws for the hinge-loss augmentation
pub mod inverse_gaussian;

/// Multivariate Gaussian draws and small SPD linear algebra
pub mod mv_gaussian;

/// Categorical and Dirichlet draws
pub mod categorical;

pub use categorical::{sample_categorical, sample_categorical_log, sample_dirichlet};
pub use inverse_gaussian::InverseGaussianSampler;
pub use mv_gaussian::MvGaussian;
pub use prng::Prng;
