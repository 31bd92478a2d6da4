//! Options for the online MedLDA engine.

use crate::error::MedLdaError;
use crate::forget::ForgetSchedule;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Options for online MedLDA training and held-out inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MedLdaOptions {
    /// Number of topics K. Default: 10
    pub num_topics: usize,
    /// Vocabulary size T. Default: 1000
    pub vocab_size: usize,
    /// Document-topic Dirichlet smoothing α0. Default: 0.1
    pub alpha0: f64,
    /// Topic-word Dirichlet smoothing β0. Default: 0.01
    pub beta0: f64,
    /// Regularization constant c of the hinge loss. Default: 1.0
    pub c: f64,
    /// Margin ℓ of the hinge loss (> 0). Default: 1.0
    pub ell: f64,
    /// Prior variance v² of each classifier weight. Default: 1.0
    pub eta_prior_var: f64,
    /// Gibbs sweeps per training round. Default: 2
    pub max_gibbs_iter: usize,
    /// Leading sweeps of a round excluded from the M-step. Default: 0
    pub gibbs_burnin: usize,
    /// Documents per mini-batch J, used by `train_epoch`. Default: 64
    pub batch_size: usize,
    /// Burn-in sweeps per held-out document. Default: 10
    pub test_burnin: usize,
    /// Retained sweeps per held-out document. Default: 10
    pub max_test_samples: usize,
    /// Posterior draws of (φ, η) at inference, 0 = posterior mean. Default: 0
    pub num_test_sample: usize,
    /// Forgetting-factor schedule. Default: `ForgetSchedule::None`
    pub forget: ForgetSchedule,
    /// Upper bound on alive batches; the oldest is ejected past it. Default: None
    pub window_size: Option<usize>,
    /// Rounds between commit points, 0 = never. Default: 0
    pub commit_point_spacing: usize,
    /// Sequential-Bayesian mode: batches add at full weight, no forgetting. Default: true
    pub mode_additive: bool,
    /// One-vs-rest category; `None` expects ±1 labels. Default: None
    pub category: Option<usize>,
    /// Capacity of each sparse update list. Default: None (unbounded)
    pub max_touched_cells: Option<usize>,
    /// Retained rounds of topic assignments and posterior draws. Default: 8
    pub history_size: usize,
    /// Seed of the model's random stream. Default: 42
    pub seed: u64,
    /// Run held-out documents on the rayon pool. Default: false
    pub parallel_inference: bool,
}

impl Default for MedLdaOptions {
    fn default() -> Self {
        MedLdaOptions {
            num_topics: 10,
            vocab_size: 1000,
            alpha0: 0.1,
            beta0: 0.01,
            c: 1.0,
            ell: 1.0,
            eta_prior_var: 1.0,
            max_gibbs_iter: 2,
            gibbs_burnin: 0,
            batch_size: 64,
            test_burnin: 10,
            max_test_samples: 10,
            num_test_sample: 0,
            forget: ForgetSchedule::None,
            window_size: None,
            commit_point_spacing: 0,
            mode_additive: true,
            category: None,
            max_touched_cells: None,
            history_size: 8,
            seed: 42,
            parallel_inference: false,
        }
    }
}

impl MedLdaOptions {
    /// Parse options from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let options: MedLdaOptions = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Read options from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        Self::from_json_str(&json)
    }

    /// Serialize to pretty JSON.
    pub fn to_json_string(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Sweeps per round that feed the M-step.
    pub fn retained_sweeps(&self) -> usize {
        self.max_gibbs_iter.saturating_sub(self.gibbs_burnin)
    }

    /// Reject values outside their domain.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_topics == 0 {
            return Err(MedLdaError::invalid_option("num_topics", self.num_topics, "> 0"));
        }
        if self.vocab_size == 0 {
            return Err(MedLdaError::invalid_option("vocab_size", self.vocab_size, "> 0"));
        }
        for (name, value) in [
            ("alpha0", self.alpha0),
            ("beta0", self.beta0),
            ("c", self.c),
            ("ell", self.ell),
            ("eta_prior_var", self.eta_prior_var),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(MedLdaError::invalid_option(name, value, "finite and > 0"));
            }
        }
        if self.max_gibbs_iter == 0 {
            return Err(MedLdaError::invalid_option("max_gibbs_iter", self.max_gibbs_iter, "> 0"));
        }
        if self.gibbs_burnin >= self.max_gibbs_iter {
            return Err(MedLdaError::invalid_option(
                "gibbs_burnin",
                self.gibbs_burnin,
                "< max_gibbs_iter",
            ));
        }
        if self.batch_size == 0 {
            return Err(MedLdaError::invalid_option("batch_size", self.batch_size, "> 0"));
        }
        if self.max_test_samples == 0 {
            return Err(MedLdaError::invalid_option(
                "max_test_samples",
                self.max_test_samples,
                "> 0",
            ));
        }
        if let Some(w) = self.window_size {
            if w == 0 {
                return Err(MedLdaError::invalid_option("window_size", w, "> 0"));
            }
        }
        if let Some(cap) = self.max_touched_cells {
            if cap == 0 {
                return Err(MedLdaError::invalid_option("max_touched_cells", cap, "> 0"));
            }
        }
        if self.history_size == 0 {
            return Err(MedLdaError::invalid_option("history_size", self.history_size, "> 0"));
        }
        self.forget.validate()?;
        Ok(())
    }

    /// The schedule actually applied: additive mode never forgets.
    pub fn effective_forget(&self) -> ForgetSchedule {
        if self.mode_additive {
            ForgetSchedule::None
        } else {
            self.forget.clone()
        }
    }
}
