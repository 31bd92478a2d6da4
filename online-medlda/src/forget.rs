//! Forgetting-factor schedules.
//!
//! A schedule yields one factor ρ_r ∈ (0, 1] per elapsed round. Old
//! statistics are multiplied by ρ_r when round r starts, so a batch
//! merged at round r carries weight `F(now) / F(r)` with the cumulative
//! product `F(r) = ρ_1 ⋯ ρ_r`.

use crate::error::MedLdaError;
use serde::{Deserialize, Serialize};

/// How fast old batches lose influence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ForgetSchedule {
    /// No decay; every alive batch keeps full weight.
    None,
    /// The same factor every round.
    Constant {
        /// Factor in (0, 1]
        rho: f64,
    },
    /// `ρ_r = 1 - (τ + r)^(-κ)`: strong forgetting early, fading later.
    PowerLaw {
        /// Delay τ > 1
        tau: f64,
        /// Exponent κ in (0, 1]
        kappa: f64,
    },
}

impl Default for ForgetSchedule {
    fn default() -> Self {
        ForgetSchedule::None
    }
}

impl ForgetSchedule {
    /// Factor applied at the start of `round` (1-based).
    pub fn factor(&self, round: usize) -> f64 {
        match self {
            ForgetSchedule::None => 1.0,
            ForgetSchedule::Constant { rho } => *rho,
            ForgetSchedule::PowerLaw { tau, kappa } => 1.0 - (tau + round as f64).powf(-kappa),
        }
    }

    /// Reject schedules that could produce a factor outside (0, 1].
    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            ForgetSchedule::None => Ok(()),
            ForgetSchedule::Constant { rho } => {
                if rho.is_finite() && *rho > 0.0 && *rho <= 1.0 {
                    Ok(())
                } else {
                    Err(MedLdaError::invalid_option("forget.rho", rho, "in (0, 1]"))
                }
            }
            ForgetSchedule::PowerLaw { tau, kappa } => {
                if !(tau.is_finite() && *tau > 1.0) {
                    return Err(MedLdaError::invalid_option("forget.tau", tau, "> 1"));
                }
                if !(kappa.is_finite() && *kappa > 0.0 && *kappa <= 1.0) {
                    return Err(MedLdaError::invalid_option("forget.kappa", kappa, "in (0, 1]"));
                }
                Ok(())
            }
        }
    }
}

/// Forget factors, one per elapsed round.
///
/// `factors[r]` is ρ_r; `factors[0] = 1` stands for "before any round".
#[derive(Debug, Clone)]
pub struct ForgetLedger {
    schedule: ForgetSchedule,
    factors: Vec<f64>,
}

impl ForgetLedger {
    /// Empty ledger for `schedule`.
    pub fn new(schedule: ForgetSchedule) -> Self {
        ForgetLedger {
            schedule,
            factors: vec![1.0],
        }
    }

    /// Record the start of `round` and return its factor ρ_round.
    pub fn advance(&mut self, round: usize) -> f64 {
        let rho = self.schedule.factor(round);
        self.factors.push(rho);
        rho
    }

    /// Forget every round after `round`.
    pub fn truncate(&mut self, round: usize) {
        self.factors.truncate(round + 1);
    }

    /// Per-round factors ρ_r (index 0 is the pre-training placeholder).
    pub fn factors(&self) -> &[f64] {
        &self.factors
    }
}
