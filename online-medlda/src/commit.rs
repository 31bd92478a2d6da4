//! Commit points: the externally observable learning curve.

use serde::{Deserialize, Serialize};

/// Snapshot of training progress after a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitPoint {
    /// Round at which the point was taken
    pub round: usize,
    /// Accumulated training time in seconds
    pub time_secs: f64,
    /// Fraction of the corpus observed so far, if the corpus size is known
    pub ob_percent: Option<f64>,
    /// Held-out accuracy, if test data was set
    pub accuracy: Option<f64>,
    /// Posterior mean of η at the time of the commit
    pub eta_mean: Vec<f64>,
}

/// Serialize a learning curve as JSON lines, one point per line.
pub fn to_json_lines(points: &[CommitPoint]) -> anyhow::Result<String> {
    let mut out = String::new();
    for p in points {
        out.push_str(&serde_json::to_string(p)?);
        out.push('\n');
    }
    Ok(out)
}
