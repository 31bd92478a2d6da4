//! Inverse Gaussian draws.
//!
//! ```text
//! IG(x | μ, λ) = sqrt(λ / (2π x³)) exp(-λ (x - μ)² / (2 μ² x))
//! E[x] = μ,  Var[x] = μ³ / λ
//! ```
//!
//! The hinge-loss augmentation of max-margin topic models draws the
//! reciprocal of its auxiliary scale from this family.

use log::warn;
use rand::Rng;
use rand_distr::{Distribution, InverseGaussian};

/// Inverse Gaussian sampler with a bounded number of redraws.
///
/// A draw that comes back non-finite or non-positive (possible when
/// `μ²` overflows for extreme means) is redrawn up to `max_redraws`
/// times before the failure is reported.
#[derive(Debug, Clone)]
pub struct InverseGaussianSampler {
    /// Redraw attempts for a degenerate draw. Default: 3
    pub max_redraws: usize,
}

impl Default for InverseGaussianSampler {
    fn default() -> Self {
        InverseGaussianSampler { max_redraws: 3 }
    }
}

impl InverseGaussianSampler {
    /// Draw one value from `IG(mean, shape)`.
    ///
    /// * `mean` - must be finite and > 0
    /// * `shape` - must be finite and > 0
    pub fn sample<R: Rng + ?Sized>(&self, mean: f64, shape: f64, rng: &mut R) -> anyhow::Result<f64> {
        anyhow::ensure!(
            mean.is_finite() && mean > 0.0,
            "inverse Gaussian mean must be finite and positive, got {}",
            mean
        );
        anyhow::ensure!(
            shape.is_finite() && shape > 0.0,
            "inverse Gaussian shape must be finite and positive, got {}",
            shape
        );

        let dist = InverseGaussian::new(mean, shape)
            .map_err(|e| anyhow::anyhow!("IG({}, {}): {:?}", mean, shape, e))?;

        for attempt in 0..=self.max_redraws {
            let x: f64 = dist.sample(rng);
            if x.is_finite() && x > 0.0 {
                return Ok(x);
            }
            warn!(
                "degenerate inverse Gaussian draw {} (mean={}, shape={}), attempt {}",
                x, mean, shape, attempt
            );
        }

        anyhow::bail!(
            "inverse Gaussian draws stayed degenerate after {} redraws (mean={}, shape={})",
            self.max_redraws,
            mean,
            shape
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn test_moments_match() {
        let sampler = InverseGaussianSampler::default();
        let mut rng = SmallRng::seed_from_u64(42);
        let (mean, shape) = (1.5, 2.0);
        let n = 50_000;

        let draws: Vec<f64> = (0..n)
            .map(|_| sampler.sample(mean, shape, &mut rng).unwrap())
            .collect();

        let m = draws.iter().sum::<f64>() / n as f64;
        let v = draws.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / (n - 1) as f64;

        assert!((m - mean).abs() < 0.05, "mean={}, expected={}", m, mean);
        let expected_var = mean.powi(3) / shape;
        assert!(
            (v - expected_var).abs() < 0.15 * expected_var,
            "var={}, expected={}",
            v,
            expected_var
        );
        assert!(draws.iter().all(|&x| x > 0.0));
    }

    #[test]
    fn test_rejects_non_positive_parameters() {
        let sampler = InverseGaussianSampler::default();
        let mut rng = SmallRng::seed_from_u64(1);
        assert!(sampler.sample(0.0, 1.0, &mut rng).is_err());
        assert!(sampler.sample(1.0, -1.0, &mut rng).is_err());
        assert!(sampler.sample(f64::INFINITY, 1.0, &mut rng).is_err());
        assert!(sampler.sample(1.0, f64::NAN, &mut rng).is_err());
    }
}
