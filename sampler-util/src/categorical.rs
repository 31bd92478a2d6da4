//! Categorical and Dirichlet draws.

use rand::Rng;
use rand_distr::{Distribution, Gamma};

/// Sample from a categorical distribution given log-probabilities.
///
/// Uses the log-sum-exp trick for numerical stability. All-`-inf` or
/// non-finite weights are an error rather than a silent uniform draw.
pub fn sample_categorical_log<R: Rng + ?Sized>(log_probs: &[f64], rng: &mut R) -> anyhow::Result<usize> {
    anyhow::ensure!(!log_probs.is_empty(), "empty categorical");
    let max = log_probs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    anyhow::ensure!(max.is_finite(), "categorical log-weights have no finite maximum ({})", max);

    let weights: Vec<f64> = log_probs.iter().map(|lp| (lp - max).exp()).collect();
    sample_categorical(&weights, rng)
}

/// Sample from a categorical distribution given unnormalized weights.
pub fn sample_categorical<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> anyhow::Result<usize> {
    let total: f64 = weights.iter().sum();

    if total <= 0.0 || !total.is_finite() || weights.iter().any(|&w| w < 0.0) {
        anyhow::bail!("invalid categorical weights (total = {})", total);
    }

    let u: f64 = rng.random::<f64>() * total;
    let mut cum = 0.0;
    for (i, &w) in weights.iter().enumerate() {
        cum += w;
        if cum >= u {
            return Ok(i);
        }
    }

    Ok(weights.len() - 1)
}

/// Draw a probability vector from `Dirichlet(alpha)` by normalizing
/// independent `Gamma(α_i, 1)` draws.
///
/// Fails when every gamma draw underflows to zero; the caller decides
/// whether to redraw.
pub fn sample_dirichlet<R: Rng + ?Sized>(alpha: &[f64], rng: &mut R) -> anyhow::Result<Vec<f64>> {
    anyhow::ensure!(!alpha.is_empty(), "empty Dirichlet parameter");

    let mut draws = Vec::with_capacity(alpha.len());
    for &a in alpha {
        anyhow::ensure!(a.is_finite() && a > 0.0, "Dirichlet parameter must be positive, got {}", a);
        let gamma = Gamma::new(a, 1.0).map_err(|e| anyhow::anyhow!("Gamma({}, 1): {:?}", a, e))?;
        draws.push(gamma.sample(rng));
    }

    let total: f64 = draws.iter().sum();
    anyhow::ensure!(
        total > 0.0 && total.is_finite(),
        "degenerate Dirichlet draw (sum = {})",
        total
    );

    for x in draws.iter_mut() {
        *x /= total;
    }
    Ok(draws)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn test_categorical_frequencies() {
        let mut rng = SmallRng::seed_from_u64(42);
        let weights = [1.0, 3.0, 0.0, 6.0];
        let n = 20_000;
        let mut counts = [0usize; 4];
        for _ in 0..n {
            counts[sample_categorical(&weights, &mut rng).unwrap()] += 1;
        }
        assert_eq!(counts[2], 0);
        let freq3 = counts[3] as f64 / n as f64;
        assert!((freq3 - 0.6).abs() < 0.02, "freq={}", freq3);
    }

    #[test]
    fn test_log_weights_match_linear_weights() {
        let log_probs = [-1000.0, -1000.0 + 3f64.ln()];
        let mut rng = SmallRng::seed_from_u64(7);
        let n = 10_000;
        let ones = (0..n)
            .filter(|_| sample_categorical_log(&log_probs, &mut rng).unwrap() == 1)
            .count();
        let freq = ones as f64 / n as f64;
        assert!((freq - 0.75).abs() < 0.02, "freq={}", freq);
    }

    #[test]
    fn test_degenerate_weights_are_errors() {
        let mut rng = SmallRng::seed_from_u64(1);
        assert!(sample_categorical(&[0.0, 0.0], &mut rng).is_err());
        assert!(sample_categorical(&[1.0, f64::NAN], &mut rng).is_err());
        assert!(sample_categorical_log(&[f64::NEG_INFINITY; 3], &mut rng).is_err());
        assert!(sample_categorical_log(&[], &mut rng).is_err());
    }

    #[test]
    fn test_dirichlet_is_a_distribution() {
        let mut rng = SmallRng::seed_from_u64(3);
        let alpha = [2.0, 5.0, 3.0];
        let n = 5_000;
        let mut mean = [0.0f64; 3];
        for _ in 0..n {
            let p = sample_dirichlet(&alpha, &mut rng).unwrap();
            assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
            for (m, x) in mean.iter_mut().zip(p.iter()) {
                *m += x / n as f64;
            }
        }
        assert!((mean[1] - 0.5).abs() < 0.02, "mean={:?}", mean);
        assert!(sample_dirichlet(&[1.0, 0.0], &mut rng).is_err());
    }
}
