//! Latent samples: per-document topic assignments (`SampleZ`) and
//! posterior draws of the global parameters (`Sample`).

use crate::error::MedLdaError;
use crate::sufficient_stats::GlobalStats;
use log::warn;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use sampler_util::{sample_dirichlet, MvGaussian};

/// Topic assignment of every token instance of one document, its
/// topic counts, and the document's augmentation scale λ.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleZ {
    /// Topic of token instance `n`
    pub z: Vec<usize>,
    /// Number of tokens assigned to each topic
    pub counts: Vec<u32>,
    /// Augmentation scale λ_d (> 0)
    pub lambda: f64,
}

impl SampleZ {
    /// Build from explicit assignments; λ starts at 1.
    pub fn from_assignments(z: Vec<usize>, num_topics: usize) -> Self {
        let mut counts = vec![0u32; num_topics];
        for &k in &z {
            counts[k] += 1;
        }
        SampleZ {
            z,
            counts,
            lambda: 1.0,
        }
    }

    /// Uniformly random assignments for a document of `len` tokens.
    pub fn random<R: Rng + ?Sized>(len: usize, num_topics: usize, rng: &mut R) -> Self {
        let z = (0..len).map(|_| rng.random_range(0..num_topics)).collect();
        Self::from_assignments(z, num_topics)
    }

    /// Number of token instances.
    pub fn len(&self) -> usize {
        self.z.len()
    }

    /// True for a document without tokens.
    pub fn is_empty(&self) -> bool {
        self.z.is_empty()
    }

    /// Number of topics.
    pub fn num_topics(&self) -> usize {
        self.counts.len()
    }

    /// Topic counts as a float vector.
    pub fn counts_vector(&self) -> DVector<f64> {
        DVector::from_iterator(self.counts.len(), self.counts.iter().map(|&c| c as f64))
    }

    /// Normalized topic frequencies `z̄ = counts / len`.
    pub fn zbar(&self) -> anyhow::Result<DVector<f64>> {
        if self.is_empty() {
            return Err(MedLdaError::numerical("z̄ of a document without tokens"));
        }
        Ok(self.counts_vector() / self.len() as f64)
    }
}

/// One draw of the global parameters: topic-word distributions φ (K×T,
/// rows sum to one) and classifier weights η (K).
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Topic-word distributions, one row per topic
    pub phi: DMatrix<f64>,
    /// Classifier weights
    pub eta: DVector<f64>,
}

impl Sample {
    /// The posterior mean of φ and η.
    pub fn posterior_mean(stats: &GlobalStats) -> Self {
        Sample {
            phi: stats.phi_matrix(),
            eta: stats.eta_mean().clone(),
        }
    }

    /// Draw `φ_k ~ Dir(γ_k + β0)` and `η ~ N(μ, Σ)`.
    ///
    /// A degenerate Dirichlet row (every gamma variate underflowed) is
    /// redrawn up to `max_redraws` times.
    pub fn draw<R: Rng + ?Sized>(
        stats: &GlobalStats,
        max_redraws: usize,
        rng: &mut R,
    ) -> anyhow::Result<Self> {
        let (k, t) = (stats.num_topics(), stats.vocab_size());
        let mut phi = DMatrix::<f64>::zeros(k, t);
        let mut alpha = vec![0.0; t];

        for kk in 0..k {
            for (tt, a) in alpha.iter_mut().enumerate() {
                *a = stats.gamma(kk, tt) + stats.beta0();
            }
            let mut attempt = 0;
            let row = loop {
                match sample_dirichlet(&alpha, rng) {
                    Ok(row) => break row,
                    Err(e) if attempt < max_redraws => {
                        warn!("redrawing topic {}: {}", kk, e);
                        attempt += 1;
                    }
                    Err(e) => return Err(MedLdaError::numerical(format!("topic {}: {}", kk, e))),
                }
            };
            for (tt, p) in row.into_iter().enumerate() {
                phi[(kk, tt)] = p;
            }
        }

        let eta = MvGaussian::from_covariance(stats.eta_mean().clone(), stats.eta_cov())
            .and_then(|g| g.sample(rng))
            .map_err(|e| MedLdaError::numerical(format!("classifier draw: {}", e)))?;

        Ok(Sample { phi, eta })
    }

    /// Number of topics.
    pub fn num_topics(&self) -> usize {
        self.eta.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn test_counts_follow_assignments() {
        let z = SampleZ::from_assignments(vec![0, 0, 1, 2], 3);
        assert_eq!(z.counts, vec![2, 1, 1]);
        let zbar = z.zbar().unwrap();
        assert!((zbar.sum() - 1.0).abs() < 1e-12);
        assert!((zbar[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_random_assignments_in_range() {
        let mut rng = SmallRng::seed_from_u64(9);
        let z = SampleZ::random(50, 4, &mut rng);
        assert_eq!(z.len(), 50);
        assert!(z.z.iter().all(|&k| k < 4));
        assert_eq!(z.counts.iter().sum::<u32>(), 50);
    }

    #[test]
    fn test_empty_zbar_is_an_error() {
        let z = SampleZ::from_assignments(vec![], 2);
        assert!(z.zbar().is_err());
    }

    #[test]
    fn test_posterior_draw_shapes() {
        let stats = GlobalStats::new(3, 5, 0.1, 1.0);
        let mut rng = SmallRng::seed_from_u64(2);
        let s = Sample::draw(&stats, 3, &mut rng).unwrap();
        assert_eq!(s.phi.nrows(), 3);
        assert_eq!(s.phi.ncols(), 5);
        for k in 0..3 {
            assert!((s.phi.row(k).sum() - 1.0).abs() < 1e-10);
        }
        assert_eq!(s.eta.len(), 3);

        let m = Sample::posterior_mean(&stats);
        assert!((m.phi[(0, 0)] - 0.2).abs() < 1e-12);
        assert_eq!(m.eta, DVector::zeros(3));
    }
}
