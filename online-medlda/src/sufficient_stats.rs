//! Sufficient statistics of the online MedLDA posterior.
//!
//! Tracks the decayed topic-word counts `gamma` (K×T) with row sums
//! `gammasum`, and the accumulated classifier precision / linear terms
//! from which the Gaussian posterior of η is finalized.
//!
//! Decay is lazy: every table is stored in *raw* units and multiplied by
//! a shared `scale` on read, so forgetting a round costs O(1) and a
//! batch merged at scale `s_r` can be removed later by subtracting its
//! contribution times `1 / s_r`, whatever decay happened in between.

use crate::error::MedLdaError;
use crate::touched::TouchedCells;
use nalgebra::{DMatrix, DVector};
use sampler_util::mv_gaussian::{is_symmetric_psd, spd_inverse, symmetrize};

/// Counts below `-NEG_TOLERANCE` after a removal are a numerical failure;
/// smaller negatives are round-off and are reset to zero.
pub const NEG_TOLERANCE: f64 = 1e-6;

/// Once the shared scale falls below this, it is folded into the tables.
pub const FOLD_THRESHOLD: f64 = 1e-100;

/// Statistics of one mini-batch, ready to be merged or removed.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchContribution {
    /// Topic-word counts of the batch (`stat_phi`)
    pub topic_word: TouchedCells,
    /// `Σ_d c² z̄_d z̄_dᵀ / λ_d` (`stat_icov`)
    pub precision: DMatrix<f64>,
    /// `Σ_d c y_d (cℓ + λ_d) / λ_d · z̄_d` (`stat_pmean`)
    pub linear: DVector<f64>,
}

impl BatchContribution {
    /// Empty contribution for K topics.
    pub fn new(num_topics: usize, capacity: Option<usize>) -> Self {
        BatchContribution {
            topic_word: TouchedCells::new(capacity),
            precision: DMatrix::zeros(num_topics, num_topics),
            linear: DVector::zeros(num_topics),
        }
    }

    /// True if nothing was accumulated.
    pub fn is_empty(&self) -> bool {
        self.topic_word.is_empty()
    }

    /// Total topic-word mass, i.e. the number of tokens behind it.
    pub fn total_count(&self) -> f64 {
        self.topic_word.iter().map(|(_, v)| v).sum()
    }

    /// Multiply every statistic by `s`.
    pub fn scale(&mut self, s: f64) {
        self.topic_word.scale(s);
        self.precision *= s;
        self.linear *= s;
    }

    /// Add another contribution cell by cell.
    pub fn absorb(&mut self, other: &BatchContribution) -> anyhow::Result<()> {
        for ((k, t), v) in other.topic_word.iter() {
            self.topic_word.add(k, t, v)?;
        }
        self.precision += &other.precision;
        self.linear += &other.linear;
        Ok(())
    }
}

/// Values needed to undo merges and removals exactly (`prev_*`).
///
/// Cells are recorded the first time they are about to change, so a
/// snapshot spanning several mutations restores the state from before
/// the first of them.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    prev_gamma: TouchedCells,
    prev_gammasum: DVector<f64>,
    prev_icov_raw: DMatrix<f64>,
    prev_pmean_raw: DVector<f64>,
    prev_scale: f64,
    prev_eta_icov: DMatrix<f64>,
    prev_eta_cov: DMatrix<f64>,
    prev_eta_mean: DVector<f64>,
    prev_eta_pmean: DVector<f64>,
}

impl StatsSnapshot {
    /// Record the current values of `cells` that are not yet recorded.
    pub fn record_cells(&mut self, stats: &GlobalStats, cells: &TouchedCells) -> anyhow::Result<()> {
        for ((k, t), _) in cells.iter() {
            self.prev_gamma.insert_if_absent(k, t, stats.gamma_raw[(k, t)])?;
        }
        Ok(())
    }
}

/// Global statistics and the finalized posterior of η.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    k: usize,
    t: usize,
    beta0: f64,
    eta_prior_var: f64,
    gamma_raw: DMatrix<f64>,
    gammasum_raw: DVector<f64>,
    icov_raw: DMatrix<f64>,
    pmean_raw: DVector<f64>,
    scale: f64,
    eta_icov: DMatrix<f64>,
    eta_cov: DMatrix<f64>,
    eta_mean: DVector<f64>,
    eta_pmean: DVector<f64>,
}

impl GlobalStats {
    /// Empty statistics: φ at its uniform prior mean, η at `N(0, v² I)`.
    pub fn new(num_topics: usize, vocab_size: usize, beta0: f64, eta_prior_var: f64) -> Self {
        let k = num_topics;
        GlobalStats {
            k,
            t: vocab_size,
            beta0,
            eta_prior_var,
            gamma_raw: DMatrix::zeros(k, vocab_size),
            gammasum_raw: DVector::zeros(k),
            icov_raw: DMatrix::zeros(k, k),
            pmean_raw: DVector::zeros(k),
            scale: 1.0,
            eta_icov: DMatrix::identity(k, k) / eta_prior_var,
            eta_cov: DMatrix::identity(k, k) * eta_prior_var,
            eta_mean: DVector::zeros(k),
            eta_pmean: DVector::zeros(k),
        }
    }

    /// Number of topics K.
    pub fn num_topics(&self) -> usize {
        self.k
    }

    /// Vocabulary size T.
    pub fn vocab_size(&self) -> usize {
        self.t
    }

    /// Topic-word smoothing β0.
    pub fn beta0(&self) -> f64 {
        self.beta0
    }

    /// Decayed count of topic `k` on word `t`.
    #[inline]
    pub fn gamma(&self, k: usize, t: usize) -> f64 {
        self.gamma_raw[(k, t)] * self.scale
    }

    /// Row sum of `gamma` for topic `k`.
    #[inline]
    pub fn gammasum(&self, k: usize) -> f64 {
        self.gammasum_raw[k] * self.scale
    }

    /// The decayed K×T count table.
    pub fn gamma_matrix(&self) -> DMatrix<f64> {
        &self.gamma_raw * self.scale
    }

    /// All row sums.
    pub fn gammasum_vector(&self) -> DVector<f64> {
        &self.gammasum_raw * self.scale
    }

    /// Posterior mean `E[φ_kt] = (γ_kt + β0) / (γ_k + T β0)`.
    #[inline]
    pub fn phi(&self, k: usize, t: usize) -> f64 {
        (self.gamma(k, t) + self.beta0) / (self.gammasum(k) + self.t as f64 * self.beta0)
    }

    /// Posterior mean of φ as a K×T matrix.
    pub fn phi_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.k, self.t, |k, t| self.phi(k, t))
    }

    /// Posterior mean μ of η.
    pub fn eta_mean(&self) -> &DVector<f64> {
        &self.eta_mean
    }

    /// Posterior covariance Σ of η.
    pub fn eta_cov(&self) -> &DMatrix<f64> {
        &self.eta_cov
    }

    /// Posterior precision Σ⁻¹ of η.
    pub fn eta_icov(&self) -> &DMatrix<f64> {
        &self.eta_icov
    }

    /// Precision-weighted mean Σ⁻¹μ (the un-transformed mean).
    pub fn eta_pmean(&self) -> &DVector<f64> {
        &self.eta_pmean
    }

    /// Second moment `E[ηηᵀ] = Σ + μμᵀ`.
    pub fn eta_second_moment(&self) -> DMatrix<f64> {
        &self.eta_cov + &self.eta_mean * self.eta_mean.transpose()
    }

    /// Current shared decay scale.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Raw units per count at the current scale.
    pub fn unit(&self) -> f64 {
        1.0 / self.scale
    }

    /// Discount every statistic by `rho`.
    pub fn decay(&mut self, rho: f64) {
        self.scale *= rho;
    }

    /// Whether the scale is small enough to fold.
    pub fn needs_fold(&self) -> bool {
        self.scale < FOLD_THRESHOLD
    }

    /// Multiply the scale into the raw tables and reset it to one.
    ///
    /// Returns the factor by which raw-unit quantities held elsewhere
    /// must be multiplied to stay consistent.
    pub fn fold(&mut self) -> f64 {
        let f = self.scale;
        self.gamma_raw *= f;
        self.gammasum_raw *= f;
        self.icov_raw *= f;
        self.pmean_raw *= f;
        self.scale = 1.0;
        f
    }

    /// Begin a snapshot of everything except the topic-word cells, which
    /// are added with [`StatsSnapshot::record_cells`].
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            prev_gamma: TouchedCells::new(None),
            prev_gammasum: self.gammasum_raw.clone(),
            prev_icov_raw: self.icov_raw.clone(),
            prev_pmean_raw: self.pmean_raw.clone(),
            prev_scale: self.scale,
            prev_eta_icov: self.eta_icov.clone(),
            prev_eta_cov: self.eta_cov.clone(),
            prev_eta_mean: self.eta_mean.clone(),
            prev_eta_pmean: self.eta_pmean.clone(),
        }
    }

    /// Put back every value recorded in `snap`.
    pub fn restore(&mut self, snap: &StatsSnapshot) {
        for ((k, t), v) in snap.prev_gamma.iter() {
            self.gamma_raw[(k, t)] = v;
        }
        self.gammasum_raw.copy_from(&snap.prev_gammasum);
        self.icov_raw.copy_from(&snap.prev_icov_raw);
        self.pmean_raw.copy_from(&snap.prev_pmean_raw);
        self.scale = snap.prev_scale;
        self.eta_icov.copy_from(&snap.prev_eta_icov);
        self.eta_cov.copy_from(&snap.prev_eta_cov);
        self.eta_mean.copy_from(&snap.prev_eta_mean);
        self.eta_pmean.copy_from(&snap.prev_eta_pmean);
    }

    fn check_shape(&self, c: &BatchContribution) -> anyhow::Result<()> {
        if c.precision.nrows() != self.k || c.linear.len() != self.k {
            return Err(MedLdaError::data(format!(
                "contribution has {} topics, model has {}",
                c.linear.len(),
                self.k
            )));
        }
        if let Some(((k, t), _)) = c.topic_word.iter().find(|&((k, t), _)| k >= self.k || t >= self.t) {
            return Err(MedLdaError::data(format!("cell ({}, {}) outside {}x{}", k, t, self.k, self.t)));
        }
        Ok(())
    }

    /// Add `c` at full weight now. Returns the raw unit used, which is
    /// what a later [`GlobalStats::remove`] of the same batch needs.
    ///
    /// The posterior of η is not refreshed here.
    pub fn merge(&mut self, c: &BatchContribution) -> anyhow::Result<f64> {
        self.check_shape(c)?;
        let unit = self.unit();
        for ((k, t), v) in c.topic_word.iter() {
            self.gamma_raw[(k, t)] += v * unit;
            self.gammasum_raw[k] += v * unit;
        }
        self.icov_raw += &c.precision * unit;
        self.pmean_raw += &c.linear * unit;
        Ok(unit)
    }

    /// Subtract `c`, merged earlier with raw unit `unit`.
    ///
    /// Fails without mutating anything if a count would go negative
    /// beyond [`NEG_TOLERANCE`].
    pub fn remove(&mut self, c: &BatchContribution, unit: f64) -> anyhow::Result<()> {
        self.check_shape(c)?;

        let mut staged = Vec::with_capacity(c.topic_word.len());
        for ((k, t), v) in c.topic_word.iter() {
            let next = self.gamma_raw[(k, t)] - v * unit;
            if next * self.scale < -NEG_TOLERANCE {
                return Err(MedLdaError::numerical(format!(
                    "gamma[{}][{}] would become {} after removal",
                    k,
                    t,
                    next * self.scale
                )));
            }
            staged.push((k, t, next.max(0.0)));
        }

        for (k, t, next) in staged {
            let delta = next - self.gamma_raw[(k, t)];
            self.gamma_raw[(k, t)] = next;
            self.gammasum_raw[k] += delta;
        }
        for k in 0..self.k {
            if self.gammasum_raw[k] < 0.0 {
                self.gammasum_raw[k] = 0.0;
            }
        }
        self.icov_raw -= &c.precision * unit;
        self.pmean_raw -= &c.linear * unit;
        Ok(())
    }

    /// Finalize the posterior of η from the accumulated statistics:
    ///
    /// ```text
    /// Σ⁻¹ = I / v² + scale · icov_raw
    /// μ   = Σ · scale · pmean_raw
    /// ```
    pub fn refresh_posterior(&mut self) -> anyhow::Result<()> {
        let mut icov = DMatrix::<f64>::identity(self.k, self.k) / self.eta_prior_var
            + &self.icov_raw * self.scale;
        symmetrize(&mut icov);

        let cov = spd_inverse(&icov).map_err(|e| {
            MedLdaError::numerical(format!("classifier precision: {}", e))
        })?;
        let pmean = &self.pmean_raw * self.scale;
        let mean = &cov * &pmean;

        if mean.iter().any(|x| !x.is_finite()) {
            return Err(MedLdaError::numerical("classifier mean is not finite"));
        }

        self.eta_icov = icov;
        self.eta_cov = cov;
        self.eta_pmean = pmean;
        self.eta_mean = mean;
        Ok(())
    }

    /// Verify non-negative counts, consistent row sums, and a symmetric
    /// PSD covariance that inverts the precision.
    pub fn check_invariants(&self, tol: f64) -> anyhow::Result<()> {
        for k in 0..self.k {
            let mut row = 0.0;
            for t in 0..self.t {
                let g = self.gamma(k, t);
                if g < 0.0 || !g.is_finite() {
                    return Err(MedLdaError::numerical(format!("gamma[{}][{}] = {}", k, t, g)));
                }
                row += g;
            }
            let sum = self.gammasum(k);
            if (row - sum).abs() > tol * (1.0 + row.abs()) {
                return Err(MedLdaError::numerical(format!(
                    "gammasum[{}] = {} but row sums to {}",
                    k, sum, row
                )));
            }
        }
        if !is_symmetric_psd(&self.eta_cov, tol) {
            return Err(MedLdaError::numerical("classifier covariance is not symmetric PSD"));
        }
        let eye = DMatrix::<f64>::identity(self.k, self.k);
        let err = (&self.eta_icov * &self.eta_cov - eye).abs().max();
        if err > tol.sqrt() {
            return Err(MedLdaError::numerical(format!(
                "precision x covariance deviates from identity by {}",
                err
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn contribution(cells: &[(usize, usize, f64)], k: usize) -> BatchContribution {
        let mut c = BatchContribution::new(k, None);
        for &(kk, t, v) in cells {
            c.topic_word.add(kk, t, v).unwrap();
        }
        let zbar = DVector::from_fn(k, |i, _| (i + 1) as f64 / (k * (k + 1) / 2) as f64);
        c.precision = &zbar * zbar.transpose() * 2.0;
        c.linear = zbar * 0.5;
        c
    }

    #[test]
    fn test_empty_posterior_is_prior() {
        let stats = GlobalStats::new(2, 4, 0.5, 2.0);
        assert_abs_diff_eq!(stats.phi(1, 3), 0.25);
        assert_abs_diff_eq!(stats.eta_cov()[(0, 0)], 2.0);
        stats.check_invariants(1e-10).unwrap();
    }

    #[test]
    fn test_merge_then_remove_is_identity() {
        let mut stats = GlobalStats::new(2, 4, 0.1, 1.0);
        let first = contribution(&[(0, 0, 3.0), (1, 2, 1.0)], 2);
        stats.merge(&first).unwrap();
        stats.refresh_posterior().unwrap();

        let before_gamma = stats.gamma_matrix();
        let before_mean = stats.eta_mean().clone();
        let before_cov = stats.eta_cov().clone();

        let second = contribution(&[(0, 0, 1.0), (0, 3, 2.0)], 2);
        let unit = stats.merge(&second).unwrap();
        stats.refresh_posterior().unwrap();
        stats.remove(&second, unit).unwrap();
        stats.refresh_posterior().unwrap();

        assert_abs_diff_eq!(stats.gamma_matrix(), before_gamma, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.eta_mean().clone(), before_mean, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.eta_cov().clone(), before_cov, epsilon = 1e-12);
        stats.check_invariants(1e-9).unwrap();
    }

    #[test]
    fn test_remove_after_decay_uses_merge_unit() {
        let mut stats = GlobalStats::new(2, 3, 0.1, 1.0);
        let old = contribution(&[(0, 1, 4.0)], 2);
        let unit_old = stats.merge(&old).unwrap();
        stats.decay(0.5);
        let new = contribution(&[(0, 1, 2.0), (1, 0, 1.0)], 2);
        stats.merge(&new).unwrap();
        stats.decay(0.5);

        // old now weighs 0.25, new weighs 0.5
        assert_abs_diff_eq!(stats.gamma(0, 1), 4.0 * 0.25 + 2.0 * 0.5, epsilon = 1e-12);

        stats.remove(&old, unit_old).unwrap();
        assert_abs_diff_eq!(stats.gamma(0, 1), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.gammasum(0), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.gammasum(1), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_over_removal_fails_without_mutation() {
        let mut stats = GlobalStats::new(1, 2, 0.1, 1.0);
        let c = contribution(&[(0, 0, 1.0)], 1);
        stats.merge(&c).unwrap();
        let mut bigger = c.clone();
        bigger.topic_word.add(0, 0, 5.0).unwrap();
        let before = stats.gamma_matrix();
        let err = stats.remove(&bigger, stats.unit()).unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(MedLdaError::Numerical { .. })
        ));
        assert_eq!(stats.gamma_matrix(), before);
    }

    #[test]
    fn test_snapshot_restores_exactly() {
        let mut stats = GlobalStats::new(2, 4, 0.1, 1.0);
        stats.merge(&contribution(&[(0, 0, 1.0)], 2)).unwrap();
        stats.refresh_posterior().unwrap();

        let gamma = stats.gamma_matrix();
        let mean = stats.eta_mean().clone();

        let c = contribution(&[(0, 0, 2.0), (1, 3, 1.0)], 2);
        let mut snap = stats.snapshot();
        snap.record_cells(&stats, &c.topic_word).unwrap();
        stats.decay(0.3);
        stats.merge(&c).unwrap();
        stats.refresh_posterior().unwrap();

        stats.restore(&snap);
        assert_eq!(stats.gamma_matrix(), gamma);
        assert_eq!(stats.eta_mean(), &mean);
        assert_eq!(stats.scale(), 1.0);
    }

    #[test]
    fn test_fold_preserves_values() {
        let mut stats = GlobalStats::new(1, 2, 0.1, 1.0);
        stats.merge(&contribution(&[(0, 1, 8.0)], 1)).unwrap();
        stats.decay(0.25);
        let before = stats.gamma(0, 1);
        let f = stats.fold();
        assert_abs_diff_eq!(f, 0.25);
        assert_abs_diff_eq!(stats.gamma(0, 1), before, epsilon = 1e-12);
        assert_eq!(stats.scale(), 1.0);
    }

    #[test]
    fn test_posterior_consistency_after_merge() {
        let mut stats = GlobalStats::new(3, 2, 0.1, 0.5);
        stats.merge(&contribution(&[(2, 1, 1.0)], 3)).unwrap();
        stats.refresh_posterior().unwrap();
        let eye = DMatrix::<f64>::identity(3, 3);
        assert_abs_diff_eq!(stats.eta_icov() * stats.eta_cov(), eye, epsilon = 1e-10);
        stats.check_invariants(1e-10).unwrap();
    }
}
