//! Closed-form M-step: Dirichlet posterior of φ and Gaussian posterior
//! of η from the statistics of the sampled assignments.
//!
//! Statistics of retained sweeps accumulate into a pending
//! contribution (`stat_phi`, `stat_icov`, `stat_pmean`);
//! `normalize_phi_eta` divides them by the number of sweeps, merges
//! them into the global tables and finalizes the posterior.

use crate::corpus::Document;
use crate::error::MedLdaError;
use crate::online::{AliveBatch, OnlineMedLda};
use crate::sample::SampleZ;
use crate::sufficient_stats::BatchContribution;
use log::debug;

/// Add the statistics of one sweep over `docs` to `acc`.
///
/// ```text
/// stat_phi[k][t] += #{tokens of word t assigned to k}
/// stat_icov      += c² z̄ z̄ᵀ / λ
/// stat_pmean     += c y (cℓ + λ) / λ · z̄
/// ```
pub fn accumulate(
    acc: &mut BatchContribution,
    docs: &[Document],
    z: &[SampleZ],
    responses: &[f64],
    c: f64,
    ell: f64,
) -> anyhow::Result<()> {
    if docs.len() != z.len() || docs.len() != responses.len() {
        return Err(MedLdaError::data(format!(
            "{} documents, {} assignments, {} responses",
            docs.len(),
            z.len(),
            responses.len()
        )));
    }

    for (d, ((doc, zd), &y)) in docs.iter().zip(z).zip(responses).enumerate() {
        if doc.len() != zd.len() {
            return Err(MedLdaError::data(format!(
                "document {} has {} tokens but {} assignments",
                d,
                doc.len(),
                zd.len()
            )));
        }
        let lam = zd.lambda;
        if !(lam.is_finite() && lam > 0.0) {
            return Err(MedLdaError::numerical(format!(
                "document {}: augmentation scale {}",
                d, lam
            )));
        }

        for (&k, w) in zd.z.iter().zip(doc.tokens()) {
            acc.topic_word.add(k, w, 1.0)?;
        }

        let zbar = zd.zbar()?;
        acc.precision += &zbar * zbar.transpose() * (c * c / lam);
        acc.linear += zbar * (c * y * (c * ell + lam) / lam);
    }
    Ok(())
}

impl OnlineMedLda {
    /// Accumulate one sweep's statistics of a batch; `reset` clears
    /// whatever was pending first.
    pub fn infer_phi_eta(
        &mut self,
        docs: &[Document],
        z: &[SampleZ],
        responses: &[f64],
        reset: bool,
    ) -> anyhow::Result<()> {
        self.ensure_initialized()?;
        if reset {
            self.clear_pending();
        }
        let mut staged = self.pending.clone();
        accumulate(&mut staged, docs, z, responses, self.options.c, self.options.ell)?;
        self.pending = staged;
        self.pending_docs += docs.len();
        Ok(())
    }

    /// Queue the alive batch merged at `round` for subtraction by the
    /// next `normalize_phi_eta(_, true)`.
    pub fn queue_ejection(&mut self, round: usize) -> anyhow::Result<()> {
        self.ensure_initialized()?;
        let Some(pos) = self.alive.iter().position(|r| r.round == round) else {
            return Err(MedLdaError::protocol(format!("round {} is not alive", round)));
        };
        if let Some(rec) = self.alive.remove(pos) {
            debug!("round {} queued for ejection", rec.round);
            self.pending_removals.push(rec);
        }
        Ok(())
    }

    /// Rounds queued by [`OnlineMedLda::queue_ejection`] and not yet
    /// subtracted.
    pub fn queued_ejections(&self) -> Vec<usize> {
        self.pending_removals.iter().map(|r| r.round).collect()
    }

    /// Finalize the posterior.
    ///
    /// With `remove`, batches queued for ejection are subtracted first.
    /// Pending statistics are divided by `n` and merged as the current
    /// round's contribution, then the Gaussian posterior of η is
    /// recomputed from the global tables. Calling it again without new
    /// statistics leaves φ and η unchanged.
    ///
    /// On error nothing changes: the tables, the alive window, the
    /// pending statistics and the ejection queue are as before the call.
    pub fn normalize_phi_eta(&mut self, n: usize, remove: bool) -> anyhow::Result<()> {
        self.ensure_initialized()?;

        let mut snap = self.stats.snapshot();
        snap.record_cells(&self.stats, &self.pending.topic_word)?;
        if remove {
            for rec in &self.pending_removals {
                snap.record_cells(&self.stats, &rec.contribution.topic_word)?;
            }
        }
        let changes = !self.pending.is_empty() || (remove && !self.pending_removals.is_empty());
        match self.normalize_inner(n, remove) {
            Ok(()) => {
                if remove {
                    self.pending_removals.clear();
                }
                if changes {
                    self.last_round = None;
                }
                Ok(())
            }
            Err(e) => {
                self.stats.restore(&snap);
                Err(e)
            }
        }
    }

    /// Merge the pending statistics and refresh the posterior.
    ///
    /// The alive window is only touched once every fallible step has
    /// succeeded. Queued removals are left for the caller to clear.
    pub(crate) fn normalize_inner(&mut self, n: usize, remove: bool) -> anyhow::Result<()> {
        if remove {
            for rec in &self.pending_removals {
                self.stats.remove(&rec.contribution, rec.unit)?;
                debug!(
                    "removed round {} ({} cells)",
                    rec.round,
                    rec.contribution.topic_word.len()
                );
            }
        }

        let mut merged = None;
        if !self.pending.is_empty() {
            if n == 0 {
                return Err(MedLdaError::numerical(
                    "zero normalizer for pending statistics",
                ));
            }
            let mut contribution = self.pending.clone();
            contribution.scale(1.0 / n as f64);
            let num_docs = self.pending_docs / n;
            let round = self.round;
            let unit = self.stats.unit();

            let batch = match self.alive.back() {
                Some(rec) if rec.round == round && rec.unit == unit => {
                    let mut grown = rec.clone();
                    grown.contribution.absorb(&contribution)?;
                    grown.num_docs += num_docs;
                    grown
                }
                _ => AliveBatch {
                    round,
                    unit,
                    contribution: contribution.clone(),
                    num_docs,
                },
            };
            self.stats.merge(&contribution)?;
            merged = Some(batch);
        }

        self.stats.refresh_posterior()?;

        if let Some(batch) = merged {
            let extends_back = self
                .alive
                .back()
                .is_some_and(|r| r.round == batch.round && r.unit == batch.unit);
            if extends_back {
                self.alive.pop_back();
            }
            self.alive.push_back(batch);
            self.clear_pending();
        }
        Ok(())
    }

    pub(crate) fn clear_pending(&mut self) {
        self.pending = BatchContribution::new(self.options.num_topics, self.options.max_touched_cells);
        self.pending_docs = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;
    use crate::options::MedLdaOptions;
    use approx::assert_abs_diff_eq;
    use nalgebra::DVector;

    #[test]
    fn test_accumulate_counts_and_moments() {
        let docs = vec![Document::new(vec![(0, 3), (1, 1)])];
        let mut zd = SampleZ::from_assignments(vec![0, 0, 1, 1], 2);
        zd.lambda = 2.0;
        let mut acc = BatchContribution::new(2, None);
        accumulate(&mut acc, &docs, &[zd], &[1.0], 1.0, 1.0).unwrap();

        assert_eq!(acc.topic_word.get(0, 0), 2.0);
        assert_eq!(acc.topic_word.get(1, 0), 1.0);
        assert_eq!(acc.topic_word.get(1, 1), 1.0);
        assert_abs_diff_eq!(acc.total_count(), 4.0);

        // z̄ = (0.5, 0.5), c = 1, λ = 2: precision = z̄z̄ᵀ / 2
        assert_abs_diff_eq!(acc.precision[(0, 1)], 0.125);
        // linear = (1 + 2) / 2 · z̄
        assert_abs_diff_eq!(acc.linear, DVector::from_vec(vec![0.75, 0.75]));
    }

    #[test]
    fn test_accumulate_rejects_bad_lambda() {
        let docs = vec![Document::new(vec![(0, 1)])];
        let mut zd = SampleZ::from_assignments(vec![0], 1);
        zd.lambda = 0.0;
        let mut acc = BatchContribution::new(1, None);
        assert!(accumulate(&mut acc, &docs, &[zd], &[1.0], 1.0, 1.0).is_err());
    }

    #[test]
    fn test_zero_normalizer_keeps_pending() {
        let mut model = OnlineMedLda::new(MedLdaOptions {
            num_topics: 2,
            vocab_size: 4,
            ..Default::default()
        })
        .unwrap();
        model.init().unwrap();
        let docs = vec![Document::new(vec![(0, 2), (3, 1)])];
        let mut zd = SampleZ::from_assignments(vec![0, 1, 1], 2);
        zd.lambda = 1.0;
        model.infer_phi_eta(&docs, &[zd], &[1.0], true).unwrap();

        let err = model.normalize_phi_eta(0, false).unwrap_err();
        assert!(matches!(kind_of(&err), Some(MedLdaError::Numerical { .. })));
        assert!(model.alive_rounds().is_empty());
        assert_eq!(model.stats().gammasum_vector().sum(), 0.0);

        model.normalize_phi_eta(1, false).unwrap();
        assert_eq!(model.alive_rounds(), vec![0]);
        assert_abs_diff_eq!(model.stats().gammasum_vector().sum(), 3.0);
    }
}
