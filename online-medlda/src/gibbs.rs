//! Gibbs E-step: topic assignments Z and augmentation scales λ.
//!
//! With the hinge loss written as a scale mixture (Polson & Scott),
//!
//! ```text
//! exp(-2c max(0, ζ)) = ∫ (2πλ)^(-1/2) exp(-(λ + cζ)² / (2λ)) dλ,   ζ_d = ℓ - y_d ηᵀz̄_d
//! ```
//!
//! and η integrated under its Gaussian posterior N(μ, Σ), the token
//! conditional is (with `M = Σ + μμᵀ` and `C` the document's topic
//! counts without the token)
//!
//! ```text
//! p(z = k) ∝ (C_k + α0) (γ_kt + β0) / (γ_k + Tβ0)
//!            exp( c y (cℓ + λ)/λ · μ_k/N - c²/(2λ) · (M_kk + 2 (M C)_k) / N² )
//! ```
//!
//! and the augmentation is drawn through its reciprocal,
//! `1/λ ~ IG(1 / (c sqrt(E[ζ²])), 1)` with `E[ζ²] = (ℓ - y μᵀz̄)² + z̄ᵀΣz̄`.

use crate::corpus::Document;
use crate::error::MedLdaError;
use crate::online::OnlineMedLda;
use crate::options::MedLdaOptions;
use crate::sample::{Sample, SampleZ};
use crate::sufficient_stats::GlobalStats;
use crate::touched::TouchedCells;
use nalgebra::DVector;
use rand::Rng;
use sampler_util::mv_gaussian::quad_form;
use sampler_util::{sample_categorical, sample_categorical_log, InverseGaussianSampler};

/// E-step state of the batch being trained.
///
/// `local` holds the batch's own topic-word counts; the global `gamma`
/// stays frozen for the whole E-step and the token conditional reads
/// `gamma + local`.
#[derive(Debug, Clone)]
pub struct BatchState {
    /// One assignment per document
    pub z: Vec<SampleZ>,
    /// Topic-word counts of this batch
    pub local: TouchedCells,
    /// Row sums of `local`
    pub local_sum: Vec<f64>,
}

impl BatchState {
    /// Random initial assignments for `docs`.
    pub fn init<R: Rng + ?Sized>(
        docs: &[Document],
        num_topics: usize,
        capacity: Option<usize>,
        rng: &mut R,
    ) -> anyhow::Result<Self> {
        let mut local = TouchedCells::new(capacity);
        let mut local_sum = vec![0.0; num_topics];
        let mut z = Vec::with_capacity(docs.len());

        for doc in docs {
            let zd = SampleZ::random(doc.len(), num_topics, rng);
            for (&k, w) in zd.z.iter().zip(doc.tokens()) {
                local.add(k, w, 1.0)?;
                local_sum[k] += 1.0;
            }
            z.push(zd);
        }

        Ok(BatchState { z, local, local_sum })
    }
}

/// Collapsed Gibbs sampler for one batch.
#[derive(Debug, Clone, Default)]
pub struct GibbsSampler {
    /// Scratch space for per-topic log-weights
    log_probs: Vec<f64>,
    invgauss: InverseGaussianSampler,
}

impl GibbsSampler {
    /// A sampler with default redraw settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// One sweep over every token of the batch.
    ///
    /// Returns the number of tokens that changed topic.
    pub fn sweep_z<R: Rng + ?Sized>(
        &mut self,
        stats: &GlobalStats,
        options: &MedLdaOptions,
        state: &mut BatchState,
        docs: &[Document],
        responses: &[f64],
        rng: &mut R,
    ) -> anyhow::Result<usize> {
        let kk = stats.num_topics();
        let tbeta = stats.vocab_size() as f64 * options.beta0;
        let (c, ell, alpha0, beta0) = (options.c, options.ell, options.alpha0, options.beta0);

        let second = stats.eta_second_moment();
        let mu = stats.eta_mean();
        self.log_probs.resize(kk, 0.0);

        let BatchState { z, local, local_sum } = state;
        let mut moves = 0;

        for (d, doc) in docs.iter().enumerate() {
            let zd = &mut z[d];
            let nd = zd.len() as f64;
            let lam = zd.lambda;
            let lin = c * responses[d] * (c * ell + lam) / lam / nd;
            let quad = c * c / (2.0 * lam * nd * nd);

            let mut mc: DVector<f64> = &second * zd.counts_vector();

            for (n, w) in doc.tokens().enumerate() {
                let old = zd.z[n];
                zd.counts[old] -= 1;
                local.add(old, w, -1.0)?;
                local_sum[old] -= 1.0;
                mc -= second.column(old);

                for k in 0..kk {
                    let num = stats.gamma(k, w) + local.get(k, w) + beta0;
                    let den = stats.gammasum(k) + local_sum[k] + tbeta;
                    self.log_probs[k] = (zd.counts[k] as f64 + alpha0).ln() + (num / den).ln()
                        + lin * mu[k]
                        - quad * (second[(k, k)] + 2.0 * mc[k]);
                }

                let new = sample_categorical_log(&self.log_probs, rng).map_err(|e| {
                    MedLdaError::numerical(format!("topic of token {} in document {}: {}", n, d, e))
                })?;

                zd.z[n] = new;
                zd.counts[new] += 1;
                local.add(new, w, 1.0)?;
                local_sum[new] += 1.0;
                mc += second.column(new);

                if new != old {
                    moves += 1;
                }
            }
        }

        Ok(moves)
    }

    /// Redraw λ_d for every document of the batch.
    pub fn sweep_lambda<R: Rng + ?Sized>(
        &self,
        stats: &GlobalStats,
        options: &MedLdaOptions,
        z: &mut [SampleZ],
        responses: &[f64],
        rng: &mut R,
    ) -> anyhow::Result<()> {
        for (d, zd) in z.iter_mut().enumerate() {
            let zbar = zd.zbar()?;
            let margin = options.ell - responses[d] * stats.eta_mean().dot(&zbar);
            let e_zeta2 = margin * margin + quad_form(&zbar, stats.eta_cov());

            if !(e_zeta2.is_finite() && e_zeta2 > 0.0) {
                return Err(MedLdaError::numerical(format!(
                    "document {}: expected squared margin {} is not positive",
                    d, e_zeta2
                )));
            }

            let mean = 1.0 / (options.c * e_zeta2.sqrt());
            let inv_lambda = self
                .invgauss
                .sample(mean, 1.0, rng)
                .map_err(|e| MedLdaError::numerical(format!("document {}: {}", d, e)))?;

            let lambda = 1.0 / inv_lambda;
            if !(lambda.is_finite() && lambda > 0.0) {
                return Err(MedLdaError::numerical(format!(
                    "document {}: augmentation scale {} out of range",
                    d, lambda
                )));
            }
            zd.lambda = lambda;
        }
        Ok(())
    }
}

/// One test-time sweep over a held-out document with φ fixed:
/// `p(z = k) ∝ (C_k + α0) φ_kt`.
pub fn draw_z_test<R: Rng + ?Sized>(
    sample: &Sample,
    z: &mut SampleZ,
    doc: &Document,
    alpha0: f64,
    weights: &mut Vec<f64>,
    rng: &mut R,
) -> anyhow::Result<()> {
    let kk = sample.num_topics();
    weights.resize(kk, 0.0);

    for (n, w) in doc.tokens().enumerate() {
        let old = z.z[n];
        z.counts[old] -= 1;
        for k in 0..kk {
            weights[k] = (z.counts[k] as f64 + alpha0) * sample.phi[(k, w)];
        }
        let new = sample_categorical(weights, rng)
            .map_err(|e| MedLdaError::numerical(format!("held-out token {}: {}", n, e)))?;
        z.z[n] = new;
        z.counts[new] += 1;
    }
    Ok(())
}

/// `⟨η, counts⟩ / norm`
pub fn discriminant(eta: &DVector<f64>, z: &SampleZ, norm: f64) -> anyhow::Result<f64> {
    if !(norm.is_finite() && norm > 0.0) {
        return Err(MedLdaError::numerical(format!("discriminant normalizer {}", norm)));
    }
    if eta.len() != z.num_topics() {
        return Err(MedLdaError::data(format!(
            "{} classifier weights for {} topics",
            eta.len(),
            z.num_topics()
        )));
    }
    Ok(eta.dot(&z.counts_vector()) / norm)
}

/// Label predicted from a discriminant value.
pub fn predict_label(score: f64) -> i32 {
    if score >= 0.0 {
        1
    } else {
        -1
    }
}

fn check_alignment(docs: &[Document], z: &[SampleZ]) -> anyhow::Result<()> {
    if docs.len() != z.len() {
        return Err(MedLdaError::data(format!(
            "{} documents but {} assignments",
            docs.len(),
            z.len()
        )));
    }
    for (d, (doc, zd)) in docs.iter().zip(z).enumerate() {
        if doc.len() != zd.len() {
            return Err(MedLdaError::data(format!(
                "document {} has {} tokens but {} assignments",
                d,
                doc.len(),
                zd.len()
            )));
        }
    }
    Ok(())
}

impl OnlineMedLda {
    /// Resample the topic of every token in the batch.
    pub fn update_z(
        &mut self,
        state: &mut BatchState,
        docs: &[Document],
        responses: &[f64],
    ) -> anyhow::Result<usize> {
        self.ensure_initialized()?;
        check_alignment(docs, &state.z)?;
        self.gibbs
            .sweep_z(&self.stats, &self.options, state, docs, responses, &mut self.prng)
    }

    /// Resample the augmentation scale of every document in the batch.
    pub fn update_lambda(
        &mut self,
        state: &mut BatchState,
        docs: &[Document],
        responses: &[f64],
    ) -> anyhow::Result<()> {
        self.ensure_initialized()?;
        check_alignment(docs, &state.z)?;
        self.gibbs
            .sweep_lambda(&self.stats, &self.options, &mut state.z, responses, &mut self.prng)
    }

    /// Normalized topic frequencies z̄_d of every document.
    pub fn compute_zbar(&self, docs: &[Document], z: &[SampleZ]) -> anyhow::Result<Vec<DVector<f64>>> {
        check_alignment(docs, z)?;
        z.iter().map(|zd| zd.zbar()).collect()
    }

    /// `⟨η, z̄⟩` for one document under the parameters of `sample`, with
    /// the topic counts divided by `norm` (normally the document length).
    pub fn compute_discri_func(
        &self,
        doc: &Document,
        sample: &Sample,
        z: &SampleZ,
        norm: f64,
    ) -> anyhow::Result<f64> {
        check_alignment(std::slice::from_ref(doc), std::slice::from_ref(z))?;
        discriminant(&sample.eta, z, norm)
    }

    /// Hinge objective `c Σ_d max(0, ℓ - y_d μᵀz̄_d)` of a batch under
    /// the current posterior mean. Observational only.
    pub fn compute_cost_function(
        &self,
        z: &[SampleZ],
        docs: &[Document],
        responses: &[f64],
    ) -> anyhow::Result<f64> {
        check_alignment(docs, z)?;
        let mu = self.stats.eta_mean();
        let mut cost = 0.0;
        for (zd, &y) in z.iter().zip(responses) {
            let f = discriminant(mu, zd, zd.len() as f64)?;
            cost += (self.options.ell - y * f).max(0.0);
        }
        Ok(self.options.c * cost)
    }
}
