//! Online controller: rounds, the alive window, ejection, commit points
//! and held-out inference.

use crate::commit::CommitPoint;
use crate::corpus::{validate_batch, CorpusProvider, Document};
use crate::error::MedLdaError;
use crate::forget::ForgetLedger;
use crate::gibbs::{draw_z_test, predict_label, BatchState, GibbsSampler};
use crate::options::MedLdaOptions;
use crate::sample::{Sample, SampleZ};
use crate::sufficient_stats::{BatchContribution, GlobalStats, StatsSnapshot};
use log::{debug, info};
use nalgebra::DVector;
use rand::rngs::SmallRng;
use rayon::prelude::*;
use sampler_util::Prng;
use std::collections::VecDeque;
use std::time::Instant;

/// Redraws allowed for a degenerate posterior draw.
const MAX_REDRAWS: usize = 3;

/// A batch whose statistics are live in the global tables.
#[derive(Debug, Clone)]
pub struct AliveBatch {
    /// Round that merged it
    pub round: usize,
    /// Raw unit it was merged with
    pub unit: f64,
    /// What was merged (per count, before the unit)
    pub contribution: BatchContribution,
    /// Number of documents behind it
    pub num_docs: usize,
}

/// Retained assignments of one training round (`sampleZs`).
#[derive(Debug, Clone)]
pub struct RoundRecord {
    /// Round index
    pub round: usize,
    /// Documents of the batch
    pub docs: Vec<Document>,
    /// Final-sweep assignments of the batch
    pub z: Vec<SampleZ>,
    /// Hinge cost after the M-step
    pub cost: f64,
}

/// Everything needed to take back the latest round exactly.
#[derive(Debug)]
pub(crate) struct RoundUndo {
    round: usize,
    snapshot: StatsSnapshot,
    evicted: Vec<AliveBatch>,
    num_docs: usize,
    positives: usize,
    history_evicted: Option<RoundRecord>,
}

/// Held-out documents used at commit points.
#[derive(Debug, Clone)]
struct TestSet {
    docs: Vec<Document>,
    labels: Vec<i32>,
}

/// Outcome of [`OnlineMedLda::inference`].
#[derive(Debug, Clone)]
pub struct InferenceResult {
    /// Fraction of documents whose predicted label matches
    pub accuracy: f64,
    /// Discriminant value per document, averaged over `params`
    pub scores: Vec<f64>,
    /// Predicted label (±1) per document
    pub predictions: Vec<i32>,
    /// Final-sweep assignments per document under the last parameter set
    pub test_z: Vec<SampleZ>,
    /// Parameter sets the documents were scored with
    pub params: Vec<Sample>,
}

/// Online max-margin supervised topic model.
///
/// The model owns its statistics and its random stream; every operation
/// goes through it. Call [`OnlineMedLda::init`] before anything else.
#[derive(Debug)]
pub struct OnlineMedLda {
    pub(crate) options: MedLdaOptions,
    pub(crate) stats: GlobalStats,
    pub(crate) prng: Prng,
    pub(crate) gibbs: GibbsSampler,
    initialized: bool,

    pub(crate) round: usize,
    epoch: usize,
    ledger: ForgetLedger,
    pub(crate) alive: VecDeque<AliveBatch>,

    pub(crate) pending: BatchContribution,
    pub(crate) pending_docs: usize,
    pub(crate) pending_removals: Vec<AliveBatch>,
    pub(crate) last_round: Option<RoundUndo>,

    commit_points: Vec<CommitPoint>,
    samples: VecDeque<Sample>,
    sample_zs: VecDeque<RoundRecord>,
    test_data: Option<TestSet>,

    docs_seen: usize,
    positives: usize,
    corpus_size: Option<usize>,
    train_time: f64,
    test_acc: Option<f64>,
}

/// Share of a corpus of `corpus_size` documents covered by `docs_seen`,
/// capped at one once every document has been visited.
fn observed_fraction(docs_seen: usize, corpus_size: Option<usize>) -> Option<f64> {
    corpus_size
        .filter(|&n| n > 0)
        .map(|n| (docs_seen as f64 / n as f64).min(1.0))
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, cap: usize) -> Option<T> {
    queue.push_back(item);
    if queue.len() > cap {
        queue.pop_front()
    } else {
        None
    }
}

impl OnlineMedLda {
    /// A model for `options`; rejects invalid options.
    pub fn new(options: MedLdaOptions) -> anyhow::Result<Self> {
        options.validate()?;
        let k = options.num_topics;
        Ok(OnlineMedLda {
            stats: GlobalStats::new(k, options.vocab_size, options.beta0, options.eta_prior_var),
            prng: Prng::new(options.seed),
            gibbs: GibbsSampler::new(),
            initialized: false,
            round: 0,
            epoch: 0,
            ledger: ForgetLedger::new(options.effective_forget()),
            alive: VecDeque::new(),
            pending: BatchContribution::new(k, options.max_touched_cells),
            pending_docs: 0,
            pending_removals: vec![],
            last_round: None,
            commit_points: vec![],
            samples: VecDeque::new(),
            sample_zs: VecDeque::new(),
            test_data: None,
            docs_seen: 0,
            positives: 0,
            corpus_size: None,
            train_time: 0.0,
            test_acc: None,
            options,
        })
    }

    /// Reset to empty statistics (φ at its uniform prior mean, η zero
    /// mean) and seed the random stream from the options.
    pub fn init(&mut self) -> anyhow::Result<()> {
        let opts = &self.options;
        self.stats = GlobalStats::new(opts.num_topics, opts.vocab_size, opts.beta0, opts.eta_prior_var);
        self.stats.refresh_posterior()?;
        self.prng.reseed(opts.seed);
        self.ledger = ForgetLedger::new(opts.effective_forget());
        self.pending = BatchContribution::new(opts.num_topics, opts.max_touched_cells);
        self.pending_docs = 0;
        self.pending_removals.clear();
        self.last_round = None;
        self.alive.clear();
        self.round = 0;
        self.epoch = 0;
        self.commit_points.clear();
        self.samples.clear();
        self.sample_zs.clear();
        self.docs_seen = 0;
        self.positives = 0;
        self.train_time = 0.0;
        self.test_acc = None;
        self.initialized = true;
        debug!(
            "initialized K={} T={} seed={}",
            opts.num_topics,
            opts.vocab_size,
            self.prng.seed()
        );
        Ok(())
    }

    pub(crate) fn ensure_initialized(&self) -> anyhow::Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(MedLdaError::protocol("model used before init()"))
        }
    }

    /// Re-seed the random stream.
    pub fn reseed(&mut self, seed: u64) {
        self.prng.reseed(seed);
    }

    /// Held-out documents evaluated at every commit point.
    pub fn set_test_data(&mut self, docs: Vec<Document>, labels: Vec<i32>) -> anyhow::Result<()> {
        validate_batch(&docs, &labels, self.options.vocab_size, self.options.category)?;
        self.test_data = Some(TestSet { docs, labels });
        Ok(())
    }

    /// Train on one batch and return its hinge cost.
    ///
    /// A round is atomic: on any error the statistics, the window and
    /// the counters are left exactly as they were before the call.
    pub fn train(&mut self, docs: &[Document], labels: &[i32]) -> anyhow::Result<f64> {
        self.ensure_initialized()?;
        let responses = validate_batch(docs, labels, self.options.vocab_size, self.options.category)?;

        if self.stats.needs_fold() {
            let f = self.stats.fold();
            for rec in self.alive.iter_mut().chain(self.pending_removals.iter_mut()) {
                rec.unit *= f;
            }
            self.last_round = None;
            debug!("folded decay scale {:e} into the tables", f);
        }

        let started = Instant::now();
        let base_round = self.round;
        let mut snap = self.stats.snapshot();
        let mut evicted = vec![];

        match self.run_round(docs, &responses, &mut snap, &mut evicted, started) {
            Ok((cost, z, commit)) => {
                let positives = responses.iter().filter(|&&y| y > 0.0).count();
                self.docs_seen += docs.len();
                self.positives += positives;

                let record = RoundRecord {
                    round: self.round,
                    docs: docs.to_vec(),
                    z,
                    cost,
                };
                let history_evicted = push_bounded(&mut self.sample_zs, record, self.options.history_size);

                self.last_round = Some(RoundUndo {
                    round: self.round,
                    snapshot: snap,
                    evicted,
                    num_docs: docs.len(),
                    positives,
                    history_evicted,
                });
                self.train_time += started.elapsed().as_secs_f64();

                if let Some(cp) = commit {
                    info!(
                        "commit at round {}: time {:.3}s, observed {:?}, accuracy {:?}",
                        cp.round, cp.time_secs, cp.ob_percent, cp.accuracy
                    );
                    self.commit_points.push(cp);
                }
                info!(
                    "round {}: {} docs, cost {:.4}, {} alive",
                    self.round,
                    docs.len(),
                    cost,
                    self.alive.len()
                );
                Ok(cost)
            }
            Err(e) => {
                self.stats.restore(&snap);
                while self.alive.back().is_some_and(|r| r.round > base_round) {
                    self.alive.pop_back();
                }
                for rec in evicted.into_iter().rev() {
                    self.alive.push_front(rec);
                }
                self.clear_pending();
                self.round = base_round;
                self.ledger.truncate(base_round);
                Err(e)
            }
        }
    }

    fn run_round(
        &mut self,
        docs: &[Document],
        responses: &[f64],
        snap: &mut StatsSnapshot,
        evicted: &mut Vec<AliveBatch>,
        started: Instant,
    ) -> anyhow::Result<(f64, Vec<SampleZ>, Option<CommitPoint>)> {
        self.round += 1;
        let rho = self.ledger.advance(self.round);
        self.stats.decay(rho);

        let k = self.options.num_topics;
        let mut state = BatchState::init(docs, k, self.options.max_touched_cells, &mut self.prng)?;

        for sweep in 0..self.options.max_gibbs_iter {
            let moves = self.update_z(&mut state, docs, responses)?;
            self.update_lambda(&mut state, docs, responses)?;
            debug!("round {} sweep {}: {} moves", self.round, sweep, moves);

            if sweep >= self.options.gibbs_burnin {
                self.infer_phi_eta(docs, &state.z, responses, sweep == self.options.gibbs_burnin)?;
            }
        }

        snap.record_cells(&self.stats, &self.pending.topic_word)?;
        self.normalize_inner(self.options.retained_sweeps(), false)?;

        if let Some(window) = self.options.window_size {
            while self.alive.len() > window {
                let Some(front) = self.alive.front() else {
                    break;
                };
                snap.record_cells(&self.stats, &front.contribution.topic_word)?;
                let Some(rec) = self.alive.pop_front() else {
                    break;
                };
                debug!("round {} leaves the window", rec.round);
                let removed = self.stats.remove(&rec.contribution, rec.unit);
                evicted.push(rec);
                removed?;
            }
            if !evicted.is_empty() {
                self.stats.refresh_posterior()?;
            }
        }

        let cost = self.compute_cost_function(&state.z, docs, responses)?;

        let spacing = self.options.commit_point_spacing;
        let commit = if spacing > 0 && self.round % spacing == 0 {
            let elapsed = self.train_time + started.elapsed().as_secs_f64();
            Some(self.commit(elapsed, self.docs_seen + docs.len())?)
        } else {
            None
        };

        Ok((cost, state.z, commit))
    }

    fn commit(&mut self, time_secs: f64, docs_seen: usize) -> anyhow::Result<CommitPoint> {
        let accuracy = match self.test_data.take() {
            Some(test) => {
                let result = self.inference(
                    &test.docs,
                    &test.labels,
                    self.options.num_test_sample,
                    self.options.category,
                );
                self.test_data = Some(test);
                Some(result?.accuracy)
            }
            None => None,
        };
        Ok(CommitPoint {
            round: self.round,
            time_secs,
            ob_percent: observed_fraction(docs_seen, self.corpus_size),
            accuracy,
            eta_mean: self.stats.eta_mean().iter().copied().collect(),
        })
    }

    /// One pass over a corpus in batches of `batch_size`. Returns the
    /// cost of every round.
    pub fn train_epoch(&mut self, corpus: &dyn CorpusProvider) -> anyhow::Result<Vec<f64>> {
        self.ensure_initialized()?;
        if corpus.vocab_size() != self.options.vocab_size {
            return Err(MedLdaError::data(format!(
                "corpus vocabulary of {} words, model expects {}",
                corpus.vocab_size(),
                self.options.vocab_size
            )));
        }
        let n = corpus.num_docs();
        self.corpus_size = Some(n);

        let mut costs = vec![];
        for start in (0..n).step_by(self.options.batch_size) {
            let (docs, labels) = corpus.batch(start, self.options.batch_size)?;
            costs.push(self.train(&docs, &labels)?);
        }
        self.epoch += 1;
        info!("epoch {} done: {} rounds", self.epoch, costs.len());
        Ok(costs)
    }

    /// Take back the statistics merged at `round`.
    ///
    /// The latest round, ejected right after training, is undone
    /// exactly: statistics, forgetting, the window and the counters are
    /// put back to where they were before it. Any other alive round is
    /// subtracted with the unit it was merged with.
    pub fn eject_round(&mut self, round: usize) -> anyhow::Result<()> {
        self.ensure_initialized()?;
        let Some(pos) = self.alive.iter().position(|r| r.round == round) else {
            return Err(MedLdaError::protocol(format!("round {} is not alive", round)));
        };

        let undoable = self
            .last_round
            .as_ref()
            .is_some_and(|u| u.round == round && round == self.round);
        if undoable {
            if let Some(undo) = self.last_round.take() {
                self.undo_round(undo);
                return Ok(());
            }
        }

        let mut snap = self.stats.snapshot();
        snap.record_cells(&self.stats, &self.alive[pos].contribution.topic_word)?;
        let Some(rec) = self.alive.remove(pos) else {
            return Err(MedLdaError::protocol(format!("round {} is not alive", round)));
        };

        let result = self
            .stats
            .remove(&rec.contribution, rec.unit)
            .and_then(|_| self.stats.refresh_posterior());
        if let Err(e) = result {
            self.stats.restore(&snap);
            self.alive.insert(pos, rec);
            return Err(e);
        }
        self.last_round = None;
        debug!("ejected round {}, {} alive", round, self.alive.len());
        Ok(())
    }

    fn undo_round(&mut self, undo: RoundUndo) {
        self.stats.restore(&undo.snapshot);
        self.alive.retain(|r| r.round != undo.round);
        for rec in undo.evicted.into_iter().rev() {
            self.alive.push_front(rec);
        }
        self.round -= 1;
        self.ledger.truncate(self.round);
        self.docs_seen -= undo.num_docs;
        self.positives -= undo.positives;
        if self.sample_zs.back().is_some_and(|r| r.round == undo.round) {
            self.sample_zs.pop_back();
        }
        if let Some(h) = undo.history_evicted {
            self.sample_zs.push_front(h);
        }
        debug!("undid round {}", undo.round);
    }

    /// Eject the batch `docs` with assignments `z` introduced at `round`.
    ///
    /// The batch must match what was merged at that round.
    pub fn eject_sample(&mut self, docs: &[Document], z: &[SampleZ], round: usize) -> anyhow::Result<()> {
        self.ensure_initialized()?;
        let Some(rec) = self.alive.iter().find(|r| r.round == round) else {
            return Err(MedLdaError::protocol(format!("round {} is not alive", round)));
        };
        if docs.len() != z.len() {
            return Err(MedLdaError::data(format!(
                "{} documents but {} assignments",
                docs.len(),
                z.len()
            )));
        }
        let mut tokens = 0usize;
        for (d, (doc, zd)) in docs.iter().zip(z).enumerate() {
            if doc.len() != zd.len() {
                return Err(MedLdaError::data(format!(
                    "document {} has {} tokens but {} assignments",
                    d,
                    doc.len(),
                    zd.len()
                )));
            }
            tokens += doc.len();
        }
        let merged = rec.contribution.total_count();
        if (merged - tokens as f64).abs() > 1e-6 * (1.0 + merged) {
            return Err(MedLdaError::data(format!(
                "round {} merged {} tokens, batch has {}",
                round, merged, tokens
            )));
        }
        self.eject_round(round)
    }

    /// Predict held-out documents with φ and η fixed.
    ///
    /// With `num_test_sample == 0` the posterior mean is used; otherwise
    /// that many posterior draws, whose scores are averaged. Every
    /// document runs `test_burnin` burn-in sweeps and `max_test_samples`
    /// retained sweeps. Training statistics are not touched.
    pub fn inference(
        &mut self,
        docs: &[Document],
        labels: &[i32],
        num_test_sample: usize,
        category: Option<usize>,
    ) -> anyhow::Result<InferenceResult> {
        self.ensure_initialized()?;
        let responses = validate_batch(docs, labels, self.options.vocab_size, category)?;

        let params = if num_test_sample == 0 {
            vec![Sample::posterior_mean(&self.stats)]
        } else {
            (0..num_test_sample)
                .map(|_| Sample::draw(&self.stats, MAX_REDRAWS, &mut self.prng))
                .collect::<anyhow::Result<Vec<_>>>()?
        };
        let rngs: Vec<SmallRng> = docs.iter().map(|_| self.prng.fork()).collect();

        let alpha0 = self.options.alpha0;
        let burnin = self.options.test_burnin;
        let retained = self.options.max_test_samples;
        let run = |(doc, rng): (&Document, SmallRng)| {
            infer_document(doc, &params, alpha0, burnin, retained, rng)
        };

        let outcomes: Vec<(f64, SampleZ)> = if self.options.parallel_inference {
            docs.par_iter()
                .zip(rngs.into_par_iter())
                .map(run)
                .collect::<anyhow::Result<_>>()?
        } else {
            docs.iter()
                .zip(rngs)
                .map(run)
                .collect::<anyhow::Result<_>>()?
        };

        let mut scores = Vec::with_capacity(docs.len());
        let mut predictions = Vec::with_capacity(docs.len());
        let mut test_z = Vec::with_capacity(docs.len());
        let mut correct = 0;
        for ((score, z), &y) in outcomes.into_iter().zip(&responses) {
            let pred = predict_label(score);
            if pred as f64 == y {
                correct += 1;
            }
            scores.push(score);
            predictions.push(pred);
            test_z.push(z);
        }
        let accuracy = correct as f64 / docs.len() as f64;
        self.test_acc = Some(accuracy);

        if num_test_sample > 0 {
            for p in &params {
                push_bounded(&mut self.samples, p.clone(), self.options.history_size);
            }
        }
        debug!("inference on {} docs: accuracy {:.4}", docs.len(), accuracy);

        Ok(InferenceResult {
            accuracy,
            scores,
            predictions,
            test_z,
            params,
        })
    }

    /// Options the model was built with.
    pub fn options(&self) -> &MedLdaOptions {
        &self.options
    }

    /// Global statistics and the current posterior.
    pub fn stats(&self) -> &GlobalStats {
        &self.stats
    }

    /// Rounds trained so far (ejected rounds excluded only when undone).
    pub fn round(&self) -> usize {
        self.round
    }

    /// Completed passes of [`OnlineMedLda::train_epoch`].
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Rounds whose statistics are live, oldest first.
    pub fn alive_rounds(&self) -> Vec<usize> {
        self.alive.iter().map(|r| r.round).collect()
    }

    /// Live batches, oldest first.
    pub fn alive(&self) -> impl Iterator<Item = &AliveBatch> + '_ {
        self.alive.iter()
    }

    /// Current weight of the batch merged at `round`, if it is alive.
    pub fn batch_weight(&self, round: usize) -> Option<f64> {
        self.alive
            .iter()
            .find(|r| r.round == round)
            .map(|r| r.unit * self.stats.scale())
    }

    /// Forgetting factor applied at every elapsed round.
    pub fn forget_factor(&self) -> &[f64] {
        &self.ledger.factors()[1..]
    }

    /// The learning curve.
    pub fn commit_points(&self) -> &[CommitPoint] {
        &self.commit_points
    }

    /// Retained posterior draws.
    pub fn samples(&self) -> &VecDeque<Sample> {
        &self.samples
    }

    /// Retained per-round assignments.
    pub fn sample_zs(&self) -> &VecDeque<RoundRecord> {
        &self.sample_zs
    }

    /// Fraction of positive responses among training documents seen.
    pub fn pos_ratio(&self) -> Option<f64> {
        (self.docs_seen > 0).then(|| self.positives as f64 / self.docs_seen as f64)
    }

    /// Fraction of the corpus observed, once its size is known.
    pub fn ob_percent(&self) -> Option<f64> {
        observed_fraction(self.docs_seen, self.corpus_size)
    }

    /// Set the corpus size used for the observed fraction.
    pub fn set_corpus_size(&mut self, n: usize) {
        self.corpus_size = Some(n);
    }

    /// Accuracy of the last inference.
    pub fn test_acc(&self) -> Option<f64> {
        self.test_acc
    }

    /// Accumulated training time in seconds.
    pub fn train_time(&self) -> f64 {
        self.train_time
    }
}

/// Score one held-out document under every parameter set.
///
/// Returns the discriminant averaged over `params` and the final-sweep
/// assignment under the last set.
fn infer_document(
    doc: &Document,
    params: &[Sample],
    alpha0: f64,
    burnin: usize,
    retained: usize,
    mut rng: SmallRng,
) -> anyhow::Result<(f64, SampleZ)> {
    let mut weights = vec![];
    let mut score = 0.0;
    let mut last = None;

    for sample in params {
        let k = sample.num_topics();
        let mut z = SampleZ::random(doc.len(), k, &mut rng);
        let mut avg = DVector::<f64>::zeros(k);

        for sweep in 0..(burnin + retained) {
            draw_z_test(sample, &mut z, doc, alpha0, &mut weights, &mut rng)?;
            if sweep >= burnin {
                avg += z.counts_vector();
            }
        }
        avg /= retained as f64;
        score += sample.eta.dot(&avg) / doc.len() as f64;
        last = Some(z);
    }

    let Some(z) = last else {
        return Err(MedLdaError::protocol("inference without parameters"));
    };
    Ok((score / params.len() as f64, z))
}
