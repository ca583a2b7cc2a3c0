use crate::config::SearchSettings;
use crate::error::EngineError;
use crate::fees::FeeSchedule;
use crate::ledger::Ledger;
use crate::models::{PriceSeries, Signal, StrategyConfig};
use crate::predictor::{generate_signals, FeatureService, Predictor};
use crate::simulator::{BacktestSimulator, BacktestStatistics};
use crate::stats::{HistogramBucket, StatisticsService};
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use crossbeam_channel::{bounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::any::Any;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Bucket count for the retained-set PL histogram in the final outcome.
pub const RETAINED_HISTOGRAM_BUCKETS: usize = 14;

/// Cooperative cancellation flag shared between the caller and the session.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(AtomicOrdering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SearchPhase {
    Idle,
    Preparing,
    BaselineComputing,
    SearchingCandidates,
    Done,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub text: String,
    pub severity: Severity,
}

/// Point-in-time view of a running search, published on every completion.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub total: usize,
    pub retained: usize,
    pub discarded: usize,
    pub progress: f64,
    pub eta: Duration,
    pub baseline_pl: f64,
    pub best_fitness: Option<f64>,
}

/// Stream of updates delivered to an optional observer channel.
#[derive(Debug, Clone)]
pub enum SearchUpdate {
    Phase(SearchPhase),
    Status(StatusMessage),
    Progress(ProgressSnapshot),
}

/// One evaluated configuration that cleared the retention baseline.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub seed: u64,
    pub config: StrategyConfig,
    pub buy_threshold: f64,
    pub sell_threshold: f64,
    pub statistics: BacktestStatistics,
}

impl Candidate {
    /// Ranking score: raw PL weighted by how often transactions win, so a
    /// lucky outlier trade does not dominate consistently profitable setups.
    pub fn fitness(&self) -> f64 {
        self.statistics.pl * self.statistics.win_rate
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub state: SearchPhase,
    pub baseline_pl: f64,
    pub best: Option<Candidate>,
    /// Retained candidates ordered by seed.
    pub candidates: Vec<Candidate>,
    pub discarded: usize,
    pub retained_median_pl: f64,
    pub retained_std_dev_pl: f64,
    pub retained_min_pl: f64,
    pub retained_histogram: Vec<HistogramBucket>,
}

struct CandidateTaskResult {
    seed: u64,
    outcome: Result<Candidate, String>,
}

/// Derives an independent seed for one unit of work. Streams separate the
/// baseline replays from the candidate search so neither consumes the
/// other's randomness.
fn child_seed(master: u64, stream: u64, index: u64) -> u64 {
    let mut z = master
        .wrapping_add(stream.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add(index.wrapping_mul(0xD1B5_4A32_D192_ED03));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

const BASELINE_STREAM: u64 = 0;
const CANDIDATE_STREAM: u64 = 1;

fn publish(observer: &Option<Sender<SearchUpdate>>, update: SearchUpdate) {
    if let Some(sender) = observer {
        let _ = sender.send(update);
    }
}

fn publish_status(
    observer: &Option<Sender<SearchUpdate>>,
    severity: Severity,
    text: impl Into<String>,
) {
    publish(
        observer,
        SearchUpdate::Status(StatusMessage {
            text: text.into(),
            severity,
        }),
    );
}

fn worker_count(task_count: usize, concurrency: usize) -> usize {
    task_count
        .min(concurrency)
        .min(std::cmp::max(1, num_cpus::get()))
        .max(1)
}

/// Runs the whole evaluation session: partition the series, estimate the
/// random-replay baseline, then evaluate randomized candidates in parallel
/// and retain the ones that beat the baseline.
pub struct SearchEngine {
    predictor: Arc<dyn Predictor>,
    features: Arc<dyn FeatureService>,
    fees: Arc<dyn FeeSchedule>,
    stats: Arc<dyn StatisticsService>,
    settings: SearchSettings,
}

impl SearchEngine {
    pub fn new(
        predictor: Arc<dyn Predictor>,
        features: Arc<dyn FeatureService>,
        fees: Arc<dyn FeeSchedule>,
        stats: Arc<dyn StatisticsService>,
        settings: SearchSettings,
    ) -> Self {
        Self {
            predictor,
            features,
            fees,
            stats,
            settings,
        }
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    pub fn find_best(
        &self,
        series: &PriceSeries,
        cancel: &CancelToken,
        observer: Option<Sender<SearchUpdate>>,
    ) -> Result<SearchOutcome> {
        self.settings.validate()?;
        if series.is_empty() {
            return Err(anyhow!("Price series is empty"));
        }

        let master_seed = self.settings.master_seed.unwrap_or_else(rand::random);
        info!("Starting search session with master seed {}", master_seed);

        publish(&observer, SearchUpdate::Phase(SearchPhase::Preparing));
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled.into());
        }

        let (training, testing) = series.split(self.settings.train_percentage);
        if training.is_empty() || testing.is_empty() {
            return Err(anyhow!(
                "Series of {} quotes is too short to split at {}",
                series.len(),
                self.settings.train_percentage
            ));
        }
        let opening_date = testing
            .begin_date()
            .context("Testing partition has no begin date")?;
        let seed_ledger = Ledger::with_opening_deposit(
            opening_date,
            self.settings.initial_cash,
            Arc::clone(&self.fees),
        )?;

        publish(&observer, SearchUpdate::Phase(SearchPhase::BaselineComputing));
        let baseline_pl = self.random_replay_baseline(&testing, &seed_ledger, master_seed, cancel)?;
        info!(
            "Retention baseline is {:.2} from {} random replays",
            baseline_pl, self.settings.baseline_trials
        );
        publish_status(
            &observer,
            Severity::Info,
            format!(
                "Retention baseline is {:.2} from {} random replays",
                baseline_pl, self.settings.baseline_trials
            ),
        );

        publish(
            &observer,
            SearchUpdate::Phase(SearchPhase::SearchingCandidates),
        );
        let outcome = self.search_candidates(
            &training,
            &testing,
            &seed_ledger,
            master_seed,
            baseline_pl,
            cancel,
            &observer,
        )?;

        publish(&observer, SearchUpdate::Phase(outcome.state));
        Ok(outcome)
    }

    /// Expected PL of signal noise over the testing partition. Candidates
    /// that cannot beat this are indistinguishable from luck.
    fn random_replay_baseline(
        &self,
        testing: &PriceSeries,
        seed_ledger: &Ledger,
        master_seed: u64,
        cancel: &CancelToken,
    ) -> Result<f64> {
        let trials = self.settings.baseline_trials;
        let workers = worker_count(trials, self.settings.baseline_concurrency);
        info!("Running {} baseline replays on {} worker threads", trials, workers);

        let (tx, rx): (Sender<u64>, Receiver<u64>) = bounded(trials);
        let (result_tx, result_rx): (
            Sender<Result<f64, String>>,
            Receiver<Result<f64, String>>,
        ) = bounded(trials);

        let dates: Arc<Vec<NaiveDate>> = Arc::new(testing.dates().collect());
        let testing = Arc::new(testing.clone());

        let mut handles = Vec::new();
        for _ in 0..workers {
            let rx = rx.clone();
            let result_tx = result_tx.clone();
            let cancel = cancel.clone();
            let dates = Arc::clone(&dates);
            let testing = Arc::clone(&testing);
            let stats = Arc::clone(&self.stats);
            let seed_ledger = seed_ledger.clone();
            let instrument = self.settings.instrument.clone();
            let cooldown_days = self.settings.cooldown_days;

            let handle = thread::spawn(move || {
                let simulator =
                    BacktestSimulator::new(&instrument, &testing, cooldown_days, stats.as_ref());
                while let Ok(seed) = rx.recv() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let mut rng = StdRng::seed_from_u64(seed);
                    let signals: BTreeMap<NaiveDate, Signal> = dates
                        .iter()
                        .map(|date| {
                            let signal = match rng.gen_range(0..3) {
                                0 => Signal::Buy,
                                1 => Signal::Sell,
                                _ => Signal::Neutral,
                            };
                            (*date, signal)
                        })
                        .collect();
                    let outcome = simulator
                        .evaluate(seed_ledger.snapshot_reset(), &signals)
                        .map(|s| s.pl)
                        .map_err(|e| e.to_string());
                    if result_tx.send(outcome).is_err() {
                        break;
                    }
                }
            });
            handles.push(handle);
        }

        for trial in 0..trials {
            tx.send(child_seed(master_seed, BASELINE_STREAM, trial as u64))?;
        }
        drop(tx);
        drop(result_tx);

        let mut pls = Vec::with_capacity(trials);
        let mut completed = 0;
        let mut cancelled = false;
        while completed < trials {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            match result_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(Ok(pl)) => {
                    completed += 1;
                    pls.push(pl);
                }
                Ok(Err(error)) => {
                    completed += 1;
                    warn!("Baseline replay failed: {}", error);
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }

        for handle in handles {
            let _ = handle.join();
        }

        if cancelled {
            return Err(EngineError::Cancelled.into());
        }
        if pls.is_empty() {
            return Err(anyhow!("All baseline replays failed"));
        }
        // completion order depends on scheduling; sort before averaging so
        // reruns with the same seed agree to the last bit
        pls.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        Ok(self.stats.mean(&pls))
    }

    #[allow(clippy::too_many_arguments)]
    fn search_candidates(
        &self,
        training: &PriceSeries,
        testing: &PriceSeries,
        seed_ledger: &Ledger,
        master_seed: u64,
        baseline_pl: f64,
        cancel: &CancelToken,
        observer: &Option<Sender<SearchUpdate>>,
    ) -> Result<SearchOutcome> {
        let total = self.settings.candidate_count;
        let workers = worker_count(total, self.settings.search_concurrency);
        info!("Running {} candidate evaluations on {} worker threads", total, workers);

        let (tx, rx): (Sender<u64>, Receiver<u64>) = bounded(total);
        let (result_tx, result_rx): (
            Sender<CandidateTaskResult>,
            Receiver<CandidateTaskResult>,
        ) = bounded(total);

        let training = Arc::new(training.clone());
        let testing = Arc::new(testing.clone());

        let mut handles = Vec::new();
        for _ in 0..workers {
            let rx = rx.clone();
            let result_tx = result_tx.clone();
            let cancel = cancel.clone();
            let training = Arc::clone(&training);
            let testing = Arc::clone(&testing);
            let predictor = Arc::clone(&self.predictor);
            let features = Arc::clone(&self.features);
            let stats = Arc::clone(&self.stats);
            let seed_ledger = seed_ledger.clone();
            let instrument = self.settings.instrument.clone();
            let cooldown_days = self.settings.cooldown_days;
            let buy_range = self.settings.buy_threshold_range;
            let sell_range = self.settings.sell_threshold_range;

            let handle = thread::spawn(move || {
                let simulator =
                    BacktestSimulator::new(&instrument, &testing, cooldown_days, stats.as_ref());
                while let Ok(seed) = rx.recv() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    // a panicking collaborator must not kill the worker;
                    // it counts as one discarded candidate
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        evaluate_candidate(
                            seed,
                            predictor.as_ref(),
                            features.as_ref(),
                            &simulator,
                            &training,
                            &testing,
                            &seed_ledger,
                            buy_range,
                            sell_range,
                        )
                    }))
                    .unwrap_or_else(|panic| Err(anyhow!(panic_message(panic))))
                    .map_err(|e| e.to_string());
                    if result_tx.send(CandidateTaskResult { seed, outcome }).is_err() {
                        break;
                    }
                }
            });
            handles.push(handle);
        }

        for index in 0..total {
            tx.send(child_seed(master_seed, CANDIDATE_STREAM, index as u64))?;
        }
        drop(tx);
        drop(result_tx);

        let pb = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        let started = Instant::now();
        let mut retained: Vec<Candidate> = Vec::new();
        let mut discarded = 0;
        let mut completed = 0;
        let mut cancelled = false;

        while completed < total {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let result = match result_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(result) => result,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    warn!("Result channel closed unexpectedly. Some results may be lost.");
                    break;
                }
            };

            completed += 1;
            pb.set_position(completed as u64);

            match result.outcome {
                Ok(candidate) if candidate.statistics.pl >= baseline_pl => {
                    retained.push(candidate);
                }
                Ok(_) => discarded += 1,
                Err(error) => {
                    discarded += 1;
                    warn!("Candidate {} failed: {}", result.seed, error);
                    publish_status(
                        observer,
                        Severity::Warning,
                        format!("Candidate {} failed: {}", result.seed, error),
                    );
                }
            }

            let progress = completed as f64 / total as f64;
            let eta = if progress > 0.0 {
                started.elapsed().mul_f64((1.0 - progress) / progress)
            } else {
                Duration::ZERO
            };
            publish(
                observer,
                SearchUpdate::Progress(ProgressSnapshot {
                    completed,
                    total,
                    retained: retained.len(),
                    discarded,
                    progress,
                    eta,
                    baseline_pl,
                    best_fitness: best_candidate(&retained).map(Candidate::fitness),
                }),
            );
        }

        if cancelled {
            pb.finish_with_message("Search cancelled");
        } else {
            pb.finish_with_message("Search completed");
        }

        for handle in handles {
            let _ = handle.join();
        }

        // a truncated run that nobody cancelled must not pass for Done
        if !cancelled && completed < total {
            return Err(anyhow!(
                "Worker threads exited after {} of {} candidate evaluations",
                completed,
                total
            ));
        }

        retained.sort_by_key(|c| c.seed);
        let best = best_candidate(&retained).cloned();
        let retained_pls: Vec<f64> = retained.iter().map(|c| c.statistics.pl).collect();

        let state = if cancelled {
            SearchPhase::Cancelled
        } else {
            SearchPhase::Done
        };
        info!(
            "Search finished: {} retained, {} discarded of {} candidates",
            retained.len(),
            discarded,
            total
        );

        Ok(SearchOutcome {
            state,
            baseline_pl,
            best,
            retained_median_pl: self.stats.median(&retained_pls),
            retained_std_dev_pl: self.stats.std_dev(&retained_pls),
            retained_min_pl: smallest_pl(&retained_pls),
            retained_histogram: self
                .stats
                .bucketize(&retained_pls, RETAINED_HISTOGRAM_BUCKETS),
            candidates: retained,
            discarded,
        })
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "evaluation panicked".to_string()
    }
}

/// Minimum over the retained PLs, 0 only for an empty set. Seeding a fold
/// with 0.0 would clamp one-sided runs.
fn smallest_pl(values: &[f64]) -> f64 {
    values.iter().copied().reduce(f64::min).unwrap_or(0.0)
}

/// Highest fitness wins; ties go to the lowest seed so reruns agree.
fn best_candidate(retained: &[Candidate]) -> Option<&Candidate> {
    retained.iter().max_by(|a, b| {
        a.fitness()
            .partial_cmp(&b.fitness())
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.seed.cmp(&a.seed))
    })
}

#[allow(clippy::too_many_arguments)]
fn evaluate_candidate(
    seed: u64,
    predictor: &dyn Predictor,
    features: &dyn FeatureService,
    simulator: &BacktestSimulator<'_>,
    training: &PriceSeries,
    testing: &PriceSeries,
    seed_ledger: &Ledger,
    buy_range: (f64, f64),
    sell_range: (f64, f64),
) -> Result<Candidate> {
    let mut rng = StdRng::seed_from_u64(seed);
    let config = StrategyConfig::random(&mut rng);
    let buy_threshold = rng.gen_range(buy_range.0..buy_range.1);
    let sell_threshold = rng.gen_range(sell_range.0..sell_range.1);

    let training_rows = features.features(training, &config)?;
    let model = predictor.train(&training_rows)?;
    let testing_rows = features.features(testing, &config)?;
    let signals = generate_signals(model.as_ref(), &testing_rows, buy_threshold, sell_threshold);
    let statistics = simulator.evaluate(seed_ledger.snapshot_reset(), &signals)?;

    Ok(Candidate {
        seed,
        config,
        buy_threshold,
        sell_threshold,
        statistics,
    })
}
