use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::unbounded;
use log::{info, warn};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use stocklab::config::SearchSettings;
use stocklab::fees::{FlatRateFees, ZeroFees};
use stocklab::models::{PriceSeries, Quote};
use stocklab::reference::{LinearPredictor, ReturnFeatures};
use stocklab::search::{CancelToken, SearchEngine, SearchUpdate, Severity};
use stocklab::stats::DescriptiveStatistics;

#[derive(Parser)]
#[command(name = "stocklab")]
#[command(about = "Signal-source evaluation over historical price data")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search for the best-performing strategy configuration
    Search {
        /// Path to a JSON file with an array of daily quotes
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: PathBuf,
        /// Instrument symbol the quotes belong to
        #[arg(long)]
        instrument: String,
        /// Number of random candidates to evaluate
        #[arg(long, default_value_t = 32)]
        candidates: usize,
        /// Fixed seed for a reproducible session
        #[arg(long)]
        seed: Option<u64>,
        /// Fraction of the series used for training
        #[arg(long, default_value_t = 0.6)]
        train_percentage: f64,
        /// Calendar days a sell blocks the next buy
        #[arg(long, default_value_t = 3)]
        cooldown_days: i64,
        /// Opening cash deposit
        #[arg(long, default_value_t = 100_000.0)]
        initial_cash: f64,
        /// Proportional fee per trade, 0 disables fees
        #[arg(long, default_value_t = 0.0)]
        fee_rate: f64,
        /// Minimum fee per trade when a fee rate is set
        #[arg(long, default_value_t = 0.0)]
        fee_minimum: f64,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Search {
            data_file,
            instrument,
            candidates,
            seed,
            train_percentage,
            cooldown_days,
            initial_cash,
            fee_rate,
            fee_minimum,
        } => {
            let series = load_series(&data_file)?;
            info!(
                "Loaded {} quotes for {} from {}",
                series.len(),
                instrument,
                data_file.display()
            );

            let settings = SearchSettings {
                instrument,
                initial_cash,
                train_percentage,
                candidate_count: candidates,
                cooldown_days,
                master_seed: seed,
                ..SearchSettings::default()
            };

            let fees: Arc<dyn stocklab::fees::FeeSchedule> = if fee_rate > 0.0 {
                Arc::new(FlatRateFees {
                    rate: fee_rate,
                    minimum: fee_minimum,
                })
            } else {
                Arc::new(ZeroFees)
            };

            let engine = SearchEngine::new(
                Arc::new(LinearPredictor::default()),
                Arc::new(ReturnFeatures),
                fees,
                Arc::new(DescriptiveStatistics),
                settings,
            );

            info!(
                "Evaluating {} candidates for {}",
                engine.settings().candidate_count,
                engine.settings().instrument
            );

            let (update_tx, update_rx) = unbounded();
            let observer = thread::spawn(move || {
                while let Ok(update) = update_rx.recv() {
                    match update {
                        SearchUpdate::Phase(phase) => info!("Phase: {:?}", phase),
                        SearchUpdate::Status(status) => match status.severity {
                            Severity::Info => info!("{}", status.text),
                            Severity::Warning | Severity::Error => warn!("{}", status.text),
                        },
                        SearchUpdate::Progress(_) => {}
                    }
                }
            });

            let outcome = engine.find_best(&series, &CancelToken::new(), Some(update_tx))?;
            let _ = observer.join();

            info!(
                "Session finished in state {:?} with baseline PL {:.2}",
                outcome.state, outcome.baseline_pl
            );
            match &outcome.best {
                Some(best) => {
                    println!("{}", serde_json::to_string_pretty(best)?);
                }
                None => warn!("No candidate beat the random baseline"),
            }
        }
    }

    Ok(())
}

fn load_series(path: &PathBuf) -> Result<PriceSeries> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read quote file {}", path.display()))?;
    let quotes: Vec<Quote> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse quote file {}", path.display()))?;
    Ok(PriceSeries::from_quotes(quotes))
}
