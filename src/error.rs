use chrono::NaiveDate;
use thiserror::Error;

/// Failure taxonomy of the evaluation core. `InsufficientFunds` is always
/// recoverable by the caller choosing a smaller trade; `IncompatibleSeries`
/// is fatal to a single evaluation unit only; `Cancelled` terminates a run
/// while preserving committed results.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not enough cash on {date}: balance {balance:.2} cannot cover {required:.2}")]
    InsufficientFunds {
        date: NaiveDate,
        balance: f64,
        required: f64,
    },

    #[error("signal stream has {signals} entries but the price series has {quotes}")]
    IncompatibleSeries { signals: usize, quotes: usize },

    #[error("no quote for {instrument} on {date}")]
    MissingQuote {
        instrument: String,
        date: NaiveDate,
    },

    #[error("run cancelled")]
    Cancelled,
}
