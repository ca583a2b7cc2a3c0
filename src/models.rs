use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One daily bar of an instrument's price history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quote {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Chronologically ordered daily quote history for a single instrument.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceSeries {
    quotes: BTreeMap<NaiveDate, Quote>,
}

impl PriceSeries {
    pub fn from_quotes(quotes: impl IntoIterator<Item = Quote>) -> Self {
        Self {
            quotes: quotes.into_iter().map(|q| (q.date, q)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    pub fn quote(&self, date: NaiveDate) -> Option<&Quote> {
        self.quotes.get(&date)
    }

    pub fn close(&self, date: NaiveDate) -> Option<f64> {
        self.quotes.get(&date).map(|q| q.close)
    }

    pub fn first_quote(&self) -> Option<&Quote> {
        self.quotes.values().next()
    }

    pub fn last_quote(&self) -> Option<&Quote> {
        self.quotes.values().next_back()
    }

    pub fn begin_date(&self) -> Option<NaiveDate> {
        self.quotes.keys().next().copied()
    }

    pub fn end_date(&self) -> Option<NaiveDate> {
        self.quotes.keys().next_back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Quote> {
        self.quotes.values()
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.quotes.keys().copied()
    }

    /// Chronological split: the first `train_percentage` of quotes become the
    /// training partition, the remainder the testing partition.
    pub fn split(&self, train_percentage: f64) -> (PriceSeries, PriceSeries) {
        let cut = (self.quotes.len() as f64 * train_percentage).round() as usize;
        let cut = cut.min(self.quotes.len());

        let training = self.quotes.values().take(cut).copied();
        let testing = self.quotes.values().skip(cut).copied();

        (
            PriceSeries::from_quotes(training),
            PriceSeries::from_quotes(testing),
        )
    }
}

/// Per-day trading signal produced by a signal source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    Buy,
    Sell,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }
}

/// An executed trade. `shares` is always positive; direction lives in `side`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub date: NaiveDate,
    pub side: TradeSide,
    pub instrument: String,
    pub shares: u32,
    pub price: f64,
}

/// Signed cash movement on the ledger. Multiple entries may share a date;
/// insertion order among same-date entries is preserved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CashEntry {
    pub date: NaiveDate,
    pub amount: f64,
}

/// A matched Buy/Sell pair with its realized profit-or-loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteTransaction {
    pub buy: Trade,
    pub sell: Trade,
    pub pl: f64,
}

/// Randomly drawn signal-source configuration. The fields are opaque to the
/// core: they parameterize whatever indicator set the FeatureService computes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub fwd_days: u32,
    pub pct_change_high: f64,
    pub pct_change_low: f64,
    pub ma_fast: u32,
    pub ma_slow: u32,
    pub rsi: u32,
    pub macd_fast: u32,
    pub macd_slow: u32,
    pub macd_signal: u32,
    pub atr: u32,
}

impl StrategyConfig {
    pub fn random(rng: &mut StdRng) -> Self {
        Self {
            fwd_days: rng.gen_range(4..=14),
            pct_change_high: rng.gen_range(0.5..1.6),
            pct_change_low: rng.gen_range(-2.5..-0.6),
            ma_fast: rng.gen_range(3..=26),
            ma_slow: rng.gen_range(18..=40),
            rsi: rng.gen_range(3..=21),
            macd_fast: rng.gen_range(3..=8),
            macd_slow: rng.gen_range(21..=42),
            macd_signal: rng.gen_range(24..=36),
            atr: rng.gen_range(3..=21),
        }
    }
}
