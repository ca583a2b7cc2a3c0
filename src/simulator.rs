use crate::error::EngineError;
use crate::ledger::Ledger;
use crate::models::{CompleteTransaction, PriceSeries, Signal, Trade, TradeSide};
use crate::stats::{HistogramBucket, StatisticsService};
use crate::valuation::transaction_pl;
use chrono::NaiveDate;
use log::debug;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Bucket count for a single evaluation's per-transaction PL histogram.
pub const PL_HISTOGRAM_BUCKETS: usize = 8;

/// Average days per month used for the monthly annualization factor.
const DAYS_PER_MONTH: f64 = 30.417;

/// Performance record of one simulated replay. All figures derive from the
/// ledger and the completed transactions; nothing is stored redundantly.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestStatistics {
    pub pl: f64,
    pub pl_percentage: f64,
    pub pl_year: f64,
    pub pl_month: f64,
    pub buy_hold: f64,
    pub buy_hold_difference: f64,
    pub buy_signal_count: usize,
    pub sell_signal_count: usize,
    pub winning_count: usize,
    pub losing_count: usize,
    pub win_rate: f64,
    pub max_pl: f64,
    pub min_pl: f64,
    pub mean_pl: f64,
    pub median_pl: f64,
    pub std_dev_pl: f64,
    pub median_winning_pl: f64,
    pub median_losing_pl: f64,
    pub pl_histogram: Vec<HistogramBucket>,
    pub transactions: Vec<CompleteTransaction>,
}

impl BacktestStatistics {
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }
}

/// Replays a per-date signal stream against a fresh ledger and derives
/// performance statistics. Single pass, ascending dates, trading at close.
pub struct BacktestSimulator<'a> {
    instrument: &'a str,
    series: &'a PriceSeries,
    cooldown_days: i64,
    stats: &'a dyn StatisticsService,
}

impl<'a> BacktestSimulator<'a> {
    pub fn new(
        instrument: &'a str,
        series: &'a PriceSeries,
        cooldown_days: i64,
        stats: &'a dyn StatisticsService,
    ) -> Self {
        Self {
            instrument,
            series,
            cooldown_days,
            stats,
        }
    }

    /// Runs the whole simulation. The ledger is consumed: it belongs to this
    /// one evaluation and must not be reused afterwards.
    pub fn evaluate(
        &self,
        mut ledger: Ledger,
        signals: &BTreeMap<NaiveDate, Signal>,
    ) -> Result<BacktestStatistics, EngineError> {
        if signals.len() != self.series.len() {
            return Err(EngineError::IncompatibleSeries {
                signals: signals.len(),
                quotes: self.series.len(),
            });
        }

        let transactions = self.replay(&mut ledger, signals)?;
        self.derive_statistics(&ledger, signals, transactions)
    }

    fn replay(
        &self,
        ledger: &mut Ledger,
        signals: &BTreeMap<NaiveDate, Signal>,
    ) -> Result<Vec<CompleteTransaction>, EngineError> {
        let fees = ledger.fee_schedule();
        let mut transactions = Vec::new();
        let mut last_sell_date: Option<NaiveDate> = None;

        for quote in self.series.iter() {
            let date = quote.date;
            let signal = *signals
                .get(&date)
                .ok_or(EngineError::IncompatibleSeries {
                    signals: signals.len(),
                    quotes: self.series.len(),
                })?;
            let close = quote.close;

            let cooldown_over = last_sell_date
                .map_or(true, |sold| (date - sold).num_days() >= self.cooldown_days);

            if signal == Signal::Buy && cooldown_over {
                let volume = ledger.max_purchase_volume(self.instrument, date, close);
                if volume > 1 {
                    let trade = Trade {
                        date,
                        side: TradeSide::Buy,
                        instrument: self.instrument.to_string(),
                        shares: volume,
                        price: close,
                    };
                    debug!(
                        "{} {} {} at {:.2} on {}",
                        trade.side.as_str(),
                        trade.shares,
                        trade.instrument,
                        trade.price,
                        trade.date
                    );
                    ledger.record_trade(trade)?;
                }
            }

            if signal == Signal::Sell {
                // holdings() omits flat instruments, so any entry is non-zero
                if let Some(&net) = ledger.holdings(date).get(self.instrument) {
                    self.close_position(
                        ledger,
                        &mut transactions,
                        date,
                        net,
                        close,
                        fees.as_ref(),
                    )?;
                    last_sell_date = Some(date);
                }
            }
        }

        // force-close whatever is still open at the final quote
        if let Some(last) = self.series.last_quote() {
            if let Some(&net) = ledger.holdings(last.date).get(self.instrument) {
                self.close_position(
                    ledger,
                    &mut transactions,
                    last.date,
                    net,
                    last.close,
                    fees.as_ref(),
                )?;
            }
        }

        Ok(transactions)
    }

    /// Flattens a non-zero position: a long is sold off, a short is bought
    /// back.
    fn close_position(
        &self,
        ledger: &mut Ledger,
        transactions: &mut Vec<CompleteTransaction>,
        date: NaiveDate,
        net: i64,
        price: f64,
        fees: &dyn crate::fees::FeeSchedule,
    ) -> Result<(), EngineError> {
        let side = if net > 0 {
            TradeSide::Sell
        } else {
            TradeSide::Buy
        };
        let closing = Trade {
            date,
            side,
            instrument: self.instrument.to_string(),
            shares: net.unsigned_abs() as u32,
            price,
        };
        debug!(
            "{} {} {} at {:.2} on {}",
            closing.side.as_str(),
            closing.shares,
            closing.instrument,
            closing.price,
            closing.date
        );

        // Pairs the closing trade with the most recently recorded one. When
        // several buys accumulated the position this references only the last
        // buy, matching the historical bookkeeping. Intentionally not
        // corrected.
        if let Some(opening) = ledger.last_trade().cloned() {
            let (buy, sell) = match side {
                TradeSide::Sell => (opening, closing.clone()),
                TradeSide::Buy => (closing.clone(), opening),
            };
            let pl = transaction_pl(&buy, &sell, fees);
            transactions.push(CompleteTransaction { buy, sell, pl });
        }

        ledger.record_trade(closing)?;
        Ok(())
    }

    fn derive_statistics(
        &self,
        ledger: &Ledger,
        signals: &BTreeMap<NaiveDate, Signal>,
        transactions: Vec<CompleteTransaction>,
    ) -> Result<BacktestStatistics, EngineError> {
        let (pl, pl_percentage, pl_year, pl_month, buy_hold) = match (
            self.series.first_quote(),
            self.series.last_quote(),
        ) {
            (Some(first), Some(last)) => {
                let begin_closes =
                    HashMap::from([(self.instrument.to_string(), first.close)]);
                let end_closes = HashMap::from([(self.instrument.to_string(), last.close)]);

                let value_begin = ledger.total_value(first.date, &begin_closes)?;
                let value_end = ledger.total_value(last.date, &end_closes)?;
                let pl = value_end - value_begin;

                let pl_percentage = if value_begin != 0.0 {
                    pl / value_begin
                } else {
                    0.0
                };
                let days = (last.date - first.date).num_days() as f64;
                let pl_year = if days > 0.0 { pl * 365.0 / days } else { 0.0 };
                let pl_month = if days > 0.0 {
                    pl * DAYS_PER_MONTH / days
                } else {
                    0.0
                };
                let buy_hold = if first.close != 0.0 {
                    (last.close - first.close) / first.close
                } else {
                    0.0
                };

                (pl, pl_percentage, pl_year, pl_month, buy_hold)
            }
            _ => (0.0, 0.0, 0.0, 0.0, 0.0),
        };

        let buy_hold_difference = if buy_hold != 0.0 {
            pl_percentage / buy_hold
        } else {
            0.0
        };

        let pls: Vec<f64> = transactions.iter().map(|t| t.pl).collect();
        let winning: Vec<f64> = pls.iter().copied().filter(|pl| *pl > 0.0).collect();
        let losing: Vec<f64> = pls.iter().copied().filter(|pl| *pl < 0.0).collect();
        let win_rate = if pls.is_empty() {
            0.0
        } else {
            winning.len() as f64 / pls.len() as f64
        };

        Ok(BacktestStatistics {
            pl,
            pl_percentage,
            pl_year,
            pl_month,
            buy_hold,
            buy_hold_difference,
            buy_signal_count: signals.values().filter(|s| **s == Signal::Buy).count(),
            sell_signal_count: signals.values().filter(|s| **s == Signal::Sell).count(),
            winning_count: winning.len(),
            losing_count: losing.len(),
            win_rate,
            max_pl: pls.iter().copied().reduce(f64::max).unwrap_or(0.0),
            min_pl: pls.iter().copied().reduce(f64::min).unwrap_or(0.0),
            mean_pl: self.stats.mean(&pls),
            median_pl: self.stats.median(&pls),
            std_dev_pl: self.stats.std_dev(&pls),
            median_winning_pl: self.stats.median(&winning),
            median_losing_pl: self.stats.median(&losing),
            pl_histogram: self.stats.bucketize(&pls, PL_HISTOGRAM_BUCKETS),
            transactions,
        })
    }
}
