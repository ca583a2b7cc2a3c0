use crate::error::EngineError;
use crate::fees::FeeSchedule;
use crate::models::{CashEntry, Trade, TradeSide};
use crate::valuation::trade_total_value;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;

/// Cash and trade bookkeeping for one account. Entries are append-only and
/// the balance for any date must never go negative; every mutation checks the
/// invariant for its own date before applying (no partial state on failure).
///
/// A Ledger lives for one simulation; never share one across workers, take a
/// `snapshot_reset()` per evaluation instead.
#[derive(Clone)]
pub struct Ledger {
    cash_entries: Vec<CashEntry>,
    trades: Vec<Trade>,
    fees: Arc<dyn FeeSchedule>,
}

impl Ledger {
    pub fn new(fees: Arc<dyn FeeSchedule>) -> Self {
        Self {
            cash_entries: Vec::new(),
            trades: Vec::new(),
            fees,
        }
    }

    pub fn with_opening_deposit(
        date: NaiveDate,
        amount: f64,
        fees: Arc<dyn FeeSchedule>,
    ) -> Result<Self, EngineError> {
        let mut ledger = Self::new(fees);
        ledger.deposit(date, amount)?;
        Ok(ledger)
    }

    pub fn fee_schedule(&self) -> Arc<dyn FeeSchedule> {
        Arc::clone(&self.fees)
    }

    /// Sum of all cash entries dated on or before `date`, in any insertion
    /// order. Linear in the number of entries up to `date`.
    pub fn balance(&self, date: NaiveDate) -> f64 {
        self.cash_entries
            .iter()
            .filter(|entry| entry.date <= date)
            .map(|entry| entry.amount)
            .sum()
    }

    pub fn deposit(&mut self, date: NaiveDate, amount: f64) -> Result<(), EngineError> {
        let balance = self.balance(date);
        if balance + amount < 0.0 {
            return Err(EngineError::InsufficientFunds {
                date,
                balance,
                required: -amount,
            });
        }
        self.cash_entries.push(CashEntry { date, amount });
        Ok(())
    }

    /// Appends the trade and its cash impact as one atomic step; a failed
    /// funds check leaves neither entry behind.
    pub fn record_trade(&mut self, trade: Trade) -> Result<(), EngineError> {
        let total_value = trade_total_value(&trade, self.fees.as_ref());
        let balance = self.balance(trade.date);
        if balance - total_value < 0.0 {
            return Err(EngineError::InsufficientFunds {
                date: trade.date,
                balance,
                required: total_value,
            });
        }
        self.cash_entries.push(CashEntry {
            date: trade.date,
            amount: -total_value,
        });
        self.trades.push(trade);
        Ok(())
    }

    /// Net share count per instrument over all trades dated on or before
    /// `date` (Buy positive, Sell negative); flat instruments are omitted.
    pub fn holdings(&self, date: NaiveDate) -> HashMap<String, i64> {
        let mut totals: HashMap<String, i64> = HashMap::new();
        for trade in self.trades.iter().filter(|t| t.date <= date) {
            let signed = match trade.side {
                TradeSide::Buy => trade.shares as i64,
                TradeSide::Sell => -(trade.shares as i64),
            };
            *totals.entry(trade.instrument.clone()).or_insert(0) += signed;
        }
        totals.retain(|_, net| *net != 0);
        totals
    }

    /// Largest share count whose hypothetical Buy at `price` fits the balance
    /// at `date`. Fees need not be monotonic in notional (tiered minimums),
    /// so this walks down from `floor(balance / price)` instead of bisecting.
    pub fn max_purchase_volume(&self, instrument: &str, date: NaiveDate, price: f64) -> u32 {
        if price <= 0.0 {
            return 0;
        }
        let cash = self.balance(date);
        if cash <= 0.0 {
            return 0;
        }

        let mut volume = (cash / price).floor() as i64;
        while volume > 0 {
            let probe = Trade {
                date,
                side: TradeSide::Buy,
                instrument: instrument.to_string(),
                shares: volume as u32,
                price,
            };
            if trade_total_value(&probe, self.fees.as_ref()) <= cash {
                break;
            }
            volume -= 1;
        }

        volume.max(0) as u32
    }

    /// Mark-to-market cash-equivalent value of the whole account: balance
    /// plus the liquidation value of every open position at the supplied
    /// closing prices (net of the fees a closing trade would incur).
    pub fn total_value(
        &self,
        date: NaiveDate,
        closes: &HashMap<String, f64>,
    ) -> Result<f64, EngineError> {
        let mut value = self.balance(date);
        for (instrument, net) in self.holdings(date) {
            let close = closes
                .get(&instrument)
                .copied()
                .ok_or_else(|| EngineError::MissingQuote {
                    instrument: instrument.clone(),
                    date,
                })?;
            let notional = net as f64 * close;
            value += notional - self.fees.fee(notional);
        }
        Ok(value)
    }

    /// Fresh ledger seeded with only the original opening deposit; trades and
    /// later deposits are discarded. Used to re-run a simulation from the
    /// same starting capital without cross-contamination between evaluations.
    pub fn snapshot_reset(&self) -> Ledger {
        let mut ledger = Ledger::new(Arc::clone(&self.fees));
        if let Some(opening) = self.cash_entries.iter().min_by_key(|entry| entry.date) {
            ledger.cash_entries.push(*opening);
        }
        ledger
    }

    pub fn cash_entries(&self) -> &[CashEntry] {
        &self.cash_entries
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn last_trade(&self) -> Option<&Trade> {
        self.trades.last()
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("cash_entries", &self.cash_entries)
            .field("trades", &self.trades)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::{FlatRateFees, ZeroFees};
    use proptest::prelude::*;

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(n as i64)
    }

    fn ledger_with_cash(amount: f64) -> Ledger {
        Ledger::with_opening_deposit(day(0), amount, Arc::new(ZeroFees)).unwrap()
    }

    fn buy(n: u32, shares: u32, price: f64) -> Trade {
        Trade {
            date: day(n),
            side: TradeSide::Buy,
            instrument: "ACME".to_string(),
            shares,
            price,
        }
    }

    fn sell(n: u32, shares: u32, price: f64) -> Trade {
        Trade {
            date: day(n),
            side: TradeSide::Sell,
            instrument: "ACME".to_string(),
            shares,
            price,
        }
    }

    #[test]
    fn balance_covers_all_entries_up_to_date() {
        let mut ledger = ledger_with_cash(1000.0);
        ledger.deposit(day(2), 50.0).unwrap();
        ledger.deposit(day(2), -20.0).unwrap();

        assert_eq!(ledger.balance(day(1)), 1000.0);
        assert_eq!(ledger.balance(day(2)), 1030.0);
        assert_eq!(ledger.balance(day(9)), 1030.0);
    }

    #[test]
    fn example_scenario_buy_then_sell() {
        let mut ledger = ledger_with_cash(1000.0);

        ledger.record_trade(buy(1, 10, 12.0)).unwrap();
        assert_eq!(ledger.balance(day(1)), 880.0);

        ledger.record_trade(sell(5, 10, 15.0)).unwrap();
        assert_eq!(ledger.balance(day(5)), 1030.0);
    }

    #[test]
    fn deposit_rejects_overdraft() {
        let mut ledger = ledger_with_cash(100.0);
        let err = ledger.deposit(day(1), -150.0).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
        assert_eq!(ledger.cash_entries().len(), 1);
    }

    #[test]
    fn record_trade_is_atomic_on_failure() {
        let mut ledger = ledger_with_cash(100.0);
        let err = ledger.record_trade(buy(1, 20, 10.0)).unwrap_err();

        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
        assert_eq!(ledger.cash_entries().len(), 1);
        assert_eq!(ledger.trades().len(), 0);
    }

    #[test]
    fn holdings_nets_out_buys_and_sells() {
        let mut ledger = ledger_with_cash(1000.0);
        ledger.record_trade(buy(1, 10, 10.0)).unwrap();
        assert_eq!(ledger.holdings(day(1)).get("ACME"), Some(&10));

        ledger.record_trade(sell(2, 10, 10.0)).unwrap();
        assert!(ledger.holdings(day(2)).is_empty());
    }

    #[test]
    fn short_sale_shows_negative_holding() {
        let mut ledger = ledger_with_cash(0.0);
        ledger.record_trade(sell(1, 10, 10.0)).unwrap();
        assert_eq!(ledger.holdings(day(1)).get("ACME"), Some(&-10));
    }

    #[test]
    fn max_purchase_volume_uses_whole_balance_without_fees() {
        let ledger = ledger_with_cash(1000.0);
        assert_eq!(ledger.max_purchase_volume("ACME", day(0), 12.0), 83);
        assert_eq!(ledger.max_purchase_volume("ACME", day(0), 0.0), 0);
    }

    #[test]
    fn max_purchase_volume_steps_down_for_fees() {
        let fees = Arc::new(FlatRateFees {
            rate: 0.0,
            minimum: 25.0,
        });
        let ledger = Ledger::with_opening_deposit(day(0), 1000.0, fees).unwrap();
        // 97 * 10 + 25 = 995 fits; 98 * 10 + 25 = 1005 does not.
        assert_eq!(ledger.max_purchase_volume("ACME", day(0), 10.0), 97);
    }

    #[test]
    fn total_value_marks_open_position_to_market() {
        let mut ledger = ledger_with_cash(1000.0);
        ledger.record_trade(buy(1, 10, 12.0)).unwrap();

        let closes = HashMap::from([("ACME".to_string(), 15.0)]);
        assert_eq!(ledger.total_value(day(1), &closes).unwrap(), 1030.0);

        let err = ledger.total_value(day(1), &HashMap::new()).unwrap_err();
        assert!(matches!(err, EngineError::MissingQuote { .. }));
    }

    #[test]
    fn snapshot_reset_keeps_only_the_opening_deposit() {
        let mut ledger = ledger_with_cash(1000.0);
        ledger.deposit(day(3), 500.0).unwrap();
        ledger.record_trade(buy(4, 10, 12.0)).unwrap();

        let fresh = ledger.snapshot_reset();
        assert_eq!(fresh.cash_entries().len(), 1);
        assert_eq!(fresh.trades().len(), 0);
        assert_eq!(fresh.balance(day(9)), 1000.0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Deposit { day_offset: u32, amount: f64 },
        Buy { day_offset: u32, shares: u32, price: f64 },
        Sell { day_offset: u32, shares: u32, price: f64 },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..30, -500.0f64..500.0).prop_map(|(day_offset, amount)| Op::Deposit {
                day_offset,
                amount
            }),
            (0u32..30, 1u32..50, 1.0f64..50.0).prop_map(|(day_offset, shares, price)| Op::Buy {
                day_offset,
                shares,
                price
            }),
            (0u32..30, 1u32..50, 1.0f64..50.0).prop_map(|(day_offset, shares, price)| Op::Sell {
                day_offset,
                shares,
                price
            }),
        ]
    }

    proptest! {
        /// Replaying any chronological operation sequence, rejecting those
        /// the ledger refuses, never leaves a date with a negative balance.
        /// The funds check guards the mutation's own date, so the guarantee
        /// holds for non-decreasing dates, which is how simulations apply it.
        #[test]
        fn balance_never_negative(mut ops in prop::collection::vec(op_strategy(), 1..40)) {
            ops.sort_by_key(|op| match *op {
                Op::Deposit { day_offset, .. }
                | Op::Buy { day_offset, .. }
                | Op::Sell { day_offset, .. } => day_offset,
            });
            let mut ledger = ledger_with_cash(1000.0);

            for op in &ops {
                let cash_before = ledger.cash_entries().len();
                let trades_before = ledger.trades().len();
                let result = match *op {
                    Op::Deposit { day_offset, amount } => ledger.deposit(day(day_offset), amount),
                    Op::Buy { day_offset, shares, price } => ledger.record_trade(buy(day_offset, shares, price)),
                    Op::Sell { day_offset, shares, price } => ledger.record_trade(sell(day_offset, shares, price)),
                };
                // a rejected operation must leave no partial entry
                if result.is_err() {
                    prop_assert_eq!(ledger.cash_entries().len(), cash_before);
                    prop_assert_eq!(ledger.trades().len(), trades_before);
                }
            }

            for offset in 0..31 {
                prop_assert!(ledger.balance(day(offset)) >= 0.0);
            }
        }

        /// Larger prices can never allow more shares for the same cash.
        #[test]
        fn max_purchase_volume_non_increasing_in_price(
            cash in 100.0f64..10_000.0,
            lo in 1.0f64..100.0,
            step in 0.1f64..50.0,
        ) {
            let ledger = ledger_with_cash(cash);
            let hi = lo + step;
            let at_lo = ledger.max_purchase_volume("ACME", day(0), lo);
            let at_hi = ledger.max_purchase_volume("ACME", day(0), hi);
            prop_assert!(at_hi <= at_lo);
        }
    }
}
