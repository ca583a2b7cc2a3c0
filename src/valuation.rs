use crate::fees::FeeSchedule;
use crate::models::{Trade, TradeSide};

/// Fees charged for executing `trade` under the given schedule.
pub fn trade_fees(trade: &Trade, fees: &dyn FeeSchedule) -> f64 {
    fees.fee(trade.price * trade.shares as f64)
}

/// Cash-flow value of a trade including fees. A Buy consumes cash (positive
/// total), a Sell releases it (negative total); recording a trade on the
/// ledger always moves cash by `-total_value`.
pub fn trade_total_value(trade: &Trade, fees: &dyn FeeSchedule) -> f64 {
    let sign = match trade.side {
        TradeSide::Sell => -1.0,
        TradeSide::Buy => 1.0,
    };
    sign * trade.shares as f64 * trade.price + trade_fees(trade, fees)
}

/// Realized profit-or-loss of a matched Buy/Sell pair.
pub fn transaction_pl(buy: &Trade, sell: &Trade, fees: &dyn FeeSchedule) -> f64 {
    -(trade_total_value(sell, fees) + trade_total_value(buy, fees))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::{FlatRateFees, ZeroFees};
    use chrono::NaiveDate;

    fn trade(side: TradeSide, shares: u32, price: f64) -> Trade {
        Trade {
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            side,
            instrument: "ACME".to_string(),
            shares,
            price,
        }
    }

    #[test]
    fn buy_total_is_positive_and_sell_total_negative_without_fees() {
        let buy = trade(TradeSide::Buy, 10, 12.0);
        let sell = trade(TradeSide::Sell, 10, 15.0);

        assert_eq!(trade_total_value(&buy, &ZeroFees), 120.0);
        assert_eq!(trade_total_value(&sell, &ZeroFees), -150.0);
    }

    #[test]
    fn transaction_pl_matches_example_scenario() {
        let buy = trade(TradeSide::Buy, 10, 12.0);
        let sell = trade(TradeSide::Sell, 10, 15.0);
        assert_eq!(transaction_pl(&buy, &sell, &ZeroFees), 30.0);
    }

    #[test]
    fn fees_reduce_transaction_pl_on_both_legs() {
        let schedule = FlatRateFees {
            rate: 0.0,
            minimum: 2.0,
        };
        let buy = trade(TradeSide::Buy, 10, 12.0);
        let sell = trade(TradeSide::Sell, 10, 15.0);
        assert_eq!(transaction_pl(&buy, &sell, &schedule), 26.0);
    }
}
