/// Broker fee lookup per instrument/jurisdiction, injected into the ledger.
/// `notional` is signed (negative for short positions being marked to market).
pub trait FeeSchedule: Send + Sync {
    fn fee(&self, notional: f64) -> f64;
}

/// No trading costs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroFees;

impl FeeSchedule for ZeroFees {
    fn fee(&self, _notional: f64) -> f64 {
        0.0
    }
}

/// Proportional fee with a per-trade minimum, the common retail schedule.
#[derive(Debug, Clone, Copy)]
pub struct FlatRateFees {
    pub rate: f64,
    pub minimum: f64,
}

impl FeeSchedule for FlatRateFees {
    fn fee(&self, notional: f64) -> f64 {
        (self.rate * notional.abs()).max(self.minimum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_fees_are_zero() {
        assert_eq!(ZeroFees.fee(12_345.0), 0.0);
    }

    #[test]
    fn flat_rate_applies_minimum_and_ignores_sign() {
        let schedule = FlatRateFees {
            rate: 0.001,
            minimum: 5.0,
        };
        assert_eq!(schedule.fee(1_000.0), 5.0);
        assert_eq!(schedule.fee(100_000.0), 100.0);
        assert_eq!(schedule.fee(-100_000.0), 100.0);
    }
}
