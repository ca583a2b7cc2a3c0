use crate::models::{PriceSeries, Signal, StrategyConfig};
use anyhow::Result;
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// One dated feature vector with its supervised target. The FeatureService
/// must emit exactly one row per quote of the series it was given, in
/// chronological order, or the downstream simulation rejects the run.
#[derive(Debug, Clone)]
pub struct FeatureRow {
    pub date: NaiveDate,
    pub inputs: Vec<f64>,
    pub target: f64,
}

pub type FeatureMatrix = Vec<FeatureRow>;

/// A trained scoring model. Higher scores lean Buy, lower lean Sell.
pub trait Model: Send + Sync {
    fn score(&self, inputs: &[f64]) -> f64;
}

/// External predictor collaborator: fits a model to the training partition.
pub trait Predictor: Send + Sync {
    fn train(&self, training: &[FeatureRow]) -> Result<Box<dyn Model>>;
}

/// External feature computation collaborator (indicators over raw prices).
pub trait FeatureService: Send + Sync {
    fn features(&self, series: &PriceSeries, config: &StrategyConfig) -> Result<FeatureMatrix>;
}

/// Buy at or above the buy threshold, Sell at or below the sell threshold.
pub fn signal_from_score(score: f64, buy_threshold: f64, sell_threshold: f64) -> Signal {
    if score >= buy_threshold {
        Signal::Buy
    } else if score <= sell_threshold {
        Signal::Sell
    } else {
        Signal::Neutral
    }
}

/// Scores every feature row and thresholds the result into a per-date signal
/// stream for the simulator.
pub fn generate_signals(
    model: &dyn Model,
    rows: &[FeatureRow],
    buy_threshold: f64,
    sell_threshold: f64,
) -> BTreeMap<NaiveDate, Signal> {
    rows.iter()
        .map(|row| {
            let score = model.score(&row.inputs);
            (row.date, signal_from_score(score, buy_threshold, sell_threshold))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_partition_the_score_axis() {
        assert_eq!(signal_from_score(0.95, 0.9, -0.7), Signal::Buy);
        assert_eq!(signal_from_score(0.9, 0.9, -0.7), Signal::Buy);
        assert_eq!(signal_from_score(0.0, 0.9, -0.7), Signal::Neutral);
        assert_eq!(signal_from_score(-0.7, 0.9, -0.7), Signal::Sell);
        assert_eq!(signal_from_score(-0.9, 0.9, -0.7), Signal::Sell);
    }

    struct ConstantModel(f64);

    impl Model for ConstantModel {
        fn score(&self, _inputs: &[f64]) -> f64 {
            self.0
        }
    }

    #[test]
    fn generate_signals_covers_every_row() {
        let rows: Vec<FeatureRow> = (1..=5)
            .map(|n| FeatureRow {
                date: NaiveDate::from_ymd_opt(2024, 2, n).unwrap(),
                inputs: vec![0.0],
                target: 0.0,
            })
            .collect();

        let signals = generate_signals(&ConstantModel(1.0), &rows, 0.9, -0.7);
        assert_eq!(signals.len(), 5);
        assert!(signals.values().all(|s| *s == Signal::Buy));
    }
}
