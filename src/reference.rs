//! Built-in feature and predictor implementations. They keep the engine
//! runnable end to end without an external model service; callers with a
//! real predictor plug it in through the `Predictor` trait instead.

use crate::models::{PriceSeries, StrategyConfig};
use crate::predictor::{FeatureMatrix, FeatureRow, FeatureService, Model, Predictor};
use anyhow::{anyhow, Result};

pub fn calculate_sma(prices: &[f64], period: usize) -> Vec<f64> {
    if prices.is_empty() {
        return Vec::new();
    }
    if period <= 1 || prices.len() < period {
        return prices.to_vec();
    }

    let mut sma_values = Vec::with_capacity(prices.len());
    for _ in 0..period - 1 {
        sma_values.push(prices[0]);
    }

    let mut window_sum: f64 = prices[..period].iter().sum();
    sma_values.push(window_sum / period as f64);
    for i in period..prices.len() {
        window_sum += prices[i] - prices[i - period];
        sma_values.push(window_sum / period as f64);
    }

    sma_values
}

/// Wilder-smoothed RSI, 50 during warmup.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Vec<f64> {
    let mut rsi_values = vec![50.0; prices.len()];
    if period == 0 || prices.len() <= period {
        return rsi_values;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let change = prices[i] - prices[i - 1];
        if change > 0.0 {
            avg_gain += change;
        } else {
            avg_loss -= change;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    for i in period..prices.len() {
        if i > period {
            let change = prices[i] - prices[i - 1];
            let gain = change.max(0.0);
            let loss = (-change).max(0.0);
            avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
            avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        }
        rsi_values[i] = if avg_loss == 0.0 {
            100.0
        } else {
            100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
        };
    }

    rsi_values
}

/// Price features per quote: one-day return, close relative to the fast and
/// slow moving averages, and RSI rescaled to [-1, 1]. The target is +1 when
/// the forward percentage change clears the configured high mark, -1 when it
/// falls through the low mark, 0 otherwise. The last `fwd_days` rows have no
/// forward window and keep a zero target.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReturnFeatures;

impl FeatureService for ReturnFeatures {
    fn features(&self, series: &PriceSeries, config: &StrategyConfig) -> Result<FeatureMatrix> {
        if series.is_empty() {
            return Err(anyhow!("Cannot compute features for an empty series"));
        }

        let closes: Vec<f64> = series.iter().map(|q| q.close).collect();
        let sma_fast = calculate_sma(&closes, config.ma_fast as usize);
        let sma_slow = calculate_sma(&closes, config.ma_slow as usize);
        let rsi = calculate_rsi(&closes, config.rsi as usize);
        let fwd = config.fwd_days as usize;

        let rows = series
            .iter()
            .enumerate()
            .map(|(i, quote)| {
                let day_return = if i > 0 && closes[i - 1] != 0.0 {
                    closes[i] / closes[i - 1] - 1.0
                } else {
                    0.0
                };
                let vs_fast = if sma_fast[i] != 0.0 {
                    closes[i] / sma_fast[i] - 1.0
                } else {
                    0.0
                };
                let vs_slow = if sma_slow[i] != 0.0 {
                    closes[i] / sma_slow[i] - 1.0
                } else {
                    0.0
                };
                let rsi_scaled = rsi[i] / 50.0 - 1.0;

                let target = match closes.get(i + fwd) {
                    Some(future) if closes[i] != 0.0 => {
                        let change = (future - closes[i]) / closes[i] * 100.0;
                        if change >= config.pct_change_high {
                            1.0
                        } else if change <= config.pct_change_low {
                            -1.0
                        } else {
                            0.0
                        }
                    }
                    _ => 0.0,
                };

                FeatureRow {
                    date: quote.date,
                    inputs: vec![day_return, vs_fast, vs_slow, rsi_scaled],
                    target,
                }
            })
            .collect();

        Ok(rows)
    }
}

/// Linear model squashed through tanh so scores land in (-1, 1), the range
/// the buy and sell thresholds are drawn from.
#[derive(Debug, Clone)]
pub struct LinearModel {
    weights: Vec<f64>,
    bias: f64,
}

impl Model for LinearModel {
    fn score(&self, inputs: &[f64]) -> f64 {
        let raw: f64 = self
            .weights
            .iter()
            .zip(inputs)
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.bias;
        raw.tanh()
    }
}

/// Gradient-descent trainer for `LinearModel`. Fixed epochs and learning
/// rate, zero initialization, so training is fully deterministic.
#[derive(Debug, Clone, Copy)]
pub struct LinearPredictor {
    pub epochs: usize,
    pub learning_rate: f64,
}

impl Default for LinearPredictor {
    fn default() -> Self {
        Self {
            epochs: 200,
            learning_rate: 0.05,
        }
    }
}

impl Predictor for LinearPredictor {
    fn train(&self, training: &[FeatureRow]) -> Result<Box<dyn Model>> {
        let width = training
            .first()
            .map(|row| row.inputs.len())
            .ok_or_else(|| anyhow!("Cannot train on an empty feature matrix"))?;
        if training.iter().any(|row| row.inputs.len() != width) {
            return Err(anyhow!("Feature rows have inconsistent widths"));
        }

        let mut weights = vec![0.0; width];
        let mut bias = 0.0;
        let n = training.len() as f64;

        for _ in 0..self.epochs {
            let mut grad_w = vec![0.0; width];
            let mut grad_b = 0.0;
            for row in training {
                let raw: f64 = weights
                    .iter()
                    .zip(&row.inputs)
                    .map(|(w, x)| w * x)
                    .sum::<f64>()
                    + bias;
                let predicted = raw.tanh();
                let error = predicted - row.target;
                let slope = error * (1.0 - predicted * predicted);
                for (g, x) in grad_w.iter_mut().zip(&row.inputs) {
                    *g += slope * x;
                }
                grad_b += slope;
            }
            for (w, g) in weights.iter_mut().zip(&grad_w) {
                *w -= self.learning_rate * g / n;
            }
            bias -= self.learning_rate * grad_b / n;
        }

        Ok(Box::new(LinearModel { weights, bias }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Quote;
    use chrono::NaiveDate;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn series(closes: &[f64]) -> PriceSeries {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        PriceSeries::from_quotes(closes.iter().enumerate().map(|(i, close)| Quote {
            date: start + chrono::Duration::days(i as i64),
            open: *close,
            high: *close,
            low: *close,
            close: *close,
            volume: 1000.0,
        }))
    }

    #[test]
    fn sma_uses_first_price_during_warmup() {
        let sma = calculate_sma(&[10.0, 20.0, 30.0, 40.0], 2);
        assert_eq!(sma, vec![10.0, 15.0, 25.0, 35.0]);
    }

    #[test]
    fn rsi_is_pinned_high_on_a_pure_uptrend() {
        let prices: Vec<f64> = (1..=20).map(|i| i as f64).collect();
        let rsi = calculate_rsi(&prices, 5);
        assert_eq!(rsi[0], 50.0);
        assert_eq!(rsi[19], 100.0);
    }

    #[test]
    fn features_produce_one_row_per_quote() {
        let prices = series(&[10.0, 10.5, 11.0, 10.8, 11.2, 11.5, 11.3, 11.9]);
        let mut rng = StdRng::seed_from_u64(1);
        let config = StrategyConfig::random(&mut rng);
        let rows = ReturnFeatures.features(&prices, &config).unwrap();
        assert_eq!(rows.len(), prices.len());
        assert!(rows.iter().all(|row| row.inputs.len() == 4));
    }

    #[test]
    fn forward_target_marks_large_moves() {
        let prices = series(&[100.0, 100.0, 110.0, 90.0]);
        let config = StrategyConfig {
            fwd_days: 1,
            pct_change_high: 1.0,
            pct_change_low: -1.0,
            ..StrategyConfig::random(&mut StdRng::seed_from_u64(1))
        };
        let rows = ReturnFeatures.features(&prices, &config).unwrap();
        assert_eq!(rows[1].target, 1.0); // 100 -> 110 is +10%
        assert_eq!(rows[2].target, -1.0); // 110 -> 90 is -18%
        assert_eq!(rows[3].target, 0.0); // no forward window
    }

    #[test]
    fn predictor_learns_a_linearly_separable_target() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let rows: Vec<FeatureRow> = (0..40)
            .map(|i| {
                let x = if i % 2 == 0 { 1.0 } else { -1.0 };
                FeatureRow {
                    date,
                    inputs: vec![x],
                    target: x,
                }
            })
            .collect();
        let model = LinearPredictor::default().train(&rows).unwrap();
        assert!(model.score(&[1.0]) > 0.5);
        assert!(model.score(&[-1.0]) < -0.5);
    }

    #[test]
    fn training_rejects_empty_input() {
        assert!(LinearPredictor::default().train(&[]).is_err());
    }
}
