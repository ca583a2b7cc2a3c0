use serde::Serialize;
use statrs::statistics::Statistics;
use std::cmp::Ordering;

/// Descriptive statistics collaborator used by the simulator and the search
/// session. Non-finite inputs are ignored; empty inputs yield 0.
pub trait StatisticsService: Send + Sync {
    fn mean(&self, values: &[f64]) -> f64;
    fn median(&self, values: &[f64]) -> f64;
    fn std_dev(&self, values: &[f64]) -> f64;
    fn bucketize(&self, values: &[f64], buckets: usize) -> Vec<HistogramBucket>;
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramBucket {
    pub label: String,
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
}

/// statrs-backed implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptiveStatistics;

fn finite(values: &[f64]) -> Vec<f64> {
    values.iter().copied().filter(|v| v.is_finite()).collect()
}

impl StatisticsService for DescriptiveStatistics {
    fn mean(&self, values: &[f64]) -> f64 {
        let filtered = finite(values);
        if filtered.is_empty() {
            return 0.0;
        }
        filtered.mean()
    }

    fn median(&self, values: &[f64]) -> f64 {
        let mut filtered = finite(values);
        if filtered.is_empty() {
            return 0.0;
        }
        filtered.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        let mid = filtered.len() / 2;
        if filtered.len() % 2 == 0 {
            (filtered[mid - 1] + filtered[mid]) / 2.0
        } else {
            filtered[mid]
        }
    }

    fn std_dev(&self, values: &[f64]) -> f64 {
        let filtered = finite(values);
        if filtered.len() < 2 {
            return 0.0;
        }
        filtered.std_dev()
    }

    fn bucketize(&self, values: &[f64], buckets: usize) -> Vec<HistogramBucket> {
        let filtered = finite(values);
        if filtered.is_empty() || buckets == 0 {
            return Vec::new();
        }

        let min = filtered.iter().copied().fold(f64::INFINITY, f64::min);
        let max = filtered.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let width = if max > min {
            (max - min) / buckets as f64
        } else {
            1.0
        };

        let mut result: Vec<HistogramBucket> = (0..buckets)
            .map(|i| {
                let lower = min + i as f64 * width;
                let upper = lower + width;
                HistogramBucket {
                    label: format!("{:.2} to {:.2}", lower, upper),
                    lower,
                    upper,
                    count: 0,
                }
            })
            .collect();

        for value in filtered {
            let index = (((value - min) / width) as usize).min(buckets - 1);
            result[index].count += 1;
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATS: DescriptiveStatistics = DescriptiveStatistics;

    #[test]
    fn mean_ignores_non_finite_and_defaults_to_zero() {
        assert_eq!(STATS.mean(&[]), 0.0);
        assert_eq!(STATS.mean(&[1.0, 2.0, 3.0]), 2.0);
        assert_eq!(STATS.mean(&[1.0, f64::NAN, 3.0]), 2.0);
    }

    #[test]
    fn median_handles_even_and_odd_lengths() {
        assert_eq!(STATS.median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(STATS.median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
        assert_eq!(STATS.median(&[]), 0.0);
    }

    #[test]
    fn std_dev_is_zero_for_degenerate_inputs() {
        assert_eq!(STATS.std_dev(&[]), 0.0);
        assert_eq!(STATS.std_dev(&[5.0]), 0.0);
        // sample standard deviation of {2, 4, 4, 4, 5, 5, 7, 9}
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((STATS.std_dev(&values) - 2.138089935).abs() < 1e-6);
    }

    #[test]
    fn bucketize_assigns_every_value_once() {
        let values = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        let histogram = STATS.bucketize(&values, 4);

        assert_eq!(histogram.len(), 4);
        assert_eq!(histogram.iter().map(|b| b.count).sum::<usize>(), values.len());
        assert_eq!(histogram[0].count, 2);
        // the maximum lands in the last bucket, not one past it
        assert_eq!(histogram[3].count, 2);
    }

    #[test]
    fn bucketize_of_constant_values_uses_single_width() {
        let histogram = STATS.bucketize(&[5.0, 5.0, 5.0], 8);
        assert_eq!(histogram.len(), 8);
        assert_eq!(histogram[0].count, 3);
    }

    #[test]
    fn bucketize_of_empty_input_is_empty() {
        assert!(STATS.bucketize(&[], 8).is_empty());
        assert!(STATS.bucketize(&[1.0], 0).is_empty());
    }
}
