use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Tunables for one evaluation session. Everything that is not data or a
/// collaborator lives here so a session can be reproduced from a settings
/// dump plus a seed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSettings {
    pub instrument: String,
    pub initial_cash: f64,
    /// Fraction of the series used for training, the rest is simulated.
    pub train_percentage: f64,
    /// Number of random candidates to evaluate.
    pub candidate_count: usize,
    /// Random-signal replays used to estimate the retention baseline.
    pub baseline_trials: usize,
    pub baseline_concurrency: usize,
    pub search_concurrency: usize,
    /// Calendar days a sell blocks the next buy.
    pub cooldown_days: i64,
    pub buy_threshold_range: (f64, f64),
    pub sell_threshold_range: (f64, f64),
    /// Fixed seed for reproducible sessions, random when absent.
    pub master_seed: Option<u64>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            instrument: String::new(),
            initial_cash: 100_000.0,
            train_percentage: 0.6,
            candidate_count: 32,
            baseline_trials: 3000,
            baseline_concurrency: 5,
            search_concurrency: 4,
            cooldown_days: 3,
            buy_threshold_range: (0.80, 0.96),
            sell_threshold_range: (-0.85, -0.60),
            master_seed: None,
        }
    }
}

impl SearchSettings {
    pub fn validate(&self) -> Result<()> {
        if self.instrument.trim().is_empty() {
            return Err(anyhow!("Setting instrument must not be empty"));
        }
        if !self.initial_cash.is_finite() || self.initial_cash <= 0.0 {
            return Err(anyhow!(
                "Setting initial_cash must be > 0 (value: {})",
                self.initial_cash
            ));
        }
        if !(0.0 < self.train_percentage && self.train_percentage < 1.0) {
            return Err(anyhow!(
                "Setting train_percentage must be between 0 and 1 exclusive (value: {})",
                self.train_percentage
            ));
        }
        if self.candidate_count == 0 {
            return Err(anyhow!("Setting candidate_count must be >= 1"));
        }
        if self.baseline_trials == 0 {
            return Err(anyhow!("Setting baseline_trials must be >= 1"));
        }
        if self.baseline_concurrency == 0 || self.search_concurrency == 0 {
            return Err(anyhow!(
                "Setting baseline_concurrency and search_concurrency must be >= 1"
            ));
        }
        if self.cooldown_days < 0 {
            return Err(anyhow!(
                "Setting cooldown_days must be >= 0 (value: {})",
                self.cooldown_days
            ));
        }
        validate_range("buy_threshold_range", self.buy_threshold_range)?;
        validate_range("sell_threshold_range", self.sell_threshold_range)?;
        Ok(())
    }
}

fn validate_range(key: &str, (low, high): (f64, f64)) -> Result<()> {
    if !low.is_finite() || !high.is_finite() || low >= high {
        return Err(anyhow!(
            "Setting {} must be a finite (low, high) pair with low < high (value: ({}, {}))",
            key,
            low,
            high
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> SearchSettings {
        SearchSettings {
            instrument: "ACME".to_string(),
            ..SearchSettings::default()
        }
    }

    #[test]
    fn default_settings_validate_once_instrument_is_set() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn rejects_empty_instrument() {
        let settings = SearchSettings::default();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_inverted_threshold_range() {
        let mut settings = valid();
        settings.buy_threshold_range = (0.96, 0.80);
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("buy_threshold_range"));
    }

    #[test]
    fn rejects_out_of_bounds_train_percentage() {
        let mut settings = valid();
        settings.train_percentage = 1.0;
        assert!(settings.validate().is_err());
    }
}
