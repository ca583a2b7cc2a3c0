pub mod config;
pub mod error;
pub mod fees;
pub mod ledger;
pub mod models;
pub mod predictor;
pub mod reference;
pub mod search;
pub mod simulator;
pub mod stats;
pub mod valuation;
