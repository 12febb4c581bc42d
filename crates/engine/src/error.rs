//! Error taxonomy for backtests and parameter searches

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BacktestError {
    /// Provider returned nothing usable for the symbol/date range
    #[error("No price data for {symbol}: {reason}")]
    DataUnavailable { symbol: String, reason: String },

    /// Too few sessions left once warm-up rows are dropped
    #[error("Insufficient data: {rows} usable rows for SMA1={window_short}, SMA2={window_long} (need at least 2)")]
    InsufficientData {
        rows: usize,
        window_short: usize,
        window_long: usize,
    },

    #[error("No results yet: run the strategy first")]
    NoResultsYet,

    #[error("No feasible parameters: all {evaluated} candidates lacked sufficient data")]
    NoFeasibleParameters { evaluated: usize },

    #[error("Invalid window {name}={value}: must be a positive integer")]
    InvalidWindow { name: &'static str, value: usize },

    #[error("Invalid range (start={start}, stop={stop}, step={step})")]
    InvalidRange {
        start: usize,
        stop: usize,
        step: usize,
    },

    #[error("Optimization cancelled after {completed} candidates")]
    Cancelled { completed: usize },
}

impl BacktestError {
    /// Whether the caller can recover by trying other parameters.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BacktestError::InsufficientData { .. })
    }
}

pub type Result<T> = std::result::Result<T, BacktestError>;
