//! Price data providers
//!
//! A provider turns `(symbol, start, end)` into a validated [`PriceSeries`].
//! The range is half-open: `start` is included, `end` is not.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::debug;

use crate::error::{BacktestError, Result};
use crate::types::{PricePoint, PriceSeries};

#[async_trait]
pub trait PriceProvider: Send + Sync {
    async fn fetch(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<PriceSeries>;
}

/// Provider backed by price points held in memory (tests, offline JSON files)
#[derive(Debug, Clone, Default)]
pub struct InMemoryProvider {
    series: HashMap<String, Vec<PricePoint>>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(mut self, symbol: impl Into<String>, points: Vec<PricePoint>) -> Self {
        self.insert(symbol, points);
        self
    }

    pub fn insert(&mut self, symbol: impl Into<String>, mut points: Vec<PricePoint>) {
        points.sort_by_key(|p| p.date);
        self.series.insert(symbol.into(), points);
    }

    /// Load a JSON array of `{ "date": "YYYY-MM-DD", "close": f64 }` for one symbol.
    pub fn from_json_file(symbol: impl Into<String>, path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let points: Vec<PricePoint> = serde_json::from_str(&raw)?;
        debug!(path = %path.display(), count = points.len(), "Loaded price file");
        Ok(Self::new().with_series(symbol, points))
    }
}

#[async_trait]
impl PriceProvider for InMemoryProvider {
    async fn fetch(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<PriceSeries> {
        check_range(symbol, start, end)?;

        let points = self
            .series
            .get(symbol)
            .ok_or_else(|| BacktestError::DataUnavailable {
                symbol: symbol.to_string(),
                reason: "unknown symbol".to_string(),
            })?;

        let in_range: Vec<PricePoint> = points
            .iter()
            .filter(|p| p.date >= start && p.date < end)
            .copied()
            .collect();

        PriceSeries::new(symbol, in_range)
    }
}

/// Reject empty or inverted date ranges before touching any data source.
pub(crate) fn check_range(symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<()> {
    if start >= end {
        return Err(BacktestError::DataUnavailable {
            symbol: symbol.to_string(),
            reason: format!("invalid date range {} .. {}", start, end),
        });
    }
    Ok(())
}
