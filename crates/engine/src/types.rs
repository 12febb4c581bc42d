//! Types for the backtesting engine

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{BacktestError, Result};

/// A single closing price for one trading session
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub close: f64,
}

impl PricePoint {
    pub fn new(date: NaiveDate, close: f64) -> Self {
        Self { date, close }
    }
}

/// Validated, time-ordered closing prices for one symbol.
///
/// Dates are strictly increasing and every close is finite and positive.
/// Once built the series is never mutated; engines share it through an `Arc`.
#[derive(Debug, Clone, Serialize)]
pub struct PriceSeries {
    symbol: String,
    points: Vec<PricePoint>,
}

impl PriceSeries {
    pub fn new(symbol: impl Into<String>, points: Vec<PricePoint>) -> Result<Self> {
        let symbol = symbol.into();

        if points.is_empty() {
            return Err(BacktestError::DataUnavailable {
                symbol,
                reason: "provider returned no price data".to_string(),
            });
        }

        for pair in points.windows(2) {
            if pair[1].date <= pair[0].date {
                return Err(BacktestError::DataUnavailable {
                    symbol,
                    reason: format!(
                        "dates not strictly increasing at {} -> {}",
                        pair[0].date, pair[1].date
                    ),
                });
            }
        }

        if let Some(bad) = points.iter().find(|p| !p.close.is_finite() || p.close <= 0.0) {
            return Err(BacktestError::DataUnavailable {
                symbol,
                reason: format!("invalid close {} on {}", bad.close, bad.date),
            });
        }

        Ok(Self { symbol, points })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn points(&self) -> &[PricePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.points.iter().map(|p| p.date).collect()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.close).collect()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.points.first().map(|p| p.date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.points.last().map(|p| p.date)
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

/// Configuration for a backtest run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub symbol: String,
    /// Short SMA window, in sessions
    pub window_short: usize,
    /// Long SMA window, in sessions
    pub window_long: usize,
    /// First session included
    pub start: NaiveDate,
    /// End of range (exclusive)
    pub end: NaiveDate,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            window_short: 42,
            window_long: 252,
            start: NaiveDate::from_ymd_opt(2020, 1, 1).expect("valid date"),
            end: NaiveDate::from_ymd_opt(2024, 1, 1).expect("valid date"),
        }
    }
}

/// Short/long SMA window lengths. No ordering is enforced between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParameterPair {
    pub window_short: usize,
    pub window_long: usize,
}

impl ParameterPair {
    pub fn new(window_short: usize, window_long: usize) -> Self {
        Self {
            window_short,
            window_long,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_short == 0 {
            return Err(BacktestError::InvalidWindow {
                name: "window_short",
                value: self.window_short,
            });
        }
        if self.window_long == 0 {
            return Err(BacktestError::InvalidWindow {
                name: "window_long",
                value: self.window_long,
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for ParameterPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SMA1={}, SMA2={}", self.window_short, self.window_long)
    }
}

/// Long or short stance for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Long,
    Short,
}

impl Position {
    pub fn sign(self) -> f64 {
        match self {
            Position::Long => 1.0,
            Position::Short => -1.0,
        }
    }
}

/// One retained row of a backtest result table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedRow {
    pub date: NaiveDate,
    pub close: f64,
    pub log_return: f64,
    pub sma1: f64,
    pub sma2: f64,
    pub position: Position,
    pub strategy_return: f64,
    pub cumulative_market_return: f64,
    pub cumulative_strategy_return: f64,
}

/// Date-aligned result table produced by a single strategy run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedSeries {
    pub parameters: ParameterPair,
    pub rows: Vec<DerivedRow>,
}

/// A point on the market vs. strategy growth chart
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub date: NaiveDate,
    pub market: f64,
    pub strategy: f64,
}

impl DerivedSeries {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cumulative market and strategy growth, date-indexed, for plotting.
    pub fn performance_curve(&self) -> Vec<CurvePoint> {
        self.rows
            .iter()
            .map(|r| CurvePoint {
                date: r.date,
                market: r.cumulative_market_return,
                strategy: r.cumulative_strategy_return,
            })
            .collect()
    }
}

/// Final growth figures for one parameter pair, at full precision
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    /// Final cumulative strategy growth factor
    pub absolute_performance: f64,
    /// Strategy growth minus buy-and-hold growth
    pub outperformance: f64,
}

/// Rounded view of a [`BacktestResult`] for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub absolute_performance: Decimal,
    pub outperformance: Decimal,
}

impl BacktestResult {
    pub fn rounded(&self) -> BacktestSummary {
        BacktestSummary {
            absolute_performance: round2(self.absolute_performance),
            outperformance: round2(self.outperformance),
        }
    }
}

fn round2(value: f64) -> Decimal {
    Decimal::from_f64(value)
        .map(|d| d.round_dp(2))
        .unwrap_or(Decimal::ZERO)
}

/// Score recorded for one feasible grid candidate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub parameters: ParameterPair,
    pub absolute_performance: f64,
    pub outperformance: f64,
}

/// Outcome of a grid search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub best: ParameterPair,
    pub best_absolute_performance: f64,
    /// Candidates evaluated, feasible or not
    pub evaluated: usize,
    /// Candidates rejected with insufficient data
    pub infeasible: usize,
    /// Feasible candidates in grid order
    pub candidates: Vec<CandidateScore>,
}

impl OptimizationResult {
    /// Best `n` candidates, highest performance first. Equal scores keep grid order.
    pub fn top(&self, n: usize) -> Vec<CandidateScore> {
        let mut ranked = self.candidates.clone();
        ranked.sort_by(|a, b| {
            b.absolute_performance
                .partial_cmp(&a.absolute_performance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(n);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    #[test]
    fn test_series_rejects_empty() {
        let err = PriceSeries::new("AAPL", vec![]).unwrap_err();
        assert!(matches!(err, BacktestError::DataUnavailable { .. }));
    }

    #[test]
    fn test_series_rejects_unordered_dates() {
        let points = vec![PricePoint::new(date(2), 10.0), PricePoint::new(date(1), 11.0)];
        assert!(matches!(
            PriceSeries::new("AAPL", points),
            Err(BacktestError::DataUnavailable { .. })
        ));

        let dup = vec![PricePoint::new(date(1), 10.0), PricePoint::new(date(1), 11.0)];
        assert!(PriceSeries::new("AAPL", dup).is_err());
    }

    #[test]
    fn test_series_rejects_non_positive_close() {
        let points = vec![PricePoint::new(date(1), 10.0), PricePoint::new(date(2), 0.0)];
        assert!(PriceSeries::new("AAPL", points).is_err());

        let nan = vec![PricePoint::new(date(1), f64::NAN)];
        assert!(PriceSeries::new("AAPL", nan).is_err());
    }

    #[test]
    fn test_parameter_pair_rejects_zero_window() {
        assert!(ParameterPair::new(0, 5).validate().is_err());
        assert!(ParameterPair::new(5, 0).validate().is_err());
        assert!(ParameterPair::new(7, 3).validate().is_ok());
    }

    #[test]
    fn test_result_rounding() {
        let result = BacktestResult {
            absolute_performance: 1.23456,
            outperformance: -0.005001,
        };
        let summary = result.rounded();
        assert_eq!(summary.absolute_performance, dec!(1.23));
        assert_eq!(summary.outperformance, dec!(-0.01));
    }

    #[test]
    fn test_top_keeps_grid_order_on_ties() {
        let score = |s, l, p| CandidateScore {
            parameters: ParameterPair::new(s, l),
            absolute_performance: p,
            outperformance: 0.0,
        };
        let result = OptimizationResult {
            best: ParameterPair::new(2, 5),
            best_absolute_performance: 1.5,
            evaluated: 3,
            infeasible: 0,
            candidates: vec![score(2, 5, 1.5), score(2, 6, 1.1), score(3, 5, 1.5)],
        };
        let top = result.top(2);
        assert_eq!(top[0].parameters, ParameterPair::new(2, 5));
        assert_eq!(top[1].parameters, ParameterPair::new(3, 5));
    }
}
