//! Dual SMA crossover backtesting engine

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{BacktestError, Result};
use crate::performance::{cumulative_growth, summarize};
use crate::provider::PriceProvider;
use crate::signals::{compute_position, compute_returns, compute_rolling_mean, compute_strategy_return};
use crate::types::*;

/// Backtest over a fixed price history with adjustable SMA windows.
///
/// Prices are fetched once and shared read-only. Only the two SMA columns are
/// recomputed when the windows change; each `run_strategy` call builds a fresh
/// result table and replaces the previous one.
pub struct BacktestEngine {
    config: BacktestConfig,
    prices: Arc<PriceSeries>,
    log_returns: Vec<Option<f64>>,
    sma1: Vec<Option<f64>>,
    sma2: Vec<Option<f64>>,
    results: Option<DerivedSeries>,
}

impl BacktestEngine {
    /// Fetch prices for the configured symbol and date range, then build the engine.
    pub async fn fetch<P: PriceProvider + ?Sized>(
        provider: &P,
        config: BacktestConfig,
    ) -> Result<Self> {
        let prices = provider
            .fetch(&config.symbol, config.start, config.end)
            .await?;
        Self::from_series(config, Arc::new(prices))
    }

    /// Build an engine over an already fetched price series.
    pub fn from_series(config: BacktestConfig, prices: Arc<PriceSeries>) -> Result<Self> {
        ParameterPair::new(config.window_short, config.window_long).validate()?;

        let closes = prices.closes();
        let log_returns = compute_returns(&closes);
        let sma1 = compute_rolling_mean(&closes, config.window_short)?;
        let sma2 = compute_rolling_mean(&closes, config.window_long)?;

        info!(
            symbol = %config.symbol,
            sessions = prices.len(),
            sma1 = config.window_short,
            sma2 = config.window_long,
            "Backtest engine ready"
        );

        Ok(Self {
            config,
            prices,
            log_returns,
            sma1,
            sma2,
            results: None,
        })
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn prices(&self) -> &Arc<PriceSeries> {
        &self.prices
    }

    pub fn parameters(&self) -> ParameterPair {
        ParameterPair::new(self.config.window_short, self.config.window_long)
    }

    /// Change one or both windows and recompute only the affected SMA column.
    ///
    /// On error the engine keeps its previous windows.
    pub fn set_parameters(
        &mut self,
        window_short: Option<usize>,
        window_long: Option<usize>,
    ) -> Result<()> {
        let closes = self.prices.closes();

        let sma1 = window_short
            .map(|w| compute_rolling_mean(&closes, w))
            .transpose()?;
        let sma2 = window_long
            .map(|w| compute_rolling_mean(&closes, w))
            .transpose()?;

        if let (Some(w), Some(col)) = (window_short, sma1) {
            self.config.window_short = w;
            self.sma1 = col;
        }
        if let (Some(w), Some(col)) = (window_long, sma2) {
            self.config.window_long = w;
            self.sma2 = col;
        }

        debug!(
            sma1 = self.config.window_short,
            sma2 = self.config.window_long,
            "Parameters updated"
        );
        Ok(())
    }

    /// Backtest the current windows, store the result table and return the figures.
    pub fn run_strategy(&mut self) -> Result<BacktestResult> {
        let (result, table) = assemble(
            &self.prices,
            &self.log_returns,
            &self.sma1,
            &self.sma2,
            self.parameters(),
        )?;
        self.results = Some(table);
        Ok(result)
    }

    /// Table from the last `run_strategy` call
    pub fn results(&self) -> Result<&DerivedSeries> {
        self.results.as_ref().ok_or(BacktestError::NoResultsYet)
    }

    /// Chart title for plotting the stored results
    pub fn chart_title(&self) -> String {
        format!("{} | {}", self.config.symbol, self.parameters())
    }
}

/// Backtest one window pair over `prices` without any engine state.
///
/// Produces exactly what `BacktestEngine::run_strategy` would for the same windows.
pub fn evaluate(
    prices: &PriceSeries,
    window_short: usize,
    window_long: usize,
) -> Result<(BacktestResult, DerivedSeries)> {
    let parameters = ParameterPair::new(window_short, window_long);
    parameters.validate()?;

    let closes = prices.closes();
    let log_returns = compute_returns(&closes);
    let sma1 = compute_rolling_mean(&closes, window_short)?;
    let sma2 = compute_rolling_mean(&closes, window_long)?;

    assemble(prices, &log_returns, &sma1, &sma2, parameters)
}

/// Drop undefined rows, derive positions and growth, then summarize.
fn assemble(
    prices: &PriceSeries,
    log_returns: &[Option<f64>],
    sma1: &[Option<f64>],
    sma2: &[Option<f64>],
    parameters: ParameterPair,
) -> Result<(BacktestResult, DerivedSeries)> {
    let insufficient = |rows: usize| BacktestError::InsufficientData {
        rows,
        window_short: parameters.window_short,
        window_long: parameters.window_long,
    };

    // Rows where the return and both averages are defined
    let retained: Vec<(usize, f64, f64, f64)> = log_returns
        .iter()
        .zip(sma1)
        .zip(sma2)
        .enumerate()
        .filter_map(|(i, ((r, a), b))| Some((i, (*r)?, (*a)?, (*b)?)))
        .collect();

    if retained.len() < 2 {
        return Err(insufficient(retained.len()));
    }

    let kept_sma1: Vec<Option<f64>> = retained.iter().map(|&(_, _, a, _)| Some(a)).collect();
    let kept_sma2: Vec<Option<f64>> = retained.iter().map(|&(_, _, _, b)| Some(b)).collect();
    let positions: Vec<Position> = compute_position(&kept_sma1, &kept_sma2)
        .into_iter()
        .flatten()
        .collect();
    let kept_returns: Vec<f64> = retained.iter().map(|&(_, r, _, _)| r).collect();

    // First retained row has no lagged position and is dropped
    let strategy_returns: Vec<f64> = compute_strategy_return(&positions, &kept_returns)
        .into_iter()
        .flatten()
        .collect();
    let market_returns = &kept_returns[1..];

    let cumulative_market = cumulative_growth(market_returns);
    let cumulative_strategy = cumulative_growth(&strategy_returns);

    let result = summarize(&cumulative_market, &cumulative_strategy)
        .ok_or_else(|| insufficient(strategy_returns.len()))?;

    let points = prices.points();
    let rows = retained[1..]
        .iter()
        .enumerate()
        .map(|(k, &(i, log_return, a, b))| DerivedRow {
            date: points[i].date,
            close: points[i].close,
            log_return,
            sma1: a,
            sma2: b,
            position: positions[k + 1],
            strategy_return: strategy_returns[k],
            cumulative_market_return: cumulative_market[k],
            cumulative_strategy_return: cumulative_strategy[k],
        })
        .collect();

    debug!(
        sma1 = parameters.window_short,
        sma2 = parameters.window_long,
        rows = strategy_returns.len(),
        absolute = result.absolute_performance,
        outperformance = result.outperformance,
        "Strategy run complete"
    );

    Ok((result, DerivedSeries { parameters, rows }))
}
