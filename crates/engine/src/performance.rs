//! Cumulative growth accounting and summary figures

use crate::types::BacktestResult;

/// Continuously compounded growth: `exp` of the running sum of log returns.
pub fn cumulative_growth(returns: &[f64]) -> Vec<f64> {
    returns
        .iter()
        .scan(0.0, |sum, r| {
            *sum += r;
            Some(sum.exp())
        })
        .collect()
}

/// Final strategy growth and its margin over buy-and-hold.
///
/// Returns `None` when either curve is empty.
pub fn summarize(cumulative_market: &[f64], cumulative_strategy: &[f64]) -> Option<BacktestResult> {
    let market = *cumulative_market.last()?;
    let strategy = *cumulative_strategy.last()?;
    Some(BacktestResult {
        absolute_performance: strategy,
        outperformance: strategy - market,
    })
}
