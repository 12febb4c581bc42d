//! Signal generation for the dual SMA crossover
//!
//! Every function returns a column aligned to the input price index. Rows that
//! cannot be computed yet (first return, SMA warm-up) are `None`.

use crate::error::{BacktestError, Result};
use crate::types::Position;

/// Natural log return `ln(p[t] / p[t-1])`. The first row has no return.
pub fn compute_returns(prices: &[f64]) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(prices.len());
    if prices.is_empty() {
        return out;
    }
    out.push(None);
    out.extend(prices.windows(2).map(|w| Some((w[1] / w[0]).ln())));
    out
}

/// Trailing arithmetic mean over `window` closes, including the current one.
///
/// Rows with fewer than `window` observations are `None`. Each mean is summed
/// from its own window so error never carries over between rows, and a window
/// of identical closes yields that close exactly.
pub fn compute_rolling_mean(prices: &[f64], window: usize) -> Result<Vec<Option<f64>>> {
    if window == 0 {
        return Err(BacktestError::InvalidWindow {
            name: "window",
            value: window,
        });
    }

    // Length of the run of identical closes ending at the current row
    let mut run = 0usize;
    Ok(prices
        .iter()
        .enumerate()
        .map(|(i, &price)| {
            run = if i > 0 && prices[i - 1] == price { run + 1 } else { 1 };
            if i + 1 < window {
                return None;
            }
            if run >= window {
                return Some(price);
            }
            let sum: f64 = prices[i + 1 - window..=i].iter().sum();
            Some(sum / window as f64)
        })
        .collect())
}

/// Long when `sma1 > sma2`, short otherwise. Equal averages are short.
pub fn compute_position(sma1: &[Option<f64>], sma2: &[Option<f64>]) -> Vec<Option<Position>> {
    sma1.iter()
        .zip(sma2)
        .map(|(a, b)| match (a, b) {
            (Some(a), Some(b)) if a > b => Some(Position::Long),
            (Some(_), Some(_)) => Some(Position::Short),
            _ => None,
        })
        .collect()
}

/// Previous row's position applied to the current row's log return.
///
/// A signal formed at the close of day t earns the return from t to t+1, so
/// the first row has no strategy return.
pub fn compute_strategy_return(position: &[Position], log_return: &[f64]) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(log_return.len());
    if log_return.is_empty() {
        return out;
    }
    out.push(None);
    out.extend(
        position
            .iter()
            .zip(log_return.iter().skip(1))
            .map(|(pos, ret)| Some(pos.sign() * ret)),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_returns_first_row_undefined() {
        let r = compute_returns(&[100.0, 110.0, 99.0]);
        assert_eq!(r.len(), 3);
        assert!(r[0].is_none());
        assert!(approx(r[1].unwrap(), (1.1f64).ln()));
        assert!(approx(r[2].unwrap(), (99.0f64 / 110.0).ln()));
    }

    #[test]
    fn test_returns_empty_and_single() {
        assert!(compute_returns(&[]).is_empty());
        assert_eq!(compute_returns(&[5.0]), vec![None]);
    }

    #[test]
    fn test_rolling_mean_warm_up() {
        let sma = compute_rolling_mean(&[1.0, 2.0, 3.0, 4.0, 5.0], 3).unwrap();
        assert_eq!(sma, vec![None, None, Some(2.0), Some(3.0), Some(4.0)]);
    }

    #[test]
    fn test_rolling_mean_window_one_is_price() {
        let prices = [3.0, 7.0, 11.0];
        let sma = compute_rolling_mean(&prices, 1).unwrap();
        assert_eq!(sma, vec![Some(3.0), Some(7.0), Some(11.0)]);
    }

    #[test]
    fn test_rolling_mean_window_longer_than_series() {
        let sma = compute_rolling_mean(&[1.0, 2.0], 5).unwrap();
        assert!(sma.iter().all(Option::is_none));
    }

    #[test]
    fn test_rolling_mean_rejects_zero_window() {
        assert!(matches!(
            compute_rolling_mean(&[1.0, 2.0], 0),
            Err(BacktestError::InvalidWindow { value: 0, .. })
        ));
    }

    #[test]
    fn test_flat_windows_tie_exactly() {
        let mut prices = vec![97.3, 104.9, 88.15, 131.7, 99.99, 101.01, 120.4];
        prices.extend(std::iter::repeat(100.1).take(12));
        prices.push(150.0);

        let short = compute_rolling_mean(&prices, 3).unwrap();
        let long = compute_rolling_mean(&prices, 7).unwrap();
        let pos = compute_position(&short, &long);

        // rows 13..=18 have seven flat closes behind them
        for i in 13..19 {
            assert_eq!(short[i], Some(100.1));
            assert_eq!(long[i], Some(100.1));
            assert_eq!(pos[i], Some(Position::Short));
        }
        assert_eq!(pos[19], Some(Position::Long));
    }

    #[test]
    fn test_rolling_mean_does_not_drift() {
        let prices: Vec<f64> = (0..5000).map(|i| 0.1 + (i % 7) as f64 * 1e6).collect();
        let sma = compute_rolling_mean(&prices, 7).unwrap();
        let expected: f64 = prices[4993..].iter().sum::<f64>() / 7.0;
        assert_eq!(sma[4999], Some(expected));
    }

    #[test]
    fn test_position_ties_go_short() {
        let sma1 = [None, Some(2.0), Some(3.0), Some(1.0)];
        let sma2 = [Some(1.0), Some(2.0), Some(2.0), Some(4.0)];
        let pos = compute_position(&sma1, &sma2);
        assert_eq!(
            pos,
            vec![
                None,
                Some(Position::Short),
                Some(Position::Long),
                Some(Position::Short)
            ]
        );
    }

    #[test]
    fn test_strategy_return_is_lagged() {
        let position = [Position::Long, Position::Short, Position::Long];
        let rets = [0.5, 0.1, 0.2];
        let strat = compute_strategy_return(&position, &rets);
        assert_eq!(strat, vec![None, Some(0.1), Some(-0.2)]);
    }
}
