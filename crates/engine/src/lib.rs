//! SMA Backtest Engine - dual moving-average crossover backtesting and optimization
//!
//! Provides:
//! - Signal generation (log returns, rolling means, lagged long/short positions)
//! - Cumulative growth accounting against buy-and-hold
//! - A re-runnable backtest engine over a shared, read-only price history
//! - Exhaustive grid search over window pairs (sequential or rayon-parallel)
//! - Price providers: in-memory/JSON and Binance daily klines

pub mod api;
pub mod engine;
pub mod error;
pub mod optimizer;
pub mod performance;
pub mod provider;
pub mod signals;
pub mod types;

// Re-exports for convenience
pub use api::BinanceClient;
pub use engine::{evaluate, BacktestEngine};
pub use error::{BacktestError, Result};
pub use optimizer::{
    generate_grid, optimize, optimize_parallel, optimize_parallel_with_progress, run_optimization,
    OptimizeProgress, OptimizeRequest, OptimizeStatus, WindowRange,
};
pub use provider::{InMemoryProvider, PriceProvider};
pub use types::*;
