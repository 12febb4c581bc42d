//! External market data clients

pub mod binance;

pub use binance::{BinanceApiError, BinanceClient};
