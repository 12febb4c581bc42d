//! Binance public API client for daily closes (no authentication required)

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::BacktestError;
use crate::provider::{check_range, PriceProvider};
use crate::types::{PricePoint, PriceSeries};

const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const MAX_KLINES_PER_REQUEST: u32 = 1000;
const DAILY_INTERVAL: &str = "1d";

/// Binance public market data client
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
}

/// Raw kline data from Binance API (array of arrays)
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct RawKline(
    i64,    // 0: Open time
    String, // 1: Open
    String, // 2: High
    String, // 3: Low
    String, // 4: Close
    String, // 5: Volume
    i64,    // 6: Close time
    String, // 7: Quote asset volume
    u64,    // 8: Number of trades
    String, // 9: Taker buy base
    String, // 10: Taker buy quote
    String, // 11: Ignore
);

impl RawKline {
    /// Close price keyed by the UTC date the bar opened
    fn to_price_point(&self) -> Result<PricePoint> {
        let date = DateTime::from_timestamp_millis(self.0)
            .ok_or_else(|| anyhow::anyhow!("kline open time {} out of range", self.0))?
            .date_naive();
        let close = self
            .4
            .parse::<f64>()
            .map_err(|e| anyhow::anyhow!("kline close {:?} on {}: {}", self.4, date, e))?;
        Ok(PricePoint::new(date, close))
    }
}

/// Convert a page of klines into `(point, close_time)` pairs.
///
/// One bad bar fails the whole page; a skipped session would make the next
/// log return span two days.
fn parse_klines(raw: &[RawKline]) -> Result<Vec<(PricePoint, i64)>> {
    raw.iter()
        .map(|k| Ok((k.to_price_point()?, k.6)))
        .collect()
}

/// Non-success HTTP response from Binance
#[derive(Debug, thiserror::Error)]
#[error("Binance API error {status}: {body}")]
pub struct BinanceApiError {
    pub status: StatusCode,
    pub body: String,
}

impl Default for BinanceClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BinanceClient {
    /// Create a new Binance client with default base URL
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Create a client against a different host (testnet, mirror)
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("Failed to build HTTP client"),
            base_url: base_url.into(),
        }
    }

    /// Fetch up to 1000 daily closes starting at `start_time` (ms, inclusive)
    pub async fn get_daily_closes(
        &self,
        symbol: &str,
        start_time: i64,
        end_time: i64,
    ) -> Result<Vec<(PricePoint, i64)>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&startTime={}&endTime={}&limit={}",
            self.base_url, symbol, DAILY_INTERVAL, start_time, end_time, MAX_KLINES_PER_REQUEST
        );

        debug!(symbol, start_time, end_time, "Fetching daily klines from Binance");

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BinanceApiError { status, body }.into());
        }

        let raw_klines: Vec<RawKline> = response.json().await?;

        let closes = parse_klines(&raw_klines)?;

        debug!(count = closes.len(), "Fetched daily klines");
        Ok(closes)
    }

    /// Fetch daily closes for `[start, end)`, paging through 1000 bars at a time
    pub async fn get_daily_closes_paginated(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PricePoint>> {
        let start_time = start.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
        // Binance treats endTime as inclusive
        let end_time = end.and_time(NaiveTime::MIN).and_utc().timestamp_millis() - 1;

        let mut all_closes = Vec::new();
        let mut current_start = start_time;

        info!(symbol, %start, %end, "Fetching paginated daily closes from Binance");

        loop {
            if current_start >= end_time {
                break;
            }

            let page = self.get_daily_closes(symbol, current_start, end_time).await?;

            if page.is_empty() {
                break;
            }

            let last_close_time = page.last().map(|(_, t)| *t).unwrap_or(end_time);
            all_closes.extend(page.into_iter().map(|(p, _)| p));

            // Move start to after the last candle
            current_start = last_close_time + 1;

            // Small delay to respect rate limits
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        info!(total = all_closes.len(), "Paginated daily close fetch complete");
        Ok(all_closes)
    }
}

#[async_trait]
impl PriceProvider for BinanceClient {
    async fn fetch(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> crate::error::Result<PriceSeries> {
        check_range(symbol, start, end)?;

        let points = self
            .get_daily_closes_paginated(symbol, start, end)
            .await
            .map_err(|e| BacktestError::DataUnavailable {
                symbol: symbol.to_string(),
                reason: e.to_string(),
            })?;

        PriceSeries::new(symbol, points)
    }
}
