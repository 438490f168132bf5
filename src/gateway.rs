// =============================================================================
// Historical Data Gateway — pull-based REST access to candle history
// =============================================================================
//
// The gateway is an external collaborator: the hub delegates
// `get_historical_data` here and converts any failure into an empty sequence.
// Every request carries a bounded timeout so a dead endpoint can never hang
// the caller.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::types::HistoricalBar;

/// Request timeout applied to every kline fetch.
const FETCH_TIMEOUT_SECS: u64 = 10;

/// Pull-based access to OHLCV history for a symbol.
#[async_trait]
pub trait HistoricalDataGateway: Send + Sync {
    /// Fetch up to `limit` bars for `symbol` at `interval`, oldest first.
    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<HistoricalBar>>;
}

/// Gateway backed by the Binance public klines endpoint.
pub struct BinanceKlineGateway {
    base_url: String,
    client: reqwest::Client,
}

impl BinanceKlineGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }
}

#[async_trait]
impl HistoricalDataGateway for BinanceKlineGateway {
    /// GET /api/v3/klines (public — no signature required).
    ///
    /// Array indices in the provider response:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume
    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<HistoricalBar>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            return Err(CoreError::Fetch(format!(
                "GET /api/v3/klines returned {status}: {body}"
            ))
            .into());
        }

        let raw = body.as_array().context("klines response is not an array")?;
        let bars = parse_kline_rows(raw);

        debug!(symbol, interval, count = bars.len(), "klines fetched");
        Ok(bars)
    }
}

/// Parse the provider's array-of-arrays kline rows into bars, oldest first.
///
/// Malformed rows are skipped with a warning rather than failing the whole
/// fetch.
fn parse_kline_rows(rows: &[serde_json::Value]) -> Vec<HistoricalBar> {
    let mut bars = Vec::with_capacity(rows.len());

    for entry in rows {
        let Some(arr) = entry.as_array() else {
            warn!("skipping non-array kline entry");
            continue;
        };
        if arr.len() < 6 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }

        let parsed = (|| -> Result<HistoricalBar> {
            Ok(HistoricalBar {
                time: arr[0].as_i64().context("openTime is not an integer")?,
                open: parse_str_f64(&arr[1])?,
                high: parse_str_f64(&arr[2])?,
                low: parse_str_f64(&arr[3])?,
                close: parse_str_f64(&arr[4])?,
                volume: parse_str_f64(&arr[5])?,
            })
        })();

        match parsed {
            Ok(bar) => bars.push(bar),
            Err(e) => warn!(error = %e, "skipping unparseable kline entry"),
        }
    }

    bars
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}
