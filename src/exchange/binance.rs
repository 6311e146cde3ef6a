// =============================================================================
// Binance Futures Adapter — public market data, retried with backoff
// =============================================================================
//
// Scoped down from the teacher's `binance/client.rs` (which also signed
// account/order endpoints) to the public endpoints the Exchange Adapter
// trait names: tickerPrice, ticker24h, klines. Retry-with-backoff is
// enriched from Zuytan-rustrade's `http_client_factory.rs` pattern rather
// than hand-rolled, since that is the idiom the pack actually uses for it.
// =============================================================================

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::error::ExchangeError;
use crate::exchange::{ExchangeAdapter, KlineBar, Ticker24h, TickerPrice};

/// Public-data Binance Futures client. Carries no API key/secret because it
/// never touches a signed endpoint.
#[derive(Clone)]
pub struct BinanceAdapter {
    base_url: String,
    client: ClientWithMiddleware,
}

impl BinanceAdapter {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let inner = reqwest::Client::builder()
            .pool_max_idle_per_host(5)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let client = ClientBuilder::new(inner)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            base_url: base_url.into(),
            client,
        }
    }

    fn classify_status(status: StatusCode, body: &str) -> ExchangeError {
        if status == StatusCode::TOO_MANY_REQUESTS {
            ExchangeError::RateLimited {
                retry_after_ms: None,
            }
        } else if status.is_server_error() {
            ExchangeError::TransientUpstream(format!("{status}: {body}"))
        } else {
            ExchangeError::PermanentUpstream(format!("{status}: {body}"))
        }
    }

    fn parse_str_f64(val: &serde_json::Value) -> f64 {
        val.as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .or_else(|| val.as_f64())
            .unwrap_or(0.0)
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    #[instrument(skip(self), name = "exchange::ticker_price")]
    async fn ticker_price(&self, symbol: &str) -> Result<TickerPrice, ExchangeError> {
        let url = format!("{}/fapi/v1/ticker/price?symbol={}", self.base_url, symbol);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::TransientUpstream(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ExchangeError::TransientUpstream(e.to_string()))?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &text));
        }

        let body: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::PermanentUpstream(e.to_string()))?;

        let price = Self::parse_str_f64(&body["price"]);
        debug!(symbol, price, "ticker price fetched");

        Ok(TickerPrice {
            price,
            ts_ms: chrono::Utc::now().timestamp_millis(),
        })
    }

    #[instrument(skip(self), name = "exchange::ticker_24h")]
    async fn ticker_24h(&self, symbol: &str) -> Result<Ticker24h, ExchangeError> {
        let url = format!("{}/fapi/v1/ticker/24hr?symbol={}", self.base_url, symbol);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::TransientUpstream(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ExchangeError::TransientUpstream(e.to_string()))?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &text));
        }

        let body: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::PermanentUpstream(e.to_string()))?;

        Ok(Ticker24h {
            price_change_pct: Self::parse_str_f64(&body["priceChangePercent"]),
            quote_volume: Self::parse_str_f64(&body["quoteVolume"]),
            high_price: Self::parse_str_f64(&body["highPrice"]),
            low_price: Self::parse_str_f64(&body["lowPrice"]),
            open_price: Self::parse_str_f64(&body["openPrice"]),
            last_price: Self::parse_str_f64(&body["lastPrice"]),
            count: body["count"].as_u64().unwrap_or(0),
        })
    }

    #[instrument(skip(self), name = "exchange::klines")]
    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> Result<Vec<KlineBar>, ExchangeError> {
        let (start_ms, end_ms) = match (start_ms, end_ms) {
            (Some(s), Some(e)) => (Some(s), Some(e)),
            _ => {
                let bar_ms = super::interval_millis(interval).unwrap_or(60_000);
                let end = chrono::Utc::now().timestamp_millis() + bar_ms;
                let start = end - (limit as i64) * bar_ms;
                (Some(start), Some(end))
            }
        };

        let mut url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        if let Some(s) = start_ms {
            url.push_str(&format!("&startTime={s}"));
        }
        if let Some(e) = end_ms {
            url.push_str(&format!("&endTime={e}"));
        }

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::TransientUpstream(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ExchangeError::TransientUpstream(e.to_string()))?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &text));
        }

        let raw: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::PermanentUpstream(e.to_string()))?;
        let arr = raw
            .as_array()
            .ok_or_else(|| ExchangeError::PermanentUpstream("klines response not an array".into()))?;

        let mut bars = Vec::with_capacity(arr.len());
        for entry in arr {
            let e = match entry.as_array() {
                Some(e) if e.len() >= 7 => e,
                _ => continue,
            };
            bars.push(KlineBar {
                open_time_ms: e[0].as_i64().unwrap_or(0),
                open: Self::parse_str_f64(&e[1]),
                high: Self::parse_str_f64(&e[2]),
                low: Self::parse_str_f64(&e[3]),
                close: Self::parse_str_f64(&e[4]),
                volume: Self::parse_str_f64(&e[5]),
                close_time_ms: e[6].as_i64().unwrap_or(0),
            });
        }

        debug!(symbol, interval, count = bars.len(), "klines fetched");
        Ok(bars)
    }
}

impl std::fmt::Debug for BinanceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceAdapter")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_kinds() {
        matches!(
            BinanceAdapter::classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ExchangeError::RateLimited { .. }
        );
        matches!(
            BinanceAdapter::classify_status(StatusCode::INTERNAL_SERVER_ERROR, ""),
            ExchangeError::TransientUpstream(_)
        );
        matches!(
            BinanceAdapter::classify_status(StatusCode::BAD_REQUEST, ""),
            ExchangeError::PermanentUpstream(_)
        );
    }

    #[test]
    fn parse_str_f64_accepts_string_or_number() {
        assert_eq!(
            BinanceAdapter::parse_str_f64(&serde_json::json!("1.5")),
            1.5
        );
        assert_eq!(BinanceAdapter::parse_str_f64(&serde_json::json!(2.5)), 2.5);
        assert_eq!(
            BinanceAdapter::parse_str_f64(&serde_json::json!(null)),
            0.0
        );
    }
}
