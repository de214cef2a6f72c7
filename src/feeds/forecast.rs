//! Forecast provider client and the freshness cache in front of it.
//!
//! The provider answers `GET {forecast_url}?asset=btc` with a versioned
//! payload:
//!
//! ```json
//! {"schema_version": 1, "asset": "btc", "direction": "UP",
//!  "confidence": 72.5, "predicted_return": 0.0031, "timestamp": 1739999999.5}
//! ```
//!
//! Unknown fields, other schema versions and out-of-range confidences are
//! rejected rather than guessed at.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::ForecastProvider;
use crate::types::{Direction, Forecast, KeeperError, KeeperResult};

pub const FORECAST_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ForecastPayload {
    schema_version: u32,
    asset: String,
    direction: Direction,
    confidence: f64,
    predicted_return: f64,
    /// Unix seconds, fractional.
    timestamp: f64,
}

/// Validate and convert a raw provider body for `asset`.
pub fn parse_forecast(body: &str, asset: &str) -> KeeperResult<Forecast> {
    let payload: ForecastPayload = serde_json::from_str(body)
        .map_err(|e| KeeperError::ForecastUnavailable(format!("malformed payload: {e}")))?;

    if payload.schema_version != FORECAST_SCHEMA_VERSION {
        return Err(KeeperError::ForecastUnavailable(format!(
            "unsupported schema_version {}",
            payload.schema_version
        )));
    }
    if !payload.asset.eq_ignore_ascii_case(asset) {
        return Err(KeeperError::ForecastUnavailable(format!(
            "forecast is for '{}', expected '{asset}'",
            payload.asset
        )));
    }
    if !(0.0..=100.0).contains(&payload.confidence) {
        return Err(KeeperError::ForecastUnavailable(format!(
            "confidence {} outside [0, 100]",
            payload.confidence
        )));
    }
    if !payload.predicted_return.is_finite() {
        return Err(KeeperError::ForecastUnavailable(
            "predicted_return is not finite".to_string(),
        ));
    }
    let timestamp = if payload.timestamp.is_finite() {
        DateTime::from_timestamp_millis((payload.timestamp * 1000.0) as i64)
    } else {
        None
    }
    .ok_or_else(|| {
        KeeperError::ForecastUnavailable(format!("invalid timestamp {}", payload.timestamp))
    })?;

    Ok(Forecast {
        direction: payload.direction,
        confidence: payload.confidence,
        predicted_return: payload.predicted_return,
        timestamp,
    })
}

// ---------------------------------------------------------------------------
// HTTP provider
// ---------------------------------------------------------------------------

pub struct HttpForecastProvider {
    http: Client,
    url: String,
}

impl HttpForecastProvider {
    pub fn new(url: &str, timeout_secs: u64) -> KeeperResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("KEEPER/0.1.0")
            .build()
            .map_err(|e| KeeperError::Configuration(format!("forecast HTTP client: {e}")))?;
        Ok(Self {
            http,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl ForecastProvider for HttpForecastProvider {
    async fn forecast(&self, asset: &str) -> KeeperResult<Forecast> {
        let resp = self
            .http
            .get(&self.url)
            .query(&[("asset", asset)])
            .send()
            .await
            .map_err(|e| KeeperError::ForecastUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(KeeperError::ForecastUnavailable(format!(
                "HTTP {}",
                resp.status()
            )));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| KeeperError::ForecastUnavailable(e.to_string()))?;
        parse_forecast(&body, asset)
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Keeps the most recent forecast and serves it while it is younger than
/// `max_age`; otherwise fetches through to the inner provider.
pub struct CachedForecastProvider {
    inner: Arc<dyn ForecastProvider>,
    latest: RwLock<Option<Forecast>>,
    max_age: chrono::Duration,
}

impl CachedForecastProvider {
    pub fn new(inner: Arc<dyn ForecastProvider>, max_age_secs: u64) -> Self {
        Self {
            inner,
            latest: RwLock::new(None),
            max_age: chrono::Duration::seconds(max_age_secs as i64),
        }
    }

    /// Last forecast seen, regardless of age. Used by read-only views.
    pub async fn latest(&self) -> Option<Forecast> {
        self.latest.read().await.clone()
    }

    /// Fetch from the inner provider and store the result.
    pub async fn refresh(&self, asset: &str) -> KeeperResult<Forecast> {
        let forecast = self.inner.forecast(asset).await?;
        *self.latest.write().await = Some(forecast.clone());
        Ok(forecast)
    }

    /// Refresh forever at `interval`. Failures are logged and retried.
    pub async fn run_refresh_loop(self: Arc<Self>, asset: String, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match self.refresh(&asset).await {
                Ok(f) => info!(asset = %asset, forecast = %f, "Forecast refreshed"),
                Err(e) => warn!(asset = %asset, error = %e, "Forecast refresh failed"),
            }
        }
    }

    fn is_fresh(&self, forecast: &Forecast, now: DateTime<Utc>) -> bool {
        forecast.age(now) <= self.max_age
    }
}

#[async_trait]
impl ForecastProvider for CachedForecastProvider {
    async fn forecast(&self, asset: &str) -> KeeperResult<Forecast> {
        if let Some(cached) = self.latest().await {
            if self.is_fresh(&cached, Utc::now()) {
                return Ok(cached);
            }
        }
        self.refresh(asset).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
