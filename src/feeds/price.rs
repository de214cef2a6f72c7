//! Spot price from the Binance public ticker.
//!
//! API: `GET /api/v3/ticker/price?symbol=BTCUSDT`
//! Auth: none. The price is returned as a decimal string.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::PriceFeed;
use crate::types::{KeeperError, KeeperResult};

const SOURCE: &str = "binance";

#[derive(Debug, Deserialize)]
struct TickerResponse {
    symbol: String,
    price: String,
}

pub struct BinancePriceFeed {
    http: Client,
    base_url: String,
}

impl BinancePriceFeed {
    pub fn new(base_url: &str, timeout_secs: u64) -> KeeperResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("KEEPER/0.1.0")
            .build()
            .map_err(|e| KeeperError::Configuration(format!("price feed HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Ticker symbol for an asset quoted in USDT.
    pub fn symbol_for(asset: &str) -> String {
        format!("{}USDT", asset.trim().to_uppercase())
    }
}

#[async_trait]
impl PriceFeed for BinancePriceFeed {
    fn source_name(&self) -> &str {
        SOURCE
    }

    async fn price(&self, asset: &str) -> KeeperResult<f64> {
        let symbol = Self::symbol_for(asset);
        let url = format!("{}/api/v3/ticker/price", self.base_url);

        let resp = self
            .http
            .get(&url)
            .query(&[("symbol", symbol.as_str())])
            .send()
            .await
            .map_err(|e| KeeperError::read(SOURCE, e))?;

        if !resp.status().is_success() {
            return Err(KeeperError::read(
                SOURCE,
                format!("{symbol}: HTTP {}", resp.status()),
            ));
        }

        let ticker: TickerResponse = resp
            .json()
            .await
            .map_err(|e| KeeperError::read(SOURCE, format!("{symbol}: {e}")))?;
        let price = parse_price(&ticker.price)?;
        debug!(symbol = %ticker.symbol, price, "Spot price");
        Ok(price)
    }
}

fn parse_price(raw: &str) -> KeeperResult<f64> {
    let price: f64 = raw
        .parse()
        .map_err(|_| KeeperError::read(SOURCE, format!("unparseable price '{raw}'")))?;
    if !price.is_finite() || price <= 0.0 {
        return Err(KeeperError::read(SOURCE, format!("non-positive price {raw}")));
    }
    Ok(price)
}
