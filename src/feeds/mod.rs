//! External data feeds: the settlement price source and the forecast
//! provider.
//!
//! Both are treated as unreliable. Callers get a `KeeperResult` and decide
//! what "unavailable" means for them.

pub mod forecast;
pub mod price;

use async_trait::async_trait;

use crate::types::{Forecast, KeeperResult};

pub use forecast::{CachedForecastProvider, HttpForecastProvider};
pub use price::BinancePriceFeed;

/// Current settlement price for an asset.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Short name used in resolution proofs (e.g. "binance").
    fn source_name(&self) -> &str;

    /// Spot price in quote currency. Never returns a non-positive price.
    async fn price(&self, asset: &str) -> KeeperResult<f64>;
}

/// Directional forecast for an asset.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ForecastProvider: Send + Sync {
    async fn forecast(&self, asset: &str) -> KeeperResult<Forecast>;
}
