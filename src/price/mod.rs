//! Asset price feed: upstream sources plus the cache/history the scheduler
//! resolves rounds against.

pub mod cache;
pub mod source;

pub use cache::{PriceCacheConfig, PriceFeedCache};
pub use source::{CoinGeckoSource, PriceQuote, PriceSource, SyntheticPriceSource};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How much a snapshot can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Fetched from upstream within the cache TTL
    Live,
    /// Last good upstream value, served because a refresh failed
    Stale,
    /// Generated locally; no upstream value was ever obtained
    Synthetic,
}

impl Freshness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Freshness::Live => "live",
            Freshness::Stale => "stale",
            Freshness::Synthetic => "synthetic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSnapshot {
    pub price: Decimal,
    pub change_24h: f64,
    pub volume_24h: Decimal,
    pub market_cap: Decimal,
    pub timestamp: DateTime<Utc>,
    pub freshness: Freshness,
}

impl PriceSnapshot {
    pub fn from_quote(quote: PriceQuote, timestamp: DateTime<Utc>, freshness: Freshness) -> Self {
        Self {
            price: quote.price,
            change_24h: quote.change_24h,
            volume_24h: quote.volume_24h,
            market_cap: quote.market_cap,
            timestamp,
            freshness,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.freshness == Freshness::Synthetic
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
}

/// Summary over the trailing 24h of history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceStats {
    pub current: Decimal,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
    pub change_24h: f64,
    pub volume_24h: Decimal,
}
