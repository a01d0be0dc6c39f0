//! Upstream price sources.

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::{collections::HashMap, str::FromStr, time::Duration};
use tracing::debug;

/// One observation from an upstream price API
#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub price: Decimal,
    pub change_24h: f64,
    pub volume_24h: Decimal,
    pub market_cap: Decimal,
}

#[async_trait::async_trait]
pub trait PriceSource: Send + Sync {
    /// Best-effort fetch; may fail.
    async fn fetch_price(&self) -> Result<PriceQuote>;

    fn name(&self) -> &str;
}

/// CoinGecko-compatible `/simple/price` client
#[derive(Debug, Clone)]
pub struct CoinGeckoSource {
    client: Client,
    base_url: String,
    asset_id: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SimplePriceEntry {
    usd: serde_json::Number,
    #[serde(default)]
    usd_24h_change: Option<f64>,
    #[serde(default)]
    usd_24h_vol: Option<serde_json::Number>,
    #[serde(default)]
    usd_market_cap: Option<serde_json::Number>,
}

impl CoinGeckoSource {
    pub fn new(
        base_url: &str,
        asset_id: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build price HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            asset_id: asset_id.to_string(),
            api_key,
        })
    }
}

#[async_trait::async_trait]
impl PriceSource for CoinGeckoSource {
    async fn fetch_price(&self) -> Result<PriceQuote> {
        let url = format!("{}/simple/price", self.base_url);
        let mut req = self.client.get(&url).query(&[
            ("ids", self.asset_id.as_str()),
            ("vs_currencies", "usd"),
            ("include_24hr_change", "true"),
            ("include_24hr_vol", "true"),
            ("include_market_cap", "true"),
        ]);
        if let Some(key) = &self.api_key {
            req = req.header("X-CG-Pro-API-Key", key);
        }

        let body: HashMap<String, SimplePriceEntry> = req
            .send()
            .await
            .context("price request failed")?
            .error_for_status()
            .context("price API returned error status")?
            .json()
            .await
            .context("failed to decode price response")?;

        let entry = body
            .get(&self.asset_id)
            .ok_or_else(|| anyhow!("asset {} missing from price response", self.asset_id))?;

        let quote = PriceQuote {
            price: number_to_decimal(&entry.usd)?,
            change_24h: entry.usd_24h_change.unwrap_or(0.0),
            volume_24h: entry
                .usd_24h_vol
                .as_ref()
                .map(number_to_decimal)
                .transpose()?
                .unwrap_or_default(),
            market_cap: entry
                .usd_market_cap
                .as_ref()
                .map(number_to_decimal)
                .transpose()?
                .unwrap_or_default(),
        };
        debug!(asset = %self.asset_id, price = %quote.price, "fetched upstream price");
        Ok(quote)
    }

    fn name(&self) -> &str {
        "coingecko"
    }
}

/// Convert a JSON number via its shortest decimal rendering. Upstream
/// prices arrive as f64, so digits beyond f64 precision are already gone.
fn number_to_decimal(n: &serde_json::Number) -> Result<Decimal> {
    let s = n.to_string();
    Decimal::from_str(&s)
        .or_else(|_| Decimal::from_scientific(&s))
        .with_context(|| format!("unrepresentable price value {s}"))
}

/// Random walk around a base price for local runs without a price API.
#[derive(Debug, Clone)]
pub struct SyntheticPriceSource {
    base: Decimal,
}

impl SyntheticPriceSource {
    pub fn new(base: Decimal) -> Self {
        Self { base }
    }
}

#[async_trait::async_trait]
impl PriceSource for SyntheticPriceSource {
    async fn fetch_price(&self) -> Result<PriceQuote> {
        Ok(synthetic_quote(self.base))
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

/// Base price +/-1%, rounded to 6 dp.
pub fn synthetic_quote(base: Decimal) -> PriceQuote {
    let mut rng = rand::thread_rng();
    // parts per million of the base price
    let ppm: i64 = rng.gen_range(-10_000..=10_000);
    let price = (base + base * Decimal::new(ppm, 6)).round_dp(6);
    let change_24h = (rng.gen_range(-10.0..10.0_f64) * 100.0).round() / 100.0;
    let volume_24h = Decimal::from(rng.gen_range(0..1_000_000u64));

    PriceQuote {
        price,
        change_24h,
        volume_24h,
        market_cap: price * Decimal::from(100_000_000u64),
    }
}
