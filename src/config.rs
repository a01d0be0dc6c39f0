//! Runtime configuration loaded from the environment (and `.env` when present).

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use std::{env, str::FromStr, time::Duration};

/// Which settlement oracle adapter to wire in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleMode {
    Gateway,
    Paper,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_path: String,
    pub log_format: String,

    pub price_api_url: String,
    pub price_api_key: Option<String>,
    pub price_asset_id: String,
    pub price_cache_ttl: Duration,
    pub price_history_retention: Duration,
    pub price_tolerance: Duration,

    pub price_tick: Duration,
    pub round_tick: Duration,
    pub round_lock_after: Duration,
    pub round_end_after: Duration,
    pub external_call_timeout: Duration,
    pub lease_ttl: Duration,
    pub allow_synthetic_settlement: bool,
    pub enable_jobs: bool,

    pub min_stake: Decimal,
    pub max_stake: Decimal,

    pub oracle_mode: OracleMode,
    pub oracle_gateway_url: Option<String>,
    pub oracle_api_key: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            database_path: "./predict_rounds.db".to_string(),
            log_format: "pretty".to_string(),
            price_api_url: "https://api.coingecko.com/api/v3".to_string(),
            price_api_key: None,
            price_asset_id: "neural-token".to_string(),
            price_cache_ttl: Duration::from_secs(60),
            price_history_retention: Duration::from_secs(24 * 3600),
            price_tolerance: Duration::from_secs(5 * 60),
            price_tick: Duration::from_secs(60),
            round_tick: Duration::from_secs(5 * 60),
            round_lock_after: Duration::from_secs(24 * 3600),
            round_end_after: Duration::from_secs(24 * 3600),
            external_call_timeout: Duration::from_secs(15),
            lease_ttl: Duration::from_secs(10 * 60),
            allow_synthetic_settlement: false,
            enable_jobs: true,
            min_stake: Decimal::ONE,
            max_stake: Decimal::from(100_000),
            oracle_mode: OracleMode::Paper,
            oracle_gateway_url: None,
            oracle_api_key: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let d = Self::default();

        let oracle_mode = match env::var("ORACLE_MODE")
            .unwrap_or_else(|_| "paper".to_string())
            .to_lowercase()
            .as_str()
        {
            "gateway" => OracleMode::Gateway,
            "paper" => OracleMode::Paper,
            other => bail!("ORACLE_MODE must be 'gateway' or 'paper', got '{other}'"),
        };

        let cfg = Self {
            port: env_parse("PORT", d.port)?,
            database_path: env::var("DATABASE_PATH").unwrap_or(d.database_path),
            log_format: env::var("LOG_FORMAT").unwrap_or(d.log_format),
            price_api_url: env::var("PRICE_API_URL").unwrap_or(d.price_api_url),
            price_api_key: env_opt("PRICE_API_KEY").or_else(|| env_opt("COINGECKO_API_KEY")),
            price_asset_id: env::var("PRICE_ASSET_ID").unwrap_or(d.price_asset_id),
            price_cache_ttl: env_secs("PRICE_CACHE_TTL_SECS", d.price_cache_ttl)?,
            price_history_retention: env_hours(
                "PRICE_HISTORY_RETENTION_HOURS",
                d.price_history_retention,
            )?,
            price_tolerance: env_secs("PRICE_TOLERANCE_SECS", d.price_tolerance)?,
            price_tick: env_secs("PRICE_TICK_SECS", d.price_tick)?,
            round_tick: env_secs("ROUND_TICK_SECS", d.round_tick)?,
            round_lock_after: env_secs("ROUND_LOCK_AFTER_SECS", d.round_lock_after)?,
            round_end_after: env_secs("ROUND_END_AFTER_SECS", d.round_end_after)?,
            external_call_timeout: env_secs(
                "EXTERNAL_CALL_TIMEOUT_SECS",
                d.external_call_timeout,
            )?,
            lease_ttl: env_secs("LEASE_TTL_SECS", d.lease_ttl)?,
            allow_synthetic_settlement: env_bool(
                "ALLOW_SYNTHETIC_SETTLEMENT",
                d.allow_synthetic_settlement,
            )?,
            enable_jobs: env_bool("ENABLE_JOBS", d.enable_jobs)?,
            min_stake: env_parse("MIN_STAKE", d.min_stake)?,
            max_stake: env_parse("MAX_STAKE", d.max_stake)?,
            oracle_mode,
            oracle_gateway_url: env_opt("ORACLE_GATEWAY_URL"),
            oracle_api_key: env_opt("ORACLE_API_KEY"),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_stake <= Decimal::ZERO || self.min_stake > self.max_stake {
            bail!(
                "stake bounds must satisfy 0 < MIN_STAKE <= MAX_STAKE (got {}..{})",
                self.min_stake,
                self.max_stake
            );
        }
        if self.round_lock_after.is_zero() || self.round_end_after.is_zero() {
            bail!("round durations must be positive");
        }
        if self.external_call_timeout.is_zero() {
            bail!("EXTERNAL_CALL_TIMEOUT_SECS must be positive");
        }
        if self.oracle_mode == OracleMode::Gateway && self.oracle_gateway_url.is_none() {
            bail!("ORACLE_GATEWAY_URL must be set when ORACLE_MODE=gateway");
        }
        Ok(())
    }
}

/// Convert a config duration for timestamp arithmetic.
pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(3650))
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Unset or blank keeps `default`; a value that does not parse is an error.
fn parse_var<T>(key: &str, raw: Option<&str>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => v
            .parse()
            .with_context(|| format!("{key} has invalid value '{v}'")),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: Option<&str>, default: bool) -> Result<bool> {
    match raw.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") => Ok(default),
        Some("1" | "true" | "on" | "yes") => Ok(true),
        Some("0" | "false" | "off" | "no") => Ok(false),
        Some(other) => bail!("{key} must be a boolean, got '{other}'"),
    }
}

fn parse_positive(key: &str, raw: Option<&str>, default: u64) -> Result<u64> {
    let v = parse_var(key, raw, default)?;
    if v == 0 {
        bail!("{key} must be positive");
    }
    Ok(v)
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    parse_var(key, env::var(key).ok().as_deref(), default)
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    parse_bool(key, env::var(key).ok().as_deref(), default)
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    let secs = parse_positive(key, env::var(key).ok().as_deref(), default.as_secs())?;
    Ok(Duration::from_secs(secs))
}

fn env_hours(key: &str, default: Duration) -> Result<Duration> {
    let hours = parse_positive(key, env::var(key).ok().as_deref(), default.as_secs() / 3600)?;
    Ok(Duration::from_secs(hours * 3600))
}
