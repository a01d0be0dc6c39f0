use super::{
    source::synthetic_quote, Freshness, PricePoint, PriceSnapshot, PriceSource, PriceStats,
};
use crate::config::{to_chrono, AppConfig};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PriceCacheConfig {
    pub ttl: Duration,
    pub retention: Duration,
    pub fetch_timeout: Duration,
    /// Centre of the synthetic fallback price
    pub synthetic_base: Decimal,
}

impl Default for PriceCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            retention: Duration::from_secs(24 * 3600),
            fetch_timeout: Duration::from_secs(10),
            synthetic_base: Decimal::new(15, 2),
        }
    }
}

impl PriceCacheConfig {
    pub fn from_app(cfg: &AppConfig) -> Self {
        Self {
            ttl: cfg.price_cache_ttl,
            retention: cfg.price_history_retention,
            fetch_timeout: cfg.external_call_timeout,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    /// Last live upstream snapshot; never synthetic.
    latest: Option<PriceSnapshot>,
    /// Time-ordered, oldest first.
    history: VecDeque<PricePoint>,
}

/// Current price with TTL caching plus a bounded price history.
///
/// Reads never fail: an upstream outage degrades to the last good value
/// (marked [`Freshness::Stale`]) and, when nothing was ever fetched, to a
/// synthetic price (marked [`Freshness::Synthetic`]). Callers that commit
/// money must check the freshness themselves.
pub struct PriceFeedCache {
    source: Arc<dyn PriceSource>,
    ttl: chrono::Duration,
    retention: chrono::Duration,
    fetch_timeout: Duration,
    synthetic_base: Decimal,
    state: RwLock<CacheState>,
}

impl PriceFeedCache {
    pub fn new(source: Arc<dyn PriceSource>, config: PriceCacheConfig) -> Self {
        Self {
            source,
            ttl: to_chrono(config.ttl),
            retention: to_chrono(config.retention),
            fetch_timeout: config.fetch_timeout,
            synthetic_base: config.synthetic_base,
            state: RwLock::new(CacheState::default()),
        }
    }

    pub async fn get_current_price(&self) -> PriceSnapshot {
        self.get_current_price_at(Utc::now()).await
    }

    pub async fn get_current_price_at(&self, now: DateTime<Utc>) -> PriceSnapshot {
        if let Some(snapshot) = self.cached_within_ttl(now) {
            return snapshot;
        }
        self.fetch_at(now).await
    }

    /// Fetch from upstream regardless of the TTL.
    pub async fn refresh(&self) -> PriceSnapshot {
        self.fetch_at(Utc::now()).await
    }

    pub async fn refresh_at(&self, now: DateTime<Utc>) -> PriceSnapshot {
        self.fetch_at(now).await
    }

    fn cached_within_ttl(&self, now: DateTime<Utc>) -> Option<PriceSnapshot> {
        let state = self.state.read();
        state
            .latest
            .as_ref()
            .filter(|s| now - s.timestamp < self.ttl)
            .cloned()
    }

    async fn fetch_at(&self, now: DateTime<Utc>) -> PriceSnapshot {
        let result = match tokio::time::timeout(self.fetch_timeout, self.source.fetch_price()).await
        {
            Ok(Ok(quote)) if quote.price > Decimal::ZERO => Ok(quote),
            Ok(Ok(quote)) => Err(anyhow!("non-positive price {}", quote.price)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(anyhow!("timed out after {:?}", self.fetch_timeout)),
        };

        match result {
            Ok(quote) => {
                let snapshot = PriceSnapshot::from_quote(quote, now, Freshness::Live);
                let mut state = self.state.write();
                state.latest = Some(snapshot.clone());
                push_point(
                    &mut state.history,
                    PricePoint {
                        timestamp: now,
                        price: snapshot.price,
                    },
                    self.retention,
                );
                debug!(source = self.source.name(), price = %snapshot.price, "price refreshed");
                snapshot
            }
            Err(e) => {
                warn!(source = self.source.name(), error = %e, "price fetch failed");
                self.fallback(now)
            }
        }
    }

    fn fallback(&self, now: DateTime<Utc>) -> PriceSnapshot {
        if let Some(last) = self.state.read().latest.clone() {
            warn!(price = %last.price, as_of = %last.timestamp, "serving stale price");
            return PriceSnapshot {
                freshness: Freshness::Stale,
                ..last
            };
        }
        warn!("no upstream price available, serving synthetic price");
        PriceSnapshot::from_quote(
            synthetic_quote(self.synthetic_base),
            now,
            Freshness::Synthetic,
        )
    }

    pub fn record_price_point(&self, price: Decimal) {
        self.record_price_point_at(Utc::now(), price);
    }

    /// Append a point and drop everything older than the retention window
    /// measured from the new point.
    pub fn record_price_point_at(&self, timestamp: DateTime<Utc>, price: Decimal) {
        let mut state = self.state.write();
        push_point(
            &mut state.history,
            PricePoint { timestamp, price },
            self.retention,
        );
    }

    /// Price of the history entry closest to `target`, or `None` when the
    /// closest entry is farther than `tolerance`. Ties go to the earlier entry.
    pub fn get_price_at_or_near(
        &self,
        target: DateTime<Utc>,
        tolerance: chrono::Duration,
    ) -> Option<Decimal> {
        let state = self.state.read();
        let mut best: Option<(i64, Decimal)> = None;

        for p in state.history.iter() {
            let abs = (p.timestamp - target).num_milliseconds().abs();
            if best.map_or(true, |(best_abs, _)| abs < best_abs) {
                best = Some((abs, p.price));
            }
        }

        best.filter(|(abs, _)| *abs <= tolerance.num_milliseconds())
            .map(|(_, price)| price)
    }

    /// Points from the last `window_hours`, oldest first.
    pub fn get_history(&self, window_hours: u32) -> Vec<PricePoint> {
        self.history_since(Utc::now() - chrono::Duration::hours(window_hours as i64))
    }

    pub fn history_since(&self, cutoff: DateTime<Utc>) -> Vec<PricePoint> {
        self.state
            .read()
            .history
            .iter()
            .filter(|p| p.timestamp > cutoff)
            .copied()
            .collect()
    }

    pub async fn stats(&self) -> Option<PriceStats> {
        let current = self.get_current_price().await;
        self.stats_for(&current, Utc::now() - chrono::Duration::hours(24))
    }

    fn stats_for(&self, current: &PriceSnapshot, cutoff: DateTime<Utc>) -> Option<PriceStats> {
        let history = self.history_since(cutoff);
        let high_24h = history.iter().map(|p| p.price).max()?;
        let low_24h = history.iter().map(|p| p.price).min()?;

        Some(PriceStats {
            current: current.price,
            high_24h,
            low_24h,
            change_24h: current.change_24h,
            volume_24h: current.volume_24h,
        })
    }

    pub fn history_len(&self) -> usize {
        self.state.read().history.len()
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.latest = None;
        state.history.clear();
    }
}

fn push_point(history: &mut VecDeque<PricePoint>, point: PricePoint, retention: chrono::Duration) {
    // Keep time order even if a point arrives late.
    let idx = history.partition_point(|p| p.timestamp <= point.timestamp);
    history.insert(idx, point);

    let newest = history.back().map(|p| p.timestamp).unwrap_or(point.timestamp);
    let cutoff = newest - retention;
    while history.front().is_some_and(|p| p.timestamp <= cutoff) {
        history.pop_front();
    }
}
