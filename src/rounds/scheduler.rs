use super::reconciler::{ReconcileReport, SettlementReconciler};
use crate::{
    broadcast::{EventBroadcaster, ServerEvent},
    config::{to_chrono, AppConfig},
    errors::TransitionError,
    models::{Round, RoundState},
    oracle::SettlementOracle,
    price::{PriceFeedCache, PriceSnapshot},
    store::{RoundFilter, RoundPricePoint, Store},
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const START_LEASE: &str = "start";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub lock_after: chrono::Duration,
    pub end_after: chrono::Duration,
    /// Max distance between `end_time` and the history point used to resolve
    pub price_tolerance: chrono::Duration,
    pub call_timeout: Duration,
    pub lease_ttl: chrono::Duration,
    pub allow_synthetic_settlement: bool,
    /// Chart points kept per round
    pub price_point_cap: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_after: chrono::Duration::hours(24),
            end_after: chrono::Duration::hours(24),
            price_tolerance: chrono::Duration::minutes(5),
            call_timeout: Duration::from_secs(15),
            lease_ttl: chrono::Duration::minutes(10),
            allow_synthetic_settlement: false,
            price_point_cap: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn from_app(cfg: &AppConfig) -> Self {
        Self {
            lock_after: to_chrono(cfg.round_lock_after),
            end_after: to_chrono(cfg.round_end_after),
            price_tolerance: to_chrono(cfg.price_tolerance),
            call_timeout: cfg.external_call_timeout,
            lease_ttl: to_chrono(cfg.lease_ttl),
            allow_synthetic_settlement: cfg.allow_synthetic_settlement,
            ..Self::default()
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub locked: Vec<u64>,
    pub resolved: Vec<u64>,
    pub started: Option<u64>,
    /// Units left for a later tick: no usable price, lease held elsewhere,
    /// or a lost compare-and-swap
    pub skipped: usize,
    pub failed: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.locked.is_empty()
            && self.resolved.is_empty()
            && self.started.is_none()
            && self.skipped == 0
            && self.failed == 0
    }

    /// Count a non-applied outcome; returns whether the step was applied.
    fn tally(&mut self, outcome: Step) -> bool {
        match outcome {
            Step::Applied => return true,
            Step::Skipped => self.skipped += 1,
            Step::Failed => self.failed += 1,
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Applied,
    Skipped,
    Failed,
}

/// Sole writer of round lifecycle transitions.
///
/// Each tick locks due ACTIVE rounds, resolves due LOCKED rounds, re-runs
/// settlement for resolved rounds with unmarked predictions, and finally
/// opens a new round when none is ACTIVE. Rounds are processed as
/// independent futures; a failure in one is logged and retried next tick.
/// Oracle commitments happen before the local write, and every local write
/// is a compare-and-swap on the stored state guarded by a per-unit lease,
/// so concurrent keepers cannot double-apply a transition.
pub struct RoundScheduler {
    store: Arc<dyn Store>,
    oracle: Arc<dyn SettlementOracle>,
    prices: Arc<PriceFeedCache>,
    reconciler: SettlementReconciler,
    broadcaster: Arc<EventBroadcaster>,
    config: SchedulerConfig,
    instance_id: String,
}

impl RoundScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        oracle: Arc<dyn SettlementOracle>,
        prices: Arc<PriceFeedCache>,
        broadcaster: Arc<EventBroadcaster>,
        config: SchedulerConfig,
    ) -> Self {
        let reconciler =
            SettlementReconciler::new(store.clone(), oracle.clone(), config.call_timeout);
        Self {
            store,
            oracle,
            prices,
            reconciler,
            broadcaster,
            config,
            instance_id: format!("keeper-{}", Uuid::new_v4()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        match self
            .store
            .find_rounds_by_state(RoundState::Active, RoundFilter::lock_due(now))
            .await
        {
            Ok(due) => {
                let outcomes = join_all(due.iter().map(|r| self.lock_round(r, now))).await;
                for (round, outcome) in due.iter().zip(outcomes) {
                    if report.tally(outcome) {
                        report.locked.push(round.round_id);
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "failed to load rounds due for lock");
                report.failed += 1;
            }
        }

        match self
            .store
            .find_rounds_by_state(RoundState::Locked, RoundFilter::resolve_due(now))
            .await
        {
            Ok(due) => {
                let outcomes = join_all(due.iter().map(|r| self.resolve_round(r, now))).await;
                for (round, outcome) in due.iter().zip(outcomes) {
                    if report.tally(outcome) {
                        report.resolved.push(round.round_id);
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "failed to load rounds due for resolve");
                report.failed += 1;
            }
        }

        match self.store.rounds_with_unsettled_predictions().await {
            Ok(rounds) => {
                let pending: Vec<&Round> = rounds
                    .iter()
                    .filter(|r| !report.resolved.contains(&r.round_id))
                    .collect();
                join_all(pending.into_iter().map(|r| self.settle(r))).await;
            }
            Err(e) => {
                error!(error = %e, "failed to load rounds awaiting settlement");
                report.failed += 1;
            }
        }

        match self.start_round(now).await {
            Ok(Some(round_id)) => report.started = Some(round_id),
            Ok(None) => {}
            Err(StartError::Skipped) => report.skipped += 1,
            Err(StartError::Failed) => report.failed += 1,
        }

        if report.is_idle() {
            debug!("round tick: nothing due");
        } else {
            info!(
                locked = ?report.locked,
                resolved = ?report.resolved,
                started = ?report.started,
                skipped = report.skipped,
                failed = report.failed,
                "round tick complete"
            );
        }
        report
    }

    /// ACTIVE -> LOCKED at the current price, or at the price the oracle
    /// already committed when an earlier local write was lost.
    async fn lock_round(&self, round: &Round, now: DateTime<Utc>) -> Step {
        let key = format!("lock:{}", round.round_id);
        self.with_lease(&key, now, async {
            // re-read under the lease; another keeper may have moved it
            let current = match self.store.find_round(round.round_id).await {
                Ok(Some(r)) if r.state == RoundState::Active => r,
                Ok(_) => return Step::Skipped,
                Err(e) => {
                    warn!(round_id = round.round_id, error = %e, "failed to reload round");
                    return Step::Failed;
                }
            };

            let (lock_price, tx_hash) = match self.oracle_lock(round.round_id, now).await {
                Ok(Some(committed)) => committed,
                Ok(None) => return Step::Skipped,
                Err(e) => {
                    warn!(round_id = round.round_id, error = %e, "oracle lock failed, will retry");
                    return Step::Failed;
                }
            };
            let next = match current.lock(lock_price, tx_hash, now) {
                Ok(next) => next,
                Err(e) => return refused(round.round_id, e),
            };

            match self.store.save_transition(RoundState::Active, &next).await {
                Ok(true) => {
                    info!(round_id = next.round_id, lock_price = %lock_price, "round locked");
                    if let Some(event) = ServerEvent::round_locked(&next) {
                        self.broadcaster.publish(event);
                    }
                    Step::Applied
                }
                Ok(false) => {
                    warn!(round_id = next.round_id, "round changed state during lock");
                    Step::Skipped
                }
                Err(e) => {
                    error!(round_id = next.round_id, error = %e, "failed to persist lock");
                    Step::Failed
                }
            }
        })
        .await
    }

    /// Lock price and transaction hash the oracle holds for the round.
    ///
    /// A price the oracle committed on an earlier attempt is adopted as is
    /// (with no hash); otherwise the current snapshot is committed. `None`
    /// means no usable price yet.
    async fn oracle_lock(
        &self,
        round_id: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<(Decimal, Option<String>)>> {
        let committed = self
            .bounded("lock price", self.oracle.committed_lock_price(round_id))
            .await?;
        if let Some(price) = committed {
            warn!(round_id, lock_price = %price, "oracle already locked this round, adopting its price");
            return Ok(Some((price, None)));
        }

        let snapshot = self.prices.get_current_price_at(now).await;
        if !self.usable_for_commit(&snapshot, round_id, "lock") {
            return Ok(None);
        }
        let tx_hash = self
            .commit("lock", self.oracle.lock_round(round_id, snapshot.price))
            .await?;
        debug!(round_id, freshness = snapshot.freshness.as_str(), "lock committed");
        Ok(Some((snapshot.price, Some(tx_hash))))
    }

    /// LOCKED -> RESOLVED at the recorded price nearest `end_time`, then settle.
    async fn resolve_round(&self, round: &Round, now: DateTime<Utc>) -> Step {
        let key = format!("resolve:{}", round.round_id);
        self.with_lease(&key, now, async {
            let Some(end_price) = self
                .prices
                .get_price_at_or_near(round.end_time, self.config.price_tolerance)
            else {
                warn!(
                    round_id = round.round_id,
                    end_time = %round.end_time,
                    "no price within tolerance of end time, resolve deferred"
                );
                return Step::Skipped;
            };

            let current = match self.store.find_round(round.round_id).await {
                Ok(Some(r)) if r.state == RoundState::Locked && !r.resolved => r,
                Ok(_) => return Step::Skipped,
                Err(e) => {
                    warn!(round_id = round.round_id, error = %e, "failed to reload round");
                    return Step::Failed;
                }
            };
            let mut next = match current.resolve(end_price, None, now) {
                Ok(next) => next,
                Err(e) => return refused(round.round_id, e),
            };

            let tx_hash = match self
                .commit("resolve", self.oracle.resolve_round(round.round_id, end_price))
                .await
            {
                Ok(hash) => hash,
                Err(e) => {
                    warn!(round_id = round.round_id, error = %e, "oracle resolve failed, will retry");
                    return Step::Failed;
                }
            };
            next.transactions.resolve = Some(tx_hash);

            match self.store.save_transition(RoundState::Locked, &next).await {
                Ok(true) => {
                    info!(
                        round_id = next.round_id,
                        lock_price = ?next.lock_price,
                        end_price = %end_price,
                        winner = ?next.winning_position,
                        "round resolved"
                    );
                    if let Some(event) = ServerEvent::round_resolved(&next) {
                        self.broadcaster.publish(event);
                    }
                    self.settle(&next).await;
                    Step::Applied
                }
                Ok(false) => {
                    warn!(round_id = next.round_id, "round changed state during resolve");
                    Step::Skipped
                }
                Err(e) => {
                    error!(round_id = next.round_id, error = %e, "failed to persist resolve");
                    Step::Failed
                }
            }
        })
        .await
    }

    async fn settle(&self, round: &Round) -> Option<ReconcileReport> {
        match self.reconciler.reconcile(round).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(round_id = round.round_id, error = %e, "settlement pass failed");
                None
            }
        }
    }

    /// Open a new round unless one is ACTIVE. The round id comes from the oracle.
    async fn start_round(&self, now: DateTime<Utc>) -> Result<Option<u64>, StartError> {
        match self.store.find_active_round().await {
            Ok(Some(_)) => return Ok(None),
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "failed to check for an active round");
                return Err(StartError::Failed);
            }
        }

        let step = self
            .with_lease(START_LEASE, now, async {
                match self.start_round_leased(now).await {
                    Ok(Some(round_id)) => (Step::Applied, Some(round_id)),
                    Ok(None) => (Step::Skipped, None),
                    Err(e) => {
                        warn!(error = %e, "round start failed, will retry");
                        (Step::Failed, None)
                    }
                }
            })
            .await;

        match step {
            (Step::Applied, id) => Ok(id),
            (Step::Skipped, _) => Err(StartError::Skipped),
            (Step::Failed, _) => Err(StartError::Failed),
        }
    }

    async fn start_round_leased(&self, now: DateTime<Utc>) -> Result<Option<u64>> {
        if self.store.find_active_round().await?.is_some() {
            return Ok(None);
        }
        let snapshot = self.prices.get_current_price_at(now).await;
        if !self.usable_for_commit(&snapshot, 0, "start") {
            return Ok(None);
        }
        if snapshot.price <= Decimal::ZERO {
            return Err(TransitionError::NonPositivePrice(snapshot.price.to_string()).into());
        }

        let tx_hash = self
            .commit("start", self.oracle.start_round(snapshot.price))
            .await?;
        let round_id = self
            .bounded("current round id", self.oracle.current_round_id())
            .await?;
        let round = Round::open(
            round_id,
            now,
            self.config.lock_after,
            self.config.end_after,
            snapshot.price,
            Some(tx_hash),
        )?;

        if !self.store.insert_round_if_no_active(&round).await? {
            warn!(round_id, "oracle started a round but another one is already active locally");
            return Ok(None);
        }
        info!(
            round_id,
            start_price = %round.start_price,
            lock_time = %round.lock_time,
            end_time = %round.end_time,
            "round started"
        );
        self.broadcaster.publish(ServerEvent::round_started(&round));
        Ok(Some(round_id))
    }

    /// Append the snapshot to the chart of every ACTIVE or LOCKED round.
    pub async fn record_round_price_points(&self, snapshot: &PriceSnapshot) -> Result<usize> {
        if snapshot.is_synthetic() {
            return Ok(0);
        }
        let point = RoundPricePoint {
            timestamp: snapshot.timestamp,
            price: snapshot.price,
            source: snapshot.freshness.as_str().to_string(),
        };

        let mut live = self
            .store
            .find_rounds_by_state(RoundState::Active, RoundFilter::default())
            .await?;
        live.extend(
            self.store
                .find_rounds_by_state(RoundState::Locked, RoundFilter::default())
                .await?,
        );
        for round in &live {
            self.store
                .add_round_price_point(round.round_id, &point, self.config.price_point_cap)
                .await?;
        }
        Ok(live.len())
    }

    fn usable_for_commit(&self, snapshot: &PriceSnapshot, round_id: u64, step: &str) -> bool {
        if snapshot.is_synthetic() && !self.config.allow_synthetic_settlement {
            warn!(round_id, step, "only a synthetic price is available, deferring");
            return false;
        }
        true
    }

    /// Submit an oracle transaction and wait for it, each under the call timeout.
    async fn commit<F>(&self, what: &str, submit: F) -> Result<String>
    where
        F: Future<Output = Result<Box<dyn crate::oracle::PendingTx>>>,
    {
        let pending = self.bounded(what, submit).await?;
        debug!(step = what, tx = pending.hash(), "awaiting oracle confirmation");
        let receipt = self.bounded(what, pending.wait()).await?;
        Ok(receipt.hash)
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.config.call_timeout, fut)
            .await
            .map_err(|_| anyhow!("{what} timed out after {:?}", self.config.call_timeout))?
    }

    /// Run `unit` only if this instance holds `key`; the lease is released after.
    async fn with_lease<T, F>(&self, key: &str, now: DateTime<Utc>, unit: F) -> T
    where
        F: Future<Output = T>,
        T: LeaseFallback,
    {
        match self
            .store
            .try_acquire_lease(key, &self.instance_id, now, self.config.lease_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(lease = key, "lease held by another keeper");
                return T::skipped();
            }
            Err(e) => {
                warn!(lease = key, error = %e, "lease acquisition failed");
                return T::failed();
            }
        }

        let out = unit.await;
        if let Err(e) = self.store.release_lease(key, &self.instance_id).await {
            warn!(lease = key, error = %e, "lease release failed, it will expire");
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartError {
    Skipped,
    Failed,
}

trait LeaseFallback {
    fn skipped() -> Self;
    fn failed() -> Self;
}

impl LeaseFallback for Step {
    fn skipped() -> Self {
        Step::Skipped
    }

    fn failed() -> Self {
        Step::Failed
    }
}

impl LeaseFallback for (Step, Option<u64>) {
    fn skipped() -> Self {
        (Step::Skipped, None)
    }

    fn failed() -> Self {
        (Step::Failed, None)
    }
}

fn refused(round_id: u64, err: TransitionError) -> Step {
    error!(round_id, error = %err, "transition refused");
    Step::Skipped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        oracle::{paper::PaperOp, PaperOracle},
        price::{PriceCacheConfig, PriceQuote, PriceSource},
        store::{LeaseStore, RoundStore, SqliteStore},
    };
    use anyhow::bail;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;

    /// Serves queued prices, then fails.
    struct QueuedSource(Mutex<VecDeque<Decimal>>);

    #[async_trait::async_trait]
    impl PriceSource for QueuedSource {
        async fn fetch_price(&self) -> Result<PriceQuote> {
            match self.0.lock().pop_front() {
                Some(price) => Ok(PriceQuote {
                    price,
                    change_24h: 0.0,
                    volume_24h: Decimal::ZERO,
                    market_cap: Decimal::ZERO,
                }),
                None => bail!("upstream down"),
            }
        }

        fn name(&self) -> &str {
            "queued"
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<SqliteStore>,
        oracle: Arc<PaperOracle>,
        prices: Arc<PriceFeedCache>,
        scheduler: RoundScheduler,
    }

    fn harness(prices: &[Decimal], config: SchedulerConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(dir.path().join("s.db").to_str().unwrap()).unwrap());
        let oracle = Arc::new(PaperOracle::new(
            store.clone(),
            config.lock_after,
            config.end_after,
        ));
        let source = Arc::new(QueuedSource(Mutex::new(prices.iter().copied().collect())));
        let prices = Arc::new(PriceFeedCache::new(source, PriceCacheConfig::default()));
        let scheduler = RoundScheduler::new(
            store.clone(),
            oracle.clone(),
            prices.clone(),
            Arc::new(EventBroadcaster::new()),
            config,
        );
        Harness {
            _dir: dir,
            store,
            oracle,
            prices,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_first_tick_starts_round_with_oracle_id() {
        let h = harness(&[dec!(0.15)], SchedulerConfig::default());
        let report = h.scheduler.tick_at(t0()).await;
        assert_eq!(report.started, Some(1));

        let round = h.store.find_active_round().await.unwrap().unwrap();
        assert_eq!(round.round_id, 1);
        assert_eq!(round.start_price, dec!(0.15));
        assert_eq!(round.lock_time, t0() + chrono::Duration::hours(24));
        assert!(round.transactions.start.is_some());

        let again = h.scheduler.tick_at(t0() + chrono::Duration::minutes(5)).await;
        assert!(again.is_idle());
        assert_eq!(h.oracle.call_count(PaperOp::Start), 1);
    }

    #[tokio::test]
    async fn test_synthetic_price_blocks_start() {
        let h = harness(&[], SchedulerConfig::default());
        let report = h.scheduler.tick_at(t0()).await;
        assert_eq!(report.started, None);
        assert_eq!(report.skipped, 1);
        assert_eq!(h.oracle.call_count(PaperOp::Start), 0);

        let allowed = harness(
            &[],
            SchedulerConfig {
                allow_synthetic_settlement: true,
                ..SchedulerConfig::default()
            },
        );
        assert_eq!(allowed.scheduler.tick_at(t0()).await.started, Some(1));
    }

    #[tokio::test]
    async fn test_lock_then_start_next_round() {
        let h = harness(&[dec!(0.15), dec!(0.17)], SchedulerConfig::default());
        h.scheduler.tick_at(t0()).await;

        let at_lock = t0() + chrono::Duration::hours(24);
        let report = h.scheduler.tick_at(at_lock).await;
        assert_eq!(report.locked, vec![1]);
        assert_eq!(report.started, Some(2));

        let round = h.store.find_round(1).await.unwrap().unwrap();
        assert_eq!(round.state, RoundState::Locked);
        assert_eq!(round.lock_price, Some(dec!(0.17)));
        assert!(round.transactions.lock.is_some());

        // the next round opens at the same (cached) price
        let next = h.store.find_active_round().await.unwrap().unwrap();
        assert_eq!(next.round_id, 2);
        assert_eq!(next.start_price, dec!(0.17));
    }

    #[tokio::test]
    async fn test_oracle_failure_leaves_round_for_retry() {
        let h = harness(&[dec!(0.15), dec!(0.17)], SchedulerConfig::default());
        h.scheduler.tick_at(t0()).await;

        h.oracle.fail_next(PaperOp::Lock, 1);
        let at_lock = t0() + chrono::Duration::hours(24);
        let report = h.scheduler.tick_at(at_lock).await;
        assert_eq!(report.failed, 1);
        assert!(report.locked.is_empty());
        assert_eq!(
            h.store.find_round(1).await.unwrap().unwrap().state,
            RoundState::Active
        );

        let retry = h.scheduler.tick_at(at_lock + chrono::Duration::minutes(5)).await;
        assert_eq!(retry.locked, vec![1]);
    }

    #[tokio::test]
    async fn test_lock_adopts_price_already_committed_on_oracle() {
        let h = harness(&[dec!(0.15), dec!(0.20)], SchedulerConfig::default());
        h.scheduler.tick_at(t0()).await;

        // committed on the oracle by an attempt whose local write was lost
        let pending = h.oracle.lock_round(1, dec!(0.10)).await.unwrap();
        pending.wait().await.unwrap();

        let at_lock = t0() + chrono::Duration::hours(24);
        let report = h.scheduler.tick_at(at_lock).await;
        assert_eq!(report.locked, vec![1]);
        assert_eq!(h.oracle.call_count(PaperOp::Lock), 1);

        let round = h.store.find_round(1).await.unwrap().unwrap();
        assert_eq!(round.state, RoundState::Locked);
        assert_eq!(round.lock_price, Some(dec!(0.10)));
        assert!(round.transactions.lock.is_none());
    }

    #[tokio::test]
    async fn test_lock_price_lookup_failure_is_retried() {
        let h = harness(&[dec!(0.15), dec!(0.17)], SchedulerConfig::default());
        h.scheduler.tick_at(t0()).await;

        h.oracle.fail_next(PaperOp::LockPrice, 1);
        let at_lock = t0() + chrono::Duration::hours(24);
        let report = h.scheduler.tick_at(at_lock).await;
        assert_eq!(report.failed, 1);
        assert_eq!(h.oracle.call_count(PaperOp::Lock), 0);

        let retry = h.scheduler.tick_at(at_lock + chrono::Duration::minutes(5)).await;
        assert_eq!(retry.locked, vec![1]);
        let round = h.store.find_round(1).await.unwrap().unwrap();
        assert_eq!(round.lock_price, Some(dec!(0.17)));
    }

    #[tokio::test]
    async fn test_resolve_waits_for_price_within_tolerance() {
        let h = harness(&[dec!(0.15), dec!(0.17)], SchedulerConfig::default());
        h.scheduler.tick_at(t0()).await;
        h.scheduler.tick_at(t0() + chrono::Duration::hours(24)).await;

        let end = t0() + chrono::Duration::hours(48);
        h.prices
            .record_price_point_at(end - chrono::Duration::minutes(30), dec!(0.50));
        let report = h.scheduler.tick_at(end).await;
        assert!(report.resolved.is_empty());
        assert_eq!(report.skipped, 1);
        assert_eq!(h.oracle.call_count(PaperOp::Resolve), 0);

        h.prices
            .record_price_point_at(end + chrono::Duration::minutes(2), dec!(0.19));
        let report = h.scheduler.tick_at(end + chrono::Duration::minutes(5)).await;
        assert_eq!(report.resolved, vec![1]);

        let round = h.store.find_round(1).await.unwrap().unwrap();
        assert_eq!(round.state, RoundState::Resolved);
        assert_eq!(round.end_price, Some(dec!(0.19)));
        assert_eq!(round.winning_position, Some(crate::models::Position::Up));
    }

    #[tokio::test]
    async fn test_foreign_lease_skips_unit() {
        let h = harness(&[dec!(0.15)], SchedulerConfig::default());
        assert!(h
            .store
            .try_acquire_lease(START_LEASE, "other-keeper", t0(), chrono::Duration::minutes(10))
            .await
            .unwrap());

        let report = h.scheduler.tick_at(t0()).await;
        assert_eq!(report.skipped, 1);
        assert!(h.store.find_active_round().await.unwrap().is_none());

        let later = h.scheduler.tick_at(t0() + chrono::Duration::minutes(11)).await;
        assert_eq!(later.started, Some(1));
    }

    #[tokio::test]
    async fn test_round_price_points_skip_synthetic() {
        let h = harness(&[dec!(0.15)], SchedulerConfig::default());
        h.scheduler.tick_at(t0()).await;

        let snapshot = h.prices.get_current_price_at(t0()).await;
        assert_eq!(h.scheduler.record_round_price_points(&snapshot).await.unwrap(), 1);

        let mut synthetic = snapshot.clone();
        synthetic.freshness = crate::price::Freshness::Synthetic;
        assert_eq!(h.scheduler.record_round_price_points(&synthetic).await.unwrap(), 0);

        let points = h.store.round_price_points(1).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].source, "live");
    }
}
