//! End-to-end round lifecycle against a real SQLite file and the paper oracle.

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use predict_rounds::{
    broadcast::{EventBroadcaster, ServerEvent},
    errors::LedgerError,
    models::{Position, RoundState},
    oracle::{paper::PaperOp, PaperOracle, SettlementOracle},
    price::{Freshness, PriceCacheConfig, PriceFeedCache, PriceQuote, PriceSource},
    rounds::{LedgerConfig, PredictionLedger, RoundScheduler, SchedulerConfig},
    store::{RoundStore, SqliteStore, UserStore},
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

const ALICE: &str = "0x00000000000000000000000000000000000a11ce";
const BOB: &str = "0x0000000000000000000000000000000000000b0b";

/// Serves queued prices; repeats the last one when the queue runs dry and
/// fails while switched off.
struct FlakySource {
    queue: Mutex<VecDeque<Decimal>>,
    last: Mutex<Option<Decimal>>,
    down: AtomicBool,
}

impl FlakySource {
    fn new(prices: &[Decimal]) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(prices.iter().copied().collect()),
            last: Mutex::new(None),
            down: AtomicBool::new(false),
        })
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl PriceSource for FlakySource {
    async fn fetch_price(&self) -> Result<PriceQuote> {
        if self.down.load(Ordering::SeqCst) {
            bail!("price API unavailable");
        }
        let next = self.queue.lock().pop_front();
        let price = match next.or(*self.last.lock()) {
            Some(p) => p,
            None => bail!("no price configured"),
        };
        *self.last.lock() = Some(price);
        Ok(PriceQuote {
            price,
            change_24h: 0.0,
            volume_24h: Decimal::ZERO,
            market_cap: Decimal::ZERO,
        })
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

struct World {
    _dir: tempfile::TempDir,
    store: Arc<SqliteStore>,
    oracle: Arc<PaperOracle>,
    source: Arc<FlakySource>,
    prices: Arc<PriceFeedCache>,
    broadcaster: Arc<EventBroadcaster>,
    scheduler: RoundScheduler,
    ledger: PredictionLedger,
}

impl World {
    fn new(prices: &[Decimal]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(SqliteStore::new(dir.path().join("rounds.db").to_str().unwrap()).unwrap());
        let config = SchedulerConfig::default();
        let oracle = Arc::new(PaperOracle::new(
            store.clone(),
            config.lock_after,
            config.end_after,
        ));
        let source = FlakySource::new(prices);
        let cache = Arc::new(PriceFeedCache::new(source.clone(), PriceCacheConfig::default()));
        let broadcaster = Arc::new(EventBroadcaster::new());
        let scheduler = RoundScheduler::new(
            store.clone(),
            oracle.clone(),
            cache.clone(),
            broadcaster.clone(),
            config,
        );
        let ledger = PredictionLedger::new(
            store.clone(),
            oracle.clone(),
            broadcaster.clone(),
            LedgerConfig::default(),
        );
        Self {
            _dir: dir,
            store,
            oracle,
            source,
            prices: cache,
            broadcaster,
            scheduler,
            ledger,
        }
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
}

fn tx(n: u64) -> String {
    format!("0x{n:064x}")
}

#[tokio::test]
async fn round_locks_and_resolves_from_price_history() {
    let world = World::new(&[dec!(0.15), dec!(0.17)]);
    let mut feed = world.broadcaster.subscribe();

    let report = world.scheduler.tick_at(t0()).await;
    assert_eq!(report.started, Some(1));
    let round = world.store.find_round(1).await.unwrap().unwrap();
    assert_eq!(round.start_price, dec!(0.15));
    assert_eq!(round.lock_time, t0() + Duration::hours(24));
    assert_eq!(round.end_time, t0() + Duration::hours(48));
    assert!(matches!(
        feed.recv().await.unwrap().event,
        ServerEvent::RoundStarted { round_id: 1, .. }
    ));

    let report = world.scheduler.tick_at(t0() + Duration::hours(24)).await;
    assert_eq!(report.locked, vec![1]);
    let round = world.store.find_round(1).await.unwrap().unwrap();
    assert_eq!(round.state, RoundState::Locked);
    assert_eq!(round.lock_price, Some(dec!(0.17)));
    assert_eq!(
        feed.recv().await.unwrap().event,
        ServerEvent::RoundLocked {
            round_id: 1,
            lock_price: dec!(0.17)
        }
    );

    let end = t0() + Duration::hours(48);
    world
        .prices
        .record_price_point_at(end + Duration::minutes(2), dec!(0.19));
    let report = world.scheduler.tick_at(end + Duration::minutes(3)).await;
    assert_eq!(report.resolved, vec![1]);

    let round = world.store.find_round(1).await.unwrap().unwrap();
    assert_eq!(round.state, RoundState::Resolved);
    assert!(round.resolved);
    assert_eq!(round.end_price, Some(dec!(0.19)));
    assert_eq!(round.winning_position, Some(Position::Up));

    // exactly one ACTIVE round at every point
    let active = world
        .store
        .find_rounds_by_state(RoundState::Active, Default::default())
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn stake_settle_and_claim() {
    let world = World::new(&[dec!(0.15), dec!(0.17)]);
    world.scheduler.tick_at(t0()).await;

    world
        .ledger
        .submit_prediction_at(ALICE, 1, Position::Up, dec!(50), &tx(1), t0() + Duration::hours(1))
        .await
        .unwrap();
    let err = world
        .ledger
        .submit_prediction_at(ALICE, 1, Position::Up, dec!(5), &tx(2), t0() + Duration::hours(2))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Conflict(1)));
    world
        .ledger
        .submit_prediction_at(BOB, 1, Position::Down, dec!(70.5), &tx(3), t0() + Duration::hours(3))
        .await
        .unwrap();

    world.scheduler.tick_at(t0() + Duration::hours(24)).await;

    // too early to claim
    assert!(matches!(
        world.ledger.claim(BOB, 1).await.unwrap_err(),
        LedgerError::NotResolved(1)
    ));

    let end = t0() + Duration::hours(48);
    world
        .prices
        .record_price_point_at(end, dec!(0.16));
    let report = world.scheduler.tick_at(end + Duration::minutes(1)).await;
    assert_eq!(report.resolved, vec![1]);
    let round = world.store.find_round(1).await.unwrap().unwrap();
    assert_eq!(round.winning_position, Some(Position::Down));

    let alice = world.ledger.prediction(ALICE, 1).await.unwrap().unwrap();
    assert_eq!(alice.is_winning, Some(false));
    assert_eq!(alice.claimable_amount, Decimal::ZERO);
    let bob = world.ledger.prediction(BOB, 1).await.unwrap().unwrap();
    assert_eq!(bob.is_winning, Some(true));
    assert_eq!(bob.claimable_amount, dec!(120.5));

    assert!(matches!(
        world.ledger.claim(ALICE, 1).await.unwrap_err(),
        LedgerError::NotWinning(1)
    ));

    let receipt = world.ledger.claim(BOB, 1).await.unwrap();
    assert_eq!(receipt.amount, dec!(120.5));
    let bob = world.ledger.prediction(BOB, 1).await.unwrap().unwrap();
    assert!(bob.claimed);
    assert!(bob.claimed_at.is_some());
    let stats = world.store.get_user_stats(BOB).await.unwrap().unwrap();
    assert_eq!(stats.total_winnings, dec!(120.5));
    assert_eq!(stats.current_win_streak, 1);

    assert!(matches!(
        world.ledger.claim(BOB, 1).await.unwrap_err(),
        LedgerError::AlreadyClaimed(1)
    ));
    assert_eq!(world.store.get_user_stats(BOB).await.unwrap().unwrap(), stats);
    assert_eq!(world.oracle.call_count(PaperOp::Claim), 1);
}

#[tokio::test]
async fn lost_lock_write_settles_on_oracle_price() {
    let world = World::new(&[dec!(0.15), dec!(0.20)]);
    world.scheduler.tick_at(t0()).await;
    for (user, position, n) in [(ALICE, Position::Up, 1), (BOB, Position::Down, 2)] {
        world
            .ledger
            .submit_prediction_at(user, 1, position, dec!(50), &tx(n), t0() + Duration::hours(1))
            .await
            .unwrap();
    }

    // the oracle locked round 1 but the keeper never recorded it
    world
        .oracle
        .lock_round(1, dec!(0.10))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let report = world.scheduler.tick_at(t0() + Duration::hours(24)).await;
    assert_eq!(report.locked, vec![1]);
    let round = world.store.find_round(1).await.unwrap().unwrap();
    assert_eq!(round.lock_price, Some(dec!(0.10)));

    let end = t0() + Duration::hours(48);
    world.prices.record_price_point_at(end, dec!(0.15));
    let report = world.scheduler.tick_at(end + Duration::minutes(1)).await;
    assert_eq!(report.resolved, vec![1]);
    let round = world.store.find_round(1).await.unwrap().unwrap();
    assert_eq!(round.winning_position, Some(Position::Up));

    let alice = world.ledger.prediction(ALICE, 1).await.unwrap().unwrap();
    assert_eq!(alice.is_winning, Some(true));
    assert_eq!(alice.claimable_amount, dec!(100));
    let bob = world.ledger.prediction(BOB, 1).await.unwrap().unwrap();
    assert_eq!(bob.is_winning, Some(false));

    let receipt = world.ledger.claim(ALICE, 1).await.unwrap();
    assert_eq!(receipt.amount, dec!(100));
}

#[tokio::test]
async fn stale_prices_keep_rounds_moving() {
    let world = World::new(&[dec!(0.15)]);
    world.scheduler.tick_at(t0()).await;

    world.source.set_down(true);
    for minutes in [2, 4, 6] {
        let snapshot = world
            .prices
            .get_current_price_at(t0() + Duration::minutes(minutes))
            .await;
        assert_eq!(snapshot.price, dec!(0.15));
        assert_eq!(snapshot.freshness, Freshness::Stale);
    }

    let report = world.scheduler.tick_at(t0() + Duration::hours(24)).await;
    assert_eq!(report.locked, vec![1]);
    assert_eq!(report.started, Some(2));
    let round = world.store.find_round(1).await.unwrap().unwrap();
    assert_eq!(round.lock_price, Some(dec!(0.15)));
}

#[tokio::test]
async fn racing_keepers_start_one_round() {
    let world = World::new(&[dec!(0.15)]);
    let rival = RoundScheduler::new(
        world.store.clone(),
        world.oracle.clone(),
        world.prices.clone(),
        world.broadcaster.clone(),
        SchedulerConfig::default(),
    );
    assert_ne!(rival.instance_id(), world.scheduler.instance_id());

    let (a, b) = tokio::join!(world.scheduler.tick_at(t0()), rival.tick_at(t0()));
    let started: Vec<u64> = a.started.into_iter().chain(b.started).collect();
    assert_eq!(started, vec![1]);
    assert_eq!(world.oracle.call_count(PaperOp::Start), 1);
    assert_eq!(world.store.count_rounds().await.unwrap(), 1);
}
