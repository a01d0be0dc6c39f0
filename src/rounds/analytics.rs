use crate::{
    models::PlatformStats,
    store::Store,
};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

const USER_BATCH: u32 = 100;
const PARTICIPANT_WINDOW: u32 = 10;
const PRICE_POINT_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecomputeReport {
    pub users: usize,
    /// Users whose cached aggregates differed from their history
    pub corrected: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub price_points: usize,
    pub leases: usize,
}

/// Periodic aggregate maintenance: user stats, platform stats and pruning.
pub struct Analytics {
    store: Arc<dyn Store>,
    latest: RwLock<Option<PlatformStats>>,
}

impl Analytics {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            latest: RwLock::new(None),
        }
    }

    /// Rebuild every user's aggregates from their prediction history.
    pub async fn recompute_user_stats(&self) -> Result<RecomputeReport> {
        let mut report = RecomputeReport::default();
        let mut offset = 0;

        loop {
            let users = self.store.list_users(offset, USER_BATCH).await?;
            if users.is_empty() {
                break;
            }
            for user in &users {
                report.users += 1;
                match self.store.rederive_user_stats(user).await {
                    Ok(true) => report.corrected += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(user = %user, error = %e, "user stats recompute failed");
                        report.failed += 1;
                    }
                }
            }
            if users.len() < USER_BATCH as usize {
                break;
            }
            offset += USER_BATCH;
        }

        info!(
            users = report.users,
            corrected = report.corrected,
            failed = report.failed,
            "user stats recomputed"
        );
        Ok(report)
    }

    pub async fn compute_platform_stats(&self) -> Result<PlatformStats> {
        self.compute_platform_stats_at(Utc::now()).await
    }

    pub async fn compute_platform_stats_at(&self, now: DateTime<Utc>) -> Result<PlatformStats> {
        let recent = self
            .store
            .recent_resolved_rounds(PARTICIPANT_WINDOW)
            .await?;
        let avg_participants = if recent.is_empty() {
            0
        } else {
            let sum: u64 = recent.iter().map(|r| u64::from(r.participant_count)).sum();
            (sum / recent.len() as u64) as u32
        };

        let stats = PlatformStats {
            total_users: self.store.count_users().await?,
            total_rounds: self.store.count_rounds().await?,
            total_predictions: self.store.count_predictions().await?,
            total_volume: self.store.total_volume().await?,
            avg_participants,
            last_updated: now,
        };
        info!(
            users = stats.total_users,
            rounds = stats.total_rounds,
            predictions = stats.total_predictions,
            volume = %stats.total_volume,
            "platform stats updated"
        );
        *self.latest.write() = Some(stats.clone());
        Ok(stats)
    }

    pub fn platform_stats(&self) -> Option<PlatformStats> {
        self.latest.read().clone()
    }

    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let cutoff = now - Duration::days(PRICE_POINT_RETENTION_DAYS);
        let report = CleanupReport {
            price_points: self.store.prune_round_price_points(cutoff).await?,
            leases: self.store.prune_expired_leases(now).await?,
        };
        info!(
            price_points = report.price_points,
            leases = report.leases,
            "cleanup complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{Position, Prediction, Round, RoundState, Settlement, UserStats},
        store::{LeaseStore, PredictionStore, RoundPricePoint, RoundStore, SqliteStore, UserStore},
    };
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    fn store() -> (tempfile::TempDir, Arc<SqliteStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(dir.path().join("a.db").to_str().unwrap()).unwrap());
        (dir, store)
    }

    async fn seed(store: &SqliteStore) {
        let round = Round::open(1, t0(), Duration::hours(24), Duration::hours(24), dec!(1), None)
            .unwrap();
        store.insert_round_if_no_active(&round).await.unwrap();
        for (i, position) in [Position::Up, Position::Down, Position::Up].into_iter().enumerate() {
            let user = format!("0x{:040x}", i + 1);
            let tx = format!("0x{:064x}", i + 1);
            let p = Prediction::new(&user, 1, position, dec!(10), &tx, t0());
            store.insert_prediction(&p).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_recompute_repairs_drifted_stats() {
        let (_dir, store) = store();
        seed(&store).await;
        let analytics = Analytics::new(store.clone());

        let clean = analytics.recompute_user_stats().await.unwrap();
        assert_eq!(clean.users, 3);
        assert_eq!(clean.failed, 0);

        let user = format!("0x{:040x}", 1);
        let mut drifted = store.get_user_stats(&user).await.unwrap().unwrap();
        drifted.total_staked = dec!(999);
        store.replace_user_stats(&user, &drifted).await.unwrap();

        let report = analytics.recompute_user_stats().await.unwrap();
        assert_eq!(report.corrected, 1);
        let fixed = store.get_user_stats(&user).await.unwrap().unwrap();
        assert_eq!(fixed.total_staked, dec!(10));
    }

    #[tokio::test]
    async fn test_recompute_leaves_late_claim_streak_alone() {
        let (_dir, store) = store();
        let user = format!("0x{:040x}", 7);
        let mut stakes = Vec::new();
        for id in 1..=2u64 {
            let round =
                Round::open(id, t0(), Duration::hours(24), Duration::hours(24), dec!(1), None)
                    .unwrap();
            store.insert_round_if_no_active(&round).await.unwrap();
            let p = Prediction::new(&user, id, Position::Up, dec!(10), &format!("0x{id:064x}"), t0());
            store.insert_prediction(&p).await.unwrap();
            let locked = round.lock(dec!(1), None, round.lock_time).unwrap();
            store
                .save_transition(RoundState::Active, &locked)
                .await
                .unwrap();
            stakes.push(p);
        }

        store
            .apply_settlement(stakes[0].id, Settlement::winning(dec!(18)))
            .await
            .unwrap();
        store
            .apply_settlement(stakes[1].id, Settlement::losing())
            .await
            .unwrap();
        store
            .mark_claimed(stakes[0].id, dec!(18), t0() + Duration::days(3))
            .await
            .unwrap();

        let analytics = Analytics::new(store.clone());
        let report = analytics.recompute_user_stats().await.unwrap();
        assert_eq!(report.corrected, 0);
        let stats = store.get_user_stats(&user).await.unwrap().unwrap();
        let history = store.predictions_by_user(&user, None).await.unwrap();
        assert_eq!(stats, UserStats::derive(&history));
        assert_eq!(stats.current_win_streak, 0);
        assert_eq!(stats.max_win_streak, 1);
    }

    #[tokio::test]
    async fn test_platform_stats() {
        let (_dir, store) = store();
        seed(&store).await;
        let analytics = Analytics::new(store.clone());
        assert!(analytics.platform_stats().is_none());

        let stats = analytics.compute_platform_stats_at(t0()).await.unwrap();
        assert_eq!(stats.total_users, 3);
        assert_eq!(stats.total_rounds, 1);
        assert_eq!(stats.total_predictions, 3);
        assert_eq!(stats.total_volume, dec!(30));
        // no resolved rounds yet
        assert_eq!(stats.avg_participants, 0);
        assert_eq!(analytics.platform_stats(), Some(stats));
    }

    #[tokio::test]
    async fn test_cleanup_prunes_old_points_and_leases() {
        let (_dir, store) = store();
        seed(&store).await;
        let analytics = Analytics::new(store.clone());

        for (offset, price) in [(0, dec!(1)), (10, dec!(2))] {
            let point = RoundPricePoint {
                timestamp: t0() + Duration::days(offset),
                price,
                source: "live".into(),
            };
            store.add_round_price_point(1, &point, 100).await.unwrap();
        }
        store
            .try_acquire_lease("lock:1", "k", t0(), Duration::minutes(10))
            .await
            .unwrap();

        let report = analytics.cleanup(t0() + Duration::days(10)).await.unwrap();
        assert_eq!(report, CleanupReport { price_points: 1, leases: 1 });
        assert_eq!(store.round_price_points(1).await.unwrap().len(), 1);
    }
}
