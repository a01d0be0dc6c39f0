//! Persistence seams for rounds, predictions, user aggregates and leases.
//!
//! Every lifecycle write is conditional: callers pass the state they expect
//! to replace and get back whether their write won. Nothing here trusts an
//! in-memory flag to prevent double processing.

pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::models::{Prediction, Round, RoundState, Settlement, UserStats};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Extra predicates for [`RoundStore::find_rounds_by_state`]
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundFilter {
    /// Only rounds with `lock_time <= t`
    pub lock_due_by: Option<DateTime<Utc>>,
    /// Only rounds with `end_time <= t`
    pub end_due_by: Option<DateTime<Utc>>,
    pub unresolved_only: bool,
    pub limit: Option<u32>,
}

impl RoundFilter {
    pub fn lock_due(now: DateTime<Utc>) -> Self {
        Self {
            lock_due_by: Some(now),
            ..Self::default()
        }
    }

    pub fn resolve_due(now: DateTime<Utc>) -> Self {
        Self {
            end_due_by: Some(now),
            unresolved_only: true,
            ..Self::default()
        }
    }
}

/// Chart sample attached to a live round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundPricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
    pub source: String,
}

/// Result of the atomic prediction insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The user already holds a prediction for the round
    DuplicateEntry,
    /// The proof-of-stake transaction was already used
    DuplicateTxHash,
    RoundNotFound,
    /// Round is not ACTIVE, or its lock time has passed
    RoundClosed(RoundState),
}

#[async_trait::async_trait]
pub trait RoundStore: Send + Sync {
    async fn find_round(&self, round_id: u64) -> Result<Option<Round>>;

    /// Rounds in `state`, oldest first.
    async fn find_rounds_by_state(&self, state: RoundState, filter: RoundFilter)
        -> Result<Vec<Round>>;

    async fn find_active_round(&self) -> Result<Option<Round>>;

    /// The ACTIVE round, else the most recent LOCKED one.
    async fn find_current_round(&self) -> Result<Option<Round>>;

    async fn recent_rounds(&self, limit: u32) -> Result<Vec<Round>>;

    async fn recent_resolved_rounds(&self, limit: u32) -> Result<Vec<Round>>;

    /// Insert an ACTIVE round unless one already exists. Returns whether
    /// the insert happened.
    async fn insert_round_if_no_active(&self, round: &Round) -> Result<bool>;

    /// Compare-and-swap on `state`: persist the lifecycle columns of `round`
    /// only if the stored row is still in `expected`. Stake totals and
    /// participant counts are never overwritten here.
    async fn save_transition(&self, expected: RoundState, round: &Round) -> Result<bool>;

    /// Append a chart point, keeping at most `cap` per round.
    async fn add_round_price_point(
        &self,
        round_id: u64,
        point: &RoundPricePoint,
        cap: u32,
    ) -> Result<()>;

    async fn round_price_points(&self, round_id: u64) -> Result<Vec<RoundPricePoint>>;

    async fn prune_round_price_points(&self, older_than: DateTime<Utc>) -> Result<usize>;

    async fn count_rounds(&self) -> Result<u64>;

    /// RESOLVED rounds that still have predictions without an outcome.
    async fn rounds_with_unsettled_predictions(&self) -> Result<Vec<Round>>;
}

#[async_trait::async_trait]
pub trait PredictionStore: Send + Sync {
    /// Insert the prediction, bump the round's totals and participant
    /// counts, and add the stake to the user's aggregates, all in one
    /// transaction.
    async fn insert_prediction(&self, prediction: &Prediction) -> Result<InsertOutcome>;

    async fn find_prediction(&self, user: &str, round_id: u64) -> Result<Option<Prediction>>;

    async fn predictions_by_round(&self, round_id: u64) -> Result<Vec<Prediction>>;

    /// Newest first.
    async fn predictions_by_user(&self, user: &str, limit: Option<u32>)
        -> Result<Vec<Prediction>>;

    /// Winning, unclaimed predictions with a positive claimable amount.
    async fn unclaimed_predictions(&self, user: &str) -> Result<Vec<Prediction>>;

    /// Write the outcome onto an unclaimed prediction. Returns `true` when
    /// the prediction had no outcome before this call; a first-time loss
    /// also resets the owner's win streak in the same transaction.
    async fn apply_settlement(&self, prediction_id: Uuid, settlement: Settlement)
        -> Result<bool>;

    /// Compare-and-swap `claimed` from false to true, recording `amount` as
    /// the payout and crediting the user's winnings and streak.
    async fn mark_claimed(
        &self,
        prediction_id: Uuid,
        amount: Decimal,
        claimed_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn count_predictions(&self) -> Result<u64>;

    async fn total_volume(&self) -> Result<Decimal>;
}

#[async_trait::async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user_stats(&self, user: &str) -> Result<Option<UserStats>>;

    async fn replace_user_stats(&self, user: &str, stats: &UserStats) -> Result<()>;

    /// Rebuild the cached row from prediction history in one atomic step.
    /// Returns true when the cached row was wrong.
    async fn rederive_user_stats(&self, user: &str) -> Result<bool>;

    /// Addresses ordered for stable paging.
    async fn list_users(&self, offset: u32, limit: u32) -> Result<Vec<String>>;

    async fn count_users(&self) -> Result<u64>;
}

#[async_trait::async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take `key` for `owner` until `now + ttl` unless another owner holds
    /// an unexpired lease. Re-acquiring an owned lease extends it.
    async fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<bool>;

    async fn release_lease(&self, key: &str, owner: &str) -> Result<()>;

    async fn prune_expired_leases(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Everything the keeper persists
pub trait Store: RoundStore + PredictionStore + UserStore + LeaseStore {}

impl<T> Store for T where T: RoundStore + PredictionStore + UserStore + LeaseStore {}
