//! User-triggered ledger operations: stake submission and reward claims.

use crate::{
    broadcast::{user_room, EventBroadcaster, ServerEvent},
    config::AppConfig,
    errors::LedgerError,
    models::{normalize_address, normalize_tx_hash, Position, Prediction, RoundState},
    oracle::SettlementOracle,
    store::{InsertOutcome, Store},
};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub min_stake: Decimal,
    pub max_stake: Decimal,
    pub call_timeout: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            min_stake: Decimal::ONE,
            max_stake: Decimal::from(100_000),
            call_timeout: Duration::from_secs(15),
        }
    }
}

impl LedgerConfig {
    pub fn from_app(cfg: &AppConfig) -> Self {
        Self {
            min_stake: cfg.min_stake,
            max_stake: cfg.max_stake,
            call_timeout: cfg.external_call_timeout,
        }
    }
}

/// A completed claim
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimReceipt {
    pub round_id: u64,
    pub amount: Decimal,
    pub transaction_hash: String,
    pub claimed_at: DateTime<Utc>,
}

pub struct PredictionLedger {
    store: Arc<dyn Store>,
    oracle: Arc<dyn SettlementOracle>,
    broadcaster: Arc<EventBroadcaster>,
    config: LedgerConfig,
}

impl PredictionLedger {
    pub fn new(
        store: Arc<dyn Store>,
        oracle: Arc<dyn SettlementOracle>,
        broadcaster: Arc<EventBroadcaster>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            store,
            oracle,
            broadcaster,
            config,
        }
    }

    pub async fn submit_prediction(
        &self,
        user: &str,
        round_id: u64,
        position: Position,
        amount: Decimal,
        proof_of_stake_tx_hash: &str,
    ) -> Result<Prediction, LedgerError> {
        self.submit_prediction_at(user, round_id, position, amount, proof_of_stake_tx_hash, Utc::now())
            .await
    }

    pub async fn submit_prediction_at(
        &self,
        user: &str,
        round_id: u64,
        position: Position,
        amount: Decimal,
        proof_of_stake_tx_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Prediction, LedgerError> {
        let user = normalize_address(user)
            .ok_or_else(|| LedgerError::InvalidArgument(format!("malformed address {user:?}")))?;
        let tx_hash = normalize_tx_hash(proof_of_stake_tx_hash).ok_or_else(|| {
            LedgerError::InvalidArgument(format!(
                "malformed transaction hash {proof_of_stake_tx_hash:?}"
            ))
        })?;
        if amount < self.config.min_stake || amount > self.config.max_stake {
            return Err(LedgerError::InvalidArgument(format!(
                "amount {} outside [{}, {}]",
                amount, self.config.min_stake, self.config.max_stake
            )));
        }

        let prediction = Prediction::new(&user, round_id, position, amount, &tx_hash, now);
        match self.store.insert_prediction(&prediction).await? {
            InsertOutcome::Inserted => {}
            InsertOutcome::RoundNotFound => {
                return Err(LedgerError::NotFound(format!("round {round_id}")))
            }
            InsertOutcome::RoundClosed(state) => {
                return Err(LedgerError::InvalidState { round_id, state })
            }
            InsertOutcome::DuplicateEntry => return Err(LedgerError::Conflict(round_id)),
            InsertOutcome::DuplicateTxHash => {
                return Err(LedgerError::InvalidArgument(format!(
                    "transaction {tx_hash} was already used"
                )))
            }
        }

        info!(
            user = %prediction.user,
            round_id,
            position = %position,
            amount = %amount,
            "prediction accepted"
        );
        self.broadcaster.prediction_accepted(&prediction);
        Ok(prediction)
    }

    /// Claim the reward for a winning prediction. The claimable amount is
    /// re-read from the oracle rather than trusted from the stored row.
    pub async fn claim(&self, user: &str, round_id: u64) -> Result<ClaimReceipt, LedgerError> {
        let user = normalize_address(user)
            .ok_or_else(|| LedgerError::InvalidArgument(format!("malformed address {user:?}")))?;

        let prediction = self
            .store
            .find_prediction(&user, round_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("prediction for round {round_id}")))?;
        if prediction.claimed {
            return Err(LedgerError::AlreadyClaimed(round_id));
        }

        let round = self
            .store
            .find_round(round_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("round {round_id}")))?;
        if !round.resolved || round.state != RoundState::Resolved {
            return Err(LedgerError::NotResolved(round_id));
        }
        if round.winning_position != Some(prediction.position) {
            return Err(LedgerError::NotWinning(round_id));
        }

        let amount = self
            .bounded(self.oracle.claimable_amount(round_id, &user))
            .await?;
        if amount <= Decimal::ZERO {
            return Err(LedgerError::NothingToClaim(round_id));
        }

        let pending = self
            .bounded(self.oracle.claim_reward(round_id, &user))
            .await?;
        let receipt = self.bounded(pending.wait()).await?;

        let claimed_at = Utc::now();
        if !self
            .store
            .mark_claimed(prediction.id, amount, claimed_at)
            .await?
        {
            // a concurrent claim for the same prediction won the write
            warn!(user = %user, round_id, tx = %receipt.hash, "claim already recorded");
            return Err(LedgerError::AlreadyClaimed(round_id));
        }

        info!(user = %user, round_id, amount = %amount, tx = %receipt.hash, "reward claimed");
        self.broadcaster.publish_to(
            &user_room(&user),
            ServerEvent::RewardClaimed {
                round_id,
                amount,
                transaction_hash: Some(receipt.hash.clone()),
            },
        );

        Ok(ClaimReceipt {
            round_id,
            amount,
            transaction_hash: receipt.hash,
            claimed_at,
        })
    }

    pub async fn prediction(&self, user: &str, round_id: u64) -> Result<Option<Prediction>, LedgerError> {
        let Some(user) = normalize_address(user) else {
            return Ok(None);
        };
        Ok(self.store.find_prediction(&user, round_id).await?)
    }

    pub async fn predictions_for_user(
        &self,
        user: &str,
        limit: Option<u32>,
    ) -> Result<Vec<Prediction>, LedgerError> {
        let Some(user) = normalize_address(user) else {
            return Ok(Vec::new());
        };
        Ok(self.store.predictions_by_user(&user, limit).await?)
    }

    /// Winning predictions with something left to claim.
    pub async fn unclaimed(&self, user: &str) -> Result<Vec<Prediction>, LedgerError> {
        let Some(user) = normalize_address(user) else {
            return Ok(Vec::new());
        };
        Ok(self.store.unclaimed_predictions(&user).await?)
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, LedgerError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(LedgerError::Unavailable(anyhow!(
                "oracle call timed out after {:?}",
                self.config.call_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::Round,
        oracle::{paper::PaperOp, PaperOracle},
        rounds::SettlementReconciler,
        store::{PredictionStore, RoundStore, SqliteStore, UserStore},
    };
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    const A: &str = "0x000000000000000000000000000000000000000A";
    const B: &str = "0x000000000000000000000000000000000000000b";

    fn tx(n: u8) -> String {
        format!("0x{}", format!("{n:02x}").repeat(32))
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<SqliteStore>,
        oracle: Arc<PaperOracle>,
        broadcaster: Arc<EventBroadcaster>,
        ledger: PredictionLedger,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(dir.path().join("l.db").to_str().unwrap()).unwrap());
        let oracle = Arc::new(PaperOracle::new(
            store.clone(),
            ChronoDuration::hours(24),
            ChronoDuration::hours(24),
        ));
        let broadcaster = Arc::new(EventBroadcaster::new());
        let ledger = PredictionLedger::new(
            store.clone(),
            oracle.clone(),
            broadcaster.clone(),
            LedgerConfig::default(),
        );

        oracle.start_round(dec!(0.15)).await.unwrap();
        let round = Round::open(
            1,
            Utc::now(),
            ChronoDuration::hours(24),
            ChronoDuration::hours(24),
            dec!(0.15),
            None,
        )
        .unwrap();
        store.insert_round_if_no_active(&round).await.unwrap();

        Fixture {
            _dir: dir,
            store,
            oracle,
            broadcaster,
            ledger,
        }
    }

    /// Lock and resolve round 1 in the store and the oracle, then reconcile.
    async fn settle(f: &Fixture, lock_price: Decimal, end_price: Decimal) {
        let round = f.store.find_round(1).await.unwrap().unwrap();
        let locked = round.lock(lock_price, None, round.lock_time).unwrap();
        assert!(f.store.save_transition(RoundState::Active, &locked).await.unwrap());
        f.oracle.lock_round(1, lock_price).await.unwrap();
        let resolved = locked.resolve(end_price, None, locked.end_time).unwrap();
        assert!(f.store.save_transition(RoundState::Locked, &resolved).await.unwrap());
        f.oracle.resolve_round(1, end_price).await.unwrap();

        SettlementReconciler::new(f.store.clone(), f.oracle.clone(), Duration::from_secs(5))
            .reconcile(&resolved)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_submit_updates_round_and_user() {
        let f = fixture().await;
        let mut feed = f.broadcaster.subscribe();

        let p = f
            .ledger
            .submit_prediction(A, 1, Position::Up, dec!(50), &tx(1))
            .await
            .unwrap();
        assert_eq!(p.user, A.to_lowercase());

        let round = f.store.find_round(1).await.unwrap().unwrap();
        assert_eq!(round.total_up_amount, dec!(50));
        assert_eq!(round.participant_count, 1);
        let stats = f.store.get_user_stats(&p.user).await.unwrap().unwrap();
        assert_eq!(stats.total_staked, dec!(50));
        assert_eq!(stats.total_rounds, 1);

        let made = feed.recv().await.unwrap();
        assert!(matches!(made.event, ServerEvent::PredictionMade { round_id: 1, .. }));
        let confirmed = feed.recv().await.unwrap();
        assert!(matches!(confirmed.event, ServerEvent::PredictionConfirmed { .. }));
    }

    #[tokio::test]
    async fn test_second_stake_conflicts() {
        let f = fixture().await;
        f.ledger
            .submit_prediction(A, 1, Position::Up, dec!(50), &tx(1))
            .await
            .unwrap();
        let err = f
            .ledger
            .submit_prediction(A, 1, Position::Down, dec!(10), &tx(2))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(1)));
        assert_eq!(f.store.predictions_by_round(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_submit_rejections() {
        let f = fixture().await;
        let err = f
            .ledger
            .submit_prediction(A, 1, Position::Up, dec!(0.5), &tx(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidArgument(_)));
        let err = f
            .ledger
            .submit_prediction(A, 1, Position::Up, dec!(100001), &tx(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidArgument(_)));
        let err = f
            .ledger
            .submit_prediction("alice", 1, Position::Up, dec!(5), &tx(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidArgument(_)));
        let err = f
            .ledger
            .submit_prediction(A, 9, Position::Up, dec!(5), &tx(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));

        f.ledger
            .submit_prediction(A, 1, Position::Up, dec!(5), &tx(1))
            .await
            .unwrap();
        let err = f
            .ledger
            .submit_prediction(B, 1, Position::Up, dec!(5), &tx(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_submit_after_lock_time_is_refused() {
        let f = fixture().await;
        let late = Utc::now() + ChronoDuration::hours(25);
        let err = f
            .ledger
            .submit_prediction_at(A, 1, Position::Up, dec!(5), &tx(1), late)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvalidState {
                round_id: 1,
                state: RoundState::Active
            }
        ));
    }

    #[tokio::test]
    async fn test_claim_guards() {
        let f = fixture().await;
        f.ledger
            .submit_prediction(A, 1, Position::Up, dec!(50), &tx(1))
            .await
            .unwrap();
        f.ledger
            .submit_prediction(B, 1, Position::Down, dec!(70.5), &tx(2))
            .await
            .unwrap();

        assert!(matches!(
            f.ledger.claim(B, 1).await.unwrap_err(),
            LedgerError::NotResolved(1)
        ));
        assert!(matches!(
            f.ledger.claim(B, 7).await.unwrap_err(),
            LedgerError::NotFound(_)
        ));

        settle(&f, dec!(0.17), dec!(0.16)).await;

        assert!(matches!(
            f.ledger.claim(A, 1).await.unwrap_err(),
            LedgerError::NotWinning(1)
        ));
        let before = f.store.find_prediction(&A.to_lowercase(), 1).await.unwrap();
        assert_eq!(before.unwrap().claimed, false);
    }

    #[tokio::test]
    async fn test_claim_pays_once() {
        let f = fixture().await;
        f.ledger
            .submit_prediction(A, 1, Position::Up, dec!(50), &tx(1))
            .await
            .unwrap();
        f.ledger
            .submit_prediction(B, 1, Position::Down, dec!(70.5), &tx(2))
            .await
            .unwrap();
        settle(&f, dec!(0.17), dec!(0.16)).await;
        assert_eq!(f.ledger.unclaimed(B).await.unwrap().len(), 1);

        let mut feed = f.broadcaster.subscribe();
        let receipt = f.ledger.claim(B, 1).await.unwrap();
        assert_eq!(receipt.amount, dec!(120.5));

        let p = f.ledger.prediction(B, 1).await.unwrap().unwrap();
        assert!(p.claimed);
        assert!(p.claimed_at.is_some());
        let stats = f.store.get_user_stats(B).await.unwrap().unwrap();
        assert_eq!(stats.total_winnings, dec!(120.5));
        assert_eq!(stats.current_win_streak, 1);
        assert!(matches!(
            feed.recv().await.unwrap().event,
            ServerEvent::RewardClaimed { round_id: 1, .. }
        ));

        assert!(matches!(
            f.ledger.claim(B, 1).await.unwrap_err(),
            LedgerError::AlreadyClaimed(1)
        ));
        let after = f.store.get_user_stats(B).await.unwrap().unwrap();
        assert_eq!(after, stats);
        assert!(f.ledger.unclaimed(B).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_oracle_claim_leaves_prediction_unclaimed() {
        let f = fixture().await;
        f.ledger
            .submit_prediction(B, 1, Position::Down, dec!(10), &tx(2))
            .await
            .unwrap();
        settle(&f, dec!(0.17), dec!(0.16)).await;

        f.oracle.fail_next(PaperOp::Claim, 1);
        let err = f.ledger.claim(B, 1).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!f.ledger.prediction(B, 1).await.unwrap().unwrap().claimed);

        assert_eq!(f.ledger.claim(B, 1).await.unwrap().amount, dec!(10));
    }
}
