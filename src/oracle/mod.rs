//! Settlement oracle seam: the remote service that owns round ids, commits
//! lifecycle prices and computes payouts.

pub mod gateway;
pub mod paper;

pub use gateway::GatewayOracle;
pub use paper::PaperOracle;

use crate::models::Position;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Final state of a committed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub hash: String,
    pub block_number: Option<u64>,
}

/// Handle to a submitted transaction.
#[async_trait::async_trait]
pub trait PendingTx: Send + Sync {
    fn hash(&self) -> &str;

    /// Resolve once the transaction is final; errors if it reverted.
    async fn wait(self: Box<Self>) -> Result<TxReceipt>;
}

/// Events observed on the oracle side, relayed to clients by the broadcaster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OracleEvent {
    RoundStarted {
        round_id: u64,
        start_time: DateTime<Utc>,
        lock_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    },
    RoundLocked {
        round_id: u64,
        lock_price: Decimal,
    },
    RoundResolved {
        round_id: u64,
        end_price: Decimal,
        winning_position: Position,
    },
    PredictionMade {
        user: String,
        round_id: u64,
        position: Position,
        amount: Decimal,
    },
    RewardClaimed {
        user: String,
        round_id: u64,
        amount: Decimal,
    },
}

/// Every call may fail and callers wrap each one in a timeout.
#[async_trait::async_trait]
pub trait SettlementOracle: Send + Sync {
    async fn current_round_id(&self) -> Result<u64>;

    async fn start_round(&self, start_price: Decimal) -> Result<Box<dyn PendingTx>>;

    /// Reverts when the round is already locked.
    async fn lock_round(&self, round_id: u64, lock_price: Decimal) -> Result<Box<dyn PendingTx>>;

    /// Lock price the oracle holds for `round_id`, if it has locked it.
    async fn committed_lock_price(&self, round_id: u64) -> Result<Option<Decimal>>;

    async fn resolve_round(&self, round_id: u64, end_price: Decimal)
        -> Result<Box<dyn PendingTx>>;

    async fn claimable_amount(&self, round_id: u64, user: &str) -> Result<Decimal>;

    async fn claim_reward(&self, round_id: u64, user: &str) -> Result<Box<dyn PendingTx>>;

    /// Bounded stream of oracle-side events. Only the first caller gets it.
    fn take_events(&self) -> Option<mpsc::Receiver<OracleEvent>> {
        None
    }

    fn name(&self) -> &str;
}
