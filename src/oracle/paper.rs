use super::{OracleEvent, PendingTx, SettlementOracle, TxReceipt};
use crate::{models::Position, store::Store};
use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

const EVENT_BUFFER: usize = 256;

/// Oracle operations that can be made to fail in tests and drills
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    CurrentRoundId,
    Start,
    Lock,
    LockPrice,
    Resolve,
    Claimable,
    Claim,
}

#[derive(Debug, Clone, Default)]
struct PaperRound {
    lock_price: Option<Decimal>,
    end_price: Option<Decimal>,
    winner: Option<Position>,
    claimed: HashSet<String>,
}

#[derive(Debug, Default)]
struct PaperState {
    current_round_id: u64,
    rounds: HashMap<u64, PaperRound>,
    failures: HashMap<PaperOp, u32>,
    calls: HashMap<PaperOp, u32>,
}

/// In-process stand-in for the settlement contract.
///
/// Round ids are sequential, transactions confirm immediately, and payouts
/// are parimutuel over the stakes recorded in the store: a winner
/// receives `stake * total_pool / winning_pool`. Lock prices and winners
/// missing from memory (after a restart) are read back from the store.
pub struct PaperOracle {
    store: Arc<dyn Store>,
    lock_after: chrono::Duration,
    end_after: chrono::Duration,
    state: Mutex<PaperState>,
    events_tx: mpsc::Sender<OracleEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<OracleEvent>>>,
}

impl PaperOracle {
    pub fn new(
        store: Arc<dyn Store>,
        lock_after: chrono::Duration,
        end_after: chrono::Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            store,
            lock_after,
            end_after,
            state: Mutex::new(PaperState::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Continue numbering after an existing round (e.g. one found in the store).
    pub fn with_round_id(self, round_id: u64) -> Self {
        self.state.lock().current_round_id = round_id;
        self
    }

    /// Make the next `times` calls of `op` fail.
    pub fn fail_next(&self, op: PaperOp, times: u32) {
        self.state.lock().failures.insert(op, times);
    }

    pub fn call_count(&self, op: PaperOp) -> u32 {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    fn enter(&self, op: PaperOp) -> Result<()> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_default() += 1;
        if let Some(left) = state.failures.get_mut(&op) {
            if *left > 0 {
                *left -= 1;
                bail!("paper oracle: injected failure for {op:?}");
            }
        }
        Ok(())
    }

    fn emit(&self, event: OracleEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            // nobody is draining, or the relay is behind
            debug!(error = %e, "paper oracle event dropped");
        }
    }

    async fn payout(&self, round_id: u64, user: &str, winner: Position) -> Result<Decimal> {
        let predictions = self.store.predictions_by_round(round_id).await?;
        let (mut total, mut winning) = (Decimal::ZERO, Decimal::ZERO);
        let mut stake = None;
        for p in &predictions {
            total += p.amount;
            if p.position == winner {
                winning += p.amount;
            }
            if p.user == user {
                stake = Some((p.position, p.amount));
            }
        }

        match stake {
            Some((position, amount)) if position == winner && winning > Decimal::ZERO => {
                Ok(amount * total / winning)
            }
            _ => Ok(Decimal::ZERO),
        }
    }

    async fn winner_of(&self, round_id: u64) -> Result<Option<Position>> {
        let known = self.state.lock().rounds.get(&round_id).and_then(|r| r.winner);
        if known.is_some() {
            return Ok(known);
        }
        Ok(self
            .store
            .find_round(round_id)
            .await?
            .and_then(|r| r.winning_position))
    }
}

fn tx_hash() -> String {
    format!("0x{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

struct ConfirmedTx {
    hash: String,
}

impl ConfirmedTx {
    fn boxed() -> Box<dyn PendingTx> {
        Box::new(Self { hash: tx_hash() })
    }
}

#[async_trait::async_trait]
impl PendingTx for ConfirmedTx {
    fn hash(&self) -> &str {
        &self.hash
    }

    async fn wait(self: Box<Self>) -> Result<TxReceipt> {
        Ok(TxReceipt {
            hash: self.hash,
            block_number: None,
        })
    }
}

#[async_trait::async_trait]
impl SettlementOracle for PaperOracle {
    async fn current_round_id(&self) -> Result<u64> {
        self.enter(PaperOp::CurrentRoundId)?;
        Ok(self.state.lock().current_round_id)
    }

    async fn start_round(&self, start_price: Decimal) -> Result<Box<dyn PendingTx>> {
        self.enter(PaperOp::Start)?;
        if start_price <= Decimal::ZERO {
            bail!("start price must be positive");
        }
        let round_id = {
            let mut state = self.state.lock();
            state.current_round_id += 1;
            let id = state.current_round_id;
            state.rounds.insert(id, PaperRound::default());
            id
        };

        let start_time = Utc::now();
        let lock_time = start_time + self.lock_after;
        self.emit(OracleEvent::RoundStarted {
            round_id,
            start_time,
            lock_time,
            end_time: lock_time + self.end_after,
        });
        Ok(ConfirmedTx::boxed())
    }

    async fn lock_round(&self, round_id: u64, lock_price: Decimal) -> Result<Box<dyn PendingTx>> {
        self.enter(PaperOp::Lock)?;
        {
            let mut state = self.state.lock();
            let round = state.rounds.entry(round_id).or_default();
            if let Some(committed) = round.lock_price {
                warn!(round_id, %committed, "paper oracle: round already locked");
                bail!("paper oracle: round {round_id} already locked at {committed}");
            }
            round.lock_price = Some(lock_price);
        }
        self.emit(OracleEvent::RoundLocked {
            round_id,
            lock_price,
        });
        Ok(ConfirmedTx::boxed())
    }

    async fn committed_lock_price(&self, round_id: u64) -> Result<Option<Decimal>> {
        self.enter(PaperOp::LockPrice)?;
        Ok(self
            .state
            .lock()
            .rounds
            .get(&round_id)
            .and_then(|r| r.lock_price))
    }

    async fn resolve_round(
        &self,
        round_id: u64,
        end_price: Decimal,
    ) -> Result<Box<dyn PendingTx>> {
        self.enter(PaperOp::Resolve)?;
        let known = self.state.lock().rounds.get(&round_id).and_then(|r| r.lock_price);
        let lock_price = match known {
            Some(price) => price,
            None => self
                .store
                .find_round(round_id)
                .await?
                .and_then(|r| r.lock_price)
                .ok_or_else(|| anyhow!("paper oracle: round {round_id} not locked"))?,
        };
        let winner = {
            let mut state = self.state.lock();
            let round = state.rounds.entry(round_id).or_default();
            round.lock_price.get_or_insert(lock_price);
            if round.winner.is_none() {
                round.end_price = Some(end_price);
                round.winner = Some(Position::winner(lock_price, end_price));
            }
            round.winner.unwrap_or(Position::Down)
        };
        self.emit(OracleEvent::RoundResolved {
            round_id,
            end_price,
            winning_position: winner,
        });
        Ok(ConfirmedTx::boxed())
    }

    async fn claimable_amount(&self, round_id: u64, user: &str) -> Result<Decimal> {
        self.enter(PaperOp::Claimable)?;
        let claimed = self
            .state
            .lock()
            .rounds
            .get(&round_id)
            .is_some_and(|r| r.claimed.contains(user));
        if claimed {
            return Ok(Decimal::ZERO);
        }
        match self.winner_of(round_id).await? {
            Some(winner) => self.payout(round_id, user, winner).await,
            None => Ok(Decimal::ZERO),
        }
    }

    async fn claim_reward(&self, round_id: u64, user: &str) -> Result<Box<dyn PendingTx>> {
        self.enter(PaperOp::Claim)?;
        let winner = self
            .winner_of(round_id)
            .await?
            .ok_or_else(|| anyhow!("paper oracle: round {round_id} not resolved"))?;
        let amount = self.payout(round_id, user, winner).await?;
        if amount <= Decimal::ZERO {
            bail!("paper oracle: nothing to claim for {user} in round {round_id}");
        }
        let mut state = self.state.lock();
        let round = state.rounds.entry(round_id).or_default();
        if !round.claimed.insert(user.to_string()) {
            bail!("paper oracle: {user} already claimed round {round_id}");
        }
        debug!(round_id, user, %amount, "paper oracle: reward paid");
        Ok(ConfirmedTx::boxed())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<OracleEvent>> {
        self.events_rx.lock().take()
    }

    fn name(&self) -> &str {
        "paper"
    }
}
