use crate::errors::TransitionError;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Direction of a stake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Position {
    Up,
    Down,
}

impl Position {
    pub fn as_str(&self) -> &'static str {
        match self {
            Position::Up => "UP",
            Position::Down => "DOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UP" => Some(Position::Up),
            "DOWN" => Some(Position::Down),
            _ => None,
        }
    }

    /// Winner of a round. UP wins only on a strictly higher end price;
    /// an unchanged price settles DOWN.
    pub fn winner(lock_price: Decimal, end_price: Decimal) -> Self {
        if end_price > lock_price {
            Position::Up
        } else {
            Position::Down
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Round lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoundState {
    Active,
    Locked,
    Resolved,
    /// Reserved for an administrative path; the scheduler never enters it.
    Cancelled,
}

impl RoundState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundState::Active => "ACTIVE",
            RoundState::Locked => "LOCKED",
            RoundState::Resolved => "RESOLVED",
            RoundState::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(RoundState::Active),
            "LOCKED" => Some(RoundState::Locked),
            "RESOLVED" => Some(RoundState::Resolved),
            "CANCELLED" => Some(RoundState::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Oracle transaction hashes recorded per lifecycle step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundTransactions {
    pub start: Option<String>,
    pub lock: Option<String>,
    pub resolve: Option<String>,
}

/// One 24h prediction cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub round_id: u64,
    pub start_time: DateTime<Utc>,
    pub lock_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub start_price: Decimal,
    pub lock_price: Option<Decimal>,
    pub end_price: Option<Decimal>,
    pub total_up_amount: Decimal,
    pub total_down_amount: Decimal,
    pub reward_amount: Decimal,
    pub state: RoundState,
    pub resolved: bool,
    pub winning_position: Option<Position>,
    pub participant_count: u32,
    pub up_participants: u32,
    pub down_participants: u32,
    pub transactions: RoundTransactions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Round {
    /// Open a round whose id was assigned by the oracle.
    pub fn open(
        round_id: u64,
        start_time: DateTime<Utc>,
        lock_after: Duration,
        end_after: Duration,
        start_price: Decimal,
        start_tx: Option<String>,
    ) -> Result<Self, TransitionError> {
        if start_price <= Decimal::ZERO {
            return Err(TransitionError::NonPositivePrice(start_price.to_string()));
        }
        if lock_after <= Duration::zero() || end_after <= Duration::zero() {
            return Err(TransitionError::InvalidSchedule);
        }
        let lock_time = start_time + lock_after;
        let end_time = lock_time + end_after;

        Ok(Self {
            round_id,
            start_time,
            lock_time,
            end_time,
            start_price,
            lock_price: None,
            end_price: None,
            total_up_amount: Decimal::ZERO,
            total_down_amount: Decimal::ZERO,
            reward_amount: Decimal::ZERO,
            state: RoundState::Active,
            resolved: false,
            winning_position: None,
            participant_count: 0,
            up_participants: 0,
            down_participants: 0,
            transactions: RoundTransactions {
                start: start_tx,
                ..Default::default()
            },
            created_at: start_time,
            updated_at: start_time,
        })
    }

    pub fn is_lock_due(&self, now: DateTime<Utc>) -> bool {
        self.state == RoundState::Active && self.lock_time <= now
    }

    pub fn is_resolve_due(&self, now: DateTime<Utc>) -> bool {
        self.state == RoundState::Locked && !self.resolved && self.end_time <= now
    }

    /// Predictions are accepted only while ACTIVE and before the lock time.
    pub fn accepts_predictions(&self, now: DateTime<Utc>) -> bool {
        self.state == RoundState::Active && now < self.lock_time
    }

    /// ACTIVE -> LOCKED
    pub fn lock(
        &self,
        lock_price: Decimal,
        tx_hash: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Round, TransitionError> {
        self.expect_state(RoundState::Active)?;
        if self.lock_time > now {
            return Err(TransitionError::NotDue {
                round_id: self.round_id,
            });
        }
        if lock_price <= Decimal::ZERO {
            return Err(TransitionError::NonPositivePrice(lock_price.to_string()));
        }

        let mut next = self.clone();
        next.lock_price = Some(lock_price);
        next.state = RoundState::Locked;
        next.transactions.lock = tx_hash;
        next.updated_at = now;
        Ok(next)
    }

    /// LOCKED -> RESOLVED
    pub fn resolve(
        &self,
        end_price: Decimal,
        tx_hash: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Round, TransitionError> {
        if self.resolved {
            return Err(TransitionError::AlreadyResolved {
                round_id: self.round_id,
            });
        }
        self.expect_state(RoundState::Locked)?;
        let lock_price = self.lock_price.ok_or(TransitionError::MissingLockPrice {
            round_id: self.round_id,
        })?;
        if self.end_time > now {
            return Err(TransitionError::NotDue {
                round_id: self.round_id,
            });
        }
        if end_price <= Decimal::ZERO {
            return Err(TransitionError::NonPositivePrice(end_price.to_string()));
        }

        let mut next = self.clone();
        next.end_price = Some(end_price);
        next.state = RoundState::Resolved;
        next.resolved = true;
        next.winning_position = Some(Position::winner(lock_price, end_price));
        next.transactions.resolve = tx_hash;
        next.updated_at = now;
        Ok(next)
    }

    fn expect_state(&self, expected: RoundState) -> Result<(), TransitionError> {
        if self.state != expected {
            return Err(TransitionError::WrongState {
                round_id: self.round_id,
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    pub fn total_amount(&self) -> Decimal {
        self.total_up_amount + self.total_down_amount
    }

    pub fn up_percentage(&self) -> f64 {
        share_pct(self.total_up_amount, self.total_amount())
    }

    pub fn down_percentage(&self) -> f64 {
        share_pct(self.total_down_amount, self.total_amount())
    }

    /// Percent move from lock to end price, once both are known.
    pub fn price_change(&self) -> Option<f64> {
        let lock = self.lock_price?;
        let end = self.end_price?;
        if lock.is_zero() {
            return None;
        }
        ((end - lock) / lock * Decimal::ONE_HUNDRED).to_f64()
    }

    pub fn duration(&self) -> Duration {
        self.end_time - self.start_time
    }
}

fn share_pct(part: Decimal, total: Decimal) -> f64 {
    if total > Decimal::ZERO {
        (part / total * Decimal::ONE_HUNDRED).to_f64().unwrap_or(0.0)
    } else {
        0.0
    }
}

/// Outcome written onto a prediction when its round resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub is_winning: bool,
    pub claimable_amount: Decimal,
    pub payout: Decimal,
}

impl Settlement {
    pub fn winning(claimable_amount: Decimal) -> Self {
        Self {
            is_winning: true,
            claimable_amount,
            payout: claimable_amount,
        }
    }

    pub fn losing() -> Self {
        Self {
            is_winning: false,
            claimable_amount: Decimal::ZERO,
            payout: Decimal::ZERO,
        }
    }
}

/// One user's staked position for one round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: Uuid,
    pub user: String,
    pub round_id: u64,
    pub position: Position,
    pub amount: Decimal,
    pub claimed: bool,
    pub claimable_amount: Decimal,
    pub is_winning: Option<bool>,
    pub payout: Decimal,
    pub transaction_hash: String,
    pub predicted_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Prediction {
    pub fn new(
        user: &str,
        round_id: u64,
        position: Position,
        amount: Decimal,
        transaction_hash: &str,
        predicted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user: user.trim().to_lowercase(),
            round_id,
            position,
            amount,
            claimed: false,
            claimable_amount: Decimal::ZERO,
            is_winning: None,
            payout: Decimal::ZERO,
            transaction_hash: transaction_hash.trim().to_lowercase(),
            predicted_at,
            claimed_at: None,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.is_winning.is_some()
    }

    pub fn profit(&self) -> Decimal {
        self.payout - self.amount
    }

    pub fn roi(&self) -> f64 {
        if self.amount.is_zero() {
            return 0.0;
        }
        (self.profit() / self.amount * Decimal::ONE_HUNDRED)
            .to_f64()
            .unwrap_or(0.0)
    }
}

/// Lowercased `0x` + 40 hex address, or `None` when malformed.
pub fn normalize_address(raw: &str) -> Option<String> {
    normalize_hex(raw, 40)
}

/// Lowercased `0x` + 64 hex transaction hash, or `None` when malformed.
pub fn normalize_tx_hash(raw: &str) -> Option<String> {
    normalize_hex(raw, 64)
}

fn normalize_hex(raw: &str, digits: usize) -> Option<String> {
    let s = raw.trim();
    let body = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    (body.len() == digits && body.bytes().all(|b| b.is_ascii_hexdigit()))
        .then(|| format!("0x{}", body.to_ascii_lowercase()))
}

/// Per-user aggregates cached on the user row; always re-derivable from predictions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserStats {
    pub total_staked: Decimal,
    pub total_winnings: Decimal,
    pub current_win_streak: u32,
    pub max_win_streak: u32,
    pub total_rounds: u32,
    pub won_rounds: u32,
    pub win_rate: f64,
    pub roi: f64,
}

impl UserStats {
    pub fn record_stake(&mut self, amount: Decimal) {
        self.total_staked += amount;
        self.total_rounds += 1;
        self.refresh_ratios();
    }

    pub fn record_claim(&mut self, amount: Decimal) {
        self.total_winnings += amount;
        self.won_rounds += 1;
        self.refresh_ratios();
    }

    /// Replay win streaks over `predictions` in round order: a claimed win
    /// extends the run, a settled loss ends it, anything else is skipped.
    pub fn replay_streaks(&mut self, predictions: &[Prediction]) {
        let mut ordered: Vec<&Prediction> = predictions.iter().collect();
        ordered.sort_by_key(|p| p.round_id);

        let (mut current, mut max) = (0u32, 0u32);
        for p in ordered {
            if p.claimed {
                current += 1;
                max = max.max(current);
            } else if p.is_winning == Some(false) {
                current = 0;
            }
        }
        self.current_win_streak = current;
        self.max_win_streak = max;
    }

    pub fn refresh_ratios(&mut self) {
        self.win_rate = if self.total_rounds > 0 {
            self.won_rounds as f64 / self.total_rounds as f64 * 100.0
        } else {
            0.0
        };
        self.roi = if self.total_staked > Decimal::ZERO {
            ((self.total_winnings - self.total_staked) / self.total_staked * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };
    }

    /// Rebuild stats from a user's full prediction history.
    ///
    /// Wins count when claimed, the same point the incremental path counts
    /// them. Streaks come from [`UserStats::replay_streaks`].
    pub fn derive(predictions: &[Prediction]) -> Self {
        let mut stats = UserStats::default();
        for p in predictions {
            stats.total_staked += p.amount;
            stats.total_rounds += 1;
            if p.claimed {
                stats.total_winnings += p.payout;
                stats.won_rounds += 1;
            }
        }
        stats.replay_streaks(predictions);
        stats.refresh_ratios();
        stats
    }
}

/// Platform-wide aggregates computed by the analytics job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformStats {
    pub total_users: u64,
    pub total_rounds: u64,
    pub total_predictions: u64,
    pub total_volume: Decimal,
    pub avg_participants: u32,
    pub last_updated: DateTime<Utc>,
}
