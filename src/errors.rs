//! Typed errors for the round state machine and the user-facing ledger.
//!
//! Internal plumbing (stores, oracle adapters, price sources) returns
//! `anyhow::Result`; only the operations a caller can act on get a typed error.

use crate::models::RoundState;
use thiserror::Error;

/// Refusal of an illegal round transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("round {round_id} is {actual}, expected {expected}")]
    WrongState {
        round_id: u64,
        expected: RoundState,
        actual: RoundState,
    },
    #[error("round {round_id} is not due yet")]
    NotDue { round_id: u64 },
    #[error("round {round_id} has no lock price")]
    MissingLockPrice { round_id: u64 },
    #[error("round {round_id} is already resolved")]
    AlreadyResolved { round_id: u64 },
    #[error("price must be positive, got {0}")]
    NonPositivePrice(String),
    #[error("round schedule must satisfy start < lock < end")]
    InvalidSchedule,
}

/// Rejection reasons for prediction submission and reward claims.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("round {round_id} is not accepting predictions ({state})")]
    InvalidState { round_id: u64, state: RoundState },
    #[error("a prediction already exists for this user in round {0}")]
    Conflict(u64),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("reward already claimed for round {0}")]
    AlreadyClaimed(u64),
    #[error("round {0} is not resolved yet")]
    NotResolved(u64),
    #[error("prediction in round {0} did not win")]
    NotWinning(u64),
    #[error("nothing to claim for round {0}")]
    NothingToClaim(u64),
    #[error("temporarily unavailable: {0:#}")]
    Unavailable(#[from] anyhow::Error),
}

impl LedgerError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }

    /// Stable machine-readable code for API layers.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::NotFound(_) => "not_found",
            LedgerError::InvalidState { .. } => "invalid_state",
            LedgerError::Conflict(_) => "conflict",
            LedgerError::InvalidArgument(_) => "invalid_argument",
            LedgerError::AlreadyClaimed(_) => "already_claimed",
            LedgerError::NotResolved(_) => "not_resolved",
            LedgerError::NotWinning(_) => "not_winning",
            LedgerError::NothingToClaim(_) => "nothing_to_claim",
            LedgerError::Unavailable(_) => "unavailable",
        }
    }
}
