//! Round lifecycle: the scheduler that drives transitions, the reconciler
//! that settles predictions, the user-facing ledger and periodic analytics.

pub mod analytics;
pub mod ledger;
pub mod reconciler;
pub mod scheduler;

pub use analytics::{Analytics, CleanupReport, RecomputeReport};
pub use ledger::{ClaimReceipt, LedgerConfig, PredictionLedger};
pub use reconciler::{ReconcileReport, SettlementReconciler};
pub use scheduler::{RoundScheduler, SchedulerConfig, TickReport};
