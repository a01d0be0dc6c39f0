use crate::{
    models::{Prediction, Round, Settlement},
    oracle::SettlementOracle,
    store::Store,
};
use anyhow::{anyhow, bail, Result};
use rust_decimal::Decimal;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Outcome counts of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub winners: usize,
    pub losers: usize,
    /// Predictions left unmarked because a lookup or write failed
    pub deferred: usize,
}

impl ReconcileReport {
    pub fn is_complete(&self) -> bool {
        self.deferred == 0
    }
}

/// Writes win/loss outcomes onto the predictions of a resolved round.
///
/// The outcome of each prediction depends only on its position, the round's
/// winning position and the oracle's claimable amount, so running a pass
/// again over the same round rewrites the same values.
pub struct SettlementReconciler {
    store: Arc<dyn Store>,
    oracle: Arc<dyn SettlementOracle>,
    call_timeout: Duration,
}

impl SettlementReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        oracle: Arc<dyn SettlementOracle>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            oracle,
            call_timeout,
        }
    }

    pub async fn reconcile(&self, round: &Round) -> Result<ReconcileReport> {
        let Some(winner) = round.winning_position.filter(|_| round.resolved) else {
            bail!("round {} is not resolved", round.round_id);
        };

        let predictions = self.store.predictions_by_round(round.round_id).await?;
        let mut report = ReconcileReport::default();

        for prediction in predictions.iter().filter(|p| !p.claimed) {
            let settlement = if prediction.position == winner {
                match self.claimable(prediction).await {
                    Ok(amount) => Settlement::winning(amount),
                    Err(e) => {
                        warn!(
                            round_id = round.round_id,
                            user = %prediction.user,
                            error = %e,
                            "claimable lookup failed, deferring"
                        );
                        report.deferred += 1;
                        continue;
                    }
                }
            } else {
                Settlement::losing()
            };

            match self.store.apply_settlement(prediction.id, settlement).await {
                Ok(first) => {
                    if settlement.is_winning {
                        report.winners += 1;
                    } else {
                        report.losers += 1;
                    }
                    if first {
                        debug!(
                            round_id = round.round_id,
                            user = %prediction.user,
                            winning = settlement.is_winning,
                            claimable = %settlement.claimable_amount,
                            "prediction settled"
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        round_id = round.round_id,
                        user = %prediction.user,
                        error = %e,
                        "settlement write failed, deferring"
                    );
                    report.deferred += 1;
                }
            }
        }

        info!(
            round_id = round.round_id,
            winners = report.winners,
            losers = report.losers,
            deferred = report.deferred,
            "round reconciled"
        );
        Ok(report)
    }

    async fn claimable(&self, prediction: &Prediction) -> Result<Decimal> {
        tokio::time::timeout(
            self.call_timeout,
            self.oracle
                .claimable_amount(prediction.round_id, &prediction.user),
        )
        .await
        .map_err(|_| anyhow!("claimable lookup timed out after {:?}", self.call_timeout))?
    }
}
