//! Background loops: price refresh, round ticks, analytics and cleanup.

use crate::{
    broadcast::{EventBroadcaster, ServerEvent},
    price::PriceFeedCache,
    rounds::{Analytics, RoundScheduler},
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct JobIntervals {
    pub price: Duration,
    pub rounds: Duration,
    pub analytics: Duration,
    pub cleanup: Duration,
}

impl Default for JobIntervals {
    fn default() -> Self {
        Self {
            price: Duration::from_secs(60),
            rounds: Duration::from_secs(5 * 60),
            analytics: Duration::from_secs(3600),
            cleanup: Duration::from_secs(24 * 3600),
        }
    }
}

/// Last outcome of one job, exposed on `/health`
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub runs: u64,
    pub failures: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct JobRunner {
    prices: Arc<PriceFeedCache>,
    scheduler: Arc<RoundScheduler>,
    analytics: Arc<Analytics>,
    broadcaster: Arc<EventBroadcaster>,
    intervals: JobIntervals,
    status: Arc<RwLock<BTreeMap<&'static str, JobStatus>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl JobRunner {
    pub fn new(
        prices: Arc<PriceFeedCache>,
        scheduler: Arc<RoundScheduler>,
        analytics: Arc<Analytics>,
        broadcaster: Arc<EventBroadcaster>,
        intervals: JobIntervals,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            prices,
            scheduler,
            analytics,
            broadcaster,
            intervals,
            status: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    pub fn status(&self) -> BTreeMap<&'static str, JobStatus> {
        self.status.read().clone()
    }

    /// Refresh the price, publish it and chart it on live rounds.
    pub async fn run_price_tick(&self) -> anyhow::Result<()> {
        let snapshot = self.prices.refresh().await;
        self.broadcaster.publish(ServerEvent::price_update(&snapshot));
        self.scheduler.record_round_price_points(&snapshot).await?;
        Ok(())
    }

    pub async fn run_round_tick(&self) -> anyhow::Result<()> {
        let report = self.scheduler.tick().await;
        if report.failed > 0 {
            anyhow::bail!("{} round step(s) failed", report.failed);
        }
        Ok(())
    }

    pub async fn run_analytics(&self) -> anyhow::Result<()> {
        self.analytics.recompute_user_stats().await?;
        self.analytics.compute_platform_stats().await?;
        Ok(())
    }

    pub async fn run_cleanup(&self) -> anyhow::Result<()> {
        self.analytics.cleanup(Utc::now()).await?;
        Ok(())
    }

    /// Spawn every loop. Each runs once immediately, then on its interval.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        info!(
            price = ?self.intervals.price,
            rounds = ?self.intervals.rounds,
            analytics = ?self.intervals.analytics,
            cleanup = ?self.intervals.cleanup,
            "starting background jobs"
        );
        vec![
            self.spawn_loop("price", self.intervals.price, |r| async move {
                r.run_price_tick().await
            }),
            self.spawn_loop("rounds", self.intervals.rounds, |r| async move {
                r.run_round_tick().await
            }),
            self.spawn_loop("analytics", self.intervals.analytics, |r| async move {
                r.run_analytics().await
            }),
            self.spawn_loop("cleanup", self.intervals.cleanup, |r| async move {
                r.run_cleanup().await
            }),
        ]
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, name: &'static str, every: Duration, job: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let runner = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let result = job(Arc::clone(&runner)).await;
                runner.record(name, result);
            }
            info!(job = name, "job stopped");
        })
    }

    fn record(&self, name: &'static str, result: anyhow::Result<()>) {
        let mut status = self.status.write();
        let entry = status.entry(name).or_default();
        entry.runs += 1;
        entry.last_run = Some(Utc::now());
        match result {
            Ok(()) => entry.last_error = None,
            Err(e) => {
                warn!(job = name, error = %e, "job run failed");
                entry.failures += 1;
                entry.last_error = Some(format!("{e:#}"));
            }
        }
    }
}
