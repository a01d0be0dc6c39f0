//! Service wiring and the HTTP surface (`/health`, `/price`, `/ws`).

use crate::{
    broadcast::{ws::serve_socket, EventBroadcaster},
    config::{to_chrono, AppConfig, OracleMode},
    jobs::{JobIntervals, JobRunner},
    oracle::{GatewayOracle, PaperOracle, SettlementOracle},
    price::{CoinGeckoSource, PriceCacheConfig, PriceFeedCache},
    rounds::{Analytics, LedgerConfig, PredictionLedger, RoundScheduler, SchedulerConfig},
    store::{RoundStore, SqliteStore, Store},
};
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// Every long-lived component, constructed once and shared by handle.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn Store>,
    pub oracle: Arc<dyn SettlementOracle>,
    pub prices: Arc<PriceFeedCache>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub scheduler: Arc<RoundScheduler>,
    pub ledger: Arc<PredictionLedger>,
    pub analytics: Arc<Analytics>,
    pub jobs: Arc<JobRunner>,
    pub started_at: DateTime<Utc>,
}

impl Services {
    pub async fn build(config: AppConfig) -> Result<Self> {
        let config = Arc::new(config);

        let store: Arc<dyn Store> = Arc::new(
            SqliteStore::new(&config.database_path)
                .with_context(|| format!("failed to open database at {}", config.database_path))?,
        );
        info!(path = %config.database_path, "round store ready");

        let oracle = build_oracle(&config, store.clone()).await?;
        info!(oracle = oracle.name(), "settlement oracle ready");

        let source = Arc::new(CoinGeckoSource::new(
            &config.price_api_url,
            &config.price_asset_id,
            config.price_api_key.clone(),
            config.external_call_timeout,
        )?);
        let prices = Arc::new(PriceFeedCache::new(source, PriceCacheConfig::from_app(&config)));
        let broadcaster = Arc::new(EventBroadcaster::new());

        let scheduler = Arc::new(RoundScheduler::new(
            store.clone(),
            oracle.clone(),
            prices.clone(),
            broadcaster.clone(),
            SchedulerConfig::from_app(&config),
        ));
        let ledger = Arc::new(PredictionLedger::new(
            store.clone(),
            oracle.clone(),
            broadcaster.clone(),
            LedgerConfig::from_app(&config),
        ));
        let analytics = Arc::new(Analytics::new(store.clone()));
        let jobs = Arc::new(JobRunner::new(
            prices.clone(),
            scheduler.clone(),
            analytics.clone(),
            broadcaster.clone(),
            JobIntervals {
                price: config.price_tick,
                rounds: config.round_tick,
                ..JobIntervals::default()
            },
        ));

        Ok(Self {
            config,
            store,
            oracle,
            prices,
            broadcaster,
            scheduler,
            ledger,
            analytics,
            jobs,
            started_at: Utc::now(),
        })
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/price", get(price))
            .route("/ws", get(websocket_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.clone())
    }
}

async fn build_oracle(config: &AppConfig, store: Arc<dyn Store>) -> Result<Arc<dyn SettlementOracle>> {
    match config.oracle_mode {
        OracleMode::Gateway => {
            let url = config
                .oracle_gateway_url
                .as_deref()
                .context("ORACLE_GATEWAY_URL is required in gateway mode")?;
            Ok(Arc::new(GatewayOracle::new(
                url,
                config.oracle_api_key.clone(),
                config.external_call_timeout,
            )?))
        }
        OracleMode::Paper => {
            let last_id = store
                .recent_rounds(1)
                .await?
                .first()
                .map_or(0, |r| r.round_id);
            Ok(Arc::new(
                PaperOracle::new(
                    store,
                    to_chrono(config.round_lock_after),
                    to_chrono(config.round_end_after),
                )
                .with_round_id(last_id),
            ))
        }
    }
}

async fn health(State(services): State<Services>) -> Response {
    let current = match services.store.find_current_round().await {
        Ok(round) => round,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "error": format!("{e:#}") })),
            )
                .into_response()
        }
    };
    let uptime = Utc::now() - services.started_at;

    Json(json!({
        "status": "ok",
        "oracle": services.oracle.name(),
        "uptimeSecs": uptime.num_seconds(),
        "currentRound": current.map(|r| json!({
            "roundId": r.round_id,
            "state": r.state,
            "lockTime": r.lock_time,
            "endTime": r.end_time,
        })),
        "connections": services.broadcaster.connection_count(),
        "priceHistoryPoints": services.prices.history_len(),
        "platform": services.analytics.platform_stats(),
        "jobs": services.jobs.status(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct PriceQuery {
    hours: Option<u32>,
}

async fn price(State(services): State<Services>, Query(q): Query<PriceQuery>) -> Response {
    let hours = q.hours.unwrap_or(24).clamp(1, 24 * 7);
    let current = services.prices.get_current_price().await;
    Json(json!({
        "current": current,
        "stats": services.prices.stats().await,
        "history": services.prices.get_history(hours),
    }))
    .into_response()
}

async fn websocket_handler(ws: WebSocketUpgrade, State(services): State<Services>) -> Response {
    let broadcaster = services.broadcaster.clone();
    ws.on_upgrade(move |socket| serve_socket(socket, broadcaster))
}

/// Resolves when the process should stop.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        // never resolve; the server keeps running
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

/// Small grace period for in-flight round work after the jobs stop.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
