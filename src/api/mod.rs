//! HTTP/WS surface. Grounded on the teacher's enrichment source (`cooprefr-bettersys`'s
//! `Router::new()...with_state` assembly and `TraceLayer`/`CorsLayer` stack) since the
//! teacher itself is a desktop GUI app with no HTTP surface of its own.

mod handlers;
mod response;
mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::aggregation::AggregationEngine;
use crate::candles::CandleService;
use crate::config::Settings;
use crate::hub::Hub;
use crate::store::Store;

pub struct AppState {
    pub store: Arc<Store>,
    pub candles: Arc<CandleService>,
    pub aggregation: Arc<AggregationEngine>,
    pub hub: Arc<Hub>,
    pub settings: Arc<Settings>,
    /// Notifies the dynamic ingest connection (spawned in `main`) that a symbol was added
    /// at runtime and needs an upstream subscription, per §4.1.
    pub dyn_symbol_tx: tokio::sync::mpsc::Sender<String>,
    /// One handle per upstream ingest connection (static chunks + the dynamic one), read by
    /// `/api/v1/websocket/stats` so clients can tell whether streams are currently connected
    /// without the ingest layer surfacing errors of its own (§7 TransientUpstream policy).
    pub ingest_status: Vec<crate::ingest::ConnectionStatus>,
    /// Flips to `true` when the process starts its cooperative shutdown (§5), so each
    /// client writer can close its own socket instead of being aborted out from under it.
    pub shutdown: tokio::sync::watch::Receiver<bool>,
}

impl AppState {
    /// True while every upstream ingest connection is down. Used to distinguish "this
    /// symbol has no cached value because the upstream is disconnected" (`UPSTREAM_UNAVAILABLE`)
    /// from "this symbol has no cached value despite the upstream being up" (`NotFound`/
    /// `PriceUnavailable`), per the §7 TransientUpstream policy.
    pub fn upstream_down(&self) -> bool {
        !self.ingest_status.is_empty() && !self.ingest_status.iter().any(|s| s.is_streaming())
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(handlers::health))
        .route(
            "/api/v1/symbols",
            get(handlers::list_symbols).post(handlers::add_symbol),
        )
        .route("/api/v1/symbols/:symbol", get(handlers::symbol_info))
        .route("/api/v1/candles/:symbol", get(handlers::candles))
        .route("/api/v1/candles/:symbol/latest", get(handlers::latest_candle))
        .route("/api/v1/candles/:symbol/range", get(handlers::candles_range))
        .route(
            "/api/v1/aggregation/candles/:symbol/:interval",
            get(handlers::aggregation_candles),
        )
        .route(
            "/api/v1/aggregation/volume-profile/:symbol",
            get(handlers::volume_profile),
        )
        .route(
            "/api/v1/aggregation/footprint/:symbol/:interval",
            get(handlers::footprint),
        )
        .route(
            "/api/v1/aggregation/liquidations/:symbol",
            get(handlers::liquidations),
        )
        .route("/api/v1/aggregation/heatmap/:symbol", get(handlers::heatmap))
        .route("/api/v1/aggregation/multi", post(handlers::aggregation_multi))
        .route("/api/v1/aggregation/stats", get(handlers::aggregation_stats))
        .route("/api/v1/websocket/stats", get(handlers::websocket_stats))
        .route("/api/v1/websocket/price/:symbol", get(handlers::ws_price))
        .route("/api/v1/websocket/depth/:symbol", get(handlers::ws_depth))
        .route("/api/v1/websocket/trades/:symbol", get(handlers::ws_trades))
        .route(
            "/api/v1/websocket/kline/:symbol/:interval",
            get(handlers::ws_kline),
        )
        .route("/api/v1/websocket/volume/:symbol", get(handlers::ws_volume))
        .route(
            "/api/v1/websocket/markprice/:symbol",
            get(handlers::ws_markprice),
        )
        .route(
            "/api/v1/websocket/liquidations/:symbol",
            get(handlers::ws_liquidations),
        )
        .route(
            "/api/v1/websocket/symbols/:symbol",
            post(handlers::ws_add_symbol),
        )
        .route("/api/v1/websocket/connect", get(ws::websocket_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Drain the store's change stream, fanning each event out to the hub (client push) and
/// the aggregation engine (depth history for the heatmap). Keeps the store itself free of
/// any reference to either downstream consumer, per the cyclic-reference resolution in the
/// design notes.
pub async fn run_change_fanout(
    mut change_rx: tokio::sync::mpsc::Receiver<crate::store::ChangeEvent>,
    hub: Arc<Hub>,
    aggregation: Arc<AggregationEngine>,
) {
    while let Some(event) = change_rx.recv().await {
        aggregation.observe(&event);
        hub.publish(event);
    }
}
