use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

mod aggregation;
mod api;
mod candles;
mod config;
mod error;
mod hub;
mod ingest;
mod model;
mod store;

use aggregation::AggregationEngine;
use api::AppState;
use candles::{CandleDb, CandleService};
use config::Settings;
use hub::Hub;
use store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();
    info!("starting market-data backbone");

    let settings = Arc::new(Settings::new()?);

    let db = CandleDb::open(&settings.database.path).await?;

    let (change_tx, change_rx) = mpsc::channel(10_000);
    let store = Store::new(change_tx, settings.upstream.symbols.clone());

    let candle_service = Arc::new(CandleService::new(store.clone(), db.clone(), &settings));
    let aggregation = Arc::new(AggregationEngine::new(store.clone(), &settings));
    let hub = Arc::new(Hub::new(settings.http.client_outbound_buffer));

    let fanout_handle = tokio::spawn(api::run_change_fanout(change_rx, hub.clone(), aggregation.clone()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let (dyn_symbol_tx, dyn_symbol_rx) = mpsc::channel(256);
    let (ingest_handles, ingest_status) =
        spawn_ingest_tasks(&settings, store.clone(), dyn_symbol_rx, shutdown_rx.clone());
    let cleanup_handle = spawn_persistence_and_cleanup(candle_service.clone(), store.clone(), settings.clone());

    let state = Arc::new(AppState {
        store: store.clone(),
        candles: candle_service.clone(),
        aggregation,
        hub,
        settings: settings.clone(),
        dyn_symbol_tx,
        ingest_status,
        shutdown: shutdown_rx,
    });

    let app = api::build_router(state);
    let addr = format!("{}:{}", settings.http.bind_address, settings.http.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("api server listening on {addr}");

    let ctrl_c_shutdown_tx = shutdown_tx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = ctrl_c_shutdown_tx.send(true);
        })
        .await?;

    // Cooperative shutdown per §5: the serve future above has already stopped accepting
    // new connections and returns once every in-flight client writer has closed on its
    // own (bounded by its own 30s write deadline per socket send). What remains is
    // bounding how long we wait for ingest to notice the signal and flushing any closed
    // candles the periodic task hasn't gotten to yet.
    shutdown_tx.send(true).ok();
    info!("shutting down, waiting up to 5s for ingest connections to close");
    let ingest_join = futures_util::future::join_all(ingest_handles);
    if tokio::time::timeout(Duration::from_secs(5), ingest_join).await.is_err() {
        warn!("ingest connections did not close within grace period, continuing shutdown");
    }

    info!("flushing pending closed candles before exit");
    flush_closed_candles(&candle_service, &store).await;

    cleanup_handle.abort();
    fanout_handle.abort();

    Ok(())
}

/// Persist the latest closed kline for every symbol/interval, mirroring the periodic
/// maintenance loop's own persistence step so a shutdown mid-interval doesn't lose the
/// most recently closed candle (§5 "flushing any pending closed-kline writes").
async fn flush_closed_candles(candles: &CandleService, store: &Store) {
    for symbol in store.symbols() {
        for kline_interval in ["1m", "5m", "15m"] {
            if let Some((_, closed)) = store.get_kline(&symbol, kline_interval) {
                if let Some(latest) = closed.last() {
                    if let Err(e) = candles.persist_closed(latest).await {
                        error!("failed to flush closed candle for {symbol}/{kline_interval}: {e}");
                    }
                }
            }
        }
    }
}

/// Chunk the configured symbol set so each upstream connection carries no more than
/// `max_streams_per_connection` streams (per §4.1), then spawn one ingest task per chunk,
/// plus one extra always-live connection that starts empty and absorbs symbols added at
/// runtime through `dyn_symbol_rx` (§4.1 "Adding a symbol at runtime").
fn spawn_ingest_tasks(
    settings: &Arc<Settings>,
    store: Arc<Store>,
    dyn_symbol_rx: mpsc::Receiver<String>,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> (Vec<tokio::task::JoinHandle<()>>, Vec<ingest::ConnectionStatus>) {
    const STREAMS_PER_SYMBOL: usize = 8; // ticker, depth, aggTrade, markPrice, forceOrder, 3 kline intervals
    let chunk_size = (settings.upstream.max_streams_per_connection / STREAMS_PER_SYMBOL).max(1);

    let mut handles = Vec::new();
    let mut statuses = Vec::new();
    let mut next_chunk_id = 0;
    for chunk in settings.upstream.symbols.chunks(chunk_size) {
        let (events_tx, events_rx) = mpsc::channel(10_000);
        let settings = settings.clone();
        let symbols = chunk.to_vec();
        let status = ingest::ConnectionStatus::new();
        statuses.push(status.clone());
        let ingest_handle = tokio::spawn(ingest::run_ingest(
            settings,
            symbols,
            next_chunk_id,
            events_tx,
            None,
            status,
            shutdown.clone(),
        ));
        next_chunk_id += 1;
        handles.push(ingest_handle);
        handles.push(spawn_dispatcher(store.clone(), events_rx));
    }

    let (events_tx, events_rx) = mpsc::channel(10_000);
    let dynamic_status = ingest::ConnectionStatus::new();
    statuses.push(dynamic_status.clone());
    let dynamic_handle = tokio::spawn(ingest::run_ingest(
        settings.clone(),
        Vec::new(),
        next_chunk_id,
        events_tx,
        Some(dyn_symbol_rx),
        dynamic_status,
        shutdown,
    ));
    handles.push(dynamic_handle);
    handles.push(spawn_dispatcher(store, events_rx));
    (handles, statuses)
}

fn spawn_dispatcher(
    store: Arc<Store>,
    mut events_rx: mpsc::Receiver<ingest::IngestEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            store.apply(event);
        }
    })
}

/// Periodically persist newly-closed klines and age out old candle rows, mirroring the
/// teacher's own periodic-maintenance loops in `analysis::volume_analysis`.
fn spawn_persistence_and_cleanup(
    candles: Arc<CandleService>,
    store: Arc<Store>,
    settings: Arc<Settings>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;

            for symbol in store.symbols() {
                for kline_interval in ["1m", "5m", "15m"] {
                    if let Some((_, closed)) = store.get_kline(&symbol, kline_interval) {
                        if let Some(latest) = closed.last() {
                            if let Err(e) = candles.persist_closed(latest).await {
                                error!("failed to persist closed candle for {symbol}/{kline_interval}: {e}");
                            }
                        }
                    }
                }
            }

            let now_ms = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            store.evict_expired_liquidations(now_ms);

            let retention_ms = settings.database.retention_days as u64 * 86_400_000;
            let cutoff = now_ms.saturating_sub(retention_ms);
            if let Err(e) = candles.cleanup_older_than(cutoff).await {
                error!("candle retention cleanup failed: {e}");
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to install ctrl-c handler: {e}");
    }
    info!("shutdown signal received");
}
