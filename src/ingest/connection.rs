use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::Settings;

use super::{parse::parse_frame, stream_names_for_symbol, IngestEvent};

const KLINE_INTERVALS: &[&str] = &["1m", "5m", "15m"];
const MAX_PARSE_ERRORS_PER_WINDOW: u32 = 5;
const PARSE_ERROR_WINDOW: Duration = Duration::from_secs(10);

/// Ingest connection lifecycle, matching §4.1: `Idle -> Dialing -> Connected ->
/// Subscribing -> Streaming -> Reconnecting -> Dialing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle,
    Dialing,
    Connected,
    Subscribing,
    Streaming,
    Reconnecting,
}

impl ConnectionState {
    fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Dialing => "dialing",
            ConnectionState::Connected => "connected",
            ConnectionState::Subscribing => "subscribing",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

/// Shared, lock-free handle a `run_ingest` task publishes its current `ConnectionState`
/// through, so `/api/v1/websocket/stats` (§7: "callers can consult /websocket/stats to see
/// whether streams are currently connected") can read it without touching the connection
/// itself.
#[derive(Clone)]
pub struct ConnectionStatus(Arc<std::sync::atomic::AtomicU8>);

impl ConnectionStatus {
    pub fn new() -> Self {
        Self(Arc::new(std::sync::atomic::AtomicU8::new(
            ConnectionState::Idle as u8,
        )))
    }

    fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn get(&self) -> ConnectionState {
        match self.0.load(std::sync::atomic::Ordering::Relaxed) {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Dialing,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Subscribing,
            4 => ConnectionState::Streaming,
            _ => ConnectionState::Reconnecting,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.get() == ConnectionState::Streaming
    }

    pub fn label(&self) -> &'static str {
        self.get().as_str()
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct StreamSubscription {
    method: &'static str,
    params: Vec<String>,
    id: u64,
}

/// Drive one symbol chunk's connection forever, reconnecting with exponential backoff
/// and jitter. Parsed events are pushed onto `events_tx`; the sender never blocks the
/// caller of this function thanks to a bounded channel plus `try_send` at the call site
/// in `parse` dispatch below.
///
/// `add_symbol_rx`, when present, carries symbols added to the process at runtime
/// (§4.1 "Adding a symbol at runtime"): each arrival is appended to this connection's
/// live symbol set and, if already `Streaming`, subscribed to immediately; otherwise it
/// is picked up by the next `Subscribing` transition since `symbols` itself grew.
pub async fn run_ingest(
    settings: Arc<Settings>,
    mut symbols: Vec<String>,
    chunk_id: usize,
    events_tx: mpsc::Sender<IngestEvent>,
    mut add_symbol_rx: Option<mpsc::Receiver<String>>,
    status: ConnectionStatus,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut state;
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        state = ConnectionState::Dialing;
        status.set(state);
        match connect_and_stream(
            &settings,
            &mut symbols,
            &mut state,
            &events_tx,
            &mut add_symbol_rx,
            &status,
            &mut shutdown,
        )
        .await
        {
            Ok(()) => {
                // Graceful close from the server, or a shutdown signal; either way treat
                // it like any other disconnect and let the shutdown check below decide
                // whether to reconnect.
                attempt = 0;
            }
            Err(e) => {
                error!("ingest chunk {chunk_id} disconnected: {e}");
            }
        }

        if *shutdown.borrow() {
            break;
        }

        state = ConnectionState::Reconnecting;
        status.set(state);
        attempt += 1;
        if attempt > settings.upstream.max_reconnect_attempts {
            error!("ingest chunk {chunk_id} exceeded max reconnect attempts, giving up");
            return;
        }

        let base = settings.upstream.reconnect_delay_ms * 2u64.pow(attempt.min(6) - 1);
        let capped = base.min(settings.upstream.max_reconnect_delay_ms);
        let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
        let delay_ms = (capped as f64 * (1.0 + jitter_frac)).max(0.0) as u64;
        warn!("ingest chunk {chunk_id} reconnecting in {delay_ms}ms (attempt {attempt})");
        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        // A symbol added while we were down for the count still needs to land in
        // `symbols` so the next dial's SUBSCRIBE frame carries it.
        if let Some(rx) = add_symbol_rx.as_mut() {
            while let Ok(symbol) = rx.try_recv() {
                if !symbols.contains(&symbol) {
                    symbols.push(symbol);
                }
            }
        }
    }
    status.set(ConnectionState::Idle);
    debug!("ingest chunk {chunk_id} shut down");
}

/// Upstream is considered disconnected if no frame (data or ping) arrives for this long,
/// matching the §4.1 "missed heartbeat > 30s" transition into `Reconnecting`.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

async fn connect_and_stream(
    settings: &Settings,
    symbols: &mut Vec<String>,
    state: &mut ConnectionState,
    events_tx: &mpsc::Sender<IngestEvent>,
    add_symbol_rx: &mut Option<mpsc::Receiver<String>>,
    status: &ConnectionStatus,
    shutdown: &mut tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let url = format!("{}/ws", settings.upstream.websocket_base_url);
    let (ws_stream, _) = connect_async(&url).await?;
    let (mut sender, mut receiver) = ws_stream.split();
    *state = ConnectionState::Connected;
    status.set(*state);

    let mut params = Vec::new();
    for symbol in symbols.iter() {
        params.extend(stream_names_for_symbol(symbol, KLINE_INTERVALS));
    }
    let global_liquidations = symbols
        .first()
        .map(|_| "!forceOrder@arr".to_string())
        .into_iter();
    params.extend(global_liquidations);

    *state = ConnectionState::Subscribing;
    status.set(*state);
    if !params.is_empty() {
        let subscription = StreamSubscription {
            method: "SUBSCRIBE",
            params: params.clone(),
            id: 1,
        };
        sender
            .send(Message::Text(serde_json::to_string(&subscription)?))
            .await?;
        info!(
            "ingest subscribed to {} streams for {} symbols",
            params.len(),
            symbols.len()
        );
    }

    let mut parse_errors: u32 = 0;
    let mut window_start = std::time::Instant::now();
    let mut next_sub_id: u64 = 2;

    loop {
        let heartbeat = sleep(HEARTBEAT_TIMEOUT);
        tokio::pin!(heartbeat);

        tokio::select! {
            biased;

            added = recv_add_symbol(add_symbol_rx) => {
                let Some(new_symbol) = added else { continue };
                if symbols.contains(&new_symbol) {
                    continue;
                }
                symbols.push(new_symbol.clone());
                if *state == ConnectionState::Streaming {
                    let stream_names = stream_names_for_symbol(&new_symbol, KLINE_INTERVALS);
                    let subscription = StreamSubscription {
                        method: "SUBSCRIBE",
                        params: stream_names,
                        id: next_sub_id,
                    };
                    next_sub_id += 1;
                    sender
                        .send(Message::Text(serde_json::to_string(&subscription)?))
                        .await?;
                    info!("ingest subscribed {new_symbol} to an already-streaming connection");
                }
            }

            msg = receiver.next() => {
                let Some(msg) = msg else { break };
                match msg {
                    Ok(Message::Text(text)) => {
                        if *state != ConnectionState::Streaming {
                            *state = ConnectionState::Streaming;
                            status.set(*state);
                        }
                        match parse_frame(&text) {
                            Ok(Some(event)) => {
                                if events_tx.try_send(event).is_err() {
                                    debug!("ingest dispatch channel full, dropping one event");
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                debug!("dropping malformed frame: {e}");
                                if window_start.elapsed() > PARSE_ERROR_WINDOW {
                                    parse_errors = 0;
                                    window_start = std::time::Instant::now();
                                }
                                parse_errors += 1;
                                if parse_errors >= MAX_PARSE_ERRORS_PER_WINDOW {
                                    return Err(anyhow!("too many malformed frames, forcing reconnect"));
                                }
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        sender.send(Message::Pong(payload)).await?;
                    }
                    Ok(Message::Close(_)) => {
                        warn!("ingest connection closed by server");
                        break;
                    }
                    Err(e) => return Err(e.into()),
                    _ => {}
                }
            }

            _ = &mut heartbeat => {
                return Err(anyhow!("no upstream frame for {:?}, forcing reconnect", HEARTBEAT_TIMEOUT));
            }

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = sender.close().await;
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Awaits the next runtime symbol addition, or never resolves if this connection has no
/// control channel (the common case for the statically-chunked startup connections).
async fn recv_add_symbol(rx: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_starts_idle() {
        assert_eq!(ConnectionState::Idle, ConnectionState::Idle);
    }

    #[test]
    fn connection_status_round_trips_every_state() {
        let status = ConnectionStatus::new();
        assert_eq!(status.get(), ConnectionState::Idle);
        assert!(!status.is_streaming());

        for state in [
            ConnectionState::Dialing,
            ConnectionState::Connected,
            ConnectionState::Subscribing,
            ConnectionState::Streaming,
            ConnectionState::Reconnecting,
        ] {
            status.set(state);
            assert_eq!(status.get(), state);
        }
        assert!(!status.is_streaming());

        status.set(ConnectionState::Streaming);
        assert!(status.is_streaming());
        assert_eq!(status.label(), "streaming");
    }

    /// §5: a shutdown signalled before a chunk ever dials must make `run_ingest` return
    /// promptly rather than attempt a connection, and must leave the published status at
    /// `Idle` rather than stuck mid-lifecycle.
    #[tokio::test]
    async fn run_ingest_exits_immediately_when_shutdown_is_already_set() {
        let settings = Arc::new(crate::config::Settings::default());
        let (events_tx, _events_rx) = mpsc::channel(8);
        let status = ConnectionStatus::new();
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(true);
        drop(shutdown_tx);

        tokio::time::timeout(
            Duration::from_secs(1),
            run_ingest(settings, vec!["BTCUSDT".to_string()], 0, events_tx, None, status.clone(), shutdown_rx),
        )
        .await
        .expect("run_ingest should return promptly once shutdown is already set");

        assert_eq!(status.get(), ConnectionState::Idle);
    }
}
