//! Client WebSocket session. Grounded on the teacher's enrichment source
//! (`cooprefr-bettersys`'s `websocket_handler`/`handle_socket`): `ws.on_upgrade` dispatch,
//! `tokio::select!` over outbound events and inbound client frames, the ping/pong JSON
//! shape. Subscription bookkeeping and slow-consumer eviction are new, delegated to `Hub`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use tracing::{debug, info};

use crate::hub::{ClientMessage, ServerEvent};

use super::AppState;

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    if *state.shutdown.borrow() {
        return axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let (client_id, mut outbound_rx) = state.hub.register();
    info!("client {client_id} connected");

    let heartbeat_interval = Duration::from_secs(state.settings.http.heartbeat_interval_secs);
    let heartbeat_timeout = Duration::from_secs(state.settings.http.heartbeat_timeout_secs);
    let mut since_last_pong = tokio::time::Instant::now();
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    let mut shutdown = state.shutdown.clone();

    if socket
        .send(Message::Text(
            serde_json::json!({"type": "connected", "client_id": client_id}).to_string(),
        ))
        .await
        .is_err()
    {
        state.hub.unregister(client_id);
        return;
    }

    loop {
        tokio::select! {
            Some(event) = outbound_rx.recv() => {
                let text = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            message = socket.recv() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        since_last_pong = tokio::time::Instant::now();
                        handle_client_text(&state, &mut socket, client_id, &text).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        since_last_pong = tokio::time::Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                if since_last_pong.elapsed() > heartbeat_timeout {
                    debug!("client {client_id} heartbeat timeout, closing");
                    break;
                }
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("client {client_id} closing for shutdown");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    state.hub.unregister(client_id);
    info!("client {client_id} disconnected");
}

async fn handle_client_text(state: &Arc<AppState>, socket: &mut WebSocket, client_id: u64, text: &str) {
    let parsed: Result<ClientMessage, _> = serde_json::from_str(text);
    match parsed {
        Ok(ClientMessage::Subscribe { symbol }) => {
            state.hub.subscribe(client_id, &symbol);
            let _ = socket
                .send(Message::Text(
                    serde_json::json!({"type": "subscribed", "symbol": symbol}).to_string(),
                ))
                .await;
        }
        Ok(ClientMessage::Unsubscribe { symbol }) => {
            state.hub.unsubscribe(client_id, &symbol);
            let _ = socket
                .send(Message::Text(
                    serde_json::json!({"type": "unsubscribed", "symbol": symbol}).to_string(),
                ))
                .await;
        }
        Ok(ClientMessage::Ping) => {
            let _ = socket
                .send(Message::Text(serde_json::to_string(&ServerEvent::Pong).unwrap()))
                .await;
        }
        Ok(ClientMessage::GetStats) => {
            let subscriptions = state.hub.client_subscription_count(client_id);
            let _ = socket
                .send(Message::Text(
                    serde_json::to_string(&ServerEvent::Stats { subscriptions }).unwrap(),
                ))
                .await;
        }
        Err(_) => {
            debug!("client {client_id} sent malformed frame, dropping");
        }
    }
}
