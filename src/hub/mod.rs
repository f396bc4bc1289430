//! Client hub: fan-out from the store's change stream to subscribed WebSocket clients.
//! Grounded on the teacher's `data::websocket` `try_send`-never-blocks idiom, generalized
//! from "one channel per analyzer" to "one bounded channel per client, evicted on
//! saturation" per §4.5 (deliberately not `tokio::sync::broadcast`, since a slow consumer
//! must be dropped rather than let lag the whole fan-out).

mod session;

pub use session::{ClientId, ClientMessage, ServerEvent};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tokio::sync::mpsc;
use tracing::debug;

use crate::store::ChangeEvent;

pub struct Hub {
    buffer_size: usize,
    next_id: AtomicU64,
    sessions: RwLock<HashMap<ClientId, mpsc::Sender<ServerEvent>>>,
    subscriptions: RwLock<HashMap<String, HashSet<ClientId>>>,
    client_symbols: RwLock<HashMap<ClientId, HashSet<String>>>,
}

impl Hub {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            next_id: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            client_symbols: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new client session, returning its id and the receiving half of its
    /// bounded outbound channel.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<ServerEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.buffer_size);
        self.sessions.write().unwrap().insert(id, tx);
        self.client_symbols.write().unwrap().insert(id, HashSet::new());
        (id, rx)
    }

    /// Remove a client entirely, unsubscribing it from every symbol it was watching.
    pub fn unregister(&self, id: ClientId) {
        self.sessions.write().unwrap().remove(&id);
        if let Some(symbols) = self.client_symbols.write().unwrap().remove(&id) {
            let mut subs = self.subscriptions.write().unwrap();
            for symbol in symbols {
                if let Some(clients) = subs.get_mut(&symbol) {
                    clients.remove(&id);
                    if clients.is_empty() {
                        subs.remove(&symbol);
                    }
                }
            }
        }
    }

    pub fn subscribe(&self, id: ClientId, symbol: &str) {
        self.subscriptions
            .write()
            .unwrap()
            .entry(symbol.to_string())
            .or_default()
            .insert(id);
        if let Some(symbols) = self.client_symbols.write().unwrap().get_mut(&id) {
            symbols.insert(symbol.to_string());
        }
    }

    pub fn unsubscribe(&self, id: ClientId, symbol: &str) {
        if let Some(clients) = self.subscriptions.write().unwrap().get_mut(symbol) {
            clients.remove(&id);
        }
        if let Some(symbols) = self.client_symbols.write().unwrap().get_mut(&id) {
            symbols.remove(symbol);
        }
    }

    pub fn client_subscription_count(&self, id: ClientId) -> usize {
        self.client_symbols
            .read()
            .unwrap()
            .get(&id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Number of currently-registered client sessions, for `/api/v1/websocket/stats`.
    pub fn client_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.subscriptions
            .read()
            .unwrap()
            .get(symbol)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Publish a store change to every client subscribed to its symbol. Never blocks: a
    /// client whose buffer is full is evicted outright rather than allowed to stall the
    /// fan-out for everyone else.
    pub fn publish(&self, event: ChangeEvent) {
        let symbol = session::symbol_of(&event).to_string();
        let subscriber_ids: Vec<ClientId> = match self.subscriptions.read().unwrap().get(&symbol) {
            Some(ids) => ids.iter().copied().collect(),
            None => return,
        };
        if subscriber_ids.is_empty() {
            return;
        }

        let server_event: ServerEvent = event.into();
        let mut evicted = Vec::new();
        {
            let sessions = self.sessions.read().unwrap();
            for id in subscriber_ids {
                let Some(tx) = sessions.get(&id) else { continue };
                if tx.try_send(server_event.clone()).is_err() {
                    debug!("client {id} outbound buffer saturated, evicting");
                    evicted.push(id);
                }
            }
        }
        for id in evicted {
            self.unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PriceTick;

    fn price_event(symbol: &str) -> ChangeEvent {
        ChangeEvent::Price(PriceTick {
            symbol: symbol.to_string(),
            last_price: 1.0,
            change_24h: 0.0,
            change_pct_24h: 0.0,
            volume_24h: 0.0,
            event_time: 0,
        })
    }

    #[test]
    fn subscribed_client_receives_published_event() {
        let hub = Hub::new(4);
        let (id, mut rx) = hub.register();
        hub.subscribe(id, "BTCUSDT");
        hub.publish(price_event("BTCUSDT"));
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::Price(_))));
    }

    #[test]
    fn unsubscribed_symbol_receives_nothing() {
        let hub = Hub::new(4);
        let (id, mut rx) = hub.register();
        hub.subscribe(id, "ETHUSDT");
        hub.publish(price_event("BTCUSDT"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn slow_consumer_is_evicted_without_blocking_others() {
        let hub = Hub::new(1);
        let (slow_id, mut slow_rx) = hub.register();
        let (fast_id, mut fast_rx) = hub.register();
        hub.subscribe(slow_id, "BTCUSDT");
        hub.subscribe(fast_id, "BTCUSDT");

        hub.publish(price_event("BTCUSDT"));
        assert!(fast_rx.try_recv().is_ok());
        hub.publish(price_event("BTCUSDT"));

        assert_eq!(hub.subscriber_count("BTCUSDT"), 1);
        assert!(fast_rx.try_recv().is_ok());
        drop(slow_rx.try_recv());
    }

    #[test]
    fn unregister_cleans_up_subscriptions() {
        let hub = Hub::new(4);
        let (id, _rx) = hub.register();
        hub.subscribe(id, "BTCUSDT");
        hub.unregister(id);
        assert_eq!(hub.subscriber_count("BTCUSDT"), 0);
    }
}
