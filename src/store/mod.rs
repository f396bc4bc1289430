//! In-memory per-symbol market-data store. Grounded on the teacher's `data::orderbook::OrderBook`
//! (kept almost verbatim, see `model::OrderBook`) and `data::market_data`'s ring-buffer style
//! caches, generalized from the teacher's fixed 1m/5m/15m candle handling to an arbitrary set
//! of intervals per §4.2.

mod symbol_cache;

pub use symbol_cache::SymbolCache;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::debug;

use crate::ingest::IngestEvent;
use crate::model::{DepthSnapshot, Kline, Liquidation, MarkPrice, PriceTick, Trade};

pub const TRADE_RING_CAPACITY: usize = 1000;
pub const LIQUIDATION_RING_CAPACITY: usize = 1000;
pub const LIQUIDATION_TTL_MS: u64 = 48 * 3_600_000;
pub const CLOSED_KLINES_PER_INTERVAL: usize = 60;

/// A store mutation the hub cares about, broadcast on a best-effort basis: if the hub's
/// intake is saturated the broadcast is dropped but the store write that produced it is not.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Price(PriceTick),
    Depth(DepthSnapshot),
    Trade(Trade),
    Kline(Kline),
    MarkPrice(MarkPrice),
    Liquidation(Liquidation),
}

pub struct Store {
    symbols: RwLock<HashSet<String>>,
    caches: RwLock<HashMap<String, Arc<RwLock<SymbolCache>>>>,
    change_tx: mpsc::Sender<ChangeEvent>,
}

impl Store {
    pub fn new(change_tx: mpsc::Sender<ChangeEvent>, initial_symbols: Vec<String>) -> Arc<Self> {
        let store = Arc::new(Self {
            symbols: RwLock::new(HashSet::new()),
            caches: RwLock::new(HashMap::new()),
            change_tx,
        });
        for symbol in initial_symbols {
            store.add_symbol(&symbol);
        }
        store
    }

    pub fn add_symbol(&self, symbol: &str) {
        self.symbols.write().unwrap().insert(symbol.to_string());
        self.caches
            .write()
            .unwrap()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(SymbolCache::new(symbol.to_string()))));
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut s: Vec<String> = self.symbols.read().unwrap().iter().cloned().collect();
        s.sort();
        s
    }

    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.symbols.read().unwrap().contains(symbol)
    }

    fn cache_for(&self, symbol: &str) -> Option<Arc<RwLock<SymbolCache>>> {
        self.caches.read().unwrap().get(symbol).cloned()
    }

    fn broadcast(&self, event: ChangeEvent) {
        if self.change_tx.try_send(event).is_err() {
            debug!("hub intake saturated, dropping one store change broadcast");
        }
    }

    /// Apply one parsed ingest event to the relevant per-symbol cache and broadcast the
    /// resulting change. This is the single writer path per symbol (§4.2, §5): callers are
    /// expected to serialize calls per symbol (the ingest dispatcher does this naturally
    /// since each chunk task owns a disjoint symbol set).
    pub fn apply(&self, event: IngestEvent) {
        let symbol = match &event {
            IngestEvent::Price(p) => p.symbol.clone(),
            IngestEvent::Depth(d) => d.symbol.clone(),
            IngestEvent::Trade(t) => t.symbol.clone(),
            IngestEvent::Kline(k) => k.symbol.clone(),
            IngestEvent::MarkPrice(m) => m.symbol.clone(),
            IngestEvent::Liquidation(l) => l.symbol.clone(),
        };

        if !self.has_symbol(&symbol) {
            self.add_symbol(&symbol);
        }
        let Some(cache) = self.cache_for(&symbol) else {
            return;
        };

        match event {
            IngestEvent::Price(tick) => {
                cache.write().unwrap().price = Some(tick.clone());
                self.broadcast(ChangeEvent::Price(tick));
            }
            IngestEvent::Depth(update) => {
                let mut guard = cache.write().unwrap();
                if guard.order_book.apply_update(&update) {
                    let snapshot = guard.order_book.snapshot();
                    drop(guard);
                    self.broadcast(ChangeEvent::Depth(snapshot));
                }
            }
            IngestEvent::Trade(trade) => {
                let mut guard = cache.write().unwrap();
                guard.push_trade(trade.clone());
                drop(guard);
                self.broadcast(ChangeEvent::Trade(trade));
            }
            IngestEvent::Kline(kline) => {
                let mut guard = cache.write().unwrap();
                guard.apply_kline(kline.clone());
                drop(guard);
                self.broadcast(ChangeEvent::Kline(kline));
            }
            IngestEvent::MarkPrice(mark) => {
                cache.write().unwrap().mark_price = Some(mark.clone());
                self.broadcast(ChangeEvent::MarkPrice(mark));
            }
            IngestEvent::Liquidation(liq) => {
                let mut guard = cache.write().unwrap();
                if guard.push_liquidation_deduped(liq.clone()) {
                    drop(guard);
                    self.broadcast(ChangeEvent::Liquidation(liq));
                }
            }
        }
    }

    pub fn get_price(&self, symbol: &str) -> Option<PriceTick> {
        self.cache_for(symbol)?.read().unwrap().price.clone()
    }

    pub fn get_depth(&self, symbol: &str) -> Option<DepthSnapshot> {
        Some(self.cache_for(symbol)?.read().unwrap().order_book.snapshot())
    }

    pub fn get_recent_trades(&self, symbol: &str, n: usize) -> Vec<Trade> {
        match self.cache_for(symbol) {
            Some(cache) => cache.read().unwrap().recent_trades(n),
            None => Vec::new(),
        }
    }

    /// Returns `(current forming kline, last K closed klines oldest-first)`.
    pub fn get_kline(&self, symbol: &str, interval: &str) -> Option<(Option<Kline>, Vec<Kline>)> {
        let cache = self.cache_for(symbol)?;
        let guard = cache.read().unwrap();
        let series = guard.klines.get(interval)?;
        Some((series.current.clone(), series.closed.iter().cloned().collect()))
    }

    pub fn get_mark_price(&self, symbol: &str) -> Option<MarkPrice> {
        self.cache_for(symbol)?.read().unwrap().mark_price.clone()
    }

    pub fn get_liquidations(&self, symbol: &str, since_ms: u64, limit: usize) -> Vec<Liquidation> {
        match self.cache_for(symbol) {
            Some(cache) => cache.read().unwrap().liquidations_since(since_ms, limit),
            None => Vec::new(),
        }
    }

    /// Drop liquidations older than `LIQUIDATION_TTL_MS` from every symbol's ring, called
    /// periodically so the ring doesn't hold onto liquidations long after they've aged out
    /// of any reasonable query window.
    pub fn evict_expired_liquidations(&self, now_ms: u64) {
        let caches: Vec<_> = self.caches.read().unwrap().values().cloned().collect();
        for cache in caches {
            cache.write().unwrap().evict_expired_liquidations(now_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (Arc<Store>, mpsc::Receiver<ChangeEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (Store::new(tx, vec!["BTCUSDT".to_string()]), rx)
    }

    #[test]
    fn unknown_symbol_reads_return_none() {
        let (store, _rx) = test_store();
        assert!(store.get_price("ETHUSDT").is_none());
        assert!(store.get_depth("ETHUSDT").is_none());
    }

    #[test]
    fn applying_price_event_updates_cache_and_broadcasts() {
        let (store, mut rx) = test_store();
        store.apply(IngestEvent::Price(PriceTick {
            symbol: "BTCUSDT".to_string(),
            last_price: 100.0,
            change_24h: 1.0,
            change_pct_24h: 1.0,
            volume_24h: 10.0,
            event_time: 1,
        }));

        assert_eq!(store.get_price("BTCUSDT").unwrap().last_price, 100.0);
        assert!(matches!(rx.try_recv(), Ok(ChangeEvent::Price(_))));
    }

    #[test]
    fn new_symbol_is_registered_on_first_event() {
        let (store, _rx) = test_store();
        assert!(!store.has_symbol("SOLUSDT"));
        store.apply(IngestEvent::Price(PriceTick {
            symbol: "SOLUSDT".to_string(),
            last_price: 1.0,
            change_24h: 0.0,
            change_pct_24h: 0.0,
            volume_24h: 0.0,
            event_time: 1,
        }));
        assert!(store.has_symbol("SOLUSDT"));
    }
}
