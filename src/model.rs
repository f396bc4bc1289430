//! Wire- and store-level data model shared by ingest, store, candles, aggregation and hub.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A tradable interval such as `1m`, `5m`, `1h`. Kept as a string on the wire but parsed
/// once into milliseconds wherever duration arithmetic is needed, so there is exactly one
/// `interval -> millis` mapping in the codebase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Interval {
    Minutes(u32),
    Hours(u32),
    Days(u32),
}

impl Interval {
    pub fn parse(s: &str) -> Option<Self> {
        let (num, unit) = s.split_at(s.len().saturating_sub(1));
        let n: u32 = num.parse().ok()?;
        match unit {
            "m" => Some(Interval::Minutes(n)),
            "h" => Some(Interval::Hours(n)),
            "d" => Some(Interval::Days(n)),
            _ => None,
        }
    }

    pub fn as_millis(&self) -> u64 {
        match self {
            Interval::Minutes(m) => *m as u64 * 60_000,
            Interval::Hours(h) => *h as u64 * 3_600_000,
            Interval::Days(d) => *d as u64 * 86_400_000,
        }
    }

}

/// Convenience free function matching the single-source-of-truth rule from the design notes:
/// every caller that needs an interval's duration goes through here.
pub fn interval_ms(interval: &str) -> Option<u64> {
    Interval::parse(interval).map(|i| i.as_millis())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub last_price: f64,
    pub change_24h: f64,
    pub change_pct_24h: f64,
    pub volume_24h: f64,
    pub event_time: u64,
}

/// Snapshot of a symbol's order book, bids sorted descending and asks ascending by price.
#[derive(Debug, Clone)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: BTreeMap<OrderedFloat<f64>, f64>,
    pub asks: BTreeMap<OrderedFloat<f64>, f64>,
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub event_time: u64,
}

impl OrderBook {
    pub fn new(symbol: String) -> Self {
        Self {
            symbol,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            first_update_id: 0,
            final_update_id: 0,
            event_time: 0,
        }
    }

    /// Apply an incremental depth update. Returns false (and discards the update) if its
    /// `final_update_id` is not newer than the book's current one, preserving monotonicity.
    pub fn apply_update(&mut self, update: &DepthUpdate) -> bool {
        if update.final_update_id < self.final_update_id {
            return false;
        }

        for (price, qty) in &update.bids {
            let key = OrderedFloat(*price);
            if *qty == 0.0 {
                self.bids.remove(&key);
            } else {
                self.bids.insert(key, *qty);
            }
        }
        for (price, qty) in &update.asks {
            let key = OrderedFloat(*price);
            if *qty == 0.0 {
                self.asks.remove(&key);
            } else {
                self.asks.insert(key, *qty);
            }
        }

        self.first_update_id = update.first_update_id;
        self.final_update_id = update.final_update_id;
        self.event_time = update.event_time;
        true
    }

    pub fn snapshot(&self) -> DepthSnapshot {
        DepthSnapshot {
            symbol: self.symbol.clone(),
            bids: self.bids.iter().rev().map(|(p, q)| (p.0, *q)).collect(),
            asks: self.asks.iter().map(|(p, q)| (p.0, *q)).collect(),
            first_update_id: self.first_update_id,
            final_update_id: self.final_update_id,
            event_time: self.event_time,
        }
    }
}

/// Incremental depth update as received from the upstream depth stream.
#[derive(Debug, Clone)]
pub struct DepthUpdate {
    pub symbol: String,
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub event_time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub symbol: String,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub event_time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub price: f64,
    pub quantity: f64,
    pub is_buyer_maker: bool,
    pub trade_time: u64,
}

/// An interval-scoped candle. `taker_buy_volume` is authoritative from the upstream kline
/// stream; sell volume is always derived, never stored separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub symbol: String,
    pub interval: String,
    pub open_time: u64,
    pub close_time: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub taker_buy_volume: f64,
    pub quote_volume: f64,
    pub trade_count: u64,
    pub is_closed: bool,
}

impl Kline {
    pub fn sell_volume(&self) -> f64 {
        self.volume - self.taker_buy_volume
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkPrice {
    pub symbol: String,
    pub mark_price: f64,
    pub index_price: f64,
    pub estimated_settle_price: f64,
    pub funding_rate: f64,
    pub next_funding_time: u64,
    pub event_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidationSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Liquidation {
    pub symbol: String,
    pub side: LiquidationSide,
    pub order_price: f64,
    pub avg_price: f64,
    pub quantity: f64,
    pub status: String,
    pub trade_time: u64,
    pub event_time: u64,
}

impl Liquidation {
    pub fn notional(&self) -> f64 {
        self.avg_price * self.quantity
    }

    /// Dedup key per the ingest contract: identical liquidations reported on both the
    /// per-symbol and global forceOrder streams collapse to the same key.
    pub fn dedup_key(&self) -> (u64, i64, i64) {
        (
            self.trade_time,
            (self.avg_price * 100.0).round() as i64,
            (self.quantity * 10_000.0).round() as i64,
        )
    }
}
