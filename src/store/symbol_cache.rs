use std::collections::{HashMap, HashSet, VecDeque};

use crate::model::{Kline, Liquidation, MarkPrice, OrderBook, PriceTick, Trade};

use super::{CLOSED_KLINES_PER_INTERVAL, LIQUIDATION_RING_CAPACITY, LIQUIDATION_TTL_MS, TRADE_RING_CAPACITY};

/// Per-interval kline state: the forming candle plus a bounded FIFO of closed ones.
#[derive(Default)]
pub struct KlineSeries {
    pub current: Option<Kline>,
    pub closed: VecDeque<Kline>,
}

impl KlineSeries {
    /// Idempotent w.r.t. closed klines: applying the same closed kline twice is a no-op
    /// beyond replacing it with an identical copy (§4.2 invariant).
    fn apply(&mut self, kline: Kline) {
        if kline.is_closed {
            if let Some(back) = self.closed.back() {
                if back.open_time == kline.open_time {
                    *self.closed.back_mut().unwrap() = kline;
                    self.current = None;
                    return;
                }
            }
            self.closed.push_back(kline);
            while self.closed.len() > CLOSED_KLINES_PER_INTERVAL {
                self.closed.pop_front();
            }
            self.current = None;
        } else {
            self.current = Some(kline);
        }
    }
}

pub struct SymbolCache {
    pub price: Option<PriceTick>,
    pub order_book: OrderBook,
    pub trades: VecDeque<Trade>,
    pub klines: HashMap<String, KlineSeries>,
    pub mark_price: Option<MarkPrice>,
    pub liquidations: VecDeque<Liquidation>,
    seen_liquidation_keys: HashSet<(u64, i64, i64)>,
}

impl SymbolCache {
    pub fn new(symbol: String) -> Self {
        Self {
            order_book: OrderBook::new(symbol),
            price: None,
            trades: VecDeque::new(),
            klines: HashMap::new(),
            mark_price: None,
            liquidations: VecDeque::new(),
            seen_liquidation_keys: HashSet::new(),
        }
    }

    pub fn push_trade(&mut self, trade: Trade) {
        self.trades.push_back(trade);
        while self.trades.len() > TRADE_RING_CAPACITY {
            self.trades.pop_front();
        }
    }

    pub fn recent_trades(&self, n: usize) -> Vec<Trade> {
        let n = n.min(self.trades.len());
        self.trades.iter().rev().take(n).cloned().collect()
    }

    pub fn apply_kline(&mut self, kline: Kline) {
        self.klines
            .entry(kline.interval.clone())
            .or_default()
            .apply(kline);
    }

    /// Returns `true` if this liquidation was newly recorded (not a dedup of one already
    /// seen on the other stream, per §4.1's per-symbol/global dedup rule).
    pub fn push_liquidation_deduped(&mut self, liq: Liquidation) -> bool {
        let key = liq.dedup_key();
        if !self.seen_liquidation_keys.insert(key) {
            return false;
        }

        self.liquidations.push_back(liq);
        while self.liquidations.len() > LIQUIDATION_RING_CAPACITY {
            if let Some(evicted) = self.liquidations.pop_front() {
                self.seen_liquidation_keys.remove(&evicted.dedup_key());
            }
        }
        true
    }

    pub fn liquidations_since(&self, since_ms: u64, limit: usize) -> Vec<Liquidation> {
        self.liquidations
            .iter()
            .rev()
            .filter(|l| l.trade_time >= since_ms)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn evict_expired_liquidations(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(LIQUIDATION_TTL_MS);
        while let Some(front) = self.liquidations.front() {
            if front.trade_time < cutoff {
                let evicted = self.liquidations.pop_front().unwrap();
                self.seen_liquidation_keys.remove(&evicted.dedup_key());
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LiquidationSide;

    fn liq(trade_time: u64, avg_price: f64, qty: f64) -> Liquidation {
        Liquidation {
            symbol: "BTCUSDT".to_string(),
            side: LiquidationSide::Sell,
            order_price: avg_price,
            avg_price,
            quantity: qty,
            status: "FILLED".to_string(),
            trade_time,
            event_time: trade_time,
        }
    }

    #[test]
    fn duplicate_liquidation_across_streams_is_deduped() {
        let mut cache = SymbolCache::new("BTCUSDT".to_string());
        assert!(cache.push_liquidation_deduped(liq(1000, 100.0, 1.0)));
        assert!(!cache.push_liquidation_deduped(liq(1000, 100.004, 1.00001)));
        assert_eq!(cache.liquidations.len(), 1);
    }

    #[test]
    fn closed_kline_reapplication_is_idempotent() {
        let mut cache = SymbolCache::new("BTCUSDT".to_string());
        let kline = Kline {
            symbol: "BTCUSDT".to_string(),
            interval: "1m".to_string(),
            open_time: 60_000,
            close_time: 119_999,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            taker_buy_volume: 6.0,
            quote_volume: 15.0,
            trade_count: 5,
            is_closed: true,
        };
        cache.apply_kline(kline.clone());
        cache.apply_kline(kline.clone());
        let series = cache.klines.get("1m").unwrap();
        assert_eq!(series.closed.len(), 1);
        assert_eq!(*series.closed.back().unwrap(), kline);
    }

    #[test]
    fn closed_kline_ring_is_bounded() {
        let mut cache = SymbolCache::new("BTCUSDT".to_string());
        for i in 0..(CLOSED_KLINES_PER_INTERVAL as u64 + 10) {
            cache.apply_kline(Kline {
                symbol: "BTCUSDT".to_string(),
                interval: "1m".to_string(),
                open_time: i * 60_000,
                close_time: i * 60_000 + 59_999,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 1.0,
                taker_buy_volume: 0.5,
                quote_volume: 1.0,
                trade_count: 1,
                is_closed: true,
            });
        }
        assert_eq!(
            cache.klines.get("1m").unwrap().closed.len(),
            CLOSED_KLINES_PER_INTERVAL
        );
    }
}
