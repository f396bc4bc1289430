//! Footprint chart: per-candle price-level buy/sell breakdown plus delta. Grounded on the
//! teacher's `analysis::footprint::FootprintAnalyzer`, dropping its GUI render structs and
//! its own candle-building loop in favor of reusing the already-closed store klines and
//! building the footprint from the trades that fall inside each one.

use std::collections::BTreeMap;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::model::{Kline, Trade};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FootprintLevel {
    pub price: f64,
    pub buy: f64,
    pub sell: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FootprintCandle {
    pub t: u64,
    /// Taker-buy volume for this candle.
    pub tbv: f64,
    /// Taker-sell volume for this candle.
    pub tsv: f64,
    /// `tbv - tsv`.
    pub td: f64,
    pub poc: f64,
    pub l: Vec<FootprintLevel>,
}

/// Build one footprint candle per kline in `klines`, pulling trades for each candle's window
/// out of `trades`. `bucket_size` controls price-level granularity (same knob as the volume
/// profile's price step). Per §4.4: when no trade falls within a candle's time bounds, `l`
/// is empty and `tbv`/`tsv` fall back to the candle's own taker-buy/taker-sell split rather
/// than being left at zero.
pub fn compute_footprint(klines: &[Kline], trades: &[Trade], bucket_size: f64) -> Vec<FootprintCandle> {
    klines
        .iter()
        .map(|kline| build_footprint_candle(kline, trades, bucket_size))
        .collect()
}

fn build_footprint_candle(kline: &Kline, trades: &[Trade], bucket_size: f64) -> FootprintCandle {
    let window: Vec<&Trade> = trades
        .iter()
        .filter(|t| t.trade_time >= kline.open_time && t.trade_time <= kline.close_time)
        .collect();

    if window.is_empty() {
        let tbv = kline.taker_buy_volume;
        let tsv = kline.sell_volume();
        return FootprintCandle {
            t: kline.open_time,
            tbv,
            tsv,
            td: tbv - tsv,
            poc: kline.close,
            l: Vec::new(),
        };
    }

    let mut buckets: BTreeMap<OrderedFloat<f64>, (f64, f64)> = BTreeMap::new();
    for trade in window {
        let price = (trade.price / bucket_size).round() * bucket_size;
        let entry = buckets.entry(OrderedFloat(price)).or_insert((0.0, 0.0));
        // is_buyer_maker means the taker was a seller; the taker side drives the tape.
        if trade.is_buyer_maker {
            entry.1 += trade.quantity;
        } else {
            entry.0 += trade.quantity;
        }
    }

    let tbv: f64 = buckets.values().map(|(buy, _)| buy).sum();
    let tsv: f64 = buckets.values().map(|(_, sell)| sell).sum();
    let poc = buckets
        .iter()
        .max_by(|a, b| (a.1 .0 + a.1 .1).partial_cmp(&(b.1 .0 + b.1 .1)).unwrap())
        .map(|(price, _)| price.0)
        .unwrap_or(kline.close);

    let l = buckets
        .into_iter()
        .map(|(price, (buy, sell))| FootprintLevel { price: price.0, buy, sell })
        .collect();

    FootprintCandle {
        t: kline.open_time,
        tbv,
        tsv,
        td: tbv - tsv,
        poc,
        l,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kline(open_time: u64, close_time: u64) -> Kline {
        Kline {
            symbol: "BTCUSDT".to_string(),
            interval: "1m".to_string(),
            open_time,
            close_time,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 10.0,
            taker_buy_volume: 6.0,
            quote_volume: 1000.0,
            trade_count: 2,
            is_closed: true,
        }
    }

    fn trade(price: f64, quantity: f64, is_buyer_maker: bool, trade_time: u64) -> Trade {
        Trade {
            symbol: "BTCUSDT".to_string(),
            price,
            quantity,
            is_buyer_maker,
            trade_time,
        }
    }

    #[test]
    fn delta_matches_buy_minus_sell_across_levels() {
        let klines = vec![kline(0, 59_999)];
        let trades = vec![
            trade(100.0, 3.0, false, 1000),
            trade(100.0, 1.0, true, 2000),
            trade(101.0, 2.0, false, 3000),
        ];
        let footprint = compute_footprint(&klines, &trades, 1.0);
        assert_eq!(footprint.len(), 1);
        assert_eq!(footprint[0].tbv, 5.0);
        assert_eq!(footprint[0].tsv, 1.0);
        assert_eq!(footprint[0].td, 4.0);
    }

    #[test]
    fn poc_is_the_highest_volume_price_level() {
        let klines = vec![kline(0, 59_999)];
        let trades = vec![
            trade(100.0, 1.0, false, 1000),
            trade(101.0, 8.0, false, 2000),
            trade(101.0, 1.0, true, 3000),
        ];
        let footprint = compute_footprint(&klines, &trades, 1.0);
        assert_eq!(footprint[0].poc, 101.0);
    }

    #[test]
    fn trades_outside_candle_window_fall_back_to_the_candle_taker_split() {
        let klines = vec![kline(0, 59_999)];
        let trades = vec![trade(100.0, 3.0, false, 60_000)];
        let footprint = compute_footprint(&klines, &trades, 1.0);
        assert!(footprint[0].l.is_empty());
        assert_eq!(footprint[0].tbv, 6.0);
        assert_eq!(footprint[0].tsv, 4.0);
        assert_eq!(footprint[0].td, 2.0);
        assert_eq!(footprint[0].poc, 100.5);
    }
}
