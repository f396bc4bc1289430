//! Upstream ingest: one multiplexed WebSocket conversation per symbol chunk, reconnect
//! state machine, and dispatch of parsed frames into the store.
//!
//! Grounded on the teacher's `data::websocket::WebSocketManager`: the chunking constant,
//! the `try_send`-never-blocks dispatch idiom, and the per-chunk retry loop are kept; the
//! single-purpose trade/liquidation/depth connections are replaced with one multiplexed
//! connection per chunk carrying every stream kind the store needs.

mod connection;
mod parse;

pub use connection::{run_ingest, ConnectionStatus};

use crate::model::{DepthUpdate, Kline, Liquidation, MarkPrice, PriceTick, Trade};

/// A single parsed upstream event, already converted to store-native types.
#[derive(Debug, Clone)]
pub enum IngestEvent {
    Price(PriceTick),
    Depth(DepthUpdate),
    Trade(Trade),
    Kline(Kline),
    MarkPrice(MarkPrice),
    Liquidation(Liquidation),
}

pub fn stream_names_for_symbol(symbol: &str, kline_intervals: &[&str]) -> Vec<String> {
    let lower = symbol.to_lowercase();
    let mut names = vec![
        format!("{lower}@ticker"),
        format!("{lower}@depth@100ms"),
        format!("{lower}@aggTrade"),
        format!("{lower}@markPrice"),
        format!("{lower}@forceOrder"),
    ];
    for interval in kline_intervals {
        names.push(format!("{lower}@kline_{interval}"));
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_expected_stream_set() {
        let names = stream_names_for_symbol("BTCUSDT", &["1m", "5m", "15m"]);
        assert!(names.contains(&"btcusdt@ticker".to_string()));
        assert!(names.contains(&"btcusdt@kline_1m".to_string()));
        assert!(names.contains(&"btcusdt@forceOrder".to_string()));
        assert_eq!(names.len(), 8);
    }
}
