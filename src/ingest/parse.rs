use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::model::{DepthUpdate, Kline, Liquidation, LiquidationSide, MarkPrice, PriceTick, Trade};

use super::IngestEvent;

fn deserialize_levels<'de, D>(deserializer: D) -> Result<Vec<(f64, f64)>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let levels: Vec<Vec<String>> = Vec::deserialize(deserializer)?;
    levels
        .iter()
        .map(|level| {
            if level.len() < 2 {
                return Err(D::Error::custom("invalid level format"));
            }
            let price = level[0]
                .parse::<f64>()
                .map_err(|e| D::Error::custom(format!("bad price: {e}")))?;
            let qty = level[1]
                .parse::<f64>()
                .map_err(|e| D::Error::custom(format!("bad qty: {e}")))?;
            Ok((price, qty))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct RawTicker {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    last_price: String,
    #[serde(rename = "p")]
    change_24h: String,
    #[serde(rename = "P")]
    change_pct_24h: String,
    #[serde(rename = "v")]
    volume_24h: String,
    #[serde(rename = "E")]
    event_time: u64,
}

#[derive(Debug, Deserialize)]
struct RawDepth {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b", deserialize_with = "deserialize_levels")]
    bids: Vec<(f64, f64)>,
    #[serde(rename = "a", deserialize_with = "deserialize_levels")]
    asks: Vec<(f64, f64)>,
    #[serde(rename = "E")]
    event_time: u64,
}

#[derive(Debug, Deserialize)]
struct RawAggTrade {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "m")]
    is_buyer_maker: bool,
    #[serde(rename = "T")]
    trade_time: u64,
}

#[derive(Debug, Deserialize)]
struct RawKlinePayload {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: RawKlineInner,
}

#[derive(Debug, Deserialize)]
struct RawKlineInner {
    #[serde(rename = "t")]
    open_time: u64,
    #[serde(rename = "T")]
    close_time: u64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "q")]
    quote_volume: String,
    #[serde(rename = "V")]
    taker_buy_volume: String,
    #[serde(rename = "n")]
    trade_count: u64,
    #[serde(rename = "x")]
    is_closed: bool,
}

#[derive(Debug, Deserialize)]
struct RawMarkPrice {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    mark_price: String,
    #[serde(rename = "i")]
    index_price: String,
    #[serde(rename = "P")]
    estimated_settle_price: String,
    #[serde(rename = "r")]
    funding_rate: String,
    #[serde(rename = "T")]
    next_funding_time: u64,
    #[serde(rename = "E")]
    event_time: u64,
}

#[derive(Debug, Deserialize)]
struct RawLiquidationPayload {
    #[serde(rename = "E")]
    event_time: u64,
    #[serde(rename = "o")]
    order: RawLiquidationOrder,
}

#[derive(Debug, Deserialize)]
struct RawLiquidationOrder {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "q")]
    original_quantity: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "ap")]
    average_price: String,
    #[serde(rename = "X")]
    order_status: String,
    #[serde(rename = "T")]
    trade_time: u64,
}

/// Parse one upstream text frame into a typed event. `None` means the frame was a
/// subscription ack or other non-data control frame; not an error.
pub fn parse_frame(text: &str) -> Result<Option<IngestEvent>> {
    if text.contains("\"result\":null") || (text.contains("\"id\":") && !text.contains("\"e\":")) {
        return Ok(None);
    }

    let value: serde_json::Value = serde_json::from_str(text)?;
    let event_type = value
        .get("e")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("frame missing event type: {text}"))?;

    match event_type {
        "24hrTicker" => {
            let raw: RawTicker = serde_json::from_value(value)?;
            Ok(Some(IngestEvent::Price(PriceTick {
                symbol: raw.symbol,
                last_price: raw.last_price.parse()?,
                change_24h: raw.change_24h.parse()?,
                change_pct_24h: raw.change_pct_24h.parse()?,
                volume_24h: raw.volume_24h.parse()?,
                event_time: raw.event_time,
            })))
        }
        "depthUpdate" => {
            let raw: RawDepth = serde_json::from_value(value)?;
            Ok(Some(IngestEvent::Depth(DepthUpdate {
                symbol: raw.symbol,
                first_update_id: raw.first_update_id,
                final_update_id: raw.final_update_id,
                bids: raw.bids,
                asks: raw.asks,
                event_time: raw.event_time,
            })))
        }
        "aggTrade" => {
            let raw: RawAggTrade = serde_json::from_value(value)?;
            Ok(Some(IngestEvent::Trade(Trade {
                symbol: raw.symbol,
                price: raw.price.parse()?,
                quantity: raw.quantity.parse()?,
                is_buyer_maker: raw.is_buyer_maker,
                trade_time: raw.trade_time,
            })))
        }
        "kline" => {
            let raw: RawKlinePayload = serde_json::from_value(value)?;
            let k = raw.kline;
            Ok(Some(IngestEvent::Kline(Kline {
                symbol: raw.symbol,
                interval: k.interval,
                open_time: k.open_time,
                close_time: k.close_time,
                open: k.open.parse()?,
                high: k.high.parse()?,
                low: k.low.parse()?,
                close: k.close.parse()?,
                volume: k.volume.parse()?,
                taker_buy_volume: k.taker_buy_volume.parse()?,
                quote_volume: k.quote_volume.parse()?,
                trade_count: k.trade_count,
                is_closed: k.is_closed,
            })))
        }
        "markPriceUpdate" => {
            let raw: RawMarkPrice = serde_json::from_value(value)?;
            Ok(Some(IngestEvent::MarkPrice(MarkPrice {
                symbol: raw.symbol,
                mark_price: raw.mark_price.parse()?,
                index_price: raw.index_price.parse()?,
                estimated_settle_price: raw.estimated_settle_price.parse().unwrap_or(0.0),
                funding_rate: raw.funding_rate.parse()?,
                next_funding_time: raw.next_funding_time,
                event_time: raw.event_time,
            })))
        }
        "forceOrder" => {
            let raw: RawLiquidationPayload = serde_json::from_value(value)?;
            let order = raw.order;
            let side = if order.side.eq_ignore_ascii_case("SELL") {
                LiquidationSide::Sell
            } else {
                LiquidationSide::Buy
            };
            Ok(Some(IngestEvent::Liquidation(Liquidation {
                symbol: order.symbol,
                side,
                order_price: order.price.parse()?,
                avg_price: order.average_price.parse()?,
                quantity: order.original_quantity.parse()?,
                status: order.order_status,
                trade_time: order.trade_time,
                event_time: raw.event_time,
            })))
        }
        other => Err(anyhow!("unhandled event type: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_agg_trade() {
        let text = r#"{"e":"aggTrade","s":"BTCUSDT","p":"108903.80","q":"1.234","m":false,"T":1748109720000}"#;
        let event = parse_frame(text).unwrap().unwrap();
        match event {
            IngestEvent::Trade(t) => {
                assert_eq!(t.symbol, "BTCUSDT");
                assert_eq!(t.price, 108903.80);
                assert!(!t.is_buyer_maker);
            }
            _ => panic!("expected trade"),
        }
    }

    #[test]
    fn parses_force_order_liquidation() {
        let text = r#"{"e":"forceOrder","E":1,"o":{"s":"BTCUSDT","S":"SELL","q":"1.0","p":"100.0","ap":"99.5","X":"FILLED","T":2}}"#;
        let event = parse_frame(text).unwrap().unwrap();
        match event {
            IngestEvent::Liquidation(l) => {
                assert_eq!(l.side, LiquidationSide::Sell);
                assert_eq!(l.avg_price, 99.5);
            }
            _ => panic!("expected liquidation"),
        }
    }

    #[test]
    fn subscription_ack_is_not_an_error() {
        let text = r#"{"result":null,"id":1}"#;
        assert!(parse_frame(text).unwrap().is_none());
    }

    #[test]
    fn malformed_frame_is_an_error_not_a_panic() {
        let text = r#"{"e":"aggTrade","s":"BTCUSDT""#;
        assert!(parse_frame(text).is_err());
    }
}
