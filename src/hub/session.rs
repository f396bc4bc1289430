use serde::{Deserialize, Serialize};

use crate::model::{DepthSnapshot, Kline, Liquidation, MarkPrice, PriceTick, Trade};
use crate::store::ChangeEvent;

pub type ClientId = u64;

/// Outbound message shape pushed to subscribed clients. Tagged so the client's `type` field
/// tells it which store event this is without needing to inspect the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Price(PriceTick),
    Depth(DepthSnapshot),
    Trade(Trade),
    Kline(Kline),
    MarkPrice(MarkPrice),
    Liquidation(Liquidation),
    Pong,
    Stats { subscriptions: usize },
}

impl From<ChangeEvent> for ServerEvent {
    fn from(event: ChangeEvent) -> Self {
        match event {
            ChangeEvent::Price(p) => ServerEvent::Price(p),
            ChangeEvent::Depth(d) => ServerEvent::Depth(d),
            ChangeEvent::Trade(t) => ServerEvent::Trade(t),
            ChangeEvent::Kline(k) => ServerEvent::Kline(k),
            ChangeEvent::MarkPrice(m) => ServerEvent::MarkPrice(m),
            ChangeEvent::Liquidation(l) => ServerEvent::Liquidation(l),
        }
    }
}

/// Inbound client control messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { symbol: String },
    Unsubscribe { symbol: String },
    Ping,
    #[serde(rename = "getStats")]
    GetStats,
}

pub(crate) fn symbol_of(event: &ChangeEvent) -> &str {
    match event {
        ChangeEvent::Price(p) => &p.symbol,
        ChangeEvent::Depth(d) => &d.symbol,
        ChangeEvent::Trade(t) => &t.symbol,
        ChangeEvent::Kline(k) => &k.symbol,
        ChangeEvent::MarkPrice(m) => &m.symbol,
        ChangeEvent::Liquidation(l) => &l.symbol,
    }
}
