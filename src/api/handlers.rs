use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::model::{interval_ms, Kline};

use super::response::with_response_headers;
use super::AppState;

#[derive(Debug, Serialize)]
struct CompactCandlePoint {
    t: u64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
    bv: f64,
    sv: f64,
}

impl From<&Kline> for CompactCandlePoint {
    fn from(k: &Kline) -> Self {
        Self {
            t: k.open_time,
            o: k.open,
            h: k.high,
            l: k.low,
            c: k.close,
            v: k.volume,
            bv: k.taker_buy_volume,
            sv: k.sell_volume(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CompactCandles {
    s: String,
    i: String,
    d: Vec<CompactCandlePoint>,
    n: usize,
    f: u64,
    l: u64,
}

fn compact_candles(symbol: &str, interval: &str, klines: &[Kline]) -> CompactCandles {
    let d: Vec<CompactCandlePoint> = klines.iter().map(CompactCandlePoint::from).collect();
    CompactCandles {
        s: symbol.to_string(),
        i: interval.to_string(),
        n: d.len(),
        f: d.first().map(|c| c.t).unwrap_or(0),
        l: d.last().map(|c| c.t).unwrap_or(0),
        d,
    }
}

fn require_known_interval(interval: &str) -> AppResult<()> {
    interval_ms(interval)
        .map(|_| ())
        .ok_or_else(|| AppError::InvalidRequest(format!("unknown interval {interval}")))
}

fn require_range(value: usize, max: usize, name: &str) -> AppResult<()> {
    if value == 0 || value > max {
        return Err(AppError::InvalidRequest(format!(
            "{name} must be in 1..={max}"
        )));
    }
    Ok(())
}

pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let _ = &state;
    Json(serde_json::json!({"status": "healthy", "database": state.settings.database.path})).into_response()
}

#[derive(Debug, Serialize)]
struct SymbolsResponse {
    count: usize,
    symbols: Vec<String>,
}

pub async fn list_symbols(State(state): State<Arc<AppState>>) -> Response {
    let symbols = state.store.symbols();
    Json(SymbolsResponse {
        count: symbols.len(),
        symbols,
    })
    .into_response()
}

pub async fn symbol_info(State(state): State<Arc<AppState>>, Path(symbol): Path<String>) -> AppResult<Response> {
    if !state.store.has_symbol(&symbol) {
        return Err(AppError::NotFound(format!("symbol {symbol} not tracked")));
    }
    Ok(Json(serde_json::json!({
        "symbol": symbol,
        "subscriber_count": state.hub.subscriber_count(&symbol),
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct AddSymbolRequest {
    pub symbol: String,
    #[allow(dead_code)]
    pub base_asset: Option<String>,
    #[allow(dead_code)]
    pub quote_asset: Option<String>,
}

pub async fn add_symbol(State(state): State<Arc<AppState>>, Json(req): Json<AddSymbolRequest>) -> Response {
    let symbol = req.symbol.to_uppercase();
    state.store.add_symbol(&symbol);
    let _ = state.dyn_symbol_tx.try_send(symbol.clone());
    Json(serde_json::json!({"symbol": symbol, "added": true})).into_response()
}

#[derive(Debug, Deserialize)]
pub struct CandlesQuery {
    pub interval: String,
    pub limit: Option<usize>,
}

pub async fn candles(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<CandlesQuery>,
) -> AppResult<Response> {
    let started = Instant::now();
    require_known_interval(&query.interval)?;
    let limit = query.limit.unwrap_or(500);
    require_range(limit, 1500, "limit")?;

    let klines = state.candles.get_candles(&symbol, &query.interval, limit).await?;
    let count = klines.len();
    let body = compact_candles(&symbol, &query.interval, &klines);
    Ok(with_response_headers(
        body,
        started,
        count,
        &format!("{symbol}:{}", query.interval),
    ))
}

#[derive(Debug, Deserialize)]
pub struct LatestCandleQuery {
    pub interval: String,
}

pub async fn latest_candle(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<LatestCandleQuery>,
) -> AppResult<Response> {
    require_known_interval(&query.interval)?;
    let (current, closed) = state
        .store
        .get_kline(&symbol, &query.interval)
        .ok_or_else(|| AppError::NotFound(format!("no klines for {symbol}")))?;
    let candle = current.or_else(|| closed.last().cloned());
    Ok(Json(serde_json::json!({
        "symbol": symbol,
        "interval": query.interval,
        "candle": candle,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct CandlesRangeQuery {
    pub interval: String,
    pub start_time: u64,
    pub end_time: u64,
}

pub async fn candles_range(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<CandlesRangeQuery>,
) -> AppResult<Response> {
    require_known_interval(&query.interval)?;
    if query.start_time >= query.end_time {
        return Err(AppError::InvalidRequest("start_time must precede end_time".to_string()));
    }
    let klines = state
        .candles
        .range(&symbol, &query.interval, query.start_time, query.end_time)
        .await?;
    Ok(Json(compact_candles(&symbol, &query.interval, &klines)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct AggregationCandlesQuery {
    pub limit: Option<usize>,
}

pub async fn aggregation_candles(
    State(state): State<Arc<AppState>>,
    Path((symbol, interval)): Path<(String, String)>,
    Query(query): Query<AggregationCandlesQuery>,
) -> AppResult<Response> {
    require_known_interval(&interval)?;
    let limit = query.limit.unwrap_or(500);
    require_range(limit, 5000, "limit")?;
    let klines = state.candles.get_candles(&symbol, &interval, limit).await?;
    Ok(Json(compact_candles(&symbol, &interval, &klines)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct HoursQuery {
    pub hours: Option<u64>,
}

pub async fn volume_profile(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<HoursQuery>,
) -> AppResult<Response> {
    let hours = query.hours.unwrap_or(24);
    require_range(hours as usize, 168, "hours")?;
    let profile = state.aggregation.volume_profile(&symbol, hours).await;
    Ok(Json(&*profile).into_response())
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

pub async fn footprint(
    State(state): State<Arc<AppState>>,
    Path((symbol, interval)): Path<(String, String)>,
    Query(query): Query<LimitQuery>,
) -> AppResult<Response> {
    require_known_interval(&interval)?;
    let limit = query.limit.unwrap_or(100);
    require_range(limit, 1000, "limit")?;
    let candles = state.aggregation.footprint(&symbol, &interval).await;
    let trimmed: Vec<_> = candles.iter().rev().take(limit).rev().cloned().collect();
    Ok(Json(trimmed).into_response())
}

pub async fn liquidations(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<HoursQuery>,
) -> AppResult<Response> {
    let hours = query.hours.unwrap_or(1);
    require_range(hours as usize, 24, "hours")?;
    let since_ms = now_ms().saturating_sub(hours * 3_600_000);
    let clusters = state.aggregation.liquidation_clusters(&symbol, since_ms).await;
    Ok(Json(&*clusters).into_response())
}

#[derive(Debug, Deserialize)]
pub struct HeatmapQuery {
    pub hours: Option<u64>,
    pub resolution: Option<u32>,
}

pub async fn heatmap(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<HeatmapQuery>,
) -> AppResult<Response> {
    let hours = query.hours.unwrap_or(1);
    require_range(hours as usize, 48, "hours")?;
    let resolution = query.resolution.unwrap_or(100);
    if !(10..=500).contains(&resolution) {
        return Err(AppError::InvalidRequest("resolution must be in 10..=500".to_string()));
    }
    let end = now_ms();
    let start = end.saturating_sub(hours * 3_600_000);
    let grid = state
        .aggregation
        .heatmap(&symbol, start, end)
        .ok_or_else(|| AppError::NotFound(format!("no depth history for {symbol}")))?;
    Ok(Json(grid).into_response())
}

#[derive(Debug, Deserialize)]
pub struct MultiRequest {
    pub symbol: String,
    pub intervals: Vec<String>,
    pub limit: Option<usize>,
    pub include_volume_profile: Option<bool>,
    pub include_liquidations: Option<bool>,
    pub vp_hours: Option<u64>,
    pub liq_hours: Option<u64>,
}

pub async fn aggregation_multi(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MultiRequest>,
) -> AppResult<Response> {
    let limit = req.limit.unwrap_or(500);
    require_range(limit, 5000, "limit")?;

    let mut candles_by_interval = serde_json::Map::new();
    for interval in &req.intervals {
        require_known_interval(interval)?;
        let klines = state.candles.get_candles(&req.symbol, interval, limit).await?;
        candles_by_interval.insert(
            interval.clone(),
            serde_json::to_value(compact_candles(&req.symbol, interval, &klines))?,
        );
    }

    let volume_profile = if req.include_volume_profile.unwrap_or(false) {
        let hours = req.vp_hours.unwrap_or(24);
        require_range(hours as usize, 168, "vp_hours")?;
        Some(state.aggregation.volume_profile(&req.symbol, hours).await)
    } else {
        None
    };

    let liquidations = if req.include_liquidations.unwrap_or(false) {
        let hours = req.liq_hours.unwrap_or(1);
        require_range(hours as usize, 24, "liq_hours")?;
        let since_ms = now_ms().saturating_sub(hours * 3_600_000);
        Some(state.aggregation.liquidation_clusters(&req.symbol, since_ms).await)
    } else {
        None
    };

    Ok(Json(serde_json::json!({
        "symbol": req.symbol,
        "candles": candles_by_interval,
        "volume_profile": volume_profile.as_deref(),
        "liquidations": liquidations.as_deref(),
    }))
    .into_response())
}

pub async fn aggregation_stats(State(state): State<Arc<AppState>>) -> Response {
    Json(serde_json::json!({
        "symbols_tracked": state.store.symbols().len(),
        "computation_cache_ttl_secs": state.settings.aggregation.computation_cache_ttl_secs,
    }))
    .into_response()
}

pub async fn websocket_stats(State(state): State<Arc<AppState>>) -> Response {
    let symbols = state.store.symbols();
    let per_symbol: serde_json::Map<String, serde_json::Value> = symbols
        .iter()
        .map(|s| (s.clone(), serde_json::json!(state.hub.subscriber_count(s))))
        .collect();
    let connections: Vec<serde_json::Value> = state
        .ingest_status
        .iter()
        .enumerate()
        .map(|(id, status)| serde_json::json!({"connection": id, "state": status.label()}))
        .collect();
    let upstream_connected = state.ingest_status.iter().any(|s| s.is_streaming());
    Json(serde_json::json!({
        "subscribers_by_symbol": per_symbol,
        "client_count": state.hub.client_count(),
        "upstream_connected": upstream_connected,
        "upstream_connections": connections,
    }))
    .into_response()
}

pub async fn ws_price(State(state): State<Arc<AppState>>, Path(symbol): Path<String>) -> AppResult<Response> {
    let price = state.store.get_price(&symbol).ok_or_else(|| {
        if state.upstream_down() {
            AppError::UpstreamUnavailable(format!("upstream disconnected, no price cached for {symbol}"))
        } else {
            AppError::PriceUnavailable(format!("no price cached for {symbol}"))
        }
    })?;
    Ok(Json(price).into_response())
}

pub async fn ws_depth(State(state): State<Arc<AppState>>, Path(symbol): Path<String>) -> AppResult<Response> {
    let depth = state.store.get_depth(&symbol).ok_or_else(|| {
        if state.upstream_down() {
            AppError::UpstreamUnavailable(format!("upstream disconnected, no depth cached for {symbol}"))
        } else {
            AppError::NotFound(format!("no depth cached for {symbol}"))
        }
    })?;
    Ok(Json(depth).into_response())
}

pub async fn ws_trades(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<LimitQuery>,
) -> AppResult<Response> {
    let limit = query.limit.unwrap_or(100);
    require_range(limit, 1000, "limit")?;
    Ok(Json(state.store.get_recent_trades(&symbol, limit)).into_response())
}

pub async fn ws_kline(
    State(state): State<Arc<AppState>>,
    Path((symbol, interval)): Path<(String, String)>,
) -> AppResult<Response> {
    require_known_interval(&interval)?;
    let (current, closed) = state
        .store
        .get_kline(&symbol, &interval)
        .ok_or_else(|| AppError::NotFound(format!("no klines for {symbol}")))?;
    let kline = current
        .or_else(|| closed.last().cloned())
        .ok_or_else(|| AppError::NotFound(format!("no klines for {symbol}")))?;
    Ok(Json(serde_json::json!({
        "symbol": symbol,
        "interval": interval,
        "candle": CompactCandlePoint::from(&kline),
        "delta": kline.taker_buy_volume - kline.sell_volume(),
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct IntervalQuery {
    pub interval: String,
}

pub async fn ws_volume(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<IntervalQuery>,
) -> AppResult<Response> {
    require_known_interval(&query.interval)?;
    let (current, _) = state
        .store
        .get_kline(&symbol, &query.interval)
        .ok_or_else(|| AppError::NotFound(format!("no klines for {symbol}")))?;
    let kline = current.ok_or_else(|| AppError::NotFound(format!("no forming candle for {symbol}")))?;
    Ok(Json(serde_json::json!({
        "symbol": symbol,
        "interval": query.interval,
        "buy_volume": kline.taker_buy_volume,
        "sell_volume": kline.sell_volume(),
    }))
    .into_response())
}

pub async fn ws_markprice(State(state): State<Arc<AppState>>, Path(symbol): Path<String>) -> AppResult<Response> {
    let mark = state
        .store
        .get_mark_price(&symbol)
        .ok_or_else(|| AppError::NotFound(format!("no mark price cached for {symbol}")))?;
    Ok(Json(mark).into_response())
}

pub async fn ws_liquidations(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<LimitQuery>,
) -> AppResult<Response> {
    let limit = query.limit.unwrap_or(100);
    require_range(limit, 1000, "limit")?;
    Ok(Json(state.store.get_liquidations(&symbol, 0, limit)).into_response())
}

pub async fn ws_add_symbol(State(state): State<Arc<AppState>>, Path(symbol): Path<String>) -> Response {
    let symbol = symbol.to_uppercase();
    state.store.add_symbol(&symbol);
    let _ = state.dyn_symbol_tx.try_send(symbol.clone());
    Json(serde_json::json!({"symbol": symbol, "added": true})).into_response()
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
