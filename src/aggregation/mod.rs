//! Aggregation engine: volume profile, footprint, liquidation classification and depth
//! heatmap, each served through a short-TTL computation cache per §4.4.

pub mod cache;
pub mod footprint;
pub mod heatmap;
pub mod liquidations;
pub mod volume_profile;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Settings;
use crate::model::Kline;
use crate::store::{ChangeEvent, Store};

use cache::ComputationCache;
use footprint::FootprintCandle;
use heatmap::{DepthHistory, HeatmapGrid};
use liquidations::{classify, ClassifierConfig, LiquidationCluster};
use volume_profile::VolumeProfile;

const DEPTH_HISTORY_TICK_SIZE: f64 = 0.01;
const DEPTH_HISTORY_CAPACITY: usize = 600;
const DEFAULT_BUCKET_SIZE: f64 = 1.0;
/// Candle interval the volume profile is computed over. `15m` trades off granularity against
/// the store's bounded 60-closed-candle-per-interval ring (§4.2): a `1m` series would only
/// span an hour of real history, `15m` stretches that to 15 hours. Requests for a longer
/// `hours` window than the ring currently holds are served from whatever is available,
/// same deferred-resampling tradeoff already made for the heatmap (see DESIGN.md).
const VOLUME_PROFILE_INTERVAL: &str = "15m";

pub struct AggregationEngine {
    store: Arc<Store>,
    classifier_config: ClassifierConfig,
    default_buckets: usize,
    value_area_target_pct: f64,
    volume_profile_cache: ComputationCache<VolumeProfile>,
    footprint_cache: ComputationCache<Vec<FootprintCandle>>,
    liquidation_cache: ComputationCache<Vec<LiquidationCluster>>,
    depth_history: Mutex<HashMap<String, DepthHistory>>,
}

impl AggregationEngine {
    pub fn new(store: Arc<Store>, settings: &Settings) -> Self {
        let ttl = Duration::from_secs(settings.aggregation.computation_cache_ttl_secs);
        Self {
            store,
            classifier_config: ClassifierConfig {
                cascade_window_ms: settings.aggregation.liquidation_cascade_window_ms,
                cascade_min_count: settings.aggregation.liquidation_cascade_min_count,
                sweep_window_ms: settings.aggregation.liquidation_sweep_window_ms,
                sweep_notional_threshold: settings.aggregation.liquidation_sweep_notional_threshold,
            },
            default_buckets: settings.aggregation.default_volume_profile_buckets,
            value_area_target_pct: settings.aggregation.value_area_target_pct,
            volume_profile_cache: ComputationCache::new(ttl),
            footprint_cache: ComputationCache::new(ttl),
            liquidation_cache: ComputationCache::new(ttl),
            depth_history: Mutex::new(HashMap::new()),
        }
    }

    /// Feed a store change event into the aggregation engine's own state (currently just
    /// the depth heatmap history; volume profile/footprint/liquidations are computed
    /// on-demand straight from the store).
    pub fn observe(&self, event: &ChangeEvent) {
        if let ChangeEvent::Depth(snapshot) = event {
            let mut history = self.depth_history.lock().unwrap();
            history
                .entry(snapshot.symbol.clone())
                .or_insert_with(|| {
                    DepthHistory::new(snapshot.symbol.clone(), DEPTH_HISTORY_TICK_SIZE, DEPTH_HISTORY_CAPACITY)
                })
                .record(snapshot);
        }
    }

    pub async fn volume_profile(&self, symbol: &str, hours: u64) -> Arc<VolumeProfile> {
        let store = self.store.clone();
        let symbol = symbol.to_string();
        let num_buckets = self.default_buckets;
        let target_pct = self.value_area_target_pct;
        let key = format!("vp:{symbol}:{hours}");
        self.volume_profile_cache
            .get_or_compute(&key, move || async move {
                let klines = candles_in_window(&store, &symbol, VOLUME_PROFILE_INTERVAL, hours);
                volume_profile::compute_volume_profile(&symbol, &klines, num_buckets, target_pct)
            })
            .await
    }

    pub async fn footprint(&self, symbol: &str, interval: &str) -> Arc<Vec<FootprintCandle>> {
        let store = self.store.clone();
        let symbol_owned = symbol.to_string();
        let interval_owned = interval.to_string();
        let bucket_size = bucket_size_for(&store, symbol, self.default_buckets);
        let key = format!("{symbol}:{interval}");
        self.footprint_cache
            .get_or_compute(&key, move || async move {
                let klines = store
                    .get_kline(&symbol_owned, &interval_owned)
                    .map(|(_, closed)| closed)
                    .unwrap_or_default();
                let trades = store.get_recent_trades(&symbol_owned, 1000);
                footprint::compute_footprint(&klines, &trades, bucket_size)
            })
            .await
    }

    pub async fn liquidation_clusters(&self, symbol: &str, since_ms: u64) -> Arc<Vec<LiquidationCluster>> {
        let store = self.store.clone();
        let symbol_owned = symbol.to_string();
        let config = ClassifierConfig {
            cascade_window_ms: self.classifier_config.cascade_window_ms,
            cascade_min_count: self.classifier_config.cascade_min_count,
            sweep_window_ms: self.classifier_config.sweep_window_ms,
            sweep_notional_threshold: self.classifier_config.sweep_notional_threshold,
        };
        let key = format!("liq:{symbol}:{since_ms}");
        self.liquidation_cache
            .get_or_compute(&key, move || async move {
                let mut liqs = store.get_liquidations(&symbol_owned, since_ms, 1000);
                liqs.reverse();
                classify(&symbol_owned, &liqs, &config)
            })
            .await
    }

    pub fn heatmap(&self, symbol: &str, start_time: u64, end_time: u64) -> Option<HeatmapGrid> {
        let history = self.depth_history.lock().unwrap();
        history.get(symbol).map(|h| h.grid(start_time, end_time))
    }
}

fn bucket_size_for(store: &Store, symbol: &str, default_buckets: usize) -> f64 {
    match store.get_price(symbol) {
        Some(tick) if tick.last_price > 0.0 => {
            (tick.last_price / default_buckets as f64).max(0.0001)
        }
        _ => DEFAULT_BUCKET_SIZE,
    }
}

/// Closed klines (plus the forming one, if any) for `symbol`/`interval` whose `open_time`
/// falls within the last `hours`, oldest-first. Bounded by whatever the store's closed-kline
/// ring (§4.2) currently holds for that interval.
fn candles_in_window(store: &Store, symbol: &str, interval: &str, hours: u64) -> Vec<Kline> {
    let Some((current, closed)) = store.get_kline(symbol, interval) else {
        return Vec::new();
    };
    let since = now_ms().saturating_sub(hours * 3_600_000);
    let mut klines: Vec<Kline> = closed.into_iter().filter(|k| k.open_time >= since).collect();
    if let Some(current) = current {
        if current.open_time >= since {
            klines.push(current);
        }
    }
    klines
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::IngestEvent;
    use crate::model::Kline;
    use tokio::sync::mpsc;

    fn test_engine() -> (Arc<Store>, AggregationEngine) {
        let (tx, _rx) = mpsc::channel(16);
        let store = Store::new(tx, vec!["BTCUSDT".to_string()]);
        let settings = Settings::default();
        let engine = AggregationEngine::new(store.clone(), &settings);
        (store, engine)
    }

    #[tokio::test]
    async fn volume_profile_reflects_closed_klines_in_window() {
        let (store, engine) = test_engine();
        let open_time = now_ms().saturating_sub(60_000);
        store.apply(IngestEvent::Kline(Kline {
            symbol: "BTCUSDT".to_string(),
            interval: VOLUME_PROFILE_INTERVAL.to_string(),
            open_time,
            close_time: open_time + 899_999,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 5.0,
            taker_buy_volume: 3.0,
            quote_volume: 500.0,
            trade_count: 4,
            is_closed: true,
        }));

        let profile = engine.volume_profile("BTCUSDT", 1).await;
        assert!((profile.total_volume - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn volume_profile_excludes_klines_outside_the_requested_window() {
        let (store, engine) = test_engine();
        let open_time = now_ms().saturating_sub(6 * 3_600_000);
        store.apply(IngestEvent::Kline(Kline {
            symbol: "BTCUSDT".to_string(),
            interval: VOLUME_PROFILE_INTERVAL.to_string(),
            open_time,
            close_time: open_time + 899_999,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 5.0,
            taker_buy_volume: 3.0,
            quote_volume: 500.0,
            trade_count: 4,
            is_closed: true,
        }));

        let profile = engine.volume_profile("BTCUSDT", 1).await;
        assert_eq!(profile.total_volume, 0.0);
    }

    #[test]
    fn heatmap_is_none_before_any_depth_observed() {
        let (_store, engine) = test_engine();
        assert!(engine.heatmap("BTCUSDT", 0, 1000).is_none());
    }
}
