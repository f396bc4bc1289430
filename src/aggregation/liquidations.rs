//! Liquidation classification: groups confirmed liquidations (already deduped by the
//! store) into single/cascade/sweep events. Confidence scoring keeps the teacher's
//! `analysis::liquidations::LiquidationDetector::calculate_liquidation_confidence` formula
//! (`volume_score * 0.6 + price_score * 0.4`), re-based from a statistical volume-spike
//! detector (needed when the teacher had no confirmed liquidation feed) onto the real
//! forceOrder stream: volume_score measures cluster notional against the sweep threshold,
//! price_score measures the price move across the cluster.

use serde::{Deserialize, Serialize};

use crate::model::Liquidation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidationKind {
    Single,
    Cascade,
    Sweep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationCluster {
    pub kind: LiquidationKind,
    pub symbol: String,
    pub start_time: u64,
    pub end_time: u64,
    pub notional: f64,
    pub confidence: f64,
    pub liquidations: Vec<Liquidation>,
}

pub struct ClassifierConfig {
    pub cascade_window_ms: u64,
    pub cascade_min_count: usize,
    pub sweep_window_ms: u64,
    pub sweep_notional_threshold: f64,
}

/// Classify a time-ordered run of liquidations for one symbol. `liquidations` must already
/// be sorted by `trade_time` ascending (the store's `liquidations_since` returns newest
/// first, so callers reverse before calling this).
pub fn classify(symbol: &str, liquidations: &[Liquidation], config: &ClassifierConfig) -> Vec<LiquidationCluster> {
    let mut clusters = Vec::new();
    let mut i = 0;

    while i < liquidations.len() {
        let anchor = &liquidations[i];
        let mut j = i + 1;
        while j < liquidations.len()
            && liquidations[j].trade_time - anchor.trade_time <= config.cascade_window_ms
        {
            j += 1;
        }
        let run = &liquidations[i..j];

        let same_side_count = run.iter().filter(|l| l.side == anchor.side).count();
        let both_sides_within_sweep = run
            .iter()
            .any(|l| l.side != anchor.side && l.trade_time - anchor.trade_time <= config.sweep_window_ms);
        let notional: f64 = run.iter().map(|l| l.notional()).sum();

        let kind = if both_sides_within_sweep && notional > config.sweep_notional_threshold {
            LiquidationKind::Sweep
        } else if same_side_count >= config.cascade_min_count {
            LiquidationKind::Cascade
        } else {
            LiquidationKind::Single
        };

        let volume_score = (notional / config.sweep_notional_threshold).min(1.0);
        let price_score = price_move_score(run);
        let confidence = (volume_score * 0.6 + price_score * 0.4).min(1.0);

        clusters.push(LiquidationCluster {
            kind,
            symbol: symbol.to_string(),
            start_time: run.first().unwrap().trade_time,
            end_time: run.last().unwrap().trade_time,
            notional,
            confidence,
            liquidations: run.to_vec(),
        });

        i = j;
    }

    clusters
}

fn price_move_score(run: &[Liquidation]) -> f64 {
    let first = run.first().unwrap().avg_price;
    let last = run.last().unwrap().avg_price;
    if first == 0.0 {
        return 0.0;
    }
    ((last - first).abs() / first).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LiquidationSide;

    fn liq(trade_time: u64, side: LiquidationSide, price: f64, qty: f64) -> Liquidation {
        Liquidation {
            symbol: "BTCUSDT".to_string(),
            side,
            order_price: price,
            avg_price: price,
            quantity: qty,
            status: "FILLED".to_string(),
            trade_time,
            event_time: trade_time,
        }
    }

    fn config() -> ClassifierConfig {
        ClassifierConfig {
            cascade_window_ms: 5_000,
            cascade_min_count: 3,
            sweep_window_ms: 2_000,
            sweep_notional_threshold: 500_000.0,
        }
    }

    #[test]
    fn single_liquidation_with_no_neighbors_is_single() {
        let liqs = vec![liq(0, LiquidationSide::Sell, 100.0, 1.0)];
        let clusters = classify("BTCUSDT", &liqs, &config());
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].kind, LiquidationKind::Single);
    }

    #[test]
    fn three_same_side_within_window_is_cascade() {
        let liqs = vec![
            liq(0, LiquidationSide::Sell, 100.0, 1.0),
            liq(1000, LiquidationSide::Sell, 99.0, 1.0),
            liq(2000, LiquidationSide::Sell, 98.0, 1.0),
        ];
        let clusters = classify("BTCUSDT", &liqs, &config());
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].kind, LiquidationKind::Cascade);
    }

    #[test]
    fn both_sides_with_large_notional_is_sweep() {
        let liqs = vec![
            liq(0, LiquidationSide::Sell, 100_000.0, 3.0),
            liq(500, LiquidationSide::Buy, 100_000.0, 3.0),
        ];
        let clusters = classify("BTCUSDT", &liqs, &config());
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].kind, LiquidationKind::Sweep);
    }
}
