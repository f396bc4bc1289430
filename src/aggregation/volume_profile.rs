//! Volume profile: bucketed volume by price, with POC/VAH/VAL/VAV. Generalizes the teacher's
//! `data::market_data::VolumeProfile` (POC-only, trade-driven) to the full value-area algorithm
//! over a window of candles per §4.4.
//!
//! Each candle's volume is distributed across the price buckets its `[low,high]` range
//! intersects, proportional to the fraction of that range falling in the bucket (a doji
//! candle, `high == low`, puts all of its volume in the close-price bucket). The buy/sell
//! split within a candle is the documented body/range heuristic (§9): bullish candles
//! contribute 60-90% of their volume as "buy", scaled by how much of the range the body
//! covers; bearish candles 10-30%. This is a known approximation, not a stand-in for real
//! trade data. `footprint` uses the trade ring directly where it's available.

use serde::{Deserialize, Serialize};

use crate::model::Kline;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub volume: f64,
    /// Fraction (0..1) of the profile's total volume carried by this level.
    pub pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeProfile {
    pub symbol: String,
    pub levels: Vec<PriceLevel>,
    pub total_volume: f64,
    /// Point of control: the price bucket with the most traded volume.
    pub poc: f64,
    /// Value area high/low: the price range containing `target_pct` of total volume,
    /// expanded outward from the POC.
    pub vah: f64,
    pub val: f64,
    /// Value area volume: the volume actually captured within [val, vah].
    pub vav: f64,
}

/// Fraction of `kline`'s volume scored as "buy" under the body/range heuristic (§4.4/§9).
/// A flat candle (`close == open`) is scored as bearish with a zero body ratio, i.e. the
/// heuristic's floor.
fn heuristic_buy_fraction(kline: &Kline) -> f64 {
    let range = (kline.high - kline.low).max(f64::EPSILON);
    let body_ratio = ((kline.close - kline.open).abs() / range).min(1.0);
    if kline.close > kline.open {
        0.6 + 0.3 * body_ratio
    } else {
        0.1 + 0.2 * body_ratio
    }
}

/// Build a volume profile from a window of candles, bucketing `[minLow, maxHigh]` into
/// `num_buckets` evenly-spaced price levels and expanding the value area outward from the
/// POC until `target_pct` of total volume is captured.
pub fn compute_volume_profile(
    symbol: &str,
    klines: &[Kline],
    num_buckets: usize,
    target_pct: f64,
) -> VolumeProfile {
    if klines.is_empty() || num_buckets == 0 {
        return empty_profile(symbol);
    }

    let min_low = klines.iter().map(|k| k.low).fold(f64::INFINITY, f64::min);
    let max_high = klines.iter().map(|k| k.high).fold(f64::NEG_INFINITY, f64::max);
    let bucket_width = ((max_high - min_low) / num_buckets as f64).max(f64::EPSILON);

    let bucket_index = |price: f64| -> usize {
        (((price - min_low) / bucket_width) as isize).clamp(0, num_buckets as isize - 1) as usize
    };

    let mut buy = vec![0.0_f64; num_buckets];
    let mut sell = vec![0.0_f64; num_buckets];

    for kline in klines {
        let buy_fraction = heuristic_buy_fraction(kline);

        if kline.high <= kline.low {
            let idx = bucket_index(kline.close);
            buy[idx] += kline.volume * buy_fraction;
            sell[idx] += kline.volume * (1.0 - buy_fraction);
            continue;
        }

        let range = kline.high - kline.low;
        let first = bucket_index(kline.low);
        let last = bucket_index(kline.high);
        for idx in first..=last {
            let bucket_low = min_low + idx as f64 * bucket_width;
            let bucket_high = bucket_low + bucket_width;
            let overlap = (kline.high.min(bucket_high) - kline.low.max(bucket_low)).max(0.0);
            if overlap <= 0.0 {
                continue;
            }
            let bucket_volume = kline.volume * (overlap / range);
            buy[idx] += bucket_volume * buy_fraction;
            sell[idx] += bucket_volume * (1.0 - buy_fraction);
        }
    }

    let total_volume: f64 = buy.iter().zip(&sell).map(|(b, s)| b + s).sum();
    if total_volume <= 0.0 {
        return empty_profile(symbol);
    }

    let poc_index = (0..num_buckets)
        .max_by(|&a, &b| (buy[a] + sell[a]).partial_cmp(&(buy[b] + sell[b])).unwrap())
        .unwrap();

    let (val_index, vah_index, vav) = expand_value_area(&buy, &sell, poc_index, total_volume, target_pct);

    let bucket_price = |idx: usize| min_low + (idx as f64 + 0.5) * bucket_width;

    let levels = (0..num_buckets)
        .filter(|&i| buy[i] + sell[i] > 0.0)
        .map(|i| {
            let volume = buy[i] + sell[i];
            PriceLevel {
                price: bucket_price(i),
                buy_volume: buy[i],
                sell_volume: sell[i],
                volume,
                pct: volume / total_volume,
            }
        })
        .collect();

    VolumeProfile {
        symbol: symbol.to_string(),
        levels,
        total_volume,
        poc: bucket_price(poc_index),
        vah: bucket_price(vah_index),
        val: bucket_price(val_index),
        vav,
    }
}

fn empty_profile(symbol: &str) -> VolumeProfile {
    VolumeProfile {
        symbol: symbol.to_string(),
        levels: Vec::new(),
        total_volume: 0.0,
        poc: 0.0,
        vah: 0.0,
        val: 0.0,
        vav: 0.0,
    }
}

/// Classic value-area expansion: starting from the POC, repeatedly add whichever
/// neighboring (above or below) bucket carries more volume until `target_pct` of total
/// volume is covered or both ends of the range are reached.
fn expand_value_area(
    buy: &[f64],
    sell: &[f64],
    poc_index: usize,
    total_volume: f64,
    target_pct: f64,
) -> (usize, usize, f64) {
    let volume_at = |i: usize| buy[i] + sell[i];
    let n = buy.len();

    let mut low = poc_index;
    let mut high = poc_index;
    let mut covered = volume_at(poc_index);
    let target = total_volume * target_pct;

    while covered < target && (low > 0 || high + 1 < n) {
        let below = if low > 0 { Some(volume_at(low - 1)) } else { None };
        let above = if high + 1 < n { Some(volume_at(high + 1)) } else { None };

        match (below, above) {
            (Some(b), Some(a)) if a >= b => {
                high += 1;
                covered += a;
            }
            (Some(b), Some(_)) => {
                low -= 1;
                covered += b;
            }
            (Some(b), None) => {
                low -= 1;
                covered += b;
            }
            (None, Some(a)) => {
                high += 1;
                covered += a;
            }
            (None, None) => break,
        }
    }

    (low, high, covered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kline(low: f64, high: f64, open: f64, close: f64, volume: f64) -> Kline {
        Kline {
            symbol: "BTCUSDT".to_string(),
            interval: "15m".to_string(),
            open_time: 0,
            close_time: 899_999,
            open,
            high,
            low,
            close,
            volume,
            taker_buy_volume: volume / 2.0,
            quote_volume: volume * ((low + high) / 2.0),
            trade_count: 10,
            is_closed: true,
        }
    }

    #[test]
    fn poc_is_the_highest_volume_bucket() {
        let klines = vec![
            kline(99.0, 101.0, 99.5, 100.5, 1.0),
            kline(100.0, 102.0, 100.5, 101.5, 20.0),
            kline(103.0, 105.0, 103.5, 104.5, 1.0),
        ];
        let profile = compute_volume_profile("BTCUSDT", &klines, 3, 0.7);
        assert_eq!(profile.poc, 100.0);
    }

    #[test]
    fn value_area_volume_conserves_against_bucket_sum() {
        let klines = vec![
            kline(99.0, 100.0, 99.2, 99.8, 2.0),
            kline(100.0, 101.0, 100.2, 100.9, 10.0),
            kline(101.0, 102.0, 101.8, 101.2, 3.0),
            kline(102.0, 103.0, 102.1, 102.9, 1.0),
        ];
        let profile = compute_volume_profile("BTCUSDT", &klines, 4, 0.7);
        let bucket_sum: f64 = profile.levels.iter().map(|l| l.volume).sum();
        let expected_total: f64 = klines.iter().map(|k| k.volume).sum();
        assert!((bucket_sum - expected_total).abs() < 1e-6);
        assert!((profile.total_volume - expected_total).abs() < 1e-6);
        assert!(profile.val <= profile.poc);
        assert!(profile.vah >= profile.poc);
        assert!(profile.vav >= profile.total_volume * 0.7 || profile.vav == profile.total_volume);
    }

    #[test]
    fn levels_carry_a_percent_of_total_volume() {
        let klines = vec![kline(100.0, 101.0, 100.0, 101.0, 10.0)];
        let profile = compute_volume_profile("BTCUSDT", &klines, 1, 0.7);
        assert_eq!(profile.levels.len(), 1);
        assert!((profile.levels[0].pct - 1.0).abs() < 1e-9);
    }

    #[test]
    fn bullish_candle_skews_buy_volume_with_body_to_range_ratio() {
        // Full-body bullish candle (close == high, open == low): body/range ratio is 1.0,
        // so the heuristic assigns the 60-90% ceiling (90%) as buy.
        let klines = vec![kline(100.0, 110.0, 100.0, 110.0, 10.0)];
        let profile = compute_volume_profile("BTCUSDT", &klines, 1, 0.7);
        assert_eq!(profile.levels.len(), 1);
        assert!((profile.levels[0].buy_volume - 9.0).abs() < 1e-9);
        assert!((profile.levels[0].sell_volume - 1.0).abs() < 1e-9);
    }

    #[test]
    fn doji_candle_assigns_all_volume_to_the_close_price_bucket() {
        let klines = vec![kline(100.0, 100.0, 100.0, 100.0, 5.0)];
        let profile = compute_volume_profile("BTCUSDT", &klines, 5, 0.7);
        assert_eq!(profile.levels.len(), 1);
        assert!((profile.levels[0].volume - 5.0).abs() < 1e-9);
    }

    #[test]
    fn empty_klines_yield_empty_profile() {
        let profile = compute_volume_profile("BTCUSDT", &[], 10, 0.7);
        assert_eq!(profile.total_volume, 0.0);
        assert!(profile.levels.is_empty());
    }
}
