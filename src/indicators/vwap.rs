//! Volume-weighted average price over a rolling window, and the z-score of
//! the current close against the typical-price window.

use crate::model::Candle;

pub fn calculate_vwap(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }
    let window = &candles[candles.len() - period..];
    let (num, den) = window.iter().fold((0.0, 0.0), |(n, d), c| {
        let tp = c.typical_price();
        (n + tp * c.volume, d + c.volume)
    });
    if den == 0.0 {
        return None;
    }
    let vwap = num / den;
    vwap.is_finite().then_some(vwap)
}

pub fn vwap_z(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }
    let window = &candles[candles.len() - period..];
    let typicals: Vec<f64> = window.iter().map(Candle::typical_price).collect();
    let close = window.last()?.close;
    zscore(&typicals, close)
}

/// `(value - mean) / stddev`; returns `Some(0.0)` when stddev is zero (flat
/// window) rather than propagating a division-by-zero NaN.
pub fn zscore(series: &[f64], value: f64) -> Option<f64> {
    if series.is_empty() {
        return None;
    }
    let mean = series.iter().sum::<f64>() / series.len() as f64;
    let variance = series.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / series.len() as f64;
    let stddev = variance.sqrt();
    if stddev == 0.0 {
        return Some(0.0);
    }
    let z = (value - mean) / stddev;
    z.is_finite().then_some(z)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64, volume: f64) -> Candle {
        Candle {
            t_unix_sec: 0,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume,
            is_closed: true,
        }
    }

    #[test]
    fn vwap_insufficient_data_returns_none() {
        assert!(calculate_vwap(&[candle(1.0, 1.0)], 20).is_none());
    }

    #[test]
    fn vwap_weights_by_volume() {
        let candles = vec![candle(100.0, 1.0), candle(200.0, 9.0)];
        let vwap = calculate_vwap(&candles, 2).unwrap();
        assert!((vwap - 190.0).abs() < 1.0);
    }

    #[test]
    fn zscore_flat_series_is_zero_not_nan() {
        let series = vec![5.0, 5.0, 5.0, 5.0];
        assert_eq!(zscore(&series, 5.0), Some(0.0));
    }

    #[test]
    fn zscore_empty_series_is_none() {
        assert!(zscore(&[], 1.0).is_none());
    }
}
