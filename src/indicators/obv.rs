//! On-Balance Volume direction signal.

use crate::model::Candle;

/// Cumulative OBV series: up-volume added, down-volume subtracted, unchanged
/// closes contribute zero.
pub fn calculate_obv(candles: &[Candle]) -> Vec<f64> {
    if candles.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(candles.len());
    let mut obv = 0.0;
    out.push(obv);
    for w in candles.windows(2) {
        if w[1].close > w[0].close {
            obv += w[1].volume;
        } else if w[1].close < w[0].close {
            obv -= w[1].volume;
        }
        out.push(obv);
    }
    out
}

/// Sign of `OBV[n] - OBV[n-lookback]`: `+1`, `-1`, or `0`.
pub fn obv_direction(candles: &[Candle], lookback: usize) -> i8 {
    let series = calculate_obv(candles);
    if series.len() <= lookback {
        return 0;
    }
    let delta = series[series.len() - 1] - series[series.len() - 1 - lookback];
    if delta > 0.0 {
        1
    } else if delta < 0.0 {
        -1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64) -> Candle {
        Candle {
            t_unix_sec: 0,
            open: close,
            high: close,
            low: close,
            close,
            volume: 10.0,
            is_closed: true,
        }
    }

    #[test]
    fn obv_direction_positive_on_rising_closes() {
        let candles: Vec<Candle> = (0..10).map(|i| candle(100.0 + i as f64)).collect();
        assert_eq!(obv_direction(&candles, 5), 1);
    }

    #[test]
    fn obv_direction_zero_on_insufficient_history() {
        let candles = vec![candle(100.0)];
        assert_eq!(obv_direction(&candles, 5), 0);
    }
}
