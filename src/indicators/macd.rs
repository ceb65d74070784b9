//! MACD(12, 26, 9): difference of a fast and slow EMA of closes, with a
//! signal EMA of that difference and the resulting histogram.

use super::ema::calculate_ema;

#[derive(Debug, Clone, Copy)]
pub struct MacdResult {
    pub macd: f64,
    pub signal: f64,
    pub hist: f64,
}

/// Returns `None` when there isn't enough history for the slow EMA plus the
/// signal-line smoothing window.
pub fn calculate_macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Option<MacdResult> {
    if closes.len() < slow + signal_period {
        return None;
    }
    let fast_ema = calculate_ema(closes, fast);
    let slow_ema = calculate_ema(closes, slow);
    if fast_ema.is_empty() || slow_ema.is_empty() {
        return None;
    }

    // Align series: fast_ema starts at index `fast-1`, slow at `slow-1` of
    // the original closes. Slice fast_ema to the same starting point as slow.
    let offset = slow - fast;
    if fast_ema.len() <= offset {
        return None;
    }
    let aligned_fast = &fast_ema[offset..];
    let len = aligned_fast.len().min(slow_ema.len());
    let macd_line: Vec<f64> = (0..len)
        .map(|i| aligned_fast[i] - slow_ema[i])
        .collect();

    if macd_line.len() < signal_period {
        return None;
    }
    let signal_series = calculate_ema(&macd_line, signal_period);
    let signal = *signal_series.last()?;
    let macd = *macd_line.last()?;
    let hist = macd - signal;
    if !macd.is_finite() || !signal.is_finite() || !hist.is_finite() {
        return None;
    }
    Some(MacdResult { macd, signal, hist })
}

/// Previous bar's histogram, for `macd_slope = hist[n] - hist[n-1]`.
pub fn calculate_macd_series_hist(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Vec<f64> {
    if closes.len() < slow + signal_period {
        return Vec::new();
    }
    let fast_ema = calculate_ema(closes, fast);
    let slow_ema = calculate_ema(closes, slow);
    let offset = slow - fast;
    if fast_ema.len() <= offset {
        return Vec::new();
    }
    let aligned_fast = &fast_ema[offset..];
    let len = aligned_fast.len().min(slow_ema.len());
    let macd_line: Vec<f64> = (0..len)
        .map(|i| aligned_fast[i] - slow_ema[i])
        .collect();
    let signal_series = calculate_ema(&macd_line, signal_period);
    if signal_series.is_empty() {
        return Vec::new();
    }
    let macd_tail = &macd_line[macd_line.len() - signal_series.len()..];
    macd_tail
        .iter()
        .zip(signal_series.iter())
        .map(|(m, s)| m - s)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closes(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + (i as f64) * 0.3).collect()
    }

    #[test]
    fn insufficient_history_returns_none() {
        assert!(calculate_macd(&closes(10), 12, 26, 9).is_none());
    }

    #[test]
    fn trending_series_has_positive_macd() {
        let result = calculate_macd(&closes(100), 12, 26, 9).unwrap();
        assert!(result.macd > 0.0);
        assert!(result.macd.is_finite());
        assert!(result.signal.is_finite());
    }

    #[test]
    fn hist_equals_macd_minus_signal() {
        let result = calculate_macd(&closes(100), 12, 26, 9).unwrap();
        assert!((result.hist - (result.macd - result.signal)).abs() < 1e-9);
    }
}
