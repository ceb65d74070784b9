//! Regime classification (spec §4.2): trend, volatility and momentum labels
//! derived directly from timeframe features, no hidden state.

use crate::model::{MaStack, Momentum, RegimeSnapshot, Trend, Volatility};

/// `bull` if both 15m and 1h stacks are present and neither is bearish (and
/// at least one is bullish); `bear` symmetrically; else `neutral`.
pub fn classify_trend(ma_15m: Option<MaStack>, ma_1h: Option<MaStack>) -> Trend {
    match (ma_15m, ma_1h) {
        (Some(a), Some(b)) => {
            let any_bull = a == MaStack::Bull || b == MaStack::Bull;
            let any_bear = a == MaStack::Bear || b == MaStack::Bear;
            if any_bull && !any_bear {
                Trend::Bull
            } else if any_bear && !any_bull {
                Trend::Bear
            } else {
                Trend::Neutral
            }
        }
        _ => Trend::Neutral,
    }
}

pub fn classify_volatility(atr_percentile_15m: Option<f64>) -> Volatility {
    match atr_percentile_15m {
        Some(p) if p >= 70.0 => Volatility::High,
        Some(p) if p <= 30.0 => Volatility::Low,
        Some(_) => Volatility::Normal,
        None => Volatility::Unknown,
    }
}

pub fn classify_momentum(macd_hist_5m: Option<f64>, macd_hist_15m: Option<f64>) -> Momentum {
    match (macd_hist_5m, macd_hist_15m) {
        (Some(a), Some(b)) if a > 0.0 && b > 0.0 => Momentum::Positive,
        (Some(a), Some(b)) if (a > 0.0) != (b > 0.0) => Momentum::Mixed,
        (Some(_), Some(_)) => Momentum::Neutral,
        _ => Momentum::Neutral,
    }
}

pub fn classify_regime(
    ma_15m: Option<MaStack>,
    ma_1h: Option<MaStack>,
    atr_percentile_15m: Option<f64>,
    macd_hist_5m: Option<f64>,
    macd_hist_15m: Option<f64>,
) -> RegimeSnapshot {
    RegimeSnapshot {
        trend: classify_trend(ma_15m, ma_1h),
        volatility: classify_volatility(atr_percentile_15m),
        momentum: classify_momentum(macd_hist_5m, macd_hist_15m),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trend_bull_when_both_bullish() {
        assert_eq!(
            classify_trend(Some(MaStack::Bull), Some(MaStack::Bull)),
            Trend::Bull
        );
    }

    #[test]
    fn trend_neutral_on_conflict() {
        assert_eq!(
            classify_trend(Some(MaStack::Bull), Some(MaStack::Bear)),
            Trend::Neutral
        );
    }

    #[test]
    fn trend_neutral_when_missing_timeframe() {
        assert_eq!(classify_trend(None, Some(MaStack::Bull)), Trend::Neutral);
    }

    #[test]
    fn volatility_thresholds() {
        assert_eq!(classify_volatility(Some(71.0)), Volatility::High);
        assert_eq!(classify_volatility(Some(29.0)), Volatility::Low);
        assert_eq!(classify_volatility(Some(50.0)), Volatility::Normal);
        assert_eq!(classify_volatility(None), Volatility::Unknown);
    }

    #[test]
    fn momentum_mixed_when_histograms_disagree() {
        assert_eq!(classify_momentum(Some(1.0), Some(-1.0)), Momentum::Mixed);
    }

    #[test]
    fn momentum_positive_when_both_positive() {
        assert_eq!(classify_momentum(Some(0.5), Some(0.2)), Momentum::Positive);
    }
}
