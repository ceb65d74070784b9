//! Feature builder (spec §4.2): turns multi-timeframe OHLC history plus a
//! live L2 book into a single `FeatureSnapshot`. Grounded in the teacher's
//! `strategy.rs` pipeline shape, generalised from a single-timeframe scan to
//! the fixed six-timeframe fan-out this spec requires.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::errors::GatewayError;
use crate::gateway::KrakenRestClient;
use crate::indicators::{atr, macd, obv, rsi, sma, vwap};
use crate::model::{
    BookState, Candle, Confluence, FeatureSnapshot, HtfAnchors, LiquidityFlags, LiquiditySnapshot,
    MaStack, OrderbookFeatures, Position, RiskLedger, SwingFeatures, TimeframeFeatures,
};
use crate::regime::classify_regime;

struct TimeframeSpec {
    name: &'static str,
    interval_minutes: u32,
    lookback: usize,
}

const TIMEFRAMES: &[TimeframeSpec] = &[
    TimeframeSpec { name: "1m", interval_minutes: 1, lookback: 300 },
    TimeframeSpec { name: "5m", interval_minutes: 5, lookback: 300 },
    TimeframeSpec { name: "15m", interval_minutes: 15, lookback: 300 },
    TimeframeSpec { name: "1h", interval_minutes: 60, lookback: 360 },
    TimeframeSpec { name: "4h", interval_minutes: 240, lookback: 360 },
    TimeframeSpec { name: "1d", interval_minutes: 1440, lookback: 120 },
];

const HTF_CANDLE_COUNT: usize = 5;
const WEEKLY_INTERVAL_MINUTES: u32 = 10_080;

/// Below this many candles, the shortest indicator windows (sma20, the 20-bar
/// z-score) can't seed, so the whole timeframe is omitted rather than
/// returned half-populated.
const MIN_CANDLES_FOR_FEATURES: usize = 20;

/// Opaque position/risk state, passed through to the resulting snapshot
/// untouched (spec §4.2: "context carries current position and risk state").
pub struct BuildContext {
    pub position: Position,
    pub risk: RiskLedger,
}

pub struct FeatureBuilder {
    rest: Arc<KrakenRestClient>,
    slippage_target_notional: f64,
}

impl FeatureBuilder {
    pub fn new(rest: Arc<KrakenRestClient>, slippage_target_notional: f64) -> Self {
        Self { rest, slippage_target_notional }
    }

    #[instrument(skip(self, book, ctx), fields(pair = %pair_label))]
    pub async fn build(
        &self,
        pair_rest: &str,
        pair_label: &str,
        now_ms: i64,
        book: &BookState,
        ctx: BuildContext,
    ) -> FeatureSnapshot {
        // Fan out all six REST round-trips concurrently rather than awaiting
        // them one at a time; a slow 1d candle fetch shouldn't hold up 1m.
        let fetches = TIMEFRAMES.iter().map(|spec| async move {
            (spec.name, self.fetch_timeframe(pair_rest, spec).await)
        });
        let mut timeframes = BTreeMap::new();
        for (name, result) in join_all(fetches).await {
            match result {
                Ok(Some(features)) => {
                    timeframes.insert(name.to_string(), features);
                }
                Ok(None) => {
                    warn!(timeframe = name, "insufficient candle history, omitting");
                }
                Err(e) => {
                    warn!(timeframe = name, error = %e, "timeframe fetch failed, omitting");
                }
            }
        }

        let htf_anchors = self.build_htf_anchors(pair_rest, &timeframes).await;
        let orderbook = orderbook_features(book, self.slippage_target_notional);
        let confluence = confluence_score(&timeframes);
        let liquidity = liquidity_snapshot(&timeframes, &htf_anchors);
        let regime = classify_regime(
            timeframes.get("15m").and_then(|t| t.ma_stack),
            timeframes.get("1h").and_then(|t| t.ma_stack),
            timeframes.get("15m").and_then(|t| t.atr_percentile),
            timeframes.get("5m").and_then(|t| t.macd_hist),
            timeframes.get("15m").and_then(|t| t.macd_hist),
        );

        FeatureSnapshot {
            pair: pair_label.to_string(),
            ts_unix_ms: now_ms,
            timeframes,
            htf_anchors,
            orderbook,
            confluence,
            liquidity,
            regime,
            position: ctx.position,
            risk: ctx.risk,
        }
    }

    async fn fetch_timeframe(
        &self,
        pair_rest: &str,
        spec: &TimeframeSpec,
    ) -> Result<Option<TimeframeFeatures>, GatewayError> {
        let result = self
            .rest
            .historical_ohlc(pair_rest, spec.interval_minutes, None)
            .await?;
        let candles = parse_ohlc_result(&result).ok_or_else(|| {
            GatewayError::Parse(format!("unrecognised OHLC payload for {pair_rest}"))
        })?;
        let tail_start = candles.len().saturating_sub(spec.lookback);
        let window = &candles[tail_start..];
        Ok(compute_timeframe_features(window))
    }

    async fn build_htf_anchors(
        &self,
        pair_rest: &str,
        timeframes: &BTreeMap<String, TimeframeFeatures>,
    ) -> HtfAnchors {
        let daily = self.fetch_htf_candles(pair_rest, 1440).await;
        let weekly = self.fetch_htf_candles(pair_rest, WEEKLY_INTERVAL_MINUTES).await;
        let atr_daily = timeframes.get("1d").and_then(|t| t.atr14);
        let current_15m_close = timeframes.get("15m").map(|t| t.close);

        let (prev_day_high, prev_day_low) = prev_high_low(&daily);
        let (prev_week_high, prev_week_low) = prev_high_low(&weekly);
        let daily_open = daily.last().map(|c| c.open);

        let distance = |level: Option<f64>| match (current_15m_close, level, atr_daily) {
            (Some(close), Some(lvl), Some(atr)) if atr > 0.0 => Some((close - lvl) / atr),
            _ => None,
        };

        HtfAnchors {
            prev_day_high,
            prev_day_low,
            prev_week_high,
            prev_week_low,
            daily_open,
            distance_prev_day_high_atr: distance(prev_day_high),
            distance_prev_day_low_atr: distance(prev_day_low),
            distance_prev_week_high_atr: distance(prev_week_high),
            distance_prev_week_low_atr: distance(prev_week_low),
        }
    }

    async fn fetch_htf_candles(&self, pair_rest: &str, interval_minutes: u32) -> Vec<Candle> {
        match self.rest.historical_ohlc(pair_rest, interval_minutes, None).await {
            Ok(result) => match parse_ohlc_result(&result) {
                Some(candles) => {
                    let start = candles.len().saturating_sub(HTF_CANDLE_COUNT);
                    candles[start..].to_vec()
                }
                None => Vec::new(),
            },
            Err(e) => {
                warn!(interval_minutes, error = %e, "htf anchor fetch failed");
                Vec::new()
            }
        }
    }
}

/// Previous (second-to-last) candle's high/low — "previous" because the last
/// element is the still-forming current bar.
fn prev_high_low(candles: &[Candle]) -> (Option<f64>, Option<f64>) {
    if candles.len() < 2 {
        return (None, None);
    }
    let prev = &candles[candles.len() - 2];
    (Some(prev.high), Some(prev.low))
}

fn parse_num(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

/// Kraken's `/0/public/OHLC` result is `{ <pair_name>: [[time,open,high,low,
/// close,vwap,volume,count], …], last: <ts> }`. The pair key Kraken returns
/// is not always identical to the request's `pair` parameter (altname vs
/// wsname quirks), so the first non-`last` array is taken.
fn parse_ohlc_result(result: &Value) -> Option<Vec<Candle>> {
    let obj = result.as_object()?;
    let (_, rows) = obj.iter().find(|(k, _)| k.as_str() != "last")?;
    let rows = rows.as_array()?;
    let mut candles = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let row = row.as_array()?;
        candles.push(Candle {
            t_unix_sec: row.first()?.as_i64()?,
            open: parse_num(row.get(1)?)?,
            high: parse_num(row.get(2)?)?,
            low: parse_num(row.get(3)?)?,
            close: parse_num(row.get(4)?)?,
            volume: parse_num(row.get(6)?)?,
            is_closed: i + 1 < rows.len(),
        });
    }
    Some(candles)
}

fn compute_timeframe_features(candles: &[Candle]) -> Option<TimeframeFeatures> {
    if candles.len() < MIN_CANDLES_FOR_FEATURES {
        return None;
    }
    let current = candles.last()?;
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

    let sma20 = sma::calculate_sma(&closes, 20);
    let sma50 = sma::calculate_sma(&closes, 50);
    let sma200 = sma::calculate_sma(&closes, 200);
    let ma_stack = Some(sma::ma_stack(sma20, sma50, sma200));

    let price_z20 = last_window_zscore(&closes, 20, current.close);
    let volume_z20 = last_window_zscore(&volumes, 20, current.volume);

    let vwap20 = vwap::calculate_vwap(candles, 20);
    let vwap_z = vwap::vwap_z(candles, 20);

    let atr14 = atr::calculate(candles);
    let atr_pct = atr::calculate_atr_pct(candles, 14);
    let atr_percentile = atr::atr_percentile(candles, 14, 90);

    let tr_series = atr::true_range_series(candles);
    let median_tr = atr::median_true_range(candles, 20);
    let range_ratio = match (tr_series.last(), median_tr) {
        (Some(&last), Some(median)) if median > 0.0 => Some(last / median),
        _ => None,
    };

    let rsi14 = rsi::current_rsi(&closes, 14).map(|(value, _label)| value);
    let rsi_slope = rsi::rsi_slope(&closes, 14);

    let macd_result = macd::calculate_macd(&closes, 12, 26, 9);
    let hist_series = macd::calculate_macd_series_hist(&closes, 12, 26, 9);
    let macd_slope = if hist_series.len() >= 2 {
        Some(hist_series[hist_series.len() - 1] - hist_series[hist_series.len() - 2])
    } else {
        None
    };

    let obv_direction = obv::obv_direction(candles, 5);

    let swing = swing_features(candles, atr14);
    let flags = liquidity_flags_for_bar(&tr_series, candles);

    Some(TimeframeFeatures {
        close: current.close,
        open: current.open,
        high: current.high,
        low: current.low,
        volume: current.volume,
        sma20,
        sma50,
        sma200,
        ma_stack,
        price_z20,
        vwap20,
        vwap_z,
        atr14,
        atr_pct,
        atr_percentile,
        range_ratio,
        rsi14,
        rsi_slope,
        macd: macd_result.map(|m| m.macd),
        macd_signal: macd_result.map(|m| m.signal),
        macd_hist: macd_result.map(|m| m.hist),
        macd_slope,
        volume_z20,
        obv_direction,
        swing,
        flags,
        last_3_bars: closes[closes.len().saturating_sub(3)..].to_vec(),
    })
}

fn last_window_zscore(series: &[f64], window: usize, value: f64) -> Option<f64> {
    if series.len() < window {
        return None;
    }
    let tail = &series[series.len() - window..];
    vwap::zscore(tail, value)
}

fn swing_features(candles: &[Candle], atr: Option<f64>) -> SwingFeatures {
    let atr = match atr {
        Some(a) if a > 0.0 => a,
        _ => return SwingFeatures::default(),
    };
    let window_start = candles.len().saturating_sub(50);
    let window = &candles[window_start..];
    let current = match candles.last() {
        Some(c) => c,
        None => return SwingFeatures::default(),
    };

    let last_high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let last_low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);

    let range = current.high - current.low;
    let body_high = current.open.max(current.close);
    let body_low = current.open.min(current.close);
    let (upper_wick_pct, lower_wick_pct) = if range > 0.0 {
        (
            Some((current.high - body_high).max(0.0) / range),
            Some((body_low - current.low).max(0.0) / range),
        )
    } else {
        (None, None)
    };

    SwingFeatures {
        to_last_high_atr: Some((last_high - current.close) / atr),
        to_last_low_atr: Some((current.close - last_low) / atr),
        upper_wick_pct,
        lower_wick_pct,
    }
}

/// Per-bar `breakout`/`liquidity_sweep` flags (spec §4.2), distinct from the
/// daily-anchor-based sweep flags in [`liquidity_snapshot`].
fn liquidity_flags_for_bar(tr_series: &[f64], candles: &[Candle]) -> LiquidityFlags {
    if tr_series.len() < 2 || candles.len() < 2 {
        return LiquidityFlags::default();
    }
    let atr = match atr::calculate(candles) {
        Some(a) if a > 0.0 => a,
        _ => return LiquidityFlags::default(),
    };
    let current_tr = tr_series[tr_series.len() - 1];
    let prev_tr = tr_series[tr_series.len() - 2];
    let breakout = current_tr > 0.6 * atr && prev_tr < 0.4 * atr;

    let current = &candles[candles.len() - 1];
    let prev = &candles[candles.len() - 2];
    let sweep_high = current.high > prev.high + 0.5 * atr && current.close < prev.high;
    let sweep_low = current.low < prev.low - 0.5 * atr && current.close > prev.low;

    LiquidityFlags { liquidity_sweep: sweep_high || sweep_low, breakout }
}

fn orderbook_features(book: &BookState, target_notional: f64) -> OrderbookFeatures {
    OrderbookFeatures {
        imbalance: book.imbalance(),
        spread_bps: book.spread_bps(),
        slippage_bps_for_size: book.slippage_bps_for_size(target_notional),
        top_bid: book.best_bid(),
        top_ask: book.best_ask(),
    }
}

fn confluence_score(timeframes: &BTreeMap<String, TimeframeFeatures>) -> Confluence {
    let mut score = 0i32;
    let mut components = Vec::new();

    if let Some(tf) = timeframes.get("15m") {
        match tf.ma_stack {
            Some(MaStack::Bull) => { score += 2; components.push("15mMaStackBull".to_string()); }
            Some(MaStack::Bear) => { score -= 2; components.push("15mMaStackBear".to_string()); }
            _ => {}
        }
        if let Some(hist) = tf.macd_hist {
            if hist > 0.0 { score += 1; components.push("15mMacdPositive".to_string()); }
            else if hist < 0.0 { score -= 1; components.push("15mMacdNegative".to_string()); }
        }
        if let Some(r) = tf.rsi14 {
            if r > 55.0 { score += 1; components.push("15mRsiAbove55".to_string()); }
            else if r < 45.0 { score -= 1; components.push("15mRsiBelow45".to_string()); }
        }
    }
    if let Some(tf) = timeframes.get("5m") {
        if let Some(z) = tf.price_z20 {
            if z > 1.2 { score += 1; components.push("5mPriceZAbove1.2".to_string()); }
            else if z < -1.2 { score -= 1; components.push("5mPriceZBelowNeg1.2".to_string()); }
        }
        if let Some(vz) = tf.volume_z20 {
            if vz > 1.5 { score += 1; components.push("5mVolumeZAbove1.5".to_string()); }
        }
    }
    if let Some(tf) = timeframes.get("1h") {
        match tf.ma_stack {
            Some(MaStack::Bull) => { score += 1; components.push("1hMaStackBull".to_string()); }
            Some(MaStack::Bear) => { score -= 1; components.push("1hMaStackBear".to_string()); }
            _ => {}
        }
    }

    Confluence { score, components }
}

fn liquidity_snapshot(
    timeframes: &BTreeMap<String, TimeframeFeatures>,
    htf: &HtfAnchors,
) -> LiquiditySnapshot {
    let tf = match timeframes.get("15m") {
        Some(tf) => tf,
        None => return LiquiditySnapshot::default(),
    };
    let atr = match tf.atr14 {
        Some(a) if a > 0.0 => a,
        _ => return LiquiditySnapshot::default(),
    };

    let sweep_low = match htf.prev_day_low {
        Some(low) => tf.low < low - 0.6 * atr && tf.close > low,
        None => false,
    };
    let sweep_high = match htf.prev_day_high {
        Some(high) => tf.high > high + 0.6 * atr && tf.close < high,
        None => false,
    };
    let break_and_hold_high = match htf.prev_day_high {
        Some(high) => tf.close > high + 0.3 * atr,
        None => false,
    };
    let break_and_hold_low = match htf.prev_day_low {
        Some(low) => tf.close < low - 0.3 * atr,
        None => false,
    };

    LiquiditySnapshot { sweep_low, sweep_high, break_and_hold_high, break_and_hold_low }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(i: i64, close: f64) -> Candle {
        Candle {
            t_unix_sec: i * 60,
            open: close - 0.1,
            high: close + 0.2,
            low: close - 0.3,
            close,
            volume: 100.0 + i as f64,
            is_closed: true,
        }
    }

    #[test]
    fn insufficient_history_returns_none() {
        let candles: Vec<Candle> = (0..5).map(|i| candle(i, 100.0 + i as f64)).collect();
        assert!(compute_timeframe_features(&candles).is_none());
    }

    #[test]
    fn exactly_at_minimum_returns_some() {
        let candles: Vec<Candle> =
            (0..MIN_CANDLES_FOR_FEATURES as i64).map(|i| candle(i, 100.0 + i as f64)).collect();
        assert!(compute_timeframe_features(&candles).is_some());
    }

    #[test]
    fn trending_series_yields_bull_ma_stack() {
        let candles: Vec<Candle> = (0..250).map(|i| candle(i, 100.0 + i as f64 * 0.5)).collect();
        let features = compute_timeframe_features(&candles).unwrap();
        assert_eq!(features.ma_stack, Some(MaStack::Bull));
        assert!(features.last_3_bars.len() == 3);
    }

    #[test]
    fn parse_ohlc_result_reads_rows_and_marks_last_provisional() {
        let json: Value = serde_json::from_str(
            r#"{"DOGEUSD":[[1,"0.1","0.11","0.09","0.105","0.1","1000",5],
                            [61,"0.105","0.12","0.10","0.115","0.11","900",4]],"last":61}"#,
        )
        .unwrap();
        let candles = parse_ohlc_result(&json).unwrap();
        assert_eq!(candles.len(), 2);
        assert!(candles[0].is_closed);
        assert!(!candles[1].is_closed);
    }

    #[test]
    fn confluence_score_is_deterministic() {
        let candles: Vec<Candle> = (0..250).map(|i| candle(i, 100.0 + i as f64 * 0.5)).collect();
        let tf = compute_timeframe_features(&candles).unwrap();
        let mut map = BTreeMap::new();
        map.insert("15m".to_string(), tf.clone());
        map.insert("5m".to_string(), tf.clone());
        map.insert("1h".to_string(), tf);
        let a = confluence_score(&map);
        let b = confluence_score(&map);
        assert_eq!(a.score, b.score);
    }

    #[test]
    fn orderbook_features_null_when_book_empty() {
        let book = BookState::new();
        let features = orderbook_features(&book, 500.0);
        assert!(features.imbalance.is_none());
        assert!(features.top_bid.is_none());
    }
}
