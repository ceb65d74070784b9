use serde::{Deserialize, Serialize};

use super::position::{Position, RiskLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaStack {
    Bull,
    Bear,
    Neutral,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct SwingFeatures {
    pub to_last_high_atr: Option<f64>,
    pub to_last_low_atr: Option<f64>,
    pub upper_wick_pct: Option<f64>,
    pub lower_wick_pct: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct LiquidityFlags {
    pub liquidity_sweep: bool,
    pub breakout: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeFeatures {
    pub close: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub sma20: Option<f64>,
    pub sma50: Option<f64>,
    pub sma200: Option<f64>,
    pub ma_stack: Option<MaStack>,
    pub price_z20: Option<f64>,
    pub vwap20: Option<f64>,
    pub vwap_z: Option<f64>,
    pub atr14: Option<f64>,
    pub atr_pct: Option<f64>,
    pub atr_percentile: Option<f64>,
    pub range_ratio: Option<f64>,
    pub rsi14: Option<f64>,
    pub rsi_slope: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_hist: Option<f64>,
    pub macd_slope: Option<f64>,
    pub volume_z20: Option<f64>,
    pub obv_direction: i8,
    pub swing: SwingFeatures,
    pub flags: LiquidityFlags,
    pub last_3_bars: Vec<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct HtfAnchors {
    pub prev_day_high: Option<f64>,
    pub prev_day_low: Option<f64>,
    pub prev_week_high: Option<f64>,
    pub prev_week_low: Option<f64>,
    pub daily_open: Option<f64>,
    pub distance_prev_day_high_atr: Option<f64>,
    pub distance_prev_day_low_atr: Option<f64>,
    pub distance_prev_week_high_atr: Option<f64>,
    pub distance_prev_week_low_atr: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct OrderbookFeatures {
    pub imbalance: Option<f64>,
    pub spread_bps: Option<f64>,
    pub slippage_bps_for_size: Option<f64>,
    pub top_bid: Option<f64>,
    pub top_ask: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Confluence {
    pub score: i32,
    pub components: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Bull,
    Bear,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Volatility {
    High,
    Normal,
    Low,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Momentum {
    Positive,
    Mixed,
    Neutral,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub trend: Trend,
    pub volatility: Volatility,
    pub momentum: Momentum,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct LiquiditySnapshot {
    pub sweep_low: bool,
    pub sweep_high: bool,
    pub break_and_hold_high: bool,
    pub break_and_hold_low: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub pair: String,
    pub ts_unix_ms: i64,
    pub timeframes: std::collections::BTreeMap<String, TimeframeFeatures>,
    pub htf_anchors: HtfAnchors,
    pub orderbook: OrderbookFeatures,
    pub confluence: Confluence,
    pub liquidity: LiquiditySnapshot,
    pub regime: RegimeSnapshot,
    pub position: Position,
    pub risk: RiskLedger,
}
