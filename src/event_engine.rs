//! Event engine (spec §4.3): decides *when* to invoke the decision maker and
//! *why*. Grounded in the teacher's `risk.rs` `Inner`-struct-behind-a-lock
//! pattern for debounce state, generalised from a single breach flag to the
//! full reason taxonomy this spec names.

use crate::model::{FeatureSnapshot, LiquiditySnapshot, Trend, Volatility};

const LOSS_TIME_STOP_R: f64 = 0.5;

#[derive(Debug, Clone, Copy, Default)]
pub struct TickMeta {
    pub bucket_5m: Option<i64>,
    pub bucket_15m: Option<i64>,
    pub bucket_60m: Option<i64>,
    pub threshold_triggered: Option<&'static str>,
}

/// All state the event engine remembers between evaluations. Owned by the
/// orchestrator, mutated only from the single logical task per spec §5.
pub struct EventEngine {
    last_bucket_5m: Option<i64>,
    last_bucket_15m: Option<i64>,
    last_bucket_60m: Option<i64>,
    last_trend: Option<Trend>,
    last_volatility: Option<Volatility>,
    last_confluence: Option<i32>,
    last_liquidity: LiquiditySnapshot,
    drawdown_breached: bool,
    pending_reasons: Vec<String>,
    last_emission_ms: Option<i64>,
    debounce_secs: i64,
    drawdown_guard_pct: f64,
    time_stop_bars: u32,
}

impl EventEngine {
    pub fn new(debounce_secs: i64, drawdown_guard_pct: f64, time_stop_bars: u32) -> Self {
        Self {
            last_bucket_5m: None,
            last_bucket_15m: None,
            last_bucket_60m: None,
            last_trend: None,
            last_volatility: None,
            last_confluence: None,
            last_liquidity: LiquiditySnapshot::default(),
            drawdown_breached: false,
            pending_reasons: Vec::new(),
            last_emission_ms: None,
            debounce_secs,
            drawdown_guard_pct,
            time_stop_bars,
        }
    }

    /// Reset all remembered state — called on orchestrator `stop`.
    pub fn reset(&mut self) {
        *self = Self::new(self.debounce_secs, self.drawdown_guard_pct, self.time_stop_bars);
    }

    /// `true` if a bar just closed on any tracked boundary, a threshold-
    /// triggered tick arrived, or pending reasons exist and the debounce
    /// window has elapsed.
    pub fn should_evaluate(&mut self, meta: &TickMeta, now_ms: i64) -> bool {
        let bar_closed = bucket_advanced(&mut self.last_bucket_5m, meta.bucket_5m)
            | bucket_advanced(&mut self.last_bucket_15m, meta.bucket_15m)
            | bucket_advanced(&mut self.last_bucket_60m, meta.bucket_60m);

        if bar_closed || meta.threshold_triggered.is_some() {
            return true;
        }

        if !self.pending_reasons.is_empty() {
            let elapsed = self.last_emission_ms.map_or(i64::MAX, |t| now_ms - t);
            return elapsed >= self.debounce_secs * 1000;
        }
        false
    }

    /// Evaluate `snapshot` against remembered state, accumulate reasons into
    /// the pending set, and return the set if the debounce gate allows
    /// emission (clearing it); otherwise returns an empty vec while keeping
    /// reasons pending.
    pub fn detect(&mut self, snapshot: &FeatureSnapshot, meta: &TickMeta, now_ms: i64) -> Vec<String> {
        self.detect_trend_flip(snapshot.regime.trend);
        self.detect_volatility_regime(snapshot.regime.volatility);
        self.detect_confluence_delta(snapshot.confluence.score);
        self.detect_liquidity(snapshot.liquidity);
        self.detect_drawdown_guardrail(snapshot.risk.daily_pnl_pct());
        self.detect_time_stop(snapshot.position.bars_open_5m, snapshot.position.unrealized_r);
        if let Some(label) = meta.threshold_triggered {
            self.push_reason(format!("MomentumSpike({label})"));
        }

        if self.pending_reasons.is_empty() {
            return Vec::new();
        }
        let elapsed = self.last_emission_ms.map_or(i64::MAX, |t| now_ms - t);
        if elapsed < self.debounce_secs * 1000 {
            return Vec::new();
        }
        self.last_emission_ms = Some(now_ms);
        std::mem::take(&mut self.pending_reasons)
    }

    /// Inject an orchestrator-supplied reason (`Startup`, `Periodic`,
    /// `Manual`) directly into the pending set.
    pub fn add_reason(&mut self, reason: impl Into<String>) {
        self.push_reason(reason.into());
    }

    fn push_reason(&mut self, reason: String) {
        if !self.pending_reasons.contains(&reason) {
            self.pending_reasons.push(reason);
        }
    }

    fn detect_trend_flip(&mut self, trend: Trend) {
        if self.last_trend != Some(trend) {
            let label = match trend {
                Trend::Bull => "Up",
                Trend::Bear => "Down",
                Trend::Neutral => "Neutral",
            };
            self.push_reason(format!("TrendFlip-{label}(15m)"));
            self.last_trend = Some(trend);
        }
    }

    fn detect_volatility_regime(&mut self, volatility: Volatility) {
        if self.last_volatility != Some(volatility) {
            let label = match volatility {
                Volatility::High => Some("High"),
                Volatility::Low => Some("Low"),
                Volatility::Normal => Some("Normal"),
                Volatility::Unknown => None,
            };
            if let Some(label) = label {
                self.push_reason(format!("VolatilityRegime{label}(15m)"));
            }
            self.last_volatility = Some(volatility);
        }
    }

    fn detect_confluence_delta(&mut self, score: i32) {
        if let Some(prev) = self.last_confluence {
            if (score - prev).abs() >= 2 {
                self.push_reason(format!("ConfluenceDelta({prev}->{score})"));
            }
        }
        self.last_confluence = Some(score);
    }

    /// Rising-edge only: a flag fires once when it becomes true, and again
    /// only after it has returned to false in between.
    fn detect_liquidity(&mut self, liquidity: LiquiditySnapshot) {
        if liquidity.sweep_low && !self.last_liquidity.sweep_low {
            self.push_reason("LiquiditySweep(Low)".to_string());
        }
        if liquidity.sweep_high && !self.last_liquidity.sweep_high {
            self.push_reason("LiquiditySweep(High)".to_string());
        }
        if liquidity.break_and_hold_high && !self.last_liquidity.break_and_hold_high {
            self.push_reason("BreakAndHold(High)".to_string());
        }
        if liquidity.break_and_hold_low && !self.last_liquidity.break_and_hold_low {
            self.push_reason("BreakAndHold(Low)".to_string());
        }
        self.last_liquidity = liquidity;
    }

    /// Rising-edge only, like [`detect_liquidity`](Self::detect_liquidity):
    /// fires once on the tick the guard first breaches, stays silent while
    /// still breached even as the percentage keeps moving, and can fire
    /// again only after the drawdown has recovered above the threshold.
    fn detect_drawdown_guardrail(&mut self, daily_pnl_pct: f64) {
        let breached = daily_pnl_pct <= -self.drawdown_guard_pct;
        if breached && !self.drawdown_breached {
            self.push_reason(format!("DrawdownGuardrail({daily_pnl_pct:.2})"));
        }
        self.drawdown_breached = breached;
    }

    fn detect_time_stop(&mut self, bars_open_5m: u32, unrealized_r: f64) {
        if bars_open_5m >= self.time_stop_bars && unrealized_r.abs() < LOSS_TIME_STOP_R {
            self.push_reason(format!("TimeStop({bars_open_5m} bars)"));
        }
    }
}

fn bucket_advanced(last: &mut Option<i64>, current: Option<i64>) -> bool {
    match (*last, current) {
        (Some(prev), Some(cur)) if cur != prev => {
            *last = Some(cur);
            true
        }
        (None, Some(cur)) => {
            *last = Some(cur);
            false
        }
        _ => false,
    }
}
