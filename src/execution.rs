//! Execution engine (spec §4.5): turns a normalised [`Decision`] into
//! precision-rounded Kraken orders, reconciles fills against the position
//! ledger, and enforces the hard risk constraints. Grounded in the
//! teacher's `execution.rs` dry-run/live branching shape, rebuilt against
//! Kraken's pair-metadata rounding and the size-pct/notional formula this
//! spec specifies instead of the teacher's TP1/TP2 ladder sizing.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::errors::{GatewayError, ResourceError};
use crate::gateway::KrakenRestClient;
use crate::model::{Action, Decision, EntryType, PairMetadata, Position};
use crate::risk::RiskManager;

#[derive(Debug)]
pub enum ExecutionResult {
    Noop,
    Rejected(ResourceError),
    Paused { until_ms: i64 },
    Submitted { dry_run: bool, payload: Value },
    Deferred { instruction: &'static str },
    PauseSet { until_ms: i64 },
}

#[derive(Clone, Copy)]
pub enum FillSide {
    Buy,
    Sell,
}

#[derive(Clone)]
pub struct FillEvent {
    pub side: FillSide,
    pub exec_price: f64,
    pub exec_qty: f64,
}

pub struct ExecutionContext {
    pub reference_price: f64,
    pub quote_balance: f64,
    pub now_ms: i64,
}

pub struct ExecutionEngine {
    rest: Arc<KrakenRestClient>,
    risk: Arc<RiskManager>,
    meta: PairMetadata,
    position: parking_lot::RwLock<Position>,
    max_trade_risk_pct: f64,
    default_size_pct: f64,
    min_notional: f64,
    dry_run: bool,
}

impl ExecutionEngine {
    pub fn new(
        rest: Arc<KrakenRestClient>,
        risk: Arc<RiskManager>,
        meta: PairMetadata,
        max_trade_risk_pct: f64,
        default_size_pct: f64,
        min_notional: f64,
        dry_run: bool,
    ) -> Self {
        Self {
            rest,
            risk,
            meta,
            position: parking_lot::RwLock::new(Position::default()),
            max_trade_risk_pct,
            default_size_pct,
            min_notional,
            dry_run,
        }
    }

    pub fn position(&self) -> Position {
        *self.position.read()
    }

    /// Refresh `unrealized_r` and `bars_open_5m` ahead of an evaluation
    /// cycle (spec §4.6 step 3). No-op while flat.
    pub fn update_market_context(&self, current_price: f64, atr: Option<f64>, bars_open_5m: u32) {
        let mut position = self.position.write();
        if position.is_flat() {
            return;
        }
        if let Some(atr) = atr {
            if atr > 0.0 {
                position.unrealized_r = (current_price - position.avg_price) / atr;
            }
        }
        position.bars_open_5m = bars_open_5m;
    }

    #[instrument(skip(self, decision, ctx), fields(action = ?decision.action))]
    pub async fn execute(&self, decision: &Decision, ctx: &ExecutionContext) -> ExecutionResult {
        if decision.action == Action::Hold {
            return ExecutionResult::Noop;
        }
        if self.risk.is_paused(ctx.now_ms) && decision.action != Action::Pause {
            let until = self.risk.pause_until_ms().unwrap_or(ctx.now_ms);
            return ExecutionResult::Paused { until_ms: until };
        }

        match decision.action {
            Action::Hold => ExecutionResult::Noop,
            Action::OpenLong | Action::Add => self.open_or_add(decision, ctx).await,
            Action::Trim | Action::ClosePartial => self.trim(decision, ctx).await,
            Action::CloseAll => self.close_all(ctx).await,
            Action::MoveStop => ExecutionResult::Deferred { instruction: "MOVE_STOP" },
            Action::SetTp => ExecutionResult::Deferred { instruction: "SET_TP" },
            Action::Pause => {
                let minutes = self.risk.pause_minutes();
                self.risk.pause_for_minutes(ctx.now_ms, minutes);
                ExecutionResult::PauseSet { until_ms: ctx.now_ms + minutes * 60_000 }
            }
        }
    }

    async fn open_or_add(&self, decision: &Decision, ctx: &ExecutionContext) -> ExecutionResult {
        let price = match &decision.entry {
            Some(entry) if entry.entry_type == EntryType::Limit => {
                let offset = entry.offset_bps.unwrap_or(0.0);
                self.meta.round_price(ctx.reference_price * (1.0 + offset / 10_000.0))
            }
            _ => self.meta.round_price(ctx.reference_price),
        };
        if price <= 0.0 {
            return ExecutionResult::Rejected(ResourceError::MissingPairMetadata(self.meta.altname.clone()));
        }

        let size_pct = decision.size_pct.unwrap_or(self.default_size_pct);
        let by_cap = ctx.quote_balance * self.max_trade_risk_pct / 100.0;
        let by_request = ctx.quote_balance * size_pct / 100.0;
        let notional = by_cap.min(by_request);
        if notional < self.min_notional {
            return ExecutionResult::Rejected(ResourceError::BelowMinNotional);
        }

        let volume = self.meta.round_volume(notional / price);
        if volume < self.meta.min_order_volume {
            return ExecutionResult::Rejected(ResourceError::BelowMinVolume);
        }

        let order_type = match &decision.entry {
            Some(entry) if entry.entry_type == EntryType::Limit => "limit",
            _ => "market",
        };
        let payload = json!({
            "pair": self.meta.altname,
            "type": "buy",
            "ordertype": order_type,
            "volume": volume.to_string(),
            "price": if order_type == "limit" { Some(price.to_string()) } else { None },
        });

        if self.dry_run {
            info!(%volume, %price, "dry-run order constructed, not submitted");
            self.apply_fill(FillEvent { side: FillSide::Buy, exec_price: price, exec_qty: volume }, ctx.now_ms);
            return ExecutionResult::Submitted { dry_run: true, payload };
        }

        let limit_price = if order_type == "limit" { Some(price) } else { None };
        match self.rest.submit_order(&self.meta.altname, "buy", order_type, volume, limit_price).await {
            Ok(_) => ExecutionResult::Submitted { dry_run: false, payload },
            Err(e) => {
                warn!(error = %e, "order submission failed");
                ExecutionResult::Rejected(ResourceError::InsufficientBalance)
            }
        }
    }

    async fn trim(&self, decision: &Decision, ctx: &ExecutionContext) -> ExecutionResult {
        let position = *self.position.read();
        if position.is_flat() {
            return ExecutionResult::Rejected(ResourceError::InsufficientBalance);
        }
        let size_pct = decision.size_pct.unwrap_or(self.default_size_pct);
        let volume = self.meta.round_volume(position.size * size_pct / 100.0);
        self.sell(volume, ctx).await
    }

    async fn close_all(&self, ctx: &ExecutionContext) -> ExecutionResult {
        let position = *self.position.read();
        if position.is_flat() {
            return ExecutionResult::Rejected(ResourceError::InsufficientBalance);
        }
        self.sell(position.size, ctx).await
    }

    async fn sell(&self, volume: f64, ctx: &ExecutionContext) -> ExecutionResult {
        if volume < self.meta.min_order_volume {
            return ExecutionResult::Rejected(ResourceError::BelowMinVolume);
        }
        let payload = json!({
            "pair": self.meta.altname,
            "type": "sell",
            "ordertype": "market",
            "volume": volume.to_string(),
        });
        if self.dry_run {
            self.apply_fill(
                FillEvent { side: FillSide::Sell, exec_price: ctx.reference_price, exec_qty: volume },
                ctx.now_ms,
            );
            return ExecutionResult::Submitted { dry_run: true, payload };
        }
        match self.rest.submit_order(&self.meta.altname, "sell", "market", volume, None).await {
            Ok(_) => ExecutionResult::Submitted { dry_run: false, payload },
            Err(e) => {
                warn!(error = %e, "sell order submission failed");
                ExecutionResult::Rejected(ResourceError::InsufficientBalance)
            }
        }
    }

    /// Apply a (dry-run or real) fill to the position ledger: VWAP average
    /// price on buys, realized PnL + loss-window update on sells.
    pub fn apply_fill(&self, fill: FillEvent, now_ms: i64) {
        let mut position = self.position.write();
        match fill.side {
            FillSide::Buy => {
                let total_cost = position.size * position.avg_price + fill.exec_qty * fill.exec_price;
                position.size += fill.exec_qty;
                position.avg_price = if position.size > 0.0 { total_cost / position.size } else { 0.0 };
                if position.opened_at_ms.is_none() {
                    position.opened_at_ms = Some(now_ms);
                }
            }
            FillSide::Sell => {
                let closed_qty = fill.exec_qty.min(position.size);
                let realized = (fill.exec_price - position.avg_price) * closed_qty;
                position.size -= closed_qty;
                position.normalize();
                drop(position);
                self.risk.record_outcome(realized, now_ms);
                return;
            }
        }
    }
}

pub fn parse_gateway_error(e: &GatewayError) -> &'static str {
    match e {
        GatewayError::Transport(_) => "transport",
        GatewayError::Exchange(_) => "exchange",
        GatewayError::Parse(_) => "parse",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::KrakenRestClient;
    use crate::model::{EntrySpec, Decision};

    fn meta() -> PairMetadata {
        PairMetadata {
            altname: "DOGEUSD".into(),
            wsname: "DOGE/USD".into(),
            base: "DOGE".into(),
            quote: "USD".into(),
            price_decimals: 5,
            volume_decimals: 0,
            min_order_volume: 1.0,
            min_order_cost: 0.5,
        }
    }

    fn engine(dry_run: bool) -> ExecutionEngine {
        let rest = Arc::new(KrakenRestClient::new("k".into(), "c2VjcmV0".into()));
        let risk = Arc::new(RiskManager::new(2, 30));
        ExecutionEngine::new(rest, risk, meta(), 0.75, 25.0, 20.0, dry_run)
    }

    #[tokio::test]
    async fn hold_is_noop() {
        let engine = engine(true);
        let ctx = ExecutionContext { reference_price: 0.1, quote_balance: 1000.0, now_ms: 0 };
        let result = engine.execute(&Decision::hold("x"), &ctx).await;
        assert!(matches!(result, ExecutionResult::Noop));
    }

    #[tokio::test]
    async fn paused_rejects_non_pause_actions() {
        let engine = engine(true);
        engine.risk.pause_for_minutes(0, 30);
        let ctx = ExecutionContext { reference_price: 0.1, quote_balance: 1000.0, now_ms: 0 };
        let decision = Decision { action: Action::OpenLong, ..Decision::hold("go") };
        let result = engine.execute(&decision, &ctx).await;
        assert!(matches!(result, ExecutionResult::Paused { .. }));
    }

    #[tokio::test]
    async fn open_long_dry_run_rounds_and_synthesises_fill() {
        let engine = engine(true);
        let ctx = ExecutionContext { reference_price: 0.1, quote_balance: 1000.0, now_ms: 0 };
        let decision = Decision { action: Action::OpenLong, size_pct: Some(25.0), ..Decision::hold("go") };
        let result = engine.execute(&decision, &ctx).await;
        assert!(matches!(result, ExecutionResult::Submitted { dry_run: true, .. }));
        assert!(!engine.position().is_flat());
    }

    #[tokio::test]
    async fn open_long_below_min_notional_rejected() {
        let engine = engine(true);
        let ctx = ExecutionContext { reference_price: 0.1, quote_balance: 10.0, now_ms: 0 };
        let decision = Decision { action: Action::OpenLong, size_pct: Some(25.0), ..Decision::hold("go") };
        let result = engine.execute(&decision, &ctx).await;
        assert!(matches!(result, ExecutionResult::Rejected(ResourceError::BelowMinNotional)));
    }

    #[tokio::test]
    async fn trim_while_flat_is_rejected() {
        let engine = engine(true);
        let ctx = ExecutionContext { reference_price: 0.1, quote_balance: 1000.0, now_ms: 0 };
        let decision = Decision { action: Action::Trim, size_pct: Some(50.0), ..Decision::hold("trim") };
        let result = engine.execute(&decision, &ctx).await;
        assert!(matches!(result, ExecutionResult::Rejected(_)));
    }

    #[tokio::test]
    async fn move_stop_and_set_tp_are_deferred_not_submitted() {
        let engine = engine(true);
        let ctx = ExecutionContext { reference_price: 0.1, quote_balance: 1000.0, now_ms: 0 };
        let decision = Decision { action: Action::MoveStop, ..Decision::hold("trail") };
        let result = engine.execute(&decision, &ctx).await;
        assert!(matches!(result, ExecutionResult::Deferred { instruction: "MOVE_STOP" }));
    }

    #[tokio::test]
    async fn loss_streak_pauses_subsequent_open_long() {
        let engine = engine(true);
        let ctx = ExecutionContext { reference_price: 1.0, quote_balance: 1000.0, now_ms: 0 };

        engine.apply_fill(FillEvent { side: FillSide::Buy, exec_price: 1.0, exec_qty: 100.0 }, 0);
        engine.apply_fill(FillEvent { side: FillSide::Sell, exec_price: 0.98, exec_qty: 100.0 }, 0);
        engine.apply_fill(FillEvent { side: FillSide::Buy, exec_price: 0.97, exec_qty: 100.0 }, 0);
        engine.apply_fill(FillEvent { side: FillSide::Sell, exec_price: 0.96, exec_qty: 100.0 }, 0);

        let decision = Decision { action: Action::OpenLong, size_pct: Some(25.0), ..Decision::hold("go") };
        let result = engine.execute(&decision, &ctx).await;
        assert!(matches!(result, ExecutionResult::Paused { .. }));

        let pause_decision = Decision { action: Action::Pause, ..Decision::hold("manual pause") };
        let result = engine.execute(&pause_decision, &ctx).await;
        assert!(matches!(result, ExecutionResult::PauseSet { .. }));
    }

    #[test]
    fn entry_spec_is_constructible() {
        let _ = EntrySpec { entry_type: EntryType::Limit, offset_bps: Some(5.0) };
    }
}
