//! Orchestrator (spec §4.6): owns every subsystem, runs the evaluation
//! cycle, and is the process lifecycle contract (`start`/`stop`). Grounded
//! in the teacher's `main.rs` task-spawning shape, generalised from
//! Binance's single-feed loop to Kraken's public/private socket pair plus a
//! debounced evaluation cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::config::EngineConfig;
use crate::decision_adapter::{DecisionAdapter, DecisionRequest, DecisionSource};
use crate::event_engine::{EventEngine, TickMeta};
use crate::execution::{ExecutionContext, ExecutionEngine};
use crate::feature_builder::{BuildContext, FeatureBuilder};
use crate::gateway::{
    book_subscribe_params, canonical_symbol, executions_subscribe_params, ohlc_subscribe_params,
    run_socket, BookUpdate, GatewayEvent, KrakenRestClient, OhlcUpdate, SubscriptionKey,
    SubscriptionRegistry, WsTokenCache, PRIVATE_WS_URL, PUBLIC_WS_URL,
};
use crate::market_data::{CandleBuffer, CandleKey};
use crate::model::{BookState, Candle, PairMetadata};
use crate::risk::{BalanceCache, RiskManager};
use crate::strategy::{run_hook, DefaultStrategy, Strategy};
use crate::symbol::canonicalize;
use crate::{csv_log, execution};

const MAX_CANDLES_PER_SERIES: usize = 400;
const FIVE_MINUTES_MS: i64 = 300_000;

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("clock before epoch").as_millis() as i64
}

async fn fetch_pair_metadata(rest: &KrakenRestClient, rest_pair: &str) -> anyhow::Result<PairMetadata> {
    let result = rest.tradable_pairs(rest_pair).await?;
    parse_pair_metadata(&result).ok_or_else(|| anyhow::anyhow!("unrecognised AssetPairs payload for {rest_pair}"))
}

fn parse_pair_metadata(result: &Value) -> Option<PairMetadata> {
    let obj = result.as_object()?;
    let (_, info) = obj.iter().next()?;
    let parse_opt_num = |key: &str| -> f64 {
        info.get(key)
            .and_then(|v| v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_f64()))
            .unwrap_or(0.0)
    };
    Some(PairMetadata {
        altname: info.get("altname")?.as_str()?.to_string(),
        wsname: info.get("wsname").and_then(Value::as_str).unwrap_or_default().to_string(),
        base: info.get("base")?.as_str()?.to_string(),
        quote: info.get("quote")?.as_str()?.to_string(),
        price_decimals: info.get("pair_decimals")?.as_u64()? as u32,
        volume_decimals: info.get("lot_decimals")?.as_u64()? as u32,
        min_order_volume: parse_opt_num("ordermin"),
        min_order_cost: parse_opt_num("costmin"),
    })
}

fn parse_quote_balance(result: &Value, quote_asset: &str) -> Option<f64> {
    let obj = result.as_object()?;
    for key in [quote_asset, &format!("Z{quote_asset}")] {
        if let Some(v) = obj.get(key) {
            if let Some(s) = v.as_str() {
                return s.parse().ok();
            }
        }
    }
    None
}

pub struct Orchestrator {
    config: Arc<EngineConfig>,
    rest: Arc<KrakenRestClient>,
    meta: PairMetadata,
    rest_pair: String,
    label_pair: String,
    ws_symbol: String,
    candles: CandleBuffer,
    book: parking_lot::RwLock<BookState>,
    event_engine: tokio::sync::Mutex<EventEngine>,
    feature_builder: FeatureBuilder,
    execution: Arc<ExecutionEngine>,
    risk: Arc<RiskManager>,
    balance_cache: BalanceCache,
    decision_adapter: DecisionAdapter,
    decision_log: Arc<csv_log::DecisionLog>,
    processing: AtomicBool,
    public_registry: SubscriptionRegistry,
    private_registry: SubscriptionRegistry,
    ws_token_cache: Arc<WsTokenCache>,
    socket_handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    events_tx: mpsc::Sender<GatewayEvent>,
    events_rx: tokio::sync::Mutex<mpsc::Receiver<GatewayEvent>>,
    strategy: Box<dyn Strategy>,
}

impl Orchestrator {
    pub async fn new(
        config: Arc<EngineConfig>,
        rest: Arc<KrakenRestClient>,
        decision_source: DecisionSource,
        decision_log: Arc<csv_log::DecisionLog>,
    ) -> anyhow::Result<Self> {
        Self::with_strategy(config, rest, decision_source, decision_log, Box::new(DefaultStrategy)).await
    }

    /// Same as [`Self::new`] but with an explicit [`Strategy`] override in
    /// place of [`DefaultStrategy`]'s no-ops.
    pub async fn with_strategy(
        config: Arc<EngineConfig>,
        rest: Arc<KrakenRestClient>,
        decision_source: DecisionSource,
        decision_log: Arc<csv_log::DecisionLog>,
        strategy: Box<dyn Strategy>,
    ) -> anyhow::Result<Self> {
        let canonical = canonicalize(&config.pair)
            .ok_or_else(|| anyhow::anyhow!("unresolvable pair: {}", config.pair))?;
        let rest_pair = canonical.rest_pair();
        let meta = fetch_pair_metadata(&rest, &rest_pair).await?;

        let risk = Arc::new(RiskManager::new(config.pause_after_losses, config.pause_minutes));
        let execution = Arc::new(ExecutionEngine::new(
            rest.clone(),
            risk.clone(),
            meta.clone(),
            config.max_trade_risk_pct,
            config.default_size_pct,
            config.min_notional,
            config.dry_run,
        ));
        let feature_builder = FeatureBuilder::new(rest.clone(), config.slippage_target_notional);
        let event_engine = EventEngine::new(config.debounce_secs, config.drawdown_guard_pct, config.time_stop_bars);
        let decision_adapter = DecisionAdapter::new(decision_source);
        let (events_tx, events_rx) = mpsc::channel(256);

        let ws_symbol = canonical_symbol(&meta.wsname);
        Ok(Self {
            config,
            rest,
            label_pair: meta.wsname.clone(),
            ws_symbol,
            meta,
            rest_pair,
            candles: CandleBuffer::new(MAX_CANDLES_PER_SERIES),
            book: parking_lot::RwLock::new(BookState::new()),
            event_engine: tokio::sync::Mutex::new(event_engine),
            feature_builder,
            execution,
            risk,
            balance_cache: BalanceCache::new(std::time::Duration::from_secs(30)),
            decision_adapter,
            decision_log,
            processing: AtomicBool::new(false),
            public_registry: SubscriptionRegistry::default(),
            private_registry: SubscriptionRegistry::default(),
            ws_token_cache: Arc::new(WsTokenCache::new()),
            socket_handles: tokio::sync::Mutex::new(Vec::new()),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            strategy,
        })
    }

    #[instrument(skip(self))]
    pub async fn start(&self) -> anyhow::Result<()> {
        self.public_registry.register(
            SubscriptionKey::Ohlc { symbol: self.ws_symbol.clone(), interval: self.config.primary_ohlc_interval },
            ohlc_subscribe_params(&self.label_pair, self.config.primary_ohlc_interval),
        );
        self.public_registry.register(
            SubscriptionKey::Book { symbol: self.ws_symbol.clone() },
            book_subscribe_params(&self.label_pair, self.config.book_depth),
        );

        match self.ws_token_cache.get(&self.rest, now_ms()).await {
            Ok(token) => {
                self.private_registry
                    .register(SubscriptionKey::Executions, executions_subscribe_params(&token));
            }
            Err(e) => warn!(error = %e, "no websocket token available, private execution feed disabled"),
        }

        let mut handles = self.socket_handles.lock().await;
        handles.push(tokio::spawn(run_socket(
            PUBLIC_WS_URL,
            self.public_registry.clone(),
            self.events_tx.clone(),
            true,
            || async {},
        )));
        if !self.private_registry.is_empty() {
            let rest = self.rest.clone();
            let token_cache = self.ws_token_cache.clone();
            let registry = self.private_registry.clone();
            handles.push(tokio::spawn(run_socket(
                PRIVATE_WS_URL,
                self.private_registry.clone(),
                self.events_tx.clone(),
                true,
                move || {
                    let rest = rest.clone();
                    let token_cache = token_cache.clone();
                    let registry = registry.clone();
                    async move {
                        match token_cache.get(&rest, now_ms()).await {
                            Ok(token) => registry.update_params(
                                &SubscriptionKey::Executions,
                                executions_subscribe_params(&token),
                            ),
                            Err(e) => {
                                warn!(error = %e, "failed to refresh websocket token before reconnect")
                            }
                        }
                    }
                },
            )));
        }
        drop(handles);

        let label_pair = self.label_pair.clone();
        run_hook(self.strategy.as_ref(), "on_init", || self.strategy.on_init(&label_pair));

        {
            let mut engine = self.event_engine.lock().await;
            engine.add_reason("Startup");
        }
        self.run_evaluation_cycle().await;

        Ok(())
    }

    pub async fn stop(&self) {
        self.public_registry.unregister(&SubscriptionKey::Ohlc {
            symbol: self.ws_symbol.clone(),
            interval: self.config.primary_ohlc_interval,
        });
        self.public_registry
            .unregister(&SubscriptionKey::Book { symbol: self.ws_symbol.clone() });
        self.private_registry.unregister(&SubscriptionKey::Executions);

        let mut handles = self.socket_handles.lock().await;
        for handle in handles.drain(..) {
            handle.abort();
        }
        self.event_engine.lock().await.reset();
        info!("orchestrator stopped");
    }

    /// Drives the event loop: gateway events feed the candle/book caches and
    /// trigger evaluation on bar close; a periodic timer and heartbeat run
    /// alongside. Returns when `stop` aborts the socket tasks and the event
    /// channel closes.
    pub async fn run(&self) {
        let mut periodic = tokio::time::interval(std::time::Duration::from_secs(self.config.periodic_eval_secs));
        let mut heartbeat = tokio::time::interval(std::time::Duration::from_secs(self.config.heartbeat_secs));
        let mut rx = self.events_rx.lock().await;

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => self.handle_gateway_event(event).await,
                        None => break,
                    }
                }
                _ = periodic.tick() => {
                    self.event_engine.lock().await.add_reason("Periodic");
                    self.run_evaluation_cycle().await;
                }
                _ = heartbeat.tick() => self.log_heartbeat(),
            }
        }
    }

    fn log_heartbeat(&self) {
        let position = self.execution.position();
        info!(
            pair = %self.label_pair,
            side = ?position.side,
            size = position.size,
            daily_pnl_pct = self.risk.daily_pnl_pct(),
            "heartbeat"
        );
    }

    async fn handle_gateway_event(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::Ohlc(update) => self.handle_ohlc(update).await,
            GatewayEvent::Book(update) => self.handle_book(update),
            GatewayEvent::Execution(fill) => self.handle_execution(fill),
            GatewayEvent::SubscribeAck { .. } => {}
        }
    }

    async fn handle_ohlc(&self, update: OhlcUpdate) {
        let interval_secs = i64::from(update.interval) * 60;
        let bucket = update.timestamp_ms / 1000 / interval_secs.max(1);
        self.candles.update(
            CandleKey { symbol: update.symbol.clone(), interval: update.interval.to_string() },
            Candle {
                t_unix_sec: bucket * interval_secs,
                open: update.open,
                high: update.high,
                low: update.low,
                close: update.close,
                volume: update.volume,
                is_closed: true,
            },
        );

        if update.interval == self.config.primary_ohlc_interval {
            let meta = self.tick_meta();
            let mut engine = self.event_engine.lock().await;
            if engine.should_evaluate(&meta, now_ms()) {
                drop(engine);
                self.run_evaluation_cycle().await;
            }
        }
    }

    fn handle_book(&self, update: BookUpdate) {
        let mut book = self.book.write();
        if update.is_snapshot {
            book.apply_snapshot(&update.bids, &update.asks);
        } else {
            for lvl in &update.bids {
                book.set_bid(*lvl);
            }
            for lvl in &update.asks {
                book.set_ask(*lvl);
            }
        }
    }

    fn handle_execution(&self, exec_fill: crate::gateway::ExecutionFill) {
        let side = match exec_fill.side.as_deref() {
            Some("buy") => execution::FillSide::Buy,
            Some("sell") => execution::FillSide::Sell,
            _ => return,
        };
        let fill = execution::FillEvent { side, exec_price: exec_fill.exec_price, exec_qty: exec_fill.exec_qty };
        self.execution.apply_fill(fill.clone(), exec_fill.timestamp_ms);
        run_hook(self.strategy.as_ref(), "on_fill", || self.strategy.on_fill(&fill));
    }

    fn tick_meta(&self) -> TickMeta {
        let bucket = |interval_secs: i64| {
            self.candles.last_closed_bucket(
                &CandleKey { symbol: self.ws_symbol.clone(), interval: (interval_secs / 60).to_string() },
                interval_secs,
            )
        };
        TickMeta {
            bucket_5m: bucket(300),
            bucket_15m: bucket(900),
            bucket_60m: bucket(3600),
            threshold_triggered: None,
        }
    }

    /// The eight-step cycle from spec §4.6, guarded by `processing` so at
    /// most one evaluation runs at a time.
    async fn run_evaluation_cycle(&self) {
        if self.processing.swap(true, Ordering::SeqCst) {
            return;
        }
        let result = self.evaluate_once().await;
        self.processing.store(false, Ordering::SeqCst);
        if let Err(e) = result {
            warn!(error = %e, "evaluation cycle failed");
        }
    }

    async fn evaluate_once(&self) -> anyhow::Result<()> {
        let now = now_ms();
        let book_snapshot = self.book.read().clone();

        let ctx = BuildContext { position: self.execution.position(), risk: self.risk.snapshot() };
        let snapshot = self
            .feature_builder
            .build(&self.rest_pair, &self.label_pair, now, &book_snapshot, ctx)
            .await;

        let quote_balance = self
            .balance_cache
            .get_or_refresh(now, || async {
                let result = self.rest.account_balances().await?;
                parse_quote_balance(&result, &self.meta.quote)
                    .ok_or_else(|| anyhow::anyhow!("quote balance missing from Balance response"))
            })
            .await
            .unwrap_or(0.0);
        self.risk.observe_balance(quote_balance);

        let reference_price = snapshot
            .timeframes
            .get("5m")
            .map(|tf| tf.close)
            .or(snapshot.orderbook.top_bid)
            .unwrap_or(0.0);
        let atr = snapshot.timeframes.get("5m").and_then(|tf| tf.atr14);
        let bars_open_5m = self
            .execution
            .position()
            .opened_at_ms
            .map(|opened| ((now - opened) / FIVE_MINUTES_MS).max(0) as u32)
            .unwrap_or(0);
        self.execution.update_market_context(reference_price, atr, bars_open_5m);

        run_hook(self.strategy.as_ref(), "on_price_update", || self.strategy.on_price_update(&snapshot));

        let reasons = {
            let mut engine = self.event_engine.lock().await;
            engine.detect(&snapshot, &self.tick_meta(), now)
        };
        if reasons.is_empty() {
            return Ok(());
        }

        let decision = self
            .decision_adapter
            .decide(DecisionRequest {
                features: &snapshot,
                reasons: &reasons,
                meta: json!({ "pair": self.label_pair, "ts": now }),
                constraints: json!({
                    "max_trade_risk_pct": self.config.max_trade_risk_pct,
                    "max_total_risk_pct": self.config.max_total_risk_pct,
                }),
            })
            .await;

        run_hook(self.strategy.as_ref(), "on_decision", || self.strategy.on_decision(&decision));

        self.decision_log
            .log(&csv_log::DecisionLogRow {
                timestamp: chrono::Utc::now().to_rfc3339(),
                pair: self.label_pair.clone(),
                decision: decision.clone(),
                price: reference_price,
                confluence_score: snapshot.confluence.score,
                volatility_regime: csv_log::volatility_str(snapshot.regime.volatility).to_string(),
                trend_regime: format!("{:?}", snapshot.regime.trend).to_lowercase(),
                momentum_regime: format!("{:?}", snapshot.regime.momentum).to_lowercase(),
                reasons: reasons.clone(),
                dry_run: self.config.dry_run,
            })
            .await?;

        let exec_ctx = ExecutionContext { reference_price, quote_balance, now_ms: now };
        let result = self.execution.execute(&decision, &exec_ctx).await;
        info!(?result, reasons = ?reasons, "evaluation cycle complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pair_metadata_reads_kraken_asset_pairs_shape() {
        let json: Value = serde_json::from_str(
            r#"{"XDGUSD":{"altname":"DOGEUSD","wsname":"DOGE/USD","base":"XDG","quote":"ZUSD",
                "pair_decimals":5,"lot_decimals":8,"ordermin":"10","costmin":"0.5"}}"#,
        )
        .unwrap();
        let meta = parse_pair_metadata(&json).unwrap();
        assert_eq!(meta.altname, "DOGEUSD");
        assert_eq!(meta.price_decimals, 5);
        assert_eq!(meta.min_order_volume, 10.0);
    }

    #[test]
    fn parse_quote_balance_tries_z_prefixed_key() {
        let json: Value = serde_json::from_str(r#"{"ZUSD":"1234.5600"}"#).unwrap();
        assert_eq!(parse_quote_balance(&json, "USD"), Some(1234.56));
    }

    #[test]
    fn parse_quote_balance_missing_is_none() {
        let json: Value = serde_json::from_str(r#"{"XDG":"100"}"#).unwrap();
        assert_eq!(parse_quote_balance(&json, "USD"), None);
    }
}
