//! Multiplexing Kraken WebSocket v2 manager (spec §4.1, §6.2).
//!
//! Two logical sockets (public, private) are driven by [`run_socket`]; each
//! keeps a [`SubscriptionRegistry`] of everything it has been asked to watch
//! so a forced reconnect can resend every subscription with identical
//! parameters, in the teacher's retry-loop idiom (`market_data/candle_buffer.rs`
//! originally, `reconcile.rs`'s safety-first logging) generalised to Kraken's
//! v2 envelope.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::rest::KrakenRestClient;
use crate::errors::GatewayError;
use crate::model::BookLevel;

pub const PUBLIC_WS_URL: &str = "wss://ws.kraken.com/v2";
pub const PRIVATE_WS_URL: &str = "wss://ws-auth.kraken.com/v2";

const TOKEN_EXPIRY_SLACK_MS: i64 = 5_000;
const DEFAULT_TOKEN_TTL_SECS: i64 = 900;

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum SubscriptionKey {
    Ohlc { symbol: String, interval: u32 },
    Book { symbol: String },
    Executions,
}

#[derive(Clone)]
struct RegisteredSubscription {
    params: Value,
    subscribed: bool,
}

/// Registered subscriptions a socket must resend on every reconnect. Kept
/// alive across reconnects — handlers are not re-attached per spec §4.1.
/// Each entry also tracks whether Kraken's subscribe ack confirmed it, so a
/// rejected subscription can be told apart from one that is merely pending.
#[derive(Default, Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RwLock<HashMap<SubscriptionKey, RegisteredSubscription>>>,
}

impl SubscriptionRegistry {
    pub fn register(&self, key: SubscriptionKey, subscribe_params: Value) {
        self.inner
            .write()
            .insert(key, RegisteredSubscription { params: subscribe_params, subscribed: false });
    }

    pub fn unregister(&self, key: &SubscriptionKey) {
        self.inner.write().remove(key);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn all_params(&self) -> Vec<Value> {
        self.inner.read().values().map(|entry| entry.params.clone()).collect()
    }

    /// Replace a registered key's subscribe params without resetting its ack
    /// state — used to rotate in a freshly fetched token before a resend.
    pub fn update_params(&self, key: &SubscriptionKey, subscribe_params: Value) {
        if let Some(entry) = self.inner.write().get_mut(key) {
            entry.params = subscribe_params;
        }
    }

    /// Records the server's subscribe ack for `key`. A failed ack leaves the
    /// key registered (so it is retried on the next reconnect) but marked
    /// not-subscribed (spec §4.1).
    pub fn mark_ack(&self, key: &SubscriptionKey, success: bool) {
        if let Some(entry) = self.inner.write().get_mut(key) {
            entry.subscribed = success;
        }
    }

    pub fn is_subscribed(&self, key: &SubscriptionKey) -> bool {
        self.inner.read().get(key).map(|entry| entry.subscribed).unwrap_or(false)
    }
}

/// Kraken's `GetWebSocketsToken` result, cached until 5s before its declared
/// expiry (spec §4.1 token lifecycle) so the private socket only refetches
/// right before a (re)subscribe actually needs a fresh one.
pub struct WsTokenCache {
    state: tokio::sync::Mutex<TokenState>,
}

struct TokenState {
    token: Option<String>,
    expires_at_ms: i64,
}

impl Default for WsTokenCache {
    fn default() -> Self {
        Self::new()
    }
}

impl WsTokenCache {
    pub fn new() -> Self {
        Self { state: tokio::sync::Mutex::new(TokenState { token: None, expires_at_ms: i64::MIN }) }
    }

    pub async fn get(&self, rest: &KrakenRestClient, now_ms: i64) -> Result<String, GatewayError> {
        let mut state = self.state.lock().await;
        if now_ms < state.expires_at_ms {
            if let Some(token) = &state.token {
                return Ok(token.clone());
            }
        }
        let result = rest.ws_token().await?;
        let token = result
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Parse("missing token in GetWebSocketsToken response".into()))?
            .to_string();
        let ttl_secs = result.get("expires").and_then(Value::as_i64).unwrap_or(DEFAULT_TOKEN_TTL_SECS);
        state.expires_at_ms = now_ms + ttl_secs * 1000 - TOKEN_EXPIRY_SLACK_MS;
        state.token = Some(token.clone());
        Ok(token)
    }
}

#[derive(Debug, Clone)]
pub struct OhlcUpdate {
    pub symbol: String,
    pub interval: u32,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub vwap: f64,
    pub volume: f64,
    pub trades: u64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone)]
pub struct BookUpdate {
    pub symbol: String,
    pub is_snapshot: bool,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

#[derive(Debug, Clone)]
pub struct ExecutionFill {
    pub order_id: String,
    pub symbol: Option<String>,
    pub side: Option<String>,
    pub exec_price: f64,
    pub exec_qty: f64,
    pub fee: f64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Ohlc(OhlcUpdate),
    Book(BookUpdate),
    Execution(ExecutionFill),
    /// A `{"method":"subscribe",...}` ack. Intercepted by [`connect_and_pump`]
    /// to update the [`SubscriptionRegistry`]; never forwarded to consumers.
    SubscribeAck { key: Option<SubscriptionKey>, success: bool, error: Option<String> },
}

/// Canonicalise a Kraken wire symbol (`DOGE/USD`) the same way §4.1 requires
/// for OHLC dispatch: uppercase, slash stripped.
pub fn canonical_symbol(raw: &str) -> String {
    raw.to_uppercase().replace('/', "")
}

fn parse_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn parse_timestamp_ms(v: &Value) -> Option<i64> {
    if let Some(s) = v.as_str() {
        return DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis());
    }
    v.as_f64().map(|f| (f * 1000.0) as i64)
}

/// Decode one text frame. Returns `None` for heartbeats, status frames,
/// subscribe acks, and unknown channels (all logged, never propagated as an
/// error — spec §4.1 failure semantics).
pub fn decode_frame(text: &str) -> Option<GatewayEvent> {
    let root: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to parse websocket frame");
            return None;
        }
    };

    if root.get("method").and_then(Value::as_str) == Some("subscribe") {
        return decode_subscribe_ack(&root);
    }

    let channel = root.get("channel")?.as_str()?;
    match channel {
        "heartbeat" | "status" => {
            debug!(channel, "ignored housekeeping frame");
            None
        }
        "ohlc" => decode_ohlc(&root),
        "book" => decode_book(&root),
        "executions" => decode_executions(&root),
        other => {
            debug!(channel = other, "unknown channel, ignoring");
            None
        }
    }
}

/// Decode a Kraken v2 `{"method":"subscribe","success":bool,"result":{...},
/// "error":"..."}` ack. `result` carries enough of the original subscribe
/// request (channel/symbol/interval) to reconstruct the `SubscriptionKey` it
/// answers.
fn decode_subscribe_ack(root: &Value) -> Option<GatewayEvent> {
    let success = root.get("success").and_then(Value::as_bool).unwrap_or(false);
    let error = root.get("error").and_then(Value::as_str).map(String::from);
    let key = root.get("result").and_then(key_from_ack_result);
    Some(GatewayEvent::SubscribeAck { key, success, error })
}

fn key_from_ack_result(result: &Value) -> Option<SubscriptionKey> {
    let channel = result.get("channel")?.as_str()?;
    match channel {
        "executions" => Some(SubscriptionKey::Executions),
        "book" => Some(SubscriptionKey::Book {
            symbol: canonical_symbol(result.get("symbol")?.as_str()?),
        }),
        "ohlc" => Some(SubscriptionKey::Ohlc {
            symbol: canonical_symbol(result.get("symbol")?.as_str()?),
            interval: result.get("interval")?.as_u64()? as u32,
        }),
        _ => None,
    }
}

fn decode_ohlc(root: &Value) -> Option<GatewayEvent> {
    let item = root.get("data")?.as_array()?.first()?;
    let symbol = canonical_symbol(item.get("symbol")?.as_str()?);
    let interval = item.get("interval")?.as_u64()? as u32;
    Some(GatewayEvent::Ohlc(OhlcUpdate {
        symbol,
        interval,
        open: parse_f64(item.get("open")?)?,
        high: parse_f64(item.get("high")?)?,
        low: parse_f64(item.get("low")?)?,
        close: parse_f64(item.get("close")?)?,
        vwap: item.get("vwap").and_then(parse_f64).unwrap_or(0.0),
        volume: parse_f64(item.get("volume")?)?,
        trades: item.get("trades").and_then(|v| v.as_u64()).unwrap_or(0),
        timestamp_ms: item
            .get("timestamp")
            .and_then(parse_timestamp_ms)
            .unwrap_or(0),
    }))
}

fn decode_book(root: &Value) -> Option<GatewayEvent> {
    let frame_type = root.get("type")?.as_str()?;
    let item = root.get("data")?.as_array()?.first()?;
    let symbol = canonical_symbol(item.get("symbol")?.as_str()?);

    let parse_levels = |key: &str| -> Vec<BookLevel> {
        item.get(key)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|lvl| {
                        Some(BookLevel {
                            price: parse_f64(lvl.get("price")?)?,
                            qty: parse_f64(lvl.get("qty")?)?,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    Some(GatewayEvent::Book(BookUpdate {
        symbol,
        is_snapshot: frame_type == "snapshot",
        bids: parse_levels("bids"),
        asks: parse_levels("asks"),
    }))
}

fn decode_executions(root: &Value) -> Option<GatewayEvent> {
    let arr = root.get("data")?.as_array()?;
    for item in arr {
        if item.get("exec_type").and_then(|v| v.as_str()) != Some("trade") {
            continue;
        }
        return Some(GatewayEvent::Execution(ExecutionFill {
            order_id: item.get("order_id")?.as_str()?.to_string(),
            symbol: item
                .get("symbol")
                .and_then(|v| v.as_str())
                .map(canonical_symbol),
            side: item.get("side").and_then(|v| v.as_str()).map(String::from),
            exec_price: item.get("exec_price").and_then(parse_f64).unwrap_or(0.0),
            exec_qty: item.get("exec_qty").and_then(parse_f64).unwrap_or(0.0),
            fee: item.get("fee").and_then(parse_f64).unwrap_or(0.0),
            timestamp_ms: item
                .get("timestamp")
                .and_then(parse_timestamp_ms)
                .unwrap_or(0),
        }));
    }
    None
}

pub fn ohlc_subscribe_params(symbol: &str, interval: u32) -> Value {
    json!({
        "method": "subscribe",
        "params": { "channel": "ohlc", "symbol": [symbol], "interval": interval }
    })
}

pub fn book_subscribe_params(symbol: &str, depth: u32) -> Value {
    json!({
        "method": "subscribe",
        "params": { "channel": "book", "symbol": [symbol], "depth": depth, "snapshot": true }
    })
}

pub fn executions_subscribe_params(token: &str) -> Value {
    json!({
        "method": "subscribe",
        "params": { "channel": "executions", "token": token }
    })
}

/// Drive one logical socket until it closes, reconnecting with a 1s delay and
/// resending every registered subscription. `before_connect` runs ahead of
/// every connection attempt (including the first) — the private socket uses
/// it to rotate in a fresh `WsTokenCache` token before each (re)subscribe;
/// the public socket passes a no-op. Runs forever; the caller `tokio::spawn`s
/// this and cancels it on shutdown.
pub async fn run_socket<F, Fut>(
    url: &str,
    registry: SubscriptionRegistry,
    events_tx: mpsc::Sender<GatewayEvent>,
    auto_reconnect: bool,
    mut before_connect: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        before_connect().await;
        match connect_and_pump(url, &registry, &events_tx).await {
            Ok(()) => info!(url, "websocket closed cleanly"),
            Err(e) => warn!(url, error = %e, "websocket connection failed"),
        }
        if !auto_reconnect || registry.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        info!(url, "reconnecting websocket and resubscribing");
    }
}

async fn connect_and_pump(
    url: &str,
    registry: &SubscriptionRegistry,
    events_tx: &mpsc::Sender<GatewayEvent>,
) -> Result<(), GatewayError> {
    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| GatewayError::Transport(e.to_string()))?;
    let (mut write, mut read) = ws_stream.split();

    for params in registry.all_params() {
        let text = params.to_string();
        if let Err(e) = write.send(Message::Text(text)).await {
            warn!(error = %e, "failed to send subscription, will retry on next reconnect");
        }
    }

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => match decode_frame(&text) {
                Some(GatewayEvent::SubscribeAck { key, success, error }) => {
                    if let Some(key) = &key {
                        registry.mark_ack(key, success);
                    }
                    if !success {
                        warn!(?key, error = ?error, "subscription rejected by kraken");
                    }
                }
                Some(event) => {
                    if events_tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
                None => {}
            },
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => return Ok(()),
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "websocket read error");
                return Err(GatewayError::Transport(e.to_string()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_and_status_are_ignored() {
        assert!(decode_frame(r#"{"channel":"heartbeat"}"#).is_none());
        assert!(decode_frame(r#"{"channel":"status","data":[]}"#).is_none());
    }

    #[test]
    fn unknown_channel_is_ignored() {
        assert!(decode_frame(r#"{"channel":"mystery","data":[]}"#).is_none());
    }

    #[test]
    fn ohlc_symbol_is_canonicalised() {
        let frame = r#"{"channel":"ohlc","type":"update","data":[{
            "symbol":"DOGE/USD","interval":1,"open":0.1,"high":0.11,"low":0.09,
            "close":0.105,"vwap":0.1,"volume":1000,"trades":5,
            "interval_begin":"2026-01-01T00:00:00Z","timestamp":"2026-01-01T00:01:00Z"
        }]}"#;
        match decode_frame(frame) {
            Some(GatewayEvent::Ohlc(u)) => {
                assert_eq!(u.symbol, "DOGEUSD");
                assert_eq!(u.interval, 1);
                assert!(u.timestamp_ms > 0);
            }
            other => panic!("expected ohlc event, got {other:?}"),
        }
    }

    #[test]
    fn book_snapshot_and_update_are_distinguished() {
        let snapshot = r#"{"channel":"book","type":"snapshot","data":[{
            "symbol":"DOGE/USD",
            "bids":[{"price":"0.10","qty":"100"}],
            "asks":[{"price":"0.11","qty":"50"}]
        }]}"#;
        match decode_frame(snapshot) {
            Some(GatewayEvent::Book(b)) => {
                assert!(b.is_snapshot);
                assert_eq!(b.bids.len(), 1);
            }
            other => panic!("expected book event, got {other:?}"),
        }

        let update = r#"{"channel":"book","type":"update","data":[{
            "symbol":"DOGE/USD","bids":[{"price":"0.10","qty":"0"}],"asks":[]
        }]}"#;
        match decode_frame(update) {
            Some(GatewayEvent::Book(b)) => assert!(!b.is_snapshot),
            other => panic!("expected book event, got {other:?}"),
        }
    }

    #[test]
    fn executions_filters_non_trade_entries() {
        let frame = r#"{"channel":"executions","data":[
            {"exec_type":"pending_new","order_id":"A"},
            {"exec_type":"trade","order_id":"B","exec_price":"0.1","exec_qty":"10","fee":"0.01"}
        ]}"#;
        match decode_frame(frame) {
            Some(GatewayEvent::Execution(fill)) => assert_eq!(fill.order_id, "B"),
            other => panic!("expected execution event, got {other:?}"),
        }
    }

    #[test]
    fn registry_tracks_and_removes_subscriptions() {
        let registry = SubscriptionRegistry::default();
        assert!(registry.is_empty());
        registry.register(
            SubscriptionKey::Ohlc { symbol: "DOGEUSD".into(), interval: 1 },
            ohlc_subscribe_params("DOGE/USD", 1),
        );
        assert!(!registry.is_empty());
        assert_eq!(registry.all_params().len(), 1);
        registry.unregister(&SubscriptionKey::Ohlc { symbol: "DOGEUSD".into(), interval: 1 });
        assert!(registry.is_empty());
    }

    #[test]
    fn registry_tracks_ack_state() {
        let registry = SubscriptionRegistry::default();
        let key = SubscriptionKey::Book { symbol: "DOGEUSD".into() };
        registry.register(key.clone(), book_subscribe_params("DOGE/USD", 10));
        assert!(!registry.is_subscribed(&key));
        registry.mark_ack(&key, true);
        assert!(registry.is_subscribed(&key));
        registry.mark_ack(&key, false);
        assert!(!registry.is_subscribed(&key));
        // Failure leaves it registered so the next reconnect retries it.
        assert_eq!(registry.all_params().len(), 1);
    }

    #[test]
    fn subscribe_ack_success_decodes_ohlc_key() {
        let frame = r#"{"method":"subscribe","success":true,
            "result":{"channel":"ohlc","symbol":"DOGE/USD","interval":1}}"#;
        match decode_frame(frame) {
            Some(GatewayEvent::SubscribeAck { key: Some(SubscriptionKey::Ohlc { symbol, interval }), success, error }) => {
                assert_eq!(symbol, "DOGEUSD");
                assert_eq!(interval, 1);
                assert!(success);
                assert!(error.is_none());
            }
            other => panic!("expected ohlc subscribe ack, got {other:?}"),
        }
    }

    #[test]
    fn subscribe_ack_failure_carries_error() {
        let frame = r#"{"method":"subscribe","success":false,"error":"Currency pair not supported",
            "result":{"channel":"book","symbol":"DOGE/USD"}}"#;
        match decode_frame(frame) {
            Some(GatewayEvent::SubscribeAck { key: Some(SubscriptionKey::Book { symbol }), success, error }) => {
                assert_eq!(symbol, "DOGEUSD");
                assert!(!success);
                assert_eq!(error.as_deref(), Some("Currency pair not supported"));
            }
            other => panic!("expected book subscribe ack, got {other:?}"),
        }
    }
}
