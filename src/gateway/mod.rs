//! Kraken connectivity: signed REST calls plus the multiplexed WebSocket
//! feed. Kept as two files the way the teacher split `binance/client.rs`
//! from its socket handling, so REST retry/signing concerns never leak into
//! the stream-decoding path.

pub mod rest;
pub mod ws;

pub use rest::KrakenRestClient;
pub use ws::{
    book_subscribe_params, canonical_symbol, decode_frame, executions_subscribe_params,
    ohlc_subscribe_params, run_socket, BookUpdate, ExecutionFill, GatewayEvent, OhlcUpdate,
    SubscriptionKey, SubscriptionRegistry, WsTokenCache, PRIVATE_WS_URL, PUBLIC_WS_URL,
};
