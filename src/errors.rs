use thiserror::Error;

/// Errors surfaced by the exchange gateway (REST + WebSocket). Mirrors §7's
/// kind taxonomy rather than a single opaque `anyhow::Error` so callers can
/// branch on retry policy.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("exchange error: {0}")]
    Exchange(String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl GatewayError {
    pub fn is_retryable_open_orders(&self) -> bool {
        matches!(self, GatewayError::Exchange(msg)
            if msg.contains("Invalid nonce") || msg.contains("timeout"))
    }
}

/// Rejections produced inside the execution engine. Never bubbled as a panic
/// or thrown exception — always returned as data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("missing pair metadata for {0}")]
    MissingPairMetadata(String),
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("notional below minimum")]
    BelowMinNotional,
    #[error("volume below minimum order size")]
    BelowMinVolume,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unsupported action")]
    UnsupportedAction,
    #[error("non-finite numeric field: {0}")]
    NonFinite(&'static str),
}

/// A failure inside a user-supplied [`crate::strategy::Strategy`] hook.
/// Caught at the call site, logged, and emitted as an error event; never
/// crashes the bot (spec §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error("strategy hook '{hook}' panicked: {message}")]
    Panicked { hook: &'static str, message: String },
}
