//! Strategy capability interface (spec §9 "Prototype-based polymorphism"):
//! the orchestrator drives one `Box<dyn Strategy>` through a fixed set of
//! lifecycle hooks instead of subclassing a base "Bot" type. Every hook has
//! a default no-op body so an override only needs to implement what it
//! cares about, the same shape the teacher's `risk.rs` `RiskManager` trait
//! boundary uses for pluggable cooldown policy.

use std::panic::AssertUnwindSafe;

use tracing::error;

use crate::errors::HookError;
use crate::execution::FillEvent;
use crate::model::{Decision, FeatureSnapshot};

/// Fixed hook set a strategy may override. All hooks are synchronous and run
/// on the orchestrator's single evaluation task — a hook that blocks blocks
/// the whole bot, the same constraint the source's event handlers had.
pub trait Strategy: Send + Sync {
    /// Called once, right after `start()` finishes registering subscriptions.
    fn on_init(&self, _pair: &str) {}

    /// Called once per evaluation cycle, after the feature snapshot is built
    /// and before the decision adapter runs.
    fn on_price_update(&self, _snapshot: &FeatureSnapshot) {}

    /// Called after the decision adapter returns, before execution.
    fn on_decision(&self, _decision: &Decision) {}

    /// Called after a live fill arrives over the private execution feed.
    fn on_fill(&self, _fill: &FillEvent) {}

    /// Called whenever another hook panics; never invoked for anything else.
    fn on_error(&self, _error: &HookError) {}
}

/// The strategy used when the operator hasn't supplied one — every hook is a
/// no-op, matching the source's behaviour when no `Bot` subclass overrides a
/// given handler.
#[derive(Default)]
pub struct DefaultStrategy;

impl Strategy for DefaultStrategy {}

/// Runs `f` — a call into one of `strategy`'s hooks — catching any panic so
/// a misbehaving strategy can never bring down the evaluation loop. On
/// panic, logs and best-effort notifies the strategy's own `on_error`.
pub fn run_hook(strategy: &dyn Strategy, hook: &'static str, f: impl FnOnce()) {
    if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(f)) {
        let message = panic_message(payload.as_ref());
        let error = HookError::Panicked { hook, message };
        error!(hook, %error, "strategy hook panicked, continuing");
        let _ = std::panic::catch_unwind(AssertUnwindSafe(|| strategy.on_error(&error)));
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
