//! Risk ledger operations (spec §4.5 risk-ledger portion): pause/cooldown
//! gating and balance-snapshot caching. The data shape lives in
//! `model::position::RiskLedger`; this module holds the behaviour around it,
//! grounded in the teacher's `risk.rs` lock-guarded `Inner` pattern —
//! generalised here from a permanent breaker trip to the spec's
//! loss-streak-window-plus-cooldown model.

use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::model::RiskLedger;

const BALANCE_EPSILON: f64 = 1e-9;

pub struct RiskManager {
    ledger: RwLock<RiskLedger>,
    pause_after_losses: u32,
    pause_minutes: i64,
    last_balance: RwLock<Option<f64>>,
}

impl RiskManager {
    pub fn new(pause_after_losses: u32, pause_minutes: i64) -> Self {
        Self {
            ledger: RwLock::new(RiskLedger::default()),
            pause_after_losses,
            pause_minutes,
            last_balance: RwLock::new(None),
        }
    }

    pub fn snapshot(&self) -> RiskLedger {
        self.ledger.read().clone()
    }

    /// Capture `daily_starting_balance` on the first balance snapshot only;
    /// subsequent calls log the delta when it moves by more than epsilon.
    pub fn observe_balance(&self, quote_balance: f64) {
        let mut last = self.last_balance.write();
        if last.is_none() {
            self.ledger.write().daily_starting_balance = quote_balance;
            info!(quote_balance, "captured daily starting balance");
        } else if let Some(prev) = *last {
            if (quote_balance - prev).abs() > BALANCE_EPSILON {
                info!(prev, current = quote_balance, "balance changed");
            }
        }
        *last = Some(quote_balance);
    }

    pub fn is_paused(&self, now_ms: i64) -> bool {
        self.ledger.read().is_paused(now_ms)
    }

    pub fn pause_until_ms(&self) -> Option<i64> {
        self.ledger.read().pause_until_ms
    }

    pub fn pause_for_minutes(&self, now_ms: i64, minutes: i64) {
        let until = now_ms + minutes * 60_000;
        self.ledger.write().pause_until_ms = Some(until);
        warn!(until, "risk manager entering pause");
    }

    /// The configured default pause length, used when a `PAUSE` decision
    /// doesn't specify one of its own.
    pub fn pause_minutes(&self) -> i64 {
        self.pause_minutes
    }

    /// Append a realized-trade outcome; if the count of losses inside the
    /// bounded window reaches `pause_after_losses`, start a cooldown. The
    /// window counts outcomes, not consecutive streaks, per spec §4.5.
    pub fn record_outcome(&self, realized_pnl: f64, now_ms: i64) {
        let was_loss = realized_pnl < 0.0;
        let mut ledger = self.ledger.write();
        ledger.realized_pnl_quote += realized_pnl;
        ledger.loss_streak_window.push(was_loss);
        let losses = ledger.loss_streak_window.loss_count();
        if losses as u32 >= self.pause_after_losses {
            let until = now_ms + self.pause_minutes * 60_000;
            ledger.pause_until_ms = Some(until);
            warn!(losses, until, "loss streak cooldown triggered");
        }
    }

    pub fn daily_pnl_pct(&self) -> f64 {
        self.ledger.read().daily_pnl_pct()
    }
}

/// 30s TTL, single-flight balance cache: concurrent callers during an
/// in-flight refresh all await the same pending fetch rather than issuing
/// duplicate REST calls.
pub struct BalanceCache {
    ttl: Duration,
    state: tokio::sync::Mutex<CacheState>,
}

struct CacheState {
    value: Option<f64>,
    fetched_at_ms: i64,
}

impl BalanceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: tokio::sync::Mutex::new(CacheState { value: None, fetched_at_ms: i64::MIN }),
        }
    }

    /// Returns the cached value if still fresh, otherwise calls `fetch` and
    /// caches the result. `fetch` runs while the internal mutex is held, so
    /// concurrent callers naturally single-flight onto the same refresh.
    pub async fn get_or_refresh<F, Fut>(&self, now_ms: i64, fetch: F) -> anyhow::Result<f64>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<f64>>,
    {
        let mut state = self.state.lock().await;
        let fresh = now_ms - state.fetched_at_ms < self.ttl.as_millis() as i64;
        if fresh {
            if let Some(v) = state.value {
                return Ok(v);
            }
        }
        let value = fetch().await?;
        state.value = Some(value);
        state.fetched_at_ms = now_ms;
        Ok(value)
    }

    pub async fn force_refresh<F, Fut>(&self, now_ms: i64, fetch: F) -> anyhow::Result<f64>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<f64>>,
    {
        let mut state = self.state.lock().await;
        let value = fetch().await?;
        state.value = Some(value);
        state.fetched_at_ms = now_ms;
        Ok(value)
    }
}
