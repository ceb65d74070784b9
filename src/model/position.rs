use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Flat,
    Long,
}

/// Invariant: `side == Flat <=> size == 0.0 <=> avg_price == 0.0`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub side: Side,
    pub size: f64,
    pub avg_price: f64,
    pub opened_at_ms: Option<i64>,
    pub unrealized_r: f64,
    pub bars_open_5m: u32,
}

impl Default for Position {
    fn default() -> Self {
        Self {
            side: Side::Flat,
            size: 0.0,
            avg_price: 0.0,
            opened_at_ms: None,
            unrealized_r: 0.0,
            bars_open_5m: 0,
        }
    }
}

impl Position {
    pub fn is_flat(&self) -> bool {
        matches!(self.side, Side::Flat)
    }

    /// Re-establish the struct invariant after a mutation reduces size to (or
    /// below) zero.
    pub fn normalize(&mut self) {
        if self.size <= 0.0 {
            *self = Position::default();
        }
    }
}

const LOSS_WINDOW_CAPACITY: usize = 5;

/// Ring of the last `LOSS_WINDOW_CAPACITY` realized trade outcomes: `true` for
/// a loss, `false` for a win/breakeven.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LossStreakWindow {
    outcomes: VecDeque<bool>,
}

impl LossStreakWindow {
    pub fn push(&mut self, was_loss: bool) {
        self.outcomes.push_back(was_loss);
        while self.outcomes.len() > LOSS_WINDOW_CAPACITY {
            self.outcomes.pop_front();
        }
    }

    pub fn loss_count(&self) -> usize {
        self.outcomes.iter().filter(|&&l| l).count()
    }

    pub fn as_vec(&self) -> Vec<bool> {
        self.outcomes.iter().copied().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLedger {
    pub daily_starting_balance: f64,
    pub realized_pnl_quote: f64,
    pub loss_streak_window: LossStreakWindow,
    pub pause_until_ms: Option<i64>,
}

impl Default for RiskLedger {
    fn default() -> Self {
        Self {
            daily_starting_balance: 0.0,
            realized_pnl_quote: 0.0,
            loss_streak_window: LossStreakWindow::default(),
            pause_until_ms: None,
        }
    }
}

impl RiskLedger {
    /// `(starting + realized - starting) / starting * 100`, per the spec's
    /// literal formula; guarded against a zero starting balance.
    pub fn daily_pnl_pct(&self) -> f64 {
        if self.daily_starting_balance == 0.0 {
            return 0.0;
        }
        (self.daily_starting_balance + self.realized_pnl_quote - self.daily_starting_balance)
            / self.daily_starting_balance
            * 100.0
    }

    pub fn is_paused(&self, now_ms: i64) -> bool {
        matches!(self.pause_until_ms, Some(until) if now_ms < until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_position_has_zero_size_and_price() {
        let p = Position::default();
        assert!(p.is_flat());
        assert_eq!(p.size, 0.0);
        assert_eq!(p.avg_price, 0.0);
    }

    #[test]
    fn loss_window_caps_at_five() {
        let mut w = LossStreakWindow::default();
        for i in 0..8 {
            w.push(i % 2 == 0);
        }
        assert_eq!(w.as_vec().len(), 5);
    }

    #[test]
    fn daily_pnl_pct_zero_when_starting_balance_zero() {
        let ledger = RiskLedger {
            daily_starting_balance: 0.0,
            realized_pnl_quote: 500.0,
            ..RiskLedger::default()
        };
        assert_eq!(ledger.daily_pnl_pct(), 0.0);
    }

    #[test]
    fn paused_while_before_pause_until() {
        let ledger = RiskLedger {
            pause_until_ms: Some(1000),
            ..RiskLedger::default()
        };
        assert!(ledger.is_paused(500));
        assert!(!ledger.is_paused(1500));
    }
}
