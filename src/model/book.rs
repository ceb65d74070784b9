use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub qty: f64,
}

/// Format a price as a fixed-width 12-decimal key so lexical ordering of the
/// key matches numeric ordering of the price (prices here are always > 0).
fn price_key(price: f64) -> String {
    format!("{price:020.12}")
}

/// Local replica of a symbol's L2 book, rebuilt from `snapshot` frames and
/// mutated in place by `update` deltas.
#[derive(Debug, Clone, Default)]
pub struct BookState {
    bids: BTreeMap<String, BookLevel>,
    asks: BTreeMap<String, BookLevel>,
    pub last_trade_price: Option<f64>,
}

impl BookState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace both sides wholesale, as a `snapshot` frame requires.
    pub fn apply_snapshot(&mut self, bids: &[BookLevel], asks: &[BookLevel]) {
        self.bids.clear();
        self.asks.clear();
        for lvl in bids {
            self.set_bid(*lvl);
        }
        for lvl in asks {
            self.set_ask(*lvl);
        }
    }

    pub fn set_bid(&mut self, lvl: BookLevel) {
        apply_level(&mut self.bids, lvl);
    }

    pub fn set_ask(&mut self, lvl: BookLevel) {
        apply_level(&mut self.asks, lvl);
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.values().last().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.values().next().map(|l| l.price)
    }

    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ => None,
        }
    }

    pub fn spread_bps(&self) -> Option<f64> {
        let (bid, ask) = (self.best_bid()?, self.best_ask()?);
        let mid = (bid + ask) / 2.0;
        if mid == 0.0 {
            return None;
        }
        Some((ask - bid) / mid * 10_000.0)
    }

    pub fn imbalance(&self) -> Option<f64> {
        if self.bids.is_empty() && self.asks.is_empty() {
            return None;
        }
        let bid_qty: f64 = self.bids.values().map(|l| l.qty).sum();
        let ask_qty: f64 = self.asks.values().map(|l| l.qty).sum();
        let total = bid_qty + ask_qty;
        if total == 0.0 {
            return None;
        }
        Some((bid_qty - ask_qty) / total)
    }

    /// Average absolute bps deviation from mid incurred consuming `notional`
    /// quote units from both sides of the book.
    pub fn slippage_bps_for_size(&self, notional: f64) -> Option<f64> {
        let mid = self.mid_price()?;
        if mid <= 0.0 || notional <= 0.0 {
            return None;
        }
        let bid_bps = walk_side(self.bids.values().rev(), notional, mid, true)?;
        let ask_bps = walk_side(self.asks.values(), notional, mid, false)?;
        Some((bid_bps + ask_bps) / 2.0)
    }

    pub fn is_valid(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => b <= a,
            _ => true,
        }
    }
}

fn apply_level(side: &mut BTreeMap<String, BookLevel>, lvl: BookLevel) {
    let key = price_key(lvl.price);
    if lvl.qty <= 0.0 {
        side.remove(&key);
    } else {
        side.insert(key, lvl);
    }
}

fn walk_side<'a>(
    levels: impl Iterator<Item = &'a BookLevel>,
    notional: f64,
    mid: f64,
    _is_bid: bool,
) -> Option<f64> {
    let mut remaining = notional;
    let mut weighted_bps = 0.0;
    let mut filled = 0.0;
    for lvl in levels {
        if remaining <= 0.0 {
            break;
        }
        let level_notional = lvl.price * lvl.qty;
        let take = level_notional.min(remaining);
        let bps = ((lvl.price - mid).abs() / mid) * 10_000.0;
        weighted_bps += bps * take;
        filled += take;
        remaining -= take;
    }
    if filled == 0.0 {
        return None;
    }
    Some(weighted_bps / filled)
}
