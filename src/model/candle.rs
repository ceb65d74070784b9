use serde::{Deserialize, Serialize};

/// A single OHLCV bar. Immutable once the exchange marks it closed; the most
/// recent candle for a series is provisional and is overwritten in place as
/// new ticks arrive until the interval rolls over.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub t_unix_sec: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub is_closed: bool,
}

impl Candle {
    pub fn true_range(&self, prev_close: f64) -> f64 {
        let hl = self.high - self.low;
        let hc = (self.high - prev_close).abs();
        let lc = (self.low - prev_close).abs();
        hl.max(hc).max(lc)
    }

    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Exchange-reported metadata for a tradable pair, fetched once at startup
/// and cached for the life of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairMetadata {
    pub altname: String,
    pub wsname: String,
    pub base: String,
    pub quote: String,
    pub price_decimals: u32,
    pub volume_decimals: u32,
    pub min_order_volume: f64,
    pub min_order_cost: f64,
}

impl PairMetadata {
    pub fn round_price(&self, price: f64) -> f64 {
        round_to(price, self.price_decimals)
    }

    pub fn round_volume(&self, volume: f64) -> f64 {
        round_to(volume, self.volume_decimals)
    }
}

/// Round `x` to `decimals` fractional digits. Idempotent: `round_to(round_to(x,
/// d), d) == round_to(x, d)`.
pub fn round_to(x: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (x * factor).round() / factor
}
