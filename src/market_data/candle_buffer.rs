use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::model::Candle;

/// Composite key that identifies a unique candle series: `(symbol, interval)`
/// where `interval` is Kraken's minute-count string (`"1"`, `"5"`, `"15"`,
/// `"60"`, `"240"`, `"1440"`).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// Thread-safe ring-buffer that stores the most recent candles per
/// `(symbol, interval)` pair. The live (unclosed) candle is continuously
/// updated in-place; when a candle closes it becomes permanent and the ring
/// is trimmed to `max_candles`.
pub struct CandleBuffer {
    buffers: RwLock<HashMap<CandleKey, VecDeque<Candle>>>,
    max_candles: usize,
}

impl CandleBuffer {
    pub fn new(max_candles: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_candles,
        }
    }

    /// Insert or replace the latest candle for the given key.
    pub fn update(&self, key: CandleKey, candle: Candle) {
        let mut map = self.buffers.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.max_candles + 1));

        if let Some(last) = ring.back() {
            if !last.is_closed && last.t_unix_sec == candle.t_unix_sec {
                ring.pop_back();
            }
        }
        ring.push_back(candle);

        if candle.is_closed {
            while ring.len() > self.max_candles {
                ring.pop_front();
            }
        }
    }

    /// Return the most recent `count` **closed** candles (oldest-first).
    pub fn get_closed(&self, key: &CandleKey, count: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let closed: Vec<&Candle> = ring.iter().filter(|c| c.is_closed).collect();
                let start = closed.len().saturating_sub(count);
                closed[start..].iter().map(|c| **c).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn get_closes(&self, key: &CandleKey, count: usize) -> Vec<f64> {
        self.get_closed(key, count).iter().map(|c| c.close).collect()
    }

    pub fn last_close(&self, key: &CandleKey) -> Option<f64> {
        let map = self.buffers.read();
        map.get(key)
            .and_then(|ring| ring.iter().rev().find(|c| c.is_closed).map(|c| c.close))
    }

    /// Bucket index of the most recently closed bar — used by the event
    /// engine to detect "a bar just closed" without retaining full candles.
    pub fn last_closed_bucket(&self, key: &CandleKey, interval_secs: i64) -> Option<i64> {
        self.last_close_time(key).map(|t| t / interval_secs)
    }

    fn last_close_time(&self, key: &CandleKey) -> Option<i64> {
        let map = self.buffers.read();
        map.get(key)
            .and_then(|ring| ring.iter().rev().find(|c| c.is_closed).map(|c| c.t_unix_sec))
    }

    pub fn count(&self, key: &CandleKey) -> usize {
        let map = self.buffers.read();
        map.get(key).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_candle(t: i64, close: f64, is_closed: bool) -> Candle {
        Candle {
            t_unix_sec: t,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            is_closed,
        }
    }

    fn make_key(sym: &str, iv: &str) -> CandleKey {
        CandleKey {
            symbol: sym.into(),
            interval: iv.into(),
        }
    }

    #[test]
    fn ring_buffer_trimming() {
        let buf = CandleBuffer::new(3);
        let key = make_key("DOGEUSD", "1");
        for i in 0..5 {
            buf.update(key.clone(), sample_candle(i * 60, 100.0 + i as f64, true));
        }
        assert_eq!(buf.count(&key), 3);
        assert_eq!(buf.get_closes(&key, 10), vec![102.0, 103.0, 104.0]);
    }

    #[test]
    fn in_progress_replacement() {
        let buf = CandleBuffer::new(10);
        let key = make_key("ETHUSD", "5");
        buf.update(key.clone(), sample_candle(0, 50.0, false));
        assert_eq!(buf.count(&key), 1);
        buf.update(key.clone(), sample_candle(0, 51.0, false));
        assert_eq!(buf.count(&key), 1);
        buf.update(key.clone(), sample_candle(0, 52.0, true));
        assert_eq!(buf.count(&key), 1);
        assert_eq!(buf.last_close(&key), Some(52.0));
    }

    #[test]
    fn get_closed_filters_out_in_progress() {
        let buf = CandleBuffer::new(10);
        let key = make_key("DOGEUSD", "1");
        buf.update(key.clone(), sample_candle(0, 100.0, true));
        buf.update(key.clone(), sample_candle(60, 101.0, true));
        buf.update(key.clone(), sample_candle(120, 102.0, false));
        assert_eq!(buf.get_closed(&key, 10).len(), 2);
    }

    #[test]
    fn last_close_empty_returns_none() {
        let buf = CandleBuffer::new(10);
        assert_eq!(buf.last_close(&make_key("XYZUSD", "60")), None);
    }

    #[test]
    fn last_closed_bucket_tracks_interval_boundary() {
        let buf = CandleBuffer::new(10);
        let key = make_key("DOGEUSD", "15");
        buf.update(key.clone(), sample_candle(900, 1.0, true));
        assert_eq!(buf.last_closed_bucket(&key, 900), Some(1));
        buf.update(key.clone(), sample_candle(1800, 1.1, true));
        assert_eq!(buf.last_closed_bucket(&key, 900), Some(2));
    }
}
