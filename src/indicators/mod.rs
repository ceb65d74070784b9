// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the core technical indicators used
// by the feature builder. Every public function returns `Option<T>` (or an
// empty `Vec` for series) so callers are forced to handle insufficient-data
// and numerical-edge-case scenarios.

pub mod atr;
pub mod ema;
pub mod macd;
pub mod obv;
pub mod rsi;
pub mod sma;
pub mod vwap;
