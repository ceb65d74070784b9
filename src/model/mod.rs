pub mod book;
pub mod candle;
pub mod decision;
pub mod features;
pub mod position;

pub use book::{BookLevel, BookState};
pub use candle::{round_to, Candle, PairMetadata};
pub use decision::{Action, Decision, EntrySpec, EntryType};
pub use features::{
    Confluence, FeatureSnapshot, HtfAnchors, LiquidityFlags, LiquiditySnapshot, MaStack, Momentum,
    OrderbookFeatures, RegimeSnapshot, SwingFeatures, TimeframeFeatures, Trend, Volatility,
};
pub use position::{LossStreakWindow, Position, RiskLedger, Side};
