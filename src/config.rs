use serde::{Deserialize, Serialize};

/// API credentials, read once at process start. Per spec.md §9, environment
/// parsing lives in the entry point only — nothing downstream reads `env::var`
/// directly.
#[derive(Clone)]
pub struct Credentials {
    pub kraken_api_key: String,
    pub kraken_api_secret: String,
    pub openai_api_key: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("kraken_api_key", &"<redacted>")
            .field("kraken_api_secret", &"<redacted>")
            .field("openai_api_key", &self.openai_api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;
        Ok(Self {
            kraken_api_key: std::env::var("KRAKEN_API_KEY")
                .context("KRAKEN_API_KEY not set")?,
            kraken_api_secret: std::env::var("KRAKEN_API_SECRET")
                .context("KRAKEN_API_SECRET not set")?,
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
        })
    }
}

fn default_pair() -> String {
    "DOGE/USD".to_string()
}
fn default_max_trade_risk_pct() -> f64 {
    0.75
}
fn default_max_total_risk_pct() -> f64 {
    1.5
}
fn default_size_pct() -> f64 {
    25.0
}
fn default_min_notional() -> f64 {
    20.0
}
fn default_pause_after_losses() -> u32 {
    2
}
fn default_pause_minutes() -> i64 {
    30
}
fn default_debounce_secs() -> i64 {
    60
}
fn default_drawdown_guard_pct() -> f64 {
    2.0
}
fn default_time_stop_bars() -> u32 {
    36
}
fn default_periodic_eval_secs() -> u64 {
    300
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_book_depth() -> u32 {
    5
}
fn default_ohlc_interval() -> u32 {
    1
}
fn default_target_notional() -> f64 {
    500.0
}

/// Engine-wide tunables. Constructed once in `main.rs`; everything else
/// receives an `Arc<EngineConfig>` rather than reading globals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_pair")]
    pub pair: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_max_trade_risk_pct")]
    pub max_trade_risk_pct: f64,
    #[serde(default = "default_max_total_risk_pct")]
    pub max_total_risk_pct: f64,
    #[serde(default = "default_size_pct")]
    pub default_size_pct: f64,
    #[serde(default = "default_min_notional")]
    pub min_notional: f64,
    #[serde(default = "default_pause_after_losses")]
    pub pause_after_losses: u32,
    #[serde(default = "default_pause_minutes")]
    pub pause_minutes: i64,
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: i64,
    #[serde(default = "default_drawdown_guard_pct")]
    pub drawdown_guard_pct: f64,
    #[serde(default = "default_time_stop_bars")]
    pub time_stop_bars: u32,
    #[serde(default = "default_periodic_eval_secs")]
    pub periodic_eval_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_book_depth")]
    pub book_depth: u32,
    #[serde(default = "default_ohlc_interval")]
    pub primary_ohlc_interval: u32,
    #[serde(default = "default_target_notional")]
    pub slippage_target_notional: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pair: default_pair(),
            dry_run: false,
            max_trade_risk_pct: default_max_trade_risk_pct(),
            max_total_risk_pct: default_max_total_risk_pct(),
            default_size_pct: default_size_pct(),
            min_notional: default_min_notional(),
            pause_after_losses: default_pause_after_losses(),
            pause_minutes: default_pause_minutes(),
            debounce_secs: default_debounce_secs(),
            drawdown_guard_pct: default_drawdown_guard_pct(),
            time_stop_bars: default_time_stop_bars(),
            periodic_eval_secs: default_periodic_eval_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            book_depth: default_book_depth(),
            primary_ohlc_interval: default_ohlc_interval(),
            slippage_target_notional: default_target_notional(),
        }
    }
}

/// Minimal flag parser for the orchestrator wrapper: `--pair`, `--risk`,
/// `--port` (accepted, unused — dashboard is out of scope), and a bare
/// `--dry-run` toggle.
pub fn apply_cli_args(mut config: EngineConfig, args: &[String]) -> EngineConfig {
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--pair" => {
                if let Some(v) = args.get(i + 1) {
                    config.pair = v.clone();
                    i += 1;
                }
            }
            "--risk" => {
                if let Some(v) = args.get(i + 1) {
                    if let Ok(pct) = v.parse::<f64>() {
                        config.default_size_pct = pct.clamp(1.0, 100.0);
                    }
                    i += 1;
                }
            }
            "--port" => {
                i += 1; // accepted for wrapper compatibility, unused here
            }
            "--dry-run" => {
                config.dry_run = true;
            }
            _ => {}
        }
        i += 1;
    }
    config
}
