// =============================================================================
// Kraken Spot Bot — Main Entry Point
// =============================================================================
//
// Loads credentials and config, resolves the traded pair against Kraken's
// AssetPairs metadata, wires the gateway/feature/event/decision/execution
// stack together inside the orchestrator, and runs until Ctrl-C.
// =============================================================================

mod config;
mod csv_log;
mod decision_adapter;
mod errors;
mod event_engine;
mod execution;
mod feature_builder;
mod gateway;
mod indicators;
mod market_data;
mod model;
mod orchestrator;
mod regime;
mod risk;
mod strategy;
mod symbol;

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{apply_cli_args, Credentials, EngineConfig};
use crate::csv_log::DecisionLog;
use crate::decision_adapter::DecisionSource;
use crate::gateway::KrakenRestClient;
use crate::orchestrator::Orchestrator;

const DECISION_LOG_PATH: &str = "decisions.csv";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("kraken spot bot starting up");

    let credentials = Credentials::from_env()?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = Arc::new(apply_cli_args(EngineConfig::default(), &args));

    if config.dry_run {
        info!("running in dry-run mode: orders are constructed but never submitted");
    }

    let rest = Arc::new(KrakenRestClient::new(
        credentials.kraken_api_key.clone(),
        credentials.kraken_api_secret.clone(),
    ));

    let decision_source = match credentials.openai_api_key.clone() {
        Some(key) => DecisionSource::openai(key),
        None => {
            info!("OPENAI_API_KEY not set, decisions will default to HOLD");
            DecisionSource::Mock(|_request| r#"{"action":"HOLD","comment":"no decision source configured"}"#.to_string())
        }
    };

    let decision_log = Arc::new(DecisionLog::open(DECISION_LOG_PATH).await?);

    let orchestrator = Arc::new(
        Orchestrator::new(config.clone(), rest, decision_source, decision_log).await?,
    );

    orchestrator.start().await?;
    info!(pair = %config.pair, dry_run = config.dry_run, "orchestrator started, entering run loop");

    let run_handle = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run().await })
    };

    tokio::select! {
        result = run_handle => {
            if let Err(e) = result {
                error!(error = %e, "run loop task panicked");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    orchestrator.stop().await;
    info!("kraken spot bot stopped");
    Ok(())
}
