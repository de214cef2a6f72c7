//! KEEPER: round keeper and batch betting agent for an UP/DOWN market.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores the participant table, wires the ledger, feeds and engines
//! together, and runs until Ctrl+C.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use keeper::config::{self, AppConfig};
use keeper::dashboard::{self, routes::DashboardState};
use keeper::engine::{BatchEngine, ParticipantRegistry, RoundOrchestrator, RoundStateCache};
use keeper::feeds::{
    BinancePriceFeed, CachedForecastProvider, ForecastProvider, HttpForecastProvider, PriceFeed,
};
use keeper::ledger::{rpc::JsonRpcLedger, tx::Wallet, Ledger};
use keeper::types::{KeeperError, KeeperResult};

const BANNER: &str = r#"
 _  _______ _____ ____  _____ ____
| |/ / ____| ____|  _ \| ____|  _ \
| ' /|  _| |  _| | |_) |  _| | |_) |
| . \| |___| |___|  __/| |___|  _ <
|_|\_\_____|_____|_|   |_____|_| \_\

  Round keeper + batch betting engine
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load_or_default("config.toml")?;

    init_logging(&cfg);

    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        asset = %cfg.agent.asset,
        rpc_url = %cfg.ledger.rpc_url,
        chain_id = cfg.ledger.chain_id,
        "KEEPER starting up"
    );

    // -- Participant state -----------------------------------------------

    let registry = Arc::new(ParticipantRegistry::load(
        &cfg.storage.participants_file,
        cfg.batch.default_max_wager,
    )?);
    let cache = Arc::new(RoundStateCache::new());

    // -- External collaborators ------------------------------------------

    let ledger: Option<Arc<dyn Ledger>> = match build_ledger(&cfg) {
        Ok(l) => {
            info!(operator = %l.operator_address(), "Ledger connected");
            Some(l)
        }
        Err(e) => {
            error!(error = %e, "Ledger unavailable: round keeping and betting disabled");
            None
        }
    };

    let prices: Arc<dyn PriceFeed> = Arc::new(BinancePriceFeed::new(
        &cfg.feeds.price_base_url,
        cfg.feeds.price_timeout_secs,
    )?);

    let forecasts: Option<Arc<CachedForecastProvider>> = match &cfg.feeds.forecast_url {
        Some(url) => {
            let http: Arc<dyn ForecastProvider> =
                Arc::new(HttpForecastProvider::new(url, cfg.feeds.forecast_timeout_secs)?);
            let cached = Arc::new(CachedForecastProvider::new(
                http,
                cfg.feeds.forecast_max_age_secs,
            ));
            tokio::spawn(cached.clone().run_refresh_loop(
                cfg.agent.asset.clone(),
                Duration::from_secs(cfg.feeds.forecast_refresh_secs.max(1)),
            ));
            Some(cached)
        }
        None => {
            warn!("No forecast_url configured: batch betting disabled");
            None
        }
    };

    // -- Engines ---------------------------------------------------------

    let batch = match (&ledger, &forecasts) {
        (Some(ledger), Some(forecasts)) if cfg.batch.enabled => {
            let forecasts: Arc<dyn ForecastProvider> = forecasts.clone();
            Some(Arc::new(BatchEngine::new(
                ledger.clone(),
                forecasts,
                registry.clone(),
                cfg.batch.clone(),
                cfg.ledger.gas.clone(),
                &cfg.agent.asset,
            )))
        }
        _ => None,
    };

    if let Some(ledger) = &ledger {
        if let Err(e) = cache.sync_from_ledger(ledger.as_ref()).await {
            warn!(error = %e, "Initial round sync failed");
        }

        let mut orchestrator = RoundOrchestrator::new(
            ledger.clone(),
            prices.clone(),
            cache.clone(),
            registry.clone(),
            cfg.round.clone(),
            cfg.ledger.gas.clone(),
            &cfg.agent.asset,
        );
        if let Some(engine) = &batch {
            orchestrator = orchestrator.with_batch_engine(engine.clone());
        }
        tokio::spawn(orchestrator.run());
    }

    if cfg.dashboard.enabled {
        let mut state = DashboardState::new(
            &cfg.agent.name,
            &cfg.agent.asset,
            cache.clone(),
            registry.clone(),
        );
        if let Some(ledger) = &ledger {
            state = state.with_ledger(ledger.clone());
        }
        if let Some(forecasts) = &forecasts {
            state = state.with_forecasts(forecasts.clone());
        }
        state = state.with_prices(prices.clone());
        if let Some(engine) = &batch {
            state = state.with_batch_engine(engine.clone());
        }
        dashboard::spawn_dashboard(
            Arc::new(state),
            cfg.dashboard.port,
            &cfg.dashboard.allowed_origins,
        );
    }

    // -- Heartbeat until shutdown ------------------------------------------

    let mut heartbeat = tokio::time::interval(Duration::from_secs(cfg.agent.heartbeat_secs.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let snapshot = cache.snapshot().await;
                let summary = registry.summary().await;
                info!(
                    round_id = snapshot.round_id,
                    strike = format!("${:.2}", snapshot.strike_price),
                    remaining_secs = snapshot.remaining_secs(chrono::Utc::now().timestamp()),
                    active_bots = summary.active.len(),
                    "Heartbeat"
                );
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    if let Err(e) = registry.persist().await {
        error!(error = %e, "Failed to save participants on shutdown");
    }
    info!("KEEPER shut down cleanly.");

    Ok(())
}

/// Signing wallet plus both contract addresses, or the reason the ledger
/// cannot be used.
fn build_ledger(cfg: &AppConfig) -> KeeperResult<Arc<dyn Ledger>> {
    let wallet = Wallet::from_env(&cfg.ledger.private_key_env, cfg.ledger.chain_id)?;
    let rounds = cfg.ledger.resolve_contract_address().ok_or_else(|| {
        KeeperError::Configuration(format!(
            "round contract address not set ({})",
            cfg.ledger.contract_address_env
        ))
    })?;
    let vault = cfg.ledger.resolve_vault_address().ok_or_else(|| {
        KeeperError::Configuration(format!(
            "vault address not set ({})",
            cfg.ledger.vault_address_env
        ))
    })?;
    Ok(Arc::new(JsonRpcLedger::new(&cfg.ledger, wallet, &rounds, &vault)?))
}

/// Initialise the `tracing` subscriber.
fn init_logging(cfg: &config::AppConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("keeper=info"));

    let json_logging = std::env::var("KEEPER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }

    tracing::debug!(agent = %cfg.agent.name, "Logging initialised");
}
