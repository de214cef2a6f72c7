//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! The signing key is referenced by env-var name in the config and
//! resolved at runtime via `std::env::var`; contract addresses may be given
//! inline or through an env var.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::fs;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub round: RoundConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub feeds: FeedsConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    /// Asset the market settles on (e.g. "btc").
    pub asset: String,
    pub heartbeat_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "KEEPER-001".to_string(),
            asset: "btc".to_string(),
            heartbeat_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LedgerConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    /// Round contract address (inline).
    pub contract_address: Option<String>,
    /// Env var holding the round contract address, used when not inline.
    pub contract_address_env: String,
    pub vault_address: Option<String>,
    pub vault_address_env: String,
    /// Env var holding the operator's hex private key.
    pub private_key_env: String,
    pub request_timeout_secs: u64,
    pub receipt_poll_ms: u64,
    pub gas: GasConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            chain_id: 10740,
            contract_address: None,
            contract_address_env: "CONTRACT_ADDRESS".to_string(),
            vault_address: None,
            vault_address_env: "VAULT_ADDRESS".to_string(),
            private_key_env: "PRIVATE_KEY".to_string(),
            request_timeout_secs: 10,
            receipt_poll_ms: 1_000,
            gas: GasConfig::default(),
        }
    }
}

impl LedgerConfig {
    /// Round contract address: inline value first, then the env var.
    pub fn resolve_contract_address(&self) -> Option<String> {
        resolve_inline_or_env(self.contract_address.as_deref(), &self.contract_address_env)
    }

    pub fn resolve_vault_address(&self) -> Option<String> {
        resolve_inline_or_env(self.vault_address.as_deref(), &self.vault_address_env)
    }
}

/// Gas budgets per transaction kind.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GasConfig {
    pub start_round: u64,
    pub start_after_resolve: u64,
    pub resolve_round: u64,
    pub distribute_fee: u64,
    pub batch_base: u64,
    pub batch_per_participant: u64,
    /// Gas price multiplier for the time-critical resolve/start pair.
    pub resolve_price_multiplier: f64,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            start_round: 300_000,
            start_after_resolve: 500_000,
            resolve_round: 2_000_000,
            distribute_fee: 100_000,
            batch_base: 200_000,
            batch_per_participant: 150_000,
            resolve_price_multiplier: 1.2,
        }
    }
}

/// Round lifecycle timing.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RoundConfig {
    pub poll_interval_ms: u64,
    pub grace_secs: u64,
    pub prefetch_window_secs: u64,
    pub prefetch_max_age_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_jitter_ms: u64,
    pub cooldown_secs: u64,
    pub price_retry_secs: u64,
    pub confirmation_timeout_secs: u64,
    pub fee_check_interval_secs: u64,
    /// Delay between a new round starting and the automatic batch pass.
    pub batch_settle_delay_secs: u64,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            grace_secs: 1,
            prefetch_window_secs: 10,
            prefetch_max_age_secs: 15,
            max_attempts: 10,
            backoff_base_secs: 3,
            backoff_jitter_ms: 500,
            cooldown_secs: 30,
            price_retry_secs: 2,
            confirmation_timeout_secs: 30,
            fee_check_interval_secs: 600,
            batch_settle_delay_secs: 2,
        }
    }
}

/// Batch betting parameters.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BatchConfig {
    pub enabled: bool,
    pub min_remaining_secs: u64,
    pub reference_window_secs: u64,
    pub default_max_wager: Decimal,
    pub min_wager: Decimal,
    pub gas_reserve: Decimal,
    pub confirmation_timeout_secs: u64,
    /// How long a manual request waits for a pass already in progress.
    pub manual_wait_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_remaining_secs: 45,
            reference_window_secs: 300,
            default_max_wager: dec!(0.01),
            min_wager: dec!(0.001),
            gas_reserve: dec!(0.0005),
            confirmation_timeout_secs: 45,
            manual_wait_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FeedsConfig {
    pub price_base_url: String,
    pub price_timeout_secs: u64,
    /// Forecast provider endpoint; batch betting is disabled without it.
    pub forecast_url: Option<String>,
    pub forecast_timeout_secs: u64,
    pub forecast_refresh_secs: u64,
    pub forecast_max_age_secs: u64,
}

impl Default for FeedsConfig {
    fn default() -> Self {
        Self {
            price_base_url: "https://api.binance.com".to_string(),
            price_timeout_secs: 5,
            forecast_url: None,
            forecast_timeout_secs: 30,
            forecast_refresh_secs: 35,
            forecast_max_age_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 3402,
            allowed_origins: vec![
                "http://localhost:5173".to_string(),
                "http://localhost:3000".to_string(),
            ],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub participants_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            participants_file: "keeper_participants.json".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Load from a file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if std::path::Path::new(path).exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents).context("Invalid TOML configuration")?;
        Ok(config)
    }
}

fn resolve_inline_or_env(inline: Option<&str>, env_name: &str) -> Option<String> {
    inline
        .map(str::to_string)
        .or_else(|| std::env::var(env_name).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
