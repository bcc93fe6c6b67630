//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (bot token, vault passphrase) are referenced by env-var name in
//! the config and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::engine::orchestrator::{OrchestratorSettings, Pacing};
use crate::retry::RetryPolicy;
use crate::types::RunnerError;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub runner: RunnerConfig,
    pub retry: RetryConfig,
    pub storage: StorageConfig,
    pub provision: ProvisionConfig,
    pub alerts: AlertsConfig,
    pub vault: VaultConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RunnerConfig {
    /// Maximum number of items executing at once.
    pub threads: usize,
    /// Random pause `[min, max]` after a successful item.
    pub sleep_after_success_secs: [u64; 2],
    /// Fixed pause after a failed item.
    pub sleep_after_failure_secs: u64,
    /// Bound on waiting for a wallet lock. Unbounded when absent.
    pub lock_wait_timeout_secs: Option<u64>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            threads: 3,
            sleep_after_success_secs: [30, 60],
            sleep_after_failure_secs: 10,
            lock_wait_timeout_secs: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 2.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub queue_path: String,
    pub report_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            queue_path: "databases/modules.json".to_string(),
            report_path: "databases/report.json".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Modules per account `[min, max]`.
    pub trades_count: [u32; 2],
    /// Accounts per group `[min, max]`. Both must be at least 2.
    pub pair_size: [usize; 2],
    pub shuffle_wallets: bool,
    pub credentials_path: String,
    pub proxies_path: Option<String>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            trades_count: [1, 3],
            pair_size: [2, 3],
            shuffle_wallets: true,
            credentials_path: "input_data/apikeys.txt".to_string(),
            proxies_path: Some("input_data/proxies.txt".to_string()),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AlertsConfig {
    pub telegram_bot_token_env: Option<String>,
    /// Comma-separated chat ids.
    pub telegram_chat_ids_env: Option<String>,
    pub max_message_len: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            telegram_bot_token_env: Some("TELEGRAM_BOT_TOKEN".to_string()),
            telegram_chat_ids_env: Some("TELEGRAM_CHAT_IDS".to_string()),
            max_message_len: 4000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VaultConfig {
    pub passphrase_env: Option<String>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            passphrase_env: Some("TRADEQUEUE_PASSPHRASE".to_string()),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {path}"))?;
        Ok(config)
    }

    /// Reject values the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), RunnerError> {
        let invalid = |msg: &str| Err(RunnerError::Configuration(msg.to_string()));

        if self.runner.threads == 0 {
            return invalid("runner.threads must be at least 1");
        }
        let [min, max] = self.runner.sleep_after_success_secs;
        if min > max {
            return invalid("runner.sleep_after_success_secs must be [min, max]");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if !self.retry.base_delay_secs.is_finite() || self.retry.base_delay_secs < 0.0 {
            return invalid("retry.base_delay_secs must be a non-negative number");
        }
        let [min, max] = self.provision.trades_count;
        if min == 0 || min > max {
            return invalid("provision.trades_count must be [min, max] with min >= 1");
        }
        let [min, max] = self.provision.pair_size;
        if min < 2 || min > max {
            return invalid("provision.pair_size must be [min, max] with min >= 2");
        }
        if self.alerts.max_message_len == 0 {
            return invalid("alerts.max_message_len must be at least 1");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_secs_f64(self.retry.base_delay_secs),
        )
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        let [min, max] = self.runner.sleep_after_success_secs;
        OrchestratorSettings {
            concurrency: self.runner.threads,
            pacing: Pacing {
                after_success_min: Duration::from_secs(min),
                after_success_max: Duration::from_secs(max),
                after_failure: Duration::from_secs(self.runner.sleep_after_failure_secs),
            },
            lock_wait_timeout: self.runner.lock_wait_timeout_secs.map(Duration::from_secs),
        }
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
