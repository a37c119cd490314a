//! Application configuration.
//!
//! Sources, lowest precedence first:
//! 1. Legacy `CONTRACT_ADDRESS_MARGV1_POOL` for the pool address
//! 2. TOML file (optional)
//! 3. `POOLWATCH_*` environment variables, `__` between sections
//!    (`POOLWATCH_CHAIN__RPC_URL`, `POOLWATCH_ALERT__BOT_TOKEN`)

use crate::error::{AppError, AppResult};
use crate::monitor::MonitorConfig;
use alloy::primitives::Address;
use poolwatch_alert::{DispatchConfig, DynNotifier, TelegramNotifier};
use poolwatch_chain::{ReorgPolicy, SourceConfig};
use poolwatch_core::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "POOLWATCH";

/// Pool address variable understood for compatibility with older deployments.
pub const LEGACY_POOL_ADDRESS_ENV: &str = "CONTRACT_ADDRESS_MARGV1_POOL";

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Chain connection and scanning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Pool contract address (required).
    #[serde(default)]
    pub pool_address: String,
    /// JSON-RPC HTTP endpoint (required).
    #[serde(default)]
    pub rpc_url: String,
    /// First block to scan on first run. Without it the watcher starts at
    /// the current head.
    #[serde(default)]
    pub start_block: Option<u64>,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Consecutive chain failures before exiting (0 = infinite).
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub reorg: ReorgPolicy,
}

fn default_confirmations() -> u64 {
    2
}

fn default_max_block_range() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    4000
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            pool_address: String::new(),
            rpc_url: String::new(),
            start_block: None,
            confirmations: default_confirmations(),
            max_block_range: default_max_block_range(),
            poll_interval_ms: default_poll_interval_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            max_reconnect_attempts: 0,
            backoff: BackoffConfig::default(),
            reorg: ReorgPolicy::default(),
        }
    }
}

/// Breach notification.
///
/// Alerts are sent only when both `bot_token` and `chat_id` are set.
#[derive(Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Block explorer base URL for transaction links.
    #[serde(default)]
    pub explorer_url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff between attempts of one dispatch.
    #[serde(default = "default_alert_backoff")]
    pub backoff: BackoffConfig,
    /// Backoff between dispatch rounds while a block is blocked on delivery.
    #[serde(default = "default_redelivery_backoff")]
    pub redelivery_backoff: BackoffConfig,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Blocks at or below this height may be checkpointed with undelivered
    /// alerts (operator override).
    #[serde(default)]
    pub accept_alert_loss_through: Option<u64>,
}

fn default_api_url() -> String {
    poolwatch_alert::telegram::DEFAULT_API_URL.to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_alert_backoff() -> BackoffConfig {
    BackoffConfig::new(1_000, 30_000)
}

fn default_redelivery_backoff() -> BackoffConfig {
    BackoffConfig::new(5_000, 300_000)
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            chat_id: None,
            api_url: default_api_url(),
            explorer_url: None,
            max_retries: default_max_retries(),
            backoff: default_alert_backoff(),
            redelivery_backoff: default_redelivery_backoff(),
            call_timeout_ms: default_call_timeout_ms(),
            accept_alert_loss_through: None,
        }
    }
}

impl fmt::Debug for AlertConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertConfig")
            .field("bot_token", &self.bot_token.as_ref().map(|_| "<redacted>"))
            .field("chat_id", &self.chat_id)
            .field("api_url", &self.api_url)
            .field("explorer_url", &self.explorer_url)
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("redelivery_backoff", &self.redelivery_backoff)
            .field("call_timeout_ms", &self.call_timeout_ms)
            .field("accept_alert_loss_through", &self.accept_alert_loss_through)
            .finish()
    }
}

impl AlertConfig {
    /// `(bot_token, chat_id)` when both are present and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let token = self.bot_token.as_deref().filter(|s| !s.is_empty())?;
        let chat = self.chat_id.as_deref().filter(|s| !s.is_empty())?;
        Some((token, chat))
    }
}

/// On-disk state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Directory holding the checkpoint and the delivery log.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Default level when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// Load from an optional TOML file plus the environment.
    ///
    /// A missing file is not an error; the environment alone may carry a
    /// complete configuration.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let mut builder = ::config::Config::builder();

        if let Ok(address) = std::env::var(LEGACY_POOL_ADDRESS_ENV) {
            builder = builder.set_default("chain.pool_address", address)?;
        }

        let config = builder
            .add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app_config: Self = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml_str(content: &str) -> AppResult<Self> {
        let app_config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Fail-fast checks run before anything connects.
    pub fn validate(&self) -> AppResult<()> {
        self.pool_address()?;

        if self.chain.rpc_url.trim().is_empty() {
            return Err(AppError::Config("chain.rpc_url is required".to_string()));
        }
        if self.chain.max_block_range == 0 {
            return Err(AppError::Config(
                "chain.max_block_range must be at least 1".to_string(),
            ));
        }
        if self.chain.queue_capacity == 0 {
            return Err(AppError::Config(
                "chain.queue_capacity must be at least 1".to_string(),
            ));
        }

        let has_token = self.alert.bot_token.as_deref().is_some_and(|s| !s.is_empty());
        let has_chat = self.alert.chat_id.as_deref().is_some_and(|s| !s.is_empty());
        if has_token != has_chat {
            return Err(AppError::Config(
                "alert.bot_token and alert.chat_id must be set together".to_string(),
            ));
        }

        Ok(())
    }

    /// Parsed pool contract address.
    pub fn pool_address(&self) -> AppResult<Address> {
        let raw = self.chain.pool_address.trim();
        if raw.is_empty() {
            return Err(AppError::Config(format!(
                "chain.pool_address is required (or set {LEGACY_POOL_ADDRESS_ENV})"
            )));
        }
        Address::from_str(raw)
            .map_err(|e| AppError::Config(format!("Invalid chain.pool_address {raw}: {e}")))
    }

    pub fn source_config(&self) -> AppResult<SourceConfig> {
        Ok(SourceConfig {
            pool_address: self.pool_address()?,
            confirmations: self.chain.confirmations,
            max_block_range: self.chain.max_block_range,
            poll_interval: Duration::from_millis(self.chain.poll_interval_ms),
            call_timeout: Duration::from_millis(self.chain.call_timeout_ms),
            queue_capacity: self.chain.queue_capacity,
            max_reconnect_attempts: self.chain.max_reconnect_attempts,
            backoff: self.chain.backoff,
            reorg: self.chain.reorg,
        })
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            max_retries: self.alert.max_retries,
            backoff: self.alert.backoff,
            call_timeout: Duration::from_millis(self.alert.call_timeout_ms),
            explorer_url: self.alert.explorer_url.clone().filter(|u| !u.is_empty()),
        }
    }

    pub fn monitor_config(&self) -> AppResult<MonitorConfig> {
        Ok(MonitorConfig {
            source: self.source_config()?,
            dispatch: self.dispatch_config(),
            redelivery_backoff: self.alert.redelivery_backoff,
            accept_alert_loss_through: self.alert.accept_alert_loss_through,
        })
    }

    /// Telegram notifier when credentials are configured.
    pub fn build_notifier(&self) -> AppResult<Option<DynNotifier>> {
        let Some((token, chat_id)) = self.alert.credentials() else {
            return Ok(None);
        };
        let notifier = TelegramNotifier::new(
            self.alert.api_url.as_str(),
            token,
            chat_id,
            Duration::from_millis(self.alert.call_timeout_ms),
        )?;
        Ok(Some(Arc::new(notifier)))
    }
}
