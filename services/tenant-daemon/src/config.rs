//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The account password is loaded from the TENANT_PASSWORD env var or
//! password_file, never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use auth::{DEFAULT_CLIENT_ID, DEFAULT_SCOPE, RefreshWindow, TOKEN_PATH};

/// Env var holding the account password
pub const PASSWORD_ENV: &str = "TENANT_PASSWORD";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub remote: RemoteConfig,
    pub account: AccountConfig,
    #[serde(default)]
    pub startup: StartupConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub strategy: Option<StrategyConfig>,
    #[serde(default)]
    pub health: Option<HealthConfig>,
}

/// Remote service endpoints
#[derive(Debug, Deserialize)]
pub struct RemoteConfig {
    pub base_url: String,
    /// Defaults to `base_url` + `/oauth/token`
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

/// The account the daemon operates
#[derive(Debug, Deserialize)]
pub struct AccountConfig {
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_scope")]
    pub scope: String,
    /// Observe only; never act on the account
    #[serde(default)]
    pub dry_run: bool,
    #[serde(skip)]
    pub password: Secret<String>,
    /// Path to a file containing the password (alternative to TENANT_PASSWORD)
    #[serde(default)]
    pub password_file: Option<PathBuf>,
    #[serde(default = "default_secrets_path")]
    pub secrets_path: PathBuf,
}

/// Initial authentication retry budget
#[derive(Debug, Deserialize)]
pub struct StartupConfig {
    #[serde(default = "default_retry_initial")]
    pub retry_initial_secs: u64,
    #[serde(default = "default_retry_budget")]
    pub retry_budget_secs: u64,
}

/// When the credential is refreshed ahead of expiry
#[derive(Debug, Deserialize)]
pub struct RefreshConfig {
    /// Fixed refresh window; overrides the margin/floor/ceiling derivation
    #[serde(default)]
    pub fixed_window_secs: Option<u64>,
    #[serde(default = "default_margin")]
    pub margin_secs: u64,
    #[serde(default = "default_floor")]
    pub floor_secs: u64,
    #[serde(default = "default_ceiling")]
    pub ceiling_secs: u64,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
}

/// Account data refresh cadence
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_balance_interval")]
    pub balance_interval_secs: u64,
    #[serde(default = "default_balance_ttl")]
    pub balance_ttl_secs: u64,
    #[serde(default = "default_restrictions_ttl")]
    pub restrictions_ttl_secs: u64,
    #[serde(default = "default_transactions_interval")]
    pub transactions_interval_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

/// Local strategy file watched for changes
#[derive(Debug, Deserialize)]
pub struct StrategyConfig {
    pub path: PathBuf,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
}

/// Health and metrics endpoint
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_timeout() -> u64 {
    30
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_string()
}

fn default_secrets_path() -> PathBuf {
    PathBuf::from("tenant-secrets.json")
}

fn default_retry_initial() -> u64 {
    1
}

fn default_retry_budget() -> u64 {
    300
}

fn default_margin() -> u64 {
    60
}

fn default_floor() -> u64 {
    60
}

fn default_ceiling() -> u64 {
    240
}

fn default_check_interval() -> u64 {
    30
}

fn default_workers() -> usize {
    4
}

fn default_task_timeout() -> u64 {
    120
}

fn default_balance_interval() -> u64 {
    60
}

fn default_balance_ttl() -> u64 {
    300
}

fn default_restrictions_ttl() -> u64 {
    3600
}

fn default_transactions_interval() -> u64 {
    3600
}

fn default_page_size() -> u32 {
    50
}

fn default_max_connections() -> usize {
    64
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            retry_initial_secs: default_retry_initial(),
            retry_budget_secs: default_retry_budget(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            fixed_window_secs: None,
            margin_secs: default_margin(),
            floor_secs: default_floor(),
            ceiling_secs: default_ceiling(),
            check_interval_secs: default_check_interval(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            task_timeout_secs: default_task_timeout(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            balance_interval_secs: default_balance_interval(),
            balance_ttl_secs: default_balance_ttl(),
            restrictions_ttl_secs: default_restrictions_ttl(),
            transactions_interval_secs: default_transactions_interval(),
            page_size: default_page_size(),
        }
    }
}

impl RemoteConfig {
    pub fn token_url(&self) -> String {
        match &self.token_url {
            Some(url) => url.clone(),
            None => format!("{}{TOKEN_PATH}", self.base_url.trim_end_matches('/')),
        }
    }
}

impl RefreshConfig {
    pub fn window(&self) -> RefreshWindow {
        match self.fixed_window_secs {
            Some(secs) => RefreshWindow::Fixed(Duration::from_secs(secs)),
            None => RefreshWindow::Derived {
                margin: Duration::from_secs(self.margin_secs),
                floor: Duration::from_secs(self.floor_secs),
                ceiling: Duration::from_secs(self.ceiling_secs),
            },
        }
    }
}

fn require_http(field: &str, url: &str) -> common::Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {url}"
        )))
    }
}

fn require_nonzero(field: &str, value: u64) -> common::Result<()> {
    if value == 0 {
        Err(common::Error::Config(format!(
            "{field} must be greater than 0"
        )))
    } else {
        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Password resolution order:
    /// 1. TENANT_PASSWORD env var
    /// 2. password_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        let password = match std::env::var(PASSWORD_ENV) {
            Ok(password) => password,
            Err(_) => match &config.account.password_file {
                Some(file) => std::fs::read_to_string(file)
                    .map_err(|e| {
                        common::Error::Config(format!(
                            "failed to read password_file {}: {e}",
                            file.display()
                        ))
                    })?
                    .trim()
                    .to_owned(),
                None => String::new(),
            },
        };
        if password.is_empty() {
            return Err(common::Error::MissingSecret(format!(
                "set {PASSWORD_ENV} or account.password_file"
            )));
        }
        config.account.password = Secret::new(password);

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        require_http("remote.base_url", &self.remote.base_url)?;
        if let Some(url) = &self.remote.token_url {
            require_http("remote.token_url", url)?;
        }
        require_nonzero("remote.timeout_secs", self.remote.timeout_secs)?;

        if self.account.username.trim().is_empty() {
            return Err(common::Error::Config(
                "account.username must not be empty".into(),
            ));
        }

        require_nonzero("refresh.check_interval_secs", self.refresh.check_interval_secs)?;
        if self.refresh.floor_secs > self.refresh.ceiling_secs {
            return Err(common::Error::Config(format!(
                "refresh.floor_secs ({}) must not exceed refresh.ceiling_secs ({})",
                self.refresh.floor_secs, self.refresh.ceiling_secs
            )));
        }

        require_nonzero("scheduler.workers", self.scheduler.workers as u64)?;
        require_nonzero("scheduler.task_timeout_secs", self.scheduler.task_timeout_secs)?;
        require_nonzero("polling.balance_interval_secs", self.polling.balance_interval_secs)?;
        require_nonzero(
            "polling.transactions_interval_secs",
            self.polling.transactions_interval_secs,
        )?;
        require_nonzero("polling.page_size", u64::from(self.polling.page_size))?;

        if let Some(strategy) = &self.strategy {
            require_nonzero("strategy.check_interval_secs", strategy.check_interval_secs)?;
        }
        if let Some(health) = &self.health {
            require_nonzero("health.max_connections", health.max_connections as u64)?;
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("tenant-daemon.toml")
    }
}
