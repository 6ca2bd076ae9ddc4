//! Global configuration parsing and validation.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::operation::ConfirmStrategy;
use crate::{AppError, Result};

/// Interactive confirmation settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConfirmationConfig {
    /// Seconds a pending confirmation waits for a decision before expiring.
    #[serde(default = "default_confirmation_seconds")]
    pub timeout_seconds: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_confirmation_seconds(),
        }
    }
}

impl ConfirmationConfig {
    /// Confirmation window as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Operation confirmation engine settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct OperationsConfig {
    /// Node RPC base URL used by the block-scanning poll.
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// Chain identifier inserted into RPC paths.
    #[serde(default = "default_chain")]
    pub chain: String,
    /// Which discovery strategies run.
    #[serde(default)]
    pub strategy: ConfirmStrategy,
    /// Delay between poll passes.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Overall bound measured from the first attempt.
    #[serde(default = "default_operation_seconds")]
    pub timeout_seconds: u64,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            chain: default_chain(),
            strategy: ConfirmStrategy::default(),
            poll_interval_ms: default_poll_interval_ms(),
            timeout_seconds: default_operation_seconds(),
        }
    }
}

impl OperationsConfig {
    /// Poll interval as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Overall confirmation bound as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_confirmation_seconds() -> u64 {
    300
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8732".into()
}

fn default_chain() -> String {
    "main".into()
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_operation_seconds() -> u64 {
    300
}

fn default_ipc_name() -> String {
    "vault-intercom".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Named pipe / Unix socket identifier.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Interactive confirmation settings.
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    /// Operation confirmation settings.
    #[serde(default)]
    pub operations: OperationsConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.ipc_name.trim().is_empty() {
            return Err(AppError::Config("ipc_name must not be empty".into()));
        }

        if self.confirmation.timeout_seconds == 0 {
            return Err(AppError::Config(
                "confirmation.timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.operations.timeout_seconds == 0 {
            return Err(AppError::Config(
                "operations.timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.operations.poll_interval_ms == 0 {
            return Err(AppError::Config(
                "operations.poll_interval_ms must be greater than zero".into(),
            ));
        }

        if !self.operations.rpc_url.starts_with("http://")
            && !self.operations.rpc_url.starts_with("https://")
        {
            return Err(AppError::Config(format!(
                "operations.rpc_url must be an http(s) url, got '{}'",
                self.operations.rpc_url
            )));
        }

        Ok(())
    }
}
