// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use uuid::Uuid;

use crate::lock::LockOptions;

/// Default key of the execution lock.
pub const DEFAULT_LOCK_KEY: &str = "waypoint-lock";

/// Default stage id used when a pipeline does not name one.
pub const DEFAULT_STAGE: &str = "default";

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Key of the lease lock shared by all runners of this pipeline
    pub lock_key: String,
    /// Lease time-to-live
    pub lease_ttl: Duration,
    /// How long `acquire` keeps retrying before giving up
    pub lock_acquire_timeout: Duration,
    /// Pause between acquire attempts
    pub lock_retry_interval: Duration,
    /// Whether the renewal daemon keeps the lease alive while changes run
    pub lock_renewal: bool,
    /// Identity of this runner, stored as the lock owner
    pub runner_id: String,
    /// Stage id recorded in audit entries
    pub default_stage: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_key: DEFAULT_LOCK_KEY.to_string(),
            lease_ttl: Duration::from_secs(60),
            lock_acquire_timeout: Duration::from_secs(180),
            lock_retry_interval: Duration::from_secs(1),
            lock_renewal: true,
            runner_id: default_runner_id(),
            default_stage: DEFAULT_STAGE.to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `WAYPOINT_LOCK_KEY`: Lock key (default: waypoint-lock)
    /// - `WAYPOINT_LOCK_LEASE_MS`: Lease TTL in milliseconds (default: 60000)
    /// - `WAYPOINT_LOCK_ACQUIRE_TIMEOUT_MS`: Give up acquiring after this long (default: 180000)
    /// - `WAYPOINT_LOCK_RETRY_INTERVAL_MS`: Pause between acquire attempts (default: 1000)
    /// - `WAYPOINT_LOCK_RENEWAL`: Run the renewal daemon (default: true)
    /// - `WAYPOINT_RUNNER_ID`: Runner identity (default: hostname plus a random suffix)
    /// - `WAYPOINT_DEFAULT_STAGE`: Stage id for audit entries (default: default)
    pub fn from_env() -> Result<Self, ConfigError> {
        let lock_key =
            std::env::var("WAYPOINT_LOCK_KEY").unwrap_or_else(|_| DEFAULT_LOCK_KEY.to_string());

        let lease_ms: u64 = std::env::var("WAYPOINT_LOCK_LEASE_MS")
            .unwrap_or_else(|_| "60000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("WAYPOINT_LOCK_LEASE_MS", "must be a positive integer")
            })?;
        if lease_ms == 0 {
            return Err(ConfigError::Invalid(
                "WAYPOINT_LOCK_LEASE_MS",
                "must be a positive integer",
            ));
        }

        let acquire_timeout_ms: u64 = std::env::var("WAYPOINT_LOCK_ACQUIRE_TIMEOUT_MS")
            .unwrap_or_else(|_| "180000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "WAYPOINT_LOCK_ACQUIRE_TIMEOUT_MS",
                    "must be a non-negative integer",
                )
            })?;

        let retry_interval_ms: u64 = std::env::var("WAYPOINT_LOCK_RETRY_INTERVAL_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "WAYPOINT_LOCK_RETRY_INTERVAL_MS",
                    "must be a non-negative integer",
                )
            })?;

        let lock_renewal = match std::env::var("WAYPOINT_LOCK_RENEWAL") {
            Ok(value) => parse_bool(&value)
                .ok_or(ConfigError::Invalid("WAYPOINT_LOCK_RENEWAL", "must be true or false"))?,
            Err(_) => true,
        };

        let runner_id = std::env::var("WAYPOINT_RUNNER_ID").unwrap_or_else(|_| default_runner_id());
        if runner_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "WAYPOINT_RUNNER_ID",
                "must not be empty",
            ));
        }

        let default_stage =
            std::env::var("WAYPOINT_DEFAULT_STAGE").unwrap_or_else(|_| DEFAULT_STAGE.to_string());

        Ok(Self {
            lock_key,
            lease_ttl: Duration::from_millis(lease_ms),
            lock_acquire_timeout: Duration::from_millis(acquire_timeout_ms),
            lock_retry_interval: Duration::from_millis(retry_interval_ms),
            lock_renewal,
            runner_id,
            default_stage,
        })
    }

    /// Set the lock key.
    pub fn with_lock_key(mut self, key: impl Into<String>) -> Self {
        self.lock_key = key.into();
        self
    }

    /// Set the lease TTL.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Set how long to keep retrying lock acquisition.
    pub fn with_lock_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquire_timeout = timeout;
        self
    }

    /// Set the pause between acquire attempts.
    pub fn with_lock_retry_interval(mut self, interval: Duration) -> Self {
        self.lock_retry_interval = interval;
        self
    }

    /// Enable or disable the renewal daemon.
    pub fn with_lock_renewal(mut self, enabled: bool) -> Self {
        self.lock_renewal = enabled;
        self
    }

    /// Set the runner identity.
    pub fn with_runner_id(mut self, runner_id: impl Into<String>) -> Self {
        self.runner_id = runner_id.into();
        self
    }

    /// Lock acquisition parameters derived from this configuration.
    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            key: self.lock_key.clone(),
            owner_id: self.runner_id.clone(),
            ttl: self.lease_ttl,
            acquire_timeout: self.lock_acquire_timeout,
            retry_interval: self.lock_retry_interval,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

/// Hostname of this machine, or `unknown` when it cannot be read.
pub fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn default_runner_id() -> String {
    format!("{}#{}", local_hostname(), Uuid::new_v4())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
