// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use waypoint_core::config::ConfigError;

/// Database connection settings
#[derive(Debug, Clone)]
pub struct SqlConfig {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Maximum pool connections
    pub max_connections: u32,
}

impl SqlConfig {
    /// Settings for `database_url` with the default pool size.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 5,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `WAYPOINT_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `WAYPOINT_MAX_CONNECTIONS`: Pool size (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("WAYPOINT_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("WAYPOINT_DATABASE_URL"))?;

        let max_connections: u32 = std::env::var("WAYPOINT_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("WAYPOINT_MAX_CONNECTIONS", "must be a positive integer")
            })?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid(
                "WAYPOINT_MAX_CONNECTIONS",
                "must be a positive integer",
            ));
        }

        Ok(Self {
            database_url,
            max_connections,
        })
    }

    /// Whether the URL points at SQLite.
    pub fn is_sqlite(&self) -> bool {
        self.database_url.starts_with("sqlite:")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_detection() {
        assert!(SqlConfig::new("sqlite:.data/waypoint.db?mode=rwc").is_sqlite());
        assert!(!SqlConfig::new("postgres://localhost/waypoint").is_sqlite());
        assert_eq!(SqlConfig::new("sqlite::memory:").max_connections, 5);
    }
}
