//! Process configuration read from environment variables.

use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    pub database_max_connections: u32,
    pub redis_url: String,
    /// Stream order status notifications are published to
    pub notifications_stream: String,
    /// Consumer group of the notification worker
    pub notifications_group: String,
    /// Max entries per XREADGROUP
    pub notifications_batch: usize,
    /// XREADGROUP block timeout
    pub notifications_block_ms: usize,
    pub history_cache_capacity: usize,
    /// Product catalog calls admitted per second
    pub catalog_rps: u32,
    pub catalog_max_concurrency: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Ok(Self {
            database_url: var("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: parse_or(&var, "DATABASE_MAX_CONNECTIONS", 10)?,
            redis_url: var("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".into()),
            notifications_stream: var("NOTIFICATIONS_STREAM")
                .unwrap_or_else(|| "loms:order-status".into()),
            notifications_group: var("NOTIFICATIONS_GROUP")
                .unwrap_or_else(|| "notifications".into()),
            notifications_batch: parse_or(&var, "NOTIFICATIONS_BATCH", 16)?,
            notifications_block_ms: parse_or(&var, "NOTIFICATIONS_BLOCK_MS", 2000)?,
            history_cache_capacity: parse_or(&var, "HISTORY_CACHE_CAPACITY", 128)?,
            catalog_rps: parse_or(&var, "CATALOG_RPS", 10)?,
            catalog_max_concurrency: parse_or(&var, "CATALOG_MAX_CONCURRENCY", 5)?,
        })
    }
}

fn parse_or<T, F>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        None => Ok(default),
        Some(value) => match value.trim().parse::<T>() {
            Ok(parsed) => Ok(parsed),
            Err(e) => Err(ConfigError::Invalid {
                name,
                reason: e.to_string(),
                value,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_only_database_url_is_set() {
        let config = config(&[("DATABASE_URL", "postgres://localhost/loms")]).unwrap();

        assert_eq!(config.database_url, "postgres://localhost/loms");
        assert_eq!(config.database_max_connections, 10);
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.notifications_stream, "loms:order-status");
        assert_eq!(config.notifications_group, "notifications");
        assert_eq!(config.notifications_batch, 16);
        assert_eq!(config.notifications_block_ms, 2000);
        assert_eq!(config.history_cache_capacity, 128);
        assert_eq!(config.catalog_rps, 10);
        assert_eq!(config.catalog_max_concurrency, 5);
    }

    #[test]
    fn database_url_is_required() {
        assert_eq!(config(&[]), Err(ConfigError::Missing("DATABASE_URL")));
        assert_eq!(
            config(&[("DATABASE_URL", "  ")]),
            Err(ConfigError::Missing("DATABASE_URL"))
        );
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("DATABASE_URL", "postgres://db/loms"),
            ("DATABASE_MAX_CONNECTIONS", "32"),
            ("NOTIFICATIONS_STREAM", "orders"),
            ("CATALOG_RPS", " 20 "),
        ])
        .unwrap();

        assert_eq!(config.database_max_connections, 32);
        assert_eq!(config.notifications_stream, "orders");
        assert_eq!(config.catalog_rps, 20);
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = config(&[("DATABASE_URL", "postgres://db/loms"), ("CATALOG_RPS", "ten")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "CATALOG_RPS", .. }));
    }
}
