//! Process configuration for the Limes server.
//!
//! Everything is read from environment variables with sensible defaults. The
//! cluster configuration itself lives in a YAML file whose path is part of
//! this configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// `PostgreSQL` connection string.
    pub database_url: String,
    /// Upper bound for the connection pool.
    pub db_max_connections: u32,
    /// Path to the cluster configuration YAML.
    pub config_path: PathBuf,
    /// Path to the quota constraint YAML, if any.
    pub constraints_path: Option<PathBuf>,
    /// Path to the policy YAML. The built-in policy applies otherwise.
    pub policy_path: Option<PathBuf>,
    /// Path to the JSON-lines audit log, if file audit is enabled.
    pub audit_file_path: Option<PathBuf>,
    /// Log filter used when `RUST_LOG` is not set.
    pub log_level: String,
}

const DEFAULT_PORT: u16 = 8080;

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PORT`: port to bind on, on all interfaces
    /// - `LIMES_BIND_ADDR`: full bind address (overrides `PORT`, default: `127.0.0.1:8080`)
    /// - `DATABASE_URL`: default `postgres://localhost/limes`
    /// - `LIMES_DB_MAX_CONNECTIONS`: default `10`
    /// - `LIMES_CONFIG_PATH`: default `./limes.yaml`
    /// - `LIMES_CONSTRAINTS_PATH`, `LIMES_POLICY_PATH`, `LIMES_AUDIT_FILE`: optional
    /// - `LIMES_LOG_LEVEL`: default `info`
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`Self::from_env`], but reads variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        // Priority: LIMES_BIND_ADDR > PORT > default
        let fallback = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT));
        let bind_addr = if let Some(addr) = non_empty("LIMES_BIND_ADDR") {
            addr.parse().unwrap_or(fallback)
        } else if let Some(port) = non_empty("PORT") {
            SocketAddr::from(([0, 0, 0, 0], port.parse().unwrap_or(DEFAULT_PORT)))
        } else {
            fallback
        };

        Self {
            bind_addr,
            database_url: non_empty("DATABASE_URL").unwrap_or_else(|| "postgres://localhost/limes".to_owned()),
            db_max_connections: non_empty("LIMES_DB_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            config_path: non_empty("LIMES_CONFIG_PATH").map_or_else(|| PathBuf::from("./limes.yaml"), PathBuf::from),
            constraints_path: non_empty("LIMES_CONSTRAINTS_PATH").map(PathBuf::from),
            policy_path: non_empty("LIMES_POLICY_PATH").map(PathBuf::from),
            audit_file_path: non_empty("LIMES_AUDIT_FILE").map(PathBuf::from),
            log_level: non_empty("LIMES_LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = config_from(&[]);
        assert_eq!(config.bind_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.database_url, "postgres://localhost/limes");
        assert_eq!(config.db_max_connections, 10);
        assert_eq!(config.config_path, PathBuf::from("./limes.yaml"));
        assert!(config.constraints_path.is_none());
        assert!(config.audit_file_path.is_none());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn port_binds_all_interfaces_unless_bind_addr_is_set() {
        let config = config_from(&[("PORT", "9000")]);
        assert_eq!(config.bind_addr, "0.0.0.0:9000".parse().unwrap());

        let config = config_from(&[("PORT", "9000"), ("LIMES_BIND_ADDR", "10.0.0.1:1234")]);
        assert_eq!(config.bind_addr, "10.0.0.1:1234".parse().unwrap());
    }

    #[test]
    fn empty_values_count_as_unset() {
        let config = config_from(&[("LIMES_AUDIT_FILE", ""), ("LIMES_DB_MAX_CONNECTIONS", "nope")]);
        assert!(config.audit_file_path.is_none());
        assert_eq!(config.db_max_connections, 10);
    }
}
