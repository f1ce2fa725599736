//! Config loading and validation.
//!
//! Parses the on-disk TOML document and enforces every validation rule a
//! well-formed `Config` must satisfy, so both process startup and
//! `LOADCONFIG` can share it.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::resp::parse_hash_tag;
use crate::router::Distribution;

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_admin_port() -> u16 {
    22222
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub pools: HashMap<String, PoolConfig>,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    pub listen_port: u16,
    #[serde(default)]
    pub backends: Vec<String>,
    #[serde(default)]
    pub cluster_hosts: Vec<String>,
    #[serde(default)]
    pub cluster_name: Option<String>,
    #[serde(default = "default_hash_function")]
    pub hash_function: String,
    #[serde(default)]
    pub hash_tag: String,
    pub timeout_ms: u32,
    pub retry_timeout_ms: u32,
    pub failure_limit: u32,
    #[serde(default)]
    pub auto_eject_hosts: bool,
    pub distribution: Distribution,
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub db: Option<u32>,
}

fn default_hash_function() -> String {
    "crc16".to_string()
}

impl PoolConfig {
    pub fn is_cluster(&self) -> bool {
        matches!(self.distribution, Distribution::Cluster)
    }

    pub fn parsed_hash_tag(&self) -> Option<(u8, u8)> {
        if self.hash_tag.is_empty() {
            None
        } else {
            parse_hash_tag(&self.hash_tag)
        }
    }

    /// Parses a backend address into `(host, port, weight)`, defaulting
    /// weight to 1 when omitted.
    pub fn parsed_backends(&self, pool: &str) -> Result<Vec<(String, u16, u32)>, ConfigError> {
        self.backends
            .iter()
            .map(|addr| parse_backend_address(pool, addr))
            .collect()
    }
}

fn parse_backend_address(pool: &str, addr: &str) -> Result<(String, u16, u32), ConfigError> {
    let bad = || ConfigError::BadBackendAddress {
        pool: pool.to_string(),
        addr: addr.to_string(),
    };
    let mut parts = addr.split(':');
    let host = parts.next().ok_or_else(bad)?;
    let port: u16 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let weight: u32 = match parts.next() {
        Some(w) => w.parse().map_err(|_| bad())?,
        None => 1,
    };
    if parts.next().is_some() || host.is_empty() {
        return Err(bad());
    }
    Ok((host.to_string(), port, weight))
}

/// Reads and validates a config file. Used both at process startup (where a
/// failure is fatal) and by the admin `LOADCONFIG` command (where a failure
/// is reported back over RESP and the active config is left untouched).
pub fn load_from_path(path: &Path) -> Result<Config, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<(), ConfigError> {
    let mut ports_seen: HashMap<u16, String> = HashMap::new();
    for (name, pool) in &config.pools {
        if pool.is_cluster() {
            if !pool.backends.is_empty() {
                return Err(ConfigError::UnexpectedBackends { pool: name.clone() });
            }
            if pool.cluster_hosts.is_empty() || pool.cluster_name.is_none() {
                return Err(ConfigError::MissingClusterFields { pool: name.clone() });
            }
        } else {
            if pool.backends.is_empty() {
                return Err(ConfigError::MissingBackends { pool: name.clone() });
            }
            if !pool.cluster_hosts.is_empty() || pool.cluster_name.is_some() {
                return Err(ConfigError::UnexpectedClusterFields { pool: name.clone() });
            }
            // Every backend address must parse; this also validates
            // cluster_hosts entries below via the same helper.
            pool.parsed_backends(name)?;
        }

        if pool.is_cluster() {
            for host in &pool.cluster_hosts {
                parse_backend_address(name, host)?;
            }
        }

        if !pool.hash_tag.is_empty() && parse_hash_tag(&pool.hash_tag).is_none() {
            return Err(ConfigError::BadHashTag {
                pool: name.clone(),
                tag: pool.hash_tag.clone(),
            });
        }

        if pool.hash_function != "crc16" {
            return Err(ConfigError::UnsupportedHashFunction {
                pool: name.clone(),
                function: pool.hash_function.clone(),
            });
        }

        if let Some(other) = ports_seen.insert(pool.listen_port, name.clone()) {
            return Err(ConfigError::DuplicateListenPort {
                pool: name.clone(),
                other,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fixture(toml: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(toml.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_a_valid_modulo_pool() {
        let f = write_fixture(
            r#"
            [pools.main]
            listen_port = 1533
            backends = ["127.0.0.1:6381", "127.0.0.1:6382"]
            timeout_ms = 200
            retry_timeout_ms = 500
            failure_limit = 3
            distribution = "modulo"
            "#,
        );
        let config = load_from_path(f.path()).unwrap();
        assert_eq!(config.pools["main"].backends.len(), 2);
    }

    #[test]
    fn rejects_non_cluster_pool_missing_backends() {
        let f = write_fixture(
            r#"
            [pools.main]
            listen_port = 1533
            timeout_ms = 200
            retry_timeout_ms = 500
            failure_limit = 3
            distribution = "modulo"
            "#,
        );
        assert!(matches!(
            load_from_path(f.path()),
            Err(ConfigError::MissingBackends { .. })
        ));
    }

    #[test]
    fn rejects_cluster_pool_with_backends() {
        let f = write_fixture(
            r#"
            [pools.main]
            listen_port = 1533
            backends = ["127.0.0.1:6381"]
            cluster_hosts = ["127.0.0.1:7000"]
            cluster_name = "mycluster"
            timeout_ms = 200
            retry_timeout_ms = 500
            failure_limit = 3
            distribution = "cluster"
            "#,
        );
        assert!(matches!(
            load_from_path(f.path()),
            Err(ConfigError::UnexpectedBackends { .. })
        ));
    }

    #[test]
    fn rejects_bad_hash_tag_length() {
        let f = write_fixture(
            r#"
            [pools.main]
            listen_port = 1533
            backends = ["127.0.0.1:6381"]
            hash_tag = "{"
            timeout_ms = 200
            retry_timeout_ms = 500
            failure_limit = 3
            distribution = "modulo"
            "#,
        );
        assert!(matches!(
            load_from_path(f.path()),
            Err(ConfigError::BadHashTag { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_listen_port() {
        let f = write_fixture(
            r#"
            [pools.a]
            listen_port = 1533
            backends = ["127.0.0.1:6381"]
            timeout_ms = 200
            retry_timeout_ms = 500
            failure_limit = 3
            distribution = "modulo"

            [pools.b]
            listen_port = 1533
            backends = ["127.0.0.1:6382"]
            timeout_ms = 200
            retry_timeout_ms = 500
            failure_limit = 3
            distribution = "modulo"
            "#,
        );
        assert!(matches!(
            load_from_path(f.path()),
            Err(ConfigError::DuplicateListenPort { .. })
        ));
    }

    #[test]
    fn parses_backend_address_with_weight() {
        let (host, port, weight) = parse_backend_address("p", "10.0.0.1:6379:2").unwrap();
        assert_eq!((host.as_str(), port, weight), ("10.0.0.1", 6379, 2));
    }

    #[test]
    fn defaults_backend_weight_to_one() {
        let (_, _, weight) = parse_backend_address("p", "10.0.0.1:6379").unwrap();
        assert_eq!(weight, 1);
    }
}
