//! Service configuration sourced from environment variables with optional
//! YAML overrides.
use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct Config {
    // Address of the backing document store.
    pub db_address: String,
    // Group whose members administer every controller.
    pub controller_admin_group: String,
    // Cloud used when a request names none.
    pub default_cloud: String,
    // UUID reported to clients for the aggregated controller.
    pub controller_uuid: String,
    // Connections are dropped when no ping arrives within this window.
    pub websocket_ping_timeout: Duration,
    // Monitor lease duration; renewal fires at three quarters of it.
    pub lease_duration: Duration,
    // Back-off between failed dials to a downstream controller.
    pub api_connect_retry: Duration,
    // Number of pooled document-store sessions.
    pub session_pool_size: usize,
    // Bound on concurrent fan-out within a single gateway request.
    pub max_request_concurrency: usize,
    // Replace downstream controller UUIDs with our own in responses.
    pub controller_uuid_masking: bool,
}

#[derive(Debug, Deserialize)]
struct ConfigOverride {
    db_address: Option<String>,
    controller_admin_group: Option<String>,
    default_cloud: Option<String>,
    controller_uuid: Option<String>,
    websocket_ping_timeout_secs: Option<u64>,
    lease_duration_secs: Option<u64>,
    api_connect_retry_secs: Option<u64>,
    session_pool_size: Option<usize>,
    max_request_concurrency: Option<usize>,
    controller_uuid_masking: Option<bool>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_secs(key: &str, default: u64) -> Result<Duration> {
    match std::env::var(key) {
        Ok(value) => {
            let secs: u64 = value.parse().with_context(|| format!("parse {key}"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

fn env_usize(key: &str, default: usize) -> Result<usize> {
    match std::env::var(key) {
        Ok(value) => value.parse().with_context(|| format!("parse {key}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let controller_uuid_masking = match std::env::var("JIMM_CONTROLLER_UUID_MASKING") {
            Ok(value) => value
                .parse()
                .with_context(|| "parse JIMM_CONTROLLER_UUID_MASKING")?,
            Err(_) => true,
        };
        Ok(Self {
            db_address: env_or("JIMM_DB_ADDRESS", "localhost:27017"),
            controller_admin_group: env_or("JIMM_CONTROLLER_ADMIN_GROUP", "controller-admin"),
            default_cloud: env_or("JIMM_DEFAULT_CLOUD", ""),
            controller_uuid: env_or(
                "JIMM_CONTROLLER_UUID",
                "914487b5-60e7-42bb-bd63-1adc3fd3a388",
            ),
            websocket_ping_timeout: env_secs("JIMM_WEBSOCKET_PING_TIMEOUT", 180)?,
            lease_duration: env_secs("JIMM_LEASE_DURATION", 60)?,
            api_connect_retry: env_secs("JIMM_API_CONNECT_RETRY", 5)?,
            session_pool_size: env_usize("JIMM_SESSION_POOL_SIZE", 5)?,
            max_request_concurrency: env_usize("JIMM_MAX_REQUEST_CONCURRENCY", 10)?,
            controller_uuid_masking,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("JIMM_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read JIMM_CONFIG: {path}"))?;
            let override_cfg: ConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse jimm config yaml")?;
            if let Some(value) = override_cfg.db_address {
                config.db_address = value;
            }
            if let Some(value) = override_cfg.controller_admin_group {
                config.controller_admin_group = value;
            }
            if let Some(value) = override_cfg.default_cloud {
                config.default_cloud = value;
            }
            if let Some(value) = override_cfg.controller_uuid {
                config.controller_uuid = value;
            }
            if let Some(value) = override_cfg.websocket_ping_timeout_secs {
                config.websocket_ping_timeout = Duration::from_secs(value);
            }
            if let Some(value) = override_cfg.lease_duration_secs {
                config.lease_duration = Duration::from_secs(value);
            }
            if let Some(value) = override_cfg.api_connect_retry_secs {
                config.api_connect_retry = Duration::from_secs(value);
            }
            if let Some(value) = override_cfg.session_pool_size {
                config.session_pool_size = value;
            }
            if let Some(value) = override_cfg.max_request_concurrency {
                config.max_request_concurrency = value;
            }
            if let Some(value) = override_cfg.controller_uuid_masking {
                config.controller_uuid_masking = value;
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    // Helper to clear all JIMM env vars
    fn clear_jimm_env() {
        for (key, _) in env::vars() {
            if key.starts_with("JIMM_") {
                unsafe {
                    env::remove_var(key);
                }
            }
        }
    }

    #[serial]
    #[test]
    fn from_env_uses_defaults() {
        clear_jimm_env();
        let config = Config::from_env().expect("from_env");
        assert_eq!(config.db_address, "localhost:27017");
        assert_eq!(config.controller_admin_group, "controller-admin");
        assert_eq!(config.lease_duration, Duration::from_secs(60));
        assert_eq!(config.api_connect_retry, Duration::from_secs(5));
        assert_eq!(config.session_pool_size, 5);
        assert_eq!(config.max_request_concurrency, 10);
        assert!(config.controller_uuid_masking);
    }

    #[serial]
    #[test]
    fn from_env_respects_env_vars() {
        clear_jimm_env();
        unsafe {
            env::set_var("JIMM_DB_ADDRESS", "db.internal:27017");
            env::set_var("JIMM_LEASE_DURATION", "120");
            env::set_var("JIMM_CONTROLLER_UUID_MASKING", "false");
        }

        let config = Config::from_env().expect("from_env");
        assert_eq!(config.db_address, "db.internal:27017");
        assert_eq!(config.lease_duration, Duration::from_secs(120));
        assert!(!config.controller_uuid_masking);

        clear_jimm_env();
    }

    #[serial]
    #[test]
    fn from_env_rejects_invalid_duration() {
        clear_jimm_env();
        unsafe {
            env::set_var("JIMM_LEASE_DURATION", "not-a-number");
        }
        assert!(Config::from_env().is_err());
        clear_jimm_env();
    }

    #[serial]
    #[test]
    fn from_env_or_yaml_overrides_with_valid_yaml() {
        clear_jimm_env();
        let tmpdir = TempDir::new().unwrap();
        let config_path = tmpdir.path().join("config.yml");
        fs::write(
            &config_path,
            r#"
db_address: "db.example.com:27017"
default_cloud: "aws"
lease_duration_secs: 30
session_pool_size: 3
"#,
        )
        .unwrap();
        unsafe {
            env::set_var("JIMM_CONFIG", config_path.to_str().unwrap());
        }

        let config = Config::from_env_or_yaml().expect("from_env_or_yaml");
        assert_eq!(config.db_address, "db.example.com:27017");
        assert_eq!(config.default_cloud, "aws");
        assert_eq!(config.lease_duration, Duration::from_secs(30));
        assert_eq!(config.session_pool_size, 3);

        clear_jimm_env();
    }

    #[serial]
    #[test]
    fn from_env_or_yaml_file_not_found_fails() {
        clear_jimm_env();
        let tmpdir = TempDir::new().unwrap();
        let nonexistent = tmpdir.path().join("nonexistent.yml");
        unsafe {
            env::set_var("JIMM_CONFIG", nonexistent.to_str().unwrap());
        }
        assert!(Config::from_env_or_yaml().is_err());
        clear_jimm_env();
    }

    #[serial]
    #[test]
    fn from_env_or_yaml_invalid_yaml_fails() {
        clear_jimm_env();
        let tmpdir = TempDir::new().unwrap();
        let config_path = tmpdir.path().join("bad.yml");
        fs::write(&config_path, "this is not: valid: yaml:").unwrap();
        unsafe {
            env::set_var("JIMM_CONFIG", config_path.to_str().unwrap());
        }
        assert!(Config::from_env_or_yaml().is_err());
        clear_jimm_env();
    }
}
