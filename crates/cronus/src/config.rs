use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub server: ServerConfig,
    pub kube: KubeConfig,
    pub cache: CacheConfig,
    pub request: RequestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KubeConfig {
    /// Namespace to watch; `None` watches the whole cluster.
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    pub sync_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestConfig {
    pub timeout_secs: u64,
    pub max_concurrency: usize,
}

impl Config {
    pub fn load() -> crate::Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source, falling back to
    /// defaults for anything unset.
    pub fn from_lookup<F>(lookup: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let config = Config {
            server: ServerConfig {
                addr: lookup("SERVER_ADDR").unwrap_or(defaults.server.addr),
            },
            kube: KubeConfig {
                namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.trim().is_empty()),
            },
            cache: CacheConfig {
                sync_timeout_secs: parse_var(
                    &lookup,
                    "CACHE_SYNC_TIMEOUT_SECS",
                    defaults.cache.sync_timeout_secs,
                )?,
            },
            request: RequestConfig {
                timeout_secs: parse_var(
                    &lookup,
                    "REQUEST_TIMEOUT_SECS",
                    defaults.request.timeout_secs,
                )?,
                max_concurrency: parse_var(
                    &lookup,
                    "MAX_CONCURRENCY",
                    defaults.request.max_concurrency,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(Error::Config("SERVER_ADDR must not be empty".to_string()));
        }
        if self.cache.sync_timeout_secs == 0 {
            return Err(Error::Config(
                "CACHE_SYNC_TIMEOUT_SECS must be greater than zero".to_string(),
            ));
        }
        if self.request.timeout_secs == 0 {
            return Err(Error::Config(
                "REQUEST_TIMEOUT_SECS must be greater than zero".to_string(),
            ));
        }
        if self.request.max_concurrency == 0 {
            return Err(Error::Config(
                "MAX_CONCURRENCY must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache.sync_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request.timeout_secs)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> crate::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {} {:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                addr: "0.0.0.0:8080".to_string(),
            },
            kube: KubeConfig { namespace: None },
            cache: CacheConfig {
                sync_timeout_secs: 30,
            },
            request: RequestConfig {
                timeout_secs: 30,
                max_concurrency: 8,
            },
        }
    }
}
