use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::error::{CoreError, CoreResult};

pub const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com";
pub const DEFAULT_COLLECTOR_BASE: &str = "https://app.openpipe.ai/v1";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ClientCfg {
    #[serde(default = "default_openai_base")]
    pub base_url: String,
    /// Name of the environment variable that contains the API key.
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub organization: Option<String>,
}

impl Default for ClientCfg {
    fn default() -> Self {
        Self {
            base_url: default_openai_base(),
            api_key_env: default_openai_key_env(),
            organization: None,
        }
    }
}

fn default_openai_base() -> String {
    DEFAULT_OPENAI_BASE.to_string()
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CollectorCfg {
    #[serde(default = "default_collector_base")]
    pub base_url: String,
    #[serde(default = "default_collector_key_env")]
    pub api_key_env: String,
}

impl Default for CollectorCfg {
    fn default() -> Self {
        Self {
            base_url: default_collector_base(),
            api_key_env: default_collector_key_env(),
        }
    }
}

fn default_collector_base() -> String {
    DEFAULT_COLLECTOR_BASE.to_string()
}
fn default_collector_key_env() -> String {
    "COLLECTOR_API_KEY".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    #[default]
    None,
    /// In-process replay cache, fed by successful cache-enabled calls.
    Memory,
    /// Ask the collector service's check-cache endpoint.
    Collector,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct CacheCfg {
    #[serde(default)]
    pub backend: CacheBackendKind,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds (default 60000ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub client: ClientCfg,
    /// Where call records go. Without it nothing is reported.
    #[serde(default)]
    pub collector: Option<CollectorCfg>,
    #[serde(default)]
    pub cache: CacheCfg,
    /// HTTP client configuration (timeouts, pooling). Missing in older configs → defaults.
    #[serde(default)]
    pub http: HttpCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| CoreError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| CoreError::Other(e.into()))?
            }
            Some("toml") => toml::from_str::<Self>(s).map_err(|e| CoreError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| CoreError::Other(e.into()))
                .or_else(|_| toml::from_str::<Self>(s).map_err(|e| CoreError::Other(e.into())))?,
        };
        Ok(cfg)
    }

    /// Config taken from the conventional environment variables.
    ///
    /// `OPENAI_BASE_URL` overrides the client base. The collector section is present
    /// when `COLLECTOR_API_KEY` is set (`COLLECTOR_BASE_URL` overrides its base);
    /// otherwise reporting is disabled with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(base) = get("OPENAI_BASE_URL") {
            cfg.client.base_url = base;
        }
        let collector = CollectorCfg::default();
        if get(&collector.api_key_env).is_some() {
            cfg.collector = Some(CollectorCfg {
                base_url: get("COLLECTOR_BASE_URL").unwrap_or(collector.base_url),
                ..collector
            });
        } else {
            tracing::warn!(
                env = %collector.api_key_env,
                "no collector API key set, call reporting disabled"
            );
        }
        cfg
    }
}

/// Read a secret from the named environment variable.
pub fn secret_from_env(var: &str) -> CoreResult<SecretString> {
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(SecretString::new(v.into())),
        _ => Err(CoreError::Config(format!("environment variable {var} is not set"))),
    }
}
