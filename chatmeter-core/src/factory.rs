use std::sync::Arc;

use secrecy::SecretString;

use crate::cache::{CacheBackend, MemoryCache};
use crate::collector::HttpCollector;
use crate::config::{CacheBackendKind, Config, secret_from_env};
use crate::error::CoreResult;
use crate::http_client::HttpClient;
use crate::interceptor::MeteredClient;
use crate::providers::openai::OpenAiClient;
use crate::telemetry::Collector;

pub type MeteredOpenAi = MeteredClient<OpenAiClient>;

/// Build a metered OpenAI-compatible client from configuration, reading secrets
/// from the environment variables the config names.
pub fn from_config(cfg: &Config) -> CoreResult<MeteredOpenAi> {
    from_config_with(cfg, secret_from_env)
}

/// Like [`from_config`], with secrets resolved by `secret`.
///
/// A missing client key is an error. A missing collector key only disables reporting
/// (and the collector cache), matching how the layer treats every collector failure.
pub fn from_config_with<F>(cfg: &Config, secret: F) -> CoreResult<MeteredOpenAi>
where
    F: Fn(&str) -> CoreResult<SecretString>,
{
    let http = HttpClient::new(&cfg.http)?;
    let api_key = secret(&cfg.client.api_key_env)?;
    let client = OpenAiClient::new(
        http.clone(),
        api_key,
        cfg.client.base_url.clone(),
        cfg.client.organization.clone(),
    );
    let mut metered = MeteredClient::new(client);

    let collector = cfg.collector.as_ref().and_then(|c| match secret(&c.api_key_env) {
        Ok(key) => Some(Arc::new(HttpCollector::new(http.clone(), c.base_url.clone(), key))),
        Err(e) => {
            tracing::warn!(error = %e, "collector key missing, call reporting disabled");
            None
        }
    });
    if let Some(c) = &collector {
        metered = metered.with_collector(c.clone() as Arc<dyn Collector>);
    }

    match cfg.cache.backend {
        CacheBackendKind::None => {}
        CacheBackendKind::Memory => {
            let mem = Arc::new(MemoryCache::new());
            metered = metered
                .with_cache(mem.clone() as Arc<dyn CacheBackend>)
                .with_collector(mem as Arc<dyn Collector>);
        }
        CacheBackendKind::Collector => match collector {
            Some(c) => metered = metered.with_cache(c as Arc<dyn CacheBackend>),
            None => {
                tracing::warn!("collector cache configured without a collector, caching disabled")
            }
        },
    }

    tracing::debug!(
        base = %cfg.client.base_url,
        cache = ?cfg.cache.backend,
        reporter = ?metered.reporter(),
        "metered client ready"
    );
    Ok(metered)
}
