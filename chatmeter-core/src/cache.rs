//! Response cache lookup in front of the wrapped client.
//!
//! The gateway only ever answers "hit" or "not a hit": a disabled cache, a missing
//! entry and a failing backend all let the call proceed to the client.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{CoreError, CoreResult};
use crate::model::{ChatCompletion, RequestPayload};
use crate::options::CallOptions;
use crate::telemetry::{CallRecord, Collector};

/// Everything a backend may key a lookup on.
#[derive(Debug, Clone, Copy)]
pub struct CacheQuery<'a> {
    pub fingerprint: &'a str,
    pub payload: &'a RequestPayload,
    pub tags: &'a BTreeMap<String, String>,
    pub requested_at: u64,
}

/// Storage that can replay a previously recorded response.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self, query: &CacheQuery<'_>) -> CoreResult<Option<ChatCompletion>>;

    async fn get_async(&self, query: &CacheQuery<'_>) -> CoreResult<Option<ChatCompletion>> {
        self.get(query)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    /// Caching was not requested for this call, or no backend is installed.
    Skip,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Skip => "skip",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(ChatCompletion),
    Miss,
    Skip,
}

impl CacheLookup {
    pub fn status(&self) -> CacheStatus {
        match self {
            Self::Hit(_) => CacheStatus::Hit,
            Self::Miss => CacheStatus::Miss,
            Self::Skip => CacheStatus::Skip,
        }
    }

    pub fn into_hit(self) -> Option<ChatCompletion> {
        match self {
            Self::Hit(resp) => Some(resp),
            _ => None,
        }
    }
}

/// Consults an optional backend on behalf of the interceptor.
#[derive(Clone, Default)]
pub struct CacheGateway {
    backend: Option<std::sync::Arc<dyn CacheBackend>>,
}

impl CacheGateway {
    pub fn new(backend: std::sync::Arc<dyn CacheBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Previously stored response for this request, if caching applies and one exists.
    pub fn lookup(
        &self,
        options: &CallOptions,
        payload: &RequestPayload,
    ) -> Option<ChatCompletion> {
        self.check(options, payload, crate::telemetry::now_ms()).into_hit()
    }

    pub async fn lookup_async(
        &self,
        options: &CallOptions,
        payload: &RequestPayload,
    ) -> Option<ChatCompletion> {
        self.check_async(options, payload, crate::telemetry::now_ms())
            .await
            .into_hit()
    }

    pub fn check(
        &self,
        options: &CallOptions,
        payload: &RequestPayload,
        requested_at: u64,
    ) -> CacheLookup {
        let Some(backend) = self.backend_for(options) else {
            return CacheLookup::Skip;
        };
        let fingerprint = options.fingerprint_for(payload);
        let tags = options.effective_tags();
        let query = CacheQuery {
            fingerprint: &fingerprint,
            payload,
            tags: &tags,
            requested_at,
        };
        settle(backend.name(), &fingerprint, backend.get(&query))
    }

    pub async fn check_async(
        &self,
        options: &CallOptions,
        payload: &RequestPayload,
        requested_at: u64,
    ) -> CacheLookup {
        let Some(backend) = self.backend_for(options) else {
            return CacheLookup::Skip;
        };
        let fingerprint = options.fingerprint_for(payload);
        let tags = options.effective_tags();
        let query = CacheQuery {
            fingerprint: &fingerprint,
            payload,
            tags: &tags,
            requested_at,
        };
        settle(backend.name(), &fingerprint, backend.get_async(&query).await)
    }

    fn backend_for(&self, options: &CallOptions) -> Option<&dyn CacheBackend> {
        let backend = self.backend.as_deref().filter(|_| options.cache);
        if backend.is_none() {
            tracing::debug!(requested = options.cache, "cache skipped");
        }
        backend
    }
}

fn settle(
    backend: &str,
    fingerprint: &str,
    result: CoreResult<Option<ChatCompletion>>,
) -> CacheLookup {
    match result {
        Ok(Some(resp)) => {
            tracing::debug!(backend, fingerprint, "cache hit");
            CacheLookup::Hit(resp)
        }
        Ok(None) => CacheLookup::Miss,
        Err(e) => {
            tracing::warn!(
                backend,
                fingerprint,
                error = %e,
                "cache lookup failed, treating as miss"
            );
            CacheLookup::Miss
        }
    }
}

impl std::fmt::Debug for CacheGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheGateway")
            .field("backend", &self.backend.as_ref().map(|b| b.name()))
            .finish()
    }
}

/// In-process replay cache keyed by fingerprint.
///
/// Also acts as a collector: successful calls made with caching enabled are stored,
/// so a later identical call is answered without reaching the client.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, ChatCompletion>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        fingerprint: impl Into<String>,
        response: ChatCompletion,
    ) -> CoreResult<()> {
        self.entries
            .write()
            .map_err(|_| CoreError::Cache("memory cache lock poisoned".into()))?
            .insert(fingerprint.into(), response);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, query: &CacheQuery<'_>) -> CoreResult<Option<ChatCompletion>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| CoreError::Cache("memory cache lock poisoned".into()))?;
        Ok(entries.get(query.fingerprint).cloned())
    }
}

#[async_trait]
impl Collector for MemoryCache {
    fn name(&self) -> &str {
        "memory"
    }

    fn send(&self, record: &CallRecord) -> CoreResult<()> {
        if !record.options.cache {
            return Ok(());
        }
        match record.response() {
            Some(resp) => self.insert(record.fingerprint(), resp),
            None => Ok(()),
        }
    }
}
