//! Per-call metering options.
//!
//! Options travel beside the request payload and are never forwarded to the
//! wrapped client. Callers either pass them explicitly or embed them in the
//! payload under [`OPTIONS_KEY`]; embedded options are stripped before the call.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::RequestPayload;
use crate::telemetry::keys::{TAG_CACHE, TAG_SDK, TAG_SDK_VERSION};

/// Payload key under which callers may embed [`CallOptions`].
pub const OPTIONS_KEY: &str = "meter";

const SDK_NAME: &str = "rust";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct CallOptions {
    /// Consult the cache before calling the client.
    #[serde(default)]
    pub cache: bool,
    /// Free-form labels forwarded to the collector; used for routing and filtering.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Overrides the payload-derived cache fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl CallOptions {
    pub fn cached() -> Self {
        Self {
            cache: true,
            ..Default::default()
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn fingerprint(mut self, fp: impl Into<String>) -> Self {
        self.fingerprint = Some(fp.into());
        self
    }

    /// Tags as sent to the collector: caller tags plus the reserved `$`-prefixed ones.
    pub fn effective_tags(&self) -> BTreeMap<String, String> {
        let mut tags = self.tags.clone();
        if self.cache {
            tags.insert(TAG_CACHE.to_string(), "true".to_string());
        }
        tags.insert(TAG_SDK.to_string(), SDK_NAME.to_string());
        tags.insert(
            TAG_SDK_VERSION.to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        tags
    }

    /// Cache key for `payload`: the explicit fingerprint when set, else a content hash.
    pub fn fingerprint_for(&self, payload: &RequestPayload) -> String {
        match &self.fingerprint {
            Some(fp) => fp.clone(),
            None => fingerprint(payload),
        }
    }
}

/// SHA-256 over the canonical JSON form of the payload, hex encoded.
pub fn fingerprint(payload: &RequestPayload) -> String {
    let canonical = serde_json::to_vec(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    format!("{:x}", hasher.finalize())
}

/// Strip embedded options from `payload` and resolve the options for this call.
///
/// An explicit `options` argument wins over the embedded bundle. A malformed
/// embedded bundle is discarded and defaults apply.
pub fn split_options(
    mut payload: RequestPayload,
    options: Option<CallOptions>,
) -> (RequestPayload, CallOptions) {
    let embedded = payload.remove(OPTIONS_KEY).and_then(|raw| {
        serde_json::from_value::<CallOptions>(raw)
            .map_err(|e| tracing::warn!(error = %e, "ignoring malformed embedded call options"))
            .ok()
    });
    let resolved = options.or(embedded).unwrap_or_default();
    (payload, resolved)
}
