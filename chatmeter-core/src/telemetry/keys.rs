/// Span field names for metered calls.
/// Keep these stable; log pipelines filter on them.
pub const KEY_FINGERPRINT: &str = "call.fingerprint";
pub const KEY_CACHE_STATUS: &str = "call.cache";
pub const KEY_STREAMED: &str = "call.streamed";
pub const KEY_STATUS_CODE: &str = "call.status";
pub const KEY_LATENCY_MS: &str = "call.latency_ms";

/// Reserved collector tags, added on top of caller tags.
pub const TAG_CACHE: &str = "$cache";
pub const TAG_SDK: &str = "$sdk";
pub const TAG_SDK_VERSION: &str = "$sdk.version";
