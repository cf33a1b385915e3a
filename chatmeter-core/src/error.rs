use thiserror::Error;

/// Errors raised by the metering layer's own collaborators (collector, cache, config).
/// These never reach the caller of a metered call; the interceptor swallows and logs them.
/// Public setup APIs (config loading, client construction) return `CoreResult<T>`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("collector request failed: {status:?} {message}")]
    Collector {
        status: Option<u16>,
        message: String,
    },

    #[error("cache lookup failed: {0}")]
    Cache(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Error raised by the bundled OpenAI-compatible client.
///
/// `Api` is the recognized error shape (HTTP status plus body); everything else
/// is reported to the collector with a message only.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{message}")]
    Api {
        status: u16,
        message: String,
        body: Option<serde_json::Value>,
        retry_after: Option<u64>,
    },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("decode error: {0}")]
    Decode(String),

    /// Error event sent inside an otherwise successful event stream.
    #[error("stream error: {0}")]
    Stream(String),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// What the interceptor needs to know about a wrapped client's error in order
/// to report it. The error value itself is handed back to the caller untouched.
pub trait ReportableError: std::error::Error {
    /// HTTP-like status of a recognized API error. `None` marks an unrecognized error.
    fn status_code(&self) -> Option<u16> {
        None
    }

    /// Structured body returned alongside a recognized API error.
    fn body(&self) -> Option<serde_json::Value> {
        None
    }
}

impl ReportableError for ClientError {
    fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn body(&self) -> Option<serde_json::Value> {
        match self {
            Self::Api { body, .. } => body.clone(),
            _ => None,
        }
    }
}

impl From<ClientError> for CoreError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Api {
                status, message, ..
            } => CoreError::Collector {
                status: Some(status),
                message,
            },
            other => CoreError::Collector {
                status: None,
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn api_error_is_recognized() {
        let err = ClientError::Api {
            status: 429,
            message: "rate limited".into(),
            body: Some(json!({"error": "rate_limited"})),
            retry_after: None,
        };
        assert_eq!(err.status_code(), Some(429));
        assert_eq!(err.body(), Some(json!({"error": "rate_limited"})));
        assert_eq!(err.to_string(), "rate limited");
    }

    #[test]
    fn transport_errors_are_unrecognized() {
        let err = ClientError::Connection("refused".into());
        assert_eq!(err.status_code(), None);
        assert_eq!(err.body(), None);
    }

    #[test]
    fn client_error_maps_into_collector_failure() {
        let err: CoreError = ClientError::Api {
            status: 401,
            message: "bad key".into(),
            body: None,
            retry_after: None,
        }
        .into();
        match err {
            CoreError::Collector { status, message } => {
                assert_eq!(status, Some(401));
                assert_eq!(message, "bad key");
            }
            other => panic!("expected Collector error, got {other:?}"),
        }
    }
}
