pub mod cache;
pub mod client;
pub mod collector;
pub mod config;
pub mod error;
pub mod factory;
pub mod http_client;
pub mod interceptor;
pub mod merge;
pub mod model;
pub mod options;
pub mod providers;
pub mod stream;
pub mod telemetry;
#[cfg(test)]
pub mod test_util;

pub use client::{AsyncChatClient, ChatClient, Completion};
pub use error::{ClientError, CoreError, ReportableError};
pub use interceptor::MeteredClient;
pub use options::CallOptions;
