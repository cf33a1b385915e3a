//! Call telemetry: the record type, the collector capability, and the reporter
//! that fans a record out to every installed collector.
//!
//! Reporting never fails the metered call. Collector errors are logged and dropped.

pub mod keys;
pub mod types;
#[cfg(test)]
pub mod test_span;

pub use keys::*;
pub use types::*;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CoreResult;

/// Destination for call records.
///
/// Requirements:
/// - Implementations must be thread-safe (`Send + Sync`).
/// - `send` may block; it is only called from the synchronous call path.
/// - `send_async` defaults to `send`; override it when the collector does I/O.
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;

    fn send(&self, record: &CallRecord) -> CoreResult<()>;

    async fn send_async(&self, record: &CallRecord) -> CoreResult<()> {
        self.send(record)
    }
}

/// Delivers each call record to all collectors, swallowing their failures.
#[derive(Clone, Default)]
pub struct Reporter {
    collectors: Vec<Arc<dyn Collector>>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collector(mut self, collector: Arc<dyn Collector>) -> Self {
        self.collectors.push(collector);
        self
    }

    pub fn add(&mut self, collector: Arc<dyn Collector>) {
        self.collectors.push(collector);
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    pub fn report(&self, record: &CallRecord) {
        for collector in &self.collectors {
            if let Err(e) = collector.send(record) {
                tracing::warn!(collector = collector.name(), error = %e, "call report dropped");
            }
        }
    }

    pub async fn report_async(&self, record: &CallRecord) {
        for collector in &self.collectors {
            if let Err(e) = collector.send_async(record).await {
                tracing::warn!(collector = collector.name(), error = %e, "call report dropped");
            }
        }
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.collectors.iter().map(|c| c.name()).collect();
        f.debug_struct("Reporter").field("collectors", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatCompletion, RequestPayload};
    use crate::options::CallOptions;
    use crate::test_util::{FailingCollector, RecordingCollector};

    fn record() -> CallRecord {
        CallRecord::success(
            CallOptions::default(),
            1,
            2,
            RequestPayload::default(),
            Some(&ChatCompletion::default()),
        )
    }

    #[test]
    fn delivers_to_every_collector_despite_failures() {
        let first = Arc::new(RecordingCollector::default());
        let second = Arc::new(RecordingCollector::default());
        let reporter = Reporter::new()
            .with_collector(first.clone())
            .with_collector(Arc::new(FailingCollector))
            .with_collector(second.clone());

        reporter.report(&record());
        assert_eq!(first.records().len(), 1);
        assert_eq!(second.records().len(), 1);
    }

    #[test]
    fn failed_send_is_logged_not_raised() {
        let store = test_span::install_capture();
        let reporter = Reporter::new().with_collector(Arc::new(FailingCollector));
        reporter.report(&record());

        let events = store.events_named("call report dropped");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("collector").map(String::as_str), Some("\"failing\""));
    }

    #[tokio::test]
    async fn async_report_uses_async_send() {
        let sink = Arc::new(RecordingCollector::default());
        let reporter = Reporter::new()
            .with_collector(Arc::new(FailingCollector))
            .with_collector(sink.clone());
        reporter.report_async(&record()).await;
        assert_eq!(sink.records(), vec![record()]);
        assert_eq!(sink.async_sends(), 1);
    }

    #[test]
    fn debug_lists_collector_names() {
        let reporter = Reporter::new().with_collector(Arc::new(FailingCollector));
        assert_eq!(format!("{reporter:?}"), "Reporter { collectors: [\"failing\"] }");
    }
}
