//! Metered stream decorators.
//!
//! Contract:
//! - Every item of the wrapped stream is handed to the caller unchanged, in order,
//!   as soon as it is pulled. Nothing is buffered.
//! - `Ok` chunks are folded into a call-local assembly as they pass.
//! - The call is reported exactly once: on exhaustion (success, with the assembly)
//!   or on the first `Err` item (failure, with the partial assembly). Later items
//!   pass through unmetered.
//! - A stream dropped before either point reports nothing.
//!
//! - Once end-of-stream has been handed out, the stream stays ended without polling
//!   the inner stream again.
//!
//! State machine: `Active` → `Draining` → `Reported` (after an error item) or
//! `Finished` (after the end). The blocking iterator reports inline, so its
//! `Draining` step is the report call itself.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use tracing::Span;

use crate::error::ReportableError;
use crate::interceptor::PendingReport;
use crate::merge::merge_chunk;
use crate::model::{ChatCompletion, ChatCompletionChunk};

enum State {
    Active {
        pending: PendingReport,
        acc: Option<ChatCompletion>,
    },
    /// Reported on an error item; later items are forwarded as they come.
    Reported,
    /// Reported on exhaustion; the inner iterator is not polled again.
    Finished,
}

impl State {
    fn absorb(&mut self, chunk: &ChatCompletionChunk) {
        if let State::Active { acc, .. } = self {
            *acc = Some(merge_chunk(acc.take(), chunk));
        }
    }

    /// Leave `Active`, handing back what is needed to build the report.
    fn settle(&mut self, next: State) -> Option<(PendingReport, Option<ChatCompletion>)> {
        match std::mem::replace(self, next) {
            State::Active { pending, acc } => Some((pending, acc)),
            done => {
                *self = done;
                None
            }
        }
    }

    fn note_if_unreported(&self) {
        if let State::Active { pending, .. } = self {
            pending.note_dropped();
        }
    }
}

/// Blocking metered stream over an iterator of chunk results.
pub struct MeteredStream<S> {
    inner: S,
    state: State,
}

impl<S> MeteredStream<S> {
    pub(crate) fn new(inner: S, pending: PendingReport) -> Self {
        Self {
            inner,
            state: State::Active { pending, acc: None },
        }
    }

    /// True once the call has been reported.
    pub fn is_reported(&self) -> bool {
        !matches!(self.state, State::Active { .. })
    }
}

impl<S, E> Iterator for MeteredStream<S>
where
    S: Iterator<Item = Result<ChatCompletionChunk, E>>,
    E: ReportableError,
{
    type Item = Result<ChatCompletionChunk, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.state, State::Finished) {
            return None;
        }
        match self.inner.next() {
            Some(Ok(chunk)) => {
                self.state.absorb(&chunk);
                Some(Ok(chunk))
            }
            Some(Err(e)) => {
                if let Some((pending, acc)) = self.state.settle(State::Reported) {
                    pending.fail(&e, acc.as_ref()).report();
                }
                Some(Err(e))
            }
            None => {
                if let Some((pending, acc)) = self.state.settle(State::Finished) {
                    pending.succeed(acc.as_ref()).report();
                }
                None
            }
        }
    }
}

impl<S> Drop for MeteredStream<S> {
    fn drop(&mut self) {
        self.state.note_if_unreported();
    }
}

impl<S> std::fmt::Debug for MeteredStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteredStream")
            .field("reported", &self.is_reported())
            .finish_non_exhaustive()
    }
}

enum AsyncState<T> {
    Active {
        pending: PendingReport,
        acc: Option<ChatCompletion>,
    },
    /// Report in flight; `held` is the item to release once it completes (`None` = end).
    Draining {
        report: BoxFuture<'static, ()>,
        held: Option<T>,
        span: Span,
    },
    /// Reported on an error item; later items are forwarded as they come.
    Reported,
    /// End of stream released; the inner stream is not polled again.
    Finished,
}

/// Async metered stream over a `futures::Stream` of chunk results.
///
/// The report is awaited inside `poll_next` before the terminal item is released,
/// so the caller sees end-of-stream only after delivery was attempted.
pub struct MeteredAsyncStream<S: Stream> {
    inner: S,
    state: AsyncState<S::Item>,
}

// `inner` is Unpin and `held` is never pinned.
impl<S: Stream + Unpin> Unpin for MeteredAsyncStream<S> {}

impl<S: Stream> MeteredAsyncStream<S> {
    pub(crate) fn new(inner: S, pending: PendingReport) -> Self {
        Self {
            inner,
            state: AsyncState::Active { pending, acc: None },
        }
    }

    pub fn is_reported(&self) -> bool {
        matches!(self.state, AsyncState::Reported | AsyncState::Finished)
    }
}

impl<S, E> Stream for MeteredAsyncStream<S>
where
    S: Stream<Item = Result<ChatCompletionChunk, E>> + Unpin,
    E: ReportableError,
{
    type Item = Result<ChatCompletionChunk, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let current = std::mem::replace(&mut this.state, AsyncState::Reported);
            let (pending, mut acc) = match current {
                AsyncState::Draining {
                    mut report,
                    held,
                    span,
                } => {
                    if report.poll_unpin(cx).is_pending() {
                        this.state = AsyncState::Draining { report, held, span };
                        return Poll::Pending;
                    }
                    if held.is_none() {
                        this.state = AsyncState::Finished;
                    }
                    return Poll::Ready(held);
                }
                AsyncState::Finished => {
                    this.state = AsyncState::Finished;
                    return Poll::Ready(None);
                }
                AsyncState::Reported => return Pin::new(&mut this.inner).poll_next(cx),
                AsyncState::Active { pending, acc } => (pending, acc),
            };

            let item = match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Pending => {
                    this.state = AsyncState::Active { pending, acc };
                    return Poll::Pending;
                }
                Poll::Ready(item) => item,
            };

            match item {
                Some(Ok(chunk)) => {
                    acc = Some(merge_chunk(acc.take(), &chunk));
                    this.state = AsyncState::Active { pending, acc };
                    return Poll::Ready(Some(Ok(chunk)));
                }
                Some(Err(e)) => {
                    let settled = pending.fail(&e, acc.as_ref());
                    this.state = AsyncState::Draining {
                        span: settled.span().clone(),
                        report: settled.report_async(),
                        held: Some(Err(e)),
                    };
                }
                None => {
                    let settled = pending.succeed(acc.as_ref());
                    this.state = AsyncState::Draining {
                        span: settled.span().clone(),
                        report: settled.report_async(),
                        held: None,
                    };
                }
            }
        }
    }
}

impl<S: Stream> Drop for MeteredAsyncStream<S> {
    fn drop(&mut self) {
        match &self.state {
            AsyncState::Active { pending, .. } => pending.note_dropped(),
            AsyncState::Draining { span, .. } => {
                let _entered = span.enter();
                tracing::debug!("stream dropped while its report was in flight, report abandoned");
            }
            AsyncState::Reported | AsyncState::Finished => {}
        }
    }
}

impl<S: Stream> std::fmt::Debug for MeteredAsyncStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteredAsyncStream")
            .field("reported", &self.is_reported())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::options::CallOptions;
    use crate::telemetry::{CallRecord, Collector, Reporter, now_ms, test_span};
    use crate::test_util::{FakeError, RecordingCollector, chunk, payload, rate_limited};
    use futures::StreamExt;
    use serde_json::json;

    fn pending(sink: Arc<RecordingCollector>) -> PendingReport {
        PendingReport::new(
            CallOptions::default(),
            now_ms(),
            payload(json!({"model": "gpt-4o", "stream": true})),
            Arc::new(Reporter::new().with_collector(sink)),
            tracing::Span::none(),
        )
    }

    #[test]
    fn items_after_the_first_error_pass_through_unmetered() {
        let sink = Arc::new(RecordingCollector::default());
        let items: Vec<Result<ChatCompletionChunk, FakeError>> = vec![
            Err(FakeError::Boom("first".into())),
            Ok(chunk(0, "ignored")),
            Err(rate_limited()),
        ];
        let seen: Vec<_> =
            MeteredStream::new(items.clone().into_iter(), pending(sink.clone())).collect();

        assert_eq!(seen, items);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].error_message.as_deref(), Some("first"));
        assert_eq!(records[0].resp_payload, None);
    }

    #[test]
    fn chunks_are_folded_by_choice_index() {
        let sink = Arc::new(RecordingCollector::default());
        let items: Vec<Result<ChatCompletionChunk, FakeError>> =
            vec![Ok(chunk(1, "b")), Ok(chunk(0, "a")), Ok(chunk(1, "c"))];
        MeteredStream::new(items.into_iter(), pending(sink.clone())).for_each(drop);

        let resp = sink.records()[0].response().unwrap();
        let texts: Vec<_> = resp
            .choices
            .iter()
            .map(|c| (c.index, c.message.content.clone().unwrap_or_default()))
            .collect();
        assert_eq!(texts, vec![(0, "a".to_string()), (1, "bc".to_string())]);
    }

    #[tokio::test]
    async fn end_of_stream_is_released_after_the_report_lands() {
        let sink = Arc::new(RecordingCollector::default());
        let items: Vec<Result<ChatCompletionChunk, FakeError>> = vec![Ok(chunk(0, "x"))];
        let mut stream =
            MeteredAsyncStream::new(futures::stream::iter(items), pending(sink.clone()));

        assert!(stream.next().await.is_some());
        assert!(!stream.is_reported());
        assert!(stream.next().await.is_none());
        assert!(stream.is_reported());
        assert_eq!(sink.async_sends(), 1);
        assert_eq!(format!("{stream:?}"), "MeteredAsyncStream { reported: true, .. }");
    }

    #[tokio::test]
    async fn polling_after_release_of_end_does_not_touch_inner() {
        let sink = Arc::new(RecordingCollector::default());
        // `unfold` panics when polled again after yielding `None`.
        let inner = futures::stream::unfold(0u32, |n| async move {
            (n == 0).then(|| (Ok::<_, FakeError>(chunk(0, "x")), n + 1))
        });
        let mut stream = MeteredAsyncStream::new(Box::pin(inner), pending(sink.clone()));

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
        assert_eq!(sink.records().len(), 1);
    }

    #[test]
    fn blocking_stream_is_fused_after_end() {
        let sink = Arc::new(RecordingCollector::default());
        let mut polls = 0;
        let inner = std::iter::from_fn(|| {
            polls += 1;
            None::<Result<ChatCompletionChunk, FakeError>>
        });
        let mut stream = MeteredStream::new(inner, pending(sink.clone()));
        assert!(stream.next().is_none());
        assert!(stream.next().is_none());
        assert!(stream.is_reported());
        drop(stream);
        assert_eq!(polls, 1);
        assert_eq!(sink.records().len(), 1);
    }

    struct StalledCollector;

    #[async_trait::async_trait]
    impl Collector for StalledCollector {
        fn name(&self) -> &str {
            "stalled"
        }

        fn send(&self, _record: &CallRecord) -> crate::error::CoreResult<()> {
            Ok(())
        }

        async fn send_async(&self, _record: &CallRecord) -> crate::error::CoreResult<()> {
            futures::future::pending().await
        }
    }

    #[test]
    fn dropping_while_report_is_in_flight_is_logged() {
        let store = test_span::install_capture();
        let pending = PendingReport::new(
            CallOptions::default(),
            now_ms(),
            payload(json!({"model": "gpt-4o", "stream": true})),
            Arc::new(Reporter::new().with_collector(Arc::new(StalledCollector))),
            tracing::Span::none(),
        );
        let items: Vec<Result<ChatCompletionChunk, FakeError>> = vec![];
        let mut stream = MeteredAsyncStream::new(futures::stream::iter(items), pending);

        assert!(stream.next().now_or_never().is_none());
        assert!(!stream.is_reported());
        drop(stream);

        let events =
            store.events_named("stream dropped while its report was in flight, report abandoned");
        assert_eq!(events.len(), 1);
    }
}
