//! The metered client facade.
//!
//! `MeteredClient` wraps any [`ChatClient`] / [`AsyncChatClient`] and keeps its call
//! contract: same payload in, same response, stream or error out. Around the call it
//! consults the cache and reports exactly one call record (none on a cache hit).
//! Everything else the wrapped client offers is reached through [`MeteredClient::inner`].

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::Span;
use tracing_futures::Instrument;

use crate::cache::{CacheBackend, CacheGateway, CacheLookup};
use crate::client::{AsyncChatClient, ChatClient, Completion, Outcome};
use crate::error::ReportableError;
use crate::model::{ChatCompletion, RequestPayload};
use crate::options::{CallOptions, split_options};
use crate::stream::{MeteredAsyncStream, MeteredStream};
use crate::telemetry::{
    CallRecord, Collector, KEY_CACHE_STATUS, KEY_LATENCY_MS, KEY_STATUS_CODE, KEY_STREAMED,
    Reporter, now_ms,
};

/// Everything needed to report a call whose outcome is not known yet.
pub(crate) struct PendingReport {
    options: CallOptions,
    requested_at: u64,
    payload: RequestPayload,
    reporter: Arc<Reporter>,
    span: Span,
}

impl PendingReport {
    pub(crate) fn new(
        options: CallOptions,
        requested_at: u64,
        payload: RequestPayload,
        reporter: Arc<Reporter>,
        span: Span,
    ) -> Self {
        Self {
            options,
            requested_at,
            payload,
            reporter,
            span,
        }
    }

    pub(crate) fn succeed(self, response: Option<&ChatCompletion>) -> Settled {
        let record = CallRecord::success(
            self.options,
            self.requested_at,
            now_ms(),
            self.payload,
            response,
        );
        Settled {
            record,
            reporter: self.reporter,
            span: self.span,
        }
    }

    pub(crate) fn fail<E: ReportableError + ?Sized>(
        self,
        err: &E,
        partial: Option<&ChatCompletion>,
    ) -> Settled {
        let record = CallRecord::failure(
            self.options,
            self.requested_at,
            now_ms(),
            self.payload,
            err,
            partial,
        );
        Settled {
            record,
            reporter: self.reporter,
            span: self.span,
        }
    }

    pub(crate) fn note_dropped(&self) {
        let _entered = self.span.enter();
        tracing::debug!("stream dropped before completion, call not reported");
    }
}

/// A finished call record, bound to its reporter and span.
pub(crate) struct Settled {
    record: CallRecord,
    reporter: Arc<Reporter>,
    span: Span,
}

impl Settled {
    fn mark_span(&self) {
        if let Some(status) = self.record.status_code {
            self.span.record(KEY_STATUS_CODE, status);
        }
        self.span.record(KEY_LATENCY_MS, self.record.latency_ms());
        if let Some(err) = &self.record.error_message {
            let _entered = self.span.enter();
            tracing::debug!(error = %err, "call failed");
        }
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }

    pub(crate) fn report(self) {
        self.mark_span();
        let _entered = self.span.enter();
        self.reporter.report(&self.record);
    }

    pub(crate) fn report_async(self) -> BoxFuture<'static, ()> {
        self.mark_span();
        let Settled {
            record,
            reporter,
            span,
        } = self;
        Box::pin(async move { reporter.report_async(&record).await }.instrument(span))
    }
}

enum Step<S, E> {
    Report(Settled, Result<ChatCompletion, E>),
    Stream(S, PendingReport),
}

/// Per-call state from the moment the caller hands over the payload.
struct Call {
    payload: RequestPayload,
    options: CallOptions,
    requested_at: u64,
    span: Span,
}

impl Call {
    fn begin(payload: RequestPayload, options: Option<CallOptions>) -> Self {
        let (payload, options) = split_options(payload, options);
        let fingerprint = options.fingerprint_for(&payload);
        let span = tracing::info_span!(
            "chat.create",
            model = payload.model().unwrap_or_default(),
            call.fingerprint = %fingerprint,
            call.cache = tracing::field::Empty,
            call.streamed = tracing::field::Empty,
            call.status = tracing::field::Empty,
            call.latency_ms = tracing::field::Empty,
        );
        Self {
            payload,
            options,
            requested_at: now_ms(),
            span,
        }
    }

    /// Returns the cached response on a hit.
    fn after_lookup(&self, lookup: CacheLookup) -> Option<ChatCompletion> {
        self.span.record(KEY_CACHE_STATUS, lookup.status().as_str());
        let hit = lookup.into_hit();
        if hit.is_some() {
            tracing::debug!("served from cache, call not reported");
        }
        hit
    }

    /// Shared by both call modes so they branch identically.
    fn settle<S, E: ReportableError>(
        self,
        reporter: &Arc<Reporter>,
        outcome: Outcome<S, E>,
    ) -> Step<S, E> {
        let streamed = matches!(outcome, Outcome::Streaming(_));
        self.span.record(KEY_STREAMED, streamed);
        let pending = PendingReport::new(
            self.options,
            self.requested_at,
            self.payload,
            reporter.clone(),
            self.span,
        );
        match outcome {
            Outcome::Direct(resp) => Step::Report(pending.succeed(Some(&resp)), Ok(resp)),
            Outcome::Streaming(s) => Step::Stream(s, pending),
            Outcome::Failed(e) => Step::Report(pending.fail(&e, None), Err(e)),
        }
    }
}

/// Transparent metering wrapper around a chat-completion client.
pub struct MeteredClient<C> {
    inner: C,
    cache: CacheGateway,
    reporter: Arc<Reporter>,
}

impl<C> MeteredClient<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            cache: CacheGateway::disabled(),
            reporter: Arc::new(Reporter::new()),
        }
    }

    pub fn with_cache(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache = CacheGateway::new(backend);
        self
    }

    pub fn with_collector(mut self, collector: Arc<dyn Collector>) -> Self {
        Arc::make_mut(&mut self.reporter).add(collector);
        self
    }

    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    /// The wrapped client, for everything this facade does not meter.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn cache(&self) -> &CacheGateway {
        &self.cache
    }
}

impl<C: ChatClient> MeteredClient<C> {
    /// Blocking metered call. The report for a direct or failed call is sent before returning.
    pub fn create(
        &self,
        payload: RequestPayload,
        options: Option<CallOptions>,
    ) -> Result<Completion<MeteredStream<C::Stream>>, C::Error> {
        let call = Call::begin(payload, options);
        let span = call.span.clone();
        let _entered = span.enter();

        let lookup = self.cache.check(&call.options, &call.payload, call.requested_at);
        if let Some(resp) = call.after_lookup(lookup) {
            return Ok(Completion::Direct(resp));
        }

        let outcome = Outcome::from(self.inner.create(&call.payload));
        match call.settle(&self.reporter, outcome) {
            Step::Report(settled, result) => {
                settled.report();
                result.map(Completion::Direct)
            }
            Step::Stream(s, pending) => Ok(Completion::Stream(MeteredStream::new(s, pending))),
        }
    }
}

impl<C: AsyncChatClient> MeteredClient<C> {
    /// Async metered call; same branching as [`MeteredClient::create`].
    pub async fn create_async(
        &self,
        payload: RequestPayload,
        options: Option<CallOptions>,
    ) -> Result<Completion<MeteredAsyncStream<C::Stream>>, C::Error> {
        let call = Call::begin(payload, options);
        let span = call.span.clone();
        async move {
            let lookup = self
                .cache
                .check_async(&call.options, &call.payload, call.requested_at)
                .await;
            if let Some(resp) = call.after_lookup(lookup) {
                return Ok(Completion::Direct(resp));
            }

            let outcome = Outcome::from(self.inner.create_async(&call.payload).await);
            match call.settle(&self.reporter, outcome) {
                Step::Report(settled, result) => {
                    settled.report_async().await;
                    result.map(Completion::Direct)
                }
                Step::Stream(s, pending) => {
                    Ok(Completion::Stream(MeteredAsyncStream::new(s, pending)))
                }
            }
        }
        .instrument(span)
        .await
    }
}

impl<C: std::fmt::Debug> std::fmt::Debug for MeteredClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteredClient")
            .field("inner", &self.inner)
            .field("cache", &self.cache)
            .field("reporter", &self.reporter)
            .finish()
    }
}
