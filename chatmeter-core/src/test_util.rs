//! Fakes shared by the unit tests: scripted clients, recording and failing collaborators.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::cache::{CacheBackend, CacheQuery};
use crate::client::{AsyncChatClient, ChatClient, Completion};
use crate::error::{CoreError, CoreResult, ReportableError};
use crate::model::{
    ChatCompletion, ChatCompletionChunk, Choice, ChunkChoice, Delta, Message, RequestPayload,
};
use crate::telemetry::{CallRecord, Collector};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FakeError {
    #[error("{message}")]
    Api {
        status: u16,
        message: String,
        body: Value,
    },
    #[error("{0}")]
    Boom(String),
}

impl ReportableError for FakeError {
    fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Boom(_) => None,
        }
    }

    fn body(&self) -> Option<Value> {
        match self {
            Self::Api { body, .. } => Some(body.clone()),
            Self::Boom(_) => None,
        }
    }
}

pub fn rate_limited() -> FakeError {
    FakeError::Api {
        status: 429,
        message: "Rate limit reached".into(),
        body: json!({"error": "rate_limited"}),
    }
}

pub fn payload(v: Value) -> RequestPayload {
    RequestPayload::from_value(v).unwrap()
}

pub fn completion(text: &str) -> ChatCompletion {
    ChatCompletion {
        id: "chatcmpl-test".into(),
        object: "chat.completion".into(),
        created: 1_700_000_000,
        model: "gpt-4o".into(),
        choices: vec![Choice {
            index: 0,
            message: Message {
                content: Some(text.into()),
                ..Default::default()
            },
            finish_reason: Some("stop".into()),
            logprobs: None,
        }],
        ..Default::default()
    }
}

pub fn chunk(index: u32, text: &str) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: "chatcmpl-test".into(),
        object: "chat.completion.chunk".into(),
        created: 1_700_000_000,
        model: "gpt-4o".into(),
        choices: vec![ChunkChoice {
            index,
            delta: Delta {
                content: Some(text.into()),
                ..Default::default()
            },
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub type ChunkResult = Result<ChatCompletionChunk, FakeError>;

/// What a scripted client does on every call.
#[derive(Debug, Clone)]
pub enum Script {
    Direct(ChatCompletion),
    Stream(Vec<ChunkResult>),
    Fail(FakeError),
}

/// Client double that replays a fixed script and remembers what it was sent.
#[derive(Debug)]
pub struct ScriptedClient {
    script: Script,
    seen: Mutex<Vec<RequestPayload>>,
}

impl ScriptedClient {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn seen(&self) -> Vec<RequestPayload> {
        self.seen.lock().unwrap().clone()
    }

    fn play(&self, payload: &RequestPayload) -> Result<Completion<Vec<ChunkResult>>, FakeError> {
        self.seen.lock().unwrap().push(payload.clone());
        match &self.script {
            Script::Direct(resp) => Ok(Completion::Direct(resp.clone())),
            Script::Stream(items) => Ok(Completion::Stream(items.clone())),
            Script::Fail(err) => Err(err.clone()),
        }
    }
}

impl ChatClient for ScriptedClient {
    type Error = FakeError;
    type Stream = std::vec::IntoIter<ChunkResult>;

    fn create(&self, payload: &RequestPayload) -> Result<Completion<Self::Stream>, FakeError> {
        Ok(match self.play(payload)? {
            Completion::Direct(resp) => Completion::Direct(resp),
            Completion::Stream(items) => Completion::Stream(items.into_iter()),
        })
    }
}

#[async_trait]
impl AsyncChatClient for ScriptedClient {
    type Error = FakeError;
    type Stream = futures::stream::Iter<std::vec::IntoIter<ChunkResult>>;

    async fn create_async(
        &self,
        payload: &RequestPayload,
    ) -> Result<Completion<Self::Stream>, FakeError> {
        tokio::task::yield_now().await;
        Ok(match self.play(payload)? {
            Completion::Direct(resp) => Completion::Direct(resp),
            Completion::Stream(items) => Completion::Stream(futures::stream::iter(items)),
        })
    }
}

#[derive(Default)]
pub struct RecordingCollector {
    records: Mutex<Vec<CallRecord>>,
    async_sends: AtomicUsize,
}

impl RecordingCollector {
    pub fn records(&self) -> Vec<CallRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn async_sends(&self) -> usize {
        self.async_sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Collector for RecordingCollector {
    fn name(&self) -> &str {
        "recording"
    }

    fn send(&self, record: &CallRecord) -> CoreResult<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn send_async(&self, record: &CallRecord) -> CoreResult<()> {
        tokio::task::yield_now().await;
        self.async_sends.fetch_add(1, Ordering::SeqCst);
        self.send(record)
    }
}

pub struct FailingCollector;

#[async_trait]
impl Collector for FailingCollector {
    fn name(&self) -> &str {
        "failing"
    }

    fn send(&self, _record: &CallRecord) -> CoreResult<()> {
        Err(CoreError::Collector {
            status: Some(503),
            message: "collector down".into(),
        })
    }
}

pub struct FailingCache;

#[async_trait]
impl CacheBackend for FailingCache {
    fn name(&self) -> &str {
        "failing-cache"
    }

    fn get(&self, _query: &CacheQuery<'_>) -> CoreResult<Option<ChatCompletion>> {
        Err(CoreError::Cache("cache unreachable".into()))
    }
}
