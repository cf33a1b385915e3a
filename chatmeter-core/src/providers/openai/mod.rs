use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::client::{AsyncChatClient, ChatClient, Completion};
use crate::error::{ClientError, ClientResult};
use crate::http_client::{HttpClient, SseLines, SseStream};
use crate::model::{ChatCompletion, ChatCompletionChunk, RequestPayload};

pub type ChunkIter = Box<dyn Iterator<Item = ClientResult<ChatCompletionChunk>> + Send>;
pub type ChunkStream = Pin<Box<dyn Stream<Item = ClientResult<ChatCompletionChunk>> + Send>>;

/// OpenAI-compatible `/v1/chat/completions` client, blocking and async.
///
/// Streams when the payload carries `"stream": true`.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: HttpClient,
    base: String,
    org: Option<String>,
    api_key: SecretString,
}

impl OpenAiClient {
    pub fn new(http: HttpClient, api_key: SecretString, base: String, org: Option<String>) -> Self {
        Self {
            http,
            api_key,
            base: base.trim_end_matches('/').to_string(),
            org,
        }
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str) -> Self {
        OpenAiClient::new(
            HttpClient::new_default().unwrap(),
            SecretString::new("test-key".into()),
            server_base.to_string(),
            None,
        )
    }

    fn headers(&self) -> Vec<(String, String)> {
        let mut h = vec![(
            "Authorization".to_string(),
            format!("Bearer {}", self.api_key.expose_secret()),
        )];
        if let Some(org) = &self.org {
            h.push(("OpenAI-Organization".into(), org.clone()));
        }
        h
    }

    fn url(&self) -> String {
        format!("{}/v1/chat/completions", self.base)
    }
}

impl ChatClient for OpenAiClient {
    type Error = ClientError;
    type Stream = ChunkIter;

    fn create(&self, payload: &RequestPayload) -> ClientResult<Completion<ChunkIter>> {
        let owned_headers = self.headers();
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let url = self.url();
        if payload.is_stream() {
            let lines = self.http.post_sse_lines_blocking(&url, payload, &hdrs)?;
            return Ok(Completion::Stream(Box::new(SseChunks::new(lines))));
        }
        let resp: ChatCompletion = self.http.post_json_blocking(&url, payload, &hdrs)?;
        Ok(Completion::Direct(resp))
    }
}

#[async_trait]
impl AsyncChatClient for OpenAiClient {
    type Error = ClientError;
    type Stream = ChunkStream;

    async fn create_async(
        &self,
        payload: &RequestPayload,
    ) -> ClientResult<Completion<ChunkStream>> {
        let owned_headers = self.headers();
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let url = self.url();
        if payload.is_stream() {
            let lines = self.http.post_sse_lines(&url, payload, &hdrs).await?;
            return Ok(Completion::Stream(sse_chunk_stream(lines)));
        }
        let resp: ChatCompletion = self.http.post_json(&url, payload, &hdrs).await?;
        Ok(Completion::Direct(resp))
    }
}

#[derive(Debug)]
enum SseEvent {
    Chunk(ChatCompletionChunk),
    Done,
    /// Blank lines, comments and non-data fields.
    Skip,
    Error(ClientError),
}

fn parse_sse_line(line: &str) -> SseEvent {
    let Some(data) = line.strip_prefix("data:") else {
        return SseEvent::Skip;
    };
    let data = data.trim();
    if data.is_empty() {
        return SseEvent::Skip;
    }
    if data == "[DONE]" {
        return SseEvent::Done;
    }
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return SseEvent::Error(ClientError::Decode(format!("bad stream event: {e}"))),
    };
    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| err.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| err.to_string());
        return SseEvent::Error(ClientError::Stream(message));
    }
    match serde_json::from_value(value) {
        Ok(chunk) => SseEvent::Chunk(chunk),
        Err(e) => SseEvent::Error(ClientError::Decode(format!("bad stream chunk: {e}"))),
    }
}

/// Blocking chunk iterator over SSE lines. Ends at `[DONE]`, end of body, or after the first error.
struct SseChunks {
    lines: SseLines,
    done: bool,
}

impl SseChunks {
    fn new(lines: SseLines) -> Self {
        Self { lines, done: false }
    }
}

impl Iterator for SseChunks {
    type Item = ClientResult<ChatCompletionChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            match parse_sse_line(&line) {
                SseEvent::Skip => continue,
                SseEvent::Chunk(chunk) => return Some(Ok(chunk)),
                SseEvent::Done => self.done = true,
                SseEvent::Error(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

fn sse_chunk_stream(lines: SseStream) -> ChunkStream {
    let chunks = futures::stream::unfold(Some(lines), |state| async move {
        let mut lines = state?;
        while let Some(item) = lines.next().await {
            match item.map(|line| parse_sse_line(&line)) {
                Ok(SseEvent::Skip) => continue,
                Ok(SseEvent::Chunk(chunk)) => return Some((Ok(chunk), Some(lines))),
                Ok(SseEvent::Done) => return None,
                Ok(SseEvent::Error(e)) | Err(e) => return Some((Err(e), None)),
            }
        }
        None
    });
    Box::pin(chunks)
}
