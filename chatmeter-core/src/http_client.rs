use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Serialize};

use crate::config::HttpCfg;
use crate::error::{ClientError, ClientResult, CoreError, CoreResult};

/// A boxed stream of raw SSE lines (already split on `\n`, line ending removed).
pub type SseStream =
    std::pin::Pin<Box<dyn futures_util::stream::Stream<Item = ClientResult<String>> + Send>>;

/// Blocking counterpart of [`SseStream`].
pub type SseLines = Box<dyn Iterator<Item = ClientResult<String>> + Send>;

/// Thin wrapper around reqwest with shared defaults, async and blocking.
///
/// The blocking client is built on first use: reqwest refuses to construct one
/// from inside an async runtime, and async-only callers never need it.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    blocking: Arc<OnceCell<reqwest::blocking::Client>>,
    cfg: HttpCfg,
    user_agent: String,
}

impl HttpClient {
    pub fn new(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(Duration::from_millis(cfg.request_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| CoreError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            blocking: Arc::new(OnceCell::new()),
            cfg: cfg.clone(),
            user_agent: format!("chatmeter/{}", env!("CARGO_PKG_VERSION")),
        })
    }

    pub fn new_default() -> CoreResult<Self> {
        Self::new(&HttpCfg::default())
    }

    fn blocking(&self) -> ClientResult<&reqwest::blocking::Client> {
        self.blocking.get_or_try_init(|| {
            let mut builder = reqwest::blocking::Client::builder()
                .connect_timeout(Duration::from_millis(self.cfg.connect_timeout_ms))
                .timeout(Duration::from_millis(self.cfg.request_timeout_ms));
            if let Some(n) = self.cfg.pool_max_idle_per_host {
                builder = builder.pool_max_idle_per_host(n);
            }
            builder
                .build()
                .map_err(|e| ClientError::Connection(format!("http client build failed: {e}")))
        })
    }

    fn request<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> reqwest::RequestBuilder {
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        req
    }

    fn blocking_request<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> ClientResult<reqwest::blocking::RequestBuilder> {
        let mut req = self
            .blocking()?
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        Ok(req)
    }

    async fn send<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> ClientResult<reqwest::Response> {
        let resp = self
            .request(url, body, headers)
            .send()
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let ra = parse_retry_after(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(map_http_error(status, ra, &text));
        }
        Ok(resp)
    }

    fn send_blocking<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> ClientResult<reqwest::blocking::Response> {
        let resp = self
            .blocking_request(url, body, headers)?
            .send()
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let ra = parse_retry_after(resp.headers());
            let text = resp.text().unwrap_or_default();
            return Err(map_http_error(status, ra, &text));
        }
        Ok(resp)
    }

    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> ClientResult<R> {
        let resp = self.send(url, body, headers).await?;
        resp.json::<R>()
            .await
            .map_err(|e| ClientError::Decode(format!("json decode error: {e}")))
    }

    /// POST JSON and discard whatever the server answers on success.
    pub async fn post_unit<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> ClientResult<()> {
        self.send(url, body, headers).await.map(|_| ())
    }

    /// POST JSON and return the response body as a stream of SSE lines.
    pub async fn post_sse_lines<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> ClientResult<SseStream> {
        let mut all = headers.to_vec();
        all.push(("Accept", "text/event-stream"));
        let resp = self.send(url, body, &all).await?;
        let line_stream = LineStream::new(Box::pin(resp.bytes_stream()));
        Ok(Box::pin(line_stream))
    }

    pub fn post_json_blocking<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> ClientResult<R> {
        let resp = self.send_blocking(url, body, headers)?;
        resp.json::<R>()
            .map_err(|e| ClientError::Decode(format!("json decode error: {e}")))
    }

    pub fn post_unit_blocking<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> ClientResult<()> {
        self.send_blocking(url, body, headers).map(|_| ())
    }

    pub fn post_sse_lines_blocking<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> ClientResult<SseLines> {
        let mut all = headers.to_vec();
        all.push(("Accept", "text/event-stream"));
        let resp = self.send_blocking(url, body, &all)?;
        Ok(Box::new(BlockingLines {
            reader: BufReader::new(resp),
            done: false,
        }))
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    if let Some(v) = headers.get("retry-after")
        && let Ok(s) = v.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Some(secs);
    }
    // HTTP-date forms are ignored.
    None
}

/// Every non-2xx answer is a recognized API error. The body is kept when it is JSON,
/// and the message prefers the API's own `error.message`.
fn map_http_error(status: StatusCode, retry_after: Option<u64>, text: &str) -> ClientError {
    let body = serde_json::from_str::<serde_json::Value>(text).ok();
    let message = body
        .as_ref()
        .and_then(api_message)
        .unwrap_or_else(|| {
            if text.trim().is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                truncate(text, 300)
            }
        });
    ClientError::Api {
        status: status.as_u16(),
        message,
        body,
        retry_after,
    }
}

fn api_message(body: &serde_json::Value) -> Option<String> {
    let err = body.get("error")?;
    err.get("message")
        .and_then(|m| m.as_str())
        .or_else(|| err.as_str())
        .map(str::to_owned)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut t = s[..end].to_string();
    t.push_str("...");
    t
}

fn strip_line_ending(line: &mut String) {
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
}

fn decode_line(raw: Vec<u8>) -> ClientResult<String> {
    let mut line = String::from_utf8(raw)
        .map_err(|e| ClientError::Decode(format!("invalid utf-8 in event stream: {e}")))?;
    strip_line_ending(&mut line);
    Ok(line)
}

type ByteStream = std::pin::Pin<
    Box<dyn futures_util::stream::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>,
>;

/// Line splitter over a bytes stream.
struct LineStream {
    inner: ByteStream,
    buf: Vec<u8>,
    flushed_tail: bool,
}

impl LineStream {
    fn new(inner: ByteStream) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            flushed_tail: false,
        }
    }
}

impl futures_util::stream::Stream for LineStream {
    type Item = ClientResult<String>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;
        loop {
            if let Some(idx) = self.buf.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = self.buf.drain(..=idx).collect();
                return Poll::Ready(Some(decode_line(raw)));
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    // A multi-byte character may straddle reads; decode whole lines only.
                    self.buf.extend_from_slice(&chunk);
                    continue;
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(ClientError::Connection(e.to_string()))));
                }
                Poll::Ready(None) => {
                    if !self.flushed_tail && !self.buf.is_empty() {
                        self.flushed_tail = true;
                        let raw = std::mem::take(&mut self.buf);
                        return Poll::Ready(Some(decode_line(raw)));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

struct BlockingLines {
    reader: BufReader<reqwest::blocking::Response>,
    done: bool,
}

impl Iterator for BlockingLines {
    type Item = ClientResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) => {
                strip_line_ending(&mut line);
                Some(Ok(line))
            }
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                self.done = true;
                Some(Err(ClientError::Decode(format!("invalid utf-8 in event stream: {e}"))))
            }
            Err(e) => {
                self.done = true;
                Some(Err(ClientError::Connection(e.to_string())))
            }
        }
    }
}
