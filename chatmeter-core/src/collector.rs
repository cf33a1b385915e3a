//! HTTP collector service client.
//!
//! Call records are posted to `{base}/report`. The same service answers cache
//! lookups at `{base}/check-cache`, so the client is also a [`CacheBackend`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{CacheBackend, CacheQuery};
use crate::error::CoreResult;
use crate::http_client::HttpClient;
use crate::model::{ChatCompletion, RequestPayload};
use crate::telemetry::{CallRecord, Collector};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportReq<'a> {
    requested_at: u64,
    received_at: u64,
    req_payload: &'a RequestPayload,
    resp_payload: Option<&'a Value>,
    status_code: Option<u16>,
    error_message: Option<&'a str>,
    tags: BTreeMap<String, String>,
}

impl<'a> From<&'a CallRecord> for ReportReq<'a> {
    fn from(r: &'a CallRecord) -> Self {
        Self {
            requested_at: r.requested_at,
            received_at: r.received_at,
            req_payload: &r.req_payload,
            resp_payload: r.resp_payload.as_ref(),
            status_code: r.status_code,
            error_message: r.error_message.as_deref(),
            tags: r.tags(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckCacheReq<'a> {
    requested_at: u64,
    req_payload: &'a RequestPayload,
    tags: &'a BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckCacheResp {
    #[serde(default)]
    resp_payload: Option<Value>,
}

impl CheckCacheResp {
    /// A payload that does not decode as a completion is a miss, not an error.
    fn into_hit(self) -> Option<ChatCompletion> {
        let v = self.resp_payload?;
        if v.is_null() {
            return None;
        }
        match serde_json::from_value(v) {
            Ok(resp) => Some(resp),
            Err(e) => {
                tracing::warn!(error = %e, "cached payload is not a chat completion");
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpCollector {
    http: HttpClient,
    base: String,
    api_key: SecretString,
}

impl HttpCollector {
    pub fn new(http: HttpClient, base: impl Into<String>, api_key: SecretString) -> Self {
        let base = base.into();
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.base)
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.api_key.expose_secret())
    }
}

#[async_trait]
impl Collector for HttpCollector {
    fn name(&self) -> &str {
        "http"
    }

    fn send(&self, record: &CallRecord) -> CoreResult<()> {
        let auth = self.auth();
        self.http.post_unit_blocking(
            &self.url("report"),
            &ReportReq::from(record),
            &[("Authorization", auth.as_str())],
        )?;
        Ok(())
    }

    async fn send_async(&self, record: &CallRecord) -> CoreResult<()> {
        let auth = self.auth();
        self.http
            .post_unit(
                &self.url("report"),
                &ReportReq::from(record),
                &[("Authorization", auth.as_str())],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for HttpCollector {
    fn name(&self) -> &str {
        "http"
    }

    fn get(&self, query: &CacheQuery<'_>) -> CoreResult<Option<ChatCompletion>> {
        let auth = self.auth();
        let resp: CheckCacheResp = self.http.post_json_blocking(
            &self.url("check-cache"),
            &CheckCacheReq {
                requested_at: query.requested_at,
                req_payload: query.payload,
                tags: query.tags,
            },
            &[("Authorization", auth.as_str())],
        )?;
        Ok(resp.into_hit())
    }

    async fn get_async(&self, query: &CacheQuery<'_>) -> CoreResult<Option<ChatCompletion>> {
        let auth = self.auth();
        let resp: CheckCacheResp = self
            .http
            .post_json(
                &self.url("check-cache"),
                &CheckCacheReq {
                    requested_at: query.requested_at,
                    req_payload: query.payload,
                    tags: query.tags,
                },
                &[("Authorization", auth.as_str())],
            )
            .await?;
        Ok(resp.into_hit())
    }
}
