//! Remote data contract for the Tender Store and the Scrape & Extract Service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tender_core::{
    SourceConfig, SourceConfigPayload, SourceId, SourcePage, TaskRunRequest, TaskRunResponse,
    Tender, TenderCorrection, TenderFilters, TenderId,
};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "tender-api";

/// Failures of a remote call.
///
/// `Transport` means the request never completed; `Status` means the
/// collaborator answered with an error and `detail` is its own message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("{detail}")]
    Status { status: u16, detail: String },
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

#[async_trait]
pub trait TenderApi: Send + Sync {
    /// Most-recent-first page of tenders matching `filters`.
    async fn list_tenders(&self, filters: &TenderFilters) -> Result<Vec<Tender>, ApiError>;

    async fn get_tender(&self, id: TenderId) -> Result<Tender, ApiError>;

    async fn update_tender(
        &self,
        id: TenderId,
        correction: &TenderCorrection,
    ) -> Result<Tender, ApiError>;

    async fn list_sources(&self, page: SourcePage) -> Result<Vec<SourceConfig>, ApiError>;

    async fn get_source(&self, id: SourceId) -> Result<SourceConfig, ApiError>;

    async fn create_source(&self, payload: &SourceConfigPayload) -> Result<SourceConfig, ApiError>;

    async fn update_source(
        &self,
        id: SourceId,
        payload: &SourceConfigPayload,
    ) -> Result<SourceConfig, ApiError>;

    async fn delete_source(&self, id: SourceId) -> Result<(), ApiError>;

    async fn run_task(&self, request: &TaskRunRequest) -> Result<TaskRunResponse, ApiError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrent_requests: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_concurrent_requests: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// [`TenderApi`] over the store's JSON HTTP interface.
///
/// Only GET requests are retried; mutating calls are sent once.
#[derive(Debug, Clone)]
pub struct HttpTenderApi {
    client: reqwest::Client,
    base_url: String,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpTenderApi {
    /// `base_url` includes the API prefix, e.g. `http://localhost:8000/api/v1`.
    pub fn new(base_url: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            limit: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            backoff: config.backoff,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let url = self.url(path);
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|_| ApiError::Transport("request limiter closed".into()))?;

        let mut attempt = 0;
        loop {
            match self.client.get(&url).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if !status.is_success()
                        && classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%url, status = status.as_u16(), attempt, "retrying GET");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return read_json(resp).await;
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%url, error = %err, attempt, "retrying GET");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|_| ApiError::Transport("request limiter closed".into()))?;
        let resp = request.send().await?;
        ensure_success(resp).await
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let resp = self.send(request).await?;
        resp.json::<T>().await.map_err(|err| ApiError::Decode(err.to_string()))
    }
}

async fn ensure_success(resp: Response) -> Result<Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        detail: error_detail(status, &body),
    })
}

async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T, ApiError> {
    let resp = ensure_success(resp).await?;
    resp.json::<T>().await.map_err(|err| ApiError::Decode(err.to_string()))
}

/// Pulls the human-readable message out of a store error body.
///
/// The store answers `{"detail": "..."}`, or a list of `{"msg": ...}` items
/// for request validation errors.
pub fn error_detail(status: StatusCode, body: &str) -> String {
    let parsed = serde_json::from_str::<JsonValue>(body).ok();
    let detail = parsed.as_ref().and_then(|v| v.get("detail"));
    match detail {
        Some(JsonValue::String(message)) => message.clone(),
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|item| item.get("msg").and_then(JsonValue::as_str))
            .collect::<Vec<_>>()
            .join("; "),
        _ if !body.trim().is_empty() => body.trim().to_string(),
        _ => status
            .canonical_reason()
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("http status {}", status.as_u16())),
    }
}

#[async_trait]
impl TenderApi for HttpTenderApi {
    async fn list_tenders(&self, filters: &TenderFilters) -> Result<Vec<Tender>, ApiError> {
        let span = info_span!("list_tenders", skip = filters.skip, limit = filters.limit);
        async {
            let tenders: Vec<Tender> = self.get_json("/tenders", &filters.query_pairs()).await?;
            debug!(count = tenders.len(), "listed tenders");
            Ok(tenders)
        }
        .instrument(span)
        .await
    }

    async fn get_tender(&self, id: TenderId) -> Result<Tender, ApiError> {
        self.get_json(&format!("/tenders/{id}"), &[]).await
    }

    async fn update_tender(
        &self,
        id: TenderId,
        correction: &TenderCorrection,
    ) -> Result<Tender, ApiError> {
        let request = self
            .client
            .patch(self.url(&format!("/tenders/{id}")))
            .json(&correction.to_body());
        self.send_json(request)
            .instrument(info_span!("update_tender", id))
            .await
    }

    async fn list_sources(&self, page: SourcePage) -> Result<Vec<SourceConfig>, ApiError> {
        self.get_json(
            "/sources",
            &[
                ("skip", page.skip.to_string()),
                ("limit", page.limit.to_string()),
            ],
        )
        .await
    }

    async fn get_source(&self, id: SourceId) -> Result<SourceConfig, ApiError> {
        self.get_json(&format!("/sources/{id}"), &[]).await
    }

    async fn create_source(&self, payload: &SourceConfigPayload) -> Result<SourceConfig, ApiError> {
        let request = self.client.post(self.url("/sources")).json(payload);
        self.send_json(request).await
    }

    async fn update_source(
        &self,
        id: SourceId,
        payload: &SourceConfigPayload,
    ) -> Result<SourceConfig, ApiError> {
        let request = self
            .client
            .patch(self.url(&format!("/sources/{id}")))
            .json(payload);
        self.send_json(request).await
    }

    async fn delete_source(&self, id: SourceId) -> Result<(), ApiError> {
        let request = self.client.delete(self.url(&format!("/sources/{id}")));
        self.send(request).await.map(|_| ())
    }

    async fn run_task(&self, request: &TaskRunRequest) -> Result<TaskRunResponse, ApiError> {
        let builder = self.client.post(self.url("/tasks/run")).json(request);
        self.send_json(builder)
            .instrument(info_span!("run_task", source_id = ?request.source_id, limit = request.limit))
            .await
    }
}
