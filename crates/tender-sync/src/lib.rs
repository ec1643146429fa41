//! Client-side sync layer for the tender review console: cached listings,
//! filter and review state machines, source management and task runs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tender_api::{BackoffPolicy, HttpClientConfig, HttpTenderApi};
use tender_core::{DEFAULT_PAGE_SIZE, DEFAULT_TASK_LIMIT};
use tracing::info;

pub mod cache;
pub mod filters;
pub mod review;
pub mod sources;
pub mod tasks;

#[cfg(test)]
mod testing;

pub use cache::{CacheConfig, QueryCache, QueryObserver, QuerySnapshot, RevalidateTrigger};
pub use filters::{
    tender_list_cache, FilterController, FilterDraft, FilterError, FilterState, PageInfo,
    TenderListCache, TenderListView, Total,
};
pub use review::{ReviewController, ReviewError, ReviewState, SaveOutcome};
pub use sources::{SourceError, SourceListCache, SourceManager};
pub use tasks::{
    AggregationPolicy, FanOutReport, RunOrigin, SourceOutcome, TaskCounts, TaskRunReport,
    TaskRunner, TaskSummary, TaskTarget, DEFAULT_TASK_CONCURRENCY,
};

pub use tender_api::{ApiError, TenderApi};

pub const CRATE_NAME: &str = "tender-sync";
pub const DEFAULT_API_URL: &str = "http://localhost:8000/api/v1";

#[derive(Debug, Clone)]
pub struct ReviewConfig {
    pub api_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub page_size: u32,
    pub task_limit: u32,
    pub task_concurrency: usize,
    pub revalidate_on_focus: bool,
    pub revalidate_on_reconnect: bool,
    pub stale_after_secs: Option<u64>,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "True" | "yes" => Some(true),
        "0" | "false" | "FALSE" | "False" | "no" => Some(false),
        _ => None,
    }
}

impl ReviewConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let flag = |key: &str, default: bool| {
            lookup(key)
                .and_then(|v| parse_flag(&v))
                .unwrap_or(default)
        };

        Self {
            api_url: lookup("TENDER_API_URL")
                .map(|url| url.trim().trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty())
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            http_timeout_secs: number("TENDER_HTTP_TIMEOUT_SECS")
                .filter(|secs| *secs > 0)
                .unwrap_or(30),
            user_agent: lookup("TENDER_USER_AGENT")
                .unwrap_or_else(|| "tender-review/0.1".to_string()),
            page_size: number("TENDER_PAGE_SIZE")
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_PAGE_SIZE),
            task_limit: number("TENDER_TASK_LIMIT")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(DEFAULT_TASK_LIMIT),
            task_concurrency: number("TENDER_TASK_CONCURRENCY")
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_TASK_CONCURRENCY),
            revalidate_on_focus: flag("TENDER_REVALIDATE_ON_FOCUS", false),
            revalidate_on_reconnect: flag("TENDER_REVALIDATE_ON_RECONNECT", true),
            stale_after_secs: number("TENDER_STALE_AFTER_SECS"),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            revalidate_on_focus: self.revalidate_on_focus,
            revalidate_on_reconnect: self.revalidate_on_reconnect,
            stale_after: self.stale_after_secs.map(Duration::from_secs),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::default(),
            ..HttpClientConfig::default()
        }
    }

    /// Builds an HTTP-backed session against `api_url`.
    pub fn connect(self) -> Result<ReviewSession> {
        let api = HttpTenderApi::new(self.api_url.clone(), self.http_client_config())
            .with_context(|| format!("failed to build client for {}", self.api_url))?;
        info!(api_url = %self.api_url, "tender api client ready");
        Ok(ReviewSession::new(Arc::new(api), self))
    }
}

/// The shared caches and services of one console session.
pub struct ReviewSession {
    pub api: Arc<dyn TenderApi>,
    pub tenders: TenderListCache,
    pub sources: SourceManager,
    pub tasks: TaskRunner,
    pub config: ReviewConfig,
}

impl ReviewSession {
    pub fn new(api: Arc<dyn TenderApi>, config: ReviewConfig) -> Self {
        let tenders = tender_list_cache(Arc::clone(&api), config.cache_config());
        let sources = SourceManager::new(Arc::clone(&api), config.cache_config());
        let tasks = TaskRunner::new(Arc::clone(&api))
            .with_tender_cache(tenders.clone())
            .with_concurrency(config.task_concurrency);
        Self {
            api,
            tenders,
            sources,
            tasks,
            config,
        }
    }

    pub fn list_view(&self) -> TenderListView {
        TenderListView::new(self.tenders.clone(), self.config.page_size)
    }

    pub fn review(&self) -> ReviewController {
        ReviewController::new()
    }

    pub async fn run_task(&self, source_id: Option<tender_core::SourceId>) -> TaskRunReport {
        self.tasks.run(source_id, Some(self.config.task_limit)).await
    }

    /// Forwards a focus or reconnect signal to every cache.
    pub fn revalidate_on(&self, trigger: RevalidateTrigger) -> usize {
        self.tenders.revalidate_on(trigger) + self.sources.cache().revalidate_on(trigger)
    }
}
