//! On-demand scrape runs and the reduction of per-source outcomes.

use std::fmt;
use std::ops::AddAssign;
use std::sync::Arc;

use futures::{stream, StreamExt};
use tender_api::{ApiError, TenderApi};
use tender_core::{SourceId, TaskResult, TaskRunRequest, TaskRunResponse, DEFAULT_TASK_LIMIT};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::filters::TenderListCache;

pub const DEFAULT_TASK_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskCounts {
    pub scraped: u64,
    pub processed: u64,
    pub filtered: u64,
    pub errors: u64,
}

impl AddAssign for TaskCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.scraped += rhs.scraped;
        self.processed += rhs.processed;
        self.filtered += rhs.filtered;
        self.errors += rhs.errors;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOutcome {
    Succeeded { source_name: String, counts: TaskCounts },
    /// Counters reported alongside an error are discarded.
    Failed { source_name: String, error: String },
}

impl SourceOutcome {
    pub fn source_name(&self) -> &str {
        match self {
            SourceOutcome::Succeeded { source_name, .. }
            | SourceOutcome::Failed { source_name, .. } => source_name,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SourceOutcome::Succeeded { .. })
    }
}

pub fn classify(result: &TaskResult) -> SourceOutcome {
    match result.error_message() {
        Some(error) => SourceOutcome::Failed {
            source_name: result.source_name.clone(),
            error: error.to_string(),
        },
        None => SourceOutcome::Succeeded {
            source_name: result.source_name.clone(),
            counts: TaskCounts {
                scraped: result.scraped.unwrap_or(0),
                processed: result.processed.unwrap_or(0),
                filtered: result.filtered.unwrap_or(0),
                errors: result.errors.unwrap_or(0),
            },
        },
    }
}

/// How a run's response came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOrigin {
    /// The service completed the call and reported a verdict.
    Reported,
    /// The service answered with an error status; `message` is its detail.
    Rejected,
    /// No usable answer arrived; the response was synthesized locally.
    Transport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskRunReport {
    pub run_id: Uuid,
    pub source_id: Option<SourceId>,
    pub origin: RunOrigin,
    pub response: TaskRunResponse,
}

impl TaskRunReport {
    fn from_error(run_id: Uuid, source_id: Option<SourceId>, err: &ApiError) -> Self {
        let origin = match err {
            ApiError::Status { .. } => RunOrigin::Rejected,
            ApiError::Transport(_) | ApiError::Decode(_) => RunOrigin::Transport,
        };
        Self {
            run_id,
            source_id,
            origin,
            response: TaskRunResponse {
                success: false,
                message: err.to_string(),
                results: Vec::new(),
            },
        }
    }

    /// The service's own verdict; never recomputed from `results`.
    pub fn success(&self) -> bool {
        self.response.success
    }

    pub fn message(&self) -> &str {
        &self.response.message
    }

    pub fn is_transport_failure(&self) -> bool {
        self.origin == RunOrigin::Transport
    }

    pub fn outcomes(&self) -> Vec<SourceOutcome> {
        self.response.results.iter().map(classify).collect()
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary::from_outcomes(&self.outcomes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Sum over successful sources only.
    pub totals: TaskCounts,
    pub failures: Vec<(String, String)>,
}

impl TaskSummary {
    pub fn from_outcomes(outcomes: &[SourceOutcome]) -> Self {
        let mut summary = TaskSummary::default();
        for outcome in outcomes {
            match outcome {
                SourceOutcome::Succeeded { counts, .. } => {
                    summary.succeeded += 1;
                    summary.totals += *counts;
                }
                SourceOutcome::Failed { source_name, error } => {
                    summary.failed += 1;
                    summary.failures.push((source_name.clone(), error.clone()));
                }
            }
        }
        summary
    }
}

impl fmt::Display for TaskSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed; scraped {}, processed {}, filtered {}",
            self.succeeded,
            self.failed,
            self.totals.scraped,
            self.totals.processed,
            self.totals.filtered
        )
    }
}

/// Reduces per-source outcomes of a fan-out run into one verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggregationPolicy {
    /// Fails if any source failed.
    #[default]
    AnyFailure,
    MajoritySuccess,
    AtLeastOneSuccess,
}

impl AggregationPolicy {
    /// An empty outcome list passes under every policy.
    pub fn verdict(self, outcomes: &[SourceOutcome]) -> bool {
        if outcomes.is_empty() {
            return true;
        }
        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        match self {
            AggregationPolicy::AnyFailure => succeeded == outcomes.len(),
            AggregationPolicy::MajoritySuccess => succeeded * 2 > outcomes.len(),
            AggregationPolicy::AtLeastOneSuccess => succeeded > 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTarget {
    pub id: SourceId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FanOutReport {
    pub run_id: Uuid,
    pub policy: AggregationPolicy,
    pub success: bool,
    pub message: String,
    /// One entry per source, in target order.
    pub results: Vec<TaskResult>,
    pub summary: TaskSummary,
}

pub struct TaskRunner {
    api: Arc<dyn TenderApi>,
    tender_cache: Option<TenderListCache>,
    concurrency: usize,
}

impl TaskRunner {
    pub fn new(api: Arc<dyn TenderApi>) -> Self {
        Self {
            api,
            tender_cache: None,
            concurrency: DEFAULT_TASK_CONCURRENCY,
        }
    }

    /// Listings in `cache` are invalidated after every run the service answered.
    pub fn with_tender_cache(mut self, cache: TenderListCache) -> Self {
        self.tender_cache = Some(cache);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Runs one source, or every enabled source when `source_id` is `None`.
    pub async fn run(&self, source_id: Option<SourceId>, limit: Option<u32>) -> TaskRunReport {
        let run_id = Uuid::new_v4();
        let request = TaskRunRequest {
            source_id,
            limit: limit.unwrap_or(DEFAULT_TASK_LIMIT),
        };
        let span = info_span!("task_run", %run_id, ?source_id, limit = request.limit);
        self.run_request(run_id, request).instrument(span).await
    }

    async fn run_request(&self, run_id: Uuid, request: TaskRunRequest) -> TaskRunReport {
        let report = match self.api.run_task(&request).await {
            Ok(response) => TaskRunReport {
                run_id,
                source_id: request.source_id,
                origin: RunOrigin::Reported,
                response,
            },
            Err(err) => {
                warn!(error = %err, "task run did not complete");
                TaskRunReport::from_error(run_id, request.source_id, &err)
            }
        };

        if !report.is_transport_failure() {
            if let Some(cache) = &self.tender_cache {
                let invalidated = cache.invalidate_all();
                info!(invalidated, "tender listings marked stale");
            }
        }
        info!(
            success = report.success(),
            origin = ?report.origin,
            results = report.response.results.len(),
            "task run finished"
        );
        report
    }

    /// Runs each target as its own request with bounded concurrency, then
    /// reduces the per-source outcomes with `policy`.
    pub async fn run_each(
        &self,
        targets: &[TaskTarget],
        limit: Option<u32>,
        policy: AggregationPolicy,
    ) -> FanOutReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("task_fan_out", %run_id, targets = targets.len(), ?policy);

        async {
            let reports: Vec<(&TaskTarget, TaskRunReport)> = stream::iter(targets)
                .map(|target| async move { (target, self.run(Some(target.id), limit).await) })
                .buffered(self.concurrency)
                .collect()
                .await;

            let results: Vec<TaskResult> = reports
                .into_iter()
                .flat_map(|(target, report)| results_for(target, report))
                .collect();
            let outcomes: Vec<SourceOutcome> = results.iter().map(classify).collect();
            let summary = TaskSummary::from_outcomes(&outcomes);
            let success = policy.verdict(&outcomes);
            let message = format!(
                "{}/{} sources succeeded",
                summary.succeeded,
                outcomes.len()
            );
            info!(success, %summary, "fan-out run finished");

            FanOutReport {
                run_id,
                policy,
                success,
                message,
                results,
                summary,
            }
        }
        .instrument(span)
        .await
    }
}

/// Per-source results of one targeted run. Runs that produced no result rows
/// but did not succeed are recorded as a failure named after the target.
fn results_for(target: &TaskTarget, report: TaskRunReport) -> Vec<TaskResult> {
    match report.origin {
        RunOrigin::Reported if !report.response.results.is_empty() => report.response.results,
        RunOrigin::Reported if report.response.success => Vec::new(),
        _ => vec![TaskResult::failed(
            target.name.clone(),
            report.response.message,
        )],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::filters::tender_list_cache;
    use crate::testing::{tender, Call, FakeApi};
    use tender_core::TenderFilters;

    fn ok_result(name: &str, scraped: u64, processed: u64) -> TaskResult {
        TaskResult {
            source_name: name.into(),
            scraped: Some(scraped),
            processed: Some(processed),
            filtered: Some(scraped - processed),
            errors: Some(0),
            error: None,
        }
    }

    fn source_seven_failure() -> TaskRunResponse {
        TaskRunResponse {
            success: false,
            message: "Task failed".into(),
            results: vec![TaskResult {
                scraped: Some(3),
                ..TaskResult::failed("gxzfcg", "fetch timed out after 30s")
            }],
        }
    }

    fn target(id: SourceId, name: &str) -> TaskTarget {
        TaskTarget {
            id,
            name: name.into(),
        }
    }

    #[tokio::test]
    async fn failing_source_reports_error_and_zero_trusted_counts() {
        let api = FakeApi::with_tenders(Vec::new());
        api.script_task(Some(7), source_seven_failure());
        let runner = TaskRunner::new(api.clone());

        let report = runner.run(Some(7), Some(10)).await;
        assert_eq!(report.origin, RunOrigin::Reported);
        assert!(!report.success());
        assert_eq!(
            api.calls(),
            vec![Call::RunTask(TaskRunRequest {
                source_id: Some(7),
                limit: 10
            })]
        );

        let outcomes = report.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(&outcomes[0], SourceOutcome::Failed { error, .. } if !error.is_empty()));
        let summary = report.summary();
        assert_eq!(summary.totals, TaskCounts::default());
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn service_verdict_is_not_recomputed() {
        let api = FakeApi::with_tenders(Vec::new());
        api.script_task(
            None,
            TaskRunResponse {
                success: true,
                message: "Task completed".into(),
                results: vec![
                    ok_result("ccgp", 10, 8),
                    TaskResult::failed("zjzfcg", "HTTP 503"),
                ],
            },
        );
        let report = TaskRunner::new(api).run(None, None).await;

        assert!(report.success());
        let summary = report.summary();
        assert_eq!((summary.succeeded, summary.failed), (1, 1));
        assert_eq!(summary.totals.processed, 8);
        assert_eq!(summary.totals.filtered, 2);
    }

    #[tokio::test]
    async fn transport_failure_is_distinct_from_empty_success() {
        let api = FakeApi::with_tenders(vec![tender(1, "a")]);
        let cache = tender_list_cache(api.clone(), CacheConfig::default());
        cache.get(&TenderFilters::default()).await;
        let runner = TaskRunner::new(api.clone()).with_tender_cache(cache.clone());

        api.fail_next(
            "run_task",
            ApiError::Transport("error sending request: connection refused".into()),
        );
        let failed = runner.run(None, None).await;
        assert!(failed.is_transport_failure());
        assert!(!failed.success());
        assert!(failed.response.results.is_empty());
        assert!(failed.message().contains("connection refused"));
        assert!(!cache.snapshot(&TenderFilters::default()).is_stale);

        let empty = runner.run(None, None).await;
        assert_eq!(empty.origin, RunOrigin::Reported);
        assert!(empty.success());
        assert!(empty.response.results.is_empty());
        assert!(cache.snapshot(&TenderFilters::default()).is_stale);
    }

    #[tokio::test]
    async fn rejected_run_surfaces_server_detail() {
        let api = FakeApi::with_tenders(Vec::new());
        api.fail_next(
            "run_task",
            ApiError::Status {
                status: 404,
                detail: "Source not found".into(),
            },
        );
        let report = TaskRunner::new(api).run(Some(99), None).await;
        assert_eq!(report.origin, RunOrigin::Rejected);
        assert_eq!(report.message(), "Source not found");
    }

    #[tokio::test]
    async fn run_each_captures_every_outcome_in_target_order() {
        let api = FakeApi::with_tenders(Vec::new());
        api.script_task(
            Some(1),
            TaskRunResponse {
                success: true,
                message: "ok".into(),
                results: vec![ok_result("ccgp", 5, 5)],
            },
        );
        api.script_task(Some(7), source_seven_failure());
        api.script_task(
            Some(9),
            TaskRunResponse {
                success: true,
                message: "ok".into(),
                results: vec![ok_result("hnzfcg", 4, 2)],
            },
        );
        let runner = TaskRunner::new(api.clone()).with_concurrency(2);
        let targets = [target(1, "ccgp"), target(7, "gxzfcg"), target(9, "hnzfcg")];

        let strict = runner
            .run_each(&targets, Some(10), AggregationPolicy::AnyFailure)
            .await;
        assert!(!strict.success);
        let names: Vec<_> = strict.results.iter().map(|r| r.source_name.as_str()).collect();
        assert_eq!(names, vec!["ccgp", "gxzfcg", "hnzfcg"]);
        assert_eq!(strict.summary.totals.scraped, 9);
        assert_eq!(strict.message, "2/3 sources succeeded");

        let lenient = runner
            .run_each(&targets, Some(10), AggregationPolicy::MajoritySuccess)
            .await;
        assert!(lenient.success);
        assert_eq!(api.count("run_task"), 6);
    }

    #[tokio::test]
    async fn run_each_turns_transport_errors_into_failed_results() {
        let api = FakeApi::with_tenders(Vec::new());
        api.fail_next("run_task", ApiError::Transport("timed out".into()));
        let runner = TaskRunner::new(api).with_concurrency(1);

        let report = runner
            .run_each(&[target(7, "gxzfcg")], None, AggregationPolicy::AtLeastOneSuccess)
            .await;
        assert!(!report.success);
        assert_eq!(
            report.results,
            vec![TaskResult::failed("gxzfcg", "request failed: timed out")]
        );
    }

    #[test]
    fn policies_reduce_outcomes() {
        let ok = classify(&ok_result("a", 1, 1));
        let bad = classify(&TaskResult::failed("b", "boom"));
        let blank = classify(&TaskResult {
            error: Some("  ".into()),
            ..ok_result("c", 1, 1)
        });
        assert!(blank.is_success());

        let mixed = [ok.clone(), bad.clone()];
        assert!(!AggregationPolicy::AnyFailure.verdict(&mixed));
        assert!(!AggregationPolicy::MajoritySuccess.verdict(&mixed));
        assert!(AggregationPolicy::AtLeastOneSuccess.verdict(&mixed));
        assert!(!AggregationPolicy::AtLeastOneSuccess.verdict(&[bad]));
        assert!(AggregationPolicy::AnyFailure.verdict(&[]));
    }
}
