//! In-memory `TenderApi` used by the controller tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use tender_api::{ApiError, TenderApi};
use tender_core::{
    ScraperType, SourceConfig, SourceConfigPayload, SourceId, SourcePage, TaskRunRequest,
    TaskRunResponse, Tender, TenderCorrection, TenderFilters, TenderId,
};
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    ListTenders(TenderFilters),
    GetTender(TenderId),
    UpdateTender(TenderId, TenderCorrection),
    ListSources(SourcePage),
    GetSource(SourceId),
    CreateSource(SourceConfigPayload),
    UpdateSource(SourceId, SourceConfigPayload),
    DeleteSource(SourceId),
    RunTask(TaskRunRequest),
}

impl Call {
    fn op(&self) -> &'static str {
        match self {
            Call::ListTenders(_) => "list_tenders",
            Call::GetTender(_) => "get_tender",
            Call::UpdateTender(..) => "update_tender",
            Call::ListSources(_) => "list_sources",
            Call::GetSource(_) => "get_source",
            Call::CreateSource(_) => "create_source",
            Call::UpdateSource(..) => "update_source",
            Call::DeleteSource(_) => "delete_source",
            Call::RunTask(_) => "run_task",
        }
    }
}

pub fn tender(id: TenderId, title: &str) -> Tender {
    let ts = Utc
        .with_ymd_and_hms(2025, 3, 1, 9, 30, 0)
        .single()
        .expect("valid fixture timestamp");
    Tender {
        id,
        source_name: "ccgp".into(),
        source_url: format!("https://example.gov.cn/notice/{id}"),
        title: title.to_string(),
        content: format!("{title} 公告正文"),
        project_name: None,
        budget_amount: None,
        budget_currency: None,
        deadline: None,
        contact_person: None,
        contact_phone: None,
        contact_email: None,
        location: None,
        is_filtered: false,
        filter_reason: None,
        is_manually_corrected: false,
        published_at: Some(ts),
        created_at: ts,
        updated_at: ts,
    }
}

pub fn source(id: SourceId, name: &str) -> SourceConfig {
    let ts = Utc
        .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
        .single()
        .expect("valid fixture timestamp");
    SourceConfig {
        id,
        name: name.to_string(),
        url: format!("https://{name}.example.gov.cn"),
        scraper_type: ScraperType::Http,
        config: Default::default(),
        filter_rules: None,
        is_active: true,
        schedule_cron: None,
        last_run_at: None,
        created_at: ts,
        updated_at: ts,
    }
}

/// Fake Tender Store. Listing applies the same filters the real service does,
/// failures are scripted per operation and consumed in order.
#[derive(Default)]
pub struct FakeApi {
    pub tenders: Mutex<Vec<Tender>>,
    pub sources: Mutex<Vec<SourceConfig>>,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<&'static str, VecDeque<ApiError>>>,
    task_responses: Mutex<HashMap<Option<SourceId>, TaskRunResponse>>,
    list_gate: Mutex<Option<Arc<Semaphore>>>,
    next_source_id: AtomicI64,
}

impl FakeApi {
    pub fn with_tenders(tenders: Vec<Tender>) -> Arc<Self> {
        let api = Self::default();
        *api.tenders.lock() = tenders;
        Arc::new(api)
    }

    pub fn with_sources(sources: Vec<SourceConfig>) -> Arc<Self> {
        let api = Self::default();
        let max_id = sources.iter().map(|s| s.id).max().unwrap_or(0);
        api.next_source_id.store(max_id, Ordering::SeqCst);
        *api.sources.lock() = sources;
        Arc::new(api)
    }

    pub fn fail_next(&self, op: &'static str, err: ApiError) {
        self.failures.lock().entry(op).or_default().push_back(err);
    }

    pub fn script_task(&self, source_id: Option<SourceId>, response: TaskRunResponse) {
        self.task_responses.lock().insert(source_id, response);
    }

    /// Holds every subsequent `list_tenders` until the returned gate grants a permit.
    pub fn gate_listing(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.list_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.op() == op).count()
    }

    fn record(&self, call: Call) -> Result<(), ApiError> {
        let op = call.op();
        self.calls.lock().push(call);
        match self.failures.lock().get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn not_found(what: &str) -> ApiError {
    ApiError::Status {
        status: 404,
        detail: format!("{what} not found"),
    }
}

fn matches(tender: &Tender, filters: &TenderFilters) -> bool {
    if !filters.include_filtered && tender.is_filtered {
        return false;
    }
    if let Some(name) = &filters.source_name {
        if &tender.source_name != name {
            return false;
        }
    }
    if let Some(keyword) = &filters.keyword {
        if !tender.title.contains(keyword.as_str()) && !tender.content.contains(keyword.as_str()) {
            return false;
        }
    }
    if let Some(min) = filters.min_budget {
        if tender.budget_amount.map_or(true, |b| b < min) {
            return false;
        }
    }
    if let Some(max) = filters.max_budget {
        if tender.budget_amount.map_or(true, |b| b > max) {
            return false;
        }
    }
    true
}

#[async_trait]
impl TenderApi for FakeApi {
    async fn list_tenders(&self, filters: &TenderFilters) -> Result<Vec<Tender>, ApiError> {
        let gate = self.list_gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.record(Call::ListTenders(filters.clone()))?;
        Ok(self
            .tenders
            .lock()
            .iter()
            .filter(|t| matches(t, filters))
            .skip(filters.skip as usize)
            .take(filters.limit as usize)
            .cloned()
            .collect())
    }

    async fn get_tender(&self, id: TenderId) -> Result<Tender, ApiError> {
        self.record(Call::GetTender(id))?;
        self.tenders
            .lock()
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| not_found("Tender"))
    }

    async fn update_tender(
        &self,
        id: TenderId,
        correction: &TenderCorrection,
    ) -> Result<Tender, ApiError> {
        self.record(Call::UpdateTender(id, correction.clone()))?;
        let mut tenders = self.tenders.lock();
        let tender = tenders
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| not_found("Tender"))?;
        correction.apply_to(tender);
        Ok(tender.clone())
    }

    async fn list_sources(&self, page: SourcePage) -> Result<Vec<SourceConfig>, ApiError> {
        self.record(Call::ListSources(page))?;
        Ok(self
            .sources
            .lock()
            .iter()
            .skip(page.skip as usize)
            .take(page.limit as usize)
            .cloned()
            .collect())
    }

    async fn get_source(&self, id: SourceId) -> Result<SourceConfig, ApiError> {
        self.record(Call::GetSource(id))?;
        self.sources
            .lock()
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| not_found("Source"))
    }

    async fn create_source(&self, payload: &SourceConfigPayload) -> Result<SourceConfig, ApiError> {
        self.record(Call::CreateSource(payload.clone()))?;
        let id = self.next_source_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut created = source(id, &payload.name);
        created.url = payload.url.clone();
        created.scraper_type = payload.scraper_type;
        created.config = payload.config.clone();
        created.filter_rules = None;
        payload.filter_rules.apply(&mut created.filter_rules);
        created.is_active = payload.is_active.unwrap_or(true);
        created.schedule_cron = None;
        payload.schedule_cron.apply(&mut created.schedule_cron);
        self.sources.lock().push(created.clone());
        Ok(created)
    }

    async fn update_source(
        &self,
        id: SourceId,
        payload: &SourceConfigPayload,
    ) -> Result<SourceConfig, ApiError> {
        self.record(Call::UpdateSource(id, payload.clone()))?;
        let mut sources = self.sources.lock();
        let existing = sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| not_found("Source"))?;
        // Fields left out of the body keep their stored values; name and
        // scraper type are not part of the store's update schema.
        existing.url = payload.url.clone();
        existing.config = payload.config.clone();
        payload.filter_rules.apply(&mut existing.filter_rules);
        if let Some(active) = payload.is_active {
            existing.is_active = active;
        }
        payload.schedule_cron.apply(&mut existing.schedule_cron);
        Ok(existing.clone())
    }

    async fn delete_source(&self, id: SourceId) -> Result<(), ApiError> {
        self.record(Call::DeleteSource(id))?;
        let mut sources = self.sources.lock();
        let before = sources.len();
        sources.retain(|s| s.id != id);
        if sources.len() == before {
            return Err(not_found("Source"));
        }
        Ok(())
    }

    async fn run_task(&self, request: &TaskRunRequest) -> Result<TaskRunResponse, ApiError> {
        self.record(Call::RunTask(request.clone()))?;
        Ok(self
            .task_responses
            .lock()
            .get(&request.source_id)
            .cloned()
            .unwrap_or(TaskRunResponse {
                success: true,
                message: "Task completed".into(),
                results: Vec::new(),
            }))
    }
}
