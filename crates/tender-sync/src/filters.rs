//! Listing filter and pagination state, and the list view built on it.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use tender_api::TenderApi;
use tender_core::{Tender, TenderFilters, DEFAULT_PAGE_SIZE};
use thiserror::Error;
use tracing::debug;

use crate::cache::{CacheConfig, QueryCache, QueryObserver, QuerySnapshot};

pub type TenderListCache = QueryCache<TenderFilters, Vec<Tender>>;

/// Tender list cache keyed by the full filter set.
pub fn tender_list_cache(api: Arc<dyn TenderApi>, config: CacheConfig) -> TenderListCache {
    QueryCache::new(config, move |filters: TenderFilters| {
        let api = Arc::clone(&api);
        async move { api.list_tenders(&filters).await }.boxed()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    Idle,
    Editing,
    Applied,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("page size must be greater than zero")]
    ZeroPageSize,
    #[error("pages are numbered from 1")]
    ZeroPage,
}

/// Operator-editable filter fields. Blank strings mean "no filter".
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterDraft {
    pub keyword: String,
    pub source_name: String,
    pub min_budget: Option<f64>,
    pub max_budget: Option<f64>,
    pub include_filtered: bool,
}

impl FilterDraft {
    fn from_filters(filters: &TenderFilters) -> Self {
        Self {
            keyword: filters.keyword.clone().unwrap_or_default(),
            source_name: filters.source_name.clone().unwrap_or_default(),
            min_budget: filters.min_budget,
            max_budget: filters.max_budget,
            include_filtered: filters.include_filtered,
        }
    }

    fn apply_to(&self, filters: &mut TenderFilters) {
        filters.keyword = non_blank(&self.keyword);
        filters.source_name = non_blank(&self.source_name);
        filters.min_budget = self.min_budget;
        filters.max_budget = self.max_budget;
        filters.include_filtered = self.include_filtered;
    }
}

fn non_blank(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Total {
    /// Count reported by the server.
    Exact(u64),
    /// Loaded rows plus the rows skipped before them; a lower bound.
    Approximate(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    /// 1-based.
    pub page: u32,
    pub page_size: u32,
    pub total: Total,
}

/// Owns the applied listing query and derives a new cache key on every change.
#[derive(Debug, Clone)]
pub struct FilterController {
    state: FilterState,
    applied: TenderFilters,
    draft: Option<FilterDraft>,
    default_page_size: u32,
}

impl Default for FilterController {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl FilterController {
    /// A zero page size falls back to the default of 20.
    pub fn new(page_size: u32) -> Self {
        let default_page_size = if page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            page_size
        };
        Self {
            state: FilterState::Idle,
            applied: Self::defaults(default_page_size),
            draft: None,
            default_page_size,
        }
    }

    fn defaults(page_size: u32) -> TenderFilters {
        TenderFilters {
            limit: page_size,
            ..TenderFilters::default()
        }
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    /// The current cache key.
    pub fn applied(&self) -> &TenderFilters {
        &self.applied
    }

    pub fn draft(&self) -> Option<&FilterDraft> {
        self.draft.as_ref()
    }

    /// Opens (or resumes) a draft seeded from the applied filters.
    pub fn edit(&mut self) -> &mut FilterDraft {
        self.state = FilterState::Editing;
        let applied = &self.applied;
        self.draft.get_or_insert_with(|| FilterDraft::from_filters(applied))
    }

    /// Applies the draft and returns to page one with the page size unchanged.
    pub fn submit(&mut self) -> TenderFilters {
        if let Some(draft) = self.draft.take() {
            draft.apply_to(&mut self.applied);
        }
        self.applied.skip = 0;
        self.state = FilterState::Applied;
        debug!(filters = ?self.applied, "filters applied");
        self.applied.clone()
    }

    /// Moves to `page` (1-based). Other filter fields and any open draft are untouched.
    pub fn set_page(&mut self, page: u32, page_size: u32) -> Result<TenderFilters, FilterError> {
        if page_size == 0 {
            return Err(FilterError::ZeroPageSize);
        }
        if page == 0 {
            return Err(FilterError::ZeroPage);
        }
        self.applied.limit = page_size;
        self.applied.skip = (page - 1).saturating_mul(page_size);
        if self.state == FilterState::Idle {
            self.state = FilterState::Applied;
        }
        Ok(self.applied.clone())
    }

    pub fn reset(&mut self) -> TenderFilters {
        self.applied = Self::defaults(self.default_page_size);
        self.draft = None;
        self.state = FilterState::Idle;
        self.applied.clone()
    }

    /// Page position with an approximate total derived from the loaded rows.
    pub fn page_info(&self, loaded_rows: usize) -> PageInfo {
        let loaded = u64::try_from(loaded_rows).unwrap_or(u64::MAX);
        self.page_info_with(Total::Approximate(
            loaded.saturating_add(u64::from(self.applied.skip)),
        ))
    }

    pub fn page_info_exact(&self, total: u64) -> PageInfo {
        self.page_info_with(Total::Exact(total))
    }

    fn page_info_with(&self, total: Total) -> PageInfo {
        let limit = self.applied.limit.max(1);
        PageInfo {
            page: self.applied.skip / limit + 1,
            page_size: self.applied.limit,
            total,
        }
    }
}

/// Filter controller bound to the tender list cache.
///
/// The view observes the current key plus any earlier key whose fetch is
/// still in flight, so switching keys never cancels an earlier fetch. Once
/// such a fetch settles its observer is released and focus or reconnect
/// revalidation only reaches the key on screen.
pub struct TenderListView {
    controller: FilterController,
    cache: TenderListCache,
    observers: HashMap<TenderFilters, QueryObserver<TenderFilters, Vec<Tender>>>,
}

impl TenderListView {
    pub fn new(cache: TenderListCache, page_size: u32) -> Self {
        Self {
            controller: FilterController::new(page_size),
            cache,
            observers: HashMap::new(),
        }
    }

    pub fn controller(&self) -> &FilterController {
        &self.controller
    }

    pub fn edit(&mut self) -> &mut FilterDraft {
        self.controller.edit()
    }

    pub fn key(&self) -> &TenderFilters {
        self.controller.applied()
    }

    pub fn cache(&self) -> &TenderListCache {
        &self.cache
    }

    fn watch(&mut self, key: &TenderFilters) {
        self.release_settled();
        if !self.observers.contains_key(key) {
            let observer = self.cache.observe(key);
            self.observers.insert(key.clone(), observer);
        }
    }

    /// Drops observers of keys that are off screen and have no fetch in flight.
    fn release_settled(&mut self) {
        let current = self.controller.applied();
        let cache = &self.cache;
        self.observers
            .retain(|key, _| key == current || cache.snapshot(key).is_validating);
    }

    /// Number of keys the view currently holds observers for.
    pub fn observed_keys(&self) -> usize {
        self.observers.len()
    }

    pub async fn load(&mut self) -> QuerySnapshot<Vec<Tender>> {
        let key = self.controller.applied().clone();
        self.watch(&key);
        let snapshot = self.cache.get(&key).await;
        self.release_settled();
        snapshot
    }

    pub fn current(&self) -> QuerySnapshot<Vec<Tender>> {
        self.cache.snapshot(self.controller.applied())
    }

    pub async fn submit(&mut self) -> QuerySnapshot<Vec<Tender>> {
        self.controller.submit();
        self.load().await
    }

    pub async fn set_page(
        &mut self,
        page: u32,
        page_size: u32,
    ) -> Result<QuerySnapshot<Vec<Tender>>, FilterError> {
        self.controller.set_page(page, page_size)?;
        Ok(self.load().await)
    }

    /// Applies the draft and jumps straight to `page` with a single fetch.
    pub async fn submit_page(
        &mut self,
        page: u32,
        page_size: u32,
    ) -> Result<QuerySnapshot<Vec<Tender>>, FilterError> {
        if page_size == 0 {
            return Err(FilterError::ZeroPageSize);
        }
        if page == 0 {
            return Err(FilterError::ZeroPage);
        }
        self.controller.submit();
        self.set_page(page, page_size).await
    }

    /// Returns to the default filters and refetches them even when cached.
    pub async fn reset(&mut self) -> QuerySnapshot<Vec<Tender>> {
        let key = self.controller.reset();
        self.watch(&key);
        if let Err(err) = self.cache.refetch(&key).await {
            debug!(error = %err, "reset refetch failed");
        }
        self.release_settled();
        self.cache.snapshot(&key)
    }

    pub fn page_info(&self) -> PageInfo {
        let loaded = self.current().data.map_or(0, |rows| rows.len());
        self.controller.page_info(loaded)
    }
}
