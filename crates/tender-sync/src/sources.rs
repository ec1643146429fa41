//! Source definitions: cached listing plus validated create, update and delete.

use std::sync::Arc;

use futures::FutureExt;
use tender_api::{ApiError, TenderApi};
use tender_core::{SourceConfig, SourceForm, SourceFormError, SourceId, SourcePage};
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::{CacheConfig, QueryCache, QuerySnapshot};
use crate::tasks::TaskTarget;

pub type SourceListCache = QueryCache<SourcePage, Vec<SourceConfig>>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Form(#[from] SourceFormError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl SourceError {
    /// Operator-facing message. JSON problems collapse to a format hint.
    pub fn user_message(&self) -> String {
        match self {
            SourceError::Form(err) if err.is_format_error() => {
                format!("{} is not valid JSON, please check the format", err.field())
            }
            other => other.to_string(),
        }
    }
}

pub struct SourceManager {
    api: Arc<dyn TenderApi>,
    cache: SourceListCache,
    page: SourcePage,
}

impl SourceManager {
    pub fn new(api: Arc<dyn TenderApi>, config: CacheConfig) -> Self {
        let fetch_api = Arc::clone(&api);
        let cache = QueryCache::new(config, move |page: SourcePage| {
            let api = Arc::clone(&fetch_api);
            async move { api.list_sources(page).await }.boxed()
        });
        Self {
            api,
            cache,
            page: SourcePage::default(),
        }
    }

    pub fn with_page(mut self, page: SourcePage) -> Self {
        self.page = page;
        self
    }

    pub fn cache(&self) -> &SourceListCache {
        &self.cache
    }

    pub async fn list(&self) -> QuerySnapshot<Vec<SourceConfig>> {
        self.cache.get(&self.page).await
    }

    pub async fn get(&self, id: SourceId) -> Result<SourceConfig, SourceError> {
        Ok(self.api.get_source(id).await?)
    }

    /// Validates `form` and creates a source, or updates `editing` (the
    /// stored source the form was loaded from) when set. Invalid forms never
    /// reach the network.
    pub async fn submit(
        &self,
        form: &SourceForm,
        editing: Option<&SourceConfig>,
    ) -> Result<SourceConfig, SourceError> {
        let saved = match editing {
            Some(original) => {
                let payload = form.validate_update(original)?;
                self.api.update_source(original.id, &payload).await
            }
            None => {
                let payload = form.validate()?;
                self.api.create_source(&payload).await
            }
        }
        .inspect_err(|err| warn!(name = %form.name, error = %err, "source save rejected"))?;

        info!(source_id = saved.id, name = %saved.name, updated = editing.is_some(), "source saved");
        self.refresh().await;
        Ok(saved)
    }

    pub async fn delete(&self, id: SourceId) -> Result<(), SourceError> {
        self.api
            .delete_source(id)
            .await
            .inspect_err(|err| warn!(source_id = id, error = %err, "source delete rejected"))?;
        info!(source_id = id, "source deleted");
        self.refresh().await;
        Ok(())
    }

    /// Active sources from the current listing, as task run targets.
    pub async fn enabled_targets(&self) -> Vec<TaskTarget> {
        self.list()
            .await
            .data
            .unwrap_or_default()
            .into_iter()
            .filter(|source| source.is_active)
            .map(|source| TaskTarget {
                id: source.id,
                name: source.name,
            })
            .collect()
    }

    async fn refresh(&self) {
        self.cache.invalidate_all();
        if let Err(err) = self.cache.refetch(&self.page).await {
            warn!(error = %err, "source list refresh failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{source, FakeApi};
    use tender_core::FilterRules;

    fn manager(api: &Arc<FakeApi>) -> SourceManager {
        SourceManager::new(api.clone(), CacheConfig::default())
    }

    fn form(name: &str, config: &str) -> SourceForm {
        SourceForm {
            name: name.into(),
            url: "https://www.ccgp.gov.cn".into(),
            config_text: config.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn malformed_config_blocks_submission() {
        let api = FakeApi::with_sources(vec![source(1, "ccgp")]);
        let sources = manager(&api);

        let err = sources
            .submit(&form("zj", "{list_selector: li"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Form(ref e) if e.is_format_error()));
        assert_eq!(
            err.user_message(),
            "config is not valid JSON, please check the format"
        );

        let existing = sources.get(1).await.unwrap();
        let mut bad_rules = SourceForm::from_source(&existing);
        bad_rules.filter_rules_text = "[1,".into();
        assert!(sources.submit(&bad_rules, Some(&existing)).await.is_err());

        assert_eq!(api.count("create_source"), 0);
        assert_eq!(api.count("update_source"), 0);
    }

    #[tokio::test]
    async fn create_then_list_reflects_new_source() {
        let api = FakeApi::with_sources(vec![source(1, "ccgp")]);
        let sources = manager(&api);
        assert_eq!(sources.list().await.data.unwrap().len(), 1);

        let created = sources
            .submit(&form("zjzfcg", r#"{"list_selector": "ul li"}"#), None)
            .await
            .unwrap();
        assert_eq!(created.id, 2);

        let listed = sources.cache().snapshot(&SourcePage::default());
        assert_eq!(listed.data.unwrap().len(), 2);
        assert!(!listed.is_stale);
    }

    #[tokio::test]
    async fn update_uses_the_editing_id() {
        let api = FakeApi::with_sources(vec![source(4, "ccgp")]);
        let sources = manager(&api);
        let existing = sources.get(4).await.unwrap();

        let mut edit = SourceForm::from_source(&existing);
        edit.is_active = Some(false);
        let saved = sources.submit(&edit, Some(&existing)).await.unwrap();

        assert_eq!(saved.id, 4);
        assert!(!saved.is_active);
        assert!(sources.enabled_targets().await.is_empty());
    }

    #[tokio::test]
    async fn clearing_rules_on_update_removes_them_from_the_store() {
        let mut stored = source(5, "ccgp");
        stored.filter_rules = Some(FilterRules {
            include_keywords: Some(vec!["道路".into()]),
            ..Default::default()
        });
        stored.schedule_cron = Some("0 6 * * *".into());
        let api = FakeApi::with_sources(vec![stored]);
        let sources = manager(&api);
        let existing = sources.get(5).await.unwrap();

        let mut keep = SourceForm::from_source(&existing);
        keep.url = "https://www.ccgp.gov.cn/cggg".into();
        let saved = sources.submit(&keep, Some(&existing)).await.unwrap();
        assert!(saved.filter_rules.is_some());
        assert_eq!(saved.schedule_cron.as_deref(), Some("0 6 * * *"));

        let mut clear = SourceForm::from_source(&saved);
        clear.filter_rules_text = String::new();
        let saved = sources.submit(&clear, Some(&saved)).await.unwrap();
        assert!(saved.filter_rules.is_none());
        assert_eq!(saved.schedule_cron.as_deref(), Some("0 6 * * *"));
        assert!(api.sources.lock()[0].filter_rules.is_none());
    }

    #[tokio::test]
    async fn renaming_on_update_is_rejected_before_any_call() {
        let api = FakeApi::with_sources(vec![source(2, "ccgp")]);
        let sources = manager(&api);
        let existing = sources.get(2).await.unwrap();

        let mut edit = SourceForm::from_source(&existing);
        edit.name = "zjzfcg".into();
        let err = sources.submit(&edit, Some(&existing)).await.unwrap_err();
        assert_eq!(err.user_message(), "name cannot be changed once the source exists");
        assert_eq!(api.count("update_source"), 0);
    }

    #[tokio::test]
    async fn delete_failure_surfaces_server_detail() {
        let api = FakeApi::with_sources(vec![source(7, "ccgp")]);
        let sources = manager(&api);
        api.fail_next(
            "delete_source",
            ApiError::Status {
                status: 400,
                detail: "Source is referenced by existing tenders".into(),
            },
        );

        let err = sources.delete(7).await.unwrap_err();
        assert_eq!(err.user_message(), "Source is referenced by existing tenders");
        assert_eq!(api.sources.lock().len(), 1);

        sources.delete(7).await.unwrap();
        assert!(sources.list().await.data.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enabled_targets_skip_inactive_sources() {
        let mut paused = source(2, "paused");
        paused.is_active = false;
        let api = FakeApi::with_sources(vec![source(1, "ccgp"), paused, source(3, "zj")]);
        let targets = manager(&api).enabled_targets().await;
        let ids: Vec<_> = targets.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
