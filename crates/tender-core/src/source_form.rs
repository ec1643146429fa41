//! Parse-validate boundary for operator-entered source definitions.
//!
//! `config` and `filter_rules` arrive as free text. They are parsed into
//! [`ScrapeConfig`] and [`FilterRules`] here, before any request is built, so
//! malformed text never reaches the Tender Store. Selector keys inside
//! `config` are not checked; the store consumes that shape.

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::{FieldEdit, FilterRules, ScrapeConfig, ScraperType, SourceConfig, SourceConfigPayload};

#[derive(Debug, Error)]
pub enum SourceFormError {
    #[error("name must not be empty")]
    MissingName,
    #[error("url must not be empty")]
    MissingUrl,
    #[error("config is not valid JSON: {0}")]
    ConfigSyntax(#[source] serde_json::Error),
    #[error("config must be a JSON object")]
    ConfigNotObject,
    #[error("filter_rules is not valid: {0}")]
    FilterRulesSyntax(#[source] serde_json::Error),
    #[error("filter_rules min_budget {min} is greater than max_budget {max}")]
    BudgetRange { min: f64, max: f64 },
    #[error("{field} cannot be changed once the source exists")]
    Immutable { field: &'static str },
}

impl SourceFormError {
    /// True for the malformed-text family, reported to operators as "check your format".
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            SourceFormError::ConfigSyntax(_)
                | SourceFormError::ConfigNotObject
                | SourceFormError::FilterRulesSyntax(_)
        )
    }

    pub fn field(&self) -> &'static str {
        match self {
            SourceFormError::MissingName => "name",
            SourceFormError::MissingUrl => "url",
            SourceFormError::ConfigSyntax(_) | SourceFormError::ConfigNotObject => "config",
            SourceFormError::FilterRulesSyntax(_) | SourceFormError::BudgetRange { .. } => {
                "filter_rules"
            }
            SourceFormError::Immutable { field } => *field,
        }
    }
}

/// Editable form state for creating or updating a source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceForm {
    pub name: String,
    pub url: String,
    pub scraper_type: ScraperType,
    pub config_text: String,
    /// Blank means "no filter rules".
    pub filter_rules_text: String,
    pub is_active: Option<bool>,
    /// Blank means "no schedule".
    pub schedule_cron: Option<String>,
}

impl Default for SourceForm {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: String::new(),
            scraper_type: ScraperType::Http,
            config_text: "{}".to_string(),
            filter_rules_text: String::new(),
            is_active: Some(true),
            schedule_cron: None,
        }
    }
}

impl SourceForm {
    /// Loads an existing source into the form, pretty-printing its JSON fields.
    pub fn from_source(source: &SourceConfig) -> Self {
        let config_text = format!("{:#}", JsonValue::Object(source.config.0.clone()));
        let filter_rules_text = source
            .filter_rules
            .as_ref()
            .and_then(|rules| serde_json::to_value(rules).ok())
            .map(|value| format!("{value:#}"))
            .unwrap_or_default();
        Self {
            name: source.name.clone(),
            url: source.url.clone(),
            scraper_type: source.scraper_type,
            config_text,
            filter_rules_text,
            is_active: Some(source.is_active),
            schedule_cron: source.schedule_cron.clone(),
        }
    }

    /// Validates the form as a new source. Blank rules and schedule are omitted.
    pub fn validate(&self) -> Result<SourceConfigPayload, SourceFormError> {
        let parsed = self.parse()?;
        Ok(SourceConfigPayload {
            name: parsed.name,
            url: parsed.url,
            scraper_type: self.scraper_type,
            config: parsed.config,
            filter_rules: FieldEdit::from_option(parsed.filter_rules),
            is_active: self.is_active,
            schedule_cron: FieldEdit::from_option(parsed.schedule_cron),
        })
    }

    /// Validates the form as an edit of `original`.
    ///
    /// Rules and schedule are diffed against the stored source: untouched ones
    /// are left out of the body, blanked ones are sent as `null` so the store
    /// drops them. Name and scraper type are fixed at creation.
    pub fn validate_update(
        &self,
        original: &SourceConfig,
    ) -> Result<SourceConfigPayload, SourceFormError> {
        let parsed = self.parse()?;
        if parsed.name != original.name {
            return Err(SourceFormError::Immutable { field: "name" });
        }
        if self.scraper_type != original.scraper_type {
            return Err(SourceFormError::Immutable {
                field: "scraper_type",
            });
        }
        Ok(SourceConfigPayload {
            name: parsed.name,
            url: parsed.url,
            scraper_type: self.scraper_type,
            config: parsed.config,
            filter_rules: FieldEdit::between(&original.filter_rules, &parsed.filter_rules),
            is_active: self.is_active,
            schedule_cron: FieldEdit::between(&original.schedule_cron, &parsed.schedule_cron),
        })
    }

    fn parse(&self) -> Result<ParsedForm, SourceFormError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(SourceFormError::MissingName);
        }
        let url = self.url.trim();
        if url.is_empty() {
            return Err(SourceFormError::MissingUrl);
        }

        Ok(ParsedForm {
            name: name.to_string(),
            url: url.to_string(),
            config: parse_config(&self.config_text)?,
            filter_rules: parse_filter_rules(&self.filter_rules_text)?,
            schedule_cron: self
                .schedule_cron
                .as_deref()
                .map(str::trim)
                .filter(|cron| !cron.is_empty())
                .map(ToString::to_string),
        })
    }
}

struct ParsedForm {
    name: String,
    url: String,
    config: ScrapeConfig,
    filter_rules: Option<FilterRules>,
    schedule_cron: Option<String>,
}

pub fn parse_config(text: &str) -> Result<ScrapeConfig, SourceFormError> {
    let value: JsonValue = serde_json::from_str(text).map_err(SourceFormError::ConfigSyntax)?;
    match value {
        JsonValue::Object(map) => Ok(ScrapeConfig(map)),
        _ => Err(SourceFormError::ConfigNotObject),
    }
}

pub fn parse_filter_rules(text: &str) -> Result<Option<FilterRules>, SourceFormError> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    let rules: Option<FilterRules> =
        serde_json::from_str(text).map_err(SourceFormError::FilterRulesSyntax)?;
    if let Some(FilterRules {
        min_budget: Some(min),
        max_budget: Some(max),
        ..
    }) = &rules
    {
        if min > max {
            return Err(SourceFormError::BudgetRange {
                min: *min,
                max: *max,
            });
        }
    }
    Ok(rules)
}
