//! Core domain model and wire contract types for the tender review layer.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};

pub mod display;
pub mod source_form;

pub use source_form::{SourceForm, SourceFormError};

pub const CRATE_NAME: &str = "tender-core";

pub type TenderId = i64;
pub type SourceId = i64;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const DEFAULT_TASK_LIMIT: u32 = 10;

/// A collected tender notice: raw collection fields, AI-extracted fields the
/// operator may correct, and derived status flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tender {
    pub id: TenderId,
    pub source_name: String,
    pub source_url: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub budget_amount: Option<f64>,
    #[serde(default)]
    pub budget_currency: Option<String>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub contact_person: Option<String>,
    #[serde(default)]
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub is_filtered: bool,
    #[serde(default)]
    pub filter_reason: Option<String>,
    pub is_manually_corrected: bool,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tender {
    pub fn correctable_fields(&self) -> CorrectableFields {
        CorrectableFields {
            project_name: self.project_name.clone(),
            budget_amount: self.budget_amount,
            budget_currency: self.budget_currency.clone(),
            deadline: self.deadline,
            contact_person: self.contact_person.clone(),
            contact_phone: self.contact_phone.clone(),
            contact_email: self.contact_email.clone(),
            location: self.location.clone(),
        }
    }
}

/// The operator-correctable subset of a [`Tender`]; doubles as the edit buffer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CorrectableFields {
    pub project_name: Option<String>,
    pub budget_amount: Option<f64>,
    pub budget_currency: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub contact_person: Option<String>,
    pub contact_phone: Option<String>,
    pub contact_email: Option<String>,
    pub location: Option<String>,
}

impl CorrectableFields {
    /// Builds a correction holding only the fields where `edited` differs from `self`.
    pub fn diff(&self, edited: &CorrectableFields) -> TenderCorrection {
        TenderCorrection {
            project_name: FieldEdit::between(&self.project_name, &edited.project_name),
            budget_amount: FieldEdit::between(&self.budget_amount, &edited.budget_amount),
            budget_currency: FieldEdit::between(&self.budget_currency, &edited.budget_currency),
            deadline: FieldEdit::between(&self.deadline, &edited.deadline),
            contact_person: FieldEdit::between(&self.contact_person, &edited.contact_person),
            contact_phone: FieldEdit::between(&self.contact_phone, &edited.contact_phone),
            contact_email: FieldEdit::between(&self.contact_email, &edited.contact_email),
            location: FieldEdit::between(&self.location, &edited.location),
        }
    }
}

/// Per-field intent inside a correction body.
///
/// `Unchanged` is omitted from the wire body, `Clear` is sent as `null`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FieldEdit<T> {
    #[default]
    Unchanged,
    Set(T),
    Clear,
}

impl<T: Clone + PartialEq> FieldEdit<T> {
    pub fn between(original: &Option<T>, edited: &Option<T>) -> Self {
        if original == edited {
            return FieldEdit::Unchanged;
        }
        match edited {
            Some(value) => FieldEdit::Set(value.clone()),
            None => FieldEdit::Clear,
        }
    }

    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(value) => FieldEdit::Set(value),
            None => FieldEdit::Unchanged,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self, FieldEdit::Unchanged)
    }

    pub fn apply(&self, target: &mut Option<T>) {
        match self {
            FieldEdit::Unchanged => {}
            FieldEdit::Set(value) => *target = Some(value.clone()),
            FieldEdit::Clear => *target = None,
        }
    }
}

impl<T: Serialize> Serialize for FieldEdit<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldEdit::Set(value) => value.serialize(serializer),
            FieldEdit::Unchanged | FieldEdit::Clear => serializer.serialize_none(),
        }
    }
}

fn always_true<S: Serializer>(_: &(), serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_bool(true)
}

/// Body of the tender update call. `is_manually_corrected` is always sent as `true`.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TenderCorrection {
    #[serde(skip_serializing_if = "FieldEdit::is_unchanged")]
    pub project_name: FieldEdit<String>,
    #[serde(skip_serializing_if = "FieldEdit::is_unchanged")]
    pub budget_amount: FieldEdit<f64>,
    #[serde(skip_serializing_if = "FieldEdit::is_unchanged")]
    pub budget_currency: FieldEdit<String>,
    #[serde(skip_serializing_if = "FieldEdit::is_unchanged")]
    pub deadline: FieldEdit<DateTime<Utc>>,
    #[serde(skip_serializing_if = "FieldEdit::is_unchanged")]
    pub contact_person: FieldEdit<String>,
    #[serde(skip_serializing_if = "FieldEdit::is_unchanged")]
    pub contact_phone: FieldEdit<String>,
    #[serde(skip_serializing_if = "FieldEdit::is_unchanged")]
    pub contact_email: FieldEdit<String>,
    #[serde(skip_serializing_if = "FieldEdit::is_unchanged")]
    pub location: FieldEdit<String>,
}

impl TenderCorrection {
    pub fn is_empty(&self) -> bool {
        self.project_name.is_unchanged()
            && self.budget_amount.is_unchanged()
            && self.budget_currency.is_unchanged()
            && self.deadline.is_unchanged()
            && self.contact_person.is_unchanged()
            && self.contact_phone.is_unchanged()
            && self.contact_email.is_unchanged()
            && self.location.is_unchanged()
    }

    /// Applies the edited field set to `tender` and marks it manually corrected.
    pub fn apply_to(&self, tender: &mut Tender) {
        self.project_name.apply(&mut tender.project_name);
        self.budget_amount.apply(&mut tender.budget_amount);
        self.budget_currency.apply(&mut tender.budget_currency);
        self.deadline.apply(&mut tender.deadline);
        self.contact_person.apply(&mut tender.contact_person);
        self.contact_phone.apply(&mut tender.contact_phone);
        self.contact_email.apply(&mut tender.contact_email);
        self.location.apply(&mut tender.location);
        tender.is_manually_corrected = true;
    }

    /// Wire body: the edited fields plus the forced correction flag.
    pub fn to_body(&self) -> TenderUpdateBody<'_> {
        TenderUpdateBody {
            fields: self,
            is_manually_corrected: (),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TenderUpdateBody<'a> {
    #[serde(flatten)]
    fields: &'a TenderCorrection,
    #[serde(serialize_with = "always_true")]
    is_manually_corrected: (),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScraperType {
    Http,
    Browser,
}

impl ScraperType {
    pub fn as_str(self) -> &'static str {
        match self {
            ScraperType::Http => "http",
            ScraperType::Browser => "browser",
        }
    }
}

impl fmt::Display for ScraperType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScraperType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(ScraperType::Http),
            "browser" => Ok(ScraperType::Browser),
            other => Err(format!("unknown scraper type `{other}` (expected http or browser)")),
        }
    }
}

/// Opaque scrape selector map; the Tender Store owns its shape.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScrapeConfig(pub Map<String, JsonValue>);

impl ScrapeConfig {
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Keyword and budget criteria the collaborator uses to mark tenders filtered.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_keywords: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_keywords: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_include: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_exclude: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_budget: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_budget: Option<f64>,
    /// Keys this layer does not model, passed through verbatim.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: SourceId,
    pub name: String,
    pub url: String,
    pub scraper_type: ScraperType,
    #[serde(default)]
    pub config: ScrapeConfig,
    #[serde(default)]
    pub filter_rules: Option<FilterRules>,
    pub is_active: bool,
    #[serde(default)]
    pub schedule_cron: Option<String>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create/Update body for a source definition.
///
/// The store applies updates with exclude-unset semantics, so the nullable
/// fields are [`FieldEdit`]s: `Unchanged` keeps the stored value and `Clear`
/// removes it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceConfigPayload {
    pub name: String,
    pub url: String,
    pub scraper_type: ScraperType,
    pub config: ScrapeConfig,
    #[serde(skip_serializing_if = "FieldEdit::is_unchanged")]
    pub filter_rules: FieldEdit<FilterRules>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(skip_serializing_if = "FieldEdit::is_unchanged")]
    pub schedule_cron: FieldEdit<String>,
}

/// Transient listing query parameters. Never persisted.
///
/// Equality and hashing compare budgets bit-wise (with `-0.0` folded into
/// `0.0`) so that deep-equal filters address the same cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenderFilters {
    pub skip: u32,
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_budget: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_budget: Option<f64>,
    pub include_filtered: bool,
}

impl Default for TenderFilters {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: DEFAULT_PAGE_SIZE,
            source_name: None,
            keyword: None,
            min_budget: None,
            max_budget: None,
            include_filtered: false,
        }
    }
}

fn budget_bits(value: Option<f64>) -> Option<u64> {
    value.map(|v| if v == 0.0 { 0.0f64.to_bits() } else { v.to_bits() })
}

impl TenderFilters {
    /// Query-string pairs in a fixed order; absent optional fields are omitted.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("skip", self.skip.to_string()),
            ("limit", self.limit.to_string()),
        ];
        if let Some(source_name) = &self.source_name {
            pairs.push(("source_name", source_name.clone()));
        }
        if let Some(keyword) = &self.keyword {
            pairs.push(("keyword", keyword.clone()));
        }
        if let Some(min) = self.min_budget {
            pairs.push(("min_budget", min.to_string()));
        }
        if let Some(max) = self.max_budget {
            pairs.push(("max_budget", max.to_string()));
        }
        pairs.push(("include_filtered", self.include_filtered.to_string()));
        pairs
    }
}

impl PartialEq for TenderFilters {
    fn eq(&self, other: &Self) -> bool {
        self.skip == other.skip
            && self.limit == other.limit
            && self.source_name == other.source_name
            && self.keyword == other.keyword
            && budget_bits(self.min_budget) == budget_bits(other.min_budget)
            && budget_bits(self.max_budget) == budget_bits(other.max_budget)
            && self.include_filtered == other.include_filtered
    }
}

impl Eq for TenderFilters {}

impl Hash for TenderFilters {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.skip.hash(state);
        self.limit.hash(state);
        self.source_name.hash(state);
        self.keyword.hash(state);
        budget_bits(self.min_budget).hash(state);
        budget_bits(self.max_budget).hash(state);
        self.include_filtered.hash(state);
    }
}

/// Pagination of the source listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourcePage {
    pub skip: u32,
    pub limit: u32,
}

impl Default for SourcePage {
    fn default() -> Self {
        Self { skip: 0, limit: 100 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<SourceId>,
    pub limit: u32,
}

impl Default for TaskRunRequest {
    fn default() -> Self {
        Self {
            source_id: None,
            limit: DEFAULT_TASK_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunResponse {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub results: Vec<TaskResult>,
}

/// Outcome of one source inside a task run. A non-empty `error` marks a
/// per-source failure whose counters are not trusted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub source_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraped: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filtered: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn failed(source_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.trim().is_empty())
    }

    pub fn is_failure(&self) -> bool {
        self.error_message().is_some()
    }
}
