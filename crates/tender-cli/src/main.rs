mod display;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tender_core::{CorrectableFields, ScraperType, SourceForm, SourceId, TenderId};
use tender_sync::{
    AggregationPolicy, ReviewConfig, ReviewSession, SaveOutcome, SourceError, TenderApi,
    TenderListView,
};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "tender-review")]
#[command(about = "Review tenders, manage scrape sources and trigger runs")]
struct Cli {
    /// Overrides TENDER_API_URL.
    #[arg(long, global = true)]
    api_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(subcommand)]
    Tenders(TenderCommand),
    #[command(subcommand)]
    Sources(SourceCommand),
    /// Trigger a scrape run.
    Run(RunArgs),
}

#[derive(Debug, Subcommand)]
enum TenderCommand {
    List(ListArgs),
    Show { id: TenderId },
    /// Overwrite extracted fields; the tender is marked manually corrected.
    Correct(CorrectArgs),
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long)]
    keyword: Option<String>,
    #[arg(long)]
    source_name: Option<String>,
    #[arg(long)]
    min_budget: Option<f64>,
    #[arg(long)]
    max_budget: Option<f64>,
    #[arg(long)]
    include_filtered: bool,
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long)]
    page_size: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CorrectableField {
    ProjectName,
    BudgetAmount,
    BudgetCurrency,
    Deadline,
    ContactPerson,
    ContactPhone,
    ContactEmail,
    Location,
}

#[derive(Debug, Args)]
struct CorrectArgs {
    id: TenderId,
    #[arg(long)]
    project_name: Option<String>,
    #[arg(long)]
    budget_amount: Option<f64>,
    #[arg(long)]
    budget_currency: Option<String>,
    /// RFC 3339, e.g. 2025-04-02T17:00:00+08:00
    #[arg(long)]
    deadline: Option<DateTime<Utc>>,
    #[arg(long)]
    contact_person: Option<String>,
    #[arg(long)]
    contact_phone: Option<String>,
    #[arg(long)]
    contact_email: Option<String>,
    #[arg(long)]
    location: Option<String>,
    /// Clear a field (repeatable).
    #[arg(long, value_enum)]
    clear: Vec<CorrectableField>,
}

impl CorrectArgs {
    fn apply(&self, buffer: &mut CorrectableFields) {
        fn set<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                target.clone_from(value);
            }
        }
        set(&mut buffer.project_name, &self.project_name);
        set(&mut buffer.budget_amount, &self.budget_amount);
        set(&mut buffer.budget_currency, &self.budget_currency);
        set(&mut buffer.deadline, &self.deadline);
        set(&mut buffer.contact_person, &self.contact_person);
        set(&mut buffer.contact_phone, &self.contact_phone);
        set(&mut buffer.contact_email, &self.contact_email);
        set(&mut buffer.location, &self.location);

        for field in &self.clear {
            match field {
                CorrectableField::ProjectName => buffer.project_name = None,
                CorrectableField::BudgetAmount => buffer.budget_amount = None,
                CorrectableField::BudgetCurrency => buffer.budget_currency = None,
                CorrectableField::Deadline => buffer.deadline = None,
                CorrectableField::ContactPerson => buffer.contact_person = None,
                CorrectableField::ContactPhone => buffer.contact_phone = None,
                CorrectableField::ContactEmail => buffer.contact_email = None,
                CorrectableField::Location => buffer.location = None,
            }
        }
    }
}

#[derive(Debug, Subcommand)]
enum SourceCommand {
    List,
    Create(SourceArgs),
    /// Fields not given keep their current values. Name and scraper type are
    /// fixed once a source exists.
    Update {
        id: SourceId,
        #[command(flatten)]
        fields: SourceArgs,
    },
    Delete { id: SourceId },
}

#[derive(Debug, Args)]
struct SourceArgs {
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    url: Option<String>,
    #[arg(long)]
    scraper_type: Option<ScraperType>,
    /// Scrape config as JSON text.
    #[arg(long, conflicts_with = "config_file")]
    config: Option<String>,
    #[arg(long)]
    config_file: Option<PathBuf>,
    /// Filter rules as JSON text; an empty string removes them.
    #[arg(long)]
    filter_rules: Option<String>,
    #[arg(long)]
    active: Option<bool>,
    /// Cron expression; an empty string removes the schedule.
    #[arg(long)]
    schedule_cron: Option<String>,
}

impl SourceArgs {
    fn apply(self, form: &mut SourceForm) -> Result<()> {
        if let Some(name) = self.name {
            form.name = name;
        }
        if let Some(url) = self.url {
            form.url = url;
        }
        if let Some(scraper_type) = self.scraper_type {
            form.scraper_type = scraper_type;
        }
        if let Some(path) = self.config_file {
            form.config_text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
        } else if let Some(config) = self.config {
            form.config_text = config;
        }
        if let Some(rules) = self.filter_rules {
            form.filter_rules_text = rules;
        }
        if self.active.is_some() {
            form.is_active = self.active;
        }
        if self.schedule_cron.is_some() {
            form.schedule_cron = self.schedule_cron;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    AnyFailure,
    Majority,
    AtLeastOne,
}

impl From<PolicyArg> for AggregationPolicy {
    fn from(value: PolicyArg) -> Self {
        match value {
            PolicyArg::AnyFailure => AggregationPolicy::AnyFailure,
            PolicyArg::Majority => AggregationPolicy::MajoritySuccess,
            PolicyArg::AtLeastOne => AggregationPolicy::AtLeastOneSuccess,
        }
    }
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Omit to run every enabled source.
    #[arg(long)]
    source_id: Option<SourceId>,
    /// Max items per source (TENDER_TASK_LIMIT when omitted).
    #[arg(long)]
    limit: Option<u32>,
    /// Run every enabled source as its own request and reduce the outcomes locally.
    #[arg(long, conflicts_with = "source_id")]
    each: bool,
    /// Verdict rule for --each.
    #[arg(long, value_enum, default_value = "any-failure")]
    policy: PolicyArg,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = ReviewConfig::from_env();
    if let Some(api_url) = cli.api_url {
        config.api_url = api_url;
    }
    let session = config.connect()?;

    debug!(command = ?cli.command, "dispatching");
    match cli.command {
        Commands::Tenders(command) => tenders(&session, command).await,
        Commands::Sources(command) => sources(&session, command).await,
        Commands::Run(args) => run(&session, args).await,
    }
}

async fn tenders(session: &ReviewSession, command: TenderCommand) -> Result<()> {
    match command {
        TenderCommand::List(args) => {
            let page_size = args.page_size.unwrap_or(session.config.page_size);
            let mut view = TenderListView::new(session.tenders.clone(), page_size);
            let draft = view.edit();
            draft.keyword = args.keyword.unwrap_or_default();
            draft.source_name = args.source_name.unwrap_or_default();
            draft.min_budget = args.min_budget;
            draft.max_budget = args.max_budget;
            draft.include_filtered = args.include_filtered;
            let snapshot = view.submit_page(args.page, page_size).await?;
            if let Some(err) = snapshot.error {
                bail!("failed to load tenders: {err}");
            }
            display::print_tender_table(&snapshot.data.unwrap_or_default(), view.page_info());
        }
        TenderCommand::Show { id } => {
            let tender = session.api.get_tender(id).await?;
            display::print_tender_card(&tender);
        }
        TenderCommand::Correct(args) => {
            let tender = session.api.get_tender(args.id).await?;
            let mut review = session.review();
            review.open(tender);
            review.begin_edit()?;
            args.apply(review.buffer_mut()?);

            let key = session.list_view().key().clone();
            match review.save(session.api.as_ref(), &session.tenders, &key).await? {
                SaveOutcome::NoChanges => println!("nothing to change"),
                SaveOutcome::Saved { .. } => {
                    println!("saved");
                    if let Some(tender) = review.tender() {
                        display::print_tender_card(tender);
                    }
                }
            }
        }
    }
    Ok(())
}

fn form_error(err: SourceError) -> anyhow::Error {
    anyhow::anyhow!(err.user_message())
}

async fn sources(session: &ReviewSession, command: SourceCommand) -> Result<()> {
    let manager = &session.sources;
    match command {
        SourceCommand::List => {
            let snapshot = manager.list().await;
            if let Some(err) = snapshot.error {
                bail!("failed to load sources: {err}");
            }
            display::print_sources(&snapshot.data.unwrap_or_default());
        }
        SourceCommand::Create(args) => {
            let mut form = SourceForm::default();
            args.apply(&mut form)?;
            let created = manager.submit(&form, None).await.map_err(form_error)?;
            println!("created source {} ({})", created.id, created.name);
        }
        SourceCommand::Update { id, fields } => {
            let existing = manager.get(id).await.map_err(form_error)?;
            let mut form = SourceForm::from_source(&existing);
            fields.apply(&mut form)?;
            let updated = manager
                .submit(&form, Some(&existing))
                .await
                .map_err(form_error)?;
            println!("updated source {} ({})", updated.id, updated.name);
        }
        SourceCommand::Delete { id } => {
            manager.delete(id).await.map_err(form_error)?;
            println!("deleted source {id}");
        }
    }
    Ok(())
}

async fn run(session: &ReviewSession, args: RunArgs) -> Result<()> {
    let limit = args.limit.unwrap_or(session.config.task_limit);
    if args.each {
        let targets = session.sources.enabled_targets().await;
        let report = session
            .tasks
            .run_each(&targets, Some(limit), args.policy.into())
            .await;
        display::print_fan_out(&report);
        if !report.success {
            bail!("task run failed: {}", report.message);
        }
        return Ok(());
    }

    let report = session.tasks.run(args.source_id, Some(limit)).await;
    display::print_task_report(&report);
    if !report.success() {
        bail!("task run failed: {}", report.message());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn correct_args_set_and_clear_fields() {
        let cli = Cli::parse_from([
            "tender-review",
            "tenders",
            "correct",
            "12",
            "--budget-amount",
            "500000",
            "--clear",
            "contact-phone",
        ]);
        let Commands::Tenders(TenderCommand::Correct(args)) = cli.command else {
            panic!("expected tenders correct");
        };
        let mut buffer = CorrectableFields {
            contact_phone: Some("0571".into()),
            location: Some("杭州".into()),
            ..Default::default()
        };
        args.apply(&mut buffer);
        assert_eq!(buffer.budget_amount, Some(500000.0));
        assert_eq!(buffer.contact_phone, None);
        assert_eq!(buffer.location.as_deref(), Some("杭州"));
    }

    #[test]
    fn update_args_keep_unspecified_fields() {
        let cli = Cli::parse_from(["tender-review", "sources", "update", "3", "--active", "false"]);
        let Commands::Sources(SourceCommand::Update { fields, .. }) = cli.command else {
            panic!("expected sources update");
        };
        let mut form = SourceForm {
            name: "ccgp".into(),
            config_text: r#"{"a": 1}"#.into(),
            ..Default::default()
        };
        fields.apply(&mut form).unwrap();
        assert_eq!(form.name, "ccgp");
        assert_eq!(form.config_text, r#"{"a": 1}"#);
        assert_eq!(form.is_active, Some(false));
    }

    #[test]
    fn update_args_with_a_new_name_fail_validation() {
        let cli = Cli::parse_from(["tender-review", "sources", "update", "3", "--name", "zj"]);
        let Commands::Sources(SourceCommand::Update { fields, .. }) = cli.command else {
            panic!("expected sources update");
        };
        let stored = tender_core::SourceConfig {
            id: 3,
            name: "ccgp".into(),
            url: "https://www.ccgp.gov.cn".into(),
            scraper_type: ScraperType::Http,
            config: Default::default(),
            filter_rules: None,
            is_active: true,
            schedule_cron: None,
            last_run_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let mut form = SourceForm::from_source(&stored);
        fields.apply(&mut form).unwrap();
        let err = form.validate_update(&stored).unwrap_err();
        assert_eq!(err.field(), "name");
    }
}
