//! Plain-text rendering of listings, detail cards and task reports.

use tender_core::display::{self, StatusTag};
use tender_core::{SourceConfig, Tender};
use tender_sync::{FanOutReport, PageInfo, RunOrigin, SourceOutcome, TaskRunReport, Total};

const TITLE_WIDTH: usize = 40;

fn clip(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        return value.to_string();
    }
    let mut out: String = value.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn tags(tender: &Tender) -> String {
    tender
        .status_tags()
        .into_iter()
        .map(StatusTag::label)
        .collect::<Vec<_>>()
        .join(",")
}

pub fn print_tender_table(rows: &[Tender], page: PageInfo) {
    println!(
        "{:>6}  {:<40}  {:<12}  {:>18}  {:<16}  {}",
        "ID", "TITLE", "SOURCE", "BUDGET", "DEADLINE", "STATUS"
    );
    for tender in rows {
        println!(
            "{:>6}  {:<40}  {:<12}  {:>18}  {:<16}  {}",
            tender.id,
            clip(&tender.title, TITLE_WIDTH),
            clip(&tender.source_name, 12),
            tender.budget_display(),
            tender.deadline_display(),
            tags(tender)
        );
    }
    let total = match page.total {
        Total::Exact(n) => n.to_string(),
        Total::Approximate(n) => format!("~{n}"),
    };
    println!();
    println!(
        "page {} (size {}), {} rows shown, total {}",
        page.page,
        page.page_size,
        rows.len(),
        total
    );
}

pub fn print_tender_card(tender: &Tender) {
    println!("=== #{} {} ===", tender.id, tender.title);
    let fields: [(&str, String); 12] = [
        ("source", tender.source_name.clone()),
        ("source_url", tender.source_url.clone()),
        ("project_name", display::text(tender.project_name.as_deref()).to_string()),
        ("budget", tender.budget_display()),
        ("deadline", tender.deadline_display()),
        ("contact_person", display::text(tender.contact_person.as_deref()).to_string()),
        ("contact_phone", display::text(tender.contact_phone.as_deref()).to_string()),
        ("contact_email", display::text(tender.contact_email.as_deref()).to_string()),
        ("location", display::text(tender.location.as_deref()).to_string()),
        ("published_at", display::timestamp(tender.published_at)),
        ("status", tags(tender)),
        ("filter_reason", display::text(tender.filter_reason.as_deref()).to_string()),
    ];
    for (label, value) in fields {
        println!("  {label:<16} {value}");
    }
    println!();
    println!("{}", tender.content);
}

pub fn print_sources(sources: &[SourceConfig]) {
    println!(
        "{:>4}  {:<20}  {:<8}  {:<6}  {:<12}  {:<16}  {}",
        "ID", "NAME", "TYPE", "ACTIVE", "CRON", "LAST RUN", "URL"
    );
    for source in sources {
        println!(
            "{:>4}  {:<20}  {:<8}  {:<6}  {:<12}  {:<16}  {}",
            source.id,
            clip(&source.name, 20),
            source.scraper_type.as_str(),
            if source.is_active { "yes" } else { "no" },
            display::text(source.schedule_cron.as_deref()),
            display::timestamp(source.last_run_at),
            source.url
        );
    }
}

fn print_outcomes(outcomes: &[SourceOutcome]) {
    for outcome in outcomes {
        match outcome {
            SourceOutcome::Succeeded {
                source_name,
                counts,
            } => println!(
                "  ok    {:<20} scraped={} processed={} filtered={} errors={}",
                source_name, counts.scraped, counts.processed, counts.filtered, counts.errors
            ),
            SourceOutcome::Failed { source_name, error } => {
                println!("  FAIL  {source_name:<20} {error}")
            }
        }
    }
}

pub fn print_task_report(report: &TaskRunReport) {
    let verdict = if report.success() { "succeeded" } else { "failed" };
    let origin = match report.origin {
        RunOrigin::Reported => "",
        RunOrigin::Rejected => " (rejected by service)",
        RunOrigin::Transport => " (service unreachable)",
    };
    println!("run {} {verdict}{origin}: {}", report.run_id, report.message());
    print_outcomes(&report.outcomes());
    if !report.response.results.is_empty() {
        println!("{}", report.summary());
    }
}

pub fn print_fan_out(report: &FanOutReport) {
    let verdict = if report.success { "succeeded" } else { "failed" };
    println!(
        "run {} {verdict} under {:?}: {}",
        report.run_id, report.policy, report.message
    );
    let outcomes: Vec<_> = report.results.iter().map(tender_sync::tasks::classify).collect();
    print_outcomes(&outcomes);
    println!("{}", report.summary);
}
