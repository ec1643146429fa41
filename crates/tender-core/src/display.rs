//! Text rendering shared by list rows and the detail view.

use chrono::{DateTime, Utc};

use crate::Tender;

pub const EMPTY_CELL: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTag {
    Filtered,
    Corrected,
    Normal,
}

impl StatusTag {
    pub fn label(self) -> &'static str {
        match self {
            StatusTag::Filtered => "filtered",
            StatusTag::Corrected => "corrected",
            StatusTag::Normal => "normal",
        }
    }
}

/// `¥` + grouped amount, followed by the currency code when one is set.
pub fn budget(amount: Option<f64>, currency: Option<&str>) -> String {
    let Some(amount) = amount else {
        return EMPTY_CELL.to_string();
    };
    let mut out = format!("¥{}", group_thousands(amount));
    if let Some(currency) = currency.map(str::trim).filter(|c| !c.is_empty()) {
        out.push(' ');
        out.push_str(currency);
    }
    out
}

pub fn timestamp(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| EMPTY_CELL.to_string())
}

pub fn text(value: Option<&str>) -> &str {
    value.filter(|v| !v.is_empty()).unwrap_or(EMPTY_CELL)
}

/// Groups the integer part by thousands and keeps at most three fraction digits.
pub fn group_thousands(amount: f64) -> String {
    let formatted = format!("{:.3}", amount.abs());
    let (int_part, frac_part) = formatted
        .split_once('.')
        .unwrap_or((formatted.as_str(), ""));
    let frac_part = frac_part.trim_end_matches('0');

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3 + 4);
    if amount < 0.0 && formatted.chars().any(|c| c != '0' && c != '.') {
        grouped.push('-');
    }
    for (idx, ch) in int_part.chars().enumerate() {
        if idx > 0 && (int_part.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if !frac_part.is_empty() {
        grouped.push('.');
        grouped.push_str(frac_part);
    }
    grouped
}

impl Tender {
    pub fn budget_display(&self) -> String {
        budget(self.budget_amount, self.budget_currency.as_deref())
    }

    pub fn deadline_display(&self) -> String {
        timestamp(self.deadline)
    }

    pub fn status_tags(&self) -> Vec<StatusTag> {
        let mut tags = Vec::new();
        if self.is_filtered {
            tags.push(StatusTag::Filtered);
        }
        if self.is_manually_corrected {
            tags.push(StatusTag::Corrected);
        }
        if tags.is_empty() {
            tags.push(StatusTag::Normal);
        }
        tags
    }
}
