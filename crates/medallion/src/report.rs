//! Plain-text rendering of the gold counts and of table history.

use std::fmt::Write;

use crate::stage::GroupCount;
use crate::table::HistoryEntry;

const NULL_LABEL: &str = "null";
const BAR_WIDTH: usize = 40;

fn label(key: &Option<String>) -> &str {
    key.as_deref().unwrap_or(NULL_LABEL)
}

/// Render counts as a two-column table.
pub fn render_table(group_by: &str, count_column: &str, counts: &[GroupCount]) -> String {
    let key_width = counts
        .iter()
        .map(|c| label(&c.key).chars().count())
        .chain([group_by.chars().count()])
        .max()
        .unwrap_or_default();
    let count_width = counts
        .iter()
        .map(|c| c.count.to_string().len())
        .chain([count_column.chars().count()])
        .max()
        .unwrap_or_default();

    let mut out = String::new();
    let _ = writeln!(out, "{group_by:<key_width$} | {count_column:>count_width$}");
    let _ = writeln!(out, "{}-+-{}", "-".repeat(key_width), "-".repeat(count_width));
    for count in counts {
        let _ = writeln!(
            out,
            "{:<key_width$} | {:>count_width$}",
            label(&count.key),
            count.count
        );
    }
    let _ = writeln!(out, "({} rows)", counts.len());
    out
}

/// Render counts as a horizontal bar chart scaled to the largest count.
pub fn render_chart(counts: &[GroupCount]) -> String {
    let max = counts.iter().map(|c| c.count).max().unwrap_or(0);
    let key_width = counts
        .iter()
        .map(|c| label(&c.key).chars().count())
        .max()
        .unwrap_or_default();

    let mut out = String::new();
    for count in counts {
        let width = if max > 0 {
            (count.count.max(0) as usize * BAR_WIDTH).div_ceil(max as usize)
        } else {
            0
        };
        let _ = writeln!(
            out,
            "{:<key_width$} | {} {}",
            label(&count.key),
            "#".repeat(width),
            count.count
        );
    }
    out
}

/// Render the commit history of a table, one version per line.
pub fn render_history(table: &str, history: &[HistoryEntry]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "History of {table}:");
    for entry in history {
        let timestamp = entry
            .timestamp
            .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let parameters = entry
            .parameters
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(
            out,
            "{:>6}  {timestamp}  {:<18} +{} files (+{} rows) -{} files  {parameters}",
            entry.version,
            entry.operation,
            entry.added_files,
            entry.added_records,
            entry.removed_files,
        );
    }
    out
}
