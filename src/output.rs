//! Output formatting and persistence for aggregation results.
//!
//! Supports a plain-text table, JSON serialization, and CSV export.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use csv::WriterBuilder;
use tracing::{debug, info};

use crate::result::AggregationResult;

fn format_stat(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{v:.0}")
    } else {
        format!("{v:.2}")
    }
}

/// Renders `result` as an aligned text table: key columns, `size`, then
/// one column per statistic.
pub fn render_table(result: &AggregationResult) -> String {
    let mut header: Vec<String> = result.key_columns.clone();
    header.push("size".into());
    header.extend(result.stat_columns.iter().cloned());

    let cells: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|row| {
            row.key
                .iter()
                .map(|k| k.to_string())
                .chain(std::iter::once(row.size.to_string()))
                .chain(row.stats.iter().map(|s| format_stat(*s)))
                .collect()
        })
        .collect();

    let widths: Vec<usize> = (0..header.len())
        .map(|i| {
            cells
                .iter()
                .map(|r| r[i].len())
                .chain(std::iter::once(header[i].len()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let mut out = String::new();
    for line in std::iter::once(&header).chain(&cells) {
        let padded: Vec<String> = line
            .iter()
            .zip(&widths)
            .map(|(cell, &w)| format!("{cell:>w$}"))
            .collect();
        let _ = writeln!(out, "{}", padded.join("  ").trim_end());
    }
    out
}

/// Prints `result` as a text table on stdout.
pub fn print_pretty(result: &AggregationResult) {
    debug!(groups = result.len(), "Rendering result table");
    print!("{}", render_table(result));
}

/// Logs `result` as pretty-printed JSON.
pub fn print_json(result: &AggregationResult) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(result)?);
    Ok(())
}

/// Writes `result` to a CSV file with a header row, replacing any
/// existing file.
pub fn write_csv(path: impl AsRef<Path>, result: &AggregationResult) -> Result<()> {
    let path = path.as_ref();
    debug!(path = %path.display(), rows = result.len(), "Writing CSV result");

    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;

    let mut header = result.key_columns.clone();
    header.push("size".into());
    header.extend(result.stat_columns.iter().cloned());
    writer.write_record(&header)?;

    for row in &result.rows {
        let record: Vec<String> = row
            .key
            .iter()
            .map(|k| k.to_string())
            .chain(std::iter::once(row.size.to_string()))
            .chain(row.stats.iter().map(|s| s.to_string()))
            .collect();
        writer.write_record(&record)?;
    }
    writer.flush()?;

    Ok(())
}
