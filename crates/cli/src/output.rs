//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print rows as a rounded table
pub fn print_table<T: Tabled>(rows: Vec<T>) {
    if rows.is_empty() {
        println!("{}", "No items found".yellow());
        return;
    }
    println!("{}", Table::new(rows).with(Style::rounded()));
}

/// Print any serializable value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Format an optional float, `-` when absent
pub fn format_value(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) => format!("{:.*}", precision, v),
        None => "-".to_string(),
    }
}

/// Format an age in seconds as e.g. `42s` or `3m12s`
pub fn format_age(secs: f64) -> String {
    let secs = secs.max(0.0) as u64;
    if secs >= 60 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

/// Color status based on value
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "healthy" | "warm" | "ready" => status.green().to_string(),
        "degraded" | "stale" | "warming" => status.yellow().to_string(),
        "unhealthy" | "cold" | "not ready" => status.red().to_string(),
        _ => status.to_string(),
    }
}

/// Color a composite score: 70 and up is good, below 40 poor
pub fn color_score(score: f64) -> String {
    let formatted = format!("{:.1}", score);
    if score >= 70.0 {
        formatted.green().to_string()
    } else if score >= 40.0 {
        formatted.yellow().to_string()
    } else {
        formatted.red().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(0.4), "0s");
        assert_eq!(format_age(42.9), "42s");
        assert_eq!(format_age(192.0), "3m12s");
        assert_eq!(format_age(-1.0), "0s");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(Some(1.23456), 2), "1.23");
        assert_eq!(format_value(None, 2), "-");
    }
}
