//! Console logging for the collector.
//!
//! Timestamps are UTC, matching the block times being mirrored.

use colored::{ColoredString, Colorize};

/// Log levels for the collector
#[derive(Clone, Copy)]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
    Debug,
}

fn tag(level: LogLevel) -> ColoredString {
    match level {
        LogLevel::Info => " info".bright_blue(),
        LogLevel::Success => "   ok".bright_green(),
        LogLevel::Warning => " warn".bright_yellow(),
        LogLevel::Error => " fail".bright_red(),
        LogLevel::Debug => "debug".bright_magenta(),
    }
}

/// Logs a message with a level tag. Errors go to stderr, everything else to
/// stdout.
pub fn log(level: LogLevel, message: &str) {
    let timestamp = chrono::Utc::now().format("%H:%M:%S%.3f");
    let line = format!(
        "{} {} {message}",
        timestamp.to_string().bright_black(),
        tag(level)
    );
    match level {
        LogLevel::Error => eprintln!("{line}"),
        _ => println!("{line}"),
    }
}

/// Logs an error with its failing operation.
pub fn log_error(context: &str, error: &str) {
    log(LogLevel::Error, &format!("{}: {error}", context.bold()));
}

/// Logs collector startup information
pub fn log_startup(ws_uri: &str, postgres_uri: &str) {
    println!("{}", "block-metrics collector".bright_cyan().bold());
    println!("  {} {}", "tendermint".bright_black(), ws_uri.cyan());
    println!("  {} {}", "postgres  ".bright_black(), postgres_uri.cyan());
}

/// Logs a committed block
pub fn log_block(height: i64, participants: usize, missing: usize, transactions: usize) {
    let absentees = if missing > 0 {
        format!("{missing} missing").yellow()
    } else {
        "0 missing".normal()
    };
    log(
        LogLevel::Success,
        &format!(
            "block {height} | {} {absentees} | {transactions} txs",
            format!("{participants} signed").green()
        ),
    );
}
