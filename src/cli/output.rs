//! Astral-style CLI output formatting.
//!
//! Every helper honours the global JSON and quiet modes: in JSON mode each
//! call emits one `{"type": ..., "payload": ...}` line for scripting, in
//! quiet mode only warnings and errors are printed.

use std::fmt::Display;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

use owo_colors::OwoColorize;
use serde_json::json;
use tabled::settings::Style;
use tabled::{Table, Tabled};

/// Runtime output configuration shared by CLI handlers.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Emit machine-readable JSON output instead of human-readable text.
    pub json: bool,
    /// Suppress non-essential output.
    pub quiet: bool,
    pub verbose: u8,
}

impl OutputConfig {
    #[must_use]
    pub const fn new(json: bool, quiet: bool, verbose: u8) -> Self {
        Self {
            json,
            quiet,
            verbose,
        }
    }
}

static OUTPUT_CONFIG: OnceLock<RwLock<OutputConfig>> = OnceLock::new();

fn config_cell() -> &'static RwLock<OutputConfig> {
    OUTPUT_CONFIG.get_or_init(|| RwLock::new(OutputConfig::default()))
}

fn read_config() -> OutputConfig {
    match config_cell().read() {
        Ok(config) => *config,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

fn regular_output_suppressed(config: OutputConfig) -> bool {
    !config.json && config.quiet
}

fn emit_json_line(kind: &str, payload: serde_json::Value) {
    println!(
        "{}",
        json!({
            "type": kind,
            "payload": payload,
        })
    );
}

/// Apply output settings from global CLI flags.
pub fn configure(config: OutputConfig) {
    match config_cell().write() {
        Ok(mut current) => *current = config,
        Err(poisoned) => *poisoned.into_inner() = config,
    }
}

#[must_use]
pub fn is_json() -> bool {
    read_config().json
}

#[must_use]
pub fn is_quiet() -> bool {
    read_config().quiet
}

/// Print the application header with name and version.
pub fn header(version: &str) {
    let config = read_config();
    if config.json {
        emit_json_line("header", json!({ "app": "apiflow", "version": version }));
        return;
    }
    if regular_output_suppressed(config) {
        return;
    }
    println!("{} {}", "apiflow".bold(), version.dimmed());
}

/// Print a section header.
pub fn section(title: &str) {
    let config = read_config();
    if config.json {
        emit_json_line("section", json!({ "title": title }));
        return;
    }
    if regular_output_suppressed(config) {
        return;
    }
    println!();
    println!("{}", title.bold());
}

/// Print a labeled value.
pub fn field(label: &str, value: impl Display) {
    let config = read_config();
    let value = value.to_string();
    if config.json {
        emit_json_line("field", json!({ "label": label, "value": value }));
        return;
    }
    if regular_output_suppressed(config) {
        return;
    }
    println!("  {:<18} {}", label.dimmed(), value);
}

pub fn success(message: &str) {
    let config = read_config();
    if config.json {
        emit_json_line("success", json!({ "message": message }));
        return;
    }
    if regular_output_suppressed(config) {
        return;
    }
    println!("  {} {}", "✓".green(), message);
}

pub fn warning(message: &str) {
    if is_json() {
        emit_json_line("warning", json!({ "message": message }));
        return;
    }
    println!("  {} {}", "⚠".yellow(), message);
}

pub fn error(message: &str) {
    if is_json() {
        eprintln!(
            "{}",
            json!({
                "type": "error",
                "payload": { "message": message },
            })
        );
        return;
    }
    eprintln!("  {} {}", "×".red(), message);
}

pub fn note(message: &str) {
    let config = read_config();
    if config.json {
        emit_json_line("note", json!({ "message": message }));
        return;
    }
    if regular_output_suppressed(config) {
        return;
    }
    println!("  {}", message.dimmed());
}

/// Print a hint with "hint:" prefix.
pub fn hint(message: &str) {
    let config = read_config();
    if config.json {
        emit_json_line("hint", json!({ "message": message }));
        return;
    }
    if regular_output_suppressed(config) {
        return;
    }
    println!("  {}: {}", "hint".cyan().dimmed(), message.dimmed());
}

/// Render rows as a table, or as one JSON line per table.
pub fn table<T: Tabled + serde::Serialize>(title: &str, rows: &[T]) {
    let config = read_config();
    if config.json {
        emit_json_line("table", json!({ "title": title, "rows": rows }));
        return;
    }
    if regular_output_suppressed(config) {
        return;
    }
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    for line in table.to_string().lines() {
        println!("  {line}");
    }
}

/// Format a duration with millisecond precision.
pub fn millis(duration: Duration) -> String {
    format!("{:.1}ms", duration.as_secs_f64() * 1000.0)
}

/// Format a highlighted value in cyan.
pub fn highlight(value: impl Display) -> String {
    let value = value.to_string();
    if is_json() {
        return value;
    }
    format!("{}", value.cyan())
}

const BRAILLE_SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// Start a spinner. Hidden in JSON or quiet mode.
pub fn spinner(message: &str) -> indicatif::ProgressBar {
    let config = read_config();
    let pb = if config.json || config.quiet {
        indicatif::ProgressBar::hidden()
    } else {
        let pb = indicatif::ProgressBar::new_spinner();
        if let Ok(style) = indicatif::ProgressStyle::default_spinner()
            .tick_strings(BRAILLE_SPINNER)
            .template("  {spinner:.cyan} {msg}")
        {
            pb.set_style(style);
        }
        pb.enable_steady_tick(Duration::from_millis(80));
        pb
    };
    pb.set_message(message.to_string());
    pb
}

/// Start a bounded progress bar. Hidden in JSON or quiet mode.
pub fn progress_bar(total: u64, message: &str) -> indicatif::ProgressBar {
    let config = read_config();
    let pb = if config.json || config.quiet {
        indicatif::ProgressBar::hidden()
    } else {
        let pb = indicatif::ProgressBar::new(total);
        if let Ok(style) =
            indicatif::ProgressStyle::with_template("  {msg} [{bar:30.cyan/blue}] {pos}/{len}")
        {
            pb.set_style(style.progress_chars("=> "));
        }
        pb
    };
    pb.set_message(message.to_string());
    pb
}

pub fn spinner_success(pb: &indicatif::ProgressBar, message: &str) {
    let config = read_config();
    if config.json {
        emit_json_line("spinner_success", json!({ "message": message }));
        pb.finish_and_clear();
        return;
    }
    if config.quiet {
        pb.finish_and_clear();
        return;
    }
    pb.finish_with_message(format!("{} {}", "✓".green(), message));
}

pub fn spinner_fail(pb: &indicatif::ProgressBar, message: &str) {
    if is_json() {
        emit_json_line("spinner_fail", json!({ "message": message }));
        pb.finish_and_clear();
        return;
    }
    pb.finish_with_message(format!("{} {}", "×".red(), message));
}
