//! Token substitution for output file names and activity log lines.
//!
//! Output name tokens:
//! - `{{filename}}`: source name without its final extension
//! - `{{extension}}`: final extension, no dot
//! - `{{date}}`: `YYYY-MM-DD`
//! - `{{time}}`: `HH-mm-ss`
//! - `{{yyyy}}`, `{{MM}}`, `{{dd}}`, `{{HH}}`, `{{mm}}`, `{{ss}}`
//!
//! Every function here is pure given a clock reading.

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use chrono::{DateTime, Local};
use regex::{Captures, Regex};

/// Extension every rendered output name ends with.
pub const NOTE_EXTENSION: &str = "md";

/// Split `name` at its final dot. A leading dot does not start an extension.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx + 1..]),
        _ => (name, ""),
    }
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{(filename|extension|date|time|yyyy|MM|dd|HH|mm|ss)\}\}")
            .expect("token pattern is valid")
    })
}

/// Substitutes every token in one pass, so token-like text inside the source
/// name is copied through untouched.
pub fn render_output_name(original_name: &str, template: &str, now: &DateTime<Local>) -> String {
    let (stem, extension) = split_extension(original_name);
    let rendered = token_pattern()
        .replace_all(template, |caps: &Captures<'_>| match &caps[1] {
            "filename" => stem.to_string(),
            "extension" => extension.to_string(),
            "date" => now.format("%Y-%m-%d").to_string(),
            "time" => now.format("%H-%M-%S").to_string(),
            "yyyy" => now.format("%Y").to_string(),
            "MM" => now.format("%m").to_string(),
            "dd" => now.format("%d").to_string(),
            "HH" => now.format("%H").to_string(),
            "mm" => now.format("%M").to_string(),
            "ss" => now.format("%S").to_string(),
            _ => caps[0].to_string(),
        })
        .into_owned();
    let suffix = format!(".{NOTE_EXTENSION}");
    if rendered.ends_with(&suffix) {
        rendered
    } else {
        rendered + &suffix
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOperation {
    Process,
    Delete,
}

impl fmt::Display for LogOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogOperation::Process => f.write_str("process"),
            LogOperation::Delete => f.write_str("delete"),
        }
    }
}

/// One append-only activity log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry<'a> {
    pub operation: LogOperation,
    pub source: &'a Path,
    pub output: Option<&'a Path>,
    pub rule_name: &'a str,
    pub output_template: &'a str,
    pub prompt: &'a str,
}

/// Format a single markdown list line with wiki links to the files involved.
///
/// Newlines inside the prompt are flattened so the entry stays on one line.
pub fn render_log_entry(entry: &LogEntry<'_>, now: &DateTime<Local>) -> String {
    let output = entry
        .output
        .map(|p| format!("[[{}]]", p.display()))
        .unwrap_or_else(|| "-".to_string());
    let prompt = entry.prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    format!(
        "- {} | {} | [[{}]] -> {} | rule: {} | output template: `{}` | prompt: {}",
        now.format("%Y-%m-%d %H:%M:%S"),
        entry.operation,
        entry.source.display(),
        output,
        entry.rule_name,
        entry.output_template,
        prompt,
    )
}
