//! File name and content filters for monitoring rules.
//!
//! Name templates are globs where `*` is the only wildcard; every other
//! character is matched literally.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use regex::Regex;
use tracing::warn;

/// Compiled name templates, keyed by template text. Rules are fixed for the
/// life of the process, so the map stays as small as the rule set.
fn name_patterns() -> &'static Mutex<HashMap<String, Option<Regex>>> {
    static PATTERNS: OnceLock<Mutex<HashMap<String, Option<Regex>>>> = OnceLock::new();
    PATTERNS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The compiled form of `template`, compiled on first use.
pub fn name_pattern(template: &str) -> Option<Regex> {
    let mut patterns = name_patterns().lock().expect("pattern cache lock poisoned");
    patterns
        .entry(template.to_string())
        .or_insert_with(|| compile_name_template(template))
        .clone()
}

/// Compile a name template into an anchored pattern.
///
/// Returns `None` for the empty template, which matches nothing.
pub fn compile_name_template(template: &str) -> Option<Regex> {
    if template.is_empty() {
        return None;
    }
    let body = template
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    match Regex::new(&format!("(?s)^{body}$")) {
        Ok(re) => Some(re),
        Err(e) => {
            // Escaped literals cannot fail to compile; only size limits can.
            warn!(template, error = %e, "Failed to compile file name template");
            None
        }
    }
}

/// True if the whole of `file_name` matches `template`.
pub fn matches_name(file_name: &str, template: &str) -> bool {
    name_pattern(template).is_some_and(|re| re.is_match(file_name))
}

/// True if `regex_source` is blank or matches somewhere in `content`.
///
/// An invalid pattern never matches.
pub fn matches_content(content: &str, regex_source: &str) -> bool {
    if regex_source.trim().is_empty() {
        return true;
    }
    match Regex::new(regex_source) {
        Ok(re) => re.is_match(content),
        Err(e) => {
            warn!(pattern = regex_source, error = %e, "Invalid content regex; treating as no match");
            false
        }
    }
}
