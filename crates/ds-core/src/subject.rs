use serde_json::{Map, Value};

use crate::types::Source;

/// Derive the canonical subject key for `(source, input)`.
///
/// The key is deterministic so idempotent re-submission of the same input
/// lands on the same cache rows. Shape: `<source>:<kind>:<normalized-id>`.
pub fn resolve_subject_key(source: Source, input: &Map<String, Value>) -> String {
    match source {
        Source::Github => {
            let login = first_str(input, &["login", "username", "content"])
                .map(|v| extract_github_login(&v))
                .unwrap_or_default();
            format!("github:login:{}", normalize(&login))
        }
        Source::Scholar => {
            if let Some(id) = first_str(input, &["scholar_id", "id"]) {
                format!("scholar:id:{}", normalize(&id))
            } else {
                let name = first_str(input, &["name", "query", "content"]).unwrap_or_default();
                format!("scholar:name:{}", normalize(&name))
            }
        }
        Source::Linkedin => {
            let content = first_str(input, &["url", "content", "name"]).unwrap_or_default();
            if content.contains("linkedin.com") {
                format!("linkedin:url:{}", normalize_url(&content))
            } else {
                format!("linkedin:name:{}", normalize(&content))
            }
        }
    }
}

/// Pull the first non-empty string value out of `input` for any of `keys`.
pub fn first_str(input: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(Value::String(s)) = input.get(*key) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Accepts a bare login or a github.com profile URL.
pub fn extract_github_login(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.contains("github.com") {
        let path = trimmed
            .split("github.com")
            .nth(1)
            .unwrap_or("")
            .trim_start_matches(['/', ':']);
        return path
            .split(['/', '?', '#'])
            .find(|p| !p.is_empty())
            .unwrap_or("")
            .to_string();
    }
    trimmed.to_string()
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

fn normalize_url(value: &str) -> String {
    value
        .trim()
        .trim_end_matches('/')
        .to_lowercase()
        .replace("https://", "")
        .replace("http://", "")
        .replace("www.", "")
}
