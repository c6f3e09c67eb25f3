use serde_json::Value;

/// Best-effort repair of almost-JSON model output, then parse.
///
/// Handles the failure shapes seen from strict-JSON tasks in practice:
/// markdown code fences around the object, prose before/after the object,
/// and trailing commas. Returns `None` when nothing parseable remains.
pub fn repair_and_parse(text: &str) -> Option<Value> {
    let trimmed = strip_fences(text.trim());

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let candidate = extract_first_object(trimmed)?;
    if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
        return Some(value);
    }

    let repaired = strip_trailing_commas(&candidate);
    serde_json::from_str::<Value>(&repaired).ok()
}

/// Remove a surrounding ``` / ```json fence, if present.
fn strip_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Skip the language tag on the opening fence line.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Extract the first balanced `{...}` or `[...]` region, ignoring braces
/// inside string literals.
fn extract_first_object(text: &str) -> Option<String> {
    let start = text.find(['{', '['])?;
    let open = text.as_bytes()[start] as char;
    let close = if open == '{' { '}' } else { ']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + idx + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Drop commas that directly precede a closing brace/bracket.
fn strip_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            out.push(ch);
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '}' | ']' => {
                // Remove any comma (plus whitespace) dangling before the close.
                while matches!(out.chars().last(), Some(c) if c.is_whitespace()) {
                    out.pop();
                }
                if out.ends_with(',') {
                    out.pop();
                }
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_clean_json() {
        let value = repair_and_parse(r#"{"url": "x", "title": "y"}"#).unwrap();
        assert_eq!(value["url"], "x");
    }

    #[test]
    fn strips_markdown_fences() {
        let text = "```json\n{\"repository\": \"a/b\"}\n```";
        let value = repair_and_parse(text).unwrap();
        assert_eq!(value, json!({"repository": "a/b"}));
    }

    #[test]
    fn extracts_object_from_prose() {
        let text = "Here is the pick:\n{\"title\": \"Fix races\", \"additions\": 120}\nHope it helps!";
        let value = repair_and_parse(text).unwrap();
        assert_eq!(value["additions"], 120);
    }

    #[test]
    fn repairs_trailing_commas() {
        let text = r#"{"items": [1, 2, 3,], "done": true,}"#;
        let value = repair_and_parse(text).unwrap();
        assert_eq!(value, json!({"items": [1, 2, 3], "done": true}));
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_extraction() {
        let text = r#"note {"msg": "use {braces} carefully", "n": 1} trailing"#;
        let value = repair_and_parse(text).unwrap();
        assert_eq!(value["msg"], "use {braces} carefully");
    }

    #[test]
    fn hopeless_output_returns_none() {
        assert!(repair_and_parse("I could not produce JSON, sorry.").is_none());
        assert!(repair_and_parse("").is_none());
        assert!(repair_and_parse("{\"never\": \"closed\"").is_none());
    }
}
