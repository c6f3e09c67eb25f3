use serde_json::{Map, Value};

use ds_core::subject::{extract_github_login, first_str};
use ds_core::{EngineError, Result, Source};

/// Resolved job input.
///
/// `needs_confirmation` signals that the input is ambiguous (a free-text
/// scholar name can match several profile ids); the caller must re-submit
/// with a stable identifier before a job is created.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub input: Map<String, Value>,
    pub needs_confirmation: bool,
}

/// Validate and normalize job input for a source.
pub fn resolve_input(source: Source, input: &Map<String, Value>) -> Result<Resolution> {
    match source {
        Source::Github => {
            let raw = first_str(input, &["login", "username", "content"]).ok_or_else(|| {
                EngineError::InvalidInput("missing github login".to_string())
            })?;
            let login = extract_github_login(&raw);
            if !is_valid_github_login(&login) {
                return Err(EngineError::InvalidInput(format!(
                    "unable to resolve GitHub username from {raw:?}; please provide a valid login"
                )));
            }
            let mut out = input.clone();
            out.insert("login".to_string(), Value::String(login));
            Ok(Resolution {
                input: out,
                needs_confirmation: false,
            })
        }
        Source::Scholar => {
            if first_str(input, &["scholar_id", "id"]).is_some() {
                return Ok(Resolution {
                    input: input.clone(),
                    needs_confirmation: false,
                });
            }
            if first_str(input, &["name", "query", "content"]).is_some() {
                // A bare name can match several scholar profiles; require a
                // confirmed id before planning a job.
                return Ok(Resolution {
                    input: input.clone(),
                    needs_confirmation: true,
                });
            }
            Err(EngineError::InvalidInput(
                "missing scholar id or name".to_string(),
            ))
        }
        Source::Linkedin => {
            let content = first_str(input, &["url", "content", "name"]).ok_or_else(|| {
                EngineError::InvalidInput("missing linkedin name or url".to_string())
            })?;
            let mut out = input.clone();
            if content.contains("linkedin.com") {
                out.insert("url".to_string(), Value::String(content));
            } else {
                out.insert("name".to_string(), Value::String(content));
            }
            Ok(Resolution {
                input: out,
                needs_confirmation: false,
            })
        }
    }
}

/// GitHub logins: alphanumeric start, then alphanumerics or hyphens, at
/// most 39 characters.
fn is_valid_github_login(login: &str) -> bool {
    let mut chars = login.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_alphanumeric()
        && login.len() <= 39
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn github_login_from_url() {
        let resolution =
            resolve_input(Source::Github, &map(&[("content", "https://github.com/octocat")]))
                .unwrap();
        assert_eq!(resolution.input["login"], "octocat");
        assert!(!resolution.needs_confirmation);
    }

    #[test]
    fn github_rejects_invalid_login() {
        let err = resolve_input(Source::Github, &map(&[("content", "ada lovelace")]));
        assert!(matches!(err, Err(EngineError::InvalidInput(_))));
        assert!(resolve_input(Source::Github, &map(&[])).is_err());
    }

    #[test]
    fn github_login_validation_rules() {
        assert!(is_valid_github_login("octocat"));
        assert!(is_valid_github_login("a-b-42"));
        assert!(!is_valid_github_login(""));
        assert!(!is_valid_github_login("-leading"));
        assert!(!is_valid_github_login("has space"));
        assert!(!is_valid_github_login(&"x".repeat(40)));
    }

    #[test]
    fn scholar_name_needs_confirmation() {
        let by_id = resolve_input(Source::Scholar, &map(&[("scholar_id", "sid123")])).unwrap();
        assert!(!by_id.needs_confirmation);

        let by_name = resolve_input(Source::Scholar, &map(&[("name", "Ada Lovelace")])).unwrap();
        assert!(by_name.needs_confirmation);

        assert!(resolve_input(Source::Scholar, &map(&[])).is_err());
    }

    #[test]
    fn linkedin_url_vs_name() {
        let by_url = resolve_input(
            Source::Linkedin,
            &map(&[("content", "https://linkedin.com/in/ada")]),
        )
        .unwrap();
        assert_eq!(by_url.input["url"], "https://linkedin.com/in/ada");

        let by_name = resolve_input(Source::Linkedin, &map(&[("content", "Ada Lovelace")])).unwrap();
        assert_eq!(by_name.input["name"], "Ada Lovelace");

        assert!(resolve_input(Source::Linkedin, &map(&[])).is_err());
    }
}
