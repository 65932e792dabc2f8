//! Redaction helpers for log lines (spec §9: "keep a small module that
//! takes a header name or an argument and returns a masked version for
//! logs; centralize keyword list to avoid drift").

const SENSITIVE_KEYWORDS: &[&str] = &["authorization", "token", "secret", "password", "key"];

const REDACTED: &str = "<redacted>";

fn looks_sensitive(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    SENSITIVE_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

pub fn redact_header(name: &str, value: &str) -> String {
    if looks_sensitive(name) {
        REDACTED.to_string()
    } else {
        value.to_string()
    }
}

/// Masks argv entries whose own text looks like a credential (e.g. an
/// argument resolved from a `secret`/`token` named parameter).
pub fn redact_argv(argv: &[String]) -> Vec<String> {
    argv.iter()
        .map(|a| if looks_sensitive(a) { REDACTED.to_string() } else { a.clone() })
        .collect()
}

pub fn redact_env(env: &[(String, String)]) -> Vec<(String, String)> {
    env.iter()
        .map(|(k, v)| {
            if looks_sensitive(k) {
                (k.clone(), REDACTED.to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_known_keywords() {
        assert_eq!(redact_header("Authorization", "Bearer x"), REDACTED);
        assert_eq!(redact_header("X-Api-Key", "abc"), REDACTED);
        assert_eq!(redact_header("X-Request-Id", "abc"), "abc");
    }

    #[test]
    fn redacts_argv_values_that_look_like_secrets() {
        let argv = vec!["run".to_string(), "my-secret-token".to_string()];
        let out = redact_argv(&argv);
        assert_eq!(out[0], "run");
        assert_eq!(out[1], REDACTED);
    }
}
