//! Secret scrubbing for tool results and error messages.
//!
//! A plain substitution pass: every known secret value is replaced with
//! `***` anywhere it appears in outward-bound text. Values shorter than a
//! few characters are skipped — an empty password would otherwise match
//! everything.

use serde_json::Value;

const MASK: &str = "***";
const MIN_SECRET_LEN: usize = 4;

/// Replace every occurrence of every secret in `input` with `***`.
/// Longer secrets are replaced first so a value that contains another
/// (an `Authorization` header embedding the raw key) is masked whole.
pub fn scrub(input: &str, secrets: &[String]) -> String {
    let mut out = input.to_owned();

    let mut ordered: Vec<&String> = secrets.iter().collect();
    ordered.sort_by_key(|s| std::cmp::Reverse(s.len()));

    for secret in ordered {
        if secret.len() >= MIN_SECRET_LEN {
            out = out.replace(secret.as_str(), MASK);
        }
    }
    out
}

/// Apply [`scrub`] to every string anywhere in a JSON tree. Tool outcomes
/// pass through this as the last step before they are emitted.
pub fn scrub_value(value: &mut Value, secrets: &[String]) {
    match value {
        Value::String(s) => *s = scrub(s, secrets),
        Value::Array(items) => {
            for item in items {
                scrub_value(item, secrets);
            }
        }
        Value::Object(map) => {
            for (_key, item) in map {
                scrub_value(item, secrets);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replaces_exact_values() {
        let secrets = vec!["SuperSecretP@ss!2026".to_string()];
        let out = scrub("login failed for SuperSecretP@ss!2026 retry", &secrets);
        assert_eq!(out, "login failed for *** retry");
    }

    #[test]
    fn longest_secret_wins() {
        let secrets = vec!["sk-abc".to_string(), "Bearer sk-abc".to_string()];
        let out = scrub("sent Bearer sk-abc upstream", &secrets);
        assert_eq!(out, "sent *** upstream");
    }

    #[test]
    fn short_and_empty_secrets_are_skipped() {
        let secrets = vec!["".to_string(), "ab".to_string()];
        let input = "about that cab";
        assert_eq!(scrub(input, &secrets), input);
    }

    #[test]
    fn passes_through_clean_text() {
        let secrets = vec!["hunter2-long".to_string()];
        assert_eq!(scrub("nothing to see", &secrets), "nothing to see");
    }

    #[test]
    fn replaces_every_occurrence() {
        let secrets = vec!["tok-12345".to_string()];
        let out = scrub("tok-12345 and again tok-12345", &secrets);
        assert_eq!(out, "*** and again ***");
    }

    #[test]
    fn scrubs_nested_json() {
        let secrets = vec!["P@ssw0rd!".to_string(), "user@test.com".to_string()];
        let mut value = json!({
            "status": "failure",
            "message": "could not type P@ssw0rd! for user@test.com",
            "attempts": [{"detail": "P@ssw0rd! rejected"}],
            "http_status": 401
        });
        scrub_value(&mut value, &secrets);

        let text = value.to_string();
        assert!(!text.contains("P@ssw0rd!"));
        assert!(!text.contains("user@test.com"));
        assert_eq!(value["http_status"], 401);
        assert_eq!(value["message"], "could not type *** for ***");
    }
}
