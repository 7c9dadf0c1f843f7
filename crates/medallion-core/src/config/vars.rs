//! Environment variable interpolation for config files.
//!
//! Supported forms:
//! - `$VAR` or `${VAR}` - value of VAR, error if unset
//! - `${VAR:-default}` - default if VAR is unset or empty
//! - `${VAR-default}` - default only if VAR is unset
//! - `$$` - a literal `$`

use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$
        |
        \$\{
            (?P<braced>[A-Za-z_][A-Za-z0-9_]*)
            (?:(?P<op>:?-)(?P<default>[^}]*))?
        \}
        |
        \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("valid interpolation pattern")
});

/// Result of environment variable interpolation.
#[derive(Debug)]
pub struct InterpolationResult {
    /// The interpolated text.
    pub text: String,
    /// Every problem found, so all missing variables are reported at once.
    pub errors: Vec<String>,
}

impl InterpolationResult {
    /// Returns true if there were no errors.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Interpolate environment variables in the given text.
pub fn interpolate(input: &str) -> InterpolationResult {
    let mut errors = Vec::new();
    let text = ENV_VAR_PATTERN
        .replace_all(input, |caps: &Captures| substitute(caps, &mut errors))
        .into_owned();

    InterpolationResult { text, errors }
}

fn substitute(caps: &Captures, errors: &mut Vec<String>) -> String {
    let matched = &caps[0];
    if matched == "$$" {
        return "$".to_string();
    }

    let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
        return matched.to_string();
    };
    let name = name.as_str();
    let op = caps.name("op").map(|m| m.as_str());
    let default = caps.name("default").map(|m| m.as_str());

    match env::var(name) {
        Ok(value) if value.contains('\n') || value.contains('\r') => {
            errors.push(format!(
                "environment variable '{name}' contains newlines, which is not allowed"
            ));
            matched.to_string()
        }
        Ok(value) if value.is_empty() && op == Some(":-") => {
            default.unwrap_or_default().to_string()
        }
        Ok(value) => value,
        Err(_) => match default {
            Some(default) => default.to_string(),
            None => {
                errors.push(format!("environment variable '{name}' is not set"));
                matched.to_string()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own variable names, so parallel tests don't collide.
    fn set(key: &str, value: Option<&str>) {
        // SAFETY: variables are unique per test and never read concurrently.
        match value {
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
    }

    #[test]
    fn test_bare_and_braced_substitution() {
        set("MEDALLION_TEST_ROOT", Some("/data"));
        let result = interpolate("source: $MEDALLION_TEST_ROOT/in\nsink: ${MEDALLION_TEST_ROOT}/out");
        assert!(result.is_ok());
        assert_eq!(result.text, "source: /data/in\nsink: /data/out");
    }

    #[test]
    fn test_missing_variables_are_all_reported() {
        set("MEDALLION_TEST_MISSING_A", None);
        set("MEDALLION_TEST_MISSING_B", None);
        let result = interpolate("a: $MEDALLION_TEST_MISSING_A\nb: ${MEDALLION_TEST_MISSING_B}");
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors[0].contains("MEDALLION_TEST_MISSING_A"));
        assert!(result.errors[1].contains("not set"));
    }

    #[test]
    fn test_colon_default_applies_to_empty() {
        set("MEDALLION_TEST_EMPTY", Some(""));
        let result = interpolate("${MEDALLION_TEST_EMPTY:-fallback}");
        assert!(result.is_ok());
        assert_eq!(result.text, "fallback");
    }

    #[test]
    fn test_plain_default_keeps_empty() {
        set("MEDALLION_TEST_EMPTY_KEPT", Some(""));
        let result = interpolate("[${MEDALLION_TEST_EMPTY_KEPT-fallback}]");
        assert_eq!(result.text, "[]");
    }

    #[test]
    fn test_default_when_unset() {
        set("MEDALLION_TEST_UNSET", None);
        let result = interpolate("${MEDALLION_TEST_UNSET:-/tmp/lab}");
        assert_eq!(result.text, "/tmp/lab");
    }

    #[test]
    fn test_newline_values_rejected() {
        set("MEDALLION_TEST_NEWLINE", Some("a\nb"));
        let result = interpolate("$MEDALLION_TEST_NEWLINE");
        assert!(!result.is_ok());
        assert!(result.errors[0].contains("newlines"));
    }

    #[test]
    fn test_escape_sequence() {
        let result = interpolate("price: $$100");
        assert!(result.is_ok());
        assert_eq!(result.text, "price: $100");
    }
}
