//! Capture YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::types::CaptureConfig;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// Every missing variable is reported, not just the first.
///
/// # Errors
///
/// Returns an error if any referenced environment variable is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_else(|_| {
            missing.push(cap[1].to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        missing.dedup();
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(result.into_owned())
}

/// Parse a capture YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_capture_str(yaml_str: &str) -> Result<CaptureConfig> {
    let substituted = substitute_env_vars(yaml_str)?;
    serde_yaml::from_str(&substituted).context("Failed to parse capture YAML")
}

/// Parse a capture YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_capture(path: &Path) -> Result<CaptureConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read capture file: {}", path.display()))?;
    parse_capture_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("CDCFLOW_TEST_HOST", "db.example.com");
        let input = "hostname: ${CDCFLOW_TEST_HOST}\nport: 3306";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, "hostname: db.example.com\nport: 3306");
        std::env::remove_var("CDCFLOW_TEST_HOST");
    }

    #[test]
    fn test_no_env_vars_passthrough() {
        let input = "hostname: localhost";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_substituted_value_is_not_rescanned() {
        std::env::set_var("CDCFLOW_TEST_LITERAL", "${CDCFLOW_NOT_SET_EITHER}");
        let result = substitute_env_vars("password: ${CDCFLOW_TEST_LITERAL}").unwrap();
        assert_eq!(result, "password: ${CDCFLOW_NOT_SET_EITHER}");
        std::env::remove_var("CDCFLOW_TEST_LITERAL");
    }

    #[test]
    fn test_multiple_missing_env_vars_all_reported() {
        let err = substitute_env_vars("${CDCFLOW_MISSING_X} and ${CDCFLOW_MISSING_Y}")
            .unwrap_err()
            .to_string();
        assert!(err.contains("CDCFLOW_MISSING_X"));
        assert!(err.contains("CDCFLOW_MISSING_Y"));
    }

    #[test]
    fn test_parse_capture_from_string() {
        std::env::set_var("CDCFLOW_TEST_PASS", "secret");
        let yaml = r#"
version: "1.0"
source:
  use: replay
  password: ${CDCFLOW_TEST_PASS}
  properties:
    replay.path: /tmp/changes.jsonl
"#;
        let config = parse_capture_str(yaml).unwrap();
        assert_eq!(config.source.password.as_deref(), Some("secret"));
        std::env::remove_var("CDCFLOW_TEST_PASS");
    }

    #[test]
    fn test_parse_invalid_yaml_errors() {
        assert!(parse_capture_str("this is not: [valid: yaml: {{{}}}").is_err());
    }

    #[test]
    fn test_parse_capture_file_not_found() {
        let err = parse_capture(Path::new("/nonexistent/capture.yaml"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("Failed to read capture file"));
    }
}
