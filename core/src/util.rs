//! Shared utility functions

use crate::error::{LabError, Result};

/// Check that a value can be sent as an HTTP header value.
///
/// Control characters (0x00-0x1F), DEL, and line breaks are rejected.
pub fn sanitize_for_header(value: &str, field_name: &str) -> Result<String> {
    if value.is_empty() {
        return Err(LabError::InvalidConfig {
            message: format!("{} cannot be empty", field_name),
        });
    }

    for (index, ch) in value.char_indices() {
        if ch.is_control() || ch == '\u{7f}' {
            return Err(LabError::InvalidConfig {
                message: format!(
                    "{} contains invalid character at position {} ({:#04x})",
                    field_name, index, ch as u32
                ),
            });
        }
    }

    Ok(value.to_string())
}

/// Validate an API key before it goes into a request header
pub fn validate_api_key(api_key: &str) -> Result<String> {
    let trimmed = api_key.trim();

    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        return Err(LabError::MissingConfig {
            key: "API key".to_string(),
        });
    }

    sanitize_for_header(trimmed, "API key")?;

    let header_value = format!("Bearer {}", trimmed);
    header_value
        .parse::<reqwest::header::HeaderValue>()
        .map_err(|_| LabError::InvalidConfig {
            message: format!(
                "API key results in invalid header value (length {})",
                trimmed.len()
            ),
        })?;

    Ok(trimmed.to_string())
}

/// Sanitize a base URL and strip any trailing slash
pub fn sanitize_base_url(url: &str, field_name: &str) -> Result<String> {
    let trimmed = url.trim();

    if trimmed.is_empty() {
        return Err(LabError::InvalidConfig {
            message: format!("{} cannot be empty", field_name),
        });
    }

    // Double-encoded URLs usually mean a corrupted config value
    if trimmed.contains("%2F") || trimmed.contains("%3D") || trimmed.contains("%20") {
        return Err(LabError::InvalidConfig {
            message: format!("{} appears to contain URL-encoded characters", field_name),
        });
    }

    if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
        return Err(LabError::InvalidConfig {
            message: format!(
                "{} must start with 'http://' or 'https://'. Got: {}",
                field_name, trimmed
            ),
        });
    }

    Ok(trimmed.trim_end_matches('/').to_string())
}

/// Truncate to at most `max_chars` characters, appending `...` when cut
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let mut out: String = text.chars().take(max_chars).collect();
        out.push_str("...");
        out
    } else {
        text.to_string()
    }
}

/// Split a comma-separated list, dropping empty entries
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_for_header_valid() {
        assert!(sanitize_for_header("abc123", "test").is_ok());
        assert!(sanitize_for_header("sk-abc123xyz", "test").is_ok());
        assert!(sanitize_for_header("hello world", "test").is_ok());
    }

    #[test]
    fn test_sanitize_for_header_invalid() {
        assert!(sanitize_for_header("abc\n123", "test").is_err());
        assert!(sanitize_for_header("abc\r123", "test").is_err());
        assert!(sanitize_for_header("abc\x00123", "test").is_err());
        assert!(sanitize_for_header("abc\x7f123", "test").is_err());
    }

    #[test]
    fn test_validate_api_key() {
        assert!(validate_api_key("sk-test123").is_ok());
        assert!(validate_api_key("").is_err());
        assert!(validate_api_key("none").is_err());
        assert!(validate_api_key(" \n ").is_err());
    }

    #[test]
    fn test_sanitize_base_url() {
        assert_eq!(
            sanitize_base_url("https://api.example.com/v1/", "url").unwrap(),
            "https://api.example.com/v1"
        );
        assert!(sanitize_base_url("http://localhost:8000", "url").is_ok());
        assert!(sanitize_base_url("", "url").is_err());
        assert!(sanitize_base_url("localhost:8000", "url").is_err());
        assert!(sanitize_base_url("https://api.example%2Fcom", "url").is_err());
    }

    #[test]
    fn test_truncate_with_ellipsis() {
        assert_eq!(truncate_with_ellipsis("short", 10), "short");
        assert_eq!(truncate_with_ellipsis("abcdef", 3), "abc...");
        assert_eq!(truncate_with_ellipsis("ééééé", 2), "éé...");
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" a, b ,,c "), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }
}
