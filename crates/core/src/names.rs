//! Kubernetes object name rules.

use once_cell::sync::Lazy;
use regex::Regex;

pub const MAX_NAME_LEN: usize = 253;

// lowercase RFC 1123 subdomain: labels of [a-z0-9-] joined by dots
static NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .unwrap_or_else(|e| panic!("name pattern: {e}"))
});

/// `None` if `name` is a valid object name or namespace, otherwise a message
/// suitable for showing next to the field.
pub fn validate_name(name: &str) -> Option<&'static str> {
    if name.len() <= MAX_NAME_LEN && NAME_RE.is_match(name) {
        None
    } else {
        Some("Name must be {a-z0-9-.}, length <= 253")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dns_subdomains() {
        for ok in ["a", "web", "web-1", "api.example.com", "0abc"] {
            assert_eq!(validate_name(ok), None, "{ok}");
        }
    }

    #[test]
    fn rejects_bad_names() {
        let long = "a".repeat(MAX_NAME_LEN + 1);
        for bad in ["", "Web", "-web", "web-", "a..b", "under_score", long.as_str()] {
            assert!(validate_name(bad).is_some(), "{bad}");
        }
    }
}
