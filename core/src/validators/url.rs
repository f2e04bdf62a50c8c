use url::Url;
use warden_protocol::ValidationResult;
use wildmatch::WildMatch;

use crate::config::Config;

/// Gate one outbound URL. Only `http`/`https` schemes are admitted; the host
/// is matched against the configured domain patterns with denied patterns
/// winning over allowed ones on overlap.
pub fn validate_url(raw: &str, config: &Config) -> ValidationResult {
    let parsed = match Url::parse(raw.trim()) {
        Ok(parsed) => parsed,
        Err(err) => return ValidationResult::deny(format!("malformed URL: {err}")),
    };

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return ValidationResult::deny(format!("scheme '{scheme}' is not allowed"));
    }

    let Some(host) = parsed.host_str() else {
        return ValidationResult::deny("URL has no host");
    };
    let host = host.to_lowercase();

    if matches_any(&config.url.denied_domains, &host) {
        return ValidationResult::deny(format!("domain '{host}' is denied"));
    }

    if config.url.allowed_domains.is_empty() || matches_any(&config.url.allowed_domains, &host) {
        ValidationResult::allow()
    } else {
        ValidationResult::deny(format!("domain '{host}' not in allowed list"))
    }
}

fn matches_any(patterns: &[String], host: &str) -> bool {
    patterns
        .iter()
        .any(|pattern| WildMatch::new(&pattern.to_lowercase()).matches(host))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config(allowed: &[&str], denied: &[&str]) -> Config {
        let mut config = Config::default();
        config.url.allowed_domains = allowed.iter().map(|s| s.to_string()).collect();
        config.url.denied_domains = denied.iter().map(|s| s.to_string()).collect();
        config
    }

    #[test]
    fn wildcard_allow_with_deny_overlap() {
        let config = config(&["*.example.com"], &["evil.example.com"]);

        assert!(validate_url("https://api.example.com/x", &config).allowed);

        let denied = validate_url("https://evil.example.com/x", &config);
        assert!(!denied.allowed);
        assert_eq!(
            denied.reason.as_deref(),
            Some("domain 'evil.example.com' is denied")
        );
    }

    #[test]
    fn non_http_schemes_are_rejected() {
        let config = config(&["*"], &[]);

        let file = validate_url("file:///etc/passwd", &config);
        assert!(!file.allowed);
        assert!(file.reason.unwrap().contains("scheme 'file'"));

        assert!(!validate_url("ftp://mirror.example.com/pkg", &config).allowed);
        assert!(validate_url("http://mirror.example.com/pkg", &config).allowed);
    }

    #[test]
    fn host_not_on_allowlist_is_rejected() {
        let config = config(&["*.example.com"], &[]);
        let verdict = validate_url("https://other.org/", &config);
        assert!(!verdict.allowed);
        assert_eq!(
            verdict.reason.as_deref(),
            Some("domain 'other.org' not in allowed list")
        );
    }

    #[test]
    fn star_admits_every_host() {
        let config = config(&["*"], &[]);
        assert!(validate_url("https://anything.anywhere.io/q?x=1", &config).allowed);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let config = config(&["*.Example.COM"], &[]);
        assert!(validate_url("https://API.EXAMPLE.com/", &config).allowed);
    }

    #[test]
    fn malformed_urls_are_rejected() {
        let config = config(&["*"], &[]);
        assert!(!validate_url("not a url", &config).allowed);
    }
}
