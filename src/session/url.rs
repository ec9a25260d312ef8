use url::Url;

/// Schemes that must never reach the kiosk browser.
const BLOCKED_SCHEMES: [&str; 5] = ["file", "javascript", "data", "chrome", "about"];

const SEARCH_BASE: &str = "https://duckduckgo.com/";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum UrlError {
    #[error("Blocked protocol: {scheme}:")]
    BlockedScheme { scheme: String },
    #[error("URL is empty")]
    Empty,
}

/// Turn raw user input into a launchable https URL.
///
/// Dangerous schemes are rejected outright. Input without an http(s) prefix
/// is treated as a domain when it contains a dot and no whitespace, and as a
/// search query otherwise.
pub fn normalize_url(input: &str) -> Result<String, UrlError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }

    if let Some((scheme, _)) = trimmed.split_once(':') {
        let scheme = scheme.to_ascii_lowercase();
        if BLOCKED_SCHEMES.contains(&scheme.as_str()) {
            return Err(UrlError::BlockedScheme { scheme });
        }
    }

    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Ok(trimmed.to_string());
    }

    if trimmed.contains('.') && !trimmed.contains(char::is_whitespace) {
        return Ok(format!("https://{}", trimmed));
    }

    // Not a URL, not a domain: hand it to a search engine.
    let search = Url::parse_with_params(SEARCH_BASE, &[("q", trimmed)])
        .map(|u| u.to_string())
        .unwrap_or_else(|_| SEARCH_BASE.to_string());
    Ok(search)
}

/// Mask the host-identifying tail of an IP: last octet for IPv4, last hextet
/// for IPv6. Used for every externally visible session record.
pub fn anonymize_ip(raw: &str) -> String {
    match raw.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(v4)) => {
            let o = v4.octets();
            format!("{}.{}.{}.*", o[0], o[1], o[2])
        }
        Ok(std::net::IpAddr::V6(v6)) => {
            let segs = v6.segments();
            let mut parts: Vec<String> = segs[..7].iter().map(|s| format!("{:x}", s)).collect();
            parts.push("*".to_string());
            parts.join(":")
        }
        Err(_) => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blocked_schemes() {
        for input in [
            "file:///etc/passwd",
            "FILE:///etc/passwd",
            "javascript:alert(1)",
            "data:text/html,<h1>x</h1>",
            "chrome://settings",
            "about:config",
        ] {
            assert!(matches!(
                normalize_url(input),
                Err(UrlError::BlockedScheme { .. })
            ));
        }
    }

    #[test]
    fn blocked_scheme_error_names_the_scheme() {
        let err = normalize_url("file:///etc/passwd").unwrap_err();
        assert_eq!(err.to_string(), "Blocked protocol: file:");
    }

    #[test]
    fn passes_through_http_urls() {
        assert_eq!(
            normalize_url("https://example.com/page").unwrap(),
            "https://example.com/page"
        );
        assert_eq!(
            normalize_url("http://example.com").unwrap(),
            "http://example.com"
        );
    }

    #[test]
    fn prepends_https_to_bare_domains() {
        assert_eq!(normalize_url("example.com").unwrap(), "https://example.com");
        assert_eq!(
            normalize_url("sub.example.co.uk/path").unwrap(),
            "https://sub.example.co.uk/path"
        );
    }

    #[test]
    fn rewrites_queries_to_search() {
        let url = normalize_url("rust async runtime").unwrap();
        assert!(url.starts_with("https://duckduckgo.com/?q="));
        assert!(url.contains("rust"));
        assert!(!url.contains(' '));
    }

    #[test]
    fn rejects_empty_input() {
        assert_eq!(normalize_url("   "), Err(UrlError::Empty));
    }

    #[test]
    fn anonymizes_ipv4_last_octet() {
        assert_eq!(anonymize_ip("10.0.0.5"), "10.0.0.*");
        assert_eq!(anonymize_ip("192.168.1.254"), "192.168.1.*");
    }

    #[test]
    fn anonymizes_ipv6_last_hextet() {
        assert_eq!(anonymize_ip("2001:db8::1"), "2001:db8:0:0:0:0:0:*");
    }

    #[test]
    fn unparseable_ip_is_not_leaked() {
        assert_eq!(anonymize_ip("not-an-ip"), "unknown");
    }
}
