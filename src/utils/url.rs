//! URL validation with an SSRF guard.
//!
//! Submitted URLs are fetched server-side by external tools, so anything
//! resolving to loopback, link-local or RFC 1918 space is refused. DNS is
//! resolved once here; the check is best-effort against rebinding but keeps
//! the obvious doors shut.

use std::net::IpAddr;

/// Outcome of validating a user-submitted URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlValidation {
    pub valid: bool,
    pub error: String,
}

impl UrlValidation {
    fn ok() -> Self {
        Self { valid: true, error: String::new() }
    }

    fn invalid(error: &str) -> Self {
        Self { valid: false, error: error.to_string() }
    }
}

/// Validate scheme, length and target network of a media URL.
pub async fn validate_url(raw: &str) -> UrlValidation {
    if raw.is_empty() {
        return UrlValidation::invalid("URL is required");
    }
    if raw.len() > crate::config::MAX_URL_LENGTH {
        return UrlValidation::invalid("URL is too long");
    }

    let Some(host) = host_of(raw) else {
        return UrlValidation::invalid("Only HTTP/HTTPS URLs are allowed");
    };
    if host.is_empty() {
        return UrlValidation::invalid("Invalid URL format");
    }

    if is_private_host(&host).await {
        return UrlValidation::invalid("Private/local URLs are not allowed");
    }

    UrlValidation::ok()
}

/// Extract the lowercase hostname (no port, no userinfo) from an absolute
/// http(s) URL. Returns `None` for other schemes.
pub fn host_of(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;

    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let mut host_port = &rest[..end];

    if let Some(at) = host_port.rfind('@') {
        host_port = &host_port[at + 1..];
    }

    // Bracketed IPv6 literals keep their brackets until the port is split.
    let host = if let Some(stripped) = host_port.strip_prefix('[') {
        stripped.split(']').next().unwrap_or("")
    } else {
        host_port.split(':').next().unwrap_or("")
    };

    Some(host.to_ascii_lowercase())
}

async fn is_private_host(hostname: &str) -> bool {
    if hostname.is_empty() || hostname == "localhost" {
        return true;
    }

    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return is_private_ip(ip);
    }

    // Resolve once; refusing on resolution failure keeps unreachable hosts
    // from tying up a downloader slot anyway.
    match tokio::net::lookup_host((hostname, 443)).await {
        Ok(addrs) => {
            let mut any = false;
            for addr in addrs {
                any = true;
                if is_private_ip(addr.ip()) {
                    return true;
                }
            }
            !any
        }
        Err(_) => true,
    }
}

/// Loopback, RFC 1918, link-local, unspecified and ULA space.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 127
                || o[0] == 10
                || (o[0] == 172 && (16..=31).contains(&o[1]))
                || (o[0] == 192 && o[1] == 168)
                || o[0] == 0
                || (o[0] == 169 && o[1] == 254)
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() {
                return true;
            }
            let seg = v6.segments();
            // fe80::/10 link-local, fc00::/7 unique-local
            (seg[0] & 0xffc0) == 0xfe80 || (seg[0] & 0xfe00) == 0xfc00
        }
    }
}

/// Accept plain seconds ("90", "12.5") or clock time ("1:23:45.6", "02:13").
/// Returns the value unchanged when well-formed, `None` otherwise.
pub fn validate_time_param(value: &str) -> Option<&str> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let is_num = |s: &str| !s.is_empty() && s.parse::<f64>().map(|v| v >= 0.0).unwrap_or(false);

    if is_num(value) {
        return Some(value);
    }

    // (H)H:MM:SS(.ms) or MM:SS(.ms)
    let parts: Vec<&str> = value.split(':').collect();
    if !(2..=3).contains(&parts.len()) {
        return None;
    }
    let ok = parts.iter().enumerate().all(|(i, p)| {
        let last = i == parts.len() - 1;
        if last {
            p.len() <= 5 && is_num(p)
        } else {
            (1..=2).contains(&p.len()) && p.chars().all(|c| c.is_ascii_digit())
        }
    });
    if ok { Some(value) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_empty_and_overlong() {
        assert!(!validate_url("").await.valid);
        let long = format!("https://example.com/{}", "a".repeat(crate::config::MAX_URL_LENGTH));
        assert_eq!(validate_url(&long).await.error, "URL is too long");
    }

    #[tokio::test]
    async fn boundary_length_is_inclusive() {
        // Exactly MAX_URL_LENGTH passes the length check (it may still fail
        // host validation, but not with the length error).
        let base = "https://example.com/";
        let url = format!("{}{}", base, "a".repeat(crate::config::MAX_URL_LENGTH - base.len()));
        assert_eq!(url.len(), crate::config::MAX_URL_LENGTH);
        assert_ne!(validate_url(&url).await.error, "URL is too long");
    }

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        assert!(!validate_url("ftp://example.com/x").await.valid);
        assert!(!validate_url("file:///etc/passwd").await.valid);
    }

    #[tokio::test]
    async fn rejects_private_targets() {
        for url in [
            "http://localhost/x",
            "http://127.0.0.1/x",
            "http://10.1.2.3/x",
            "http://172.16.0.1/x",
            "http://172.31.255.255/x",
            "http://192.168.1.1/x",
            "http://169.254.1.1/x",
            "http://0.0.0.0/x",
            "http://[::1]/x",
            "http://[fe80::1]/x",
            "http://[fd00::1]/x",
        ] {
            let v = validate_url(url).await;
            assert!(!v.valid, "{url} should be rejected");
            assert_eq!(v.error, "Private/local URLs are not allowed", "{url}");
        }
    }

    #[tokio::test]
    async fn accepts_public_ipv4() {
        assert!(validate_url("https://93.184.216.34/video").await.valid);
    }

    #[test]
    fn public_edge_addresses_are_not_private() {
        assert!(!is_private_ip("172.32.0.1".parse().unwrap()));
        assert!(!is_private_ip("11.0.0.1".parse().unwrap()));
        assert!(!is_private_ip("9.9.9.9".parse().unwrap()));
    }

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("https://User:pw@Example.COM:8443/a?b"), Some("example.com".into()));
        assert_eq!(host_of("http://[::1]:8080/x"), Some("::1".into()));
        assert_eq!(host_of("rtmp://example.com/live"), None);
    }

    #[test]
    fn time_params() {
        assert_eq!(validate_time_param("90"), Some("90"));
        assert_eq!(validate_time_param("12.5"), Some("12.5"));
        assert_eq!(validate_time_param("1:23:45.6"), Some("1:23:45.6"));
        assert_eq!(validate_time_param("02:13"), Some("02:13"));
        assert_eq!(validate_time_param("-5"), None);
        assert_eq!(validate_time_param("1:2:3:4"), None);
        assert_eq!(validate_time_param("abc"), None);
        assert_eq!(validate_time_param(""), None);
    }
}
