//! Hostname resolver (spec §4.1, component C1).
//!
//! Extracts the routing label from a `Host` header, accounting for the
//! registrable domain (public-suffix-aware, via the `psl` crate) and an
//! optional base subdomain the relay itself lives under.

use crate::error::RelayError;

/// Resolve a `Host` header value to a normalized client name.
pub fn resolve(host_header: &str, base_subdomain: &str) -> Result<String, RelayError> {
    if host_header.is_empty() {
        return Err(RelayError::InvalidHostname);
    }

    let host = strip_port(host_header).to_ascii_lowercase();
    if host.is_empty() {
        return Err(RelayError::InvalidHostname);
    }

    let registrable = psl::domain(host.as_bytes())
        .and_then(|d| std::str::from_utf8(d.as_bytes()).ok())
        .unwrap_or(host.as_str());
    let prefix = if host == registrable {
        ""
    } else {
        host.strip_suffix(registrable)
            .and_then(|p| p.strip_suffix('.'))
            .unwrap_or("")
    };

    if prefix.is_empty() {
        return Err(RelayError::InvalidSubdomain);
    }

    let stripped = strip_base_subdomain(prefix, base_subdomain);
    if stripped.is_empty() {
        return Err(RelayError::InvalidSubdomain);
    }

    Ok(stripped.to_ascii_lowercase())
}

fn strip_base_subdomain<'a>(prefix: &'a str, base_subdomain: &str) -> &'a str {
    if base_subdomain.is_empty() {
        return prefix;
    }
    if prefix == base_subdomain {
        return "";
    }
    let suffix = format!(".{base_subdomain}");
    prefix.strip_suffix(suffix.as_str()).unwrap_or(prefix)
}

fn strip_port(host: &str) -> &str {
    if let Some((h, port)) = host.rsplit_once(':') {
        if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
            return h;
        }
    }
    host
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_host_is_invalid_hostname() {
        assert!(matches!(resolve("", ""), Err(RelayError::InvalidHostname)));
    }

    #[test]
    fn bare_registrable_domain_is_invalid_subdomain() {
        assert!(matches!(
            resolve("example.com", ""),
            Err(RelayError::InvalidSubdomain)
        ));
    }

    #[test]
    fn simple_subdomain_resolves() {
        assert_eq!(resolve("alice.example.com", "").unwrap(), "alice");
    }

    #[test]
    fn nested_labels_resolve_to_full_prefix() {
        assert_eq!(
            resolve("my.super.example.com", "").unwrap(),
            "my.super"
        );
    }

    #[test]
    fn base_subdomain_is_stripped() {
        assert_eq!(
            resolve("alice.tunnel.example.com", "tunnel").unwrap(),
            "alice"
        );
    }

    #[test]
    fn request_to_bare_base_subdomain_is_invalid() {
        assert!(matches!(
            resolve("tunnel.example.com", "tunnel"),
            Err(RelayError::InvalidSubdomain)
        ));
    }

    #[test]
    fn port_suffix_is_ignored() {
        assert_eq!(resolve("alice.example.com:8080", "").unwrap(), "alice");
    }

    #[test]
    fn uppercase_host_is_lowercased() {
        assert_eq!(resolve("ALICE.EXAMPLE.COM", "").unwrap(), "alice");
    }
}
