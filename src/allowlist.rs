//! Upstream URL allowlist (glob matching over normalized URLs) and the
//! hop-by-hop header filter applied to both request and response headers.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use http::{HeaderMap, HeaderName, HeaderValue};

/// Hop-by-hop headers plus the ones the proxy owns (host / accept-encoding /
/// content-length are recomputed by whichever HTTP client issues the
/// upstream request).
const STRIPPED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "accept-encoding",
    "content-length",
];

pub struct Allowlist {
    set: GlobSet,
}

impl Allowlist {
    pub fn compile(patterns: &[String]) -> Result<Allowlist, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            // `literal_separator` keeps `*` from crossing `/`, matching
            // §4.B ("`*` matches a path segment, `**` matches multiple
            // segments") instead of globset's default of a flat wildcard.
            let glob = GlobBuilder::new(&pattern.to_lowercase())
                .literal_separator(true)
                .build()?;
            builder.add(glob);
        }
        Ok(Allowlist { set: builder.build()? })
    }

    /// `true` iff `url` (after normalization) matches at least one pattern.
    pub fn allows(&self, url: &str) -> bool {
        match normalize(url) {
            Some(normalized) => self.set.is_match(&normalized),
            None => false,
        }
    }
}

/// Lowercase scheme/host, strip a default port, trim a trailing slash.
/// Only `http`/`https` schemes are ever admitted.
fn normalize(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    let scheme = scheme.to_lowercase();
    if scheme != "http" && scheme != "https" {
        return None;
    }

    let (authority, path_and_query) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };

    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => {
            (h.to_lowercase(), Some(p))
        }
        _ => (authority.to_lowercase(), None),
    };

    let default_port = if scheme == "https" { "443" } else { "80" };
    let host_with_port = match port {
        Some(p) if p != default_port => format!("{}:{}", host, p),
        _ => host,
    };

    let trimmed_path = if path_and_query.len() > 1 {
        path_and_query.trim_end_matches('/')
    } else {
        path_and_query
    };

    Some(format!("{}://{}{}", scheme, host_with_port, trimmed_path))
}

/// Strip hop-by-hop headers and translate `Upstream-Authorization` into a
/// plain `Authorization` header for the outbound request.
pub fn filter_outbound_headers(src: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(src.len());
    for (name, value) in src.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if STRIPPED_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        if lower == "upstream-authorization" {
            if let Ok(v) = HeaderValue::from_bytes(value.as_bytes()) {
                out.insert(HeaderName::from_static("authorization"), v);
            }
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Strip hop-by-hop headers from an upstream response before relaying its
/// metadata to the client (used to build the `S` frame's header set).
pub fn filter_response_headers(src: &HeaderMap) -> Vec<(String, String)> {
    src.iter()
        .filter(|(name, _)| !STRIPPED_HEADERS.contains(&name.as_str().to_ascii_lowercase().as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_matches_single_segment_only() {
        let allow = Allowlist::compile(&["https://api.example.com/v1/*".to_string()]).unwrap();
        assert!(allow.allows("https://api.example.com/v1/chat"));
        assert!(!allow.allows("https://api.example.com/v1/chat/completions"));
    }

    #[test]
    fn test_double_star_crosses_segments() {
        let allow = Allowlist::compile(&["https://api.example.com/**".to_string()]).unwrap();
        assert!(allow.allows("https://api.example.com/v1/chat/completions"));
    }

    #[test]
    fn test_wildcard_subdomain_does_not_match_bare_domain() {
        let allow = Allowlist::compile(&["https://*.example.com/**".to_string()]).unwrap();
        assert!(allow.allows("https://a.example.com/x"));
        assert!(!allow.allows("https://example.com/x"));
    }

    #[test]
    fn test_default_port_and_case_normalized() {
        let allow = Allowlist::compile(&["https://api.example.com/**".to_string()]).unwrap();
        assert!(allow.allows("HTTPS://API.EXAMPLE.COM:443/x"));
        assert!(!allow.allows("https://api.example.com:8443/x"));
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let allow = Allowlist::compile(&["https://api.example.com/x".to_string()]).unwrap();
        assert!(allow.allows("https://api.example.com/x/"));
    }

    #[test]
    fn test_non_http_scheme_rejected() {
        let allow = Allowlist::compile(&["**".to_string()]).unwrap();
        assert!(!allow.allows("file:///etc/passwd"));
        assert!(!allow.allows("ftp://host/x"));
    }

    #[test]
    fn test_empty_allowlist_denies_all() {
        let allow = Allowlist::compile(&[]).unwrap();
        assert!(!allow.allows("https://api.example.com/"));
    }

    #[test]
    fn test_filter_outbound_headers_strips_hop_by_hop_and_translates_auth() {
        let mut src = HeaderMap::new();
        src.insert("connection", HeaderValue::from_static("keep-alive"));
        src.insert("content-type", HeaderValue::from_static("application/json"));
        src.insert("upstream-authorization", HeaderValue::from_static("Bearer xyz"));

        let out = filter_outbound_headers(&src);
        assert!(!out.contains_key("connection"));
        assert_eq!(out.get("content-type").unwrap(), "application/json");
        assert_eq!(out.get("authorization").unwrap(), "Bearer xyz");
        assert!(!out.contains_key("upstream-authorization"));
    }
}
