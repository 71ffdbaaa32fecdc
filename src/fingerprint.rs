// src/fingerprint.rs
//! URL canonicalization + content fingerprint used as the raw-store dedup key.
//!
//! Canonical form (applied in this order):
//! 1. parse with `url`; scheme and host are lowercased by the parser
//! 2. `http` is folded into `https`, a leading `www.` is dropped
//! 3. the fragment is removed, as is a port that is the default for the original
//!    scheme (`https://x:80` keeps its port)
//! 4. tracking parameters (`utm_*`, `fbclid`, `gclid`, `mc_cid`, `mc_eid`) are removed,
//!    the remaining query pairs are sorted by key then value
//! 5. trailing slashes are trimmed from the path (the root path becomes empty)
//!
//! Strings that do not parse as absolute URLs fall back to trimmed lowercase text.

use sha2::{Digest, Sha256};
use url::Url;

const TRACKING_PARAMS: [&str; 4] = ["fbclid", "gclid", "mc_cid", "mc_eid"];

fn is_tracking_param(key: &str) -> bool {
    let k = key.to_ascii_lowercase();
    k.starts_with("utm_") || TRACKING_PARAMS.contains(&k.as_str())
}

/// Canonical string form of an article URL.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(parsed) = Url::parse(trimmed) else {
        return trimmed.to_ascii_lowercase();
    };
    let Some(host) = parsed.host_str() else {
        return trimmed.to_ascii_lowercase();
    };
    let host = host.strip_prefix("www.").unwrap_or(host);

    let scheme = match parsed.scheme() {
        "http" | "https" => "https",
        other => other,
    };

    let mut out = format!("{scheme}://{host}");
    // `port()` is None only for the default of the original scheme.
    if let Some(port) = parsed.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }

    let path = parsed.path().trim_end_matches('/');
    out.push_str(path);

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !pairs.is_empty() {
        pairs.sort();
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish();
        out.push('?');
        out.push_str(&query);
    }

    out
}

/// Hex SHA-256 of the canonical URL.
pub fn fingerprint(raw_url: &str) -> String {
    let canonical = normalize_url(raw_url);
    let digest = Sha256::digest(canonical.as_bytes());
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// First 12 hex chars; enough to correlate log lines without dumping the URL.
pub fn short(fp: &str) -> &str {
    fp.get(..12).unwrap_or(fp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_host_and_slash_are_folded() {
        let a = normalize_url("http://WWW.Example.com/markets/apple/");
        let b = normalize_url("https://example.com/markets/apple");
        assert_eq!(a, b);
        assert_eq!(a, "https://example.com/markets/apple");
    }

    #[test]
    fn tracking_params_dropped_and_query_sorted() {
        let a = normalize_url("https://example.com/a?z=1&utm_source=x&b=2#frag");
        assert_eq!(a, "https://example.com/a?b=2&z=1");
    }

    #[test]
    fn root_path_and_ports() {
        assert_eq!(normalize_url("https://example.com/"), "https://example.com");
        assert_eq!(
            normalize_url("https://example.com:8443/x"),
            "https://example.com:8443/x"
        );
        assert_eq!(normalize_url("http://example.com:80/x"), "https://example.com/x");
        assert_eq!(normalize_url("https://example.com:443/x"), "https://example.com/x");
    }

    #[test]
    fn explicit_non_default_port_survives_scheme_folding() {
        assert_eq!(normalize_url("https://x.test:80/a"), "https://x.test:80/a");
        assert_eq!(normalize_url("http://x.test:443/a"), "https://x.test:443/a");
        assert_ne!(fingerprint("https://x.test:80/a"), fingerprint("https://x.test/a"));
    }

    #[test]
    fn fingerprint_is_stable_across_equivalent_urls() {
        let a = fingerprint("https://www.reuters.com/x/?utm_medium=rss");
        let b = fingerprint("http://reuters.com/x");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, fingerprint("https://reuters.com/y"));
    }

    #[test]
    fn unparseable_falls_back_to_lowercase() {
        assert_eq!(normalize_url("  Not A Url "), "not a url");
    }
}
