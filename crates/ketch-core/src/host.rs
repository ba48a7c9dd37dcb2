//! Host extraction for per-host concurrency caps (§4.6 `hostCount`).
//!
//! The key is the scheme-less, port-less authority of the URL, so two
//! URLs on the same host but different ports or schemes still share a cap.

use anyhow::{Context, Result};

/// Extracts the per-host cap key from a task's URL.
pub fn extract_host(url: &str) -> Result<String> {
    let parsed = url::Url::parse(url).with_context(|| format!("invalid URL: {url}"))?;
    parsed
        .host_str()
        .map(|h| h.to_string())
        .ok_or_else(|| anyhow::anyhow!("URL missing host: {url}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_host_without_scheme_or_port() {
        assert_eq!(extract_host("https://example.com:8443/f").unwrap(), "example.com");
        assert_eq!(extract_host("http://example.com/f").unwrap(), "example.com");
    }

    #[test]
    fn same_host_different_paths_share_key() {
        assert_eq!(
            extract_host("http://h/a").unwrap(),
            extract_host("http://h/b").unwrap()
        );
    }

    #[test]
    fn rejects_url_with_no_host() {
        assert!(extract_host("not a url").is_err());
    }
}
