//! `curl`-backed `HttpEngine`: `head` issues a HEAD probe, `download`
//! issues a ranged (or whole-file) GET. Both run libcurl's blocking
//! `Easy` handle, so every call is dispatched onto
//! `tokio::task::spawn_blocking`.

use std::collections::BTreeMap;
use std::str;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{parse_rate_limit_hints, ByteRange, CancelSignal, ChunkSink, HttpEngine};
use crate::error::KetchError;
use crate::model::ServerInfo;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const HEAD_TIMEOUT: Duration = Duration::from_secs(30);
const LOW_SPEED_LIMIT: u32 = 1024;
const LOW_SPEED_TIME: Duration = Duration::from_secs(60);
const SEGMENT_TIMEOUT: Duration = Duration::from_secs(3600);

/// `HttpEngine` backed by libcurl. One instance is shared across every
/// task; libcurl's `Easy` handles are built fresh per call and are not
/// retained between requests.
#[derive(Debug, Default)]
pub struct CurlHttpEngine;

impl CurlHttpEngine {
    pub fn new() -> Self {
        Self
    }
}

fn apply_headers(easy: &mut curl::easy::Easy, headers: &BTreeMap<String, String>) -> Result<(), curl::Error> {
    if headers.is_empty() {
        return Ok(());
    }
    let mut list = curl::easy::List::new();
    for (k, v) in headers {
        list.append(&format!("{}: {}", k.trim(), v.trim()))?;
    }
    easy.http_headers(list)
}

fn network_err(e: curl::Error) -> KetchError {
    KetchError::Network(anyhow::Error::new(e))
}

#[async_trait]
impl HttpEngine for CurlHttpEngine {
    async fn head(&self, url: &str, headers: &BTreeMap<String, String>) -> Result<ServerInfo, KetchError> {
        let url = url.to_string();
        let headers = headers.clone();
        tokio::task::spawn_blocking(move || head_blocking(&url, &headers))
            .await
            .map_err(|e| KetchError::Unknown(anyhow::anyhow!("head task panicked: {e}")))?
    }

    async fn download(
        &self,
        url: &str,
        range: Option<ByteRange>,
        headers: &BTreeMap<String, String>,
        sink: ChunkSink,
        cancel: CancelSignal,
    ) -> Result<(), KetchError> {
        let url = url.to_string();
        let headers = headers.clone();
        tokio::task::spawn_blocking(move || download_blocking(&url, range, &headers, sink, cancel))
            .await
            .map_err(|e| KetchError::Unknown(anyhow::anyhow!("download task panicked: {e}")))?
    }
}

fn head_blocking(url: &str, headers: &BTreeMap<String, String>) -> Result<ServerInfo, KetchError> {
    let mut lines: Vec<String> = Vec::new();

    let mut easy = curl::easy::Easy::new();
    easy.url(url).map_err(network_err)?;
    easy.nobody(true).map_err(network_err)?;
    easy.follow_location(true).map_err(network_err)?;
    easy.connect_timeout(CONNECT_TIMEOUT).map_err(network_err)?;
    easy.timeout(HEAD_TIMEOUT).map_err(network_err)?;
    apply_headers(&mut easy, headers).map_err(network_err)?;

    {
        let mut transfer = easy.transfer();
        transfer
            .header_function(|data| {
                if let Ok(s) = str::from_utf8(data) {
                    lines.push(s.trim_end().to_string());
                }
                true
            })
            .map_err(network_err)?;
        transfer.perform().map_err(network_err)?;
    }

    let code = easy.response_code().map_err(network_err)? as u16;
    let mut info = parse_head_lines(&lines);

    if !(200..300).contains(&code) {
        let hints = parse_rate_limit_hints(&lines);
        return Err(KetchError::Http {
            code,
            message: format!("HEAD {url} returned HTTP {code}"),
            retry_after: hints.retry_after_secs.map(Duration::from_secs),
            remaining: hints.remaining,
        });
    }

    let hints = parse_rate_limit_hints(&lines);
    info.rate_limit_remaining = hints.remaining;
    info.rate_limit_reset = hints.retry_after_secs;
    Ok(info)
}

fn parse_head_lines(lines: &[String]) -> ServerInfo {
    let mut info = ServerInfo::default();
    for line in lines {
        let line = line.trim();
        let Some((name, value)) = line.split_once(':') else { continue };
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") {
            if let Ok(n) = value.parse::<i64>() {
                info.content_length = Some(n);
            }
        } else if name.eq_ignore_ascii_case("accept-ranges") {
            info.accepts_byte_ranges = value.eq_ignore_ascii_case("bytes");
        } else if name.eq_ignore_ascii_case("etag") {
            info.etag = Some(value.trim_matches('"').to_string());
        } else if name.eq_ignore_ascii_case("last-modified") {
            info.last_modified = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("content-disposition") {
            info.content_disposition = Some(value.to_string());
        }
    }
    info
}

fn download_blocking(
    url: &str,
    range: Option<ByteRange>,
    headers: &BTreeMap<String, String>,
    mut sink: ChunkSink,
    cancel: CancelSignal,
) -> Result<(), KetchError> {
    let sink_error: Arc<Mutex<Option<KetchError>>> = Arc::new(Mutex::new(None));
    let sink_error_cb = Arc::clone(&sink_error);

    let mut easy = curl::easy::Easy::new();
    easy.url(url).map_err(network_err)?;
    easy.follow_location(true).map_err(network_err)?;
    easy.connect_timeout(CONNECT_TIMEOUT).map_err(network_err)?;
    easy.low_speed_limit(LOW_SPEED_LIMIT).map_err(network_err)?;
    easy.low_speed_time(LOW_SPEED_TIME).map_err(network_err)?;
    easy.timeout(SEGMENT_TIMEOUT).map_err(network_err)?;
    apply_headers(&mut easy, headers).map_err(network_err)?;

    if let Some(r) = range {
        easy.range(&format!("{}-{}", r.start, r.end)).map_err(network_err)?;
    }

    {
        let mut transfer = easy.transfer();
        transfer
            .write_function(move |data| {
                if cancel.is_canceled() {
                    return Ok(0);
                }
                match sink(data) {
                    Ok(()) => Ok(data.len()),
                    Err(e) => {
                        *sink_error_cb.lock().unwrap() = Some(e);
                        Ok(0)
                    }
                }
            })
            .map_err(network_err)?;

        if let Err(e) = transfer.perform() {
            if let Some(err) = sink_error.lock().unwrap().take() {
                return Err(err);
            }
            if e.is_write_error() {
                return Err(KetchError::Canceled);
            }
            return Err(network_err(e));
        }
    }

    if let Some(err) = sink_error.lock().unwrap().take() {
        return Err(err);
    }

    let code = easy.response_code().map_err(network_err)? as u16;
    if !(200..300).contains(&code) {
        return Err(KetchError::Http { code, message: format!("GET {url} returned HTTP {code}"), retry_after: None, remaining: None });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_head_lines_extracts_known_fields() {
        let lines = vec![
            "HTTP/1.1 200 OK".to_string(),
            "Content-Length: 2048".to_string(),
            "Accept-Ranges: bytes".to_string(),
            "ETag: \"v1\"".to_string(),
        ];
        let info = parse_head_lines(&lines);
        assert_eq!(info.content_length, Some(2048));
        assert!(info.accepts_byte_ranges);
        assert_eq!(info.etag.as_deref(), Some("v1"));
    }

    #[test]
    fn parse_head_lines_ignores_unrelated_headers() {
        let lines = vec!["Content-Type: application/octet-stream".to_string()];
        let info = parse_head_lines(&lines);
        assert_eq!(info.content_length, None);
        assert!(!info.accepts_byte_ranges);
    }
}
