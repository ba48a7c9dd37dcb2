//! Rate-limit hint parsing for `Http(429, ...)` responses (§6.1, §11).
//!
//! Scans response header lines by hand for `Retry-After`,
//! `RateLimit-Reset` / `X-RateLimit-Reset`, and the combined RFC 8941
//! `RateLimit` structured field (`limit=L, remaining=R, reset=N`).

/// `retryAfter` in seconds and `remaining` request count, when present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitHints {
    pub retry_after_secs: Option<u64>,
    pub remaining: Option<u64>,
}

/// Parses whatever rate-limit hints are present across a set of raw
/// `Name: value` header lines. Later matching headers win over earlier
/// ones for the same field, matching the last-header-wins behavior of
/// `fetch_head::parse::parse_headers`.
pub fn parse_rate_limit_hints(lines: &[String]) -> RateLimitHints {
    let mut hints = RateLimitHints::default();

    for line in lines {
        let line = line.trim();
        let Some((name, value)) = line.split_once(':') else { continue };
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("retry-after") {
            if let Some(secs) = parse_retry_after(value) {
                hints.retry_after_secs = Some(secs);
            }
        } else if name.eq_ignore_ascii_case("ratelimit-reset") || name.eq_ignore_ascii_case("x-ratelimit-reset") {
            if let Ok(secs) = value.parse::<u64>() {
                hints.retry_after_secs = Some(secs);
            }
        } else if name.eq_ignore_ascii_case("ratelimit") {
            let (reset, remaining) = parse_structured_ratelimit(value);
            if let Some(r) = reset {
                hints.retry_after_secs = Some(r);
            }
            if let Some(r) = remaining {
                hints.remaining = Some(r);
            }
        }
    }

    hints
}

/// `Retry-After` is either a number of seconds or an HTTP-date. Dates are
/// accepted only in the `%a, %d %b %Y %H:%M:%S GMT` form already produced
/// by `Last-Modified` in this codebase's tests; anything else is ignored
/// rather than guessed at.
fn parse_retry_after(value: &str) -> Option<u64> {
    if let Ok(secs) = value.parse::<u64>() {
        return Some(secs);
    }
    parse_http_date_seconds_from_now(value)
}

/// Parses an RFC 1123 HTTP-date and returns seconds until then relative to
/// `SystemTime::now()`. Returns `None` for unparseable or past dates.
fn parse_http_date_seconds_from_now(value: &str) -> Option<u64> {
    let epoch = http_date_to_unix(value)?;
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_secs();
    epoch.checked_sub(now)
}

/// Minimal RFC 1123 date parser (`Wed, 21 Oct 2015 07:28:00 GMT`) — the
/// only form the HEAD probe ever sees in practice, mirroring the
/// `Last-Modified` values `fetch_head::parse` already round-trips as
/// opaque strings.
fn http_date_to_unix(value: &str) -> Option<u64> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() != 6 {
        return None;
    }
    let day: u64 = parts[1].parse().ok()?;
    let month = month_number(parts[2])?;
    let year: u64 = parts[3].parse().ok()?;
    let mut time = parts[4].split(':');
    let hour: u64 = time.next()?.parse().ok()?;
    let min: u64 = time.next()?.parse().ok()?;
    let sec: u64 = time.next()?.parse().ok()?;

    let days_since_epoch = days_from_civil(year as i64, month, day as i64)?;
    let secs = (days_since_epoch as u64) * 86_400 + hour * 3600 + min * 60 + sec;
    Some(secs)
}

fn month_number(name: &str) -> Option<i64> {
    const NAMES: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let lower = name.to_ascii_lowercase();
    NAMES.iter().position(|m| lower.starts_with(m)).map(|i| i as i64 + 1)
}

/// Howard Hinnant's days-from-civil algorithm, restricted to dates on or
/// after the Unix epoch (the only range this parser ever needs).
fn days_from_civil(y: i64, m: i64, d: i64) -> Option<i64> {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days = era * 146_097 + doe - 719_468;
    if days < 0 {
        None
    } else {
        Some(days)
    }
}

/// Parses the RFC 8941-flavored `limit=L, remaining=R, reset=N` structured
/// field into `(reset, remaining)`.
fn parse_structured_ratelimit(value: &str) -> (Option<u64>, Option<u64>) {
    let mut reset = None;
    let mut remaining = None;
    for param in value.split(&[',', ';'][..]) {
        let param = param.trim();
        let Some((key, v)) = param.split_once('=') else { continue };
        let key = key.trim().to_ascii_lowercase();
        let v = v.trim().trim_matches('"');
        match key.as_str() {
            "reset" | "r" | "t" => reset = v.parse::<u64>().ok().or(reset),
            "remaining" => remaining = v.parse::<u64>().ok().or(remaining),
            _ => {}
        }
    }
    (reset, remaining)
}
