//! Typed view over the rate limit headers returned by the remote API.
//!
//! All headers are optional. Numeric durations are decimal seconds with an optional
//! fractional part (`"1.250"`), and the absolute reset is a Unix timestamp in the same
//! format. They are parsed without going through floating point.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use strum_macros::Display;

pub const LIMIT: &str = "x-ratelimit-limit";
pub const REMAINING: &str = "x-ratelimit-remaining";
pub const RESET: &str = "x-ratelimit-reset";
pub const RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const BUCKET: &str = "x-ratelimit-bucket";
pub const SCOPE: &str = "x-ratelimit-scope";
pub const GLOBAL: &str = "x-ratelimit-global";
pub const RETRY_AFTER: &str = "retry-after";

/// Longest wait accepted from a response. Anything beyond it is treated as corrupt and
/// dropped, leaving the bucket to its fallbacks.
pub const MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Which quota a 429 was charged against.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Scope {
    /// Per-user limit for the bucket
    User,
    /// Process-wide limit across all buckets
    Global,
    /// Limit shared with other users of the same resource
    Shared,
}

impl Scope {
    fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("user") {
            Some(Scope::User)
        } else if value.eq_ignore_ascii_case("global") {
            Some(Scope::Global)
        } else if value.eq_ignore_ascii_case("shared") {
            Some(Scope::Shared)
        } else {
            None
        }
    }
}

/// Rate limit state reported by a single response.
#[non_exhaustive]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RateLimitInfo {
    /// Number of requests allowed per window
    pub limit: Option<u32>,
    /// Requests left in the current window
    pub remaining: Option<u32>,
    /// Absolute time at which the window resets
    pub reset: Option<DateTime<Utc>>,
    /// Time until the window resets, relative to the response
    pub reset_after: Option<Duration>,
    /// Opaque server-side bucket hash
    pub bucket: Option<String>,
    pub scope: Option<Scope>,
    /// Whether a 429 was caused by the global limit
    pub global: bool,
    /// How long to wait before retrying a 429
    pub retry_after: Option<Duration>,
}

/// The JSON body sent along with a 429.
#[derive(Debug, Deserialize)]
struct RateLimitedBody {
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

impl RateLimitInfo {
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim);

        Self {
            limit: text(LIMIT).and_then(|v| v.parse().ok()),
            remaining: text(REMAINING).and_then(|v| v.parse().ok()),
            reset: text(RESET).and_then(parse_reset),
            reset_after: text(RESET_AFTER)
                .and_then(parse_seconds)
                .and_then(|wait| bounded(RESET_AFTER, wait)),
            bucket: text(BUCKET)
                .filter(|v| !v.is_empty())
                .map(ToOwned::to_owned),
            scope: text(SCOPE).and_then(Scope::parse),
            global: text(GLOBAL).is_some_and(|v| v.eq_ignore_ascii_case("true")),
            retry_after: headers
                .get(RETRY_AFTER)
                .and_then(parse_retry_after)
                .and_then(|wait| bounded(RETRY_AFTER, wait)),
        }
    }

    /// Whether the response declared a quota for its bucket.
    #[must_use]
    pub fn has_quota(&self) -> bool {
        self.limit.is_some()
    }

    /// Whether this response counts against the global limit.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.global || self.scope == Some(Scope::Global)
    }

    /// Fills `retry_after` and `global` from a 429 JSON body when the headers left them out.
    pub(crate) fn merge_body(&mut self, body: &[u8]) {
        let Ok(body) = serde_json::from_slice::<RateLimitedBody>(body) else {
            return;
        };

        if self.retry_after.is_none() {
            self.retry_after = body
                .retry_after
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .and_then(|wait| bounded("retry_after", wait));
        }
        self.global |= body.global;
    }
}

/// Parses non-negative decimal seconds such as `"2"` or `"0.125"`.
fn parse_seconds(value: &str) -> Option<Duration> {
    let (secs, fraction) = value.split_once('.').unwrap_or((value, ""));
    let secs = secs.parse::<u64>().ok()?;
    if !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    // Right-pad to nanosecond precision, dropping anything finer.
    let nanos = fraction
        .chars()
        .chain(std::iter::repeat('0'))
        .take(9)
        .collect::<String>()
        .parse::<u32>()
        .ok()?;

    Some(Duration::new(secs, nanos))
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let since_epoch = parse_seconds(value)?;
    DateTime::from_timestamp(
        i64::try_from(since_epoch.as_secs()).ok()?,
        since_epoch.subsec_nanos(),
    )
}

/// Absolute reset, dropped when it lies implausibly far ahead.
fn parse_reset(value: &str) -> Option<DateTime<Utc>> {
    let at = parse_timestamp(value)?;
    match (at - Utc::now()).to_std() {
        Ok(ahead) => bounded(RESET, ahead).map(|_| at),
        // Past resets are kept so the fail-open valve sees them
        Err(_) => Some(at),
    }
}

fn bounded(source: &'static str, wait: Duration) -> Option<Duration> {
    if wait > MAX_DELAY {
        tracing::warn!(source, ?wait, "implausible rate limit wait, ignoring it");
        return None;
    }
    Some(wait)
}

/// Parses `Retry-After` as delay-seconds or an HTTP-date
/// ([RFC 7231 section 7.1.3](https://www.rfc-editor.org/rfc/rfc7231#section-7.1.3)).
fn parse_retry_after(value: &HeaderValue) -> Option<Duration> {
    let value = value.to_str().ok()?.trim();

    parse_seconds(value).or_else(|| {
        let date = DateTime::parse_from_rfc2822(value).ok()?;
        // A date in the past means retry now
        Some(
            (date.with_timezone(&Utc) - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO),
        )
    })
}
