//! Rate limit coordination driven by the limits the server reports.
//!
//! Nothing is known about a route's quota until a response carrying
//! `X-RateLimit-*` headers has been seen. Requests are therefore grouped into
//! buckets that start out undiscovered and learn their quota from responses.
//!
//! # Architecture
//!
//! - **[`Registry`]**: maps route keys to server-assigned bucket hashes and
//!   `(hash, major params)` to [`Bucket`]s, remapping and merging buckets as the server
//!   names them
//! - **[`Bucket`]**: admission control for one quota, including the discovery probe
//!   sent while the quota is unknown
//! - **[`GlobalGate`]**: blocks every bucket after a global 429
//! - **[`RateLimitInfo`]**: typed view over the rate limit headers of a response
//! - **Janitor**: background task evicting buckets nobody uses anymore
//!
//! The [`rest`](crate::rest) client drives all of these; most users never touch this
//! module directly.

use std::time::Duration;

use tokio::time::Instant;

mod bucket;
pub mod headers;
mod janitor;
mod key;
mod registry;
mod throttle;

pub use bucket::Bucket;
pub use headers::{RateLimitInfo, Scope};
pub use key::{BucketHash, BucketId, MajorParams, RouteKey};
pub use registry::{BucketHandle, Registry};
pub use throttle::GlobalGate;

/// How buckets interpret the timing data the server sends.
#[non_exhaustive]
#[derive(Clone, Copy, Debug)]
pub struct Policy {
    /// Prefer `X-RateLimit-Reset-After` over the absolute `X-RateLimit-Reset`
    pub use_reset_after: bool,
    /// How far a reset point may lie in the past before the bucket fails open
    pub fail_open_after: Duration,
}

impl Policy {
    #[must_use]
    pub fn new(use_reset_after: bool, fail_open_after: Duration) -> Self {
        Self {
            use_reset_after,
            fail_open_after,
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::new(true, Duration::from_secs(60))
    }
}

/// `now + wait`, or `None` when the clock cannot represent it.
///
/// Waits come from the server and from callers, so an absurd value is logged and
/// ignored rather than trusted.
pub(crate) fn deadline(now: Instant, wait: Duration) -> Option<Instant> {
    let deadline = now.checked_add(wait);
    if deadline.is_none() {
        tracing::warn!(?wait, "wait does not fit the clock, ignoring it");
    }
    deadline
}
