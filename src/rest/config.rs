use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use reqwest::header::HeaderMap;

use crate::rate_limit::{Policy, RateLimitInfo, RouteKey};

const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Parameters that split a route into independent quotas unless configured otherwise.
pub const DEFAULT_MAJOR_PARAMETERS: [&str; 3] = ["guild_id", "channel_id", "webhook_id"];

/// Callback invoked for every 429 the [`Client`](super::Client) receives, before it
/// waits and retries.
#[derive(Clone)]
pub struct RateLimitHook(Arc<dyn Fn(&RouteKey, &RateLimitInfo) + Send + Sync>);

impl RateLimitHook {
    pub fn new<F>(hook: F) -> Self
    where
        F: Fn(&RouteKey, &RateLimitInfo) + Send + Sync + 'static,
    {
        Self(Arc::new(hook))
    }

    pub(crate) fn call(&self, route: &RouteKey, info: &RateLimitInfo) {
        (self.0)(route, info);
    }
}

impl fmt::Debug for RateLimitHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RateLimitHook")
    }
}

/// Configuration for [`Client`](super::Client)
#[derive(Clone, Debug, Builder)]
pub struct Config {
    /// Whether bucket resets follow `X-RateLimit-Reset-After` rather than the absolute
    /// `X-RateLimit-Reset`. Relative timing is immune to clock skew. Defaults to `true`.
    #[builder(default = true)]
    pub(crate) use_reset_after: bool,
    /// How far in the past a bucket's reset point may lie before the bucket stops
    /// blocking and lets a request through. Defaults to one minute.
    #[builder(default = Duration::from_secs(60))]
    pub(crate) fail_open_after: Duration,
    /// How often idle buckets are evicted. Defaults to one minute.
    #[builder(default = Duration::from_secs(60))]
    pub(crate) sweep_interval: Duration,
    /// Wait applied to a 429 that names no retry delay. Defaults to one second.
    #[builder(default = Duration::from_secs(1))]
    pub(crate) default_retry_after: Duration,
    /// Route parameters whose values partition a route's quota.
    #[builder(default = DEFAULT_MAJOR_PARAMETERS.map(str::to_owned).to_vec())]
    pub(crate) major_parameters: Vec<String>,
    #[builder(into, default = DEFAULT_USER_AGENT.to_owned())]
    pub(crate) user_agent: String,
    /// Headers sent with every request, e.g. authorization.
    #[builder(default)]
    pub(crate) headers: HeaderMap,
    pub(crate) on_rate_limit: Option<RateLimitHook>,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Config {
    #[must_use]
    pub fn policy(&self) -> Policy {
        Policy::new(self.use_reset_after, self.fail_open_after)
    }

    pub(crate) fn is_major(&self, name: &str) -> bool {
        self.major_parameters.iter().any(|major| major == name)
    }
}
