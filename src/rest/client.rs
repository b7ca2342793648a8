use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, HeaderValue, USER_AGENT};
use reqwest::{Client as ReqwestClient, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::Instrument as _;
use url::Url;
use uuid::Uuid;

use super::config::Config;
use super::request::Request;
use super::route::{self, Params, Route};
use crate::Result;
use crate::error::Error;
use crate::rate_limit::{Bucket, BucketHandle, GlobalGate, RateLimitInfo, Registry};

/// HTTP client that keeps every request inside the limits the server reports.
///
/// Requests are resolved into a [`BucketHandle`] first and then executed through it.
/// Execution waits for the global gate and for the bucket's quota, sends the request,
/// learns from the rate limit headers of the response and retries transparently on 429.
///
/// Cloning is cheap and clones share buckets and the global gate.
///
/// # Example
///
/// ```no_run
/// use rest_ratelimit::rest::{Body, Client, Config, Params, Request, Route};
/// use reqwest::Method;
///
/// # async fn example() -> rest_ratelimit::Result<()> {
/// let client = Client::new("https://api.example.com/v1", Config::default())?;
///
/// let route = Route::new("/channels/{channel_id}/messages");
/// let params = Params::new().with("channel_id", 42);
/// let (url, bucket) = client.resolve(&Method::POST, &route, &params)?;
///
/// let request = Request::builder()
///     .method(Method::POST)
///     .url(url)
///     .body(Body::json(&serde_json::json!({ "content": "hello" }))?)
///     .build();
/// let response = client.execute(bucket, request).await?;
/// # let _ = response;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    config: Config,
    /// The [`Url`] routes are resolved against.
    host: Url,
    /// The inner [`ReqwestClient`] used to make requests to `host`.
    client: ReqwestClient,
    registry: Arc<Registry>,
    gate: Arc<GlobalGate>,
}

impl Client {
    /// Creates a client for `host`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid, the user agent is not a valid header
    /// value or the HTTP client cannot be created.
    pub fn new(host: &str, config: Config) -> Result<Client> {
        let mut headers = config.headers.clone();
        headers.insert(USER_AGENT, HeaderValue::from_str(&config.user_agent)?);
        headers
            .entry(ACCEPT)
            .or_insert_with(|| HeaderValue::from_static("*/*"));
        let client = ReqwestClient::builder().default_headers(headers).build()?;

        let registry = Registry::new(config.policy(), config.sweep_interval);

        Ok(Self {
            inner: Arc::new(ClientInner {
                host: Url::parse(host)?,
                client,
                registry,
                gate: Arc::new(GlobalGate::new()),
                config,
            }),
        })
    }

    #[must_use]
    pub fn host(&self) -> &Url {
        &self.inner.host
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    #[must_use]
    pub fn global_gate(&self) -> &Arc<GlobalGate> {
        &self.inner.gate
    }

    /// Resolves `route` into a concrete URL and the bucket it counts against.
    ///
    /// The handle holds the bucket in use until it is dropped, usually by
    /// [`Client::execute`].
    ///
    /// # Errors
    ///
    /// Returns a validation error if a placeholder has no value or is malformed.
    pub fn resolve(
        &self,
        method: &Method,
        route: &Route,
        params: &Params,
    ) -> Result<(Url, BucketHandle)> {
        let resolved = route::resolve(
            &self.inner.host,
            method,
            route,
            params,
            &self.inner.config,
        )?;
        let handle = self.inner.registry.resolve(resolved.key, resolved.major);

        Ok((resolved.url, handle))
    }

    /// Executes `request` through `bucket`, retrying on 429 until it goes through.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failures and on non-success statuses other than
    /// 429.
    pub async fn execute(&self, bucket: BucketHandle, request: Request) -> Result<Response> {
        let span = tracing::debug_span!(
            "request",
            id = %Uuid::new_v4(),
            method = %request.method(),
            route = %bucket.route(),
        );

        self.run(bucket, request).instrument(span).await
    }

    /// Executes `request` and deserializes the JSON response body.
    ///
    /// # Errors
    ///
    /// As [`Client::execute`], plus an error naming the offending field if the body
    /// does not match `T`.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        bucket: BucketHandle,
        request: Request,
    ) -> Result<T> {
        let response = self.execute(bucket, request).await?;
        let bytes = response.bytes().await?;

        let deserializer = &mut serde_json::Deserializer::from_slice(&bytes);
        Ok(serde_path_to_error::deserialize(deserializer)?)
    }

    async fn run(&self, handle: BucketHandle, request: Request) -> Result<Response> {
        let inner = &self.inner;
        let policy = inner.config.policy();
        let method = request.method().clone();
        let path = request.url().path().to_owned();

        loop {
            let ticket = loop {
                inner.gate.wait().await;
                if let Some(ticket) = handle.bucket().admit(policy).await {
                    break ticket;
                }
            };
            // The gate may have closed while the bucket was admitting
            inner.gate.wait().await;

            let response = inner
                .client
                .execute(request.to_reqwest(&inner.client)?)
                .await?;
            let status = response.status();
            let mut info = RateLimitInfo::from_headers(response.headers());
            tracing::debug!(%status, probe = ticket.is_probe(), "received response");

            self.observe(
                &handle,
                ticket.bucket(),
                ticket.is_probe(),
                &info,
                request.rate_limit_override(),
            );

            if status == StatusCode::TOO_MANY_REQUESTS {
                let body = response.bytes().await.unwrap_or_default();
                info.merge_body(&body);
                self.rate_limited(&handle, &info);
                // Blocks are in place before anyone waiting on this ticket retries
                drop(ticket);
                continue;
            }
            drop(ticket);

            if status.is_success() {
                return Ok(response);
            }

            let message = response.text().await.unwrap_or_default();
            return Err(Error::status(status, method, path, message));
        }
    }

    /// Feeds the rate limit headers of a response back into the registry.
    fn observe(
        &self,
        handle: &BucketHandle,
        admitted_by: &Arc<Bucket>,
        discovering: bool,
        info: &RateLimitInfo,
        wait_override: Option<Duration>,
    ) {
        if let Some(hash) = &info.bucket {
            self.inner.registry.remap(handle, admitted_by, hash);
        }

        if info.has_quota() || wait_override.is_some() {
            let bucket = handle.bucket();
            bucket.update(info, wait_override);
            tracing::debug!(
                bucket = %bucket.id(),
                limit = ?info.limit,
                remaining = ?info.remaining,
                reset_after = ?info.reset_after,
                "bucket updated"
            );
        } else if discovering {
            // Its requests keep going out one at a time
            tracing::warn!(
                bucket = %admitted_by.id(),
                "response carried no quota, bucket stays undiscovered"
            );
        } else {
            tracing::trace!("response carried no quota");
        }
    }

    fn rate_limited(&self, handle: &BucketHandle, info: &RateLimitInfo) {
        let inner = &self.inner;
        let retry_after = info
            .retry_after
            .unwrap_or(inner.config.default_retry_after);

        if let Some(hook) = &inner.config.on_rate_limit {
            hook.call(handle.route(), info);
        }

        if info.is_global() {
            tracing::warn!(?retry_after, "global rate limit hit");
            inner.gate.trip(retry_after);
        } else {
            let bucket = handle.bucket();
            tracing::warn!(
                bucket = %bucket.id(),
                scope = ?info.scope,
                ?retry_after,
                "rate limited, retrying"
            );
            bucket.block_for(retry_after);
        }
    }
}
