//! REST client executing requests through server-declared rate limit buckets.
//!
//! Callers go through two steps: [`Client::resolve`] turns a [`Route`] template and its
//! [`Params`] into a URL and a [`BucketHandle`](crate::rate_limit::BucketHandle), and
//! [`Client::execute`] runs a [`Request`] through that bucket.

mod client;
mod config;
mod request;
mod route;

pub use client::Client;
pub use config::{Config, DEFAULT_MAJOR_PARAMETERS, RateLimitHook};
pub use request::{Body, FilePart, Multipart, Request};
pub use route::{Params, Route};
