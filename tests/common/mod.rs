#![allow(dead_code, reason = "Not every test binary uses every helper")]

use std::io;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use httpmock::MockServer;
use reqwest::Method;
use rest_ratelimit::rate_limit::BucketHandle;
use rest_ratelimit::rest::{Client, Config, Params, Request, Route};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

pub const LIMIT: &str = "x-ratelimit-limit";
pub const REMAINING: &str = "x-ratelimit-remaining";
pub const RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const BUCKET: &str = "x-ratelimit-bucket";
pub const SCOPE: &str = "x-ratelimit-scope";
pub const GLOBAL: &str = "x-ratelimit-global";
pub const RETRY_AFTER: &str = "retry-after";

/// Logs to the test writer, filtered by `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// Collects formatted log output so tests can assert on it.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Installs a `WARN` subscriber writing here for the current thread.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_writer(self.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

pub fn create_client(server: &MockServer) -> Client {
    create_client_with(server, Config::default())
}

pub fn create_client_with(server: &MockServer, config: Config) -> Client {
    init_tracing();
    Client::new(&server.base_url(), config).unwrap()
}

/// Resolves `template` and builds a request for it.
pub fn prepare(
    client: &Client,
    method: Method,
    template: &str,
    params: &Params,
) -> (BucketHandle, Request) {
    let (url, bucket) = client.resolve(&method, &Route::new(template), params).unwrap();
    let request = Request::builder().method(method).url(url).build();
    (bucket, request)
}

/// Polls `condition` every few milliseconds until it holds.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}
