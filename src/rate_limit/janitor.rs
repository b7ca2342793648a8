use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::{self, Instant};

use super::registry::Registry;

/// Background sweep that evicts idle buckets from a [`Registry`].
///
/// At most one sweep task runs per registry. It stops once the registry is empty and
/// is started again by the next bucket creation.
#[derive(Debug)]
pub(crate) struct Janitor {
    interval: Duration,
    running: AtomicBool,
}

impl Janitor {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            running: AtomicBool::new(false),
        }
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawns the sweep task unless one is already running.
    ///
    /// Does nothing outside a tokio runtime or when the interval is zero.
    pub(crate) fn start(registry: &Arc<Registry>) {
        let janitor = registry.janitor();
        if janitor.interval.is_zero() || !janitor.claim() {
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            janitor.running.store(false, Ordering::Release);
            tracing::debug!("no tokio runtime, bucket sweep not started");
            return;
        };

        tracing::debug!(interval = ?janitor.interval, "starting bucket sweep");
        runtime.spawn(run(Arc::downgrade(registry), janitor.interval));
    }

    fn claim(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

async fn run(registry: Weak<Registry>, interval: Duration) {
    let mut ticker = time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(registry) = registry.upgrade() else {
            return;
        };

        let evicted = registry.sweep(Instant::now());
        if evicted > 0 {
            tracing::debug!(evicted, remaining = registry.len(), "swept idle buckets");
        }

        if registry.is_empty() {
            let janitor = registry.janitor();
            janitor.running.store(false, Ordering::Release);
            // A bucket created after the store starts its own sweep
            if registry.is_empty() || !janitor.claim() {
                tracing::debug!("registry empty, bucket sweep stopped");
                return;
            }
        }
    }
}
