use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Instant};

use super::deadline;

/// Process-wide gate closed by a global 429.
///
/// While closed no bucket admits anything. The gate carries the instant at which it
/// reopens; `None` means open.
#[derive(Debug)]
pub struct GlobalGate {
    reopens_at: watch::Sender<Option<Instant>>,
}

impl Default for GlobalGate {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalGate {
    #[must_use]
    pub fn new() -> Self {
        Self {
            reopens_at: watch::Sender::new(None),
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.reopens_at.borrow().is_none()
    }

    /// When a closed gate will reopen.
    #[must_use]
    pub fn reopens_at(&self) -> Option<Instant> {
        *self.reopens_at.borrow()
    }

    /// Waits until the gate is open.
    pub async fn wait(&self) {
        let mut open = self.reopens_at.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        _ = open.wait_for(Option::is_none).await;
    }

    /// Closes the gate for `retry_after`.
    ///
    /// Returns `false` when the gate was already closed, in which case the running
    /// timer decides when it reopens, or when `retry_after` is too large to schedule.
    pub fn trip(self: &Arc<Self>, retry_after: Duration) -> bool {
        let Some(until) = deadline(Instant::now(), retry_after) else {
            return false;
        };
        let closed = self.reopens_at.send_if_modified(|reopens_at| {
            if reopens_at.is_some() {
                return false;
            }
            *reopens_at = Some(until);
            true
        });
        if !closed {
            return false;
        }

        tracing::warn!(?retry_after, "global rate limit hit, closing gate");
        tokio::spawn(reopen(Arc::downgrade(self), until));
        true
    }
}

async fn reopen(gate: Weak<GlobalGate>, at: Instant) {
    time::sleep_until(at).await;
    if let Some(gate) = gate.upgrade() {
        gate.reopens_at.send_replace(None);
        tracing::debug!("global gate reopened");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn gate_should_start_open() {
        let gate = GlobalGate::new();
        assert!(gate.is_open());

        let start = Instant::now();
        gate.wait().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn second_trip_should_be_a_no_op() {
        let gate = Arc::new(GlobalGate::new());
        let start = Instant::now();

        assert!(gate.trip(Duration::from_secs(1)), "first closer wins");
        assert!(!gate.trip(Duration::from_secs(5)), "already closed");
        assert_eq!(gate.reopens_at(), Some(start + Duration::from_secs(1)));

        gate.wait().await;
        assert!(
            start.elapsed() >= Duration::from_secs(1) && start.elapsed() < Duration::from_secs(5),
            "first timer decides"
        );
        assert!(gate.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_gate_should_hold_every_waiter() {
        let gate = Arc::new(GlobalGate::new());
        gate.trip(Duration::from_secs(1));

        let start = Instant::now();
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let gate = Arc::clone(&gate);
                tokio::spawn(async move {
                    gate.wait().await;
                    Instant::now()
                })
            })
            .collect();

        time::sleep(Duration::from_millis(999)).await;
        assert!(waiters.iter().all(|w| !w.is_finished()), "still closed");

        for waiter in waiters {
            let released = waiter.await.expect("task");
            assert!(released - start >= Duration::from_secs(1), "released on reopen");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unschedulable_trip_should_leave_the_gate_open() {
        let gate = Arc::new(GlobalGate::new());

        assert!(!gate.trip(Duration::MAX), "nothing to reopen at");
        assert!(gate.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn gate_should_close_again_after_reopening() {
        let gate = Arc::new(GlobalGate::new());
        gate.trip(Duration::from_millis(100));
        gate.wait().await;

        assert!(gate.trip(Duration::from_millis(100)), "reopened gate can close");
        assert!(!gate.is_open());
    }
}
