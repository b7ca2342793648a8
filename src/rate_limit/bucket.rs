use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::{self, Instant};

use super::headers::{RateLimitInfo, Scope};
use super::key::BucketId;
use super::{Policy, deadline};

/// Quota shared by every request that maps to the same [`BucketId`].
///
/// A bucket starts out *unlimited*: nothing is known about its quota, so exactly one
/// request at a time is let through as a probe while the others wait for it to finish.
/// Once a response declares a limit the bucket tracks `remaining` with atomic
/// decrements, and callers that find it exhausted sleep until the window resets.
#[derive(Debug)]
pub struct Bucket {
    id: Mutex<BucketId>,
    maximum: AtomicI64,
    remaining: AtomicI64,
    unlimited: AtomicBool,
    probing: AtomicBool,
    /// Bumped every time the window is restored, so only one caller restores it.
    epoch: AtomicU64,
    /// Requests holding a handle to this bucket, queued or executing.
    in_flight: AtomicUsize,
    /// Requests admitted and waiting on their response.
    sending: AtomicUsize,
    window: Mutex<Window>,
    merged_into: Mutex<Option<Arc<Bucket>>>,
    probe_done: Notify,
    updated: Notify,
}

#[derive(Debug)]
struct Window {
    reset_at: Option<DateTime<Utc>>,
    reset_after_at: Option<Instant>,
    /// Set by a rate-limit wait override, honoured on top of the reported reset.
    hold_until: Option<Instant>,
    /// Set by a route-scoped 429, blocks admission in any state.
    blocked_until: Option<Instant>,
    scope: Option<Scope>,
    global: bool,
    touched: Instant,
}

/// Where a bucket stands relative to its reset point.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Reset {
    Unknown,
    In(Duration),
    Passed(Duration),
}

impl Reset {
    fn at(deadline: Instant, now: Instant) -> Self {
        if deadline > now {
            Reset::In(deadline - now)
        } else {
            Reset::Passed(now - deadline)
        }
    }

    fn at_utc(deadline: DateTime<Utc>) -> Self {
        let delta = deadline - Utc::now();
        match delta.to_std() {
            Ok(wait) if !wait.is_zero() => Reset::In(wait),
            _ => Reset::Passed((-delta).to_std().unwrap_or(Duration::ZERO)),
        }
    }
}

impl Window {
    fn new(now: Instant) -> Self {
        Self {
            reset_at: None,
            reset_after_at: None,
            hold_until: None,
            blocked_until: None,
            scope: None,
            global: false,
            touched: now,
        }
    }

    fn reset(&self, policy: Policy, now: Instant) -> Reset {
        let relative = self.reset_after_at.map(|at| Reset::at(at, now));
        let absolute = self.reset_at.map(Reset::at_utc);
        let reported = if policy.use_reset_after {
            relative.or(absolute)
        } else {
            absolute.or(relative)
        };

        match (reported, self.hold_until.filter(|hold| *hold > now)) {
            (Some(Reset::In(wait)), Some(hold)) => Reset::In(wait.max(hold - now)),
            (_, Some(hold)) => Reset::In(hold - now),
            (Some(reset), None) => reset,
            (None, None) => Reset::Unknown,
        }
    }

    fn clear_reset(&mut self) {
        self.reset_at = None;
        self.reset_after_at = None;
        self.hold_until = None;
    }

    fn extend_relative(&mut self, at: Instant, now: Instant) {
        if at > now && self.reset_after_at.is_none_or(|current| current < at) {
            self.reset_after_at = Some(at);
        }
    }

    fn block_until(&mut self, until: Instant) {
        if self.blocked_until.is_none_or(|current| current < until) {
            self.blocked_until = Some(until);
        }
    }

    fn extend_absolute(&mut self, at: DateTime<Utc>) {
        if self.reset_at.is_none_or(|current| current < at) {
            self.reset_at = Some(at);
        }
    }
}

impl Bucket {
    pub(crate) fn new(id: BucketId) -> Self {
        Self {
            id: Mutex::new(id),
            maximum: AtomicI64::new(0),
            remaining: AtomicI64::new(0),
            unlimited: AtomicBool::new(true),
            probing: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            sending: AtomicUsize::new(0),
            window: Mutex::new(Window::new(Instant::now())),
            merged_into: Mutex::new(None),
            probe_done: Notify::new(),
            updated: Notify::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> BucketId {
        lock(&self.id).clone()
    }

    /// `None` until a response has declared the quota.
    #[must_use]
    pub fn maximum(&self) -> Option<u32> {
        if self.is_unlimited() {
            return None;
        }
        u32::try_from(self.maximum.load(Ordering::Acquire)).ok()
    }

    /// Admissions left in the current window, `None` while unlimited.
    #[must_use]
    pub fn remaining(&self) -> Option<u32> {
        if self.is_unlimited() {
            return None;
        }
        Some(u32::try_from(self.remaining.load(Ordering::Acquire)).unwrap_or(0))
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.unlimited.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn scope(&self) -> Option<Scope> {
        lock(&self.window).scope
    }

    #[must_use]
    pub fn is_global(&self) -> bool {
        lock(&self.window).global
    }

    /// The last absolute reset reported for this bucket.
    #[must_use]
    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.window).reset_at
    }

    /// Held by the registry while it renames the bucket.
    pub(crate) fn lock_id(&self) -> MutexGuard<'_, BucketId> {
        lock(&self.id)
    }

    /// The bucket that now carries this bucket's quota, following merges.
    pub(crate) fn current(self: &Arc<Self>) -> Arc<Bucket> {
        match lock(&self.merged_into).as_ref() {
            Some(target) => target.current(),
            None => Arc::clone(self),
        }
    }

    pub(crate) fn retain(&self) {
        match lock(&self.merged_into).as_ref() {
            Some(target) => target.retain(),
            None => {
                self.in_flight.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    pub(crate) fn release(&self) {
        match lock(&self.merged_into).as_ref() {
            Some(target) => target.release(),
            None => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Forwards this bucket to `target`, which already owns the server-side hash.
    pub(crate) fn merge_into(&self, target: Arc<Bucket>) {
        let mut merged_into = lock(&self.merged_into);
        if merged_into.is_some() {
            return;
        }

        let in_flight = self.in_flight.swap(0, Ordering::AcqRel);
        target.in_flight.fetch_add(in_flight, Ordering::AcqRel);
        *merged_into = Some(target);
        drop(merged_into);

        // Waiters re-resolve through `current` and pick up the target.
        self.probe_done.notify_waiters();
        self.updated.notify_waiters();
    }

    /// Makes one admission attempt, waiting at most once.
    ///
    /// Returns `None` after any wait; callers loop, re-checking the global gate and
    /// re-resolving the bucket between attempts.
    pub(crate) async fn admit(self: &Arc<Self>, policy: Policy) -> Option<Ticket> {
        if let Some(wait) = self.blocked_for(Instant::now()) {
            tracing::trace!(bucket = %self.id(), ?wait, "bucket blocked by 429");
            time::sleep(wait).await;
            return None;
        }

        if self.is_unlimited() {
            self.admit_probe().await
        } else {
            self.admit_quota(policy).await
        }
    }

    async fn admit_probe(self: &Arc<Self>) -> Option<Ticket> {
        let notified = self.probe_done.notified();

        if self
            .probing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if !self.is_unlimited() {
                // The previous probe finished between the two checks
                self.finish_probe();
                return None;
            }

            tracing::debug!(bucket = %self.id(), "sending discovery probe");
            return Some(Ticket::new(self, true));
        }

        notified.await;
        None
    }

    async fn admit_quota(self: &Arc<Self>, policy: Policy) -> Option<Ticket> {
        let epoch = self.epoch.load(Ordering::Acquire);
        if self.remaining.fetch_sub(1, Ordering::AcqRel) > 0 {
            tracing::trace!(bucket = %self.id(), "admitted");
            return Some(Ticket::new(self, false));
        }

        // Registered before reading the window so a response landing in between still
        // wakes this caller
        let mut updated = pin!(self.updated.notified());
        updated.as_mut().enable();

        let now = Instant::now();
        let reset = {
            let window = lock(&self.window);
            if self.epoch.load(Ordering::Acquire) != epoch {
                return None;
            }
            window.reset(policy, now)
        };

        match reset {
            Reset::In(wait) => {
                tracing::trace!(bucket = %self.id(), ?wait, "bucket exhausted, waiting for reset");
                time::sleep(wait).await;
            }
            Reset::Passed(late) if late > policy.fail_open_after => {
                self.fail_open(epoch, policy, "reset point is too far in the past");
            }
            Reset::Passed(_) => self.restore(epoch, policy, now),
            Reset::Unknown => {
                if self.sending.load(Ordering::Acquire) == 0 {
                    self.fail_open(epoch, policy, "bucket exhausted without a reset point");
                } else if time::timeout(policy.fail_open_after, updated).await.is_err() {
                    self.fail_open(epoch, policy, "no response refreshed the exhausted bucket");
                }
            }
        }

        None
    }

    /// Refills the window once its reset point has passed.
    fn restore(&self, epoch: u64, policy: Policy, now: Instant) {
        let id = self.id();
        let mut window = lock(&self.window);
        if self.epoch.load(Ordering::Acquire) != epoch
            || !matches!(window.reset(policy, now), Reset::Passed(_))
        {
            return;
        }

        let maximum = self.maximum.load(Ordering::Acquire);
        self.remaining.store(maximum, Ordering::Release);
        window.clear_reset();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        drop(window);

        tracing::debug!(bucket = %id, maximum, "window restored");
    }

    /// Lets a single request through instead of blocking forever on bad timing data.
    ///
    /// Does nothing if a response refilled the bucket or reported a usable reset since
    /// the caller looked.
    fn fail_open(&self, epoch: u64, policy: Policy, reason: &'static str) {
        let id = self.id();
        let mut window = lock(&self.window);
        let stuck = match window.reset(policy, Instant::now()) {
            Reset::Unknown => true,
            Reset::Passed(late) => late > policy.fail_open_after,
            Reset::In(_) => false,
        };
        if !stuck
            || self.epoch.load(Ordering::Acquire) != epoch
            || self.remaining.load(Ordering::Acquire) > 0
        {
            return;
        }

        self.remaining.store(1, Ordering::Release);
        window.clear_reset();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        drop(window);

        tracing::warn!(bucket = %id, reason, "rate limit anomaly, failing open");
    }

    fn finish_probe(&self) {
        self.probing.store(false, Ordering::Release);
        self.probe_done.notify_waiters();
    }

    fn blocked_for(&self, now: Instant) -> Option<Duration> {
        lock(&self.window)
            .blocked_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Blocks admission for `wait` after a route-scoped 429.
    pub(crate) fn block_for(&self, wait: Duration) {
        if let Some(until) = deadline(Instant::now(), wait) {
            lock(&self.window).block_until(until);
        }
    }

    /// Applies the rate limit state reported by a response.
    pub(crate) fn update(&self, info: &RateLimitInfo, wait_override: Option<Duration>) {
        let now = Instant::now();
        let mut window = lock(&self.window);
        window.touched = now;

        if let Some(limit) = info.limit.map(i64::from) {
            let remaining = info
                .remaining
                .map_or_else(|| limit.saturating_sub(1), i64::from);
            let previous = self.maximum.swap(limit, Ordering::AcqRel);

            if self.is_unlimited() || previous != limit {
                self.remaining.store(remaining, Ordering::Release);
            } else {
                // In-flight requests were already deducted locally
                self.remaining.fetch_min(remaining, Ordering::AcqRel);
            }
            self.unlimited.store(false, Ordering::Release);
        } else if let Some(remaining) = info.remaining
            && !self.is_unlimited()
        {
            self.remaining
                .fetch_min(i64::from(remaining), Ordering::AcqRel);
        }

        if let Some(at) = info.reset_after.and_then(|after| deadline(now, after)) {
            window.extend_relative(at, now);
        }
        if let Some(at) = info.reset {
            window.extend_absolute(at);
        }

        if let Some(until) = wait_override.and_then(|wait| deadline(now, wait)) {
            if self.is_unlimited() {
                // No quota to exhaust, so hold every admission instead
                window.block_until(until);
            } else {
                self.remaining.fetch_min(0, Ordering::AcqRel);
                if window.hold_until.is_none_or(|current| current < until) {
                    window.hold_until = Some(until);
                }
            }
        }

        if info.scope.is_some() {
            window.scope = info.scope;
        }
        window.global = info.is_global();
        drop(window);

        self.updated.notify_waiters();
    }

    /// Whether the janitor may drop this bucket.
    pub(crate) fn is_idle(&self, policy: Policy, now: Instant, grace: Duration) -> bool {
        if self.in_flight() > 0 || self.sending.load(Ordering::Acquire) > 0 {
            return false;
        }

        let window = lock(&self.window);
        if window
            .blocked_until
            .is_some_and(|until| now.saturating_duration_since(until) < grace)
        {
            return false;
        }
        if self.is_unlimited() {
            return true;
        }

        match window.reset(policy, now) {
            Reset::In(_) => false,
            Reset::Passed(late) => late >= grace,
            Reset::Unknown => now.duration_since(window.touched) >= grace,
        }
    }
}

/// Permission to send one request through a bucket.
///
/// Dropping the ticket marks the request as answered; a probe ticket also wakes the
/// callers waiting on the probe. If the probe never saw a quota the bucket is still
/// unlimited and one of those callers becomes the next probe.
#[derive(Debug)]
pub(crate) struct Ticket {
    bucket: Arc<Bucket>,
    probe: bool,
}

impl Ticket {
    fn new(bucket: &Arc<Bucket>, probe: bool) -> Self {
        bucket.sending.fetch_add(1, Ordering::AcqRel);
        Self {
            bucket: Arc::clone(bucket),
            probe,
        }
    }

    pub(crate) fn is_probe(&self) -> bool {
        self.probe
    }

    pub(crate) fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.bucket.sending.fetch_sub(1, Ordering::AcqRel);
        if self.probe {
            self.bucket.finish_probe();
        }
        self.bucket.updated.notify_waiters();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
