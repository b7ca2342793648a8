use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use super::Policy;
use super::bucket::Bucket;
use super::janitor::Janitor;
use super::key::{BucketHash, BucketId, MajorParams, RouteKey};

/// Two-level lookup from routes to the buckets that limit them.
///
/// A route key maps to the hash the server assigned it (or an unlimited placeholder),
/// and `(hash, major params)` maps to the [`Bucket`] itself. Both maps are sharded so
/// unrelated buckets never contend on a lock.
#[derive(Debug)]
pub struct Registry {
    routes: DashMap<RouteKey, BucketHash>,
    buckets: DashMap<BucketId, Arc<Bucket>>,
    policy: Policy,
    janitor: Janitor,
}

/// A request's claim on a bucket.
///
/// Counts as in flight for the janitor until dropped.
#[derive(Debug)]
pub struct BucketHandle {
    route: RouteKey,
    bucket: Arc<Bucket>,
}

impl BucketHandle {
    #[must_use]
    pub fn route(&self) -> &RouteKey {
        &self.route
    }

    /// The bucket currently limiting this request.
    #[must_use]
    pub fn bucket(&self) -> Arc<Bucket> {
        self.bucket.current()
    }
}

impl Drop for BucketHandle {
    fn drop(&mut self) {
        self.bucket.release();
    }
}

impl Registry {
    #[must_use]
    pub fn new(policy: Policy, sweep_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            routes: DashMap::new(),
            buckets: DashMap::new(),
            policy,
            janitor: Janitor::new(sweep_interval),
        })
    }

    /// Gets or creates the bucket for a route and its major params.
    ///
    /// Until a response names the route's bucket, every call with the same route and
    /// major params returns the same bucket, so concurrent first requests share a probe.
    pub fn resolve(self: &Arc<Self>, route: RouteKey, major: MajorParams) -> BucketHandle {
        let hash = self
            .routes
            .entry(route.clone())
            .or_insert_with(|| BucketHash::Unlimited(route.clone()))
            .value()
            .clone();

        let id = BucketId::new(hash, major);
        let mut created = false;
        let bucket = {
            let entry = self.buckets.entry(id.clone()).or_insert_with(|| {
                created = true;
                Arc::new(Bucket::new(id.clone()))
            });
            entry.retain();
            Arc::clone(entry.value())
        };

        if created {
            tracing::debug!(bucket = %id, %route, "created bucket");
            Janitor::start(self);
        }

        BucketHandle { route, bucket }
    }

    /// Moves a bucket from its placeholder to the hash the server reported.
    ///
    /// If another route already owns a bucket under that hash the two are merged. A
    /// bucket that already carries a reported hash keeps it.
    pub(crate) fn remap(&self, handle: &BucketHandle, bucket: &Arc<Bucket>, hash: &str) {
        let new_hash = BucketHash::Known(hash.to_owned());
        let mut id = bucket.lock_id();
        let old_id = id.clone();
        if old_id.hash == new_hash {
            return;
        }
        if !old_id.hash.is_unlimited() {
            tracing::warn!(
                bucket = %old_id,
                reported = hash,
                "server moved a known bucket to another hash, keeping the current one"
            );
            return;
        }

        let mut accepted = true;
        self.routes
            .entry(handle.route.clone())
            .and_modify(|mapped| {
                if mapped.is_unlimited() {
                    *mapped = new_hash.clone();
                } else {
                    accepted = *mapped == new_hash;
                }
            })
            .or_insert_with(|| new_hash.clone());
        if !accepted {
            tracing::warn!(
                route = %handle.route,
                reported = hash,
                "route already maps to another hash, ignoring"
            );
            return;
        }

        let new_id = BucketId::new(new_hash, old_id.major.clone());
        match self.buckets.entry(new_id.clone()) {
            Entry::Occupied(existing) => {
                // The entry stays locked until the in-flight count has moved, so a sweep
                // cannot evict the target in between
                if !Arc::ptr_eq(existing.get(), bucket) {
                    bucket.merge_into(Arc::clone(existing.get()));
                    tracing::debug!(from = %old_id, into = %new_id, "merged bucket");
                }
                drop(existing);
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(bucket));
                tracing::debug!(from = %old_id, to = %new_id, "remapped bucket");
                *id = new_id;
            }
        }
        drop(id);

        self.buckets.remove_if(&old_id, |_, b| Arc::ptr_eq(b, bucket));
    }

    /// Evicts idle buckets, returning how many were dropped.
    pub(crate) fn sweep(&self, now: Instant) -> usize {
        let grace = self.janitor.interval();
        let mut evicted = 0;
        self.buckets.retain(|id, bucket| {
            let idle = bucket.is_idle(self.policy, now, grace);
            if idle {
                tracing::trace!(bucket = %id, "evicting idle bucket");
                evicted += 1;
            }
            !idle
        });
        evicted
    }

    pub(crate) fn janitor(&self) -> &Janitor {
        &self.janitor
    }

    /// Number of tracked buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// The hash a route currently maps to.
    #[must_use]
    pub fn route_hash(&self, route: &RouteKey) -> Option<BucketHash> {
        self.routes.get(route).map(|hash| hash.value().clone())
    }

    #[must_use]
    pub fn bucket(&self, id: &BucketId) -> Option<Arc<Bucket>> {
        self.buckets.get(id).map(|bucket| Arc::clone(bucket.value()))
    }
}

#[cfg(test)]
mod tests {
    use reqwest::Method;

    use super::*;

    const POLICY: Policy = Policy {
        use_reset_after: true,
        fail_open_after: Duration::from_secs(60),
    };

    fn registry() -> Arc<Registry> {
        Registry::new(POLICY, Duration::from_secs(60))
    }

    fn messages() -> RouteKey {
        RouteKey::new(&Method::POST, "/channels/{channel_id}/messages")
    }

    fn channel(id: &str) -> MajorParams {
        [("channel_id", id)].into_iter().collect()
    }

    #[tokio::test]
    async fn resolve_should_be_idempotent() {
        let registry = registry();
        let first = registry.resolve(messages(), channel("1"));
        let second = registry.resolve(messages(), channel("1"));

        assert!(
            Arc::ptr_eq(&first.bucket(), &second.bucket()),
            "same route and major params share a bucket"
        );
        assert_eq!(first.bucket().in_flight(), 2);
        assert_eq!(
            registry.route_hash(&messages()),
            Some(BucketHash::Unlimited(messages()))
        );

        drop(first);
        drop(second);
        let bucket = registry
            .bucket(&BucketId::new(BucketHash::Unlimited(messages()), channel("1")))
            .expect("still registered");
        assert_eq!(bucket.in_flight(), 0, "released exactly once per handle");
    }

    #[tokio::test]
    async fn major_params_should_partition_buckets() {
        let registry = registry();
        let one = registry.resolve(messages(), channel("1"));
        let two = registry.resolve(messages(), channel("2"));

        assert!(!Arc::ptr_eq(&one.bucket(), &two.bucket()), "independent quotas");
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn remap_should_move_placeholder_to_reported_hash() {
        let registry = registry();
        let handle = registry.resolve(messages(), channel("1"));
        let bucket = handle.bucket();

        registry.remap(&handle, &bucket, "abc");

        assert_eq!(
            registry.route_hash(&messages()),
            Some(BucketHash::Known("abc".to_owned()))
        );
        assert_eq!(bucket.id().hash, BucketHash::Known("abc".to_owned()));
        assert_eq!(registry.len(), 1, "placeholder entry removed");

        let again = registry.resolve(messages(), channel("1"));
        assert!(Arc::ptr_eq(&again.bucket(), &bucket), "resolves to the remapped bucket");
        assert_eq!(bucket.in_flight(), 2);
    }

    #[tokio::test]
    async fn known_hash_should_not_be_reassigned() {
        let registry = registry();
        let handle = registry.resolve(messages(), channel("1"));
        let bucket = handle.bucket();
        registry.remap(&handle, &bucket, "abc");

        registry.remap(&handle, &bucket, "xyz");

        assert_eq!(bucket.id().hash, BucketHash::Known("abc".to_owned()));
        assert_eq!(
            registry.route_hash(&messages()),
            Some(BucketHash::Known("abc".to_owned()))
        );
        assert!(
            registry
                .bucket(&BucketId::new(BucketHash::Known("xyz".to_owned()), channel("1")))
                .is_none(),
            "anomalous hash was not registered"
        );
    }

    #[tokio::test]
    async fn routes_sharing_a_hash_should_merge() {
        let registry = registry();
        let edit = RouteKey::new(&Method::PATCH, "/channels/{channel_id}/messages/{message_id}");

        let post = registry.resolve(messages(), channel("1"));
        let patch = registry.resolve(edit.clone(), channel("1"));
        registry.remap(&post, &post.bucket(), "shared");
        registry.remap(&patch, &patch.bucket(), "shared");

        assert!(
            Arc::ptr_eq(&post.bucket(), &patch.bucket()),
            "both routes now use one bucket"
        );
        assert_eq!(post.bucket().in_flight(), 2, "in-flight count migrated");
        assert_eq!(registry.len(), 1);

        let later = registry.resolve(edit, channel("1"));
        assert!(Arc::ptr_eq(&later.bucket(), &post.bucket()));

        drop(patch);
        drop(later);
        assert_eq!(post.bucket().in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn merge_into_idle_bucket_should_survive_sweep() {
        let registry = registry();
        let edit = RouteKey::new(&Method::PATCH, "/channels/{channel_id}/messages/{message_id}");

        let post = registry.resolve(messages(), channel("1"));
        registry.remap(&post, &post.bucket(), "shared");
        drop(post);

        let patch = registry.resolve(edit, channel("1"));
        registry.remap(&patch, &patch.bucket(), "shared");

        assert_eq!(registry.sweep(Instant::now()), 0, "target now carries the request");
        let later = registry.resolve(messages(), channel("1"));
        assert!(
            Arc::ptr_eq(&later.bucket(), &patch.bucket()),
            "quota is not split across two buckets"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_should_keep_buckets_in_use() {
        let registry = registry();
        let busy = registry.resolve(messages(), channel("1"));
        drop(registry.resolve(messages(), channel("2")));

        assert_eq!(registry.sweep(Instant::now()), 1, "idle placeholder evicted");
        assert_eq!(registry.len(), 1);
        assert_eq!(busy.bucket().id().major, channel("1"));
    }
}
