#![forbid(unsafe_code)]

//! Reactive cache: a keyed store of merged results with change notification.
//!
//! # Invariants
//!
//! 1. Entries are mutated only through [`set`](ReactiveCache::set),
//!    [`update`](ReactiveCache::update), and the in-flight/error markers;
//!    no caller gets a live mutable reference into the store.
//! 2. `version` increments exactly once per committed value change.
//! 3. `update` with a structurally equal result is a no-op: no version
//!    bump, no notification. `set` always commits and always notifies.
//! 4. Subscribers of a key are invoked synchronously, in subscription
//!    order, before the committing call returns. Each notification pass
//!    works on a snapshot, so subscribing/unsubscribing mid-pass takes
//!    effect on the next pass.
//! 5. A `set`/`update` issued from inside a notification pass is queued and
//!    flushed iteratively after the pass completes — never interleaved,
//!    never dropped, never unboundedly recursive. Queueing applies
//!    regardless of key, which is stronger than the per-key serialization
//!    the consumers rely on.
//! 6. A failed merge leaves the entry untouched and surfaces only to the
//!    caller of `update`. A deferred merge (queued behind a notification
//!    pass) that fails has no caller left to surface to; it is logged and
//!    dropped.
//!
//! Eviction follows the constructor-supplied [`CachePolicy`]: by default
//! entries with zero subscribers are retained indefinitely.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use serde_json::Value;
use tracing::{debug, trace};
use web_time::Instant;

use crate::error::SockqError;
use crate::policy::{CachePolicy, EvictionPolicy};
use crate::route::CacheKey;

/// Callback invoked with a snapshot of the entry after each committed change.
pub type CacheListener = Rc<dyn Fn(&CacheEntry)>;

type MergeFnOnce = Box<dyn FnOnce(Option<&Value>) -> Result<Value, String>>;

/// One cached query result.
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    /// The merged value; `None` until the first commit.
    pub value: Option<Value>,
    /// Bumped once per committed value change.
    pub version: u64,
    /// When the current value was committed.
    pub fetched_at: Option<Instant>,
    /// Last transport-level error recorded for this key. Cleared by the next
    /// successful commit.
    pub error: Option<SockqError>,
    /// Whether a correlated request for this key is currently pending.
    pub in_flight: bool,
}

/// Result of a write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The value changed; carries the new entry version.
    Changed(u64),
    /// The merge produced a structurally equal value; nothing committed,
    /// nobody notified.
    Unchanged,
    /// The write was issued during a notification pass and has been queued;
    /// it commits right after the pass completes.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SubscriberId(u64);

struct SubscriberEntry {
    id: SubscriberId,
    callback: CacheListener,
}

enum QueuedWrite {
    Set { key: CacheKey, value: Value },
    Update { key: CacheKey, merge: MergeFnOnce },
}

#[derive(Default)]
struct CacheInner {
    entries: AHashMap<CacheKey, CacheEntry>,
    subscribers: AHashMap<CacheKey, Vec<SubscriberEntry>>,
    next_sub_id: u64,
    dispatching: bool,
    queued: VecDeque<QueuedWrite>,
    policy: CachePolicy,
}

impl CacheInner {
    fn callbacks_for(&self, key: &CacheKey) -> Vec<CacheListener> {
        self.subscribers
            .get(key)
            .map(|subs| subs.iter().map(|s| Rc::clone(&s.callback)).collect())
            .unwrap_or_default()
    }
}

/// Keyed store of merged results with get/set/subscribe and a guarded,
/// reducer-driven `update`.
///
/// Cloning yields another handle to the same store. Constructible per test;
/// [`reset`](Self::reset) drops all entries and subscribers.
#[derive(Clone, Default)]
pub struct ReactiveCache {
    inner: Rc<RefCell<CacheInner>>,
}

impl ReactiveCache {
    /// Create a cache with the default (retain) policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache with an explicit eviction policy.
    #[must_use]
    pub fn with_policy(policy: CachePolicy) -> Self {
        let cache = Self::new();
        cache.inner.borrow_mut().policy = policy;
        cache
    }

    /// Snapshot of the entry for `key`, if one exists. Pure read.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner.borrow().entries.get(key).cloned()
    }

    /// The cached value for `key`, if one has been committed.
    #[must_use]
    pub fn value(&self, key: &CacheKey) -> Option<Value> {
        self.inner
            .borrow()
            .entries
            .get(key)
            .and_then(|e| e.value.clone())
    }

    /// Replace the value for `key`. Always commits and always notifies,
    /// even when the new value equals the old one.
    pub fn set(&self, key: &CacheKey, value: Value) -> UpdateOutcome {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.dispatching {
                inner.queued.push_back(QueuedWrite::Set {
                    key: key.clone(),
                    value,
                });
                return UpdateOutcome::Deferred;
            }
        }
        let version = self.commit(key, value);
        self.flush_queued();
        UpdateOutcome::Changed(version)
    }

    /// Apply `merge` to the current value and commit the result.
    ///
    /// The reducer sees `None` before the first commit. A structurally equal
    /// result is not committed and notifies nobody.
    ///
    /// # Errors
    ///
    /// [`SockqError::MergeFunctionThrew`] when the reducer fails; the entry
    /// keeps its previous value and no notification fires.
    pub fn update(
        &self,
        key: &CacheKey,
        merge: impl FnOnce(Option<&Value>) -> Result<Value, String> + 'static,
    ) -> Result<UpdateOutcome, SockqError> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.dispatching {
                inner.queued.push_back(QueuedWrite::Update {
                    key: key.clone(),
                    merge: Box::new(merge),
                });
                return Ok(UpdateOutcome::Deferred);
            }
        }
        let outcome = self.apply_merge(key, Box::new(merge))?;
        self.flush_queued();
        Ok(outcome)
    }

    /// Subscribe to committed changes of `key`.
    ///
    /// The returned guard unsubscribes on drop; `unsubscribe()` is explicit
    /// and idempotent.
    pub fn subscribe(
        &self,
        key: &CacheKey,
        listener: impl Fn(&CacheEntry) + 'static,
    ) -> CacheSubscription {
        let mut inner = self.inner.borrow_mut();
        inner.next_sub_id += 1;
        let id = SubscriberId(inner.next_sub_id);
        inner
            .subscribers
            .entry(key.clone())
            .or_default()
            .push(SubscriberEntry {
                id,
                callback: Rc::new(listener),
            });
        trace!(key = %key, id = id.0, "cache subscriber added");
        CacheSubscription {
            cache: Rc::downgrade(&self.inner),
            key: key.clone(),
            id,
            active: Cell::new(true),
        }
    }

    /// Mark whether a correlated request is pending for `key`, creating the
    /// entry lazily. Does not bump the version and notifies nobody.
    pub fn mark_in_flight(&self, key: &CacheKey, in_flight: bool) {
        let mut inner = self.inner.borrow_mut();
        inner.entries.entry(key.clone()).or_default().in_flight = in_flight;
    }

    /// Record or clear a transport-level error on `key`, creating the entry
    /// lazily. The value and version are untouched; subscribers are not
    /// notified (error visibility flows through binding state).
    pub fn set_error(&self, key: &CacheKey, error: Option<SockqError>) {
        let mut inner = self.inner.borrow_mut();
        inner.entries.entry(key.clone()).or_default().error = error;
    }

    /// Number of live subscribers for `key`.
    #[must_use]
    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.inner
            .borrow()
            .subscribers
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Number of entries currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().entries.is_empty()
    }

    /// Drop every entry and subscriber. Outstanding guards become inert.
    pub fn reset(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.entries.clear();
        inner.subscribers.clear();
        inner.queued.clear();
        inner.dispatching = false;
    }

    fn apply_merge(&self, key: &CacheKey, merge: MergeFnOnce) -> Result<UpdateOutcome, SockqError> {
        // The reducer runs outside the borrow so it may read the cache.
        let current = self.value(key);
        let next = merge(current.as_ref()).map_err(SockqError::MergeFunctionThrew)?;
        if current.as_ref() == Some(&next) {
            trace!(key = %key, "merge produced equal value; notification suppressed");
            return Ok(UpdateOutcome::Unchanged);
        }
        Ok(UpdateOutcome::Changed(self.commit(key, next)))
    }

    fn commit(&self, key: &CacheKey, next: Value) -> u64 {
        let (snapshot, callbacks) = {
            let mut inner = self.inner.borrow_mut();
            let entry = inner.entries.entry(key.clone()).or_default();
            entry.value = Some(next);
            entry.version += 1;
            entry.fetched_at = Some(Instant::now());
            // A committed value is a successful re-trigger for this key.
            entry.error = None;
            let snapshot = entry.clone();
            inner.dispatching = true;
            (snapshot, inner.callbacks_for(key))
        };
        trace!(key = %key, version = snapshot.version, subscribers = callbacks.len(), "commit");
        for cb in &callbacks {
            cb(&snapshot);
        }
        self.inner.borrow_mut().dispatching = false;
        snapshot.version
    }

    /// Flush writes queued during notification passes. Each flushed write
    /// may queue more; the loop runs until the queue drains.
    fn flush_queued(&self) {
        loop {
            let next = self.inner.borrow_mut().queued.pop_front();
            let Some(write) = next else { break };
            match write {
                QueuedWrite::Set { key, value } => {
                    self.commit(&key, value);
                }
                QueuedWrite::Update { key, merge } => {
                    if let Err(err) = self.apply_merge(&key, merge) {
                        debug!(key = %key, %err, "deferred merge failed; dropped");
                    }
                }
            }
        }
    }

    fn evict_if_unobserved(&self, key: &CacheKey) {
        let mut inner = self.inner.borrow_mut();
        if inner.policy.eviction != EvictionPolicy::EvictUnobserved {
            return;
        }
        if inner.subscribers.contains_key(key) {
            return;
        }
        let in_flight = inner.entries.get(key).is_some_and(|e| e.in_flight);
        if !in_flight && inner.entries.remove(key).is_some() {
            debug!(key = %key, "entry evicted (unobserved)");
        }
    }
}

impl std::fmt::Debug for ReactiveCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ReactiveCache")
            .field("entries", &inner.entries.len())
            .field("policy", &inner.policy)
            .finish()
    }
}

/// RAII guard for a cache subscription.
pub struct CacheSubscription {
    cache: Weak<RefCell<CacheInner>>,
    key: CacheKey,
    id: SubscriberId,
    active: Cell<bool>,
}

impl CacheSubscription {
    /// Remove the subscription now. Calling this twice is a no-op.
    pub fn unsubscribe(&self) {
        if !self.active.replace(false) {
            return;
        }
        let Some(cache) = self.cache.upgrade() else {
            return;
        };
        {
            let mut inner = cache.borrow_mut();
            if let Some(subs) = inner.subscribers.get_mut(&self.key) {
                subs.retain(|s| s.id != self.id);
                if subs.is_empty() {
                    inner.subscribers.remove(&self.key);
                }
            }
        }
        trace!(key = %self.key, id = self.id.0, "cache subscriber removed");
        ReactiveCache { inner: cache }.evict_if_unobserved(&self.key);
    }

    /// The key this subscription observes.
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Drop for CacheSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for CacheSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSubscription")
            .field("key", &self.key)
            .field("active", &self.active.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn key(s: &str) -> CacheKey {
        CacheKey::from(s)
    }

    #[test]
    fn get_on_missing_key_is_none() {
        let cache = ReactiveCache::new();
        assert!(cache.get(&key("nope")).is_none());
        assert!(cache.value(&key("nope")).is_none());
    }

    #[test]
    fn set_always_notifies_even_when_equal() {
        let cache = ReactiveCache::new();
        let k = key("k");
        let hits = Rc::new(Cell::new(0u32));
        let h = Rc::clone(&hits);
        let _sub = cache.subscribe(&k, move |_| h.set(h.get() + 1));

        cache.set(&k, json!(1));
        cache.set(&k, json!(1));
        assert_eq!(hits.get(), 2);
        assert_eq!(cache.get(&k).unwrap().version, 2);
    }

    #[test]
    fn update_suppresses_notification_when_structurally_equal() {
        let cache = ReactiveCache::new();
        let k = key("k");
        let hits = Rc::new(Cell::new(0u32));
        let h = Rc::clone(&hits);
        let _sub = cache.subscribe(&k, move |_| h.set(h.get() + 1));

        let first = cache.update(&k, |_| Ok(json!({"n": 1}))).unwrap();
        assert_eq!(first, UpdateOutcome::Changed(1));

        // Identity merge: same structure, different map construction.
        let second = cache
            .update(&k, |old| Ok(old.cloned().unwrap_or(Value::Null)))
            .unwrap();
        assert_eq!(second, UpdateOutcome::Unchanged);
        assert_eq!(hits.get(), 1, "identity merge must not notify");
        assert_eq!(cache.get(&k).unwrap().version, 1);
    }

    #[test]
    fn merge_sees_none_then_previous_value() {
        let cache = ReactiveCache::new();
        let k = key("k");

        cache
            .update(&k, |old| {
                assert!(old.is_none());
                Ok(json!([1]))
            })
            .unwrap();
        cache
            .update(&k, |old| {
                let mut list = old.unwrap().as_array().unwrap().clone();
                list.push(json!(2));
                Ok(Value::Array(list))
            })
            .unwrap();
        assert_eq!(cache.value(&k).unwrap(), json!([1, 2]));
    }

    #[test]
    fn failed_merge_leaves_entry_untouched() {
        let cache = ReactiveCache::new();
        let k = key("k");
        let hits = Rc::new(Cell::new(0u32));
        let h = Rc::clone(&hits);
        let _sub = cache.subscribe(&k, move |_| h.set(h.get() + 1));

        cache.set(&k, json!({"good": true}));
        let err = cache
            .update(&k, |_| Err(String::from("unexpected payload shape")))
            .unwrap_err();
        assert_eq!(
            err,
            SockqError::MergeFunctionThrew("unexpected payload shape".into())
        );
        assert_eq!(cache.value(&k).unwrap(), json!({"good": true}));
        assert_eq!(cache.get(&k).unwrap().version, 1);
        assert_eq!(hits.get(), 1, "failed merge must not notify");
        assert!(cache.get(&k).unwrap().error.is_none(), "not stored in entry");
    }

    #[test]
    fn subscribers_notified_in_subscription_order() {
        let cache = ReactiveCache::new();
        let k = key("k");
        let log: Rc<RefCell<Vec<&'static str>>> = Rc::default();
        let (l1, l2) = (Rc::clone(&log), Rc::clone(&log));
        let _a = cache.subscribe(&k, move |_| l1.borrow_mut().push("a"));
        let _b = cache.subscribe(&k, move |_| l2.borrow_mut().push("b"));

        cache.set(&k, json!(0));
        assert_eq!(*log.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn reentrant_update_is_queued_and_flushed() {
        let cache = ReactiveCache::new();
        let k = key("k");
        let seen: Rc<RefCell<Vec<Value>>> = Rc::default();

        let cache2 = cache.clone();
        let k2 = k.clone();
        let seen2 = Rc::clone(&seen);
        let _sub = cache.subscribe(&k, move |entry| {
            let v = entry.value.clone().unwrap();
            seen2.borrow_mut().push(v.clone());
            if v == json!(1) {
                // Re-entrant write from inside the notification pass.
                let outcome = cache2.update(&k2, |_| Ok(json!(2))).unwrap();
                assert_eq!(outcome, UpdateOutcome::Deferred);
                // The inner write must not have landed yet.
                assert_eq!(cache2.value(&k2).unwrap(), json!(1));
            }
        });

        cache.set(&k, json!(1));
        assert_eq!(*seen.borrow(), vec![json!(1), json!(2)]);
        assert_eq!(cache.value(&k).unwrap(), json!(2));
    }

    #[test]
    fn reentrant_chain_flushes_iteratively() {
        let cache = ReactiveCache::new();
        let k = key("k");
        let cache2 = cache.clone();
        let k2 = k.clone();
        let _sub = cache.subscribe(&k, move |entry| {
            let n = entry.value.as_ref().unwrap().as_i64().unwrap();
            if n < 4 {
                cache2.set(&k2, json!(n + 1));
            }
        });

        cache.set(&k, json!(0));
        assert_eq!(cache.value(&k).unwrap(), json!(4));
        assert_eq!(cache.get(&k).unwrap().version, 5);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let cache = ReactiveCache::new();
        let k = key("k");
        let sub = cache.subscribe(&k, |_| {});
        assert_eq!(cache.subscriber_count(&k), 1);
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(cache.subscriber_count(&k), 0);
        drop(sub);
        assert_eq!(cache.subscriber_count(&k), 0);
    }

    #[test]
    fn entry_survives_unsubscribe_under_retain_policy() {
        let cache = ReactiveCache::new();
        let k = key("k");
        let sub = cache.subscribe(&k, |_| {});
        cache.set(&k, json!("kept"));
        drop(sub);
        assert_eq!(cache.value(&k).unwrap(), json!("kept"));
    }

    #[test]
    fn evict_unobserved_drops_entry_on_last_unsubscribe() {
        let cache = ReactiveCache::with_policy(CachePolicy::evict_unobserved());
        let k = key("k");
        let sub_a = cache.subscribe(&k, |_| {});
        let sub_b = cache.subscribe(&k, |_| {});
        cache.set(&k, json!(7));

        drop(sub_a);
        assert!(cache.get(&k).is_some(), "still observed by b");
        drop(sub_b);
        assert!(cache.get(&k).is_none(), "last unsubscribe evicts");
    }

    #[test]
    fn evict_unobserved_spares_in_flight_entries() {
        let cache = ReactiveCache::with_policy(CachePolicy::evict_unobserved());
        let k = key("k");
        cache.mark_in_flight(&k, true);
        let sub = cache.subscribe(&k, |_| {});
        drop(sub);
        assert!(cache.get(&k).is_some(), "in-flight entry must survive");
    }

    #[test]
    fn in_flight_and_error_markers_do_not_notify() {
        let cache = ReactiveCache::new();
        let k = key("k");
        let hits = Rc::new(Cell::new(0u32));
        let h = Rc::clone(&hits);
        let _sub = cache.subscribe(&k, move |_| h.set(h.get() + 1));

        cache.mark_in_flight(&k, true);
        cache.set_error(&k, Some(SockqError::ConnectionLost));
        assert_eq!(hits.get(), 0);
        assert!(cache.get(&k).unwrap().in_flight);
        assert_eq!(cache.get(&k).unwrap().error, Some(SockqError::ConnectionLost));
    }

    #[test]
    fn commit_clears_recorded_error() {
        let cache = ReactiveCache::new();
        let k = key("k");
        cache.set_error(&k, Some(SockqError::ConnectionLost));
        cache.set(&k, json!("fresh"));
        assert!(cache.get(&k).unwrap().error.is_none());
    }

    #[test]
    fn reset_clears_everything() {
        let cache = ReactiveCache::new();
        let k = key("k");
        let sub = cache.subscribe(&k, |_| {});
        cache.set(&k, json!(1));
        cache.reset();
        assert!(cache.is_empty());
        assert_eq!(cache.subscriber_count(&k), 0);
        sub.unsubscribe(); // inert, no panic
    }
}
