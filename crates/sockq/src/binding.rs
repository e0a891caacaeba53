#![forbid(unsafe_code)]

//! Query bindings: the consumer-facing layer.
//!
//! A [`QueryClient`] owns one route registry, request correlator, and
//! reactive cache, plus the transport handle. Consumers create
//! [`QueryBinding`]s (emit + wait + merge) and [`ListenBinding`]s
//! (merge every push, no emit) against it; transport glue feeds it with
//! [`ingest`](QueryClient::ingest) and
//! [`connection_lost`](QueryClient::connection_lost).
//!
//! # Binding state machine
//!
//! `Idle → Requesting → Resolved | Errored`, with `enabled = false`
//! collapsing any state back to `Idle`. A disabled binding freezes its
//! exposed [`QueryState`]; the cache entry underneath keeps updating for
//! other bindings sharing the key and is never deleted by a disable.
//!
//! # Visibility rules
//!
//! - `data` always reflects the cache entry, not the raw response: every
//!   binding sharing a key sees the identical merged value.
//! - `is_loading` is true only while requesting with no cached value yet; a
//!   background refetch over existing data stays `is_loading = false`
//!   (stale-while-revalidate).
//! - Errors land in `QueryState::error` and leave `data` at its last good
//!   value; they never propagate as panics out of a binding.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde_json::Value;
use tracing::{debug, trace};

use crate::cache::{CacheEntry, CacheSubscription, ReactiveCache};
use crate::correlator::{Handle, RequestCorrelator, SettleResult};
use crate::error::SockqError;
use crate::policy::CachePolicy;
use crate::registry::{ListenerGuard, RouteRegistry};
use crate::route::{CacheKey, EmitDescriptor, RouteDescriptor};
use crate::transport::Transport;

/// Caller-supplied reducer combining the previous cached value with a new
/// pushed payload.
pub type MergeFn = Rc<dyn Fn(Option<&Value>, &Value) -> Result<Value, String>>;

/// Lifecycle phase of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryPhase {
    /// Disabled or not yet started.
    #[default]
    Idle,
    /// A correlated request is in flight.
    Requesting,
    /// The cache holds a merged value for this binding's key.
    Resolved,
    /// The last attempt failed; see [`QueryState::error`].
    Errored,
}

/// Snapshot exposed to consumers.
#[derive(Debug, Clone)]
pub struct QueryState {
    /// The merged cache value for the binding's key, if any.
    pub data: Option<Value>,
    /// Whether a value has ever been committed for the key.
    pub is_fetched: bool,
    /// True only while requesting with no cached value.
    pub is_loading: bool,
    /// The last error affecting this binding, if any.
    pub error: Option<SockqError>,
}

/// Descriptor for an emit-and-wait query binding.
#[derive(Clone)]
pub struct QuerySpec {
    /// The outbound request.
    pub emit: EmitDescriptor,
    /// Route the response is pushed on.
    pub route: RouteDescriptor,
    /// Key the merged result is cached under.
    pub cache_key: CacheKey,
    /// Reducer applied to `(previous_value, response)`.
    pub merge: MergeFn,
    /// Whether the binding starts active.
    pub enabled: bool,
}

impl QuerySpec {
    /// Build a spec; `enabled` defaults to true.
    pub fn new(
        emit: EmitDescriptor,
        route: impl Into<RouteDescriptor>,
        cache_key: impl Into<CacheKey>,
        merge: impl Fn(Option<&Value>, &Value) -> Result<Value, String> + 'static,
    ) -> Self {
        Self {
            emit,
            route: route.into(),
            cache_key: cache_key.into(),
            merge: Rc::new(merge),
            enabled: true,
        }
    }

    /// Set the enabled flag.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

impl std::fmt::Debug for QuerySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySpec")
            .field("emit", &self.emit)
            .field("route", &self.route)
            .field("cache_key", &self.cache_key)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Descriptor for a listen-only binding (no emit; merges every push).
#[derive(Clone)]
pub struct ListenSpec {
    /// Route whose pushes feed the merge.
    pub route: RouteDescriptor,
    /// Key the merged result is cached under.
    pub cache_key: CacheKey,
    /// Reducer applied to `(previous_value, push)`.
    pub merge: MergeFn,
    /// Whether the binding starts active.
    pub enabled: bool,
}

impl ListenSpec {
    /// Build a spec; `enabled` defaults to true.
    pub fn new(
        route: impl Into<RouteDescriptor>,
        cache_key: impl Into<CacheKey>,
        merge: impl Fn(Option<&Value>, &Value) -> Result<Value, String> + 'static,
    ) -> Self {
        Self {
            route: route.into(),
            cache_key: cache_key.into(),
            merge: Rc::new(merge),
            enabled: true,
        }
    }

    /// Set the enabled flag.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

impl std::fmt::Debug for ListenSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenSpec")
            .field("route", &self.route)
            .field("cache_key", &self.cache_key)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// The facade consumers and transport glue talk to.
///
/// Constructible per test; cloning yields another handle to the same
/// registry/correlator/cache trio.
#[derive(Clone)]
pub struct QueryClient {
    registry: RouteRegistry,
    correlator: RequestCorrelator,
    cache: ReactiveCache,
}

impl QueryClient {
    /// Create a client over `transport` with the default cache policy.
    #[must_use]
    pub fn new(transport: Rc<dyn Transport>) -> Self {
        Self::with_policy(transport, CachePolicy::default())
    }

    /// Create a client with an explicit cache policy.
    #[must_use]
    pub fn with_policy(transport: Rc<dyn Transport>, policy: CachePolicy) -> Self {
        let registry = RouteRegistry::new();
        Self {
            correlator: RequestCorrelator::new(registry.clone(), transport),
            cache: ReactiveCache::with_policy(policy),
            registry,
        }
    }

    /// Deliver a pushed frame to every interested listener. Transport glue
    /// calls this for each decoded incoming message.
    pub fn ingest(&self, route: &RouteDescriptor, payload: &Value) -> usize {
        self.registry.dispatch(route, payload)
    }

    /// Forward a transport disconnect: every pending request rejects with
    /// [`SockqError::ConnectionLost`].
    pub fn connection_lost(&self) {
        self.correlator.connection_lost();
    }

    /// The shared reactive cache.
    #[must_use]
    pub fn cache(&self) -> &ReactiveCache {
        &self.cache
    }

    /// The shared route registry.
    #[must_use]
    pub fn registry(&self) -> &RouteRegistry {
        &self.registry
    }

    /// The shared correlator.
    #[must_use]
    pub fn correlator(&self) -> &RequestCorrelator {
        &self.correlator
    }

    /// One-off read of the cached value for `key`, outside any binding.
    #[must_use]
    pub fn cached_value(&self, key: &CacheKey) -> Option<Value> {
        self.cache.value(key)
    }

    /// Imperative emit-and-wait without cache involvement.
    ///
    /// # Errors
    ///
    /// Same as [`RequestCorrelator::request`].
    pub fn request_once(
        &self,
        emit: &EmitDescriptor,
        response_route: impl Into<RouteDescriptor>,
    ) -> Result<Handle, SockqError> {
        self.correlator.request(emit, response_route)
    }

    /// Create an emit-and-wait binding. Activates immediately when
    /// `spec.enabled` is true.
    #[must_use]
    pub fn query(&self, spec: QuerySpec) -> QueryBinding {
        let mut binding = QueryBinding {
            client: self.clone(),
            spec,
            shared: Rc::new(BindingShared::default()),
            on_change: Rc::new(RefCell::new(None)),
            handle: None,
            cache_sub: None,
            frozen: None,
        };
        if binding.spec.enabled {
            binding.activate();
        }
        binding
    }

    /// Create a listen-only binding. Activates immediately when
    /// `spec.enabled` is true.
    #[must_use]
    pub fn listen(&self, spec: ListenSpec) -> ListenBinding {
        let mut binding = ListenBinding {
            client: self.clone(),
            spec,
            merge_error: Rc::new(RefCell::new(None)),
            route_sub: None,
            cache_sub: None,
            frozen: None,
        };
        if binding.spec.enabled {
            binding.activate();
        }
        binding
    }

    /// Drop every listener, pending request, and cache entry.
    pub fn reset(&self) {
        self.correlator.reset();
        self.registry.reset();
        self.cache.reset();
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("registry", &self.registry)
            .field("correlator", &self.correlator)
            .field("cache", &self.cache)
            .finish()
    }
}

#[derive(Default)]
struct BindingShared {
    phase: Cell<QueryPhase>,
    merge_error: RefCell<Option<SockqError>>,
}

type OnChange = Rc<RefCell<Option<Rc<dyn Fn(&QueryState)>>>>;

/// An emit-and-wait binding tied to a cache key.
///
/// Dropping the binding cancels its share of any pending request and its
/// cache subscription; the cache entry survives.
pub struct QueryBinding {
    client: QueryClient,
    spec: QuerySpec,
    shared: Rc<BindingShared>,
    on_change: OnChange,
    handle: Option<Handle>,
    cache_sub: Option<CacheSubscription>,
    frozen: Option<QueryState>,
}

impl QueryBinding {
    /// Current snapshot. While disabled, returns the state frozen at
    /// disable time.
    #[must_use]
    pub fn state(&self) -> QueryState {
        match &self.frozen {
            Some(frozen) => frozen.clone(),
            None => compute_state(
                &self.client.cache,
                &self.spec.cache_key,
                self.shared.phase.get(),
                &self.shared.merge_error.borrow(),
            ),
        }
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> QueryPhase {
        self.shared.phase.get()
    }

    /// The key this binding caches under.
    #[must_use]
    pub fn cache_key(&self) -> &CacheKey {
        &self.spec.cache_key
    }

    /// Register a callback fired after each committed cache change for this
    /// binding's key (while enabled). Replaces any previous callback.
    pub fn on_change(&self, callback: impl Fn(&QueryState) + 'static) {
        *self.on_change.borrow_mut() = Some(Rc::new(callback));
    }

    /// Enable or disable the binding. Disabling freezes the exposed state
    /// and releases the request refcount and cache subscription; the cache
    /// entry is untouched. Re-enabling clears errors and requests afresh
    /// when no usable value is cached. Idempotent.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled == self.spec.enabled {
            return;
        }
        self.spec.enabled = enabled;
        if enabled {
            self.clear_errors();
            self.activate();
        } else {
            self.deactivate();
        }
    }

    /// Force a fresh request, regardless of cached data. Any previous
    /// in-flight share is cancelled first. No-op while disabled.
    pub fn refetch(&mut self) {
        if !self.spec.enabled {
            return;
        }
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
        self.clear_errors();
        self.start_request();
    }

    /// Re-apply a (possibly changed) spec, as a consumer re-invoking the
    /// binding with fresh inputs would. Re-subscribes only when the cache
    /// key actually changed; with a stable key this only adopts the new
    /// emit/route/merge and enabled flag.
    pub fn rebind(&mut self, spec: QuerySpec) {
        if spec.cache_key == self.spec.cache_key {
            let want_enabled = spec.enabled;
            let was_enabled = self.spec.enabled;
            self.spec = QuerySpec {
                enabled: was_enabled,
                ..spec
            };
            if want_enabled != was_enabled {
                self.set_enabled(want_enabled);
            }
            return;
        }
        debug!(
            old = %self.spec.cache_key,
            new = %spec.cache_key,
            "cache key changed; re-subscribing"
        );
        self.deactivate();
        self.spec = spec;
        self.frozen = None;
        if self.spec.enabled {
            self.activate();
        }
    }

    fn activate(&mut self) {
        self.frozen = None;
        if self.cache_sub.is_none() {
            self.cache_sub = Some(self.subscribe_cache());
        }
        let usable = self
            .client
            .cache
            .get(&self.spec.cache_key)
            .is_some_and(|e| e.value.is_some() && e.error.is_none());
        if usable {
            trace!(key = %self.spec.cache_key, "usable cached value; no request");
            self.shared.phase.set(QueryPhase::Resolved);
            return;
        }
        self.start_request();
    }

    fn deactivate(&mut self) {
        self.frozen = Some(self.state());
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
        if let Some(sub) = self.cache_sub.take() {
            sub.unsubscribe();
        }
        self.shared.phase.set(QueryPhase::Idle);
        if let Some(frozen) = &mut self.frozen {
            frozen.is_loading = false;
        }
    }

    fn start_request(&mut self) {
        let key = self.spec.cache_key.clone();
        let cache = self.client.cache.clone();
        cache.mark_in_flight(&key, true);
        self.shared.phase.set(QueryPhase::Requesting);

        match self
            .client
            .correlator
            .request(&self.spec.emit, self.spec.route.clone())
        {
            Ok(handle) => {
                let shared = Rc::clone(&self.shared);
                let merge = Rc::clone(&self.spec.merge);
                handle.on_settle(move |outcome: &SettleResult| {
                    cache.mark_in_flight(&key, false);
                    match outcome {
                        Ok(payload) => {
                            let merge = Rc::clone(&merge);
                            let payload = payload.clone();
                            match cache.update(&key, move |old| merge(old, &payload)) {
                                Ok(_) => shared.phase.set(QueryPhase::Resolved),
                                Err(err) => {
                                    *shared.merge_error.borrow_mut() = Some(err);
                                    shared.phase.set(QueryPhase::Errored);
                                }
                            }
                        }
                        Err(err) => {
                            cache.set_error(&key, Some(err.clone()));
                            shared.phase.set(QueryPhase::Errored);
                        }
                    }
                });
                self.handle = Some(handle);
            }
            Err(err) => {
                cache.mark_in_flight(&key, false);
                cache.set_error(&key, Some(err.clone()));
                self.shared.phase.set(QueryPhase::Errored);
                debug!(key = %key, %err, "request failed to start");
            }
        }
    }

    fn subscribe_cache(&self) -> CacheSubscription {
        let shared = Rc::clone(&self.shared);
        let on_change = Rc::clone(&self.on_change);
        self.client
            .cache
            .subscribe(&self.spec.cache_key, move |entry: &CacheEntry| {
                // A value that landed through a sibling binding resolves us.
                if shared.phase.get() == QueryPhase::Requesting && entry.value.is_some() {
                    shared.phase.set(QueryPhase::Resolved);
                }
                let callback = on_change.borrow().as_ref().map(Rc::clone);
                if let Some(callback) = callback {
                    callback(&QueryState {
                        data: entry.value.clone(),
                        is_fetched: entry.value.is_some(),
                        is_loading: false,
                        error: shared
                            .merge_error
                            .borrow()
                            .clone()
                            .or_else(|| entry.error.clone()),
                    });
                }
            })
    }

    fn clear_errors(&mut self) {
        self.shared.merge_error.take();
        if self
            .client
            .cache
            .get(&self.spec.cache_key)
            .is_some_and(|e| e.error.is_some())
        {
            self.client.cache.set_error(&self.spec.cache_key, None);
        }
        if self.shared.phase.get() == QueryPhase::Errored {
            self.shared.phase.set(QueryPhase::Idle);
        }
    }
}

impl Drop for QueryBinding {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
        // cache_sub unsubscribes on drop.
    }
}

impl std::fmt::Debug for QueryBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryBinding")
            .field("cache_key", &self.spec.cache_key)
            .field("phase", &self.shared.phase.get())
            .field("enabled", &self.spec.enabled)
            .finish()
    }
}

/// A listen-only binding: merges every push on a route into the cache for
/// as long as it is enabled. Never loading; no emit, no correlator share.
pub struct ListenBinding {
    client: QueryClient,
    spec: ListenSpec,
    merge_error: Rc<RefCell<Option<SockqError>>>,
    route_sub: Option<ListenerGuard>,
    cache_sub: Option<CacheSubscription>,
    frozen: Option<QueryState>,
}

impl ListenBinding {
    /// Current snapshot. While disabled, returns the state frozen at
    /// disable time.
    #[must_use]
    pub fn state(&self) -> QueryState {
        if let Some(frozen) = &self.frozen {
            return frozen.clone();
        }
        let entry = self.client.cache.get(&self.spec.cache_key);
        let data = entry.as_ref().and_then(|e| e.value.clone());
        QueryState {
            is_fetched: data.is_some(),
            is_loading: false,
            error: self
                .merge_error
                .borrow()
                .clone()
                .or_else(|| entry.as_ref().and_then(|e| e.error.clone())),
            data,
        }
    }

    /// Enable or disable. Disabling freezes the exposed state and stops
    /// merging pushes; the cache entry is untouched. Idempotent.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled == self.spec.enabled {
            return;
        }
        self.spec.enabled = enabled;
        if enabled {
            self.merge_error.take();
            self.activate();
        } else {
            self.frozen = Some(self.state());
            if let Some(sub) = self.route_sub.take() {
                sub.unregister();
            }
            if let Some(sub) = self.cache_sub.take() {
                sub.unsubscribe();
            }
        }
    }

    fn activate(&mut self) {
        self.frozen = None;
        if self.cache_sub.is_none() {
            self.cache_sub = Some(self.client.cache.subscribe(&self.spec.cache_key, |_| {}));
        }
        if self.route_sub.is_some() {
            return;
        }
        let cache = self.client.cache.clone();
        let key = self.spec.cache_key.clone();
        let merge = Rc::clone(&self.spec.merge);
        let merge_error = Rc::clone(&self.merge_error);
        let guard = self
            .client
            .registry
            .register(self.spec.route.clone(), move |payload: &Value| {
                let merge = Rc::clone(&merge);
                let payload = payload.clone();
                if let Err(err) = cache.update(&key, move |old| merge(old, &payload)) {
                    debug!(key = %key, %err, "push merge failed");
                    *merge_error.borrow_mut() = Some(err);
                }
            });
        self.route_sub = Some(guard);
    }
}

impl std::fmt::Debug for ListenBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenBinding")
            .field("route", &self.spec.route)
            .field("cache_key", &self.spec.cache_key)
            .field("enabled", &self.spec.enabled)
            .finish()
    }
}

fn compute_state(
    cache: &ReactiveCache,
    key: &CacheKey,
    phase: QueryPhase,
    merge_error: &Option<SockqError>,
) -> QueryState {
    let entry = cache.get(key);
    let data = entry.as_ref().and_then(|e| e.value.clone());
    QueryState {
        is_fetched: data.is_some(),
        is_loading: phase == QueryPhase::Requesting && data.is_none(),
        error: merge_error
            .clone()
            .or_else(|| entry.as_ref().and_then(|e| e.error.clone())),
        data,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::transport::TransportError;

    #[derive(Default)]
    struct FakeTransport {
        emits: RefCell<Vec<EmitDescriptor>>,
        fail_with: RefCell<Option<String>>,
    }

    impl Transport for FakeTransport {
        fn emit(&self, emit: &EmitDescriptor) -> Result<(), TransportError> {
            if let Some(reason) = self.fail_with.borrow().clone() {
                return Err(TransportError::new(reason));
            }
            self.emits.borrow_mut().push(emit.clone());
            Ok(())
        }
    }

    fn setup() -> (Rc<FakeTransport>, QueryClient) {
        let transport = Rc::new(FakeTransport::default());
        let client = QueryClient::new(Rc::clone(&transport) as Rc<dyn Transport>);
        (transport, client)
    }

    fn replace_merge() -> impl Fn(Option<&Value>, &Value) -> Result<Value, String> {
        |_old, new| Ok(new.clone())
    }

    fn list_spec() -> QuerySpec {
        QuerySpec::new(
            EmitDescriptor::new("dashboards/list", json!({"page": 1})),
            "dashboards/list:getList",
            "list:dashboards",
            replace_merge(),
        )
    }

    const RESPONSE: &str = "dashboards/list:getList";

    fn push(client: &QueryClient, payload: Value) {
        client.ingest(&RouteDescriptor::from(RESPONSE), &payload);
    }

    #[test]
    fn idle_until_enabled() {
        let (transport, client) = setup();
        let binding = client.query(list_spec().enabled(false));
        assert_eq!(binding.phase(), QueryPhase::Idle);
        assert_eq!(transport.emits.borrow().len(), 0);
        let state = binding.state();
        assert!(state.data.is_none() && !state.is_loading && state.error.is_none());
    }

    #[test]
    fn requesting_then_resolved() {
        let (transport, client) = setup();
        let binding = client.query(list_spec());
        assert_eq!(binding.phase(), QueryPhase::Requesting);
        assert!(binding.state().is_loading);
        assert_eq!(transport.emits.borrow().len(), 1);

        push(&client, json!({"rows": [1, 2]}));
        assert_eq!(binding.phase(), QueryPhase::Resolved);
        let state = binding.state();
        assert_eq!(state.data, Some(json!({"rows": [1, 2]})));
        assert!(state.is_fetched && !state.is_loading);
        assert!(state.error.is_none());
    }

    #[test]
    fn data_reflects_cache_not_raw_response() {
        let (_transport, client) = setup();
        let spec = QuerySpec::new(
            EmitDescriptor::new("metrics/list", json!({})),
            "metrics/list:getList",
            "list:metrics",
            |old, new| {
                let mut rows = old
                    .and_then(|v| v.as_array().cloned())
                    .unwrap_or_default();
                rows.extend(new.as_array().cloned().unwrap_or_default());
                Ok(Value::Array(rows))
            },
        );
        let binding = client.query(spec);
        client.ingest(&RouteDescriptor::from("metrics/list:getList"), &json!([1, 2]));
        // Merged shape, not the raw push.
        assert_eq!(binding.state().data, Some(json!([1, 2])));
        assert_eq!(client.cached_value(&CacheKey::from("list:metrics")), Some(json!([1, 2])));
    }

    #[test]
    fn cached_value_short_circuits_new_binding() {
        let (transport, client) = setup();
        let a = client.query(list_spec());
        push(&client, json!("cached"));
        assert_eq!(transport.emits.borrow().len(), 1);

        // Same key, later consumer: no new wire request, immediately resolved.
        let b = client.query(list_spec());
        assert_eq!(transport.emits.borrow().len(), 1);
        assert_eq!(b.phase(), QueryPhase::Resolved);
        assert_eq!(b.state().data, Some(json!("cached")));
        drop(a);
    }

    #[test]
    fn stale_while_revalidate_keeps_is_loading_false() {
        let (transport, client) = setup();
        let mut binding = client.query(list_spec());
        push(&client, json!("v1"));

        binding.refetch();
        assert_eq!(binding.phase(), QueryPhase::Requesting);
        let state = binding.state();
        assert!(!state.is_loading, "background refetch over existing data");
        assert_eq!(state.data, Some(json!("v1")));
        assert_eq!(transport.emits.borrow().len(), 2);

        push(&client, json!("v2"));
        assert_eq!(binding.state().data, Some(json!("v2")));
    }

    #[test]
    fn disable_freezes_state_and_releases_resources() {
        let (_transport, client) = setup();
        let mut binding = client.query(list_spec());
        let key = CacheKey::from("list:dashboards");
        assert_eq!(client.cache().subscriber_count(&key), 1);

        binding.set_enabled(false);
        assert_eq!(binding.phase(), QueryPhase::Idle);
        assert_eq!(client.cache().subscriber_count(&key), 0);
        assert_eq!(client.correlator().pending_count(), 0);

        // Entry itself survives the disable.
        client.cache().set(&key, json!("outside"));
        assert!(binding.state().data.is_none(), "frozen at disable time");
        assert_eq!(client.cached_value(&key), Some(json!("outside")));
    }

    #[test]
    fn set_enabled_is_idempotent() {
        let (transport, client) = setup();
        let mut binding = client.query(list_spec());
        binding.set_enabled(true);
        binding.set_enabled(true);
        assert_eq!(transport.emits.borrow().len(), 1);
        binding.set_enabled(false);
        binding.set_enabled(false);
        assert_eq!(binding.phase(), QueryPhase::Idle);
    }

    #[test]
    fn emit_failure_surfaces_error_and_reenable_retries() {
        let (transport, client) = setup();
        *transport.fail_with.borrow_mut() = Some(String::from("not connected"));

        let mut binding = client.query(list_spec());
        assert_eq!(binding.phase(), QueryPhase::Errored);
        let state = binding.state();
        assert_eq!(
            state.error,
            Some(SockqError::TransportEmitFailed("not connected".into()))
        );
        assert!(state.data.is_none());

        // Transport heals; a re-enable cycle clears the error and retries.
        *transport.fail_with.borrow_mut() = None;
        binding.set_enabled(false);
        binding.set_enabled(true);
        assert_eq!(binding.phase(), QueryPhase::Requesting);
        assert!(binding.state().error.is_none());
        assert_eq!(transport.emits.borrow().len(), 1);

        push(&client, json!("recovered"));
        assert_eq!(binding.state().data, Some(json!("recovered")));
    }

    #[test]
    fn merge_failure_keeps_last_good_data() {
        let (_transport, client) = setup();
        let flaky = Rc::new(Cell::new(false));
        let f = Rc::clone(&flaky);
        let spec = QuerySpec::new(
            EmitDescriptor::new("metrics/get", json!({"id": 7})),
            "metrics/get:getMetric",
            "metric:7",
            move |_old, new| {
                if f.get() {
                    Err(String::from("shape mismatch"))
                } else {
                    Ok(new.clone())
                }
            },
        );
        let mut binding = client.query(spec);
        client.ingest(&RouteDescriptor::from("metrics/get:getMetric"), &json!("good"));
        assert_eq!(binding.state().data, Some(json!("good")));

        flaky.set(true);
        binding.refetch();
        client.ingest(&RouteDescriptor::from("metrics/get:getMetric"), &json!("bad"));
        assert_eq!(binding.phase(), QueryPhase::Errored);
        let state = binding.state();
        assert_eq!(
            state.error,
            Some(SockqError::MergeFunctionThrew("shape mismatch".into()))
        );
        assert_eq!(state.data, Some(json!("good")), "last good value kept");
    }

    #[test]
    fn disconnect_while_pending_errors_the_binding() {
        let (_transport, client) = setup();
        let binding = client.query(list_spec());
        client.connection_lost();
        assert_eq!(binding.phase(), QueryPhase::Errored);
        assert_eq!(binding.state().error, Some(SockqError::ConnectionLost));
    }

    #[test]
    fn rebind_with_stable_key_does_not_resubscribe() {
        let (transport, client) = setup();
        let mut binding = client.query(list_spec());
        let key = CacheKey::from("list:dashboards");
        assert_eq!(client.cache().subscriber_count(&key), 1);

        binding.rebind(list_spec());
        binding.rebind(list_spec());
        assert_eq!(client.cache().subscriber_count(&key), 1);
        assert_eq!(transport.emits.borrow().len(), 1, "no duplicate request");
    }

    #[test]
    fn rebind_with_new_key_resubscribes_and_requests() {
        let (transport, client) = setup();
        let mut binding = client.query(list_spec());
        push(&client, json!("first"));

        let spec = QuerySpec::new(
            EmitDescriptor::new("dashboards/list", json!({"page": 2})),
            RESPONSE,
            "list:dashboards:p2",
            replace_merge(),
        );
        binding.rebind(spec);
        assert_eq!(binding.phase(), QueryPhase::Requesting);
        assert_eq!(transport.emits.borrow().len(), 2);
        assert_eq!(
            client.cache().subscriber_count(&CacheKey::from("list:dashboards")),
            0
        );
        assert_eq!(
            client.cache().subscriber_count(&CacheKey::from("list:dashboards:p2")),
            1
        );

        push(&client, json!("second"));
        assert_eq!(binding.state().data, Some(json!("second")));
        // The old entry is still there for other consumers.
        assert_eq!(client.cached_value(&CacheKey::from("list:dashboards")), Some(json!("first")));
    }

    #[test]
    fn rebind_can_toggle_enabled() {
        let (transport, client) = setup();
        let mut binding = client.query(list_spec().enabled(false));
        assert_eq!(transport.emits.borrow().len(), 0);

        binding.rebind(list_spec());
        assert_eq!(binding.phase(), QueryPhase::Requesting);
        assert_eq!(transport.emits.borrow().len(), 1);
    }

    #[test]
    fn on_change_fires_with_merged_state() {
        let (_transport, client) = setup();
        let binding = client.query(list_spec());
        let seen: Rc<RefCell<Vec<Option<Value>>>> = Rc::default();
        let s = Rc::clone(&seen);
        binding.on_change(move |state| s.borrow_mut().push(state.data.clone()));

        push(&client, json!(1));
        assert_eq!(*seen.borrow(), vec![Some(json!(1))]);
    }

    #[test]
    fn drop_releases_request_share() {
        let (_transport, client) = setup();
        let binding = client.query(list_spec());
        assert_eq!(client.correlator().pending_count(), 1);
        drop(binding);
        assert_eq!(client.correlator().pending_count(), 0);
        assert_eq!(
            client.registry().listener_count(&RouteDescriptor::from(RESPONSE)),
            0
        );
    }

    #[test]
    fn listen_binding_merges_every_push() {
        let (transport, client) = setup();
        let spec = ListenSpec::new("chats/stream:message", "chat:42", |old, new| {
            let mut list = old.and_then(|v| v.as_array().cloned()).unwrap_or_default();
            list.push(new.clone());
            Ok(Value::Array(list))
        });
        let mut binding = client.listen(spec);
        assert_eq!(transport.emits.borrow().len(), 0, "listen-only: no emit");

        let route = RouteDescriptor::from("chats/stream:message");
        client.ingest(&route, &json!("hello"));
        client.ingest(&route, &json!("world"));
        let state = binding.state();
        assert_eq!(state.data, Some(json!(["hello", "world"])));
        assert!(!state.is_loading);

        binding.set_enabled(false);
        client.ingest(&route, &json!("ignored"));
        assert_eq!(binding.state().data, Some(json!(["hello", "world"])));
        assert_eq!(client.cached_value(&CacheKey::from("chat:42")), Some(json!(["hello", "world"])));

        binding.set_enabled(true);
        client.ingest(&route, &json!("back"));
        assert_eq!(
            binding.state().data,
            Some(json!(["hello", "world", "back"]))
        );
    }

    #[test]
    fn listen_binding_records_merge_error() {
        let (_transport, client) = setup();
        let spec = ListenSpec::new("chats/stream:message", "chat:err", |_, _| {
            Err(String::from("nope"))
        });
        let binding = client.listen(spec);
        client.ingest(&RouteDescriptor::from("chats/stream:message"), &json!(1));
        assert_eq!(
            binding.state().error,
            Some(SockqError::MergeFunctionThrew("nope".into()))
        );
        assert!(binding.state().data.is_none());
    }

    #[test]
    fn client_reset_clears_all_components() {
        let (_transport, client) = setup();
        let _binding = client.query(list_spec());
        client.reset();
        assert_eq!(client.correlator().pending_count(), 0);
        assert!(client.cache().is_empty());
    }
}
