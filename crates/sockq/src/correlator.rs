#![forbid(unsafe_code)]

//! Request correlator: turns "emit a request, then wait for a push on a
//! route" into a handle that settles exactly once, deduplicating concurrent
//! identical requests into a single wire emission.
//!
//! # Invariants
//!
//! 1. For a given dedup key, the wire emission happens at most once per
//!    pending window. Callers that arrive while the window is open join the
//!    existing waiter list; no second emit.
//! 2. Settlement is exactly-once fan-out: every joined waiter observes the
//!    same outcome, delivered in one synchronous pass. A cancelled waiter
//!    observes nothing.
//! 3. The pending entry is removed before waiter callbacks run, so a
//!    callback that immediately re-requests the same key opens a fresh
//!    window (fresh emission).
//! 4. No timeout is enforced here. A request with no response stays pending
//!    until the push arrives, every waiter cancels, or the transport
//!    reports a disconnect. Callers wanting an SLA cancel from their own
//!    timer.
//!
//! # Failure modes
//!
//! - Emit fails synchronously: the caller gets
//!   [`SockqError::TransportEmitFailed`]; no listener is registered and no
//!   pending entry is left behind.
//! - Disconnect while pending: every waiter of every pending request is
//!   rejected with [`SockqError::ConnectionLost`] and the pending map is
//!   cleared, so a later call starts fresh.
//! - Equal key, different fingerprint:
//!   [`SockqError::DuplicateRouteConflict`] — a defect in key derivation,
//!   reported loudly rather than silently merging unrelated requests.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::SockqError;
use crate::registry::{ListenerGuard, RouteRegistry};
use crate::route::{DedupKey, EmitDescriptor, RouteDescriptor, correlation_identity};
use crate::transport::Transport;

/// Outcome delivered to each waiter.
pub type SettleResult = Result<Value, SockqError>;

type SettleCallback = Box<dyn FnOnce(&SettleResult)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WaiterId(u64);

#[derive(Default)]
struct HandleState {
    result: Option<SettleResult>,
    callbacks: Vec<SettleCallback>,
}

struct Waiter {
    id: WaiterId,
    state: Rc<RefCell<HandleState>>,
}

struct PendingRequest {
    fingerprint: String,
    waiters: Vec<Waiter>,
    refcount: usize,
    // Dropping the guard unregisters the one-shot route listener.
    listener: Option<ListenerGuard>,
}

#[derive(Default)]
struct CorrelatorInner {
    pending: AHashMap<DedupKey, PendingRequest>,
    next_waiter: u64,
}

struct CorrelatorShared {
    registry: RouteRegistry,
    transport: Rc<dyn Transport>,
    inner: RefCell<CorrelatorInner>,
}

impl CorrelatorShared {
    /// Resolve or reject every waiter of `key` in one synchronous pass and
    /// discard the pending entry. No-op when the key is not pending.
    fn settle(&self, key: DedupKey, outcome: SettleResult) {
        let Some(pending) = self.inner.borrow_mut().pending.remove(&key) else {
            return;
        };
        // Unregister before fan-out so a waiter callback re-requesting the
        // same route starts with a clean listener set.
        drop(pending.listener);
        debug!(
            key = key.value(),
            waiters = pending.waiters.len(),
            ok = outcome.is_ok(),
            "settling request"
        );
        for waiter in pending.waiters {
            let callbacks = {
                let mut state = waiter.state.borrow_mut();
                state.result = Some(outcome.clone());
                std::mem::take(&mut state.callbacks)
            };
            for cb in callbacks {
                cb(&outcome);
            }
        }
    }
}

/// Deduplicating request/response correlator over a push transport.
///
/// Cloning yields another handle to the same pending map.
#[derive(Clone)]
pub struct RequestCorrelator {
    shared: Rc<CorrelatorShared>,
}

impl RequestCorrelator {
    /// Create a correlator that emits on `transport` and listens for
    /// responses through `registry`.
    #[must_use]
    pub fn new(registry: RouteRegistry, transport: Rc<dyn Transport>) -> Self {
        Self {
            shared: Rc::new(CorrelatorShared {
                registry,
                transport,
                inner: RefCell::new(CorrelatorInner::default()),
            }),
        }
    }

    /// Emit `emit` and wait for one push on `response_route`.
    ///
    /// If an equivalent request is already pending, no wire emission happens;
    /// the returned handle joins the existing waiter list and settles
    /// together with it.
    ///
    /// # Errors
    ///
    /// - [`SockqError::TransportEmitFailed`] when the transport rejects the
    ///   emission.
    /// - [`SockqError::DuplicateRouteConflict`] when an unrelated pending
    ///   request collides on the dedup key.
    pub fn request(
        &self,
        emit: &EmitDescriptor,
        response_route: impl Into<RouteDescriptor>,
    ) -> Result<Handle, SockqError> {
        let response_route = response_route.into();
        let (key, fingerprint) = correlation_identity(emit, &response_route);
        self.request_with_identity(key, fingerprint, emit, response_route)
    }

    fn request_with_identity(
        &self,
        key: DedupKey,
        fingerprint: String,
        emit: &EmitDescriptor,
        response_route: RouteDescriptor,
    ) -> Result<Handle, SockqError> {
        {
            let mut inner = self.shared.inner.borrow_mut();
            if let Some(pending) = inner.pending.get(&key) {
                if pending.fingerprint != fingerprint {
                    warn!(
                        key = key.value(),
                        route = %response_route,
                        "dedup key collision between unrelated requests"
                    );
                    return Err(SockqError::DuplicateRouteConflict {
                        route: response_route,
                        dedup_key: key.value(),
                    });
                }
                inner.next_waiter += 1;
                let id = WaiterId(inner.next_waiter);
                let state: Rc<RefCell<HandleState>> = Rc::default();
                let pending = inner
                    .pending
                    .get_mut(&key)
                    .expect("pending entry checked above");
                pending.waiters.push(Waiter {
                    id,
                    state: Rc::clone(&state),
                });
                pending.refcount += 1;
                trace!(
                    key = key.value(),
                    refcount = pending.refcount,
                    "joined pending request"
                );
                return Ok(self.handle(key, id, state));
            }
        }

        // Fresh window: emit first; a listener is only registered once the
        // request actually left this layer.
        self.shared
            .transport
            .emit(emit)
            .map_err(|e| SockqError::TransportEmitFailed(e.to_string()))?;

        let weak = Rc::downgrade(&self.shared);
        let listener = self.shared.registry.register(response_route.clone(), move |payload| {
            if let Some(shared) = weak.upgrade() {
                shared.settle(key, Ok(payload.clone()));
            }
        });

        let mut inner = self.shared.inner.borrow_mut();
        inner.next_waiter += 1;
        let id = WaiterId(inner.next_waiter);
        let state: Rc<RefCell<HandleState>> = Rc::default();
        inner.pending.insert(
            key,
            PendingRequest {
                fingerprint,
                waiters: vec![Waiter {
                    id,
                    state: Rc::clone(&state),
                }],
                refcount: 1,
                listener: Some(listener),
            },
        );
        drop(inner);
        debug!(key = key.value(), route = %response_route, "request emitted");
        Ok(self.handle(key, id, state))
    }

    /// Reject every pending request with [`SockqError::ConnectionLost`] and
    /// clear the pending map. Subsequent calls start fresh; there is no
    /// automatic retry.
    pub fn connection_lost(&self) {
        let keys: Vec<DedupKey> = self.shared.inner.borrow().pending.keys().copied().collect();
        if !keys.is_empty() {
            debug!(pending = keys.len(), "connection lost; rejecting waiters");
        }
        for key in keys {
            self.shared.settle(key, Err(SockqError::ConnectionLost));
        }
    }

    /// Number of open pending windows.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.inner.borrow().pending.len()
    }

    /// Discard every pending request without settling any waiter. Their
    /// route listeners are unregistered.
    pub fn reset(&self) {
        self.shared.inner.borrow_mut().pending.clear();
    }

    fn handle(&self, key: DedupKey, waiter: WaiterId, state: Rc<RefCell<HandleState>>) -> Handle {
        Handle {
            state,
            shared: Rc::downgrade(&self.shared),
            key,
            waiter,
            cancelled: Cell::new(false),
        }
    }
}

impl std::fmt::Debug for RequestCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCorrelator")
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// One waiter's view of a pending (or settled) request.
///
/// A handle settles at most once; [`cancel`](Self::cancel) withdraws the
/// waiter without settling it. Dropping a handle does *not* cancel — the
/// registered settle callbacks keep working, which is what fire-and-forget
/// callers rely on.
pub struct Handle {
    state: Rc<RefCell<HandleState>>,
    shared: Weak<CorrelatorShared>,
    key: DedupKey,
    waiter: WaiterId,
    cancelled: Cell<bool>,
}

impl Handle {
    /// Run `callback` when the request settles. Fires immediately when the
    /// outcome is already known. A cancelled handle never fires.
    pub fn on_settle(&self, callback: impl FnOnce(&SettleResult) + 'static) {
        let settled = self.state.borrow().result.clone();
        match settled {
            Some(outcome) => callback(&outcome),
            None => self.state.borrow_mut().callbacks.push(Box::new(callback)),
        }
    }

    /// The outcome, once settled.
    #[must_use]
    pub fn result(&self) -> Option<SettleResult> {
        self.state.borrow().result.clone()
    }

    /// Whether the request has settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.state.borrow().result.is_some()
    }

    /// Withdraw this waiter from the pending request.
    ///
    /// Decrements the shared refcount; at zero the route listener is
    /// unregistered and the pending entry discarded without settling anyone.
    /// The wire request is not retracted — it already left. Idempotent,
    /// never fails, a no-op after settlement.
    pub fn cancel(&self) {
        if self.cancelled.replace(true) {
            return;
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let discarded = {
            let mut inner = shared.inner.borrow_mut();
            let Some(pending) = inner.pending.get_mut(&self.key) else {
                return; // already settled
            };
            let before = pending.waiters.len();
            pending.waiters.retain(|w| w.id != self.waiter);
            if pending.waiters.len() == before {
                return;
            }
            pending.refcount -= 1;
            trace!(
                key = self.key.value(),
                refcount = pending.refcount,
                "waiter cancelled"
            );
            if pending.refcount == 0 {
                inner.pending.remove(&self.key)
            } else {
                None
            }
        };
        if discarded.is_some() {
            debug!(key = self.key.value(), "last waiter gone; pending discarded");
        }
        // `discarded` drops here, unregistering the route listener outside
        // the correlator borrow.
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("key", &self.key.value())
            .field("settled", &self.is_settled())
            .field("cancelled", &self.cancelled.get())
            .finish()
    }
}
