#![forbid(unsafe_code)]

//! Route registry: maps a route to its currently-interested listeners and
//! multicasts incoming pushes to all of them.
//!
//! # Invariants
//!
//! 1. `dispatch` invokes every listener registered for the route, in
//!    registration order, synchronously, before returning. Multicast, not
//!    first-match.
//! 2. Listeners added or removed while a dispatch is in progress take effect
//!    on the next dispatch (each dispatch works on a snapshot).
//! 3. Unregistration is idempotent: dropping a guard or calling
//!    `unregister()` twice is a no-op, never an error.
//! 4. The registry holds no business data, only the listener set.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use serde_json::Value;
use tracing::trace;

use crate::route::RouteDescriptor;

/// Callback invoked with each pushed payload for a route.
pub type RouteCallback = Rc<dyn Fn(&Value)>;

/// Identifier for a single registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ListenerEntry {
    id: ListenerId,
    callback: RouteCallback,
}

#[derive(Default)]
struct RegistryInner {
    routes: AHashMap<RouteDescriptor, Vec<ListenerEntry>>,
    next_id: u64,
}

impl RegistryInner {
    fn remove(&mut self, route: &RouteDescriptor, id: ListenerId) -> bool {
        let Some(entries) = self.routes.get_mut(route) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.routes.remove(route);
        }
        removed
    }
}

/// Process-wide listener set, constructible per test.
///
/// Cloning yields another handle to the same registry (shared `Rc` state).
#[derive(Clone, Default)]
pub struct RouteRegistry {
    inner: Rc<RefCell<RegistryInner>>,
}

impl RouteRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for pushes on `route`.
    ///
    /// The returned guard unregisters on drop; `unregister()` may also be
    /// called explicitly and is idempotent.
    pub fn register(
        &self,
        route: impl Into<RouteDescriptor>,
        callback: impl Fn(&Value) + 'static,
    ) -> ListenerGuard {
        let route = route.into();
        let mut inner = self.inner.borrow_mut();
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner.routes.entry(route.clone()).or_default().push(ListenerEntry {
            id,
            callback: Rc::new(callback),
        });
        trace!(route = %route, id = id.0, "listener registered");
        ListenerGuard {
            registry: Rc::downgrade(&self.inner),
            route,
            id,
            active: Cell::new(true),
        }
    }

    /// Deliver `payload` to every listener of `route`. Returns the number of
    /// listeners invoked.
    pub fn dispatch(&self, route: &RouteDescriptor, payload: &Value) -> usize {
        // Snapshot under the borrow, invoke outside it, so callbacks may
        // freely register/unregister.
        let callbacks: Vec<RouteCallback> = {
            let inner = self.inner.borrow();
            inner
                .routes
                .get(route)
                .map(|entries| entries.iter().map(|e| Rc::clone(&e.callback)).collect())
                .unwrap_or_default()
        };
        trace!(route = %route, listeners = callbacks.len(), "dispatching push");
        for cb in &callbacks {
            cb(payload);
        }
        callbacks.len()
    }

    /// Number of listeners currently registered for `route`.
    #[must_use]
    pub fn listener_count(&self, route: &RouteDescriptor) -> usize {
        self.inner
            .borrow()
            .routes
            .get(route)
            .map_or(0, Vec::len)
    }

    /// Remove every listener. Outstanding guards become inert.
    pub fn reset(&self) {
        self.inner.borrow_mut().routes.clear();
    }
}

impl std::fmt::Debug for RouteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("RouteRegistry")
            .field("routes", &inner.routes.len())
            .finish()
    }
}

/// RAII guard for a registered listener.
///
/// Unregisters on drop. `unregister()` is explicit and idempotent; after the
/// registry itself is dropped or reset the guard is inert.
pub struct ListenerGuard {
    registry: Weak<RefCell<RegistryInner>>,
    route: RouteDescriptor,
    id: ListenerId,
    active: Cell<bool>,
}

impl ListenerGuard {
    /// Remove the listener now. Calling this twice is a no-op.
    pub fn unregister(&self) {
        if !self.active.replace(false) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            let removed = registry.borrow_mut().remove(&self.route, self.id);
            if removed {
                trace!(route = %self.route, id = self.id.0, "listener unregistered");
            }
        }
    }

    /// The route this guard listens on.
    #[must_use]
    pub fn route(&self) -> &RouteDescriptor {
        &self.route
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl std::fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("route", &self.route)
            .field("active", &self.active.get())
            .finish()
    }
}
