#![forbid(unsafe_code)]

//! Request correlation and reactive query cache for push-style socket
//! transports.
//!
//! A push transport delivers responses as routed messages, not as return
//! values. This crate turns "emit a request, then wait for a push on route
//! R" back into an ordinary request/response call, deduplicates identical
//! in-flight requests into a single wire emission, merges pushed payloads
//! into a versioned cache through caller-supplied reducers, and manages
//! subscription lifecycle as consumers come and go.
//!
//! # Components
//!
//! - [`RouteRegistry`]: maps a route to its interested listeners; multicast
//!   dispatch of incoming pushes.
//! - [`RequestCorrelator`]: emit-then-wait with dedup and exactly-once
//!   fan-out to every joined waiter.
//! - [`ReactiveCache`]: keyed store of merged results with versioning,
//!   structural-equality notification dedup, and a re-entrancy queue.
//! - [`QueryClient`] / [`QueryBinding`] / [`ListenBinding`]: the consumer
//!   surface wiring correlator output into cache updates.
//!
//! Control flow: binding → correlator → registry/transport (emit + listen)
//! → incoming push → registry dispatch → correlator fan-out → cache
//! `update()` → binding state refresh.
//!
//! # Concurrency model
//!
//! Everything runs on one logical event-loop thread; shared state is
//! `Rc<RefCell<...>>` and there are no locks. The ordering rules are still
//! strict: one wire emission per dedup window, settlement delivered to all
//! waiters in a single synchronous pass, per-key cache updates serialized
//! through the re-entrancy queue, and synchronous idempotent cancellation.
//!
//! # Example
//!
//! ```ignore
//! use std::rc::Rc;
//! use serde_json::json;
//! use sockq::{EmitDescriptor, QueryClient, QuerySpec, RouteDescriptor};
//!
//! let client = QueryClient::new(Rc::new(my_transport));
//! let binding = client.query(QuerySpec::new(
//!     EmitDescriptor::new("dashboards/list", json!({"page": 1})),
//!     "dashboards/list:getList",
//!     "list:dashboards",
//!     |_old, new| Ok(new.clone()),
//! ));
//!
//! // Transport glue, on every decoded incoming frame:
//! client.ingest(&RouteDescriptor::from("dashboards/list:getList"), &payload);
//!
//! let state = binding.state();
//! assert!(state.is_fetched);
//! ```

pub mod binding;
pub mod cache;
pub mod correlator;
pub mod error;
pub mod policy;
pub mod registry;
pub mod route;
pub mod transport;

pub use binding::{
    ListenBinding, ListenSpec, MergeFn, QueryBinding, QueryClient, QueryPhase, QuerySpec,
    QueryState,
};
pub use cache::{CacheEntry, CacheSubscription, ReactiveCache, UpdateOutcome};
pub use correlator::{Handle, RequestCorrelator, SettleResult};
pub use error::SockqError;
pub use policy::{CachePolicy, EvictionPolicy};
pub use registry::{ListenerGuard, RouteRegistry};
pub use route::{CacheKey, DedupKey, EmitDescriptor, RouteDescriptor};
pub use transport::{Transport, TransportError};
