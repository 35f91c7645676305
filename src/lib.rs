//! Wavefront: a glitch-free, lock-free reactive signal graph.
//!
//! A dependency graph of value-holding nodes ("signals") kept consistent
//! under push-pull invalidation: a write pushes invalidation eagerly
//! through the graph, but recomputation is pulled lazily, on next read or
//! next observer delivery, so a node with no observer and no downstream
//! target never recomputes at all ("demand-driven registration").
//!
//! Four node kinds cover the data model:
//!
//! - [`Source`] — a mutable root.
//! - [`Computed`] — a derived, cached node recomputed from its upstreams.
//! - [`Bindable`] — a proxy whose upstream can be swapped at runtime,
//!   cycle-checked on every rebind.
//! - [`Adapter`] — a bridge to a hot external value source, with optional
//!   bidirectional echo suppression.
//!
//! [`operators`] builds the common derived-signal shapes (`map`, `filter`,
//! `scan`, …) on top of [`Computed`] and [`Bindable`].
//!
//! Multiple writes can be coalesced into a single round of observer
//! notification with [`batch`], which is also what every internal mutation
//! path uses to guarantee glitch-freedom: an observer of a diamond-shaped
//! graph never sees a value computed from a half-updated set of inputs.

mod adapter;
mod bindable;
mod computed;
mod effect;
mod error;
mod node;
mod observer;
mod revision;
mod runtime;
mod source;

pub mod debug;
#[doc(hidden)]
pub mod plumbing;
pub mod operators;

pub use adapter::{Adapter, Cancellation, ExternalProducer};
pub use bindable::{BindTarget, Bindable};
pub use computed::Computed;
pub use error::{GraphError, GraphResult};
pub use node::{NodeId, ReadableNode, WritableNode};
pub use observer::{Observer, Unsubscribe};
pub use revision::Version;
pub use runtime::{batch, begin_batch, end_batch};
pub use source::Source;

#[cfg(feature = "adapter-async")]
pub use adapter::StreamProducer;
