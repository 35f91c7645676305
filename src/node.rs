//! Node identity and the public capability traits shared by every node kind.

use crate::error::GraphResult;
use crate::observer::{Observer, Unsubscribe};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// A stable identity for a node in the graph.
///
/// Nodes never relocate, so comparing identities is equivalent to comparing
/// the nodes themselves; this is what cycle detection and referential
/// comparisons rely on. Identities are assigned from a single process-wide
/// atomic counter, the same shape as a runtime-id allocator handing out
/// sequential ids from shared state.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub(crate) fn fresh() -> Self {
        NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Capability shared by every node kind: read the current value, subscribe
/// for change notifications, and close.
pub trait ReadableNode<T> {
    /// This node's stable identity.
    fn id(&self) -> NodeId;

    /// Returns the current value, pulling/validating as needed (pull
    /// phase for computed nodes; a plain atomic load for sources).
    fn read(&self) -> GraphResult<T>;

    /// Registers `observer` for future value/error notifications.
    ///
    /// The current value (or stored error) is delivered synchronously,
    /// exactly once, before this call returns; if that synchronous
    /// delivery panics, the panic propagates to the caller, since no graph
    /// state has changed yet. A closed node performs no delivery and returns
    /// a no-op unsubscribe handle.
    fn subscribe(&self, observer: Observer<T>) -> Unsubscribe;

    /// Idempotent terminal transition. After `close`, reads
    /// return the last cached value, writes (if any) are no-ops, and
    /// `subscribe` yields an immediate no-op unsubscribe.
    fn close(&self);

    /// Whether [`close`](Self::close) has been called.
    fn is_closed(&self) -> bool;
}

/// Capability for nodes that additionally accept writes: sources and the
/// mutable variant of bindable proxies and bidirectional adapters.
pub trait WritableNode<T>: ReadableNode<T> {
    /// Replaces the current value, skipping all notification if the new
    /// value equals the old one by `PartialEq`.
    fn write(&self, value: T);

    /// Atomically replaces the current value by applying `f` to it,
    /// retrying under concurrent writers.
    fn update(&self, f: impl FnMut(&T) -> T);
}
