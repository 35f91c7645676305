//! Internal capability traits that let the graph machinery work
//! polymorphically over node kinds.
//!
//! Items here are public for implementation reasons only — operator
//! constructors outside this crate need them to wire a new computed node to
//! its upstreams — and are exempt from semver guarantees, the conventional
//! role of a crate's own `plumbing` module.
//!
//! This capability-interface design replaces a closed `NodeKind` enum:
//! rather than matching on `Source | Computed | Bindable | Adapter`, the
//! push/pull machinery is written against [`Target`] and [`Upstream`]
//! alone, and every node kind implements whichever of the two apply to it.

use crate::node::NodeId;
use crate::revision::Version;
use std::sync::{Arc, Weak};

/// Implemented by any node that can receive invalidation pushes from an
/// upstream: computed nodes (always) and bindable proxies (so that binding
/// to a computed or another bindable propagates invalidation through the
/// proxy).
pub trait Target: Send + Sync {
    /// Identity of the node implementing this target, used to remove a
    /// specific target from an upstream's target set.
    fn target_id(&self) -> NodeId;

    /// Upstream transitioned to DIRTY (a direct value change).
    fn mark_dirty(&self);

    /// Upstream (transitively) invalidated without (yet) a known value
    /// change.
    fn mark_maybe_dirty(&self);
}

/// Implemented by any node that can serve as another node's upstream:
/// sources, computed nodes, bindable proxies, and adapters.
pub trait Upstream: Send + Sync {
    /// Identity of the node implementing this upstream.
    fn upstream_id(&self) -> NodeId;

    /// Current local version, used by downstream nodes to populate and
    /// check `last_seen_version`. A plain accessor: for nodes with
    /// no lazy staleness of their own (sources, adapters) this is always
    /// up to date; for computed nodes it reflects whatever was last
    /// resolved and may be stale until [`validate`](Self::validate) is
    /// called.
    fn version(&self) -> Version;

    /// Forces this node to resolve its own pending staleness (if any) and
    /// returns its version afterward. Computed nodes override this to run
    /// their own pull-phase resolution before answering; the default
    /// implementation is appropriate for nodes that are never lazily
    /// stale.
    fn validate(&self) -> Version {
        self.version()
    }

    /// Registers `target` to receive future invalidation pushes. Called
    /// exactly when demand arrives ("lazy registration").
    fn add_target(&self, target: Weak<dyn Target>);

    /// Deregisters the target with the given identity, a no-op if it is not
    /// currently registered (idempotent unsubscribe semantics apply here
    /// too, since deregistration races are handled at the call site).
    fn remove_target(&self, id: NodeId);
}

/// Implemented by bindable proxies so the cycle-detection walk can
/// follow the "binds to" relation without caring what value type is
/// involved.
///
/// Only bindable proxies implement this; other node kinds are terminal
/// leaves for the purpose of the walk.
pub trait Bindable: Send + Sync {
    /// Identity of the bindable proxy.
    fn bindable_id(&self) -> NodeId;

    /// The bindable proxy this one currently points at, if any and if that
    /// upstream is itself bindable.
    fn current_bindable_upstream(&self) -> Option<Arc<dyn Bindable>>;
}

/// Walks the transitive "binds to" chain starting at `candidate`, looking
/// for `origin`. Returns `true` if `origin` is found, i.e. binding `origin`
/// to `candidate` would introduce a cycle.
///
/// Runs in O(chain length) and only follows bindable proxies, per the
/// contract on [`Bindable`].
pub fn would_create_cycle(origin: NodeId, candidate: &dyn Bindable) -> bool {
    let mut current = candidate.bindable_id();
    let mut next = candidate.current_bindable_upstream();
    loop {
        if current == origin {
            return true;
        }
        match next {
            Some(node) => {
                current = node.bindable_id();
                next = node.current_bindable_upstream();
            }
            None => return false,
        }
    }
}
