//! `Debug`-friendly helpers for node identities, keeping the same
//! `debug`/`plumbing` split used elsewhere in this crate: internal wiring
//! that's useful for diagnostics but isn't part of the stable API surface
//! graph consumers build against.

use crate::node::{NodeId, ReadableNode};
use std::fmt;

/// A point-in-time snapshot of a node's externally visible state, for
/// logging and manual inspection. Never parsed; not part of any wire
/// format.
pub struct NodeSnapshot<T> {
    pub id: NodeId,
    pub value: Option<T>,
    pub closed: bool,
}

impl<T: fmt::Debug> fmt::Debug for NodeSnapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSnapshot")
            .field("id", &self.id)
            .field("value", &self.value)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Captures `node`'s current id/value/closed state. A failed `read` (a
/// stored compute failure, or an unbound bindable proxy) renders as
/// `value: None` rather than propagating the error to the caller — this
/// is a diagnostic snapshot, not a read.
pub fn snapshot<N, T>(node: &N) -> NodeSnapshot<T>
where
    N: ReadableNode<T>,
{
    NodeSnapshot { id: node.id(), value: node.read().ok(), closed: node.is_closed() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Source;

    #[test]
    fn snapshot_reports_value_and_closed_state() {
        let s = Source::new(42);
        let snap = snapshot(&s);
        assert_eq!(snap.value, Some(42));
        assert!(!snap.closed);
        assert_eq!(format!("{:?}", snap.id), format!("{:?}", s.id()));

        s.close();
        let snap = snapshot(&s);
        assert!(snap.closed);
    }
}
