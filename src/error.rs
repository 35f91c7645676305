//! The error taxonomy.

use std::sync::Arc;

/// Errors observable at the public API boundary.
///
/// Compute errors do not poison a node's cached value: the last
/// successful value remains readable once a new input arrives, and the
/// stored error is only re-raised while no upstream version has changed
/// since it was recorded.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GraphError {
    /// An operation was attempted that requires state the node does not
    /// have: binding an unbound writable proxy, etc. Surfaced synchronously
    /// to the caller; never stored or delivered to observers.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Returned by `bind_to` and by the static `would_create_cycle` query
    /// when completing a bind would introduce a cycle in the "binds to"
    /// relation among bindable proxies.
    #[error("bind would create a cycle")]
    CycleDetected,

    /// A user-supplied compute, combine, accumulator, key-selector, or
    /// forward/reverse transform raised an error. Stored on the node,
    /// delivered to observers as a failure, and re-raised on subsequent
    /// synchronous reads until an upstream version changes.
    #[error("compute failed: {0}")]
    ComputeFailure(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// A failure observed from an upstream node's notification stream,
    /// propagated to this node's observers without altering this node's own
    /// cached value.
    #[error("upstream failed: {0}")]
    UpstreamFailure(#[source] Arc<GraphError>),
}

impl GraphError {
    /// Wraps an arbitrary user error as a [`GraphError::ComputeFailure`].
    pub fn compute<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        GraphError::ComputeFailure(Arc::new(err))
    }

    /// Wraps an upstream failure for propagation to this node's observers.
    pub fn upstream(err: GraphError) -> Self {
        GraphError::UpstreamFailure(Arc::new(err))
    }
}

/// The observer-facing payload: a tagged union of success or failure.
pub type GraphResult<T> = Result<T, GraphError>;
