//! Deferred notification work.
//!
//! Every computed node and every bindable proxy owns one reusable
//! [`EffectHandle`]: the unit of work that delivers its latest
//! value/error to its own observer registry. Pushing invalidations
//! can mark the same node's effect pending many times within one
//! batch; the pending bit collapses that down to a single queued run, the
//! same one-shot-guard shape a `Option<Revision>` access-stamp cell gives
//! for free in a revision-tracked query cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) struct EffectHandle {
    pending: AtomicBool,
    action: Box<dyn Fn() + Send + Sync>,
}

impl EffectHandle {
    pub fn new(action: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(EffectHandle {
            pending: AtomicBool::new(false),
            action: Box::new(action),
        })
    }

    /// Marks this effect as needing to run. Returns `true` the first time
    /// this is called since the effect last ran (i.e. when the caller is
    /// responsible for enqueuing it), `false` if it is already pending.
    pub fn mark_pending(&self) -> bool {
        self.pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Runs the effect. Clears the pending bit first, so a `mark_pending`
    /// racing with this call correctly re-enqueues the effect rather than
    /// being silently absorbed by a run that already read the old state.
    pub fn run(&self) {
        self.pending.store(false, Ordering::Release);
        (self.action)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn second_mark_before_run_is_collapsed() {
        let handle = EffectHandle::new(|| {});
        assert!(handle.mark_pending());
        assert!(!handle.mark_pending(), "already pending, caller must not enqueue twice");
        handle.run();
        assert!(handle.mark_pending(), "pending flag must reset after run");
    }

    #[test]
    fn run_invokes_the_action() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = Arc::clone(&runs);
        let handle = EffectHandle::new(move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });
        handle.mark_pending();
        handle.run();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
