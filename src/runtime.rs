//! C1: the graph runtime — batching and the pending-effects queue.
//!
//! A single process-wide [`Runtime`] backs every node, reached through
//! [`Runtime::get`]. An incremental query engine typically splits this
//! into a per-thread handle plus a shared state block behind an `Arc`;
//! this graph has no per-thread handle to speak of (there is no
//! snapshot/fork concept here), so the whole thing collapses to the shared
//! half, published once via [`std::sync::OnceLock`].
//!
//! Pending effects accumulate in a [`crossbeam_queue::SegQueue`], a
//! lock-free MPMC queue, so that invalidation pushes arriving on arbitrary
//! threads never block on each other to enqueue work.

use crate::effect::EffectHandle;
use crate::revision::{AtomicVersion, Version};
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

pub(crate) struct Runtime {
    global_version: AtomicVersion,
    batch_depth: AtomicUsize,
    pending_effects: SegQueue<Arc<EffectHandle>>,
    flushing: AtomicBool,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

impl Runtime {
    pub(crate) fn get() -> &'static Runtime {
        RUNTIME.get_or_init(|| Runtime {
            global_version: AtomicVersion::start(),
            batch_depth: AtomicUsize::new(0),
            pending_effects: SegQueue::new(),
            flushing: AtomicBool::new(false),
        })
    }

    /// The graph-wide advisory version: bumped once per successful
    /// source mutation, regardless of whether it actually changed any
    /// value. Used only by coarse-grained adapters that cannot track
    /// per-node versions.
    pub(crate) fn bump_global_version(&self) -> Version {
        self.global_version.increment()
    }

    pub(crate) fn global_version(&self) -> Version {
        self.global_version.load()
    }

    fn is_batching(&self) -> bool {
        self.batch_depth.load(Ordering::Acquire) > 0
    }

    /// Marks `handle` pending and enqueues it if it was not already. Flushes
    /// immediately unless a batch is currently open (batching defers
    /// effect flushing, not push-phase marking).
    pub(crate) fn schedule_effect(&self, handle: Arc<EffectHandle>) {
        if handle.mark_pending() {
            self.pending_effects.push(handle);
        }
        if !self.is_batching() {
            self.flush();
        }
    }

    fn enter_batch(&self) {
        self.batch_depth.fetch_add(1, Ordering::AcqRel);
    }

    fn exit_batch(&self) {
        if self.batch_depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.flush();
        }
    }

    /// Drains the pending-effects queue, running each handle at most once
    /// per drain. Only one thread flushes at a time; a thread that finds a
    /// flush already in progress simply returns, trusting the in-progress
    /// flush to observe its contribution.
    ///
    /// The flag is cleared *before* checking for emptiness again, and the
    /// loop re-acquires it if more work arrived in that gap — otherwise an
    /// effect scheduled by another thread in the narrow window between "last
    /// pop" and "flag cleared" would be silently stranded until some
    /// unrelated future flush happened to notice it.
    fn flush(&self) {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        loop {
            while let Some(handle) = self.pending_effects.pop() {
                handle.run();
            }
            self.flushing.store(false, Ordering::Release);
            if self.pending_effects.is_empty() {
                return;
            }
            if self
                .flushing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
        }
    }
}

/// An RAII handle for an open batch. Effect flushing is deferred
/// until the outermost guard drops; nesting is supported by a depth
/// counter rather than a nested-transaction scheme, the same
/// recursion-tolerant shape as a revision-bumping scoped helper.
#[must_use = "a batch only defers flushing while this guard is alive"]
pub struct BatchGuard {
    _private: (),
}

impl BatchGuard {
    fn enter() -> Self {
        Runtime::get().enter_batch();
        BatchGuard { _private: () }
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        Runtime::get().exit_batch();
    }
}

/// Opens a batch for the duration of `f`, deferring all effect flushing
/// (and therefore all observer notification) until `f` returns, so that
/// observers see at most one notification per batch regardless of how many
/// writes occur inside it (glitch-freedom).
///
/// Batches nest: effects flush only when the outermost call returns.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    let _guard = BatchGuard::enter();
    f()
}

/// Opens a batch without an RAII guard, for callers (chiefly adapters
/// driving an external callback shape that can't hand `batch` a closure)
/// that need to straddle a batch across non-lexical control flow. Must be
/// paired with a later [`end_batch`]; an unmatched `begin_batch` leaves
/// effect flushing deferred forever.
pub fn begin_batch() {
    Runtime::get().enter_batch();
}

/// Closes a batch opened with [`begin_batch`], flushing pending effects if
/// this was the outermost open batch.
pub fn end_batch() {
    Runtime::get().exit_batch();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn effect_runs_immediately_outside_a_batch() {
        let runtime = Runtime::get();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = Arc::clone(&runs);
        let handle = EffectHandle::new(move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });
        runtime.schedule_effect(handle);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn effect_is_deferred_until_batch_exit() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = Arc::clone(&runs);
        let handle = EffectHandle::new(move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });
        batch(|| {
            Runtime::get().schedule_effect(Arc::clone(&handle));
            assert_eq!(runs.load(Ordering::SeqCst), 0, "must not run inside the batch");
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeated_scheduling_within_a_batch_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = Arc::clone(&runs);
        let handle = EffectHandle::new(move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });
        batch(|| {
            for _ in 0..5 {
                Runtime::get().schedule_effect(Arc::clone(&handle));
            }
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_batches_flush_only_at_outermost_exit() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = Arc::clone(&runs);
        let handle = EffectHandle::new(move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });
        batch(|| {
            batch(|| {
                Runtime::get().schedule_effect(Arc::clone(&handle));
            });
            assert_eq!(runs.load(Ordering::SeqCst), 0, "inner exit must not flush");
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
