//! C3: computed (derived) nodes — the direct structural analogue of an
//! incremental query engine's `derived::slot::Slot`/`QueryState`/`Memo`/
//! `MemoRevisions` machinery, re-targeted from "blocking memoization keyed
//! by `Q::Key`" to "eager-identity node with a fixed upstream list" (see
//! DESIGN.md).

use crate::effect::EffectHandle;
use crate::error::{GraphError, GraphResult};
use crate::node::{NodeId, ReadableNode};
use crate::observer::{Observer, ObserverRegistry, Unsubscribe};
use crate::plumbing::{Target, Upstream};
use crate::revision::{AtomicVersion, Version};
use crate::runtime::Runtime;
use arc_swap::ArcSwap;
use crossbeam_utils::atomic::AtomicCell;
use indexmap::IndexMap;
use rustc_hash::FxHasher;
use smallvec::SmallVec;
use std::hash::BuildHasherDefault;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<FxHasher>>;

/// The flag driving the push/pull state machine. `Computing` is an
/// implementation detail not named in the tri-state description: it
/// is the transient state a recomputation holds the CAS lock in, preventing
/// two threads from running the same compute closure concurrently.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
enum Flag {
    Clean,
    MaybeDirty,
    Dirty,
    Computing,
}

enum Cached<T> {
    /// No successful or failed computation has ever completed.
    Empty,
    Value(T),
    Error(GraphError),
}

impl<T: Clone> Cached<T> {
    fn to_result(&self) -> GraphResult<T> {
        match self {
            Cached::Empty => unreachable!("read observed before first resolution"),
            Cached::Value(v) => Ok(v.clone()),
            Cached::Error(e) => Err(e.clone()),
        }
    }

    fn equals_ok(&self, candidate: &T) -> bool
    where
        T: PartialEq,
    {
        matches!(self, Cached::Value(v) if v == candidate)
    }
}

struct UpstreamSlot {
    upstream: Arc<dyn Upstream>,
    last_seen: AtomicCell<Option<Version>>,
}

struct ComputedInner<T> {
    id: NodeId,
    compute: Box<dyn Fn() -> Result<T, GraphError> + Send + Sync>,
    upstreams: SmallVec<[UpstreamSlot; 4]>,
    flag: AtomicCell<Flag>,
    /// Set by `mark_dirty`/`mark_maybe_dirty` when a push arrives while the
    /// flag reads `Computing`: that push would otherwise be silently
    /// dropped (the CAS guarding entry into `Computing` has already been
    /// won by the in-flight pull), so instead it is recorded here and
    /// consulted when the in-flight pull finishes, sending the node back
    /// to `Dirty` instead of `Clean` so the loop immediately revalidates.
    recheck_pending: AtomicBool,
    cached: ArcSwap<Cached<T>>,
    local_version: AtomicVersion,
    last_notified_version: AtomicVersion,
    registered: AtomicBool,
    targets: ArcSwap<FxIndexMap<NodeId, Weak<dyn Target>>>,
    observers: ObserverRegistry<T>,
    effect: Arc<EffectHandle>,
    closed: AtomicBool,
    /// A handle back to this node's own `Arc`, so that `Upstream::validate`
    /// (which only has `&self`) can still force this node's own pull
    /// resolution before answering a downstream's staleness check.
    self_weak: Weak<ComputedInner<T>>,
}

impl<T> ComputedInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn register_with_all_upstreams(self: &Arc<Self>) {
        let weak: Weak<dyn Target> = Arc::downgrade(self) as Weak<dyn Target>;
        for slot in &self.upstreams {
            slot.upstream.add_target(weak.clone());
        }
    }

    fn deregister_from_all_upstreams(&self) {
        for slot in &self.upstreams {
            slot.upstream.remove_target(self.id);
        }
    }

    fn has_demand(&self) -> bool {
        !self.observers.is_empty() || !self.targets.load().is_empty()
    }

    /// Registers or deregisters with upstreams to match current demand
    /// (lazy registration: registered iff >= 1 observer or >= 1
    /// target). Called whenever the observer set or target set changes size
    /// from/to empty, and on close.
    ///
    /// Handles the two races via post-check undo/redo: a `close()` landing
    /// in the narrow window after a successful register undoes it; a reader
    /// re-adding demand in the window after a successful deregister
    /// re-establishes it.
    fn sync_registration(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            if self.registered.compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                self.deregister_from_all_upstreams();
            }
            return;
        }
        if self.has_demand() {
            if self.registered.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                self.register_with_all_upstreams();
                if self.closed.load(Ordering::Acquire)
                    && self.registered.compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire).is_ok()
                {
                    self.deregister_from_all_upstreams();
                }
            }
        } else if self.registered.compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            self.deregister_from_all_upstreams();
            if self.has_demand()
                && !self.closed.load(Ordering::Acquire)
                && self.registered.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
            {
                self.register_with_all_upstreams();
            }
        }
    }

    fn current_upstream_versions(&self) -> SmallVec<[Version; 4]> {
        self.upstreams.iter().map(|slot| slot.upstream.validate()).collect()
    }

    fn versions_changed(&self, versions: &[Version]) -> bool {
        self.upstreams
            .iter()
            .zip(versions)
            .any(|(slot, version)| slot.last_seen.load() != Some(*version))
    }

    fn stamp_last_seen(&self, versions: &[Version]) {
        for (slot, version) in self.upstreams.iter().zip(versions) {
            slot.last_seen.store(Some(*version));
        }
    }

    fn notify_targets(&self, dirty: bool) {
        let snapshot = self.targets.load();
        for target in snapshot.values() {
            if let Some(target) = target.upgrade() {
                if dirty {
                    target.mark_dirty();
                } else {
                    target.mark_maybe_dirty();
                }
            }
        }
    }

    fn schedule_effect_if_observed(&self) {
        if !self.observers.is_empty() {
            Runtime::get().schedule_effect(Arc::clone(&self.effect));
        }
    }

    /// The pull-phase body. A plain unsubscribed read never receives a
    /// push, so even a `Clean` flag cannot be trusted on its own: every
    /// pull re-validates upstream versions and only skips recompute when
    /// they still match `last_seen_version`, `Clean` included. Always
    /// returns the resulting (possibly freshly computed) value or error.
    fn pull(self: &Arc<Self>) -> GraphResult<T> {
        if self.closed.load(Ordering::Acquire) {
            return self.cached.load().to_result();
        }
        loop {
            let flag = self.flag.load();
            if flag == Flag::Computing {
                std::hint::spin_loop();
                continue;
            }
            if self.flag.compare_exchange(flag, Flag::Computing).is_err() {
                continue;
            }
            let versions = self.current_upstream_versions();
            let should_recompute = matches!(flag, Flag::Dirty) || self.versions_changed(&versions);
            let raced = if should_recompute {
                let outcome = catch_unwind(AssertUnwindSafe(|| (self.compute)()))
                    .unwrap_or_else(|_| Err(GraphError::InvalidState("compute closure panicked")));
                self.stamp_last_seen(&versions);
                self.apply_outcome(outcome)
            } else {
                self.finish_computing()
            };
            if raced {
                continue;
            }
            return self.cached.load().to_result();
        }
    }

    /// Leaves `Computing`: normally for `Clean`, but if a mark arrived
    /// mid-compute it goes back to `Dirty` instead, so the caller's loop
    /// revalidates against the newest upstream versions rather than losing
    /// the invalidation. Returns whether the caller must loop again.
    fn finish_computing(&self) -> bool {
        if self.recheck_pending.swap(false, Ordering::AcqRel) {
            self.flag.store(Flag::Dirty);
            true
        } else {
            self.flag.store(Flag::Clean);
            false
        }
    }

    /// Applies a freshly computed outcome. A plain success or a node-local
    /// failure replaces the cached value and bumps `local_version` on any
    /// observed change, exactly as before. A failure relayed from an
    /// upstream's own notification stream (`GraphError::UpstreamFailure`)
    /// is different: the cached value is left untouched (bootstrapped to
    /// the failure only if nothing has ever been cached) and the failure is
    /// relayed to this node's own observers as a one-shot event, without
    /// bumping `local_version` — per the `UpstreamFailure` contract.
    fn apply_outcome(self: &Arc<Self>, outcome: Result<T, GraphError>) -> bool {
        if let Err(GraphError::UpstreamFailure(inner)) = &outcome {
            let inner = Arc::clone(inner);
            if matches!(&**self.cached.load(), Cached::Empty) {
                self.cached.store(Arc::new(Cached::Error(GraphError::UpstreamFailure(Arc::clone(&inner)))));
            }
            let raced = self.finish_computing();
            self.observers.notify_all(&Err(GraphError::UpstreamFailure(inner)));
            crate::runtime::batch(|| self.notify_targets(false));
            return raced;
        }
        let unchanged = match &outcome {
            Ok(value) => self.cached.load().equals_ok(value),
            Err(_) => false,
        };
        if unchanged {
            let raced = self.finish_computing();
            crate::runtime::batch(|| self.notify_targets(false));
            raced
        } else {
            self.cached.store(Arc::new(match outcome {
                Ok(v) => Cached::Value(v),
                Err(e) => Cached::Error(e),
            }));
            self.local_version.increment();
            let raced = self.finish_computing();
            crate::runtime::batch(|| self.notify_targets(true));
            raced
        }
    }
}

impl<T> Target for ComputedInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn target_id(&self) -> NodeId {
        self.id
    }

    fn mark_dirty(&self) {
        match self.flag.compare_exchange(Flag::Clean, Flag::Dirty) {
            Ok(_) => crate::runtime::batch(|| {
                self.notify_targets(false);
                self.schedule_effect_if_observed();
            }),
            Err(Flag::MaybeDirty) => {
                let _ = self.flag.compare_exchange(Flag::MaybeDirty, Flag::Dirty);
            }
            Err(Flag::Computing) => {
                // A concurrent recompute is already in flight; record the
                // invalidation so it is not lost when that recompute
                // settles, and propagate now rather than waiting for it.
                self.recheck_pending.store(true, Ordering::Release);
                crate::runtime::batch(|| {
                    self.notify_targets(false);
                    self.schedule_effect_if_observed();
                });
            }
            Err(_) => {}
        }
    }

    fn mark_maybe_dirty(&self) {
        match self.flag.compare_exchange(Flag::Clean, Flag::MaybeDirty) {
            Ok(_) => crate::runtime::batch(|| {
                self.notify_targets(false);
                self.schedule_effect_if_observed();
            }),
            Err(Flag::Computing) => {
                self.recheck_pending.store(true, Ordering::Release);
            }
            Err(_) => {}
        }
    }
}

impl<T> Upstream for ComputedInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn upstream_id(&self) -> NodeId {
        self.id
    }

    fn version(&self) -> Version {
        self.local_version.load()
    }

    fn validate(&self) -> Version {
        // Force this node's own staleness to resolve (recursively, through
        // its own upstreams' `validate` calls) before a downstream node
        // trusts our version.
        if let Some(strong) = self.self_weak.upgrade() {
            let _ = strong.pull();
        }
        self.local_version.load()
    }

    fn add_target(&self, target: Weak<dyn Target>) {
        let target_id = match target.upgrade() {
            Some(t) => t.target_id(),
            None => return,
        };
        self.targets.rcu(|current| {
            let mut next = FxIndexMap::clone(current);
            next.insert(target_id, target.clone());
            next
        });
        if let Some(strong) = self.self_weak.upgrade() {
            strong.sync_registration();
        }
    }

    fn remove_target(&self, id: NodeId) {
        self.targets.rcu(|current| {
            if !current.contains_key(&id) {
                return FxIndexMap::clone(current);
            }
            let mut next = FxIndexMap::clone(current);
            next.shift_remove(&id);
            next
        });
        if let Some(strong) = self.self_weak.upgrade() {
            strong.sync_registration();
        }
    }
}

/// A derived, read-only node whose value is a pure function of its
/// upstreams.
pub struct Computed<T> {
    inner: Arc<ComputedInner<T>>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Computed { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Computed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Builds a computed node over `upstreams`, recomputed by `compute`
    /// whenever any of them changes. `compute` takes no arguments; it is
    /// expected to close over typed clones of whichever typed node handles
    /// it reads (see the `operators` module for the usual shape).
    pub fn new(
        upstreams: impl IntoIterator<Item = Arc<dyn Upstream>>,
        compute: impl Fn() -> Result<T, GraphError> + Send + Sync + 'static,
    ) -> Self {
        let id = NodeId::fresh();
        let upstreams: SmallVec<[UpstreamSlot; 4]> = upstreams
            .into_iter()
            .map(|upstream| UpstreamSlot { upstream, last_seen: AtomicCell::new(None) })
            .collect();
        let inner = Arc::new_cyclic(|weak: &Weak<ComputedInner<T>>| {
            let weak = weak.clone();
            ComputedInner {
                id,
                compute: Box::new(compute),
                upstreams,
                flag: AtomicCell::new(Flag::Dirty),
                recheck_pending: AtomicBool::new(false),
                cached: ArcSwap::from_pointee(Cached::Empty),
                local_version: AtomicVersion::start(),
                last_notified_version: AtomicVersion::start(),
                registered: AtomicBool::new(false),
                targets: ArcSwap::from_pointee(FxIndexMap::default()),
                observers: ObserverRegistry::new(),
                effect: EffectHandle::new({
                    let weak = weak.clone();
                    move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.run_effect();
                        }
                    }
                }),
                closed: AtomicBool::new(false),
                self_weak: weak,
            }
        });
        Computed { inner }
    }

    /// Exposes this node as a type-erased upstream for another computed
    /// node or bindable proxy to depend on.
    pub(crate) fn as_upstream(&self) -> Arc<dyn Upstream> {
        Arc::clone(&self.inner) as Arc<dyn Upstream>
    }
}

impl<T> ComputedInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn run_effect(self: Arc<Self>) {
        // `pull` needs an `Arc<Self>` to register itself as a target with
        // its own upstreams, so this takes `self` by value via the `Arc`
        // the effect closure upgraded.
        let result = self.pull();
        let current = self.local_version.load();
        if current != self.last_notified_version.load() {
            self.last_notified_version.store(current);
            self.observers.notify_all(&result);
        }
    }
}

impl<T> ReadableNode<T> for Computed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn id(&self) -> NodeId {
        self.inner.id
    }

    fn read(&self) -> GraphResult<T> {
        if self.inner.closed.load(Ordering::Acquire) {
            return self.inner.cached.load().to_result();
        }
        self.inner.pull()
    }

    fn subscribe(&self, observer: Observer<T>) -> Unsubscribe {
        if self.inner.closed.load(Ordering::Acquire) {
            return Unsubscribe::noop();
        }
        let current = self.read();
        observer(current);
        self.inner.last_notified_version.store(self.inner.local_version.load());
        let id = self.inner.observers.insert(observer);
        self.inner.sync_registration();
        let inner = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.observers.remove(id);
                inner.sync_registration();
            }
        })
    }

    fn close(&self) {
        if self.inner.closed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return;
        }
        self.inner.observers.clear();
        self.inner.targets.store(Arc::new(FxIndexMap::default()));
        self.inner.sync_registration();
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::WritableNode;
    use crate::source::Source;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn recomputes_when_upstream_changes() {
        let source = Source::new(1);
        let upstream = source.as_upstream();
        let source_for_compute = source.clone();
        let doubled = Computed::new(vec![upstream], move || Ok::<_, GraphError>(source_for_compute.read()? * 2));
        assert_eq!(doubled.read().unwrap(), 2);
        source.write(5);
        assert_eq!(doubled.read().unwrap(), 10);
    }

    #[test]
    fn diamond_recomputes_sink_once_per_batch() {
        let source = Source::new(1);
        let left = {
            let s = source.clone();
            Computed::new(vec![source.as_upstream()], move || Ok::<_, GraphError>(s.read()? + 1))
        };
        let right = {
            let s = source.clone();
            Computed::new(vec![source.as_upstream()], move || Ok::<_, GraphError>(s.read()? * 10))
        };
        let sink_calls = Arc::new(AtomicUsize::new(0));
        let sink = {
            let l = left.clone();
            let r = right.clone();
            let calls = Arc::clone(&sink_calls);
            Computed::new(
                vec![left.as_upstream(), right.as_upstream()],
                move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, GraphError>(l.read()? + r.read()?)
                },
            )
        };
        assert_eq!(sink.read().unwrap(), 2 + 10);
        let before = sink_calls.load(Ordering::SeqCst);
        source.write(2);
        assert_eq!(sink.read().unwrap(), 3 + 20);
        assert_eq!(sink_calls.load(Ordering::SeqCst), before + 1, "sink must recompute exactly once");
    }

    #[test]
    fn early_cutoff_skips_unaffected_siblings() {
        let source = Source::new(1);
        let parity = {
            let s = source.clone();
            Computed::new(vec![source.as_upstream()], move || Ok::<_, GraphError>(s.read()? % 2 == 0))
        };
        let recomputes = Arc::new(AtomicUsize::new(0));
        let downstream = {
            let p = parity.clone();
            let recomputes = Arc::clone(&recomputes);
            Computed::new(vec![parity.as_upstream()], move || {
                recomputes.fetch_add(1, Ordering::SeqCst);
                Ok::<_, GraphError>(p.read()?)
            })
        };
        assert_eq!(downstream.read().unwrap(), false);
        assert_eq!(recomputes.load(Ordering::SeqCst), 1);
        source.write(3); // still odd: parity's *value* does not change
        assert_eq!(downstream.read().unwrap(), false);
        assert_eq!(recomputes.load(Ordering::SeqCst), 1, "unchanged upstream value must not recompute downstream");
        source.write(4); // now even: parity changes
        assert_eq!(downstream.read().unwrap(), true);
        assert_eq!(recomputes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn compute_failure_does_not_poison_cached_value() {
        let source = Source::new(2);
        let reciprocal = {
            let s = source.clone();
            Computed::new(vec![source.as_upstream()], move || {
                let v = s.read()?;
                if v == 0 {
                    Err(GraphError::InvalidState("division by zero"))
                } else {
                    Ok(100 / v)
                }
            })
        };
        assert_eq!(reciprocal.read().unwrap(), 50);
        source.write(0);
        assert!(reciprocal.read().is_err());
        source.write(0); // no-op write, should not matter
        source.write(4);
        assert_eq!(reciprocal.read().unwrap(), 25);
    }

    #[test]
    fn subscribe_then_write_notifies_once() {
        let source = Source::new(1);
        let doubled = {
            let s = source.clone();
            Computed::new(vec![source.as_upstream()], move || Ok::<_, GraphError>(s.read()? * 2))
        };
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _unsub = doubled.subscribe(Arc::new(move |v: GraphResult<i32>| {
            seen_clone.lock().unwrap().push(v.unwrap());
        }));
        assert_eq!(*seen.lock().unwrap(), vec![2]);
        source.write(5);
        assert_eq!(*seen.lock().unwrap(), vec![2, 10]);
    }
}
