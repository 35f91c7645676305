//! C5: the bindable proxy — a node whose upstream can be swapped at
//! runtime. There is no rebindable-query analogue in an incremental
//! query engine (queries are never rebound once defined); the
//! cycle-detection walk instead follows a `find_edge`/`get_cycle_path`-style
//! recursive dependency-graph walk, turned into the iterative
//! `plumbing::would_create_cycle` used here (see DESIGN.md).

use crate::computed::Computed;
use crate::effect::EffectHandle;
use crate::error::{GraphError, GraphResult};
use crate::node::{NodeId, ReadableNode, WritableNode};
use crate::observer::{Observer, ObserverRegistry, Unsubscribe};
use crate::plumbing::{self, Target, Upstream};
use crate::revision::{AtomicVersion, Version};
use crate::runtime::Runtime;
use crate::source::Source;
use arc_swap::ArcSwap;
use crossbeam_utils::atomic::AtomicCell;
use indexmap::IndexMap;
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<FxHasher>>;

/// Implemented by every node kind that can be the target of a `bind_to`:
/// sources, computed nodes, and other bindable proxies. Exposes just
/// enough — a type-erased upstream handle, a typed read, an optional typed
/// write, and (for other bindables) the cycle-walk capability — for
/// `Bindable<T>` to depend on any of them without knowing which.
pub trait BindTarget<T>: Send + Sync {
    fn bind_upstream(&self) -> Arc<dyn Upstream>;
    fn bind_read(&self) -> GraphResult<T>;
    /// Attempts to forward a write to this node. Returns `false` for
    /// read-only nodes (plain `Computed`), in which case the bindable's own
    /// `write`/`update` are no-ops, matching a read-only binding.
    fn bind_write(&self, _value: T) -> bool {
        false
    }
    /// `Some` only when this node is itself a bindable proxy, so the
    /// cycle-detection walk can continue through it.
    fn bind_as_cyclic(&self) -> Option<Arc<dyn plumbing::Bindable>> {
        None
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
enum Flag {
    Clean,
    MaybeDirty,
    Dirty,
    Computing,
}

enum Cached<T> {
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

/// Uniquely identifies "which upstream, through which rebind" a cached
/// resolution was taken against, so that rebinding to a *different* node
/// that happens to report the same raw version is still treated as a
/// change.
#[derive(Copy, Clone, PartialEq, Eq)]
struct Seen {
    generation: u64,
    version: Version,
}

struct Binding<T> {
    upstream: Arc<dyn Upstream>,
    bindable: Option<Arc<dyn plumbing::Bindable>>,
    read: Arc<dyn Fn() -> GraphResult<T> + Send + Sync>,
    write: Option<Arc<dyn Fn(T) -> bool + Send + Sync>>,
    /// Set only by `bind_owned`: invoked when this binding is replaced or
    /// torn down, closing the node this proxy exclusively owned.
    owned_close: Option<Arc<dyn Fn() + Send + Sync>>,
}

struct BindableInner<T> {
    id: NodeId,
    binding: ArcSwap<Option<Binding<T>>>,
    bind_generation: AtomicVersion,
    last_seen: AtomicCell<Option<Seen>>,
    flag: AtomicCell<Flag>,
    /// Set when a mark arrives while the flag reads `Computing`, so that
    /// invalidation is not lost to the in-flight pull's eventual CAS back
    /// to `Clean`; see the identical field on `ComputedInner`.
    recheck_pending: AtomicBool,
    cached: ArcSwap<Cached<T>>,
    local_version: AtomicVersion,
    last_notified_version: AtomicVersion,
    targets: ArcSwap<FxIndexMap<NodeId, Weak<dyn Target>>>,
    observers: ObserverRegistry<T>,
    effect: Arc<EffectHandle>,
    closed: AtomicBool,
    self_weak: Weak<BindableInner<T>>,
}

impl<T> BindableInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
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

    /// As with `ComputedInner::pull`, a `Clean` flag alone is not trusted:
    /// every pull re-validates the bound upstream's version (and bind
    /// generation) and only skips a fresh read when both still match
    /// `last_seen`.
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
            let binding = self.binding.load_full();
            let raced = match &*binding {
                None => self.apply_outcome(Err(GraphError::InvalidState("bindable proxy has no current binding"))),
                Some(b) => {
                    let version = b.upstream.validate();
                    let seen = Seen { generation: self.bind_generation.load().as_u64(), version };
                    let should_recompute = matches!(flag, Flag::Dirty) || self.last_seen.load() != Some(seen);
                    if should_recompute {
                        let outcome = catch_unwind(AssertUnwindSafe(|| (b.read)()))
                            .unwrap_or_else(|_| Err(GraphError::InvalidState("bound read panicked")));
                        self.last_seen.store(Some(seen));
                        self.apply_outcome(outcome)
                    } else {
                        self.finish_computing()
                    }
                }
            };
            if raced {
                continue;
            }
            return self.cached.load().to_result();
        }
    }

    fn finish_computing(&self) -> bool {
        if self.recheck_pending.swap(false, Ordering::AcqRel) {
            self.flag.store(Flag::Dirty);
            true
        } else {
            self.flag.store(Flag::Clean);
            false
        }
    }

    fn apply_outcome(&self, outcome: Result<T, GraphError>) -> bool {
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

    fn run_effect(self: Arc<Self>) {
        let result = self.pull();
        let current = self.local_version.load();
        if current != self.last_notified_version.load() {
            self.last_notified_version.store(current);
            self.observers.notify_all(&result);
        }
    }
}

impl<T> Target for BindableInner<T>
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

impl<T> Upstream for BindableInner<T>
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
    }
}

impl<T> plumbing::Bindable for BindableInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn bindable_id(&self) -> NodeId {
        self.id
    }

    fn current_bindable_upstream(&self) -> Option<Arc<dyn plumbing::Bindable>> {
        let guard = self.binding.load();
        let binding: &Option<Binding<T>> = &**guard;
        binding.as_ref().and_then(|b| b.bindable.clone())
    }
}

/// A rebindable proxy node. Starts unbound: reads fail with
/// [`GraphError::InvalidState`] until [`bind_to`](Bindable::bind_to) or
/// [`bind_owned`](Bindable::bind_owned) succeeds.
pub struct Bindable<T> {
    inner: Arc<BindableInner<T>>,
}

impl<T> Clone for Bindable<T> {
    fn clone(&self) -> Self {
        Bindable { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Bindable<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let id = NodeId::fresh();
        let inner = Arc::new_cyclic(|weak: &Weak<BindableInner<T>>| {
            let weak = weak.clone();
            BindableInner {
                id,
                binding: ArcSwap::from_pointee(None),
                bind_generation: AtomicVersion::start(),
                last_seen: AtomicCell::new(None),
                flag: AtomicCell::new(Flag::Dirty),
                recheck_pending: AtomicBool::new(false),
                cached: ArcSwap::from_pointee(Cached::Empty),
                local_version: AtomicVersion::start(),
                last_notified_version: AtomicVersion::start(),
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
        Bindable { inner }
    }

    pub(crate) fn as_upstream(&self) -> Arc<dyn Upstream> {
        Arc::clone(&self.inner) as Arc<dyn Upstream>
    }

    pub(crate) fn as_bindable_dyn(&self) -> Arc<dyn plumbing::Bindable> {
        Arc::clone(&self.inner) as Arc<dyn plumbing::Bindable>
    }

    fn rebind(&self, new_binding: Binding<T>, candidate: Option<&Arc<dyn plumbing::Bindable>>) -> GraphResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(GraphError::InvalidState("bindable proxy is closed"));
        }
        if let Some(candidate) = candidate {
            if plumbing::would_create_cycle(self.inner.id, &**candidate) {
                return Err(GraphError::CycleDetected);
            }
        }
        let new_upstream = Arc::clone(&new_binding.upstream);
        let old = self.inner.binding.swap(Arc::new(Some(new_binding)));

        // Post-check: a concurrent rebind elsewhere could have introduced a
        // cycle in the narrow window between the pre-check above and this
        // swap. If so, roll back to the prior binding and report failure.
        if let Some(candidate) = candidate {
            if plumbing::would_create_cycle(self.inner.id, &**candidate) {
                self.inner.binding.store(old);
                return Err(GraphError::CycleDetected);
            }
        }

        let self_target: Weak<dyn Target> = Arc::downgrade(&self.inner) as Weak<dyn Target>;
        if let Some(prev) = old.as_ref() {
            prev.upstream.remove_target(self.inner.id);
            if let Some(close) = &prev.owned_close {
                close();
            }
        }
        new_upstream.add_target(self_target);

        self.inner.bind_generation.increment();
        self.inner.flag.store(Flag::Dirty);
        crate::runtime::batch(|| {
            self.inner.notify_targets(true);
            self.inner.schedule_effect_if_observed();
        });
        Ok(())
    }

    /// Rebinds this proxy to read from (and, if writable, forward writes
    /// to) `node`, which remains independently owned by the caller.
    pub fn bind_to<N>(&self, node: &N) -> GraphResult<()>
    where
        N: BindTarget<T> + Clone + 'static,
    {
        let candidate = node.bind_as_cyclic();
        let node = node.clone();
        let write_node = node.clone();
        let binding = Binding {
            upstream: node.bind_upstream(),
            bindable: candidate.clone(),
            read: Arc::new(move || node.bind_read()),
            write: Some(Arc::new(move |value| write_node.bind_write(value))),
            owned_close: None,
        };
        self.rebind(binding, candidate.as_ref())
    }

    /// Like [`bind_to`](Self::bind_to), but this proxy takes ownership of
    /// `node`: the next time it is rebound or unbound, `node` is closed
    /// ("owned" binding).
    pub fn bind_owned<N>(&self, node: N) -> GraphResult<()>
    where
        N: BindTarget<T> + ReadableNode<T> + Clone + Send + Sync + 'static,
    {
        let candidate = node.bind_as_cyclic();
        let read_node = node.clone();
        let write_node = node.clone();
        let close_node = node.clone();
        let binding = Binding {
            upstream: node.bind_upstream(),
            bindable: candidate.clone(),
            read: Arc::new(move || read_node.bind_read()),
            write: Some(Arc::new(move |value| write_node.bind_write(value))),
            owned_close: Some(Arc::new(move || close_node.close())),
        };
        self.rebind(binding, candidate.as_ref())
    }

    /// Unsubscribes from the current binding (if any) and, if it was taken
    /// by ownership, closes it. Used by both `unbind` and `close`; unlike
    /// `unbind`, this performs no closed-state check, since `close` must
    /// tear down the binding *after* it has already marked itself closed.
    fn teardown_binding(&self) {
        let old = self.inner.binding.swap(Arc::new(None));
        if let Some(prev) = old.as_ref() {
            prev.upstream.remove_target(self.inner.id);
            if let Some(close) = &prev.owned_close {
                close();
            }
        }
    }

    /// The node id this proxy currently reads from, or `None` if unbound.
    pub fn current_binding(&self) -> Option<NodeId> {
        let guard = self.inner.binding.load();
        let binding: &Option<Binding<T>> = &**guard;
        binding.as_ref().map(|b| b.upstream.upstream_id())
    }

    /// Whether this proxy currently has a binding at all.
    pub fn is_bound(&self) -> bool {
        self.current_binding().is_some()
    }

    /// Reports whether binding this proxy to `candidate` would introduce a
    /// cycle in the "binds to" relation, without attempting the bind. A
    /// pure query: `candidate` is left untouched either way, and `bind_to`
    /// performs the identical check itself (plus a post-swap re-check), so
    /// callers are never required to call this first.
    pub fn would_create_cycle<N>(&self, candidate: &N) -> bool
    where
        N: BindTarget<T>,
    {
        match candidate.bind_as_cyclic() {
            Some(c) => plumbing::would_create_cycle(self.inner.id, &*c),
            None => false,
        }
    }

    /// Clears the current binding. Subsequent reads fail with
    /// [`GraphError::InvalidState`] until rebound.
    pub fn unbind(&self) -> GraphResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(GraphError::InvalidState("bindable proxy is closed"));
        }
        self.teardown_binding();
        self.inner.bind_generation.increment();
        self.inner.flag.store(Flag::Dirty);
        crate::runtime::batch(|| {
            self.inner.notify_targets(true);
            self.inner.schedule_effect_if_observed();
        });
        Ok(())
    }
}

impl<T> Default for Bindable<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BindTarget<T> for Source<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn bind_upstream(&self) -> Arc<dyn Upstream> {
        self.as_upstream()
    }

    fn bind_read(&self) -> GraphResult<T> {
        self.read()
    }

    fn bind_write(&self, value: T) -> bool {
        self.write(value);
        true
    }
}

impl<T> BindTarget<T> for Computed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn bind_upstream(&self) -> Arc<dyn Upstream> {
        self.as_upstream()
    }

    fn bind_read(&self) -> GraphResult<T> {
        self.read()
    }
}

impl<T> BindTarget<T> for Bindable<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn bind_upstream(&self) -> Arc<dyn Upstream> {
        self.as_upstream()
    }

    fn bind_read(&self) -> GraphResult<T> {
        self.read()
    }

    fn bind_write(&self, value: T) -> bool {
        self.write(value);
        true
    }

    fn bind_as_cyclic(&self) -> Option<Arc<dyn plumbing::Bindable>> {
        Some(self.as_bindable_dyn())
    }
}

impl<T> ReadableNode<T> for Bindable<T>
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
        let inner = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.observers.remove(id);
            }
        })
    }

    fn close(&self) {
        if self.inner.closed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return;
        }
        self.teardown_binding();
        self.inner.observers.clear();
        self.inner.targets.store(Arc::new(FxIndexMap::default()));
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl<T> WritableNode<T> for Bindable<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Forwards to whichever upstream was bound at the moment this call
    /// started ("write captures the binding in effect at entry"), so
    /// a concurrent rebind mid-call cannot cause a write to land on the
    /// wrong node. A no-op if unbound, closed, or bound to a read-only
    /// node.
    fn write(&self, value: T) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(binding) = self.inner.binding.load().as_ref() {
            if let Some(write) = &binding.write {
                write(value);
            }
        }
    }

    fn update(&self, mut f: impl FnMut(&T) -> T) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(binding) = self.inner.binding.load().as_ref() {
            if let Some(write) = &binding.write {
                if let Ok(current) = (binding.read)() {
                    write(f(&current));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::WritableNode as _;
    use crate::source::Source;

    #[test]
    fn unbound_read_fails() {
        let b: Bindable<i32> = Bindable::new();
        assert!(b.read().is_err());
    }

    #[test]
    fn bind_to_source_forwards_reads_and_writes() {
        let s = Source::new(1);
        let b: Bindable<i32> = Bindable::new();
        b.bind_to(&s).unwrap();
        assert_eq!(b.read().unwrap(), 1);
        s.write(2);
        assert_eq!(b.read().unwrap(), 2);
        b.write(3);
        assert_eq!(s.read().unwrap(), 3);
    }

    #[test]
    fn rebind_switches_upstream() {
        let a = Source::new(1);
        let b_src = Source::new(100);
        let proxy: Bindable<i32> = Bindable::new();
        proxy.bind_to(&a).unwrap();
        assert_eq!(proxy.read().unwrap(), 1);
        proxy.bind_to(&b_src).unwrap();
        assert_eq!(proxy.read().unwrap(), 100);
        a.write(999); // proxy no longer tracks `a`
        assert_eq!(proxy.read().unwrap(), 100);
    }

    #[test]
    fn direct_self_bind_is_rejected() {
        let proxy: Bindable<i32> = Bindable::new();
        let err = proxy.bind_to(&proxy).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected));
    }

    #[test]
    fn indirect_cycle_is_rejected() {
        let x: Bindable<i32> = Bindable::new();
        let y: Bindable<i32> = Bindable::new();
        let s = Source::new(0);
        x.bind_to(&s).unwrap();
        y.bind_to(&x).unwrap();
        let err = x.bind_to(&y).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected));
        // `x` must still be bound to `s`, not rolled into a broken state.
        assert_eq!(x.read().unwrap(), 0);
    }

    #[test]
    fn bind_owned_closes_previous_node_on_rebind() {
        let owned = Source::new(1);
        let replacement = Source::new(2);
        let proxy: Bindable<i32> = Bindable::new();
        proxy.bind_owned(owned.clone()).unwrap();
        proxy.bind_to(&replacement).unwrap();
        assert!(owned.is_closed());
    }
}
