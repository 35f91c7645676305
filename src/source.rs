//! C2: the source node — a mutable root of the dependency graph.

use crate::effect::EffectHandle;
use crate::error::GraphResult;
use crate::node::{NodeId, ReadableNode, WritableNode};
use crate::observer::{Observer, ObserverRegistry, Unsubscribe};
use crate::plumbing::{Target, Upstream};
use crate::revision::{AtomicVersion, Version};
use crate::runtime::Runtime;
use arc_swap::ArcSwap;
use indexmap::IndexMap;
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<FxHasher>>;

struct SourceInner<T> {
    id: NodeId,
    value: ArcSwap<T>,
    local_version: AtomicVersion,
    targets: ArcSwap<FxIndexMap<NodeId, Weak<dyn Target>>>,
    observers: ObserverRegistry<T>,
    effect: Arc<EffectHandle>,
    closed: AtomicBool,
}

/// A writable root node.
///
/// Cheap to clone: every clone is a handle to the same underlying node,
/// a cheap view over shared storage rather than an owner of it.
pub struct Source<T> {
    inner: Arc<SourceInner<T>>,
}

impl<T> Clone for Source<T> {
    fn clone(&self) -> Self {
        Source { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Source<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Creates a new source node holding `initial`, at local version zero.
    pub fn new(initial: T) -> Self {
        let id = NodeId::fresh();
        let inner = Arc::new_cyclic(|weak: &Weak<SourceInner<T>>| {
            let weak = weak.clone();
            SourceInner {
                id,
                value: ArcSwap::from_pointee(initial),
                local_version: AtomicVersion::start(),
                targets: ArcSwap::from_pointee(FxIndexMap::default()),
                observers: ObserverRegistry::new(),
                effect: EffectHandle::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        let value = inner.value.load_full();
                        inner.observers.notify_all(&Ok((*value).clone()));
                    }
                }),
                closed: AtomicBool::new(false),
            }
        });
        Source { inner }
    }

    fn notify_targets_dirty(&self) {
        let snapshot = self.inner.targets.load();
        for target in snapshot.values() {
            if let Some(target) = target.upgrade() {
                target.mark_dirty();
            }
        }
    }
}

impl<T> ReadableNode<T> for Source<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn id(&self) -> NodeId {
        self.inner.id
    }

    fn read(&self) -> GraphResult<T> {
        Ok((*self.inner.value.load_full()).clone())
    }

    fn subscribe(&self, observer: Observer<T>) -> Unsubscribe {
        if self.inner.closed.load(Ordering::Acquire) {
            return Unsubscribe::noop();
        }
        let current = self.read();
        observer(current);
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
        self.inner.observers.clear();
        self.inner.targets.store(Arc::new(FxIndexMap::default()));
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl<T> WritableNode<T> for Source<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn write(&self, value: T) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let changed = {
            let current = self.inner.value.load();
            **current != value
        };
        if !changed {
            return;
        }
        self.inner.value.store(Arc::new(value));
        self.inner.local_version.increment();
        Runtime::get().bump_global_version();
        crate::runtime::batch(|| {
            self.notify_targets_dirty();
            if !self.inner.observers.is_empty() {
                Runtime::get().schedule_effect(Arc::clone(&self.inner.effect));
            }
        });
    }

    fn update(&self, mut f: impl FnMut(&T) -> T) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        loop {
            let current = self.inner.value.load();
            let next = f(&current);
            if **current == next {
                return;
            }
            let previous = self.inner.value.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&*previous, &*current) {
                break;
            }
            // Lost the race against a concurrent writer; retry against
            // whichever value actually won.
        }
        self.inner.local_version.increment();
        Runtime::get().bump_global_version();
        crate::runtime::batch(|| {
            self.notify_targets_dirty();
            if !self.inner.observers.is_empty() {
                Runtime::get().schedule_effect(Arc::clone(&self.inner.effect));
            }
        });
    }
}

impl<T> Upstream for SourceInner<T>
where
    T: Send + Sync + 'static,
{
    fn upstream_id(&self) -> NodeId {
        self.id
    }

    fn version(&self) -> Version {
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

impl<T> Source<T>
where
    T: Send + Sync + 'static,
{
    /// Exposes this source as a type-erased upstream, used by computed
    /// nodes and bindable proxies to register for invalidation pushes
    /// without needing to know `T`.
    pub(crate) fn as_upstream(&self) -> Arc<dyn Upstream>
    where
        T: 'static,
    {
        // `SourceInner<T>` already implements `Upstream`; expose the shared
        // `Arc` directly rather than allocating a wrapper.
        self.inner.clone() as Arc<dyn Upstream>
    }
}
