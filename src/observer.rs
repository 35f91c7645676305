//! C4: the observer registry.
//!
//! Thread-safety uses copy-on-write semantics: observer-set mutation
//! publishes a brand new immutable snapshot via [`arc_swap::ArcSwap`];
//! iterators (used for notification) traverse a snapshot `Arc` and are
//! therefore unaffected by concurrent add/remove, the same way an
//! insertion-ordered `FxIndexSet` of tracked dependencies can be walked
//! without holding any lock across the traversal.

use crate::error::GraphResult;
use arc_swap::ArcSwap;
use indexmap::IndexMap;
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<FxHasher>>;

/// A callback registered to receive value/error events.
///
/// `Arc`-wrapped (rather than `Box`-wrapped) so that publishing a new
/// observer-set snapshot is a cheap pointer clone of every existing entry,
/// not a reallocation of every closure.
pub type Observer<T> = Arc<dyn Fn(GraphResult<T>) + Send + Sync>;

/// A handle returned by `subscribe`.
///
/// Calling [`unsubscribe`](Unsubscribe::unsubscribe) any number of times is
/// safe; the underlying removal is a no-op once the observer is gone, and a
/// second call after the owning node has been dropped entirely is also a
/// silent no-op (the captured weak reference simply fails to upgrade).
#[derive(Clone)]
pub struct Unsubscribe(Arc<dyn Fn() + Send + Sync>);

impl Unsubscribe {
    pub(crate) fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Unsubscribe(Arc::new(f))
    }

    /// A handle that does nothing, returned by `subscribe` on a closed node.
    pub(crate) fn noop() -> Self {
        Unsubscribe::new(|| {})
    }

    /// Removes the associated observer. Idempotent.
    pub fn unsubscribe(&self) {
        (self.0)()
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Unsubscribe")
    }
}

/// The registry itself: an insertion-ordered, copy-on-write map from a
/// node-local observer id to its callback.
pub(crate) struct ObserverRegistry<T> {
    next_id: AtomicU64,
    snapshot: ArcSwap<FxIndexMap<u64, Observer<T>>>,
}

impl<T> ObserverRegistry<T> {
    pub fn new() -> Self {
        ObserverRegistry {
            next_id: AtomicU64::new(1),
            snapshot: ArcSwap::from_pointee(FxIndexMap::default()),
        }
    }

    /// Registration reflects demand: `true` iff at least one observer is
    /// currently registered.
    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    /// Adds `observer` and returns its node-local id, used later to remove
    /// it again via [`remove`](Self::remove).
    pub fn insert(&self, observer: Observer<T>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.snapshot.rcu(|current| {
            let mut next = FxIndexMap::clone(current);
            next.insert(id, Arc::clone(&observer));
            next
        });
        id
    }

    /// Removes the observer with the given id. A no-op if it is already
    /// gone — this is what makes unsubscribe-during-delivery and
    /// double-unsubscribe both safe.
    pub fn remove(&self, id: u64) {
        self.snapshot.rcu(|current| {
            if !current.contains_key(&id) {
                return FxIndexMap::clone(current);
            }
            let mut next = FxIndexMap::clone(current);
            next.shift_remove(&id);
            next
        });
    }

    /// Drops every registered observer, used by `close`.
    pub fn clear(&self) {
        self.snapshot.store(Arc::new(FxIndexMap::default()));
    }

    /// Delivers `result` to every currently-registered observer, in
    /// insertion order, over an immutable snapshot (so an observer that
    /// unsubscribes itself mid-delivery does not see further events from
    /// this same delivery, and concurrent subscribe/unsubscribe elsewhere
    /// cannot corrupt the walk).
    ///
    /// Each observer invocation is individually panic-guarded: a panicking
    /// observer is assumed untrusted and its panic is discarded so that
    /// later observers in the same delivery still run.
    pub fn notify_all(&self, result: &GraphResult<T>)
    where
        T: Clone,
    {
        let snapshot = self.snapshot.load_full();
        for observer in snapshot.values() {
            let payload = result.clone();
            let observer = Arc::clone(observer);
            let outcome = catch_unwind(AssertUnwindSafe(|| observer(payload)));
            if outcome.is_err() {
                log::warn!("observer callback panicked; discarding and continuing delivery");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn insertion_order_is_preserved() {
        let reg: ObserverRegistry<i32> = ObserverRegistry::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = Arc::clone(&order);
            reg.insert(Arc::new(move |_: GraphResult<i32>| order.lock().push(i)));
        }
        reg.notify_all(&Ok(1));
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn remove_is_idempotent() {
        let reg: ObserverRegistry<i32> = ObserverRegistry::new();
        let id = reg.insert(Arc::new(|_| {}));
        assert!(!reg.is_empty());
        reg.remove(id);
        assert!(reg.is_empty());
        reg.remove(id); // second call must not panic
        assert!(reg.is_empty());
    }

    #[test]
    fn self_removal_during_delivery_does_not_see_later_events() {
        let reg: Arc<ObserverRegistry<i32>> = Arc::new(ObserverRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let reg_for_closure = Arc::clone(&reg);
        let calls_clone = Arc::clone(&calls);
        // insert returns an id; wire up a self-removing observer via a cell
        let id_cell: Arc<parking_lot::Mutex<Option<u64>>> = Arc::new(parking_lot::Mutex::new(None));
        let id_cell_clone = Arc::clone(&id_cell);
        let id = reg.insert(Arc::new(move |_: GraphResult<i32>| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *id_cell_clone.lock() {
                reg_for_closure.remove(id);
            }
        }));
        *id_cell.lock() = Some(id);

        reg.notify_all(&Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(reg.is_empty());

        reg.notify_all(&Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "unsubscribed observer must not fire again");
    }

    #[test]
    fn panicking_observer_does_not_stop_later_observers() {
        let reg: ObserverRegistry<i32> = ObserverRegistry::new();
        reg.insert(Arc::new(|_: GraphResult<i32>| panic!("boom")));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        reg.insert(Arc::new(move |_: GraphResult<i32>| {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }));
        reg.notify_all(&Ok(1));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
