//! C7: the operator kit — thin templates over the C3 computed-node
//! machinery. Each operator below is a free function that
//! wires a fixed compute closure over one or more typed upstream handles;
//! none of them need a new node kind except `switch` (built from
//! [`Bindable`]'s existing rebind machinery) and [`bimap`] (a small
//! writable view composed around a `Computed`, since writes are not
//! otherwise exposed on a plain `Computed`).

use crate::adapter::Adapter;
use crate::bindable::{BindTarget, Bindable};
use crate::computed::Computed;
use crate::error::{GraphError, GraphResult};
use crate::node::{NodeId, ReadableNode, WritableNode};
use crate::observer::{Observer, ObserverRegistry, Unsubscribe};
use crate::plumbing::Upstream;
use crate::source::Source;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

/// Crate-internal capability uniting every typed node kind that can serve
/// as an operator input: a typed read plus a type-erased upstream handle
/// for registering as a computed node's dependency.
pub(crate) trait Signal<T>: ReadableNode<T> + Clone + Send + Sync + 'static {
    fn upstream_handle(&self) -> Arc<dyn Upstream>;
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Signal<T> for Source<T> {
    fn upstream_handle(&self) -> Arc<dyn Upstream> {
        self.as_upstream()
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Signal<T> for Computed<T> {
    fn upstream_handle(&self) -> Arc<dyn Upstream> {
        self.as_upstream()
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Signal<T> for Bindable<T> {
    fn upstream_handle(&self) -> Arc<dyn Upstream> {
        self.as_upstream()
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Signal<T> for Adapter<T> {
    fn upstream_handle(&self) -> Arc<dyn Upstream> {
        self.as_upstream()
    }
}

/// Applies `f` to every value of `source`. A failure from `f` is a compute
/// failure on the resulting node, stored and re-raised until
/// `source`'s version next changes.
pub fn map<S, A, B>(source: S, f: impl Fn(A) -> Result<B, GraphError> + Send + Sync + 'static) -> Computed<B>
where
    S: Signal<A>,
    A: Clone + PartialEq + Send + Sync + 'static,
    B: Clone + PartialEq + Send + Sync + 'static,
{
    let upstream = source.upstream_handle();
    Computed::new(vec![upstream], move || f(source.read().map_err(GraphError::upstream)?))
}

/// Passes through values of `source` matching `predicate`, retaining the
/// last matching value when it rejects. Errors with
/// [`GraphError::InvalidState`] if no value has ever matched.
pub fn filter<S, A>(source: S, predicate: impl Fn(&A) -> bool + Send + Sync + 'static) -> Computed<A>
where
    S: Signal<A>,
    A: Clone + PartialEq + Send + Sync + 'static,
{
    let upstream = source.upstream_handle();
    let last_passing: ArcSwap<Option<A>> = ArcSwap::from_pointee(None);
    Computed::new(vec![upstream], move || {
        let value = source.read().map_err(GraphError::upstream)?;
        if predicate(&value) {
            last_passing.store(Arc::new(Some(value.clone())));
            Ok(value)
        } else {
            match &**last_passing.load() {
                Some(prev) => Ok(prev.clone()),
                None => Err(GraphError::InvalidState("filter has not yet seen a matching value")),
            }
        }
    })
}

/// Combines two upstreams via `combiner`; either changing may trigger
/// recompute.
pub fn combine2<S1, S2, A, B, R>(
    a: S1,
    b: S2,
    combiner: impl Fn(A, B) -> Result<R, GraphError> + Send + Sync + 'static,
) -> Computed<R>
where
    S1: Signal<A>,
    S2: Signal<B>,
    A: Clone + PartialEq + Send + Sync + 'static,
    B: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + PartialEq + Send + Sync + 'static,
{
    let upstreams = vec![a.upstream_handle(), b.upstream_handle()];
    Computed::new(upstreams, move || {
        combiner(a.read().map_err(GraphError::upstream)?, b.read().map_err(GraphError::upstream)?)
    })
}

/// Combines three upstreams via `combiner`. Further arities follow the
/// same shape.
pub fn combine3<S1, S2, S3, A, B, C, R>(
    a: S1,
    b: S2,
    c: S3,
    combiner: impl Fn(A, B, C) -> Result<R, GraphError> + Send + Sync + 'static,
) -> Computed<R>
where
    S1: Signal<A>,
    S2: Signal<B>,
    S3: Signal<C>,
    A: Clone + PartialEq + Send + Sync + 'static,
    B: Clone + PartialEq + Send + Sync + 'static,
    C: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + PartialEq + Send + Sync + 'static,
{
    let upstreams = vec![a.upstream_handle(), b.upstream_handle(), c.upstream_handle()];
    Computed::new(upstreams, move || {
        combiner(
            a.read().map_err(GraphError::upstream)?,
            b.read().map_err(GraphError::upstream)?,
            c.read().map_err(GraphError::upstream)?,
        )
    })
}

/// A type-erased node handle, used as the *value* of the "outer" signal
/// fed to [`switch`] — the outer node's value is itself a node.
pub struct DynSignal<A> {
    handle: Arc<dyn Upstream>,
    read: Arc<dyn Fn() -> GraphResult<A> + Send + Sync>,
}

impl<A> Clone for DynSignal<A> {
    fn clone(&self) -> Self {
        DynSignal { handle: Arc::clone(&self.handle), read: Arc::clone(&self.read) }
    }
}

/// Two `DynSignal`s are equal iff they wrap the same underlying node
/// identity, which is exactly the comparison the outer node's own
/// equality-based cache-skip needs to decide "did the selected inner node
/// actually change."
impl<A> PartialEq for DynSignal<A> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }
}

impl<A> DynSignal<A>
where
    A: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new<S: Signal<A>>(source: S) -> Self {
        let handle = source.upstream_handle();
        let read = Arc::new(move || source.read());
        DynSignal { handle, read }
    }
}

impl<A> BindTarget<A> for DynSignal<A>
where
    A: Clone + PartialEq + Send + Sync + 'static,
{
    fn bind_upstream(&self) -> Arc<dyn Upstream> {
        Arc::clone(&self.handle)
    }

    fn bind_read(&self) -> GraphResult<A> {
        (self.read)()
    }
}

/// Follows whichever node `outer` currently points at, switching
/// subscriptions whenever `outer` selects a different one. Built directly
/// on [`Bindable`]'s rebind protocol: each outer change is one `bind_to`,
/// which already unregisters from the previous inner, registers with the
/// new one, and tracks both the outer generation and the inner's version
/// via its own `last_seen` bookkeeping.
pub fn switch<S, A>(outer: S) -> Bindable<A>
where
    S: Signal<DynSignal<A>>,
    A: Clone + PartialEq + Send + Sync + 'static,
{
    let proxy: Bindable<A> = Bindable::new();
    if let Ok(initial) = outer.read() {
        let _ = proxy.bind_to(&initial);
    }
    let proxy_for_relay = proxy.clone();
    let _ = outer.subscribe(Arc::new(move |result: GraphResult<DynSignal<A>>| {
        if let Ok(inner) = result {
            let _ = proxy_for_relay.bind_to(&inner);
        }
    }));
    proxy
}

/// Stateful accumulator: `accumulator(seed, source.value)` initially, then
/// `accumulator(cache, source.value)` on each distinct source change.
/// Concurrent reads of a `DIRTY` scan node are not strictly
/// serialized — each may apply `accumulator` against whatever base is
/// cached at the moment it observes `DIRTY`, and the last writer's store
/// wins. Callers needing strict ordering must synchronize externally;
/// this operator does not add a per-node compute mutex.
pub fn scan<S, A, R>(source: S, seed: R, accumulator: impl Fn(&R, A) -> R + Send + Sync + 'static) -> Computed<R>
where
    S: Signal<A>,
    A: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + PartialEq + Send + Sync + 'static,
{
    let upstream = source.upstream_handle();
    let state: ArcSwap<R> = ArcSwap::from_pointee(seed);
    Computed::new(vec![upstream], move || {
        let incoming = source.read().map_err(GraphError::upstream)?;
        let previous = state.load_full();
        let next = accumulator(&previous, incoming);
        state.store(Arc::new(next.clone()));
        Ok::<R, GraphError>(next)
    })
}

/// Emits `(previous, current)`. The caller-supplied `initial` seeds
/// `previous` for the first emission; callers are expected to pass
/// `source`'s own starting value so the first emission reads `(initial,
/// initial)`.
pub fn pairwise<S, A>(source: S, initial: A) -> Computed<(A, A)>
where
    S: Signal<A>,
    A: Clone + PartialEq + Send + Sync + 'static,
{
    let upstream = source.upstream_handle();
    let previous: ArcSwap<A> = ArcSwap::from_pointee(initial);
    Computed::new(vec![upstream], move || {
        let current = source.read().map_err(GraphError::upstream)?;
        let prev = previous.swap(Arc::new(current.clone()));
        Ok::<(A, A), GraphError>(((*prev).clone(), current))
    })
}

/// Recomputes only when `key_selector`'s result changes, otherwise
/// preserves the previously emitted value.
pub fn distinct_by<S, A, K>(source: S, key_selector: impl Fn(&A) -> K + Send + Sync + 'static) -> Computed<A>
where
    S: Signal<A>,
    A: Clone + PartialEq + Send + Sync + 'static,
    K: PartialEq + Send + Sync + 'static,
{
    let upstream = source.upstream_handle();
    let last: ArcSwap<Option<(K, A)>> = ArcSwap::from_pointee(None);
    Computed::new(vec![upstream], move || {
        let value = source.read().map_err(GraphError::upstream)?;
        let key = key_selector(&value);
        let retained = match &**last.load() {
            Some((prev_key, prev_value)) if *prev_key == key => Some(prev_value.clone()),
            _ => None,
        };
        match retained {
            Some(value) => Ok(value),
            None => {
                last.store(Arc::new(Some((key, value.clone()))));
                Ok(value)
            }
        }
    })
}

/// Samples `other`'s current (pull-validated) value on every change of
/// `trigger`; registers only as a target of `trigger`, so a change
/// to `other` alone never schedules a recompute. Because `trigger`'s
/// change always reaches this node through a direct `mark_dirty` (not
/// `mark_maybe_dirty`), the pull phase's early-cutoff never applies here —
/// every trigger firing is reported as a change.
pub fn with_latest_from<ST, SO, A, B, R>(
    trigger: ST,
    other: SO,
    combiner: impl Fn(A, B) -> Result<R, GraphError> + Send + Sync + 'static,
) -> Computed<R>
where
    ST: Signal<A>,
    SO: Signal<B>,
    A: Clone + PartialEq + Send + Sync + 'static,
    B: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + PartialEq + Send + Sync + 'static,
{
    let upstream = trigger.upstream_handle();
    Computed::new(vec![upstream], move || {
        combiner(trigger.read().map_err(GraphError::upstream)?, other.read().map_err(GraphError::upstream)?)
    })
}

struct BiMapInner<S, A, B> {
    source: S,
    computed: Computed<B>,
    reverse: Arc<dyn Fn(B) -> Result<A, GraphError> + Send + Sync>,
    observers: ObserverRegistry<B>,
    /// Keeps the relay subscription to `computed` (installed in `bimap`)
    /// alive for this node's lifetime.
    relay: Mutex<Option<Unsubscribe>>,
}

/// A writable view over `source` (bidirectional map): reads apply
/// `forward` (via an internal [`Computed`]), writes apply `reverse` and
/// forward the result to `source`. A `reverse` failure is stored and
/// delivered to this node's own observers as a failure, mirroring how a
/// `forward`/compute failure is delivered, without touching `source` or
/// the internal computed node's cache.
pub struct BiMap<S, A, B> {
    inner: Arc<BiMapInner<S, A, B>>,
}

impl<S, A, B> Clone for BiMap<S, A, B> {
    fn clone(&self) -> Self {
        BiMap { inner: Arc::clone(&self.inner) }
    }
}

pub fn bimap<S, A, B>(
    source: S,
    forward: impl Fn(A) -> Result<B, GraphError> + Send + Sync + 'static,
    reverse: impl Fn(B) -> Result<A, GraphError> + Send + Sync + 'static,
) -> BiMap<S, A, B>
where
    S: Signal<A> + WritableNode<A>,
    A: Clone + PartialEq + Send + Sync + 'static,
    B: Clone + PartialEq + Send + Sync + 'static,
{
    let computed = map(source.clone(), forward);
    let inner = Arc::new(BiMapInner {
        source,
        computed,
        reverse: Arc::new(reverse),
        observers: ObserverRegistry::new(),
        relay: Mutex::new(None),
    });
    let weak: Weak<BiMapInner<S, A, B>> = Arc::downgrade(&inner);
    let relay = inner.computed.subscribe(Arc::new(move |result: GraphResult<B>| {
        if let Some(inner) = weak.upgrade() {
            inner.observers.notify_all(&result);
        }
    }));
    *inner.relay.lock() = Some(relay);
    BiMap { inner }
}

impl<S, A, B> ReadableNode<B> for BiMap<S, A, B>
where
    S: Signal<A> + WritableNode<A>,
    A: Clone + PartialEq + Send + Sync + 'static,
    B: Clone + PartialEq + Send + Sync + 'static,
{
    fn id(&self) -> NodeId {
        self.inner.computed.id()
    }

    fn read(&self) -> GraphResult<B> {
        self.inner.computed.read()
    }

    fn subscribe(&self, observer: Observer<B>) -> Unsubscribe {
        if self.inner.computed.is_closed() {
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
        self.inner.computed.close();
        self.inner.observers.clear();
    }

    fn is_closed(&self) -> bool {
        self.inner.computed.is_closed()
    }
}

impl<S, A, B> WritableNode<B> for BiMap<S, A, B>
where
    S: Signal<A> + WritableNode<A>,
    A: Clone + PartialEq + Send + Sync + 'static,
    B: Clone + PartialEq + Send + Sync + 'static,
{
    fn write(&self, value: B) {
        if self.inner.computed.is_closed() {
            return;
        }
        match (self.inner.reverse)(value) {
            Ok(upstream_value) => self.inner.source.write(upstream_value),
            Err(e) => {
                log::warn!("bimap reverse transform failed: {e}");
                self.inner.observers.notify_all(&Err(e));
            }
        }
    }

    fn update(&self, mut f: impl FnMut(&B) -> B) {
        if let Ok(current) = self.read() {
            let next = f(&current);
            self.write(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn map_doubles_values_and_propagates_errors() {
        let source = Source::new(2);
        let doubled = map(source.clone(), |v: i32| Ok::<_, GraphError>(v * 2));
        assert_eq!(doubled.read().unwrap(), 4);
        source.write(5);
        assert_eq!(doubled.read().unwrap(), 10);
    }

    #[test]
    fn filter_retains_last_matching_value() {
        let source = Source::new(2);
        let evens = filter(source.clone(), |v: &i32| v % 2 == 0);
        assert_eq!(evens.read().unwrap(), 2);
        source.write(3); // rejected: retains 2
        assert_eq!(evens.read().unwrap(), 2);
        source.write(4); // accepted
        assert_eq!(evens.read().unwrap(), 4);
    }

    #[test]
    fn combine2_recomputes_on_either_input() {
        let a = Source::new(1);
        let b = Source::new(10);
        let sum = combine2(a.clone(), b.clone(), |x: i32, y: i32| Ok::<_, GraphError>(x + y));
        assert_eq!(sum.read().unwrap(), 11);
        a.write(2);
        assert_eq!(sum.read().unwrap(), 12);
        b.write(20);
        assert_eq!(sum.read().unwrap(), 22);
    }

    #[test]
    fn scan_accumulates_distinct_writes() {
        let source = Source::new(1);
        let acc = scan(source.clone(), 0, |state: &i32, v: i32| state + v);
        assert_eq!(acc.read().unwrap(), 1);
        source.write(2);
        assert_eq!(acc.read().unwrap(), 3);
        source.write(3);
        assert_eq!(acc.read().unwrap(), 6);
        source.write(4);
        assert_eq!(acc.read().unwrap(), 10);
    }

    #[test]
    fn pairwise_emits_previous_and_current() {
        let source = Source::new(1);
        let pairs = pairwise(source.clone(), 1);
        assert_eq!(pairs.read().unwrap(), (1, 1));
        source.write(2);
        assert_eq!(pairs.read().unwrap(), (1, 2));
        source.write(3);
        assert_eq!(pairs.read().unwrap(), (2, 3));
    }

    #[test]
    fn distinct_by_ignores_key_collisions() {
        let source = Source::new(1);
        let by_parity = distinct_by(source.clone(), |v: &i32| v % 2);
        assert_eq!(by_parity.read().unwrap(), 1);
        source.write(3); // same parity: retained
        assert_eq!(by_parity.read().unwrap(), 1);
        source.write(4); // different parity
        assert_eq!(by_parity.read().unwrap(), 4);
    }

    #[test]
    fn with_latest_from_only_tracks_the_trigger() {
        let src = Source::new(0);
        let other = Source::new(10);
        let r = with_latest_from(src.clone(), other.clone(), |a: i32, b: i32| Ok::<_, GraphError>(a + b));
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _unsub = r.subscribe(Arc::new(move |v: GraphResult<i32>| {
            seen_clone.lock().unwrap().push(v.unwrap());
        }));
        other.write(20); // no notification: other is untracked
        src.write(1); // one notification: 1 + 20
        assert_eq!(*seen.lock().unwrap(), vec![10, 21]);
    }

    #[test]
    fn switch_follows_the_currently_selected_inner() {
        let left = Source::new(1);
        let right = Source::new(100);
        let selected: Source<DynSignal<i32>> = Source::new(DynSignal::new(left.clone()));
        let proxy = switch(selected.clone());
        assert_eq!(proxy.read().unwrap(), 1);
        left.write(2);
        assert_eq!(proxy.read().unwrap(), 2);
        selected.write(DynSignal::new(right.clone()));
        assert_eq!(proxy.read().unwrap(), 100);
        left.write(999); // proxy switched away, no longer tracks `left`
        assert_eq!(proxy.read().unwrap(), 100);
    }

    #[test]
    fn bimap_round_trips_and_reports_reverse_failures() {
        let source = Source::new(1);
        let view = bimap(
            source.clone(),
            |v: i32| Ok::<_, GraphError>(v * 2),
            |v: i32| {
                if v % 2 != 0 {
                    Err(GraphError::InvalidState("odd values have no inverse"))
                } else {
                    Ok(v / 2)
                }
            },
        );
        assert_eq!(view.read().unwrap(), 2);
        view.write(10);
        assert_eq!(source.read().unwrap(), 5);
        assert_eq!(view.read().unwrap(), 10);

        let failures = Arc::new(AtomicUsize::new(0));
        let failures_clone = Arc::clone(&failures);
        let _unsub = view.subscribe(Arc::new(move |result: GraphResult<i32>| {
            if result.is_err() {
                failures_clone.fetch_add(1, Ordering::SeqCst);
            }
        }));
        view.write(3); // odd: reverse fails, no write reaches `source`
        assert_eq!(source.read().unwrap(), 5);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }
}
