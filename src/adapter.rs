//! C6: the external-source adapter — a node that is simultaneously a
//! source node to the graph and a consumer of a hot external producer.
//! Structurally it is `source.rs`'s value cell/target-set/observer
//! shape plus a lazily-started, cancellable collection task and the
//! dual-guard echo suppression for bidirectional sync.

use crate::effect::EffectHandle;
use crate::error::GraphResult;
use crate::node::{NodeId, ReadableNode, WritableNode};
use crate::observer::{Observer, ObserverRegistry, Unsubscribe};
use crate::plumbing::{Target, Upstream};
use crate::revision::{AtomicVersion, Version};
use crate::runtime::Runtime;
use arc_swap::ArcSwap;
use crossbeam_utils::atomic::AtomicCell;
use indexmap::IndexMap;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<FxHasher>>;

/// A handle that cancels an in-flight external collection task.
///
/// Cloning shares the same underlying flag, so a producer's own background
/// loop can hold a clone and poll it independently of whoever holds the
/// handle returned from [`ExternalProducer::collect`].
#[derive(Clone)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
    /// Only populated by producers that spawn their own background thread
    /// (e.g. the `adapter-async` stream bridge below); `None` otherwise.
    join: Arc<Mutex<Option<std::thread::JoinHandle<()>>>>,
}

impl Cancellation {
    pub fn new() -> Self {
        Cancellation {
            cancelled: Arc::new(AtomicBool::new(false)),
            join: Arc::new(Mutex::new(None)),
        }
    }

    /// Requests cancellation. The producer is responsible for observing
    /// this promptly; there is no forced preemption.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// The seam between the graph and a hot external value source, kept
/// deliberately free of any particular async runtime or threading model.
///
/// `collect` must return promptly: it registers `on_value` against
/// whatever mechanism the producer uses to receive values (a channel, a
/// reactor registration, its own background thread) and hands back a
/// [`Cancellation`] the adapter keeps for the lifetime of the collection.
/// Implementations that need to block a thread to pump values must spawn
/// that thread themselves, the way [`StreamProducer`] does below.
pub trait ExternalProducer<T>: Send {
    fn collect(self: Box<Self>, on_value: Box<dyn Fn(T) + Send>) -> Cancellation;
}

struct AdapterInner<T> {
    id: NodeId,
    value: ArcSwap<T>,
    local_version: AtomicVersion,
    targets: ArcSwap<FxIndexMap<NodeId, Weak<dyn Target>>>,
    observers: ObserverRegistry<T>,
    effect: Arc<EffectHandle>,
    closed: AtomicBool,
    /// Guards the one-shot transition into "collection task running".
    /// Unlike a computed node's registration, this never toggles back off:
    /// the task runs until `close` cancels it.
    started: AtomicBool,
    producer: Mutex<Option<Box<dyn ExternalProducer<T>>>>,
    collection: Mutex<Option<Cancellation>>,
    /// Forwards a graph-side write to the external system. `None` for a
    /// read-only (unidirectional) adapter.
    sink: Option<Arc<dyn Fn(T) + Send + Sync>>,
    /// Layer 1, the "self-update version" guard: the local version stamped
    /// at the moment of the most recent self-originated write, paired with
    /// the value that write published.
    pending_self_echo: ArcSwap<Option<T>>,
    self_update_version: AtomicCell<Option<Version>>,
    self_weak: Weak<AdapterInner<T>>,
}

impl<T> AdapterInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn notify_targets_dirty(&self) {
        let snapshot = self.targets.load();
        for target in snapshot.values() {
            if let Some(target) = target.upgrade() {
                target.mark_dirty();
            }
        }
    }

    /// Starts the collection task the first time demand (an observer or a
    /// target) arrives. A no-op on every call after the first, and on a
    /// closed adapter.
    fn ensure_started(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.started.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return;
        }
        let producer = match self.producer.lock().take() {
            Some(p) => p,
            None => return,
        };
        let weak = self.self_weak.clone();
        let on_value: Box<dyn Fn(T) + Send> = Box::new(move |value| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_incoming(value);
            }
        });
        let cancellation = producer.collect(on_value);
        *self.collection.lock() = Some(cancellation);
    }

    /// Applies a value arriving from the external producer, after the
    /// dual-guard echo check.
    fn handle_incoming(&self, incoming: T) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let stamped_now = self.self_update_version.load();
        let is_self_echo = stamped_now.is_some()
            && stamped_now == Some(self.local_version.load())
            && matches!(&**self.pending_self_echo.load(), Some(expected) if *expected == incoming);
        if is_self_echo {
            self.pending_self_echo.store(Arc::new(None));
            self.self_update_version.store(None);
            log::trace!("adapter suppressed self-originated echo");
            return;
        }
        self.apply_incoming(incoming);
    }

    /// Layer 2, the defense-in-depth equality guard: an external value
    /// equal to what is already cached publishes nothing, whether or not
    /// it was actually our own echo.
    fn apply_incoming(&self, value: T) {
        let changed = {
            let current = self.value.load();
            **current != value
        };
        if !changed {
            return;
        }
        self.value.store(Arc::new(value));
        self.local_version.increment();
        Runtime::get().bump_global_version();
        crate::runtime::batch(|| {
            self.notify_targets_dirty();
            if !self.observers.is_empty() {
                Runtime::get().schedule_effect(Arc::clone(&self.effect));
            }
        });
    }
}

impl<T> Upstream for AdapterInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
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
        if let Some(strong) = self.self_weak.upgrade() {
            strong.ensure_started();
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
    }
}

/// A node bridging a hot external producer into the graph.
///
/// Reads and subscriptions behave exactly like [`Source`](crate::source::Source);
/// the difference is entirely in where values come from and, for a
/// [`bidirectional`](Self::bidirectional) adapter, where graph-side writes
/// go.
pub struct Adapter<T> {
    inner: Arc<AdapterInner<T>>,
}

impl<T> Clone for Adapter<T> {
    fn clone(&self) -> Self {
        Adapter { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Adapter<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// A read-only adapter: graph-side writes only update the local cache,
    /// with no forwarding to the external system.
    pub fn new(producer: impl ExternalProducer<T> + 'static, initial: T) -> Self {
        Self::build(producer, initial, None)
    }

    /// A bidirectional adapter: graph-side writes are forwarded through
    /// `sink` to the external system, stamped so the resulting echo (if
    /// any) is suppressed rather than re-applied.
    pub fn bidirectional(
        producer: impl ExternalProducer<T> + 'static,
        initial: T,
        sink: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        Self::build(producer, initial, Some(Arc::new(sink)))
    }

    fn build(
        producer: impl ExternalProducer<T> + 'static,
        initial: T,
        sink: Option<Arc<dyn Fn(T) + Send + Sync>>,
    ) -> Self {
        let id = NodeId::fresh();
        let inner = Arc::new_cyclic(|weak: &Weak<AdapterInner<T>>| {
            let weak_for_effect = weak.clone();
            AdapterInner {
                id,
                value: ArcSwap::from_pointee(initial),
                local_version: AtomicVersion::start(),
                targets: ArcSwap::from_pointee(FxIndexMap::default()),
                observers: ObserverRegistry::new(),
                effect: EffectHandle::new(move || {
                    if let Some(inner) = weak_for_effect.upgrade() {
                        let value = inner.value.load_full();
                        inner.observers.notify_all(&Ok((*value).clone()));
                    }
                }),
                closed: AtomicBool::new(false),
                started: AtomicBool::new(false),
                producer: Mutex::new(Some(Box::new(producer))),
                collection: Mutex::new(None),
                sink,
                pending_self_echo: ArcSwap::from_pointee(None),
                self_update_version: AtomicCell::new(None),
                self_weak: weak.clone(),
            }
        });
        Adapter { inner }
    }

    pub(crate) fn as_upstream(&self) -> Arc<dyn Upstream> {
        Arc::clone(&self.inner) as Arc<dyn Upstream>
    }
}

impl<T> ReadableNode<T> for Adapter<T>
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
        self.inner.ensure_started();
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
        if let Some(cancellation) = self.inner.collection.lock().take() {
            cancellation.cancel();
        }
        self.inner.producer.lock().take();
        self.inner.observers.clear();
        self.inner.targets.store(Arc::new(FxIndexMap::default()));
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl<T> WritableNode<T> for Adapter<T>
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
        self.inner.value.store(Arc::new(value.clone()));
        let stamped = self.inner.local_version.increment();
        Runtime::get().bump_global_version();
        if let Some(sink) = &self.inner.sink {
            self.inner.pending_self_echo.store(Arc::new(Some(value.clone())));
            self.inner.self_update_version.store(Some(stamped));
            sink(value);
        }
        crate::runtime::batch(|| {
            self.inner.notify_targets_dirty();
            if !self.inner.observers.is_empty() {
                Runtime::get().schedule_effect(Arc::clone(&self.inner.effect));
            }
        });
    }

    fn update(&self, mut f: impl FnMut(&T) -> T) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let next = loop {
            let current = self.inner.value.load();
            let candidate = f(&current);
            if **current == candidate {
                return;
            }
            let previous = self.inner.value.compare_and_swap(&current, Arc::new(candidate.clone()));
            if Arc::ptr_eq(&*previous, &*current) {
                break candidate;
            }
        };
        let stamped = self.inner.local_version.increment();
        Runtime::get().bump_global_version();
        if let Some(sink) = &self.inner.sink {
            self.inner.pending_self_echo.store(Arc::new(Some(next.clone())));
            self.inner.self_update_version.store(Some(stamped));
            sink(next);
        }
        crate::runtime::batch(|| {
            self.inner.notify_targets_dirty();
            if !self.inner.observers.is_empty() {
                Runtime::get().schedule_effect(Arc::clone(&self.inner.effect));
            }
        });
    }
}

/// Wraps any [`futures_util::Stream`] as an [`ExternalProducer`], polling
/// it to completion on a dedicated thread with a minimal hand-rolled
/// executor (a no-op waker plus a yielding poll loop) rather than pulling
/// in a full async runtime, preserving the core's executor-agnostic
/// stance.
#[cfg(feature = "adapter-async")]
pub struct StreamProducer<S> {
    stream: S,
}

#[cfg(feature = "adapter-async")]
impl<S> StreamProducer<S> {
    pub fn new(stream: S) -> Self {
        StreamProducer { stream }
    }
}

#[cfg(feature = "adapter-async")]
impl<S, T> ExternalProducer<T> for StreamProducer<S>
where
    S: futures_util::Stream<Item = T> + Send + 'static,
    T: Send + 'static,
{
    fn collect(self: Box<Self>, on_value: Box<dyn Fn(T) + Send>) -> Cancellation {
        use futures_util::Stream as _;
        use std::task::{Context, Poll};

        let stream = self.stream;
        let cancellation = Cancellation::new();
        let cancel_handle = cancellation.clone();
        let handle = std::thread::spawn(move || {
            let mut stream = Box::pin(stream);
            let waker = futures_util::task::noop_waker();
            let mut cx = Context::from_waker(&waker);
            loop {
                if cancel_handle.is_cancelled() {
                    return;
                }
                match stream.as_mut().poll_next(&mut cx) {
                    Poll::Ready(Some(value)) => on_value(value),
                    Poll::Ready(None) => return,
                    Poll::Pending => std::thread::yield_now(),
                }
            }
        });
        *cancellation.join.lock() = Some(handle);
        cancellation
    }
}
