// Copyright 2025 plexus Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Generic keyed cache with a pluggable miss resolver.
//!
//! Keeps most recently used elements in memory while discarding the least
//! recently used ones. Eviction is done in chunks determined by a percentage
//! of the current size, swept from a counted cutoff segment at the cold end
//! of the recency list rather than re-sorting on every access.
//!
//! The key map is guarded by one read-write lock; the recency list is only
//! ever touched by maintenance tasks, so the read path never blocks on list
//! bookkeeping. Map mutations are visible as soon as the lock is released;
//! list positions are eventually consistent with logical recency.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use hashbrown::{hash_map::Entry, HashMap};
use parking_lot::{Condvar, Mutex, RwLock};
use plexus_common::{
    pressure::{ListenerId, MemoryMonitor},
    queue::MaintenanceQueue,
    slab::Token,
};

use crate::{
    error::{Error, Result},
    order::OrderList,
};

/// Resolves a cache miss to a value. Invoked outside of any cache lock.
pub trait Resolver<K, V>: Fn(&K) -> V + Send + Sync + 'static {}
impl<K, V, T> Resolver<K, V> for T where T: Fn(&K) -> V + Send + Sync + 'static {}

/// When and how much the cache evicts, chosen at construction.
#[derive(Debug, Clone, Copy)]
pub enum EvictPolicy {
    /// Sweep when an insert pushes the size past `max_size`, discarding
    /// roughly `evict_count` of the least recently used elements.
    Capacity {
        /// Maximum number of elements before a sweep is scheduled.
        max_size: usize,
        /// Number of least recently used elements a sweep discards.
        evict_count: usize,
    },
    /// Sweep only from a memory-pressure notification, when the reported
    /// used-memory fraction exceeds `threshold`, discarding roughly
    /// `evict_percent` of the elements.
    Pressure {
        /// Used-memory fraction above which a sweep runs, in `(0, 1]`.
        threshold: f64,
        /// Fraction of elements a sweep discards, in `(0, 1]`.
        evict_percent: f64,
    },
}

impl EvictPolicy {
    fn validate(&self) -> Result<()> {
        match *self {
            Self::Capacity {
                max_size,
                evict_count,
            } => {
                if max_size == 0 {
                    return Err(Error::config("max_size must be > 0"));
                }
                if evict_count == 0 || evict_count > max_size {
                    return Err(Error::config("evict_count must be in 1..=max_size"));
                }
            }
            Self::Pressure {
                threshold,
                evict_percent,
            } => {
                if !(threshold > 0.0 && threshold <= 1.0) {
                    return Err(Error::config("threshold must be in (0, 1]"));
                }
                if !(evict_percent > 0.0 && evict_percent <= 1.0) {
                    return Err(Error::config("evict_percent must be in (0, 1]"));
                }
            }
        }
        Ok(())
    }

    /// Fraction of elements the cutoff segment approximates.
    fn evict_fraction(&self) -> f64 {
        match *self {
            Self::Capacity {
                max_size,
                evict_count,
            } => evict_count as f64 / max_size as f64,
            Self::Pressure { evict_percent, .. } => evict_percent,
        }
    }
}

/// Raw order-list token shared between a map entry and its list node;
/// zero while the entry is not linked.
type TokenCell = Arc<AtomicUsize>;

struct CacheEntry<V> {
    value: V,
    cell: TokenCell,
}

struct OrderState<K> {
    list: OrderList<(K, TokenCell)>,
    /// Approximate boundary of the evict-candidate segment; everything from
    /// here tailward is discarded by a sweep.
    cutoff: Option<Token>,
    /// Counted size of the segment from `cutoff` to the tail, inclusive.
    cutoff_size: usize,
}

enum FlightState<V> {
    Pending,
    Ready(V),
    Poisoned,
}

/// A single in-flight resolution; concurrent misses on the same key wait on
/// it instead of invoking the resolver again.
struct Flight<V> {
    state: Mutex<FlightState<V>>,
    cv: Condvar,
}

impl<V> Flight<V> {
    fn new() -> Self {
        Self {
            state: Mutex::new(FlightState::Pending),
            cv: Condvar::new(),
        }
    }
}

struct Inner<K, V> {
    map: RwLock<HashMap<K, CacheEntry<V>>>,
    // Lock order: `order` strictly before `map`. The sweep walks the list
    // while reacquiring the map write lock per discarded entry; maintenance
    // tasks honoring the same order cannot invert against it.
    order: Mutex<OrderState<K>>,
    inflight: Mutex<HashMap<K, Arc<Flight<V>>>>,
    resolver: Arc<dyn Fn(&K) -> V + Send + Sync>,
    policy: EvictPolicy,
    queue: Arc<MaintenanceQueue>,
    monitor: Mutex<Option<(Arc<MemoryMonitor>, ListenerId)>>,
}

/// A key-value cache that loads misses through a configured resolver.
///
/// There is no `put`: the cache alone decides if and when data is kept, so it
/// is operational only with a resolver in effect. [`remove`](LruCache::remove)
/// exists for the case where an item is being removed from permanent storage
/// as well.
///
/// Cloning returns another handle to the same cache.
pub struct LruCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for LruCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> LruCache<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache over `resolver` with the given eviction policy, wired
    /// to the environment's maintenance queue.
    pub fn new(
        resolver: impl Resolver<K, V>,
        policy: EvictPolicy,
        queue: Arc<MaintenanceQueue>,
    ) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                map: RwLock::new(HashMap::new()),
                order: Mutex::new(OrderState {
                    list: OrderList::new(),
                    cutoff: None,
                    cutoff_size: 0,
                }),
                inflight: Mutex::new(HashMap::new()),
                resolver: Arc::new(resolver),
                policy,
                queue,
                monitor: Mutex::new(None),
            }),
        })
    }

    /// Retrieve an element, resolving it on a miss.
    ///
    /// The resolver runs outside of the map locks: resolving may reach into
    /// the storage layer, and holding the cache lock across that call is a
    /// known deadlock source between concurrent writer transactions. Misses
    /// on the same key are coalesced: exactly one resolver invocation, every
    /// caller observes the resulting value.
    pub fn get(&self, key: &K) -> V {
        loop {
            if let Some(value) = self.get_if_loaded(key) {
                return value;
            }

            enum Role<V> {
                Owner(Arc<Flight<V>>),
                Waiter(Arc<Flight<V>>),
            }

            let role = {
                let mut inflight = self.inner.inflight.lock();
                match inflight.entry(key.clone()) {
                    Entry::Occupied(e) => Role::Waiter(e.get().clone()),
                    Entry::Vacant(e) => {
                        let flight = Arc::new(Flight::new());
                        e.insert(flight.clone());
                        Role::Owner(flight)
                    }
                }
            };

            match role {
                Role::Waiter(flight) => {
                    let mut state = flight.state.lock();
                    while matches!(*state, FlightState::Pending) {
                        flight.cv.wait(&mut state);
                    }
                    match &*state {
                        FlightState::Ready(value) => return value.clone(),
                        // The owner's resolver panicked; try again.
                        FlightState::Poisoned => continue,
                        FlightState::Pending => unreachable!(),
                    }
                }
                Role::Owner(flight) => {
                    let guard = FlightGuard {
                        inner: &self.inner,
                        key,
                        flight: &flight,
                        completed: false,
                    };

                    // A finished flight may have populated the map between
                    // our miss and taking ownership; resolving again would
                    // break the one-invocation contract.
                    if let Some(value) = self.get_if_loaded(key) {
                        guard.complete(value.clone());
                        return value;
                    }

                    let value = (self.inner.resolver)(key);
                    let value = self.insert_resolved(key, value);
                    guard.complete(value.clone());
                    self.maybe_schedule_capacity_sweep();
                    return value;
                }
            }
        }
    }

    /// Insert a freshly resolved value unless a concurrent path beat us to
    /// it, in which case the already-cached value wins.
    fn insert_resolved(&self, key: &K, value: V) -> V {
        let (value, link) = {
            let mut map = self.inner.map.write();
            match map.entry(key.clone()) {
                Entry::Occupied(e) => (e.get().value.clone(), None),
                Entry::Vacant(e) => {
                    let cell: TokenCell = Arc::new(AtomicUsize::new(0));
                    e.insert(CacheEntry {
                        value: value.clone(),
                        cell: cell.clone(),
                    });
                    (value, Some(cell))
                }
            }
        };
        // Link outside the lock boundary, as with every list task.
        if let Some(cell) = link {
            let inner = self.inner.clone();
            let key = key.clone();
            self.inner
                .queue
                .submit(move || link_entry(&inner, &key, &cell));
        }
        value
    }

    fn maybe_schedule_capacity_sweep(&self) {
        let EvictPolicy::Capacity { max_size, .. } = self.inner.policy else {
            return;
        };
        if self.inner.map.read().len() > max_size {
            let inner = self.inner.clone();
            self.inner.queue.submit(move || sweep(&inner));
        }
    }

    /// Retrieve an element only if it is already cached. Never resolves.
    pub fn get_if_loaded(&self, key: &K) -> Option<V> {
        let hit = {
            let map = self.inner.map.read();
            map.get(key).map(|e| (e.value.clone(), e.cell.clone()))
        };
        // Schedule outside the lock boundary: the move-to-top task runs
        // under the list lock and a paused queue must never be waited upon
        // while a map lock is held.
        hit.map(|(value, cell)| {
            let inner = self.inner.clone();
            self.inner.queue.submit(move || put_on_top(&inner, &cell));
            value
        })
    }

    /// Whether the element with the given key is currently cached.
    pub fn is_loaded(&self, key: &K) -> bool {
        self.inner.map.read().contains_key(key)
    }

    /// Force removal of an element. Generally called when the underlying
    /// data is being removed from permanent storage as well.
    pub fn remove(&self, key: &K) {
        let entry = self.inner.map.write().remove(key);
        if let Some(entry) = entry {
            let inner = self.inner.clone();
            self.inner
                .queue
                .submit(move || unlink_entry(&inner, &entry.cell));
        }
    }

    /// Remove every element. Blocks until the clear has been applied; must
    /// not be called from a maintenance task.
    pub fn clear(&self) {
        self.clear_nonblocking();
        self.inner.queue.drain();
    }

    /// Remove every element without waiting for the clear to be applied.
    pub fn clear_nonblocking(&self) {
        let inner = self.inner.clone();
        self.inner.queue.submit(move || clear_all(&inner));
    }

    /// Number of elements currently cached.
    pub fn size(&self) -> usize {
        self.inner.map.read().len()
    }

    /// The resolver in effect.
    pub fn resolver(&self) -> Arc<dyn Fn(&K) -> V + Send + Sync> {
        self.inner.resolver.clone()
    }

    /// Subscribe this cache to memory pressure notifications.
    ///
    /// Only meaningful with [`EvictPolicy::Pressure`]: when the reported
    /// used-memory fraction exceeds the policy threshold, ordinary
    /// maintenance is paused and a sweep runs synchronously on the
    /// notification thread.
    pub fn attach_monitor(&self, monitor: &Arc<MemoryMonitor>) {
        let EvictPolicy::Pressure { threshold, .. } = self.inner.policy else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let id = monitor.add_listener(Arc::new(move |report| {
            let Some(inner) = weak.upgrade() else { return };
            if report.used_fraction() < threshold {
                return;
            }
            tracing::debug!(
                size = inner.map.read().len(),
                "memory pressure sweep on keyed cache"
            );
            inner.queue.pause();
            sweep(&inner);
            inner.queue.resume();
        }));
        *self.inner.monitor.lock() = Some((monitor.clone(), id));
    }

    /// Detach from the memory monitor. Idempotent.
    pub fn close(&self) {
        if let Some((monitor, id)) = self.inner.monitor.lock().take() {
            monitor.remove_listener(id);
        }
    }
}

/// Guard completing (or poisoning) an in-flight resolution, so a panicking
/// resolver cannot wedge its waiters.
struct FlightGuard<'a, K, V>
where
    K: std::hash::Hash + Eq,
{
    inner: &'a Inner<K, V>,
    key: &'a K,
    flight: &'a Arc<Flight<V>>,
    completed: bool,
}

impl<K, V> FlightGuard<'_, K, V>
where
    K: std::hash::Hash + Eq,
{
    fn complete(mut self, value: V) {
        *self.flight.state.lock() = FlightState::Ready(value);
        self.flight.cv.notify_all();
        self.inner.inflight.lock().remove(self.key);
        self.completed = true;
    }
}

impl<K, V> Drop for FlightGuard<'_, K, V>
where
    K: std::hash::Hash + Eq,
{
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        *self.flight.state.lock() = FlightState::Poisoned;
        self.flight.cv.notify_all();
        self.inner.inflight.lock().remove(self.key);
    }
}

// Maintenance tasks. Each runs on the single maintenance worker (or, for the
// sweep, on the pressure notification thread while the worker is paused), so
// the order state sees no concurrent mutation.

fn put_on_top<K, V>(inner: &Inner<K, V>, cell: &TokenCell) {
    let mut order = inner.order.lock();
    let Some(token) = Token::from_raw(cell.load(Ordering::Acquire)) else {
        return;
    };
    // Already on top, or unlinked by a racing clear: nothing to do.
    if order.list.head() == Some(token) || !order.list.is_linked(token) {
        return;
    }
    if order.cutoff == Some(token) {
        order.cutoff = order.list.prev(token);
    }
    order.list.move_to_head(token);
}

fn link_entry<K, V>(inner: &Inner<K, V>, key: &K, cell: &TokenCell)
where
    K: std::hash::Hash + Eq + Clone,
{
    let mut order = inner.order.lock();
    // The entry could have been removed before we got to link it.
    if !inner.map.read().contains_key(key) {
        return;
    }
    if Token::from_raw(cell.load(Ordering::Acquire)).is_some() {
        return;
    }
    let token = order.list.insert_head((key.clone(), cell.clone()));
    cell.store(token.into_raw(), Ordering::Release);
    adjust_cutoff(&mut order, inner.policy.evict_fraction());
}

fn unlink_entry<K, V>(inner: &Inner<K, V>, cell: &TokenCell) {
    let mut order = inner.order.lock();
    let Some(token) = Token::from_raw(cell.swap(0, Ordering::AcqRel)) else {
        return;
    };
    if order.cutoff == Some(token) {
        order.cutoff = order.list.prev(token);
        order.cutoff_size = order.cutoff_size.saturating_sub(1);
    }
    order.list.remove(token);
}

fn clear_all<K, V>(inner: &Inner<K, V>)
where
    K: std::hash::Hash + Eq,
{
    let mut order = inner.order.lock();
    let mut map = inner.map.write();
    // Invalidate every shared token cell before freeing the slots, so stale
    // tasks cannot act on reused slot ids.
    let mut cursor = order.list.head();
    while let Some(token) = cursor {
        if let Some((_, cell)) = order.list.get(token) {
            cell.store(0, Ordering::Release);
        }
        cursor = order.list.next(token);
    }
    map.clear();
    order.list.clear();
    order.cutoff = None;
    order.cutoff_size = 0;
}

/// Walk the cutoff toward its desired position. O(shift), not O(n).
fn adjust_cutoff<K>(order: &mut OrderState<K>, evict_fraction: f64) {
    if order.cutoff.is_none() {
        order.cutoff = order.list.head();
        order.cutoff_size = order.list.linked_len();
    }
    let Some(mut cutoff) = order.cutoff else {
        return;
    };
    let desired = order.list.linked_len() as f64 * evict_fraction;
    while order.cutoff_size as f64 > desired {
        let Some(next) = order.list.next(cutoff) else {
            break;
        };
        cutoff = next;
        order.cutoff_size -= 1;
    }
    while (order.cutoff_size as f64) < desired {
        let Some(prev) = order.list.prev(cutoff) else {
            break;
        };
        cutoff = prev;
        order.cutoff_size += 1;
    }
    order.cutoff = Some(cutoff);
}

/// Discard the cutoff segment, reacquiring the map write lock per entry so
/// readers interleave with the sweep.
fn sweep<K, V>(inner: &Inner<K, V>)
where
    K: std::hash::Hash + Eq,
{
    let mut order = inner.order.lock();
    if order.list.head().is_none() {
        return;
    }
    adjust_cutoff(&mut order, inner.policy.evict_fraction());

    let mut tokens = Vec::with_capacity(order.cutoff_size);
    let mut cursor = order.cutoff;
    while let Some(token) = cursor {
        tokens.push(token);
        cursor = order.list.next(token);
    }

    let mut evicted = 0usize;
    for token in tokens {
        let Some((key, cell)) = order.list.remove(token) else {
            continue;
        };
        cell.store(0, Ordering::Release);
        let mut map = inner.map.write();
        // The key may have been removed and re-resolved since this node was
        // linked; only discard the entry this node belongs to.
        if map.get(&key).is_some_and(|e| Arc::ptr_eq(&e.cell, &cell)) {
            map.remove(&key);
            evicted += 1;
        }
    }
    order.cutoff = None;
    order.cutoff_size = 0;
    tracing::trace!(evicted, "keyed cache sweep");
}
