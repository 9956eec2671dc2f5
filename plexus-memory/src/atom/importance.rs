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

//! Importance-weighted atom cache.
//!
//! Maintains per-handle usage statistics and process-wide aggregates, scores
//! every resident atom by a weighted combination of access frequency and
//! recency, and keeps one list of all handles approximately ordered by that
//! score. The per-atom overhead is noticeable, but the importance-based
//! eviction is accurate; this strategy pays off when atoms are relatively
//! large.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::{Mutex, RwLock};
use plexus_common::queue::MaintenanceQueue;

use super::{addr_of, assert_real_handle, AtomMaps, ImportanceConfig};
use crate::{
    error::Result,
    event::EvictionListener,
    handle::{now_millis, AtomAttrib, LiveHandle, PersistentHandle},
    incidence::IncidenceCache,
    order::OrderList,
};

/// Process-wide access aggregates feeding the importance score.
struct Totals {
    retrievals: AtomicU64,
    last_access: AtomicU64,
}

impl Totals {
    fn new() -> Self {
        Self {
            retrievals: AtomicU64::new(0),
            last_access: AtomicU64::new(now_millis()),
        }
    }

    fn bump(&self) {
        self.retrievals.fetch_add(1, Ordering::Relaxed);
        self.last_access.store(now_millis(), Ordering::Relaxed);
    }

    fn snapshot(&self) -> (u64, u64) {
        (
            self.retrievals.load(Ordering::Relaxed).max(1),
            self.last_access.load(Ordering::Relaxed).max(1),
        )
    }
}

struct Inner<A> {
    maps: RwLock<AtomMaps<A>>,
    // Mutated by maintenance tasks only. Lock order: `order` before `maps`.
    order: Mutex<OrderList<LiveHandle<A>>>,
    totals: Totals,
    config: ImportanceConfig,
    queue: Arc<MaintenanceQueue>,
    listener: Arc<dyn EvictionListener<A>>,
    incidence: RwLock<Option<IncidenceCache>>,
}

/// The statistics-weighted atom cache strategy.
///
/// The eviction list orders handles by importance, the tail being least
/// important. Every access schedules a bounded bubble of the accessed entry
/// toward the head; large importance jumps are rare relative to steady
/// accesses, so the bubble stays short in practice. Insertion always
/// succeeds; reaching the cap only schedules an asynchronous sweep of
/// roughly 10% of the tail.
pub struct ImportanceCache<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for ImportanceCache<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A> ImportanceCache<A>
where
    A: Send + Sync + 'static,
{
    /// Build the strategy over the environment's maintenance queue.
    pub fn new(
        config: ImportanceConfig,
        queue: Arc<MaintenanceQueue>,
        listener: Arc<dyn EvictionListener<A>>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                maps: RwLock::new(AtomMaps::new()),
                order: Mutex::new(OrderList::new()),
                totals: Totals::new(),
                config,
                queue,
                listener,
                incidence: RwLock::new(None),
            }),
        })
    }

    /// Look up the live handle of a persistent handle, recording the access.
    pub fn get(&self, handle: &PersistentHandle) -> Option<LiveHandle<A>> {
        let live = self.inner.maps.read().get(handle)?;
        self.touch(&live);
        Some(live)
    }

    /// Look up the live handle of a runtime atom instance.
    pub fn get_by_atom(&self, atom: &Arc<A>) -> Option<LiveHandle<A>> {
        let live = self.inner.maps.read().get_by_addr(addr_of(atom))?;
        self.touch(&live);
        Some(live)
    }

    fn touch(&self, live: &LiveHandle<A>) {
        live.accessed();
        self.inner.totals.bump();
        let inner = self.inner.clone();
        let live = live.clone();
        self.inner.queue.submit(move || bubble(&inner, &live));
    }

    /// Associate an atom instance and a persistent handle with a new live
    /// handle.
    ///
    /// # Panics
    ///
    /// Panics on a null handle or if the persistent handle is already
    /// resident; rebinding a resident atom is the job of
    /// [`atom_refresh`](Self::atom_refresh).
    pub fn atom_read(
        &self,
        handle: PersistentHandle,
        atom: Arc<A>,
        attrib: AtomAttrib,
    ) -> LiveHandle<A> {
        assert_real_handle(&handle);
        let live = LiveHandle::strong(handle, &atom, attrib);
        self.insert(live.clone());
        live
    }

    /// Always admits; frees space asynchronously when the cap is reached.
    fn insert(&self, live: LiveHandle<A>) {
        let evict = {
            let mut maps = self.inner.maps.write();
            let resident = maps.len();
            maps.insert(live.clone());
            (resident >= self.inner.config.max_atoms).then(|| (resident / 10).max(1))
        };

        if let Some(count) = evict {
            // The sweep is queued before the attach, so the fresh entry is
            // not part of the swept tail; the queue is hurried along since
            // piling up sweep requests without giving eviction a chance to
            // run would only grow the backlog.
            let inner = self.inner.clone();
            self.inner.queue.submit(move || evict_tail(&inner, count));
            self.inner.queue.expedite();
        }

        let inner = self.inner.clone();
        self.inner.queue.submit(move || attach(&inner, &live));
    }

    /// Replace the runtime instance bound to a live handle.
    ///
    /// If the handle is still resident the object is swapped in place; a
    /// handle that was evicted in the meantime is re-admitted carrying the
    /// new instance.
    pub fn atom_refresh(
        &self,
        handle: &LiveHandle<A>,
        atom: Arc<A>,
        _replace: bool,
    ) -> LiveHandle<A> {
        assert_real_handle(&handle.persistent());

        let existing = {
            let mut maps = self.inner.maps.write();
            match maps.get(&handle.persistent()) {
                Some(existing) => {
                    maps.rebind(&existing, &atom);
                    Some(existing)
                }
                None => None,
            }
        };
        match existing {
            Some(existing) => existing,
            None => {
                handle.set_atom(&atom);
                self.insert(handle.clone());
                handle.clone()
            }
        }
    }

    /// Remove a live handle and all its associations from the cache.
    pub fn remove(&self, handle: &PersistentHandle) {
        let live = self.inner.maps.write().remove_by_handle(handle);
        let Some(live) = live else { return };

        if let Some(incidence) = self.incidence_cache() {
            incidence.remove(handle);
        }
        let inner = self.inner.clone();
        let detached = live.clone();
        self.inner.queue.submit(move || detach(&inner, &detached));
        live.clear_atom();
    }

    /// Pin an atom: detach it from the eviction list without removing it
    /// from the maps. Takes effect once the detach task has run.
    pub fn freeze(&self, live: &LiveHandle<A>) {
        let inner = self.inner.clone();
        let live = live.clone();
        self.inner.queue.submit(move || detach(&inner, &live));
    }

    /// Re-admit a frozen atom to eviction eligibility.
    pub fn unfreeze(&self, live: &LiveHandle<A>) {
        let inner = self.inner.clone();
        let live = live.clone();
        self.inner.queue.submit(move || attach(&inner, &live));
    }

    /// A handle is frozen iff it currently holds no eviction-list slot while
    /// still being map-resident.
    pub fn is_frozen(&self, live: &LiveHandle<A>) -> bool {
        live.order_token().is_none() && self.inner.maps.read().contains(&live.persistent())
    }

    /// Number of resident atoms.
    pub fn len(&self) -> usize {
        self.inner.maps.read().len()
    }

    /// Wire the incidence sub-cache.
    pub fn set_incidence_cache(&self, cache: IncidenceCache) {
        *self.inner.incidence.write() = Some(cache);
    }

    /// The incidence sub-cache, if wired.
    pub fn incidence_cache(&self) -> Option<IncidenceCache> {
        self.inner.incidence.read().clone()
    }

    /// Close the cache: settle pending maintenance, notify observers of
    /// every still-resident atom, and clear all bookkeeping.
    pub fn close(&self) {
        self.inner.queue.drain();
        if let Some(incidence) = self.inner.incidence.write().take() {
            incidence.clear();
            incidence.close();
        }
        let drained = self.inner.maps.write().drain();
        for live in &drained {
            let atom = live.atom();
            self.inner.listener.on_evict(&live.persistent(), atom.as_ref());
            live.clear_atom();
        }
        let mut order = self.inner.order.lock();
        for live in &drained {
            live.set_order_token(None);
        }
        order.clear();
    }

    /// Schedule a sweep of atoms nobody outside the cache references
    /// anymore. Used by the hybrid strategy's cleanup tick.
    pub(crate) fn schedule_idle_sweep(&self) {
        let inner = self.inner.clone();
        self.inner.queue.submit(move || idle_sweep(&inner));
    }
}

fn importance<A>(config: &ImportanceConfig, totals: (u64, u64), live: &LiveHandle<A>) -> f64 {
    let (total_retrievals, global_last_access) = totals;
    config.retrieval_weight * (live.retrieval_count() as f64 / total_retrievals as f64)
        + config.recency_weight * (live.last_access_time() as f64 / global_last_access as f64)
}

// Maintenance tasks; all run on the single maintenance worker.

/// Walk an accessed entry headward while its importance exceeds its
/// neighbor's. A bounded bubble, not a full re-sort: entries rarely jump far
/// in one step, and insertions are rare compared to accesses.
fn bubble<A>(inner: &Inner<A>, live: &LiveHandle<A>) {
    let mut order = inner.order.lock();
    let Some(token) = live.order_token() else {
        // Frozen or evicted in the meantime.
        return;
    };
    if !order.is_linked(token) {
        return;
    }
    let totals = inner.totals.snapshot();
    let score = importance(&inner.config, totals, live);
    while let Some(ahead) = order.prev(token) {
        let Some(other) = order.get(ahead) else { break };
        if score > importance(&inner.config, totals, other) {
            order.promote(token);
        } else {
            break;
        }
    }
}

/// Link a handle at the tail and let it bubble toward its importance rank.
fn attach<A>(inner: &Inner<A>, live: &LiveHandle<A>) {
    let mut order = inner.order.lock();
    if live.order_token().is_some() {
        return;
    }
    // It could have been removed before we got to link it.
    if !inner.maps.read().contains(&live.persistent()) {
        return;
    }
    let token = order.insert_tail(live.clone());
    live.set_order_token(Some(token));
    drop(order);
    bubble(inner, live);
}

/// Unlink a handle from the eviction list, freeing its slot. The maps are
/// left untouched: detaching serves both freeze and removal.
fn detach<A>(inner: &Inner<A>, live: &LiveHandle<A>) {
    let mut order = inner.order.lock();
    if let Some(token) = live.order_token() {
        order.remove(token);
        live.set_order_token(None);
    }
}

/// Evict up to `count` entries from the least important end.
fn evict_tail<A: 'static>(inner: &Inner<A>, count: usize) {
    let mut evicted = 0usize;
    for _ in 0..count {
        let live = {
            let mut order = inner.order.lock();
            let Some(token) = order.tail() else { break };
            let Some(live) = order.get(token).cloned() else {
                break;
            };
            order.remove(token);
            live.set_order_token(None);
            live
        };
        if evict_entry(inner, &live) {
            evicted += 1;
        }
    }
    tracing::trace!(evicted, "importance cache sweep");
}

/// Evict every linked entry whose only remaining strong reference is the
/// cache's own. Scheduled by the hybrid strategy.
fn idle_sweep<A: 'static>(inner: &Inner<A>) {
    let residents: Vec<_> = inner.maps.read().handles().cloned().collect();
    for live in residents {
        // A detached (frozen) handle is exempt.
        if live.order_token().is_none() {
            continue;
        }
        let Some(atom) = live.atom() else { continue };
        // Two strong refs: the handle's own plus the probe above. Anything
        // beyond that is an external holder or the cold staging ring.
        if Arc::strong_count(&atom) > 2 {
            continue;
        }
        detach(inner, &live);
        evict_entry(inner, &live);
    }
}

/// Remove an entry from both maps and notify observers before discarding
/// the object reference. Returns false if the entry was no longer resident.
fn evict_entry<A: 'static>(inner: &Inner<A>, live: &LiveHandle<A>) -> bool {
    if inner.maps.write().remove(live).is_none() {
        return false;
    }
    let atom = live.atom();
    inner.listener.on_evict(&live.persistent(), atom.as_ref());
    live.clear_atom();
    true
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;
    use crate::event::NoopListener;

    struct Recorder {
        evictions: Mutex<Vec<(PersistentHandle, bool)>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                evictions: Mutex::new(Vec::new()),
            })
        }
    }

    impl EvictionListener<String> for Recorder {
        fn on_evict(&self, handle: &PersistentHandle, atom: Option<&Arc<String>>) {
            self.evictions.lock().push((*handle, atom.is_some()));
        }
    }

    fn cache(
        queue: &Arc<MaintenanceQueue>,
        max_atoms: usize,
    ) -> (ImportanceCache<String>, Arc<Recorder>) {
        let recorder = Recorder::new();
        let cache = ImportanceCache::new(
            ImportanceConfig {
                max_atoms,
                ..Default::default()
            },
            queue.clone(),
            recorder.clone(),
        )
        .unwrap();
        (cache, recorder)
    }

    fn atom(text: &str) -> Arc<String> {
        Arc::new(text.to_owned())
    }

    #[test]
    fn test_round_trip() {
        let queue = MaintenanceQueue::start("imp-roundtrip");
        let (cache, _) = cache(&queue, 100);

        let h = PersistentHandle::generate();
        let a = atom("a");
        let live = cache.atom_read(h, a.clone(), AtomAttrib::default());

        let by_handle = cache.get(&h).unwrap();
        assert!(by_handle.ptr_eq(&live));
        assert!(Arc::ptr_eq(&by_handle.atom().unwrap(), &a));

        let by_atom = cache.get_by_atom(&a).unwrap();
        assert!(by_atom.ptr_eq(&live));

        assert!(cache.get(&PersistentHandle::generate()).is_none());
        cache.close();
        queue.stop();
    }

    #[test]
    fn test_unique_live_handle_per_persistent_handle() {
        let queue = MaintenanceQueue::start("imp-unique");
        let (cache, _) = cache(&queue, 100);

        let h = PersistentHandle::generate();
        let live = cache.atom_read(h, atom("v1"), AtomAttrib::default());
        // Repeated lookups and refreshes never mint a second live handle.
        let refreshed = cache.atom_refresh(&live, atom("v2"), true);
        assert!(refreshed.ptr_eq(&live));
        assert!(cache.get(&h).unwrap().ptr_eq(&live));
        assert_eq!(cache.len(), 1);
        assert_eq!(live.atom().unwrap().as_str(), "v2");
        cache.close();
        queue.stop();
    }

    #[test]
    #[should_panic(expected = "already resident")]
    fn test_duplicate_atom_read_panics() {
        let queue = MaintenanceQueue::start("imp-dup");
        let (cache, _) = cache(&queue, 100);
        let h = PersistentHandle::generate();
        cache.atom_read(h, atom("a"), AtomAttrib::default());
        cache.atom_read(h, atom("b"), AtomAttrib::default());
    }

    #[test]
    #[should_panic(expected = "null persistent handle")]
    fn test_nil_handle_panics() {
        let queue = MaintenanceQueue::start("imp-nil");
        let (cache, _) = cache(&queue, 100);
        cache.atom_read(PersistentHandle::nil(), atom("a"), AtomAttrib::default());
    }

    #[test]
    fn test_eviction_respects_cap() {
        let queue = MaintenanceQueue::start("imp-cap");
        let (cache, recorder) = cache(&queue, 3);

        let handles = (0..4).map(|_| PersistentHandle::generate()).collect_vec();
        for (i, h) in handles.iter().enumerate() {
            cache.atom_read(*h, atom(&format!("atom-{i}")), AtomAttrib::default());
            queue.drain();
            assert!(cache.len() <= 3, "resident count {} exceeds cap", cache.len());
        }

        // Exactly one of the first three was evicted; the fresh insert and
        // the two survivors remain.
        let evictions = recorder.evictions.lock();
        assert_eq!(evictions.len(), 1);
        assert!(handles[..3].contains(&evictions[0].0));
        // The evict event carried the object, dispatched before the ref was
        // discarded.
        assert!(evictions[0].1);
        drop(evictions);

        assert!(cache.get(&handles[3]).is_some());
        assert_eq!(cache.len(), 3);
        cache.close();
        queue.stop();
    }

    #[test]
    fn test_least_important_evicted_first() {
        let queue = MaintenanceQueue::start("imp-order");
        let (cache, recorder) = cache(&queue, 4);

        let handles = (0..4).map(|_| PersistentHandle::generate()).collect_vec();
        for (i, h) in handles.iter().enumerate() {
            cache.atom_read(*h, atom(&format!("atom-{i}")), AtomAttrib::default());
            queue.drain();
        }
        // Heavily access everything but handles[1].
        for _ in 0..5 {
            for (i, h) in handles.iter().enumerate() {
                if i != 1 {
                    cache.get(h);
                }
            }
            queue.drain();
        }

        // The next insert trips the cap.
        cache.atom_read(
            PersistentHandle::generate(),
            atom("fresh"),
            AtomAttrib::default(),
        );
        queue.drain();

        let evictions = recorder.evictions.lock();
        assert_eq!(evictions.len(), 1);
        assert_eq!(evictions[0].0, handles[1]);
        drop(evictions);
        cache.close();
        queue.stop();
    }

    #[test]
    fn test_freeze_exempts_from_eviction() {
        let queue = MaintenanceQueue::start("imp-freeze");
        let (cache, recorder) = cache(&queue, 3);

        let frozen_handle = PersistentHandle::generate();
        let frozen = cache.atom_read(frozen_handle, atom("frozen"), AtomAttrib::default());
        queue.drain();

        cache.freeze(&frozen);
        queue.drain();
        assert!(cache.is_frozen(&frozen));

        // Give it the lowest importance imaginable, then overflow the cache.
        for i in 0..8 {
            cache.atom_read(
                PersistentHandle::generate(),
                atom(&format!("filler-{i}")),
                AtomAttrib::default(),
            );
            queue.drain();
        }
        assert!(
            !recorder
                .evictions
                .lock()
                .iter()
                .any(|(h, _)| *h == frozen_handle),
            "frozen atom was swept"
        );
        assert!(cache.get(&frozen_handle).is_some());

        // Unfreezing re-admits it to normal eligibility.
        cache.unfreeze(&frozen);
        queue.drain();
        assert!(!cache.is_frozen(&frozen));
        assert!(frozen.order_token().is_some());

        cache.close();
        queue.stop();
    }

    #[test]
    fn test_remove_drops_all_associations() {
        let queue = MaintenanceQueue::start("imp-remove");
        let (cache, recorder) = cache(&queue, 100);
        let incidence = IncidenceCache::new(
            |_h: &PersistentHandle| crate::incidence::IncidenceSet::empty(),
            crate::keyed::EvictPolicy::Capacity {
                max_size: 10,
                evict_count: 1,
            },
            queue.clone(),
        )
        .unwrap();
        cache.set_incidence_cache(incidence.clone());

        let h = PersistentHandle::generate();
        let a = atom("a");
        let live = cache.atom_read(h, a.clone(), AtomAttrib::default());
        incidence.get(&h);
        queue.drain();
        assert!(incidence.is_loaded(&h));

        cache.remove(&h);
        queue.drain();
        assert!(cache.get(&h).is_none());
        assert!(cache.get_by_atom(&a).is_none());
        assert!(!incidence.is_loaded(&h));
        // The handle survives as an identifier; its ref is gone. Explicit
        // removal is deletion, not eviction: no event fires.
        assert!(live.atom().is_none());
        assert!(recorder.evictions.lock().is_empty());

        // Removing an absent handle is fine.
        cache.remove(&h);
        cache.close();
        queue.stop();
    }

    #[test]
    fn test_close_dispatches_evictions() {
        let queue = MaintenanceQueue::start("imp-close");
        let (cache, recorder) = cache(&queue, 100);
        let handles = (0..5).map(|_| PersistentHandle::generate()).collect_vec();
        for (i, h) in handles.iter().enumerate() {
            cache.atom_read(*h, atom(&format!("atom-{i}")), AtomAttrib::default());
        }
        cache.close();

        let evictions = recorder.evictions.lock();
        assert_eq!(evictions.len(), 5);
        assert!(evictions.iter().all(|(_, had_atom)| *had_atom));
        drop(evictions);
        assert_eq!(cache.len(), 0);
        queue.stop();
    }

    #[test]
    fn test_refresh_of_evicted_handle_readmits() {
        let queue = MaintenanceQueue::start("imp-refresh");
        let (cache, _) = cache(&queue, 100);

        let h = PersistentHandle::generate();
        let live = cache.atom_read(h, atom("v1"), AtomAttrib::default());
        queue.drain();
        cache.remove(&h);
        queue.drain();
        assert!(cache.get(&h).is_none());

        let readmitted = cache.atom_refresh(&live, atom("v2"), false);
        queue.drain();
        assert!(readmitted.ptr_eq(&live));
        assert_eq!(cache.get(&h).unwrap().atom().unwrap().as_str(), "v2");
        cache.close();
        queue.stop();
    }

    #[test]
    fn test_access_keeps_statistics_flowing() {
        let queue = MaintenanceQueue::start("imp-stats");
        let (cache, _) = cache(&queue, 100);
        let h = PersistentHandle::generate();
        let live = cache.atom_read(h, atom("a"), AtomAttrib::default());
        let before = live.retrieval_count();
        for _ in 0..3 {
            cache.get(&h);
        }
        assert_eq!(live.retrieval_count(), before + 3);
        queue.drain();
        cache.close();
        queue.stop();
    }

    // Keep the listener generic parameter honest for non-String atoms too.
    #[test]
    fn test_noop_listener_compiles_for_any_atom() {
        let queue = MaintenanceQueue::start("imp-noop");
        let cache: ImportanceCache<Vec<u8>> = ImportanceCache::new(
            ImportanceConfig::default(),
            queue.clone(),
            Arc::new(NoopListener),
        )
        .unwrap();
        let h = PersistentHandle::generate();
        cache.atom_read(h, Arc::new(vec![1, 2, 3]), AtomAttrib::default());
        assert_eq!(cache.len(), 1);
        cache.close();
        queue.stop();
    }

    #[test]
    fn test_idle_sweep_reclaims_unreferenced() {
        let queue = MaintenanceQueue::start("imp-idle");
        let (cache, recorder) = cache(&queue, 100);

        let kept_handle = PersistentHandle::generate();
        let kept = atom("kept");
        cache.atom_read(kept_handle, kept.clone(), AtomAttrib::default());

        let dropped_handle = PersistentHandle::generate();
        cache.atom_read(dropped_handle, atom("dropped"), AtomAttrib::default());
        queue.drain();

        cache.schedule_idle_sweep();
        queue.drain();

        // The atom still held externally survives; the other is reclaimed.
        assert!(cache.get(&kept_handle).is_some());
        assert!(cache.get(&dropped_handle).is_none());
        let evictions = recorder.evictions.lock();
        assert_eq!(evictions.len(), 1);
        assert_eq!(evictions[0].0, dropped_handle);
        drop(evictions);
        cache.close();
        queue.stop();
    }
}
