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

//! Reclamation-notified atom cache.
//!
//! This strategy lets reference counting decide the eviction policy: an atom
//! is removed from the cache if and only if either (1) the rest of the
//! program drops its last strong reference to the runtime object, or (2) it
//! is explicitly removed from the database. Freezing keeps an atom cached
//! against reclamation, but not against explicit removal.
//!
//! Live handles store weak references; a dedicated cleanup thread waits on a
//! control channel with a bounded poll (so it also observes shutdown
//! promptly) and, on every tick, sweeps handles whose object is gone,
//! notifying observers before unmapping each. A just-read atom is staged in
//! a cold ring of strong references for a while, so it cannot become
//! reclaimable before the caller has had a chance to use it.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use plexus_common::pressure::{ListenerId, MemoryMonitor};

use super::{addr_of, assert_real_handle, AtomMaps, ColdStore, Control, ReclaimConfig};
use crate::{
    error::Result,
    event::EvictionListener,
    handle::{AtomAttrib, HandleKind, LiveHandle, PersistentHandle},
    incidence::IncidenceCache,
};

struct Inner<A> {
    maps: RwLock<AtomMaps<A>>,
    cold: Mutex<ColdStore<A>>,
    /// Strong references pinning frozen atoms against reclamation.
    pinned: Mutex<HashMap<PersistentHandle, Arc<A>>>,
    incidence: RwLock<Option<IncidenceCache>>,
    listener: Arc<dyn EvictionListener<A>>,
    closing: AtomicBool,
    ctl: flume::Sender<Control>,
    monitor: Mutex<Option<(Arc<MemoryMonitor>, ListenerId)>>,
}

/// The reclamation-notified atom cache strategy.
pub struct ReclaimCache<A> {
    inner: Arc<Inner<A>>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl<A> ReclaimCache<A>
where
    A: Send + Sync + 'static,
{
    /// Build the strategy, spawning its cleanup thread.
    pub fn new(config: ReclaimConfig, listener: Arc<dyn EvictionListener<A>>) -> Result<Self> {
        config.validate()?;

        let (ctl, rx) = flume::unbounded();
        let inner = Arc::new(Inner {
            maps: RwLock::new(AtomMaps::new()),
            cold: Mutex::new(ColdStore::new(config.cold_bucket_size, config.cold_buckets)),
            pinned: Mutex::new(HashMap::new()),
            incidence: RwLock::new(None),
            listener,
            closing: AtomicBool::new(false),
            ctl,
            monitor: Mutex::new(None),
        });

        let cleanup = {
            let inner = inner.clone();
            let poll = config.poll_interval;
            std::thread::Builder::new()
                .name("plexus-reclaim-cleanup".to_owned())
                .spawn(move || loop {
                    let trim = match rx.recv_timeout(poll) {
                        Ok(Control::Stop) | Err(flume::RecvTimeoutError::Disconnected) => return,
                        Ok(Control::TrimCold) => true,
                        Err(flume::RecvTimeoutError::Timeout) => false,
                    };
                    // A fault must never kill the cleanup loop: that would
                    // stop all reclamation for the lifetime of the cache.
                    if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        if trim {
                            inner.cold.lock().trim();
                        }
                        sweep_reclaimed(&inner);
                    })) {
                        tracing::error!(
                            "reclamation sweep panicked: {}",
                            plexus_common::queue::panic_message(&e)
                        );
                    }
                })
                .expect("spawn reclamation cleanup thread")
        };

        Ok(Self {
            inner,
            cleanup: Mutex::new(Some(cleanup)),
        })
    }

    /// Look up the live handle of a persistent handle.
    ///
    /// The handle of an atom awaiting reclamation is still returned; its
    /// [`atom`](LiveHandle::atom) reads `None`.
    pub fn get(&self, handle: &PersistentHandle) -> Option<LiveHandle<A>> {
        let live = self.inner.maps.read().get(handle)?;
        live.accessed();
        Some(live)
    }

    /// Look up the live handle of a runtime atom instance.
    pub fn get_by_atom(&self, atom: &Arc<A>) -> Option<LiveHandle<A>> {
        self.inner.maps.read().get_by_addr(addr_of(atom))
    }

    /// Associate an atom instance and a persistent handle with a new live
    /// handle; the atom is staged in the cold ring so it survives at least
    /// until rotated out.
    ///
    /// During shutdown a transient strong handle is produced instead, kept
    /// out of the reclamation machinery entirely.
    ///
    /// # Panics
    ///
    /// Panics on a null handle, or if the persistent handle is resident
    /// with its object still reachable.
    pub fn atom_read(
        &self,
        handle: PersistentHandle,
        atom: Arc<A>,
        attrib: AtomAttrib,
    ) -> LiveHandle<A> {
        assert_real_handle(&handle);

        if self.inner.closing.load(Ordering::Acquire) {
            let live = LiveHandle::transient(handle, &atom, attrib.flags);
            self.inner.maps.write().insert_transient(live.clone());
            return live;
        }

        let live = LiveHandle::weak(handle, &atom, attrib);
        self.insert(live.clone());
        self.inner.cold.lock().add(atom);
        live
    }

    fn insert(&self, live: LiveHandle<A>) {
        // An entry whose object was already reclaimed but which the sweep
        // has not reached yet is not a duplicate: replace it now, with the
        // usual notification first.
        let stale = {
            let mut maps = self.inner.maps.write();
            match maps.get(&live.persistent()) {
                Some(existing) => {
                    assert!(
                        existing.atom().is_none(),
                        "atom {} is already resident",
                        live.persistent()
                    );
                    maps.remove(&existing);
                    Some(existing)
                }
                None => None,
            }
        };
        if let Some(stale) = stale {
            self.inner.listener.on_evict(&stale.persistent(), None);
        }
        self.inner.maps.write().insert(live);
    }

    /// Replace the runtime instance bound to a live handle with a fresh
    /// weak handle.
    ///
    /// `replace` distinguishes a reload from a genuine value change for the
    /// benefit of transaction rollback; without a transaction manager in
    /// scope both paths coincide here.
    pub fn atom_refresh(
        &self,
        handle: &LiveHandle<A>,
        atom: Arc<A>,
        _replace: bool,
    ) -> LiveHandle<A> {
        assert_real_handle(&handle.persistent());

        if self.inner.closing.load(Ordering::Acquire) {
            match handle.kind() {
                HandleKind::Transient => handle.set_atom(&atom),
                HandleKind::Cached => handle.clear_atom(),
            }
            return handle.clone();
        }

        if handle
            .atom()
            .is_some_and(|current| Arc::ptr_eq(&current, &atom))
        {
            // Same atom, nothing to do.
            return handle.clone();
        }

        let new_live = LiveHandle::weak(
            handle.persistent(),
            &atom,
            AtomAttrib {
                flags: handle.flags(),
                retrieval_count: handle.retrieval_count(),
                last_access_time: handle.last_access_time(),
            },
        );
        let old_addr = handle.atom_addr();
        handle.clear_atom();
        self.inner
            .maps
            .write()
            .replace(old_addr, new_live.clone());
        self.inner.cold.lock().add(atom);
        new_live
    }

    /// Force removal of an atom, dropping its pin and cached incidence set
    /// as well.
    pub fn remove(&self, handle: &PersistentHandle) {
        let live = self.inner.maps.write().remove_by_handle(handle);
        let Some(live) = live else { return };

        if let Some(incidence) = self.incidence_cache() {
            incidence.remove(handle);
        }
        self.inner.pinned.lock().remove(handle);
        live.clear_atom();
    }

    /// Pin an atom against reclamation by holding a strong reference for it.
    /// A no-op if the object is already gone.
    pub fn freeze(&self, live: &LiveHandle<A>) {
        if let Some(atom) = live.atom() {
            self.inner.pinned.lock().insert(live.persistent(), atom);
        }
    }

    /// Drop the pin, making the atom reclaimable again.
    pub fn unfreeze(&self, live: &LiveHandle<A>) {
        self.inner.pinned.lock().remove(&live.persistent());
    }

    /// Whether the atom is currently pinned.
    pub fn is_frozen(&self, live: &LiveHandle<A>) -> bool {
        self.inner.pinned.lock().contains_key(&live.persistent())
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

    /// Subscribe the cold staging ring to memory pressure: a notification
    /// asks the cleanup thread to trim it, which is the only thing that
    /// shrinks the ring outside of normal rotation.
    pub fn attach_monitor(&self, monitor: &Arc<MemoryMonitor>) {
        let ctl = self.inner.ctl.clone();
        let id = monitor.add_listener(Arc::new(move |_report| {
            let _ = ctl.send(Control::TrimCold);
        }));
        *self.inner.monitor.lock() = Some((monitor.clone(), id));
    }

    /// Close the cache: join the cleanup thread, notify observers of every
    /// still-resident atom, and clear all bookkeeping. Reads arriving while
    /// closing yield transient handles.
    pub fn close(&self) {
        self.inner.closing.store(true, Ordering::Release);
        let _ = self.inner.ctl.send(Control::Stop);
        if let Some(cleanup) = self.cleanup.lock().take() {
            if cleanup.join().is_err() {
                tracing::error!("reclamation cleanup thread terminated abnormally");
            }
        }
        if let Some((monitor, id)) = self.inner.monitor.lock().take() {
            monitor.remove_listener(id);
        }
        self.inner.pinned.lock().clear();
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
        self.inner.cold.lock().clear();
    }
}

/// One cleanup tick: drop every cached entry whose runtime object has been
/// reclaimed, notifying observers first.
fn sweep_reclaimed<A: 'static>(inner: &Inner<A>) {
    let dead: Vec<_> = inner
        .maps
        .read()
        .handles()
        .filter(|live| live.kind() == HandleKind::Cached && live.atom().is_none())
        .cloned()
        .collect();
    if dead.is_empty() {
        return;
    }

    let mut reclaimed = 0usize;
    for live in &dead {
        // A re-read may have replaced the entry since it was collected.
        let current = inner.maps.read().get(&live.persistent());
        if !current.is_some_and(|c| c.ptr_eq(live)) {
            continue;
        }
        // Observers run before the entry is unmapped.
        inner.listener.on_evict(&live.persistent(), None);
        inner.maps.write().remove(live);
        reclaimed += 1;
    }
    tracing::trace!(reclaimed, "reclamation sweep");
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    struct Recorder {
        evictions: Mutex<Vec<(PersistentHandle, bool)>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                evictions: Mutex::new(Vec::new()),
            })
        }

        fn contains(&self, handle: &PersistentHandle) -> bool {
            self.evictions.lock().iter().any(|(h, _)| h == handle)
        }
    }

    impl EvictionListener<String> for Recorder {
        fn on_evict(&self, handle: &PersistentHandle, atom: Option<&Arc<String>>) {
            self.evictions.lock().push((*handle, atom.is_some()));
        }
    }

    fn tiny_cache() -> (ReclaimCache<String>, Arc<Recorder>) {
        let recorder = Recorder::new();
        let cache = ReclaimCache::new(
            ReclaimConfig {
                poll_interval: Duration::from_millis(10),
                // A one-slot ring, so staging rotates out almost immediately.
                cold_bucket_size: 1,
                cold_buckets: 1,
            },
            recorder.clone(),
        )
        .unwrap();
        (cache, recorder)
    }

    fn atom(text: &str) -> Arc<String> {
        Arc::new(text.to_owned())
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_round_trip_while_referenced() {
        let (cache, _) = tiny_cache();
        let h = PersistentHandle::generate();
        let a = atom("a");
        let live = cache.atom_read(h, a.clone(), AtomAttrib::default());

        assert!(cache.get(&h).unwrap().ptr_eq(&live));
        assert!(cache.get_by_atom(&a).unwrap().ptr_eq(&live));
        assert!(Arc::ptr_eq(&live.atom().unwrap(), &a));
        cache.close();
    }

    #[test_log::test]
    fn test_dropping_last_reference_reclaims_entry() {
        let (cache, recorder) = tiny_cache();
        let h = PersistentHandle::generate();
        let a = atom("short-lived");
        cache.atom_read(h, a.clone(), AtomAttrib::default());

        // Rotate the atom out of the one-slot cold ring.
        cache.atom_read(
            PersistentHandle::generate(),
            atom("rotator"),
            AtomAttrib::default(),
        );

        drop(a);
        assert!(
            wait_until(Duration::from_secs(2), || cache.get(&h).is_none()),
            "reclaimed atom was not swept"
        );
        // The notification carried no object: it is gone by definition.
        let evictions = recorder.evictions.lock();
        assert!(evictions.iter().any(|(eh, had)| eh == &h && !had));
        drop(evictions);
        cache.close();
    }

    #[test]
    fn test_frozen_atom_survives_reclamation() {
        let (cache, recorder) = tiny_cache();
        let h = PersistentHandle::generate();
        let a = atom("pinned");
        let live = cache.atom_read(h, a.clone(), AtomAttrib::default());

        cache.freeze(&live);
        assert!(cache.is_frozen(&live));
        cache.atom_read(
            PersistentHandle::generate(),
            atom("rotator"),
            AtomAttrib::default(),
        );
        drop(a);

        // The pin is the only strong reference left; the atom stays.
        std::thread::sleep(Duration::from_millis(100));
        assert!(cache.get(&h).is_some());
        assert!(cache.get(&h).unwrap().atom().is_some());
        assert!(!recorder.contains(&h));

        cache.unfreeze(&live);
        assert!(!cache.is_frozen(&live));
        assert!(
            wait_until(Duration::from_secs(2), || cache.get(&h).is_none()),
            "unfrozen atom was not reclaimed"
        );
        cache.close();
    }

    #[test]
    fn test_cold_ring_delays_reclamation() {
        let recorder = Recorder::new();
        let cache = ReclaimCache::new(
            ReclaimConfig {
                poll_interval: Duration::from_millis(10),
                cold_bucket_size: 16,
                cold_buckets: 2,
            },
            recorder.clone(),
        )
        .unwrap();

        let h = PersistentHandle::generate();
        let a = atom("staged");
        cache.atom_read(h, a.clone(), AtomAttrib::default());
        drop(a);

        // Still staged: the ring holds a strong reference.
        std::thread::sleep(Duration::from_millis(100));
        assert!(cache.get(&h).unwrap().atom().is_some());
        cache.close();
    }

    #[test]
    fn test_reread_after_reclamation_is_not_a_duplicate() {
        let (cache, _) = tiny_cache();
        let h = PersistentHandle::generate();
        let a = atom("first");
        cache.atom_read(h, a.clone(), AtomAttrib::default());
        cache.atom_read(
            PersistentHandle::generate(),
            atom("rotator"),
            AtomAttrib::default(),
        );
        drop(a);

        // Whether or not the sweep has caught up, re-reading the atom from
        // storage must succeed once its object is gone.
        let live = cache.atom_read(h, atom("second"), AtomAttrib::default());
        assert_eq!(live.atom().unwrap().as_str(), "second");
        assert!(cache.get(&h).unwrap().ptr_eq(&live));
        cache.close();
    }

    #[test]
    #[should_panic(expected = "already resident")]
    fn test_duplicate_read_of_reachable_atom_panics() {
        let (cache, _) = tiny_cache();
        let h = PersistentHandle::generate();
        let a = atom("held");
        cache.atom_read(h, a.clone(), AtomAttrib::default());
        cache.atom_read(h, atom("dup"), AtomAttrib::default());
    }

    #[test]
    fn test_refresh_rebinds_reverse_map() {
        let (cache, _) = tiny_cache();
        let h = PersistentHandle::generate();
        let first = atom("v1");
        let live = cache.atom_read(h, first.clone(), AtomAttrib::default());

        let second = atom("v2");
        let refreshed = cache.atom_refresh(&live, second.clone(), true);
        assert!(!refreshed.ptr_eq(&live));
        assert_eq!(refreshed.persistent(), h);
        assert!(cache.get_by_atom(&second).unwrap().ptr_eq(&refreshed));
        assert!(cache.get_by_atom(&first).is_none());
        // The superseded handle's reference was cleared.
        assert!(live.atom().is_none());

        // Refreshing with the same instance is a no-op.
        let same = cache.atom_refresh(&refreshed, second.clone(), false);
        assert!(same.ptr_eq(&refreshed));
        cache.close();
    }

    #[test]
    fn test_transient_reads_during_close() {
        let (cache, recorder) = tiny_cache();
        let resident = PersistentHandle::generate();
        let kept = atom("resident");
        cache.atom_read(resident, kept.clone(), AtomAttrib::default());
        cache.close();

        // Shutdown bookkeeping still reads atoms; those handles stay out of
        // the reclamation machinery and keep their object alive.
        let h = PersistentHandle::generate();
        let a = atom("cleanup-read");
        let live = cache.atom_read(h, a.clone(), AtomAttrib::default());
        assert_eq!(live.kind(), HandleKind::Transient);
        assert!(cache.get_by_atom(&a).unwrap().ptr_eq(&live));
        assert!(cache.get(&h).is_none());

        // Close dispatched an event for the formerly resident atom, with
        // its object still readable.
        let evictions = recorder.evictions.lock();
        assert!(evictions.iter().any(|(eh, had)| eh == &resident && *had));
    }

    #[test]
    fn test_remove_drops_pin() {
        let (cache, _) = tiny_cache();
        let h = PersistentHandle::generate();
        let a = atom("a");
        let live = cache.atom_read(h, a.clone(), AtomAttrib::default());
        cache.freeze(&live);

        cache.remove(&h);
        assert!(cache.get(&h).is_none());
        assert!(!cache.is_frozen(&live));
        assert!(live.atom().is_none());
        cache.close();
    }
}
