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

//! Hybrid atom cache.
//!
//! Strong references and importance-ordered capacity sweeps as in the
//! importance strategy, plus a reclamation tick: atoms whose only remaining
//! strong reference is the cache's own (every external holder gone and the
//! atom aged out of the cold staging ring) are dropped between capacity
//! sweeps. Unlike the reclamation-notified strategy, an eviction observer
//! here can still read the object being discarded.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use parking_lot::Mutex;
use plexus_common::{
    pressure::{ListenerId, MemoryMonitor},
    queue::MaintenanceQueue,
};

use super::{ColdStore, Control, HybridConfig, ImportanceCache};
use crate::{
    error::Result,
    event::EvictionListener,
    handle::{AtomAttrib, LiveHandle, PersistentHandle},
    incidence::IncidenceCache,
};

struct Shared<A> {
    cold: Mutex<ColdStore<A>>,
    ctl: flume::Sender<Control>,
    closing: AtomicBool,
    monitor: Mutex<Option<(Arc<MemoryMonitor>, ListenerId)>>,
}

/// The hybrid atom cache strategy.
pub struct HybridCache<A> {
    core: ImportanceCache<A>,
    shared: Arc<Shared<A>>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl<A> HybridCache<A>
where
    A: Send + Sync + 'static,
{
    /// Build the strategy over the environment's maintenance queue,
    /// spawning its cleanup thread.
    pub fn new(
        config: HybridConfig,
        queue: Arc<MaintenanceQueue>,
        listener: Arc<dyn EvictionListener<A>>,
    ) -> Result<Self> {
        let core = ImportanceCache::new(config.importance, queue, listener)?;
        config.reclaim.validate()?;

        let (ctl, rx) = flume::unbounded();
        let shared = Arc::new(Shared {
            cold: Mutex::new(ColdStore::new(
                config.reclaim.cold_bucket_size,
                config.reclaim.cold_buckets,
            )),
            ctl,
            closing: AtomicBool::new(false),
            monitor: Mutex::new(None),
        });

        let cleanup = {
            let shared = shared.clone();
            let core = core.clone();
            let poll = config.reclaim.poll_interval;
            std::thread::Builder::new()
                .name("plexus-hybrid-cleanup".to_owned())
                .spawn(move || loop {
                    match rx.recv_timeout(poll) {
                        Ok(Control::Stop) | Err(flume::RecvTimeoutError::Disconnected) => return,
                        Ok(Control::TrimCold) => shared.cold.lock().trim(),
                        Err(flume::RecvTimeoutError::Timeout) => {}
                    }
                    // The sweep itself runs as a maintenance task, keeping
                    // list mutation on the single worker.
                    core.schedule_idle_sweep();
                })
                .expect("spawn hybrid cleanup thread")
        };

        Ok(Self {
            core,
            shared,
            cleanup: Mutex::new(Some(cleanup)),
        })
    }

    /// Look up the live handle of a persistent handle, recording the access.
    pub fn get(&self, handle: &PersistentHandle) -> Option<LiveHandle<A>> {
        self.core.get(handle)
    }

    /// Look up the live handle of a runtime atom instance.
    pub fn get_by_atom(&self, atom: &Arc<A>) -> Option<LiveHandle<A>> {
        self.core.get_by_atom(atom)
    }

    /// Associate an atom instance and a persistent handle with a new live
    /// handle, staging the atom so it is not reclaimed before first use.
    pub fn atom_read(
        &self,
        handle: PersistentHandle,
        atom: Arc<A>,
        attrib: AtomAttrib,
    ) -> LiveHandle<A> {
        let live = self.core.atom_read(handle, atom.clone(), attrib);
        if !self.shared.closing.load(Ordering::Acquire) {
            self.shared.cold.lock().add(atom);
        }
        live
    }

    /// Replace the runtime instance bound to a live handle.
    pub fn atom_refresh(
        &self,
        handle: &LiveHandle<A>,
        atom: Arc<A>,
        replace: bool,
    ) -> LiveHandle<A> {
        let live = self.core.atom_refresh(handle, atom.clone(), replace);
        if !self.shared.closing.load(Ordering::Acquire) {
            self.shared.cold.lock().add(atom);
        }
        live
    }

    /// Force removal of an atom.
    pub fn remove(&self, handle: &PersistentHandle) {
        self.core.remove(handle);
    }

    /// Pin an atom: exempt from both capacity sweeps and reclamation.
    pub fn freeze(&self, live: &LiveHandle<A>) {
        self.core.freeze(live);
    }

    /// Re-admit a frozen atom.
    pub fn unfreeze(&self, live: &LiveHandle<A>) {
        self.core.unfreeze(live);
    }

    /// Whether the atom is currently frozen.
    pub fn is_frozen(&self, live: &LiveHandle<A>) -> bool {
        self.core.is_frozen(live)
    }

    /// Number of resident atoms.
    pub fn len(&self) -> usize {
        self.core.len()
    }

    /// Wire the incidence sub-cache.
    pub fn set_incidence_cache(&self, cache: IncidenceCache) {
        self.core.set_incidence_cache(cache);
    }

    /// The incidence sub-cache, if wired.
    pub fn incidence_cache(&self) -> Option<IncidenceCache> {
        self.core.incidence_cache()
    }

    /// Subscribe the cold staging ring to memory pressure.
    pub fn attach_monitor(&self, monitor: &Arc<MemoryMonitor>) {
        let ctl = self.shared.ctl.clone();
        let id = monitor.add_listener(Arc::new(move |_report| {
            let _ = ctl.send(Control::TrimCold);
        }));
        *self.shared.monitor.lock() = Some((monitor.clone(), id));
    }

    /// Close the cache: join the cleanup thread, then close the core.
    pub fn close(&self) {
        self.shared.closing.store(true, Ordering::Release);
        let _ = self.shared.ctl.send(Control::Stop);
        if let Some(cleanup) = self.cleanup.lock().take() {
            if cleanup.join().is_err() {
                tracing::error!("hybrid cleanup thread terminated abnormally");
            }
        }
        if let Some((monitor, id)) = self.shared.monitor.lock().take() {
            monitor.remove_listener(id);
        }
        self.core.close();
        self.shared.cold.lock().clear();
    }
}
