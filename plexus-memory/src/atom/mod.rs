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

//! The atom cache: live-handle bookkeeping and eviction strategies.
//!
//! [`AtomCache`] is a closed set of interchangeable strategies sharing one
//! client API, chosen when the database instance is opened and never swapped
//! at runtime:
//!
//! - [`ImportanceCache`] (the default, fully portable): orders atoms by a
//!   weighted score of access frequency and recency and sweeps the least
//!   important tail when the resident cap is reached.
//! - [`ReclaimCache`]: lets reference counting decide; an atom leaves the
//!   cache when the rest of the program drops its last strong reference.
//! - [`HybridCache`]: importance-ordered capacity sweeps plus reclamation of
//!   atoms nobody references anymore.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use hashbrown::HashMap;
use plexus_common::queue::MaintenanceQueue;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    event::EvictionListener,
    handle::{atom_addr, AtomAttrib, LiveHandle, PersistentHandle},
    incidence::IncidenceCache,
};

mod hybrid;
mod importance;
mod reclaim;

pub use hybrid::HybridCache;
pub use importance::ImportanceCache;
pub use reclaim::ReclaimCache;

/// Configuration of the importance-weighted strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportanceConfig {
    /// Resident live-handle count that triggers an asynchronous sweep.
    pub max_atoms: usize,
    /// Weight of the access-frequency term of the importance score.
    pub retrieval_weight: f64,
    /// Weight of the recency term of the importance score.
    pub recency_weight: f64,
}

impl Default for ImportanceConfig {
    fn default() -> Self {
        Self {
            max_atoms: 100,
            retrieval_weight: 10.0,
            recency_weight: 1.0,
        }
    }
}

impl ImportanceConfig {
    fn validate(&self) -> Result<()> {
        if self.max_atoms == 0 {
            return Err(Error::config("max_atoms must be > 0"));
        }
        if self.retrieval_weight < 0.0 || self.recency_weight < 0.0 {
            return Err(Error::config("importance weights must be >= 0"));
        }
        Ok(())
    }
}

/// Configuration of the reclamation-notified strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReclaimConfig {
    /// Bounded wait of the cleanup thread between reclamation sweeps. Also
    /// bounds how quickly the thread observes shutdown.
    pub poll_interval: Duration,
    /// Number of atoms per staging bucket.
    pub cold_bucket_size: usize,
    /// Number of staging buckets; the oldest is dropped on rotation.
    pub cold_buckets: usize,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            cold_bucket_size: 512,
            cold_buckets: 8,
        }
    }
}

impl ReclaimConfig {
    fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::config("poll_interval must be > 0"));
        }
        if self.cold_bucket_size == 0 || self.cold_buckets == 0 {
            return Err(Error::config("cold staging dimensions must be > 0"));
        }
        Ok(())
    }
}

/// Configuration of the hybrid strategy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HybridConfig {
    /// Capacity-eviction half.
    pub importance: ImportanceConfig,
    /// Reclamation half.
    pub reclaim: ReclaimConfig,
}

/// Control messages understood by a cleanup thread.
pub(crate) enum Control {
    /// Trim the cold staging ring, then sweep.
    TrimCold,
    /// Terminate the cleanup thread.
    Stop,
}

/// The two live-handle maps. Always mutated together, under one lock.
pub(crate) struct AtomMaps<A> {
    by_handle: HashMap<PersistentHandle, LiveHandle<A>>,
    /// Keyed by object identity: object contents may change, identity never
    /// does.
    by_atom: HashMap<usize, LiveHandle<A>>,
}

impl<A> AtomMaps<A> {
    pub(crate) fn new() -> Self {
        Self {
            by_handle: HashMap::new(),
            by_atom: HashMap::new(),
        }
    }

    pub(crate) fn get(&self, handle: &PersistentHandle) -> Option<LiveHandle<A>> {
        self.by_handle.get(handle).cloned()
    }

    pub(crate) fn get_by_addr(&self, addr: usize) -> Option<LiveHandle<A>> {
        self.by_atom.get(&addr).cloned()
    }

    pub(crate) fn contains(&self, handle: &PersistentHandle) -> bool {
        self.by_handle.contains_key(handle)
    }

    /// Register a live handle in both maps.
    ///
    /// # Panics
    ///
    /// Panics if the persistent handle is already resident: a second live
    /// handle would corrupt the one-live-handle-per-atom invariant.
    pub(crate) fn insert(&mut self, live: LiveHandle<A>) {
        let previous = self.by_handle.insert(live.persistent(), live.clone());
        assert!(
            previous.is_none(),
            "atom {} is already resident",
            live.persistent()
        );
        self.by_atom.insert(live.atom_addr(), live);
    }

    /// Register a shutdown-time handle in the reverse map only, outside the
    /// normal bookkeeping.
    pub(crate) fn insert_transient(&mut self, live: LiveHandle<A>) {
        self.by_atom.insert(live.atom_addr(), live);
    }

    /// Rebind a resident handle to a new runtime object, keeping the
    /// reverse map consistent.
    pub(crate) fn rebind(&mut self, live: &LiveHandle<A>, atom: &Arc<A>) {
        self.by_atom.remove(&live.atom_addr());
        live.set_atom(atom);
        self.by_atom.insert(live.atom_addr(), live.clone());
    }

    /// Replace a resident entry with a fresh live handle bound to a new
    /// object (refresh path of the weak-handle strategy).
    pub(crate) fn replace(&mut self, old_addr: usize, live: LiveHandle<A>) {
        self.by_atom.remove(&old_addr);
        self.by_handle.insert(live.persistent(), live.clone());
        self.by_atom.insert(live.atom_addr(), live);
    }

    /// Remove a specific live handle instance. A different instance that
    /// replaced it under the same persistent handle is left alone.
    pub(crate) fn remove(&mut self, live: &LiveHandle<A>) -> Option<LiveHandle<A>> {
        match self.by_handle.get(&live.persistent()) {
            Some(current) if current.ptr_eq(live) => {
                let removed = self.by_handle.remove(&live.persistent());
                self.by_atom.remove(&live.atom_addr());
                removed
            }
            _ => None,
        }
    }

    pub(crate) fn remove_by_handle(
        &mut self,
        handle: &PersistentHandle,
    ) -> Option<LiveHandle<A>> {
        let live = self.by_handle.remove(handle)?;
        self.by_atom.remove(&live.atom_addr());
        Some(live)
    }

    pub(crate) fn handles(&self) -> impl Iterator<Item = &LiveHandle<A>> {
        self.by_handle.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_handle.len()
    }

    /// Empty both maps, returning the formerly resident handles.
    pub(crate) fn drain(&mut self) -> Vec<LiveHandle<A>> {
        let drained = self.by_handle.drain().map(|(_, live)| live).collect();
        self.by_atom.clear();
        drained
    }
}

/// Staging area of strong references to just-materialized atoms.
///
/// A bounded ring of fixed-size buckets: an atom read and then briefly
/// unused must not be reclaimable before the caller has had a chance to use
/// it. Rotation drops the oldest bucket; trimming beyond rotation happens
/// only under observed memory pressure.
pub(crate) struct ColdStore<A> {
    buckets: VecDeque<Vec<Arc<A>>>,
    bucket_size: usize,
    max_buckets: usize,
}

impl<A> ColdStore<A> {
    pub(crate) fn new(bucket_size: usize, max_buckets: usize) -> Self {
        Self {
            buckets: VecDeque::new(),
            bucket_size,
            max_buckets,
        }
    }

    pub(crate) fn add(&mut self, atom: Arc<A>) {
        if self
            .buckets
            .back()
            .is_none_or(|bucket| bucket.len() >= self.bucket_size)
        {
            self.buckets.push_back(Vec::with_capacity(self.bucket_size));
            if self.buckets.len() > self.max_buckets {
                self.buckets.pop_front();
            }
        }
        self.buckets
            .back_mut()
            .expect("cold bucket just pushed")
            .push(atom);
    }

    /// Drop the oldest half of the buckets.
    pub(crate) fn trim(&mut self) {
        let keep = self.buckets.len().div_ceil(2);
        while self.buckets.len() > keep {
            self.buckets.pop_front();
        }
    }

    pub(crate) fn clear(&mut self) {
        self.buckets.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }
}

/// The atom cache: one of the three strategies behind a uniform API.
///
/// See the module documentation for the strategy trade-offs. All strategies
/// guarantee:
///
/// - at most one live handle per persistent handle while resident;
/// - the handle->live and atom->live maps mutate together, atomically;
/// - an eviction notification is dispatched synchronously before an evicted
///   handle's object reference is discarded;
/// - reaching a resident cap is not an error: the triggering call succeeds
///   and eviction happens asynchronously;
/// - [`close`](AtomCache::close) is synchronous and total.
///
/// Passing a nil persistent handle, or re-reading an atom whose persistent
/// handle is already resident with a live object, is a programming-contract
/// violation and panics.
pub enum AtomCache<A> {
    /// Statistics-weighted eviction (strategy A).
    Importance(ImportanceCache<A>),
    /// Reclamation-notified eviction (strategy B).
    Reclaim(ReclaimCache<A>),
    /// Both (strategy C).
    Hybrid(HybridCache<A>),
}

impl<A> AtomCache<A>
where
    A: Send + Sync + 'static,
{
    /// Build the importance-weighted strategy.
    pub fn importance(
        config: ImportanceConfig,
        queue: Arc<MaintenanceQueue>,
        listener: Arc<dyn EvictionListener<A>>,
    ) -> Result<Self> {
        Ok(Self::Importance(ImportanceCache::new(
            config, queue, listener,
        )?))
    }

    /// Build the reclamation-notified strategy.
    pub fn reclaim(config: ReclaimConfig, listener: Arc<dyn EvictionListener<A>>) -> Result<Self> {
        Ok(Self::Reclaim(ReclaimCache::new(config, listener)?))
    }

    /// Build the hybrid strategy.
    pub fn hybrid(
        config: HybridConfig,
        queue: Arc<MaintenanceQueue>,
        listener: Arc<dyn EvictionListener<A>>,
    ) -> Result<Self> {
        Ok(Self::Hybrid(HybridCache::new(config, queue, listener)?))
    }

    /// Look up the live handle of a persistent handle.
    pub fn get(&self, handle: &PersistentHandle) -> Option<LiveHandle<A>> {
        match self {
            Self::Importance(c) => c.get(handle),
            Self::Reclaim(c) => c.get(handle),
            Self::Hybrid(c) => c.get(handle),
        }
    }

    /// Look up the live handle of a runtime atom instance.
    pub fn get_by_atom(&self, atom: &Arc<A>) -> Option<LiveHandle<A>> {
        match self {
            Self::Importance(c) => c.get_by_atom(atom),
            Self::Reclaim(c) => c.get_by_atom(atom),
            Self::Hybrid(c) => c.get_by_atom(atom),
        }
    }

    /// Inform the cache that an atom has just been read from storage,
    /// constructing its live handle.
    pub fn atom_read(
        &self,
        handle: PersistentHandle,
        atom: Arc<A>,
        attrib: AtomAttrib,
    ) -> LiveHandle<A> {
        match self {
            Self::Importance(c) => c.atom_read(handle, atom, attrib),
            Self::Reclaim(c) => c.atom_read(handle, atom, attrib),
            Self::Hybrid(c) => c.atom_read(handle, atom, attrib),
        }
    }

    /// Inform the cache that a new atom has just been added to the database.
    pub fn atom_added(
        &self,
        handle: PersistentHandle,
        atom: Arc<A>,
        attrib: AtomAttrib,
    ) -> LiveHandle<A> {
        self.atom_read(handle, atom, attrib)
    }

    /// Replace the runtime instance bound to a live handle, e.g. after a
    /// transactional retry materialized a new instance for the same
    /// persistent handle.
    pub fn atom_refresh(
        &self,
        handle: &LiveHandle<A>,
        atom: Arc<A>,
        replace: bool,
    ) -> LiveHandle<A> {
        match self {
            Self::Importance(c) => c.atom_refresh(handle, atom, replace),
            Self::Reclaim(c) => c.atom_refresh(handle, atom, replace),
            Self::Hybrid(c) => c.atom_refresh(handle, atom, replace),
        }
    }

    /// Force removal of an atom, e.g. when it is deleted from the graph.
    /// Its cached incidence set is removed as well.
    pub fn remove(&self, handle: &PersistentHandle) {
        match self {
            Self::Importance(c) => c.remove(handle),
            Self::Reclaim(c) => c.remove(handle),
            Self::Hybrid(c) => c.remove(handle),
        }
    }

    /// Pin an atom in memory: exempt from eviction while still answering
    /// identity lookups.
    pub fn freeze(&self, live: &LiveHandle<A>) {
        match self {
            Self::Importance(c) => c.freeze(live),
            Self::Reclaim(c) => c.freeze(live),
            Self::Hybrid(c) => c.freeze(live),
        }
    }

    /// Re-admit a frozen atom to normal eviction eligibility. It is ok to
    /// unfreeze an atom that has never been frozen.
    pub fn unfreeze(&self, live: &LiveHandle<A>) {
        match self {
            Self::Importance(c) => c.unfreeze(live),
            Self::Reclaim(c) => c.unfreeze(live),
            Self::Hybrid(c) => c.unfreeze(live),
        }
    }

    /// Whether an atom is currently frozen.
    pub fn is_frozen(&self, live: &LiveHandle<A>) -> bool {
        match self {
            Self::Importance(c) => c.is_frozen(live),
            Self::Reclaim(c) => c.is_frozen(live),
            Self::Hybrid(c) => c.is_frozen(live),
        }
    }

    /// Number of resident atoms.
    pub fn len(&self) -> usize {
        match self {
            Self::Importance(c) => c.len(),
            Self::Reclaim(c) => c.len(),
            Self::Hybrid(c) => c.len(),
        }
    }

    /// Whether no atom is resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wire the incidence sub-cache.
    pub fn set_incidence_cache(&self, cache: IncidenceCache) {
        match self {
            Self::Importance(c) => c.set_incidence_cache(cache),
            Self::Reclaim(c) => c.set_incidence_cache(cache),
            Self::Hybrid(c) => c.set_incidence_cache(cache),
        }
    }

    /// The incidence sub-cache, if wired.
    pub fn incidence_cache(&self) -> Option<IncidenceCache> {
        match self {
            Self::Importance(c) => c.incidence_cache(),
            Self::Reclaim(c) => c.incidence_cache(),
            Self::Hybrid(c) => c.incidence_cache(),
        }
    }

    /// Close the cache: stop per-cache background threads deterministically,
    /// dispatch eviction notifications for all still-resident handles, and
    /// clear all maps. Once closed, the cache cannot be used again.
    pub fn close(&self) {
        match self {
            Self::Importance(c) => c.close(),
            Self::Reclaim(c) => c.close(),
            Self::Hybrid(c) => c.close(),
        }
    }
}

/// Assert the handle is usable as an atom identifier.
pub(crate) fn assert_real_handle(handle: &PersistentHandle) {
    assert!(
        !handle.is_null(),
        "null persistent handle passed to the atom cache"
    );
}

/// Shared by strategies for the reverse lookup.
pub(crate) fn addr_of<A>(atom: &Arc<A>) -> usize {
    atom_addr(atom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cold_store_rotation() {
        let mut cold: ColdStore<u32> = ColdStore::new(2, 3);
        for i in 0..6 {
            cold.add(Arc::new(i));
        }
        assert_eq!(cold.len(), 6);
        // The seventh add rotates the oldest bucket out.
        cold.add(Arc::new(6));
        assert_eq!(cold.len(), 5);

        cold.trim();
        assert!(cold.len() <= 4);
        cold.clear();
        assert_eq!(cold.len(), 0);
    }

    #[test]
    #[should_panic(expected = "already resident")]
    fn test_duplicate_insert_panics() {
        let mut maps: AtomMaps<u32> = AtomMaps::new();
        let h = PersistentHandle::generate();
        let a = Arc::new(1u32);
        let b = Arc::new(2u32);
        maps.insert(LiveHandle::strong(h, &a, AtomAttrib::default()));
        maps.insert(LiveHandle::strong(h, &b, AtomAttrib::default()));
    }
}
