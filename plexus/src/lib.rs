// Copyright 2026 plexus Project Authors
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

//! plexus is the runtime atom cache of a hypergraph database engine.
//!
//! An [`Environment`] stands for one open database instance: it owns the
//! background maintenance worker and the memory pressure monitor that every
//! cache of that instance shares, with open/close lifecycle tied to the
//! instance. Caches are built against an environment:
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use plexus::prelude::*;
//!
//! let env = Environment::open(EnvironmentOptions::default());
//!
//! let cache: AtomCache<String> = AtomCacheBuilder::new()
//!     .with_policy(CachePolicy::Importance(ImportanceConfig::default()))
//!     .build(&env)
//!     .unwrap();
//!
//! let handle = PersistentHandle::generate();
//! let atom = Arc::new("an atom".to_owned());
//! let live = cache.atom_read(handle, atom.clone(), AtomAttrib::default());
//! assert!(cache.get(&handle).unwrap().ptr_eq(&live));
//!
//! cache.close();
//! env.close();
//! ```

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use plexus_common::{
    pressure::{MemoryMonitor, MonitorOptions},
    queue::MaintenanceQueue,
};
use plexus_memory::{
    atom::{AtomCache, HybridConfig, ImportanceConfig, ReclaimConfig},
    error::Result,
    event::{EvictionListener, NoopListener},
    handle::PersistentHandle,
    incidence::{IncidenceCache, IncidenceSet},
    keyed::{EvictPolicy, LruCache, Resolver},
};

/// The prelude.
pub mod prelude {
    pub use plexus_common::{
        pressure::{MemoryMonitor, MonitorOptions, PressureReport},
        queue::MaintenanceQueue,
    };
    pub use plexus_memory::prelude::*;

    pub use crate::{
        AtomCacheBuilder, CachePolicy, Environment, EnvironmentOptions, LruCacheBuilder,
    };
}

/// Options of an [`Environment`].
#[derive(Debug, Clone)]
pub struct EnvironmentOptions {
    /// Thread name of the maintenance worker.
    pub queue_name: String,
    /// Memory monitor settings; `None` disables pressure notifications for
    /// this instance.
    pub monitor: Option<MonitorOptions>,
}

impl Default for EnvironmentOptions {
    fn default() -> Self {
        Self {
            queue_name: "plexus-maintenance".to_owned(),
            monitor: Some(MonitorOptions::default()),
        }
    }
}

/// One open database instance's shared cache runtime: the maintenance queue
/// all caches funnel their bookkeeping through, and the memory pressure
/// monitor feeding pressure-driven eviction.
///
/// [`close`](Environment::close) stops both deterministically; caches built
/// against the environment must be closed first.
pub struct Environment {
    queue: Arc<MaintenanceQueue>,
    monitor: Option<Arc<MemoryMonitor>>,
    closed: AtomicBool,
}

impl Environment {
    /// Open an environment: start the maintenance worker and, if configured,
    /// the memory monitor.
    pub fn open(options: EnvironmentOptions) -> Self {
        tracing::debug!(queue = %options.queue_name, "opening plexus environment");
        Self {
            queue: MaintenanceQueue::start(&options.queue_name),
            monitor: options.monitor.map(MemoryMonitor::start),
            closed: AtomicBool::new(false),
        }
    }

    /// The shared maintenance queue.
    pub fn queue(&self) -> &Arc<MaintenanceQueue> {
        &self.queue
    }

    /// The memory monitor, if enabled.
    pub fn monitor(&self) -> Option<&Arc<MemoryMonitor>> {
        self.monitor.as_ref()
    }

    /// Close the environment: stop the monitor and the maintenance worker,
    /// joining both. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(monitor) = &self.monitor {
            monitor.stop();
        }
        self.queue.stop();
        tracing::debug!("plexus environment closed");
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.close();
    }
}

/// Which [`AtomCache`] strategy to build, with its knobs. Chosen once, at
/// database-open time.
#[derive(Debug, Clone)]
pub enum CachePolicy {
    /// Statistics-weighted eviction.
    Importance(ImportanceConfig),
    /// Reclamation-notified eviction.
    Reclaim(ReclaimConfig),
    /// Both.
    Hybrid(HybridConfig),
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::Importance(ImportanceConfig::default())
    }
}

/// Builder of an [`AtomCache`] wired to an [`Environment`].
pub struct AtomCacheBuilder<A> {
    policy: CachePolicy,
    listener: Arc<dyn EvictionListener<A>>,
    max_incidence_sets: usize,
    incidence_resolver: Option<Box<dyn Fn(&PersistentHandle) -> IncidenceSet + Send + Sync>>,
}

impl<A> Default for AtomCacheBuilder<A>
where
    A: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A> AtomCacheBuilder<A>
where
    A: Send + Sync + 'static,
{
    /// A builder with the default (importance) policy and no observers.
    pub fn new() -> Self {
        Self {
            policy: CachePolicy::default(),
            listener: Arc::new(NoopListener),
            max_incidence_sets: 10,
            incidence_resolver: None,
        }
    }

    /// Choose the cache strategy.
    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Observe evictions.
    pub fn with_listener(mut self, listener: Arc<dyn EvictionListener<A>>) -> Self {
        self.listener = listener;
        self
    }

    /// Cap of the incidence sub-cache.
    pub fn with_max_incidence_sets(mut self, max_incidence_sets: usize) -> Self {
        self.max_incidence_sets = max_incidence_sets;
        self
    }

    /// Resolve incidence-set misses through `resolver`; without one, no
    /// incidence sub-cache is wired.
    pub fn with_incidence_resolver(
        mut self,
        resolver: impl Fn(&PersistentHandle) -> IncidenceSet + Send + Sync + 'static,
    ) -> Self {
        self.incidence_resolver = Some(Box::new(resolver));
        self
    }

    /// Validate and build.
    pub fn build(self, env: &Environment) -> Result<AtomCache<A>> {
        let cache = match self.policy {
            CachePolicy::Importance(config) => {
                AtomCache::importance(config, env.queue().clone(), self.listener)?
            }
            CachePolicy::Reclaim(config) => {
                let cache = AtomCache::reclaim(config, self.listener)?;
                if let (AtomCache::Reclaim(c), Some(monitor)) = (&cache, env.monitor()) {
                    c.attach_monitor(monitor);
                }
                cache
            }
            CachePolicy::Hybrid(config) => {
                let cache = AtomCache::hybrid(config, env.queue().clone(), self.listener)?;
                if let (AtomCache::Hybrid(c), Some(monitor)) = (&cache, env.monitor()) {
                    c.attach_monitor(monitor);
                }
                cache
            }
        };

        if let Some(resolver) = self.incidence_resolver {
            let incidence: IncidenceCache = LruCache::new(
                move |handle: &PersistentHandle| resolver(handle),
                EvictPolicy::Capacity {
                    max_size: self.max_incidence_sets,
                    evict_count: (self.max_incidence_sets / 10).max(1),
                },
                env.queue().clone(),
            )?;
            cache.set_incidence_cache(incidence);
        }
        Ok(cache)
    }
}

/// Builder of a generic [`LruCache`] wired to an [`Environment`].
pub struct LruCacheBuilder<K, V> {
    resolver: Box<dyn Fn(&K) -> V + Send + Sync>,
    policy: EvictPolicy,
}

impl<K, V> LruCacheBuilder<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// A builder over `resolver` with a default capacity policy.
    pub fn new(resolver: impl Resolver<K, V>) -> Self {
        Self {
            resolver: Box::new(resolver),
            policy: EvictPolicy::Capacity {
                max_size: 1000,
                evict_count: 100,
            },
        }
    }

    /// Choose the eviction trigger policy.
    pub fn with_policy(mut self, policy: EvictPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Validate and build; a pressure-policy cache is subscribed to the
    /// environment's monitor when one is running.
    pub fn build(self, env: &Environment) -> Result<LruCache<K, V>> {
        let resolver = self.resolver;
        let cache = LruCache::new(move |k: &K| resolver(k), self.policy, env.queue().clone())?;
        if matches!(self.policy, EvictPolicy::Pressure { .. }) {
            if let Some(monitor) = env.monitor() {
                cache.attach_monitor(monitor);
            }
        }
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use plexus_memory::handle::AtomAttrib;

    use super::*;

    fn env() -> Environment {
        Environment::open(EnvironmentOptions {
            queue_name: "plexus-test".to_owned(),
            monitor: None,
        })
    }

    #[test]
    fn test_environment_lifecycle() {
        let env = env();
        assert!(env.queue().is_running());
        env.close();
        assert!(!env.queue().is_running());
        // Idempotent.
        env.close();
    }

    #[test_log::test]
    fn test_build_each_strategy() {
        let env = env();
        for policy in [
            CachePolicy::Importance(ImportanceConfig::default()),
            CachePolicy::Reclaim(ReclaimConfig::default()),
            CachePolicy::Hybrid(HybridConfig::default()),
        ] {
            let cache: AtomCache<String> = AtomCacheBuilder::new()
                .with_policy(policy)
                .build(&env)
                .unwrap();
            let h = PersistentHandle::generate();
            let atom = Arc::new("atom".to_owned());
            let live = cache.atom_read(h, atom.clone(), AtomAttrib::default());
            assert!(cache.get(&h).unwrap().ptr_eq(&live));
            assert!(cache.get_by_atom(&atom).unwrap().ptr_eq(&live));
            cache.close();
            assert!(cache.is_empty());
        }
        env.close();
    }

    #[test]
    fn test_builder_rejects_bad_config() {
        let env = env();
        let built: Result<AtomCache<String>> = AtomCacheBuilder::new()
            .with_policy(CachePolicy::Importance(ImportanceConfig {
                max_atoms: 0,
                ..Default::default()
            }))
            .build(&env);
        assert!(built.is_err());
        env.close();
    }

    #[test]
    fn test_incidence_cache_wired() {
        let env = env();
        let target = PersistentHandle::generate();
        let neighbor = PersistentHandle::generate();
        let cache: AtomCache<String> = AtomCacheBuilder::new()
            .with_incidence_resolver(move |h| {
                if *h == target {
                    [neighbor].into_iter().collect()
                } else {
                    IncidenceSet::empty()
                }
            })
            .build(&env)
            .unwrap();

        let incidence = cache.incidence_cache().unwrap();
        assert!(incidence.get(&target).contains(&neighbor));
        assert!(incidence.get(&PersistentHandle::generate()).is_empty());

        cache.close();
        env.close();
    }

    #[test]
    fn test_keyed_builder() {
        let env = env();
        let cache = LruCacheBuilder::new(|k: &u32| k * 2)
            .with_policy(EvictPolicy::Capacity {
                max_size: 4,
                evict_count: 1,
            })
            .build(&env)
            .unwrap();
        assert_eq!(cache.get(&21), 42);
        env.close();
    }
}
