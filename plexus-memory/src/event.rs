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

//! Eviction event dispatch.

use std::sync::Arc;

use crate::handle::PersistentHandle;

/// Observer of atom evictions.
///
/// The cache dispatches `on_evict` synchronously for every evicted atom
/// (asynchronous eviction sweeps, reclamation and
/// [`close`](crate::atom::AtomCache::close) alike), strictly before the live
/// handle's object reference is discarded. An observer may, for example,
/// flush a dirty atom back to storage. Explicit
/// [`remove`](crate::atom::AtomCache::remove) is deletion rather than
/// eviction and dispatches nothing.
///
/// `atom` is the last known runtime object. It is `None` when the object is
/// no longer recoverable, which is the normal case for reclamation-notified
/// eviction: by the time the notification fires, the rest of the program has
/// already dropped the object.
pub trait EvictionListener<A>: Send + Sync + 'static {
    /// Called for every atom leaving the cache.
    fn on_evict(&self, handle: &PersistentHandle, atom: Option<&Arc<A>>);
}

/// Listener that ignores all evictions. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl<A> EvictionListener<A> for NoopListener {
    fn on_evict(&self, _handle: &PersistentHandle, _atom: Option<&Arc<A>>) {}
}
