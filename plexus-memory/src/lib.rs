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

//! Runtime atom cache for a hypergraph database engine.
//!
//! The cache maps persistent (on-disk) atom identifiers to live handles
//! binding the identifier to a materialized runtime object, decides which
//! live atoms may be evicted to bound memory use, and models the
//! hard / symbolic / floating reference semantics that tie an atom's
//! database lifetime to the references pointing at it.
//!
//! The caching activities are abstracted behind [`AtomCache`], a closed set
//! of interchangeable strategies chosen when the database instance is
//! opened. A successful caching policy largely depends on the application:
//! some applications keep most atoms within their own data structures, while
//! others rely entirely on the engine and query atoms on a need-by-need
//! basis.

pub mod atom;
pub mod atomref;
pub mod error;
pub mod event;
pub mod handle;
pub mod incidence;
pub mod keyed;
mod order;

/// The crate prelude.
pub mod prelude {
    pub use crate::{
        atom::{
            AtomCache, HybridCache, HybridConfig, ImportanceCache, ImportanceConfig,
            ReclaimCache, ReclaimConfig,
        },
        atomref::{AtomRef, Lifetime, RefMode, RefState, ReleaseOutcome},
        error::{Error, Result},
        event::{EvictionListener, NoopListener},
        handle::{AtomAttrib, Flags, HandleKind, LiveHandle, PersistentHandle},
        incidence::{IncidenceCache, IncidenceSet},
        keyed::{EvictPolicy, LruCache, Resolver},
    };
}
