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

//! Incidence sets: the ordered handle sets cached per atom.

use std::sync::Arc;

use crate::{handle::PersistentHandle, keyed::LruCache};

/// The set of links incident to an atom: ordered, queryable for membership,
/// holding only handles (never runtime objects).
///
/// Immutable and cheap to clone; the incidence cache hands out clones freely.
#[derive(Debug, Clone)]
pub struct IncidenceSet {
    handles: Arc<[PersistentHandle]>,
}

impl IncidenceSet {
    /// The empty incidence set.
    pub fn empty() -> Self {
        Self {
            handles: Arc::from([]),
        }
    }

    /// Whether `handle` is incident.
    pub fn contains(&self, handle: &PersistentHandle) -> bool {
        self.handles.binary_search(handle).is_ok()
    }

    /// Number of incident links.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Iterate the incident handles in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &PersistentHandle> {
        self.handles.iter()
    }
}

impl FromIterator<PersistentHandle> for IncidenceSet {
    fn from_iter<I: IntoIterator<Item = PersistentHandle>>(iter: I) -> Self {
        let mut handles: Vec<_> = iter.into_iter().collect();
        handles.sort_unstable();
        handles.dedup();
        Self {
            handles: handles.into(),
        }
    }
}

/// The incidence sub-cache: maintained separately from the main atom cache,
/// resolving misses through an injected resolver.
pub type IncidenceCache = LruCache<PersistentHandle, IncidenceSet>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_and_order() {
        let a = PersistentHandle::from_bytes([3; 16]);
        let b = PersistentHandle::from_bytes([1; 16]);
        let c = PersistentHandle::from_bytes([2; 16]);

        let set: IncidenceSet = [a, b, c, b].into_iter().collect();
        assert_eq!(set.len(), 3);
        assert!(set.contains(&a));
        assert!(!set.contains(&PersistentHandle::from_bytes([9; 16])));

        let ordered: Vec<_> = set.iter().copied().collect();
        assert_eq!(ordered, vec![b, c, a]);

        assert!(IncidenceSet::empty().is_empty());
    }
}
