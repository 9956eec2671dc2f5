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

//! Handle model: persistent identifiers and live in-memory handles.

use std::{
    fmt::{self, Debug, Display},
    str::FromStr,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use arc_swap::ArcSwapOption;
use bitflags::bitflags;
use parking_lot::Mutex;
use plexus_common::slab::Token;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stable, totally ordered, fixed-width identifier of a stored atom.
///
/// Persistent handles are created once per atom at first store and never
/// expire; they are destroyed only when the atom is permanently removed from
/// storage. Equality and ordering are by byte value, so a handle can be
/// recorded in storage, sent to a peer and restored without ever conflicting
/// with another handle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PersistentHandle([u8; Self::SIZE]);

impl PersistentHandle {
    /// The byte width of every persistent handle.
    pub const SIZE: usize = 16;

    const NIL: Self = Self([0; Self::SIZE]);
    const ANY: Self = Self([0xFF; Self::SIZE]);

    /// Construct a new, permanently unique handle.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// The nil handle: refers to no value.
    pub const fn nil() -> Self {
        Self::NIL
    }

    /// The well-known "any"/non-existent handle.
    pub const fn any() -> Self {
        Self::ANY
    }

    /// Construct a handle from its byte representation.
    pub const fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self(bytes)
    }

    /// Construct a handle from a byte slice holding exactly
    /// [`SIZE`](Self::SIZE) bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; Self::SIZE] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// The byte representation of this handle.
    pub const fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.0
    }

    /// Whether this is the nil handle.
    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }

    /// Whether this is the "any" handle.
    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }

    /// Whether this is one of the two null-equivalent sentinels.
    pub fn is_null(&self) -> bool {
        self.is_nil() || self.is_any()
    }
}

impl Display for PersistentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&Uuid::from_bytes(self.0).hyphenated(), f)
    }
}

impl Debug for PersistentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PersistentHandle({self})")
    }
}

impl FromStr for PersistentHandle {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(|u| Self(u.into_bytes()))
    }
}

bitflags! {
    /// System-level status flags carried by an atom's live handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct Flags: u8 {
        /// The atom is managed: kept alive only incidentally and eligible
        /// for automatic removal if unused.
        const MANAGED = 0b0000_0001;
    }
}

/// Management attributes stored alongside an atom and handed back to the
/// cache when the atom is read from storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtomAttrib {
    /// System-level flags.
    pub flags: Flags,
    /// Recorded overall retrieval count, meaningful for managed atoms.
    pub retrieval_count: u64,
    /// Recorded last access time (unix millis), meaningful for managed atoms.
    pub last_access_time: u64,
}

impl AtomAttrib {
    /// Attributes of a managed atom with recorded usage statistics.
    pub fn managed(retrieval_count: u64, last_access_time: u64) -> Self {
        Self {
            flags: Flags::MANAGED,
            retrieval_count,
            last_access_time,
        }
    }

    /// Whether the managed bit is set.
    pub fn is_managed(&self) -> bool {
        self.flags.contains(Flags::MANAGED)
    }
}

/// Discriminates ordinary cached handles from the transitional kind used
/// while a cache is closing.
///
/// Closing a database involves cleanup activity that reads atoms into memory
/// just temporarily; such reads must not be entangled with the (by then
/// defunct) eviction and reclamation bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// A handle registered with the cache's normal bookkeeping.
    Cached,
    /// A shutdown-time handle outside the bookkeeping paths.
    Transient,
}

/// How a live handle holds its runtime object.
enum AtomSlot<A> {
    /// The cache keeps the object alive until eviction.
    Strong(ArcSwapOption<A>),
    /// The cache observes the object without keeping it alive; the entry
    /// dies when the rest of the program drops its last reference.
    Weak(Mutex<Weak<A>>),
}

struct LiveInner<A> {
    persistent: PersistentHandle,
    flags: Flags,
    kind: HandleKind,
    slot: AtomSlot<A>,
    /// Pointer identity of the currently bound object, for the reverse
    /// atom -> handle map. Survives reclamation of the object itself.
    atom_addr: AtomicUsize,
    retrievals: AtomicU64,
    last_access: AtomicU64,
    /// Eviction-order slot id (raw [`Token`]); zero when detached. Owned by
    /// the maintenance worker.
    order_token: AtomicUsize,
}

/// The in-memory face of a cache-resident atom.
///
/// A live handle binds a [`PersistentHandle`] to a runtime object reference
/// plus status flags and usage statistics. Exactly one live handle exists per
/// persistent handle while the atom is cache-resident.
///
/// The object reference may be cleared independently of the handle's own
/// lifetime: eviction bookkeeping nulls the reference while code elsewhere
/// may still hold the live handle as a stand-in identifier. Cloning is cheap
/// and clones refer to the same underlying handle.
pub struct LiveHandle<A> {
    inner: Arc<LiveInner<A>>,
}

impl<A> Clone for LiveHandle<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A> LiveHandle<A> {
    fn new(
        persistent: PersistentHandle,
        atom: &Arc<A>,
        attrib: AtomAttrib,
        kind: HandleKind,
        slot: AtomSlot<A>,
    ) -> Self {
        let (retrievals, last_access) = if attrib.is_managed() {
            (attrib.retrieval_count.max(1), now_millis())
        } else {
            (1, now_millis())
        };
        Self {
            inner: Arc::new(LiveInner {
                persistent,
                flags: attrib.flags,
                kind,
                slot,
                atom_addr: AtomicUsize::new(atom_addr(atom)),
                retrievals: AtomicU64::new(retrievals),
                last_access: AtomicU64::new(last_access),
                order_token: AtomicUsize::new(0),
            }),
        }
    }

    /// A handle that keeps its object alive until eviction.
    pub fn strong(persistent: PersistentHandle, atom: &Arc<A>, attrib: AtomAttrib) -> Self {
        Self::new(
            persistent,
            atom,
            attrib,
            HandleKind::Cached,
            AtomSlot::Strong(ArcSwapOption::new(Some(atom.clone()))),
        )
    }

    /// A handle that observes its object without keeping it alive.
    pub fn weak(persistent: PersistentHandle, atom: &Arc<A>, attrib: AtomAttrib) -> Self {
        Self::new(
            persistent,
            atom,
            attrib,
            HandleKind::Cached,
            AtomSlot::Weak(Mutex::new(Arc::downgrade(atom))),
        )
    }

    /// A shutdown-time handle outside the normal bookkeeping paths.
    pub fn transient(persistent: PersistentHandle, atom: &Arc<A>, flags: Flags) -> Self {
        Self::new(
            persistent,
            atom,
            AtomAttrib {
                flags,
                ..Default::default()
            },
            HandleKind::Transient,
            AtomSlot::Strong(ArcSwapOption::new(Some(atom.clone()))),
        )
    }

    /// The persistent handle this live handle stands for.
    pub fn persistent(&self) -> PersistentHandle {
        self.inner.persistent
    }

    /// The system-level flags of the atom.
    pub fn flags(&self) -> Flags {
        self.inner.flags
    }

    /// Whether the managed bit is set.
    pub fn is_managed(&self) -> bool {
        self.inner.flags.contains(Flags::MANAGED)
    }

    /// The kind of this handle.
    pub fn kind(&self) -> HandleKind {
        self.inner.kind
    }

    /// The runtime object, or `None` if it was evicted or reclaimed.
    pub fn atom(&self) -> Option<Arc<A>> {
        match &self.inner.slot {
            AtomSlot::Strong(strong) => strong.load_full(),
            AtomSlot::Weak(weak) => weak.lock().upgrade(),
        }
    }

    /// Rebind the handle to a new runtime object.
    pub fn set_atom(&self, atom: &Arc<A>) {
        self.inner.atom_addr.store(atom_addr(atom), Ordering::Release);
        match &self.inner.slot {
            AtomSlot::Strong(strong) => strong.store(Some(atom.clone())),
            AtomSlot::Weak(weak) => *weak.lock() = Arc::downgrade(atom),
        }
    }

    /// Null the object reference, leaving the handle itself intact.
    pub fn clear_atom(&self) {
        match &self.inner.slot {
            AtomSlot::Strong(strong) => strong.store(None),
            AtomSlot::Weak(weak) => *weak.lock() = Weak::new(),
        }
    }

    /// Pointer identity of the currently (or last) bound object.
    pub(crate) fn atom_addr(&self) -> usize {
        self.inner.atom_addr.load(Ordering::Acquire)
    }

    /// Record an access: bump the retrieval counter, refresh the timestamp.
    pub fn accessed(&self) {
        self.inner.retrievals.fetch_add(1, Ordering::Relaxed);
        self.inner.last_access.store(now_millis(), Ordering::Relaxed);
    }

    /// Monotonically increasing retrieval counter.
    pub fn retrieval_count(&self) -> u64 {
        self.inner.retrievals.load(Ordering::Relaxed)
    }

    /// Last access time, unix millis.
    pub fn last_access_time(&self) -> u64 {
        self.inner.last_access.load(Ordering::Relaxed)
    }

    /// Whether two live handles are the same instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn order_token(&self) -> Option<Token> {
        Token::from_raw(self.inner.order_token.load(Ordering::Acquire))
    }

    pub(crate) fn set_order_token(&self, token: Option<Token>) {
        self.inner
            .order_token
            .store(token.map_or(0, Token::into_raw), Ordering::Release);
    }
}

impl<A> PartialEq for LiveHandle<A> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.persistent == other.inner.persistent
    }
}

impl<A> Eq for LiveHandle<A> {}

impl<A> std::hash::Hash for LiveHandle<A> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.persistent.hash(state);
    }
}

impl<A> Debug for LiveHandle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveHandle")
            .field("persistent", &self.inner.persistent)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

/// Pointer identity of a runtime atom, the key of the reverse
/// atom -> handle map. Comparing object contents would break as soon as an
/// atom's properties change; identity never does.
pub(crate) fn atom_addr<A>(atom: &Arc<A>) -> usize {
    Arc::as_ptr(atom) as usize
}

/// Milliseconds since the unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
