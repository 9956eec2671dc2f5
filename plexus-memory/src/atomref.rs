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

//! Atom references and their lifetime semantics.
//!
//! An [`AtomRef`] is more than a plain handle: it is a smart pointer with a
//! special relationship to its referent. Removing a reference from the
//! database may affect the referent's lifetime, depending on the reference
//! [mode](RefMode). This module is pure value logic: the inbound reference
//! tally of an atom is queried externally and fed through [`RefState`]; no
//! I/O happens here.

use serde::{Deserialize, Serialize};

use crate::handle::PersistentHandle;

/// How a reference affects the lifetime of the atom it refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefMode {
    /// Like a filesystem hard link: when all hard references are removed,
    /// the referent is removed as well.
    Hard = 0,
    /// Like a filesystem symbolic link: a pure pointer with no effect on the
    /// referent's lifetime. May dangle.
    Symbolic = 1,
    /// When removed, leaves the referent behind as a temporary managed atom
    /// that is eventually removed automatically if not used. The atom
    /// remains reachable by other means (a kept handle, a query) and new
    /// references to it can be re-established.
    Floating = 2,
}

impl RefMode {
    /// The stored byte code of this mode.
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Decode a stored byte code.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Hard,
            1 => Self::Symbolic,
            _ => Self::Floating,
        }
    }
}

/// A reference to an atom, usable as an atom value or as a projection of a
/// composite value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AtomRef {
    referent: PersistentHandle,
    mode: RefMode,
}

impl AtomRef {
    /// A reference to `referent` with the given mode.
    pub fn new(referent: PersistentHandle, mode: RefMode) -> Self {
        Self { referent, mode }
    }

    /// A hard reference to `referent`.
    pub fn hard(referent: PersistentHandle) -> Self {
        Self::new(referent, RefMode::Hard)
    }

    /// A symbolic reference to `referent`.
    pub fn symbolic(referent: PersistentHandle) -> Self {
        Self::new(referent, RefMode::Symbolic)
    }

    /// A floating reference to `referent`.
    pub fn floating(referent: PersistentHandle) -> Self {
        Self::new(referent, RefMode::Floating)
    }

    /// The referent atom.
    pub fn referent(&self) -> PersistentHandle {
        self.referent
    }

    /// The reference mode.
    pub fn mode(&self) -> RefMode {
        self.mode
    }

    /// Whether this is a hard reference.
    pub fn is_hard(&self) -> bool {
        self.mode == RefMode::Hard
    }

    /// Whether this is a symbolic reference.
    pub fn is_symbolic(&self) -> bool {
        self.mode == RefMode::Symbolic
    }

    /// Whether this is a floating reference.
    pub fn is_floating(&self) -> bool {
        self.mode == RefMode::Floating
    }

    /// Dereference through `lookup`.
    ///
    /// A symbolic reference may dangle: an absent referent yields `None`,
    /// never an error. Hard and floating references prevent removal of their
    /// referent, so an absent referent indicates an invariant violation
    /// upstream; it is still reported as `None` here.
    pub fn resolve<V>(&self, lookup: impl FnOnce(&PersistentHandle) -> Option<V>) -> Option<V> {
        lookup(&self.referent)
    }
}

/// Decision produced by releasing a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other lifetime-affecting references remain (or a symbolic reference
    /// was released): the atom stays as is.
    Retained,
    /// The last lifetime-affecting reference is gone and no floating
    /// reference ever existed: the atom may be deleted outright.
    Deletable,
    /// The last lifetime-affecting reference is gone but a floating
    /// reference existed: the atom must be marked managed instead of
    /// deleted. Floating dominates hard for lifetime purposes.
    MakeManaged,
}

/// The inbound reference tally of one atom, with a sticky record of floating
/// references having existed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefState {
    hard: u64,
    symbolic: u64,
    floating: u64,
    had_floating: bool,
}

impl RefState {
    /// A tally with no inbound references.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an added reference.
    pub fn add(&mut self, mode: RefMode) {
        match mode {
            RefMode::Hard => self.hard += 1,
            RefMode::Symbolic => self.symbolic += 1,
            RefMode::Floating => {
                self.floating += 1;
                self.had_floating = true;
            }
        }
    }

    /// Whether ordinary removal of the atom is permitted: false while any
    /// hard or floating reference targets it. Symbolic references never
    /// block removal.
    pub fn can_remove(&self) -> bool {
        self.hard == 0 && self.floating == 0
    }

    /// Record a removed reference and decide what happens to the atom.
    ///
    /// # Panics
    ///
    /// Panics if no reference of the given mode is recorded: releasing a
    /// reference that was never added is a bookkeeping defect upstream.
    pub fn release(&mut self, mode: RefMode) -> ReleaseOutcome {
        let count = match mode {
            RefMode::Hard => &mut self.hard,
            RefMode::Symbolic => &mut self.symbolic,
            RefMode::Floating => &mut self.floating,
        };
        assert!(*count > 0, "release of an untracked {mode:?} reference");
        *count -= 1;

        if mode == RefMode::Symbolic {
            return ReleaseOutcome::Retained;
        }
        if self.hard > 0 || self.floating > 0 {
            return ReleaseOutcome::Retained;
        }
        if self.had_floating {
            ReleaseOutcome::MakeManaged
        } else {
            ReleaseOutcome::Deletable
        }
    }

    /// Number of inbound hard references.
    pub fn hard(&self) -> u64 {
        self.hard
    }

    /// Number of inbound symbolic references.
    pub fn symbolic(&self) -> u64 {
        self.symbolic
    }

    /// Number of inbound floating references.
    pub fn floating(&self) -> u64 {
        self.floating
    }
}

/// External lifetime status of an atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// Created in memory, not yet stored.
    Transient,
    /// Stored, no lifetime-affecting references yet.
    Stored,
    /// At least one hard or floating reference targets the atom.
    Referenced,
    /// All lifetime-affecting references were removed, no floating history:
    /// deletion is permitted.
    Unreferenced,
    /// Kept alive only incidentally; eligible for automatic later removal
    /// if never re-referenced. The removal policy is external; the cache
    /// only guarantees it does not itself delete referenced atoms.
    Managed,
    /// Permanently removed.
    Deleted,
}

/// Events driving the [`Lifetime`] state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifetimeEvent {
    /// The atom was written to storage.
    Stored,
    /// A reference was added.
    Added(RefMode),
    /// A reference was released with the given outcome.
    Released(ReleaseOutcome),
    /// External policy deleted the atom.
    Deleted,
}

impl Lifetime {
    /// Advance the state machine. Events that do not apply in the current
    /// state leave it unchanged.
    pub fn step(self, event: LifetimeEvent) -> Self {
        match (self, event) {
            (Self::Transient, LifetimeEvent::Stored) => Self::Stored,
            (Self::Stored | Self::Unreferenced | Self::Managed, LifetimeEvent::Added(mode)) => {
                match mode {
                    RefMode::Hard | RefMode::Floating => Self::Referenced,
                    RefMode::Symbolic => self,
                }
            }
            (Self::Referenced, LifetimeEvent::Released(outcome)) => match outcome {
                ReleaseOutcome::Retained => Self::Referenced,
                ReleaseOutcome::Deletable => Self::Unreferenced,
                ReleaseOutcome::MakeManaged => Self::Managed,
            },
            (Self::Unreferenced | Self::Managed | Self::Transient, LifetimeEvent::Deleted) => {
                Self::Deleted
            }
            _ => self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_codes_round_trip() {
        for mode in [RefMode::Hard, RefMode::Symbolic, RefMode::Floating] {
            assert_eq!(RefMode::from_code(mode.code()), mode);
        }
    }

    #[test]
    fn test_symbolic_may_dangle() {
        let gone = PersistentHandle::generate();
        let r = AtomRef::symbolic(gone);
        assert!(r.is_symbolic());
        let resolved: Option<&str> = r.resolve(|_| None);
        assert_eq!(resolved, None);

        let here = PersistentHandle::generate();
        let r = AtomRef::hard(here);
        assert_eq!(r.resolve(|h| (*h == here).then_some("atom")), Some("atom"));
    }

    #[test]
    fn test_last_hard_reference_permits_removal() {
        let mut state = RefState::new();
        state.add(RefMode::Hard);
        assert!(!state.can_remove());

        assert_eq!(state.release(RefMode::Hard), ReleaseOutcome::Deletable);
        assert!(state.can_remove());
    }

    #[test]
    fn test_floating_blocks_and_dominates_hard() {
        let mut state = RefState::new();
        state.add(RefMode::Hard);
        state.add(RefMode::Floating);

        // Removing only the hard reference keeps the atom pinned.
        assert_eq!(state.release(RefMode::Hard), ReleaseOutcome::Retained);
        assert!(!state.can_remove());

        // Removing the floating one last: managed, not deleted.
        assert_eq!(state.release(RefMode::Floating), ReleaseOutcome::MakeManaged);
        assert!(state.can_remove());
    }

    #[test]
    fn test_floating_history_is_sticky() {
        let mut state = RefState::new();
        state.add(RefMode::Floating);
        state.add(RefMode::Hard);
        assert_eq!(state.release(RefMode::Floating), ReleaseOutcome::Retained);
        // The hard reference exhausts last, but a floating reference existed.
        assert_eq!(state.release(RefMode::Hard), ReleaseOutcome::MakeManaged);
    }

    #[test]
    fn test_symbolic_never_participates() {
        let mut state = RefState::new();
        state.add(RefMode::Symbolic);
        state.add(RefMode::Hard);
        assert!(!state.can_remove());

        assert_eq!(state.release(RefMode::Symbolic), ReleaseOutcome::Retained);
        assert_eq!(state.release(RefMode::Hard), ReleaseOutcome::Deletable);

        state.add(RefMode::Symbolic);
        // A lone symbolic reference never blocks removal.
        assert!(state.can_remove());
        assert_eq!(state.release(RefMode::Symbolic), ReleaseOutcome::Retained);
    }

    #[test]
    #[should_panic(expected = "untracked")]
    fn test_release_untracked_panics() {
        RefState::new().release(RefMode::Hard);
    }

    #[test]
    fn test_lifetime_state_machine() {
        let mut state = RefState::new();
        let mut life = Lifetime::Transient;

        life = life.step(LifetimeEvent::Stored);
        assert_eq!(life, Lifetime::Stored);

        state.add(RefMode::Floating);
        life = life.step(LifetimeEvent::Added(RefMode::Floating));
        assert_eq!(life, Lifetime::Referenced);

        let outcome = state.release(RefMode::Floating);
        life = life.step(LifetimeEvent::Released(outcome));
        assert_eq!(life, Lifetime::Managed);

        // Managed atoms can be re-referenced instead of deleted.
        life = life.step(LifetimeEvent::Added(RefMode::Hard));
        assert_eq!(life, Lifetime::Referenced);

        state.add(RefMode::Hard);
        let outcome = state.release(RefMode::Hard);
        // Floating history is sticky: managed again, not unreferenced.
        life = life.step(LifetimeEvent::Released(outcome));
        assert_eq!(life, Lifetime::Managed);

        life = life.step(LifetimeEvent::Deleted);
        assert_eq!(life, Lifetime::Deleted);

        // Hard-only exhaustion without floating history allows deletion.
        let mut life = Lifetime::Stored.step(LifetimeEvent::Added(RefMode::Hard));
        let mut state = RefState::new();
        state.add(RefMode::Hard);
        life = life.step(LifetimeEvent::Released(state.release(RefMode::Hard)));
        assert_eq!(life, Lifetime::Unreferenced);
        assert_eq!(life.step(LifetimeEvent::Deleted), Lifetime::Deleted);
    }
}
