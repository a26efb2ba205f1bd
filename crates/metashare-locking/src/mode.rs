//! Lock modes, the upgradeable-read state machine, and the compatibility
//! matrix.
//!
//! The four modes form a closed set, so compatibility and write permission
//! are resolved by exhaustive `match` rather than dispatch. `ImmutableRead`
//! carries the frozen-copy identifier it was granted against; the
//! upgradeable kind carries its four-state protocol.

use serde::{Deserialize, Serialize};

use crate::types::{LockError, ResourceId, UserId};

/// The externally requested / visible mode of a lock.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Sole access with write permission. At most one per resource.
    Exclusive,
    /// Read-only access to a frozen point-in-time copy. Combinable with
    /// everything (one narrow exception, see [`Lock::conflicts_with`]).
    ImmutableRead,
    /// Shared read access that can be upgraded once to write access.
    UpgradeableRead,
    /// The upgraded presentation of `UpgradeableRead`. Requesting this mode
    /// while already holding an upgradeable lock upgrades it in place.
    UpgradeWriteOnce,
}

/// State of the one-time write upgrade protocol.
///
/// Monotonic within one upgrade cycle:
/// `Read -> ExpectingReread -> ExpectingWrite -> Writing -> Read`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeState {
    /// Plain shared reading; no upgrade requested.
    Read,
    /// Upgrade requested; the holder must re-read the document before
    /// writing so the write is based on current content.
    ExpectingReread,
    /// Re-read happened; the one-time write is now permitted.
    ExpectingWrite,
    /// A write channel is open.
    Writing,
}

impl UpgradeState {
    /// Requests the one-time write upgrade. Only effective in `Read`.
    pub fn upgrade_for_one_time_write(&mut self) {
        if *self == UpgradeState::Read {
            *self = UpgradeState::ExpectingReread;
        }
    }

    /// A read channel was opened. Completes the re-read requirement.
    pub fn note_reading_starts(&mut self) {
        if *self == UpgradeState::ExpectingReread {
            *self = UpgradeState::ExpectingWrite;
        }
    }

    /// A write channel was opened.
    pub fn note_writing_starts(&mut self) {
        *self = UpgradeState::Writing;
    }

    /// The write channel was closed; the cycle is complete.
    pub fn note_writing_ends(&mut self) {
        if *self == UpgradeState::Writing {
            *self = UpgradeState::Read;
        }
    }
}

/// Mode-specific payload of a granted lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockState {
    /// Exclusive lock; no internal state.
    Exclusive,
    /// Immutable read against a frozen copy.
    ImmutableRead {
        /// Identifier of the frozen copy this holder reads from.
        copy: ResourceId,
    },
    /// Upgradeable read with its one-time write protocol.
    Upgradeable {
        /// Current protocol state.
        fsm: UpgradeState,
    },
}

/// Identifier of a granted lock, unique within one coordinator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockId(u64);

impl LockId {
    /// Creates a LockId from a raw u64 value.
    pub fn new(id: u64) -> Self {
        LockId(id)
    }

    /// Returns the raw u64 value of this lock ID.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// What is currently happening on a resource, as far as the compatibility
/// matrix cares: open write channels and frozen-copy availability.
#[derive(Copy, Clone, Debug, Default)]
pub struct ResourceActivity {
    /// A tracked write stream is currently open on the resource.
    pub has_open_write_stream: bool,
    /// The resource currently has a valid frozen copy.
    pub has_current_copy: bool,
}

/// A granted lock: one mode, one owner, one resource.
///
/// A user may hold several independent locks on the same resource; each is
/// counted separately and all must be released before the resource is
/// unlocked for that user.
#[derive(Clone, Debug)]
pub struct Lock {
    id: LockId,
    owner: UserId,
    resource: ResourceId,
    state: LockState,
}

impl Lock {
    /// Creates a granted lock.
    pub(crate) fn new(id: LockId, owner: UserId, resource: ResourceId, state: LockState) -> Self {
        Self {
            id,
            owner,
            resource,
            state,
        }
    }

    /// Returns this lock's identifier.
    pub fn id(&self) -> LockId {
        self.id
    }

    /// Returns the user that holds this lock.
    pub fn owner(&self) -> &UserId {
        &self.owner
    }

    /// Returns the resource this lock is valid for.
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// The externally visible mode.
    ///
    /// An upgradeable lock presents as `UpgradeableRead` while in plain
    /// `Read` state and as `UpgradeWriteOnce` in every other state.
    pub fn mode(&self) -> LockMode {
        match &self.state {
            LockState::Exclusive => LockMode::Exclusive,
            LockState::ImmutableRead { .. } => LockMode::ImmutableRead,
            LockState::Upgradeable { fsm } => match fsm {
                UpgradeState::Read => LockMode::UpgradeableRead,
                _ => LockMode::UpgradeWriteOnce,
            },
        }
    }

    /// Returns the frozen-copy identifier for an immutable-read lock.
    pub fn frozen_copy(&self) -> Option<&ResourceId> {
        match &self.state {
            LockState::ImmutableRead { copy } => Some(copy),
            _ => None,
        }
    }

    /// Returns the upgrade-protocol state, if this is the upgradeable kind.
    pub fn upgrade_state(&self) -> Option<UpgradeState> {
        match &self.state {
            LockState::Upgradeable { fsm } => Some(*fsm),
            _ => None,
        }
    }

    /// Requests the one-time write upgrade on an upgradeable lock.
    pub(crate) fn upgrade_for_one_time_write(&mut self) {
        if let LockState::Upgradeable { fsm } = &mut self.state {
            fsm.upgrade_for_one_time_write();
        }
    }

    /// Notifies the lock that a read channel opened on its resource.
    pub(crate) fn note_reading_starts(&mut self) {
        if let LockState::Upgradeable { fsm } = &mut self.state {
            fsm.note_reading_starts();
        }
    }

    /// Notifies the lock that a write channel opened on its resource.
    pub(crate) fn note_writing_starts(&mut self) {
        if let LockState::Upgradeable { fsm } = &mut self.state {
            fsm.note_writing_starts();
        }
    }

    /// Notifies the lock that a write channel on its resource closed.
    pub(crate) fn note_writing_ends(&mut self) {
        if let LockState::Upgradeable { fsm } = &mut self.state {
            fsm.note_writing_ends();
        }
    }

    /// Decides whether granting `requested` to *another* user would
    /// conflict with this held lock.
    ///
    /// `activity` feeds the one context-dependent cell of the matrix: an
    /// exclusive holder blocks new immutable readers only while a write
    /// stream is open and no frozen copy exists to serve them from.
    pub fn conflicts_with(&self, requested: LockMode, activity: &ResourceActivity) -> bool {
        match (&self.state, requested) {
            (LockState::Exclusive, LockMode::ImmutableRead) => {
                activity.has_open_write_stream && !activity.has_current_copy
            }
            (LockState::Exclusive, _) => true,

            (LockState::ImmutableRead { .. }, _) => false,

            (LockState::Upgradeable { .. }, LockMode::Exclusive) => true,
            (LockState::Upgradeable { .. }, LockMode::UpgradeWriteOnce) => true,
            (LockState::Upgradeable { fsm }, LockMode::ImmutableRead) => {
                *fsm == UpgradeState::Writing
            }
            (LockState::Upgradeable { .. }, LockMode::UpgradeableRead) => false,
        }
    }

    /// Checks whether this lock currently permits writing.
    ///
    /// `Exclusive` always does. `ImmutableRead` never does. The upgradeable
    /// kind permits writing only in `ExpectingWrite`; `ExpectingReread`
    /// reports the distinct protocol error because the holder skipped the
    /// required re-read.
    pub fn write_permission(&self) -> Result<(), LockError> {
        match &self.state {
            LockState::Exclusive => Ok(()),
            LockState::ImmutableRead { .. } => Err(LockError::AccessDenied {
                resource: self.resource.clone(),
            }),
            LockState::Upgradeable { fsm } => match fsm {
                UpgradeState::ExpectingWrite => Ok(()),
                UpgradeState::ExpectingReread => Err(LockError::ExpectedRereadMissing {
                    resource: self.resource.clone(),
                }),
                UpgradeState::Read | UpgradeState::Writing => Err(LockError::AccessDenied {
                    resource: self.resource.clone(),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgradeable(fsm: UpgradeState) -> Lock {
        Lock::new(
            LockId::new(1),
            UserId::new("alice"),
            ResourceId::new("r"),
            LockState::Upgradeable { fsm },
        )
    }

    fn exclusive() -> Lock {
        Lock::new(
            LockId::new(2),
            UserId::new("alice"),
            ResourceId::new("r"),
            LockState::Exclusive,
        )
    }

    fn immutable() -> Lock {
        Lock::new(
            LockId::new(3),
            UserId::new("alice"),
            ResourceId::new("r"),
            LockState::ImmutableRead {
                copy: ResourceId::new("r.frozen"),
            },
        )
    }

    #[test]
    fn test_fsm_full_cycle() {
        let mut s = UpgradeState::Read;
        s.upgrade_for_one_time_write();
        assert_eq!(s, UpgradeState::ExpectingReread);
        s.note_reading_starts();
        assert_eq!(s, UpgradeState::ExpectingWrite);
        s.note_writing_starts();
        assert_eq!(s, UpgradeState::Writing);
        s.note_writing_ends();
        assert_eq!(s, UpgradeState::Read);
    }

    #[test]
    fn test_fsm_noop_transitions() {
        let mut s = UpgradeState::ExpectingWrite;
        s.upgrade_for_one_time_write();
        assert_eq!(s, UpgradeState::ExpectingWrite);

        let mut s = UpgradeState::Read;
        s.note_reading_starts();
        assert_eq!(s, UpgradeState::Read);

        let mut s = UpgradeState::ExpectingReread;
        s.note_writing_ends();
        assert_eq!(s, UpgradeState::ExpectingReread);
    }

    #[test]
    fn test_visible_mode_tracks_fsm() {
        let mut lock = upgradeable(UpgradeState::Read);
        assert_eq!(lock.mode(), LockMode::UpgradeableRead);

        lock.upgrade_for_one_time_write();
        assert_eq!(lock.mode(), LockMode::UpgradeWriteOnce);
        lock.note_reading_starts();
        assert_eq!(lock.mode(), LockMode::UpgradeWriteOnce);
        lock.note_writing_starts();
        assert_eq!(lock.mode(), LockMode::UpgradeWriteOnce);
        lock.note_writing_ends();
        assert_eq!(lock.mode(), LockMode::UpgradeableRead);
    }

    #[test]
    fn test_exclusive_conflicts() {
        let lock = exclusive();
        let idle = ResourceActivity::default();

        assert!(lock.conflicts_with(LockMode::Exclusive, &idle));
        assert!(lock.conflicts_with(LockMode::UpgradeableRead, &idle));
        assert!(lock.conflicts_with(LockMode::UpgradeWriteOnce, &idle));
        assert!(!lock.conflicts_with(LockMode::ImmutableRead, &idle));
    }

    #[test]
    fn test_exclusive_blocks_immutable_only_while_writing_without_copy() {
        let lock = exclusive();

        let writing_no_copy = ResourceActivity {
            has_open_write_stream: true,
            has_current_copy: false,
        };
        assert!(lock.conflicts_with(LockMode::ImmutableRead, &writing_no_copy));

        let writing_with_copy = ResourceActivity {
            has_open_write_stream: true,
            has_current_copy: true,
        };
        assert!(!lock.conflicts_with(LockMode::ImmutableRead, &writing_with_copy));
    }

    #[test]
    fn test_immutable_read_conflicts_with_nothing() {
        let lock = immutable();
        let busy = ResourceActivity {
            has_open_write_stream: true,
            has_current_copy: false,
        };
        for mode in [
            LockMode::Exclusive,
            LockMode::ImmutableRead,
            LockMode::UpgradeableRead,
            LockMode::UpgradeWriteOnce,
        ] {
            assert!(!lock.conflicts_with(mode, &busy));
        }
    }

    #[test]
    fn test_upgradeable_conflicts_per_state() {
        let idle = ResourceActivity::default();

        for fsm in [
            UpgradeState::Read,
            UpgradeState::ExpectingReread,
            UpgradeState::ExpectingWrite,
        ] {
            let lock = upgradeable(fsm);
            assert!(lock.conflicts_with(LockMode::Exclusive, &idle));
            assert!(lock.conflicts_with(LockMode::UpgradeWriteOnce, &idle));
            assert!(!lock.conflicts_with(LockMode::ImmutableRead, &idle));
            assert!(!lock.conflicts_with(LockMode::UpgradeableRead, &idle));
        }

        let writing = upgradeable(UpgradeState::Writing);
        assert!(writing.conflicts_with(LockMode::Exclusive, &idle));
        assert!(writing.conflicts_with(LockMode::ImmutableRead, &idle));
        assert!(writing.conflicts_with(LockMode::UpgradeWriteOnce, &idle));
        assert!(!writing.conflicts_with(LockMode::UpgradeableRead, &idle));
    }

    #[test]
    fn test_write_permission() {
        assert!(exclusive().write_permission().is_ok());

        match immutable().write_permission() {
            Err(LockError::AccessDenied { .. }) => {}
            other => panic!("expected AccessDenied, got {:?}", other),
        }

        assert!(upgradeable(UpgradeState::ExpectingWrite)
            .write_permission()
            .is_ok());

        match upgradeable(UpgradeState::Read).write_permission() {
            Err(LockError::AccessDenied { .. }) => {}
            other => panic!("expected AccessDenied, got {:?}", other),
        }

        match upgradeable(UpgradeState::ExpectingReread).write_permission() {
            Err(LockError::ExpectedRereadMissing { .. }) => {}
            other => panic!("expected ExpectedRereadMissing, got {:?}", other),
        }

        match upgradeable(UpgradeState::Writing).write_permission() {
            Err(LockError::AccessDenied { .. }) => {}
            other => panic!("expected AccessDenied, got {:?}", other),
        }
    }

    #[test]
    fn test_frozen_copy_accessor() {
        assert_eq!(
            immutable().frozen_copy(),
            Some(&ResourceId::new("r.frozen"))
        );
        assert_eq!(exclusive().frozen_copy(), None);
    }
}
