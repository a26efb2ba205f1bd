//! Result objects of a lock request: granted access, denied access, and
//! the outcome sum of the two.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::mode::LockId;
use crate::types::{ResourceId, UserId};

/// The live result of a successful lock request.
///
/// Holds a reference to each granted lock by resource. A grant is a plain
/// value; releasing it or opening channels against it goes through the
/// [`crate::coordinator::LockCoordinator`] it was issued by.
#[derive(Clone, Debug)]
pub struct Grant {
    id: u64,
    user: UserId,
    locks: BTreeMap<ResourceId, LockId>,
    self_closing: bool,
}

impl Grant {
    pub(crate) fn new(id: u64, user: UserId, locks: BTreeMap<ResourceId, LockId>) -> Self {
        Self {
            id,
            user,
            locks,
            self_closing: false,
        }
    }

    /// Identifier of this grant, unique within one coordinator.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The user this grant was issued to.
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// The resources this grant holds locks for.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceId> {
        self.locks.keys()
    }

    /// The lock this grant holds for a resource, if any.
    pub fn lock_for(&self, resource: &ResourceId) -> Option<LockId> {
        self.locks.get(resource).copied()
    }

    /// Marks the grant as self-closing: the coordinator releases it
    /// automatically once its last tracked stream closes. Intended for
    /// fire-and-forget one-shot reads.
    pub fn self_closing(mut self) -> Self {
        self.self_closing = true;
        self
    }

    /// Returns true if the grant releases itself on last stream close.
    pub fn is_self_closing(&self) -> bool {
        self.self_closing
    }

    pub(crate) fn locks(&self) -> &BTreeMap<ResourceId, LockId> {
        &self.locks
    }

    /// Merges a follow-up grant for the same user into this one.
    ///
    /// An upgrade request yields the same lock identifier the grant
    /// already holds, so merging is idempotent per resource.
    pub fn merge(&mut self, other: Grant) {
        debug_assert_eq!(self.user, other.user);
        self.locks.extend(other.locks);
    }
}

/// The result of a failed lock request: which users block which resource.
///
/// A conflict is expected coordination traffic, not an error; callers
/// decide their own retry policy. A denial cannot be extended or released.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    conflicts: BTreeMap<ResourceId, BTreeSet<UserId>>,
}

impl Denial {
    pub(crate) fn new(conflicts: BTreeMap<ResourceId, BTreeSet<UserId>>) -> Self {
        Self { conflicts }
    }

    /// The conflict report: for every conflicting resource, the users
    /// holding incompatible locks.
    pub fn conflicts(&self) -> &BTreeMap<ResourceId, BTreeSet<UserId>> {
        &self.conflicts
    }

    /// The users blocking a particular resource.
    pub fn blocking_users(&self, resource: &ResourceId) -> Option<&BTreeSet<UserId>> {
        self.conflicts.get(resource)
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (resource, users) in &self.conflicts {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            write!(f, "{} locked by ", resource)?;
            for (i, user) in users.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", user)?;
            }
        }
        Ok(())
    }
}

/// Outcome of a lock request: all requested resources were locked, or
/// none were.
#[derive(Clone, Debug)]
pub enum LockOutcome {
    /// Every requested resource was locked.
    Granted(Grant),
    /// At least one resource conflicted; nothing was locked.
    Denied(Denial),
}

impl LockOutcome {
    /// Returns true if the request was granted.
    pub fn is_granted(&self) -> bool {
        matches!(self, LockOutcome::Granted(_))
    }

    /// Unwraps the grant, if the request was granted.
    pub fn granted(self) -> Option<Grant> {
        match self {
            LockOutcome::Granted(grant) => Some(grant),
            LockOutcome::Denied(_) => None,
        }
    }

    /// Unwraps the conflict report, if the request was denied.
    pub fn denied(self) -> Option<Denial> {
        match self {
            LockOutcome::Granted(_) => None,
            LockOutcome::Denied(denial) => Some(denial),
        }
    }
}
