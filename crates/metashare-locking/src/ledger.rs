//! The permission ledger: per-resource record of which user holds which
//! locks.
//!
//! The ledger is a plain map owned by the coordinator and mutated only
//! inside its critical section; it performs no synchronization of its own.

use std::collections::{BTreeSet, HashMap};

use crate::mode::{Lock, LockId, LockMode, LockState, ResourceActivity, UpgradeState};
use crate::types::{LockError, ResourceId, UserId};

/// Records granted locks per resource and per user.
///
/// The per-resource entry is created on first grant and deleted when the
/// last lock on the resource is removed, so an absent entry means the
/// resource is fully unlocked.
pub struct LockLedger {
    entries: HashMap<ResourceId, HashMap<UserId, Vec<Lock>>>,
    next_lock_id: u64,
}

impl LockLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_lock_id: 1,
        }
    }

    /// Collects the users whose held locks conflict with `requested`.
    ///
    /// Only *other* users' locks count: a user never conflicts with
    /// themselves, which is what makes in-place upgrades possible.
    pub fn conflicting_users(
        &self,
        user: &UserId,
        resource: &ResourceId,
        requested: LockMode,
        activity: &ResourceActivity,
    ) -> BTreeSet<UserId> {
        let mut blocking = BTreeSet::new();
        if let Some(by_user) = self.entries.get(resource) {
            for (holder, locks) in by_user {
                if holder == user {
                    continue;
                }
                if locks.iter().any(|l| l.conflicts_with(requested, activity)) {
                    blocking.insert(holder.clone());
                }
            }
        }
        blocking
    }

    /// Records a granted lock and returns its identifier.
    ///
    /// An upgrade request (`Upgradeable` in `ExpectingReread`, i.e. a
    /// `UpgradeWriteOnce` grant) against a user who already holds an
    /// upgradeable lock on the resource upgrades that lock in place and
    /// returns the existing identifier instead of recording a second lock.
    pub fn add_granted(&mut self, user: &UserId, resource: &ResourceId, state: LockState) -> LockId {
        let is_upgrade = matches!(
            state,
            LockState::Upgradeable {
                fsm: UpgradeState::ExpectingReread
            }
        );
        if is_upgrade {
            if let Some(existing) = self.find_upgradeable_mut(user, resource) {
                existing.upgrade_for_one_time_write();
                return existing.id();
            }
        }

        let id = LockId::new(self.next_lock_id);
        self.next_lock_id += 1;

        let lock = Lock::new(id, user.clone(), resource.clone(), state);
        self.entries
            .entry(resource.clone())
            .or_default()
            .entry(user.clone())
            .or_default()
            .push(lock);
        id
    }

    fn find_upgradeable_mut(&mut self, user: &UserId, resource: &ResourceId) -> Option<&mut Lock> {
        self.entries
            .get_mut(resource)?
            .get_mut(user)?
            .iter_mut()
            .find(|l| l.upgrade_state().is_some())
    }

    /// Looks up a recorded lock.
    pub fn lock(&self, user: &UserId, resource: &ResourceId, id: LockId) -> Option<&Lock> {
        self.entries
            .get(resource)?
            .get(user)?
            .iter()
            .find(|l| l.id() == id)
    }

    /// Looks up a recorded lock for mutation (FSM notifications).
    pub fn lock_mut(
        &mut self,
        user: &UserId,
        resource: &ResourceId,
        id: LockId,
    ) -> Option<&mut Lock> {
        self.entries
            .get_mut(resource)?
            .get_mut(user)?
            .iter_mut()
            .find(|l| l.id() == id)
    }

    /// Verifies that `user` actually holds the referenced lock and, for
    /// write access, that its mode and state currently permit writing.
    pub fn authorize(
        &self,
        user: &UserId,
        resource: &ResourceId,
        id: LockId,
        for_write: bool,
    ) -> Result<&Lock, LockError> {
        let lock = self
            .lock(user, resource, id)
            .ok_or_else(|| LockError::StaleGrant {
                resource: resource.clone(),
            })?;
        if for_write {
            lock.write_permission()?;
        }
        Ok(lock)
    }

    /// Removes a recorded lock, pruning the per-user and per-resource
    /// entries once empty. Returns the removed lock.
    pub fn remove(
        &mut self,
        user: &UserId,
        resource: &ResourceId,
        id: LockId,
    ) -> Result<Lock, LockError> {
        let stale = || LockError::StaleGrant {
            resource: resource.clone(),
        };

        let by_user = self.entries.get_mut(resource).ok_or_else(stale)?;
        let locks = by_user.get_mut(user).ok_or_else(stale)?;
        let pos = locks.iter().position(|l| l.id() == id).ok_or_else(stale)?;
        let removed = locks.remove(pos);

        if locks.is_empty() {
            by_user.remove(user);
        }
        if by_user.is_empty() {
            self.entries.remove(resource);
        }
        Ok(removed)
    }

    /// Returns true if any lock at all is recorded for the resource.
    pub fn has_locks(&self, resource: &ResourceId) -> bool {
        self.entries.contains_key(resource)
    }
}

impl Default for LockLedger {
    fn default() -> Self {
        Self::new()
    }
}
