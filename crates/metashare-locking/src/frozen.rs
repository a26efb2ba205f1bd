//! Immutable-copy management: creates, reference-counts, and deletes the
//! temporary frozen copies served to immutable readers.
//!
//! Per resource there is at most one "current" copy. It is created lazily
//! on the first immutable-read request after the source changed and
//! forgotten (not deleted) when a write completes; the file itself is
//! reclaimed once the last reader pointing at it releases. Deletion
//! failures are logged and absorbed since they cost disk space, not
//! correctness.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::store::DocumentStore;
use crate::types::{ResourceId, UserId};

struct UserCopy {
    copy: ResourceId,
    refs: u32,
}

#[derive(Default)]
struct CopyState {
    current: Option<ResourceId>,
    by_user: HashMap<UserId, UserCopy>,
}

impl CopyState {
    fn is_empty(&self) -> bool {
        self.current.is_none() && self.by_user.is_empty()
    }

    /// A copy file may be deleted only when neither the current-copy slot
    /// nor any user's reference still points at it.
    fn is_reachable(&self, copy: &ResourceId) -> bool {
        self.current.as_ref() == Some(copy) || self.by_user.values().any(|uc| &uc.copy == copy)
    }
}

/// Manages frozen copies per resource. Entries mutate independently per
/// resource; no global lock is taken here.
pub struct FrozenCopies {
    store: Arc<dyn DocumentStore>,
    copies: DashMap<ResourceId, CopyState>,
}

impl FrozenCopies {
    /// Creates copy management on top of the given document store.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            copies: DashMap::new(),
        }
    }

    /// Returns the copy identifier `user` should read from, creating the
    /// resource's current copy if none exists and counting the reference.
    ///
    /// A user who already holds a copy reference for the resource keeps
    /// getting the same copy, with its use-count incremented.
    pub fn frozen_copy_for(&self, user: &UserId, resource: &ResourceId) -> io::Result<ResourceId> {
        let mut state = self.copies.entry(resource.clone()).or_default();

        if let Some(held) = state.by_user.get_mut(user) {
            held.refs += 1;
            return Ok(held.copy.clone());
        }

        let current = match &state.current {
            Some(copy) => copy.clone(),
            None => {
                let copy = match self.store.duplicate(resource) {
                    Ok(copy) => copy,
                    Err(e) => {
                        let empty = state.is_empty();
                        drop(state);
                        if empty {
                            self.copies.remove_if(resource, |_, s| s.is_empty());
                        }
                        return Err(e);
                    }
                };
                debug!(%resource, copy = %copy, "created frozen copy");
                state.current = Some(copy.clone());
                copy
            }
        };

        state.by_user.insert(
            user.clone(),
            UserCopy {
                copy: current.clone(),
                refs: 1,
            },
        );
        Ok(current)
    }

    /// Returns the resource's current copy identifier, creating one if
    /// none exists. Does not count a reference.
    pub fn get_or_create_current(&self, resource: &ResourceId) -> io::Result<ResourceId> {
        let mut state = self.copies.entry(resource.clone()).or_default();
        match &state.current {
            Some(copy) => Ok(copy.clone()),
            None => {
                let copy = self.store.duplicate(resource)?;
                debug!(%resource, copy = %copy, "created frozen copy");
                state.current = Some(copy.clone());
                Ok(copy)
            }
        }
    }

    /// Forgets the resource's current-copy association after its content
    /// changed. The file itself stays until its last reader releases.
    pub fn invalidate(&self, resource: &ResourceId) {
        if let Some(mut state) = self.copies.get_mut(resource) {
            state.current = None;
        }
        self.copies.remove_if(resource, |_, s| s.is_empty());
    }

    /// Drops one of `user`'s references to their held copy. At zero the
    /// per-user entry is removed and the copy file is deleted, provided no
    /// other user still points at it and it is not the current copy.
    pub fn release_reference(&self, resource: &ResourceId, user: &UserId) {
        let mut orphan = None;
        if let Some(mut state) = self.copies.get_mut(resource) {
            let emptied = match state.by_user.get_mut(user) {
                Some(held) => {
                    held.refs -= 1;
                    held.refs == 0
                }
                None => {
                    debug!(%resource, %user, "release of unheld copy reference ignored");
                    false
                }
            };
            if emptied {
                let released = state.by_user.remove(user).map(|uc| uc.copy);
                if let Some(copy) = released {
                    if !state.is_reachable(&copy) {
                        orphan = Some(copy);
                    }
                }
            }
        }

        if let Some(copy) = orphan {
            if let Err(e) = self.store.delete(&copy) {
                warn!(%resource, copy = %copy, error = %e, "failed to delete frozen copy");
            } else {
                debug!(%resource, copy = %copy, "deleted frozen copy");
            }
        }
        self.copies.remove_if(resource, |_, s| s.is_empty());
    }

    /// Returns true if the resource currently has a valid frozen copy.
    pub fn has_current_copy(&self, resource: &ResourceId) -> bool {
        self.copies
            .get(resource)
            .map(|state| state.current.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn setup() -> (Arc<InMemoryStore>, FrozenCopies, ResourceId) {
        let store = Arc::new(InMemoryStore::new());
        let resource = ResourceId::new("meta/record.xml");
        store.put(resource.clone(), b"<mets/>".to_vec());
        let copies = FrozenCopies::new(store.clone());
        (store, copies, resource)
    }

    fn alice() -> UserId {
        UserId::new("alice")
    }

    fn bob() -> UserId {
        UserId::new("bob")
    }

    #[test]
    fn test_same_copy_for_all_readers() {
        let (_, copies, res) = setup();

        let a = copies.frozen_copy_for(&alice(), &res).unwrap();
        let b = copies.frozen_copy_for(&bob(), &res).unwrap();
        assert_eq!(a, b);
        assert!(copies.has_current_copy(&res));
    }

    #[test]
    fn test_refcount_delays_deletion() {
        let (store, copies, res) = setup();

        let copy = copies.frozen_copy_for(&alice(), &res).unwrap();
        copies.frozen_copy_for(&alice(), &res).unwrap(); // second reference

        copies.invalidate(&res);
        copies.release_reference(&res, &alice());
        assert!(store.get(&copy).is_some(), "still one reference");

        copies.release_reference(&res, &alice());
        assert!(store.get(&copy).is_none(), "last release deletes");
        assert!(!copies.has_current_copy(&res));
    }

    #[test]
    fn test_current_copy_survives_release() {
        let (store, copies, res) = setup();

        let copy = copies.frozen_copy_for(&alice(), &res).unwrap();
        copies.release_reference(&res, &alice());

        // Still the current copy, so the file must not be deleted.
        assert!(store.get(&copy).is_some());
        assert!(copies.has_current_copy(&res));
    }

    #[test]
    fn test_invalidate_forces_new_copy() {
        let (_, copies, res) = setup();

        let first = copies.frozen_copy_for(&alice(), &res).unwrap();
        copies.invalidate(&res);
        assert!(!copies.has_current_copy(&res));

        let second = copies.frozen_copy_for(&bob(), &res).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_reader_keeps_stale_copy_after_invalidate() {
        let (store, copies, res) = setup();

        let stale = copies.frozen_copy_for(&alice(), &res).unwrap();
        copies.invalidate(&res);
        let fresh = copies.frozen_copy_for(&bob(), &res).unwrap();

        // Alice still reads her stale copy; it is deleted only when she
        // releases, while Bob's fresh copy lives on.
        assert_ne!(stale, fresh);
        copies.release_reference(&res, &alice());
        assert!(store.get(&stale).is_none());
        assert!(store.get(&fresh).is_some());
    }

    #[test]
    fn test_duplicate_failure_leaves_no_residue() {
        let store = Arc::new(InMemoryStore::new());
        let copies = FrozenCopies::new(store);
        let absent = ResourceId::new("meta/missing.xml");

        assert!(copies.frozen_copy_for(&alice(), &absent).is_err());
        assert!(!copies.has_current_copy(&absent));
    }

    #[test]
    fn test_get_or_create_current_reuses() {
        let (_, copies, res) = setup();
        let a = copies.get_or_create_current(&res).unwrap();
        let b = copies.get_or_create_current(&res).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_release_without_reference_is_ignored() {
        let (_, copies, res) = setup();
        copies.release_reference(&res, &alice());
        assert!(!copies.has_current_copy(&res));
    }
}
