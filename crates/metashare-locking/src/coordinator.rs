//! The lock coordinator: single entry point for lock requests, permission
//! checks, channel notifications, and release.
//!
//! Lock requests are atomic: either every requested resource is locked or
//! none is. Conflict checking and the grant commit both run inside one
//! critical section around the ledger, so no interleaving thread can grant
//! or release locks between the check and the commit. Stream tracking and
//! copy management mutate only per-resource entries and stay outside that
//! critical section.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::frozen::FrozenCopies;
use crate::grant::{Denial, Grant, LockOutcome};
use crate::ledger::LockLedger;
use crate::mode::{LockId, LockMode, LockState, ResourceActivity, UpgradeState};
use crate::store::DocumentStore;
use crate::streams::{StreamDirection, StreamHandle, StreamRegistry};
use crate::types::{LockError, ResourceId, UserId};

struct OpenStream {
    user: UserId,
    resource: ResourceId,
    direction: StreamDirection,
    lock: LockId,
    /// Set when the stream belongs to a self-closing grant.
    grant_id: Option<u64>,
}

struct SelfClosingGrant {
    user: UserId,
    locks: BTreeMap<ResourceId, LockId>,
    open_streams: usize,
}

/// Coordinates multi-user lock access to shared documents.
///
/// One coordinator per process, constructed by the composition root and
/// passed by reference to consumers.
pub struct LockCoordinator {
    ledger: Mutex<LockLedger>,
    streams: StreamRegistry,
    copies: FrozenCopies,
    open_streams: DashMap<u64, OpenStream>,
    self_closing: DashMap<u64, SelfClosingGrant>,
    next_grant_id: AtomicU64,
}

impl LockCoordinator {
    /// Creates a coordinator on top of the given document store.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            ledger: Mutex::new(LockLedger::new()),
            streams: StreamRegistry::new(),
            copies: FrozenCopies::new(store),
            open_streams: DashMap::new(),
            self_closing: DashMap::new(),
            next_grant_id: AtomicU64::new(1),
        }
    }

    /// The ledger is only ever mutated through this guard. A poisoned
    /// mutex is recovered: the ledger's own operations keep it consistent
    /// even if a panicking thread held the guard.
    fn ledger(&self) -> MutexGuard<'_, LockLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn activity(&self, resource: &ResourceId) -> ResourceActivity {
        ResourceActivity {
            has_open_write_stream: self.streams.has_open_write_stream(resource),
            has_current_copy: self.copies.has_current_copy(resource),
        }
    }

    /// Attempts to lock every requested resource in the requested mode.
    ///
    /// Returns [`LockOutcome::Denied`] naming the blocking users per
    /// conflicting resource if any request conflicts; in that case nothing
    /// was locked. An `Err` is only returned for frozen-copy I/O failures,
    /// and likewise leaves no partial state behind.
    pub fn try_lock(
        &self,
        user: &UserId,
        requests: &BTreeMap<ResourceId, LockMode>,
    ) -> Result<LockOutcome, LockError> {
        let mut ledger = self.ledger();

        let mut conflicts = BTreeMap::new();
        for (resource, mode) in requests {
            let activity = self.activity(resource);
            let blocking = ledger.conflicting_users(user, resource, *mode, &activity);
            if !blocking.is_empty() {
                conflicts.insert(resource.clone(), blocking);
            }
        }
        if !conflicts.is_empty() {
            debug!(%user, conflicts = conflicts.len(), "lock request denied");
            return Ok(LockOutcome::Denied(Denial::new(conflicts)));
        }

        // Materialize frozen copies before touching the ledger so an I/O
        // failure can be rolled back without a partial grant.
        let mut staged: Vec<(&ResourceId, LockState)> = Vec::with_capacity(requests.len());
        for (resource, mode) in requests {
            let state = match mode {
                LockMode::Exclusive => LockState::Exclusive,
                LockMode::UpgradeableRead => LockState::Upgradeable {
                    fsm: UpgradeState::Read,
                },
                LockMode::UpgradeWriteOnce => LockState::Upgradeable {
                    fsm: UpgradeState::ExpectingReread,
                },
                LockMode::ImmutableRead => match self.copies.frozen_copy_for(user, resource) {
                    Ok(copy) => LockState::ImmutableRead { copy },
                    Err(e) => {
                        for (r, state) in &staged {
                            if matches!(state, LockState::ImmutableRead { .. }) {
                                self.copies.release_reference(r, user);
                            }
                        }
                        return Err(e.into());
                    }
                },
            };
            staged.push((resource, state));
        }

        let mut locks = BTreeMap::new();
        for (resource, state) in staged {
            let id = ledger.add_granted(user, resource, state);
            locks.insert(resource.clone(), id);
        }

        let grant = Grant::new(
            self.next_grant_id.fetch_add(1, Ordering::Relaxed),
            user.clone(),
            locks,
        );
        debug!(%user, grant = grant.id(), resources = requests.len(), "locks granted");
        Ok(LockOutcome::Granted(grant))
    }

    /// Attempts to lock further resources and merges them into an existing
    /// grant. On a conflict the grant is left unchanged and the conflict
    /// report is returned.
    pub fn extend(
        &self,
        grant: &mut Grant,
        requests: &BTreeMap<ResourceId, LockMode>,
    ) -> Result<Option<Denial>, LockError> {
        let user = grant.user().clone();
        match self.try_lock(&user, requests)? {
            LockOutcome::Granted(extension) => {
                grant.merge(extension);
                Ok(None)
            }
            LockOutcome::Denied(denial) => Ok(Some(denial)),
        }
    }

    /// Verifies the grant covers the resource (and permits writing, if
    /// requested) and resolves the identifier to open a channel against:
    /// the resource itself, or the frozen copy for an immutable reader.
    pub fn check_permission(
        &self,
        grant: &Grant,
        resource: &ResourceId,
        for_write: bool,
    ) -> Result<ResourceId, LockError> {
        let lock_id = self.privilege(grant, resource)?;
        let ledger = self.ledger();
        let lock = ledger.authorize(grant.user(), resource, lock_id, for_write)?;
        Ok(match lock.frozen_copy() {
            Some(copy) => copy.clone(),
            None => resource.clone(),
        })
    }

    /// Registers an opened channel as a tracked stream and notifies the
    /// lock's upgrade protocol, if it has one.
    pub fn report_channel_opened(
        &self,
        grant: &Grant,
        resource: &ResourceId,
        direction: StreamDirection,
    ) -> Result<StreamHandle, LockError> {
        let lock_id = self.privilege(grant, resource)?;
        {
            let mut ledger = self.ledger();
            let lock = ledger
                .lock_mut(grant.user(), resource, lock_id)
                .ok_or_else(|| LockError::StaleGrant {
                    resource: resource.clone(),
                })?;
            match direction {
                StreamDirection::Read => lock.note_reading_starts(),
                StreamDirection::Write => lock.note_writing_starts(),
            }
        }

        let handle = self.streams.register(resource, direction);
        let grant_id = grant.is_self_closing().then(|| grant.id());
        self.open_streams.insert(
            handle.as_u64(),
            OpenStream {
                user: grant.user().clone(),
                resource: resource.clone(),
                direction,
                lock: lock_id,
                grant_id,
            },
        );

        if let Some(id) = grant_id {
            let mut entry = self
                .self_closing
                .entry(id)
                .or_insert_with(|| SelfClosingGrant {
                    user: grant.user().clone(),
                    locks: grant.locks().clone(),
                    open_streams: 0,
                });
            entry.locks = grant.locks().clone();
            entry.open_streams += 1;
        }

        debug!(user = %grant.user(), %resource, ?direction, stream = handle.as_u64(), "channel opened");
        Ok(handle)
    }

    /// Deregisters a closed channel. A closed write channel invalidates
    /// the resource's frozen copy and completes the lock's one-time write
    /// cycle. The last closed channel of a self-closing grant releases it.
    pub fn report_channel_closed(&self, handle: StreamHandle) -> Result<(), LockError> {
        let (_, info) = self
            .open_streams
            .remove(&handle.as_u64())
            .ok_or(LockError::UnknownStream(handle.as_u64()))?;
        self.streams.unregister(handle)?;

        if info.direction == StreamDirection::Write {
            {
                let mut ledger = self.ledger();
                if let Some(lock) = ledger.lock_mut(&info.user, &info.resource, info.lock) {
                    lock.note_writing_ends();
                }
            }
            self.copies.invalidate(&info.resource);
        }
        debug!(user = %info.user, resource = %info.resource, stream = handle.as_u64(), "channel closed");

        if let Some(grant_id) = info.grant_id {
            let finished = match self.self_closing.get_mut(&grant_id) {
                Some(mut entry) => {
                    entry.open_streams -= 1;
                    entry.open_streams == 0
                }
                None => false,
            };
            if finished {
                if let Some((_, closing)) = self.self_closing.remove(&grant_id) {
                    if let Err(e) = self.release_locks(&closing.user, &closing.locks) {
                        // Another grant may still stream the resource; the
                        // lock stays and can be released explicitly.
                        warn!(user = %closing.user, grant = grant_id, error = %e,
                            "deferred release of self-closing grant failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Releases the grant's lock on one resource, or on all of its
    /// resources. Fails without mutating anything if a tracked stream on
    /// any affected resource is still open.
    pub fn release(&self, grant: &Grant, resource: Option<&ResourceId>) -> Result<(), LockError> {
        let locks = match resource {
            Some(r) => {
                let id = self.privilege(grant, r)?;
                let mut one = BTreeMap::new();
                one.insert(r.clone(), id);
                one
            }
            None => grant.locks().clone(),
        };
        self.release_locks(grant.user(), &locks)
    }

    fn release_locks(
        &self,
        user: &UserId,
        locks: &BTreeMap<ResourceId, LockId>,
    ) -> Result<(), LockError> {
        // Stream probing runs outside the critical section: a stream that
        // opens concurrently produces a safe failure, never a lost lock.
        for resource in locks.keys() {
            if self.streams.is_resource_busy(resource) {
                return Err(LockError::ResourceBusy {
                    resource: resource.clone(),
                });
            }
        }

        let mut ledger = self.ledger();

        // Probe everything before removing anything so a stale grant
        // leaves the ledger untouched.
        for (resource, id) in locks {
            if ledger.lock(user, resource, *id).is_none() {
                return Err(LockError::StaleGrant {
                    resource: resource.clone(),
                });
            }
        }

        for (resource, id) in locks {
            let removed = ledger.remove(user, resource, *id)?;
            if removed.frozen_copy().is_some() {
                self.copies.release_reference(resource, user);
            }
            debug!(%user, %resource, lock = id.as_u64(), "lock released");
        }
        Ok(())
    }

    fn privilege(&self, grant: &Grant, resource: &ResourceId) -> Result<LockId, LockError> {
        grant
            .lock_for(resource)
            .ok_or_else(|| LockError::NoSuchPrivilege {
                user: grant.user().clone(),
                resource: resource.clone(),
            })
    }

    /// Returns true if any lock is recorded for the resource.
    pub fn is_resource_locked(&self, resource: &ResourceId) -> bool {
        self.ledger().has_locks(resource)
    }

    /// Returns the number of tracked streams across all resources.
    pub fn open_stream_count(&self) -> usize {
        self.streams.open_count()
    }
}
