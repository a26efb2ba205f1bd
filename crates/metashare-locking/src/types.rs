//! Identifier newtypes and the crate-wide error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle to a lockable document, issued by the document store.
///
/// Wraps the document's URI. Used as the key for every per-resource map in
/// the subsystem.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(String);

impl ResourceId {
    /// Creates a ResourceId from a URI string.
    pub fn new(uri: impl Into<String>) -> Self {
        ResourceId(uri.into())
    }

    /// Returns the URI as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier naming a lock holder, supplied by the session layer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Creates a UserId from a stable user name.
    pub fn new(name: impl Into<String>) -> Self {
        UserId(name.into())
    }

    /// Returns the user name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error types for lock coordination.
///
/// Lock conflicts are not errors: `try_lock` reports them as data via
/// [`crate::grant::Denial`]. Everything here is either caller misuse or an
/// I/O failure from frozen-copy handling.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The presented grant holds no lock for the resource.
    #[error("user '{user}' claims a privilege on {resource} it does not have")]
    NoSuchPrivilege {
        /// User the grant was issued to
        user: UserId,
        /// Resource the caller tried to use
        resource: ResourceId,
    },

    /// The lock's mode or state does not permit writing.
    #[error("lock on {resource} does not permit writing")]
    AccessDenied {
        /// Resource the write was attempted on
        resource: ResourceId,
    },

    /// Write attempted through an upgraded lock before the required re-read.
    ///
    /// Distinct from [`LockError::AccessDenied`]: the caller's protocol is
    /// wrong, not merely unauthorized.
    #[error("write on {resource} attempted before the required re-read")]
    ExpectedRereadMissing {
        /// Resource the premature write was attempted on
        resource: ResourceId,
    },

    /// Release attempted while a tracked stream on the resource is open.
    #[error("resource {resource} still has open streams and cannot be unlocked")]
    ResourceBusy {
        /// Resource that is still streaming
        resource: ResourceId,
    },

    /// The grant references a lock that is no longer recorded in the ledger.
    #[error("grant references a lock no longer recorded for {resource}")]
    StaleGrant {
        /// Resource the vanished lock was for
        resource: ResourceId,
    },

    /// Stream handle is not registered with the coordinator.
    #[error("unknown stream handle {0}")]
    UnknownStream(u64),

    /// A lower-level I/O error from frozen-copy creation.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
