//! Tracked-stream registry: which resources currently have open read or
//! write channels.
//!
//! The registry knows nothing about lock modes; it only tracks channel
//! cardinality per resource and direction. Entries mutate independently
//! per resource, so a concurrent map is enough and no global lock is
//! taken here.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::types::{LockError, ResourceId};

/// Direction of a tracked channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamDirection {
    /// An open read channel.
    Read,
    /// An open write channel.
    Write,
}

/// Handle to a tracked stream, issued on registration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StreamHandle(u64);

impl StreamHandle {
    /// Returns the raw u64 value of this handle.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

#[derive(Default)]
struct StreamSet {
    readers: HashSet<u64>,
    writers: HashSet<u64>,
}

impl StreamSet {
    fn is_empty(&self) -> bool {
        self.readers.is_empty() && self.writers.is_empty()
    }
}

/// Tracks open channels per resource and direction.
pub struct StreamRegistry {
    next_id: AtomicU64,
    by_resource: DashMap<ResourceId, StreamSet>,
    handles: DashMap<u64, (ResourceId, StreamDirection)>,
}

impl StreamRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            by_resource: DashMap::new(),
            handles: DashMap::new(),
        }
    }

    /// Registers an opened channel and returns its handle.
    pub fn register(&self, resource: &ResourceId, direction: StreamDirection) -> StreamHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut set = self.by_resource.entry(resource.clone()).or_default();
        match direction {
            StreamDirection::Read => set.readers.insert(id),
            StreamDirection::Write => set.writers.insert(id),
        };
        drop(set);

        self.handles.insert(id, (resource.clone(), direction));
        StreamHandle(id)
    }

    /// Deregisters a closed channel, removing the resource's entry once no
    /// channels remain. Returns what the handle was tracking.
    pub fn unregister(
        &self,
        handle: StreamHandle,
    ) -> Result<(ResourceId, StreamDirection), LockError> {
        let (_, (resource, direction)) = self
            .handles
            .remove(&handle.0)
            .ok_or(LockError::UnknownStream(handle.0))?;

        if let Some(mut set) = self.by_resource.get_mut(&resource) {
            match direction {
                StreamDirection::Read => set.readers.remove(&handle.0),
                StreamDirection::Write => set.writers.remove(&handle.0),
            };
        }
        self.by_resource.remove_if(&resource, |_, set| set.is_empty());

        Ok((resource, direction))
    }

    /// Returns true if any channel is open on the resource.
    pub fn is_resource_busy(&self, resource: &ResourceId) -> bool {
        self.by_resource
            .get(resource)
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }

    /// Returns true if a write channel is open on the resource.
    pub fn has_open_write_stream(&self, resource: &ResourceId) -> bool {
        self.by_resource
            .get(resource)
            .map(|set| !set.writers.is_empty())
            .unwrap_or(false)
    }

    /// Returns the number of tracked streams across all resources.
    pub fn open_count(&self) -> usize {
        self.handles.len()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res() -> ResourceId {
        ResourceId::new("file:/meta/r1.xml")
    }

    #[test]
    fn test_register_and_unregister() {
        let reg = StreamRegistry::new();
        assert!(!reg.is_resource_busy(&res()));

        let h = reg.register(&res(), StreamDirection::Read);
        assert!(reg.is_resource_busy(&res()));
        assert_eq!(reg.open_count(), 1);

        let (resource, direction) = reg.unregister(h).unwrap();
        assert_eq!(resource, res());
        assert_eq!(direction, StreamDirection::Read);
        assert!(!reg.is_resource_busy(&res()));
        assert_eq!(reg.open_count(), 0);
    }

    #[test]
    fn test_write_stream_probe() {
        let reg = StreamRegistry::new();
        let r = reg.register(&res(), StreamDirection::Read);
        assert!(!reg.has_open_write_stream(&res()));

        let w = reg.register(&res(), StreamDirection::Write);
        assert!(reg.has_open_write_stream(&res()));

        reg.unregister(w).unwrap();
        assert!(!reg.has_open_write_stream(&res()));
        assert!(reg.is_resource_busy(&res()));

        reg.unregister(r).unwrap();
        assert!(!reg.is_resource_busy(&res()));
    }

    #[test]
    fn test_unregister_unknown_handle() {
        let reg = StreamRegistry::new();
        let h = reg.register(&res(), StreamDirection::Read);
        reg.unregister(h).unwrap();

        match reg.unregister(h) {
            Err(LockError::UnknownStream(_)) => {}
            other => panic!("expected UnknownStream, got {:?}", other),
        }
    }

    #[test]
    fn test_independent_resources() {
        let reg = StreamRegistry::new();
        let other = ResourceId::new("file:/meta/r2.xml");

        reg.register(&res(), StreamDirection::Write);
        assert!(!reg.is_resource_busy(&other));
        assert!(!reg.has_open_write_stream(&other));
    }

    #[test]
    fn test_handles_unique() {
        let reg = StreamRegistry::new();
        let a = reg.register(&res(), StreamDirection::Read);
        let b = reg.register(&res(), StreamDirection::Read);
        assert_ne!(a, b);
    }
}
