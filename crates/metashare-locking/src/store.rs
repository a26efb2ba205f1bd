//! Document-store seam: the byte-copy and delete primitives consumed by
//! immutable-copy management.
//!
//! The coordinator only ever duplicates a resource into a fresh temporary
//! identifier and deletes such temporaries again; actual document reads and
//! writes happen outside this crate once a lock has been granted.

use std::io;
use std::path::PathBuf;

use dashmap::DashMap;
use uuid::Uuid;

use crate::types::ResourceId;

/// Backend primitives for frozen-copy management.
///
/// Implementations are injected as `Arc<dyn DocumentStore>` by the
/// composition root.
pub trait DocumentStore: Send + Sync {
    /// Duplicates `source` byte-for-byte into a new temporary resource in
    /// the same namespace and returns its identifier.
    fn duplicate(&self, source: &ResourceId) -> io::Result<ResourceId>;

    /// Deletes a resource. Only ever called on temporaries this store
    /// created via [`DocumentStore::duplicate`].
    fn delete(&self, resource: &ResourceId) -> io::Result<()>;
}

/// Names a frozen copy so it is recognizable and collectable as a
/// temporary artifact.
fn temp_copy_id(source: &ResourceId) -> ResourceId {
    ResourceId::new(format!("{}.frozen-{}.tmp", source, Uuid::new_v4()))
}

/// Document store backed by a directory on the shared filesystem.
///
/// Resource identifiers are interpreted as paths relative to the root
/// directory.
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    /// Creates a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, resource: &ResourceId) -> PathBuf {
        self.root.join(resource.as_str())
    }
}

impl DocumentStore for FsDocumentStore {
    fn duplicate(&self, source: &ResourceId) -> io::Result<ResourceId> {
        let copy = temp_copy_id(source);
        std::fs::copy(self.resolve(source), self.resolve(&copy))?;
        Ok(copy)
    }

    fn delete(&self, resource: &ResourceId) -> io::Result<()> {
        std::fs::remove_file(self.resolve(resource))
    }
}

/// In-memory document store for tests and embedded use.
pub struct InMemoryStore {
    documents: DashMap<ResourceId, Vec<u8>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            documents: DashMap::new(),
        }
    }

    /// Inserts or replaces a document.
    pub fn put(&self, resource: ResourceId, content: Vec<u8>) {
        self.documents.insert(resource, content);
    }

    /// Returns a document's content, if present.
    pub fn get(&self, resource: &ResourceId) -> Option<Vec<u8>> {
        self.documents.get(resource).map(|c| c.value().clone())
    }

    /// Returns the number of stored documents (originals and copies).
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Returns true if no documents are stored.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for InMemoryStore {
    fn duplicate(&self, source: &ResourceId) -> io::Result<ResourceId> {
        let content = self
            .get(source)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, source.to_string()))?;
        let copy = temp_copy_id(source);
        self.documents.insert(copy.clone(), content);
        Ok(copy)
    }

    fn delete(&self, resource: &ResourceId) -> io::Result<()> {
        self.documents
            .remove(resource)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, resource.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_duplicate_is_byte_identical() {
        let store = InMemoryStore::new();
        let src = ResourceId::new("meta/record.xml");
        store.put(src.clone(), b"<mets/>".to_vec());

        let copy = store.duplicate(&src).unwrap();
        assert_ne!(copy, src);
        assert!(copy.as_str().contains(".frozen-"));
        assert_eq!(store.get(&copy).unwrap(), b"<mets/>".to_vec());
    }

    #[test]
    fn test_memory_duplicate_missing_source() {
        let store = InMemoryStore::new();
        let err = store.duplicate(&ResourceId::new("absent")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_memory_delete() {
        let store = InMemoryStore::new();
        let src = ResourceId::new("meta/record.xml");
        store.put(src.clone(), vec![1, 2, 3]);
        let copy = store.duplicate(&src).unwrap();

        store.delete(&copy).unwrap();
        assert!(store.get(&copy).is_none());
        assert!(store.delete(&copy).is_err());
    }

    #[test]
    fn test_copies_get_distinct_names() {
        let store = InMemoryStore::new();
        let src = ResourceId::new("meta/record.xml");
        store.put(src.clone(), vec![0]);

        let a = store.duplicate(&src).unwrap();
        let b = store.duplicate(&src).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fs_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("record.xml"), b"<mets/>").unwrap();

        let store = FsDocumentStore::new(dir.path());
        let src = ResourceId::new("record.xml");

        let copy = store.duplicate(&src).unwrap();
        let copied = std::fs::read(dir.path().join(copy.as_str())).unwrap();
        assert_eq!(copied, b"<mets/>");

        store.delete(&copy).unwrap();
        assert!(!dir.path().join(copy.as_str()).exists());
    }
}
