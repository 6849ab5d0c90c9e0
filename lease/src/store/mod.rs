// Versioned storage of the ledger object.
//
// Every store hands out content and version together and only accepts a
// write against the version the writer read. Writes replace the whole object.

mod http;

pub use http::HttpObjectStore;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};

use crate::{slot::Version, Error, Result};

/// Raw ledger content and the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub content: Bytes,
    pub version: Version,
}

#[async_trait]
pub trait LeaseStore: Send + Sync + std::fmt::Debug {
    /// Fetch the current content. Fails with `StoreUnavailable` when the
    /// object cannot be read.
    async fn get(&self) -> Result<Versioned>;

    /// Replace the content if the stored version still equals `expected`,
    /// returning the new version. Fails with `VersionConflict` otherwise and
    /// leaves the stored object untouched.
    async fn put(&self, content: Bytes, expected: &Version) -> Result<Version>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub content: Bytes,
    pub version: Version,
}

/// In-process object bucket with conditional writes.
///
/// Versions come from a per-bucket generation counter, so rewriting identical
/// bytes still yields a new version.
#[derive(Debug, Default)]
pub struct ObjectBucket {
    objects: DashMap<String, StoredObject>,
    generation: AtomicU64,
}

impl ObjectBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<StoredObject> {
        self.objects.get(name).map(|entry| entry.value().clone())
    }

    /// Store `content` under `name`.
    ///
    /// With `if_match` the write only happens when the object exists at
    /// exactly that version. Without it the write is unconditional.
    pub fn put(&self, name: &str, content: Bytes, if_match: Option<&Version>) -> Result<Version> {
        match self.objects.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                if let Some(expected) = if_match {
                    if &entry.get().version != expected {
                        return Err(Error::VersionConflict {
                            expected: expected.clone(),
                        });
                    }
                }
                let version = self.next_version();
                entry.insert(StoredObject {
                    content,
                    version: version.clone(),
                });
                Ok(version)
            }
            Entry::Vacant(entry) => {
                if let Some(expected) = if_match {
                    return Err(Error::VersionConflict {
                        expected: expected.clone(),
                    });
                }
                let version = self.next_version();
                entry.insert(StoredObject {
                    content,
                    version: version.clone(),
                });
                Ok(version)
            }
        }
    }

    /// Unconditional replace.
    pub fn upload(&self, name: &str, content: Bytes) -> Version {
        let version = self.next_version();
        self.objects.insert(
            name.to_string(),
            StoredObject {
                content,
                version: version.clone(),
            },
        );
        version
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn next_version(&self) -> Version {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Version::new(format!("\"{generation:016x}\""))
    }
}

/// A single ledger object inside an [`ObjectBucket`].
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    bucket: Arc<ObjectBucket>,
    object: String,
}

impl InMemoryStore {
    pub fn new(object: impl Into<String>) -> Self {
        Self::with_bucket(Arc::new(ObjectBucket::new()), object)
    }

    pub fn with_bucket(bucket: Arc<ObjectBucket>, object: impl Into<String>) -> Self {
        Self {
            bucket,
            object: object.into(),
        }
    }

    /// Unconditional upload, used to provision a ledger.
    pub fn seed(&self, content: impl Into<Bytes>) -> Version {
        self.bucket.upload(&self.object, content.into())
    }

    pub fn bucket(&self) -> &Arc<ObjectBucket> {
        &self.bucket
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new("leases")
    }
}

#[async_trait]
impl LeaseStore for InMemoryStore {
    async fn get(&self) -> Result<Versioned> {
        let object = self
            .bucket
            .get(&self.object)
            .ok_or_else(|| Error::unavailable(format!("object {} not found", self.object)))?;
        Ok(Versioned {
            content: object.content,
            version: object.version,
        })
    }

    async fn put(&self, content: Bytes, expected: &Version) -> Result<Version> {
        self.bucket.put(&self.object, content, Some(expected))
    }
}
