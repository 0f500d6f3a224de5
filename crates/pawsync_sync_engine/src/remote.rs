//! The remote document store the engine drains into.
//!
//! The engine only talks to the backend through [`RemoteStore`]. Each entity
//! type maps to one collection ([`EntityType::collection`]) and every document
//! carries a version, bumped on each write, which the engine uses for
//! optimistic concurrency.
//!
//! [`EntityType::collection`]: pawsync_protocol::EntityType::collection

use async_trait::async_trait;
use pawsync_core::SharedClock;
use pawsync_protocol::{EntityPayload, ListFilter, RemoteDocument};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors returned by a [`RemoteStore`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// The backend could not be reached.
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    /// The backend did not answer in time.
    #[error("remote call timed out")]
    Timeout,

    /// No such document.
    #[error("document {collection}/{id} not found")]
    NotFound {
        /// Collection.
        collection: String,
        /// Document id.
        id: String,
    },

    /// The document moved past the expected version.
    #[error("version conflict: server is at version {}", current.version)]
    VersionConflict {
        /// The server's current document.
        current: Box<RemoteDocument>,
    },

    /// A create hit an existing document.
    #[error("document already exists at version {}", current.version)]
    AlreadyExists {
        /// The server's current document.
        current: Box<RemoteDocument>,
    },

    /// Credentials were refused.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The backend refused the payload.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Narrow interface to the backend document database.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Creates a document. A tombstoned id may be created again.
    async fn create_document(
        &self,
        collection: &str,
        id: &str,
        data: &EntityPayload,
    ) -> RemoteResult<RemoteDocument>;

    /// Replaces a document's data if it is still at `expected_version`.
    ///
    /// `None` skips the version check.
    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        data: &EntityPayload,
        expected_version: Option<u64>,
    ) -> RemoteResult<RemoteDocument>;

    /// Tombstones a document. Returns the tombstone.
    async fn delete_document(
        &self,
        collection: &str,
        id: &str,
        expected_version: Option<u64>,
    ) -> RemoteResult<RemoteDocument>;

    /// Reads one document, tombstones included.
    async fn get_document(&self, collection: &str, id: &str) -> RemoteResult<RemoteDocument>;

    /// Lists documents, tombstones included, ordered by `updated_at`.
    async fn list_documents(
        &self,
        collection: &str,
        filter: &ListFilter,
    ) -> RemoteResult<Vec<RemoteDocument>>;
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    unauthorized: bool,
    next: VecDeque<RemoteError>,
    hold_after: Option<u64>,
    latency: Option<Duration>,
}

/// An in-memory remote store for tests and demos.
///
/// Supports fault injection: outages, refused credentials, queued one-shot
/// errors, latency, and holding writes so a test can act while a call is
/// in flight.
pub struct MemoryRemoteStore {
    clock: SharedClock,
    collections: Mutex<HashMap<String, BTreeMap<String, RemoteDocument>>>,
    faults: Mutex<Faults>,
    attempts: watch::Sender<u64>,
    released: watch::Sender<bool>,
}

impl std::fmt::Debug for MemoryRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemoteStore")
            .field("faults", &*self.faults.lock())
            .field("write_attempts", &*self.attempts.borrow())
            .finish_non_exhaustive()
    }
}

impl MemoryRemoteStore {
    /// Creates an empty store stamping documents with `clock`.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            collections: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            attempts: watch::channel(0).0,
            released: watch::channel(true).0,
        }
    }

    /// Writes `data` as another client would, bumping the version.
    pub fn server_write(&self, collection: &str, id: &str, data: EntityPayload) -> RemoteDocument {
        let now = self.clock.now_millis();
        let mut collections = self.collections.lock();
        let docs = collections.entry(collection.to_string()).or_default();
        let version = docs.get(id).map_or(1, |d| d.version + 1);
        let doc = RemoteDocument {
            id: id.to_string(),
            version,
            updated_at: now,
            deleted: false,
            data: Some(data),
        };
        docs.insert(id.to_string(), doc.clone());
        doc
    }

    /// Tombstones a document as another client would.
    pub fn server_delete(&self, collection: &str, id: &str) -> Option<RemoteDocument> {
        let now = self.clock.now_millis();
        let mut collections = self.collections.lock();
        let doc = collections.get_mut(collection)?.get_mut(id)?;
        doc.version += 1;
        doc.updated_at = now;
        doc.deleted = true;
        doc.data = None;
        Some(doc.clone())
    }

    /// Reads a document without going through fault injection.
    pub fn document(&self, collection: &str, id: &str) -> Option<RemoteDocument> {
        self.collections.lock().get(collection)?.get(id).cloned()
    }

    /// Every document of a collection.
    pub fn documents(&self, collection: &str) -> Vec<RemoteDocument> {
        self.collections
            .lock()
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Makes every call fail with [`RemoteError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.faults.lock().unavailable = !available;
    }

    /// Makes every call fail with [`RemoteError::Unauthorized`].
    pub fn set_authorized(&self, authorized: bool) {
        self.faults.lock().unauthorized = !authorized;
    }

    /// Fails the next call with `error`. Queued errors fire in order.
    pub fn fail_next(&self, error: RemoteError) {
        self.faults.lock().next.push_back(error);
    }

    /// Delays every call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().latency = latency;
    }

    /// Writes after the first `n` wait until [`release_writes`](Self::release_writes).
    pub fn hold_writes_after(&self, n: u64) {
        self.faults.lock().hold_after = Some(n);
        self.released.send_replace(false);
    }

    /// Lets held writes continue.
    pub fn release_writes(&self) {
        self.faults.lock().hold_after = None;
        self.released.send_replace(true);
    }

    /// Number of write calls received so far.
    pub fn write_attempts(&self) -> u64 {
        *self.attempts.borrow()
    }

    /// Waits until at least `n` write calls were received.
    pub async fn wait_for_write_attempts(&self, n: u64) {
        let mut rx = self.attempts.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    async fn before_call(&self, write: bool) -> RemoteResult<()> {
        let hold = if write {
            let mut attempt = 0;
            self.attempts.send_modify(|count| {
                attempt = *count;
                *count += 1;
            });
            self.faults.lock().hold_after.is_some_and(|n| attempt >= n)
        } else {
            false
        };
        if hold {
            let mut rx = self.released.subscribe();
            let _ = rx.wait_for(|released| *released).await;
        }

        let latency = self.faults.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut faults = self.faults.lock();
        if faults.unauthorized {
            return Err(RemoteError::Unauthorized("credentials refused".into()));
        }
        if faults.unavailable {
            return Err(RemoteError::Unavailable("backend offline".into()));
        }
        match faults.next.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn check_version(current: &RemoteDocument, expected: Option<u64>) -> RemoteResult<()> {
        match expected {
            Some(v) if v != current.version => Err(RemoteError::VersionConflict {
                current: Box::new(current.clone()),
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn create_document(
        &self,
        collection: &str,
        id: &str,
        data: &EntityPayload,
    ) -> RemoteResult<RemoteDocument> {
        self.before_call(true).await?;
        let now = self.clock.now_millis();
        let mut collections = self.collections.lock();
        let docs = collections.entry(collection.to_string()).or_default();
        let version = match docs.get(id) {
            Some(existing) if !existing.deleted => {
                return Err(RemoteError::AlreadyExists {
                    current: Box::new(existing.clone()),
                })
            }
            Some(tombstone) => tombstone.version + 1,
            None => 1,
        };
        let doc = RemoteDocument {
            id: id.to_string(),
            version,
            updated_at: now,
            deleted: false,
            data: Some(data.clone()),
        };
        docs.insert(id.to_string(), doc.clone());
        Ok(doc)
    }

    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        data: &EntityPayload,
        expected_version: Option<u64>,
    ) -> RemoteResult<RemoteDocument> {
        self.before_call(true).await?;
        let now = self.clock.now_millis();
        let mut collections = self.collections.lock();
        let doc = collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| RemoteError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        if doc.deleted {
            return Err(RemoteError::VersionConflict {
                current: Box::new(doc.clone()),
            });
        }
        Self::check_version(doc, expected_version)?;
        doc.version += 1;
        doc.updated_at = now;
        doc.data = Some(data.clone());
        Ok(doc.clone())
    }

    async fn delete_document(
        &self,
        collection: &str,
        id: &str,
        expected_version: Option<u64>,
    ) -> RemoteResult<RemoteDocument> {
        self.before_call(true).await?;
        let now = self.clock.now_millis();
        let mut collections = self.collections.lock();
        let doc = collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .filter(|doc| !doc.deleted)
            .ok_or_else(|| RemoteError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        Self::check_version(doc, expected_version)?;
        doc.version += 1;
        doc.updated_at = now;
        doc.deleted = true;
        doc.data = None;
        Ok(doc.clone())
    }

    async fn get_document(&self, collection: &str, id: &str) -> RemoteResult<RemoteDocument> {
        self.before_call(false).await?;
        self.document(collection, id).ok_or_else(|| RemoteError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        })
    }

    async fn list_documents(
        &self,
        collection: &str,
        filter: &ListFilter,
    ) -> RemoteResult<Vec<RemoteDocument>> {
        self.before_call(false).await?;
        let mut docs: Vec<RemoteDocument> = self
            .documents(collection)
            .into_iter()
            .filter(|doc| filter.matches(doc))
            .collect();
        docs.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            docs.truncate(limit);
        }
        Ok(docs)
    }
}
