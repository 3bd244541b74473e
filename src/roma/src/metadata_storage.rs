//! Per-invocation metadata, pinned by scoped readers.
//!
//! Callbacks from the sandbox can race with request completion: the worker
//! may still be issuing host calls for a request while the parent is about
//! to complete it. Each entry therefore carries its own lock; a
//! [`ScopedReader`] holds a read lease for the duration of one callback and
//! [`MetadataStorage::remove`] blocks until every lease is released, so the
//! handler never observes a freed entry and large metadata is never copied.

use std::collections::HashMap;

use parking_lot::{ArcRwLockReadGuard, Mutex, RawRwLock, RwLock};
use std::sync::Arc;

use crate::objects::RequestLogContext;

/// What the storage holds per in-flight request: the host's opaque metadata
/// plus the request's logging inputs.
#[derive(Debug, Clone, Default)]
pub struct RequestEntry<M> {
    /// Host metadata, handed to function-binding handlers.
    pub metadata: M,
    /// Logging inputs, used by the console bridge.
    pub log_context: RequestLogContext,
}

type Slot<M> = Arc<RwLock<Option<RequestEntry<M>>>>;

/// Why a scoped reader could not be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderError {
    /// No entry lock exists for the uuid at all.
    NotFound,
    /// The lock exists but the entry was already taken by a racing remove.
    Empty,
}

/// Concurrent map of request uuid to metadata entry.
pub struct MetadataStorage<M> {
    entries: Mutex<HashMap<String, Slot<M>>>,
}

impl<M> Default for MetadataStorage<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> MetadataStorage<M> {
    /// Create an empty storage.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Associate `entry` with `uuid`. Returns false (and stores nothing) if
    /// the uuid is already in use: every active uuid maps to exactly one
    /// entry.
    #[must_use]
    pub fn insert(&self, uuid: &str, entry: RequestEntry<M>) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(uuid) {
            return false;
        }
        entries.insert(uuid.to_string(), Arc::new(RwLock::new(Some(entry))));
        true
    }

    /// Remove the entry for `uuid`, blocking while any [`ScopedReader`]
    /// still pins it. Unknown uuids are a no-op.
    pub fn remove(&self, uuid: &str) {
        let slot = self.entries.lock().remove(uuid);
        if let Some(slot) = slot {
            // The write lock waits out every outstanding read lease; new
            // readers can no longer find the slot in the map.
            slot.write().take();
        }
    }

    /// Pin the entry for `uuid` for the duration of one callback.
    pub fn reader(&self, uuid: &str) -> Result<ScopedReader<M>, ReaderError> {
        let slot = self
            .entries
            .lock()
            .get(uuid)
            .cloned()
            .ok_or(ReaderError::NotFound)?;
        let guard = RwLock::read_arc(&slot);
        if guard.is_none() {
            return Err(ReaderError::Empty);
        }
        Ok(ScopedReader { guard })
    }

    /// Number of in-flight entries. Test and introspection helper.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no entries are in flight.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// A read lease on one metadata entry.
///
/// While any reader exists, `remove` for the same uuid blocks. Acquisition
/// and release are tied to scope; there is no manual unlock.
pub struct ScopedReader<M> {
    guard: ArcRwLockReadGuard<RawRwLock, Option<RequestEntry<M>>>,
}

impl<M> ScopedReader<M> {
    /// Access the pinned entry.
    pub fn entry(&self) -> &RequestEntry<M> {
        match self.guard.as_ref() {
            Some(entry) => entry,
            // Checked at acquisition, and the read lease keeps writers out.
            None => unreachable!("scoped reader over an emptied entry"),
        }
    }
}
