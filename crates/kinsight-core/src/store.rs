//! Identity storage capability and the in-memory backend.

use crate::types::{CosineMatcher, IdentityMatch, IdentityRecord, Matcher, NewIdentity};
use chrono::Utc;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The backing datastore cannot be reached or did not answer in time.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A stored row could not be turned back into a record.
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Persisted collection of known identities.
///
/// `find_nearest` returns the single record with the highest cosine
/// similarity at or above `threshold`; equal similarities resolve to the
/// smallest id. `list` is ordered by creation time.
pub trait IdentityStore: Send + Sync {
    fn find_nearest(&self, descriptor: &[f32], threshold: f32) -> Result<Option<IdentityMatch>, StoreError>;

    fn insert(&self, identity: NewIdentity) -> Result<IdentityRecord, StoreError>;

    fn list(&self) -> Result<Vec<IdentityRecord>, StoreError>;

    fn count(&self) -> Result<usize, StoreError>;
}

/// Build a full record from registration fields: fresh UUID, both timestamps now.
pub fn new_record(identity: NewIdentity) -> IdentityRecord {
    let now = Utc::now();
    IdentityRecord {
        id: uuid::Uuid::new_v4().to_string(),
        name: identity.name,
        relationship: identity.relationship,
        color: identity.color,
        descriptor: identity.descriptor,
        created_at: now,
        updated_at: now,
    }
}

/// Process-local store. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<Vec<IdentityRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".into())
}

impl IdentityStore for MemoryStore {
    fn find_nearest(&self, descriptor: &[f32], threshold: f32) -> Result<Option<IdentityMatch>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(CosineMatcher.nearest(descriptor, &records, threshold))
    }

    fn insert(&self, identity: NewIdentity) -> Result<IdentityRecord, StoreError> {
        let record = new_record(identity);
        self.records.write().map_err(poisoned)?.push(record.clone());
        tracing::debug!(id = %record.id, name = %record.name, "identity stored in memory");
        Ok(record)
    }

    fn list(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        Ok(self.records.read().map_err(poisoned)?.clone())
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.records.read().map_err(poisoned)?.len())
    }
}
