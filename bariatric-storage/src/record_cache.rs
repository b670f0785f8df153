//! Offline record cache.
//!
//! Each entity type is persisted as one [`EntityState`] blob holding both the
//! cached records and the [`SyncCursor`], so the two can never be observed
//! out of step. The mutators on `EntityState` are the only way records change
//! and each of them keeps two invariants:
//!
//! - a dirty record is never overwritten by a remote copy, only flagged
//!   with a [`Conflict`];
//! - every pending push id refers to a dirty record.

use crate::error::{StorageError, StorageResult};
use crate::secure_store::SecureStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// A conflicting remote change captured for explicit resolution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conflict<T> {
    /// Server version that conflicted, when known. A rejected push (409)
    /// does not tell us which version won.
    pub remote_version: Option<u64>,
    /// Remote payload, when the conflict was detected during a pull.
    pub remote_payload: Option<T>,
    pub detected_at: DateTime<Utc>,
}

/// A locally cached entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord<T> {
    pub id: String,
    pub payload: T,
    /// Server version this payload is based on. `0` for records never synced.
    pub version: u64,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Local edit not yet confirmed by the server.
    pub dirty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<Conflict<T>>,
    /// Why the server refused the last push, for refusals other than a
    /// version conflict. Held back from push until edited again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected: Option<String>,
}

impl<T> CachedRecord<T> {
    pub fn has_conflict(&self) -> bool {
        self.conflict.is_some()
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected.is_some()
    }
}

impl CachedRecord<Value> {
    /// Converts the JSON payload into a typed record.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<CachedRecord<T>, serde_json::Error> {
        let conflict = match &self.conflict {
            Some(c) => Some(Conflict {
                remote_version: c.remote_version,
                remote_payload: c.remote_payload.clone().map(serde_json::from_value).transpose()?,
                detected_at: c.detected_at,
            }),
            None => None,
        };
        Ok(CachedRecord {
            id: self.id.clone(),
            payload: serde_json::from_value(self.payload.clone())?,
            version: self.version,
            last_synced_at: self.last_synced_at,
            dirty: self.dirty,
            conflict,
            rejected: self.rejected.clone(),
        })
    }
}

/// A record as delivered by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord<T> {
    pub id: String,
    pub version: u64,
    pub payload: T,
}

/// Resume point for one entity type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Server timestamp of the last fully applied pull.
    pub last_fetched_at: Option<DateTime<Utc>>,
    /// Ids awaiting push, in the order they were first edited.
    pub pending_push_ids: Vec<String>,
}

impl SyncCursor {
    /// Appends `id` unless it is already queued.
    pub fn enqueue(&mut self, id: &str) {
        if !self.contains(id) {
            self.pending_push_ids.push(id.to_string());
        }
    }

    pub fn remove(&mut self, id: &str) {
        self.pending_push_ids.retain(|p| p != id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending_push_ids.iter().any(|p| p == id)
    }
}

/// Result of merging one remote record into the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Cache now holds the remote copy.
    Applied,
    /// Local record is dirty; remote copy captured as a conflict.
    Conflict,
    /// Remote copy is older than what the cache already holds.
    Stale,
}

/// Cached records plus cursor for one entity type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_type: String,
    pub cursor: SyncCursor,
    pub records: BTreeMap<String, CachedRecord<Value>>,
}

impl EntityState {
    pub fn new(entity_type: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            cursor: SyncCursor::default(),
            records: BTreeMap::new(),
        }
    }

    pub fn record(&self, id: &str) -> Option<&CachedRecord<Value>> {
        self.records.get(id)
    }

    /// Stores a local edit: the record becomes dirty and is queued for push.
    pub fn record_local_edit(&mut self, id: &str, payload: Value) {
        match self.records.get_mut(id) {
            Some(record) => {
                record.payload = payload;
                record.dirty = true;
                record.rejected = None;
            }
            None => {
                self.records.insert(
                    id.to_string(),
                    CachedRecord {
                        id: id.to_string(),
                        payload,
                        version: 0,
                        last_synced_at: None,
                        dirty: true,
                        conflict: None,
                        rejected: None,
                    },
                );
            }
        }
        self.cursor.enqueue(id);
    }

    /// Merges a remote record. Dirty local records are never overwritten.
    pub fn apply_remote(&mut self, remote: RemoteRecord<Value>, now: DateTime<Utc>) -> ApplyOutcome {
        if let Some(local) = self.records.get_mut(&remote.id) {
            if local.dirty {
                local.conflict = Some(Conflict {
                    remote_version: Some(remote.version),
                    remote_payload: Some(remote.payload),
                    detected_at: now,
                });
                return ApplyOutcome::Conflict;
            }
            if remote.version < local.version {
                return ApplyOutcome::Stale;
            }
        }

        self.records.insert(
            remote.id.clone(),
            CachedRecord {
                id: remote.id,
                payload: remote.payload,
                version: remote.version,
                last_synced_at: Some(now),
                dirty: false,
                conflict: None,
                rejected: None,
            },
        );
        ApplyOutcome::Applied
    }

    /// Records a successful push.
    pub fn mark_pushed(&mut self, id: &str, new_version: u64, now: DateTime<Utc>) {
        if let Some(record) = self.records.get_mut(id) {
            record.version = new_version;
            record.last_synced_at = Some(now);
            record.dirty = false;
            record.conflict = None;
            record.rejected = None;
        }
        self.cursor.remove(id);
    }

    /// Records a push the server refused outright. The record stays dirty
    /// and queued, but is not sent again until the next local edit.
    pub fn mark_push_rejected(&mut self, id: &str, reason: &str) {
        if let Some(record) = self.records.get_mut(id) {
            record.rejected = Some(reason.to_string());
        }
    }

    /// Records a push rejected as a version conflict. The record stays dirty
    /// and queued, but is held back until resolved.
    pub fn mark_push_conflict(&mut self, id: &str, now: DateTime<Utc>) {
        if let Some(record) = self.records.get_mut(id) {
            let previous = record.conflict.take();
            record.conflict = Some(Conflict {
                remote_version: previous.as_ref().and_then(|c| c.remote_version),
                remote_payload: previous.and_then(|c| c.remote_payload),
                detected_at: now,
            });
        }
    }

    /// Replaces a conflicted record with an explicitly merged payload.
    ///
    /// The merge is based on the remote version when one was captured, so the
    /// next push carries the version the server expects. Returns `false` if
    /// the record has no conflict.
    pub fn resolve_conflict(&mut self, id: &str, merged: Value) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        let Some(conflict) = record.conflict.take() else {
            return false;
        };
        if let Some(remote_version) = conflict.remote_version {
            record.version = remote_version;
        }
        record.payload = merged;
        record.dirty = true;
        record.rejected = None;
        self.cursor.enqueue(id);
        true
    }

    /// Drops a local edit.
    ///
    /// A captured remote copy is adopted as-is. Without one, the record is
    /// removed and the cursor rewound so the next pull fetches the server copy
    /// again. Returns `false` if the record was not dirty.
    pub fn discard_local(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if !record.dirty {
            return false;
        }

        let remote = record
            .conflict
            .take()
            .and_then(|c| Some((c.remote_version?, c.remote_payload?)));
        match remote {
            Some((version, payload)) => {
                record.payload = payload;
                record.version = version;
                record.last_synced_at = Some(now);
                record.dirty = false;
                record.rejected = None;
            }
            None => {
                self.records.remove(id);
                self.cursor.last_fetched_at = None;
            }
        }
        self.cursor.remove(id);
        true
    }

    /// Ids queued for push whose records are dirty, not awaiting conflict
    /// resolution and not refused by the server, in queue order.
    pub fn pushable_ids(&self) -> Vec<String> {
        self.cursor
            .pending_push_ids
            .iter()
            .filter(|id| {
                self.records
                    .get(id.as_str())
                    .is_some_and(|r| r.dirty && r.conflict.is_none() && r.rejected.is_none())
            })
            .cloned()
            .collect()
    }

    pub fn rejected_ids(&self) -> Vec<String> {
        self.records
            .values()
            .filter(|r| r.rejected.is_some())
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn conflicted_ids(&self) -> Vec<String> {
        self.records
            .values()
            .filter(|r| r.conflict.is_some())
            .map(|r| r.id.clone())
            .collect()
    }

    /// Restores the pending ⊆ dirty relationship after loading state written
    /// by an older build or edited outside this type. Returns whether anything
    /// changed.
    pub fn repair(&mut self) -> bool {
        let before = self.cursor.pending_push_ids.clone();
        let records = &self.records;
        self.cursor
            .pending_push_ids
            .retain(|id| records.get(id).is_some_and(|r| r.dirty));
        let dirty: Vec<String> = self
            .records
            .values()
            .filter(|r| r.dirty)
            .map(|r| r.id.clone())
            .collect();
        for id in dirty {
            self.cursor.enqueue(&id);
        }
        before != self.cursor.pending_push_ids
    }
}

/// Persists [`EntityState`] blobs inside a [`SecureStore`].
#[derive(Clone)]
pub struct RecordCache {
    store: Arc<SecureStore>,
}

impl RecordCache {
    pub fn new(store: Arc<SecureStore>) -> Self {
        Self { store }
    }

    fn storage_key(entity_type: &str) -> String {
        format!("sync.{entity_type}")
    }

    /// Loads the state for `entity_type`, or an empty state if none exists.
    pub fn load(&self, entity_type: &str) -> StorageResult<EntityState> {
        let mut state = self
            .store
            .get_json::<EntityState>(&Self::storage_key(entity_type))?
            .unwrap_or_else(|| EntityState::new(entity_type));
        if state.repair() {
            debug!(entity_type, "repaired pending push queue on load");
        }
        Ok(state)
    }

    pub fn save(&self, state: &EntityState) -> StorageResult<()> {
        self.store.put_json(&Self::storage_key(&state.entity_type), state)
    }

    /// Applies `f` to the stored state and writes the result back as one
    /// atomic replacement.
    pub fn update<R>(&self, entity_type: &str, f: impl FnOnce(&mut EntityState) -> R) -> StorageResult<R> {
        self.store.update(&Self::storage_key(entity_type), |current| {
            let mut state = match current {
                Some(bytes) => serde_json::from_slice::<EntityState>(&bytes)
                    .map_err(|e| StorageError::Corrupted(format!("{entity_type}: {e}")))?,
                None => EntityState::new(entity_type),
            };
            state.repair();
            let result = f(&mut state);
            Ok((Some(serde_json::to_vec(&state)?), result))
        })
    }

    /// Removes everything cached for `entity_type`.
    pub fn clear(&self, entity_type: &str) -> StorageResult<()> {
        self.store.delete(&Self::storage_key(entity_type))
    }
}
