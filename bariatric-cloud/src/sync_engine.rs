//! Pull/push orchestration over the offline record cache.
//!
//! Operations on one entity type are mutually exclusive; different types run
//! independently. Each operation is bounded by the request timeout. All cache
//! writes happen in synchronous [`RecordCache::update`] calls after the
//! network round-trip they depend on, so a cancelled or timed-out operation
//! leaves records and cursor exactly as they were before the last commit.
//!
//! Conflicts are never resolved automatically. A remote change to a dirty
//! record, or a 409 on push, is kept on the record and announced through a
//! [`ChangeNotification`] with `conflict: true` until the caller either
//! [resolves](SyncEngine::resolve_conflict) or
//! [discards](SyncEngine::discard_local) it.

use crate::api_client::ApiClient;
use crate::error::{SyncError, SyncResult};
use crate::models::SyncEntity;
use crate::token_manager::TokenManager;
use crate::types::{ChangeNotification, PullReport, PushReport, SyncReport};
use bariatric_storage::{ApplyOutcome, CachedRecord, EntityState, RecordCache, SyncCursor};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// Syncs cached entity records with the REST API.
pub struct SyncEngine {
    api: Arc<ApiClient>,
    cache: RecordCache,
    type_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    events: broadcast::Sender<ChangeNotification>,
    op_timeout: Duration,
}

impl SyncEngine {
    pub fn new(api: Arc<ApiClient>, cache: RecordCache) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let op_timeout = api.config().request_timeout();
        Self {
            api,
            cache,
            type_locks: Mutex::new(HashMap::new()),
            events,
            op_timeout,
        }
    }

    /// Overrides the per-operation timeout (defaults to the request timeout).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Change notifications for UI layers. Never carries credentials.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.events.subscribe()
    }

    /// Read-only view of the cache for report generation.
    pub fn reader(&self) -> CacheReader {
        CacheReader {
            cache: self.cache.clone(),
        }
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        self.api.tokens()
    }

    pub fn entity_types(&self) -> &[String] {
        &self.api.config().entity_types
    }

    // ── Pull ──

    /// Fetches records changed since the cursor and merges them.
    ///
    /// The page is applied and the cursor advanced to the server's timestamp
    /// in one write, only after the whole page was received and decoded.
    pub async fn pull(&self, entity_type: &str) -> SyncResult<PullReport> {
        self.guarded(entity_type, self.pull_locked(entity_type, |_| Ok(())))
            .await
    }

    /// Like [`pull`](Self::pull), but rejects the whole page if any payload
    /// does not decode as `T`.
    pub async fn pull_typed<T: SyncEntity>(&self) -> SyncResult<PullReport> {
        let validate = |payload: &Value| {
            T::deserialize(payload)
                .map(drop)
                .map_err(|e| SyncError::Decode(format!("{}: {e}", T::ENTITY_TYPE)))
        };
        self.guarded(T::ENTITY_TYPE, self.pull_locked(T::ENTITY_TYPE, validate))
            .await
    }

    async fn pull_locked<V>(&self, entity_type: &str, validate: V) -> SyncResult<PullReport>
    where
        V: Fn(&Value) -> SyncResult<()> + Send,
    {
        let since = self.cache.load(entity_type)?.cursor.last_fetched_at;
        debug!(entity_type, ?since, "pulling");

        let page = self.api.fetch_page(entity_type, since).await?;
        for record in &page.records {
            validate(&record.payload)?;
        }

        let now = Utc::now();
        let server_time = page.server_time;
        let report = self.cache.update(entity_type, move |state| {
            let mut report = PullReport {
                server_time: Some(server_time),
                ..PullReport::default()
            };
            for remote in page.records {
                let id = remote.id.clone();
                match state.apply_remote(remote, now) {
                    ApplyOutcome::Applied => report.applied.push(id),
                    ApplyOutcome::Conflict => report.conflicts.push(id),
                    ApplyOutcome::Stale => report.stale.push(id),
                }
            }
            state.cursor.last_fetched_at = Some(server_time);
            report
        })?;

        if !report.conflicts.is_empty() {
            warn!(entity_type, ids = ?report.conflicts, "remote changes conflict with local edits");
        }
        info!(
            entity_type,
            applied = report.applied.len(),
            conflicts = report.conflicts.len(),
            "pull complete"
        );
        self.notify(entity_type, &report.applied, false);
        self.notify(entity_type, &report.conflicts, true);
        Ok(report)
    }

    // ── Push ──

    /// Sends every pending record that is not awaiting conflict resolution
    /// or a fresh edit after a refusal.
    ///
    /// Each accepted record is committed as soon as the server acknowledges
    /// it. A 409 leaves the record pending and flags it as conflicted. Any
    /// other refusal leaves it pending and flags it as rejected. A network
    /// failure stops the batch and is returned; records not yet sent stay
    /// pending.
    pub async fn push(&self, entity_type: &str) -> SyncResult<PushReport> {
        self.guarded(entity_type, self.push_locked(entity_type)).await
    }

    async fn push_locked(&self, entity_type: &str) -> SyncResult<PushReport> {
        let state = self.cache.load(entity_type)?;
        let mut report = PushReport::default();

        for id in state.pushable_ids() {
            let Some(record) = state.record(&id) else {
                continue;
            };
            match self
                .api
                .push_record(entity_type, &id, record.version, &record.payload)
                .await
            {
                Ok(ack) => {
                    self.cache
                        .update(entity_type, |s| s.mark_pushed(&id, ack.version, Utc::now()))?;
                    debug!(entity_type, %id, version = ack.version, "pushed");
                    report.pushed.push(id);
                }
                Err(SyncError::ConflictDetected { .. }) => {
                    self.cache
                        .update(entity_type, |s| s.mark_push_conflict(&id, Utc::now()))?;
                    warn!(entity_type, %id, "push rejected, server has a newer version");
                    report.conflicts.push(id);
                }
                Err(e) if e.is_retryable() || e.is_session_fatal() => {
                    warn!(entity_type, %id, "push batch interrupted: {e}");
                    self.notify_push(entity_type, &report);
                    return Err(e);
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.cache
                        .update(entity_type, |s| s.mark_push_rejected(&id, &reason))?;
                    warn!(entity_type, %id, "push rejected, held until edited again: {reason}");
                    report.failed.push((id, e));
                }
            }
        }

        if report.writes() > 0 {
            info!(
                entity_type,
                pushed = report.pushed.len(),
                conflicts = report.conflicts.len(),
                failed = report.failed.len(),
                "push complete"
            );
        }
        self.notify_push(entity_type, &report);
        Ok(report)
    }

    /// Push, then pull.
    pub async fn sync(&self, entity_type: &str) -> SyncResult<SyncReport> {
        let push = self.push(entity_type).await?;
        let pull = self.pull(entity_type).await?;
        Ok(SyncReport { push, pull })
    }

    // ── Local changes ──

    /// Stores a local edit and queues it for push.
    pub async fn record_local_edit<T: Serialize>(&self, entity_type: &str, id: &str, payload: &T) -> SyncResult<()> {
        let value = serde_json::to_value(payload).map_err(|e| SyncError::Decode(e.to_string()))?;
        self.guarded(entity_type, async move {
            self.cache
                .update(entity_type, move |s| s.record_local_edit(id, value))
                .map_err(SyncError::from)
        })
        .await?;
        debug!(entity_type, id, "local edit recorded");
        self.notify(entity_type, &[id.to_string()], false);
        Ok(())
    }

    /// Creates a record under a fresh time-ordered id.
    pub async fn create_local<T: Serialize>(&self, entity_type: &str, payload: &T) -> SyncResult<String> {
        let id = Uuid::now_v7().to_string();
        self.record_local_edit(entity_type, &id, payload).await?;
        Ok(id)
    }

    pub async fn save<T: SyncEntity>(&self, id: &str, entity: &T) -> SyncResult<()> {
        self.record_local_edit(T::ENTITY_TYPE, id, entity).await
    }

    /// Replaces a conflicted record with `merged`, based on the server
    /// version that caused the conflict. Returns `false` if `id` has no
    /// conflict.
    pub async fn resolve_conflict<T: Serialize>(&self, entity_type: &str, id: &str, merged: &T) -> SyncResult<bool> {
        let value = serde_json::to_value(merged).map_err(|e| SyncError::Decode(e.to_string()))?;
        let resolved = self
            .guarded(entity_type, async move {
                self.cache
                    .update(entity_type, move |s| s.resolve_conflict(id, value))
                    .map_err(SyncError::from)
            })
            .await?;
        if resolved {
            info!(entity_type, id, "conflict resolved");
            self.notify(entity_type, &[id.to_string()], false);
        }
        Ok(resolved)
    }

    /// Drops the local edit to `id`, adopting the captured server copy if
    /// there is one. Returns `false` if `id` was not dirty.
    pub async fn discard_local(&self, entity_type: &str, id: &str) -> SyncResult<bool> {
        let discarded = self
            .guarded(entity_type, async move {
                self.cache
                    .update(entity_type, |s| s.discard_local(id, Utc::now()))
                    .map_err(SyncError::from)
            })
            .await?;
        if discarded {
            info!(entity_type, id, "local edit discarded");
            self.notify(entity_type, &[id.to_string()], false);
        }
        Ok(discarded)
    }

    /// Drops everything cached for `entity_type`, including unpushed edits.
    /// The next pull starts from scratch. This is the way out of a cache
    /// blob that no longer decodes.
    pub async fn reset(&self, entity_type: &str) -> SyncResult<()> {
        self.guarded(entity_type, async move { self.cache.clear(entity_type).map_err(SyncError::from) })
            .await?;
        warn!(entity_type, "local cache reset");
        Ok(())
    }

    // ── Internals ──

    /// Runs `op` under the entity-type lock and the operation timeout.
    /// Storage failures end the session.
    async fn guarded<T>(&self, entity_type: &str, op: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
        let lock = self
            .type_locks
            .lock()
            .await
            .entry(entity_type.to_string())
            .or_default()
            .clone();

        let result = tokio::time::timeout(self.op_timeout, async {
            let _guard = lock.lock().await;
            op.await
        })
        .await
        .unwrap_or_else(|_| {
            Err(SyncError::NetworkTimeout(format!(
                "{entity_type} operation exceeded {:?}",
                self.op_timeout
            )))
        });

        if let Err(SyncError::StorageUnavailable(reason)) = &result {
            warn!(entity_type, "storage failure during sync: {reason}");
            self.tokens().handle_storage_failure().await;
        }
        result
    }

    fn notify_push(&self, entity_type: &str, report: &PushReport) {
        self.notify(entity_type, &report.pushed, false);
        self.notify(entity_type, &report.conflicts, true);
    }

    fn notify(&self, entity_type: &str, ids: &[String], conflict: bool) {
        if ids.is_empty() {
            return;
        }
        // No receivers is fine.
        let _ = self.events.send(ChangeNotification {
            entity_type: entity_type.to_string(),
            ids: ids.to_vec(),
            conflict,
        });
    }
}

/// Read-only access to cached records, handed to report generation.
#[derive(Clone)]
pub struct CacheReader {
    cache: RecordCache,
}

impl CacheReader {
    pub fn records(&self, entity_type: &str) -> SyncResult<Vec<CachedRecord<Value>>> {
        Ok(self.state(entity_type)?.records.into_values().collect())
    }

    pub fn record(&self, entity_type: &str, id: &str) -> SyncResult<Option<CachedRecord<Value>>> {
        Ok(self.state(entity_type)?.records.remove(id))
    }

    /// All cached records of `T`, decoded.
    pub fn typed<T: SyncEntity>(&self) -> SyncResult<Vec<CachedRecord<T>>> {
        self.records(T::ENTITY_TYPE)?
            .iter()
            .map(|r| r.decode::<T>().map_err(|e| SyncError::Decode(format!("{}/{}: {e}", T::ENTITY_TYPE, r.id))))
            .collect()
    }

    /// Records awaiting conflict resolution.
    pub fn conflicts(&self, entity_type: &str) -> SyncResult<Vec<CachedRecord<Value>>> {
        Ok(self
            .records(entity_type)?
            .into_iter()
            .filter(|r| r.has_conflict())
            .collect())
    }

    pub fn cursor(&self, entity_type: &str) -> SyncResult<SyncCursor> {
        Ok(self.state(entity_type)?.cursor)
    }

    fn state(&self, entity_type: &str) -> SyncResult<EntityState> {
        Ok(self.cache.load(entity_type)?)
    }
}
