//! Background sync loop.
//!
//! Pushes then pulls every configured entity type on a fixed interval, and on
//! demand through [`SyncHandle::sync_now`]. Each type fails independently. A
//! session-fatal error pauses the loop until the next command, since nothing
//! can sync before the user logs in again.

use crate::error::{SyncError, SyncResult};
use crate::sync_engine::SyncEngine;
use crate::types::{SessionState, SyncReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug)]
enum SyncCommand {
    SyncNow,
    Stop,
}

/// Handle for sending commands to a running [`SyncScheduler`].
#[derive(Clone)]
pub struct SyncHandle {
    command_tx: mpsc::Sender<SyncCommand>,
}

impl SyncHandle {
    /// Requests an immediate cycle and resumes a paused loop.
    pub async fn sync_now(&self) -> SyncResult<()> {
        self.command_tx
            .send(SyncCommand::SyncNow)
            .await
            .map_err(|_| SyncError::SchedulerStopped)
    }

    pub async fn stop(&self) -> SyncResult<()> {
        self.command_tx
            .send(SyncCommand::Stop)
            .await
            .map_err(|_| SyncError::SchedulerStopped)
    }
}

/// Drives a [`SyncEngine`] in the background.
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    command_rx: mpsc::Receiver<SyncCommand>,
    poll_interval: Duration,
    paused: bool,
}

/// Creates a scheduler and the handle that controls it. Spawn
/// [`SyncScheduler::run`] on the runtime to start it.
pub fn create_sync_scheduler(engine: Arc<SyncEngine>, poll_interval: Duration) -> (SyncHandle, SyncScheduler) {
    let (command_tx, command_rx) = mpsc::channel(16);
    let handle = SyncHandle { command_tx };
    let scheduler = SyncScheduler {
        engine,
        command_rx,
        poll_interval,
        paused: false,
    };
    (handle, scheduler)
}

impl SyncScheduler {
    /// Runs until [`SyncHandle::stop`] is called or every handle is dropped.
    pub async fn run(&mut self) {
        info!("sync scheduler started, polling every {:?}", self.poll_interval);

        let mut poll_interval = tokio::time::interval(self.poll_interval);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip first immediate tick
        poll_interval.tick().await;

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    if self.paused {
                        debug!("sync paused, skipping scheduled cycle");
                        continue;
                    }
                    self.run_cycle().await;
                }
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SyncCommand::SyncNow) => {
                            self.paused = false;
                            self.run_cycle().await;
                        }
                        Some(SyncCommand::Stop) => {
                            info!("sync scheduler stopping");
                            break;
                        }
                        None => {
                            info!("command channel closed, stopping sync scheduler");
                            break;
                        }
                    }
                }
            }
        }

        info!("sync scheduler stopped");
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Syncs every configured entity type once.
    ///
    /// Skipped entirely without a session. A session-fatal error pauses the
    /// scheduler and skips the remaining types.
    pub async fn run_cycle(&mut self) -> Vec<(String, SyncResult<SyncReport>)> {
        let state = self.engine.tokens().state();
        if !state.has_credentials() {
            debug!(?state, "no active session, skipping sync cycle");
            if state == SessionState::Expired {
                self.paused = true;
            }
            return Vec::new();
        }

        let mut results = Vec::new();
        for entity_type in self.engine.entity_types().to_vec() {
            let result = self.engine.sync(&entity_type).await;
            let fatal = matches!(&result, Err(e) if e.is_session_fatal());
            match &result {
                Ok(report) => debug!(
                    entity_type = %entity_type,
                    pushed = report.push.pushed.len(),
                    pulled = report.pull.applied.len(),
                    "sync cycle complete"
                ),
                Err(e) if fatal => {
                    warn!(entity_type = %entity_type, "sync paused until the session is restored: {e}");
                }
                Err(e) if e.is_network() => {
                    info!(entity_type = %entity_type, "network unavailable, will retry next cycle: {e}");
                }
                Err(e) => warn!(entity_type = %entity_type, "sync failed: {e}"),
            }
            results.push((entity_type, result));
            if fatal {
                self.paused = true;
                break;
            }
        }
        results
    }
}
