//! Authenticated, offline-resilient sync layer for the bariatric mobile app.
//!
//! - [`TokenManager`] owns the JWT session and its single-flight refresh
//! - [`ApiClient`] injects auth, retries transient failures and decodes responses
//! - [`SyncEngine`] pulls and pushes cached records and surfaces conflicts
//! - [`SyncScheduler`] drives the engine in the background

pub mod api_client;
pub mod bmi;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod scheduler;
pub mod sync_engine;
pub mod token_manager;
pub mod types;

pub use api_client::ApiClient;
pub use config::{RetryPolicy, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use models::{Patient, Prediction, SurveyData, SyncEntity, User};
pub use scheduler::{create_sync_scheduler, SyncHandle, SyncScheduler};
pub use sync_engine::{CacheReader, SyncEngine};
pub use token_manager::TokenManager;
pub use types::*;
