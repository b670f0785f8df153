//! JWT session lifecycle.
//!
//! The [`TokenManager`] is the only owner of [`Credentials`] and of the
//! [`SessionState`]. Every transition happens under the session write lock,
//! together with the matching SecureStore write, so the persisted credentials
//! and the published state cannot drift apart:
//!
//! ```text
//! Unauthenticated --login--> Authenticated --expiring--> Refreshing
//!        ^                        ^                          |
//!        |                        +-------- success ---------+
//!     logout                                                 |
//!  (any state)            Expired <--- 401/403 on refresh ---+
//! ```
//!
//! Refresh is single-flight: callers that find the token expiring while a
//! refresh is already running wait for it and share its outcome.

use crate::api_client::{build_http_client, read_json};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::User;
use crate::types::{Credentials, LoginRequest, RefreshRequest, SessionState, TokenResponse};
use bariatric_storage::{SecureStore, StorageError};
use chrono::Utc;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

const CREDENTIALS_KEY: &str = "auth.credentials";
const USER_KEY: &str = "auth.user";

struct Session {
    state: SessionState,
    credentials: Option<Credentials>,
    user: Option<User>,
    /// Bumped whenever credentials are replaced by anything other than a
    /// refresh. A refresh that started under an older epoch is discarded.
    epoch: u64,
    /// Completed refresh attempts, successful or not.
    refresh_attempts: u64,
    /// Outcome of the most recent attempt, shared with callers that waited on it.
    last_refresh_error: Option<SyncError>,
}

impl Session {
    fn access_token(&self) -> Option<String> {
        self.credentials.as_ref().map(|c| c.access_token.clone())
    }
}

/// Owns the session: login, restore, refresh, expiry and logout.
pub struct TokenManager {
    http: Client,
    config: SyncConfig,
    store: Arc<SecureStore>,
    session: RwLock<Session>,
    /// Serializes refresh requests. The server rotates refresh tokens, so two
    /// concurrent refreshes would invalidate each other.
    refresh_lock: Mutex<()>,
    state_tx: watch::Sender<SessionState>,
}

impl TokenManager {
    pub fn new(config: SyncConfig, store: Arc<SecureStore>) -> SyncResult<Self> {
        config.validate()?;
        let http = build_http_client(&config)?;
        let (state_tx, _) = watch::channel(SessionState::Unauthenticated);

        Ok(Self {
            http,
            config,
            store,
            session: RwLock::new(Session {
                state: SessionState::Unauthenticated,
                credentials: None,
                user: None,
                epoch: 0,
                refresh_attempts: 0,
                last_refresh_error: None,
            }),
            refresh_lock: Mutex::new(()),
            state_tx,
        })
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Receives every session state transition, so the UI can route to login
    /// when the session ends.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub async fn current_user(&self) -> Option<User> {
        self.session.read().await.user.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.session.read().await.state.has_credentials()
    }

    // ── Transitions ──

    /// Loads persisted credentials from a previous run.
    ///
    /// Expired tokens are restored as-is; the next
    /// [`get_valid_access_token`](Self::get_valid_access_token) refreshes them.
    pub async fn restore(&self) -> SyncResult<SessionState> {
        let mut session = self.session.write().await;
        if session.credentials.is_some() {
            return Ok(session.state);
        }

        let loaded = self
            .store
            .get_json::<Credentials>(CREDENTIALS_KEY)
            .and_then(|creds| Ok((creds, self.store.get_json::<User>(USER_KEY)?)));

        match loaded {
            Ok((Some(creds), user)) => {
                session.credentials = Some(creds);
                session.user = user;
                session.epoch += 1;
                self.set_state(&mut session, SessionState::Authenticated);
                info!("session restored from secure store");
            }
            Ok((None, _)) => debug!("no stored session"),
            Err(e) => return Err(self.storage_failure(&mut session, e)),
        }
        Ok(session.state)
    }

    /// Exchanges email and password for a new session.
    ///
    /// A 401 or 403 from the login endpoint is reported as
    /// [`SyncError::AuthFailed`] and leaves the session untouched.
    pub async fn login(&self, email: &str, password: &str) -> SyncResult<Option<User>> {
        let resp = self
            .http
            .post(self.config.url(&self.config.login_path))
            .json(&LoginRequest { email, password })
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = resp.text().await.unwrap_or_default();
            warn!(%status, "login rejected");
            return Err(SyncError::AuthFailed(if body.is_empty() {
                status.to_string()
            } else {
                SyncError::api(status.as_u16(), &body).to_string()
            }));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::api(status.as_u16(), &body));
        }
        let tokens: TokenResponse = read_json(resp).await?;

        let mut session = self.session.write().await;
        let credentials = credentials_from(&tokens);
        if let Err(e) = self.persist(&credentials, tokens.user.as_ref(), true) {
            return Err(self.storage_failure(&mut session, e));
        }
        session.credentials = Some(credentials);
        session.user = tokens.user.clone();
        session.epoch += 1;
        session.last_refresh_error = None;
        self.set_state(&mut session, SessionState::Authenticated);
        info!("login succeeded");
        Ok(tokens.user)
    }

    /// Ends the session and purges stored credentials before returning.
    pub async fn logout(&self) -> SyncResult<()> {
        let mut session = self.session.write().await;
        let purged = self.purge(&mut session);
        self.set_state(&mut session, SessionState::Unauthenticated);
        info!("logged out");
        purged.map_err(SyncError::from)
    }

    /// Returns an access token that is not about to expire, refreshing it at
    /// most once if needed.
    pub async fn get_valid_access_token(&self) -> SyncResult<String> {
        let observed = {
            let session = self.session.read().await;
            let Some(creds) = session.credentials.as_ref() else {
                return Err(SyncError::SessionExpired);
            };
            if session.state == SessionState::Authenticated
                && !creds.expires_within(Utc::now(), self.config.refresh_skew_secs)
            {
                return Ok(creds.access_token.clone());
            }
            session.refresh_attempts
        };

        debug!("access token expiring, refreshing");
        self.refresh_single_flight(observed, None).await
    }

    /// Refreshes after the server rejected `rejected_token`.
    ///
    /// If another caller already replaced that token, the replacement is
    /// returned without a new request.
    pub async fn force_refresh(&self, rejected_token: &str) -> SyncResult<String> {
        let observed = self.session.read().await.refresh_attempts;
        self.refresh_single_flight(observed, Some(rejected_token)).await
    }

    /// Ends the session after the server rejected a freshly refreshed token.
    pub(crate) async fn expire_session(&self) {
        let mut session = self.session.write().await;
        if !session.state.has_credentials() {
            return;
        }
        match self.purge(&mut session) {
            Ok(()) => self.set_state(&mut session, SessionState::Expired),
            Err(e) => {
                error!("failed to purge credentials on expiry: {e}");
                self.set_state(&mut session, SessionState::Unauthenticated);
            }
        }
        warn!("session expired");
    }

    /// Forces Unauthenticated after the secure store failed elsewhere.
    pub async fn handle_storage_failure(&self) {
        let mut session = self.session.write().await;
        if session.state == SessionState::Unauthenticated {
            return;
        }
        self.storage_failure(&mut session, StorageError::Unavailable("secure store failed".to_string()));
    }

    // ── Internals ──

    async fn refresh_single_flight(&self, observed: u64, rejected: Option<&str>) -> SyncResult<String> {
        let _guard = self.refresh_lock.lock().await;

        let (refresh_token, epoch) = {
            let mut session = self.session.write().await;

            // Holding the refresh lock means nothing is in flight. A leftover
            // Refreshing comes from a refresh whose caller was cancelled.
            if session.state == SessionState::Refreshing {
                self.set_state(&mut session, SessionState::Authenticated);
            }

            // A refresh finished while we waited for the lock: share its outcome.
            if session.refresh_attempts > observed {
                return match &session.last_refresh_error {
                    Some(e) => Err(e.clone()),
                    None => session.access_token().ok_or(SyncError::SessionExpired),
                };
            }

            let Some(creds) = session.credentials.as_ref() else {
                return Err(SyncError::SessionExpired);
            };
            match rejected {
                Some(rejected) if creds.access_token != rejected => {
                    return Ok(creds.access_token.clone());
                }
                None if !creds.expires_within(Utc::now(), self.config.refresh_skew_secs) => {
                    return Ok(creds.access_token.clone());
                }
                _ => {}
            }

            let refresh_token = Zeroizing::new(creds.refresh_token.clone());
            let epoch = session.epoch;
            self.set_state(&mut session, SessionState::Refreshing);
            (refresh_token, epoch)
        };

        let in_flight = RefreshInFlight {
            manager: self,
            epoch,
            armed: true,
        };
        let outcome = self.request_refresh(&refresh_token).await;

        let mut session = self.session.write().await;
        in_flight.disarm();
        if session.epoch != epoch {
            debug!("session replaced during refresh, discarding result");
            return session.access_token().ok_or(SyncError::SessionExpired);
        }

        let result = match outcome {
            Ok(tokens) => self.commit_refresh(&mut session, &tokens),
            Err(SyncError::SessionExpired) => {
                warn!("refresh token rejected, session expired");
                match self.purge(&mut session) {
                    Ok(()) => {
                        self.set_state(&mut session, SessionState::Expired);
                        Err(SyncError::SessionExpired)
                    }
                    Err(e) => Err(self.storage_failure(&mut session, e)),
                }
            }
            Err(e) => {
                warn!("token refresh failed, keeping current session: {e}");
                self.set_state(&mut session, SessionState::Authenticated);
                Err(e)
            }
        };

        session.refresh_attempts += 1;
        session.last_refresh_error = result.as_ref().err().cloned();
        result
    }

    async fn request_refresh(&self, refresh_token: &str) -> SyncResult<TokenResponse> {
        let resp = self
            .http
            .post(self.config.url(&self.config.refresh_path))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::SessionExpired);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::api(status.as_u16(), &body));
        }
        read_json(resp).await
    }

    /// Stores the new credentials, then swaps them in. The old tokens stay in
    /// place if the write fails.
    fn commit_refresh(&self, session: &mut Session, tokens: &TokenResponse) -> SyncResult<String> {
        let credentials = credentials_from(tokens);
        if let Err(e) = self.persist(&credentials, tokens.user.as_ref(), false) {
            return Err(self.storage_failure(session, e));
        }
        let access_token = credentials.access_token.clone();
        session.credentials = Some(credentials);
        if tokens.user.is_some() {
            session.user = tokens.user.clone();
        }
        self.set_state(session, SessionState::Authenticated);
        info!(expires_in = tokens.expires_in, "access token refreshed");
        Ok(access_token)
    }

    fn persist(&self, credentials: &Credentials, user: Option<&User>, replace_user: bool) -> Result<(), StorageError> {
        self.store.put_json(CREDENTIALS_KEY, credentials)?;
        match user {
            Some(user) => self.store.put_json(USER_KEY, user),
            None if replace_user => self.store.delete(USER_KEY),
            None => Ok(()),
        }
    }

    fn purge(&self, session: &mut Session) -> Result<(), StorageError> {
        session.credentials = None;
        session.user = None;
        session.epoch += 1;
        let credentials = self.store.delete(CREDENTIALS_KEY);
        let user = self.store.delete(USER_KEY);
        credentials.and(user)
    }

    /// Credentials that cannot be read or written end the session, whatever
    /// the underlying storage error.
    fn storage_failure(&self, session: &mut Session, e: StorageError) -> SyncError {
        error!("secure store failure, ending session: {e}");
        if let Err(purge_err) = self.purge(session) {
            warn!("could not purge stored credentials: {purge_err}");
        }
        self.set_state(session, SessionState::Unauthenticated);
        SyncError::StorageUnavailable(e.to_string())
    }

    fn set_state(&self, session: &mut Session, state: SessionState) {
        if session.state != state {
            debug!(from = ?session.state, to = ?state, "session state transition");
        }
        session.state = state;
        self.state_tx.send_replace(state);
    }
}

/// Restores `Authenticated` if the refresh future is dropped before its
/// outcome is committed, e.g. by an operation timeout.
struct RefreshInFlight<'a> {
    manager: &'a TokenManager,
    epoch: u64,
    armed: bool,
}

impl RefreshInFlight<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RefreshInFlight<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.manager.session.try_write() {
            Ok(mut session) => {
                if session.epoch == self.epoch && session.state == SessionState::Refreshing {
                    debug!("refresh abandoned, keeping current credentials");
                    self.manager.set_state(&mut session, SessionState::Authenticated);
                }
            }
            // Repaired by the next refresh, which runs under the refresh lock.
            Err(_) => warn!("refresh abandoned while the session was busy"),
        }
    }
}

fn credentials_from(tokens: &TokenResponse) -> Credentials {
    Credentials {
        access_token: tokens.access_token.clone(),
        refresh_token: tokens.refresh_token.clone(),
        expires_at: Utc::now() + chrono::Duration::seconds(tokens.expires_in.max(0)),
    }
}
