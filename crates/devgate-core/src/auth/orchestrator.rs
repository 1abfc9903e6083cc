//! Session state machine.
//!
//! `AuthOrchestrator` owns the externally observable `SessionState` and is the
//! only thing that mutates it. Front ends read it through a `watch` receiver
//! and drive it with `submit_login`, `request_logout` and `acknowledge_error`.
//!
//! ```text
//! Initializing --initialize()--> Authenticated | Unauthenticated
//! Unauthenticated --submit_login() ok--> Authenticated
//! Authenticated --request_logout() / invalidation--> Unauthenticated
//! ```
//!
//! Invalidations come from the gateway's event channel, so a credential
//! failure on any in-flight request collapses the session even when nobody
//! is awaiting that request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApiError, InvalidationReason, RequestGateway, SessionEvent};
use crate::models::UserProfile;

use super::{LoginCredentials, TokenStore};

/// Coarse phase derived from `SessionState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Initializing,
    Authenticated,
    Unauthenticated,
}

/// Authentication status as seen by a front end.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionState {
    pub authenticated: bool,
    /// True only during the startup check. Do not pick between the login and
    /// home screens while set.
    pub initializing: bool,
    /// A login or logout is in flight.
    pub pending: bool,
    pub last_error: Option<String>,
    pub user: Option<UserProfile>,
}

impl SessionState {
    fn starting() -> Self {
        Self {
            initializing: true,
            ..Self::default()
        }
    }

    pub fn phase(&self) -> AuthPhase {
        if self.initializing {
            AuthPhase::Initializing
        } else if self.authenticated {
            AuthPhase::Authenticated
        } else {
            AuthPhase::Unauthenticated
        }
    }
}

pub struct AuthOrchestrator {
    gateway: RequestGateway,
    state: Arc<watch::Sender<SessionState>>,
    started: AtomicBool,
    listener: JoinHandle<()>,
}

impl AuthOrchestrator {
    /// Create the orchestrator in the `Initializing` phase and start listening
    /// for gateway invalidations. Must be called within a Tokio runtime.
    pub fn new(gateway: RequestGateway) -> Self {
        let (state, _) = watch::channel(SessionState::starting());
        let state = Arc::new(state);

        let listener = tokio::spawn(listen_for_invalidations(
            gateway.subscribe_events(),
            Arc::clone(&state),
            Arc::clone(gateway.store()),
        ));

        Self {
            gateway,
            state,
            started: AtomicBool::new(false),
            listener,
        }
    }

    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// One-time startup check against the stored session.
    ///
    /// Later calls do nothing and report the current authentication.
    pub async fn initialize(&self) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Startup check already ran");
            return self.state.borrow().authenticated;
        }

        info!("Checking stored session");
        let outcome = self.gateway.validate().await;
        // A concurrent rejection may have cleared the store after validation.
        let authenticated = outcome.valid && self.gateway.store().exists();

        self.state.send_modify(|s| {
            s.initializing = false;
            s.authenticated = authenticated;
            s.user = if authenticated { outcome.user } else { None };
        });

        info!(authenticated, "Startup check complete");
        authenticated
    }

    /// Log in with the given credentials.
    ///
    /// Only runs from `Unauthenticated` with nothing pending; otherwise the
    /// call is ignored and returns `Ok(())`. On failure the state keeps the
    /// user-facing message in `last_error` and the error is returned too.
    pub async fn submit_login(&self, credentials: LoginCredentials) -> Result<(), ApiError> {
        let started = self.state.send_if_modified(|s| {
            if s.initializing || s.pending || s.authenticated {
                return false;
            }
            s.pending = true;
            s.last_error = None;
            true
        });
        if !started {
            debug!(phase = ?self.state.borrow().phase(), "Login ignored in current state");
            return Ok(());
        }

        match self.gateway.login(&credentials).await {
            Ok(outcome) => {
                let user = outcome
                    .user
                    .filter(|u| !u.username.is_empty())
                    .unwrap_or_else(|| UserProfile::named(credentials.username.as_str()));
                let store = self.gateway.store();
                let mut authenticated = false;
                // A rejection may have cleared the new token already; its event
                // found us unauthenticated and was dropped.
                self.state.send_modify(|s| {
                    authenticated = store.exists();
                    s.authenticated = authenticated;
                    s.pending = false;
                    if authenticated {
                        s.last_error = None;
                        s.user = Some(user);
                    } else {
                        s.last_error = Some(ApiError::AuthRequired.user_message());
                        s.user = None;
                    }
                });
                if authenticated {
                    Ok(())
                } else {
                    warn!("Session was dropped before login completed");
                    Err(ApiError::AuthRequired)
                }
            }
            Err(e) => {
                let message = e.login_message();
                self.state.send_modify(|s| {
                    s.authenticated = false;
                    s.pending = false;
                    s.user = None;
                    s.last_error = Some(message);
                });
                Err(e)
            }
        }
    }

    /// Log out. Always ends `Unauthenticated`, whatever the device says.
    pub async fn request_logout(&self) {
        let started = self.state.send_if_modified(|s| {
            if s.initializing || s.pending {
                return false;
            }
            s.pending = true;
            s.last_error = None;
            true
        });
        if !started {
            debug!("Logout ignored while another operation is pending");
            return;
        }

        self.gateway.logout().await;

        self.state.send_modify(|s| {
            s.authenticated = false;
            s.pending = false;
            s.user = None;
            s.last_error = None;
        });
    }

    /// Dismiss the current error message.
    pub fn acknowledge_error(&self) {
        self.state.send_if_modified(|s| s.last_error.take().is_some());
    }

    /// Called when the user starts editing the credential fields.
    pub fn begin_editing(&self) {
        self.acknowledge_error();
    }
}

impl Drop for AuthOrchestrator {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen_for_invalidations(
    mut events: broadcast::Receiver<SessionEvent>,
    state: Arc<watch::Sender<SessionState>>,
    store: Arc<TokenStore>,
) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Invalidated(reason)) => apply_invalidation(&state, &store, Some(reason)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed session events");
                apply_invalidation(&state, &store, None);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn apply_invalidation(
    state: &watch::Sender<SessionState>,
    store: &TokenStore,
    reason: Option<InvalidationReason>,
) {
    let changed = state.send_if_modified(|s| {
        if !s.authenticated {
            return false;
        }
        // Every invalidation clears the store before it is sent. A record
        // present now was saved afterwards and belongs to a newer session.
        if store.exists() {
            debug!(?reason, "Ignoring invalidation for a superseded session");
            return false;
        }
        s.authenticated = false;
        s.user = None;
        true
    });

    if changed {
        info!(?reason, "Session invalidated, returning to login");
    } else {
        debug!(?reason, "Invalidation already handled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use mockito::Server;

    use crate::auth::{StorageBackend, StorageError};
    use crate::config::Config;

    /// Accepts every write and never returns it, so a saved session is gone
    /// by the time anyone looks.
    struct ForgetfulStorage;

    impl StorageBackend for ForgetfulStorage {
        fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Ok(None)
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            Ok(())
        }
        fn remove(&self, _key: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    fn orchestrator_for(url: String) -> AuthOrchestrator {
        let config = Config {
            base_url: url,
            ..Config::default()
        };
        let gateway = RequestGateway::new(config, Arc::new(TokenStore::in_memory())).unwrap();
        AuthOrchestrator::new(gateway)
    }

    #[test]
    fn test_phase() {
        let mut state = SessionState::starting();
        assert_eq!(state.phase(), AuthPhase::Initializing);
        state.initializing = false;
        assert_eq!(state.phase(), AuthPhase::Unauthenticated);
        state.authenticated = true;
        assert_eq!(state.phase(), AuthPhase::Authenticated);
    }

    #[tokio::test]
    async fn test_initialize_runs_once() {
        let mut server = Server::new_async().await;
        let m = server.mock("GET", "/api/validate").expect(0).create_async().await;

        let orchestrator = orchestrator_for(server.url());
        assert_eq!(orchestrator.state().phase(), AuthPhase::Initializing);

        assert!(!orchestrator.initialize().await);
        assert!(!orchestrator.initialize().await);

        m.assert_async().await;
        assert_eq!(orchestrator.state().phase(), AuthPhase::Unauthenticated);
    }

    #[tokio::test]
    async fn test_login_ignored_while_initializing() {
        let mut server = Server::new_async().await;
        let m = server.mock("POST", "/api/login").expect(0).create_async().await;

        let orchestrator = orchestrator_for(server.url());
        orchestrator
            .submit_login(LoginCredentials::new("admin", "pw"))
            .await
            .unwrap();

        m.assert_async().await;
        assert_eq!(orchestrator.state().phase(), AuthPhase::Initializing);
    }

    #[tokio::test]
    async fn test_failed_login_sets_error_and_edit_clears_it() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/api/login")
            .with_status(401)
            .create_async()
            .await;

        let orchestrator = orchestrator_for(server.url());
        orchestrator.initialize().await;

        let result = orchestrator
            .submit_login(LoginCredentials::new("admin", "wrong"))
            .await;
        assert!(matches!(result, Err(ApiError::AuthRejected { status: 401 })));

        let state = orchestrator.state();
        assert!(!state.authenticated);
        assert!(!state.pending);
        assert_eq!(state.last_error.as_deref(), Some("Invalid username or password"));

        orchestrator.begin_editing();
        assert!(orchestrator.state().last_error.is_none());
    }

    #[tokio::test]
    async fn test_login_falls_back_to_submitted_username() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/api/login")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token":"tok"}"#)
            .create_async()
            .await;

        let orchestrator = orchestrator_for(server.url());
        orchestrator.initialize().await;
        orchestrator
            .submit_login(LoginCredentials::new("operator", "pw"))
            .await
            .unwrap();

        let state = orchestrator.state();
        assert_eq!(state.phase(), AuthPhase::Authenticated);
        assert_eq!(state.user.unwrap().username, "operator");
    }

    #[tokio::test]
    async fn test_login_is_not_authenticated_when_session_is_gone() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/api/login")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token":"tok"}"#)
            .create_async()
            .await;

        let config = Config {
            base_url: server.url(),
            ..Config::default()
        };
        let store = Arc::new(TokenStore::new(Arc::new(ForgetfulStorage)));
        let orchestrator = AuthOrchestrator::new(RequestGateway::new(config, store).unwrap());
        orchestrator.initialize().await;

        let result = orchestrator
            .submit_login(LoginCredentials::new("admin", "pw"))
            .await;
        assert!(matches!(result, Err(ApiError::AuthRequired)));

        let state = orchestrator.state();
        assert_eq!(state.phase(), AuthPhase::Unauthenticated);
        assert!(!state.pending);
        assert!(state.user.is_none());
        assert!(state.last_error.is_some());
    }

    #[tokio::test]
    async fn test_invalidation_event_drops_session() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/api/login")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token":"tok"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/api/mode")
            .with_status(401)
            .create_async()
            .await;

        let orchestrator = orchestrator_for(server.url());
        orchestrator.initialize().await;
        orchestrator
            .submit_login(LoginCredentials::new("admin", "pw"))
            .await
            .unwrap();
        assert!(orchestrator.state().authenticated);

        let mut rx = orchestrator.subscribe();
        let result = orchestrator
            .gateway()
            .send(reqwest::Method::GET, "/api/mode", None, Default::default())
            .await;
        assert!(matches!(result, Err(ApiError::AuthRejected { status: 401 })));

        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| !s.authenticated))
            .await
            .expect("state did not change")
            .unwrap();
        assert!(orchestrator.state().user.is_none());
    }

    #[tokio::test]
    async fn test_stale_invalidation_is_ignored() {
        let orchestrator = orchestrator_for("http://127.0.0.1:9".to_string());
        let store = Arc::clone(orchestrator.gateway().store());
        orchestrator.state.send_modify(|s| {
            s.initializing = false;
            s.authenticated = true;
        });

        store.save("newer");
        apply_invalidation(&orchestrator.state, &store, Some(InvalidationReason::Expired));
        assert!(orchestrator.state().authenticated);

        store.clear();
        apply_invalidation(&orchestrator.state, &store, Some(InvalidationReason::Expired));
        assert!(!orchestrator.state().authenticated);
    }

    #[tokio::test]
    async fn test_acknowledge_error_keeps_auth_flags() {
        let orchestrator = orchestrator_for("http://127.0.0.1:9".to_string());
        orchestrator.state.send_modify(|s| {
            s.initializing = false;
            s.last_error = Some("boom".to_string());
        });

        orchestrator.acknowledge_error();
        let state = orchestrator.state();
        assert!(state.last_error.is_none());
        assert!(!state.authenticated);
        assert!(!state.pending);
    }
}
