//! Request gateway for the device API.
//!
//! Every outbound request passes through `RequestGateway::send`, which:
//! - attaches the stored bearer token to protected endpoints, refusing to
//!   transmit a protected request without one
//! - supports per-call timeouts and cooperative cancellation
//! - classifies the response, and on 401/403 clears the token store and
//!   broadcasts `SessionEvent::Invalidated` to every subscriber
//!
//! `login`, `logout` and `validate` are built on top of `send`.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{
    header::{ACCEPT, CONTENT_TYPE},
    Client, Method, StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{LoginCredentials, SessionPolicy, TokenStore};
use crate::config::Config;
use crate::models::{LoginResponse, UserProfile, ValidateResponse};

use super::json::parse_body;
use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Capacity of the session event channel.
/// Invalidations are rare and deduplicated at the store, so a small buffer is plenty.
const EVENT_CHANNEL_CAPACITY: usize = 16;

// ============================================================================
// Types
// ============================================================================

/// Per-call options for `RequestGateway::send`.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Never attach a credential, even for a protected endpoint.
    pub skip_auth: bool,
    /// Overrides the client-wide request timeout.
    pub timeout: Option<Duration>,
    /// Aborts the call when cancelled. A cancelled call has no side effects.
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn skip_auth() -> Self {
        Self {
            skip_auth: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Why the gateway dropped the stored session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationReason {
    /// The device answered 401 or 403.
    Rejected { status: u16 },
    /// The stored token outlived the configured maximum age.
    Expired,
    /// Startup revalidation did not succeed.
    ValidationFailed,
    /// A login attempt failed while a stale record was still stored.
    LoginFailed,
    /// Explicit logout.
    LoggedOut,
}

/// Signal sent to every subscriber when the session collapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Invalidated(InvalidationReason),
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub token: String,
    pub user: Option<UserProfile>,
    pub message: Option<String>,
    /// False when the token could only be kept in memory.
    pub durable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub user: Option<UserProfile>,
}

// ============================================================================
// Gateway
// ============================================================================

/// Single choke point for requests to the device.
/// Clone is cheap - the client, store and event channel are all shared.
#[derive(Clone)]
pub struct RequestGateway {
    client: Client,
    config: Arc<Config>,
    policy: Arc<SessionPolicy>,
    store: Arc<TokenStore>,
    events: broadcast::Sender<SessionEvent>,
}

impl RequestGateway {
    pub fn new(config: Config, store: Arc<TokenStore>) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            client,
            policy: Arc::new(config.policy()),
            config: Arc::new(config),
            store,
            events,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    /// Receive session invalidations. Each subscriber sees every event sent
    /// after it subscribed.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Send a request and decode the JSON body.
    ///
    /// An empty 2xx body resolves to an empty JSON object.
    pub async fn send(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
        options: RequestOptions,
    ) -> Result<Value, ApiError> {
        if options.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(ApiError::Cancelled);
        }

        let token = self.credential_for(endpoint, &options)?;
        let url = self.config.url_for(endpoint);

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(ACCEPT, "application/json");
        if let Some(ref token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }

        debug!(%method, endpoint, authenticated = token.is_some(), "Sending request");

        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, content_type, text))
        };

        let result = match options.cancel {
            Some(ref cancel) => tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(endpoint, "Request cancelled");
                    return Err(ApiError::Cancelled);
                }
                result = exchange => result,
            },
            None => exchange.await,
        };

        let (status, content_type, text) = result.map_err(|e| {
            warn!(endpoint, error = %e, "Request did not complete");
            ApiError::from(e)
        })?;

        self.classify(endpoint, token.as_deref(), status, content_type.as_deref(), &text)
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let value = self.send(Method::GET, endpoint, None, options).await?;
        decode(endpoint, value)
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        endpoint: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let body = serde_json::to_value(body)
            .map_err(|e| ApiError::Validation(format!("Request body could not be encoded: {}", e)))?;
        let value = self.send(Method::POST, endpoint, Some(&body), options).await?;
        decode(endpoint, value)
    }

    // ===== Session Operations =====

    /// Authenticate and store the issued token.
    ///
    /// Input is checked locally first, so bad input never reaches the device.
    /// Any failure leaves the store empty.
    pub async fn login(&self, credentials: &LoginCredentials) -> Result<LoginOutcome, ApiError> {
        let result = self.try_login(credentials).await;
        if let Err(ref e) = result {
            warn!(error = %e, username = %credentials.username, "Login failed");
            self.drop_session(None, InvalidationReason::LoginFailed);
        }
        result
    }

    async fn try_login(&self, credentials: &LoginCredentials) -> Result<LoginOutcome, ApiError> {
        credentials.validate()?;

        let response: LoginResponse = self
            .post(&self.config.login_path, credentials, RequestOptions::skip_auth())
            .await?;

        let token = response
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::MalformedResponse("Login response did not include a token".to_string()))?;

        let durable = self.store.save(&token);
        if !durable {
            warn!("Session could not be persisted and will not survive a restart");
        }
        info!(username = %credentials.username, durable, "Login successful");

        Ok(LoginOutcome {
            token,
            user: response.user,
            message: response.message,
            durable,
        })
    }

    /// Tell the device we are leaving, then drop the local session.
    ///
    /// The request is best-effort with a short timeout; the local record is
    /// cleared whatever the device says.
    pub async fn logout(&self) {
        let options = RequestOptions::default().with_timeout(self.config.logout_timeout());
        match self
            .send(Method::POST, &self.config.logout_path, Some(&json!({})), options)
            .await
        {
            Ok(_) => debug!("Device acknowledged logout"),
            Err(e) => debug!(error = %e, "Logout request failed, clearing session anyway"),
        }
        self.drop_session(None, InvalidationReason::LoggedOut);
        info!("Logged out");
    }

    /// Check the stored token with the device.
    ///
    /// Never fails: any problem clears the stored token and reports the
    /// session as not valid. A confirmed token is stored again with a fresh
    /// issue time.
    pub async fn validate(&self) -> ValidationOutcome {
        let Some(record) = self.store.read() else {
            debug!("No stored session to validate");
            return ValidationOutcome::default();
        };

        if self.policy.is_expired(&record) {
            info!(age_secs = record.age().num_seconds(), "Stored session expired");
            self.drop_session(Some(&record.token), InvalidationReason::Expired);
            return ValidationOutcome::default();
        }

        match self
            .get::<ValidateResponse>(&self.config.validate_path, RequestOptions::default())
            .await
        {
            Ok(response) if self.store.renew(&record.token) => {
                info!("Stored session is valid");
                ValidationOutcome {
                    valid: true,
                    user: response.user,
                }
            }
            Ok(_) => {
                debug!("Session was cleared while it was being validated");
                ValidationOutcome::default()
            }
            Err(e) => {
                warn!(error = %e, "Session validation failed");
                self.drop_session(Some(&record.token), InvalidationReason::ValidationFailed);
                ValidationOutcome::default()
            }
        }
    }

    // ===== Internals =====

    /// Token to attach, or `AuthRequired` if a protected call has none.
    fn credential_for(
        &self,
        endpoint: &str,
        options: &RequestOptions,
    ) -> Result<Option<String>, ApiError> {
        // The login call never carries a credential, even a stale one.
        if options.skip_auth || self.policy.is_login(endpoint) {
            return Ok(None);
        }
        if self.policy.is_public(endpoint) {
            return Ok(None);
        }

        let Some(record) = self.store.read() else {
            debug!(endpoint, "No session for protected endpoint");
            return Err(ApiError::AuthRequired);
        };

        if self.policy.is_expired(&record) {
            info!(endpoint, "Stored session expired");
            self.drop_session(Some(&record.token), InvalidationReason::Expired);
            return Err(ApiError::AuthRequired);
        }

        Ok(Some(record.token))
    }

    fn classify(
        &self,
        endpoint: &str,
        sent_token: Option<&str>,
        status: StatusCode,
        content_type: Option<&str>,
        text: &str,
    ) -> Result<Value, ApiError> {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(endpoint, status = status.as_u16(), "Device rejected credential");
            self.drop_session(
                sent_token,
                InvalidationReason::Rejected {
                    status: status.as_u16(),
                },
            );
            return Err(ApiError::AuthRejected {
                status: status.as_u16(),
            });
        }

        if !status.is_success() {
            let err = ApiError::from_status(status, text);
            warn!(endpoint, status = status.as_u16(), error = %err, "Request failed");
            return Err(err);
        }

        if text.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }

        if let Some(content_type) = content_type {
            if !is_json_content_type(content_type) {
                warn!(endpoint, content_type, "Response is not JSON");
                return Err(ApiError::MalformedResponse(format!(
                    "Expected JSON from {}, got content type {}",
                    endpoint, content_type
                )));
            }
        }

        parse_body(text)
    }

    /// Clear the stored session and tell subscribers, once.
    ///
    /// With `token`, only a record still holding that token is cleared. The
    /// event goes out only if a record was actually removed, so concurrent
    /// failures for the same session broadcast exactly once.
    fn drop_session(&self, token: Option<&str>, reason: InvalidationReason) {
        let cleared = match token {
            Some(token) => self.store.clear_if_token(token),
            None => self.store.clear(),
        };

        if !cleared {
            debug!(?reason, "Session already cleared");
            return;
        }

        info!(?reason, "Session invalidated");
        if self.events.send(SessionEvent::Invalidated(reason)).is_err() {
            debug!("No session event subscribers");
        }
    }
}

fn decode<T: DeserializeOwned>(endpoint: &str, value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| {
        ApiError::MalformedResponse(format!("Unexpected response shape from {}: {}", endpoint, e))
    })
}

fn is_json_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || essence == "text/json" || essence.ends_with("+json")
}

// ============================================================================
// Tests
// ============================================================================
