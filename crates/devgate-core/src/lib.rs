//! Core library for devgate.
//!
//! Provides the pieces a front end needs to talk to an embedded device's
//! HTTP API behind a login:
//! - `auth`: token persistence, session policy and the session state machine
//! - `api`: the request gateway every call passes through, plus device calls
//! - `config`: on-disk configuration with defaults for every field

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiError, DeviceClient, RequestGateway, RequestOptions, SessionEvent};
pub use auth::{AuthOrchestrator, AuthPhase, LoginCredentials, SessionPolicy, SessionState, TokenStore};
pub use config::Config;
