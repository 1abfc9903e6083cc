//! Authentication module for managing device sessions.
//!
//! This module provides:
//! - `TokenStore`: durable storage for the device-issued token, with pluggable backends
//! - `SessionPolicy`: which endpoints are public and when a token is too old
//! - `LoginCredentials`: transient login input with local validation
//! - `AuthOrchestrator`: the session state machine a front end observes
//!
//! Tokens are trusted for 24 hours by default and revalidated with the device
//! at startup.

pub mod credentials;
pub mod orchestrator;
pub mod policy;
pub mod storage;
pub mod store;

pub use credentials::LoginCredentials;
pub use orchestrator::{AuthOrchestrator, AuthPhase, SessionState};
pub use policy::SessionPolicy;
pub use storage::{FileStorage, KeyringStorage, MemoryStorage, StorageBackend, StorageError};
pub use store::{CredentialRecord, TokenStore};
