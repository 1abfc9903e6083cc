//! HTTP layer for the device API.
//!
//! Every request goes through `RequestGateway`, which attaches the bearer
//! token, classifies responses and collapses the session when the device
//! rejects a credential. `DeviceClient` builds the control calls on top of it.

pub mod device;
pub mod error;
pub mod gateway;
pub mod json;
pub mod retry;

pub use device::DeviceClient;
pub use error::ApiError;
pub use gateway::{
    InvalidationReason, LoginOutcome, RequestGateway, RequestOptions, SessionEvent,
    ValidationOutcome,
};
pub use retry::{retry_transient, RetryPolicy};
