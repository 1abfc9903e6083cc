//! Wire types for the device API.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Profile the device reports for the logged-in user.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub username: String,
    /// Anything else the firmware includes (role, display name, ...).
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl UserProfile {
    pub fn named(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            attributes: Map::new(),
        }
    }
}

/// Body of a successful `POST <login>`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct LoginResponse {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user: Option<UserProfile>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Body of a successful `GET <validate>`.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ValidateResponse {
    #[serde(default)]
    pub user: Option<UserProfile>,
}

/// Current operating mode of the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeStatus {
    pub mode: String,
}

/// Public health/status report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceStatus {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, alias = "uptimeSecs")]
    pub uptime: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
