//! Calls against the device's control surface.

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::models::{DeviceStatus, ModeStatus};

use super::{ApiError, RequestGateway, RequestOptions};

/// Device control calls, all routed through the shared gateway.
#[derive(Clone)]
pub struct DeviceClient {
    gateway: RequestGateway,
}

impl DeviceClient {
    pub fn new(gateway: RequestGateway) -> Self {
        Self { gateway }
    }

    /// Public health report. Works without a session.
    pub async fn fetch_status(&self) -> Result<DeviceStatus, ApiError> {
        let path = self.gateway.config().status_path.clone();
        self.gateway.get(&path, RequestOptions::default()).await
    }

    /// Current operating mode. Requires a session.
    pub async fn fetch_mode(&self, cancel: Option<CancellationToken>) -> Result<ModeStatus, ApiError> {
        let path = self.gateway.config().mode_path.clone();
        let options = RequestOptions {
            cancel,
            ..RequestOptions::default()
        };
        self.gateway.get(&path, options).await
    }

    /// Switch the operating mode. Returns the mode the device reports, or the
    /// requested one if the device answers with an empty body.
    pub async fn set_mode(&self, mode: &str) -> Result<ModeStatus, ApiError> {
        if mode.trim().is_empty() {
            return Err(ApiError::Validation("Mode must not be empty".to_string()));
        }

        let path = self.gateway.config().mode_path.clone();
        let value = self
            .gateway
            .send(
                reqwest::Method::POST,
                &path,
                Some(&json!({ "mode": mode })),
                RequestOptions::default(),
            )
            .await?;

        let status = if value.get("mode").is_some() {
            serde_json::from_value(value)
                .map_err(|e| ApiError::MalformedResponse(format!("Unexpected mode response: {}", e)))?
        } else {
            ModeStatus {
                mode: mode.to_string(),
            }
        };
        info!(mode = %status.mode, "Device mode updated");
        Ok(status)
    }
}
