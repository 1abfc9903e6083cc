use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not logged in - request requires a session")]
    AuthRequired,

    #[error("Credential rejected by device (status {status})")]
    AuthRejected { status: u16 },

    #[error("Request failed with status {status}: {}", .message.as_deref().unwrap_or("no message"))]
    RequestFailed { status: u16, message: Option<String> },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request cancelled")]
    Cancelled,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    pub(crate) fn truncate_body(body: &str, max_chars: usize) -> String {
        match body.char_indices().nth(max_chars) {
            None => body.to_string(),
            Some((cut, _)) => format!(
                "{}... (truncated, {} total bytes)",
                &body[..cut],
                body.len()
            ),
        }
    }

    /// Build the error for a non-2xx status that is not an authorization failure.
    ///
    /// The device usually reports failures as `{"message": "..."}` or
    /// `{"error": "..."}`; anything else is kept as truncated text.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| {
                ["message", "error"]
                    .iter()
                    .find_map(|k| v.get(*k).and_then(Value::as_str).map(str::to_string))
            })
            .or_else(|| {
                let trimmed = body.trim();
                (!trimmed.is_empty()).then(|| Self::truncate_body(trimmed, MAX_ERROR_BODY_LENGTH))
            });

        match status.as_u16() {
            code @ (401 | 403) => ApiError::AuthRejected { status: code },
            code => ApiError::RequestFailed { status: code, message },
        }
    }

    /// Whether a caller may reasonably retry the failed operation.
    ///
    /// Only transport failures and 5xx responses qualify. Authorization
    /// failures, bad input, 4xx responses and cancellations never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Network(_) => true,
            ApiError::RequestFailed { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether this error means the session has been dropped.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ApiError::AuthRejected { .. } | ApiError::AuthRequired)
    }

    /// Short human-readable text for display. Raw detail stays in the log.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Validation(msg) => msg.clone(),
            ApiError::AuthRequired => "Please log in to continue.".to_string(),
            ApiError::AuthRejected { .. } => {
                "Session expired. Please log in again.".to_string()
            }
            ApiError::RequestFailed { status, message } => match (status, message) {
                (429, _) => "Device is busy. Please wait and try again.".to_string(),
                (500..=599, _) => "Device reported an internal error. Please try again.".to_string(),
                (_, Some(msg)) if msg.chars().count() <= 120 => msg.clone(),
                _ => format!("Request failed ({})", status),
            },
            ApiError::MalformedResponse(_) => "Device sent an unexpected response.".to_string(),
            ApiError::Network(e) if e.is_timeout() => {
                "Connection timed out. Please try again.".to_string()
            }
            ApiError::Network(_) => {
                "Unable to reach the device. Check your network connection.".to_string()
            }
            ApiError::Cancelled => "Request cancelled.".to_string(),
        }
    }

    /// Like `user_message`, for errors returned by a login attempt, where a
    /// rejection means the credentials were wrong.
    pub fn login_message(&self) -> String {
        match self {
            ApiError::AuthRejected { .. } => "Invalid username or password".to_string(),
            other => other.user_message(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_from_status_auth_failures() {
        assert!(matches!(
            ApiError::from_status(StatusCode::UNAUTHORIZED, ""),
            ApiError::AuthRejected { status: 401 }
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::FORBIDDEN, "nope"),
            ApiError::AuthRejected { status: 403 }
        ));
    }

    #[test]
    fn test_from_status_extracts_server_message() {
        let err = ApiError::from_status(StatusCode::BAD_REQUEST, r#"{"message":"bad mode"}"#);
        match err {
            ApiError::RequestFailed { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message.as_deref(), Some("bad mode"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = ApiError::from_status(StatusCode::NOT_FOUND, r#"{"error":"no such path"}"#);
        assert!(matches!(
            err,
            ApiError::RequestFailed { status: 404, message: Some(ref m) } if m == "no such path"
        ));
    }

    #[test]
    fn test_from_status_plain_body_and_empty_body() {
        let err = ApiError::from_status(StatusCode::INTERNAL_SERVER_ERROR, "  boom \n");
        assert!(matches!(
            err,
            ApiError::RequestFailed { status: 500, message: Some(ref m) } if m == "boom"
        ));

        let err = ApiError::from_status(StatusCode::BAD_GATEWAY, "");
        assert!(matches!(err, ApiError::RequestFailed { status: 502, message: None }));
    }

    #[test]
    fn test_truncate_body_respects_char_boundaries() {
        let body = "é".repeat(10);
        let truncated = ApiError::truncate_body(&body, 4);
        assert!(truncated.starts_with("éééé..."));
        assert!(truncated.contains("20 total bytes"));
        assert_eq!(ApiError::truncate_body("short", 10), "short");
    }

    #[test]
    fn test_is_retryable() {
        assert!(ApiError::RequestFailed { status: 500, message: None }.is_retryable());
        assert!(ApiError::RequestFailed { status: 503, message: None }.is_retryable());
        assert!(!ApiError::RequestFailed { status: 404, message: None }.is_retryable());
        assert!(!ApiError::RequestFailed { status: 429, message: None }.is_retryable());
        assert!(!ApiError::AuthRejected { status: 401 }.is_retryable());
        assert!(!ApiError::Validation("x".into()).is_retryable());
        assert!(!ApiError::Cancelled.is_retryable());
        assert!(!ApiError::AuthRequired.is_retryable());
    }

    #[test]
    fn test_user_message_hides_detail() {
        let err = ApiError::MalformedResponse("excerpt: {\"mode\": \u{1}".into());
        assert_eq!(err.user_message(), "Device sent an unexpected response.");
        assert!(err.to_string().contains("excerpt"));

        let err = ApiError::RequestFailed {
            status: 400,
            message: Some("Mode not supported".into()),
        };
        assert_eq!(err.user_message(), "Mode not supported");
    }

    #[test]
    fn test_rejection_message_depends_on_context() {
        let err = ApiError::AuthRejected { status: 403 };
        assert_eq!(err.user_message(), "Session expired. Please log in again.");
        assert_eq!(err.login_message(), "Invalid username or password");

        let err = ApiError::Validation("Username and password required".into());
        assert_eq!(err.login_message(), err.user_message());
    }
}
