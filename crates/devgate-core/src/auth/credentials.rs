use serde::Serialize;

use crate::api::ApiError;

/// Maximum length for username input.
pub const MAX_USERNAME_LENGTH: usize = 100;

/// Maximum length for password input.
/// 200 chars accommodates password managers and passphrases.
pub const MAX_PASSWORD_LENGTH: usize = 200;

/// Login form values. Sent once, never persisted.
#[derive(Clone, Serialize)]
pub struct LoginCredentials {
    pub username: String,
    pub password: String,
}

impl LoginCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Check presence and length before anything goes on the wire.
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.username.is_empty() || self.password.is_empty() {
            return Err(ApiError::Validation(
                "Username and password required".to_string(),
            ));
        }
        if self.username.chars().count() > MAX_USERNAME_LENGTH {
            return Err(ApiError::Validation(format!(
                "Username must be at most {} characters",
                MAX_USERNAME_LENGTH
            )));
        }
        if self.password.chars().count() > MAX_PASSWORD_LENGTH {
            return Err(ApiError::Validation(format!(
                "Password must be at most {} characters",
                MAX_PASSWORD_LENGTH
            )));
        }
        Ok(())
    }
}

// Keep the password out of logs and panic messages.
impl std::fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
