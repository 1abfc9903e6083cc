use chrono::{DateTime, Duration, Utc};

use super::store::CredentialRecord;

/// Default maximum token age in hours.
/// Device sessions have no server-side expiry claim, so the client retires
/// tokens after a day.
pub const DEFAULT_MAX_TOKEN_AGE_HOURS: i64 = 24;

/// Pure session decisions: which paths need a credential and when a stored
/// token is too old to use.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    login_path: String,
    public_paths: Vec<String>,
    max_age: Duration,
}

impl SessionPolicy {
    pub fn new(login_path: &str, public_paths: &[String], max_age: Duration) -> Self {
        Self {
            login_path: normalize(login_path).to_string(),
            public_paths: public_paths.iter().map(|p| normalize(p).to_string()).collect(),
            max_age,
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn is_login(&self, path: &str) -> bool {
        normalize(path) == self.login_path
    }

    pub fn is_public(&self, path: &str) -> bool {
        self.is_login(path) || {
            let path = normalize(path);
            self.public_paths.iter().any(|p| p == path)
        }
    }

    pub fn requires_auth(&self, path: &str) -> bool {
        !self.is_public(path)
    }

    /// True iff the record is strictly older than the maximum age.
    pub fn is_expired_at(&self, record: &CredentialRecord, now: DateTime<Utc>) -> bool {
        record.age_at(now) > self.max_age
    }

    pub fn is_expired(&self, record: &CredentialRecord) -> bool {
        self.is_expired_at(record, Utc::now())
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::new(
            "/api/login",
            &["/api/status".to_string(), "/api/health".to_string()],
            Duration::hours(DEFAULT_MAX_TOKEN_AGE_HOURS),
        )
    }
}

/// Strip the query string and any trailing slash.
fn normalize(path: &str) -> &str {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    match path.strip_suffix('/') {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => path,
    }
}
