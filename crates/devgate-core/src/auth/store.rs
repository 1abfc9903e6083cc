use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::storage::{MemoryStorage, StorageBackend};

/// Storage key for the persisted session. Bump the version when the layout changes.
pub const SESSION_KEY: &str = "devgate.session.v1";

/// Persisted credential: the device-issued token and when we stored it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub token: String,
    #[serde(rename = "issuedAt", with = "chrono::serde::ts_milliseconds")]
    pub issued_at: DateTime<Utc>,
}

impl CredentialRecord {
    pub fn new(token: String) -> Self {
        Self {
            token,
            issued_at: Utc::now(),
        }
    }

    /// Age relative to `now`, never negative (clock skew reads as zero).
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.issued_at).max(Duration::zero())
    }

    pub fn age(&self) -> Duration {
        self.age_at(Utc::now())
    }
}

/// What the store knows beyond the backend.
///
/// A failed write or delete leaves the backend holding an outdated payload,
/// which must not shadow the in-process view.
#[derive(Debug, Clone)]
enum Local {
    /// The backend is authoritative.
    Backend,
    /// The backend refused the last write; this record is current.
    Held(CredentialRecord),
    /// The backend refused the last delete; treat the session as absent.
    Cleared,
}

/// Single source of truth for the persisted credential record.
///
/// Every operation holds `local`'s lock for its whole duration, so
/// read-modify-write sequences never interleave. When the backend refuses a
/// write the record is held in memory; the session then still works but does
/// not survive a restart.
pub struct TokenStore {
    backend: Arc<dyn StorageBackend>,
    key: String,
    local: Mutex<Local>,
}

impl TokenStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self::with_key(backend, SESSION_KEY)
    }

    pub fn with_key(backend: Arc<dyn StorageBackend>, key: &str) -> Self {
        Self {
            backend,
            key: key.to_string(),
            local: Mutex::new(Local::Backend),
        }
    }

    /// Store backed by process memory only
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    fn lock(&self) -> MutexGuard<'_, Local> {
        self.local.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Persist `token` with the current time. Returns false if the backend
    /// could not store it; the record is then held in memory only.
    pub fn save(&self, token: &str) -> bool {
        let mut local = self.lock();
        self.save_locked(&mut local, token)
    }

    fn save_locked(&self, local: &mut Local, token: &str) -> bool {
        let record = CredentialRecord::new(token.to_string());

        let durable = match serde_json::to_string(&record) {
            Ok(payload) => match self.backend.set(&self.key, &payload) {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Failed to persist session, keeping it in memory");
                    false
                }
            },
            Err(e) => {
                warn!(error = %e, "Failed to serialize session");
                false
            }
        };

        if durable {
            *local = Local::Backend;
        } else {
            // Best effort: an older payload would outlive this process otherwise.
            if let Err(e) = self.backend.remove(&self.key) {
                debug!(error = %e, "Failed to drop outdated stored session");
            }
            *local = Local::Held(record);
        }
        durable
    }

    /// Current record, if any. A corrupt stored payload is deleted and
    /// reported as absent.
    pub fn read(&self) -> Option<CredentialRecord> {
        let mut local = self.lock();
        self.read_locked(&mut local)
    }

    fn read_locked(&self, local: &mut Local) -> Option<CredentialRecord> {
        match local {
            Local::Held(record) => return Some(record.clone()),
            Local::Cleared => return None,
            Local::Backend => {}
        }

        let payload = match self.backend.get(&self.key) {
            Ok(payload) => payload?,
            Err(e) => {
                warn!(error = %e, "Failed to read stored session");
                return None;
            }
        };

        match serde_json::from_str::<CredentialRecord>(&payload) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "Stored session is corrupt, deleting it");
                if let Err(e) = self.backend.remove(&self.key) {
                    warn!(error = %e, "Failed to delete corrupt session");
                    *local = Local::Cleared;
                }
                None
            }
        }
    }

    pub fn exists(&self) -> bool {
        self.read().is_some()
    }

    /// Delete the record. Returns true if one was present.
    pub fn clear(&self) -> bool {
        let mut local = self.lock();
        self.clear_locked(&mut local)
    }

    /// Delete the record only if it still holds `token`.
    ///
    /// A rejection for an older token must not wipe a session created since.
    pub fn clear_if_token(&self, token: &str) -> bool {
        let mut local = self.lock();
        match self.read_locked(&mut local) {
            Some(record) if record.token == token => self.clear_locked(&mut local),
            Some(_) => {
                debug!("Stored token changed since the request was sent, keeping it");
                false
            }
            None => false,
        }
    }

    /// Store `token` again with a fresh issue time, but only if it is still
    /// the current token.
    pub fn renew(&self, token: &str) -> bool {
        let mut local = self.lock();
        match self.read_locked(&mut local) {
            Some(record) if record.token == token => {
                self.save_locked(&mut local, token);
                true
            }
            _ => false,
        }
    }

    fn clear_locked(&self, local: &mut Local) -> bool {
        let had_record = self.read_locked(local).is_some();
        *local = match self.backend.remove(&self.key) {
            Ok(()) => Local::Backend,
            Err(e) => {
                warn!(error = %e, "Failed to delete stored session");
                Local::Cleared
            }
        };
        had_record
    }
}
