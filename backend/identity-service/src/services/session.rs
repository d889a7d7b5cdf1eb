/// Session store adapter
///
/// Keeps session records and token revocation markers in an expiring store.
///
/// ## Keys
///
/// - `session:{session_id}` → JSON `SessionRecord`, session TTL
/// - `blacklist:{jti}` → marker, blacklist TTL
///
/// The blacklist TTL must be at least the longest token lifetime in
/// circulation so a revoked token cannot outlive its marker.
use crate::error::{IdentityError, Result};
use crate::models::{SessionRecord, SessionStats};
use crate::store::ExpiringStore;
use crate::validators::validate_session_id;
use chrono::Utc;
use rand::{rngs::OsRng, RngCore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SESSION_KEY_PREFIX: &str = "session:";
pub const BLACKLIST_KEY_PREFIX: &str = "blacklist:";

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_BLACKLIST_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const SESSION_ID_BYTES: usize = 24;
const BLACKLIST_MARKER: &str = "revoked";

fn session_key(session_id: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{session_id}")
}

fn blacklist_key(jti: &str) -> String {
    format!("{BLACKLIST_KEY_PREFIX}{jti}")
}

/// Generate an opaque session id from the OS CSPRNG
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn ExpiringStore>,
    session_ttl: Duration,
    blacklist_ttl: Duration,
}

impl SessionStore {
    pub fn new(store: Arc<dyn ExpiringStore>, session_ttl: Duration, blacklist_ttl: Duration) -> Self {
        Self {
            store,
            session_ttl,
            blacklist_ttl,
        }
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    pub fn blacklist_ttl(&self) -> Duration {
        self.blacklist_ttl
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Write a new session with the fixed session TTL
    pub async fn create_session(&self, session_id: &str, record: &SessionRecord) -> Result<()> {
        if !validate_session_id(session_id) || record.session_id != session_id {
            return Err(IdentityError::Validation(
                "session id is malformed or does not match the record".to_string(),
            ));
        }

        let payload = serde_json::to_string(record)?;
        self.store
            .set(&session_key(session_id), &payload, self.session_ttl)
            .await?;

        debug!(user_id = %record.user_id, "Session created");
        Ok(())
    }

    /// Read a live session; absent or expired is `SessionNotFound`
    pub async fn get_session(&self, session_id: &str) -> Result<SessionRecord> {
        if !validate_session_id(session_id) {
            return Err(IdentityError::SessionNotFound);
        }

        let payload = self
            .store
            .get(&session_key(session_id))
            .await?
            .ok_or(IdentityError::SessionNotFound)?;

        Ok(serde_json::from_str(&payload)?)
    }

    /// Rewrite a session keeping its remaining TTL
    pub async fn update_session(&self, session_id: &str, record: &SessionRecord) -> Result<()> {
        if !validate_session_id(session_id) {
            return Err(IdentityError::SessionNotFound);
        }

        let payload = serde_json::to_string(record)?;
        if self
            .store
            .replace_keep_ttl(&session_key(session_id), &payload)
            .await?
        {
            Ok(())
        } else {
            Err(IdentityError::SessionNotFound)
        }
    }

    /// Stamp the activity time without extending the TTL
    pub async fn update_last_activity(&self, session_id: &str) -> Result<SessionRecord> {
        let mut record = self.get_session(session_id).await?;
        record.last_activity = Utc::now();
        self.update_session(session_id, &record).await?;
        Ok(record)
    }

    /// Explicitly reset the session TTL
    pub async fn refresh_session(&self, session_id: &str) -> Result<()> {
        if !validate_session_id(session_id) {
            return Err(IdentityError::SessionNotFound);
        }

        if self
            .store
            .expire(&session_key(session_id), self.session_ttl)
            .await?
        {
            Ok(())
        } else {
            Err(IdentityError::SessionNotFound)
        }
    }

    /// Delete a session; deleting an absent session succeeds
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        if !validate_session_id(session_id) {
            return Ok(());
        }

        self.store.delete(&session_key(session_id)).await?;
        Ok(())
    }

    // ========================================================================
    // Revocation
    // ========================================================================

    /// Mark a token id as revoked for the blacklist TTL
    pub async fn blacklist_token(&self, jti: &str) -> Result<()> {
        self.store
            .set(&blacklist_key(jti), BLACKLIST_MARKER, self.blacklist_ttl)
            .await
    }

    /// Atomically revoke a token id, reporting whether this call did it
    ///
    /// Exactly one of any number of concurrent claims on the same id wins,
    /// which makes refresh tokens single use.
    pub async fn claim_token(&self, jti: &str) -> Result<bool> {
        self.store
            .set_if_absent(&blacklist_key(jti), BLACKLIST_MARKER, self.blacklist_ttl)
            .await
    }

    pub async fn is_blacklisted(&self, jti: &str) -> Result<bool> {
        self.store.exists(&blacklist_key(jti)).await
    }

    // ========================================================================
    // Principal-wide operations
    // ========================================================================
    //
    // These scan every session key. Fine for the current volume; at scale an
    // index of session ids per principal should replace the scan.

    async fn all_sessions(&self) -> Result<Vec<SessionRecord>> {
        let keys = self
            .store
            .keys_matching(&format!("{SESSION_KEY_PREFIX}*"))
            .await?;

        let mut sessions = Vec::with_capacity(keys.len());
        for key in keys {
            // Expired between SCAN and GET
            let Some(payload) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<SessionRecord>(&payload) {
                Ok(record) => sessions.push(record),
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable session record"),
            }
        }
        Ok(sessions)
    }

    pub async fn sessions_for_principal(&self, user_id: Uuid) -> Result<Vec<SessionRecord>> {
        Ok(self
            .all_sessions()
            .await?
            .into_iter()
            .filter(|session| session.user_id == user_id)
            .collect())
    }

    /// Delete every session belonging to `user_id`, returning how many
    pub async fn invalidate_all_sessions_for_principal(&self, user_id: Uuid) -> Result<usize> {
        let sessions = self.sessions_for_principal(user_id).await?;

        let mut removed = 0;
        for session in &sessions {
            if self.store.delete(&session_key(&session.session_id)).await? {
                removed += 1;
            }
        }

        info!(user_id = %user_id, removed, "Invalidated principal sessions");
        Ok(removed)
    }

    pub async fn session_stats(&self) -> Result<SessionStats> {
        let sessions = self.all_sessions().await?;

        let mut stats = SessionStats {
            total_sessions: sessions.len(),
            ..SessionStats::default()
        };
        for session in sessions {
            *stats.sessions_by_user.entry(session.user_id).or_default() += 1;
        }
        Ok(stats)
    }
}
