/// Principal persistence
///
/// The identity service is the only caller. Both implementations keep `id`
/// immutable and `email` unique.
///
/// Full-row writes are compare-and-swap on `updated_at`; the narrow writes
/// below touch only their own columns so they never revert a concurrent
/// change to the rest of the row.
use crate::error::Result;
use crate::models::Principal;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use uuid::Uuid;

pub mod memory;
pub mod users;

pub use memory::InMemoryUserStore;
pub use users::PgUserStore;

/// Schema for `PgUserStore`
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Durable user-record store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Lookup by (already normalized) email
    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Principal>>;

    /// Insert a new principal
    ///
    /// Fails with `EmailAlreadyExists` when the email is taken.
    async fn insert(&self, principal: &Principal) -> Result<()>;

    /// Replace a stored principal by id
    ///
    /// Only succeeds while the stored `updated_at` still equals
    /// `expected_updated_at`. Fails with `UserNotFound` when no principal has
    /// this id and with `StoreError::Conflict` when the row moved on.
    async fn update(&self, principal: &Principal, expected_updated_at: DateTime<Utc>) -> Result<()>;

    /// Set `last_login_at` and nothing else
    async fn record_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Swap the password hash if it is still `current_hash`
    ///
    /// Returns false when the hash changed in the meantime.
    async fn upgrade_password_hash(&self, id: Uuid, current_hash: &str, new_hash: &str) -> Result<bool>;

    /// Remove one backup-code hash; false when it was already consumed
    async fn consume_backup_code(&self, id: Uuid, code_hash: &str) -> Result<bool>;
}
