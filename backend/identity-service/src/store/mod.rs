//! Expiring key-value store abstraction
//!
//! Sessions and revocation markers live here. Expiry is enforced by the store
//! itself, so nothing in-process needs to stay alive for a TTL to lapse.
//!
//! - `RedisExpiringStore`: production backend (SCAN-based pattern listing)
//! - `InMemoryExpiringStore`: tests and single-node tooling

mod memory;
mod redis_store;

pub use self::memory::InMemoryExpiringStore;
pub use self::redis_store::RedisExpiringStore;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Remaining lifetime of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Expires(Duration),
}

impl KeyTtl {
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            KeyTtl::Expires(d) => Some(*d),
            _ => None,
        }
    }
}

/// Core expiring store operations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExpiringStore: Send + Sync {
    /// Write `value` with a fresh TTL, overwriting any previous value
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Write only if the key is absent; true when this call wrote it
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Overwrite an existing key keeping its remaining TTL; false when absent
    async fn replace_keep_ttl(&self, key: &str, value: &str) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete a key; true when it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn ttl_remaining(&self, key: &str) -> Result<KeyTtl>;

    /// Reset the TTL of an existing key; false when absent
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Keys matching a glob pattern (`*` and `?`)
    ///
    /// Linear in the keyspace; not for request hot paths.
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>>;
}

/// Millisecond TTL as the stores accept it (never zero)
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}
