use super::{ttl_millis, ExpiringStore, KeyTtl};
use crate::error::Result;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Stand-in deadline for TTLs the clock cannot represent (about a century)
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn deadline(now: Instant, ttl: Duration) -> Instant {
    let ttl = Duration::from_millis(ttl_millis(ttl));
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Instant,
}

impl StoredValue {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: deadline(Instant::now(), ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process expiring store
///
/// Expiry follows the Tokio clock, so paused-time tests can advance past TTLs.
/// Expired entries are dropped lazily on access.
#[derive(Default)]
pub struct InMemoryExpiringStore {
    entries: DashMap<String, StoredValue>,
}

impl InMemoryExpiringStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.is_live(now));
        before - self.entries.len()
    }

    fn live(&self, key: &str) -> Option<StoredValue> {
        let now = Instant::now();
        let stored = self.entries.get(key).map(|entry| entry.value().clone())?;
        if stored.is_live(now) {
            Some(stored)
        } else {
            self.entries.remove_if(key, |_, v| !v.is_live(now));
            None
        }
    }
}

#[async_trait]
impl ExpiringStore for InMemoryExpiringStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(StoredValue::new(value, ttl));
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn replace_keep_ttl(&self, key: &str, value: &str) -> Result<bool> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => {
                entry.value = value.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live(key).map(|stored| stored.value))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, stored)| stored.is_live(now)))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live(key).is_some())
    }

    async fn ttl_remaining(&self, key: &str) -> Result<KeyTtl> {
        Ok(match self.live(key) {
            Some(stored) => KeyTtl::Expires(stored.expires_at - Instant::now()),
            None => KeyTtl::Missing,
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => {
                entry.expires_at = deadline(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_live(now) && glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }
}

/// Redis-style glob: `*` any run, `?` any single char, `\` escapes
pub(crate) fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();

    let (mut p, mut c) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while c < candidate.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, c));
                p += 1;
                continue;
            }
            Some('?') => {
                p += 1;
                c += 1;
                continue;
            }
            Some('\\') if p + 1 < pattern.len() && pattern[p + 1] == candidate[c] => {
                p += 2;
                c += 1;
                continue;
            }
            Some(&ch) if ch != '\\' && ch == candidate[c] => {
                p += 1;
                c += 1;
                continue;
            }
            _ => {}
        }

        match backtrack {
            Some((star, matched)) => {
                p = star + 1;
                c = matched + 1;
                backtrack = Some((star, matched + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|ch| *ch == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("session:*", "session:abc"));
        assert!(glob_match("session:*", "session:"));
        assert!(!glob_match("session:*", "blacklist:abc"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("*:*:end", "x:y:z:end"));
        assert!(glob_match(r"lit\*", "lit*"));
        assert!(!glob_match(r"lit\*", "litx"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_keeps_value() {
        let store = InMemoryExpiringStore::new();
        store.set("k", "v", Duration::MAX).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store
            .set_if_absent("n", "v", Duration::from_secs(u64::MAX))
            .await
            .unwrap());
        assert!(store.expire("k", Duration::MAX).await.unwrap());
        assert!(matches!(
            store.ttl_remaining("k").await.unwrap(),
            KeyTtl::Expires(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_values_expire_on_tokio_clock() {
        let store = InMemoryExpiringStore::new();
        store
            .set("k", "v", Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.ttl_remaining("k").await.unwrap(), KeyTtl::Missing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_keep_ttl_preserves_deadline() {
        let store = InMemoryExpiringStore::new();
        store.set("k", "v1", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;

        assert!(store.replace_keep_ttl("k", "v2").await.unwrap());
        assert_eq!(
            store.ttl_remaining("k").await.unwrap(),
            KeyTtl::Expires(Duration::from_secs(6))
        );
        assert!(!store.replace_keep_ttl("missing", "v").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_resets_deadline() {
        let store = InMemoryExpiringStore::new();
        store.set("k", "v", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;

        assert!(store.expire("k", Duration::from_secs(10)).await.unwrap());
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.exists("k").await.unwrap());
        assert!(!store.expire("missing", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent() {
        let store = InMemoryExpiringStore::new();
        assert!(store.set_if_absent("k", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!store.set_if_absent("k", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.set_if_absent("k", "c", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_matching_skips_expired() {
        let store = InMemoryExpiringStore::new();
        store.set("session:a", "1", Duration::from_secs(5)).await.unwrap();
        store.set("session:b", "2", Duration::from_secs(50)).await.unwrap();
        store.set("blacklist:c", "3", Duration::from_secs(50)).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(
            store.keys_matching("session:*").await.unwrap(),
            vec!["session:b".to_string()]
        );
        assert_eq!(store.purge_expired(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = InMemoryExpiringStore::new();
        store.set("k", "v", Duration::from_secs(5)).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }
}
