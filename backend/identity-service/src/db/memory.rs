/// In-process principal store for tests and single-node tooling
use super::UserStore;
use crate::error::{IdentityError, Result, StoreError};
use crate::models::Principal;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryUserStore {
    by_id: DashMap<Uuid, Principal>,
    email_index: DashMap<String, Uuid>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>> {
        let Some(id) = self.email_index.get(email).map(|entry| *entry.value()) else {
            return Ok(None);
        };
        Ok(self.by_id.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Principal>> {
        Ok(self.by_id.get(&id).map(|entry| entry.value().clone()))
    }

    async fn insert(&self, principal: &Principal) -> Result<()> {
        if self.by_id.contains_key(&principal.id) {
            return Err(IdentityError::Internal(format!(
                "principal id {} already exists",
                principal.id
            )));
        }

        // Lock order is by_id before email_index; the index guard is released
        // before the row goes in
        match self.email_index.entry(principal.email.clone()) {
            Entry::Occupied(_) => return Err(IdentityError::EmailAlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(principal.id);
            }
        }
        self.by_id.insert(principal.id, principal.clone());
        Ok(())
    }

    async fn update(&self, principal: &Principal, expected_updated_at: DateTime<Utc>) -> Result<()> {
        let mut stored = self
            .by_id
            .get_mut(&principal.id)
            .ok_or(IdentityError::UserNotFound)?;
        if stored.updated_at != expected_updated_at {
            return Err(IdentityError::Store(StoreError::Conflict(format!(
                "principal {} changed since it was read",
                principal.id
            ))));
        }

        if stored.email != principal.email {
            match self.email_index.entry(principal.email.clone()) {
                Entry::Occupied(_) => return Err(IdentityError::EmailAlreadyExists),
                Entry::Vacant(slot) => {
                    slot.insert(principal.id);
                }
            }
            self.email_index.remove(&stored.email);
        }

        *stored = principal.clone();
        Ok(())
    }

    async fn record_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut stored = self.by_id.get_mut(&id).ok_or(IdentityError::UserNotFound)?;
        stored.last_login_at = Some(at);
        Ok(())
    }

    async fn upgrade_password_hash(&self, id: Uuid, current_hash: &str, new_hash: &str) -> Result<bool> {
        let Some(mut stored) = self.by_id.get_mut(&id) else {
            return Ok(false);
        };
        if stored.password_hash != current_hash {
            return Ok(false);
        }
        stored.password_hash = new_hash.to_string();
        stored.touch();
        Ok(true)
    }

    async fn consume_backup_code(&self, id: Uuid, code_hash: &str) -> Result<bool> {
        let Some(mut stored) = self.by_id.get_mut(&id) else {
            return Ok(false);
        };
        let Some(index) = stored.backup_code_hashes.iter().position(|h| h == code_hash) else {
            return Ok(false);
        };
        stored.backup_code_hashes.remove(index);
        stored.touch();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewPrincipal, Role, SecurityClearance};

    fn principal(email: &str) -> Principal {
        Principal::new(
            &NewPrincipal {
                email: email.to_string(),
                name: "Test User".to_string(),
                department: "Ops".to_string(),
                role: Role::Viewer,
                security_clearance: SecurityClearance::Public,
                permissions: vec![],
            },
            "hash".to_string(),
        )
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = InMemoryUserStore::new();
        let user = principal("a@example.com");
        store.insert(&user).await.unwrap();

        assert_eq!(
            store.find_by_email("a@example.com").await.unwrap().unwrap().id,
            user.id
        );
        assert!(store.find_by_id(user.id).await.unwrap().is_some());
        assert!(store.find_by_email("b@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected() {
        let store = InMemoryUserStore::new();
        store.insert(&principal("a@example.com")).await.unwrap();
        assert!(matches!(
            store.insert(&principal("a@example.com")).await,
            Err(IdentityError::EmailAlreadyExists)
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_update_moves_email_index() {
        let store = InMemoryUserStore::new();
        let mut user = principal("a@example.com");
        store.insert(&user).await.unwrap();
        store.insert(&principal("taken@example.com")).await.unwrap();

        let read_at = user.updated_at;
        user.email = "taken@example.com".to_string();
        assert!(matches!(
            store.update(&user, read_at).await,
            Err(IdentityError::EmailAlreadyExists)
        ));

        user.email = "new@example.com".to_string();
        store.update(&user, read_at).await.unwrap();
        assert!(store.find_by_email("a@example.com").await.unwrap().is_none());
        assert!(store.find_by_email("new@example.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_unknown_principal() {
        let store = InMemoryUserStore::new();
        let user = principal("a@example.com");
        assert!(matches!(
            store.update(&user, user.updated_at).await,
            Err(IdentityError::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn test_update_from_stale_read_conflicts() {
        let store = InMemoryUserStore::new();
        let user = principal("a@example.com");
        store.insert(&user).await.unwrap();

        let mut first = store.find_by_id(user.id).await.unwrap().unwrap();
        let mut second = first.clone();

        first.is_active = false;
        first.touch();
        store.update(&first, user.updated_at).await.unwrap();

        second.name = "Renamed".to_string();
        second.touch();
        let err = store.update(&second, user.updated_at).await.unwrap_err();
        assert!(err.is_conflict());

        let stored = store.find_by_id(user.id).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.name, "Test User");
    }

    #[tokio::test]
    async fn test_record_login_leaves_other_columns() {
        let store = InMemoryUserStore::new();
        let user = principal("a@example.com");
        store.insert(&user).await.unwrap();

        let mut deactivated = user.clone();
        deactivated.is_active = false;
        deactivated.touch();
        store.update(&deactivated, user.updated_at).await.unwrap();

        let at = Utc::now();
        store.record_login(user.id, at).await.unwrap();
        let stored = store.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(stored.last_login_at, Some(at));
        assert!(!stored.is_active);
        assert_eq!(stored.updated_at, deactivated.updated_at);
    }

    #[tokio::test]
    async fn test_password_hash_upgrade_requires_current_hash() {
        let store = InMemoryUserStore::new();
        let user = principal("a@example.com");
        store.insert(&user).await.unwrap();

        assert!(!store
            .upgrade_password_hash(user.id, "stale", "upgraded")
            .await
            .unwrap());
        assert!(store
            .upgrade_password_hash(user.id, "hash", "upgraded")
            .await
            .unwrap());
        let stored = store.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(stored.password_hash, "upgraded");
    }

    #[tokio::test]
    async fn test_backup_code_consumed_once() {
        let store = InMemoryUserStore::new();
        let mut user = principal("a@example.com");
        user.backup_code_hashes = vec!["h1".to_string(), "h2".to_string()];
        store.insert(&user).await.unwrap();

        assert!(store.consume_backup_code(user.id, "h1").await.unwrap());
        assert!(!store.consume_backup_code(user.id, "h1").await.unwrap());
        let stored = store.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(stored.backup_code_hashes, vec!["h2".to_string()]);

        assert!(!store.consume_backup_code(Uuid::new_v4(), "h2").await.unwrap());
    }
}
