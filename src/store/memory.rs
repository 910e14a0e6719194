//! In-memory store backend.
//!
//! Backs all unit and integration tests, and doubles as an embedded
//! backend for single-process deployments. A unit of work takes the table's
//! write lock for its whole scope, which makes multi-step mutations (e.g.
//! refresh-token rotation) linearizable: concurrent transactions on the
//! same table serialize, and the loser re-reads already-committed state.

use crate::errors::AuthError;
use crate::store::{Entity, Repository, Transactional, UnitOfWork};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

pub struct MemoryStore<T: Entity> {
    table: Arc<RwLock<HashMap<T::Id, T>>>,
}

impl<T: Entity> MemoryStore<T> {
    pub fn new() -> Self {
        MemoryStore {
            table: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<T: Entity> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Clone for MemoryStore<T> {
    fn clone(&self) -> Self {
        MemoryStore {
            table: Arc::clone(&self.table),
        }
    }
}

fn add_to<T: Entity>(table: &mut HashMap<T::Id, T>, mut entity: T) -> Result<T, AuthError> {
    if table.contains_key(&entity.id()) {
        return Err(AuthError::Conflict("entity already exists".to_string()));
    }
    if table.values().any(|existing| existing.conflicts_with(&entity)) {
        return Err(AuthError::Conflict(
            "uniqueness constraint violated".to_string(),
        ));
    }
    entity.set_version(1);
    table.insert(entity.id(), entity.clone());
    Ok(entity)
}

fn update_in<T: Entity>(table: &mut HashMap<T::Id, T>, mut entity: T) -> Result<T, AuthError> {
    let current = table
        .get(&entity.id())
        .ok_or_else(|| AuthError::NotFound("entity does not exist".to_string()))?;

    if current.version() != entity.version() {
        return Err(AuthError::Conflict(
            "concurrent modification detected".to_string(),
        ));
    }

    let id = entity.id();
    if table
        .values()
        .any(|other| other.id() != id && other.conflicts_with(&entity))
    {
        return Err(AuthError::Conflict(
            "uniqueness constraint violated".to_string(),
        ));
    }

    entity.set_version(entity.version() + 1);
    table.insert(entity.id(), entity.clone());
    Ok(entity)
}

#[async_trait]
impl<T: Entity> Repository<T> for MemoryStore<T> {
    async fn get(&self, id: &T::Id) -> Result<Option<T>, AuthError> {
        Ok(self.table.read().await.get(id).cloned())
    }

    async fn find(&self, filter: &T::Filter) -> Result<Vec<T>, AuthError> {
        Ok(self
            .table
            .read()
            .await
            .values()
            .filter(|entity| entity.matches(filter))
            .cloned()
            .collect())
    }

    async fn add(&self, entity: T) -> Result<T, AuthError> {
        add_to(&mut *self.table.write().await, entity)
    }

    async fn update(&self, entity: T) -> Result<T, AuthError> {
        update_in(&mut *self.table.write().await, entity)
    }

    async fn remove(&self, id: &T::Id) -> Result<(), AuthError> {
        self.table.write().await.remove(id);
        Ok(())
    }
}

/// Unit of work over a memory table.
///
/// Holds the table's write lock and mutates a staged copy; `commit` swaps
/// the staged copy in, dropping without commit discards it.
pub struct MemoryUow<T: Entity> {
    guard: OwnedRwLockWriteGuard<HashMap<T::Id, T>>,
    staged: HashMap<T::Id, T>,
}

#[async_trait]
impl<T: Entity> UnitOfWork<T> for MemoryUow<T> {
    async fn get(&mut self, id: &T::Id) -> Result<Option<T>, AuthError> {
        Ok(self.staged.get(id).cloned())
    }

    async fn find(&mut self, filter: &T::Filter) -> Result<Vec<T>, AuthError> {
        Ok(self
            .staged
            .values()
            .filter(|entity| entity.matches(filter))
            .cloned()
            .collect())
    }

    async fn add(&mut self, entity: T) -> Result<T, AuthError> {
        add_to(&mut self.staged, entity)
    }

    async fn update(&mut self, entity: T) -> Result<T, AuthError> {
        update_in(&mut self.staged, entity)
    }

    async fn commit(mut self) -> Result<(), AuthError> {
        *self.guard = self.staged;
        Ok(())
    }
}

#[async_trait]
impl<T: Entity> Transactional<T> for MemoryStore<T> {
    type Uow = MemoryUow<T>;

    async fn begin(&self) -> Result<MemoryUow<T>, AuthError> {
        let guard = Arc::clone(&self.table).write_owned().await;
        let staged = guard.clone();
        Ok(MemoryUow { guard, staged })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RefreshToken, RefreshTokenFilter, User, UserFilter};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn user(username: &str, email: &str) -> User {
        User::new(
            username.to_string(),
            email.to_string(),
            "hash".to_string(),
            "bcrypt".to_string(),
        )
    }

    fn refresh_token(user_id: Uuid) -> RefreshToken {
        RefreshToken {
            token_id: Uuid::new_v4().to_string(),
            user_id,
            issued_at: Utc::now(),
            expires_at: Utc::now() + Duration::days(7),
            revoked: false,
            replaced_by: None,
            version: 0,
        }
    }

    #[tokio::test]
    async fn test_add_get_remove_roundtrip() {
        let store = MemoryStore::<User>::new();
        let added = store.add(user("alice", "alice@x.com")).await.unwrap();
        assert_eq!(added.version, 1);

        let fetched = store.get(&added.user_id).await.unwrap();
        assert_eq!(fetched.unwrap().username, "alice");

        store.remove(&added.user_id).await.unwrap();
        assert!(store.get(&added.user_id).await.unwrap().is_none());

        // remove is idempotent
        store.remove(&added.user_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_add_rejects_uniqueness_violation() {
        let store = MemoryStore::<User>::new();
        store.add(user("alice", "alice@x.com")).await.unwrap();

        let result = store.add(user("ALICE", "other@x.com")).await;
        assert!(matches!(result, Err(AuthError::Conflict(_))));

        // The failed add left no partial write.
        let all = store.find(&UserFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_update_absent_entity_is_not_found() {
        let store = MemoryStore::<User>::new();
        let result = store.update(user("ghost", "ghost@x.com")).await;
        assert!(matches!(result, Err(AuthError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_detects_concurrent_modification() {
        let store = MemoryStore::<User>::new();
        let added = store.add(user("alice", "alice@x.com")).await.unwrap();

        // Two readers take the same version; the second write loses.
        let mut first = added.clone();
        first.failed_logins = 1;
        let mut second = added.clone();
        second.failed_logins = 2;

        store.update(first).await.unwrap();
        let result = store.update(second).await;
        assert!(matches!(result, Err(AuthError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_find_applies_filter() {
        let store = MemoryStore::<RefreshToken>::new();
        let user_id = Uuid::new_v4();
        store.add(refresh_token(user_id)).await.unwrap();
        store.add(refresh_token(user_id)).await.unwrap();
        store.add(refresh_token(Uuid::new_v4())).await.unwrap();

        let mine = store
            .find(&RefreshTokenFilter {
                user_id: Some(user_id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(mine.len(), 2);
    }

    #[tokio::test]
    async fn test_uow_commit_publishes_staged_writes() {
        let store = MemoryStore::<RefreshToken>::new();
        let user_id = Uuid::new_v4();

        let mut uow = store.begin().await.unwrap();
        let token = uow.add(refresh_token(user_id)).await.unwrap();
        uow.commit().await.unwrap();

        assert!(store.get(&token.token_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_uow_update_absent_entity_is_not_found() {
        let store = MemoryStore::<RefreshToken>::new();
        let mut uow = store.begin().await.unwrap();

        let result = uow.update(refresh_token(Uuid::new_v4())).await;
        assert!(matches!(result, Err(AuthError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_uow_drop_rolls_back() {
        let store = MemoryStore::<RefreshToken>::new();
        let user_id = Uuid::new_v4();

        let token_id = {
            let mut uow = store.begin().await.unwrap();
            let token = uow.add(refresh_token(user_id)).await.unwrap();
            token.token_id
            // uow dropped here without commit
        };

        assert!(store.get(&token_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_uow_rollback_discards_updates_to_existing_rows() {
        let store = MemoryStore::<RefreshToken>::new();
        let token = store.add(refresh_token(Uuid::new_v4())).await.unwrap();

        {
            let mut uow = store.begin().await.unwrap();
            let mut staged = uow.get(&token.token_id).await.unwrap().unwrap();
            staged.revoked = true;
            uow.update(staged).await.unwrap();
        }

        let current = store.get(&token.token_id).await.unwrap().unwrap();
        assert!(!current.revoked);
    }

    #[tokio::test]
    async fn test_concurrent_uows_serialize() {
        let store = MemoryStore::<RefreshToken>::new();
        let token = store.add(refresh_token(Uuid::new_v4())).await.unwrap();

        let store_a = store.clone();
        let store_b = store.clone();
        let id_a = token.token_id.clone();
        let id_b = token.token_id.clone();

        let revoke = |store: MemoryStore<RefreshToken>, id: String| async move {
            let mut uow = store.begin().await?;
            if let Some(mut t) = uow.get(&id).await? {
                t.revoked = true;
                uow.update(t).await?;
            }
            uow.commit().await
        };

        let (a, b) = tokio::join!(revoke(store_a, id_a), revoke(store_b, id_b));
        assert!(a.is_ok());
        assert!(b.is_ok());

        let current = store.get(&token.token_id).await.unwrap().unwrap();
        assert!(current.revoked);
        // Both transactions committed in sequence: version bumped twice.
        assert_eq!(current.version, 3);
    }
}
