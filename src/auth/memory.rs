use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::auth::repo::{AuthStore, AuthTx, StoreError, StoreResult};
use crate::auth::repo_types::{NewUser, User, VerificationToken};

#[derive(Debug, Clone, Default)]
struct Tables {
    users: Vec<User>,
    tokens: Vec<VerificationToken>,
}

/// In-process store for tests. A transaction holds the whole store lock, so
/// transactions are fully serialized.
#[derive(Clone, Default)]
pub struct MemoryAuthStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: User) {
        self.tables.lock().await.users.push(user);
    }

    pub async fn insert_token(&self, token: VerificationToken) {
        self.tables.lock().await.tokens.push(token);
    }

    pub async fn user_count(&self) -> usize {
        self.tables.lock().await.users.len()
    }

    pub async fn token_count(&self) -> usize {
        self.tables.lock().await.tokens.len()
    }

    pub async fn tokens_for_user(&self, user_id: Uuid) -> StoreResult<Vec<VerificationToken>> {
        let t = self.tables.lock().await;
        Ok(t.tokens
            .iter()
            .filter(|v| v.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AuthStore for MemoryAuthStore {
    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let t = self.tables.lock().await;
        Ok(t.users.iter().find(|u| u.email == email).cloned())
    }

    async fn find_user_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        let t = self.tables.lock().await;
        Ok(t.users.iter().find(|u| u.id == id).cloned())
    }

    async fn find_token(&self, token: &str) -> StoreResult<Option<VerificationToken>> {
        let t = self.tables.lock().await;
        Ok(t.tokens.iter().find(|v| v.token == token).cloned())
    }

    async fn begin(&self) -> StoreResult<Box<dyn AuthTx>> {
        let guard = self.tables.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            snapshot: Some(snapshot),
        }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    snapshot: Option<Tables>,
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

#[async_trait]
impl AuthTx for MemoryTx {
    async fn create_user(&mut self, user: NewUser) -> StoreResult<User> {
        if self.guard.users.iter().any(|u| u.email == user.email) {
            return Err(StoreError::DuplicateEmail);
        }
        let now = OffsetDateTime::now_utc();
        let created = User {
            id: Uuid::new_v4(),
            name: user.name,
            email: user.email,
            password_hash: user.password_hash,
            role: user.role,
            email_verified_at: None,
            created_at: now,
            updated_at: now,
        };
        self.guard.users.push(created.clone());
        Ok(created)
    }

    async fn lock_user(&mut self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.guard.users.iter().find(|u| u.id == id).cloned())
    }

    async fn lock_token(&mut self, token: &str) -> StoreResult<Option<VerificationToken>> {
        Ok(self.guard.tokens.iter().find(|v| v.token == token).cloned())
    }

    async fn insert_token(&mut self, token: &VerificationToken) -> StoreResult<()> {
        self.guard.tokens.push(token.clone());
        Ok(())
    }

    async fn delete_token(&mut self, id: Uuid) -> StoreResult<()> {
        self.guard.tokens.retain(|v| v.id != id);
        Ok(())
    }

    async fn delete_tokens_for_user(&mut self, user_id: Uuid) -> StoreResult<u64> {
        let before = self.guard.tokens.len();
        self.guard.tokens.retain(|v| v.user_id != user_id);
        Ok((before - self.guard.tokens.len()) as u64)
    }

    async fn mark_token_used(&mut self, id: Uuid) -> StoreResult<bool> {
        match self.guard.tokens.iter_mut().find(|v| v.id == id && !v.is_used) {
            Some(v) => {
                v.is_used = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_user_verified(
        &mut self,
        user_id: Uuid,
        at: OffsetDateTime,
    ) -> StoreResult<bool> {
        match self
            .guard
            .users
            .iter_mut()
            .find(|u| u.id == user_id && u.email_verified_at.is_none())
        {
            Some(u) => {
                u.email_verified_at = Some(at);
                u.updated_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut this = self;
        this.snapshot = None;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        // Drop restores the snapshot.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::repo_types::Role;

    fn new_user(email: &str) -> NewUser {
        NewUser {
            name: "Jane Doe".into(),
            email: email.into(),
            password_hash: "hash".into(),
            role: Role::Applicant,
        }
    }

    #[tokio::test]
    async fn uncommitted_transaction_is_discarded() {
        let store = MemoryAuthStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.create_user(new_user("a@example.com")).await.unwrap();
        }
        assert_eq!(store.user_count().await, 0);

        let mut tx = store.begin().await.unwrap();
        tx.create_user(new_user("a@example.com")).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.user_count().await, 1);
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let store = MemoryAuthStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.create_user(new_user("a@example.com")).await.unwrap();
        let err = tx.create_user(new_user("a@example.com")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEmail));
    }
}
