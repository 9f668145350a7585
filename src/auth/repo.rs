use anyhow::Context;
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::{NewUser, User, VerificationToken};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("email already registered")]
    DuplicateEmail,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Reads that need no transaction, plus the entry point for transactional work.
#[async_trait]
pub trait AuthStore: Send + Sync {
    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn find_user_by_id(&self, id: Uuid) -> StoreResult<Option<User>>;
    async fn find_token(&self, token: &str) -> StoreResult<Option<VerificationToken>>;
    async fn begin(&self) -> StoreResult<Box<dyn AuthTx>>;
}

/// A unit of work. Dropping it without `commit` discards every write made through it.
#[async_trait]
pub trait AuthTx: Send {
    async fn create_user(&mut self, user: NewUser) -> StoreResult<User>;
    /// Loads a user and holds a row lock on it until the transaction ends.
    /// Take this lock before locking any of the user's tokens.
    async fn lock_user(&mut self, id: Uuid) -> StoreResult<Option<User>>;
    /// Loads a token by exact match and holds a row lock on it until the transaction ends.
    async fn lock_token(&mut self, token: &str) -> StoreResult<Option<VerificationToken>>;
    async fn insert_token(&mut self, token: &VerificationToken) -> StoreResult<()>;
    async fn delete_token(&mut self, id: Uuid) -> StoreResult<()>;
    async fn delete_tokens_for_user(&mut self, user_id: Uuid) -> StoreResult<u64>;
    /// Flips `is_used` to true. Returns false when the token was already used or is gone.
    async fn mark_token_used(&mut self, id: Uuid) -> StoreResult<bool>;
    /// Sets `email_verified_at` if it is still null. Returns false otherwise.
    async fn mark_user_verified(&mut self, user_id: Uuid, at: OffsetDateTime)
        -> StoreResult<bool>;
    async fn commit(self: Box<Self>) -> StoreResult<()>;
    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

const USER_COLUMNS: &str =
    "id, name, email, password_hash, role, email_verified_at, created_at, updated_at";
const TOKEN_COLUMNS: &str = "id, user_id, token, expires_at, is_used, created_at";

#[derive(Clone)]
pub struct PgAuthStore {
    db: PgPool,
}

impl PgAuthStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuthStore for PgAuthStore {
    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.db)
        .await
        .context("find user by email")?;
        Ok(user)
    }

    async fn find_user_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .context("find user by id")?;
        Ok(user)
    }

    async fn find_token(&self, token: &str) -> StoreResult<Option<VerificationToken>> {
        let row = sqlx::query_as::<_, VerificationToken>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM email_verifications WHERE token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.db)
        .await
        .context("find verification token")?;
        Ok(row)
    }

    async fn begin(&self) -> StoreResult<Box<dyn AuthTx>> {
        let tx = self.db.begin().await.context("begin tx")?;
        Ok(Box::new(PgAuthTx { tx }))
    }
}

pub struct PgAuthTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl AuthTx for PgAuthTx {
    async fn create_user(&mut self, user: NewUser) -> StoreResult<User> {
        let created = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (name, email, password_hash, role)
            VALUES ($1, $2, $3, $4)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role)
        .fetch_one(&mut *self.tx)
        .await;

        match created {
            Ok(u) => Ok(u),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::DuplicateEmail)
            }
            Err(e) => Err(anyhow::Error::new(e).context("insert user").into()),
        }
    }

    async fn lock_user(&mut self, id: Uuid) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .context("lock user")?;
        Ok(user)
    }

    async fn lock_token(&mut self, token: &str) -> StoreResult<Option<VerificationToken>> {
        let row = sqlx::query_as::<_, VerificationToken>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM email_verifications WHERE token = $1 FOR UPDATE"
        ))
        .bind(token)
        .fetch_optional(&mut *self.tx)
        .await
        .context("lock verification token")?;
        Ok(row)
    }

    async fn insert_token(&mut self, token: &VerificationToken) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO email_verifications (id, user_id, token, expires_at, is_used, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(token.id)
        .bind(token.user_id)
        .bind(&token.token)
        .bind(token.expires_at)
        .bind(token.is_used)
        .bind(token.created_at)
        .execute(&mut *self.tx)
        .await
        .context("insert verification token")?;
        Ok(())
    }

    async fn delete_token(&mut self, id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM email_verifications WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .context("delete verification token")?;
        Ok(())
    }

    async fn delete_tokens_for_user(&mut self, user_id: Uuid) -> StoreResult<u64> {
        let res = sqlx::query("DELETE FROM email_verifications WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *self.tx)
            .await
            .context("delete verification tokens by user")?;
        Ok(res.rows_affected())
    }

    async fn mark_token_used(&mut self, id: Uuid) -> StoreResult<bool> {
        let res = sqlx::query(
            "UPDATE email_verifications SET is_used = TRUE WHERE id = $1 AND is_used = FALSE",
        )
        .bind(id)
        .execute(&mut *self.tx)
        .await
        .context("mark verification token used")?;
        Ok(res.rows_affected() == 1)
    }

    async fn mark_user_verified(
        &mut self,
        user_id: Uuid,
        at: OffsetDateTime,
    ) -> StoreResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE users
               SET email_verified_at = $2, updated_at = $2
             WHERE id = $1 AND email_verified_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(at)
        .execute(&mut *self.tx)
        .await
        .context("mark user verified")?;
        Ok(res.rows_affected() == 1)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await.context("commit tx")?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await.context("rollback tx")?;
        Ok(())
    }
}
