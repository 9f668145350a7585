use std::sync::Arc;

use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::auth::clock::Clock;
use crate::auth::repo::{AuthTx, StoreResult};
use crate::auth::repo_types::VerificationToken;

pub const VERIFICATION_TOKEN_LEN: usize = 64;
pub const VERIFICATION_TOKEN_TTL: Duration = Duration::hours(1);

/// Mints email-verification tokens. A user has at most one token after `issue`.
#[derive(Clone)]
pub struct TokenIssuer {
    clock: Arc<dyn Clock>,
}

impl TokenIssuer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Deletes every token the user owns and stores a fresh one, inside `tx`.
    pub async fn issue(&self, tx: &mut dyn AuthTx, user_id: Uuid) -> StoreResult<VerificationToken> {
        let removed = tx.delete_tokens_for_user(user_id).await?;
        let now = self.clock.now();
        let token = VerificationToken {
            id: Uuid::new_v4(),
            user_id,
            token: generate_token(),
            expires_at: now + VERIFICATION_TOKEN_TTL,
            is_used: false,
            created_at: now,
        };
        tx.insert_token(&token).await?;
        debug!(%user_id, removed, expires_at = %token.expires_at, "verification token issued");
        Ok(token)
    }
}

pub fn generate_token() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(VERIFICATION_TOKEN_LEN)
        .map(char::from)
        .collect()
}

pub fn verification_link(app_url: &str, token: &str) -> String {
    format!(
        "{}/auth/verify-email?token={}",
        app_url.trim_end_matches('/'),
        token
    )
}
