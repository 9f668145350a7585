use std::sync::Arc;

use axum::http::StatusCode;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};

use crate::auth::clock::Clock;
use crate::auth::error::AuthError;
use crate::auth::issuer::{verification_link, TokenIssuer};
use crate::auth::repo::AuthStore;
use crate::mail::{verification_email, Mailer};
use crate::response::ApiResponse;

/// Result of presenting a verification token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    MissingToken,
    TokenNotFound,
    /// The token points at a user that no longer exists.
    UserNotFound,
    AlreadyVerified,
    /// Used token whose owner is still unverified.
    AlreadyUsed,
    /// The token had expired; a replacement was mailed.
    Reissued { expires_at: OffsetDateTime },
    Verified,
}

impl VerificationOutcome {
    pub fn into_api_response(self) -> ApiResponse {
        use VerificationOutcome::*;
        match self {
            MissingToken => ApiResponse::error(
                StatusCode::UNPROCESSABLE_ENTITY,
                "Token is required.",
                vec!["Please provide a verification token.".into()],
            ),
            TokenNotFound => ApiResponse::error(
                StatusCode::UNPROCESSABLE_ENTITY,
                "Invalid verification token.",
                vec!["The verification token is invalid or malformed.".into()],
            ),
            UserNotFound => ApiResponse::error(
                StatusCode::NOT_FOUND,
                "User not found.",
                vec!["The user associated with this token was not found.".into()],
            ),
            AlreadyVerified => {
                ApiResponse::ok("Email is already verified. No further action is required.")
            }
            AlreadyUsed => ApiResponse::error(
                StatusCode::UNPROCESSABLE_ENTITY,
                "Token already used.",
                vec!["This verification token has already been used.".into()],
            ),
            // Not a failure of the request, but the email is still unverified.
            Reissued { .. } => ApiResponse::error(
                StatusCode::OK,
                "Verification token has expired. A new verification email has been sent to your email address.",
                vec!["Please check your email for the new verification link.".into()],
            ),
            Verified => {
                ApiResponse::ok("Email verified successfully! You can now log in to your account.")
            }
        }
    }
}

/// Applies the verification policy to a presented token.
#[derive(Clone)]
pub struct VerificationEngine {
    store: Arc<dyn AuthStore>,
    issuer: TokenIssuer,
    mailer: Arc<dyn Mailer>,
    clock: Arc<dyn Clock>,
    app_url: String,
}

impl VerificationEngine {
    pub fn new(
        store: Arc<dyn AuthStore>,
        issuer: TokenIssuer,
        mailer: Arc<dyn Mailer>,
        clock: Arc<dyn Clock>,
        app_url: String,
    ) -> Self {
        Self {
            store,
            issuer,
            mailer,
            clock,
            app_url,
        }
    }

    /// Owner and token rows stay locked for the whole call, so racing calls with
    /// the same token run one after the other and the later one sees the result.
    /// Early returns drop the transaction, which rolls it back.
    #[instrument(skip_all)]
    pub async fn verify(&self, token: Option<&str>) -> Result<VerificationOutcome, AuthError> {
        let token = match token.map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => return Ok(VerificationOutcome::MissingToken),
        };

        let Some(owner) = self.store.find_token(token).await?.map(|t| t.user_id) else {
            warn!("unknown verification token");
            return Ok(VerificationOutcome::TokenNotFound);
        };

        let mut tx = self.store.begin().await?;

        // User row first, then token: the order resend and re-issue lock in.
        let Some(user) = tx.lock_user(owner).await? else {
            warn!(user_id = %owner, "verification token without owner");
            return Ok(VerificationOutcome::UserNotFound);
        };

        let Some(record) = tx.lock_token(token).await? else {
            warn!(user_id = %user.id, "verification token replaced before it was locked");
            return Ok(VerificationOutcome::TokenNotFound);
        };

        if user.is_email_verified() {
            return Ok(VerificationOutcome::AlreadyVerified);
        }

        if record.is_used {
            warn!(user_id = %user.id, "used token presented for unverified user");
            return Ok(VerificationOutcome::AlreadyUsed);
        }

        let now = self.clock.now();
        if record.is_expired_at(now) {
            tx.delete_token(record.id).await?;
            let fresh = self.issuer.issue(tx.as_mut(), user.id).await?;
            let link = verification_link(&self.app_url, &fresh.token);
            if let Err(e) = self
                .mailer
                .send(verification_email(&user.email, &user.name, &link))
                .await
            {
                tx.rollback().await?;
                return Err(AuthError::MailDelivery(e));
            }
            tx.commit().await?;
            info!(user_id = %user.id, "expired verification token replaced");
            return Ok(VerificationOutcome::Reissued {
                expires_at: fresh.expires_at,
            });
        }

        if !tx.mark_user_verified(user.id, now).await? {
            tx.rollback().await?;
            return Ok(VerificationOutcome::AlreadyVerified);
        }
        if !tx.mark_token_used(record.id).await? {
            tx.rollback().await?;
            return Ok(VerificationOutcome::AlreadyUsed);
        }
        tx.commit().await?;

        info!(user_id = %user.id, "email verified");
        Ok(VerificationOutcome::Verified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;
    use crate::auth::memory::MemoryAuthStore;
    use crate::auth::repo_types::{Role, User, VerificationToken};
    use crate::mail::RecordingMailer;
    use time::{macros::datetime, Duration};
    use uuid::Uuid;

    const START: OffsetDateTime = datetime!(2025-08-10 12:00 UTC);

    struct Fixture {
        store: MemoryAuthStore,
        mailer: Arc<RecordingMailer>,
        clock: Arc<ManualClock>,
        engine: VerificationEngine,
    }

    fn fixture() -> Fixture {
        let store = MemoryAuthStore::new();
        let mailer = Arc::new(RecordingMailer::default());
        let clock = Arc::new(ManualClock::new(START));
        let engine = VerificationEngine::new(
            Arc::new(store.clone()),
            TokenIssuer::new(clock.clone()),
            mailer.clone(),
            clock.clone(),
            "http://localhost:8080".into(),
        );
        Fixture {
            store,
            mailer,
            clock,
            engine,
        }
    }

    fn user(verified_at: Option<OffsetDateTime>) -> User {
        User {
            id: Uuid::new_v4(),
            name: "Jane Doe".into(),
            email: "jane@example.com".into(),
            password_hash: "hash".into(),
            role: Role::Applicant,
            email_verified_at: verified_at,
            created_at: START,
            updated_at: START,
        }
    }

    fn token_for(user: &User, is_used: bool) -> VerificationToken {
        VerificationToken {
            id: Uuid::new_v4(),
            user_id: user.id,
            token: crate::auth::issuer::generate_token(),
            expires_at: START + Duration::hours(1),
            is_used,
            created_at: START,
        }
    }

    #[tokio::test]
    async fn missing_or_blank_token() {
        let f = fixture();
        assert_eq!(f.engine.verify(None).await.unwrap(), VerificationOutcome::MissingToken);
        assert_eq!(f.engine.verify(Some("  ")).await.unwrap(), VerificationOutcome::MissingToken);
    }

    #[tokio::test]
    async fn unknown_token() {
        let f = fixture();
        assert_eq!(
            f.engine.verify(Some("nope")).await.unwrap(),
            VerificationOutcome::TokenNotFound
        );
    }

    #[tokio::test]
    async fn orphaned_token() {
        let f = fixture();
        let ghost = user(None);
        let t = token_for(&ghost, false);
        f.store.insert_token(t.clone()).await;
        assert_eq!(
            f.engine.verify(Some(&t.token)).await.unwrap(),
            VerificationOutcome::UserNotFound
        );
    }

    #[tokio::test]
    async fn verifying_twice_is_idempotent() {
        let f = fixture();
        let u = user(None);
        let t = token_for(&u, false);
        f.store.insert_user(u.clone()).await;
        f.store.insert_token(t.clone()).await;

        assert_eq!(f.engine.verify(Some(&t.token)).await.unwrap(), VerificationOutcome::Verified);
        let first = f.store.find_user_by_id(u.id).await.unwrap().unwrap();
        assert_eq!(first.email_verified_at, Some(START));
        assert!(f.store.find_token(&t.token).await.unwrap().unwrap().is_used);

        f.clock.advance(Duration::minutes(5));
        assert_eq!(
            f.engine.verify(Some(&t.token)).await.unwrap(),
            VerificationOutcome::AlreadyVerified
        );
        let second = f.store.find_user_by_id(u.id).await.unwrap().unwrap();
        assert_eq!(second.email_verified_at, first.email_verified_at);
    }

    #[tokio::test]
    async fn replayed_used_token_changes_nothing() {
        let f = fixture();
        let u = user(None);
        let t = token_for(&u, true);
        f.store.insert_user(u.clone()).await;
        f.store.insert_token(t.clone()).await;

        assert_eq!(f.engine.verify(Some(&t.token)).await.unwrap(), VerificationOutcome::AlreadyUsed);
        let after = f.store.find_user_by_id(u.id).await.unwrap().unwrap();
        assert!(after.email_verified_at.is_none());
        assert_eq!(f.store.find_token(&t.token).await.unwrap(), Some(t));
    }

    #[tokio::test]
    async fn verified_user_wins_over_used_flag() {
        let f = fixture();
        let u = user(Some(START));
        let t = token_for(&u, true);
        f.store.insert_user(u).await;
        f.store.insert_token(t.clone()).await;
        assert_eq!(
            f.engine.verify(Some(&t.token)).await.unwrap(),
            VerificationOutcome::AlreadyVerified
        );
    }

    #[tokio::test]
    async fn token_is_accepted_up_to_its_expiry_instant() {
        let f = fixture();
        let u = user(None);
        let t = token_for(&u, false);
        f.store.insert_user(u).await;
        f.store.insert_token(t.clone()).await;

        f.clock.advance(Duration::hours(1));
        assert_eq!(f.engine.verify(Some(&t.token)).await.unwrap(), VerificationOutcome::Verified);
    }

    #[tokio::test]
    async fn expired_token_is_replaced_and_mailed() {
        let f = fixture();
        let u = user(None);
        let t = token_for(&u, false);
        f.store.insert_user(u.clone()).await;
        f.store.insert_token(t.clone()).await;

        f.clock.advance(Duration::hours(1) + Duration::seconds(1));
        let outcome = f.engine.verify(Some(&t.token)).await.unwrap();
        let expected_expiry = f.clock.now() + Duration::hours(1);
        assert_eq!(outcome, VerificationOutcome::Reissued { expires_at: expected_expiry });

        assert!(f.store.find_token(&t.token).await.unwrap().is_none());
        let tokens = f.store.tokens_for_user(u.id).await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert!(!tokens[0].is_used);
        assert_eq!(tokens[0].expires_at, expected_expiry);

        let user_after = f.store.find_user_by_id(u.id).await.unwrap().unwrap();
        assert!(user_after.email_verified_at.is_none());

        assert_eq!(f.mailer.sent().len(), 1);
        assert_eq!(f.mailer.last_token(), Some(tokens[0].token.clone()));
    }

    #[tokio::test]
    async fn failed_reissue_mail_keeps_expired_token() {
        let f = fixture();
        let u = user(None);
        let t = token_for(&u, false);
        f.store.insert_user(u.clone()).await;
        f.store.insert_token(t.clone()).await;
        f.mailer.set_failing(true);

        f.clock.advance(Duration::hours(2));
        let err = f.engine.verify(Some(&t.token)).await.unwrap_err();
        assert!(matches!(err, AuthError::MailDelivery(_)));

        assert_eq!(f.store.tokens_for_user(u.id).await.unwrap(), vec![t]);
    }

    #[tokio::test]
    async fn concurrent_verification_mutates_once() {
        let f = fixture();
        let u = user(None);
        let t = token_for(&u, false);
        f.store.insert_user(u.clone()).await;
        f.store.insert_token(t.clone()).await;

        let a = f.engine.clone();
        let b = f.engine.clone();
        let (ta, tb) = (t.token.clone(), t.token.clone());
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.verify(Some(&ta)).await.unwrap() }),
            tokio::spawn(async move { b.verify(Some(&tb)).await.unwrap() }),
        );
        let mut outcomes = vec![ra.unwrap(), rb.unwrap()];
        outcomes.sort_by_key(|o| matches!(o, VerificationOutcome::Verified));
        assert_eq!(
            outcomes,
            vec![VerificationOutcome::AlreadyVerified, VerificationOutcome::Verified]
        );
        assert_eq!(
            f.store.find_user_by_id(u.id).await.unwrap().unwrap().email_verified_at,
            Some(START)
        );
    }

    #[test]
    fn outcomes_map_to_statuses() {
        use VerificationOutcome::*;
        let status = |o: VerificationOutcome| o.into_api_response().status;
        assert_eq!(status(Verified), StatusCode::OK);
        assert_eq!(status(AlreadyVerified), StatusCode::OK);
        assert_eq!(status(Reissued { expires_at: START }), StatusCode::OK);
        assert_eq!(status(MissingToken), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status(TokenNotFound), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status(AlreadyUsed), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status(UserNotFound), StatusCode::NOT_FOUND);
        assert!(Verified.into_api_response().body.success);
        assert!(!Reissued { expires_at: START }.into_api_response().body.success);
    }
}
