use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::auth::clock::Clock;
use crate::auth::dto::{EmailRequest, LoginRequest, RegisterRequest, VerificationStatus};
use crate::auth::error::{AuthError, EMAIL_TAKEN};
use crate::auth::issuer::{verification_link, TokenIssuer};
use crate::auth::jwt::{BearerToken, TokenSigner};
use crate::auth::password::PasswordHasher;
use crate::auth::repo::{AuthStore, AuthTx};
use crate::auth::repo_types::{NewUser, User};
use crate::auth::validation::{validate_email_request, validate_login, validate_registration};
use crate::auth::verification::{VerificationEngine, VerificationOutcome};
use crate::mail::{verification_email, Mailer};

const UNKNOWN_EMAIL: &str = "The selected email is invalid.";

/// Registration, login and the verification endpoints, over injected collaborators.
#[derive(Clone)]
pub struct AuthService {
    store: Arc<dyn AuthStore>,
    hasher: Arc<dyn PasswordHasher>,
    signer: Arc<dyn TokenSigner>,
    mailer: Arc<dyn Mailer>,
    issuer: TokenIssuer,
    engine: VerificationEngine,
    app_url: String,
    /// Checked against on unknown-email logins so they cost one argon2 verify too.
    dummy_hash: Option<String>,
}

pub struct AuthDeps {
    pub store: Arc<dyn AuthStore>,
    pub hasher: Arc<dyn PasswordHasher>,
    pub signer: Arc<dyn TokenSigner>,
    pub mailer: Arc<dyn Mailer>,
    pub clock: Arc<dyn Clock>,
    pub app_url: String,
}

pub struct LoginOutcome {
    pub user: User,
    pub bearer: BearerToken,
}

impl AuthService {
    pub fn new(deps: AuthDeps) -> Self {
        let issuer = TokenIssuer::new(deps.clock.clone());
        let dummy_hash = match deps.hasher.hash("no-such-account") {
            Ok(hash) => Some(hash),
            Err(e) => {
                warn!(error = %e, "dummy password hash unavailable");
                None
            }
        };
        let engine = VerificationEngine::new(
            deps.store.clone(),
            issuer.clone(),
            deps.mailer.clone(),
            deps.clock,
            deps.app_url.clone(),
        );
        Self {
            store: deps.store,
            hasher: deps.hasher,
            signer: deps.signer,
            mailer: deps.mailer,
            issuer,
            engine,
            app_url: deps.app_url,
            dummy_hash,
        }
    }

    /// Creates the user, issues a token and mails it as one unit. If the email
    /// cannot be sent nothing is kept.
    #[instrument(skip_all)]
    pub async fn register(&self, req: RegisterRequest) -> Result<User, AuthError> {
        let input = validate_registration(req)?;

        if self.store.find_user_by_email(&input.email).await?.is_some() {
            warn!(email = %input.email, "email already registered");
            return Err(AuthError::Validation(vec![EMAIL_TAKEN.into()]));
        }

        let password_hash = self.hasher.hash(&input.password)?;

        let mut tx = self.store.begin().await?;
        let user = tx
            .create_user(NewUser {
                name: input.name,
                email: input.email,
                password_hash,
                role: input.role,
            })
            .await?;
        self.issue_and_send(tx, &user).await?;

        info!(user_id = %user.id, email = %user.email, "user registered");
        Ok(user)
    }

    /// Unknown email and wrong password produce the same error.
    #[instrument(skip_all)]
    pub async fn login(&self, req: LoginRequest) -> Result<LoginOutcome, AuthError> {
        let (email, password) = validate_login(req)?;

        let Some(user) = self.store.find_user_by_email(&email).await? else {
            if let Some(hash) = &self.dummy_hash {
                let _ = self.hasher.verify(&password, hash);
            }
            warn!(%email, "login unknown email");
            return Err(AuthError::InvalidCredentials);
        };

        if !self.hasher.verify(&password, &user.password_hash)? {
            warn!(user_id = %user.id, "login invalid password");
            return Err(AuthError::InvalidCredentials);
        }

        if !user.is_email_verified() {
            warn!(user_id = %user.id, "login before email verification");
            return Err(AuthError::EmailNotVerified);
        }

        let bearer = self.signer.sign(user.id)?;
        info!(user_id = %user.id, "user logged in");
        Ok(LoginOutcome { user, bearer })
    }

    pub async fn verify_email(&self, token: Option<&str>) -> Result<VerificationOutcome, AuthError> {
        self.engine.verify(token).await
    }

    /// Replaces the user's token and mails the new one. Unlike login, this
    /// reveals whether the email is registered.
    #[instrument(skip_all)]
    pub async fn resend_verification(&self, req: EmailRequest) -> Result<(), AuthError> {
        let user = self.registered_user(req).await?;
        if user.is_email_verified() {
            return Err(AuthError::AlreadyVerified);
        }

        let mut tx = self.store.begin().await?;
        // A verification may have committed since the read above.
        let Some(user) = tx.lock_user(user.id).await? else {
            return Err(AuthError::Validation(vec![UNKNOWN_EMAIL.into()]));
        };
        if user.is_email_verified() {
            tx.rollback().await?;
            return Err(AuthError::AlreadyVerified);
        }
        self.issue_and_send(tx, &user).await?;
        info!(user_id = %user.id, "verification email resent");
        Ok(())
    }

    pub async fn check_verification(
        &self,
        req: EmailRequest,
    ) -> Result<VerificationStatus, AuthError> {
        let user = self.registered_user(req).await?;
        Ok(VerificationStatus {
            is_verified: user.is_email_verified(),
            email: user.email,
        })
    }

    /// User behind a bearer token; `None` if the account no longer exists.
    pub async fn current_user(&self, user_id: Uuid) -> Result<Option<User>, AuthError> {
        Ok(self.store.find_user_by_id(user_id).await?)
    }

    async fn registered_user(&self, req: EmailRequest) -> Result<User, AuthError> {
        let email = validate_email_request(req)?;
        self.store
            .find_user_by_email(&email)
            .await?
            .ok_or_else(|| AuthError::Validation(vec![UNKNOWN_EMAIL.into()]))
    }

    /// Issues a token inside `tx`, sends it, and commits only if the send succeeded.
    async fn issue_and_send(&self, mut tx: Box<dyn AuthTx>, user: &User) -> Result<(), AuthError> {
        let token = self.issuer.issue(tx.as_mut(), user.id).await?;
        let link = verification_link(&self.app_url, &token.token);
        if let Err(e) = self
            .mailer
            .send(verification_email(&user.email, &user.name, &link))
            .await
        {
            tx.rollback().await?;
            return Err(AuthError::MailDelivery(e));
        }
        tx.commit().await?;
        Ok(())
    }
}
