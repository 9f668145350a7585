use axum::http::StatusCode;
use thiserror::Error;
use tracing::error;

use crate::auth::repo::StoreError;
use crate::response::ApiResponse;

pub const EMAIL_TAKEN: &str = "The email has already been taken.";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("email not verified")]
    EmailNotVerified,
    #[error("email already verified")]
    AlreadyVerified,
    #[error("verification email could not be sent")]
    MailDelivery(#[source] anyhow::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateEmail => AuthError::Validation(vec![EMAIL_TAKEN.into()]),
            StoreError::Backend(e) => AuthError::Internal(e),
        }
    }
}

impl AuthError {
    /// Builds the client response. `failure_message` is shown for internal errors,
    /// whose details are logged and never returned.
    pub fn into_api_response(self, failure_message: &str) -> ApiResponse {
        match self {
            AuthError::Validation(errors) => {
                ApiResponse::error(StatusCode::UNPROCESSABLE_ENTITY, "Validation failed.", errors)
            }
            AuthError::InvalidCredentials => ApiResponse::error(
                StatusCode::UNAUTHORIZED,
                "Invalid credentials.",
                vec!["Email or password is incorrect.".into()],
            ),
            AuthError::EmailNotVerified => ApiResponse::error(
                StatusCode::UNAUTHORIZED,
                "Email not verified.",
                vec!["Please verify your email address before logging in.".into()],
            ),
            AuthError::AlreadyVerified => ApiResponse::error(
                StatusCode::CONFLICT,
                "Email is already verified.",
                vec!["Email verification is not required.".into()],
            ),
            AuthError::MailDelivery(e) => {
                error!(error = ?e, "mail delivery failed");
                ApiResponse::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to send verification email. Please try again.",
                    vec!["An error occurred while sending the verification email.".into()],
                )
            }
            AuthError::Internal(e) => {
                error!(error = ?e, "internal failure");
                ApiResponse::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    failure_message,
                    vec!["An error occurred while processing your request.".into()],
                )
            }
        }
    }
}
