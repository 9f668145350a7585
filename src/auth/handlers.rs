use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::{instrument, warn};

use crate::{
    auth::{
        dto::{EmailRequest, LoginRequest, LoginResponse, PublicUser, RegisterRequest, TokenParams},
        jwt::AuthUser,
    },
    response::ApiResponse,
    state::AppState,
};

type ApiResult = Result<ApiResponse, ApiResponse>;

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/verify-email", get(verify_email_get).post(verify_email_post))
        .route("/auth/resend-verification", post(resend_verification))
        .route("/auth/check-verification", post(check_verification))
        .route("/auth/login", post(login))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/auth/me", get(get_me))
}

/// Unwraps a JSON body, answering malformed input with the standard envelope.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiResponse> {
    payload.map(|Json(v)| v).map_err(|e| {
        warn!(error = %e, "malformed request body");
        ApiResponse::error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Invalid request body.",
            vec![e.body_text()],
        )
    })
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let user = state
        .auth
        .register(req)
        .await
        .map_err(|e| e.into_api_response("Registration failed. Please try again."))?;
    Ok(ApiResponse::ok_with(
        "Registration successful! Please check your email to verify your account.",
        &PublicUser::from(&user),
    ))
}

#[instrument(skip(state, params))]
pub async fn verify_email_get(
    State(state): State<AppState>,
    Query(params): Query<TokenParams>,
) -> ApiResult {
    verify(&state, params.token).await
}

/// Accepts the token in the JSON body or, failing that, in the query string.
#[instrument(skip(state, query, payload))]
pub async fn verify_email_post(
    State(state): State<AppState>,
    Query(query): Query<TokenParams>,
    payload: Result<Json<TokenParams>, JsonRejection>,
) -> ApiResult {
    let from_body = payload.ok().and_then(|Json(p)| p.token);
    verify(&state, from_body.or(query.token)).await
}

async fn verify(state: &AppState, token: Option<String>) -> ApiResult {
    let outcome = state
        .auth
        .verify_email(token.as_deref())
        .await
        .map_err(|e| e.into_api_response("Email verification failed. Please try again."))?;
    Ok(outcome.into_api_response())
}

#[instrument(skip(state, payload))]
pub async fn resend_verification(
    State(state): State<AppState>,
    payload: Result<Json<EmailRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    state
        .auth
        .resend_verification(req)
        .await
        .map_err(|e| e.into_api_response("Failed to send verification email. Please try again."))?;
    Ok(ApiResponse::ok("Verification email sent successfully!"))
}

#[instrument(skip(state, payload))]
pub async fn check_verification(
    State(state): State<AppState>,
    payload: Result<Json<EmailRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let status = state
        .auth
        .check_verification(req)
        .await
        .map_err(|e| e.into_api_response("Could not check verification status. Please try again."))?;
    Ok(ApiResponse::ok_with(
        "Verification status retrieved successfully.",
        &status,
    ))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let outcome = state
        .auth
        .login(req)
        .await
        .map_err(|e| e.into_api_response("Login failed. Please try again."))?;
    Ok(ApiResponse::ok_with(
        "Login successful.",
        &LoginResponse {
            user: PublicUser::from(&outcome.user),
            token: outcome.bearer.token,
            token_type: "bearer".into(),
            expires_in: outcome.bearer.expires_in.as_secs(),
        },
    ))
}

#[instrument(skip(state))]
pub async fn get_me(State(state): State<AppState>, AuthUser(user_id): AuthUser) -> ApiResult {
    let user = state
        .auth
        .current_user(user_id)
        .await
        .map_err(|e| e.into_api_response("Could not load user. Please try again."))?
        .ok_or_else(|| {
            warn!(%user_id, "token subject no longer exists");
            ApiResponse::error(
                StatusCode::UNAUTHORIZED,
                "Unauthenticated.",
                vec!["User not found.".into()],
            )
        })?;
    Ok(ApiResponse::ok_with(
        "User retrieved successfully.",
        &PublicUser::from(&user),
    ))
}
