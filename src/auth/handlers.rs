use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::instrument;

use crate::auth::dto::{
    ForgotPasswordRequest, LoginRequest, MessageResponse, ProviderAssertion, PublicUser,
    RegisterRequest, ResetPasswordRequest, SessionResponse, ValidateTokenRequest,
};
use crate::auth::extractors::CurrentUser;
use crate::auth::repo::UserStore as _;
use crate::auth::services;
use crate::error::AuthError;
use crate::state::AppState;

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/oauth/callback", post(oauth_callback))
        .route("/auth/forgot-password", post(forgot_password))
        .route("/auth/validate-reset-token", post(validate_reset_token))
        .route("/auth/reset-password", post(reset_password))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/me", get(get_me))
}

#[instrument(skip(state, payload))]
async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<PublicUser>), AuthError> {
    let user = services::register(&state, payload).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[instrument(skip(state, payload))]
async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<SessionResponse>, AuthError> {
    let session = services::login(&state, payload).await?;
    Ok(Json(session))
}

#[instrument(skip(state, payload))]
async fn oauth_callback(
    State(state): State<AppState>,
    Json(payload): Json<ProviderAssertion>,
) -> Result<Json<SessionResponse>, AuthError> {
    let session = services::oauth_sign_in(&state, payload).await?;
    Ok(Json(session))
}

#[instrument(skip(state, payload))]
async fn forgot_password(
    State(state): State<AppState>,
    Json(payload): Json<ForgotPasswordRequest>,
) -> Result<Json<MessageResponse>, AuthError> {
    services::request_password_reset(&state, &payload.email).await?;
    Ok(Json(MessageResponse {
        message: services::RESET_REQUEST_MESSAGE.into(),
    }))
}

#[instrument(skip(state, payload))]
async fn validate_reset_token(
    State(state): State<AppState>,
    Json(payload): Json<ValidateTokenRequest>,
) -> Result<Json<MessageResponse>, AuthError> {
    services::validate_reset_token(&state, &payload.token).await?;
    Ok(Json(MessageResponse {
        message: "Token is valid".into(),
    }))
}

#[instrument(skip(state, payload))]
async fn reset_password(
    State(state): State<AppState>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Json<MessageResponse>, AuthError> {
    services::reset_password(&state, &payload.token, &payload.password).await?;
    Ok(Json(MessageResponse {
        message: "Password reset successful".into(),
    }))
}

/// Example consumer of the uniform session-resolution contract; every
/// protected endpoint outside the identity core works the same way.
#[instrument(skip(state))]
async fn get_me(
    State(state): State<AppState>,
    CurrentUser(claims): CurrentUser,
) -> Result<Json<PublicUser>, AuthError> {
    let user = state
        .store
        .find_by_id(claims.user_id)
        .await?
        .ok_or(AuthError::InvalidCredentials)?;
    Ok(Json(PublicUser::from(&user)))
}
