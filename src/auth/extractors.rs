use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use tracing::warn;

use crate::auth::session::{SessionClaims, SessionStrategy as _};
use crate::state::AppState;

/// Resolves the Bearer session handle into claims, through whichever
/// session strategy the deployment runs.
pub struct CurrentUser(pub SessionClaims);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = (StatusCode, String);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or((
                StatusCode::UNAUTHORIZED,
                "Missing Authorization header".to_string(),
            ))?;

        let handle = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
            .ok_or((
                StatusCode::UNAUTHORIZED,
                "Invalid Authorization header".to_string(),
            ))?;

        match state.sessions.resolve(handle).await {
            Ok(Some(claims)) => Ok(CurrentUser(claims)),
            Ok(None) => {
                warn!("invalid or expired session handle");
                Err((
                    StatusCode::UNAUTHORIZED,
                    "Invalid or expired session".to_string(),
                ))
            }
            Err(e) => {
                tracing::error!(error = %e, "session resolution failed");
                Err((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal server error occurred.".to_string(),
                ))
            }
        }
    }
}
