use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use tracing::error;

/// Error taxonomy of the identity core.
///
/// Enumeration-sensitive operations (login, reset request) collapse their
/// internal causes into a single uniform kind before reaching this type;
/// everything else maps one cause to one kind.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("{0}")]
    Validation(String),

    #[error("{}", .0.join(" "))]
    WeakPassword(Vec<String>),

    #[error("User with this email already exists.")]
    EmailInUse,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid reset token")]
    InvalidToken,

    #[error("Reset token has expired")]
    ExpiredToken,

    #[error("{0}")]
    Provider(String),

    #[error("Failed to send reset email. Please try again later.")]
    EmailDelivery(#[source] anyhow::Error),

    #[error("An internal server error occurred.")]
    Dependency(#[from] anyhow::Error),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Validation(_)
            | AuthError::WeakPassword(_)
            | AuthError::InvalidToken
            | AuthError::ExpiredToken
            | AuthError::Provider(_) => StatusCode::BAD_REQUEST,
            AuthError::EmailInUse => StatusCode::CONFLICT,
            AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AuthError::EmailDelivery(_) | AuthError::Dependency(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        // Server-side faults are logged with their cause but reach the
        // client as a generic message only.
        match &self {
            AuthError::Dependency(cause) => error!(error = %cause, "dependency failure"),
            AuthError::EmailDelivery(cause) => error!(error = %cause, "reset email send failed"),
            _ => {}
        }
        // Weak-password failures keep their per-rule detail so clients can
        // render field-level errors.
        let body = match &self {
            AuthError::WeakPassword(violations) => serde_json::json!({
                "message": self.to_string(),
                "errors": violations,
            }),
            _ => serde_json::json!({ "message": self.to_string() }),
        };
        (self.status(), Json(body)).into_response()
    }
}
