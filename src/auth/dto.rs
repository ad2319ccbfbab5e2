use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::repo_types::{Role, User};

/// Request body for user registration.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: Option<String>,
}

/// Request body for credential login.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Verified identity assertion handed over by the OAuth layer after the
/// provider callback. The provider has already authenticated the subject.
#[derive(Debug, Deserialize)]
pub struct ProviderAssertion {
    pub provider: String,
    pub subject: String,
    pub email: String,
    pub name: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ValidateTokenRequest {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

/// Public part of the user returned to the client. Never carries the hash
/// or reset-token fields.
#[derive(Debug, Clone, Serialize)]
pub struct PublicUser {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub image: Option<String>,
    pub role: Role,
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            image: user.image.clone(),
            role: user.role,
        }
    }
}

/// Response returned after login or an OAuth callback.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_token: String,
    pub user: PublicUser,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}
