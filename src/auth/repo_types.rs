use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Role carried into every session. Single-field authorization only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "user_role", rename_all = "lowercase")]
pub enum Role {
    Member,
    Admin,
}

/// User record in the database.
///
/// `password_hash` is `None` for accounts created purely through an external
/// identity provider; such accounts always have at least one linked identity.
/// The reset token, when present, is unique and paired with its expiry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub name: Option<String>,
    pub image: Option<String>,
    pub role: Role,
    #[serde(skip_serializing)]
    pub password_reset_token: Option<String>,
    #[serde(skip_serializing)]
    pub password_reset_expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Association between a local user and an external provider subject.
/// Created on first successful provider callback, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LinkedIdentity {
    pub user_id: Uuid,
    pub provider: String,
    pub subject: String,
    pub created_at: OffsetDateTime,
}

/// Server-side session record used by the persisted strategy. The client
/// holds only `id`.
#[derive(Debug, Clone, FromRow)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: Uuid,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}
