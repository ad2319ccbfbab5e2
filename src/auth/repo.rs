use axum::async_trait;
use sqlx::PgPool;
use std::sync::Mutex;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::{LinkedIdentity, Role, User};
use crate::auth::tokens::{token_state, TokenState};

const USER_COLUMNS: &str = "id, email, password_hash, name, image, role, \
     password_reset_token, password_reset_expires_at, created_at";

/// Insert failure split out so the service can map a uniqueness violation to
/// `EmailInUse` instead of a generic fault.
#[derive(Debug, thiserror::Error)]
pub enum InsertUserError {
    #[error("email already registered")]
    DuplicateEmail,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Credential store adapter. The external store is the sole arbiter of
/// consistency: email and reset-token uniqueness live in its constraints,
/// and `clear_reset_token` is a single conditional update so concurrent
/// consumers race first-write-wins with no token-reuse window.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>>;
    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>>;
    async fn find_by_reset_token(&self, token: &str) -> anyhow::Result<Option<User>>;
    async fn find_by_identity(&self, provider: &str, subject: &str)
        -> anyhow::Result<Option<User>>;

    async fn insert_credential_user(
        &self,
        email: &str,
        password_hash: &str,
        name: Option<&str>,
    ) -> Result<User, InsertUserError>;

    async fn insert_provider_user(
        &self,
        email: &str,
        name: Option<&str>,
        image: Option<&str>,
    ) -> Result<User, InsertUserError>;

    /// Idempotent: linking an already-linked `(provider, subject)` is a
    /// no-op, so concurrent first callbacks for the same identity both
    /// succeed.
    async fn link_identity(
        &self,
        user_id: Uuid,
        provider: &str,
        subject: &str,
    ) -> anyhow::Result<()>;

    /// Overwrites any prior token/expiry pair; last write wins by design.
    async fn set_reset_token(
        &self,
        user_id: Uuid,
        token: &str,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()>;

    /// Validate-and-clear in one step: sets the new hash and nulls the token
    /// pair only where the token is still present and unexpired. Returns
    /// `false` when no row matched (consumed, superseded, or expired).
    async fn clear_reset_token(
        &self,
        token: &str,
        new_password_hash: &str,
    ) -> anyhow::Result<bool>;
}

pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn map_insert_error(e: sqlx::Error) -> InsertUserError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() {
            return InsertUserError::DuplicateEmail;
        }
    }
    InsertUserError::Other(e.into())
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_reset_token(&self, token: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE password_reset_token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_identity(
        &self,
        provider: &str,
        subject: &str,
    ) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT u.id, u.email, u.password_hash, u.name, u.image, u.role, \
                    u.password_reset_token, u.password_reset_expires_at, u.created_at \
             FROM users u \
             JOIN linked_identities li ON li.user_id = u.id \
             WHERE li.provider = $1 AND li.subject = $2",
        )
        .bind(provider)
        .bind(subject)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn insert_credential_user(
        &self,
        email: &str,
        password_hash: &str,
        name: Option<&str>,
    ) -> Result<User, InsertUserError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (email, password_hash, name) VALUES ($1, $2, $3) \
             RETURNING {USER_COLUMNS}"
        ))
        .bind(email)
        .bind(password_hash)
        .bind(name)
        .fetch_one(&self.db)
        .await
        .map_err(map_insert_error)?;
        Ok(user)
    }

    async fn insert_provider_user(
        &self,
        email: &str,
        name: Option<&str>,
        image: Option<&str>,
    ) -> Result<User, InsertUserError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (email, name, image) VALUES ($1, $2, $3) \
             RETURNING {USER_COLUMNS}"
        ))
        .bind(email)
        .bind(name)
        .bind(image)
        .fetch_one(&self.db)
        .await
        .map_err(map_insert_error)?;
        Ok(user)
    }

    async fn link_identity(
        &self,
        user_id: Uuid,
        provider: &str,
        subject: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO linked_identities (user_id, provider, subject) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (provider, subject) DO NOTHING",
        )
        .bind(user_id)
        .bind(provider)
        .bind(subject)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn set_reset_token(
        &self,
        user_id: Uuid,
        token: &str,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE users \
             SET password_reset_token = $2, password_reset_expires_at = $3 \
             WHERE id = $1",
        )
        .bind(user_id)
        .bind(token)
        .bind(expires_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn clear_reset_token(
        &self,
        token: &str,
        new_password_hash: &str,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE users \
             SET password_hash = $2, \
                 password_reset_token = NULL, \
                 password_reset_expires_at = NULL \
             WHERE password_reset_token = $1 \
               AND password_reset_expires_at > now()",
        )
        .bind(token)
        .bind(new_password_hash)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

/// In-memory store with the same semantics, for `AppState::fake()` and the
/// test suite. A single mutex stands in for the database's atomicity.
#[derive(Default)]
pub struct MemoryUserStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    users: Vec<User>,
    identities: Vec<LinkedIdentity>,
}

impl MemoryInner {
    fn insert_user(
        &mut self,
        email: &str,
        password_hash: Option<&str>,
        name: Option<&str>,
        image: Option<&str>,
    ) -> Result<User, InsertUserError> {
        if self.users.iter().any(|u| u.email == email) {
            return Err(InsertUserError::DuplicateEmail);
        }
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: password_hash.map(str::to_string),
            name: name.map(str::to_string),
            image: image.map(str::to_string),
            role: Role::Member,
            password_reset_token: None,
            password_reset_expires_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        self.users.push(user.clone());
        Ok(user)
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.users.iter().find(|u| u.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner.users.iter().find(|u| u.id == id).cloned())
    }

    async fn find_by_reset_token(&self, token: &str) -> anyhow::Result<Option<User>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        Ok(inner
            .users
            .iter()
            .find(|u| u.password_reset_token.as_deref() == Some(token))
            .cloned())
    }

    async fn find_by_identity(
        &self,
        provider: &str,
        subject: &str,
    ) -> anyhow::Result<Option<User>> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        let user_id = inner
            .identities
            .iter()
            .find(|i| i.provider == provider && i.subject == subject)
            .map(|i| i.user_id);
        Ok(user_id.and_then(|id| inner.users.iter().find(|u| u.id == id).cloned()))
    }

    async fn insert_credential_user(
        &self,
        email: &str,
        password_hash: &str,
        name: Option<&str>,
    ) -> Result<User, InsertUserError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.insert_user(email, Some(password_hash), name, None)
    }

    async fn insert_provider_user(
        &self,
        email: &str,
        name: Option<&str>,
        image: Option<&str>,
    ) -> Result<User, InsertUserError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.insert_user(email, None, name, image)
    }

    async fn link_identity(
        &self,
        user_id: Uuid,
        provider: &str,
        subject: &str,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if inner
            .identities
            .iter()
            .any(|i| i.provider == provider && i.subject == subject)
        {
            // Loser of a concurrent first sign-in; the link already exists.
            return Ok(());
        }
        inner.identities.push(LinkedIdentity {
            user_id,
            provider: provider.to_string(),
            subject: subject.to_string(),
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    async fn set_reset_token(
        &self,
        user_id: Uuid,
        token: &str,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if let Some(user) = inner.users.iter_mut().find(|u| u.id == user_id) {
            user.password_reset_token = Some(token.to_string());
            user.password_reset_expires_at = Some(expires_at);
        }
        Ok(())
    }

    async fn clear_reset_token(
        &self,
        token: &str,
        new_password_hash: &str,
    ) -> anyhow::Result<bool> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let Some(user) = inner
            .users
            .iter_mut()
            .find(|u| u.password_reset_token.as_deref() == Some(token))
        else {
            return Ok(false);
        };
        if token_state(user.password_reset_expires_at, now) != TokenState::Valid {
            return Ok(false);
        }
        user.password_hash = Some(new_password_hash.to_string());
        user.password_reset_token = None;
        user.password_reset_expires_at = None;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[tokio::test]
    async fn memory_store_enforces_email_uniqueness() {
        let store = MemoryUserStore::default();
        store
            .insert_credential_user("a@x.com", "hash", None)
            .await
            .expect("first insert");
        let err = store
            .insert_credential_user("a@x.com", "hash2", None)
            .await
            .unwrap_err();
        assert!(matches!(err, InsertUserError::DuplicateEmail));
    }

    #[tokio::test]
    async fn clear_reset_token_is_single_use() {
        let store = MemoryUserStore::default();
        let user = store
            .insert_credential_user("a@x.com", "hash", None)
            .await
            .expect("insert");
        let expiry = OffsetDateTime::now_utc() + Duration::minutes(15);
        store
            .set_reset_token(user.id, "tok", expiry)
            .await
            .expect("set token");

        assert!(store.clear_reset_token("tok", "newhash").await.unwrap());
        // Second consumer loses the race: token already cleared.
        assert!(!store.clear_reset_token("tok", "otherhash").await.unwrap());

        let user = store.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(user.password_hash.as_deref(), Some("newhash"));
        assert!(user.password_reset_token.is_none());
        assert!(user.password_reset_expires_at.is_none());
    }

    #[tokio::test]
    async fn clear_reset_token_refuses_expired_token() {
        let store = MemoryUserStore::default();
        let user = store
            .insert_credential_user("a@x.com", "hash", None)
            .await
            .expect("insert");
        let expiry = OffsetDateTime::now_utc() - Duration::seconds(1);
        store
            .set_reset_token(user.id, "tok", expiry)
            .await
            .expect("set token");

        assert!(!store.clear_reset_token("tok", "newhash").await.unwrap());
        let user = store.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(user.password_hash.as_deref(), Some("hash"));
    }

    #[tokio::test]
    async fn link_identity_is_idempotent() {
        let store = MemoryUserStore::default();
        let user = store
            .insert_credential_user("a@x.com", "hash", None)
            .await
            .expect("insert");

        store
            .link_identity(user.id, "google", "sub-1")
            .await
            .expect("first link");
        // A concurrent first callback for the same identity links again;
        // the second attempt must succeed, not fault.
        store
            .link_identity(user.id, "google", "sub-1")
            .await
            .expect("second link");

        let resolved = store
            .find_by_identity("google", "sub-1")
            .await
            .unwrap()
            .expect("identity should resolve");
        assert_eq!(resolved.id, user.id);
    }

    #[tokio::test]
    async fn set_reset_token_overwrites_previous_pair() {
        let store = MemoryUserStore::default();
        let user = store
            .insert_credential_user("a@x.com", "hash", None)
            .await
            .expect("insert");
        let expiry = OffsetDateTime::now_utc() + Duration::minutes(15);
        store.set_reset_token(user.id, "first", expiry).await.unwrap();
        store.set_reset_token(user.id, "second", expiry).await.unwrap();

        assert!(store.find_by_reset_token("first").await.unwrap().is_none());
        assert!(store.find_by_reset_token("second").await.unwrap().is_some());
    }
}
