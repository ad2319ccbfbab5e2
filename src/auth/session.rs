use axum::async_trait;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use crate::auth::repo::UserStore;
use crate::auth::repo_types::{Role, SessionRecord, User};
use crate::auth::tokens::{generate_token, token_state, TokenState};
use crate::config::JwtConfig;

/// What every protected endpoint gets back from session resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionClaims {
    pub user_id: Uuid,
    pub role: Role,
}

/// Uniform session contract. The deployment picks one implementation at
/// startup; calling code never branches on which.
///
/// `resolve` returns `Ok(None)` for any handle that does not map to a live
/// session (tampered, expired, unknown); `Err` is reserved for dependency
/// failures.
#[async_trait]
pub trait SessionStrategy: Send + Sync {
    async fn issue(&self, user: &User) -> anyhow::Result<String>;
    async fn resolve(&self, handle: &str) -> anyhow::Result<Option<SessionClaims>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: Uuid,
    role: Role,
    iat: usize,
    exp: usize,
    iss: String,
    aud: String,
}

/// Self-contained signed tokens. Role and user id are baked in at issuance
/// and only refreshed on re-authentication.
pub struct StatelessSessions {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
    ttl: Duration,
}

impl StatelessSessions {
    pub fn new(cfg: &JwtConfig, ttl_minutes: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
            ttl: Duration::minutes(ttl_minutes),
        }
    }
}

#[async_trait]
impl SessionStrategy for StatelessSessions {
    async fn issue(&self, user: &User) -> anyhow::Result<String> {
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: user.id,
            role: user.role,
            iat: now.unix_timestamp() as usize,
            exp: (now + self.ttl).unix_timestamp() as usize,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding)?;
        debug!(user_id = %user.id, "stateless session issued");
        Ok(token)
    }

    async fn resolve(&self, handle: &str) -> anyhow::Result<Option<SessionClaims>> {
        let mut validation = Validation::default();
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        match decode::<Claims>(handle, &self.decoding, &validation) {
            Ok(data) => {
                debug!(user_id = %data.claims.sub, "stateless session resolved");
                Ok(Some(SessionClaims {
                    user_id: data.claims.sub,
                    role: data.claims.role,
                }))
            }
            Err(_) => Ok(None),
        }
    }
}

/// Backing storage for the persisted strategy.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, record: &SessionRecord) -> anyhow::Result<()>;
    async fn get(&self, id: &str) -> anyhow::Result<Option<SessionRecord>>;
}

pub struct PgSessionStore {
    db: PgPool,
}

impl PgSessionStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, record: &SessionRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO sessions (id, user_id, created_at, expires_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&record.id)
        .bind(record.user_id)
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<SessionRecord>> {
        let record = sqlx::query_as::<_, SessionRecord>(
            "SELECT id, user_id, created_at, expires_at FROM sessions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(record)
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<HashMap<String, SessionRecord>>,
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, record: &SessionRecord) -> anyhow::Result<()> {
        self.inner
            .lock()
            .expect("session mutex poisoned")
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<SessionRecord>> {
        Ok(self
            .inner
            .lock()
            .expect("session mutex poisoned")
            .get(id)
            .cloned())
    }
}

/// Server-side session records keyed by an opaque handle. Resolution reads
/// the record and then the user, so role changes take effect on the next
/// request without re-authentication.
pub struct PersistedSessions {
    store: Arc<dyn SessionStore>,
    users: Arc<dyn UserStore>,
    ttl: Duration,
}

impl PersistedSessions {
    pub fn new(store: Arc<dyn SessionStore>, users: Arc<dyn UserStore>, ttl_minutes: i64) -> Self {
        Self {
            store,
            users,
            ttl: Duration::minutes(ttl_minutes),
        }
    }
}

#[async_trait]
impl SessionStrategy for PersistedSessions {
    async fn issue(&self, user: &User) -> anyhow::Result<String> {
        let now = OffsetDateTime::now_utc();
        let record = SessionRecord {
            id: generate_token(),
            user_id: user.id,
            created_at: now,
            expires_at: now + self.ttl,
        };
        self.store.insert(&record).await?;
        debug!(user_id = %user.id, "persisted session issued");
        Ok(record.id)
    }

    async fn resolve(&self, handle: &str) -> anyhow::Result<Option<SessionClaims>> {
        let Some(record) = self.store.get(handle).await? else {
            return Ok(None);
        };
        if token_state(Some(record.expires_at), OffsetDateTime::now_utc()) != TokenState::Valid {
            return Ok(None);
        }
        let Some(user) = self.users.find_by_id(record.user_id).await? else {
            return Ok(None);
        };
        debug!(user_id = %user.id, "persisted session resolved");
        Ok(Some(SessionClaims {
            user_id: user.id,
            role: user.role,
        }))
    }
}
