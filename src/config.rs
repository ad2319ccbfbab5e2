use serde::Deserialize;

/// Which session strategy the deployment runs. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStrategyKind {
    Stateless,
    Persisted,
}

impl SessionStrategyKind {
    fn parse(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "stateless" | "jwt" => Ok(Self::Stateless),
            "persisted" | "database" => Ok(Self::Persisted),
            other => anyhow::bail!("unknown SESSION_STRATEGY: {other}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub strategy: SessionStrategyKind,
    pub ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Trusts the OAuth provider's email verification and merges accounts
    /// sharing an email address. An explicit trust boundary; see DESIGN.md.
    pub dangerous_email_linking: bool,
    pub reset_token_ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    /// Public origin used to build links sent in email.
    pub base_url: String,
    pub jwt: JwtConfig,
    pub session: SessionConfig,
    pub smtp: SmtpConfig,
    pub auth: AuthConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let base_url =
            std::env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:3000".into());
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "buddyhub".into()),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or_else(|_| "buddyhub-users".into()),
        };
        let session = SessionConfig {
            strategy: match std::env::var("SESSION_STRATEGY") {
                Ok(v) => SessionStrategyKind::parse(&v)?,
                Err(_) => SessionStrategyKind::Stateless,
            },
            ttl_minutes: std::env::var("SESSION_TTL_MINUTES")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(60 * 24 * 30),
        };
        let smtp = SmtpConfig {
            host: std::env::var("SMTP_HOST")?,
            port: std::env::var("SMTP_PORT")
                .ok()
                .and_then(|v| v.parse::<u16>().ok())
                .unwrap_or(587),
            username: std::env::var("SMTP_USER")?,
            password: std::env::var("SMTP_PASS")?,
            from: std::env::var("SMTP_FROM").or_else(|_| std::env::var("SMTP_USER"))?,
        };
        let auth = AuthConfig {
            dangerous_email_linking: std::env::var("AUTH_DANGEROUS_EMAIL_LINKING")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            reset_token_ttl_minutes: std::env::var("RESET_TOKEN_TTL_MINUTES")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(15),
        };
        Ok(Self {
            database_url,
            base_url,
            jwt,
            session,
            smtp,
            auth,
        })
    }
}
