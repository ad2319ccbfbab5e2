use lazy_static::lazy_static;
use regex::Regex;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::auth::dto::{
    LoginRequest, ProviderAssertion, PublicUser, RegisterRequest, SessionResponse,
};
use crate::auth::password::{
    check_password_strength, dummy_verify, hash_password, verify_password,
};
use crate::auth::repo::{InsertUserError, UserStore as _};
use crate::auth::repo_types::User;
use crate::auth::session::SessionStrategy as _;
use crate::auth::tokens::{generate_token, reset_expiry, token_state, TokenState};
use crate::error::AuthError;
use crate::mailer::{password_reset_email, Mailer as _};
use crate::state::AppState;

/// Constant body for every reset request, hit or miss.
pub const RESET_REQUEST_MESSAGE: &str =
    "If an account with that email exists, we sent you a password reset link.";
pub const RESET_EMAIL_SUBJECT: &str = "Reset your password";

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub async fn register(state: &AppState, mut req: RegisterRequest) -> Result<PublicUser, AuthError> {
    req.email = normalize_email(&req.email);
    if !is_valid_email(&req.email) {
        warn!(email = %req.email, "register with invalid email");
        return Err(AuthError::Validation(
            "Please enter a valid email address.".into(),
        ));
    }
    if let Err(violations) = check_password_strength(&req.password) {
        warn!("register with weak password");
        return Err(AuthError::WeakPassword(violations));
    }
    if state.store.find_by_email(&req.email).await?.is_some() {
        warn!(email = %req.email, "email already registered");
        return Err(AuthError::EmailInUse);
    }

    let hash = hash_password(&req.password)?;
    let user = state
        .store
        .insert_credential_user(&req.email, &hash, req.name.as_deref())
        .await
        .map_err(|e| match e {
            // A racing registration hit the unique constraint first.
            InsertUserError::DuplicateEmail => AuthError::EmailInUse,
            InsertUserError::Other(e) => AuthError::Dependency(e),
        })?;

    info!(user_id = %user.id, email = %user.email, "user registered");
    Ok(PublicUser::from(&user))
}

/// Credential login. Unknown email, provider-only account, and wrong
/// password all fail the same way, and the first two still burn one argon2
/// verification so the response is timing-uniform.
pub async fn login(state: &AppState, mut req: LoginRequest) -> Result<SessionResponse, AuthError> {
    req.email = normalize_email(&req.email);
    if !is_valid_email(&req.email) {
        dummy_verify(&req.password);
        return Err(AuthError::InvalidCredentials);
    }

    let user = match state.store.find_by_email(&req.email).await? {
        Some(user) => user,
        None => {
            dummy_verify(&req.password);
            warn!("login with unknown email");
            return Err(AuthError::InvalidCredentials);
        }
    };
    let Some(hash) = user.password_hash.as_deref() else {
        dummy_verify(&req.password);
        warn!(user_id = %user.id, "login against provider-only account");
        return Err(AuthError::InvalidCredentials);
    };

    if !verify_password(&req.password, hash)? {
        warn!(user_id = %user.id, "login with invalid password");
        return Err(AuthError::InvalidCredentials);
    }

    let session_token = state.sessions.issue(&user).await?;
    info!(user_id = %user.id, "user logged in");
    Ok(SessionResponse {
        session_token,
        user: PublicUser::from(&user),
    })
}

fn ensure_linking_allowed(state: &AppState, existing: User) -> Result<User, AuthError> {
    if state.config.auth.dangerous_email_linking {
        Ok(existing)
    } else {
        warn!(user_id = %existing.id, "email auto-linking disabled; refusing to merge accounts");
        Err(AuthError::Provider(
            "An account with this email already exists.".into(),
        ))
    }
}

/// Resolve a verified provider assertion to a local user: resume a known
/// identity, link to an existing account with the same email (the
/// provider-trusting merge policy, see DESIGN.md), or create a fresh
/// password-less account.
pub async fn oauth_sign_in(
    state: &AppState,
    assertion: ProviderAssertion,
) -> Result<SessionResponse, AuthError> {
    if assertion.provider.trim().is_empty() || assertion.subject.trim().is_empty() {
        return Err(AuthError::Provider("Invalid provider assertion.".into()));
    }
    let email = normalize_email(&assertion.email);
    if !is_valid_email(&email) {
        return Err(AuthError::Provider(
            "Provider assertion carries an invalid email address.".into(),
        ));
    }

    if let Some(user) = state
        .store
        .find_by_identity(&assertion.provider, &assertion.subject)
        .await?
    {
        let session_token = state.sessions.issue(&user).await?;
        debug!(user_id = %user.id, provider = %assertion.provider, "provider sign-in resumed");
        return Ok(SessionResponse {
            session_token,
            user: PublicUser::from(&user),
        });
    }

    let user = match state.store.find_by_email(&email).await? {
        Some(existing) => {
            let existing = ensure_linking_allowed(state, existing)?;
            info!(user_id = %existing.id, provider = %assertion.provider,
                "linking provider identity to existing account");
            existing
        }
        None => {
            match state
                .store
                .insert_provider_user(&email, assertion.name.as_deref(), assertion.image.as_deref())
                .await
            {
                Ok(created) => {
                    info!(user_id = %created.id, provider = %assertion.provider,
                        "user created from provider sign-in");
                    created
                }
                // Lost a signup race; link to whoever won instead.
                Err(InsertUserError::DuplicateEmail) => {
                    let existing = state
                        .store
                        .find_by_email(&email)
                        .await?
                        .ok_or_else(|| anyhow::anyhow!("user missing after unique violation"))?;
                    ensure_linking_allowed(state, existing)?
                }
                Err(InsertUserError::Other(e)) => return Err(AuthError::Dependency(e)),
            }
        }
    };

    state
        .store
        .link_identity(user.id, &assertion.provider, &assertion.subject)
        .await?;

    let session_token = state.sessions.issue(&user).await?;
    Ok(SessionResponse {
        session_token,
        user: PublicUser::from(&user),
    })
}

/// Issue a reset token and send the reset email. The caller always answers
/// with [`RESET_REQUEST_MESSAGE`] on `Ok`, whether or not anything happened,
/// so responses are uniform across registered and unknown emails. A mailer
/// failure is the one surfaced fault: the user has no other way to learn the
/// link never arrived.
pub async fn request_password_reset(state: &AppState, email: &str) -> Result<(), AuthError> {
    let email = normalize_email(email);
    if !is_valid_email(&email) {
        return Err(AuthError::Validation(
            "Please enter a valid email address.".into(),
        ));
    }

    let Some(user) = state.store.find_by_email(&email).await? else {
        debug!("reset requested for unknown email");
        return Ok(());
    };
    if user.password_hash.is_none() {
        debug!(user_id = %user.id, "reset requested for provider-only account");
        return Ok(());
    }

    let token = generate_token();
    let ttl_minutes = state.config.auth.reset_token_ttl_minutes;
    let expires_at = reset_expiry(ttl_minutes);
    // Overwrites any earlier pair; only the newest token is meant to be valid.
    state
        .store
        .set_reset_token(user.id, &token, expires_at)
        .await?;

    let reset_url = format!("{}/reset-password?token={}", state.config.base_url, token);
    let (html, text) = password_reset_email(&reset_url, user.name.as_deref(), ttl_minutes);
    state
        .mailer
        .send(&user.email, RESET_EMAIL_SUBJECT, &html, &text)
        .await
        .map_err(AuthError::EmailDelivery)?;

    info!(user_id = %user.id, "password reset email sent");
    Ok(())
}

async fn lookup_reset_token(state: &AppState, token: &str) -> Result<User, AuthError> {
    if token.is_empty() {
        return Err(AuthError::InvalidToken);
    }
    let Some(user) = state.store.find_by_reset_token(token).await? else {
        return Err(AuthError::InvalidToken);
    };
    match token_state(user.password_reset_expires_at, OffsetDateTime::now_utc()) {
        TokenState::Valid => Ok(user),
        TokenState::Expired => Err(AuthError::ExpiredToken),
    }
}

/// Advisory check used before showing the reset form. Consumption re-runs
/// the same check inside the conditional update.
pub async fn validate_reset_token(state: &AppState, token: &str) -> Result<(), AuthError> {
    lookup_reset_token(state, token).await.map(|_| ())
}

pub async fn reset_password(
    state: &AppState,
    token: &str,
    new_password: &str,
) -> Result<(), AuthError> {
    if let Err(violations) = check_password_strength(new_password) {
        return Err(AuthError::WeakPassword(violations));
    }
    let user = lookup_reset_token(state, token).await?;

    let hash = hash_password(new_password)?;
    if !state.store.clear_reset_token(token, &hash).await? {
        // The token went away between the lookup and the update: a
        // concurrent consumer won, a new request superseded it, or it
        // expired. Re-read to report the right kind.
        return Err(match state.store.find_by_reset_token(token).await? {
            None => AuthError::InvalidToken,
            Some(u) => match token_state(u.password_reset_expires_at, OffsetDateTime::now_utc()) {
                TokenState::Expired => AuthError::ExpiredToken,
                TokenState::Valid => AuthError::InvalidToken,
            },
        });
    }

    info!(user_id = %user.id, "password reset consumed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::repo::{MemoryUserStore, UserStore};
    use crate::auth::repo_types::Role;
    use crate::auth::session::{SessionStrategy, StatelessSessions};
    use crate::mailer::{Mailer, MemoryMailer};
    use crate::state::AppState;
    use axum::async_trait;
    use std::sync::Arc;
    use time::Duration;

    struct Harness {
        state: AppState,
        store: Arc<MemoryUserStore>,
        mailer: Arc<MemoryMailer>,
    }

    fn harness() -> Harness {
        harness_with_config(AppState::fake_config())
    }

    fn harness_with_config(config: crate::config::AppConfig) -> Harness {
        let config = Arc::new(config);
        let store = Arc::new(MemoryUserStore::default());
        let mailer = Arc::new(MemoryMailer::default());
        let sessions = Arc::new(StatelessSessions::new(
            &config.jwt,
            config.session.ttl_minutes,
        ));
        let state = AppState::from_parts(store.clone(), sessions, mailer.clone(), config);
        Harness {
            state,
            store,
            mailer,
        }
    }

    fn register_req(email: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            email: email.into(),
            password: password.into(),
            name: None,
        }
    }

    fn login_req(email: &str, password: &str) -> LoginRequest {
        LoginRequest {
            email: email.into(),
            password: password.into(),
        }
    }

    fn assertion(provider: &str, subject: &str, email: &str) -> ProviderAssertion {
        ProviderAssertion {
            provider: provider.into(),
            subject: subject.into(),
            email: email.into(),
            name: None,
            image: None,
        }
    }

    async fn reset_token_of(store: &MemoryUserStore, email: &str) -> String {
        store
            .find_by_email(email)
            .await
            .unwrap()
            .expect("user should exist")
            .password_reset_token
            .expect("reset token should be set")
    }

    #[tokio::test]
    async fn full_account_lifecycle() {
        let h = harness();

        let user = register(&h.state, register_req("a@x.com", "Abc12345!"))
            .await
            .expect("register");
        assert_eq!(user.email, "a@x.com");
        assert_eq!(user.role, Role::Member);

        let err = login(&h.state, login_req("a@x.com", "wrong")).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));

        let session = login(&h.state, login_req("a@x.com", "Abc12345!"))
            .await
            .expect("login");
        let claims = h
            .state
            .sessions
            .resolve(&session.session_token)
            .await
            .unwrap()
            .expect("session should resolve");
        assert_eq!(claims.user_id, user.id);
        assert_eq!(claims.role, Role::Member);

        request_password_reset(&h.state, "a@x.com")
            .await
            .expect("reset request");
        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "a@x.com");

        let token = reset_token_of(&h.store, "a@x.com").await;
        assert!(sent[0].text.contains(&token));
        validate_reset_token(&h.state, &token)
            .await
            .expect("token should validate");

        reset_password(&h.state, &token, "NewPass1!")
            .await
            .expect("consume reset");
        let err = validate_reset_token(&h.state, &token).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));

        login(&h.state, login_req("a@x.com", "NewPass1!"))
            .await
            .expect("login with new password");
        let err = login(&h.state, login_req("a@x.com", "Abc12345!"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn register_rejects_duplicate_email() {
        let h = harness();
        register(&h.state, register_req("a@x.com", "Abc12345!"))
            .await
            .expect("first register");
        let err = register(&h.state, register_req("A@X.com ", "Abc12345!"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::EmailInUse));
    }

    #[tokio::test]
    async fn register_rejects_weak_passwords() {
        let h = harness();
        for bad in ["short1!", "NoDigits!", "NoSymbol1"] {
            let err = register(&h.state, register_req("a@x.com", bad))
                .await
                .unwrap_err();
            assert!(matches!(err, AuthError::WeakPassword(_)), "password {bad:?}");
        }
        assert!(h.store.find_by_email("a@x.com").await.unwrap().is_none());

        // Every violated rule is reported, not just the first.
        let err = register(&h.state, register_req("a@x.com", "abc"))
            .await
            .unwrap_err();
        match err {
            AuthError::WeakPassword(violations) => assert_eq!(violations.len(), 3),
            other => panic!("unexpected error kind: {other:?}"),
        }
    }

    #[tokio::test]
    async fn register_rejects_malformed_email() {
        let h = harness();
        let err = register(&h.state, register_req("not-an-email", "Abc12345!"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
    }

    #[tokio::test]
    async fn reset_request_is_enumeration_uniform() {
        let h = harness();
        register(&h.state, register_req("real@x.com", "Abc12345!"))
            .await
            .expect("register");

        request_password_reset(&h.state, "ghost@x.com")
            .await
            .expect("unknown email still succeeds");
        assert!(h.mailer.sent().is_empty());

        request_password_reset(&h.state, "real@x.com")
            .await
            .expect("known email succeeds");
        assert_eq!(h.mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn reset_request_skips_provider_only_accounts() {
        let h = harness();
        oauth_sign_in(&h.state, assertion("google", "sub-1", "oauth@x.com"))
            .await
            .expect("provider sign-in");

        request_password_reset(&h.state, "oauth@x.com")
            .await
            .expect("still reports success");
        assert!(h.mailer.sent().is_empty());
        let user = h.store.find_by_email("oauth@x.com").await.unwrap().unwrap();
        assert!(user.password_reset_token.is_none());
    }

    #[tokio::test]
    async fn new_reset_request_supersedes_previous_token() {
        let h = harness();
        register(&h.state, register_req("a@x.com", "Abc12345!"))
            .await
            .expect("register");

        request_password_reset(&h.state, "a@x.com").await.unwrap();
        let first = reset_token_of(&h.store, "a@x.com").await;
        request_password_reset(&h.state, "a@x.com").await.unwrap();
        let second = reset_token_of(&h.store, "a@x.com").await;
        assert_ne!(first, second);

        let err = validate_reset_token(&h.state, &first).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
        validate_reset_token(&h.state, &second)
            .await
            .expect("newest token is valid");
    }

    #[tokio::test]
    async fn consumed_token_cannot_be_replayed() {
        let h = harness();
        register(&h.state, register_req("a@x.com", "Abc12345!"))
            .await
            .expect("register");
        request_password_reset(&h.state, "a@x.com").await.unwrap();
        let token = reset_token_of(&h.store, "a@x.com").await;

        reset_password(&h.state, &token, "NewPass1!")
            .await
            .expect("first consume");
        let err = reset_password(&h.state, &token, "OtherPass2!")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));

        login(&h.state, login_req("a@x.com", "NewPass1!"))
            .await
            .expect("first password change stands");
    }

    #[tokio::test]
    async fn expired_token_is_rejected_by_validate_and_consume() {
        let h = harness();
        let user = register(&h.state, register_req("a@x.com", "Abc12345!"))
            .await
            .expect("register");
        let past = OffsetDateTime::now_utc() - Duration::seconds(1);
        h.store
            .set_reset_token(user.id, "stale-token", past)
            .await
            .unwrap();

        let err = validate_reset_token(&h.state, "stale-token").await.unwrap_err();
        assert!(matches!(err, AuthError::ExpiredToken));
        let err = reset_password(&h.state, "stale-token", "NewPass1!")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ExpiredToken));
    }

    #[tokio::test]
    async fn reset_rejects_weak_replacement_password() {
        let h = harness();
        register(&h.state, register_req("a@x.com", "Abc12345!"))
            .await
            .expect("register");
        request_password_reset(&h.state, "a@x.com").await.unwrap();
        let token = reset_token_of(&h.store, "a@x.com").await;

        let err = reset_password(&h.state, &token, "weak").await.unwrap_err();
        assert!(matches!(err, AuthError::WeakPassword(_)));
        // A rejected attempt must not burn the token.
        validate_reset_token(&h.state, &token)
            .await
            .expect("token survives weak-password attempt");
    }

    #[tokio::test]
    async fn unknown_reset_token_is_invalid() {
        let h = harness();
        let err = validate_reset_token(&h.state, "no-such-token").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
        let err = validate_reset_token(&h.state, "").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
    }

    #[tokio::test]
    async fn login_against_provider_only_account_is_uniform() {
        let h = harness();
        oauth_sign_in(&h.state, assertion("google", "sub-1", "oauth@x.com"))
            .await
            .expect("provider sign-in");
        let err = login(&h.state, login_req("oauth@x.com", "Whatever1!"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn oauth_sign_in_creates_password_less_account() {
        let h = harness();
        let session = oauth_sign_in(&h.state, assertion("google", "sub-1", "new@x.com"))
            .await
            .expect("provider sign-in");
        let user = h.store.find_by_email("new@x.com").await.unwrap().unwrap();
        assert!(user.password_hash.is_none());
        assert_eq!(session.user.id, user.id);
        assert!(h
            .store
            .find_by_identity("google", "sub-1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn oauth_sign_in_links_to_existing_credential_account() {
        let h = harness();
        let registered = register(&h.state, register_req("a@x.com", "Abc12345!"))
            .await
            .expect("register");

        let session = oauth_sign_in(&h.state, assertion("google", "sub-1", "a@x.com"))
            .await
            .expect("provider sign-in");
        assert_eq!(session.user.id, registered.id);

        // Exactly one user, holding both a hash and a linked identity.
        let user = h.store.find_by_email("a@x.com").await.unwrap().unwrap();
        assert!(user.password_hash.is_some());
        let linked = h
            .store
            .find_by_identity("google", "sub-1")
            .await
            .unwrap()
            .expect("identity should be linked");
        assert_eq!(linked.id, registered.id);

        // Subsequent provider sign-ins resume, not duplicate.
        let again = oauth_sign_in(&h.state, assertion("google", "sub-1", "a@x.com"))
            .await
            .expect("second provider sign-in");
        assert_eq!(again.user.id, registered.id);
    }

    #[tokio::test]
    async fn oauth_linking_can_be_disabled() {
        let mut config = AppState::fake_config();
        config.auth.dangerous_email_linking = false;
        let h = harness_with_config(config);

        register(&h.state, register_req("a@x.com", "Abc12345!"))
            .await
            .expect("register");
        let err = oauth_sign_in(&h.state, assertion("google", "sub-1", "a@x.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Provider(_)));
        assert!(h
            .store
            .find_by_identity("google", "sub-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn oauth_rejects_malformed_assertion() {
        let h = harness();
        let err = oauth_sign_in(&h.state, assertion("", "sub", "a@x.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Provider(_)));
        let err = oauth_sign_in(&h.state, assertion("google", "sub", "not-an-email"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Provider(_)));
    }

    #[tokio::test]
    async fn mailer_failure_is_surfaced_not_swallowed() {
        struct FailingMailer;
        #[async_trait]
        impl Mailer for FailingMailer {
            async fn send(&self, _: &str, _: &str, _: &str, _: &str) -> anyhow::Result<()> {
                anyhow::bail!("relay unreachable")
            }
        }

        let config = Arc::new(AppState::fake_config());
        let store = Arc::new(MemoryUserStore::default());
        let sessions = Arc::new(StatelessSessions::new(
            &config.jwt,
            config.session.ttl_minutes,
        ));
        let state = AppState::from_parts(store, sessions, Arc::new(FailingMailer), config);

        register(&state, register_req("a@x.com", "Abc12345!"))
            .await
            .expect("register");
        let err = request_password_reset(&state, "a@x.com").await.unwrap_err();
        assert!(matches!(err, AuthError::EmailDelivery(_)));
    }

    #[tokio::test]
    async fn login_response_never_contains_password_material() {
        let h = harness();
        register(&h.state, register_req("a@x.com", "Abc12345!"))
            .await
            .expect("register");
        let session = login(&h.state, login_req("a@x.com", "Abc12345!"))
            .await
            .expect("login");
        let json = serde_json::to_string(&session).unwrap();
        assert!(!json.contains("Abc12345!"));
        assert!(!json.contains("argon2"));
        assert!(!json.contains("password"));
    }
}
