use rand::{rngs::OsRng, RngCore};
use time::{Duration, OffsetDateTime};

/// 32 random bytes, hex-encoded: 256 bits of entropy per token.
const TOKEN_BYTES: usize = 32;

/// Generate an opaque random token. Used for reset tokens and persisted
/// session handles.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn reset_expiry(ttl_minutes: i64) -> OffsetDateTime {
    OffsetDateTime::now_utc() + Duration::minutes(ttl_minutes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Valid,
    Expired,
}

/// Lazy expiry check. The boundary is closed on the expired side: a token is
/// expired at exactly `expires_at`. A missing expiry counts as expired.
pub fn token_state(expires_at: Option<OffsetDateTime>, now: OffsetDateTime) -> TokenState {
    match expires_at {
        Some(expires_at) if now < expires_at => TokenState::Valid,
        _ => TokenState::Expired,
    }
}
