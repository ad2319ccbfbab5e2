use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::rngs::OsRng;
use tracing::error;

/// Valid argon2id PHC string matching no real password. Verified against on
/// the unknown-user and password-less login paths so those take as long as a
/// genuine mismatch.
const DUMMY_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$gZiV/M1gPc22ElAH/Jh1Hw$CWOrkoo7oJBQ/45WwgCUZN1rbdoajzZzi4Ru9Ovvv2s";

pub const MIN_PASSWORD_LEN: usize = 8;
const PASSWORD_SYMBOLS: &str = "!@#$%^&*(),.?\":{}|<>";

pub fn hash_password(plain: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| {
            error!(error = %e, "argon2 hash_password error");
            anyhow::anyhow!(e.to_string())
        })?
        .to_string();
    Ok(hash)
}

pub fn verify_password(plain: &str, hash: &str) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| {
        error!(error = %e, "argon2 parse hash error");
        anyhow::anyhow!(e.to_string())
    })?;
    Ok(Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok())
}

/// Burn one argon2 verification against a fixed hash. Result discarded.
pub fn dummy_verify(plain: &str) {
    let _ = verify_password(plain, DUMMY_HASH);
}

/// Minimum-strength policy: length, one digit, one symbol. Returns every
/// violated rule so the caller can report field-level detail.
pub fn check_password_strength(plain: &str) -> Result<(), Vec<String>> {
    let mut violations = Vec::new();
    if plain.len() < MIN_PASSWORD_LEN {
        violations.push(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters long."
        ));
    }
    if !plain.chars().any(|c| c.is_ascii_digit()) {
        violations.push("Password must contain at least one number.".to_string());
    }
    if !plain.chars().any(|c| PASSWORD_SYMBOLS.contains(c)) {
        violations.push(format!(
            "Password must contain at least one symbol ({PASSWORD_SYMBOLS})."
        ));
    }
    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}
