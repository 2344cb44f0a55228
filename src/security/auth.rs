//! Credential primitives.
//!
//! Passwords are hashed with Argon2 at the default (interactive) cost and a
//! random salt; verification goes through the `password_hash` parser, which
//! compares in constant time. AUTH PLAIN and REGISTER share the SASL PLAIN
//! payload shape (RFC 4616): base64 of `authzid NUL username NUL password`.

use crate::error::{MailError, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Hashes a password for storage. The salt is embedded in the output.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| MailError::HashFailure(e.to_string()))?;

    Ok(password_hash.to_string())
}

/// Verifies a password against a stored hash string.
pub fn verify_password(password: &str, stored_hash: &str) -> Result<bool> {
    let parsed_hash =
        PasswordHash::new(stored_hash).map_err(|e| MailError::HashFailure(e.to_string()))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Decodes a SASL PLAIN payload into (username, password).
///
/// Leading whitespace is tolerated; some clients leave a space between the
/// verb and the payload. The authorization identity before the first NUL is
/// ignored.
pub fn decode_plain_credentials(payload: &str) -> Result<(String, String)> {
    let decoded = BASE64
        .decode(payload.trim().as_bytes())
        .map_err(|e| MailError::SmtpProtocol(format!("Invalid base64: {}", e)))?;

    let text = std::str::from_utf8(&decoded)
        .map_err(|e| MailError::SmtpProtocol(format!("Invalid UTF-8: {}", e)))?;

    let first_null = text
        .find('\0')
        .ok_or_else(|| MailError::SmtpProtocol("Missing first null byte".to_string()))?;
    let second_null = text[first_null + 1..]
        .find('\0')
        .map(|pos| first_null + 1 + pos)
        .ok_or_else(|| MailError::SmtpProtocol("Missing second null byte".to_string()))?;

    let username = text[first_null + 1..second_null].to_string();
    let password = text[second_null + 1..].to_string();

    Ok((username, password))
}
