//! Dashboard accounts and bearer sessions.
//!
//! Passwords are stored as argon2id PHC strings. A login issues an opaque
//! random token kept in the `sessions` table until it expires or the user logs
//! out. Handlers that need a logged-in user take [`AuthUser`] as an argument.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;

use crate::errors::{Error, Result};
use crate::model::{Session, SignupRequest};
use crate::rest::{AppError, AppState};

const USERNAME_MIN_LEN: usize = 3;
const USERNAME_MAX_LEN: usize = 50;
const EMAIL_MAX_LEN: usize = 100;
const PASSWORD_MIN_LEN: usize = 8;

pub fn hash_password(password: &str) -> Result<String> {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    let salt = SaltString::encode_b64(&salt).map_err(|e| Error::PasswordHash(e.to_string()))?;

    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| Error::PasswordHash(e.to_string()))?;
    Ok(hash.to_string())
}

/// False for a wrong password and for a hash that does not parse.
pub fn verify_password(password: &str, password_hash: &str) -> bool {
    match PasswordHash::new(password_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

pub fn new_session(username: &str, now: DateTime<Utc>, ttl_secs: i64) -> Session {
    Session {
        token: uuid::Uuid::new_v4().simple().to_string(),
        username: username.to_string(),
        created_at: now,
        expires_at: now + Duration::seconds(ttl_secs),
    }
}

pub fn validate_signup(req: &SignupRequest) -> Result<()> {
    let username_len = req.username.chars().count();
    if !(USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&username_len)
        || !req
            .username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(Error::Validation(format!(
            "Username must be {}-{} characters of letters, digits, '.', '_' or '-'",
            USERNAME_MIN_LEN, USERNAME_MAX_LEN
        )));
    }

    let email = req.email.trim();
    let well_formed = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !well_formed || email.len() > EMAIL_MAX_LEN {
        return Err(Error::Validation("Invalid email address".to_string()));
    }

    if req.password.chars().count() < PASSWORD_MIN_LEN {
        return Err(Error::Validation(format!(
            "Password must be at least {} characters",
            PASSWORD_MIN_LEN
        )));
    }

    Ok(())
}

pub fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// The logged-in user behind a request's bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub username: String,
    pub token: String,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| AppError::Unauthorized("Login required".to_string()))?
            .to_string();

        match state.store.session_user(&token, Utc::now()).await? {
            Some(username) => Ok(AuthUser { username, token }),
            None => {
                debug!("Rejected unknown or expired session token");
                Err(AppError::Unauthorized("Session expired or invalid".to_string()))
            }
        }
    }
}
