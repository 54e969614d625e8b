//! Bearer-token authentication for the API.
//!
//! Tokens are compact HS256 JWTs. The middleware re-loads the user on every
//! request so deactivation and role changes take effect immediately.

use std::sync::Arc;

use argon2::password_hash::SaltString;
use argon2::password_hash::rand_core::OsRng;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::Response,
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::config::MAX_HOURS;
use crate::db::{Role, UserRecord};
use crate::error::AuthError;
use crate::legal::audit::AuditKind;
use crate::web::server::AppState;

type HmacSha256 = Hmac<Sha256>;

pub const MIN_PASSWORD_LEN: usize = 8;

const JWT_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

/// Token payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

/// Signs and verifies session tokens with the configured secret.
pub struct TokenSigner {
    secret: SecretString,
    ttl: Duration,
}

impl TokenSigner {
    pub fn new(secret: SecretString, ttl_hours: u64) -> Self {
        // Resolved config already bounds this; clamp for direct callers.
        let hours = i64::try_from(ttl_hours.clamp(1, MAX_HOURS)).unwrap_or(1);
        Self {
            secret,
            ttl: Duration::try_hours(hours).unwrap_or_else(|| Duration::hours(1)),
        }
    }

    /// Returns the token and its expiry.
    pub fn issue(
        &self,
        user: &UserRecord,
        now: DateTime<Utc>,
    ) -> Result<(String, DateTime<Utc>), AuthError> {
        let expires_at = now + self.ttl;
        let claims = Claims {
            sub: user.id,
            role: user.role,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let payload =
            serde_json::to_vec(&claims).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(JWT_HEADER),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let signature = self.sign(signing_input.as_bytes())?;
        Ok((
            format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(signature)),
            expires_at,
        ))
    }

    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, AuthError> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::InvalidToken("malformed token".to_string()));
        };

        let header_json = decode_segment(header)?;
        let header: serde_json::Value = serde_json::from_slice(&header_json)
            .map_err(|_| AuthError::InvalidToken("malformed header".to_string()))?;
        if header.get("alg").and_then(|alg| alg.as_str()) != Some("HS256") {
            return Err(AuthError::InvalidToken("unsupported algorithm".to_string()));
        }

        let provided = decode_segment(signature)?;
        let expected = self.sign(signed_prefix(token).as_bytes())?;
        if !bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
            return Err(AuthError::InvalidToken("bad signature".to_string()));
        }

        let claims: Claims = serde_json::from_slice(&decode_segment(payload)?)
            .map_err(|_| AuthError::InvalidToken("malformed claims".to_string()))?;
        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or_else(|| AuthError::InvalidToken("bad expiry".to_string()))?;
        if expires_at <= now {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }

    fn sign(&self, input: &[u8]) -> Result<Vec<u8>, AuthError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        mac.update(input);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// `header.payload`, the part of a token covered by the signature.
fn signed_prefix(token: &str) -> &str {
    token.rsplit_once('.').map(|(prefix, _)| prefix).unwrap_or(token)
}

fn decode_segment(segment: &str) -> Result<Vec<u8>, AuthError> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| AuthError::InvalidToken("bad encoding".to_string()))
}

pub fn check_password_strength(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::WeakPassword {
            min: MIN_PASSWORD_LEN,
        });
    }
    Ok(())
}

/// Argon2id PHC string for `password`. Runs on the blocking pool.
pub async fn hash_password(password: String) -> Result<String, AuthError> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AuthError::Hash(e.to_string()))
    })
    .await
    .map_err(|e| AuthError::Hash(e.to_string()))?
}

/// False for a wrong password or an unparsable stored hash.
pub async fn verify_password(password: String, stored_hash: String) -> bool {
    tokio::task::spawn_blocking(move || {
        PasswordHash::new(&stored_hash)
            .map(|parsed| {
                Argon2::default()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false)
    })
    .await
    .unwrap_or(false)
}

/// The authenticated caller, inserted into request extensions.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub UserRecord);

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Auth middleware: throttles, validates the bearer token and resolves the
/// caller.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, (StatusCode, String)> {
    if !state.api_limiter.check() {
        state.audit.record(
            AuditKind::RateLimited,
            serde_json::json!({ "path": request.uri().path() }),
        );
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            "Rate limit exceeded. Try again shortly.".to_string(),
        ));
    }

    let token = bearer_token(request.headers()).ok_or((
        StatusCode::UNAUTHORIZED,
        AuthError::MissingToken.to_string(),
    ))?;
    let claims = state
        .tokens
        .verify(token, Utc::now())
        .map_err(|e| (StatusCode::UNAUTHORIZED, e.to_string()))?;

    let user = state
        .db
        .get_user(claims.sub)
        .await
        .map_err(|e| {
            tracing::error!("failed to load user {} for request: {}", claims.sub, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal storage error".to_string(),
            )
        })?
        .filter(|user| user.is_active)
        .ok_or((
            StatusCode::UNAUTHORIZED,
            "User not found or inactive".to_string(),
        ))?;

    request.extensions_mut().insert(CurrentUser(user));
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new(
            SecretString::from("0123456789abcdef0123456789abcdef".to_string()),
            12,
        )
    }

    fn user(role: Role) -> UserRecord {
        let now = Utc::now();
        UserRecord {
            id: Uuid::new_v4(),
            name: "Ana".into(),
            email: "ana@firm.test".into(),
            role,
            phone: None,
            title: None,
            photo_path: None,
            is_active: true,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn oversized_lifetime_is_capped() {
        let signer = TokenSigner::new(
            SecretString::from("0123456789abcdef0123456789abcdef".to_string()),
            10_000_000_000_000,
        );
        let now = Utc::now();
        let (_, expires_at) = signer.issue(&user(Role::Member), now).expect("issue");
        assert_eq!(expires_at, now + Duration::hours(MAX_HOURS as i64));
    }

    #[test]
    fn issued_tokens_verify() {
        let signer = signer();
        let user = user(Role::Admin);
        let now = Utc::now();
        let (token, expires_at) = signer.issue(&user, now).expect("issue");
        assert_eq!(expires_at, now + Duration::hours(12));
        let claims = signer.verify(&token, now).expect("verify");
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.role, Role::Admin);
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let signer = signer();
        let now = Utc::now();
        let (token, _) = signer.issue(&user(Role::Member), now).expect("issue");
        let err = signer
            .verify(&token, now + Duration::hours(13))
            .expect_err("expired");
        assert!(matches!(err, AuthError::Expired));
    }

    #[test]
    fn tampered_tokens_are_rejected() {
        let signer = signer();
        let now = Utc::now();
        let (token, _) = signer.issue(&user(Role::Member), now).expect("issue");
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&Claims {
                sub: Uuid::new_v4(),
                role: Role::SuperAdmin,
                iat: now.timestamp(),
                exp: now.timestamp() + 3600,
            })
            .unwrap(),
        );
        parts[1] = &forged;
        assert!(signer.verify(&parts.join("."), now).is_err());

        let other = TokenSigner::new(
            SecretString::from("another-secret-another-secret-xx".to_string()),
            12,
        );
        assert!(other.verify(&token, now).is_err());
        assert!(signer.verify("not-a-token", now).is_err());
    }

    #[tokio::test]
    async fn passwords_hash_and_verify() {
        let hash = hash_password("correct horse".to_string()).await.expect("hash");
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("correct horse".to_string(), hash.clone()).await);
        assert!(!verify_password("wrong horse".to_string(), hash).await);
        assert!(!verify_password("x".to_string(), "garbage".to_string()).await);
    }

    #[test]
    fn short_passwords_are_weak() {
        assert!(check_password_strength("1234567").is_err());
        assert!(check_password_strength("12345678").is_ok());
    }

    #[test]
    fn bearer_token_requires_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc"));
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
