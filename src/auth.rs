//! Bearer-JWT route authentication, grounded on the teacher's
//! `auth.rs::AuthMiddleware` (moka TTL cache + governor per-subject quota),
//! simplified to the HS256 branch: this crate authenticates its own
//! browser-facing route, not AT Protocol service-to-service calls.

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use moka::sync::Cache;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::HashMap, num::NonZeroU32, sync::Arc, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingAuthHeader,
    #[error("invalid authorization header format")]
    InvalidAuthFormat,
    #[error("invalid JWT token: {0}")]
    InvalidToken(String),
    #[error("rate limit exceeded")]
    RateLimitExceeded,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::UNAUTHORIZED,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Claims for this service's own browser-facing JWT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteClaims {
    /// Subject: the brokerage user id this session authenticates.
    pub sub: String,
    pub exp: i64,
    pub iat: Option<i64>,
}

/// The authenticated caller, extracted once per request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

#[derive(Clone)]
struct CachedClaims {
    claims: RouteClaims,
}

/// Verifies bearer JWTs and rate-limits by subject, exactly the shape of
/// the teacher's `AuthMiddleware` minus DID resolution (no third-party
/// identity system here — the subject is just the brokerage user id).
#[derive(Clone)]
pub struct AuthVerifier {
    secret: Arc<str>,
    claims_cache: Cache<String, CachedClaims>,
    rate_limiters: Arc<RwLock<HashMap<String, Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>>>>,
    rate_limit_quota: Quota,
}

impl AuthVerifier {
    pub fn new(secret: impl Into<Arc<str>>) -> Self {
        Self::with_config(secret, 300, 100)
    }

    pub fn with_config(secret: impl Into<Arc<str>>, cache_ttl_seconds: u64, requests_per_second: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(requests_per_second.max(1)).unwrap())
            .allow_burst(NonZeroU32::new((requests_per_second.max(1) / 10).max(1)).unwrap());

        Self {
            secret: secret.into(),
            claims_cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(cache_ttl_seconds))
                .build(),
            rate_limiters: Arc::new(RwLock::new(HashMap::new())),
            rate_limit_quota: quota,
        }
    }

    fn verify_jwt(&self, token: &str) -> Result<RouteClaims, AuthError> {
        if let Some(cached) = self.claims_cache.get(token) {
            return Ok(cached.claims);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        let decoded = decode::<RouteClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        self.claims_cache.insert(
            token.to_string(),
            CachedClaims {
                claims: decoded.claims.clone(),
            },
        );

        Ok(decoded.claims)
    }

    fn check_rate_limit(&self, user_id: &str) -> Result<(), AuthError> {
        let limiter = {
            let limiters = self.rate_limiters.read();
            limiters.get(user_id).cloned()
        };

        let limiter = limiter.unwrap_or_else(|| {
            let mut limiters = self.rate_limiters.write();
            limiters
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(RateLimiter::direct(self.rate_limit_quota)))
                .clone()
        });

        limiter.check().map_err(|_| AuthError::RateLimitExceeded)
    }

    pub fn authenticate(&self, bearer: &str) -> Result<AuthUser, AuthError> {
        let claims = self.verify_jwt(bearer)?;
        self.check_rate_limit(&claims.sub)?;
        Ok(AuthUser {
            user_id: claims.sub,
        })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    AuthVerifier: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::MissingAuthHeader)?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or(AuthError::InvalidAuthFormat)?;

        let verifier = AuthVerifier::from_ref(state);
        verifier.authenticate(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token_for(user_id: &str, secret: &str, expires_in_secs: i64) -> String {
        let claims = RouteClaims {
            sub: user_id.to_string(),
            exp: chrono_like_now() + expires_in_secs,
            iat: Some(chrono_like_now()),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn chrono_like_now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    #[test]
    fn authenticates_valid_token() {
        let verifier = AuthVerifier::new("test-secret");
        let token = token_for("user-42", "test-secret", 3600);
        let user = verifier.authenticate(&token).unwrap();
        assert_eq!(user.user_id, "user-42");
    }

    #[test]
    fn rejects_expired_token() {
        let verifier = AuthVerifier::new("test-secret");
        let token = token_for("user-42", "test-secret", -10);
        assert!(verifier.authenticate(&token).is_err());
    }

    #[test]
    fn rejects_wrong_secret() {
        let verifier = AuthVerifier::new("test-secret");
        let token = token_for("user-42", "other-secret", 3600);
        assert!(verifier.authenticate(&token).is_err());
    }

    #[test]
    fn rate_limits_repeated_calls_for_same_subject() {
        let verifier = AuthVerifier::with_config("test-secret", 300, 1);
        let token = token_for("user-7", "test-secret", 3600);
        assert!(verifier.authenticate(&token).is_ok());
        // Burst allowance is max(1/10, 1) = 1, so the second call in the
        // same instant must exceed quota.
        assert!(verifier.authenticate(&token).is_err());
    }
}
