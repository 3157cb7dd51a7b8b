//! JWT authentication for the realtime handshake.
//!
//! Tokens are HS256 JWTs whose `sub` is the user id. The `AuthUser` extractor
//! accepts the token from the `?token=` query parameter (browsers cannot set
//! headers on a WebSocket handshake) or from `Authorization: Bearer <token>`.

use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use herald_common::error::AppError;

use crate::state::AppState;

/// JWT claims stored in the token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject: the user id
    pub sub: String,
    /// Expiration time (UNIX timestamp)
    pub exp: i64,
    /// Issued at (UNIX timestamp)
    pub iat: i64,
}

/// Authenticated user extracted from the handshake.
///
/// ```ignore
/// async fn handler(auth: AuthUser, ws: WebSocketUpgrade) -> Response {
///     // auth.user_id is the authenticated user's id
/// }
/// ```
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub claims: Claims,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Encode a JWT token for a user.
pub fn encode_jwt(user_id: &str, secret: &str, expiry_hours: u64) -> Result<String, AppError> {
    let now = Utc::now();
    let exp = now + Duration::hours(expiry_hours as i64);

    let claims = Claims {
        sub: user_id.to_string(),
        exp: exp.timestamp(),
        iat: now.timestamp(),
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Auth(format!("Failed to encode JWT: {}", e)))?;

    Ok(token)
}

/// Decode and validate a JWT token.
pub fn decode_jwt(token: &str, secret: &str) -> Result<Claims, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| AppError::Auth(format!("Invalid token: {}", e)))?;

    if token_data.claims.sub.trim().is_empty() {
        return Err(AppError::Auth("Token has no subject".to_string()));
    }

    Ok(token_data.claims)
}

/// The handshake token: `?token=` first, then the bearer header.
fn handshake_token(parts: &Parts) -> Option<String> {
    let from_query = Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(q)| q.token)
        .filter(|t| !t.is_empty());
    if from_query.is_some() {
        return from_query;
    }

    parts
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Rejects with 401 before any upgrade happens.
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let secret = state.config.jwt_secret.clone();
        let token = handshake_token(parts);

        async move {
            let Some(token) = token else {
                return Err(AppError::Auth(
                    "Missing token. Use '?token=<JWT>' or 'Authorization: Bearer <JWT>'"
                        .to_string(),
                ));
            };

            let claims = decode_jwt(&token, &secret)?;
            Ok(AuthUser {
                user_id: claims.sub.clone(),
                claims,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Request;

    use super::*;

    const TEST_SECRET: &str = "test-secret-key-for-unit-tests";

    fn parts(uri: &str, bearer: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_encode_decode_jwt() {
        let token = encode_jwt("u1", TEST_SECRET, 24).unwrap();
        let claims = decode_jwt(&token, TEST_SECRET).unwrap();
        assert_eq!(claims.sub, "u1");
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn test_invalid_secret_rejected() {
        let token = encode_jwt("u1", TEST_SECRET, 24).unwrap();
        assert!(decode_jwt(&token, "wrong-secret").is_err());
    }

    #[test]
    fn test_expired_jwt_rejected() {
        let now = Utc::now();
        let claims = Claims {
            sub: "u1".to_string(),
            exp: (now - Duration::hours(1)).timestamp(),
            iat: (now - Duration::hours(2)).timestamp(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .unwrap();

        assert!(decode_jwt(&token, TEST_SECRET).is_err());
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert!(decode_jwt("not.a.valid.jwt", TEST_SECRET).is_err());
    }

    #[test]
    fn test_query_token_preferred_over_header() {
        let both = parts("/ws?token=from-query", Some("from-header"));
        assert_eq!(handshake_token(&both).as_deref(), Some("from-query"));
    }

    #[test]
    fn test_header_token_used_without_query() {
        let with_header = parts("/ws", Some("from-header"));
        assert_eq!(handshake_token(&with_header).as_deref(), Some("from-header"));

        let empty = parts("/ws?token=", None);
        assert_eq!(handshake_token(&empty), None);
    }
}
