// Auth boundary: JWT access tokens and persisted refresh tokens.
//
// Sign-in itself (OAuth) lives outside this service. The core only verifies
// bearer access tokens and exchanges refresh tokens for new access tokens.
// Unauthenticated clients play as guests.

use axum::{
    extract::{FromRequestParts, State},
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    Json,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::db::Database;

// ── JWT ──────────────────────────────────────────────────────────────

fn jwt_secret() -> Vec<u8> {
    std::env::var("JWT_SECRET")
        .unwrap_or_else(|_| "bitbattle-dev-secret-change-in-production".to_string())
        .into_bytes()
}

/// Verified identity carried by an access token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: i64, // user id
    pub display_name: String,
    pub exp: usize, // expiry (unix timestamp)
}

pub fn create_access_token(user_id: i64, display_name: &str) -> Result<String, String> {
    let expiration = chrono::Utc::now()
        .checked_add_signed(chrono::Duration::hours(1))
        .expect("valid timestamp")
        .timestamp() as usize;

    let claims = Claims {
        sub: user_id,
        display_name: display_name.to_string(),
        exp: expiration,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(&jwt_secret()),
    )
    .map_err(|e| format!("Failed to create token: {e}"))
}

/// `verify_access(token) -> {user_id, display_name}` from the auth contract.
pub fn verify_access(token: &str) -> Result<Claims, String> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(&jwt_secret()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| format!("Invalid token: {e}"))
}

// ── Refresh tokens ───────────────────────────────────────────────────

const REFRESH_TOKEN_PREFIX: &str = "bb_";
const REFRESH_TOKEN_DAYS: i64 = 30;

/// Hash a raw refresh token for storage; raw tokens never touch the database.
pub fn hash_refresh_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn generate_refresh_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{REFRESH_TOKEN_PREFIX}{}", hex::encode(bytes))
}

/// Mint and persist a refresh token for a user. Returns the raw token.
pub async fn issue_refresh_token(db: &Database, user_id: i64) -> Result<String, sqlx::Error> {
    let raw = generate_refresh_token();
    let expires_at = (chrono::Utc::now() + chrono::Duration::days(REFRESH_TOKEN_DAYS))
        .format("%Y-%m-%d %H:%M:%S")
        .to_string();
    db.insert_refresh_token(&hash_refresh_token(&raw), user_id, &expires_at)
        .await?;
    Ok(raw)
}

// ── Axum extractor: OptionalAuthUser ─────────────────────────────────

/// Extracts the authenticated user from the Authorization header, if any.
/// Never rejects: guests simply carry no claims.
#[derive(Debug, Clone)]
pub struct OptionalAuthUser(pub Option<Claims>);

impl<S> FromRequestParts<S> for OptionalAuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "));

        let Some(token) = token else {
            return Ok(OptionalAuthUser(None));
        };

        Ok(OptionalAuthUser(verify_access(token).ok()))
    }
}

/// Extractor for the few endpoints that require an identity.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let OptionalAuthUser(claims) = OptionalAuthUser::from_request_parts(parts, state).await?;
        claims.map(AuthUser).ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Missing or invalid bearer token"})),
            )
        })
    }
}

// ── Refresh endpoint ─────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Serialize)]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
}

/// Exchange a refresh token for a fresh access token.
///
/// Rotation: the presented token is revoked and a new one issued in the same
/// exchange, so a replayed token fails loudly.
pub async fn refresh(
    State(db): State<Arc<Database>>,
    Json(req): Json<RefreshRequest>,
) -> impl IntoResponse {
    let hash = hash_refresh_token(&req.refresh_token);

    let row = match db.get_refresh_token(&hash).await {
        Ok(Some(row)) => row,
        Ok(None) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Unknown refresh token"})),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!("DB error in refresh: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Internal error"})),
            )
                .into_response();
        }
    };

    if row.revoked_at.is_some() {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "Refresh token revoked"})),
        )
            .into_response();
    }

    let expired = chrono::NaiveDateTime::parse_from_str(&row.expires_at, "%Y-%m-%d %H:%M:%S")
        .map(|t| t.and_utc() < chrono::Utc::now())
        .unwrap_or(true);
    if expired {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "Refresh token expired"})),
        )
            .into_response();
    }

    let user = match db.get_user(row.user_id).await {
        Ok(Some(u)) => u,
        Ok(None) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "User no longer exists"})),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!("DB error in refresh: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Internal error"})),
            )
                .into_response();
        }
    };

    let access_token = match create_access_token(user.id, &user.display_name) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!("Token creation error: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Internal error"})),
            )
                .into_response();
        }
    };

    let _ = db.revoke_refresh_token(&hash).await;
    let new_refresh = match issue_refresh_token(&db, user.id).await {
        Ok(t) => t,
        Err(e) => {
            tracing::error!("Failed to rotate refresh token: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Internal error"})),
            )
                .into_response();
        }
    };

    (
        StatusCode::OK,
        Json(serde_json::json!(RefreshResponse {
            access_token,
            refresh_token: new_refresh,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_token_round_trip() {
        let token = create_access_token(7, "alice").unwrap();
        let claims = verify_access(&token).unwrap();
        assert_eq!(claims.sub, 7);
        assert_eq!(claims.display_name, "alice");
    }

    #[test]
    fn test_invalid_access_token() {
        assert!(verify_access("invalid.token.here").is_err());
    }

    #[test]
    fn test_refresh_token_shape() {
        let raw = generate_refresh_token();
        assert!(raw.starts_with(REFRESH_TOKEN_PREFIX));
        // 32 random bytes hex-encoded after the prefix
        assert_eq!(raw.len(), REFRESH_TOKEN_PREFIX.len() + 64);
    }

    #[test]
    fn test_refresh_token_hash_is_stable() {
        let raw = "bb_deadbeef";
        assert_eq!(hash_refresh_token(raw), hash_refresh_token(raw));
        assert_ne!(hash_refresh_token(raw), hash_refresh_token("bb_feedface"));
    }

    #[tokio::test]
    async fn test_issue_refresh_token_persists_hash() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let user = db.create_user("a@example.com", "alice", None).await.unwrap();

        let raw = issue_refresh_token(&db, user.id).await.unwrap();
        let row = db
            .get_refresh_token(&hash_refresh_token(&raw))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.user_id, user.id);

        // The raw token itself is never stored
        assert!(db.get_refresh_token(&raw).await.unwrap().is_none());
    }
}
