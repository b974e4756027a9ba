use axum::{extract::FromRequestParts, http::{header, request::Parts}};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{AppError, AppResult, AppState};

/// Authenticated caller, resolved from the bearer token the external
/// credential service issued. The core never mints tokens, it only reads
/// the handoff table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser(pub Uuid);

/// Resolve an opaque token to a user id.
///
/// Unknown and expired tokens are indistinguishable to the caller.
pub async fn verify_token(pool: &SqlitePool, token: &str) -> AppResult<Uuid> {
    let row: Option<(String, Option<OffsetDateTime>)> =
        sqlx::query_as("SELECT user_id, expires_at FROM auth_tokens WHERE token=?")
            .bind(token)
            .fetch_optional(pool)
            .await?;

    let Some((user_id, expires_at)) = row else {
        return Err(AppError::Authentication("Not authorized, token failed".to_owned()));
    };

    if let Some(expires_at) = expires_at {
        if expires_at <= OffsetDateTime::now_utc() {
            return Err(AppError::Authentication("Not authorized, token failed".to_owned()));
        }
    }

    Uuid::parse_str(&user_id)
        .map_err(|_| AppError::Authentication("Not authorized, token failed".to_owned()))
}

fn bearer_token(parts: &Parts) -> AppResult<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::Authentication("Not authorized, no token".to_owned()))
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let user_id = verify_token(&state.db_pool, token).await?;
        Ok(AuthUser(user_id))
    }
}

#[cfg(test)]
pub(crate) async fn issue_token(pool: &SqlitePool, user_id: Uuid) -> String {
    let token = Uuid::now_v7().simple().to_string();
    sqlx::query("INSERT INTO auth_tokens (token, user_id) VALUES (?, ?)")
        .bind(&token)
        .bind(user_id.to_string())
        .execute(pool)
        .await
        .unwrap();
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let pool = db::memory_pool().await;
        let err = verify_token(&pool, "nope").await.unwrap_err();
        assert!(matches!(err, AppError::Authentication(_)));
    }

    #[tokio::test]
    async fn valid_token_resolves_user() {
        let pool = db::memory_pool().await;
        let user_id = Uuid::now_v7();
        let token = issue_token(&pool, user_id).await;
        assert_eq!(verify_token(&pool, &token).await.unwrap(), user_id);
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let pool = db::memory_pool().await;
        let user_id = Uuid::now_v7();
        sqlx::query("INSERT INTO auth_tokens (token, user_id, expires_at) VALUES (?, ?, ?)")
            .bind("stale")
            .bind(user_id.to_string())
            .bind(OffsetDateTime::now_utc() - time::Duration::hours(1))
            .execute(&pool)
            .await
            .unwrap();

        let err = verify_token(&pool, "stale").await.unwrap_err();
        assert!(matches!(err, AppError::Authentication(_)));
    }
}
