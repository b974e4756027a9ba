use axum::{
    debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{auth::AuthUser, interactions, interactions::Status, AppError, AppResult, AppState};

pub fn router() -> Router<AppState> {
    Router::new().route("/{interaction_id}", post(post_rating))
}

#[derive(Debug, Clone, Serialize)]
pub struct Rating {
    pub id: Uuid,
    pub interaction_id: Uuid,
    pub rating_user_id: Uuid,
    pub rated_user_id: Uuid,
    pub helpfulness: u8,
    pub politeness: u8,
    pub comment: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Rate the other participant of a matched interaction, once.
///
/// The first rating is the external trigger that moves the interaction from
/// `matched` to `completed`; the peer can still rate afterwards.
pub async fn add_rating(
    pool: &SqlitePool,
    rater: Uuid,
    interaction_id: Uuid,
    helpfulness: u8,
    politeness: u8,
    comment: Option<String>,
) -> AppResult<Rating> {
    if !(1..=5).contains(&helpfulness) || !(1..=5).contains(&politeness) {
        return Err(AppError::Validation("Scores must be between 1 and 5".to_owned()));
    }

    let Some(interaction) = interactions::fetch(pool, interaction_id).await? else {
        return Err(AppError::NotFound("Interaction not found".to_owned()));
    };
    if !interaction.is_participant(rater) {
        return Err(AppError::Authorization("Not authorized".to_owned()));
    }
    if !matches!(interaction.status, Status::Matched | Status::Completed) {
        return Err(AppError::InvalidState("Cannot rate this interaction yet".to_owned()));
    }

    // Exactly two participants, so the peer is always present here.
    let rated = interaction
        .peer_of(rater)
        .ok_or_else(|| AppError::Validation("Cannot rate this interaction".to_owned()))?;

    let rating = Rating {
        id: Uuid::now_v7(),
        interaction_id,
        rating_user_id: rater,
        rated_user_id: rated,
        helpfulness,
        politeness,
        comment,
        created_at: OffsetDateTime::now_utc(),
    };

    let inserted = sqlx::query(
        "INSERT INTO ratings (id, interaction_id, rating_user_id, rated_user_id, helpfulness, politeness, comment, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(rating.id.to_string())
    .bind(rating.interaction_id.to_string())
    .bind(rating.rating_user_id.to_string())
    .bind(rating.rated_user_id.to_string())
    .bind(rating.helpfulness as i64)
    .bind(rating.politeness as i64)
    .bind(&rating.comment)
    .bind(rating.created_at)
    .execute(pool)
    .await;

    match inserted {
        Ok(_) => {}
        Err(err) if err.as_database_error().is_some_and(|e| e.is_unique_violation()) => {
            return Err(AppError::Conflict(
                "You have already rated this interaction".to_owned(),
            ));
        }
        Err(err) => return Err(err.into()),
    }

    if interaction.status == Status::Matched {
        interactions::complete(pool, interaction_id).await?;
    }

    Ok(rating)
}

#[derive(Debug, Deserialize)]
struct RatingBody {
    helpfulness: u8,
    politeness: u8,
    comment: Option<String>,
}

#[debug_handler(state = AppState)]
async fn post_rating(
    AuthUser(user_id): AuthUser,
    State(db_pool): State<SqlitePool>,
    Path(interaction_id): Path<Uuid>,
    Json(RatingBody { helpfulness, politeness, comment }): Json<RatingBody>,
) -> AppResult<Response> {
    let rating = add_rating(&db_pool, user_id, interaction_id, helpfulness, politeness, comment).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "success", "data": rating })),
    )
        .into_response())
}
