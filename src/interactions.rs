use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    skills::{self, UserSummary},
    AppError, AppResult, AppState, RealtimeState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_interactions).post(post_interaction))
        .route("/{id}/respond", put(put_respond))
}

/// Consent state machine. `pending` transitions to `matched` or `declined`
/// by the non-initiating participant only; `completed` is entered from
/// `matched` by the rating flow. `declined` and `completed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Matched,
    Declined,
    Completed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Matched => "matched",
            Status::Declined => "declined",
            Status::Completed => "completed",
        }
    }

    fn parse(s: &str) -> AppResult<Self> {
        match s {
            "pending" => Ok(Status::Pending),
            "matched" => Ok(Status::Matched),
            "declined" => Ok(Status::Declined),
            "completed" => Ok(Status::Completed),
            other => Err(anyhow::anyhow!("unknown interaction status {other:?}").into()),
        }
    }

    /// Only matched and completed interactions carry a chat room.
    pub fn chat_eligible(self) -> bool {
        matches!(self, Status::Matched | Status::Completed)
    }
}

#[derive(Debug, Clone)]
pub struct Interaction {
    pub id: Uuid,
    /// Unordered pair, stored canonically (lo < hi by string order).
    pub participants: [Uuid; 2],
    pub initiated_by: Uuid,
    pub status: Status,
    pub created_at: OffsetDateTime,
    pub last_message_at: OffsetDateTime,
}

impl Interaction {
    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.participants.contains(&user_id)
    }

    pub fn peer_of(&self, user_id: Uuid) -> Option<Uuid> {
        match self.participants {
            [a, b] if a == user_id => Some(b),
            [a, b] if b == user_id => Some(a),
            _ => None,
        }
    }
}

type InteractionRow = (String, String, String, String, String, OffsetDateTime, OffsetDateTime);

fn from_row(row: InteractionRow) -> AppResult<Interaction> {
    let (id, pair_lo, pair_hi, initiated_by, status, created_at, last_message_at) = row;
    let parse = |s: &str| Uuid::parse_str(s).map_err(anyhow::Error::from);

    Ok(Interaction {
        id: parse(&id)?,
        participants: [parse(&pair_lo)?, parse(&pair_hi)?],
        initiated_by: parse(&initiated_by)?,
        status: Status::parse(&status)?,
        created_at,
        last_message_at,
    })
}

fn canonical_pair(a: Uuid, b: Uuid) -> (String, String) {
    let (a, b) = (a.to_string(), b.to_string());
    if a <= b { (a, b) } else { (b, a) }
}

const SELECT: &str =
    "SELECT id, pair_lo, pair_hi, initiated_by, status, created_at, last_message_at FROM interactions";

pub async fn fetch(pool: &SqlitePool, id: Uuid) -> AppResult<Option<Interaction>> {
    let row: Option<InteractionRow> = sqlx::query_as(&format!("{SELECT} WHERE id=?"))
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(from_row).transpose()
}

/// Create a pending interaction between two distinct users.
///
/// The pre-insert check gives the common case a clean error; the partial
/// unique index on the canonical pair closes the window where two requests
/// race past it.
pub async fn request(pool: &SqlitePool, initiator: Uuid, receiver: Uuid) -> AppResult<Interaction> {
    if initiator == receiver {
        return Err(AppError::Validation(
            "Cannot start interaction with yourself".to_owned(),
        ));
    }
    if skills::user_summary(pool, receiver).await?.is_none() {
        return Err(AppError::NotFound("User not found".to_owned()));
    }

    let (pair_lo, pair_hi) = canonical_pair(initiator, receiver);

    let existing: Option<(String,)> = sqlx::query_as(
        "SELECT id FROM interactions WHERE pair_lo=? AND pair_hi=? AND status IN ('pending', 'matched')",
    )
    .bind(&pair_lo)
    .bind(&pair_hi)
    .fetch_optional(pool)
    .await?;
    if existing.is_some() {
        return Err(AppError::Conflict(
            "Interaction already exists or is pending".to_owned(),
        ));
    }

    let id = Uuid::now_v7();
    let now = OffsetDateTime::now_utc();
    let inserted = sqlx::query(
        "INSERT INTO interactions (id, pair_lo, pair_hi, initiated_by, status, created_at, last_message_at) \
         VALUES (?, ?, ?, ?, 'pending', ?, ?)",
    )
    .bind(id.to_string())
    .bind(&pair_lo)
    .bind(&pair_hi)
    .bind(initiator.to_string())
    .bind(now)
    .bind(now)
    .execute(pool)
    .await;

    match inserted {
        Ok(_) => {}
        Err(err) if err.as_database_error().is_some_and(|e| e.is_unique_violation()) => {
            return Err(AppError::Conflict(
                "Interaction already exists or is pending".to_owned(),
            ));
        }
        Err(err) => return Err(err.into()),
    }

    fetch(pool, id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("interaction vanished after insert").into())
}

/// Accept or decline a pending request.
///
/// The status flip is a compare-and-swap on `status = 'pending'`, so two
/// responders racing on the same interaction cannot both succeed.
pub async fn respond(
    pool: &SqlitePool,
    id: Uuid,
    responder: Uuid,
    new_status: Status,
) -> AppResult<Interaction> {
    if !matches!(new_status, Status::Matched | Status::Declined) {
        return Err(AppError::Validation("Invalid response status".to_owned()));
    }

    let Some(interaction) = fetch(pool, id).await? else {
        return Err(AppError::NotFound("Interaction not found".to_owned()));
    };

    if !interaction.is_participant(responder) || interaction.initiated_by == responder {
        return Err(AppError::Authorization(
            "Not authorized to respond to this request".to_owned(),
        ));
    }
    if interaction.status != Status::Pending {
        return Err(AppError::InvalidState("Interaction is not pending".to_owned()));
    }

    let updated = sqlx::query("UPDATE interactions SET status=? WHERE id=? AND status='pending'")
        .bind(new_status.as_str())
        .bind(id.to_string())
        .execute(pool)
        .await?;
    if updated.rows_affected() == 0 {
        // Lost the race against a concurrent responder.
        return Err(AppError::InvalidState("Interaction is not pending".to_owned()));
    }

    fetch(pool, id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("interaction vanished after update").into())
}

/// Terminal transition driven by the rating flow.
pub async fn complete(pool: &SqlitePool, id: Uuid) -> AppResult<()> {
    let updated = sqlx::query("UPDATE interactions SET status='completed' WHERE id=? AND status='matched'")
        .bind(id.to_string())
        .execute(pool)
        .await?;
    if updated.rows_affected() == 0 {
        return Err(AppError::InvalidState("Interaction is not matched".to_owned()));
    }
    Ok(())
}

/// All interactions the user participates in, most recently active first.
pub async fn list(pool: &SqlitePool, user_id: Uuid) -> AppResult<Vec<Interaction>> {
    let rows: Vec<InteractionRow> = sqlx::query_as(&format!(
        "{SELECT} WHERE pair_lo=? OR pair_hi=? ORDER BY last_message_at DESC"
    ))
    .bind(user_id.to_string())
    .bind(user_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(from_row).collect()
}

/// Bump `last_message_at`; called on every persisted message.
pub async fn touch(pool: &SqlitePool, id: Uuid, at: OffsetDateTime) -> AppResult<()> {
    sqlx::query("UPDATE interactions SET last_message_at=? WHERE id=?")
        .bind(at)
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Gate shared by room join and message send: the interaction must exist,
/// the caller must be a participant, and the room must be chat-eligible.
pub async fn authorize_chat(
    pool: &SqlitePool,
    interaction_id: Uuid,
    user_id: Uuid,
) -> AppResult<Interaction> {
    let Some(interaction) = fetch(pool, interaction_id).await? else {
        return Err(AppError::NotFound("Interaction not found".to_owned()));
    };
    if !interaction.is_participant(user_id) {
        return Err(AppError::Authorization(
            "Not a participant of this interaction".to_owned(),
        ));
    }
    if !interaction.status.chat_eligible() {
        return Err(AppError::Authorization(
            "Interaction is not open for chat".to_owned(),
        ));
    }
    Ok(interaction)
}

#[derive(Debug, Serialize)]
pub struct InteractionView {
    pub id: Uuid,
    pub participants: Vec<UserSummary>,
    pub initiated_by: Uuid,
    pub status: Status,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_message_at: OffsetDateTime,
}

/// Participant-enriched record, as the REST layer returns it.
pub async fn enrich(
    pool: &SqlitePool,
    realtime: &RealtimeState,
    interaction: Interaction,
) -> AppResult<InteractionView> {
    let mut participants = Vec::with_capacity(2);
    for user_id in interaction.participants {
        let mut summary = skills::user_summary(pool, user_id).await?.unwrap_or(UserSummary {
            id: user_id,
            username: String::new(),
            avatar_url: None,
            online: false,
        });
        summary.online = realtime.presence.is_online(user_id);
        participants.push(summary);
    }

    Ok(InteractionView {
        id: interaction.id,
        participants,
        initiated_by: interaction.initiated_by,
        status: interaction.status,
        created_at: interaction.created_at,
        last_message_at: interaction.last_message_at,
    })
}

#[derive(Debug, Deserialize)]
struct RequestBody {
    receiver_id: Uuid,
}

#[debug_handler(state = AppState)]
async fn post_interaction(
    AuthUser(user_id): AuthUser,
    State(db_pool): State<SqlitePool>,
    State(realtime): State<Arc<RealtimeState>>,
    Json(RequestBody { receiver_id }): Json<RequestBody>,
) -> AppResult<Response> {
    let interaction = request(&db_pool, user_id, receiver_id).await?;
    let view = enrich(&db_pool, &realtime, interaction).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "success", "data": view })),
    )
        .into_response())
}

#[debug_handler(state = AppState)]
async fn get_interactions(
    AuthUser(user_id): AuthUser,
    State(db_pool): State<SqlitePool>,
    State(realtime): State<Arc<RealtimeState>>,
) -> AppResult<Json<Value>> {
    let mut views = Vec::new();
    for interaction in list(&db_pool, user_id).await? {
        views.push(enrich(&db_pool, &realtime, interaction).await?);
    }

    Ok(Json(json!({ "status": "success", "data": views })))
}

#[derive(Debug, Deserialize)]
struct RespondBody {
    status: Status,
}

#[debug_handler(state = AppState)]
async fn put_respond(
    AuthUser(user_id): AuthUser,
    State(db_pool): State<SqlitePool>,
    State(realtime): State<Arc<RealtimeState>>,
    Path(id): Path<Uuid>,
    Json(RespondBody { status }): Json<RespondBody>,
) -> AppResult<Json<Value>> {
    let interaction = respond(&db_pool, id, user_id, status).await?;
    let view = enrich(&db_pool, &realtime, interaction).await?;

    Ok(Json(json!({ "status": "success", "data": view })))
}
