use axum::{
    debug_handler,
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    interactions, AppError, AppResult, AppState, RealtimeState,
    realtime::ServerEvent,
};

const MAX_CONTENT_CHARS: usize = 2000;
const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 100;

pub fn router() -> Router<AppState> {
    Router::new().route("/{interaction_id}", get(get_messages))
}

/// The canonical persisted message, as broadcast to the room and returned by
/// the history endpoint. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    pub id: Uuid,
    pub interaction_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Persist, touch, then fan out to every room member including the sender's
/// own tabs (clients replace their optimistic copy with this one).
///
/// The per-room lock spans persist + broadcast, so fanout order within a
/// room always matches insertion order. Rooms do not contend with each
/// other.
pub async fn send_message(
    pool: &SqlitePool,
    realtime: &RealtimeState,
    sender_id: Uuid,
    interaction_id: Uuid,
    content: String,
) -> AppResult<MessageView> {
    let content = content.trim().to_owned();
    if content.is_empty() {
        return Err(AppError::Validation("Message content cannot be empty".to_owned()));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(AppError::Validation("Message content is too long".to_owned()));
    }

    interactions::authorize_chat(pool, interaction_id, sender_id).await?;

    let lock = realtime.send_lock(interaction_id);
    let _guard = lock.lock().await;

    let message = MessageView {
        id: Uuid::now_v7(),
        interaction_id,
        sender_id,
        content,
        timestamp: OffsetDateTime::now_utc(),
    };

    sqlx::query(
        "INSERT INTO messages (id, interaction_id, sender_id, content, timestamp) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(message.id.to_string())
    .bind(message.interaction_id.to_string())
    .bind(message.sender_id.to_string())
    .bind(&message.content)
    .bind(message.timestamp)
    .execute(pool)
    .await?;

    interactions::touch(pool, interaction_id, message.timestamp).await?;

    realtime
        .rooms
        .broadcast(interaction_id, &ServerEvent::MessageReceived(message.clone()), None);

    Ok(message)
}

/// One page of history, chronological within the page, newest page first
/// (page 1 holds the latest messages).
pub async fn history(
    pool: &SqlitePool,
    interaction_id: Uuid,
    page: u32,
    limit: u32,
) -> AppResult<(Vec<MessageView>, u64)> {
    let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE interaction_id=?")
        .bind(interaction_id.to_string())
        .fetch_one(pool)
        .await?;

    let offset = (page as i64 - 1) * limit as i64;
    let rows: Vec<(String, String, String, String, OffsetDateTime)> = sqlx::query_as(
        "SELECT id, interaction_id, sender_id, content, timestamp FROM messages \
         WHERE interaction_id=? ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?",
    )
    .bind(interaction_id.to_string())
    .bind(limit as i64)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let mut messages = Vec::with_capacity(rows.len());
    for (id, interaction_id, sender_id, content, timestamp) in rows {
        let parse = |s: &str| Uuid::parse_str(s).map_err(anyhow::Error::from);
        messages.push(MessageView {
            id: parse(&id)?,
            interaction_id: parse(&interaction_id)?,
            sender_id: parse(&sender_id)?,
            content,
            timestamp,
        });
    }
    messages.reverse();

    Ok((messages, total as u64))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    page: Option<u32>,
    limit: Option<u32>,
}

#[debug_handler(state = AppState)]
async fn get_messages(
    AuthUser(user_id): AuthUser,
    State(db_pool): State<SqlitePool>,
    Path(interaction_id): Path<Uuid>,
    Query(HistoryQuery { page, limit }): Query<HistoryQuery>,
) -> AppResult<Json<Value>> {
    let Some(interaction) = interactions::fetch(&db_pool, interaction_id).await? else {
        return Err(AppError::NotFound("Interaction not found".to_owned()));
    };
    if !interaction.is_participant(user_id) {
        return Err(AppError::Authorization(
            "Not authorized to view these messages".to_owned(),
        ));
    }

    let page = page.unwrap_or(1).max(1);
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

    let (messages, total) = history(&db_pool, interaction_id, page, limit).await?;
    let total_pages = total.div_ceil(limit as u64);

    Ok(Json(json!({
        "status": "success",
        "data": messages,
        "pagination": {
            "total": total,
            "page": page,
            "limit": limit,
            "total_pages": total_pages,
        },
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, interactions::Status, skills::seed_user};
    use tokio::sync::mpsc::unbounded_channel;

    async fn matched_pair(pool: &SqlitePool) -> (Uuid, Uuid, Uuid) {
        let a = seed_user(pool, "alice", &[], &[]).await;
        let b = seed_user(pool, "bob", &[], &[]).await;
        let interaction = interactions::request(pool, a, b).await.unwrap();
        interactions::respond(pool, interaction.id, b, Status::Matched).await.unwrap();
        (a, b, interaction.id)
    }

    #[tokio::test]
    async fn blank_content_is_rejected() {
        let pool = db::memory_pool().await;
        let realtime = RealtimeState::new();
        let (a, _, room) = matched_pair(&pool).await;

        let err = send_message(&pool, &realtime, a, room, "   \n ".to_owned()).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn oversized_content_is_rejected() {
        let pool = db::memory_pool().await;
        let realtime = RealtimeState::new();
        let (a, _, room) = matched_pair(&pool).await;

        let err = send_message(&pool, &realtime, a, room, "x".repeat(MAX_CONTENT_CHARS + 1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn outsider_cannot_send() {
        let pool = db::memory_pool().await;
        let realtime = RealtimeState::new();
        let (_, _, room) = matched_pair(&pool).await;
        let outsider = seed_user(&pool, "carol", &[], &[]).await;

        let err = send_message(&pool, &realtime, outsider, room, "hi".to_owned()).await.unwrap_err();
        assert!(matches!(err, AppError::Authorization(_)));
    }

    #[tokio::test]
    async fn pending_room_refuses_messages() {
        let pool = db::memory_pool().await;
        let realtime = RealtimeState::new();
        let a = seed_user(&pool, "alice", &[], &[]).await;
        let b = seed_user(&pool, "bob", &[], &[]).await;
        let interaction = interactions::request(&pool, a, b).await.unwrap();

        let err = send_message(&pool, &realtime, a, interaction.id, "hi".to_owned()).await.unwrap_err();
        assert!(matches!(err, AppError::Authorization(_)));
    }

    #[tokio::test]
    async fn send_persists_touches_and_fans_out_to_all_members() {
        let pool = db::memory_pool().await;
        let realtime = RealtimeState::new();
        let (a, b, room) = matched_pair(&pool).await;

        // Two tabs for the sender plus the peer; everyone gets the
        // canonical copy, sender included.
        let (tx_a1, mut rx_a1) = unbounded_channel();
        let (tx_a2, mut rx_a2) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();
        realtime.rooms.join(room, Uuid::now_v7(), a, tx_a1);
        realtime.rooms.join(room, Uuid::now_v7(), a, tx_a2);
        realtime.rooms.join(room, Uuid::now_v7(), b, tx_b);

        let before = interactions::fetch(&pool, room).await.unwrap().unwrap().last_message_at;
        let sent = send_message(&pool, &realtime, a, room, "  hello  ".to_owned()).await.unwrap();
        assert_eq!(sent.content, "hello");

        for rx in [&mut rx_a1, &mut rx_a2, &mut rx_b] {
            match rx.try_recv().unwrap() {
                ServerEvent::MessageReceived(msg) => assert_eq!(msg.id, sent.id),
                other => panic!("unexpected event: {other:?}"),
            }
        }

        let after = interactions::fetch(&pool, room).await.unwrap().unwrap().last_message_at;
        assert!(after >= before);

        let (stored, total) = history(&pool, room, 1, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(stored[0].content, "hello");
    }

    #[tokio::test]
    async fn late_joiners_get_no_backfill() {
        let pool = db::memory_pool().await;
        let realtime = RealtimeState::new();
        let (a, b, room) = matched_pair(&pool).await;

        send_message(&pool, &realtime, a, room, "early".to_owned()).await.unwrap();

        let (tx_b, mut rx_b) = unbounded_channel();
        realtime.rooms.join(room, Uuid::now_v7(), b, tx_b);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn history_pages_stay_chronological() {
        let pool = db::memory_pool().await;
        let realtime = RealtimeState::new();
        let (a, b, room) = matched_pair(&pool).await;

        for n in 1..=5 {
            let sender = if n % 2 == 0 { b } else { a };
            send_message(&pool, &realtime, sender, room, format!("m{n}")).await.unwrap();
        }

        let (newest, total) = history(&pool, room, 1, 2).await.unwrap();
        assert_eq!(total, 5);
        let contents: Vec<&str> = newest.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m4", "m5"]);

        let (older, _) = history(&pool, room, 2, 2).await.unwrap();
        let contents: Vec<&str> = older.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3"]);

        let (oldest, _) = history(&pool, room, 3, 2).await.unwrap();
        let contents: Vec<&str> = oldest.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m1"]);
    }
}
