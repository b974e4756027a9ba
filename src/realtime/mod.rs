pub mod events;
pub mod presence;
pub mod rooms;

use std::{collections::HashMap, sync::{Arc, Mutex}};

use axum::{
    debug_handler,
    extract::{ws::{Message, WebSocket, WebSocketUpgrade}, Query, State},
    http::{header, HeaderMap},
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc::{self, UnboundedSender};
use uuid::Uuid;

use crate::{auth, interactions, messages, AppError, AppResult, AppState};

pub use events::{ClientEvent, ServerEvent};
pub use presence::PresenceRegistry;
pub use rooms::{ConnId, RoomRouter};

/// Shared realtime state: presence counts, room membership, and one personal
/// notification channel per live connection, keyed by user id.
#[derive(Debug, Default)]
pub struct RealtimeState {
    pub presence: PresenceRegistry,
    pub rooms: RoomRouter,
    connections: Mutex<HashMap<Uuid, HashMap<ConnId, UnboundedSender<ServerEvent>>>>,
    send_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl RealtimeState {
    pub fn new() -> Self {
        Self::default()
    }

    fn register_connection(&self, user_id: Uuid, conn_id: ConnId, tx: UnboundedSender<ServerEvent>) {
        self.connections
            .lock()
            .unwrap()
            .entry(user_id)
            .or_default()
            .insert(conn_id, tx);
    }

    fn unregister_connection(&self, user_id: Uuid, conn_id: ConnId) {
        let mut connections = self.connections.lock().unwrap();
        if let Some(conns) = connections.get_mut(&user_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                connections.remove(&user_id);
            }
        }
    }

    /// Deliver an event to every live connection of one user.
    pub fn notify_user(&self, user_id: Uuid, event: &ServerEvent) {
        let targets: Vec<UnboundedSender<ServerEvent>> = {
            let connections = self.connections.lock().unwrap();
            match connections.get(&user_id) {
                Some(conns) => conns.values().cloned().collect(),
                None => return,
            }
        };
        for tx in targets {
            let _ = tx.send(event.clone());
        }
    }

    /// Deliver a presence edge to every connected user except the one who
    /// caused it (their own tabs already know).
    pub fn broadcast_presence(&self, event: &ServerEvent, except_user: Uuid) {
        let targets: Vec<UnboundedSender<ServerEvent>> = {
            let connections = self.connections.lock().unwrap();
            connections
                .iter()
                .filter(|(user_id, _)| **user_id != except_user)
                .flat_map(|(_, conns)| conns.values().cloned())
                .collect()
        };
        for tx in targets {
            let _ = tx.send(event.clone());
        }
    }

    /// Per-room lock held across persist + fanout so broadcast order always
    /// equals insertion order. Rooms are independent of one another.
    pub fn send_lock(&self, interaction_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.send_locks
            .lock()
            .unwrap()
            .entry(interaction_id)
            .or_default()
            .clone()
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(gateway_ws))
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// WebSocket handshake. A missing or invalid token refuses the upgrade;
/// every other failure later on is a non-fatal `error` event.
#[debug_handler(state = AppState)]
async fn gateway_ws(
    State(state): State<AppState>,
    Query(WsQuery { token }): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let header_token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned);

    let token = token
        .or(header_token)
        .ok_or_else(|| AppError::Authentication("Not authorized, no token".to_owned()))?;
    let user_id = auth::verify_token(&state.db_pool, &token).await?;

    Ok(ws.on_upgrade(move |socket| handle_connection(socket, state, user_id)))
}

async fn handle_connection(socket: WebSocket, state: AppState, user_id: Uuid) {
    let conn_id: ConnId = Uuid::now_v7();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    state.realtime.register_connection(user_id, conn_id, tx.clone());
    if state.realtime.presence.connect(user_id) {
        state
            .realtime
            .broadcast_presence(&ServerEvent::UserOnline { user_id }, user_id);
    }
    tracing::info!(%user_id, %conn_id, "realtime connection established");

    let (mut sink, mut stream) = socket.split();
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = stream.next().await {
        let Message::Text(text) = frame else {
            continue;
        };

        let Ok(event) = serde_json::from_str::<ClientEvent>(&text) else {
            let _ = tx.send(ServerEvent::Error {
                message: "Unrecognized event".to_owned(),
            });
            continue;
        };

        if let Err(err) = dispatch(&state, user_id, conn_id, &tx, event).await {
            tracing::warn!(%user_id, %conn_id, error = %err, "realtime event refused");
            let _ = tx.send(ServerEvent::Error {
                message: err.client_message(),
            });
        }
    }

    // Fully evict before other connections can observe the disconnect.
    state.realtime.rooms.remove_conn(conn_id);
    state.realtime.unregister_connection(user_id, conn_id);
    if state.realtime.presence.disconnect(user_id) {
        state
            .realtime
            .broadcast_presence(&ServerEvent::UserOffline { user_id }, user_id);
    }
    send_task.abort();
    tracing::info!(%user_id, %conn_id, "realtime connection closed");
}

async fn dispatch(
    state: &AppState,
    user_id: Uuid,
    conn_id: ConnId,
    tx: &UnboundedSender<ServerEvent>,
    event: ClientEvent,
) -> AppResult<()> {
    match event {
        ClientEvent::JoinRoom { interaction_id } => {
            interactions::authorize_chat(&state.db_pool, interaction_id, user_id).await?;
            state.realtime.rooms.join(interaction_id, conn_id, user_id, tx.clone());
            tracing::debug!(%user_id, %conn_id, %interaction_id, "joined room");
        }
        ClientEvent::SendMessage { interaction_id, content } => {
            messages::send_message(&state.db_pool, &state.realtime, user_id, interaction_id, content)
                .await?;
        }
        ClientEvent::Typing { interaction_id } => {
            relay_typing(state, user_id, conn_id, interaction_id, true)?;
        }
        ClientEvent::StopTyping { interaction_id } => {
            relay_typing(state, user_id, conn_id, interaction_id, false)?;
        }
    }
    Ok(())
}

/// Pure relay, nothing persisted. The sending connection never hears its own
/// typing echo; expiry is the client's concern.
fn relay_typing(
    state: &AppState,
    user_id: Uuid,
    conn_id: ConnId,
    interaction_id: Uuid,
    typing: bool,
) -> AppResult<()> {
    if !state.realtime.rooms.contains(interaction_id, conn_id) {
        return Err(AppError::Authorization(
            "Join the room before signaling".to_owned(),
        ));
    }

    let event = if typing {
        ServerEvent::UserTyping { user_id, interaction_id }
    } else {
        ServerEvent::UserStoppedTyping { user_id, interaction_id }
    };
    state.realtime.rooms.broadcast(interaction_id, &event, Some(conn_id));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_user_reaches_every_tab_of_that_user_only() {
        let state = RealtimeState::new();
        let user = Uuid::now_v7();
        let other = Uuid::now_v7();

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (tx_other, mut rx_other) = mpsc::unbounded_channel();
        state.register_connection(user, Uuid::now_v7(), tx_a);
        state.register_connection(user, Uuid::now_v7(), tx_b);
        state.register_connection(other, Uuid::now_v7(), tx_other);

        state.notify_user(user, &ServerEvent::UserOnline { user_id: user });

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_other.try_recv().is_err());
    }

    #[test]
    fn presence_broadcast_skips_the_causing_user() {
        let state = RealtimeState::new();
        let user = Uuid::now_v7();
        let other = Uuid::now_v7();

        let (tx_user, mut rx_user) = mpsc::unbounded_channel();
        let (tx_other, mut rx_other) = mpsc::unbounded_channel();
        state.register_connection(user, Uuid::now_v7(), tx_user);
        state.register_connection(other, Uuid::now_v7(), tx_other);

        state.broadcast_presence(&ServerEvent::UserOnline { user_id: user }, user);

        assert!(rx_user.try_recv().is_err());
        assert!(rx_other.try_recv().is_ok());
    }

    #[test]
    fn unregister_drops_the_personal_channel() {
        let state = RealtimeState::new();
        let user = Uuid::now_v7();
        let conn = Uuid::now_v7();

        let (tx, mut rx) = mpsc::unbounded_channel();
        state.register_connection(user, conn, tx);
        state.unregister_connection(user, conn);

        state.notify_user(user, &ServerEvent::UserOnline { user_id: user });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_lock_is_shared_per_room() {
        let state = RealtimeState::new();
        let room = Uuid::now_v7();

        let a = state.send_lock(room);
        let b = state.send_lock(room);
        assert!(Arc::ptr_eq(&a, &b));

        let other = state.send_lock(Uuid::now_v7());
        assert!(!Arc::ptr_eq(&a, &other));
    }
}
