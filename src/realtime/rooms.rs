use std::{collections::HashMap, sync::Mutex};

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use super::events::ServerEvent;

pub type ConnId = Uuid;

#[derive(Debug, Clone)]
struct Member {
    user_id: Uuid,
    tx: UnboundedSender<ServerEvent>,
}

/// Explicit room membership: interaction id → live connections.
///
/// Authorization happens against the interaction store before `join`; this
/// struct only tracks who is currently wired up. Stale members are harmless
/// and get pruned on the next failed send or on disconnect.
#[derive(Debug, Default)]
pub struct RoomRouter {
    rooms: Mutex<HashMap<Uuid, HashMap<ConnId, Member>>>,
}

impl RoomRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(
        &self,
        interaction_id: Uuid,
        conn_id: ConnId,
        user_id: Uuid,
        tx: UnboundedSender<ServerEvent>,
    ) {
        let mut rooms = self.rooms.lock().unwrap();
        rooms
            .entry(interaction_id)
            .or_default()
            .insert(conn_id, Member { user_id, tx });
    }

    pub fn leave(&self, interaction_id: Uuid, conn_id: ConnId) {
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(members) = rooms.get_mut(&interaction_id) {
            members.remove(&conn_id);
            if members.is_empty() {
                rooms.remove(&interaction_id);
            }
        }
    }

    /// Evict a dead connection from every room it joined.
    pub fn remove_conn(&self, conn_id: ConnId) {
        let mut rooms = self.rooms.lock().unwrap();
        rooms.retain(|_, members| {
            members.remove(&conn_id);
            !members.is_empty()
        });
    }

    pub fn contains(&self, interaction_id: Uuid, conn_id: ConnId) -> bool {
        self.rooms
            .lock()
            .unwrap()
            .get(&interaction_id)
            .is_some_and(|members| members.contains_key(&conn_id))
    }

    /// Deliver an event to every member of the room.
    ///
    /// Membership is snapshotted under the lock and sends happen outside it,
    /// so broadcast never blocks join/leave. `exclude` suppresses the echo
    /// back to one connection (used for typing signals). Members whose
    /// channel is gone are pruned.
    pub fn broadcast(&self, interaction_id: Uuid, event: &ServerEvent, exclude: Option<ConnId>) {
        let members: Vec<(ConnId, Member)> = {
            let rooms = self.rooms.lock().unwrap();
            let Some(members) = rooms.get(&interaction_id) else {
                return;
            };
            members.iter().map(|(id, m)| (*id, m.clone())).collect()
        };

        let mut dead = Vec::new();
        for (conn_id, member) in members {
            if Some(conn_id) == exclude {
                continue;
            }
            if member.tx.send(event.clone()).is_err() {
                tracing::debug!(%conn_id, user_id = %member.user_id, "pruning dead room member");
                dead.push(conn_id);
            }
        }

        for conn_id in dead {
            self.leave(interaction_id, conn_id);
        }
    }
}
