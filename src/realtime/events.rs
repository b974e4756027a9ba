use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::messages::MessageView;

/// Inbound events, one per frame: `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinRoom { interaction_id: Uuid },
    SendMessage { interaction_id: Uuid, content: String },
    Typing { interaction_id: Uuid },
    StopTyping { interaction_id: Uuid },
}

/// Outbound events, same envelope as [`ClientEvent`].
///
/// `error` is non-fatal: the connection that caused it stays open.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageReceived(MessageView),
    UserTyping { user_id: Uuid, interaction_id: Uuid },
    UserStoppedTyping { user_id: Uuid, interaction_id: Uuid },
    UserOnline { user_id: Uuid },
    UserOffline { user_id: Uuid },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_events_parse_from_tagged_json() {
        let interaction_id = Uuid::now_v7();
        let raw = format!(
            r#"{{"event":"send_message","data":{{"interaction_id":"{interaction_id}","content":"hi"}}}}"#
        );

        let event: ClientEvent = serde_json::from_str(&raw).unwrap();
        match event {
            ClientEvent::SendMessage { interaction_id: id, content } => {
                assert_eq!(id, interaction_id);
                assert_eq!(content, "hi");
            }
            other => panic!("parsed wrong event: {other:?}"),
        }

        let raw = format!(r#"{{"event":"typing","data":{{"interaction_id":"{interaction_id}"}}}}"#);
        assert!(matches!(
            serde_json::from_str::<ClientEvent>(&raw).unwrap(),
            ClientEvent::Typing { .. }
        ));
    }

    #[test]
    fn unknown_event_is_an_error() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"shrug","data":{}}"#).is_err());
    }

    #[test]
    fn server_events_use_snake_case_tags() {
        let user_id = Uuid::now_v7();
        let json = serde_json::to_value(ServerEvent::UserOnline { user_id }).unwrap();
        assert_eq!(json["event"], "user_online");
        assert_eq!(json["data"]["user_id"], user_id.to_string());

        let interaction_id = Uuid::now_v7();
        let json = serde_json::to_value(ServerEvent::UserStoppedTyping { user_id, interaction_id }).unwrap();
        assert_eq!(json["event"], "user_stopped_typing");
    }
}
