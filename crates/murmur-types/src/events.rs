use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceKind {
    Join,
    Leave,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    #[default]
    Add,
    Remove,
}

/// Events sent FROM client TO server over the room socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Typing {
        #[serde(default = "default_typing_state")]
        state: bool,
    },

    Delivered {
        #[serde(default)]
        message_ids: Vec<Uuid>,
    },

    Read {
        #[serde(default)]
        message_ids: Vec<Uuid>,
    },

    Reaction {
        message_id: Uuid,
        emoji: String,
        #[serde(default)]
        action: ReactionAction,
    },

    Message {
        #[serde(default)]
        content: String,
        #[serde(default)]
        parent_id: Option<Uuid>,
        #[serde(default)]
        mentions: Vec<Uuid>,
    },

    Ping,

    /// Any kind this server does not know yet. Newer clients may send these.
    #[serde(other)]
    Unknown,
}

fn default_typing_state() -> bool {
    true
}

/// Events sent FROM server TO the connections of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Presence {
        user_id: Uuid,
        event: PresenceKind,
    },

    Typing {
        user_id: Uuid,
        state: bool,
    },

    Reaction {
        message_id: Uuid,
        emoji: String,
        user_id: Uuid,
        action: ReactionAction,
    },

    /// `id` and `created_at` are always the values assigned by the store.
    Message {
        id: Uuid,
        room_id: Uuid,
        user_id: Uuid,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        mentions: Vec<Uuid>,
        created_at: DateTime<Utc>,
    },

    Pong,

    /// Sent only to the connection whose event failed.
    Error {
        code: String,
        message: String,
    },
}

impl ServerEvent {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_kind_is_not_an_error() {
        let event: ClientEvent = serde_json::from_str(r#"{"type":"poll_vote","option":3}"#).unwrap();
        assert_eq!(event, ClientEvent::Unknown);
    }

    #[test]
    fn client_defaults() {
        let typing: ClientEvent = serde_json::from_str(r#"{"type":"typing"}"#).unwrap();
        assert_eq!(typing, ClientEvent::Typing { state: true });

        let message_id = Uuid::new_v4();
        let reaction: ClientEvent = serde_json::from_value(json!({
            "type": "reaction",
            "message_id": message_id,
            "emoji": "👍",
        }))
        .unwrap();
        assert_eq!(
            reaction,
            ClientEvent::Reaction {
                message_id,
                emoji: "👍".into(),
                action: ReactionAction::Add,
            }
        );

        let receipts: ClientEvent = serde_json::from_str(r#"{"type":"read"}"#).unwrap();
        assert_eq!(receipts, ClientEvent::Read { message_ids: vec![] });
    }

    #[test]
    fn server_events_are_flat_and_tagged() {
        let user_id = Uuid::new_v4();
        let value = serde_json::to_value(ServerEvent::Presence {
            user_id,
            event: PresenceKind::Join,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({ "type": "presence", "user_id": user_id, "event": "join" })
        );

        assert_eq!(serde_json::to_value(ServerEvent::Pong).unwrap(), json!({ "type": "pong" }));
    }

    #[test]
    fn message_event_omits_missing_parent() {
        let value = serde_json::to_value(ServerEvent::Message {
            id: Uuid::new_v4(),
            room_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            content: "hi".into(),
            parent_id: None,
            mentions: vec![],
            created_at: Utc::now(),
        })
        .unwrap();
        assert!(value.get("parent_id").is_none());
        assert!(value.get("mentions").is_none());
        assert_eq!(value["type"], "message");
    }
}
