/// Shared types for the Messenger layer: ids, directory entries, conversations,
/// messages and the push channel payloads
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Server-assigned user id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Server-assigned conversation id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user as returned by login and by the identity directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: UserId,
    pub username: String,
}

/// One two-party conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub user_a: UserId,
    pub user_b: UserId,
}

impl Conversation {
    /// Whether `me` is one of the two participants
    pub fn involves(&self, me: UserId) -> bool {
        self.user_a == me || self.user_b == me
    }

    /// The participant that is not `me`, if `me` takes part at all
    pub fn peer_of(&self, me: UserId) -> Option<UserId> {
        if self.user_a == me {
            Some(self.user_b)
        } else if self.user_b == me {
            Some(self.user_a)
        } else {
            None
        }
    }
}

/// Where a message in the view came from. Never on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Provenance {
    /// Returned by a history fetch
    #[default]
    Confirmed,
    /// Rendered locally right after a send, not yet seen in a fetch
    Optimistic { local_id: Uuid },
}

/// A chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// None only for an optimistic first message to a brand new peer
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    pub sender_id: UserId,
    pub content: String,
    pub timestamp: NaiveDateTime,
    #[serde(skip)]
    pub provenance: Provenance,
}

impl Message {
    /// Build the locally rendered copy of a message we just pushed
    pub fn optimistic(
        conversation_id: Option<ConversationId>,
        sender_id: UserId,
        content: String,
    ) -> Self {
        Self {
            id: None,
            conversation_id,
            sender_id,
            content,
            timestamp: chrono::Utc::now().naive_utc(),
            provenance: Provenance::Optimistic {
                local_id: Uuid::new_v4(),
            },
        }
    }

    pub fn is_optimistic(&self) -> bool {
        matches!(self.provenance, Provenance::Optimistic { .. })
    }
}

/// New-activity notification received over the push channel.
/// Only `conversation_id` is relied upon; the rest is informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub sender_id: Option<UserId>,
    #[serde(default)]
    pub content: Option<String>,
    /// Server clock, as text; its format differs from the history endpoint
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Send command pushed over the channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendCommand {
    pub to: UserId,
    /// `null` asks the server to create or locate the conversation
    pub conversation_id: Option<ConversationId>,
    pub content: String,
}

impl SendCommand {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl InboundEvent {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_row_parses_server_timestamp() {
        let raw = r#"[{"id":3,"conversation_id":7,"sender_id":1,"content":"Hi","timestamp":"2024-05-01T10:00:00.123456"}]"#;
        let msgs: Vec<Message> = serde_json::from_str(raw).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].conversation_id, Some(ConversationId(7)));
        assert_eq!(msgs[0].sender_id, UserId(1));
        assert_eq!(msgs[0].provenance, Provenance::Confirmed);
        assert_eq!(msgs[0].timestamp.to_string(), "2024-05-01 10:00:00.123456");
    }

    #[test]
    fn test_send_command_keeps_null_conversation() {
        let cmd = SendCommand {
            to: UserId(2),
            conversation_id: None,
            content: "Hi".to_string(),
        };
        let value: serde_json::Value = serde_json::from_str(&cmd.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"to": 2, "conversation_id": null, "content": "Hi"})
        );
    }

    #[test]
    fn test_inbound_event_tolerates_missing_fields() {
        let full = InboundEvent::from_json(
            r#"{"conversation_id":9,"sender_id":2,"content":"yo","timestamp":"2024-05-01 10:00:00"}"#,
        )
        .unwrap();
        assert_eq!(full.conversation_id, ConversationId(9));
        assert_eq!(full.sender_id, Some(UserId(2)));

        let bare = InboundEvent::from_json(r#"{"conversation_id":9}"#).unwrap();
        assert_eq!(bare.sender_id, None);
        assert!(InboundEvent::from_json(r#"{"sender_id":2}"#).is_err());
    }

    #[test]
    fn test_peer_of() {
        let conv = Conversation {
            id: ConversationId(1),
            user_a: UserId(1),
            user_b: UserId(2),
        };
        assert_eq!(conv.peer_of(UserId(1)), Some(UserId(2)));
        assert_eq!(conv.peer_of(UserId(2)), Some(UserId(1)));
        assert_eq!(conv.peer_of(UserId(3)), None);
        assert!(!conv.involves(UserId(3)));
    }

    #[test]
    fn test_optimistic_message_is_marked() {
        let msg = Message::optimistic(None, UserId(1), "Hi".to_string());
        assert!(msg.is_optimistic());
        assert_eq!(msg.id, None);
    }
}
