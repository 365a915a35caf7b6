use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::models::{Message, ReactionEntry, SenderProfile};

/// A fan-out channel. Rendered as `conversation-{id}` or `user-{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Events scoped to the members of one conversation.
    Conversation(Uuid),
    /// Cross-conversation notifications for one identity.
    User(Uuid),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversation(id) => write!(f, "conversation-{id}"),
            Self::User(id) => write!(f, "user-{id}"),
        }
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(id) = s.strip_prefix("conversation-") {
            let id = id.parse().map_err(|e| format!("bad conversation channel '{s}': {e}"))?;
            Ok(Self::Conversation(id))
        } else if let Some(id) = s.strip_prefix("user-") {
            let id = id.parse().map_err(|e| format!("bad user channel '{s}': {e}"))?;
            Ok(Self::User(id))
        } else {
            Err(format!("unknown channel: {s}"))
        }
    }
}

impl Serialize for Channel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Events published through the fan-out broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ChannelEvent {
    // -- conversation channel --
    NewMessage {
        message: Message,
        sender: SenderProfile,
    },

    ReactionAdded {
        message_id: Uuid,
        reaction: ReactionEntry,
    },

    ReactionRemoved {
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    },

    MessageEdited {
        message_id: Uuid,
        message: Message,
    },

    MessageDeleted {
        message_id: Uuid,
    },

    /// Ephemeral; never persisted.
    Typing {
        user_id: Uuid,
        user_name: String,
        is_typing: bool,
    },

    MessageRead {
        message_id: Uuid,
        user_id: Uuid,
        read_at: DateTime<Utc>,
    },

    // -- user channel --
    NewConversation {
        conversation_id: Uuid,
    },

    ConversationUpdated {
        conversation_id: Uuid,
        last_message: Option<Message>,
    },

    UnreadCountUpdated {
        conversation_id: Uuid,
        unread_count: u32,
    },

    MemberRemoved {
        conversation_id: Uuid,
        user_id: Uuid,
    },
}

impl ChannelEvent {
    /// Wire name of the event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new-message",
            Self::ReactionAdded { .. } => "reaction-added",
            Self::ReactionRemoved { .. } => "reaction-removed",
            Self::MessageEdited { .. } => "message-edited",
            Self::MessageDeleted { .. } => "message-deleted",
            Self::Typing { .. } => "typing",
            Self::MessageRead { .. } => "message-read",
            Self::NewConversation { .. } => "new-conversation",
            Self::ConversationUpdated { .. } => "conversation-updated",
            Self::UnreadCountUpdated { .. } => "unread-count-updated",
            Self::MemberRemoved { .. } => "member-removed",
        }
    }
}

/// An event together with the channel it was published on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: Channel,
    pub event: ChannelEvent,
}

/// Commands sent FROM client TO server over the gateway WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum GatewayCommand {
    /// Start receiving events for these conversations. Only conversations the
    /// user participates in are granted.
    Subscribe { conversation_ids: Vec<Uuid> },

    Unsubscribe { conversation_ids: Vec<Uuid> },

    Typing { conversation_id: Uuid, is_typing: bool },
}

/// Frames sent FROM server TO client over the gateway WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum GatewayFrame {
    /// Connection accepted; the personal channel is already subscribed.
    Ready { user_id: Uuid },

    Event(Envelope),

    SubscribeDenied { conversation_ids: Vec<Uuid> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names() {
        let id: Uuid = "7d3b8a4e-52a1-4b8e-9c44-0c2f8f1e6a10".parse().unwrap();
        assert_eq!(
            Channel::Conversation(id).to_string(),
            "conversation-7d3b8a4e-52a1-4b8e-9c44-0c2f8f1e6a10"
        );
        assert_eq!(Channel::User(id).to_string(), "user-7d3b8a4e-52a1-4b8e-9c44-0c2f8f1e6a10");
        assert_eq!("user-7d3b8a4e-52a1-4b8e-9c44-0c2f8f1e6a10".parse::<Channel>().unwrap(), Channel::User(id));
        assert!("room-7d3b8a4e-52a1-4b8e-9c44-0c2f8f1e6a10".parse::<Channel>().is_err());
        assert!("user-nope".parse::<Channel>().is_err());
    }

    #[test]
    fn event_wire_shape() {
        let message_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let event = ChannelEvent::ReactionRemoved {
            message_id,
            user_id,
            emoji: "👍".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "reaction-removed",
                "data": { "messageId": message_id, "userId": user_id, "emoji": "👍" }
            })
        );
        assert_eq!(event.name(), "reaction-removed");
    }

    #[test]
    fn envelope_carries_channel_string() {
        let conversation_id = Uuid::new_v4();
        let envelope = Envelope {
            channel: Channel::Conversation(conversation_id),
            event: ChannelEvent::MessageDeleted { message_id: Uuid::new_v4() },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["channel"], format!("conversation-{conversation_id}"));
        assert_eq!(json["event"]["type"], "message-deleted");

        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn typing_command_from_client_json() {
        let conversation_id = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"typing","data":{{"conversationId":"{conversation_id}","isTyping":true}}}}"#
        );
        let cmd: GatewayCommand = serde_json::from_str(&raw).unwrap();
        assert_eq!(cmd, GatewayCommand::Typing { conversation_id, is_typing: true });
    }
}
