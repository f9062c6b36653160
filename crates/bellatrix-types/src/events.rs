use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::ChatMessage;

/// Events sent FROM server TO client over the gateway.
///
/// Frames are `{"type": "<event name>", "data": <payload>}`; the event names
/// are the ones the web client listens for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms the authenticated identity of this connection
    #[serde(rename = "ready")]
    Ready {
        username: String,
        #[serde(rename = "coupleId")]
        couple_id: i64,
    },

    /// Most recent messages of the room, oldest first
    #[serde(rename = "chat history")]
    ChatHistory(Vec<ChatMessage>),

    /// A message was persisted and fanned out to the room
    #[serde(rename = "chat message")]
    ChatMessage(ChatMessage),

    /// A page of messages older than the requested cursor, oldest first
    #[serde(rename = "older messages loaded")]
    OlderMessagesLoaded(Vec<ChatMessage>),

    /// Someone else in the room started typing
    #[serde(rename = "user typing")]
    UserTyping { sender: String },

    /// Someone else in the room stopped typing
    #[serde(rename = "user stop typing")]
    UserStopTyping,

    /// A command from this connection was rejected
    #[serde(rename = "error")]
    Error { command: String, message: String },
}

impl GatewayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::ChatHistory(_) => "chat history",
            Self::ChatMessage(_) => "chat message",
            Self::OlderMessagesLoaded(_) => "older messages loaded",
            Self::UserTyping { .. } => "user typing",
            Self::UserStopTyping => "user stop typing",
            Self::Error { .. } => "error",
        }
    }
}

/// Commands sent FROM client TO server over the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Enter the room of a couple and receive its recent history
    #[serde(rename = "join couple room")]
    JoinCoupleRoom(#[serde(deserialize_with = "flexible_id::deserialize")] i64),

    /// Persist a message and broadcast it to the room
    #[serde(rename = "chat message")]
    ChatMessage(SendChatMessage),

    /// Fetch the page preceding the oldest message the client has rendered
    #[serde(rename = "request older messages")]
    RequestOlderMessages(OlderMessagesRequest),

    #[serde(rename = "typing")]
    Typing(TypingPayload),

    #[serde(rename = "stop typing")]
    StopTyping(StopTypingPayload),
}

impl GatewayCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinCoupleRoom(_) => "join couple room",
            Self::ChatMessage(_) => "chat message",
            Self::RequestOlderMessages(_) => "request older messages",
            Self::Typing(_) => "typing",
            Self::StopTyping(_) => "stop typing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendChatMessage {
    #[serde(rename = "coupleId", deserialize_with = "flexible_id::deserialize")]
    pub couple_id: i64,
    pub sender: String,
    pub text: String,
    /// Client clock at send time. The server clock is used when absent.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OlderMessagesRequest {
    #[serde(rename = "coupleId", deserialize_with = "flexible_id::deserialize")]
    pub couple_id: i64,
    #[serde(rename = "oldestMessageId", deserialize_with = "flexible_id::deserialize")]
    pub oldest_message_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingPayload {
    #[serde(rename = "coupleId", deserialize_with = "flexible_id::deserialize")]
    pub couple_id: i64,
    pub sender: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopTypingPayload {
    #[serde(rename = "coupleId", deserialize_with = "flexible_id::deserialize")]
    pub couple_id: i64,
}

/// Ids arrive either as JSON numbers or as numeric strings (the web client
/// keeps the couple id from login in local storage as text).
mod flexible_id {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(i64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<i64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawId::deserialize(deserializer)? {
            RawId::Number(n) => Ok(n),
            RawId::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| D::Error::custom(format!("invalid id: {:?}", s))),
        }
    }
}
