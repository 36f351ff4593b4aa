/// Shared types for the negotiation layer
use crate::chat::ConnectionState;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend ids arrive as JSON strings or integers depending on the endpoint
#[doc(hidden)]
#[derive(Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Text(String),
    Number(i64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Text(s) => s,
            RawId::Number(n) => n.to_string(),
        }
    }
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(from = "RawId")]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<RawId> for $name {
            fn from(raw: RawId) -> Self {
                Self(raw.into_string())
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_type!(
    /// Backend user id
    UserId
);
id_type!(
    /// Negotiation request id
    RequestId
);
id_type!(
    /// Chat id; assigned by the server when a request is accepted
    SessionId
);
id_type!(
    /// Listed book id
    ItemId
);

/// A party to a negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: UserId,
    /// Handle used by the chat channel and as message sender
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

impl UserRef {
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if full.is_empty() {
            self.username.clone()
        } else {
            format!("{} ({})", full, self.username)
        }
    }
}

/// The book a negotiation is about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRef {
    pub id: ItemId,
    pub title: String,
    #[serde(default)]
    pub author: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Accepted => "accepted",
            RequestStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// A proposal to exchange a book; never deleted, only status-transitioned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationRequest {
    pub id: RequestId,
    pub requester: UserRef,
    pub recipient: UserRef,
    pub item: ItemRef,
    #[serde(default)]
    pub message: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    /// Chat created by the server on acceptance
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

/// Body of a new negotiation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDraft {
    #[serde(rename = "requester_id")]
    pub requester: UserId,
    #[serde(rename = "recipient_id")]
    pub recipient: UserId,
    #[serde(rename = "item_id")]
    pub item: ItemId,
    pub message: String,
}

/// Dedup identity of a message: there is no server-assigned message id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub sender: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

/// One chat line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub session_id: SessionId,
    pub sender: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Build a locally originated message stamped now.
    ///
    /// Millisecond precision so the timestamp survives the server echo intact.
    pub fn local(session_id: SessionId, sender: &str, content: &str) -> Self {
        Self {
            session_id,
            sender: sender.to_string(),
            content: content.to_string(),
            sent_at: Utc::now().trunc_subsecs(3),
        }
    }

    pub fn key(&self) -> MessageKey {
        MessageKey {
            sender: self.sender.clone(),
            content: self.content.clone(),
            sent_at: self.sent_at,
        }
    }
}

/// Lifecycle of an accepted negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Open,
    CompletionPending,
    Completed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionPhase::Open => "open",
            SessionPhase::CompletionPending => "completion_pending",
            SessionPhase::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Server answer to a completion request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionOutcome {
    AlreadyCompleted,
    AwaitingCounterpart,
    Completed,
}

/// Everything needed to render a session, fetched in one go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBootstrap {
    pub session_id: SessionId,
    pub title: String,
    pub participants: Vec<UserRef>,
    /// Handle of the party whose confirmation completes the exchange
    pub completion_authority: String,
    pub phase: SessionPhase,
    pub history: Vec<ChatMessage>,
    pub identity: UserRef,
}

/// One finished or attempted exchange in a user's trade history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub id: RequestId,
    pub requester: String,
    pub recipient: String,
    pub item: String,
    pub date: DateTime<Utc>,
    pub status: String,
    #[serde(default)]
    pub rating: Option<u8>,
    #[serde(default)]
    pub score: i32,
}

/// Notifications for the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// The timeline of a session changed; re-read it
    TimelineUpdated { session_id: SessionId },
    /// A session moved through the completion handshake
    PhaseChanged {
        session_id: SessionId,
        phase: SessionPhase,
    },
    /// The chat channel of a session changed state
    ConnectionChanged {
        session_id: SessionId,
        state: ConnectionState,
    },
    /// A local send could not be transmitted
    SendFailed { session_id: SessionId, reason: String },
    /// Sent/received requests changed
    InboxUpdated,
    /// Non-blocking notice for the user
    Notice {
        session_id: Option<SessionId>,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_accept_numbers_and_strings() {
        let user: UserRef =
            serde_json::from_str(r#"{"id": 17, "username": "ana", "first_name": "Ana"}"#).unwrap();
        assert_eq!(user.id, UserId::new("17"));

        let id: SessionId = serde_json::from_str(r#""chat-9""#).unwrap();
        assert_eq!(id.as_str(), "chat-9");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""chat-9""#);
    }

    #[test]
    fn test_display_name() {
        let user = UserRef {
            id: UserId::new("1"),
            username: "bia".to_string(),
            first_name: "Beatriz".to_string(),
            last_name: "Lima".to_string(),
        };
        assert_eq!(user.display_name(), "Beatriz Lima (bia)");

        let bare = UserRef {
            first_name: String::new(),
            last_name: String::new(),
            ..user
        };
        assert_eq!(bare.display_name(), "bia");
    }

    #[test]
    fn test_local_message_has_millisecond_precision() {
        let msg = ChatMessage::local(SessionId::new("1"), "ana", "Hello");
        assert_eq!(msg.sent_at.timestamp_subsec_nanos() % 1_000_000, 0);
        assert_eq!(msg.key().content, "Hello");
    }

    #[test]
    fn test_completion_outcome_wire_names() {
        let outcome: CompletionOutcome = serde_json::from_str(r#""awaiting-counterpart""#).unwrap();
        assert_eq!(outcome, CompletionOutcome::AwaitingCounterpart);
    }

    #[test]
    fn test_event_is_tagged() {
        let event = ClientEvent::PhaseChanged {
            session_id: SessionId::new("4"),
            phase: SessionPhase::Completed,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "phase_changed");
        assert_eq!(json["phase"], "completed");
    }
}
