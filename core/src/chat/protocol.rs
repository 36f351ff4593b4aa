/// Wire format of the chat channel
///
/// Inbound frames are validated against a fixed schema before anything
/// downstream sees them; a frame that fails validation is dropped.
use crate::error::{Result, SwapError};
use crate::negotiation_types::{ChatMessage, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on a single chat line
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Frame as the server sends it
#[derive(Debug, Clone, Deserialize)]
struct RawInboundFrame {
    #[serde(default, alias = "chatId")]
    chat: Option<SessionId>,
    message: String,
    #[serde(alias = "sender_username")]
    sender: String,
    time: DateTime<Utc>,
}

/// Frame as the client sends it; mirrors the inbound shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub chat: SessionId,
    pub message: String,
    pub sender: String,
    pub time: DateTime<Utc>,
}

impl From<&ChatMessage> for OutboundFrame {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            chat: msg.session_id.clone(),
            message: msg.content.clone(),
            sender: msg.sender.clone(),
            time: msg.sent_at,
        }
    }
}

impl OutboundFrame {
    pub fn to_text(&self) -> Result<String> {
        serde_json::to_string(self).map_err(SwapError::Serialization)
    }
}

/// Result of decoding one text frame for a given session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// A chat line for this session
    Message(ChatMessage),
    /// Well-formed, but addressed to another chat
    OtherSession(SessionId),
}

impl fmt::Display for InboundFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundFrame::Message(m) => write!(f, "Message(from {})", m.sender),
            InboundFrame::OtherSession(id) => write!(f, "OtherSession({})", id),
        }
    }
}

/// Decode and validate a text frame received on `session`'s channel.
///
/// Frames without a chat id belong to the channel's own session.
pub fn decode_inbound(text: &str, session: &SessionId) -> Result<InboundFrame> {
    let raw: RawInboundFrame = serde_json::from_str(text)
        .map_err(|e| SwapError::Protocol(format!("Invalid frame: {}", e)))?;

    if let Some(chat) = raw.chat.as_ref() {
        if chat != session {
            return Ok(InboundFrame::OtherSession(chat.clone()));
        }
    }

    validate_fields(&raw.sender, &raw.message)?;

    Ok(InboundFrame::Message(ChatMessage {
        session_id: session.clone(),
        sender: raw.sender,
        content: raw.message,
        sent_at: raw.time,
    }))
}

/// Decode one entry of a session's message history
pub fn decode_history_entry(value: serde_json::Value, session: &SessionId) -> Result<ChatMessage> {
    let raw: RawInboundFrame = serde_json::from_value(value)
        .map_err(|e| SwapError::Protocol(format!("Invalid history entry: {}", e)))?;
    validate_fields(&raw.sender, &raw.message)?;
    Ok(ChatMessage {
        session_id: session.clone(),
        sender: raw.sender,
        content: raw.message,
        sent_at: raw.time,
    })
}

/// Check a line the user is about to send
pub fn validate_outgoing(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(SwapError::Protocol("Message is empty".to_string()));
    }
    if text.len() > MAX_MESSAGE_LEN {
        return Err(SwapError::Protocol(format!(
            "Message exceeds {} bytes",
            MAX_MESSAGE_LEN
        )));
    }
    Ok(())
}

fn validate_fields(sender: &str, message: &str) -> Result<()> {
    if sender.trim().is_empty() {
        return Err(SwapError::Protocol("Frame has empty sender".to_string()));
    }
    if message.is_empty() {
        return Err(SwapError::Protocol("Frame has empty message".to_string()));
    }
    if message.len() > MAX_MESSAGE_LEN {
        return Err(SwapError::Protocol("Frame message too long".to_string()));
    }
    Ok(())
}
