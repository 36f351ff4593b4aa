/// Error types for the negotiation client core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SwapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid transition: cannot {action} {entity} in state {from}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        action: &'static str,
    },

    #[error("Only the designated receiver may complete session {session_id}")]
    NotCompletionAuthority { session_id: String },

    #[error("Cannot negotiate for your own item")]
    SelfNegotiation,

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Unknown request: {0}")]
    UnknownRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SwapError {
    /// Failures the user may retry by an explicit action (refresh, re-open)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwapError::Io(_)
                | SwapError::Network(_)
                | SwapError::Connection(_)
                | SwapError::Timeout(_)
        )
    }

    /// Rejected state-machine transitions, as opposed to transport failures
    pub fn is_state_violation(&self) -> bool {
        matches!(
            self,
            SwapError::InvalidTransition { .. }
                | SwapError::NotCompletionAuthority { .. }
                | SwapError::SelfNegotiation
        )
    }
}

impl From<reqwest::Error> for SwapError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SwapError::Timeout(e.to_string())
        } else if e.is_decode() {
            SwapError::Protocol(format!("Invalid response body: {}", e))
        } else {
            SwapError::Network(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, SwapError>;
