/// Negotiation lifecycle: request response and the completion handshake
///
/// Request: pending -> accepted | rejected (both terminal for the request).
/// Session: Open -> CompletionPending -> Completed (terminal).
///
/// The completion-authority check here only gates the local affordance;
/// the backend makes the binding decision.
use crate::chat::protocol::validate_outgoing;
use crate::error::{Result, SwapError};
use crate::negotiation_types::{
    ChatMessage, CompletionOutcome, ItemRef, NegotiationRequest, RequestDraft, RequestId,
    RequestStatus, SessionBootstrap, SessionId, SessionPhase, UserId, UserRef,
};
use crate::timeline::{Reconciled, Timeline};
use chrono::Utc;
use tracing::{debug, info};

impl RequestDraft {
    /// Build the body of a new request; a user cannot request their own item
    pub fn new(requester: &UserId, recipient: &UserId, item: &ItemRef, message: &str) -> Result<Self> {
        if requester == recipient {
            return Err(SwapError::SelfNegotiation);
        }
        Ok(Self {
            requester: requester.clone(),
            recipient: recipient.clone(),
            item: item.id.clone(),
            message: message.trim().to_string(),
        })
    }
}

impl NegotiationRequest {
    /// A fresh request in `pending`
    pub fn new(
        id: RequestId,
        requester: UserRef,
        recipient: UserRef,
        item: ItemRef,
        message: &str,
    ) -> Result<Self> {
        if requester.id == recipient.id {
            return Err(SwapError::SelfNegotiation);
        }
        Ok(Self {
            id,
            requester,
            recipient,
            item,
            message: message.to_string(),
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            session_id: None,
        })
    }

    /// Check that `actor` may decide this request now
    pub fn check_respond(&self, actor: &UserId) -> Result<()> {
        if self.status != RequestStatus::Pending {
            return Err(SwapError::InvalidTransition {
                entity: "request",
                from: self.status.to_string(),
                action: "respond to",
            });
        }
        if &self.recipient.id != actor {
            return Err(SwapError::Forbidden(format!(
                "only the recipient may respond to request {}",
                self.id
            )));
        }
        Ok(())
    }

    /// Decide the request exactly once
    pub fn respond(&mut self, actor: &UserId, accept: bool) -> Result<RequestStatus> {
        self.check_respond(actor)?;
        self.status = if accept {
            RequestStatus::Accepted
        } else {
            RequestStatus::Rejected
        };
        info!("Request {} {}", self.id, self.status);
        Ok(self.status)
    }

    /// Accepted and the server has created the chat
    pub fn is_chat_ready(&self) -> bool {
        self.status == RequestStatus::Accepted && self.session_id.is_some()
    }
}

/// One accepted negotiation with its timeline
#[derive(Debug, Clone)]
pub struct NegotiationSession {
    id: SessionId,
    title: String,
    participants: [UserRef; 2],
    me: UserRef,
    completion_authority: String,
    phase: SessionPhase,
    /// Phase to restore if an in-flight completion request fails
    completion_in_flight: Option<SessionPhase>,
    timeline: Timeline,
}

impl NegotiationSession {
    /// Validate a bootstrap and build the session from it
    pub fn from_bootstrap(bootstrap: SessionBootstrap) -> Result<Self> {
        let SessionBootstrap {
            session_id,
            title,
            participants,
            completion_authority,
            phase,
            history,
            identity,
        } = bootstrap;

        let participants: [UserRef; 2] = participants.try_into().map_err(|p: Vec<UserRef>| {
            SwapError::Protocol(format!(
                "Session {} has {} participants, expected 2",
                session_id,
                p.len()
            ))
        })?;
        if participants[0].username == participants[1].username {
            return Err(SwapError::Protocol(format!(
                "Session {} lists the same participant twice",
                session_id
            )));
        }
        if !participants.iter().any(|p| p.username == completion_authority) {
            return Err(SwapError::Protocol(format!(
                "Receiver {} is not a participant of session {}",
                completion_authority, session_id
            )));
        }
        if !participants.iter().any(|p| p.username == identity.username) {
            return Err(SwapError::Protocol(format!(
                "User {} is not a participant of session {}",
                identity.username, session_id
            )));
        }

        let timeline = Timeline::from_history(
            history
                .into_iter()
                .filter(|m| m.session_id == session_id),
        );
        debug!(
            "Session {} bootstrapped: {} messages, phase {}",
            session_id,
            timeline.len(),
            phase
        );

        Ok(Self {
            id: session_id,
            title,
            participants,
            me: identity,
            completion_authority,
            phase,
            completion_in_flight: None,
            timeline,
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn participants(&self) -> &[UserRef; 2] {
        &self.participants
    }

    pub fn me(&self) -> &UserRef {
        &self.me
    }

    /// The other party
    pub fn counterpart(&self) -> &UserRef {
        if self.participants[0].username == self.me.username {
            &self.participants[1]
        } else {
            &self.participants[0]
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn completion_authority(&self) -> &str {
        &self.completion_authority
    }

    pub fn is_completion_authority(&self, handle: &str) -> bool {
        self.completion_authority == handle
    }

    /// Whether to offer the "complete exchange" action to the local user
    pub fn can_complete(&self) -> bool {
        self.phase != SessionPhase::Completed
            && self.completion_in_flight.is_none()
            && self.is_completion_authority(&self.me.username)
    }

    /// Stamp a local message and append it optimistically
    pub fn compose(&mut self, text: &str) -> Result<ChatMessage> {
        if self.phase == SessionPhase::Completed {
            return Err(SwapError::InvalidTransition {
                entity: "session",
                from: self.phase.to_string(),
                action: "send a message in",
            });
        }
        validate_outgoing(text)?;
        let message = ChatMessage::local(self.id.clone(), &self.me.username, text);
        self.timeline.append_local(message.clone());
        Ok(message)
    }

    /// Flag a composed message whose transmission failed
    pub fn send_failed(&mut self, message: &ChatMessage) -> bool {
        self.timeline.mark_failed(&message.key())
    }

    /// The channel dropped; sends without an echo did not go through
    pub fn fail_pending_sends(&mut self) -> usize {
        self.timeline.fail_pending()
    }

    /// Merge a message delivered by the channel
    pub fn receive(&mut self, message: ChatMessage) -> Reconciled {
        if message.session_id != self.id {
            debug!(
                "Ignoring message for session {} on session {}",
                message.session_id, self.id
            );
            return Reconciled::Duplicate;
        }
        self.timeline.merge_inbound(message)
    }

    /// Start the completion handshake on behalf of `actor`
    pub fn begin_completion(&mut self, actor: &str) -> Result<()> {
        if self.phase == SessionPhase::Completed {
            return Err(SwapError::InvalidTransition {
                entity: "session",
                from: self.phase.to_string(),
                action: "request completion of",
            });
        }
        if !self.is_completion_authority(actor) {
            return Err(SwapError::NotCompletionAuthority {
                session_id: self.id.to_string(),
            });
        }
        if self.completion_in_flight.is_some() {
            return Err(SwapError::InvalidTransition {
                entity: "session",
                from: "completion in flight".to_string(),
                action: "request completion of",
            });
        }
        self.completion_in_flight = Some(self.phase);
        self.phase = SessionPhase::CompletionPending;
        Ok(())
    }

    /// Apply the backend's answer to the completion request
    pub fn finish_completion(&mut self, outcome: CompletionOutcome) -> SessionPhase {
        self.completion_in_flight = None;
        self.phase = match outcome {
            CompletionOutcome::Completed | CompletionOutcome::AlreadyCompleted => {
                SessionPhase::Completed
            }
            CompletionOutcome::AwaitingCounterpart => SessionPhase::CompletionPending,
        };
        info!("Session {} is now {}", self.id, self.phase);
        self.phase
    }

    /// The completion request did not go through; restore the prior phase
    pub fn abort_completion(&mut self) -> SessionPhase {
        if let Some(previous) = self.completion_in_flight.take() {
            self.phase = previous;
        }
        self.phase
    }

    /// Server-pushed phase (e.g. from a re-bootstrap); never leaves `Completed`
    pub fn sync_phase(&mut self, phase: SessionPhase) -> bool {
        if self.phase == SessionPhase::Completed || self.phase == phase {
            return false;
        }
        self.phase = phase;
        true
    }

    /// Fold a re-fetched history in without disturbing settled entries
    pub fn merge_history(&mut self, history: Vec<ChatMessage>) -> usize {
        history
            .into_iter()
            .map(|m| self.receive(m))
            .filter(|r| r.changed())
            .count()
    }
}
