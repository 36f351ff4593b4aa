/// Request inbox: a user's negotiation requests split into sent and received
use crate::error::{Result, SwapError};
use crate::negotiation_types::{NegotiationRequest, RequestId, RequestStatus, UserId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partitioned {
    pub sent: Vec<NegotiationRequest>,
    pub received: Vec<NegotiationRequest>,
}

/// Split `all` by role of `me`.
///
/// A request where `me` is the requester is `sent`, one where `me` is the
/// recipient is `received`. Requests not involving `me` are dropped.
/// Input order is kept within each side.
pub fn partition(all: Vec<NegotiationRequest>, me: &UserId) -> Partitioned {
    let mut out = Partitioned::default();
    for request in all {
        if &request.requester.id == me {
            out.sent.push(request);
        } else if &request.recipient.id == me {
            out.received.push(request);
        } else {
            warn!("Request {} does not involve user {}, skipping", request.id, me);
        }
    }
    out
}

/// The signed-in user's requests
#[derive(Debug, Clone)]
pub struct RequestInbox {
    me: UserId,
    requests: Partitioned,
}

impl RequestInbox {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            requests: Partitioned::default(),
        }
    }

    pub fn owner(&self) -> &UserId {
        &self.me
    }

    /// Replace the contents with a fresh fetch
    pub fn replace(&mut self, all: Vec<NegotiationRequest>) {
        self.requests = partition(all, &self.me);
        debug!(
            "Inbox: {} sent, {} received",
            self.requests.sent.len(),
            self.requests.received.len()
        );
    }

    /// Insert or update one request (e.g. the server's copy after a response)
    pub fn upsert(&mut self, request: NegotiationRequest) {
        let side = if request.requester.id == self.me {
            &mut self.requests.sent
        } else if request.recipient.id == self.me {
            &mut self.requests.received
        } else {
            warn!("Request {} does not involve user {}, skipping", request.id, self.me);
            return;
        };
        match side.iter_mut().find(|r| r.id == request.id) {
            Some(existing) => *existing = request,
            None => side.push(request),
        }
    }

    pub fn sent(&self) -> &[NegotiationRequest] {
        &self.requests.sent
    }

    pub fn received(&self) -> &[NegotiationRequest] {
        &self.requests.received
    }

    pub fn snapshot(&self) -> Partitioned {
        self.requests.clone()
    }

    pub fn get(&self, id: &RequestId) -> Option<&NegotiationRequest> {
        self.requests
            .sent
            .iter()
            .chain(self.requests.received.iter())
            .find(|r| &r.id == id)
    }

    /// Received requests still waiting for a decision
    pub fn actionable(&self) -> impl Iterator<Item = &NegotiationRequest> {
        self.requests
            .received
            .iter()
            .filter(|r| r.status == RequestStatus::Pending)
    }

    /// Look up a request the owner may respond to right now
    pub fn respondable(&self, id: &RequestId) -> Result<&NegotiationRequest> {
        let request = self
            .get(id)
            .ok_or_else(|| SwapError::UnknownRequest(id.to_string()))?;
        request.check_respond(&self.me)?;
        Ok(request)
    }

    /// Apply a decision locally through the request state machine
    pub fn respond(&mut self, id: &RequestId, accept: bool) -> Result<RequestStatus> {
        let me = self.me.clone();
        let request = self
            .requests
            .received
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| SwapError::UnknownRequest(id.to_string()))?;
        request.respond(&me, accept)
    }

    pub fn len(&self) -> usize {
        self.requests.sent.len() + self.requests.received.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
