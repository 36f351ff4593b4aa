/// Negotiation client: the surface the presentation layer talks to
///
/// Every operation returns an explicit `Result`; nothing here panics across
/// the UI boundary. State changes are announced on a broadcast channel of
/// `ClientEvent`s so views know when to re-read snapshots.
use crate::backend::{Backend, HttpBackend};
use crate::chat::{ChannelEvent, ConnectionManager, ConnectionState, Connector, WsConnector};
use crate::config::Config;
use crate::error::{Result, SwapError};
use crate::inbox::{Partitioned, RequestInbox};
use crate::negotiation_types::{
    ChatMessage, ClientEvent, ExchangeRecord, ItemRef, NegotiationRequest, RequestDraft,
    RequestId, RequestStatus, SessionBootstrap, SessionId, SessionPhase, UserId, UserRef,
};
use crate::session::NegotiationSession;
use crate::timeline::TimelineEntry;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Read-only summary of an open session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub session_id: SessionId,
    pub title: String,
    pub counterpart: UserRef,
    pub completion_authority: String,
    pub phase: SessionPhase,
    pub can_complete: bool,
    pub connection: Option<ConnectionState>,
}

struct SessionSlot {
    session: NegotiationSession,
    /// Cancelled when the session closes; stops its dispatcher
    cancel: CancellationToken,
}

/// A bootstrap or refresh in flight for a session
#[derive(Clone)]
struct PendingFetch {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct NegotiationClient {
    backend: Arc<dyn Backend>,
    connections: ConnectionManager,
    sessions: Arc<RwLock<HashMap<SessionId, SessionSlot>>>,
    pending: Arc<RwLock<HashMap<SessionId, PendingFetch>>>,
    generation: Arc<AtomicU64>,
    inbox: Arc<RwLock<Option<RequestInbox>>>,
    identity: Arc<RwLock<Option<UserRef>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl NegotiationClient {
    /// Client over HTTP and WebSocket as configured
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let backend = Arc::new(HttpBackend::new(config.clone())?);
        let connector = Arc::new(WsConnector::new(config.clone()));
        Ok(Self::with_parts(backend, connector, config))
    }

    /// Client over caller-supplied collaborators
    pub fn with_parts(
        backend: Arc<dyn Backend>,
        connector: Arc<dyn Connector>,
        config: &Config,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            backend,
            connections: ConnectionManager::new(connector, config.connect_timeout),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(RwLock::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            inbox: Arc::new(RwLock::new(None)),
            identity: Arc::new(RwLock::new(None)),
            events,
        }
    }

    /// Subscribe to UI notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // ─── Identity & inbox ────────────────────────────────────────────────────

    /// The authenticated user, fetched once per login
    pub async fn current_user(&self) -> Result<UserRef> {
        if let Some(user) = self.identity.read().await.clone() {
            return Ok(user);
        }
        let user = self.backend.current_user().await?;
        *self.identity.write().await = Some(user.clone());
        Ok(user)
    }

    /// Re-fetch requests and re-partition them
    pub async fn refresh_inbox(&self) -> Result<Partitioned> {
        let me = self.current_user().await?;
        let all = self.backend.list_requests().await?;

        let snapshot = {
            let mut guard = self.inbox.write().await;
            let inbox = guard.get_or_insert_with(|| RequestInbox::new(me.id.clone()));
            if inbox.owner() != &me.id {
                *inbox = RequestInbox::new(me.id.clone());
            }
            inbox.replace(all);
            inbox.snapshot()
        };
        self.emit(ClientEvent::InboxUpdated);
        Ok(snapshot)
    }

    /// Last fetched sent/received split
    pub async fn inbox(&self) -> Partitioned {
        self.inbox
            .read()
            .await
            .as_ref()
            .map(RequestInbox::snapshot)
            .unwrap_or_default()
    }

    /// Propose an exchange of `item` to its owner
    pub async fn create_request(
        &self,
        recipient: &UserId,
        item: &ItemRef,
        message: &str,
    ) -> Result<NegotiationRequest> {
        let me = self.current_user().await?;
        let draft = RequestDraft::new(&me.id, recipient, item, message)?;
        let created = self.backend.create_request(&draft).await?;
        info!("Created request {} for item {}", created.id, item.id);

        self.inbox
            .write()
            .await
            .get_or_insert_with(|| RequestInbox::new(me.id.clone()))
            .upsert(created.clone());
        self.emit(ClientEvent::InboxUpdated);
        Ok(created)
    }

    /// Accept or reject a received request; acceptance opens its session
    pub async fn respond_to_request(
        &self,
        request_id: &RequestId,
        accept: bool,
    ) -> Result<NegotiationRequest> {
        {
            let guard = self.inbox.read().await;
            let inbox = guard
                .as_ref()
                .ok_or_else(|| SwapError::UnknownRequest(request_id.to_string()))?;
            inbox.respondable(request_id)?;
        }

        let updated = self.backend.respond_request(request_id, accept).await?;

        {
            let mut guard = self.inbox.write().await;
            if let Some(inbox) = guard.as_mut() {
                if let Err(e) = inbox.respond(request_id, accept) {
                    debug!("Local response to {} superseded: {}", request_id, e);
                }
                inbox.upsert(updated.clone());
            }
        }
        self.emit(ClientEvent::InboxUpdated);

        if updated.status == RequestStatus::Accepted {
            match updated.session_id.clone() {
                Some(session_id) => {
                    if let Err(e) = self.open_session(&session_id).await {
                        warn!("Accepted request {} but session {} did not open: {}", request_id, session_id, e);
                        self.emit(ClientEvent::Notice {
                            session_id: Some(session_id),
                            message: format!("Chat could not be opened: {}", e),
                        });
                    }
                }
                None => warn!("Request {} accepted without a chat id", request_id),
            }
        }
        Ok(updated)
    }

    pub async fn exchange_history(&self, user: Option<&UserId>) -> Result<Vec<ExchangeRecord>> {
        let user = match user {
            Some(u) => u.clone(),
            None => self.current_user().await?.id,
        };
        self.backend.exchange_history(&user).await
    }

    // ─── Session lifecycle ───────────────────────────────────────────────────

    /// Bootstrap a session and open its channel.
    ///
    /// Returns the existing session if already open. If only the channel
    /// fails, the session stays registered and `reconnect` may be retried.
    pub async fn open_session(&self, session_id: &SessionId) -> Result<SessionView> {
        if self.sessions.read().await.contains_key(session_id) {
            debug!("Session {} already open", session_id);
            if !self.channel_is_live(session_id).await {
                self.connect(session_id).await?;
            }
            return self.view(session_id).await;
        }

        let (bootstrap, fetch) = self.fetch_bootstrap(session_id).await?;
        let session = match NegotiationSession::from_bootstrap(bootstrap) {
            Ok(session) => session,
            Err(e) => {
                self.finish_fetch(session_id, fetch.generation).await;
                return Err(e);
            }
        };

        {
            let mut identity = self.identity.write().await;
            if identity.is_none() {
                *identity = Some(session.me().clone());
            }
        }

        // A close that cancelled the fetch after it resolved still wins
        let inserted = {
            let mut sessions = self.sessions.write().await;
            if fetch.cancel.is_cancelled() {
                drop(sessions);
                self.finish_fetch(session_id, fetch.generation).await;
                debug!("Session {} closed before it was registered", session_id);
                return Err(SwapError::Cancelled(format!(
                    "session {} closed during bootstrap",
                    session_id
                )));
            }
            if sessions.contains_key(session_id) {
                false
            } else {
                sessions.insert(
                    session_id.clone(),
                    SessionSlot {
                        session,
                        cancel: CancellationToken::new(),
                    },
                );
                true
            }
        };
        self.finish_fetch(session_id, fetch.generation).await;
        if inserted {
            info!("Session {} open", session_id);
            self.emit(ClientEvent::TimelineUpdated {
                session_id: session_id.clone(),
            });
        }

        if !self.channel_is_live(session_id).await {
            self.connect(session_id).await?;
        }
        self.view(session_id).await
    }

    /// Catch up on history and re-open a dropped channel (user initiated)
    pub async fn reconnect(&self, session_id: &SessionId) -> Result<SessionView> {
        if !self.sessions.read().await.contains_key(session_id) {
            return Err(SwapError::UnknownSession(session_id.to_string()));
        }

        let (bootstrap, fetch) = self.fetch_bootstrap(session_id).await?;
        {
            let mut sessions = self.sessions.write().await;
            let slot = match sessions.get_mut(session_id) {
                Some(slot) if !fetch.cancel.is_cancelled() => slot,
                _ => {
                    drop(sessions);
                    self.finish_fetch(session_id, fetch.generation).await;
                    return Err(SwapError::Cancelled(format!("session {} closed", session_id)));
                }
            };
            let added = slot.session.merge_history(bootstrap.history);
            let phase_changed = slot.session.sync_phase(bootstrap.phase);
            debug!("Reconnect of {}: {} new messages", session_id, added);
            if phase_changed {
                self.emit(ClientEvent::PhaseChanged {
                    session_id: session_id.clone(),
                    phase: slot.session.phase(),
                });
            }
            if added > 0 {
                self.emit(ClientEvent::TimelineUpdated {
                    session_id: session_id.clone(),
                });
            }
        }
        self.finish_fetch(session_id, fetch.generation).await;

        self.connect(session_id).await?;
        self.view(session_id).await
    }

    /// Tear the session down; cancels its in-flight fetches. Idempotent.
    pub async fn close_session(&self, session_id: &SessionId) -> bool {
        let pending = self.pending.write().await.remove(session_id);
        if let Some(fetch) = &pending {
            fetch.cancel.cancel();
        }

        let slot = self.sessions.write().await.remove(session_id);
        if let Some(slot) = &slot {
            slot.cancel.cancel();
        }

        let had_channel = self.connections.close(session_id).await;
        let closed = pending.is_some() || slot.is_some() || had_channel;
        if closed {
            info!("Session {} closed", session_id);
        }
        closed
    }

    /// Close everything owned by the signed-in user
    pub async fn logout(&self) -> usize {
        for (_, fetch) in self.pending.write().await.drain() {
            fetch.cancel.cancel();
        }
        let slots: Vec<SessionSlot> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in &slots {
            slot.cancel.cancel();
        }
        let drained = self.connections.close_all().await;

        *self.identity.write().await = None;
        *self.inbox.write().await = None;
        self.emit(ClientEvent::InboxUpdated);

        info!("Logged out: {} sessions, {} channels closed", slots.len(), drained);
        slots.len()
    }

    // ─── Messaging & completion ──────────────────────────────────────────────

    /// Append optimistically, then transmit without waiting for the echo
    pub async fn send_message(&self, session_id: &SessionId, text: &str) -> Result<ChatMessage> {
        let message = {
            let mut sessions = self.sessions.write().await;
            let slot = sessions
                .get_mut(session_id)
                .ok_or_else(|| SwapError::UnknownSession(session_id.to_string()))?;
            slot.session.compose(text)?
        };
        self.emit(ClientEvent::TimelineUpdated {
            session_id: session_id.clone(),
        });

        if let Err(e) = self.connections.send(session_id, &message).await {
            warn!("Send on session {} failed: {}", session_id, e);
            if let Some(slot) = self.sessions.write().await.get_mut(session_id) {
                slot.session.send_failed(&message);
            }
            self.emit(ClientEvent::TimelineUpdated {
                session_id: session_id.clone(),
            });
            self.emit(ClientEvent::SendFailed {
                session_id: session_id.clone(),
                reason: e.to_string(),
            });
            return Err(e);
        }
        Ok(message)
    }

    /// Confirm the exchange; only the designated receiver may do this
    pub async fn request_completion(&self, session_id: &SessionId) -> Result<SessionPhase> {
        let begun = {
            let mut sessions = self.sessions.write().await;
            let slot = sessions
                .get_mut(session_id)
                .ok_or_else(|| SwapError::UnknownSession(session_id.to_string()))?;
            let me = slot.session.me().username.clone();
            let authority = slot.session.completion_authority().to_string();
            let begun = slot.session.begin_completion(&me);
            begun.map_err(|e| (e, authority))
        };
        if let Err((e, authority)) = begun {
            if matches!(e, SwapError::NotCompletionAuthority { .. }) {
                self.emit(ClientEvent::Notice {
                    session_id: Some(session_id.clone()),
                    message: format!("Only {} can confirm this exchange", authority),
                });
            }
            return Err(e);
        }
        self.emit(ClientEvent::PhaseChanged {
            session_id: session_id.clone(),
            phase: SessionPhase::CompletionPending,
        });

        let result = self.backend.complete_session(session_id).await;

        let phase = {
            let mut sessions = self.sessions.write().await;
            let slot = sessions.get_mut(session_id).ok_or_else(|| {
                SwapError::Cancelled(format!("session {} closed during completion", session_id))
            })?;
            match result {
                Ok(outcome) => slot.session.finish_completion(outcome),
                Err(e) => {
                    let phase = slot.session.abort_completion();
                    drop(sessions);
                    self.emit(ClientEvent::PhaseChanged {
                        session_id: session_id.clone(),
                        phase,
                    });
                    return Err(e);
                }
            }
        };
        self.emit(ClientEvent::PhaseChanged {
            session_id: session_id.clone(),
            phase,
        });
        Ok(phase)
    }

    // ─── Snapshots ───────────────────────────────────────────────────────────

    pub async fn timeline(&self, session_id: &SessionId) -> Result<Vec<TimelineEntry>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|slot| slot.session.timeline().snapshot())
            .ok_or_else(|| SwapError::UnknownSession(session_id.to_string()))
    }

    pub async fn session_state(&self, session_id: &SessionId) -> Result<SessionPhase> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|slot| slot.session.phase())
            .ok_or_else(|| SwapError::UnknownSession(session_id.to_string()))
    }

    /// UI affordance only; the backend re-checks
    pub async fn can_complete(&self, session_id: &SessionId) -> Result<bool> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|slot| slot.session.can_complete())
            .ok_or_else(|| SwapError::UnknownSession(session_id.to_string()))
    }

    pub async fn connection_state(&self, session_id: &SessionId) -> Option<ConnectionState> {
        self.connections.state(session_id).await
    }

    pub async fn open_sessions(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn view(&self, session_id: &SessionId) -> Result<SessionView> {
        let connection = self.connections.state(session_id).await;
        let sessions = self.sessions.read().await;
        let slot = sessions
            .get(session_id)
            .ok_or_else(|| SwapError::UnknownSession(session_id.to_string()))?;
        let session = &slot.session;
        Ok(SessionView {
            session_id: session.id().clone(),
            title: session.title().to_string(),
            counterpart: session.counterpart().clone(),
            completion_authority: session.completion_authority().to_string(),
            phase: session.phase(),
            can_complete: session.can_complete(),
            connection,
        })
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    async fn channel_is_live(&self, session_id: &SessionId) -> bool {
        matches!(
            self.connections.state(session_id).await,
            Some(state) if !state.is_terminal()
        )
    }

    /// Bootstrap raced against the session's cancellation.
    ///
    /// A result that arrives after the session was closed, or after a newer
    /// fetch for the same session started, is discarded. On success the fetch
    /// stays registered, so a close can still cancel it; the caller releases
    /// it with `finish_fetch` once the result is applied.
    async fn fetch_bootstrap(
        &self,
        session_id: &SessionId,
    ) -> Result<(SessionBootstrap, PendingFetch)> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let fetch = PendingFetch {
            generation,
            cancel: CancellationToken::new(),
        };
        if let Some(previous) = self
            .pending
            .write()
            .await
            .insert(session_id.clone(), fetch.clone())
        {
            previous.cancel.cancel();
        }

        let result = tokio::select! {
            biased;
            _ = fetch.cancel.cancelled() => Err(SwapError::Cancelled(format!(
                "session {} closed during bootstrap",
                session_id
            ))),
            r = self.backend.bootstrap_session(session_id) => r,
        };

        let current = matches!(
            self.pending.read().await.get(session_id),
            Some(p) if p.generation == generation
        );
        if !current || fetch.cancel.is_cancelled() {
            self.finish_fetch(session_id, generation).await;
            debug!("Discarding stale bootstrap of session {}", session_id);
            return Err(SwapError::Cancelled(format!(
                "bootstrap of session {} superseded",
                session_id
            )));
        }
        match result {
            Ok(bootstrap) => Ok((bootstrap, fetch)),
            Err(e) => {
                self.finish_fetch(session_id, generation).await;
                Err(e)
            }
        }
    }

    /// Forget a fetch unless a newer one replaced it
    async fn finish_fetch(&self, session_id: &SessionId, generation: u64) {
        let mut pending = self.pending.write().await;
        if matches!(pending.get(session_id), Some(p) if p.generation == generation) {
            pending.remove(session_id);
        }
    }

    /// Open the channel and route its events into the session
    async fn connect(&self, session_id: &SessionId) -> Result<()> {
        let (identity, cancel) = {
            let sessions = self.sessions.read().await;
            let slot = sessions.get(session_id).ok_or_else(|| {
                SwapError::Cancelled(format!("session {} closed", session_id))
            })?;
            (slot.session.me().username.clone(), slot.cancel.clone())
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().dispatch(rx, cancel.clone()));

        match self.connections.open(session_id, &identity, tx).await {
            Ok(_) if cancel.is_cancelled() => {
                // Session closed while the channel was opening
                self.connections.close(session_id).await;
                Err(SwapError::Cancelled(format!(
                    "session {} closed while connecting",
                    session_id
                )))
            }
            Ok(_) => Ok(()),
            Err(e @ SwapError::Cancelled(_)) => Err(e),
            Err(e) => {
                self.emit(ClientEvent::Notice {
                    session_id: Some(session_id.clone()),
                    message: format!("Chat is offline: {}", e),
                });
                Err(e)
            }
        }
    }

    async fn dispatch(self, mut rx: mpsc::UnboundedReceiver<ChannelEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.apply_channel_event(event).await,
                    None => break,
                },
            }
        }
    }

    async fn apply_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Frame {
                session_id,
                message,
                ..
            } => {
                let changed = {
                    let mut sessions = self.sessions.write().await;
                    match sessions.get_mut(&session_id) {
                        Some(slot) => slot.session.receive(message).changed(),
                        None => {
                            debug!("Frame for closed session {} discarded", session_id);
                            false
                        }
                    }
                };
                if changed {
                    self.emit(ClientEvent::TimelineUpdated { session_id });
                }
            }
            ChannelEvent::StateChanged {
                session_id,
                connection_id,
                state,
            } => {
                if state.is_terminal() {
                    self.fail_stranded_sends(&session_id, connection_id).await;
                }
                if state == ConnectionState::Failed {
                    self.emit(ClientEvent::Notice {
                        session_id: Some(session_id.clone()),
                        message: "Chat disconnected; reopen to retry".to_string(),
                    });
                }
                self.emit(ClientEvent::ConnectionChanged { session_id, state });
            }
        }
    }

    /// Queued sends die with their channel; flag whatever never got an echo
    async fn fail_stranded_sends(&self, session_id: &SessionId, connection_id: Uuid) {
        let current = self.connections.get(session_id).await.map(|c| c.id);
        if current != Some(connection_id) {
            debug!("Ignoring state of replaced channel {} for session {}", connection_id, session_id);
            return;
        }
        let failed = match self.sessions.write().await.get_mut(session_id) {
            Some(slot) => slot.session.fail_pending_sends(),
            None => 0,
        };
        if failed > 0 {
            warn!("{} messages on session {} were not delivered", failed, session_id);
            self.emit(ClientEvent::TimelineUpdated {
                session_id: session_id.clone(),
            });
            self.emit(ClientEvent::SendFailed {
                session_id: session_id.clone(),
                reason: format!("{} message(s) not delivered: chat disconnected", failed),
            });
        }
    }
}
