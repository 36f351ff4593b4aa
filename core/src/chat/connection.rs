/// Chat channel: connection handle, connector seam and the frame pump
use crate::chat::protocol::{decode_inbound, InboundFrame, OutboundFrame};
use crate::config::Config;
use crate::error::{Result, SwapError};
use crate::negotiation_types::{ChatMessage, SessionId};
use async_trait::async_trait;
use futures_util::future;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Connection state of a chat channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Channel open in progress
    Connecting,
    /// Frames flow both ways
    Open,
    /// Torn down by the owning session
    Closed,
    /// Open failed or the channel dropped unexpectedly
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = SwapError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Both halves of an established text channel
pub struct Channel {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens the transport behind a chat connection
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, session_id: &SessionId, identity: &str) -> Result<Channel>;
}

/// WebSocket connector; one socket per session, scoped to the user's handle
#[derive(Debug, Clone)]
pub struct WsConnector {
    config: Config,
}

impl WsConnector {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, session_id: &SessionId, identity: &str) -> Result<Channel> {
        let url = self.config.chat_url(identity, session_id.as_str());
        debug!("Opening chat socket {}", url);

        let (ws, response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| SwapError::Connection(format!("WebSocket connect failed: {}", e)))?;
        debug!("Chat socket handshake status {}", response.status());

        let (ws_sink, ws_stream) = ws.split();

        let sink = ws_sink
            .sink_map_err(|e| SwapError::Connection(format!("WebSocket send failed: {}", e)))
            .with(|text: String| future::ready(Ok::<_, SwapError>(WsMessage::Text(text))));

        let stream = ws_stream.filter_map(|item| {
            future::ready(match item {
                Ok(WsMessage::Text(text)) => Some(Ok(text)),
                Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        warn!("Dropping binary frame that is not UTF-8");
                        None
                    }
                },
                // Close ends the stream; ping/pong are answered by tungstenite
                Ok(_) => None,
                Err(e) => Some(Err(SwapError::Connection(format!(
                    "WebSocket receive failed: {}",
                    e
                )))),
            })
        });

        Ok(Channel {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// What a connection reports to the session that owns it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A validated chat line for the session
    Frame {
        session_id: SessionId,
        connection_id: Uuid,
        message: ChatMessage,
    },
    StateChanged {
        session_id: SessionId,
        connection_id: Uuid,
        state: ConnectionState,
    },
}

/// Handle to one session's channel; clones share the same connection
#[derive(Clone)]
pub struct Connection {
    pub id: Uuid,
    pub session_id: SessionId,
    state: Arc<watch::Sender<ConnectionState>>,
    outbound: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    cancel: CancellationToken,
}

impl Connection {
    /// New connection in `Connecting`, plus the receiving end of its outbound queue
    pub(crate) fn new(
        session_id: SessionId,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let conn = Self {
            id: Uuid::new_v4(),
            session_id,
            state: Arc::new(state),
            outbound,
            events,
            cancel: CancellationToken::new(),
        };
        (conn, outbound_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Queue a message for transmission without waiting for the server.
    ///
    /// Fails if the channel is not open.
    pub fn send(&self, message: &ChatMessage) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(SwapError::Connection(format!(
                "Channel for session {} is {:?}",
                self.session_id, state
            )));
        }
        let text = OutboundFrame::from(message).to_text()?;
        self.outbound
            .send(text)
            .map_err(|_| SwapError::Connection("Channel writer has stopped".to_string()))
    }

    /// Tear down; safe to call any number of times
    pub fn close(&self) {
        if self.transition_from_live(ConnectionState::Closed) {
            info!("Closed chat channel for session {}", self.session_id);
        }
        self.cancel.cancel();
    }

    /// Move to `Open`; only valid while connecting
    pub(crate) fn mark_open(&self) -> bool {
        let changed = self.state.send_if_modified(|s| {
            if *s == ConnectionState::Connecting {
                *s = ConnectionState::Open;
                true
            } else {
                false
            }
        });
        if changed {
            self.emit_state(ConnectionState::Open);
        }
        changed
    }

    pub(crate) fn mark_failed(&self) {
        if self.transition_from_live(ConnectionState::Failed) {
            warn!("Chat channel for session {} failed", self.session_id);
        }
        self.cancel.cancel();
    }

    fn transition_from_live(&self, target: ConnectionState) -> bool {
        let changed = self.state.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = target;
                true
            }
        });
        if changed {
            self.emit_state(target);
        }
        changed
    }

    fn emit_state(&self, state: ConnectionState) {
        // Owner gone means nobody is left to tell
        let _ = self.events.send(ChannelEvent::StateChanged {
            session_id: self.session_id.clone(),
            connection_id: self.id,
            state,
        });
    }

    /// Drive the channel until it is closed or drops
    pub(crate) async fn run(self, channel: Channel, mut outbound: mpsc::UnboundedReceiver<String>) {
        let Channel {
            mut sink,
            mut stream,
        } = channel;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    if let Err(e) = sink.close().await {
                        debug!("Close frame for session {} not delivered: {}", self.session_id, e);
                    }
                    break;
                }

                Some(text) = outbound.recv() => {
                    if let Err(e) = sink.send(text).await {
                        warn!("Send on session {} failed: {}", self.session_id, e);
                        self.mark_failed();
                        break;
                    }
                }

                item = stream.next() => match item {
                    Some(Ok(text)) => {
                        if !self.dispatch(&text) {
                            debug!("Owner of session {} went away, closing channel", self.session_id);
                            self.close();
                        }
                    }
                    Some(Err(SwapError::Protocol(reason))) => {
                        warn!("Dropping undecodable frame on session {}: {}", self.session_id, reason);
                    }
                    Some(Err(e)) => {
                        warn!("Receive on session {} failed: {}", self.session_id, e);
                        self.mark_failed();
                        break;
                    }
                    None => {
                        if !self.state().is_terminal() {
                            warn!("Chat channel for session {} dropped by server", self.session_id);
                        }
                        self.mark_failed();
                        break;
                    }
                },
            }
        }

        debug!("Pump for session {} (connection {}) stopped", self.session_id, self.id);
    }

    /// Decode one frame and forward it; false once the owner has gone
    fn dispatch(&self, text: &str) -> bool {
        match decode_inbound(text, &self.session_id) {
            Ok(InboundFrame::Message(message)) => {
                debug!("Frame from {} on session {}", message.sender, self.session_id);
                self.events
                    .send(ChannelEvent::Frame {
                        session_id: self.session_id.clone(),
                        connection_id: self.id,
                        message,
                    })
                    .is_ok()
            }
            Ok(InboundFrame::OtherSession(other)) => {
                debug!("Ignoring frame for session {} on session {}", other, self.session_id);
                true
            }
            Err(e) => {
                warn!("Dropping malformed frame on session {}: {}", self.session_id, e);
                true
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish()
    }
}
