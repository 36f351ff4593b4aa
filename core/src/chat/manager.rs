/// Registry of open chat channels, one per active session
use crate::chat::connection::{ChannelEvent, Connection, ConnectionState, Connector};
use crate::error::{Result, SwapError};
use crate::negotiation_types::{ChatMessage, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Owns every chat connection of the signed-in user.
///
/// Populated on session open, pruned on session close, drained on logout.
#[derive(Clone)]
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    connections: Arc<RwLock<HashMap<SessionId, Connection>>>,
    connect_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, connect_timeout: Duration) -> Self {
        Self {
            connector,
            connections: Arc::new(RwLock::new(HashMap::new())),
            connect_timeout,
        }
    }

    /// Open the channel for `session_id` as `identity`.
    ///
    /// Returns the existing connection while it is connecting or open. A
    /// closed or failed one is replaced by a fresh connection.
    pub async fn open(
        &self,
        session_id: &SessionId,
        identity: &str,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<Connection> {
        let (conn, outbound_rx) = {
            let mut connections = self.connections.write().await;
            if let Some(existing) = connections.get(session_id) {
                if !existing.state().is_terminal() {
                    debug!("Reusing {:?} channel for session {}", existing.state(), session_id);
                    return Ok(existing.clone());
                }
            }
            let (conn, outbound_rx) = Connection::new(session_id.clone(), events);
            connections.insert(session_id.clone(), conn.clone());
            (conn, outbound_rx)
        };

        let channel = match timeout(
            self.connect_timeout,
            self.connector.connect(session_id, identity),
        )
        .await
        {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                warn!("Failed to open channel for session {}: {}", session_id, e);
                conn.mark_failed();
                return Err(e);
            }
            Err(_) => {
                warn!("Channel open timeout for session {}", session_id);
                conn.mark_failed();
                return Err(SwapError::Timeout(format!(
                    "Opening channel for session {}",
                    session_id
                )));
            }
        };

        // Closed while we were connecting: the transport is dropped unused
        if !conn.mark_open() {
            debug!("Session {} closed during connect", session_id);
            return Err(SwapError::Cancelled(format!(
                "Channel for session {} closed while connecting",
                session_id
            )));
        }

        info!("Chat channel open for session {} as {}", session_id, identity);
        tokio::spawn(conn.clone().run(channel, outbound_rx));
        Ok(conn)
    }

    /// Send on the session's channel; errors if there is no open channel
    pub async fn send(&self, session_id: &SessionId, message: &ChatMessage) -> Result<()> {
        let conn = self.get(session_id).await.ok_or_else(|| {
            SwapError::Connection(format!("No channel for session {}", session_id))
        })?;
        conn.send(message)
    }

    /// Close and forget the session's channel. Returns whether one existed.
    pub async fn close(&self, session_id: &SessionId) -> bool {
        let removed = self.connections.write().await.remove(session_id);
        match removed {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Close every channel (logout); returns how many were drained
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Connection> = {
            let mut connections = self.connections.write().await;
            connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in &drained {
            conn.close();
        }
        if !drained.is_empty() {
            info!("Drained {} chat channels", drained.len());
        }
        drained.len()
    }

    pub async fn get(&self, session_id: &SessionId) -> Option<Connection> {
        self.connections.read().await.get(session_id).cloned()
    }

    pub async fn state(&self, session_id: &SessionId) -> Option<ConnectionState> {
        self.get(session_id).await.map(|c| c.state())
    }

    /// Sessions with a registered channel
    pub async fn sessions(&self) -> Vec<SessionId> {
        self.connections.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
