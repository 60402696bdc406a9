//! Live connection registry.
//!
//! Tracks every open WebSocket, who it is authenticated as, and its outbound
//! channel. Delivers `match_found` to each connection of a user.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::debug;

use crate::contest::{MatchNotice, MatchNotifier};
use crate::core::{ConnectionId, UserId};
use super::protocol::ServerMessage;

/// Connected client state.
struct ConnectedClient {
    /// User, once authenticated on this connection.
    user_id: Option<UserId>,
    /// Last inbound frame.
    last_activity: Instant,
    /// Outbound messages.
    sender: mpsc::Sender<ServerMessage>,
    /// Signalled to close the connection from outside its task.
    close: Arc<Notify>,
}

/// Registry of open connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    clients: RwLock<BTreeMap<ConnectionId, ConnectedClient>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a connection id.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Register a connection. Returns the signal that asks it to close.
    pub async fn register(&self, conn: ConnectionId, sender: mpsc::Sender<ServerMessage>) -> Arc<Notify> {
        let close = Arc::new(Notify::new());
        self.clients.write().await.insert(
            conn,
            ConnectedClient {
                user_id: None,
                last_activity: Instant::now(),
                sender,
                close: close.clone(),
            },
        );
        close
    }

    /// Record who `conn` is authenticated as.
    pub async fn set_user(&self, conn: ConnectionId, user: Option<UserId>) {
        if let Some(client) = self.clients.write().await.get_mut(&conn) {
            client.user_id = user;
        }
    }

    /// User authenticated on `conn`.
    pub async fn user(&self, conn: ConnectionId) -> Option<UserId> {
        self.clients.read().await.get(&conn).and_then(|c| c.user_id.clone())
    }

    /// Mark inbound activity.
    pub async fn touch(&self, conn: ConnectionId) {
        if let Some(client) = self.clients.write().await.get_mut(&conn) {
            client.last_activity = Instant::now();
        }
    }

    /// Forget a connection.
    pub async fn remove(&self, conn: ConnectionId) {
        self.clients.write().await.remove(&conn);
    }

    /// Number of open connections.
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Whether no connection is open.
    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Ask every connection idle for longer than `timeout` to close.
    pub async fn close_idle(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let clients = self.clients.read().await;
        let mut closed = 0;
        for (conn, client) in clients.iter() {
            if now.duration_since(client.last_activity) > timeout {
                debug!("Closing idle connection {}", conn);
                client.close.notify_one();
                closed += 1;
            }
        }
        closed
    }

    /// Queue `msg` on every connection of `user`. Returns how many took it.
    pub async fn send_to_user(&self, user: &UserId, msg: ServerMessage) -> usize {
        let senders: Vec<_> = {
            let clients = self.clients.read().await;
            clients
                .values()
                .filter(|c| c.user_id.as_ref() == Some(user))
                .map(|c| c.sender.clone())
                .collect()
        };
        let mut delivered = 0;
        for sender in senders {
            if sender.send(msg.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

#[async_trait]
impl MatchNotifier for ConnectionRegistry {
    async fn match_found(&self, user: &UserId, notice: MatchNotice) {
        let delivered = self.send_to_user(user, ServerMessage::MatchFound(notice.into())).await;
        if delivered == 0 {
            debug!("User {} not connected; match_found not delivered", user);
        }
    }
}
