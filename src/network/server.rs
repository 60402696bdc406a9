//! WebSocket Contest Server
//!
//! Async WebSocket server for player connections.
//! Routes login, verification, contest and session messages to the services
//! and pushes `match_found` notifications back out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, instrument, warn};

use crate::app::Services;
use crate::contest::CancelOutcome;
use crate::core::{Clock, ConnectionId, SessionToken, TaskHandle};
use crate::error::{ErrorKind, ServiceError};
use crate::network::protocol::{
    CancelFindResult, CheckOpponentResult, ClientMessage, ContestJoinResult, LoginResult, LogoutResult,
    ReplyStatus, RestoreSessionResult, ServerError, ServerMessage, VerifyOtpResult,
};
use crate::network::registry::ConnectionRegistry;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Connections silent for longer than this are closed.
    pub idle_timeout: Duration,
    /// How often idle connections are looked for.
    pub cleanup_interval: Duration,
    /// Outbound queue depth per connection.
    pub outbound_buffer: usize,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            outbound_buffer: 64,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("BIND_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bind_addr),
            max_connections: std::env::var("MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            ..defaults
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// The contest server.
pub struct DuelServer {
    /// Server configuration.
    config: ServerConfig,
    /// Request-facing services.
    services: Arc<Services>,
    /// Open connections.
    registry: Arc<ConnectionRegistry>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl DuelServer {
    /// Create a new server. `registry` must be the notifier the scheduler
    /// inside `services` was built with.
    pub fn new(config: ServerConfig, services: Arc<Services>, registry: Arc<ConnectionRegistry>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { config, services, registry, shutdown_tx }
    }

    /// Run the server until [`DuelServer::shutdown`] is called.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Contest server v{} listening on {}", self.config.version, self.config.bind_addr);

        let matchmaking = self.services.scheduler.clone().start();
        let sweeper = self.services.sweeper.clone().start();
        let cleanup = self.start_cleanup_loop();

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.registry.len().await >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        matchmaking.stop().await;
        sweeper.stop().await;
        cleanup.stop().await;

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let services = self.services.clone();
        let registry = self.registry.clone();
        let buffer = self.config.outbound_buffer;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let conn = registry.next_id();
            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(buffer);
            let close = registry.register(conn, msg_tx.clone()).await;
            debug!("{} is {}", addr, conn);

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            // Handle incoming messages
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                registry.touch(conn).await;
                                let reply = match ClientMessage::from_json(&text) {
                                    Ok(client_msg) => Self::dispatch(&services, &registry, conn, client_msg).await,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", conn, e);
                                        ServerMessage::Error(ServerError::malformed("Invalid message format"))
                                    }
                                };
                                if msg_tx.send(reply).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Binary(_))) => {
                                let _ = msg_tx.send(ServerMessage::Error(
                                    ServerError::malformed("Binary frames are not supported")
                                )).await;
                            }
                            Some(Ok(Message::Ping(_))) => {
                                registry.touch(conn).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", conn);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", conn, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = close.notified() => {
                        info!("Closing idle connection {}", conn);
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Cleanup
            sender_task.abort();
            registry.remove(conn).await;
            if let Err(e) = services.sessions.disconnect(conn).await {
                warn!("Failed to drop binding for {}: {}", conn, e);
            }

            info!("Client {} cleaned up", conn);
        });
    }

    /// Handle one client message and build the reply.
    pub async fn dispatch(
        services: &Services,
        registry: &ConnectionRegistry,
        conn: ConnectionId,
        msg: ClientMessage,
    ) -> ServerMessage {
        let kind = msg.kind();
        let result = match msg {
            ClientMessage::Login(req) => services
                .auth
                .login(&req.mobile, &req.device_id, &req.push_token)
                .await
                .map(|outcome| {
                    ServerMessage::LoginResult(LoginResult {
                        status: ReplyStatus::Success,
                        session_token: outcome.session_token.to_string(),
                        otp: outcome.code,
                        is_new_user: outcome.is_new_user,
                    })
                }),
            ClientMessage::VerifyOtp(req) => {
                match services.auth.verify_code(conn, &req.mobile, &req.session_token, &req.otp).await {
                    Ok(verified) => {
                        registry.set_user(conn, Some(verified.user_id.clone())).await;
                        Ok(ServerMessage::VerifyOtpResult(VerifyOtpResult {
                            status: ReplyStatus::Success,
                            credential: verified.credential,
                            user_id: verified.user_id,
                            user_status: verified.user_status,
                        }))
                    }
                    Err(e) => Err(e),
                }
            }
            ClientMessage::ContestJoin(req) => Self::handle_contest_join(services, conn, req).await,
            ClientMessage::CheckOpponent(req) => {
                match services.sessions.authorize(conn, &req.credential).await {
                    Ok(ctx) => services
                        .opponents
                        .check_opponent(&ctx, &req.user_id, &req.contest_id)
                        .await
                        .map(|status| ServerMessage::CheckOpponentResult(CheckOpponentResult::from(status))),
                    Err(e) => Err(e),
                }
            }
            ClientMessage::CancelFind(req) => {
                match services.sessions.authorize(conn, &req.credential).await {
                    Ok(ctx) => services
                        .opponents
                        .cancel(&ctx, &req.user_id, &req.contest_id)
                        .await
                        .map(|outcome| {
                            if outcome == CancelOutcome::AlreadyCancelled {
                                debug!("{} was not waiting in {}", ctx.user_id, req.contest_id);
                            }
                            ServerMessage::CancelFindResult(CancelFindResult {
                                status: ReplyStatus::Success,
                                contest_id: req.contest_id.trim().into(),
                            })
                        }),
                    Err(e) => Err(e),
                }
            }
            ClientMessage::RestoreSession(req) => {
                let token = SessionToken::new(req.session_token);
                match services.sessions.restore(conn, &token, &req.credential).await {
                    Ok(ctx) => {
                        registry.set_user(conn, Some(ctx.user_id.clone())).await;
                        Ok(ServerMessage::RestoreSessionResult(RestoreSessionResult {
                            status: ReplyStatus::Success,
                            user_id: ctx.user_id,
                        }))
                    }
                    Err(e) => Err(e),
                }
            }
            ClientMessage::Logout(req) => match services.sessions.logout(conn, &req.credential).await {
                Ok(_) => {
                    registry.set_user(conn, None).await;
                    Ok(ServerMessage::LogoutResult(LogoutResult { status: ReplyStatus::Success }))
                }
                Err(e) => Err(e),
            },
            ClientMessage::Ping { timestamp } => Ok(ServerMessage::Pong {
                timestamp,
                server_time: services.clock.now().timestamp_millis().max(0) as u64,
            }),
        };

        result.unwrap_or_else(|err| Self::error_reply(conn, kind, &err))
    }

    async fn handle_contest_join(
        services: &Services,
        conn: ConnectionId,
        req: crate::network::protocol::ContestJoinRequest,
    ) -> Result<ServerMessage, ServiceError> {
        let ctx = services.sessions.authorize(conn, &req.credential).await?;
        let ack = services.joins.join(&ctx, &req.contest_id, req.team.as_deref()).await?;
        Ok(ServerMessage::ContestJoinResult(ContestJoinResult {
            status: ReplyStatus::Success,
            contest_id: ack.contest_id,
            team_id: ack.team_id,
            join_time: ack.joined_at,
            join_status: ack.outcome,
        }))
    }

    fn error_reply(conn: ConnectionId, kind: &str, err: &ServiceError) -> ServerMessage {
        match err.kind() {
            ErrorKind::StoreUnavailable | ErrorKind::Internal => error!("{} on {} failed: {}", kind, conn, err),
            _ => debug!("{} on {} rejected: {}", kind, conn, err),
        }
        ServerMessage::Error(ServerError::from_service(kind, err))
    }

    fn start_cleanup_loop(&self) -> TaskHandle {
        let registry = self.registry.clone();
        let period = self.config.cleanup_interval;
        let idle_timeout = self.config.idle_timeout;

        TaskHandle::spawn("connection-cleanup", move |mut shutdown| async move {
            let mut interval = interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let closed = registry.close_idle(idle_timeout).await;
                        if closed > 0 {
                            info!("Closed {} idle connection(s)", closed);
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppConfig;
    use crate::core::{ManualClock, UserId};
    use crate::network::protocol::{
        ContestJoinRequest, LoginRequest, LogoutRequest, OpponentRequest, RestoreSessionRequest, VerifyOtpRequest,
    };
    use crate::store::MemoryCache;

    struct Harness {
        services: Arc<Services>,
        registry: Arc<ConnectionRegistry>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let mut config = AppConfig::default();
        config.auth.signing_secret = Some("sign".into());
        config.auth.encryption_secret = Some("seal".into());
        let registry = Arc::new(ConnectionRegistry::new());
        let clock = Arc::new(ManualClock::fixed());
        let services = Services::build(&config, clock.clone(), Arc::new(MemoryCache::new()), registry.clone()).unwrap();
        Harness { services: Arc::new(services), registry, clock }
    }

    impl Harness {
        async fn send(&self, conn: ConnectionId, msg: ClientMessage) -> ServerMessage {
            DuelServer::dispatch(&self.services, &self.registry, conn, msg).await
        }

        /// Open `conn`, log in and verify. Returns the credential, the user
        /// id and the connection's outbound queue.
        async fn sign_in(&self, conn: ConnectionId, mobile: &str) -> (String, UserId, mpsc::Receiver<ServerMessage>) {
            let (tx, rx) = mpsc::channel(8);
            self.registry.register(conn, tx).await;
            let login = match self
                .send(conn, ClientMessage::Login(LoginRequest {
                    mobile: mobile.into(),
                    device_id: format!("dev-{}", mobile),
                    push_token: "push".into(),
                }))
                .await
            {
                ServerMessage::LoginResult(r) => r,
                other => panic!("unexpected {:?}", other),
            };
            match self
                .send(conn, ClientMessage::VerifyOtp(VerifyOtpRequest {
                    mobile: mobile.into(),
                    session_token: login.session_token,
                    otp: login.otp.unwrap(),
                }))
                .await
            {
                ServerMessage::VerifyOtpResult(r) => (r.credential, r.user_id, rx),
                other => panic!("unexpected {:?}", other),
            }
        }

        async fn join(&self, conn: ConnectionId, credential: &str, contest: &str) -> ServerMessage {
            let reply = self
                .send(conn, ClientMessage::ContestJoin(ContestJoinRequest {
                    credential: credential.to_string(),
                    contest_id: contest.into(),
                    team: Some("Tigers".into()),
                }))
                .await;
            self.clock.advance(chrono::Duration::seconds(1));
            reply
        }
    }

    fn opponent_request(credential: &str, user: &UserId, contest: &str) -> OpponentRequest {
        OpponentRequest {
            credential: credential.to_string(),
            user_id: user.to_string(),
            contest_id: contest.into(),
        }
    }

    fn error_kind(msg: &ServerMessage) -> Option<ErrorKind> {
        match msg {
            ServerMessage::Error(e) => Some(e.error_kind),
            _ => None,
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.bind_addr.port(), 8080);
    }

    #[tokio::test]
    async fn test_server_creation_and_shutdown() {
        let h = harness();
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = DuelServer::new(config, h.services.clone(), h.registry.clone());
        assert_eq!(server.connection_count().await, 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_full_contest_flow() {
        let h = harness();
        let a = ConnectionId::new(1);
        let b = ConnectionId::new(2);
        let (cred_a, user_a, mut rx_a) = h.sign_in(a, "9000000001").await;
        let (cred_b, user_b, _rx_b) = h.sign_in(b, "9000000002").await;

        let joined = h.join(a, &cred_a, "league-1").await;
        assert_eq!(joined.status(), Some(ReplyStatus::Success));
        let pending = h.send(a, ClientMessage::CheckOpponent(opponent_request(&cred_a, &user_a, "league-1"))).await;
        assert_eq!(pending.status(), Some(ReplyStatus::Pending));

        let joined = h.join(b, &cred_b, "league-1").await;
        assert_eq!(joined.status(), Some(ReplyStatus::Success));
        h.services.scheduler.run_once().await.unwrap();

        match h.send(a, ClientMessage::CheckOpponent(opponent_request(&cred_a, &user_a, "league-1"))).await {
            ServerMessage::CheckOpponentResult(r) => {
                assert_eq!(r.status, ReplyStatus::Success);
                assert_eq!(r.opponent_user_id, Some(user_b.clone()));
                assert_eq!(r.turn, Some(1));
                assert!(r.seed.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }

        match rx_a.try_recv().unwrap() {
            ServerMessage::MatchFound(info) => {
                assert_eq!(info.opponent_user_id, user_b);
                assert_eq!(info.turn, 1);
            }
            other => panic!("unexpected {:?}", other),
        }

        let cancel = h.send(b, ClientMessage::CancelFind(opponent_request(&cred_b, &user_b, "league-1"))).await;
        assert_eq!(error_kind(&cancel), Some(ErrorKind::AlreadyMatched));
    }

    #[tokio::test]
    async fn test_cancel_then_check_is_not_found() {
        let h = harness();
        let conn = ConnectionId::new(1);
        let (credential, user, _rx) = h.sign_in(conn, "9000000001").await;
        h.join(conn, &credential, "league-1").await;

        let cancel = h.send(conn, ClientMessage::CancelFind(opponent_request(&credential, &user, "league-1"))).await;
        assert_eq!(cancel.status(), Some(ReplyStatus::Success));
        let check = h.send(conn, ClientMessage::CheckOpponent(opponent_request(&credential, &user, "league-1"))).await;
        assert_eq!(error_kind(&check), Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_other_users_record_is_refused() {
        let h = harness();
        let conn = ConnectionId::new(1);
        let (credential, _, _rx) = h.sign_in(conn, "9000000001").await;

        let reply = h
            .send(conn, ClientMessage::CheckOpponent(opponent_request(&credential, &UserId::from("someone-else"), "league-1")))
            .await;
        match reply {
            ServerMessage::Error(e) => {
                assert_eq!(e.error_kind, ErrorKind::AuthenticationFailed);
                assert_eq!(e.field.as_deref(), Some("user_id"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_requests_without_binding_are_rejected() {
        let h = harness();
        let (credential, _, _rx) = h.sign_in(ConnectionId::new(1), "9000000001").await;

        // Same credential, different connection that never verified.
        let reply = h.join(ConnectionId::new(9), &credential, "league-1").await;
        assert_eq!(error_kind(&reply), Some(ErrorKind::AuthenticationFailed));
    }

    #[tokio::test]
    async fn test_restore_binds_new_connection() {
        let h = harness();
        let first = ConnectionId::new(1);
        let (credential, user, _rx) = h.sign_in(first, "9000000001").await;
        let token = h.services.sessions.authorize(first, &credential).await.unwrap().session_token;

        let second = ConnectionId::new(2);
        let (tx, _rx2) = mpsc::channel(8);
        h.registry.register(second, tx).await;
        let restored = h
            .send(second, ClientMessage::RestoreSession(RestoreSessionRequest {
                session_token: token.to_string(),
                credential: credential.clone(),
            }))
            .await;
        assert_eq!(restored.status(), Some(ReplyStatus::Success));
        assert_eq!(h.registry.user(second).await, Some(user));

        let joined = h.join(second, &credential, "league-1").await;
        assert_eq!(joined.status(), Some(ReplyStatus::Success));
    }

    #[tokio::test]
    async fn test_validation_errors_name_the_field() {
        let h = harness();
        let reply = h
            .send(ConnectionId::new(1), ClientMessage::Login(LoginRequest {
                mobile: String::new(),
                device_id: "d".into(),
                push_token: "p".into(),
            }))
            .await;
        match reply {
            ServerMessage::Error(e) => {
                assert_eq!(e.error_kind, ErrorKind::FieldMissing);
                assert_eq!(e.field.as_deref(), Some("mobile"));
                assert_eq!(e.reply_to.as_deref(), Some("login"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_logout_ends_session() {
        let h = harness();
        let conn = ConnectionId::new(1);
        let (credential, _, _rx) = h.sign_in(conn, "9000000001").await;

        let reply = h.send(conn, ClientMessage::Logout(LogoutRequest { credential: credential.clone() })).await;
        assert_eq!(reply.status(), Some(ReplyStatus::Success));
        assert!(h.registry.user(conn).await.is_none());

        let reply = h.join(conn, &credential, "league-1").await;
        assert_eq!(error_kind(&reply), Some(ErrorKind::AuthenticationFailed));
    }

    #[tokio::test]
    async fn test_ping() {
        let h = harness();
        match h.send(ConnectionId::new(1), ClientMessage::Ping { timestamp: 42 }).await {
            ServerMessage::Pong { timestamp, server_time } => {
                assert_eq!(timestamp, 42);
                assert!(server_time > 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
