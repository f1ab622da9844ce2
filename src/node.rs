use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Weak,
};
use tokio::time::sleep;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::NodeConfig,
    error::{Error, Result},
    events::EventHandler,
    protocol::{
        IncomingMessage, LoadResult, NodeInfo, PlayerUpdateState, SessionUpdate, Stats, Track,
        TrackEvent,
    },
    rest::{RestClient, SessionHandle},
};

/// Close codes after which the platform will never accept this session
/// again; reconnecting would just fail the same way.
const PERMANENT_CLOSE_CODES: [u16; 6] = [4004, 4005, 4006, 4009, 4015, 4016];

/// Connection lifecycle of a node session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    Dialing,
    /// Socket is open, waiting for the server's `ready` frame.
    AwaitingReady,
    Ready,
    Closed,
    ReconnectPending,
    Destroyed,
}

/// Narrow interface the manager exposes to its nodes: identity lookup,
/// event routing to players, and failure notification. Keeps the node from
/// reaching into manager internals.
#[async_trait::async_trait]
pub(crate) trait NodeObserver: Send + Sync {
    fn user_id(&self) -> Option<u64>;
    async fn dispatch_player_update(&self, guild_id: u64, state: PlayerUpdateState);
    async fn dispatch_event(&self, guild_id: u64, event: TrackEvent);
    /// Called on every non-caller-initiated disconnect; `permanent` means no
    /// reconnect will follow.
    async fn node_disconnected(&self, node: &Arc<Node>, permanent: bool);
}

/// One authenticated session to a Lavalink server: a WebSocket for inbound
/// events plus a REST client for everything we ask of it.
pub struct Node {
    config: NodeConfig,
    rest: RestClient,
    session: Arc<SessionHandle>,
    events: Arc<dyn EventHandler>,

    state: RwLock<NodeState>,
    stats: RwLock<Option<Stats>>,
    reconnect_attempt: AtomicU32,
    permanently_failed: AtomicBool,

    /// Guilds whose players are currently bound to this node. Ids only; the
    /// manager owns the players themselves.
    pub(crate) players: DashMap<u64, ()>,

    observer: RwLock<Option<Weak<dyn NodeObserver>>>,

    /// Cancelled once, on destroy.
    destroyed: CancellationToken,
    /// Token of the currently running session task, if any.
    conn_token: Mutex<Option<CancellationToken>>,
}

impl Node {
    pub fn new(config: NodeConfig, events: Arc<dyn EventHandler>) -> Result<Arc<Self>> {
        config.validate()?;
        let session = Arc::new(SessionHandle::default());
        let rest = RestClient::new(&config, session.clone())?;

        info!("{}", config.summary());

        Ok(Arc::new(Self {
            config,
            rest,
            session,
            events,
            state: RwLock::new(NodeState::Idle),
            stats: RwLock::new(None),
            reconnect_attempt: AtomicU32::new(0),
            permanently_failed: AtomicBool::new(false),
            players: DashMap::new(),
            observer: RwLock::new(None),
            destroyed: CancellationToken::new(),
            conn_token: Mutex::new(None),
        }))
    }

    pub fn identifier(&self) -> &str {
        &self.config.identifier
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    /// True only while the session has completed READY negotiation.
    pub fn is_ready(&self) -> bool {
        self.state() == NodeState::Ready
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.get()
    }

    /// Latest stats snapshot pushed by the server.
    pub fn stats(&self) -> Option<Stats> {
        self.stats.read().clone()
    }

    /// Number of players currently bound to this node.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Guild ids of the players bound to this node.
    pub fn player_guilds(&self) -> Vec<u64> {
        self.players.iter().map(|entry| *entry.key()).collect()
    }

    pub(crate) fn set_observer(&self, observer: Weak<dyn NodeObserver>) {
        *self.observer.write() = Some(observer);
    }

    #[cfg(test)]
    pub(crate) fn test_force_ready(&self, stats: Option<Stats>) {
        *self.state.write() = NodeState::Ready;
        *self.stats.write() = stats;
        self.session.set("test-session".to_string());
    }

    pub(crate) fn rest(&self) -> &RestClient {
        &self.rest
    }

    /// Health score for routing; lower is better, infinity while not ready.
    ///
    /// `players + round(1.05^(100·load/cores)·10 − 10) + round(usedMiB)
    ///  + deficit/3000 + 2·nulled/3000`
    pub fn penalty(&self) -> f64 {
        if !self.is_ready() {
            return f64::INFINITY;
        }
        let stats = self.stats.read();
        let Some(stats) = stats.as_ref() else {
            // Fresh session with no snapshot yet: rank by load we know of.
            return self.players.len() as f64;
        };

        let cores = stats.cpu.cores.max(1) as f64;
        let cpu = (1.05f64.powf(100.0 * stats.cpu.system_load / cores) * 10.0 - 10.0).round();
        let memory = (stats.memory.used as f64 / (1024.0 * 1024.0)).round();
        let (deficit, nulled) = stats
            .frame_stats
            .as_ref()
            .map_or((0.0, 0.0), |f| (f.deficit as f64, f.nulled as f64));

        stats.players as f64 + cpu + memory + deficit / 3000.0 + 2.0 * nulled / 3000.0
    }

    /// Starts (or restarts) the session task.
    ///
    /// Does nothing while the bot user id is unknown: the handshake requires
    /// a `User-Id` header, so dialing before the manager learns it would be
    /// rejected anyway.
    pub fn connect(self: &Arc<Self>) {
        if self.destroyed.is_cancelled() || self.permanently_failed.load(Ordering::Acquire) {
            warn!(node = %self.identifier(), "connect on a dead node ignored");
            return;
        }
        if self.observer_user_id().is_none() {
            debug!(node = %self.identifier(), "user id not set yet, not dialing");
            return;
        }

        let mut slot = self.conn_token.lock();
        if slot.as_ref().is_some_and(|token| !token.is_cancelled()) {
            debug!(node = %self.identifier(), "session task already running");
            return;
        }
        let token = self.destroyed.child_token();
        *slot = Some(token.clone());
        drop(slot);

        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.run_session(token).await;
        });
    }

    /// Caller-initiated disconnect: stops the session task, closes the
    /// socket gracefully and forgets the session id unless resumption is
    /// configured. The node can be `connect()`ed again afterwards.
    pub fn disconnect(&self) {
        if let Some(token) = self.conn_token.lock().take() {
            token.cancel();
        }
        if self.config.resume_key.is_none() {
            self.session.clear();
        }
        let mut state = self.state.write();
        if *state != NodeState::Destroyed {
            *state = NodeState::Closed;
        }
    }

    /// Permanently retires the node. No further reconnects; the player set
    /// is cleared (players themselves belong to the manager).
    pub fn destroy(&self) {
        self.disconnect();
        self.destroyed.cancel();
        self.players.clear();
        *self.state.write() = NodeState::Destroyed;
        info!(node = %self.identifier(), "node destroyed");
    }

    // --- REST passthroughs ----------------------------------------------

    /// Plain-text server version (`GET /version`).
    pub async fn version(&self) -> Result<String> {
        self.rest.version().await
    }

    /// Server build info (`GET /v4/info`).
    pub async fn info(&self) -> Result<NodeInfo> {
        self.rest.info().await
    }

    /// On-demand stats fetch; also refreshes the routing snapshot.
    pub async fn stats_now(&self) -> Result<Stats> {
        let stats = self.rest.stats().await?;
        *self.stats.write() = Some(stats.clone());
        Ok(stats)
    }

    /// Resolves an identifier or search query into tracks.
    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        self.rest.load_tracks(identifier).await
    }

    /// Decodes one encoded track into its metadata.
    pub async fn decode_track(&self, encoded: &str) -> Result<Track> {
        self.rest.decode_track(encoded).await
    }

    /// Decodes a batch of encoded tracks.
    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<Track>> {
        self.rest.decode_tracks(encoded).await
    }

    // --- session task ----------------------------------------------------

    fn observer_user_id(&self) -> Option<u64> {
        let observer = self.observer.read().clone()?;
        observer.upgrade()?.user_id()
    }

    fn observer(&self) -> Option<Arc<dyn NodeObserver>> {
        self.observer.read().clone()?.upgrade()
    }

    fn handshake_request(
        &self,
        user_id: u64,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = self.config.websocket_url().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&self.config.password)
                .map_err(|_| Error::config("password is not a valid header value"))?,
        );
        headers.insert(
            "User-Id",
            HeaderValue::from_str(&user_id.to_string())
                .map_err(|_| Error::config("user id is not a valid header value"))?,
        );
        headers.insert(
            "Client-Name",
            HeaderValue::from_static(concat!("open-lavalink/", env!("CARGO_PKG_VERSION"))),
        );

        // Prefer resuming the exact session we had; fall back to announcing
        // a resume key so the server holds the next one for us.
        if let Some(session_id) = self.session.get() {
            headers.insert(
                "Session-Id",
                HeaderValue::from_str(&session_id)
                    .map_err(|_| Error::Protocol("session id is not header-safe".into()))?,
            );
        } else if let Some(resume_key) = &self.config.resume_key {
            headers.insert(
                "Resume-Key",
                HeaderValue::from_str(resume_key)
                    .map_err(|_| Error::config("resume key is not a valid header value"))?,
            );
        }
        Ok(request)
    }

    async fn run_session(self: Arc<Self>, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                break;
            }
            let Some(user_id) = self.observer_user_id() else {
                debug!(node = %self.identifier(), "user id gone, stopping session task");
                break;
            };

            *self.state.write() = NodeState::Dialing;
            let request = match self.handshake_request(user_id) {
                Ok(request) => request,
                Err(err) => {
                    error!(node = %self.identifier(), "invalid handshake request: {err}");
                    self.fail_permanently(err).await;
                    break;
                }
            };

            debug!(node = %self.identifier(), url = %self.config.websocket_url(), "dialing");
            let dial = tokio::select! {
                result = connect_async(request) => result,
                _ = token.cancelled() => break,
            };

            match dial {
                Ok((stream, _)) => {
                    *self.state.write() = NodeState::AwaitingReady;
                    self.events.node_connect(self.identifier()).await;

                    let outcome = self.read_frames(stream, &token).await;
                    self.drop_connection();

                    match outcome {
                        SessionEnd::CallerClosed => break,
                        SessionEnd::Remote { code, reason } => {
                            self.events
                                .node_disconnect(self.identifier(), code, &reason)
                                .await;
                            if code.is_some_and(|c| PERMANENT_CLOSE_CODES.contains(&c)) {
                                self.fail_permanently(Error::Session(format!(
                                    "node closed the session for good: {code:?} {reason}"
                                )))
                                .await;
                                break;
                            }
                            if let Some(observer) = self.observer() {
                                observer.node_disconnected(&self, false).await;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(node = %self.identifier(), "dial failed: {err}");
                    self.events
                        .node_error(self.identifier(), &err.into(), "websocket dial")
                        .await;
                }
            }

            // Reconnect with exponential backoff, bounded by max_tries.
            let attempt = self.reconnect_attempt.fetch_add(1, Ordering::AcqRel);
            if attempt >= self.config.reconnect.max_tries {
                self.fail_permanently(Error::transport(format!(
                    "gave up reconnecting after {attempt} attempts"
                )))
                .await;
                break;
            }
            let delay = self.config.reconnect.delay_for(attempt);
            info!(
                node = %self.identifier(),
                attempt,
                ?delay,
                "scheduling reconnect"
            );
            *self.state.write() = NodeState::ReconnectPending;
            tokio::select! {
                _ = sleep(delay) => {}
                _ = token.cancelled() => break,
            }
        }
    }

    /// Reads frames until the socket dies or the token fires.
    async fn read_frames(
        &self,
        mut stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        token: &CancellationToken,
    ) -> SessionEnd {
        loop {
            let message = tokio::select! {
                message = stream.next() => message,
                _ = token.cancelled() => {
                    let _ = stream.close(None).await;
                    return SessionEnd::CallerClosed;
                }
            };

            match message {
                Some(Ok(Message::Text(text))) => self.handle_frame(&text).await,
                Some(Ok(Message::Binary(bytes))) => {
                    match std::str::from_utf8(&bytes) {
                        Ok(text) => self.handle_frame(text).await,
                        Err(_) => warn!(node = %self.identifier(), "non-utf8 binary frame dropped"),
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(err) = stream.send(Message::Pong(payload)).await {
                        warn!(node = %self.identifier(), "pong failed: {err}");
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (Some(u16::from(f.code)), f.reason.into_owned()))
                        .unwrap_or((None, String::new()));
                    info!(node = %self.identifier(), ?code, %reason, "socket closed by server");
                    return SessionEnd::Remote { code, reason };
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(node = %self.identifier(), "socket error: {err}");
                    return SessionEnd::Remote {
                        code: None,
                        reason: err.to_string(),
                    };
                }
                None => {
                    return SessionEnd::Remote {
                        code: None,
                        reason: "stream ended".to_string(),
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        let message = match IncomingMessage::parse(text) {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(node = %self.identifier(), frame = %text, "unknown op ignored");
                self.events
                    .debug(&format!("node {}: unknown op ignored: {text}", self.identifier()))
                    .await;
                return;
            }
            Err(err) => {
                warn!(node = %self.identifier(), "bad frame: {err}");
                self.events
                    .node_error(self.identifier(), &err, "frame parse")
                    .await;
                return;
            }
        };

        match message {
            IncomingMessage::Ready {
                resumed,
                session_id,
            } => {
                info!(node = %self.identifier(), %session_id, resumed, "session ready");
                self.session.set(session_id.clone());
                self.reconnect_attempt.store(0, Ordering::Release);
                *self.state.write() = NodeState::Ready;
                self.events
                    .node_ready(self.identifier(), &session_id, resumed)
                    .await;

                if !resumed && self.config.resume_key.is_some() {
                    let update = SessionUpdate {
                        resuming: Some(true),
                        timeout: Some(self.config.resume_timeout_secs),
                    };
                    if let Err(err) = self.rest.update_session(&update).await {
                        warn!(node = %self.identifier(), "failed to enable resuming: {err}");
                    }
                }
            }
            IncomingMessage::Stats(stats) => {
                *self.stats.write() = Some(stats.clone());
                self.events.node_stats(self.identifier(), &stats).await;
            }
            IncomingMessage::PlayerUpdate { guild_id, state } => {
                let Ok(guild_id) = guild_id.parse::<u64>() else {
                    warn!(node = %self.identifier(), %guild_id, "unparseable guild id");
                    return;
                };
                if let Some(observer) = self.observer() {
                    observer.dispatch_player_update(guild_id, state).await;
                }
            }
            IncomingMessage::Event { guild_id, event } => {
                let Ok(guild_id) = guild_id.parse::<u64>() else {
                    warn!(node = %self.identifier(), %guild_id, "unparseable guild id");
                    return;
                };
                if let Some(observer) = self.observer() {
                    observer.dispatch_event(guild_id, event).await;
                }
            }
        }
    }

    fn drop_connection(&self) {
        // Resumable sessions keep their id so the next dial can pick the
        // session back up; everything else starts from scratch.
        if self.config.resume_key.is_none() {
            self.session.clear();
        }
        let mut state = self.state.write();
        if *state != NodeState::Destroyed {
            *state = NodeState::Closed;
        }
    }

    async fn fail_permanently(self: &Arc<Self>, error: Error) {
        error!(node = %self.identifier(), "node permanently failed: {error}");
        self.permanently_failed.store(true, Ordering::Release);
        self.events
            .node_error(self.identifier(), &error, "permanent failure")
            .await;
        if let Some(observer) = self.observer() {
            observer.node_disconnected(self, true).await;
        }
    }
}

enum SessionEnd {
    CallerClosed,
    Remote {
        code: Option<u16>,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::NullEventHandler,
        protocol::{CpuStats, FrameStats, MemoryStats},
    };

    fn test_node(config: NodeConfig) -> Arc<Node> {
        Node::new(config, Arc::new(NullEventHandler)).unwrap()
    }

    fn stats(players: u32, system_load: f64, cores: u32, used_mib: u64) -> Stats {
        Stats {
            players,
            playing_players: players,
            uptime: 1,
            memory: MemoryStats {
                free: 0,
                used: used_mib * 1024 * 1024,
                allocated: 0,
                reservable: 0,
            },
            cpu: CpuStats {
                cores,
                system_load,
                lavalink_load: 0.0,
            },
            frame_stats: None,
        }
    }

    #[test]
    fn test_penalty_is_infinite_until_ready() {
        let node = test_node(NodeConfig::default());
        assert!(node.penalty().is_infinite());
        assert!(!node.is_ready());
    }

    #[test]
    fn test_penalty_formula() {
        let node = test_node(NodeConfig::default());
        node.test_force_ready(Some(stats(5, 0.10, 4, 500)));

        // 5 players + round(1.05^2.5 * 10 - 10) + 500 MiB
        let expected = 5.0 + (1.05f64.powf(2.5) * 10.0 - 10.0).round() + 500.0;
        assert_eq!(node.penalty(), expected);
    }

    #[test]
    fn test_penalty_counts_frame_losses() {
        let node = test_node(NodeConfig::default());
        let mut healthy = stats(0, 0.0, 4, 0);
        healthy.frame_stats = Some(FrameStats {
            sent: 3000,
            nulled: 600,
            deficit: 300,
        });
        node.test_force_ready(Some(healthy));

        // deficit/3000 + 2*nulled/3000 = 0.1 + 0.4
        assert!((node.penalty() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_penalty_without_stats_is_player_count() {
        let node = test_node(NodeConfig::default());
        node.test_force_ready(None);
        node.players.insert(1, ());
        node.players.insert(2, ());
        assert_eq!(node.penalty(), 2.0);
    }

    #[test]
    fn test_disconnect_purges_session_without_resume_key() {
        let node = test_node(NodeConfig::default());
        node.test_force_ready(None);
        assert!(node.session_id().is_some());

        node.disconnect();
        assert!(node.session_id().is_none());
        assert_eq!(node.state(), NodeState::Closed);
    }

    #[test]
    fn test_disconnect_keeps_session_with_resume_key() {
        let node = test_node(NodeConfig {
            resume_key: Some("k".to_string()),
            ..NodeConfig::default()
        });
        node.test_force_ready(None);

        node.disconnect();
        assert_eq!(node.session_id().as_deref(), Some("test-session"));
    }

    #[test]
    fn test_destroy_clears_players_and_blocks_connect() {
        let node = test_node(NodeConfig::default());
        node.players.insert(42, ());
        node.destroy();

        assert_eq!(node.player_count(), 0);
        assert_eq!(node.state(), NodeState::Destroyed);
    }

    #[test]
    fn test_permanent_close_codes() {
        for code in [4004u16, 4005, 4006, 4009, 4015, 4016] {
            assert!(PERMANENT_CLOSE_CODES.contains(&code));
        }
        assert!(!PERMANENT_CLOSE_CODES.contains(&1006));
        assert!(!PERMANENT_CLOSE_CODES.contains(&1000));
    }

    #[test]
    fn test_handshake_headers() {
        let node = test_node(NodeConfig {
            resume_key: Some("resume-me".to_string()),
            ..NodeConfig::default()
        });

        // No session remembered yet: the resume key is announced.
        let request = node.handshake_request(777).unwrap();
        let headers = request.headers();
        assert_eq!(headers.get("Authorization").unwrap(), "youshallnotpass");
        assert_eq!(headers.get("User-Id").unwrap(), "777");
        assert!(headers.get("Client-Name").is_some());
        assert_eq!(headers.get("Resume-Key").unwrap(), "resume-me");
        assert!(headers.get("Session-Id").is_none());

        // With a session id remembered, it wins over the resume key.
        node.session.set("s1".to_string());
        let request = node.handshake_request(777).unwrap();
        let headers = request.headers();
        assert_eq!(headers.get("Session-Id").unwrap(), "s1");
        assert!(headers.get("Resume-Key").is_none());
    }
}
