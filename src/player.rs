use parking_lot::{Mutex, RwLock};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{
    config::PlayerConfig,
    error::{Error, Result},
    events::{EventHandler, VoicePayloadSender},
    node::Node,
    protocol::{
        PlayerUpdateState, Severity, TrackEndReason, TrackEvent, UpdatePlayer,
        VoiceConnectPayload, VoiceState,
    },
    queue::{LoopMode, Queue, QueuedTrack},
};

/// How long the platform gets to answer a voice-connect before the attempt
/// is abandoned.
const VOICE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// Voice close codes after which the voice session cannot be salvaged.
const FATAL_VOICE_CLOSE_CODES: [u16; 3] = [4004, 4006, 4014];

/// Where a player is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    /// Created, never connected to voice.
    Instantiated,
    /// Voice-connect sent, waiting for the platform's voice state.
    Connecting,
    /// Voice state received, waiting for the platform's voice server.
    WaitingForServer,
    Stopped,
    Playing,
    Paused,
    /// Voice dropped on the platform side.
    Disconnected,
    /// The node lost its voice connection for this guild.
    DisconnectedLavalink,
    /// The voice handshake failed or timed out.
    ConnectionFailed,
    Destroyed,
}

/// Options for [`Player::play`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PlayOptions {
    /// Don't interrupt the server if it is already playing this track.
    pub no_replace: bool,
    /// Start position in milliseconds, clamped to the track length.
    pub position: Option<u64>,
    /// Stop at this position; dropped unless strictly greater than the
    /// start position.
    pub end_time: Option<u64>,
    /// Start paused.
    pub paused: bool,
}

/// What the manager gives a player to reach back: the bot identity and the
/// ability to drop the player from the registry on destruction.
pub(crate) trait PlayerHost: Send + Sync {
    fn user_id(&self) -> Option<u64>;
    fn forget_player(&self, guild_id: u64);
}

#[derive(Debug, Default, Clone)]
struct VoiceContext {
    channel_id: Option<u64>,
    session_id: Option<String>,
    token: Option<String>,
    /// Bare hostname, already normalized.
    endpoint: Option<String>,
    connected: bool,
}

impl VoiceContext {
    fn as_voice_state(&self) -> Option<VoiceState> {
        Some(VoiceState {
            token: self.token.clone()?,
            endpoint: self.endpoint.clone()?,
            session_id: self.session_id.clone()?,
        })
    }
}

#[derive(Debug)]
struct Playback {
    playing: bool,
    paused: bool,
    volume: u16,
    last_position: u64,
    updated_at: Instant,
    ping: i64,
}

/// Per-guild playback: one voice connection, one queue, one node binding.
///
/// Commands that talk to the node (`play`, `stop`, `pause`, `seek`, ...)
/// serialize on an internal gate, so their REST round-trips never interleave
/// for the same guild.
pub struct Player {
    guild_id: u64,
    config: PlayerConfig,

    node: RwLock<Arc<Node>>,
    queue: Mutex<Queue>,
    state: RwLock<PlayerState>,
    voice: RwLock<VoiceContext>,
    playback: RwLock<Playback>,

    /// Serializes command REST round-trips per player.
    command_gate: tokio::sync::Mutex<()>,
    /// Resolver for the single in-flight `connect()`.
    connect_waiter: Mutex<Option<oneshot::Sender<Result<()>>>>,
    moving: AtomicBool,

    sender: Arc<dyn VoicePayloadSender>,
    events: Arc<dyn EventHandler>,
    host: Weak<dyn PlayerHost>,
}

impl Player {
    pub(crate) fn new(
        guild_id: u64,
        node: Arc<Node>,
        config: PlayerConfig,
        sender: Arc<dyn VoicePayloadSender>,
        events: Arc<dyn EventHandler>,
        host: Weak<dyn PlayerHost>,
    ) -> Arc<Self> {
        node.players.insert(guild_id, ());
        Arc::new(Self {
            guild_id,
            config,
            node: RwLock::new(node),
            queue: Mutex::new(Queue::new()),
            state: RwLock::new(PlayerState::Instantiated),
            voice: RwLock::new(VoiceContext::default()),
            playback: RwLock::new(Playback {
                playing: false,
                paused: false,
                volume: config.initial_volume.min(1000),
                last_position: 0,
                updated_at: Instant::now(),
                ping: -1,
            }),
            command_gate: tokio::sync::Mutex::new(()),
            connect_waiter: Mutex::new(None),
            moving: AtomicBool::new(false),
            sender,
            events,
            host,
        })
    }

    pub fn guild_id(&self) -> u64 {
        self.guild_id
    }

    pub fn state(&self) -> PlayerState {
        *self.state.read()
    }

    pub fn node(&self) -> Arc<Node> {
        self.node.read().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == PlayerState::Destroyed
    }

    pub fn voice_channel_id(&self) -> Option<u64> {
        self.voice.read().channel_id
    }

    pub fn paused(&self) -> bool {
        self.playback.read().paused
    }

    pub fn volume(&self) -> u16 {
        self.playback.read().volume
    }

    /// Voice gateway ping as last reported by the node, -1 when unknown.
    pub fn ping(&self) -> i64 {
        self.playback.read().ping
    }

    /// Runs `f` against this player's queue.
    pub fn with_queue<T>(&self, f: impl FnOnce(&mut Queue) -> T) -> T {
        f(&mut self.queue.lock())
    }

    pub fn current_track(&self) -> Option<QueuedTrack> {
        self.queue.lock().current().cloned()
    }

    /// Best-effort playback position in milliseconds.
    ///
    /// While playing this extrapolates from the last server report by
    /// wall-clock; paused or stopped players report the last position as-is.
    pub fn current_position(&self) -> u64 {
        let playback = self.playback.read();
        self.current_position_inner(&playback)
    }

    // --- voice handshake ---------------------------------------------------

    /// Joins a voice channel.
    ///
    /// Sends the platform voice-connect payload and waits for the voice
    /// state / voice server callbacks to complete the handshake against the
    /// node. Fails after 20 s without them; the player is then torn down.
    pub async fn connect(&self, channel_id: u64) -> Result<()> {
        match self.state() {
            PlayerState::Instantiated
            | PlayerState::Disconnected
            | PlayerState::ConnectionFailed
            | PlayerState::DisconnectedLavalink => {}
            other => {
                return Err(Error::precondition(format!(
                    "cannot start a voice connection from {other:?}"
                )))
            }
        }
        if self.host_user_id().is_none() {
            return Err(Error::config("bot user id is not known yet"));
        }

        let receiver = {
            let mut waiter = self.connect_waiter.lock();
            if waiter.is_some() {
                return Err(Error::precondition("a voice connection is already in flight"));
            }
            let (tx, rx) = oneshot::channel();
            *waiter = Some(tx);
            rx
        };

        *self.state.write() = PlayerState::Connecting;
        self.voice.write().channel_id = Some(channel_id);

        let payload = VoiceConnectPayload::join(
            self.guild_id,
            channel_id,
            self.config.self_mute,
            self.config.self_deaf,
        );
        if let Err(err) = self.sender.send_voice_update(self.guild_id, payload).await {
            self.connect_waiter.lock().take();
            *self.state.write() = PlayerState::ConnectionFailed;
            return Err(Error::config(format!("voice payload send failed: {err}")));
        }

        debug!(guild = self.guild_id, channel = channel_id, "voice handshake started");
        match tokio::time::timeout(VOICE_HANDSHAKE_TIMEOUT, receiver).await {
            Ok(Ok(result)) => match result {
                Ok(()) => Ok(()),
                Err(err) => {
                    if !self.is_destroyed() {
                        *self.state.write() = PlayerState::ConnectionFailed;
                        self.destroy().await;
                    }
                    Err(err)
                }
            },
            // Resolver dropped: the player was torn down underneath us.
            Ok(Err(_)) => Err(Error::PlayerDestroyed),
            Err(_) => {
                warn!(guild = self.guild_id, "voice handshake timed out");
                self.connect_waiter.lock().take();
                if !self.is_destroyed() {
                    *self.state.write() = PlayerState::ConnectionFailed;
                    self.destroy().await;
                }
                Err(Error::ConnectionTimeout)
            }
        }
    }

    /// Platform voice state for our bot user in this guild.
    pub(crate) async fn voice_state_update(
        &self,
        channel_id: Option<u64>,
        session_id: String,
    ) {
        if self.is_destroyed() {
            return;
        }

        let (needs_patch, requested_channel) = {
            let mut voice = self.voice.write();
            let requested = voice.channel_id;
            let changed = voice.session_id.as_deref() != Some(session_id.as_str());
            voice.session_id = Some(session_id);
            if let Some(channel) = channel_id {
                voice.channel_id = Some(channel);
            }
            // A new platform session id invalidates the voice server's view;
            // re-send the cached credentials when we have them.
            (
                changed && voice.token.is_some() && voice.endpoint.is_some(),
                requested,
            )
        };

        if self.state() == PlayerState::Connecting
            && channel_id.is_some()
            && channel_id == requested_channel
        {
            *self.state.write() = PlayerState::WaitingForServer;
            debug!(guild = self.guild_id, "voice state received, waiting for server");
        }

        if needs_patch {
            self.push_voice_to_node().await;
        }
    }

    /// Platform voice server endpoint + token for this guild.
    pub(crate) async fn voice_server_update(&self, token: String, endpoint: String) {
        if self.is_destroyed() {
            return;
        }
        {
            let mut voice = self.voice.write();
            voice.token = Some(token);
            voice.endpoint = Some(normalize_endpoint(&endpoint));
        }
        self.push_voice_to_node().await;
    }

    /// PATCHes the assembled voice credentials at the node, completing the
    /// handshake if one is in flight.
    async fn push_voice_to_node(&self) {
        let Some(voice_state) = self.voice.read().as_voice_state() else {
            debug!(guild = self.guild_id, "voice credentials incomplete, waiting");
            return;
        };

        let update = UpdatePlayer {
            voice: Some(voice_state),
            volume: Some(self.playback.read().volume),
            ..UpdatePlayer::default()
        };
        let node = self.node();
        let result = node.rest().update_player(self.guild_id, &update, false).await;

        match result {
            Ok(_) => {
                info!(guild = self.guild_id, node = %node.identifier(), "voice connected");
                self.voice.write().connected = true;
                if matches!(
                    self.state(),
                    PlayerState::Connecting | PlayerState::WaitingForServer
                ) {
                    *self.state.write() = PlayerState::Stopped;
                }
                self.resolve_connect(Ok(()));
            }
            Err(err) => {
                warn!(guild = self.guild_id, "voice update rejected: {err}");
                self.resolve_connect(Err(err));
            }
        }
    }

    fn resolve_connect(&self, result: Result<()>) {
        if let Some(waiter) = self.connect_waiter.lock().take() {
            let _ = waiter.send(result);
        }
    }

    /// Leaves the voice channel without destroying the player.
    pub async fn disconnect(&self) {
        let payload = VoiceConnectPayload::leave(self.guild_id);
        if let Err(err) = self.sender.send_voice_update(self.guild_id, payload).await {
            warn!(guild = self.guild_id, "voice leave failed: {err}");
        }
        {
            let mut voice = self.voice.write();
            *voice = VoiceContext::default();
        }
        let mut state = self.state.write();
        if *state != PlayerState::Destroyed {
            *state = PlayerState::Disconnected;
        }
    }

    // --- playback commands ---------------------------------------------------

    /// Starts a track, or the next queued one when `track` is `None`.
    pub async fn play(&self, track: Option<QueuedTrack>, options: PlayOptions) -> Result<()> {
        let _gate = self.command_gate.lock().await;
        self.play_locked(track, options).await
    }

    async fn play_locked(&self, track: Option<QueuedTrack>, options: PlayOptions) -> Result<()> {
        match self.state() {
            PlayerState::Stopped
            | PlayerState::Playing
            | PlayerState::Paused
            | PlayerState::WaitingForServer => {}
            other => {
                return Err(Error::precondition(format!("cannot play from {other:?}")))
            }
        }
        let node = self.node();
        if !node.is_ready() {
            return Err(Error::precondition("node is not ready"));
        }

        let track = match track {
            Some(track) => Some(track),
            None => {
                let mut queue = self.queue.lock();
                queue.poll().or_else(|| queue.current().cloned())
            }
        };
        let Some(track) = track else {
            debug!(guild = self.guild_id, "nothing to play, queue is empty");
            self.events.queue_end(self.guild_id).await;
            *self.state.write() = PlayerState::Stopped;
            return Ok(());
        };

        let playing_same = {
            let playback = self.playback.read();
            playback.playing
                && self
                    .queue
                    .lock()
                    .current()
                    .is_some_and(|current| current.track.encoded == track.track.encoded)
        };
        if options.no_replace && playing_same {
            debug!(guild = self.guild_id, "already playing this track, no-op");
            return Ok(());
        }

        let length = track.track.info.length;
        let position = options.position.map(|p| p.min(length));
        let end_time = options
            .end_time
            .filter(|&end| end > position.unwrap_or(0));

        let update = UpdatePlayer {
            encoded_track: Some(Some(track.track.encoded.clone())),
            position,
            end_time,
            paused: Some(options.paused),
            ..UpdatePlayer::default()
        };
        // `noReplace` only protects an idle server view; a deliberate switch
        // to a different track replaces regardless.
        let no_replace = options.no_replace && !self.playback.read().playing;
        node.rest()
            .update_player(self.guild_id, &update, no_replace)
            .await?;

        // Poll-derived tracks are already current; advancing again is a
        // no-op for them. Caller-supplied tracks become current here.
        self.queue.lock().advance_to(track);
        // State stays as-is: PLAYING is entered when the server confirms
        // with its TrackStartEvent.
        Ok(())
    }

    /// Stops playback; optionally clears the queue.
    pub async fn stop(&self, clear_queue: bool) -> Result<()> {
        let _gate = self.command_gate.lock().await;
        self.stop_locked(clear_queue).await
    }

    async fn stop_locked(&self, clear_queue: bool) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::PlayerDestroyed);
        }

        {
            let mut queue = self.queue.lock();
            queue.end_current();
            if clear_queue {
                queue.clear();
            }
        }
        {
            let mut playback = self.playback.write();
            playback.playing = false;
            playback.last_position = 0;
            playback.updated_at = Instant::now();
        }
        *self.state.write() = PlayerState::Stopped;

        let node = self.node();
        if node.is_ready() {
            let update = UpdatePlayer {
                encoded_track: Some(None),
                ..UpdatePlayer::default()
            };
            node.rest().update_player(self.guild_id, &update, false).await?;
        }
        Ok(())
    }

    /// Pauses or resumes. Idempotent: repeating the current state is a
    /// no-op with no server call.
    pub async fn pause(&self, paused: bool) -> Result<()> {
        let _gate = self.command_gate.lock().await;

        if self.playback.read().paused == paused {
            return Ok(());
        }
        if self.queue.lock().current().is_none() {
            return Err(Error::precondition("no track to pause or resume"));
        }
        let node = self.node();
        if !node.is_ready() {
            return Err(Error::precondition("node is not ready"));
        }

        let update = UpdatePlayer {
            paused: Some(paused),
            ..UpdatePlayer::default()
        };
        node.rest().update_player(self.guild_id, &update, false).await?;

        // Freeze the extrapolated position at the flip, then restart the
        // clock from here.
        let frozen = self.current_position();
        {
            let mut playback = self.playback.write();
            playback.paused = paused;
            playback.last_position = frozen;
            playback.updated_at = Instant::now();
        }
        let mut state = self.state.write();
        match (*state, paused) {
            (PlayerState::Playing, true) => *state = PlayerState::Paused,
            (PlayerState::Paused, false) => *state = PlayerState::Playing,
            _ => {}
        }
        Ok(())
    }

    /// Seeks within the current track.
    pub async fn seek(&self, position_ms: u64) -> Result<()> {
        let _gate = self.command_gate.lock().await;

        let length = {
            let queue = self.queue.lock();
            let current = queue
                .current()
                .ok_or_else(|| Error::precondition("no track to seek in"))?;
            if !current.track.info.is_seekable {
                return Err(Error::precondition("track is not seekable"));
            }
            current.track.info.length
        };
        let node = self.node();
        if !node.is_ready() {
            return Err(Error::precondition("node is not ready"));
        }

        let position = position_ms.min(length);
        let update = UpdatePlayer {
            position: Some(position),
            ..UpdatePlayer::default()
        };
        node.rest().update_player(self.guild_id, &update, false).await?;

        // Optimistic local position for immediate reads; the next
        // playerUpdate from the server overwrites it anyway.
        let mut playback = self.playback.write();
        playback.last_position = position;
        playback.updated_at = Instant::now();
        Ok(())
    }

    /// Sets the volume, clamped to `[0, 1000]`. Unchanged values are no-ops.
    pub async fn set_volume(&self, volume: i32) -> Result<()> {
        let _gate = self.command_gate.lock().await;

        let volume = volume.clamp(0, 1000) as u16;
        if self.playback.read().volume == volume {
            return Ok(());
        }
        let node = self.node();
        if !node.is_ready() {
            return Err(Error::precondition("node is not ready"));
        }

        let update = UpdatePlayer {
            volume: Some(volume),
            ..UpdatePlayer::default()
        };
        node.rest().update_player(self.guild_id, &update, false).await?;
        self.playback.write().volume = volume;
        Ok(())
    }

    /// Changes the loop mode. Purely local; the server is not involved.
    pub fn set_loop(&self, mode: LoopMode) {
        self.queue.lock().set_loop(mode);
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.queue.lock().loop_mode()
    }

    /// Opaque filter passthrough (`filters` field of the player PATCH).
    pub async fn set_filters(&self, filters: serde_json::Value) -> Result<()> {
        let _gate = self.command_gate.lock().await;

        let node = self.node();
        if !node.is_ready() {
            return Err(Error::precondition("node is not ready"));
        }
        let update = UpdatePlayer {
            filters: Some(filters),
            ..UpdatePlayer::default()
        };
        node.rest().update_player(self.guild_id, &update, false).await?;
        Ok(())
    }

    /// Jumps to the next queued track, or stops when there is none.
    ///
    /// The loop mode does not apply: skipping a looped track really skips it.
    pub async fn skip(&self) -> Result<()> {
        let _gate = self.command_gate.lock().await;

        let next = self.queue.lock().force_next();
        match next {
            Some(next) => self.play_locked(Some(next), PlayOptions::default()).await,
            None => self.stop_locked(false).await,
        }
    }

    // --- server events -------------------------------------------------------

    /// Realtime state pushed by the node.
    pub(crate) async fn player_update(&self, state: PlayerUpdateState) {
        if self.is_destroyed() {
            return;
        }
        {
            let mut playback = self.playback.write();
            playback.last_position = state.position;
            playback.updated_at = Instant::now();
            playback.ping = state.ping;
        }
        self.voice.write().connected = state.connected;
        self.events.player_state_update(self.guild_id, &state).await;
    }

    /// Playback event pushed by the node. Runs under the command gate so it
    /// cannot interleave with a caller-issued command.
    pub(crate) async fn handle_event(self: &Arc<Self>, event: TrackEvent) {
        if self.is_destroyed() {
            return;
        }
        let _gate = self.command_gate.lock().await;
        if self.is_destroyed() {
            return;
        }

        match event {
            TrackEvent::TrackStart { track } => {
                {
                    let mut playback = self.playback.write();
                    playback.playing = true;
                    playback.paused = false;
                    playback.last_position = 0;
                    playback.updated_at = Instant::now();
                }
                *self.state.write() = PlayerState::Playing;
                info!(guild = self.guild_id, title = %track.info.title, "track started");
                self.events.track_start(self.guild_id, &track).await;
            }

            TrackEvent::TrackEnd { track, reason } => {
                if reason != TrackEndReason::Replaced {
                    self.reset_after_track();
                }
                // The event's track is authoritative: on a `replaced` end the
                // queue's current already points at the successor.
                self.events
                    .track_end(self.guild_id, Some(&track), reason)
                    .await;
                self.progress_queue(reason).await;
            }

            TrackEvent::TrackException { track, exception } => {
                self.reset_after_track();
                warn!(
                    guild = self.guild_id,
                    severity = ?exception.severity,
                    "track exception: {}",
                    exception.message.as_deref().unwrap_or("unknown")
                );
                self.events
                    .track_exception(self.guild_id, &track, &exception)
                    .await;
                if exception.severity == Severity::Fault {
                    // The server itself broke; nothing sensible to resume.
                    self.destroy().await;
                    return;
                }
                self.progress_queue(TrackEndReason::LoadFailed).await;
            }

            TrackEvent::TrackStuck { track, threshold_ms } => {
                self.reset_after_track();
                warn!(guild = self.guild_id, threshold_ms, "track stuck");
                self.events
                    .track_stuck(self.guild_id, &track, threshold_ms)
                    .await;
                self.progress_queue(TrackEndReason::LoadFailed).await;
            }

            TrackEvent::WebSocketClosed {
                code,
                reason,
                by_remote,
            } => {
                self.voice.write().connected = false;
                {
                    let mut state = self.state.write();
                    if *state != PlayerState::Destroyed {
                        *state = PlayerState::DisconnectedLavalink;
                    }
                }
                warn!(guild = self.guild_id, code, %reason, by_remote, "voice websocket closed");
                self.events
                    .player_websocket_closed(self.guild_id, code, &reason, by_remote)
                    .await;
                if FATAL_VOICE_CLOSE_CODES.contains(&code) {
                    self.destroy().await;
                }
            }
        }
    }

    fn reset_after_track(&self) {
        {
            let mut playback = self.playback.write();
            playback.playing = false;
            playback.last_position = 0;
            playback.updated_at = Instant::now();
        }
        let mut state = self.state.write();
        if *state != PlayerState::Destroyed {
            *state = PlayerState::Stopped;
        }
    }

    /// Decides what plays after a track ended with `reason`. Assumes the
    /// command gate is held.
    async fn progress_queue(&self, reason: TrackEndReason) {
        // Deliberate stops and replacements drive their own follow-up.
        if matches!(
            reason,
            TrackEndReason::Stopped | TrackEndReason::Replaced | TrackEndReason::Cleanup
        ) {
            return;
        }

        let loop_mode = self.queue.lock().loop_mode();
        if loop_mode == LoopMode::Track && reason == TrackEndReason::Finished {
            let current = self.queue.lock().current().cloned();
            if let Some(current) = current {
                if let Err(err) = self.play_locked(Some(current), PlayOptions::default()).await {
                    warn!(guild = self.guild_id, "track replay failed: {err}");
                }
                return;
            }
        }

        let next = {
            let mut queue = self.queue.lock();
            if loop_mode == LoopMode::Track {
                // The looped track cannot continue (load failure); move on
                // linearly instead of replaying it forever.
                queue.force_next()
            } else {
                queue.poll()
            }
        };

        match next {
            Some(next) => {
                if let Err(err) = self.play_locked(Some(next), PlayOptions::default()).await {
                    warn!(guild = self.guild_id, "queue advance failed: {err}");
                }
            }
            None => {
                self.queue.lock().end_current();
                *self.state.write() = PlayerState::Stopped;
                self.events.queue_end(self.guild_id).await;
                info!(guild = self.guild_id, "queue ended");

                // The server should already be idle; make sure of it.
                let node = self.node();
                if node.is_ready() {
                    let update = UpdatePlayer {
                        encoded_track: Some(None),
                        ..UpdatePlayer::default()
                    };
                    if let Err(err) =
                        node.rest().update_player(self.guild_id, &update, false).await
                    {
                        debug!(guild = self.guild_id, "idle confirm failed: {err}");
                    }
                }
            }
        }
    }

    // --- node transfer ---------------------------------------------------------

    /// Rebinds this player to another node, carrying position, volume,
    /// pause state and voice credentials so playback resumes where it was.
    pub async fn move_to_node(self: &Arc<Self>, target: Arc<Node>) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::PlayerDestroyed);
        }
        if !target.is_ready() {
            return Err(Error::precondition("target node is not ready"));
        }
        {
            let current = self.node();
            if current.identifier() == target.identifier() {
                return Err(Error::precondition("player is already on that node"));
            }
        }
        if self.moving.swap(true, Ordering::AcqRel) {
            return Err(Error::precondition("a node transfer is already in progress"));
        }

        let _gate = self.command_gate.lock().await;
        let result = self.move_to_node_locked(&target).await;
        self.moving.store(false, Ordering::Release);

        if result.is_err() {
            warn!(guild = self.guild_id, "node transfer failed, destroying player");
            self.destroy().await;
        }
        result
    }

    async fn move_to_node_locked(&self, target: &Arc<Node>) -> Result<()> {
        let old = self.node();

        let update = {
            let playback = self.playback.read();
            UpdatePlayer {
                encoded_track: Some(
                    self.queue
                        .lock()
                        .current()
                        .map(|item| item.track.encoded.clone()),
                ),
                position: Some(self.current_position_inner(&playback)),
                volume: Some(playback.volume),
                paused: Some(playback.paused),
                // Voice rides along only when complete; otherwise the player
                // stays voice-less until the platform re-issues its events.
                voice: self.voice.read().as_voice_state(),
                ..UpdatePlayer::default()
            }
        };

        if old.is_ready() {
            if let Err(err) = old.rest().destroy_player(self.guild_id).await {
                debug!(guild = self.guild_id, old = %old.identifier(), "old node cleanup failed: {err}");
            }
        }

        old.players.remove(&self.guild_id);
        target.players.insert(self.guild_id, ());
        *self.node.write() = target.clone();

        target.rest().update_player(self.guild_id, &update, false).await?;

        info!(
            guild = self.guild_id,
            from = %old.identifier(),
            to = %target.identifier(),
            "player moved"
        );
        self.events
            .player_move(self.guild_id, old.identifier(), target.identifier())
            .await;
        Ok(())
    }

    // --- teardown ----------------------------------------------------------------

    /// Tears the player down: leaves voice, removes the server-side player,
    /// rejects any in-flight connect and unregisters from the manager.
    /// Idempotent; events for this guild are discarded from here on.
    pub async fn destroy(&self) {
        {
            let mut state = self.state.write();
            if *state == PlayerState::Destroyed {
                return;
            }
            *state = PlayerState::Destroyed;
        }
        info!(guild = self.guild_id, "destroying player");

        if let Some(waiter) = self.connect_waiter.lock().take() {
            let _ = waiter.send(Err(Error::PlayerDestroyed));
        }

        let payload = VoiceConnectPayload::leave(self.guild_id);
        if let Err(err) = self.sender.send_voice_update(self.guild_id, payload).await {
            debug!(guild = self.guild_id, "voice leave during destroy failed: {err}");
        }

        let node = self.node();
        node.players.remove(&self.guild_id);
        if node.is_ready() {
            // Best effort: the node may be gone, that's fine.
            if let Err(err) = node.rest().destroy_player(self.guild_id).await {
                debug!(guild = self.guild_id, "server-side destroy failed: {err}");
            }
        }

        if let Some(host) = self.host.upgrade() {
            host.forget_player(self.guild_id);
        }
        self.events.player_destroy(self.guild_id).await;
    }

    fn host_user_id(&self) -> Option<u64> {
        self.host.upgrade()?.user_id()
    }

    fn current_position_inner(&self, playback: &Playback) -> u64 {
        let length = self
            .queue
            .lock()
            .current()
            .map_or(u64::MAX, |item| item.track.info.length);
        if self.state() == PlayerState::Playing && !playback.paused {
            let elapsed = playback.updated_at.elapsed().as_millis() as u64;
            playback.last_position.saturating_add(elapsed).min(length)
        } else {
            playback.last_position.min(length)
        }
    }
}

/// Strips scheme and port from a platform voice endpoint, leaving the bare
/// hostname the node expects.
pub(crate) fn normalize_endpoint(endpoint: &str) -> String {
    let host = endpoint
        .split_once("://")
        .map_or(endpoint, |(_, rest)| rest);
    let host = host.split('/').next().unwrap_or(host);
    host.rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
        .map_or(host, |(name, _)| name)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::NodeConfig,
        events::NullEventHandler,
        protocol::{Track, TrackInfo},
    };
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct RecordingSender {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl VoicePayloadSender for RecordingSender {
        async fn send_voice_update(
            &self,
            _guild_id: u64,
            _payload: VoiceConnectPayload,
        ) -> anyhow::Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StubHost;

    impl PlayerHost for StubHost {
        fn user_id(&self) -> Option<u64> {
            Some(1)
        }
        fn forget_player(&self, _guild_id: u64) {}
    }

    fn test_player() -> (Arc<Player>, Arc<dyn PlayerHost>, Arc<RecordingSender>) {
        let events: Arc<dyn EventHandler> = Arc::new(NullEventHandler);
        let node = Node::new(NodeConfig::default(), events.clone()).unwrap();
        let host: Arc<dyn PlayerHost> = Arc::new(StubHost);
        let sender = Arc::new(RecordingSender {
            sent: AtomicUsize::new(0),
        });
        let player = Player::new(
            42,
            node,
            PlayerConfig::default(),
            sender.clone(),
            events,
            Arc::downgrade(&host),
        );
        (player, host, sender)
    }

    fn test_track(encoded: &str, seekable: bool) -> QueuedTrack {
        QueuedTrack::from(Track {
            encoded: encoded.to_string(),
            info: TrackInfo {
                identifier: encoded.to_string(),
                is_seekable: seekable,
                author: "a".to_string(),
                length: 1_000,
                is_stream: false,
                position: 0,
                title: "t".to_string(),
                uri: None,
                artwork_url: None,
                isrc: None,
                source_name: "youtube".to_string(),
            },
            plugin_info: None,
            user_data: None,
        })
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("eu.example:443"), "eu.example");
        assert_eq!(normalize_endpoint("wss://eu.example:443"), "eu.example");
        assert_eq!(normalize_endpoint("https://us-west.example.com"), "us-west.example.com");
        assert_eq!(normalize_endpoint("plain.host"), "plain.host");
        assert_eq!(normalize_endpoint("wss://h.example:443/path"), "h.example");
    }

    #[tokio::test]
    async fn test_play_requires_connected_state() {
        let (player, _host, _sender) = test_player();
        // Player starts Instantiated; play is a wrong-state precondition.
        let err = player
            .play(Some(test_track("x", true)), PlayOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn test_pause_without_track_is_precondition() {
        let (player, _host, _sender) = test_player();
        let err = player.pause(true).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));

        // Repeating the current pause state short-circuits before any
        // precondition check: it is a no-op.
        assert!(player.pause(false).await.is_ok());
    }

    #[tokio::test]
    async fn test_seek_preconditions() {
        let (player, _host, _sender) = test_player();
        let err = player.seek(500).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));

        player.with_queue(|queue| {
            queue.add(test_track("nonseek", false));
            queue.poll();
        });
        let err = player.seek(500).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn test_set_volume_dedupes() {
        let (player, _host, _sender) = test_player();
        // Default volume is 100; clamped duplicates never reach the node
        // (which would fail: it is not even connected).
        assert!(player.set_volume(100).await.is_ok());
        // Out-of-range values clamp, then dedupe the same way.
        let err = player.set_volume(9_999).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_))); // 1000 != 100, node not ready
        assert!(player.set_volume(-5).await.is_err()); // clamps to 0, node not ready
    }

    #[tokio::test]
    async fn test_connect_rejects_double_attempts() {
        let (player, _host, sender) = test_player();

        let racer = player.clone();
        let first = tokio::spawn(async move { racer.connect(7).await });
        // Give the first connect time to park on the handshake.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = player.connect(7).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert_eq!(sender.sent.load(Ordering::SeqCst), 1);

        // Tear down: destroying rejects the in-flight handshake.
        player.destroy().await;
        let result = first.await.unwrap();
        assert!(matches!(result, Err(Error::PlayerDestroyed)));
        assert!(player.is_destroyed());
    }

    #[tokio::test]
    async fn test_destroyed_player_discards_events() {
        let (player, _host, _sender) = test_player();
        player.destroy().await;

        // Nothing panics, nothing changes.
        player
            .player_update(PlayerUpdateState {
                time: 0,
                position: 123,
                connected: true,
                ping: 1,
            })
            .await;
        assert_eq!(player.current_position(), 0);
        assert!(player.is_destroyed());
    }

    #[tokio::test]
    async fn test_connect_wrong_state() {
        let (player, _host, _sender) = test_player();
        player.destroy().await;
        let err = player.connect(7).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }
}
