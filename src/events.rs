use async_trait::async_trait;

use crate::protocol::{
    Exception, PlayerUpdateState, Stats, Track, TrackEndReason, VoiceConnectPayload,
};

/// Host-supplied hook that pushes a voice-connect payload (gateway opcode 4)
/// onto the chat platform for us.
///
/// The library never talks to the platform gateway itself; joining or
/// leaving a voice channel always goes through this trait. Failures are
/// opaque to the library, hence `anyhow`.
#[async_trait]
pub trait VoicePayloadSender: Send + Sync {
    async fn send_voice_update(
        &self,
        guild_id: u64,
        payload: VoiceConnectPayload,
    ) -> anyhow::Result<()>;
}

/// Everything the library reports back to the host bot.
///
/// All methods default to no-ops; implement the ones you care about. Handlers
/// run on the node's event path, so keep them fast and non-blocking.
#[async_trait]
#[allow(unused_variables)]
pub trait EventHandler: Send + Sync {
    /// A node's WebSocket handshake completed.
    async fn node_connect(&self, node: &str) {}

    /// A node finished READY negotiation and can host players.
    async fn node_ready(&self, node: &str, session_id: &str, resumed: bool) {}

    /// A node's WebSocket dropped. May be followed by a reconnect.
    async fn node_disconnect(&self, node: &str, code: Option<u16>, reason: &str) {}

    /// A node failed in a way that is not just a dropped socket.
    async fn node_error(&self, node: &str, error: &crate::Error, context: &str) {}

    /// A node pushed a fresh stats snapshot.
    async fn node_stats(&self, node: &str, stats: &Stats) {}

    /// A player was created for a guild.
    async fn player_create(&self, guild_id: u64) {}

    /// A player was destroyed and removed from its manager.
    async fn player_destroy(&self, guild_id: u64) {}

    /// A player was transferred between nodes.
    async fn player_move(&self, guild_id: u64, old_node: &str, new_node: &str) {}

    /// The server reported fresh realtime state for a player.
    async fn player_state_update(&self, guild_id: u64, state: &PlayerUpdateState) {}

    /// The platform closed the voice WebSocket between server and gateway.
    async fn player_websocket_closed(&self, guild_id: u64, code: u16, reason: &str, by_remote: bool) {}

    /// A track started playing.
    async fn track_start(&self, guild_id: u64, track: &Track) {}

    /// A track stopped playing.
    async fn track_end(&self, guild_id: u64, track: Option<&Track>, reason: TrackEndReason) {}

    /// The server failed to play a track.
    async fn track_exception(&self, guild_id: u64, track: &Track, exception: &Exception) {}

    /// A track stopped producing audio for longer than the threshold.
    async fn track_stuck(&self, guild_id: u64, track: &Track, threshold_ms: u64) {}

    /// The queue ran dry and playback stopped.
    async fn queue_end(&self, guild_id: u64) {}

    /// Internal diagnostics the host may want to surface.
    async fn debug(&self, message: &str) {}
}

/// No-op handler for hosts that only drive the library imperatively.
pub struct NullEventHandler;

#[async_trait]
impl EventHandler for NullEventHandler {}
