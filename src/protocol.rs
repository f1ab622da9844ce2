//! Serde model of the Lavalink v4 wire contract.
//!
//! Covers the four inbound WebSocket frames (`ready`, `stats`,
//! `playerUpdate`, `event`), the track/load-result shapes returned by the
//! REST API, and the bodies we PATCH at the server. Field names follow the
//! protocol's camelCase on the wire and snake_case in Rust.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An opaque, server-encoded track plus its decoded metadata.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    /// Base64 blob identifying the playable resource. Equality of tracks is
    /// equality of this string.
    pub encoded: String,
    pub info: TrackInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_info: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Track length in milliseconds.
    pub length: u64,
    pub is_stream: bool,
    pub position: u64,
    pub title: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub isrc: Option<String>,
    pub source_name: String,
}

/// Result of `GET /v4/loadtracks`, discriminated by `loadType`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "loadType", content = "data", rename_all = "camelCase")]
pub enum LoadResult {
    Track(Box<Track>),
    Playlist(PlaylistData),
    Search(Vec<Track>),
    Empty,
    Error(Exception),
}

impl LoadResult {
    /// Flattens the load result into the tracks it carries, if any.
    pub fn tracks(self) -> Vec<Track> {
        match self {
            Self::Track(track) => vec![*track],
            Self::Playlist(playlist) => playlist.tracks,
            Self::Search(tracks) => tracks,
            Self::Empty | Self::Error(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistData {
    pub info: PlaylistInfo,
    #[serde(default)]
    pub plugin_info: Option<Value>,
    pub tracks: Vec<Track>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub name: String,
    /// Index of the selected track within the playlist, -1 if none.
    pub selected_track: i32,
}

/// A playback exception reported by the server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Exception {
    #[serde(default)]
    pub message: Option<String>,
    pub severity: Severity,
    pub cause: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Common,
    Suspicious,
    /// The server itself is at fault; playback cannot continue.
    Fault,
}

/// Periodic health snapshot pushed by the node.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub players: u32,
    pub playing_players: u32,
    /// Node uptime in milliseconds.
    pub uptime: u64,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    #[serde(default)]
    pub frame_stats: Option<FrameStats>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

/// Frame statistics over the last minute.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

/// Real-time player state attached to `playerUpdate` frames.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdateState {
    /// Unix timestamp (ms) the snapshot was taken at.
    pub time: u64,
    /// Playback position in milliseconds.
    #[serde(default)]
    pub position: u64,
    /// Whether the node is connected to the voice gateway.
    pub connected: bool,
    /// Voice gateway ping in ms, -1 when unavailable.
    pub ping: i64,
}

/// Why a track stopped playing.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    /// Whether the queue may start another track after this reason.
    pub fn may_start_next(self) -> bool {
        matches!(self, Self::Finished | Self::LoadFailed)
    }
}

/// A playback event scoped to one guild.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum TrackEvent {
    #[serde(rename = "TrackStartEvent", rename_all = "camelCase")]
    TrackStart { track: Track },
    #[serde(rename = "TrackEndEvent", rename_all = "camelCase")]
    TrackEnd {
        track: Track,
        reason: TrackEndReason,
    },
    #[serde(rename = "TrackExceptionEvent", rename_all = "camelCase")]
    TrackException { track: Track, exception: Exception },
    #[serde(rename = "TrackStuckEvent", rename_all = "camelCase")]
    TrackStuck { track: Track, threshold_ms: u64 },
    #[serde(rename = "WebSocketClosedEvent", rename_all = "camelCase")]
    WebSocketClosed {
        code: u16,
        reason: String,
        by_remote: bool,
    },
}

/// An inbound WebSocket frame, discriminated by `op`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingMessage {
    #[serde(rename_all = "camelCase")]
    Ready { resumed: bool, session_id: String },
    Stats(Stats),
    #[serde(rename_all = "camelCase")]
    PlayerUpdate {
        guild_id: String,
        state: PlayerUpdateState,
    },
    #[serde(rename_all = "camelCase")]
    Event {
        guild_id: String,
        #[serde(flatten)]
        event: TrackEvent,
    },
}

impl IncomingMessage {
    /// Parses a text frame. `Ok(None)` means the opcode is unknown and the
    /// frame should be ignored; `Err` means the payload is malformed.
    pub fn parse(text: &str) -> crate::Result<Option<Self>> {
        let value: Value = serde_json::from_str(text)?;
        let op = value
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| crate::Error::Protocol(format!("frame without op: {text}")))?;

        match op {
            "ready" | "stats" | "playerUpdate" | "event" => {
                Ok(Some(serde_json::from_value(value)?))
            }
            _ => Ok(None),
        }
    }
}

/// Voice server credentials PATCHed at the node once the platform handshake
/// completes.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceState {
    pub token: String,
    /// Bare hostname of the platform voice server, no scheme or port.
    pub endpoint: String,
    pub session_id: String,
}

/// Body of `PATCH /v4/sessions/{sid}/players/{guild}`.
///
/// Every field is optional; only fields present on the wire are applied by
/// the server. `encoded_track` is doubly optional because an explicit `null`
/// stops the current track, which is different from omitting the field.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded_track: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceState>,
}

impl UpdatePlayer {
    pub fn is_empty(&self) -> bool {
        self.encoded_track.is_none()
            && self.position.is_none()
            && self.end_time.is_none()
            && self.volume.is_none()
            && self.paused.is_none()
            && self.filters.is_none()
            && self.voice.is_none()
    }
}

/// Body of `PATCH /v4/sessions/{sid}`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resuming: Option<bool>,
    /// Seconds the server keeps the session resumable after a drop.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Player object returned by the player REST routes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    pub guild_id: String,
    #[serde(default)]
    pub track: Option<Track>,
    pub volume: u16,
    pub paused: bool,
    pub state: PlayerUpdateState,
}

/// Error body Lavalink attaches to non-2xx REST responses.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    #[serde(default)]
    pub timestamp: Option<u64>,
    pub status: u16,
    pub error: String,
    #[serde(default)]
    pub trace: Option<String>,
    pub message: String,
    pub path: String,
}

/// Response of `GET /v4/info`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub version: VersionInfo,
    pub build_time: u64,
    pub jvm: String,
    pub lavaplayer: String,
    pub source_managers: Vec<String>,
    pub filters: Vec<String>,
    #[serde(default)]
    pub plugins: Vec<PluginMeta>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub semver: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMeta {
    pub name: String,
    pub version: String,
}

/// The platform voice-connect payload (gateway opcode 4) the host forwards
/// to the chat platform on our behalf.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VoiceConnectPayload {
    pub op: u8,
    pub d: VoiceConnectData,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VoiceConnectData {
    pub guild_id: String,
    pub channel_id: Option<String>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

impl VoiceConnectPayload {
    pub fn join(guild_id: u64, channel_id: u64, self_mute: bool, self_deaf: bool) -> Self {
        Self {
            op: 4,
            d: VoiceConnectData {
                guild_id: guild_id.to_string(),
                channel_id: Some(channel_id.to_string()),
                self_mute,
                self_deaf,
            },
        }
    }

    pub fn leave(guild_id: u64) -> Self {
        Self {
            op: 4,
            d: VoiceConnectData {
                guild_id: guild_id.to_string(),
                channel_id: None,
                self_mute: false,
                self_deaf: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_track_json() -> serde_json::Value {
        serde_json::json!({
            "encoded": "QAAAjQIAJFJpY2sgQXN0bGV5",
            "info": {
                "identifier": "dQw4w9WgXcQ",
                "isSeekable": true,
                "author": "Rick Astley",
                "length": 212000,
                "isStream": false,
                "position": 0,
                "title": "Never Gonna Give You Up",
                "uri": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
                "artworkUrl": null,
                "isrc": null,
                "sourceName": "youtube"
            },
            "pluginInfo": {}
        })
    }

    #[test]
    fn test_parse_ready_frame() {
        let msg = IncomingMessage::parse(
            r#"{"op":"ready","resumed":false,"sessionId":"la3kfsdf5eafe848"}"#,
        )
        .unwrap()
        .unwrap();

        match msg {
            IncomingMessage::Ready {
                resumed,
                session_id,
            } => {
                assert!(!resumed);
                assert_eq!(session_id, "la3kfsdf5eafe848");
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_stats_frame() {
        let msg = IncomingMessage::parse(
            r#"{
                "op": "stats",
                "players": 1,
                "playingPlayers": 1,
                "uptime": 123456789,
                "memory": {"free": 123456789, "used": 123456789, "allocated": 123456789, "reservable": 123456789},
                "cpu": {"cores": 4, "systemLoad": 0.5, "lavalinkLoad": 0.5},
                "frameStats": {"sent": 6000, "nulled": 10, "deficit": -3010}
            }"#,
        )
        .unwrap()
        .unwrap();

        match msg {
            IncomingMessage::Stats(stats) => {
                assert_eq!(stats.players, 1);
                assert_eq!(stats.cpu.cores, 4);
                assert_eq!(stats.frame_stats.unwrap().deficit, -3010);
            }
            other => panic!("expected stats, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_player_update_frame() {
        let msg = IncomingMessage::parse(
            r#"{
                "op": "playerUpdate",
                "guildId": "229799952013836288",
                "state": {"time": 1500467109, "position": 60000, "connected": true, "ping": 50}
            }"#,
        )
        .unwrap()
        .unwrap();

        match msg {
            IncomingMessage::PlayerUpdate { guild_id, state } => {
                assert_eq!(guild_id, "229799952013836288");
                assert_eq!(state.position, 60_000);
                assert!(state.connected);
            }
            other => panic!("expected playerUpdate, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_track_end_event() {
        let mut frame = serde_json::json!({
            "op": "event",
            "type": "TrackEndEvent",
            "guildId": "229799952013836288",
            "reason": "finished"
        });
        frame["track"] = sample_track_json();

        let msg = IncomingMessage::parse(&frame.to_string()).unwrap().unwrap();
        match msg {
            IncomingMessage::Event { guild_id, event } => {
                assert_eq!(guild_id, "229799952013836288");
                match event {
                    TrackEvent::TrackEnd { track, reason } => {
                        assert_eq!(reason, TrackEndReason::Finished);
                        assert_eq!(track.info.title, "Never Gonna Give You Up");
                        assert!(reason.may_start_next());
                    }
                    other => panic!("expected TrackEnd, got {other:?}"),
                }
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_websocket_closed_event() {
        let msg = IncomingMessage::parse(
            r#"{
                "op": "event",
                "type": "WebSocketClosedEvent",
                "guildId": "229799952013836288",
                "code": 4006,
                "reason": "Your session is no longer valid.",
                "byRemote": true
            }"#,
        )
        .unwrap()
        .unwrap();

        match msg {
            IncomingMessage::Event {
                event: TrackEvent::WebSocketClosed { code, by_remote, .. },
                ..
            } => {
                assert_eq!(code, 4006);
                assert!(by_remote);
            }
            other => panic!("expected WebSocketClosed, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_op_is_ignored() {
        let msg = IncomingMessage::parse(r#"{"op":"somethingNew","data":42}"#).unwrap();
        assert!(msg.is_none());
    }

    #[test]
    fn test_missing_op_is_protocol_error() {
        assert!(IncomingMessage::parse(r#"{"hello":"world"}"#).is_err());
        assert!(IncomingMessage::parse("not json at all").is_err());
    }

    #[test]
    fn test_load_result_variants() {
        let mut track_result = serde_json::json!({"loadType": "track"});
        track_result["data"] = sample_track_json();
        let result: LoadResult = serde_json::from_value(track_result).unwrap();
        assert_eq!(result.tracks().len(), 1);

        let empty: LoadResult =
            serde_json::from_str(r#"{"loadType":"empty","data":null}"#).unwrap();
        assert!(empty.tracks().is_empty());

        let error: LoadResult = serde_json::from_str(
            r#"{
                "loadType": "error",
                "data": {"message": "video unavailable", "severity": "common", "cause": "..."}
            }"#,
        )
        .unwrap();
        assert!(matches!(error, LoadResult::Error(_)));

        let mut search = serde_json::json!({"loadType": "search"});
        search["data"] = serde_json::Value::Array(vec![sample_track_json(), sample_track_json()]);
        let result: LoadResult = serde_json::from_value(search).unwrap();
        assert_eq!(result.tracks().len(), 2);
    }

    #[test]
    fn test_update_player_serialization() {
        // Stopping requires an explicit null, not an absent field.
        let stop = UpdatePlayer {
            encoded_track: Some(None),
            ..UpdatePlayer::default()
        };
        assert_eq!(serde_json::to_string(&stop).unwrap(), r#"{"encodedTrack":null}"#);

        let play = UpdatePlayer {
            encoded_track: Some(Some("abc".to_string())),
            paused: Some(false),
            ..UpdatePlayer::default()
        };
        let json: Value = serde_json::to_value(&play).unwrap();
        assert_eq!(json["encodedTrack"], "abc");
        assert_eq!(json["paused"], false);
        assert!(json.get("position").is_none());

        assert_eq!(serde_json::to_string(&UpdatePlayer::default()).unwrap(), "{}");
        assert!(UpdatePlayer::default().is_empty());
    }

    #[test]
    fn test_voice_connect_payload_shape() {
        let join = VoiceConnectPayload::join(229_799_952_013_836_288, 42, false, true);
        let json = serde_json::to_value(&join).unwrap();
        assert_eq!(json["op"], 4);
        assert_eq!(json["d"]["guild_id"], "229799952013836288");
        assert_eq!(json["d"]["channel_id"], "42");
        assert_eq!(json["d"]["self_deaf"], true);

        let leave = VoiceConnectPayload::leave(1);
        let json = serde_json::to_value(&leave).unwrap();
        assert_eq!(json["d"]["channel_id"], Value::Null);
    }
}
