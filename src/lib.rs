//! # Open Lavalink
//!
//! Multi-node [Lavalink] v4 client for music bots.
//!
//! This crate federates any number of Lavalink servers ("nodes") on behalf of
//! a chat-platform bot. Per guild it owns the voice-gateway handshake with the
//! platform, an authenticated WebSocket + REST session to a node, and the
//! playback state machine (queue, loop, position, pause, volume, seek) that
//! the node executes for us.
//!
//! ## Architecture
//!
//! The crate is built around three main components:
//!
//! ### [`manager::Manager`] - Node fleet and routing
//! - Owns every node and every player
//! - Routes raw platform voice events to the right player
//! - Selects nodes by penalty score and migrates players when a node dies
//!
//! ### [`node::Node`] - One Lavalink session
//! - WebSocket lifecycle: dial, READY negotiation, session resumption,
//!   reconnect with exponential backoff
//! - Authenticated REST calls with timeout and retry
//! - Health scoring from the server's periodic stats
//!
//! ### [`player::Player`] - Per-guild playback
//! - Three-way voice handshake (voice-connect, voice-state, voice-server)
//! - Play / stop / pause / seek / skip and queue progression
//! - Transparent transfer between nodes without losing position
//!
//! ## Integration
//!
//! The host bot supplies two things: a [`events::VoicePayloadSender`] used to
//! push the platform's voice-connect payload onto the gateway, and the raw
//! `VOICE_STATE_UPDATE` / `VOICE_SERVER_UPDATE` payloads forwarded into
//! [`manager::Manager::handle_voice_state_update`] and
//! [`manager::Manager::handle_voice_server_update`]. Everything the library
//! wants to tell the host comes back through [`events::EventHandler`].
//!
//! [Lavalink]: https://lavalink.dev

pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod node;
pub mod player;
pub mod protocol;
pub mod queue;
pub mod rest;

pub use config::{NodeConfig, PlayerConfig, ReconnectPolicy};
pub use error::{Error, Result};
pub use events::{EventHandler, NullEventHandler, VoicePayloadSender};
pub use manager::{Manager, VoiceServerUpdate, VoiceStateUpdate};
pub use node::{Node, NodeState};
pub use player::{PlayOptions, Player, PlayerState};
pub use queue::{LoopMode, Queue, QueuePage, QueueSnapshot, QueuedTrack};
