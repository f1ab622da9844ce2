use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    config::{NodeConfig, PlayerConfig},
    error::{Error, Result},
    events::{EventHandler, NullEventHandler, VoicePayloadSender},
    node::{Node, NodeObserver},
    player::{Player, PlayerHost},
    protocol::{LoadResult, PlayerUpdateState, TrackEvent},
};

/// Search prefixes the load-tracks endpoint understands; queries already
/// carrying one are passed through untouched.
const SEARCH_PREFIXES: [&str; 6] = [
    "ytsearch:",
    "ytmsearch:",
    "scsearch:",
    "amsearch:",
    "dzsearch:",
    "spsearch:",
];

/// Raw `VOICE_STATE_UPDATE` payload fields the library consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceStateUpdate {
    pub guild_id: Option<String>,
    pub user_id: String,
    pub channel_id: Option<String>,
    pub session_id: String,
}

/// Raw `VOICE_SERVER_UPDATE` payload fields the library consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceServerUpdate {
    pub guild_id: String,
    pub token: String,
    pub endpoint: Option<String>,
}

/// The fleet: every node, every player, and the routing between platform
/// voice events and the players they belong to.
///
/// Cheap to clone; clones share the same fleet.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    /// Self-handle so background work spawned from `&self` callbacks can
    /// own the fleet.
    this: std::sync::Weak<ManagerInner>,
    nodes: DashMap<String, Arc<Node>>,
    /// Node identifiers in insertion order; penalty ties go to the earliest.
    node_order: RwLock<Vec<String>>,
    players: DashMap<u64, Arc<Player>>,
    user_id: RwLock<Option<u64>>,
    sender: Arc<dyn VoicePayloadSender>,
    events: Arc<dyn EventHandler>,
    player_defaults: PlayerConfig,
}

impl Manager {
    pub fn new(sender: Arc<dyn VoicePayloadSender>) -> Self {
        Self::with_handler(sender, Arc::new(NullEventHandler))
    }

    pub fn with_handler(
        sender: Arc<dyn VoicePayloadSender>,
        events: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            inner: Arc::new_cyclic(|this| ManagerInner {
                this: this.clone(),
                nodes: DashMap::new(),
                node_order: RwLock::new(Vec::new()),
                players: DashMap::new(),
                user_id: RwLock::new(None),
                sender,
                events,
                player_defaults: PlayerConfig::default(),
            }),
        }
    }

    /// Overrides the defaults applied to newly created players.
    pub fn set_player_defaults(&mut self, defaults: PlayerConfig) {
        // Only safe before sharing; keep it simple by requiring exclusive
        // access to the handle.
        let inner = Arc::get_mut(&mut self.inner);
        match inner {
            Some(inner) => inner.player_defaults = defaults,
            None => warn!("player defaults ignored: manager already shared"),
        }
    }

    /// Tells the manager who the bot is. Settable once; nodes start dialing
    /// as soon as this is known.
    pub fn set_user_id(&self, user_id: u64) -> Result<()> {
        {
            let mut slot = self.inner.user_id.write();
            match *slot {
                Some(existing) if existing != user_id => {
                    return Err(Error::config(format!(
                        "user id already set to {existing}, refusing {user_id}"
                    )));
                }
                Some(_) => return Ok(()),
                None => *slot = Some(user_id),
            }
        }
        info!(user_id, "bot user id learned, dialing nodes");
        for entry in self.inner.nodes.iter() {
            entry.value().connect();
        }
        Ok(())
    }

    pub fn user_id(&self) -> Option<u64> {
        *self.inner.user_id.read()
    }

    // --- nodes -------------------------------------------------------------

    /// Registers a node and starts dialing it (once the user id is known).
    pub fn add_node(&self, config: NodeConfig) -> Result<Arc<Node>> {
        if self.inner.nodes.contains_key(&config.identifier) {
            return Err(Error::config(format!(
                "a node named '{}' already exists",
                config.identifier
            )));
        }

        let node = Node::new(config, self.inner.events.clone())?;
        let observer: Arc<dyn NodeObserver> = self.inner.clone();
        node.set_observer(Arc::downgrade(&observer));

        let identifier = node.identifier().to_string();
        self.inner.nodes.insert(identifier.clone(), node.clone());
        self.inner.node_order.write().push(identifier);

        if self.user_id().is_some() {
            node.connect();
        }
        Ok(node)
    }

    /// Retires a node: closes it, then moves its players elsewhere (or
    /// destroys them when nowhere is left).
    pub async fn remove_node(&self, identifier: &str) -> Result<()> {
        let Some((_, node)) = self.inner.nodes.remove(identifier) else {
            return Err(Error::precondition(format!("no node named '{identifier}'")));
        };
        self.inner
            .node_order
            .write()
            .retain(|name| name != identifier);

        node.disconnect();
        self.inner.relocate_players_of(&node, true).await;
        node.destroy();
        info!(node = identifier, "node removed");
        Ok(())
    }

    pub fn node(&self, identifier: &str) -> Option<Arc<Node>> {
        self.inner.nodes.get(identifier).map(|entry| entry.clone())
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        let order = self.inner.node_order.read();
        order
            .iter()
            .filter_map(|name| self.inner.nodes.get(name).map(|entry| entry.clone()))
            .collect()
    }

    /// The ready node with the lowest penalty; ties go to the node added
    /// first. `None` when no node can host a player right now.
    pub fn get_ideal_node(&self) -> Option<Arc<Node>> {
        self.inner.get_ideal_node()
    }

    // --- players -----------------------------------------------------------

    /// Returns the existing player for the guild or creates one on the
    /// current ideal node.
    pub fn create_player(&self, guild_id: u64) -> Result<Arc<Player>> {
        self.create_player_with(guild_id, self.inner.player_defaults)
    }

    pub fn create_player_with(&self, guild_id: u64, config: PlayerConfig) -> Result<Arc<Player>> {
        if self.user_id().is_none() {
            return Err(Error::config("bot user id must be set before creating players"));
        }
        if let Some(existing) = self.get_player(guild_id) {
            if !existing.is_destroyed() {
                return Ok(existing);
            }
        }

        let node = self
            .inner
            .get_ideal_node()
            .ok_or_else(|| Error::precondition("no ready node available"))?;

        let host: Arc<dyn PlayerHost> = self.inner.clone();
        let player = Player::new(
            guild_id,
            node,
            config,
            self.inner.sender.clone(),
            self.inner.events.clone(),
            Arc::downgrade(&host),
        );
        self.inner.players.insert(guild_id, player.clone());
        let events = self.inner.events.clone();
        tokio::spawn(async move { events.player_create(guild_id).await });
        debug!(guild = guild_id, "player created");
        Ok(player)
    }

    pub fn get_player(&self, guild_id: u64) -> Option<Arc<Player>> {
        self.inner.players.get(&guild_id).map(|entry| entry.clone())
    }

    pub fn players(&self) -> Vec<Arc<Player>> {
        self.inner
            .players
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Destroys the guild's player, if any.
    pub async fn destroy_player(&self, guild_id: u64) {
        if let Some(player) = self.get_player(guild_id) {
            player.destroy().await;
        }
    }

    // --- track loading ------------------------------------------------------

    /// Resolves a query into tracks on a suitable node.
    ///
    /// URLs and queries that already carry a search prefix go through
    /// verbatim; anything else becomes a YouTube search.
    pub async fn load_tracks(
        &self,
        query: &str,
        hint: Option<&Player>,
    ) -> Result<LoadResult> {
        let node = hint
            .map(|player| player.node())
            .filter(|node| node.is_ready())
            .or_else(|| self.inner.get_ideal_node())
            .ok_or_else(|| Error::precondition("no ready node available"))?;

        let identifier = classify_query(query);
        node.load_tracks(&identifier).await
    }

    // --- platform voice routing ----------------------------------------------

    /// Entry point for raw `VOICE_STATE_UPDATE` payloads.
    pub async fn handle_voice_state_update(&self, update: VoiceStateUpdate) {
        let Some(our_id) = self.user_id() else {
            return;
        };
        if update.user_id.parse::<u64>().ok() != Some(our_id) {
            return;
        }
        let Some(guild_id) = update
            .guild_id
            .as_deref()
            .and_then(|id| id.parse::<u64>().ok())
        else {
            return;
        };
        let Some(player) = self.get_player(guild_id) else {
            return;
        };

        let channel_id = update
            .channel_id
            .as_deref()
            .and_then(|id| id.parse::<u64>().ok());

        // The platform moved us out of voice entirely; the player is over.
        if channel_id.is_none() {
            info!(guild = guild_id, "voice dropped by platform, destroying player");
            player.destroy().await;
            return;
        }

        player
            .voice_state_update(channel_id, update.session_id)
            .await;
    }

    /// Entry point for raw `VOICE_SERVER_UPDATE` payloads.
    pub async fn handle_voice_server_update(&self, update: VoiceServerUpdate) {
        if self.user_id().is_none() {
            return;
        }
        let Ok(guild_id) = update.guild_id.parse::<u64>() else {
            return;
        };
        let Some(player) = self.get_player(guild_id) else {
            return;
        };
        let Some(endpoint) = update.endpoint else {
            // The voice server fell over; the platform sends a fresh
            // endpoint when one is assigned.
            debug!(guild = guild_id, "voice server update without endpoint ignored");
            return;
        };

        player.voice_server_update(update.token, endpoint).await;
    }
}

impl ManagerInner {
    fn get_ideal_node(&self) -> Option<Arc<Node>> {
        let order = self.node_order.read();
        let mut best: Option<(f64, Arc<Node>)> = None;
        for name in order.iter() {
            let Some(node) = self.nodes.get(name) else {
                continue;
            };
            let penalty = node.penalty();
            if penalty.is_infinite() {
                continue;
            }
            // Strict comparison keeps the earliest node on ties.
            if best.as_ref().is_none_or(|(record, _)| penalty < *record) {
                best = Some((penalty, node.clone()));
            }
        }
        best.map(|(_, node)| node)
    }

    /// Finds every live player bound to `node` a new home.
    ///
    /// When the disconnect is not known to be permanent and no other node is
    /// ready, waits one reconnect window before deciding between migration
    /// and destruction.
    async fn relocate_players_of(&self, node: &Arc<Node>, permanent: bool) {
        let stranded: Vec<Arc<Player>> = node
            .player_guilds()
            .into_iter()
            .filter_map(|guild_id| self.players.get(&guild_id).map(|entry| entry.clone()))
            .filter(|player| !player.is_destroyed())
            .collect();
        if stranded.is_empty() {
            return;
        }

        let mut target = self.get_ideal_node();
        if target.is_none() && !permanent {
            let grace =
                Duration::from_millis(node.config().reconnect.initial_delay_ms).saturating_add(
                    Duration::from_millis(500),
                );
            debug!(node = %node.identifier(), ?grace, "no ready node yet, waiting before migrating");
            sleep(grace).await;
            target = self.get_ideal_node();
        }

        for player in stranded {
            // The node may have come back in the meantime; leave those alone.
            if player.node().is_ready() {
                continue;
            }
            match &target {
                Some(target) if target.identifier() != node.identifier() => {
                    if let Err(err) = player.move_to_node(target.clone()).await {
                        warn!(
                            guild = player.guild_id(),
                            "migration failed, player destroyed: {err}"
                        );
                    }
                }
                _ => {
                    warn!(guild = player.guild_id(), "no node to migrate to, destroying player");
                    player.destroy().await;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl NodeObserver for ManagerInner {
    fn user_id(&self) -> Option<u64> {
        *self.user_id.read()
    }

    async fn dispatch_player_update(&self, guild_id: u64, state: PlayerUpdateState) {
        if let Some(player) = self.players.get(&guild_id).map(|entry| entry.clone()) {
            player.player_update(state).await;
        } else {
            debug!(guild = guild_id, "player update for unknown guild");
        }
    }

    async fn dispatch_event(&self, guild_id: u64, event: TrackEvent) {
        if let Some(player) = self.players.get(&guild_id).map(|entry| entry.clone()) {
            player.handle_event(event).await;
        } else {
            debug!(guild = guild_id, "event for unknown guild dropped");
        }
    }

    async fn node_disconnected(&self, node: &Arc<Node>, permanent: bool) {
        warn!(node = %node.identifier(), permanent, "node disconnected");
        let Some(this) = self.this.upgrade() else {
            return;
        };
        // Run the relocation off the node's session task so a migration
        // grace period never delays its reconnect loop.
        let node = node.clone();
        tokio::spawn(async move {
            this.relocate_players_of(&node, permanent).await;
        });
    }
}

impl PlayerHost for ManagerInner {
    fn user_id(&self) -> Option<u64> {
        *self.user_id.read()
    }

    fn forget_player(&self, guild_id: u64) {
        self.players.remove(&guild_id);
    }
}

/// Rewrites a free-text query into a load-tracks identifier.
fn classify_query(query: &str) -> String {
    let is_url = ["http://", "https://", "ftp://"]
        .iter()
        .any(|scheme| query.starts_with(scheme));
    let has_prefix = SEARCH_PREFIXES
        .iter()
        .any(|prefix| query.starts_with(prefix));

    if is_url || has_prefix {
        query.to_string()
    } else {
        format!("ytsearch:{query}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CpuStats, MemoryStats, Stats, VoiceConnectPayload};
    use async_trait::async_trait;

    struct NoopSender;

    #[async_trait]
    impl VoicePayloadSender for NoopSender {
        async fn send_voice_update(
            &self,
            _guild_id: u64,
            _payload: VoiceConnectPayload,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn manager() -> Manager {
        Manager::new(Arc::new(NoopSender))
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

    fn node_config(identifier: &str) -> NodeConfig {
        NodeConfig {
            identifier: identifier.to_string(),
            retry_amount: 1,
            ..NodeConfig::default()
        }
    }

    #[test]
    fn test_classify_query() {
        assert_eq!(
            classify_query("never gonna give you up"),
            "ytsearch:never gonna give you up"
        );
        assert_eq!(classify_query("https://example/x"), "https://example/x");
        assert_eq!(classify_query("ftp://example/x"), "ftp://example/x");
        assert_eq!(classify_query("scsearch:foo"), "scsearch:foo");
        assert_eq!(classify_query("spsearch:abba"), "spsearch:abba");
        // Unknown prefixes are just text.
        assert_eq!(classify_query("xyzsearch:foo"), "ytsearch:xyzsearch:foo");
    }

    #[test]
    fn test_ideal_node_prefers_lowest_penalty() {
        let manager = manager();
        let n1 = manager.add_node(node_config("n1")).unwrap();
        let n2 = manager.add_node(node_config("n2")).unwrap();

        // Nobody ready yet: nothing to route to.
        assert!(manager.get_ideal_node().is_none());

        n1.test_force_ready(Some(stats(5, 0.10, 4, 500)));
        n2.test_force_ready(Some(stats(50, 0.10, 4, 100)));

        // n1 ~ 5 + 1 + 500, n2 ~ 50 + 1 + 100: n2 wins.
        let ideal = manager.get_ideal_node().unwrap();
        assert_eq!(ideal.identifier(), "n2");
    }

    #[test]
    fn test_ideal_node_ties_break_by_insertion_order() {
        let manager = manager();
        let n1 = manager.add_node(node_config("first")).unwrap();
        let n2 = manager.add_node(node_config("second")).unwrap();
        n1.test_force_ready(Some(stats(3, 0.2, 4, 100)));
        n2.test_force_ready(Some(stats(3, 0.2, 4, 100)));

        assert_eq!(manager.get_ideal_node().unwrap().identifier(), "first");
    }

    #[test]
    fn test_add_node_rejects_duplicates() {
        let manager = manager();
        manager.add_node(node_config("dup")).unwrap();
        assert!(matches!(
            manager.add_node(node_config("dup")),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_create_player_preconditions() {
        let manager = manager();

        // No user id yet.
        assert!(matches!(manager.create_player(1), Err(Error::Config(_))));

        manager.set_user_id(777).unwrap();
        // No ready node.
        assert!(matches!(
            manager.create_player(1),
            Err(Error::Precondition(_))
        ));

        let node = manager.add_node(node_config("n1")).unwrap();
        // Let the first dial fail and park in its backoff window before
        // pinning the state for the assertions below.
        tokio::time::sleep(Duration::from_millis(50)).await;
        node.test_force_ready(None);

        let player = manager.create_player(1).unwrap();
        // Second ask returns the same player.
        let again = manager.create_player(1).unwrap();
        assert!(Arc::ptr_eq(&player, &again));
        assert_eq!(node.player_count(), 1);
    }

    #[tokio::test]
    async fn test_set_user_id_is_write_once() {
        let manager = manager();
        manager.set_user_id(1).unwrap();
        manager.set_user_id(1).unwrap();
        assert!(matches!(manager.set_user_id(2), Err(Error::Config(_))));
        assert_eq!(manager.user_id(), Some(1));
    }

    #[tokio::test]
    async fn test_bot_kick_destroys_player() {
        let manager = manager();
        manager.set_user_id(777).unwrap();
        let node = manager.add_node(node_config("n1")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        node.test_force_ready(None);
        manager.create_player(9).unwrap();

        manager
            .handle_voice_state_update(VoiceStateUpdate {
                guild_id: Some("9".to_string()),
                user_id: "777".to_string(),
                channel_id: None,
                session_id: "vs".to_string(),
            })
            .await;

        assert!(manager.get_player(9).is_none());
        assert_eq!(node.player_count(), 0);
    }

    #[tokio::test]
    async fn test_voice_updates_for_other_users_are_ignored() {
        let manager = manager();
        manager.set_user_id(777).unwrap();
        let node = manager.add_node(node_config("n1")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        node.test_force_ready(None);
        let player = manager.create_player(9).unwrap();

        manager
            .handle_voice_state_update(VoiceStateUpdate {
                guild_id: Some("9".to_string()),
                user_id: "123456".to_string(),
                channel_id: None,
                session_id: "other".to_string(),
            })
            .await;

        assert!(!player.is_destroyed());
        assert!(manager.get_player(9).is_some());
    }

    #[tokio::test]
    async fn test_voice_updates_before_user_id_are_noops() {
        let manager = manager();
        manager
            .handle_voice_state_update(VoiceStateUpdate {
                guild_id: Some("9".to_string()),
                user_id: "777".to_string(),
                channel_id: None,
                session_id: "vs".to_string(),
            })
            .await;
        manager
            .handle_voice_server_update(VoiceServerUpdate {
                guild_id: "9".to_string(),
                token: "tok".to_string(),
                endpoint: Some("eu.example:443".to_string()),
            })
            .await;
    }
}
