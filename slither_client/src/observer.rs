//! Observer session.
//!
//! Client-side counterpart of the authority: applies replicated messages to a
//! local world, keeps every character's tail chain in step with its
//! replicated length and publishes UI/audio events for the local player.
//!
//! - Entities spawned by the server keep the server's ids; tail segments are
//!   local entities allocated from a separate id range.
//! - Contacts seen locally only engage the local collision lock. Outcomes
//!   come from the server.
//! - `GameOver` publishes the local game-over event once and requests
//!   session shutdown.

use std::collections::BTreeMap;

use slither_shared::{
    chain::{Character, ChainError, GrowableChain, PeerRole, Roster},
    collision::{ignores, overlaps, CollisionLock},
    config::GameConfig,
    ecs::{Active, EntityId, Transform, World},
    event::{EventHub, GameOver, Subscription},
    net::{ClientId, EntitySpawn, NetMsg, PlayerData, Snapshot},
    pool::TemplateId,
};
use tracing::{debug, info, warn};

/// First id handed out for local-only entities.
pub const LOCAL_ID_BASE: u64 = 1 << 48;

pub struct Observer {
    cfg: GameConfig,
    client_id: Option<ClientId>,
    world: World,
    roster: Roster,
    remote: BTreeMap<EntityId, TemplateId>,
    events: EventHub,
    lock: CollisionLock,
    outgoing: Vec<NetMsg>,
    last_snapshot: Option<u32>,
    kills: Vec<PlayerData>,
    defeated_by: Option<PlayerData>,
    shutdown: bool,
}

impl Observer {
    pub fn new(cfg: GameConfig) -> Self {
        Self {
            cfg,
            client_id: None,
            world: World::with_id_base(LOCAL_ID_BASE),
            roster: Roster::new(),
            remote: BTreeMap::new(),
            events: EventHub::new(),
            lock: CollisionLock::default(),
            outgoing: Vec::new(),
            last_snapshot: None,
            kills: Vec::new(),
            defeated_by: None,
            shutdown: false,
        }
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Subscribes to one of the local events (`LengthChanged`, `EatSound`,
    /// `GameOver`).
    pub fn subscribe<E: 'static + Clone + Send + Sync>(&mut self) -> Subscription<E> {
        self.events.subscribe()
    }

    /// Whether the session should end (game over or server gone).
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Winner reported by the game-over notification.
    pub fn defeated_by(&self) -> Option<PlayerData> {
        self.defeated_by
    }

    /// Opponents this peer ate.
    pub fn kills(&self) -> &[PlayerData] {
        &self.kills
    }

    /// Messages for the server, oldest first.
    pub fn drain_outgoing(&mut self) -> Vec<NetMsg> {
        std::mem::take(&mut self.outgoing)
    }

    /// The local player's head.
    pub fn own_head(&self) -> Option<EntityId> {
        self.roster.head_of_owner(self.client_id?)
    }

    pub fn length_of(&self, head: EntityId) -> Option<u16> {
        self.roster.get(head).map(|c| c.chain.length())
    }

    pub fn segment_count(&self, head: EntityId) -> Option<usize> {
        self.roster.get(head).map(|c| c.chain.segments().len())
    }

    /// Spawned remote entities of a template.
    pub fn count(&self, template: TemplateId) -> usize {
        self.remote.values().filter(|t| **t == template).count()
    }

    /// Applies one message from the server.
    pub fn handle(&mut self, msg: NetMsg) {
        match msg {
            NetMsg::Welcome { client_id } => self.client_id = Some(client_id),
            NetMsg::EntitySpawn(spawn) => self.on_entity_spawn(spawn),
            NetMsg::EntityDespawn { id } => self.on_entity_despawn(id),
            NetMsg::LengthChanged { id, value, .. } => self.on_length_changed(id, value),
            NetMsg::AtePlayer { loser } => {
                info!(loser = loser.id, loser_length = loser.length, "Ate a player");
                self.kills.push(loser);
            }
            NetMsg::GameOver { winner } => self.on_game_over(winner),
            NetMsg::Snapshot(snap) => self.apply_snapshot(&snap),
            NetMsg::Disconnect { reason } => {
                info!(%reason, "Server ended the session");
                self.shutdown = true;
            }
            other => debug!(?other, "Unhandled message"),
        }
    }

    /// The reliable stream closed underneath us.
    pub fn on_connection_lost(&mut self) {
        self.shutdown = true;
    }

    fn on_entity_spawn(&mut self, spawn: EntitySpawn) {
        let id = spawn.id;
        if self.remote.contains_key(&id) {
            if let Some(t) = self.world.get_mut::<Transform>(id) {
                *t = Transform::new(spawn.position, spawn.rotation);
            }
            if let Some(length) = spawn.length {
                self.on_length_changed(id, length);
            }
            return;
        }
        if !self.world.spawn_with_id(id) {
            warn!(entity = ?id, "Spawn id already in use locally");
            return;
        }
        self.world.insert(id, spawn.template);
        self.world
            .insert(id, Transform::new(spawn.position, spawn.rotation));
        self.world.insert(id, Active(true));
        self.remote.insert(id, spawn.template);

        if spawn.template == TemplateId::PLAYER {
            let is_owner = self.client_id == Some(spawn.owner);
            let mut chain = GrowableChain::with_length(
                id,
                PeerRole::observer(is_owner),
                spawn.length.unwrap_or(1),
            );
            if let Err(e) = chain.on_spawn(&mut self.world) {
                debug!(entity = ?id, error = %e, "Chain catch-up dropped");
            }
            debug!(entity = ?id, owner = ?spawn.owner, length = chain.length(), "Character spawned");
            self.roster.insert(
                id,
                Character {
                    owner: spawn.owner,
                    chain,
                },
            );
        }
    }

    fn on_entity_despawn(&mut self, id: EntityId) {
        if let Some(mut character) = self.roster.remove(id) {
            character.chain.on_despawn(&mut self.world);
        }
        self.remote.remove(&id);
        self.world.despawn(id);
    }

    fn on_length_changed(&mut self, id: EntityId, value: u16) {
        let Some(character) = self.roster.get_mut(id) else {
            debug!(entity = ?id, "Length change for unknown character");
            return;
        };
        match character
            .chain
            .on_length_replicated(&mut self.world, &self.events, value)
        {
            Ok(_) => {}
            Err(ChainError::StaleEntity(e)) => debug!(entity = ?e, "Growth for destroyed head"),
            Err(e) => warn!(entity = ?id, error = %e, "Length update rejected"),
        }
    }

    fn on_game_over(&mut self, winner: PlayerData) {
        if self.defeated_by.is_some() {
            return;
        }
        self.defeated_by = Some(winner);
        self.events.publish(GameOver);
        info!(winner = winner.id, winner_length = winner.length, "Game over");
        self.outgoing.push(NetMsg::Disconnect {
            reason: "game over".to_string(),
        });
        self.shutdown = true;
    }

    fn apply_snapshot(&mut self, snap: &Snapshot) {
        if self.last_snapshot.is_some_and(|last| snap.tick <= last) {
            return;
        }
        self.last_snapshot = Some(snap.tick);
        for state in &snap.entities {
            if !self.remote.contains_key(&state.id) {
                continue;
            }
            if let Some(t) = self.world.get_mut::<Transform>(state.id) {
                t.position = state.position;
                t.rotation = state.rotation;
            }
        }
    }

    /// Local frame: tail follow and advisory contact feedback.
    pub fn step(&mut self, dt: f32) {
        self.lock.tick(dt);
        self.roster
            .update_follow(&mut self.world, dt, &self.cfg.tail);
        if self.detect_local_contact() {
            debug!("Local contact, collision lock engaged");
        }
    }

    fn detect_local_contact(&mut self) -> bool {
        let Some(own) = self.own_head() else {
            return false;
        };
        let Some(pos) = self.world.position(own) else {
            return false;
        };
        let player = self.cfg.player;
        let touching = self.roster.iter().any(|(head, character)| {
            let parts = std::iter::once((head, player.head_radius)).chain(
                character
                    .chain
                    .segments()
                    .iter()
                    .map(|s| (*s, player.segment_radius)),
            );
            parts
                .filter(|(e, _)| !ignores(&self.world, *e, own))
                .filter_map(|(e, r)| self.world.position(e).map(|p| (p, r)))
                .any(|(p, r)| overlaps(pos, player.head_radius, p, r))
        });
        touching && self.lock.try_engage(player.collision_lock_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slither_shared::{
        event::{EatSound, LengthChanged},
        math::{Quat, Vec3},
        net::EntityState,
    };

    const ME: ClientId = ClientId(5);
    const OTHER: ClientId = ClientId(6);

    fn observer() -> Observer {
        let mut observer = Observer::new(GameConfig::default());
        observer.handle(NetMsg::Welcome { client_id: ME });
        observer
    }

    fn spawn(id: u64, template: TemplateId, owner: ClientId, length: Option<u16>) -> NetMsg {
        NetMsg::EntitySpawn(EntitySpawn {
            id: EntityId(id),
            template,
            owner,
            position: Vec3::new(id as f32, 0.0, 0.0),
            rotation: Quat::IDENTITY,
            length,
        })
    }

    #[test]
    fn late_join_rebuilds_chains_silently() {
        let mut o = observer();
        let mut sound = o.subscribe::<EatSound>();
        let mut lengths = o.subscribe::<LengthChanged>();
        o.handle(spawn(1, TemplateId::PLAYER, OTHER, Some(6)));
        o.handle(spawn(2, TemplateId::PLAYER, ME, Some(4)));
        o.handle(spawn(3, TemplateId::FOOD, ClientId::SERVER, None));

        assert_eq!(o.segment_count(EntityId(1)), Some(5));
        assert_eq!(o.segment_count(EntityId(2)), Some(3));
        assert_eq!(o.count(TemplateId::FOOD), 1);
        assert_eq!(o.own_head(), Some(EntityId(2)));
        assert!(sound.drain().is_empty());
        assert!(lengths.drain().is_empty());
    }

    #[test]
    fn own_growth_publishes_events() {
        let mut o = observer();
        let mut sound = o.subscribe::<EatSound>();
        let mut lengths = o.subscribe::<LengthChanged>();
        o.handle(spawn(1, TemplateId::PLAYER, OTHER, Some(1)));
        o.handle(spawn(2, TemplateId::PLAYER, ME, Some(1)));

        o.handle(NetMsg::LengthChanged {
            id: EntityId(1),
            previous: 1,
            value: 2,
        });
        assert!(sound.drain().is_empty());

        o.handle(NetMsg::LengthChanged {
            id: EntityId(2),
            previous: 1,
            value: 2,
        });
        o.handle(NetMsg::LengthChanged {
            id: EntityId(2),
            previous: 1,
            value: 2,
        });
        assert_eq!(lengths.drain(), vec![LengthChanged(2)]);
        assert_eq!(sound.drain().len(), 1);
        assert_eq!(o.segment_count(EntityId(2)), Some(1));
        assert_eq!(o.segment_count(EntityId(1)), Some(1));
    }

    #[test]
    fn segments_use_local_ids() {
        let mut o = observer();
        o.handle(spawn(1, TemplateId::PLAYER, OTHER, Some(3)));
        let head = EntityId(1);
        let segs = o.roster().get(head).unwrap().chain.segments().to_vec();
        assert!(segs.iter().all(|s| s.0 >= LOCAL_ID_BASE));
    }

    #[test]
    fn despawn_removes_character_and_chain() {
        let mut o = observer();
        o.handle(spawn(1, TemplateId::PLAYER, OTHER, Some(3)));
        let segs = o.roster().get(EntityId(1)).unwrap().chain.segments().to_vec();
        o.handle(NetMsg::EntityDespawn { id: EntityId(1) });
        assert!(o.roster().is_empty());
        assert!(!o.world().contains(EntityId(1)));
        assert!(segs.iter().all(|s| !o.world().contains(*s)));

        // Unknown ids are ignored.
        o.handle(NetMsg::EntityDespawn { id: EntityId(99) });
        o.handle(NetMsg::LengthChanged {
            id: EntityId(1),
            previous: 3,
            value: 4,
        });
    }

    #[test]
    fn recycled_food_can_spawn_again() {
        let mut o = observer();
        o.handle(spawn(3, TemplateId::FOOD, ClientId::SERVER, None));
        o.handle(NetMsg::EntityDespawn { id: EntityId(3) });
        o.handle(spawn(3, TemplateId::FOOD, ClientId::SERVER, None));
        assert_eq!(o.count(TemplateId::FOOD), 1);
        assert!(o.world().contains(EntityId(3)));
    }

    #[test]
    fn game_over_fires_once_and_requests_shutdown() {
        let mut o = observer();
        let mut over = o.subscribe::<GameOver>();
        let winner = PlayerData { id: 6, length: 5 };
        o.handle(NetMsg::GameOver { winner });
        o.handle(NetMsg::GameOver { winner });

        assert_eq!(over.drain().len(), 1);
        assert!(o.is_shutdown());
        assert_eq!(o.defeated_by(), Some(winner));
        assert_eq!(
            o.drain_outgoing(),
            vec![NetMsg::Disconnect {
                reason: "game over".to_string()
            }]
        );
    }

    #[test]
    fn stale_snapshots_are_ignored() {
        let mut o = observer();
        o.handle(spawn(1, TemplateId::FOOD, ClientId::SERVER, None));
        let at = |tick, x| {
            NetMsg::Snapshot(Snapshot {
                tick,
                entities: vec![EntityState {
                    id: EntityId(1),
                    position: Vec3::new(x, 0.0, 0.0),
                    rotation: Quat::IDENTITY,
                }],
            })
        };
        o.handle(at(5, 2.0));
        o.handle(at(4, 9.0));
        assert_eq!(o.world().position(EntityId(1)), Some(Vec3::new(2.0, 0.0, 0.0)));
    }

    #[test]
    fn local_contact_only_engages_lock() {
        let mut o = observer();
        o.handle(spawn(1, TemplateId::PLAYER, OTHER, Some(1)));
        o.handle(spawn(2, TemplateId::PLAYER, ME, Some(1)));
        o.handle(NetMsg::Snapshot(Snapshot {
            tick: 1,
            entities: vec![EntityState {
                id: EntityId(2),
                position: Vec3::new(1.2, 0.0, 0.0),
                rotation: Quat::IDENTITY,
            }],
        }));
        assert!(o.detect_local_contact());
        assert!(!o.detect_local_contact());
        assert!(o.drain_outgoing().is_empty());
        assert!(!o.is_shutdown());
    }

    #[test]
    fn own_segments_never_engage_lock() {
        let mut o = observer();
        o.handle(spawn(2, TemplateId::PLAYER, ME, Some(4)));
        assert_eq!(o.segment_count(EntityId(2)), Some(3));
        assert!(!o.detect_local_contact());
    }
}
