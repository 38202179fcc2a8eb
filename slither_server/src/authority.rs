//! Authority session.
//!
//! The one object owning all server-side game state: world, pool, spawn
//! subsystem, scheduler, spawn coordinator, collision resolver and the
//! character roster. It is synchronous; the network shell feeds it peer
//! events and commands, calls [`Authority::step`] once per tick and flushes
//! [`Authority::drain_outbox`].
//!
//! Determinism notes:
//! - Fixed timestep; simulation time only advances through `step`.
//! - Heads are iterated in ascending entity id order.

use std::{collections::BTreeMap, time::Duration};

use slither_shared::{
    chain::{Character, GrowableChain, PeerRole, Roster},
    collision::{ignores, overlaps, Outcome},
    config::GameConfig,
    ecs::{EntityId, Transform, World},
    event::EventHub,
    math::{Quat, Vec3},
    net::{ClientId, EntitySpawn, EntityState, NetMsg, Outbox, Outgoing, PlayerCommand, Snapshot},
    pool::{EntityPool, PoolError, TemplateId},
    schedule::Scheduler,
    spawn::NetworkSpawner,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    resolver::CollisionResolver,
    spawner::{SpawnContext, SpawnCoordinator, SpawnState},
};

/// Payloads of the session's scheduled tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTimer {
    SpawnFood,
}

#[derive(Debug, Default)]
struct Peer {
    head: Option<EntityId>,
    target: Option<Vec3>,
    last_cmd_tick: u32,
}

pub struct Authority {
    cfg: GameConfig,
    world: World,
    spawner: NetworkSpawner,
    pool: EntityPool,
    scheduler: Scheduler<SessionTimer>,
    coordinator: SpawnCoordinator,
    resolver: CollisionResolver,
    roster: Roster,
    events: EventHub,
    peers: BTreeMap<ClientId, Peer>,
    outbox: Outbox,
    session: CancellationToken,
    running: bool,
    tick: u32,
}

impl Authority {
    pub fn new(cfg: GameConfig) -> Self {
        let coordinator = SpawnCoordinator::new(cfg.food, cfg.bounds, cfg.seed);
        let resolver = CollisionResolver::new(cfg.player.collision_lock_secs);
        Self {
            cfg,
            world: World::default(),
            spawner: NetworkSpawner::new(),
            pool: EntityPool::new(),
            scheduler: Scheduler::new(),
            coordinator,
            resolver,
            roster: Roster::new(),
            events: EventHub::new(),
            peers: BTreeMap::new(),
            outbox: Outbox::default(),
            session: CancellationToken::new(),
            running: false,
            tick: 0,
        }
    }

    /// Starts the authority role: pool, initial food batch, spawn timer.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.running || self.session.is_cancelled() {
            return Ok(());
        }
        let ctx = SpawnContext {
            world: &mut self.world,
            spawner: &mut self.spawner,
            pool: &self.pool,
            outbox: &mut self.outbox,
        };
        self.coordinator
            .start(ctx, &self.cfg.pool, &mut self.scheduler, &self.session)?;
        self.running = true;
        info!(peers = self.peers.len(), "Authority session started");
        Ok(())
    }

    /// Ends the authority role. Cancels every timer, despawns all characters
    /// and tears the pool down. Terminal.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.session.cancel();
        self.coordinator.stop();
        self.scheduler.clear();
        for head in self.roster.heads() {
            self.despawn_character(head);
        }
        for peer in self.peers.values_mut() {
            peer.head = None;
        }
        self.outbox.broadcast(NetMsg::Disconnect {
            reason: "server shutting down".to_string(),
        });
        self.pool.unregister_all(&mut self.world, &mut self.spawner);
        self.running = false;
        info!("Authority session stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn config(&self) -> &GameConfig {
        &self.cfg
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    /// Direct world access for tooling and tests (placement, inspection).
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn pool(&self) -> &EntityPool {
        &self.pool
    }

    pub fn spawner(&self) -> &NetworkSpawner {
        &self.spawner
    }

    pub fn spawn_state(&self) -> SpawnState {
        self.coordinator.state()
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn has_peer(&self, client: ClientId) -> bool {
        self.peers.contains_key(&client)
    }

    /// Head controlled by `client`.
    pub fn head_of(&self, client: ClientId) -> Option<EntityId> {
        self.peers.get(&client).and_then(|p| p.head)
    }

    /// Current length of `client`'s character.
    pub fn length_of(&self, client: ClientId) -> Option<u16> {
        let head = self.head_of(client)?;
        self.roster.get(head).map(|c| c.chain.length())
    }

    pub fn food_count(&self) -> usize {
        self.spawner.count(TemplateId::FOOD)
    }

    /// Registers a peer and sends it every spawned entity.
    pub fn connect_peer(&mut self, client: ClientId) {
        if self.peers.contains_key(&client) {
            return;
        }
        self.peers.insert(client, Peer::default());

        let ids: Vec<EntityId> = self.spawner.spawned().map(|(id, _)| id).collect();
        for id in ids {
            if let Some(spawn) = self.catch_up_spawn(id) {
                self.outbox.send_to(client, NetMsg::EntitySpawn(spawn));
            }
        }
        self.coordinator
            .on_peer_connected(&mut self.scheduler, &self.session);
        info!(client_id = ?client, peers = self.peers.len(), "Peer connected");
    }

    fn catch_up_spawn(&self, id: EntityId) -> Option<EntitySpawn> {
        let mut spawn = self.spawner.spawn_message(&self.world, id)?;
        spawn.length = self.roster.get(id).map(|c| c.chain.length());
        Some(spawn)
    }

    /// Spawns `client`'s character. Returns `None` if the peer is unknown or
    /// already has one.
    pub fn spawn_player(&mut self, client: ClientId) -> Result<Option<EntityId>, PoolError> {
        if !self.running {
            return Ok(None);
        }
        match self.peers.get(&client) {
            Some(peer) if peer.head.is_none() => {}
            _ => return Ok(None),
        }

        let position = self.coordinator.random_position();
        let head = self.spawner.instantiate(
            &mut self.world,
            TemplateId::PLAYER,
            client,
            position,
            Quat::IDENTITY,
        )?;
        let mut chain = GrowableChain::new(head, PeerRole::AUTHORITY);
        if let Err(e) = chain.on_spawn(&mut self.world) {
            warn!(entity = ?head, error = %e, "Character spawn failed");
            return Ok(None);
        }
        self.roster.insert(head, Character { owner: client, chain });

        if let Some(mut spawn) = self.spawner.spawn(&self.world, head, client) {
            spawn.length = Some(1);
            self.outbox.broadcast(NetMsg::EntitySpawn(spawn));
        }
        if let Some(peer) = self.peers.get_mut(&client) {
            peer.head = Some(head);
        }
        info!(client_id = ?client, entity = ?head, "Player spawned");
        Ok(Some(head))
    }

    /// Removes a peer and despawns its character.
    pub fn disconnect_peer(&mut self, client: ClientId) {
        let Some(peer) = self.peers.remove(&client) else {
            return;
        };
        if let Some(head) = peer.head {
            self.despawn_character(head);
        }
        self.resolver.forget(client, peer.head);
        info!(client_id = ?client, peers = self.peers.len(), "Peer disconnected");
    }

    /// Despawns any spawned entity, characters included. Returns false if it
    /// was not spawned.
    pub fn despawn_entity(&mut self, entity: EntityId) -> Result<bool, PoolError> {
        if self.roster.contains(entity) {
            if let Some(peer) = self.peers.values_mut().find(|p| p.head == Some(entity)) {
                peer.head = None;
            }
            self.despawn_character(entity);
            return Ok(true);
        }
        let despawned = self.spawner.despawn(&mut self.world, entity)?;
        if despawned {
            self.outbox.broadcast(NetMsg::EntityDespawn { id: entity });
        }
        Ok(despawned)
    }

    fn despawn_character(&mut self, head: EntityId) {
        if let Some(mut character) = self.roster.remove(head) {
            character.chain.on_despawn(&mut self.world);
        }
        match self.spawner.despawn(&mut self.world, head) {
            Ok(true) => self.outbox.broadcast(NetMsg::EntityDespawn { id: head }),
            Ok(false) => {}
            Err(e) => warn!(entity = ?head, error = %e, "Character despawn failed"),
        }
    }

    /// Records the steering target from a client command. Stale commands
    /// are dropped.
    pub fn apply_command(&mut self, cmd: &PlayerCommand) {
        let Some(peer) = self.peers.get_mut(&cmd.client_id) else {
            return;
        };
        if cmd.tick < peer.last_cmd_tick {
            return;
        }
        peer.last_cmd_tick = cmd.tick;
        peer.target = Some(cmd.target.flat());
    }

    /// One fixed simulation step.
    pub fn step(&mut self, dt: f32) -> Result<(), PoolError> {
        if !self.running {
            return Ok(());
        }
        self.tick = self.tick.wrapping_add(1);

        self.move_heads(dt);
        self.roster.update_follow(&mut self.world, dt, &self.cfg.tail);
        self.resolver.tick(dt);

        for timer in self.scheduler.advance(Duration::from_secs_f32(dt)) {
            match timer {
                SessionTimer::SpawnFood => {
                    let ctx = SpawnContext {
                        world: &mut self.world,
                        spawner: &mut self.spawner,
                        pool: &self.pool,
                        outbox: &mut self.outbox,
                    };
                    self.coordinator.on_timer(ctx, self.peers.len())?;
                }
            }
        }

        self.detect_food_contacts()?;
        self.detect_character_contacts();
        Ok(())
    }

    fn move_heads(&mut self, dt: f32) {
        let speed = self.cfg.player.speed;
        for peer in self.peers.values() {
            let (Some(head), Some(target)) = (peer.head, peer.target) else {
                continue;
            };
            let Some(transform) = self.world.get_mut::<Transform>(head) else {
                continue;
            };
            let next = transform.position.move_towards(target, speed * dt);
            if let Some(facing) = Quat::looking_up(target.sub(transform.position)) {
                transform.rotation = facing;
            }
            transform.position = next;
        }
    }

    /// Heads plus segments of every live character, with contact radii.
    fn bodies(&self, head: EntityId) -> Vec<(EntityId, Vec3, f32)> {
        let Some(character) = self.roster.get(head) else {
            return Vec::new();
        };
        let player = &self.cfg.player;
        std::iter::once((head, player.head_radius))
            .chain(
                character
                    .chain
                    .segments()
                    .iter()
                    .map(|s| (*s, player.segment_radius)),
            )
            .filter_map(|(e, r)| self.world.position(e).map(|p| (e, p, r)))
            .collect()
    }

    fn live_heads(&self) -> Vec<EntityId> {
        self.roster
            .iter()
            .filter(|(_, c)| !self.resolver.is_eliminated(c.owner))
            .map(|(head, _)| head)
            .collect()
    }

    fn detect_food_contacts(&mut self) -> Result<(), PoolError> {
        let radius = self.cfg.food.radius;
        for head in self.live_heads() {
            let foods: Vec<(EntityId, Vec3)> = self
                .spawner
                .spawned()
                .filter(|(_, r)| r.template == TemplateId::FOOD)
                .filter(|(id, _)| self.world.is_active(*id))
                .filter_map(|(id, _)| self.world.position(id).map(|p| (id, p)))
                .collect();
            let bodies = self.bodies(head);
            for (food, food_pos) in foods {
                if bodies
                    .iter()
                    .any(|(_, pos, r)| overlaps(*pos, *r, food_pos, radius))
                {
                    self.feed_character(head, food)?;
                }
            }
        }
        Ok(())
    }

    /// Grows `head` by one and returns `food` to the pool. Returns false if
    /// either is already gone or `food` is not a food entity.
    pub fn feed_character(&mut self, head: EntityId, food: EntityId) -> Result<bool, PoolError> {
        if self.spawner.record(food).map(|r| r.template) != Some(TemplateId::FOOD) {
            return Ok(false);
        }
        let Some(character) = self.roster.get_mut(head) else {
            return Ok(false);
        };
        let change = match character.chain.add_segment(&mut self.world, &self.events) {
            Ok(change) => change,
            Err(e) => {
                debug!(entity = ?head, error = %e, "Growth dropped");
                return Ok(false);
            }
        };
        self.outbox.broadcast(NetMsg::LengthChanged {
            id: head,
            previous: change.previous,
            value: change.current,
        });
        if self.spawner.despawn(&mut self.world, food)? {
            self.outbox.broadcast(NetMsg::EntityDespawn { id: food });
        }
        debug!(entity = ?head, food = ?food, length = change.current, "Character ate food");
        Ok(true)
    }

    fn detect_character_contacts(&mut self) {
        let head_radius = self.cfg.player.head_radius;
        let heads = self.live_heads();
        for &initiator in &heads {
            let Some(pos) = self.world.position(initiator) else {
                continue;
            };
            for &other in &heads {
                let touched = self
                    .bodies(other)
                    .into_iter()
                    .filter(|(e, _, _)| !ignores(&self.world, *e, initiator))
                    .find(|(_, p, r)| overlaps(pos, head_radius, *p, *r));
                if let Some((entity, _, _)) = touched {
                    self.resolve_collision(initiator, entity);
                }
            }
        }
    }

    /// Arbitrates a contact between two characters' heads or segments.
    pub fn resolve_collision(&mut self, initiator: EntityId, other: EntityId) -> Option<Outcome> {
        self.resolver
            .resolve(&self.roster, &self.world, initiator, other, &mut self.outbox)
    }

    /// Transforms of every active spawned entity, ascending id.
    pub fn snapshot(&self) -> Snapshot {
        let entities = self
            .spawner
            .spawned()
            .filter(|(id, _)| self.world.is_active(*id))
            .filter_map(|(id, _)| {
                self.world.get::<Transform>(id).map(|t| EntityState {
                    id,
                    position: t.position,
                    rotation: t.rotation,
                })
            })
            .collect();
        Snapshot {
            tick: self.tick,
            entities,
        }
    }

    pub fn drain_outbox(&mut self) -> Vec<Outgoing> {
        self.outbox.drain()
    }
}
