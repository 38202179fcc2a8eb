//! `slither_tests`
//!
//! In-memory loopback harness: one [`Authority`] plus any number of
//! [`Observer`]s wired together without sockets. Outgoing messages are
//! delivered in order and only to the peers their target includes, so
//! multi-peer scenarios run deterministically.

use std::collections::BTreeMap;

use anyhow::Context;

use slither_client::Observer;
use slither_server::Authority;
use slither_shared::{
    config::GameConfig,
    ecs::{EntityId, Transform},
    math::Vec3,
    net::{ClientId, NetMsg, PlayerData},
    pool::{PoolError, TemplateId},
};
use tracing::debug;

/// Fixed step used by [`LocalSession::advance`].
pub const TICK_SECS: f32 = 1.0 / 64.0;

struct LocalPeer {
    observer: Observer,
    connected: bool,
    received: Vec<NetMsg>,
}

pub struct LocalSession {
    pub authority: Authority,
    cfg: GameConfig,
    peers: BTreeMap<ClientId, LocalPeer>,
    next_client: u64,
}

impl LocalSession {
    /// Starts an authority session with `cfg`.
    pub fn start(cfg: GameConfig) -> Result<Self, PoolError> {
        let mut authority = Authority::new(cfg.clone());
        authority.start()?;
        // Nobody is connected yet.
        authority.drain_outbox();
        Ok(Self {
            authority,
            cfg,
            peers: BTreeMap::new(),
            next_client: 1,
        })
    }

    /// Default configuration with a fixed seed.
    pub fn seeded(seed: u64) -> Result<Self, PoolError> {
        Self::start(GameConfig {
            seed: Some(seed),
            ..GameConfig::default()
        })
    }

    /// Connects a new observer; it receives the catch-up spawns.
    pub fn join(&mut self) -> ClientId {
        let observer = Observer::new(self.cfg.clone());
        self.join_with(observer)
    }

    /// Connects a caller-built observer, e.g. one already subscribed to
    /// local events.
    pub fn join_with(&mut self, mut observer: Observer) -> ClientId {
        let id = ClientId(self.next_client);
        self.next_client += 1;

        observer.handle(NetMsg::Welcome { client_id: id });
        self.peers.insert(
            id,
            LocalPeer {
                observer,
                connected: true,
                received: Vec::new(),
            },
        );
        self.authority.connect_peer(id);
        self.pump();
        id
    }

    /// Joins and spawns a character. Returns the client and its head.
    pub fn join_player(&mut self) -> anyhow::Result<(ClientId, EntityId)> {
        let id = self.join();
        let head = self
            .authority
            .spawn_player(id)?
            .context("authority refused to spawn a character")?;
        self.pump();
        Ok((id, head))
    }

    pub fn config(&self) -> &GameConfig {
        &self.cfg
    }

    pub fn observer(&self, id: ClientId) -> Option<&Observer> {
        self.peers.get(&id).map(|p| &p.observer)
    }

    pub fn observer_mut(&mut self, id: ClientId) -> Option<&mut Observer> {
        self.peers.get_mut(&id).map(|p| &mut p.observer)
    }

    /// Every reliable message delivered to `id`, oldest first.
    pub fn received(&self, id: ClientId) -> &[NetMsg] {
        self.peers
            .get(&id)
            .map(|p| p.received.as_slice())
            .unwrap_or_default()
    }

    /// Collision notifications delivered to `id`.
    pub fn outcomes(&self, id: ClientId) -> Vec<NetMsg> {
        self.received(id)
            .iter()
            .filter(|m| matches!(m, NetMsg::AtePlayer { .. } | NetMsg::GameOver { .. }))
            .cloned()
            .collect()
    }

    pub fn is_connected(&self, id: ClientId) -> bool {
        self.peers.get(&id).is_some_and(|p| p.connected)
    }

    pub fn clients(&self) -> Vec<ClientId> {
        self.peers.keys().copied().collect()
    }

    /// Delivers queued messages both ways until nothing is left in flight.
    pub fn pump(&mut self) {
        loop {
            let outgoing = self.authority.drain_outbox();
            for out in &outgoing {
                for (id, peer) in self.peers.iter_mut() {
                    if peer.connected && out.target.includes(*id) {
                        peer.received.push(out.msg.clone());
                        peer.observer.handle(out.msg.clone());
                    }
                }
            }

            let mut replies = Vec::new();
            for (id, peer) in self.peers.iter_mut() {
                if !peer.connected {
                    continue;
                }
                for msg in peer.observer.drain_outgoing() {
                    replies.push((*id, msg));
                }
            }
            if outgoing.is_empty() && replies.is_empty() {
                break;
            }
            for (id, msg) in replies {
                self.on_client_message(id, msg);
            }
        }
    }

    fn on_client_message(&mut self, id: ClientId, msg: NetMsg) {
        match msg {
            NetMsg::Disconnect { reason } => {
                debug!(client_id = ?id, %reason, "Local peer left");
                self.leave(id);
            }
            NetMsg::ClientReady { .. } => {
                let _ = self.authority.spawn_player(id);
            }
            NetMsg::PlayerCommand(cmd) => self.authority.apply_command(&cmd),
            other => debug!(client_id = ?id, ?other, "Ignored client message"),
        }
    }

    /// Disconnects a peer from the authority.
    pub fn leave(&mut self, id: ClientId) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.connected = false;
        }
        self.authority.disconnect_peer(id);
    }

    /// One tick on every peer, with a snapshot delivered to each observer.
    pub fn step(&mut self, dt: f32) -> Result<(), PoolError> {
        self.authority.step(dt)?;
        self.pump();
        let snapshot = NetMsg::Snapshot(self.authority.snapshot());
        for peer in self.peers.values_mut().filter(|p| p.connected) {
            peer.observer.handle(snapshot.clone());
            peer.observer.step(dt);
        }
        self.pump();
        Ok(())
    }

    /// Runs fixed ticks covering `secs` of simulation time.
    pub fn advance(&mut self, secs: f32) -> Result<(), PoolError> {
        let ticks = (secs / TICK_SECS).round() as u32;
        for _ in 0..ticks {
            self.step(TICK_SECS)?;
        }
        Ok(())
    }

    /// Grows `head` by eating `count` food entities.
    pub fn feed(&mut self, head: EntityId, count: usize) -> Result<(), PoolError> {
        for _ in 0..count {
            let Some(food) = self.food().first().copied() else {
                break;
            };
            self.authority.feed_character(head, food)?;
        }
        self.pump();
        Ok(())
    }

    /// Active food ids on the authority, ascending.
    pub fn food(&self) -> Vec<EntityId> {
        self.authority
            .spawner()
            .spawned()
            .filter(|(_, r)| r.template == TemplateId::FOOD)
            .map(|(id, _)| id)
            .collect()
    }

    /// Despawns all food.
    pub fn clear_food(&mut self) -> Result<(), PoolError> {
        for food in self.food() {
            self.authority.despawn_entity(food)?;
        }
        self.pump();
        Ok(())
    }

    /// Moves a character's head and every segment to `position`.
    pub fn place(&mut self, head: EntityId, position: Vec3) {
        let mut parts = vec![head];
        if let Some(c) = self.authority.roster().get(head) {
            parts.extend_from_slice(c.chain.segments());
        }
        for part in parts {
            if let Some(t) = self.authority.world_mut().get_mut::<Transform>(part) {
                t.position = position;
            }
        }
    }

    /// Ends the authority role and delivers the teardown messages.
    pub fn teardown(&mut self) {
        self.authority.stop();
        self.pump();
    }
}

/// `PlayerData` as it appears in collision notifications.
pub fn player_data(id: ClientId, length: u16) -> PlayerData {
    PlayerData { id: id.0, length }
}
