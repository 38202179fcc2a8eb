//! Food spawn coordinator.
//!
//! `Idle → Spawning → Waiting → Spawning → … → Idle`
//!
//! - `start` initializes the pool and spawns the initial batch synchronously.
//! - A single repeating timer fires every `spawn_interval_secs`; each firing
//!   spawns one food while a peer is connected and the pool reports fewer
//!   than `max_count` active instances.
//! - The timer is cancelled when the last peer is gone and re-armed when a
//!   peer connects again. `stop` is terminal.

use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use slither_shared::{
    config::{Bounds, FoodConfig, PoolTemplateConfig},
    ecs::{EntityId, World},
    math::{Quat, Vec3},
    net::{ClientId, NetMsg, Outbox},
    pool::{EntityPool, PoolError, TemplateId},
    schedule::Scheduler,
    spawn::NetworkSpawner,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::authority::SessionTimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnState {
    Idle,
    Spawning,
    Waiting,
}

/// Session state the coordinator works on, borrowed per call.
pub struct SpawnContext<'a> {
    pub world: &'a mut World,
    pub spawner: &'a mut NetworkSpawner,
    pub pool: &'a EntityPool,
    pub outbox: &'a mut Outbox,
}

pub struct SpawnCoordinator {
    state: SpawnState,
    food: FoodConfig,
    bounds: Bounds,
    rng: StdRng,
    timer: Option<CancellationToken>,
    stopped: bool,
}

impl SpawnCoordinator {
    pub fn new(food: FoodConfig, bounds: Bounds, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            state: SpawnState::Idle,
            food,
            bounds,
            rng,
            timer: None,
            stopped: false,
        }
    }

    pub fn state(&self) -> SpawnState {
        self.state
    }

    /// Whether the periodic timer is armed.
    pub fn is_armed(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_cancelled())
    }

    /// Uniform point inside the play field, z = 0.
    pub fn random_position(&mut self) -> Vec3 {
        let x = self
            .rng
            .gen_range(-self.bounds.half_width..=self.bounds.half_width);
        let y = self
            .rng
            .gen_range(-self.bounds.half_height..=self.bounds.half_height);
        Vec3::new(x, y, 0.0)
    }

    /// Initializes the pool, spawns the initial batch and arms the timer.
    pub fn start(
        &mut self,
        ctx: SpawnContext<'_>,
        templates: &[PoolTemplateConfig],
        scheduler: &mut Scheduler<SessionTimer>,
        session: &CancellationToken,
    ) -> Result<usize, PoolError> {
        if self.stopped || self.state != SpawnState::Idle {
            return Ok(0);
        }
        self.state = SpawnState::Spawning;
        let SpawnContext {
            world,
            spawner,
            pool,
            outbox,
        } = ctx;
        pool.initialize(world, spawner, templates)?;

        for _ in 0..self.food.initial_count {
            self.spawn_one(world, spawner, outbox)?;
        }
        self.arm(scheduler, session);
        info!(
            initial = self.food.initial_count,
            max = self.food.max_count,
            interval_secs = self.food.spawn_interval_secs,
            "Food spawning started"
        );
        Ok(self.food.initial_count)
    }

    /// Timer callback. Returns the spawned entity, if any.
    pub fn on_timer(
        &mut self,
        ctx: SpawnContext<'_>,
        peers: usize,
    ) -> Result<Option<EntityId>, PoolError> {
        if self.state == SpawnState::Idle {
            return Ok(None);
        }
        if peers == 0 {
            self.cancel_timer();
            self.state = SpawnState::Idle;
            info!("No peers connected, food spawning idle");
            return Ok(None);
        }

        self.state = SpawnState::Spawning;
        let active = ctx.pool.active_count(TemplateId::FOOD)?;
        let spawned = if active < self.food.max_count {
            Some(self.spawn_one(ctx.world, ctx.spawner, ctx.outbox)?)
        } else {
            debug!(active, max = self.food.max_count, "Food at capacity, skipping");
            None
        };
        self.state = SpawnState::Waiting;
        Ok(spawned)
    }

    /// Re-arms an idle coordinator while the session is still running.
    pub fn on_peer_connected(
        &mut self,
        scheduler: &mut Scheduler<SessionTimer>,
        session: &CancellationToken,
    ) {
        if self.stopped || self.state != SpawnState::Idle || session.is_cancelled() {
            return;
        }
        self.arm(scheduler, session);
        info!("Peer connected, food spawning re-armed");
    }

    /// Terminal: cancels the timer for good.
    pub fn stop(&mut self) {
        self.cancel_timer();
        self.stopped = true;
        self.state = SpawnState::Idle;
    }

    fn arm(&mut self, scheduler: &mut Scheduler<SessionTimer>, session: &CancellationToken) {
        self.cancel_timer();
        let token = session.child_token();
        let interval = Duration::from_secs_f32(self.food.spawn_interval_secs.max(0.0));
        scheduler.schedule_repeating(interval, interval, SessionTimer::SpawnFood, token.clone());
        self.timer = Some(token);
        self.state = SpawnState::Waiting;
    }

    fn cancel_timer(&mut self) {
        if let Some(token) = self.timer.take() {
            token.cancel();
        }
    }

    fn spawn_one(
        &mut self,
        world: &mut World,
        spawner: &mut NetworkSpawner,
        outbox: &mut Outbox,
    ) -> Result<EntityId, PoolError> {
        let position = self.random_position();
        let entity = spawner.instantiate(
            world,
            TemplateId::FOOD,
            ClientId::SERVER,
            position,
            Quat::IDENTITY,
        )?;
        if let Some(spawn) = spawner.spawn(world, entity, ClientId::SERVER) {
            outbox.broadcast(NetMsg::EntitySpawn(spawn));
        }
        debug!(entity = ?entity, x = position.x, y = position.y, "Spawned food");
        Ok(entity)
    }
}
