//! Networked entity pool.
//!
//! Recycles instances per template instead of allocating and freeing one per
//! spawn. Registering a template installs a [`PooledPrefabHandler`] with the
//! [`NetworkSpawner`], so the spawner's create/destroy requests for that
//! template become [`EntityPool::acquire`] / [`EntityPool::release`].
//!
//! Lifecycle: initialized when the authority role starts, torn down with
//! [`EntityPool::unregister_all`] when it ends. Observers never hold a pool.
//!
//! The pool is a cloneable handle over one mutex-guarded registry; the
//! installed handlers and the spawn coordinator share it.
//!
//! Acquire never fails for capacity reasons: an empty queue falls back to a
//! fresh allocation. The pool does not deduplicate releases. Callers despawn
//! through the spawner, which releases at most once; a second release of an
//! already pooled instance is rejected with [`PoolError::DuplicateRelease`].

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::PoolTemplateConfig,
    ecs::{Active, EntityId, Transform, World},
    math::{Quat, Vec3},
    net::ClientId,
    spawn::{instantiate_plain, NetworkSpawner, PrefabHandler},
};

/// Identifies an entity template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TemplateId(pub u32);

impl TemplateId {
    pub const PLAYER: TemplateId = TemplateId(1);
    pub const FOOD: TemplateId = TemplateId(2);
}

/// Pool operation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Template registered twice.
    DuplicateTemplate(TemplateId),
    /// Template was never registered.
    UnregisteredTemplate(TemplateId),
    /// Instance is already in the pool.
    DuplicateRelease(EntityId),
    /// Instance was not created by this template's pool.
    ForeignInstance {
        entity: EntityId,
        template: TemplateId,
    },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::DuplicateTemplate(t) => write!(f, "template {} is already registered", t.0),
            PoolError::UnregisteredTemplate(t) => write!(f, "template {} is not registered", t.0),
            PoolError::DuplicateRelease(e) => write!(f, "entity {} is already pooled", e.0),
            PoolError::ForeignInstance { entity, template } => write!(
                f,
                "entity {} does not belong to template {}",
                entity.0, template.0
            ),
        }
    }
}

impl std::error::Error for PoolError {}

#[derive(Debug, Default)]
struct TemplatePool {
    queue: VecDeque<EntityId>,
    active: usize,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    template: TemplateId,
    pooled: bool,
}

/// Template → (queue of pooled instances, active count).
#[derive(Debug, Default)]
pub struct PoolRegistry {
    templates: HashMap<TemplateId, TemplatePool>,
    instances: HashMap<EntityId, Slot>,
    initialized: bool,
}

impl PoolRegistry {
    fn template_mut(&mut self, template: TemplateId) -> Result<&mut TemplatePool, PoolError> {
        self.templates
            .get_mut(&template)
            .ok_or(PoolError::UnregisteredTemplate(template))
    }

    fn acquire(
        &mut self,
        world: &mut World,
        template: TemplateId,
        position: Vec3,
        rotation: Quat,
    ) -> Result<EntityId, PoolError> {
        let pool = self.template_mut(template)?;
        let reused = pool.queue.pop_front();
        pool.active += 1;

        let entity = match reused {
            Some(entity) => {
                world.insert(entity, Active(true));
                world.insert(entity, Transform::new(position, rotation));
                entity
            }
            None => instantiate_plain(world, template, position, rotation),
        };
        self.instances.insert(
            entity,
            Slot {
                template,
                pooled: false,
            },
        );
        Ok(entity)
    }

    fn release(
        &mut self,
        world: &mut World,
        entity: EntityId,
        template: TemplateId,
    ) -> Result<(), PoolError> {
        self.template_mut(template)?;
        let slot = self
            .instances
            .get_mut(&entity)
            .filter(|slot| slot.template == template)
            .ok_or(PoolError::ForeignInstance { entity, template })?;
        if slot.pooled {
            return Err(PoolError::DuplicateRelease(entity));
        }
        slot.pooled = true;

        world.insert(entity, Active(false));
        let pool = self.template_mut(template)?;
        pool.queue.push_back(entity);
        pool.active = pool.active.saturating_sub(1);
        Ok(())
    }
}

/// Shared handle to the pool registry.
#[derive(Debug, Clone, Default)]
pub struct EntityPool {
    inner: Arc<Mutex<PoolRegistry>>,
}

impl EntityPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, PoolRegistry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a template, prewarms `prewarm_count` inactive instances and
    /// installs the interception handler with `spawner`.
    pub fn register(
        &self,
        world: &mut World,
        spawner: &mut NetworkSpawner,
        template: TemplateId,
        prewarm_count: usize,
    ) -> Result<(), PoolError> {
        {
            let mut registry = self.registry();
            if registry.templates.contains_key(&template) {
                return Err(PoolError::DuplicateTemplate(template));
            }

            let mut pool = TemplatePool::default();
            for _ in 0..prewarm_count {
                let entity = instantiate_plain(world, template, Vec3::ZERO, Quat::IDENTITY);
                world.insert(entity, Active(false));
                pool.queue.push_back(entity);
                registry.instances.insert(
                    entity,
                    Slot {
                        template,
                        pooled: true,
                    },
                );
            }
            registry.templates.insert(template, pool);
        }

        spawner.add_handler(
            template,
            Box::new(PooledPrefabHandler {
                template,
                pool: self.clone(),
            }),
        );
        info!(template = ?template, prewarm_count, "Registered pooled template");
        Ok(())
    }

    /// Registers every configured template. A second call is a no-op.
    pub fn initialize(
        &self,
        world: &mut World,
        spawner: &mut NetworkSpawner,
        templates: &[PoolTemplateConfig],
    ) -> Result<(), PoolError> {
        if self.is_initialized() {
            return Ok(());
        }
        for cfg in templates {
            self.register(world, spawner, cfg.template, cfg.prewarm_count)?;
        }
        self.registry().initialized = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.registry().initialized
    }

    pub fn is_registered(&self, template: TemplateId) -> bool {
        self.registry().templates.contains_key(&template)
    }

    /// Takes a pooled instance (or allocates one) and activates it at the
    /// given placement.
    pub fn acquire(
        &self,
        world: &mut World,
        template: TemplateId,
        position: Vec3,
        rotation: Quat,
    ) -> Result<EntityId, PoolError> {
        let entity = self.registry().acquire(world, template, position, rotation)?;
        debug!(entity = ?entity, template = ?template, "Acquired pooled entity");
        Ok(entity)
    }

    /// Deactivates an instance and queues it for reuse.
    pub fn release(
        &self,
        world: &mut World,
        entity: EntityId,
        template: TemplateId,
    ) -> Result<(), PoolError> {
        self.registry().release(world, entity, template)?;
        debug!(entity = ?entity, template = ?template, "Released pooled entity");
        Ok(())
    }

    /// Instances of `template` currently in use.
    pub fn active_count(&self, template: TemplateId) -> Result<usize, PoolError> {
        self.registry()
            .templates
            .get(&template)
            .map(|pool| pool.active)
            .ok_or(PoolError::UnregisteredTemplate(template))
    }

    /// Instances of `template` waiting in the queue.
    pub fn pooled_count(&self, template: TemplateId) -> Result<usize, PoolError> {
        self.registry()
            .templates
            .get(&template)
            .map(|pool| pool.queue.len())
            .ok_or(PoolError::UnregisteredTemplate(template))
    }

    /// Removes every handler, clears the queues and frees the queued
    /// instances. Active instances are left to their owners.
    pub fn unregister_all(&self, world: &mut World, spawner: &mut NetworkSpawner) {
        let mut registry = self.registry();
        for (template, pool) in registry.templates.drain() {
            spawner.remove_handler(template);
            for entity in pool.queue {
                world.despawn(entity);
            }
        }
        registry.instances.clear();
        registry.initialized = false;
        info!("Pool cleared");
    }
}

/// Spawner hook routing a template's create/destroy through the pool.
pub struct PooledPrefabHandler {
    template: TemplateId,
    pool: EntityPool,
}

impl PrefabHandler for PooledPrefabHandler {
    fn instantiate(
        &mut self,
        world: &mut World,
        _owner: ClientId,
        position: Vec3,
        rotation: Quat,
    ) -> Result<EntityId, PoolError> {
        self.pool.acquire(world, self.template, position, rotation)
    }

    fn destroy(&mut self, world: &mut World, entity: EntityId) -> Result<(), PoolError> {
        self.pool.release(world, entity, self.template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(prewarm: usize) -> (World, NetworkSpawner, EntityPool) {
        let mut world = World::default();
        let mut spawner = NetworkSpawner::new();
        let pool = EntityPool::new();
        pool.register(&mut world, &mut spawner, TemplateId::FOOD, prewarm)
            .unwrap();
        (world, spawner, pool)
    }

    #[test]
    fn register_prewarms_inactive_instances() {
        let (world, spawner, pool) = setup(4);
        assert_eq!(pool.pooled_count(TemplateId::FOOD), Ok(4));
        assert_eq!(pool.active_count(TemplateId::FOOD), Ok(0));
        assert!(spawner.has_handler(TemplateId::FOOD));
        assert_eq!(world.len(), 4);
        assert!(world.iter::<Active>().all(|(_, a)| !a.0));
    }

    #[test]
    fn duplicate_registration_fails() {
        let (mut world, mut spawner, pool) = setup(0);
        assert_eq!(
            pool.register(&mut world, &mut spawner, TemplateId::FOOD, 2),
            Err(PoolError::DuplicateTemplate(TemplateId::FOOD))
        );
        assert_eq!(pool.pooled_count(TemplateId::FOOD), Ok(0));
    }

    #[test]
    fn unknown_template_is_an_error() {
        let (mut world, _spawner, pool) = setup(0);
        let unknown = TemplateId(99);
        assert_eq!(
            pool.active_count(unknown),
            Err(PoolError::UnregisteredTemplate(unknown))
        );
        assert_eq!(
            pool.acquire(&mut world, unknown, Vec3::ZERO, Quat::IDENTITY),
            Err(PoolError::UnregisteredTemplate(unknown))
        );
        assert_eq!(
            pool.release(&mut world, EntityId(1), unknown),
            Err(PoolError::UnregisteredTemplate(unknown))
        );
    }

    #[test]
    fn acquire_reuses_queued_instance_and_places_it() {
        let (mut world, _spawner, pool) = setup(1);
        let at = Vec3::new(2.0, -1.0, 0.0);
        let e = pool
            .acquire(&mut world, TemplateId::FOOD, at, Quat::IDENTITY)
            .unwrap();
        assert!(world.is_active(e));
        assert_eq!(world.position(e), Some(at));
        assert_eq!(pool.pooled_count(TemplateId::FOOD), Ok(0));
        assert_eq!(world.len(), 1);
    }

    #[test]
    fn acquire_on_empty_queue_allocates() {
        let (mut world, _spawner, pool) = setup(0);
        let a = pool
            .acquire(&mut world, TemplateId::FOOD, Vec3::ZERO, Quat::IDENTITY)
            .unwrap();
        let b = pool
            .acquire(&mut world, TemplateId::FOOD, Vec3::ZERO, Quat::IDENTITY)
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.active_count(TemplateId::FOOD), Ok(2));
    }

    #[test]
    fn active_count_is_acquires_minus_releases() {
        let (mut world, _spawner, pool) = setup(3);
        let acquired: Vec<_> = (0..7)
            .map(|_| {
                pool.acquire(&mut world, TemplateId::FOOD, Vec3::ZERO, Quat::IDENTITY)
                    .unwrap()
            })
            .collect();
        for (released, e) in acquired.iter().take(5).enumerate() {
            pool.release(&mut world, *e, TemplateId::FOOD).unwrap();
            assert_eq!(pool.active_count(TemplateId::FOOD), Ok(7 - released - 1));
        }
        assert_eq!(pool.pooled_count(TemplateId::FOOD), Ok(5));
    }

    #[test]
    fn released_instance_is_reused_only_after_release() {
        let (mut world, _spawner, pool) = setup(0);
        let first = pool
            .acquire(&mut world, TemplateId::FOOD, Vec3::ZERO, Quat::IDENTITY)
            .unwrap();
        let second = pool
            .acquire(&mut world, TemplateId::FOOD, Vec3::ZERO, Quat::IDENTITY)
            .unwrap();
        assert_ne!(first, second);

        pool.release(&mut world, first, TemplateId::FOOD).unwrap();
        assert!(!world.is_active(first));
        let third = pool
            .acquire(&mut world, TemplateId::FOOD, Vec3::ZERO, Quat::IDENTITY)
            .unwrap();
        assert_eq!(third, first);
        assert_ne!(third, second);
    }

    #[test]
    fn double_release_is_rejected() {
        let (mut world, _spawner, pool) = setup(0);
        let e = pool
            .acquire(&mut world, TemplateId::FOOD, Vec3::ZERO, Quat::IDENTITY)
            .unwrap();
        pool.release(&mut world, e, TemplateId::FOOD).unwrap();
        assert_eq!(
            pool.release(&mut world, e, TemplateId::FOOD),
            Err(PoolError::DuplicateRelease(e))
        );
        assert_eq!(pool.pooled_count(TemplateId::FOOD), Ok(1));
        assert_eq!(pool.active_count(TemplateId::FOOD), Ok(0));
    }

    #[test]
    fn releasing_foreign_instance_is_rejected() {
        let (mut world, _spawner, pool) = setup(0);
        let stranger = world.spawn();
        assert_eq!(
            pool.release(&mut world, stranger, TemplateId::FOOD),
            Err(PoolError::ForeignInstance {
                entity: stranger,
                template: TemplateId::FOOD
            })
        );
    }

    #[test]
    fn spawner_routes_through_pool() {
        let (mut world, mut spawner, pool) = setup(2);
        let e = spawner
            .instantiate(&mut world, TemplateId::FOOD, ClientId::SERVER, Vec3::ZERO, Quat::IDENTITY)
            .unwrap();
        spawner.spawn(&world, e, ClientId::SERVER).unwrap();
        assert_eq!(pool.active_count(TemplateId::FOOD), Ok(1));

        assert!(spawner.despawn(&mut world, e).unwrap());
        assert_eq!(pool.active_count(TemplateId::FOOD), Ok(0));
        assert_eq!(pool.pooled_count(TemplateId::FOOD), Ok(2));
        assert!(world.contains(e));
        assert!(!spawner.despawn(&mut world, e).unwrap());
    }

    #[test]
    fn initialize_is_idempotent() {
        let mut world = World::default();
        let mut spawner = NetworkSpawner::new();
        let pool = EntityPool::new();
        let cfg = [PoolTemplateConfig {
            template: TemplateId::FOOD,
            prewarm_count: 2,
        }];
        pool.initialize(&mut world, &mut spawner, &cfg).unwrap();
        pool.initialize(&mut world, &mut spawner, &cfg).unwrap();
        assert_eq!(pool.pooled_count(TemplateId::FOOD), Ok(2));
    }

    #[test]
    fn unregister_all_removes_hooks_and_queues() {
        let (mut world, mut spawner, pool) = setup(3);
        let active = pool
            .acquire(&mut world, TemplateId::FOOD, Vec3::ZERO, Quat::IDENTITY)
            .unwrap();
        pool.unregister_all(&mut world, &mut spawner);

        assert!(!spawner.has_handler(TemplateId::FOOD));
        assert!(!pool.is_registered(TemplateId::FOOD));
        assert!(!pool.is_initialized());
        assert_eq!(world.len(), 1);
        assert!(world.contains(active));
    }
}
