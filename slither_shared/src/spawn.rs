//! Network spawn subsystem.
//!
//! Tracks which entities are network-spawned and routes instantiation and
//! destruction of each template either through a registered
//! [`PrefabHandler`] (the pool installs one per pooled template) or through
//! plain world allocation.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::{
    ecs::{Active, EntityId, Transform, World},
    math::{Quat, Vec3},
    net::{ClientId, EntitySpawn},
    pool::{PoolError, TemplateId},
};

/// Create/destroy interception for one template.
///
/// Handlers live inside the session state, which the server shell holds
/// across `.await` points on a multi-thread runtime.
pub trait PrefabHandler: Send + Sync {
    /// Produces an active instance placed at `position`/`rotation`.
    fn instantiate(
        &mut self,
        world: &mut World,
        owner: ClientId,
        position: Vec3,
        rotation: Quat,
    ) -> Result<EntityId, PoolError>;

    /// Takes an instance back once it has been despawned.
    fn destroy(&mut self, world: &mut World, entity: EntityId) -> Result<(), PoolError>;
}

/// Bookkeeping for a network-spawned entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnRecord {
    pub template: TemplateId,
    pub owner: ClientId,
}

/// Allocates a plain active entity of `template`.
pub fn instantiate_plain(
    world: &mut World,
    template: TemplateId,
    position: Vec3,
    rotation: Quat,
) -> EntityId {
    let entity = world.spawn();
    world.insert(entity, template);
    world.insert(entity, Transform::new(position, rotation));
    world.insert(entity, Active(true));
    entity
}

/// Host-side spawn manager.
#[derive(Default)]
pub struct NetworkSpawner {
    handlers: HashMap<TemplateId, Box<dyn PrefabHandler>>,
    spawned: BTreeMap<EntityId, SpawnRecord>,
}

impl NetworkSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the handler for a template, replacing any previous one.
    pub fn add_handler(&mut self, template: TemplateId, handler: Box<dyn PrefabHandler>) {
        self.handlers.insert(template, handler);
    }

    /// Removes the handler for a template. Returns false if none was set.
    pub fn remove_handler(&mut self, template: TemplateId) -> bool {
        self.handlers.remove(&template).is_some()
    }

    pub fn has_handler(&self, template: TemplateId) -> bool {
        self.handlers.contains_key(&template)
    }

    /// Creates an instance of `template`, through its handler if one is installed.
    pub fn instantiate(
        &mut self,
        world: &mut World,
        template: TemplateId,
        owner: ClientId,
        position: Vec3,
        rotation: Quat,
    ) -> Result<EntityId, PoolError> {
        match self.handlers.get_mut(&template) {
            Some(handler) => handler.instantiate(world, owner, position, rotation),
            None => Ok(instantiate_plain(world, template, position, rotation)),
        }
    }

    /// Marks an instantiated entity as network-spawned and returns the spawn
    /// message to replicate. Returns `None` if the entity has no template or
    /// is already spawned.
    pub fn spawn(
        &mut self,
        world: &World,
        entity: EntityId,
        owner: ClientId,
    ) -> Option<EntitySpawn> {
        if self.spawned.contains_key(&entity) {
            return None;
        }
        let template = *world.get::<TemplateId>(entity)?;
        self.spawned.insert(entity, SpawnRecord { template, owner });
        debug!(entity = ?entity, template = ?template, owner = ?owner, "Network spawn");
        self.spawn_message(world, entity)
    }

    /// Rebuilds the spawn message for an already spawned entity.
    pub fn spawn_message(&self, world: &World, entity: EntityId) -> Option<EntitySpawn> {
        let record = self.spawned.get(&entity)?;
        let transform = world.get::<Transform>(entity).copied().unwrap_or_default();
        Some(EntitySpawn {
            id: entity,
            template: record.template,
            owner: record.owner,
            position: transform.position,
            rotation: transform.rotation,
            length: None,
        })
    }

    /// Despawns a network-spawned entity and hands it to its template's
    /// handler (or frees it).
    ///
    /// Despawning an entity that is not spawned is a no-op returning
    /// `Ok(false)`; the handler's `destroy` therefore succeeds at most once
    /// per spawn. If `destroy` fails the entity stays spawned.
    pub fn despawn(&mut self, world: &mut World, entity: EntityId) -> Result<bool, PoolError> {
        let Some(record) = self.spawned.get(&entity).copied() else {
            return Ok(false);
        };
        match self.handlers.get_mut(&record.template) {
            Some(handler) => handler.destroy(world, entity)?,
            None => {
                world.despawn(entity);
            }
        }
        self.spawned.remove(&entity);
        debug!(entity = ?entity, template = ?record.template, "Network despawn");
        Ok(true)
    }

    pub fn record(&self, entity: EntityId) -> Option<SpawnRecord> {
        self.spawned.get(&entity).copied()
    }

    /// Spawned entities in ascending id order.
    pub fn spawned(&self) -> impl Iterator<Item = (EntityId, SpawnRecord)> + '_ {
        self.spawned.iter().map(|(id, record)| (*id, *record))
    }

    /// Number of spawned entities of a template.
    pub fn count(&self, template: TemplateId) -> usize {
        self.spawned
            .values()
            .filter(|record| record.template == template)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recording {
        destroyed: std::sync::Arc<std::sync::Mutex<Vec<EntityId>>>,
    }

    impl PrefabHandler for Recording {
        fn instantiate(
            &mut self,
            world: &mut World,
            _owner: ClientId,
            position: Vec3,
            rotation: Quat,
        ) -> Result<EntityId, PoolError> {
            Ok(instantiate_plain(world, TemplateId::FOOD, position, rotation))
        }

        fn destroy(&mut self, world: &mut World, entity: EntityId) -> Result<(), PoolError> {
            self.destroyed.lock().unwrap().push(entity);
            world.insert(entity, Active(false));
            Ok(())
        }
    }

    #[test]
    fn plain_templates_are_freed_on_despawn() {
        let mut world = World::default();
        let mut spawner = NetworkSpawner::new();
        let e = spawner
            .instantiate(&mut world, TemplateId::PLAYER, ClientId(3), Vec3::ZERO, Quat::IDENTITY)
            .unwrap();
        let msg = spawner.spawn(&world, e, ClientId(3)).unwrap();
        assert_eq!(msg.template, TemplateId::PLAYER);
        assert_eq!(msg.owner, ClientId(3));

        assert!(spawner.despawn(&mut world, e).unwrap());
        assert!(!world.contains(e));
    }

    #[test]
    fn handler_destroy_runs_once_per_spawn() {
        let mut world = World::default();
        let mut spawner = NetworkSpawner::new();
        let handler = Recording::default();
        let destroyed = handler.destroyed.clone();
        spawner.add_handler(TemplateId::FOOD, Box::new(handler));

        let e = spawner
            .instantiate(&mut world, TemplateId::FOOD, ClientId::SERVER, Vec3::ZERO, Quat::IDENTITY)
            .unwrap();
        spawner.spawn(&world, e, ClientId::SERVER).unwrap();

        assert!(spawner.despawn(&mut world, e).unwrap());
        assert!(!spawner.despawn(&mut world, e).unwrap());
        assert_eq!(*destroyed.lock().unwrap(), vec![e]);
        assert!(world.contains(e));
    }

    /// Fails the first `destroy`, accepts the rest.
    #[derive(Default)]
    struct RefusesOnce {
        refused: bool,
    }

    impl PrefabHandler for RefusesOnce {
        fn instantiate(
            &mut self,
            world: &mut World,
            _owner: ClientId,
            position: Vec3,
            rotation: Quat,
        ) -> Result<EntityId, PoolError> {
            Ok(instantiate_plain(world, TemplateId::FOOD, position, rotation))
        }

        fn destroy(&mut self, world: &mut World, entity: EntityId) -> Result<(), PoolError> {
            if !self.refused {
                self.refused = true;
                return Err(PoolError::ForeignInstance {
                    entity,
                    template: TemplateId::FOOD,
                });
            }
            world.insert(entity, Active(false));
            Ok(())
        }
    }

    #[test]
    fn failed_destroy_keeps_entity_spawned() {
        let mut world = World::default();
        let mut spawner = NetworkSpawner::new();
        spawner.add_handler(TemplateId::FOOD, Box::new(RefusesOnce::default()));
        let e = spawner
            .instantiate(&mut world, TemplateId::FOOD, ClientId::SERVER, Vec3::ZERO, Quat::IDENTITY)
            .unwrap();
        spawner.spawn(&world, e, ClientId::SERVER).unwrap();

        assert!(matches!(
            spawner.despawn(&mut world, e),
            Err(PoolError::ForeignInstance { .. })
        ));
        assert!(spawner.record(e).is_some());
        assert_eq!(spawner.count(TemplateId::FOOD), 1);
        assert!(world.is_active(e));

        assert!(spawner.despawn(&mut world, e).unwrap());
        assert!(spawner.record(e).is_none());
        assert!(!world.is_active(e));
    }

    #[test]
    fn spawning_twice_is_rejected() {
        let mut world = World::default();
        let mut spawner = NetworkSpawner::new();
        let e = instantiate_plain(&mut world, TemplateId::FOOD, Vec3::ZERO, Quat::IDENTITY);
        assert!(spawner.spawn(&world, e, ClientId::SERVER).is_some());
        assert!(spawner.spawn(&world, e, ClientId::SERVER).is_none());
        assert_eq!(spawner.count(TemplateId::FOOD), 1);
    }

    #[test]
    fn removing_handler_falls_back_to_plain_allocation() {
        let mut spawner = NetworkSpawner::new();
        spawner.add_handler(TemplateId::FOOD, Box::new(Recording::default()));
        assert!(spawner.has_handler(TemplateId::FOOD));
        assert!(spawner.remove_handler(TemplateId::FOOD));
        assert!(!spawner.remove_handler(TemplateId::FOOD));
    }
}
