//! Entity/component system (minimal ECS).
//!
//! This is a deliberately small ECS suitable for deterministic simulation and
//! net replication. It is not archetype-based; instead it uses typed component
//! storages keyed by entity id.
//!
//! Every peer keeps its own `World`. Entity ids are allocated by whoever
//! creates the entity: the authority for networked entities, and each peer
//! locally for chain segments. Observers insert networked entities under the
//! id the authority chose (see [`World::spawn_with_id`]).

use std::{
    any::{Any, TypeId},
    collections::{HashMap, HashSet},
};

use serde::{Deserialize, Serialize};

use crate::math::{Quat, Vec3};

/// Opaque entity id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

/// Type-erased component storage.
trait Storage: Send + Sync {
    fn remove(&mut self, entity: EntityId);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: 'static + Send + Sync> Storage for HashMap<EntityId, T> {
    fn remove(&mut self, entity: EntityId) {
        HashMap::remove(self, &entity);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Simple world that can store typed components.
pub struct World {
    next_id: u64,
    alive: HashSet<EntityId>,
    storages: HashMap<TypeId, Box<dyn Storage>>,
}

impl Default for World {
    fn default() -> Self {
        Self::with_id_base(1)
    }
}

impl World {
    /// Creates a world whose locally allocated ids start at `base`.
    ///
    /// Observers use a high base so local segment ids never collide with ids
    /// chosen by the authority.
    pub fn with_id_base(base: u64) -> Self {
        Self {
            next_id: base,
            alive: HashSet::new(),
            storages: HashMap::new(),
        }
    }

    /// Creates a new entity.
    pub fn spawn(&mut self) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        self.alive.insert(id);
        id
    }

    /// Creates an entity under an externally chosen id.
    ///
    /// Returns false if the id is already alive.
    pub fn spawn_with_id(&mut self, id: EntityId) -> bool {
        self.alive.insert(id)
    }

    /// Removes an entity and all of its components.
    ///
    /// Returns false if the entity was not alive.
    pub fn despawn(&mut self, entity: EntityId) -> bool {
        if !self.alive.remove(&entity) {
            return false;
        }
        for storage in self.storages.values_mut() {
            storage.remove(entity);
        }
        true
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.alive.contains(&entity)
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.alive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alive.is_empty()
    }

    /// Inserts/replaces a component for an entity.
    ///
    /// Components on dead entities are ignored.
    pub fn insert<T: 'static + Send + Sync>(&mut self, entity: EntityId, component: T) {
        if !self.alive.contains(&entity) {
            return;
        }

        let storage = self
            .storages
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(HashMap::<EntityId, T>::new()));

        let storage = storage
            .as_any_mut()
            .downcast_mut::<HashMap<EntityId, T>>()
            .expect("storage type mismatch");

        storage.insert(entity, component);
    }

    /// Removes a single component.
    pub fn remove<T: 'static + Send + Sync>(&mut self, entity: EntityId) -> Option<T> {
        self.storages
            .get_mut(&TypeId::of::<T>())
            .and_then(|boxed| boxed.as_any_mut().downcast_mut::<HashMap<EntityId, T>>())
            .and_then(|storage| storage.remove(&entity))
    }

    /// Gets a component reference.
    pub fn get<T: 'static + Send + Sync>(&self, entity: EntityId) -> Option<&T> {
        self.storages
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.as_any().downcast_ref::<HashMap<EntityId, T>>())
            .and_then(|storage| storage.get(&entity))
    }

    /// Gets a mutable component reference.
    pub fn get_mut<T: 'static + Send + Sync>(&mut self, entity: EntityId) -> Option<&mut T> {
        self.storages
            .get_mut(&TypeId::of::<T>())
            .and_then(|boxed| boxed.as_any_mut().downcast_mut::<HashMap<EntityId, T>>())
            .and_then(|storage| storage.get_mut(&entity))
    }

    /// Iterates entities with a given component.
    ///
    /// Order is unspecified; use [`World::sorted`] when iteration order
    /// affects simulation.
    pub fn iter<T: 'static + Send + Sync>(&self) -> impl Iterator<Item = (EntityId, &T)> {
        self.storages
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.as_any().downcast_ref::<HashMap<EntityId, T>>())
            .into_iter()
            .flat_map(|storage| storage.iter().map(|(k, v)| (*k, v)))
    }

    /// Entities with a given component in ascending id order.
    pub fn sorted<T: 'static + Send + Sync>(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.iter::<T>().map(|(id, _)| id).collect();
        ids.sort_unstable();
        ids
    }

    /// Position of an entity's transform, if it has one.
    pub fn position(&self, entity: EntityId) -> Option<Vec3> {
        self.get::<Transform>(entity).map(|t| t.position)
    }

    /// Whether the entity takes part in simulation (pooled instances do not).
    pub fn is_active(&self, entity: EntityId) -> bool {
        self.get::<Active>(entity).map_or(true, |a| a.0)
    }
}

/// Common component: placement on the play field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Transform {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    /// Facing direction.
    pub fn forward(&self) -> Vec3 {
        self.rotation.up()
    }
}

/// Activation flag. Inactive entities stay allocated but are skipped by
/// simulation, contact tests and snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Active(pub bool);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecs_insert_and_get() {
        let mut world = World::default();
        let e = world.spawn();
        world.insert(e, Transform::new(Vec3::new(1.0, 2.0, 3.0), Quat::IDENTITY));
        assert_eq!(world.get::<Transform>(e).unwrap().position.x, 1.0);
        assert_eq!(world.position(e), Some(Vec3::new(1.0, 2.0, 3.0)));
    }

    #[test]
    fn despawn_drops_every_component() {
        let mut world = World::default();
        let e = world.spawn();
        world.insert(e, Transform::default());
        world.insert(e, Active(true));

        assert!(world.despawn(e));
        assert!(!world.contains(e));
        assert!(world.get::<Transform>(e).is_none());
        assert!(world.get::<Active>(e).is_none());
        assert!(!world.despawn(e));
    }

    #[test]
    fn insert_on_dead_entity_is_ignored() {
        let mut world = World::default();
        let e = world.spawn();
        world.despawn(e);
        world.insert(e, Active(true));
        assert_eq!(world.iter::<Active>().count(), 0);
    }

    #[test]
    fn spawn_with_id_rejects_live_ids() {
        let mut world = World::with_id_base(1_000);
        assert!(world.spawn_with_id(EntityId(7)));
        assert!(!world.spawn_with_id(EntityId(7)));
        assert_eq!(world.spawn(), EntityId(1_000));
    }

    #[test]
    fn sorted_is_ascending() {
        let mut world = World::default();
        let ids: Vec<_> = (0..5).map(|_| world.spawn()).collect();
        for id in ids.iter().rev() {
            world.insert(*id, Active(true));
        }
        assert_eq!(world.sorted::<Active>(), ids);
    }

    #[test]
    fn entities_without_active_flag_count_as_active() {
        let mut world = World::default();
        let e = world.spawn();
        assert!(world.is_active(e));
        world.insert(e, Active(false));
        assert!(!world.is_active(e));
    }
}
