//! Growable chain state.
//!
//! Each character is a head entity plus an ordered chain of tail segments.
//! The authority owns the character's length counter; every peer (authority
//! included) keeps `segments == length - 1` by growing the chain whenever the
//! counter moves. Segments are local entities on each peer and are never
//! replicated themselves.
//!
//! Only the peer that owns the head publishes [`LengthChanged`] and
//! [`EatSound`], and only for live growth. Catch-up reconstruction at spawn
//! is silent on every peer.

use std::{collections::BTreeMap, fmt};

use tracing::debug;

use crate::{
    config::TailConfig,
    ecs::{EntityId, Transform, World},
    event::{EatSound, EventHub, LengthChanged},
    math::Quat,
    net::ClientId,
    replicated::{AuthoritativeCounter, ReplicationError, ValueChanged},
};

bitflags::bitflags! {
    /// How the local peer relates to a character.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PeerRole: u8 {
        const AUTHORITY = 1 << 0;   // canonical state lives here
        const OWNER = 1 << 1;       // local player controls the head
    }
}

impl PeerRole {
    pub fn observer(is_owner: bool) -> Self {
        if is_owner {
            Self::OWNER
        } else {
            Self::empty()
        }
    }
}

/// Chain errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// The head entity is gone.
    StaleEntity(EntityId),
    Replication(ReplicationError),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::StaleEntity(e) => write!(f, "head entity {} no longer exists", e.0),
            ChainError::Replication(e) => write!(f, "length replication: {e}"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<ReplicationError> for ChainError {
    fn from(e: ReplicationError) -> Self {
        ChainError::Replication(e)
    }
}

/// Tail segment component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Head this segment belongs to.
    pub head: EntityId,
    /// Previous segment, or the head for the first one.
    pub follow: EntityId,
}

/// Render order; more negative draws further back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SortOrder(pub i32);

/// Contacts with this entity are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IgnoreCollision(pub EntityId);

/// Replicated length plus the local tail chain of one character.
#[derive(Debug)]
pub struct GrowableChain {
    head: EntityId,
    role: PeerRole,
    length: AuthoritativeCounter<u16>,
    segments: Vec<EntityId>,
    listening: bool,
}

impl GrowableChain {
    /// A fresh character of length 1.
    pub fn new(head: EntityId, role: PeerRole) -> Self {
        Self::with_length(head, role, 1)
    }

    /// A character whose counter already holds `length` (late join).
    pub fn with_length(head: EntityId, role: PeerRole, length: u16) -> Self {
        let length = length.max(1);
        let length = if role.contains(PeerRole::AUTHORITY) {
            AuthoritativeCounter::authority(length)
        } else {
            AuthoritativeCounter::replica(length)
        };
        Self {
            head,
            role,
            length,
            segments: Vec::new(),
            listening: false,
        }
    }

    pub fn head(&self) -> EntityId {
        self.head
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn length(&self) -> u16 {
        self.length.value()
    }

    pub fn segments(&self) -> &[EntityId] {
        &self.segments
    }

    /// Whether replicated length updates are applied.
    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Called once the head exists locally.
    ///
    /// Non-authority peers subscribe to length updates and silently rebuild
    /// `length - 1` segments. Returns the number of segments created.
    pub fn on_spawn(&mut self, world: &mut World) -> Result<usize, ChainError> {
        if self.role.contains(PeerRole::AUTHORITY) {
            return Ok(0);
        }
        self.listening = true;
        let created = self.reconcile(world)?;
        debug!(head = ?self.head, length = self.length(), created, "Chain caught up");
        Ok(created)
    }

    /// Authority entry point: length + 1, then grow.
    pub fn add_segment(
        &mut self,
        world: &mut World,
        events: &EventHub,
    ) -> Result<ValueChanged<u16>, ChainError> {
        if !world.contains(self.head) {
            return Err(ChainError::StaleEntity(self.head));
        }
        let change = self.length.increment()?;
        self.grow(world, events)?;
        Ok(change)
    }

    /// Observer entry point for a replicated length value.
    ///
    /// Ignored until [`GrowableChain::on_spawn`] subscribed this chain.
    pub fn on_length_replicated(
        &mut self,
        world: &mut World,
        events: &EventHub,
        value: u16,
    ) -> Result<Option<ValueChanged<u16>>, ChainError> {
        if !self.listening {
            return Ok(None);
        }
        if !world.contains(self.head) {
            return Err(ChainError::StaleEntity(self.head));
        }
        let change = self.length.apply_replicated(value)?;
        if change.is_some() {
            self.grow(world, events)?;
        }
        Ok(change)
    }

    /// Destroys every segment. Safe on an empty chain.
    pub fn on_despawn(&mut self, world: &mut World) {
        for segment in self.segments.drain(..) {
            world.despawn(segment);
        }
        self.listening = false;
    }

    fn grow(&mut self, world: &mut World, events: &EventHub) -> Result<(), ChainError> {
        if self.reconcile(world)? == 0 {
            return Ok(());
        }
        debug!(head = ?self.head, length = self.length(), "Chain grew");
        if self.role.contains(PeerRole::OWNER) {
            events.publish(LengthChanged(self.length()));
            events.publish(EatSound);
        }
        Ok(())
    }

    fn reconcile(&mut self, world: &mut World) -> Result<usize, ChainError> {
        let target = usize::from(self.length().saturating_sub(1));
        let mut created = 0;
        while self.segments.len() < target {
            self.push_segment(world)?;
            created += 1;
        }
        Ok(created)
    }

    fn push_segment(&mut self, world: &mut World) -> Result<EntityId, ChainError> {
        let head = world
            .get::<Transform>(self.head)
            .copied()
            .ok_or(ChainError::StaleEntity(self.head))?;
        let follow = self.segments.last().copied().unwrap_or(self.head);

        let segment = world.spawn();
        world.insert(segment, Transform::new(head.position, head.rotation));
        world.insert(
            segment,
            Segment {
                head: self.head,
                follow,
            },
        );
        // Equals -length for live growth.
        world.insert(segment, SortOrder(-(self.segments.len() as i32 + 2)));
        world.insert(segment, IgnoreCollision(self.head));
        self.segments.push(segment);
        Ok(segment)
    }

    /// Moves every segment toward the transform it follows.
    pub fn update_follow(&self, world: &mut World, dt: f32, tail: &TailConfig) {
        for &segment in &self.segments {
            let Some(follow) = world.get::<Segment>(segment).map(|s| s.follow) else {
                continue;
            };
            let Some(leader) = world.get::<Transform>(follow).copied() else {
                continue;
            };
            let Some(transform) = world.get_mut::<Transform>(segment) else {
                continue;
            };

            let mut target = leader
                .position
                .sub(leader.forward().scale(tail.distance));
            target = target.add(transform.position.sub(target).scale(tail.delay));
            target.z = 0.0;
            transform.position = transform.position.lerp(target, dt * tail.step);
            if let Some(facing) = Quat::looking_up(leader.position.sub(transform.position)) {
                transform.rotation = facing;
            }
        }
    }
}

/// A networked character as seen by one peer.
#[derive(Debug)]
pub struct Character {
    pub owner: ClientId,
    pub chain: GrowableChain,
}

/// Characters by head entity.
#[derive(Debug, Default)]
pub struct Roster {
    characters: BTreeMap<EntityId, Character>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, head: EntityId, character: Character) {
        self.characters.insert(head, character);
    }

    pub fn remove(&mut self, head: EntityId) -> Option<Character> {
        self.characters.remove(&head)
    }

    pub fn get(&self, head: EntityId) -> Option<&Character> {
        self.characters.get(&head)
    }

    pub fn get_mut(&mut self, head: EntityId) -> Option<&mut Character> {
        self.characters.get_mut(&head)
    }

    pub fn contains(&self, head: EntityId) -> bool {
        self.characters.contains_key(&head)
    }

    pub fn len(&self) -> usize {
        self.characters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }

    /// Head ids in ascending order.
    pub fn heads(&self) -> Vec<EntityId> {
        self.characters.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &Character)> {
        self.characters.iter().map(|(id, c)| (*id, c))
    }

    /// Head controlled by `owner`, if any.
    pub fn head_of_owner(&self, owner: ClientId) -> Option<EntityId> {
        self.characters
            .iter()
            .find(|(_, c)| c.owner == owner)
            .map(|(id, _)| *id)
    }

    /// Resolves a head or segment to its head.
    pub fn head_of(&self, world: &World, entity: EntityId) -> Option<EntityId> {
        if self.characters.contains_key(&entity) {
            return Some(entity);
        }
        world
            .get::<Segment>(entity)
            .map(|s| s.head)
            .filter(|head| self.characters.contains_key(head))
    }

    pub fn update_follow(&self, world: &mut World, dt: f32, tail: &TailConfig) {
        for character in self.characters.values() {
            character.chain.update_follow(world, dt, tail);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event::Subscription, math::Vec3};

    fn head(world: &mut World) -> EntityId {
        let e = world.spawn();
        world.insert(e, Transform::new(Vec3::new(1.0, 1.0, 0.0), Quat::IDENTITY));
        e
    }

    fn drain<E: Clone>(sub: &mut Subscription<E>) -> usize {
        sub.drain().len()
    }

    #[test]
    fn authority_growth_links_segments() {
        let mut world = World::default();
        let events = EventHub::new();
        let h = head(&mut world);
        let mut chain = GrowableChain::new(h, PeerRole::AUTHORITY);
        assert_eq!(chain.on_spawn(&mut world).unwrap(), 0);
        assert!(!chain.is_listening());

        chain.add_segment(&mut world, &events).unwrap();
        chain.add_segment(&mut world, &events).unwrap();
        assert_eq!(chain.length(), 3);

        let segs = chain.segments().to_vec();
        assert_eq!(segs.len(), 2);
        assert_eq!(
            world.get::<Segment>(segs[0]),
            Some(&Segment { head: h, follow: h })
        );
        assert_eq!(
            world.get::<Segment>(segs[1]),
            Some(&Segment {
                head: h,
                follow: segs[0]
            })
        );
        assert_eq!(world.get::<SortOrder>(segs[0]), Some(&SortOrder(-2)));
        assert_eq!(world.get::<SortOrder>(segs[1]), Some(&SortOrder(-3)));
        assert_eq!(world.get::<IgnoreCollision>(segs[1]), Some(&IgnoreCollision(h)));
        assert_eq!(world.position(segs[1]), Some(Vec3::new(1.0, 1.0, 0.0)));
    }

    #[test]
    fn observers_cannot_add_segments() {
        let mut world = World::default();
        let events = EventHub::new();
        let h = head(&mut world);
        let mut chain = GrowableChain::new(h, PeerRole::empty());
        assert_eq!(
            chain.add_segment(&mut world, &events),
            Err(ChainError::Replication(ReplicationError::ReadOnly))
        );
        assert!(chain.segments().is_empty());
    }

    #[test]
    fn observer_catch_up_is_silent() {
        let mut world = World::default();
        let mut events = EventHub::new();
        let mut sound = events.subscribe::<EatSound>();
        let mut lengths = events.subscribe::<LengthChanged>();
        let h = head(&mut world);

        for role in [PeerRole::empty(), PeerRole::OWNER] {
            let mut chain = GrowableChain::with_length(h, role, 6);
            assert_eq!(chain.on_spawn(&mut world).unwrap(), 5);
            assert_eq!(chain.segments().len(), 5);
            chain.on_despawn(&mut world);
        }
        assert_eq!(drain(&mut sound), 0);
        assert_eq!(drain(&mut lengths), 0);
    }

    #[test]
    fn owner_live_growth_notifies_once() {
        let mut world = World::default();
        let mut events = EventHub::new();
        let mut sound = events.subscribe::<EatSound>();
        let mut lengths = events.subscribe::<LengthChanged>();
        let h = head(&mut world);

        let mut chain = GrowableChain::new(h, PeerRole::OWNER);
        chain.on_spawn(&mut world).unwrap();
        chain.on_length_replicated(&mut world, &events, 2).unwrap();
        chain.on_length_replicated(&mut world, &events, 3).unwrap();

        assert_eq!(chain.segments().len(), 2);
        assert_eq!(lengths.drain(), vec![LengthChanged(2), LengthChanged(3)]);
        assert_eq!(drain(&mut sound), 2);
    }

    #[test]
    fn non_owner_growth_is_silent() {
        let mut world = World::default();
        let mut events = EventHub::new();
        let mut sound = events.subscribe::<EatSound>();
        let h = head(&mut world);

        let mut chain = GrowableChain::new(h, PeerRole::empty());
        chain.on_spawn(&mut world).unwrap();
        chain.on_length_replicated(&mut world, &events, 2).unwrap();
        assert_eq!(chain.segments().len(), 1);
        assert_eq!(drain(&mut sound), 0);
    }

    #[test]
    fn repeated_value_does_not_grow() {
        let mut world = World::default();
        let events = EventHub::new();
        let h = head(&mut world);
        let mut chain = GrowableChain::new(h, PeerRole::empty());
        chain.on_spawn(&mut world).unwrap();

        assert!(chain
            .on_length_replicated(&mut world, &events, 2)
            .unwrap()
            .is_some());
        assert!(chain
            .on_length_replicated(&mut world, &events, 2)
            .unwrap()
            .is_none());
        assert_eq!(chain.segments().len(), 1);
    }

    #[test]
    fn skipped_values_are_reconciled() {
        let mut world = World::default();
        let events = EventHub::new();
        let h = head(&mut world);
        let mut chain = GrowableChain::new(h, PeerRole::empty());
        chain.on_spawn(&mut world).unwrap();
        chain.on_length_replicated(&mut world, &events, 5).unwrap();
        assert_eq!(chain.segments().len(), 4);
    }

    #[test]
    fn updates_before_spawn_are_ignored() {
        let mut world = World::default();
        let events = EventHub::new();
        let h = head(&mut world);
        let mut chain = GrowableChain::new(h, PeerRole::empty());
        assert_eq!(chain.on_length_replicated(&mut world, &events, 3), Ok(None));
        assert_eq!(chain.length(), 1);
    }

    #[test]
    fn growth_on_destroyed_head_is_stale() {
        let mut world = World::default();
        let events = EventHub::new();
        let h = head(&mut world);
        let mut authority = GrowableChain::new(h, PeerRole::AUTHORITY);
        let mut observer = GrowableChain::new(h, PeerRole::empty());
        observer.on_spawn(&mut world).unwrap();
        world.despawn(h);

        assert_eq!(
            authority.add_segment(&mut world, &events),
            Err(ChainError::StaleEntity(h))
        );
        assert_eq!(authority.length(), 1);
        assert_eq!(
            observer.on_length_replicated(&mut world, &events, 2),
            Err(ChainError::StaleEntity(h))
        );
    }

    #[test]
    fn despawn_destroys_segments_and_tolerates_empty_chain() {
        let mut world = World::default();
        let events = EventHub::new();
        let h = head(&mut world);

        let mut empty = GrowableChain::new(h, PeerRole::AUTHORITY);
        empty.on_despawn(&mut world);

        let mut chain = GrowableChain::new(h, PeerRole::AUTHORITY);
        chain.add_segment(&mut world, &events).unwrap();
        chain.add_segment(&mut world, &events).unwrap();
        let segs = chain.segments().to_vec();
        chain.on_despawn(&mut world);
        assert!(chain.segments().is_empty());
        assert!(segs.iter().all(|s| !world.contains(*s)));
        assert!(world.contains(h));
    }

    #[test]
    fn segments_trail_behind_head() {
        let mut world = World::default();
        let events = EventHub::new();
        let h = head(&mut world);
        let mut chain = GrowableChain::new(h, PeerRole::AUTHORITY);
        chain.add_segment(&mut world, &events).unwrap();
        let seg = chain.segments()[0];

        world.get_mut::<Transform>(h).unwrap().position = Vec3::new(1.0, 3.0, 0.0);
        let tail = TailConfig::default();
        for _ in 0..200 {
            chain.update_follow(&mut world, 1.0 / 64.0, &tail);
        }
        let pos = world.position(seg).unwrap();
        assert!((pos.x - 1.0).abs() < 1e-3);
        assert!(pos.y < 3.0 && pos.y > 2.5, "segment at {pos:?}");
        assert_eq!(pos.z, 0.0);
    }

    #[test]
    fn roster_resolves_segments_to_heads() {
        let mut world = World::default();
        let events = EventHub::new();
        let h = head(&mut world);
        let mut chain = GrowableChain::new(h, PeerRole::AUTHORITY);
        chain.add_segment(&mut world, &events).unwrap();
        let seg = chain.segments()[0];

        let mut roster = Roster::new();
        roster.insert(
            h,
            Character {
                owner: ClientId(7),
                chain,
            },
        );
        assert_eq!(roster.head_of(&world, h), Some(h));
        assert_eq!(roster.head_of(&world, seg), Some(h));
        assert_eq!(roster.head_of_owner(ClientId(7)), Some(h));
        let stray = world.spawn();
        assert_eq!(roster.head_of(&world, stray), None);
    }
}
