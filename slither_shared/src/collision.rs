//! Collision primitives shared by both peers.
//!
//! Arbitration itself only runs on the authority; observers use the lock for
//! local feedback.

use crate::{
    chain::{IgnoreCollision, Roster},
    ecs::{EntityId, World},
    math::Vec3,
    net::{ClientId, PlayerData},
};

/// One party of a contact: who owns it and how long it was at the time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollisionClaim {
    pub head: EntityId,
    pub peer: ClientId,
    pub length: u16,
}

impl From<CollisionClaim> for PlayerData {
    fn from(claim: CollisionClaim) -> Self {
        PlayerData {
            id: claim.peer.0,
            length: claim.length,
        }
    }
}

/// Builds the claim for a head or one of its segments.
pub fn claim(roster: &Roster, world: &World, entity: EntityId) -> Option<CollisionClaim> {
    let head = roster.head_of(world, entity)?;
    let character = roster.get(head)?;
    Some(CollisionClaim {
        head,
        peer: character.owner,
        length: character.chain.length(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub winner: CollisionClaim,
    pub loser: CollisionClaim,
}

/// `initiator` wins only when strictly longer; ties go to `other`.
pub fn determine_winner(initiator: CollisionClaim, other: CollisionClaim) -> Outcome {
    if initiator.length > other.length {
        Outcome {
            winner: initiator,
            loser: other,
        }
    } else {
        Outcome {
            winner: other,
            loser: initiator,
        }
    }
}

/// Debounce window after a contact.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CollisionLock {
    remaining: f32,
}

impl CollisionLock {
    pub fn is_locked(&self) -> bool {
        self.remaining > 0.0
    }

    /// Engages the lock for `window` seconds. Returns false if already locked.
    pub fn try_engage(&mut self, window: f32) -> bool {
        if self.is_locked() {
            return false;
        }
        self.remaining = window;
        true
    }

    pub fn tick(&mut self, dt: f32) {
        self.remaining = (self.remaining - dt).max(0.0);
    }
}

/// Whether `entity` never counts as a contact for `head`: the head itself
/// and the segments tagged with [`IgnoreCollision`] for it.
pub fn ignores(world: &World, entity: EntityId, head: EntityId) -> bool {
    entity == head
        || world
            .get::<IgnoreCollision>(entity)
            .is_some_and(|tag| tag.0 == head)
}

/// Circle overlap on the XY plane.
pub fn overlaps(a: Vec3, ra: f32, b: Vec3, rb: f32) -> bool {
    let r = ra + rb;
    a.flat().sub(b.flat()).len_sq() < r * r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::{Character, GrowableChain, PeerRole},
        ecs::Transform,
        event::EventHub,
        math::Quat,
    };

    fn claim_of(peer: u64, length: u16) -> CollisionClaim {
        CollisionClaim {
            head: EntityId(peer),
            peer: ClientId(peer),
            length,
        }
    }

    #[test]
    fn longer_party_wins_either_way() {
        let five = claim_of(1, 5);
        let three = claim_of(2, 3);
        assert_eq!(determine_winner(five, three).winner, five);
        assert_eq!(determine_winner(three, five).winner, five);
        assert_eq!(determine_winner(three, five).loser, three);
    }

    #[test]
    fn ties_go_to_second_argument() {
        let a = claim_of(1, 3);
        let b = claim_of(2, 3);
        assert_eq!(determine_winner(a, b).winner, b);
        assert_eq!(determine_winner(b, a).winner, a);
    }

    #[test]
    fn lock_debounces_until_window_elapses() {
        let mut lock = CollisionLock::default();
        assert!(lock.try_engage(0.5));
        assert!(!lock.try_engage(0.5));
        lock.tick(0.3);
        assert!(lock.is_locked());
        lock.tick(0.3);
        assert!(!lock.is_locked());
        assert!(lock.try_engage(0.5));
    }

    #[test]
    fn overlap_ignores_depth() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        assert!(overlaps(a, 0.25, Vec3::new(0.4, 0.0, 5.0), 0.2));
        assert!(!overlaps(a, 0.25, Vec3::new(0.5, 0.0, 0.0), 0.2));
    }

    #[test]
    fn segments_claim_for_their_head() {
        let mut world = World::default();
        let events = EventHub::new();
        let head = world.spawn();
        world.insert(head, Transform::new(Vec3::ZERO, Quat::IDENTITY));
        let mut chain = GrowableChain::new(head, PeerRole::AUTHORITY);
        chain.add_segment(&mut world, &events).unwrap();
        let segment = chain.segments()[0];

        let mut roster = Roster::new();
        roster.insert(
            head,
            Character {
                owner: ClientId(4),
                chain,
            },
        );

        let expected = CollisionClaim {
            head,
            peer: ClientId(4),
            length: 2,
        };
        assert_eq!(claim(&roster, &world, segment), Some(expected));
        assert!(ignores(&world, segment, head));
        assert!(ignores(&world, head, head));
        assert!(!ignores(&world, segment, EntityId(99)));
        assert_eq!(
            PlayerData::from(expected),
            PlayerData { id: 4, length: 2 }
        );
    }
}
