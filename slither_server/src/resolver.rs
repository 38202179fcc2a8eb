//! Authority-side collision arbitration.
//!
//! A contact between two characters resolves both parties to their heads,
//! snapshots their lengths and compares them. Only the winner hears
//! `AtePlayer` and only the loser hears `GameOver`; nobody else is told.

use std::collections::{BTreeSet, HashMap};

use slither_shared::{
    chain::Roster,
    collision::{claim, determine_winner, CollisionLock, Outcome},
    ecs::{EntityId, World},
    net::{ClientId, NetMsg, Outbox},
};
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct CollisionResolver {
    lock_secs: f32,
    locks: HashMap<EntityId, CollisionLock>,
    eliminated: BTreeSet<ClientId>,
}

impl CollisionResolver {
    pub fn new(lock_secs: f32) -> Self {
        Self {
            lock_secs,
            ..Self::default()
        }
    }

    /// Counts down every collision lock.
    pub fn tick(&mut self, dt: f32) {
        for lock in self.locks.values_mut() {
            lock.tick(dt);
        }
        self.locks.retain(|_, lock| lock.is_locked());
    }

    pub fn is_locked(&self, head: EntityId) -> bool {
        self.locks.get(&head).is_some_and(CollisionLock::is_locked)
    }

    /// Peers already told they lost.
    pub fn is_eliminated(&self, peer: ClientId) -> bool {
        self.eliminated.contains(&peer)
    }

    /// Drops per-peer state once the peer left.
    pub fn forget(&mut self, peer: ClientId, head: Option<EntityId>) {
        self.eliminated.remove(&peer);
        if let Some(head) = head {
            self.locks.remove(&head);
        }
    }

    /// Arbitrates a contact between `initiator` and `other` (heads or
    /// segments). Returns `None` when the contact is ignored.
    pub fn resolve(
        &mut self,
        roster: &Roster,
        world: &World,
        initiator: EntityId,
        other: EntityId,
        outbox: &mut Outbox,
    ) -> Option<Outcome> {
        let a = claim(roster, world, initiator)?;
        let b = claim(roster, world, other)?;
        if a.head == b.head {
            return None;
        }
        if self.is_eliminated(a.peer) || self.is_eliminated(b.peer) {
            return None;
        }
        if self.is_locked(a.head) || self.is_locked(b.head) {
            debug!(initiator = ?a.head, other = ?b.head, "Contact debounced");
            return None;
        }
        let window = self.lock_secs;
        self.locks.entry(a.head).or_default().try_engage(window);
        self.locks.entry(b.head).or_default().try_engage(window);

        let outcome = determine_winner(a, b);
        outbox.send_to(
            outcome.winner.peer,
            NetMsg::AtePlayer {
                loser: outcome.loser.into(),
            },
        );
        outbox.send_to(
            outcome.loser.peer,
            NetMsg::GameOver {
                winner: outcome.winner.into(),
            },
        );
        self.eliminated.insert(outcome.loser.peer);
        info!(
            winner = ?outcome.winner.peer,
            winner_length = outcome.winner.length,
            loser = ?outcome.loser.peer,
            loser_length = outcome.loser.length,
            "Collision resolved"
        );
        Some(outcome)
    }
}
