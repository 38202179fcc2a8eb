//! Snapshot interpolation.
//!
//! Snapshots arrive once per server tick over the unreliable channel; the
//! render side samples between the two most recent ones. Late datagrams are
//! dropped so the history stays strictly ordered by tick.

use std::collections::VecDeque;

use slither_shared::{
    ecs::{EntityId, Transform},
    net::{EntityState, Snapshot},
};

/// Bounded, tick-ordered snapshot history.
#[derive(Default)]
pub struct SnapshotBuffer {
    history: VecDeque<Snapshot>,
    capacity: usize,
}

impl SnapshotBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a snapshot unless it is not newer than the last one.
    /// Returns whether it was kept.
    pub fn push(&mut self, snap: Snapshot) -> bool {
        if self.history.back().is_some_and(|last| snap.tick <= last.tick) {
            return false;
        }
        self.history.push_back(snap);
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.history.back()
    }

    /// Samples `entity` between the two latest snapshots. `alpha` is clamped
    /// to `[0, 1]`; 0 is the older snapshot. Rotation snaps to whichever
    /// side `alpha` is closer to.
    ///
    /// An entity present only in the newer snapshot (just spawned) is
    /// returned as-is; one missing from the newer snapshot is gone.
    pub fn sample(&self, entity: EntityId, alpha: f32) -> Option<Transform> {
        let newer = self.history.back()?;
        let b = find_entity(newer, entity)?;
        let older = self
            .history
            .len()
            .checked_sub(2)
            .and_then(|i| self.history.get(i))
            .and_then(|snap| find_entity(snap, entity));
        let Some(a) = older else {
            return Some(Transform::new(b.position, b.rotation));
        };

        let alpha = alpha.clamp(0.0, 1.0);
        let rotation = if alpha < 0.5 { a.rotation } else { b.rotation };
        Some(Transform::new(a.position.lerp(b.position, alpha), rotation))
    }
}

/// Looks up an entity's state in a snapshot.
pub fn find_entity(snap: &Snapshot, id: EntityId) -> Option<&EntityState> {
    snap.entities.iter().find(|e| e.id == id)
}
