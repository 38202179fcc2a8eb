//! Input handling.
//!
//! A windowed client steers the head toward the mouse cursor. Without a
//! window the binary uses [`Wander`], which picks random points on the play
//! field; tests set [`InputState::target`] directly.

use rand::{rngs::StdRng, Rng, SeedableRng};
use slither_shared::{
    config::Bounds,
    math::Vec3,
    net::{ClientId, PlayerCommand},
};

/// User input state at a moment in time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputState {
    /// World-space point the head steers toward.
    pub target: Vec3,
}

/// Turns sampled input into a `PlayerCommand` for a tick.
pub fn build_command(client_id: ClientId, tick: u32, input: InputState) -> PlayerCommand {
    PlayerCommand {
        client_id,
        tick,
        target: input.target.flat(),
    }
}

/// Random steering: a new target whenever the head gets close to the
/// current one.
pub struct Wander {
    rng: StdRng,
    bounds: Bounds,
    target: Vec3,
}

impl Wander {
    const ARRIVE_DISTANCE: f32 = 0.5;

    pub fn new(bounds: Bounds, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut wander = Self {
            rng,
            bounds,
            target: Vec3::ZERO,
        };
        wander.target = wander.pick();
        wander
    }

    fn pick(&mut self) -> Vec3 {
        Vec3::new(
            self.rng
                .gen_range(-self.bounds.half_width..=self.bounds.half_width),
            self.rng
                .gen_range(-self.bounds.half_height..=self.bounds.half_height),
            0.0,
        )
    }

    pub fn sample(&mut self, head: Option<Vec3>) -> InputState {
        if let Some(head) = head {
            if head.distance(self.target) < Self::ARRIVE_DISTANCE {
                self.target = self.pick();
            }
        }
        InputState {
            target: self.target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_targets_are_flat() {
        let cmd = build_command(
            ClientId(2),
            9,
            InputState {
                target: Vec3::new(1.0, 2.0, 3.0),
            },
        );
        assert_eq!(cmd.target, Vec3::new(1.0, 2.0, 0.0));
        assert_eq!(cmd.tick, 9);
    }

    #[test]
    fn wander_stays_in_bounds_and_retargets_on_arrival() {
        let bounds = Bounds::default();
        let mut wander = Wander::new(bounds, Some(4));
        let first = wander.sample(None).target;
        assert_eq!(wander.sample(Some(Vec3::new(100.0, 0.0, 0.0))).target, first);

        let next = wander.sample(Some(first)).target;
        assert_ne!(next, first);
        assert!(next.x.abs() <= bounds.half_width);
        assert!(next.y.abs() <= bounds.half_height);
    }
}
