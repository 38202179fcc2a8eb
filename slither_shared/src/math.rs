//! Math types.
//!
//! This module intentionally stays small and deterministic.
//! It avoids SIMD/unsafe and focuses on stable semantics. The game plays on
//! the XY plane; z is carried for transport but kept at zero.

use serde::{Deserialize, Serialize};

/// 3D vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const UP: Self = Self {
        x: 0.0,
        y: 1.0,
        z: 0.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    pub fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }

    pub fn scale(self, s: f32) -> Self {
        Self::new(self.x * s, self.y * s, self.z * s)
    }

    pub fn dot(self, rhs: Self) -> f32 {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z
    }

    pub fn cross(self, rhs: Self) -> Self {
        Self::new(
            self.y * rhs.z - self.z * rhs.y,
            self.z * rhs.x - self.x * rhs.z,
            self.x * rhs.y - self.y * rhs.x,
        )
    }

    pub fn len_sq(self) -> f32 {
        self.dot(self)
    }

    pub fn len(self) -> f32 {
        self.len_sq().sqrt()
    }

    pub fn distance(self, to: Self) -> f32 {
        to.sub(self).len()
    }

    /// Drops the z component.
    pub fn flat(self) -> Self {
        Self::new(self.x, self.y, 0.0)
    }

    pub fn lerp(self, to: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self::new(
            self.x + (to.x - self.x) * t,
            self.y + (to.y - self.y) * t,
            self.z + (to.z - self.z) * t,
        )
    }

    /// Moves toward `to` by at most `max_delta`, never overshooting.
    pub fn move_towards(self, to: Self, max_delta: f32) -> Self {
        let delta = to.sub(self);
        let dist = delta.len();
        if dist <= max_delta || dist == 0.0 {
            return to;
        }
        self.add(delta.scale(max_delta / dist))
    }
}

/// Unit quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quat {
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    /// Rotation of `angle` radians around +z.
    pub fn from_rotation_z(angle: f32) -> Self {
        let (s, c) = (angle * 0.5).sin_cos();
        Self {
            x: 0.0,
            y: 0.0,
            z: s,
            w: c,
        }
    }

    /// Rotation around +z that turns `Vec3::UP` to point along `dir`.
    ///
    /// Returns `None` for a zero-length direction.
    pub fn looking_up(dir: Vec3) -> Option<Self> {
        let dir = dir.flat();
        if dir.len_sq() == 0.0 {
            return None;
        }
        Some(Self::from_rotation_z((-dir.x).atan2(dir.y)))
    }

    pub fn rotate(self, v: Vec3) -> Vec3 {
        let q = Vec3::new(self.x, self.y, self.z);
        let t = q.cross(v).scale(2.0);
        v.add(t.scale(self.w)).add(q.cross(t))
    }

    /// The rotated `Vec3::UP`, i.e. the direction a head is facing.
    pub fn up(self) -> Vec3 {
        self.rotate(Vec3::UP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Vec3, b: Vec3) -> bool {
        a.sub(b).len() < 1e-5
    }

    #[test]
    fn vec3_lerp_midpoint() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(2.0, 4.0, 6.0);
        let mid = a.lerp(b, 0.5);
        assert_eq!(mid, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn move_towards_stops_at_target() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(3.0, 4.0, 0.0);
        assert_eq!(a.move_towards(b, 2.5), Vec3::new(1.5, 2.0, 0.0));
        assert_eq!(a.move_towards(b, 10.0), b);
    }

    #[test]
    fn looking_up_faces_direction() {
        let right = Vec3::new(1.0, 0.0, 0.0);
        let q = Quat::looking_up(right).unwrap();
        assert!(approx(q.up(), right));

        let down_left = Vec3::new(-1.0, -1.0, 0.0);
        let q = Quat::looking_up(down_left).unwrap();
        assert!(approx(q.up(), down_left.scale(1.0 / down_left.len())));

        assert!(Quat::looking_up(Vec3::ZERO).is_none());
    }

    #[test]
    fn identity_up_is_up() {
        assert!(approx(Quat::IDENTITY.up(), Vec3::UP));
    }
}
