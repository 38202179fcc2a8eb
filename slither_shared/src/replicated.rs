//! Authority-owned replicated values.
//!
//! Only the authority writes; observers apply the values it broadcasts and
//! react to the returned [`ValueChanged`]. Writes must strictly increase the
//! value.

use std::fmt;

/// Replicated value errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// An observer tried to write.
    ReadOnly,
    /// The authority was handed a replicated update.
    Authoritative,
    /// A write did not increase the value.
    NotMonotonic,
    /// The counter cannot grow any further.
    Overflow,
}

impl fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationError::ReadOnly => write!(f, "value is read-only on observers"),
            ReplicationError::Authoritative => {
                write!(f, "authority does not accept replicated updates")
            }
            ReplicationError::NotMonotonic => write!(f, "write does not increase the value"),
            ReplicationError::Overflow => write!(f, "counter overflow"),
        }
    }
}

impl std::error::Error for ReplicationError {}

/// A value transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueChanged<T> {
    pub previous: T,
    pub current: T,
}

/// A scalar owned by the authority and mirrored read-only by observers.
#[derive(Debug, Clone)]
pub struct AuthoritativeCounter<T> {
    value: T,
    authority: bool,
}

impl<T: Copy + PartialOrd> AuthoritativeCounter<T> {
    /// Writable copy held by the authority.
    pub fn authority(initial: T) -> Self {
        Self {
            value: initial,
            authority: true,
        }
    }

    /// Read-only mirror held by an observer.
    pub fn replica(initial: T) -> Self {
        Self {
            value: initial,
            authority: false,
        }
    }

    pub fn value(&self) -> T {
        self.value
    }

    /// Authority write.
    pub fn set(&mut self, value: T) -> Result<ValueChanged<T>, ReplicationError> {
        if !self.authority {
            return Err(ReplicationError::ReadOnly);
        }
        if value <= self.value {
            return Err(ReplicationError::NotMonotonic);
        }
        let previous = std::mem::replace(&mut self.value, value);
        Ok(ValueChanged {
            previous,
            current: value,
        })
    }

    /// Observer side: applies a value received from the authority.
    ///
    /// Returns `None` when the value is unchanged.
    pub fn apply_replicated(
        &mut self,
        value: T,
    ) -> Result<Option<ValueChanged<T>>, ReplicationError> {
        if self.authority {
            return Err(ReplicationError::Authoritative);
        }
        if value == self.value {
            return Ok(None);
        }
        let previous = std::mem::replace(&mut self.value, value);
        Ok(Some(ValueChanged {
            previous,
            current: value,
        }))
    }
}

impl AuthoritativeCounter<u16> {
    /// Authority write of `value + 1`.
    pub fn increment(&mut self) -> Result<ValueChanged<u16>, ReplicationError> {
        let next = self
            .value
            .checked_add(1)
            .ok_or(ReplicationError::Overflow)?;
        self.set(next)
    }
}
