//! Global ordering marker shared by every stream and partition.

use serde::{Deserialize, Serialize};

/// Sequence value assigned to every stored event.
///
/// Strictly increasing and never reused. Unlike a stream position it is comparable
/// across streams. See `LogPosition` for the order consumers replay in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalPosition(u64);

impl GlobalPosition {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl core::fmt::Display for GlobalPosition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<u64> for GlobalPosition {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<GlobalPosition> for u64 {
    fn from(value: GlobalPosition) -> Self {
        value.0
    }
}

/// Replay position of an event in the global log, as seen by consumers.
///
/// Ordered by the writing transaction first and by global position inside it.
/// A reader only ever sees transactions below the oldest one still running, so
/// anything that commits later sorts after every position already returned.
/// Consumers checkpoint on this, not on the bare global position: sequence
/// values are drawn before commit and can become visible out of order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogPosition {
    pub transaction_id: u64,
    pub global_position: GlobalPosition,
}

impl LogPosition {
    pub const fn new(transaction_id: u64, global_position: GlobalPosition) -> Self {
        Self {
            transaction_id,
            global_position,
        }
    }
}

impl core::fmt::Display for LogPosition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.transaction_id, self.global_position)
    }
}
