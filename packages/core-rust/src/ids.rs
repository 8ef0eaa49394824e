//! Id types and id blocks for block-based unique id allocation.
//!
//! Each [`IdType`] names an independent sequence. A backend hands out
//! contiguous [`IdBlock`]s so that a process only touches storage once per
//! block rather than once per id.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of an id sequence (one stored counter row per type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdType(pub i32);

impl IdType {
    /// Roster items.
    pub const ROSTER: Self = Self(18);
    /// Offline messages.
    pub const OFFLINE: Self = Self(19);
    /// Multi-user chat rooms.
    pub const MUC_ROOM: Self = Self(23);
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open range `[start, end)` of ids checked out by one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdBlock {
    /// First id of the block.
    pub start: i64,
    /// One past the last id of the block.
    pub end: i64,
}

impl IdBlock {
    /// Creates a block covering `[start, end)`.
    #[must_use]
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Number of ids in the block.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end.abs_diff(self.start)
    }

    /// Whether the block holds no ids.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Whether `id` falls inside the block.
    #[must_use]
    pub fn contains(&self, id: i64) -> bool {
        (self.start..self.end).contains(&id)
    }
}
