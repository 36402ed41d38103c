//! Capability slot handles
//!
//! A capability is a process-local integer naming a kernel object plus its
//! interface identity. Crossing a process boundary always exchanges slot
//! indices, never raw object references.
//!
//! ## Design Principles
//!
//! 1. **Generation checked**: every reuse of a slot bumps its generation, so a
//!    handle kept past a release is detected as stale.
//! 2. **Process local**: a handle only means something against the table that
//!    issued it.
//!
//! ## Example
//!
//! ```
//! use core_types::SlotHandle;
//!
//! let handle = SlotHandle::new(5, 2);
//! assert_eq!(handle.index(), 5);
//! assert!(handle.matches(5, 2));
//! assert!(!handle.matches(5, 3));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A generation-checked handle to a table slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotHandle {
    index: u32,
    generation: u32,
}

impl SlotHandle {
    /// Creates a handle
    ///
    /// # Security Note
    ///
    /// Only the tables that own the slots should mint handles. The constructor
    /// is public so the simulation and its tests can build them.
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Checks the handle against a slot's current index and generation
    pub fn matches(&self, index: u32, generation: u32) -> bool {
        self.index == index && self.generation == generation
    }
}

impl fmt::Display for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot:{}#{}", self.index, self.generation)
    }
}

/// Errors from slot tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SlotError {
    /// The index is beyond the table capacity
    #[error("Slot {0} is out of range")]
    OutOfRange(u32),

    /// The slot holds no live object
    #[error("Slot {0} is empty")]
    Empty(u32),

    /// The handle's generation no longer matches the slot
    #[error("Slot {index} is stale (generation {generation})")]
    Stale { index: u32, generation: u32 },

    /// Every slot is in use
    #[error("Slot table is full")]
    Full,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_handle_matches() {
        let handle = SlotHandle::new(3, 7);
        assert!(handle.matches(3, 7));
        assert!(!handle.matches(4, 7));
        assert!(!handle.matches(3, 8));
    }

    #[test]
    fn test_slot_handle_display() {
        assert_eq!(format!("{}", SlotHandle::new(1, 2)), "slot:1#2");
    }
}
