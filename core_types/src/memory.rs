//! # Memory Types
//!
//! This module defines the memory vocabulary shared by the kernel crates:
//! page geometry, protection and mapping flags, page-table entry flags and
//! virtual ranges.
//!
//! ## Philosophy
//!
//! - **Pages are the unit of authority**: every range the kernel hands out is
//!   page aligned.
//! - **Flags are closed sets**: protection and mapping options are bitflags,
//!   so an unknown bit can never sneak through a conversion.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Size of a page in bytes
pub const PAGE_SIZE: u64 = 4096;

/// Size of a machine word in the user calling convention
pub const WORD_SIZE: u64 = 8;

/// Rounds an address down to its page base
pub fn page_trunc(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds an address up to the next page boundary
///
/// Saturates at the last page boundary instead of wrapping.
pub fn page_round(addr: u64) -> u64 {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(value) => page_trunc(value),
        None => page_trunc(u64::MAX),
    }
}

/// Returns the offset of an address within its page
pub fn page_offset(addr: u64) -> u64 {
    addr & (PAGE_SIZE - 1)
}

bitflags! {
    /// Memory protection of a mapped range
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Protection: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

impl Protection {
    /// Read and write permissions
    pub fn read_write() -> Self {
        Self::READ | Self::WRITE
    }

    /// Checks whether an access of the given type is permitted
    pub fn permits(&self, access: MemoryAccessType) -> bool {
        match access {
            MemoryAccessType::Read => self.contains(Self::READ),
            MemoryAccessType::Write => self.contains(Self::WRITE),
            MemoryAccessType::Execute => self.contains(Self::EXEC),
        }
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.contains(Self::READ) { "R" } else { "-" },
            if self.contains(Self::WRITE) { "W" } else { "-" },
            if self.contains(Self::EXEC) { "X" } else { "-" }
        )
    }
}

bitflags! {
    /// Mapping options
    ///
    /// `PRIVATE` mappings are copy-on-write and ultimately swap backed;
    /// mappings without it are shared with the backing pageable object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MapFlags: u32 {
        const SHARED = 0x01;
        const PRIVATE = 0x02;
        const FIXED = 0x10;
        /// The data segment; the break starts at its end
        const DATA = 0x20;
    }
}

impl MapFlags {
    pub fn is_private(&self) -> bool {
        self.contains(Self::PRIVATE)
    }
}

bitflags! {
    /// Page-table entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PteFlags: u32 {
        const VALID = 0x001;
        const WRITE = 0x002;
        const USER = 0x004;
        const ACCESSED = 0x020;
        const DIRTY = 0x040;
        /// The page is owned by this mapping (copy-on-write or anonymous)
        const PRIVATE = 0x200;
    }
}

/// Memory access type
///
/// Used to check whether an access is allowed under a protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryAccessType {
    Read,
    Write,
    Execute,
}

impl fmt::Display for MemoryAccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryAccessType::Read => write!(f, "Read"),
            MemoryAccessType::Write => write!(f, "Write"),
            MemoryAccessType::Execute => write!(f, "Execute"),
        }
    }
}

/// A half-open virtual address range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VirtRange {
    pub start: u64,
    pub end: u64,
}

impl VirtRange {
    /// Creates a range from a start address and a byte length
    ///
    /// Returns `None` if the range would wrap around the address space.
    pub fn from_len(start: u64, len: u64) -> Option<Self> {
        let end = start.checked_add(len)?;
        Some(Self { start, end })
    }

    /// Returns the smallest page-aligned range covering this one
    pub fn page_aligned(&self) -> Self {
        Self {
            start: page_trunc(self.start),
            end: page_round(self.end),
        }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn overlaps(&self, other: &VirtRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for VirtRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}-{:#x}", self.start, self.end)
    }
}

/// Memory operation errors
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum MemoryError {
    /// The start address and the backing offset disagree within the page
    #[error("Misaligned mapping: address {addr:#x}, offset {offset:#x}")]
    Misaligned { addr: u64, offset: u64 },

    /// The range falls outside the user address space
    #[error("Range {0} is outside the user address space")]
    OutOfRange(VirtRange),

    /// The range overlaps an existing mapping
    #[error("Range {0} overlaps an existing mapping")]
    Overlap(VirtRange),

    /// The final size of the mapping would be zero or negative
    #[error("Empty mapping")]
    EmptyRange,

    /// No mapping covers the address
    #[error("Address {0:#x} is not mapped")]
    NotMapped(u64),

    /// The mapping does not permit the access
    #[error("{access} access denied at {addr:#x}")]
    PermissionDenied { addr: u64, access: MemoryAccessType },

    /// Shrinking the break would cut into the backed part of the heap
    #[error("Break cannot shrink below {0:#x}")]
    BelowBackedFloor(u64),

    /// No page could be obtained to resolve a fault
    #[error("No page available for {0:#x}")]
    NoPage(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_helpers() {
        assert_eq!(page_trunc(0x1fff), 0x1000);
        assert_eq!(page_round(0x1001), 0x2000);
        assert_eq!(page_round(0x2000), 0x2000);
        assert_eq!(page_offset(0x1234), 0x234);
        assert_eq!(page_round(u64::MAX), page_trunc(u64::MAX));
    }

    #[test]
    fn test_protection_permits() {
        let prot = Protection::READ;
        assert!(prot.permits(MemoryAccessType::Read));
        assert!(!prot.permits(MemoryAccessType::Write));
        assert!(Protection::read_write().permits(MemoryAccessType::Write));
        assert_eq!(format!("{}", Protection::read_write()), "RW-");
    }

    #[test]
    fn test_virt_range() {
        let a = VirtRange::from_len(0x1000, 0x2000).unwrap();
        let b = VirtRange::from_len(0x2fff, 0x10).unwrap();
        let c = VirtRange::from_len(0x3000, 0x10).unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(b.page_aligned(), VirtRange { start: 0x2000, end: 0x4000 });
        assert!(VirtRange::from_len(u64::MAX, 2).is_none());
    }

    #[test]
    fn test_flags_serialize() {
        let flags = MapFlags::PRIVATE | MapFlags::FIXED;
        let json = serde_json::to_string(&flags).unwrap();
        let back: MapFlags = serde_json::from_str(&json).unwrap();
        assert_eq!(back, flags);
    }
}
