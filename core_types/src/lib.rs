//! # Core Types
//!
//! This crate defines the fundamental types shared by the kernel crates.
//!
//! ## Philosophy
//!
//! Core types are designed with these principles:
//! - **Explicit over implicit**: Addresses, protections and slots are typed.
//! - **Type safety first**: Flag sets are bitflags, not loose integers.
//! - **No raw pointers across boundaries**: Capabilities are slot handles.
//!
//! ## Key Types
//!
//! - [`ProcessId`], [`ThreadId`], [`MonitorId`]: unique identifiers
//! - [`Protection`], [`MapFlags`], [`PteFlags`]: memory flag sets
//! - [`VirtRange`]: a page-aligned virtual range
//! - [`SlotHandle`]: a generation-checked table slot

pub mod capability;
pub mod ids;
pub mod memory;

pub use capability::{SlotError, SlotHandle};
pub use ids::{MonitorId, ProcessId, ThreadId};
pub use memory::{
    page_offset, page_round, page_trunc, MapFlags, MemoryAccessType, MemoryError, Protection,
    PteFlags, VirtRange, PAGE_SIZE, WORD_SIZE,
};
