//! Page tables
//!
//! The [`Mmu`] of a process maps virtual page numbers to entries. An entry
//! is either a valid mapping of a page frame or a swapped-out private page
//! that only remembers its swap slot. A valid entry always owns a [`Page`]
//! handle, so a page can never be freed while it is mapped.

use crate::page::Page;
use crate::pageable::Pageable;
use crate::swap::{Swap, SwapSlot};
use core_types::{page_trunc, PteFlags, PAGE_SIZE};
use std::collections::BTreeMap;

/// A page-table entry
#[derive(Debug, Clone)]
pub enum Pte {
    Valid { page: Page, flags: PteFlags },
    Swapped { slot: SwapSlot },
}

impl Pte {
    pub fn flags(&self) -> PteFlags {
        match self {
            Pte::Valid { flags, .. } => *flags,
            Pte::Swapped { .. } => PteFlags::PRIVATE,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Pte::Valid { .. })
    }

    pub fn is_writable(&self) -> bool {
        match self {
            Pte::Valid { flags, .. } => flags.contains(PteFlags::WRITE),
            Pte::Swapped { .. } => false,
        }
    }

    pub fn page(&self) -> Option<&Page> {
        match self {
            Pte::Valid { page, .. } => Some(page),
            Pte::Swapped { .. } => None,
        }
    }
}

/// Backing a range of entries returns its pages to
pub struct Backing<'a> {
    pub pageable: Option<&'a dyn Pageable>,
    /// Virtual address corresponding to `offset`
    pub start: u64,
    /// Byte offset into the pageable at `start`
    pub offset: u64,
}

/// Page tables of one process
#[derive(Debug, Default)]
pub struct Mmu {
    entries: BTreeMap<u64, Pte>,
}

impl Mmu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs an entry, returning the one it replaces
    pub fn set(&mut self, addr: u64, page: Page, flags: PteFlags) -> Option<Pte> {
        self.entries
            .insert(addr / PAGE_SIZE, Pte::Valid { page, flags: flags | PteFlags::VALID })
    }

    /// Replaces a valid private entry with a swapped one
    pub fn set_swapped(&mut self, addr: u64, slot: SwapSlot) -> Option<Pte> {
        self.entries.insert(addr / PAGE_SIZE, Pte::Swapped { slot })
    }

    pub fn get(&self, addr: u64) -> Option<&Pte> {
        self.entries.get(&(addr / PAGE_SIZE))
    }

    pub fn is_valid(&self, addr: u64) -> bool {
        self.get(addr).map(Pte::is_valid).unwrap_or(false)
    }

    /// Removes the entry for `addr` without releasing its page
    pub fn remove(&mut self, addr: u64) -> Option<Pte> {
        self.entries.remove(&(addr / PAGE_SIZE))
    }

    /// Clears every entry in `[start, end)`, returning pages to their owners
    ///
    /// Private pages go back to swap; shared pages are unpinned on the
    /// pageable object they came from.
    pub fn unset(&mut self, start: u64, end: u64, swap: &Swap, backing: &Backing<'_>) -> usize {
        let first = page_trunc(start) / PAGE_SIZE;
        let last = end.div_ceil(PAGE_SIZE);
        let vpns: Vec<u64> = self.entries.range(first..last).map(|(vpn, _)| *vpn).collect();
        for vpn in &vpns {
            if let Some(pte) = self.entries.remove(vpn) {
                release_entry(vpn * PAGE_SIZE, pte, swap, backing);
            }
        }
        vpns.len()
    }

    /// Number of installed entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over `(address, entry)` pairs in address order
    pub fn iter(&self) -> impl Iterator<Item = (u64, &Pte)> {
        self.entries.iter().map(|(vpn, pte)| (vpn * PAGE_SIZE, pte))
    }
}

/// Returns the page held by an entry to its owner
pub fn release_entry(addr: u64, pte: Pte, swap: &Swap, backing: &Backing<'_>) {
    match pte {
        Pte::Valid { page, flags } if flags.contains(PteFlags::PRIVATE) => {
            if let Some(slot) = page.slot() {
                drop(page);
                swap.put(slot);
            }
        }
        Pte::Valid { page, .. } => {
            drop(page);
            if let Some(pageable) = backing.pageable {
                pageable.put(backing.offset + (addr - backing.start));
            }
        }
        Pte::Swapped { slot } => {
            swap.put(slot);
        }
    }
}
