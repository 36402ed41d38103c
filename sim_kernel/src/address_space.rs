//! Address spaces
//!
//! An [`AddressSpace`] is the ordered list of [`Map`]s of one process plus
//! the page tables that cache their pages. Pages are brought in lazily by
//! the fault handlers:
//!
//! - **Validity faults** (no valid entry) fetch the page from the backing
//!   object, restore it from swap, or hand out a zero page.
//! - **Protection faults** (write to a read-only entry) re-validate a shared
//!   page or perform copy-on-write for a private one.
//!
//! The kernel's own copies into and out of user memory go through the same
//! handlers, so the kernel never writes a page another mapping can see.
//!
//! ## Invariants
//!
//! - Maps are page aligned, disjoint, sorted by address and lie within
//!   `[user_min, user_max)`.
//! - A map's backed length never exceeds its extent.
//! - Every valid entry holds its page; dropping the space returns every
//!   page to swap or to its pageable.

use crate::fault_injection::FaultInjector;
use crate::mmu::{release_entry, Backing, Mmu, Pte};
use crate::page::Page;
use crate::pageable::Pageable;
use crate::swap::Swap;
use core_types::{
    page_offset, page_round, page_trunc, MapFlags, MemoryAccessType, MemoryError, Protection,
    PteFlags, VirtRange, PAGE_SIZE,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One contiguous mapped range
#[derive(Clone)]
pub struct Map {
    pub start: u64,
    pub end: u64,
    /// Bytes backed by the pageable, counted from `start`
    pub length: u64,
    pub prot: Protection,
    pub flags: MapFlags,
    /// `None` for anonymous memory
    pub pageable: Option<Arc<dyn Pageable>>,
    /// Byte offset into the pageable at `start`
    pub offset: u64,
}

impl Map {
    pub fn range(&self) -> VirtRange {
        VirtRange {
            start: self.start,
            end: self.end,
        }
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn is_anonymous(&self) -> bool {
        self.pageable.is_none()
    }

    /// Offset in the pageable of the page holding `addr`
    pub fn position(&self, addr: u64) -> u64 {
        self.offset + (page_trunc(addr) - self.start)
    }

    fn backing(&self) -> Backing<'_> {
        Backing {
            pageable: self.pageable.as_deref(),
            start: self.start,
            offset: self.offset,
        }
    }
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Map")
            .field("range", &self.range())
            .field("length", &self.length)
            .field("prot", &self.prot)
            .field("flags", &self.flags)
            .field("anonymous", &self.is_anonymous())
            .field("offset", &self.offset)
            .finish()
    }
}

/// Fault counters
///
/// Only faults that install or change an entry are counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultStats {
    pub validity: u64,
    pub protection: u64,
    pub copy_on_write: u64,
    pub zero_fills: u64,
}

/// The mapped ranges and page tables of one process
pub struct AddressSpace {
    maps: Vec<Map>,
    mmu: Mmu,
    swap: Arc<Swap>,
    faults: FaultInjector,
    user_min: u64,
    user_max: u64,
    brk: u64,
    stats: FaultStats,
}

impl AddressSpace {
    pub fn new(swap: Arc<Swap>, faults: FaultInjector, user_min: u64, user_max: u64) -> Self {
        Self {
            maps: Vec::new(),
            mmu: Mmu::new(),
            swap,
            faults,
            user_min,
            user_max,
            brk: 0,
            stats: FaultStats::default(),
        }
    }

    /// Maps a range inside the user address space
    ///
    /// The backed length is the pageable's size past `offset`, clamped to
    /// `length`. Anonymous memory is always private.
    pub fn map(
        &mut self,
        start: u64,
        length: u64,
        prot: Protection,
        flags: MapFlags,
        pageable: Option<Arc<dyn Pageable>>,
        offset: u64,
    ) -> Result<u64, MemoryError> {
        let size = match &pageable {
            Some(pageable) => pageable.size().saturating_sub(offset),
            None => 0,
        };
        let (min, max) = (self.user_min, self.user_max);
        self.map_with(start, length, prot, flags, pageable, offset, size, min, max)
    }

    /// Maps a range inside `[min, max)` with an explicit backed size
    #[allow(clippy::too_many_arguments)]
    pub fn map_with(
        &mut self,
        start: u64,
        length: u64,
        prot: Protection,
        mut flags: MapFlags,
        pageable: Option<Arc<dyn Pageable>>,
        offset: u64,
        size: u64,
        min: u64,
        max: u64,
    ) -> Result<u64, MemoryError> {
        if page_offset(offset) != page_offset(start) {
            return Err(MemoryError::Misaligned {
                addr: start,
                offset,
            });
        }
        if length == 0 {
            return Err(MemoryError::EmptyRange);
        }
        let mut size = size.min(length);
        let mut start = page_trunc(start);
        let length = length
            .checked_add(page_offset(offset))
            .ok_or(MemoryError::OutOfRange(VirtRange {
                start,
                end: u64::MAX,
            }))?;
        size += page_offset(offset);
        let mut offset = page_trunc(offset);

        let out_of_range = |start: u64| {
            MemoryError::OutOfRange(VirtRange {
                start,
                end: start.saturating_add(length),
            })
        };
        let extent = |start: u64| -> Result<u64, MemoryError> {
            start
                .checked_add(length)
                .map(page_round)
                .filter(|end| *end > start)
                .ok_or_else(|| out_of_range(start))
        };

        let mut end;
        let mut index = self.maps.len();
        if flags.contains(MapFlags::FIXED) {
            if start < min {
                return Err(out_of_range(start));
            }
            end = extent(start)?;
            if max < end {
                return Err(out_of_range(start));
            }
            for (i, map) in self.maps.iter().enumerate() {
                if end <= map.start {
                    index = i;
                    break;
                }
                if start < map.end {
                    return Err(MemoryError::Overlap(VirtRange { start, end }));
                }
            }
        } else {
            start = start.max(min);
            end = extent(start)?;
            for (i, map) in self.maps.iter().enumerate() {
                if end <= map.start {
                    index = i;
                    break;
                }
                if start < map.end {
                    start = map.end;
                    end = extent(start)?;
                }
            }
            if max < end {
                return Err(out_of_range(start));
            }
        }

        if pageable.is_none() {
            offset = 0;
            size = 0;
            flags |= MapFlags::PRIVATE;
            flags.remove(MapFlags::SHARED);
        }

        if flags.contains(MapFlags::DATA) {
            self.brk = self.brk.max(start + length);
        }
        log::trace!("map {:#x}-{:#x} {} {:?}", start, end, prot, flags);
        self.maps.insert(
            index,
            Map {
                start,
                end,
                length: size,
                prot,
                flags,
                pageable,
                offset,
            },
        );
        Ok(start)
    }

    /// Unmaps every page touching `[start, start + length)`
    ///
    /// Maps partly covered are trimmed; a hole inside a map splits it.
    pub fn unmap(&mut self, start: u64, length: u64) {
        let end = match start.checked_add(length) {
            Some(end) => page_round(end),
            None => return,
        };
        let start = page_trunc(start);
        if end <= start {
            return;
        }

        let maps = std::mem::take(&mut self.maps);
        let mut kept = Vec::with_capacity(maps.len() + 1);
        for mut map in maps {
            if end <= map.start || map.end <= start {
                kept.push(map);
                continue;
            }
            if start <= map.start && map.end <= end {
                self.mmu.unset(map.start, map.end, &self.swap, &map.backing());
                continue;
            }
            let cut_start = start.max(map.start);
            let cut_end = end.min(map.end);
            self.mmu.unset(cut_start, cut_end, &self.swap, &map.backing());

            if map.start < start && end < map.end {
                let mut right = map.clone();
                let skip = end - map.start;
                right.start = end;
                right.offset += skip;
                right.length = map.length.saturating_sub(skip);
                map.end = start;
                map.length = map.length.min(start - map.start);
                kept.push(map);
                kept.push(right);
            } else if map.start < start {
                map.end = start;
                map.length = map.length.min(start - map.start);
                kept.push(map);
            } else {
                let skip = end - map.start;
                map.start = end;
                map.offset += skip;
                map.length = map.length.saturating_sub(skip);
                kept.push(map);
            }
        }
        self.maps = kept;
    }

    /// Sets the initial break
    ///
    /// A `DATA` map sets it on its own; this is for loaders that place the
    /// break elsewhere.
    pub fn set_break_base(&mut self, brk: u64) {
        self.brk = brk;
    }

    pub fn brk(&self) -> u64 {
        self.brk
    }

    /// Grows or shrinks the map that ends at the break
    ///
    /// Returns the previous break.
    pub fn set_break(&mut self, increment: i64) -> Result<u64, MemoryError> {
        let prev = self.brk;
        if increment == 0 {
            return Ok(prev);
        }
        let index = self
            .maps
            .iter()
            .position(|map| prev <= map.end)
            .filter(|i| self.maps[*i].start <= prev)
            .ok_or(MemoryError::NotMapped(prev))?;

        let new = if increment > 0 {
            prev.checked_add(increment as u64)
        } else {
            prev.checked_sub(increment.unsigned_abs())
        }
        .ok_or(MemoryError::OutOfRange(VirtRange {
            start: prev,
            end: prev,
        }))?;
        let new_end = page_round(new);

        if increment > 0 {
            if self.user_max < new_end {
                return Err(MemoryError::OutOfRange(VirtRange {
                    start: prev,
                    end: new_end,
                }));
            }
            if let Some(next) = self.maps.get(index + 1) {
                if next.start < new_end {
                    return Err(MemoryError::Overlap(VirtRange {
                        start: prev,
                        end: new_end,
                    }));
                }
            }
        } else {
            let map = &self.maps[index];
            if new < map.start + map.length {
                return Err(MemoryError::BelowBackedFloor(map.start + map.length));
            }
            if new_end < map.end {
                let backing = map.backing();
                self.mmu.unset(new_end, map.end, &self.swap, &backing);
            }
        }

        let map = &mut self.maps[index];
        map.end = if increment > 0 { map.end.max(new_end) } else { new_end };
        self.brk = new;
        Ok(prev)
    }

    /// Returns the map containing `addr`
    pub fn lookup(&self, addr: u64) -> Option<&Map> {
        self.maps.iter().find(|map| map.contains(addr))
    }

    fn map_index(&self, addr: u64) -> Option<usize> {
        self.maps.iter().position(|map| map.contains(addr))
    }

    /// Checks that `[start, start + length)` is fully mapped
    ///
    /// With `write`, every map crossed must also be writable.
    pub fn is_valid(&self, start: u64, length: u64, write: bool) -> bool {
        let end = match start.checked_add(length) {
            Some(end) if start < end => end,
            _ => return false,
        };
        let mut cursor = start;
        for map in &self.maps {
            if cursor < map.start {
                return false;
            }
            if cursor < map.end {
                if write && !map.prot.contains(Protection::WRITE) {
                    return false;
                }
                if end <= map.end {
                    return true;
                }
                cursor = map.end;
            }
        }
        false
    }

    /// Resolves a fault on a page with no valid entry
    ///
    /// A write to a writable map is resolved straight to a writable page,
    /// copying a file page first when the map is private.
    pub fn validity_fault(
        &mut self,
        addr: u64,
        access: MemoryAccessType,
    ) -> Result<(), MemoryError> {
        let addr = page_trunc(addr);
        let index = self.map_index(addr).ok_or(MemoryError::NotMapped(addr))?;
        let map = self.maps[index].clone();
        if !map.prot.permits(access) {
            return Err(MemoryError::PermissionDenied { addr, access });
        }
        if self.mmu.is_valid(addr) {
            return Ok(());
        }

        let writable = map.prot.contains(Protection::WRITE);
        let write = access == MemoryAccessType::Write;
        let private_flags = if writable {
            PteFlags::PRIVATE | PteFlags::USER | PteFlags::WRITE
        } else {
            PteFlags::PRIVATE | PteFlags::USER
        };
        let pos = map.position(addr);
        let in_map = addr - map.start;

        let (page, flags) = if !map.flags.is_private() {
            let pageable = map.pageable.as_ref().ok_or(MemoryError::NoPage(addr))?;
            let page = self.fetch(pageable.as_ref(), pos, addr)?;
            let flags = if writable {
                PteFlags::USER | PteFlags::WRITE
            } else {
                PteFlags::USER
            };
            (page, flags)
        } else if let Some(Pte::Swapped { slot }) = self.mmu.get(addr) {
            let page = self.swap.restore(*slot).ok_or(MemoryError::NoPage(addr))?;
            (page, private_flags)
        } else if map.length <= in_map {
            let page = self.swap.get().ok_or(MemoryError::NoPage(addr))?;
            self.stats.zero_fills += 1;
            (page, private_flags)
        } else {
            let pageable = map.pageable.as_ref().ok_or(MemoryError::NoPage(addr))?;
            let file_page = self.fetch(pageable.as_ref(), pos, addr)?;
            let partial = map.length < in_map + PAGE_SIZE;
            if partial || (write && writable) {
                let page = match self.swap.get() {
                    Some(page) => page,
                    None => {
                        drop(file_page);
                        pageable.put(pos);
                        return Err(MemoryError::NoPage(addr));
                    }
                };
                let keep = if partial {
                    map.length - in_map
                } else {
                    PAGE_SIZE
                };
                page.copy_prefix_from(&file_page, keep as usize);
                drop(file_page);
                pageable.put(pos);
                if !partial {
                    self.stats.copy_on_write += 1;
                }
                (page, private_flags)
            } else {
                (file_page, PteFlags::USER)
            }
        };

        self.mmu.set(addr, page, flags);
        self.stats.validity += 1;
        log::trace!("validity fault {:#x} resolved {:?}", addr, flags);
        Ok(())
    }

    /// Resolves a write to a page whose entry is read-only
    pub fn protection_fault(
        &mut self,
        addr: u64,
        access: MemoryAccessType,
    ) -> Result<(), MemoryError> {
        let addr = page_trunc(addr);
        let index = self.map_index(addr).ok_or(MemoryError::NotMapped(addr))?;
        if access != MemoryAccessType::Write {
            return Ok(());
        }
        let map = self.maps[index].clone();
        if !map.prot.contains(Protection::WRITE) {
            return Err(MemoryError::PermissionDenied { addr, access });
        }
        let (page, flags) = match self.mmu.get(addr) {
            Some(Pte::Valid { page, flags }) => (page.clone(), *flags),
            _ => return self.validity_fault(addr, access),
        };
        if flags.contains(PteFlags::WRITE) {
            return Ok(());
        }

        if !map.flags.is_private() {
            self.mmu.set(addr, page, flags | PteFlags::WRITE);
        } else if !flags.contains(PteFlags::PRIVATE) {
            let copy = self.swap.get().ok_or(MemoryError::NoPage(addr))?;
            copy.copy_prefix_from(&page, PAGE_SIZE as usize);
            drop(page);
            if let Some(old) = self.mmu.set(
                addr,
                copy,
                PteFlags::PRIVATE | PteFlags::USER | PteFlags::WRITE,
            ) {
                release_entry(addr, old, &self.swap, &map.backing());
            }
            self.stats.copy_on_write += 1;
        } else {
            let shared = page
                .slot()
                .map(|slot| self.swap.ref_count(slot) > 1)
                .unwrap_or(false);
            if shared {
                let copy = self.swap.get().ok_or(MemoryError::NoPage(addr))?;
                copy.copy_prefix_from(&page, PAGE_SIZE as usize);
                drop(page);
                if let Some(old) = self.mmu.set(addr, copy, flags | PteFlags::WRITE) {
                    release_entry(addr, old, &self.swap, &map.backing());
                }
                self.stats.copy_on_write += 1;
            } else {
                self.mmu.set(addr, page, flags | PteFlags::WRITE);
            }
        }
        self.stats.protection += 1;
        log::trace!("protection fault {:#x} resolved", addr);
        Ok(())
    }

    /// Simulates a user-mode access, faulting as the hardware would
    /// Whether `access` at `addr` would trap
    pub fn would_fault(&self, addr: u64, access: MemoryAccessType) -> bool {
        !self.mmu.is_valid(addr)
            || (access == MemoryAccessType::Write
                && !self.mmu.get(addr).map(Pte::is_writable).unwrap_or(false))
    }

    pub fn touch(&mut self, addr: u64, access: MemoryAccessType) -> Result<(), MemoryError> {
        if !self.mmu.is_valid(addr) {
            self.validity_fault(addr, access)?;
        }
        if access == MemoryAccessType::Write
            && !self.mmu.get(addr).map(Pte::is_writable).unwrap_or(false)
        {
            self.protection_fault(addr, access)?;
        }
        Ok(())
    }

    /// Copies user memory into `buf`; returns the bytes copied
    pub fn read(&mut self, addr: u64, buf: &mut [u8]) -> usize {
        let mut done = 0usize;
        while done < buf.len() {
            let cursor = addr + done as u64;
            if self.touch(cursor, MemoryAccessType::Read).is_err() {
                break;
            }
            let page = match self.mmu.get(cursor).and_then(Pte::page) {
                Some(page) => page.clone(),
                None => break,
            };
            let in_page = page_offset(cursor) as usize;
            let n = (buf.len() - done).min(PAGE_SIZE as usize - in_page);
            page.read(in_page, &mut buf[done..done + n]);
            done += n;
        }
        done
    }

    /// Copies `data` into user memory; returns the bytes copied
    pub fn write(&mut self, addr: u64, data: &[u8]) -> usize {
        let mut done = 0usize;
        while done < data.len() {
            let cursor = addr + done as u64;
            if self.touch(cursor, MemoryAccessType::Write).is_err() {
                break;
            }
            let page = match self.mmu.get(cursor).and_then(Pte::page) {
                Some(page) => page.clone(),
                None => break,
            };
            let in_page = page_offset(cursor) as usize;
            let n = (data.len() - done).min(PAGE_SIZE as usize - in_page);
            page.write(in_page, &data[done..done + n]);
            done += n;
        }
        done
    }

    /// Pushes a private page out to swap
    ///
    /// Returns false if the page is not resident, not private, or still
    /// referenced outside the page tables.
    pub fn page_out(&mut self, addr: u64) -> bool {
        let addr = page_trunc(addr);
        let page = match self.mmu.get(addr) {
            Some(Pte::Valid { page, flags }) if flags.contains(PteFlags::PRIVATE) => page.clone(),
            _ => return false,
        };
        if page.holders() > 2 {
            return false;
        }
        match self.swap.page_out(&page) {
            Some(slot) => {
                drop(page);
                self.mmu.set_swapped(addr, slot);
                true
            }
            None => false,
        }
    }

    /// Returns the resident page at `addr`, if any
    pub fn resident_page(&self, addr: u64) -> Option<Page> {
        self.mmu.get(addr).and_then(Pte::page).cloned()
    }

    pub fn maps(&self) -> &[Map] {
        &self.maps
    }

    pub fn mmu(&self) -> &Mmu {
        &self.mmu
    }

    pub fn stats(&self) -> FaultStats {
        self.stats
    }

    pub fn user_range(&self) -> VirtRange {
        VirtRange {
            start: self.user_min,
            end: self.user_max,
        }
    }

    /// Logs the map list
    pub fn dump(&self) {
        for map in &self.maps {
            log::debug!(
                "{} {} {:?} length {:#x} offset {:#x}{}",
                map.range(),
                map.prot,
                map.flags,
                map.length,
                map.offset,
                if map.is_anonymous() { " anon" } else { "" }
            );
        }
        log::debug!("break {:#x}, {} entries", self.brk, self.mmu.len());
    }

    /// Unmaps everything
    pub fn clear(&mut self) {
        let maps = std::mem::take(&mut self.maps);
        for map in &maps {
            self.mmu.unset(map.start, map.end, &self.swap, &map.backing());
        }
    }

    fn fetch(&self, pageable: &dyn Pageable, pos: u64, addr: u64) -> Result<Page, MemoryError> {
        if self.faults.take_pageable_failure() {
            log::warn!("pageable get at {:#x} failed by injection", pos);
            return Err(MemoryError::NoPage(addr));
        }
        pageable.get(pos).map_err(|_| MemoryError::NoPage(addr))
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pageable::MemoryFile;

    const MIN: u64 = 0x1000;
    const MAX: u64 = 0x100_0000;

    fn space() -> AddressSpace {
        let swap = Arc::new(Swap::new(64, 4, FaultInjector::disabled()));
        AddressSpace::new(swap, FaultInjector::disabled(), MIN, MAX)
    }

    fn assert_disjoint(space: &AddressSpace) {
        for pair in space.maps().windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
        for map in space.maps() {
            assert!(MIN <= map.start && map.end <= MAX);
            assert!(map.length <= map.end - map.start);
        }
    }

    #[test]
    fn test_map_first_fit() {
        let mut space = space();
        let a = space
            .map(0, 0x2000, Protection::read_write(), MapFlags::PRIVATE, None, 0)
            .unwrap();
        assert_eq!(a, MIN);
        let b = space
            .map(0, 0x1000, Protection::READ, MapFlags::PRIVATE, None, 0)
            .unwrap();
        assert_eq!(b, MIN + 0x2000);
        assert_disjoint(&space);
    }

    #[test]
    fn test_fixed_map_rejects_overlap_and_range() {
        let mut space = space();
        let flags = MapFlags::PRIVATE | MapFlags::FIXED;
        space
            .map(0x4000, 0x2000, Protection::READ, flags, None, 0)
            .unwrap();
        assert!(matches!(
            space.map(0x5000, 0x1000, Protection::READ, flags, None, 0),
            Err(MemoryError::Overlap(_))
        ));
        assert!(matches!(
            space.map(0, 0x1000, Protection::READ, flags, None, 0),
            Err(MemoryError::OutOfRange(_))
        ));
        assert!(matches!(
            space.map(MAX - 0x1000, 0x2000, Protection::READ, flags, None, 0),
            Err(MemoryError::OutOfRange(_))
        ));
        assert_eq!(
            space.map(0x1001, 0x10, Protection::READ, flags, None, 0),
            Err(MemoryError::Misaligned {
                addr: 0x1001,
                offset: 0
            })
        );
    }

    #[test]
    fn test_unmap_splits_interior_hole() {
        let mut space = space();
        let start = space
            .map(0x10000, 0x5000, Protection::read_write(), MapFlags::FIXED, None, 0)
            .unwrap();
        space.write(start, &[1u8; 0x5000]);
        let swap_before = space.swap.in_use();

        space.unmap(start + 0x1000, 0x2000);
        let ranges: Vec<VirtRange> = space.maps().iter().map(Map::range).collect();
        assert_eq!(
            ranges,
            vec![
                VirtRange {
                    start,
                    end: start + 0x1000
                },
                VirtRange {
                    start: start + 0x3000,
                    end: start + 0x5000
                },
            ]
        );
        assert_eq!(space.swap.in_use(), swap_before - 2);
        assert_disjoint(&space);

        let mut buf = [0u8; 1];
        assert_eq!(space.read(start + 0x3000, &mut buf), 1);
        assert_eq!(buf[0], 1);
        assert_eq!(space.read(start + 0x1000, &mut buf), 0);
    }

    #[test]
    fn test_anonymous_maps_are_private() {
        let mut space = space();
        let addr = space
            .map(0, 0x1000, Protection::read_write(), MapFlags::SHARED, None, 0)
            .unwrap();
        assert!(space.lookup(addr).unwrap().flags.is_private());
    }

    #[test]
    fn test_private_write_fault_on_file() {
        let mut space = space();
        let file = Arc::new(MemoryFile::from_bytes(&[5u8; 4096]));
        let addr = space
            .map(
                0,
                4096,
                Protection::read_write(),
                MapFlags::PRIVATE,
                Some(file.clone()),
                0,
            )
            .unwrap();

        assert_eq!(space.write(addr, b"new"), 3);
        let stats = space.stats();
        assert_eq!(stats.validity, 1);
        assert_eq!(stats.protection, 0);

        let mut buf = [0u8; 3];
        file.read_at(0, &mut buf);
        assert_eq!(buf, [5, 5, 5]);
        assert_eq!(file.total_pins(), 0);
    }

    #[test]
    fn test_copy_on_write_after_read() {
        let mut space = space();
        let file = Arc::new(MemoryFile::from_bytes(&[7u8; 8192]));
        let addr = space
            .map(
                0,
                8192,
                Protection::read_write(),
                MapFlags::PRIVATE,
                Some(file.clone()),
                0,
            )
            .unwrap();

        let mut buf = [0u8; 1];
        space.read(addr, &mut buf);
        assert_eq!(file.pin_count(0), 1);
        assert!(!space.mmu().get(addr).unwrap().is_writable());

        space.write(addr, &[9]);
        let stats = space.stats();
        assert_eq!(stats.validity, 1);
        assert_eq!(stats.protection, 1);
        assert_eq!(stats.copy_on_write, 1);
        assert_eq!(file.pin_count(0), 0);

        file.read_at(0, &mut buf);
        assert_eq!(buf[0], 7);
        space.read(addr, &mut buf);
        assert_eq!(buf[0], 9);
    }

    #[test]
    fn test_shared_write_reaches_file() {
        let mut space = space();
        let file = Arc::new(MemoryFile::new(4096));
        let addr = space
            .map(
                0,
                4096,
                Protection::read_write(),
                MapFlags::SHARED,
                Some(file.clone()),
                0,
            )
            .unwrap();
        space.write(addr + 8, b"shared");
        let mut buf = [0u8; 6];
        file.read_at(8, &mut buf);
        assert_eq!(&buf, b"shared");
    }

    #[test]
    fn test_partial_tail_is_zero_filled() {
        let mut space = space();
        let file = Arc::new(MemoryFile::from_bytes(&[3u8; 100]));
        let addr = space
            .map(0, 4096, Protection::READ, MapFlags::PRIVATE, Some(file), 0)
            .unwrap();
        let mut buf = [0u8; 2];
        space.read(addr + 99, &mut buf);
        assert_eq!(buf, [3, 0]);
    }

    #[test]
    fn test_private_swap_page_shared_is_copied() {
        let mut space = space();
        let addr = space
            .map(0, 4096, Protection::read_write(), MapFlags::PRIVATE, None, 0)
            .unwrap();
        space.write(addr, &[1]);
        let page = space.resident_page(addr).unwrap();
        let slot = page.slot().unwrap();

        // Drop write permission on the entry and give the slot a second holder.
        space.mmu.set(addr, page.clone(), PteFlags::PRIVATE | PteFlags::USER);
        space.swap.add_ref(slot);

        space.write(addr, &[2]);
        let copy = space.resident_page(addr).unwrap();
        assert!(!copy.same_frame(&page));
        let mut buf = [0u8; 1];
        page.read(0, &mut buf);
        assert_eq!(buf[0], 1);
        assert_eq!(space.swap.ref_count(slot), 1);
    }

    #[test]
    fn test_read_only_map_refuses_kernel_write() {
        let mut space = space();
        let addr = space
            .map(0, 4096, Protection::READ, MapFlags::PRIVATE, None, 0)
            .unwrap();
        assert_eq!(space.write(addr, b"x"), 0);
        assert!(space.is_valid(addr, 4096, false));
        assert!(!space.is_valid(addr, 4096, true));
        assert!(!space.is_valid(addr, 4097, false));
    }

    #[test]
    fn test_set_break_grow_and_shrink() {
        let mut space = space();
        let heap = space
            .map(0x8000, 0x1000, Protection::read_write(), MapFlags::FIXED, None, 0)
            .unwrap();
        space
            .map(0x20000, 0x1000, Protection::READ, MapFlags::FIXED, None, 0)
            .unwrap();
        space.set_break_base(heap + 0x1000);

        assert_eq!(space.set_break(0x3000), Ok(heap + 0x1000));
        assert_eq!(space.lookup(heap).unwrap().end, heap + 0x4000);
        space.write(heap + 0x3000, &[1]);
        let in_use = space.swap.in_use();

        assert_eq!(space.set_break(-0x2000), Ok(heap + 0x4000));
        assert_eq!(space.lookup(heap).unwrap().end, heap + 0x2000);
        assert_eq!(space.swap.in_use(), in_use - 1);

        assert!(matches!(
            space.set_break(0x20000),
            Err(MemoryError::Overlap(_))
        ));
        assert_eq!(space.brk(), heap + 0x2000);
        assert_disjoint(&space);
    }

    #[test]
    fn test_set_break_refuses_backed_floor() {
        let mut space = space();
        let file = Arc::new(MemoryFile::new(0x2000));
        let heap = space
            .map(
                0x8000,
                0x2000,
                Protection::read_write(),
                MapFlags::FIXED | MapFlags::PRIVATE,
                Some(file),
                0,
            )
            .unwrap();
        space.set_break_base(heap + 0x2000);
        assert_eq!(
            space.set_break(-0x1000),
            Err(MemoryError::BelowBackedFloor(heap + 0x2000))
        );
    }

    #[test]
    fn test_data_map_sets_break() {
        let mut space = space();
        let data = space
            .map(0x8000, 0x1800, Protection::read_write(), MapFlags::FIXED | MapFlags::DATA, None, 0)
            .unwrap();
        assert_eq!(space.brk(), data + 0x1800);

        // Growth inside the last page keeps the map whole
        assert_eq!(space.set_break(0x100), Ok(data + 0x1800));
        assert_eq!(space.lookup(data).unwrap().end, data + 0x2000);
        assert_eq!(space.set_break(0x1000), Ok(data + 0x1900));
        assert_eq!(space.lookup(data).unwrap().end, data + 0x3000);
    }

    #[test]
    fn test_growth_below_map_end_keeps_pages_mapped() {
        let mut space = space();
        let heap = space
            .map(0x8000, 0x4000, Protection::read_write(), MapFlags::FIXED, None, 0)
            .unwrap();
        space.write(heap + 0x3000, &[7]);
        space.set_break_base(heap + 0x1000);

        assert_eq!(space.set_break(0x1000), Ok(heap + 0x1000));
        assert_eq!(space.lookup(heap).unwrap().end, heap + 0x4000);
        let mut buf = [0u8; 1];
        assert_eq!(space.read(heap + 0x3000, &mut buf), 1);
        assert_eq!(buf, [7]);
    }

    #[test]
    fn test_huge_length_is_out_of_range() {
        let mut space = space();
        let result = space.map(1, u64::MAX, Protection::read_write(), MapFlags::PRIVATE, None, 1);
        assert!(matches!(result, Err(MemoryError::OutOfRange(_))));
        let result = space.map(0, u64::MAX - 0x10, Protection::READ, MapFlags::PRIVATE, None, 0);
        assert!(matches!(result, Err(MemoryError::OutOfRange(_))));
        assert!(space.maps().is_empty());
    }

    #[test]
    fn test_page_out_and_restore() {
        let mut space = space();
        let addr = space
            .map(0, 4096, Protection::read_write(), MapFlags::PRIVATE, None, 0)
            .unwrap();
        space.write(addr, b"swapped");
        assert!(space.page_out(addr));
        assert!(!space.mmu().is_valid(addr));

        let mut buf = [0u8; 7];
        assert_eq!(space.read(addr, &mut buf), 7);
        assert_eq!(&buf, b"swapped");
    }

    #[test]
    fn test_drop_returns_every_page() {
        let swap = Arc::new(Swap::new(64, 4, FaultInjector::disabled()));
        let file = Arc::new(MemoryFile::new(8192));
        {
            let mut space = AddressSpace::new(swap.clone(), FaultInjector::disabled(), MIN, MAX);
            let a = space
                .map(0, 0x4000, Protection::read_write(), MapFlags::PRIVATE, None, 0)
                .unwrap();
            space.write(a, &[1u8; 0x4000]);
            let b = space
                .map(
                    0,
                    8192,
                    Protection::READ,
                    MapFlags::SHARED,
                    Some(file.clone()),
                    0,
                )
                .unwrap();
            let mut buf = [0u8; 8192];
            space.read(b, &mut buf);
            assert_eq!(swap.in_use(), 4);
            assert_eq!(file.total_pins(), 2);
        }
        assert_eq!(swap.in_use(), 0);
        assert_eq!(file.total_pins(), 0);
    }

    #[test]
    fn test_swap_exhaustion_surfaces_as_no_page() {
        let swap = Arc::new(Swap::new(1, 1, FaultInjector::disabled()));
        let mut space = AddressSpace::new(swap, FaultInjector::disabled(), MIN, MAX);
        let addr = space
            .map(0, 0x2000, Protection::read_write(), MapFlags::PRIVATE, None, 0)
            .unwrap();
        assert!(space.touch(addr, MemoryAccessType::Write).is_ok());
        assert_eq!(
            space.touch(addr + 0x1000, MemoryAccessType::Write),
            Err(MemoryError::NoPage(addr + 0x1000))
        );
    }
}
