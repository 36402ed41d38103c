//! Swap pool
//!
//! Anonymous and private pages are backed by swap slots. Slots are grouped
//! in fixed-size blocks (`SwapUse`); each block keeps per-slot reference
//! counts and a free list, and blocks with a free slot are kept on a stack
//! so that allocation and release are both constant time.
//!
//! A slot whose count drops to zero goes back on its block's free list and
//! forgets its stored contents, so the next holder always starts from a
//! zero-filled page.

use crate::fault_injection::FaultInjector;
use crate::page::Page;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One slot of the swap pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SwapSlot {
    pub block: u32,
    pub index: u32,
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "swap:{}.{}", self.block, self.index)
    }
}

struct SwapUse {
    refs: Vec<u32>,
    free: Vec<u32>,
    stored: Vec<Option<Box<[u8]>>>,
    listed: bool,
}

impl SwapUse {
    fn new(slots: u32) -> Self {
        Self {
            refs: vec![0; slots as usize],
            free: (0..slots).rev().collect(),
            stored: (0..slots).map(|_| None).collect(),
            listed: true,
        }
    }
}

struct SwapInner {
    blocks: Vec<SwapUse>,
    free_blocks: Vec<u32>,
    in_use: usize,
}

/// The global swap pool
pub struct Swap {
    inner: spin::Mutex<SwapInner>,
    slots_per_block: u32,
    max_blocks: u32,
    faults: FaultInjector,
}

impl Swap {
    pub fn new(slots_per_block: u32, max_blocks: u32, faults: FaultInjector) -> Self {
        Self {
            inner: spin::Mutex::new(SwapInner {
                blocks: Vec::new(),
                free_blocks: Vec::new(),
                in_use: 0,
            }),
            slots_per_block,
            max_blocks,
            faults,
        }
    }

    /// Hands out a zero-filled page with one reference on its slot
    ///
    /// Returns `None` once the pool is exhausted.
    pub fn get(&self) -> Option<Page> {
        if !self.faults.take_swap_page() {
            log::warn!("swap: injected exhaustion");
            return None;
        }
        let slot = {
            let mut inner = self.inner.lock();
            let block = match inner.free_blocks.last() {
                Some(block) => *block,
                None => {
                    if inner.blocks.len() as u32 >= self.max_blocks {
                        log::warn!("swap: pool exhausted");
                        return None;
                    }
                    inner.blocks.push(SwapUse::new(self.slots_per_block));
                    let block = inner.blocks.len() as u32 - 1;
                    inner.free_blocks.push(block);
                    block
                }
            };
            let use_ = &mut inner.blocks[block as usize];
            let index = use_.free.pop()?;
            use_.refs[index as usize] = 1;
            use_.stored[index as usize] = None;
            if use_.free.is_empty() {
                use_.listed = false;
                inner.free_blocks.pop();
            }
            inner.in_use += 1;
            SwapSlot { block, index }
        };
        Some(Page::zeroed(Some(slot)))
    }

    /// Drops one reference on a slot; returns the remaining count
    pub fn put(&self, slot: SwapSlot) -> u32 {
        let mut inner = self.inner.lock();
        let SwapInner {
            blocks,
            free_blocks,
            in_use,
        } = &mut *inner;
        let use_ = match blocks.get_mut(slot.block as usize) {
            Some(use_) => use_,
            None => return 0,
        };
        let refs = match use_.refs.get_mut(slot.index as usize) {
            Some(refs) if *refs > 0 => refs,
            _ => return 0,
        };
        *refs -= 1;
        let remaining = *refs;
        if remaining == 0 {
            use_.stored[slot.index as usize] = None;
            use_.free.push(slot.index);
            *in_use -= 1;
            if !use_.listed {
                use_.listed = true;
                free_blocks.push(slot.block);
            }
        }
        remaining
    }

    /// Adds a reference to a slot; returns the new count
    pub fn add_ref(&self, slot: SwapSlot) -> u32 {
        let mut inner = self.inner.lock();
        match inner
            .blocks
            .get_mut(slot.block as usize)
            .and_then(|b| b.refs.get_mut(slot.index as usize))
        {
            Some(refs) if *refs > 0 => {
                *refs += 1;
                *refs
            }
            _ => 0,
        }
    }

    /// Saves the contents of a swap-backed page so the frame can be dropped
    pub fn page_out(&self, page: &Page) -> Option<SwapSlot> {
        let slot = page.slot()?;
        let contents = page.snapshot();
        let mut inner = self.inner.lock();
        let use_ = inner.blocks.get_mut(slot.block as usize)?;
        if use_.refs.get(slot.index as usize).copied().unwrap_or(0) == 0 {
            return None;
        }
        use_.stored[slot.index as usize] = Some(contents);
        Some(slot)
    }

    /// Brings a paged-out slot back into a fresh frame
    ///
    /// The slot keeps its reference; the caller installs the returned page
    /// in place of the swapped entry.
    pub fn restore(&self, slot: SwapSlot) -> Option<Page> {
        let contents = {
            let mut inner = self.inner.lock();
            let use_ = inner.blocks.get_mut(slot.block as usize)?;
            if use_.refs.get(slot.index as usize).copied().unwrap_or(0) == 0 {
                return None;
            }
            use_.stored[slot.index as usize].take()
        };
        Some(match contents {
            Some(data) => Page::from_contents(&data, Some(slot)),
            None => Page::zeroed(Some(slot)),
        })
    }

    /// Reference count of a slot, 0 when free
    pub fn ref_count(&self, slot: SwapSlot) -> u32 {
        let inner = self.inner.lock();
        inner
            .blocks
            .get(slot.block as usize)
            .and_then(|b| b.refs.get(slot.index as usize))
            .copied()
            .unwrap_or(0)
    }

    /// Slots currently referenced
    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use
    }

    /// Free slots in the blocks allocated so far
    pub fn free_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.blocks.iter().map(|b| b.free.len()).sum()
    }

    /// Slots the pool can ever hand out
    pub fn capacity(&self) -> usize {
        self.slots_per_block as usize * self.max_blocks as usize
    }
}
