//! Backing objects for mapped ranges
//!
//! A [`Pageable`] hands out the page at a byte offset and takes it back
//! when the mapping lets go of it. [`MemoryFile`] is the in-memory
//! implementation used for file-backed mappings in the simulation.

use crate::page::Page;
use core_types::{page_round, page_trunc, MemoryError, PAGE_SIZE};
use std::collections::BTreeMap;

/// A source of pages for shared and copy-on-write mappings
pub trait Pageable: Send + Sync {
    /// Returns the page holding `offset`, pinning it until `put`
    fn get(&self, offset: u64) -> Result<Page, MemoryError>;

    /// Unpins the page holding `offset`
    fn put(&self, offset: u64);

    /// Size of the object in bytes
    fn size(&self) -> u64;
}

#[derive(Default)]
struct FileState {
    pages: BTreeMap<u64, Page>,
    pins: BTreeMap<u64, u32>,
}

/// An in-memory file
pub struct MemoryFile {
    size: u64,
    state: spin::Mutex<FileState>,
}

impl MemoryFile {
    /// Creates a zero-filled file of `size` bytes
    pub fn new(size: u64) -> Self {
        Self {
            size,
            state: spin::Mutex::new(FileState::default()),
        }
    }

    /// Creates a file holding `contents`
    pub fn from_bytes(contents: &[u8]) -> Self {
        let file = Self::new(contents.len() as u64);
        {
            let mut state = file.state.lock();
            for (i, chunk) in contents.chunks(PAGE_SIZE as usize).enumerate() {
                state
                    .pages
                    .insert(i as u64 * PAGE_SIZE, Page::from_contents(chunk, None));
            }
        }
        file
    }

    /// Reads file contents directly, bypassing any mapping
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            if pos >= self.size {
                break;
            }
            let base = page_trunc(pos);
            let in_page = (pos - base) as usize;
            let want = (buf.len() - done)
                .min(PAGE_SIZE as usize - in_page)
                .min((self.size - pos) as usize);
            let page = self.state.lock().pages.get(&base).cloned();
            match page {
                Some(page) => {
                    page.read(in_page, &mut buf[done..done + want]);
                }
                None => buf[done..done + want].iter_mut().for_each(|b| *b = 0),
            }
            done += want;
        }
        done
    }

    /// Number of outstanding pins on the page holding `offset`
    pub fn pin_count(&self, offset: u64) -> u32 {
        self.state
            .lock()
            .pins
            .get(&page_trunc(offset))
            .copied()
            .unwrap_or(0)
    }

    /// Total outstanding pins
    pub fn total_pins(&self) -> u32 {
        self.state.lock().pins.values().sum()
    }
}

impl Pageable for MemoryFile {
    fn get(&self, offset: u64) -> Result<Page, MemoryError> {
        if offset >= page_round(self.size) {
            return Err(MemoryError::NoPage(offset));
        }
        let base = page_trunc(offset);
        let mut state = self.state.lock();
        let page = state
            .pages
            .entry(base)
            .or_insert_with(|| Page::zeroed(None))
            .clone();
        *state.pins.entry(base).or_insert(0) += 1;
        Ok(page)
    }

    fn put(&self, offset: u64) {
        let base = page_trunc(offset);
        let mut state = self.state.lock();
        if let Some(pins) = state.pins.get_mut(&base) {
            *pins -= 1;
            if *pins == 0 {
                state.pins.remove(&base);
            }
        }
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_put_pins() {
        let file = MemoryFile::from_bytes(&[1u8; 5000]);
        let page = file.get(4100).unwrap();
        assert_eq!(file.pin_count(4096), 1);
        let mut buf = [0u8; 4];
        page.read(900, &mut buf);
        assert_eq!(buf, [1, 1, 1, 1]);
        // the tail of the last page is zero
        page.read(1000, &mut buf);
        assert_eq!(buf, [0, 0, 0, 0]);
        file.put(4100);
        assert_eq!(file.pin_count(4096), 0);
    }

    #[test]
    fn test_get_past_end_fails() {
        let file = MemoryFile::new(4096);
        assert_eq!(file.get(4096).unwrap_err(), MemoryError::NoPage(4096));
    }

    #[test]
    fn test_writes_through_page_are_visible() {
        let file = MemoryFile::new(100);
        let page = file.get(0).unwrap();
        page.write(3, b"xyz");
        file.put(0);
        let mut buf = [0u8; 3];
        assert_eq!(file.read_at(3, &mut buf), 3);
        assert_eq!(&buf, b"xyz");
    }
}
