//! Physical pages
//!
//! A [`Page`] is a shared handle to one page frame. Every page-table entry
//! and every pageable object that holds a frame holds a `Page`, so the
//! number of handles is the number of holders.

use crate::swap::SwapSlot;
use core_types::PAGE_SIZE;
use std::fmt;
use std::sync::Arc;

struct PageFrame {
    data: spin::Mutex<Box<[u8]>>,
    slot: Option<SwapSlot>,
}

/// A reference to a page frame
#[derive(Clone)]
pub struct Page(Arc<PageFrame>);

impl Page {
    /// Allocates a zero-filled frame
    pub fn zeroed(slot: Option<SwapSlot>) -> Self {
        Self::from_boxed(vec![0u8; PAGE_SIZE as usize].into_boxed_slice(), slot)
    }

    /// Wraps existing contents; short contents are zero padded
    pub fn from_contents(contents: &[u8], slot: Option<SwapSlot>) -> Self {
        let mut data = vec![0u8; PAGE_SIZE as usize];
        let n = contents.len().min(data.len());
        data[..n].copy_from_slice(&contents[..n]);
        Self::from_boxed(data.into_boxed_slice(), slot)
    }

    fn from_boxed(data: Box<[u8]>, slot: Option<SwapSlot>) -> Self {
        Page(Arc::new(PageFrame {
            data: spin::Mutex::new(data),
            slot,
        }))
    }

    /// The swap slot backing this frame, `None` for pages of a pageable object
    pub fn slot(&self) -> Option<SwapSlot> {
        self.0.slot
    }

    /// Copies bytes out of the frame starting at `offset`
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> usize {
        let data = self.0.data.lock();
        let n = buf.len().min(data.len().saturating_sub(offset));
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    /// Copies bytes into the frame starting at `offset`
    pub fn write(&self, offset: usize, buf: &[u8]) -> usize {
        let mut data = self.0.data.lock();
        let n = buf.len().min(data.len().saturating_sub(offset));
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        n
    }

    /// Copies the first `len` bytes of `other` into this frame, zeroing the rest
    pub fn copy_prefix_from(&self, other: &Page, len: usize) {
        let source = other.snapshot();
        let mut data = self.0.data.lock();
        let n = len.min(source.len());
        data[..n].copy_from_slice(&source[..n]);
        for byte in data[n..].iter_mut() {
            *byte = 0;
        }
    }

    /// Returns a copy of the whole frame
    pub fn snapshot(&self) -> Box<[u8]> {
        self.0.data.lock().clone()
    }

    /// Number of live handles to this frame
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn same_frame(&self, other: &Page) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0.data.lock().iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("slot", &self.0.slot)
            .field("holders", &self.holders())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_page() {
        let page = Page::zeroed(None);
        assert!(page.is_zero());
        assert_eq!(page.holders(), 1);
    }

    #[test]
    fn test_read_write_clamped_to_frame() {
        let page = Page::zeroed(None);
        assert_eq!(page.write(4090, b"abcdefgh"), 6);
        let mut buf = [0u8; 8];
        assert_eq!(page.read(4090, &mut buf), 6);
        assert_eq!(&buf[..6], b"abcdef");
    }

    #[test]
    fn test_copy_prefix_zero_fills_tail() {
        let source = Page::from_contents(&[7u8; 4096], None);
        let page = Page::from_contents(&[9u8; 4096], None);
        page.copy_prefix_from(&source, 100);
        let data = page.snapshot();
        assert!(data[..100].iter().all(|b| *b == 7));
        assert!(data[100..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_holders_track_clones() {
        let page = Page::zeroed(None);
        let other = page.clone();
        assert_eq!(page.holders(), 2);
        assert!(page.same_frame(&other));
        drop(other);
        assert_eq!(page.holders(), 1);
    }
}
