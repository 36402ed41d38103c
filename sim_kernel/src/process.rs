//! Processes
//!
//! A process is an address-space container: one [`AddressSpace`], one
//! capability table, its thread bookkeeping, the pool of upcall records
//! used by clients calling into it, and the objects it exports.
//!
//! Everything mutable sits behind the process lock. Object references are
//! moved out before the lock is released and dropped afterwards, since
//! releasing an object may call back into the kernel.

use crate::address_space::AddressSpace;
use crate::capability_table::SyscallTable;
use crate::config::KernelConfig;
use crate::fault_injection::FaultInjector;
use crate::object::{KernelObject, ObjectRef};
use crate::swap::Swap;
use crate::upcall::UpcallRecord;
use core_types::{MapFlags, MemoryError, ProcessId, Protection, ThreadId, VirtRange, PAGE_SIZE, WORD_SIZE};
use kernel_api::{KernelError, Resource};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const EXPORTS_PER_PAGE: usize = (PAGE_SIZE / WORD_SIZE) as usize;

/// Thread-local storage template copied onto every new stack
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsImage {
    pub image: Vec<u8>,
    /// Size of the TLS block; bytes past the image are zero
    pub size: u64,
    pub align: u64,
}

/// An object the process implements, reachable by upcall
#[derive(Clone)]
pub struct Export {
    pub addr: u64,
    pub object: Arc<dyn KernelObject>,
    pub iid: String,
}

/// The per-process context references
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextSlot {
    Root,
    Current,
    Input,
    Output,
    Error,
}

pub struct ProcessInner {
    pub space: AddressSpace,
    pub thread_count: u32,
    /// Stacks mapped for upcall records
    pub upcall_count: u32,
    records: Vec<UpcallRecord>,
    pub records_created: u32,
    exports: Vec<Export>,
    export_pages: Vec<u64>,
    pub tls: TlsImage,
    /// Runtime entry point run on every new stack
    pub startup: u64,
    /// Argument passed to the runtime entry point
    pub focus: u64,
    /// Address of capability slot 0 as seen by user code
    pub ipt_base: u64,
    contexts: [Option<ObjectRef>; 5],
    pub exit_value: Option<i32>,
    pub exited: bool,
    pub trace: bool,
    /// Threads blocked in `wait`
    pub waiters: Vec<ThreadId>,
}

impl ProcessInner {
    /// Maps a user stack below those already handed out
    ///
    /// The stack is one page shorter than the stride, leaving a guard page.
    fn map_stack(&mut self, stack_size: u64, user_max: u64) -> Result<VirtRange, MemoryError> {
        let mut n = u64::from(self.thread_count + self.upcall_count) + 1;
        loop {
            let start = n
                .checked_mul(stack_size)
                .and_then(|offset| user_max.checked_sub(offset))
                .ok_or(MemoryError::OutOfRange(VirtRange {
                    start: 0,
                    end: user_max,
                }))?;
            match self.space.map(
                start,
                stack_size - PAGE_SIZE,
                Protection::read_write(),
                MapFlags::PRIVATE | MapFlags::FIXED,
                None,
                0,
            ) {
                Ok(start) => {
                    return Ok(VirtRange {
                        start,
                        end: start + stack_size - PAGE_SIZE,
                    })
                }
                Err(MemoryError::Overlap(_)) => n += 1,
                Err(err) => return Err(err),
            }
        }
    }

    fn context_index(slot: ContextSlot) -> usize {
        match slot {
            ContextSlot::Root => 0,
            ContextSlot::Current => 1,
            ContextSlot::Input => 2,
            ContextSlot::Output => 3,
            ContextSlot::Error => 4,
        }
    }
}

pub struct Process {
    id: ProcessId,
    inner: spin::Mutex<ProcessInner>,
    table: Arc<SyscallTable>,
    refs: AtomicU32,
    stack_size: u64,
    user_max: u64,
}

impl Process {
    pub fn new(config: &KernelConfig, swap: Arc<Swap>, faults: FaultInjector) -> Self {
        Self {
            id: ProcessId::new(),
            inner: spin::Mutex::new(ProcessInner {
                space: AddressSpace::new(swap, faults, config.user_min, config.user_max),
                thread_count: 0,
                upcall_count: 0,
                records: Vec::new(),
                records_created: 0,
                exports: Vec::new(),
                export_pages: Vec::new(),
                tls: TlsImage::default(),
                startup: 0,
                focus: 0,
                ipt_base: config.interface_base,
                contexts: Default::default(),
                exit_value: None,
                exited: false,
                trace: false,
                waiters: Vec::new(),
            }),
            table: Arc::new(SyscallTable::new(config.capability_slots as usize)),
            refs: AtomicU32::new(1),
            stack_size: config.stack_size,
            user_max: config.user_max,
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn table(&self) -> &Arc<SyscallTable> {
        &self.table
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, ProcessInner> {
        self.inner.lock()
    }

    pub fn add_ref(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn release(&self) -> u32 {
        let previous = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| Some(r.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Maps a stack for a new thread and counts the thread
    pub fn attach_thread(&self) -> Result<VirtRange, KernelError> {
        let mut inner = self.inner.lock();
        if inner.exited {
            return Err(KernelError::InvalidArgument(format!("{} has exited", self.id)));
        }
        let stack = inner.map_stack(self.stack_size, self.user_max)?;
        inner.thread_count += 1;
        Ok(stack)
    }

    /// Unmaps a thread's stack and uncounts it; returns the threads left
    pub fn detach_thread(&self, stack: Option<VirtRange>) -> u32 {
        let mut inner = self.inner.lock();
        if let Some(stack) = stack {
            inner.space.unmap(stack.start, stack.end - stack.start);
        }
        inner.thread_count = inner.thread_count.saturating_sub(1);
        inner.thread_count
    }

    pub fn thread_count(&self) -> u32 {
        self.inner.lock().thread_count
    }

    /// Kernel copy out of user memory
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> usize {
        self.inner.lock().space.read(addr, buf)
    }

    /// Kernel copy into user memory
    pub fn write(&self, addr: u64, data: &[u8]) -> usize {
        self.inner.lock().space.write(addr, data)
    }

    pub fn read_word(&self, addr: u64) -> Result<u64, KernelError> {
        let mut buf = [0u8; 8];
        if self.read(addr, &mut buf) != buf.len() {
            return Err(KernelError::MemoryFault { addr });
        }
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_word(&self, addr: u64, word: u64) -> Result<(), KernelError> {
        if self.write(addr, &word.to_le_bytes()) != 8 {
            return Err(KernelError::MemoryFault { addr });
        }
        Ok(())
    }

    pub fn write_words(&self, addr: u64, words: &[u64]) -> Result<(), KernelError> {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        if self.write(addr, &bytes) != bytes.len() {
            return Err(KernelError::MemoryFault { addr });
        }
        Ok(())
    }

    pub fn read_words(&self, addr: u64, count: usize) -> Result<Vec<u64>, KernelError> {
        let mut bytes = vec![0u8; count * WORD_SIZE as usize];
        if self.read(addr, &mut bytes) != bytes.len() {
            return Err(KernelError::MemoryFault { addr });
        }
        Ok(bytes
            .chunks_exact(WORD_SIZE as usize)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                u64::from_le_bytes(word)
            })
            .collect())
    }

    /// Copies the TLS image below `top`; returns the new stack top
    pub fn install_tls(&self, top: u64) -> Result<u64, KernelError> {
        let mut inner = self.inner.lock();
        let tls = inner.tls.clone();
        if tls.size == 0 {
            return Ok(top);
        }
        let align = tls.align.max(WORD_SIZE);
        let start = top
            .checked_sub(tls.size)
            .map(|addr| addr & !(align - 1))
            .ok_or(KernelError::MemoryFault { addr: top })?;
        let mut block = vec![0u8; (top - start) as usize];
        let n = tls.image.len().min(block.len());
        block[..n].copy_from_slice(&tls.image[..n]);
        if inner.space.write(start, &block) != block.len() {
            return Err(KernelError::MemoryFault { addr: start });
        }
        Ok(start)
    }

    pub fn is_valid(&self, addr: u64, len: u64, write: bool) -> bool {
        self.inner.lock().space.is_valid(addr, len, write)
    }

    pub fn ipt_base(&self) -> u64 {
        self.inner.lock().ipt_base
    }

    /// User address of a capability slot
    pub fn slot_address(&self, index: u32) -> u64 {
        self.ipt_base() + u64::from(index) * WORD_SIZE
    }

    /// Capability slot named by a user address, if it is in table range
    pub fn slot_index(&self, addr: u64) -> Option<u32> {
        let base = self.ipt_base();
        let offset = addr.checked_sub(base)?;
        if offset % WORD_SIZE != 0 {
            return None;
        }
        let index = offset / WORD_SIZE;
        if index < self.table.capacity() as u64 {
            Some(index as u32)
        } else {
            None
        }
    }

    /// Publishes an object at an address in the export page
    ///
    /// Exporting the same object under the same interface twice returns the
    /// same address.
    pub fn export(&self, object: Arc<dyn KernelObject>, iid: &str) -> Result<u64, KernelError> {
        let mut inner = self.inner.lock();
        if let Some(export) = inner.exports.iter().find(|e| {
            Arc::as_ptr(&e.object) as *const () == Arc::as_ptr(&object) as *const () && e.iid == iid
        }) {
            return Ok(export.addr);
        }
        let index = inner.exports.len();
        let page = index / EXPORTS_PER_PAGE;
        if page == inner.export_pages.len() {
            let base = inner
                .space
                .map(0, PAGE_SIZE, Protection::READ, MapFlags::PRIVATE, None, 0)?;
            inner.export_pages.push(base);
        }
        let addr = inner.export_pages[page] + ((index % EXPORTS_PER_PAGE) as u64) * WORD_SIZE;
        inner.exports.push(Export {
            addr,
            object,
            iid: iid.to_string(),
        });
        log::debug!("{} exports {} at {:#x}", self.id, iid, addr);
        Ok(addr)
    }

    pub fn export_at(&self, addr: u64) -> Option<Export> {
        self.inner
            .lock()
            .exports
            .iter()
            .find(|e| e.addr == addr)
            .cloned()
    }

    /// Export address of an object, if the process exports it
    pub fn export_address_of(&self, object: &Arc<dyn KernelObject>) -> Option<u64> {
        self.inner
            .lock()
            .exports
            .iter()
            .find(|e| Arc::as_ptr(&e.object) as *const () == Arc::as_ptr(object) as *const ())
            .map(|e| e.addr)
    }

    /// Takes a record from the pool, creating one if the pool is empty
    pub fn take_record(&self, max: usize, faults: &FaultInjector) -> Result<UpcallRecord, KernelError> {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.pop() {
            return Ok(record);
        }
        if inner.records_created as usize >= max || faults.take_record_failure() {
            log::warn!("{}: no upcall record available", self.id);
            return Err(KernelError::ResourceExhausted(Resource::UpcallRecords));
        }
        let stack = inner.map_stack(self.stack_size, self.user_max)?;
        inner.upcall_count += 1;
        inner.records_created += 1;
        Ok(UpcallRecord::new(self.id, stack))
    }

    pub fn put_record(&self, record: UpcallRecord) {
        self.inner.lock().records.push(record);
    }

    /// Records waiting in the pool
    pub fn pooled_records(&self) -> Vec<UpcallRecord> {
        self.inner.lock().records.clone()
    }

    /// Clones a context reference
    pub fn context(&self, slot: ContextSlot) -> Option<ObjectRef> {
        self.inner.lock().contexts[ProcessInner::context_index(slot)].clone()
    }

    /// Replaces a context reference, returning the previous one
    #[must_use]
    pub fn set_context(&self, slot: ContextSlot, object: Option<ObjectRef>) -> Option<ObjectRef> {
        let mut inner = self.inner.lock();
        std::mem::replace(&mut inner.contexts[ProcessInner::context_index(slot)], object)
    }

    pub fn has_exited(&self) -> bool {
        self.inner.lock().exited
    }

    pub fn exit_value(&self) -> Option<i32> {
        self.inner.lock().exit_value
    }

    /// Releases everything the process holds
    pub fn destroy(&self) {
        let (contexts, exports, space_maps) = {
            let mut inner = self.inner.lock();
            let contexts = std::mem::take(&mut inner.contexts);
            let exports = std::mem::take(&mut inner.exports);
            inner.records.clear();
            let maps = inner.space.maps().len();
            inner.space.clear();
            (contexts, exports, maps)
        };
        drop(contexts);
        drop(exports);
        let slots = self.table.force_release_all();
        log::debug!(
            "{} destroyed: {} slots, {} maps released",
            self.id,
            slots,
            space_maps
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::CountingObject;

    fn process() -> Process {
        let config = KernelConfig::default();
        let swap = Arc::new(Swap::new(64, 16, FaultInjector::disabled()));
        Process::new(&config, swap, FaultInjector::disabled())
    }

    #[test]
    fn test_stacks_stride_down_from_user_max() {
        let p = process();
        let config = KernelConfig::default();
        let first = p.attach_thread().unwrap();
        assert_eq!(first.start, config.user_max - config.stack_size);
        assert_eq!(first.end - first.start, config.stack_size - PAGE_SIZE);
        let second = p.attach_thread().unwrap();
        assert_eq!(second.start, config.user_max - 2 * config.stack_size);

        // The search starts past the live stack count and skips taken slots
        assert_eq!(p.detach_thread(Some(first)), 1);
        let third = p.attach_thread().unwrap();
        assert_eq!(third.start, config.user_max - 3 * config.stack_size);
        assert!(!p.is_valid(first.start, 1, false));
    }

    #[test]
    fn test_exited_process_refuses_threads() {
        let p = process();
        p.lock().exited = true;
        assert!(p.attach_thread().is_err());
    }

    #[test]
    fn test_slot_addresses() {
        let p = process();
        let base = p.ipt_base();
        assert_eq!(p.slot_address(3), base + 24);
        assert_eq!(p.slot_index(base + 24), Some(3));
        assert_eq!(p.slot_index(base + 25), None);
        assert_eq!(p.slot_index(base - 8), None);
        assert_eq!(p.slot_index(base + 8 * 100), None);
    }

    #[test]
    fn test_export_addresses_are_stable() {
        let p = process();
        let object: Arc<dyn KernelObject> = Arc::new(CountingObject::new("Interface"));
        let addr = p.export(object.clone(), "Interface").unwrap();
        assert_eq!(p.export(object.clone(), "Interface").unwrap(), addr);
        assert_eq!(p.export_address_of(&object), Some(addr));
        assert!(p.export_at(addr).is_some());
        assert!(p.lock().space.lookup(addr).is_some());
    }

    #[test]
    fn test_record_pool_is_bounded() {
        let p = process();
        let faults = FaultInjector::disabled();
        let a = p.take_record(2, &faults).unwrap();
        let b = p.take_record(2, &faults).unwrap();
        assert_ne!(a.stack, b.stack);
        assert!(matches!(
            p.take_record(2, &faults),
            Err(KernelError::ResourceExhausted(Resource::UpcallRecords))
        ));
        p.put_record(a);
        assert!(p.take_record(2, &faults).is_ok());
        assert_eq!(p.lock().upcall_count, 2);
    }

    #[test]
    fn test_read_write_words() {
        let p = process();
        let addr = p
            .lock()
            .space
            .map(0, PAGE_SIZE, Protection::read_write(), MapFlags::PRIVATE, None, 0)
            .unwrap();
        p.write_word(addr + 8, 0xdead_beef).unwrap();
        assert_eq!(p.read_word(addr + 8), Ok(0xdead_beef));
        assert!(p.read_word(0x10).is_err());
    }

    #[test]
    fn test_tls_image_lands_below_top() {
        let p = process();
        let stack = p.attach_thread().unwrap();
        assert_eq!(p.install_tls(stack.end), Ok(stack.end));

        p.lock().tls = TlsImage {
            image: vec![1, 2, 3],
            size: 20,
            align: 16,
        };
        let top = p.install_tls(stack.end).unwrap();
        assert_eq!(top, stack.end - 32);
        let mut block = [0xffu8; 32];
        assert_eq!(p.read(top, &mut block), 32);
        assert_eq!(&block[..4], &[1, 2, 3, 0]);
        assert!(block[3..].iter().all(|b| *b == 0));
    }
}
