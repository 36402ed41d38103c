//! Upcall proxies and records
//!
//! The upcall broker is one global table of [`UpcallRef`] targets. A slot
//! stands for an object exported by a server process, addressed in that
//! process by its export address. Client capability tables hold
//! `ObjectRef::Upcall` references to these slots.
//!
//! A slot has its own reference count and a `used` flag. The first user
//! `addRef` marks the slot used and passes through to the server object;
//! the release that drops the last reference of a used slot passes through
//! as well. Internal copies of a reference only touch the slot count.
//!
//! An [`UpcallRecord`] is the suspended context of one cross-process call.
//! Records are pooled per server process and move `Init -> Ready` once the
//! server's runtime has been started on the record's stack.

use crate::object::KernelObject;
use core_types::{ProcessId, SlotError, SlotHandle, VirtRange};
use kernel_api::{KernelError, Resource};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Default)]
struct UpcallProxy {
    refs: u32,
    used: bool,
    generation: u32,
    process: Option<ProcessId>,
    object: Option<Arc<dyn KernelObject>>,
    addr: u64,
    iid: String,
}

/// A snapshot of one live upcall slot
#[derive(Clone)]
pub struct UpcallEntry {
    pub process: ProcessId,
    pub object: Arc<dyn KernelObject>,
    /// Export address of the object in the server
    pub addr: u64,
    pub iid: String,
    pub refs: u32,
    pub used: bool,
}

impl fmt::Debug for UpcallEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpcallEntry")
            .field("process", &self.process)
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("iid", &self.iid)
            .field("refs", &self.refs)
            .field("used", &self.used)
            .finish()
    }
}

/// The global upcall proxy table
pub struct UpcallTable {
    slots: spin::Mutex<Vec<UpcallProxy>>,
}

impl UpcallTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: spin::Mutex::new((0..capacity).map(|_| UpcallProxy::default()).collect()),
        }
    }

    /// Allocates a slot for an exported object
    ///
    /// The returned reference is the slot's only reference; the slot starts
    /// unused.
    pub fn set(
        self: &Arc<Self>,
        process: ProcessId,
        object: Arc<dyn KernelObject>,
        addr: u64,
        iid: &str,
    ) -> Result<UpcallRef, KernelError> {
        let mut slots = self.slots.lock();
        let index = slots
            .iter()
            .position(|s| s.refs == 0)
            .ok_or(KernelError::ResourceExhausted(Resource::UpcallSlots))?;
        let slot = &mut slots[index];
        slot.refs = 1;
        slot.used = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.process = Some(process);
        slot.object = Some(object);
        slot.addr = addr;
        slot.iid = iid.to_string();
        let handle = SlotHandle::new(index as u32, slot.generation);
        drop(slots);
        log::trace!("upcall {} -> {} at {:#x}", handle, process, addr);
        Ok(UpcallRef {
            table: self.clone(),
            handle,
        })
    }

    pub fn get(&self, handle: SlotHandle) -> Result<UpcallEntry, KernelError> {
        let slots = self.slots.lock();
        let slot = live(&slots, handle)?;
        match (slot.process, &slot.object) {
            (Some(process), Some(object)) => Ok(UpcallEntry {
                process,
                object: object.clone(),
                addr: slot.addr,
                iid: slot.iid.clone(),
                refs: slot.refs,
                used: slot.used,
            }),
            _ => Err(SlotError::Empty(handle.index()).into()),
        }
    }

    /// Adds a user reference; the first one passes through to the object
    pub fn add_ref(&self, handle: SlotHandle) -> Result<u32, KernelError> {
        let (refs, first) = {
            let mut slots = self.slots.lock();
            let slot = live_mut(&mut slots, handle)?;
            slot.refs += 1;
            let first = if slot.used {
                None
            } else {
                slot.used = true;
                slot.object.clone()
            };
            (slot.refs, first)
        };
        if let Some(object) = first {
            object.add_ref();
        }
        Ok(refs)
    }

    fn retain(&self, handle: SlotHandle) {
        let mut slots = self.slots.lock();
        if let Ok(slot) = live_mut(&mut slots, handle) {
            slot.refs += 1;
        }
    }

    /// Marks the slot as held by a user capability
    ///
    /// The first time this passes an `addRef` through to the object; the
    /// slot's own count is unchanged.
    pub fn mark_used(&self, handle: SlotHandle) -> Result<(), KernelError> {
        let first = {
            let mut slots = self.slots.lock();
            let slot = live_mut(&mut slots, handle)?;
            if slot.used {
                None
            } else {
                slot.used = true;
                slot.object.clone()
            }
        };
        if let Some(object) = first {
            object.add_ref();
        }
        Ok(())
    }

    /// Drops a reference; returns the remaining count
    ///
    /// Dropping the last reference of a used slot releases the object.
    pub fn release(&self, handle: SlotHandle) -> u32 {
        let (refs, freed, pass_through) = {
            let mut slots = self.slots.lock();
            let slot = match live_mut(&mut slots, handle) {
                Ok(slot) => slot,
                Err(_) => return 0,
            };
            slot.refs -= 1;
            if slot.refs > 0 {
                (slot.refs, None, false)
            } else {
                let used = slot.used;
                slot.used = false;
                slot.process = None;
                slot.iid.clear();
                (0, slot.object.take(), used)
            }
        };
        if let Some(object) = freed {
            if pass_through {
                object.release();
            }
            log::trace!("upcall {} freed", handle);
        }
        refs
    }

    pub fn refs(&self, handle: SlotHandle) -> u32 {
        let slots = self.slots.lock();
        live(&slots, handle).map(|s| s.refs).unwrap_or(0)
    }

    pub fn in_use(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.refs > 0).count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }
}

fn live(slots: &[UpcallProxy], handle: SlotHandle) -> Result<&UpcallProxy, KernelError> {
    let slot = slots
        .get(handle.index() as usize)
        .ok_or(SlotError::OutOfRange(handle.index()))?;
    if slot.refs == 0 {
        return Err(SlotError::Empty(handle.index()).into());
    }
    if slot.generation != handle.generation() {
        return Err(SlotError::Stale {
            index: handle.index(),
            generation: handle.generation(),
        }
        .into());
    }
    Ok(slot)
}

fn live_mut(slots: &mut [UpcallProxy], handle: SlotHandle) -> Result<&mut UpcallProxy, KernelError> {
    live(slots, handle)?;
    Ok(&mut slots[handle.index() as usize])
}

/// One counted reference to an upcall slot
pub struct UpcallRef {
    table: Arc<UpcallTable>,
    handle: SlotHandle,
}

impl UpcallRef {
    pub fn handle(&self) -> SlotHandle {
        self.handle
    }

    pub fn entry(&self) -> Result<UpcallEntry, KernelError> {
        self.table.get(self.handle)
    }

    pub fn same_slot(&self, other: &UpcallRef) -> bool {
        Arc::ptr_eq(&self.table, &other.table) && self.handle == other.handle
    }
}

impl Clone for UpcallRef {
    fn clone(&self) -> Self {
        self.table.retain(self.handle);
        Self {
            table: self.table.clone(),
            handle: self.handle,
        }
    }
}

impl Drop for UpcallRef {
    fn drop(&mut self) {
        self.table.release(self.handle);
    }
}

/// State of an upcall record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    /// The server's runtime has not yet run on this record's stack
    Init,
    /// Ready to carry a call
    Ready,
}

/// Where a server-side output buffer is copied back from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputCopy {
    /// Index of the parameter in the client's argument list
    pub index: usize,
    pub server_addr: u64,
    pub size: usize,
}

/// Suspended context of one cross-process call
#[derive(Debug, Clone)]
pub struct UpcallRecord {
    pub state: RecordState,
    pub server: ProcessId,
    /// User stack mapped in the server for this record
    pub stack: VirtRange,
    /// Stack top left once the runtime has been set up
    pub top: u64,
    pub sp: u64,
    pub client: Option<ProcessId>,
    pub method: Option<String>,
    /// Words the dispatch stub decodes
    pub frame: Vec<u64>,
    pub result: u64,
    pub error: i32,
    pub returned: bool,
    pub outputs: Vec<OutputCopy>,
    /// Server capability slots created for the call's arguments
    pub temp_slots: Vec<u32>,
}

impl UpcallRecord {
    pub fn new(server: ProcessId, stack: VirtRange) -> Self {
        Self {
            state: RecordState::Init,
            server,
            stack,
            top: stack.end,
            sp: stack.end,
            client: None,
            method: None,
            frame: Vec::new(),
            result: 0,
            error: 0,
            returned: false,
            outputs: Vec::new(),
            temp_slots: Vec::new(),
        }
    }

    /// Clears the state of the last call, keeping the record ready
    pub fn clear_call(&mut self) {
        self.sp = self.top;
        self.client = None;
        self.method = None;
        self.frame.clear();
        self.result = 0;
        self.error = 0;
        self.returned = false;
        self.outputs.clear();
        self.temp_slots.clear();
    }

    /// Puts the record back to `Init`
    pub fn reset(&mut self) {
        self.top = self.stack.end;
        self.clear_call();
        self.state = RecordState::Init;
    }

    /// True if no call state is left behind
    pub fn is_clear(&self) -> bool {
        self.client.is_none()
            && self.method.is_none()
            && self.frame.is_empty()
            && self.result == 0
            && self.error == 0
            && !self.returned
            && self.outputs.is_empty()
            && self.temp_slots.is_empty()
            && self.sp == self.top
    }

    /// Reserves `size` bytes below the stack pointer, word aligned
    pub fn push(&mut self, size: u64) -> Result<u64, KernelError> {
        let size = size.div_ceil(8) * 8;
        let sp = self
            .sp
            .checked_sub(size)
            .filter(|sp| *sp >= self.stack.start)
            .ok_or(KernelError::ResourceExhausted(Resource::MarshalBuffer))?;
        self.sp = sp;
        Ok(sp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::CountingObject;

    fn table() -> Arc<UpcallTable> {
        Arc::new(UpcallTable::new(2))
    }

    #[test]
    fn test_unused_release_does_not_pass_through() {
        let table = table();
        let object = Arc::new(CountingObject::new("Interface"));
        let proxy = table
            .set(ProcessId::new(), object.clone(), 0x1000, "Interface")
            .unwrap();
        assert_eq!(table.in_use(), 1);
        let copy = proxy.clone();
        assert_eq!(table.refs(proxy.handle()), 2);
        drop(copy);
        drop(proxy);
        assert_eq!(table.in_use(), 0);
        assert_eq!(object.releases(), 0);
    }

    #[test]
    fn test_first_add_ref_and_last_release_pass_through() {
        let table = table();
        let object = Arc::new(CountingObject::new("Interface"));
        let proxy = table
            .set(ProcessId::new(), object.clone(), 0x1000, "Interface")
            .unwrap();
        let handle = proxy.handle();
        assert_eq!(table.add_ref(handle), Ok(2));
        assert_eq!(table.add_ref(handle), Ok(3));
        assert_eq!(object.count(), 1);
        table.mark_used(handle).unwrap();
        assert_eq!(object.count(), 1);
        assert_eq!(table.refs(handle), 3);

        assert_eq!(table.release(handle), 2);
        assert_eq!(table.release(handle), 1);
        assert_eq!(object.count(), 1);
        drop(proxy);
        assert_eq!(object.count(), 0);
        assert!(table.get(handle).is_err());
    }

    #[test]
    fn test_full_table_and_stale_handles() {
        let table = table();
        let object = Arc::new(CountingObject::new("Interface"));
        let a = table.set(ProcessId::new(), object.clone(), 1, "Interface").unwrap();
        let _b = table.set(ProcessId::new(), object.clone(), 2, "Interface").unwrap();
        assert!(matches!(
            table.set(ProcessId::new(), object.clone(), 3, "Interface"),
            Err(KernelError::ResourceExhausted(Resource::UpcallSlots))
        ));
        let stale = a.handle();
        drop(a);
        let _c = table.set(ProcessId::new(), object, 3, "Interface").unwrap();
        assert!(matches!(table.get(stale), Err(KernelError::BadDescriptor(_))));
    }

    #[test]
    fn test_record_push_and_reset() {
        let stack = VirtRange {
            start: 0x10000,
            end: 0x12000,
        };
        let mut record = UpcallRecord::new(ProcessId::new(), stack);
        assert!(record.is_clear());
        assert_eq!(record.push(5), Ok(0x11ff8));
        record.client = Some(ProcessId::new());
        record.state = RecordState::Ready;
        record.clear_call();
        assert!(record.is_clear());
        assert_eq!(record.state, RecordState::Ready);
        assert!(record.push(0x3000).is_err());
        record.top = 0x11000;
        record.clear_call();
        assert_eq!(record.sp, 0x11000);
        record.reset();
        assert_eq!(record.state, RecordState::Init);
        assert_eq!(record.sp, stack.end);
    }
}
