//! Per-process capability table
//!
//! Each slot is one syscall proxy: a reference to a kernel object plus the
//! interface it was handed out as. User code names a slot by its address
//! `base + index * WORD`, never by a pointer.
//!
//! Two counts live on a slot:
//!
//! - `refs`: proxy references. The slot and its object reference stay alive
//!   while it is non-zero; pins taken by an in-flight call count here.
//! - `uses`: user-level references. The first use adds one proxy reference
//!   and the last use gives it back, so the slot holds its object exactly
//!   while any user holds the capability.
//!
//! Object references are never dropped while the table lock is held.

use crate::object::ObjectRef;
use core_types::{SlotError, SlotHandle};
use kernel_api::{KernelError, Resource};
use std::sync::Arc;

#[derive(Default)]
struct Slot {
    refs: u32,
    uses: u32,
    generation: u32,
    object: Option<ObjectRef>,
    iid: String,
}

/// A fixed-capacity table of syscall proxies
pub struct SyscallTable {
    slots: spin::Mutex<Vec<Slot>>,
}

impl SyscallTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: spin::Mutex::new((0..capacity).map(|_| Slot::default()).collect()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Stores an object in the first free slot
    ///
    /// With `used` the slot starts with one user reference. When the table
    /// is full the object reference is released before the error returns.
    pub fn set(&self, object: ObjectRef, iid: &str, used: bool) -> Result<u32, KernelError> {
        let rejected = {
            let mut slots = self.slots.lock();
            match slots.iter().position(|s| s.object.is_none() && s.refs == 0) {
                Some(index) => {
                    let slot = &mut slots[index];
                    slot.refs = 1;
                    slot.uses = used as u32;
                    slot.generation = slot.generation.wrapping_add(1);
                    slot.object = Some(object);
                    slot.iid = iid.to_string();
                    return Ok(index as u32);
                }
                None => object,
            }
        };
        drop(rejected);
        log::warn!("capability table full");
        Err(KernelError::ResourceExhausted(Resource::CapabilitySlots))
    }

    /// Finds a live slot holding `object`
    pub fn find(&self, object: &ObjectRef) -> Option<u32> {
        let slots = self.slots.lock();
        slots
            .iter()
            .position(|s| s.refs > 0 && s.object.as_ref().map(|o| o.same_object(object)) == Some(true))
            .map(|i| i as u32)
    }

    /// Pins a slot for the duration of a call
    pub fn pin(self: &Arc<Self>, index: u32) -> Result<SlotPin, KernelError> {
        let (object, iid, generation) = {
            let mut slots = self.slots.lock();
            let slot = slots
                .get_mut(index as usize)
                .ok_or(SlotError::OutOfRange(index))?;
            let object = match &slot.object {
                Some(object) if slot.refs > 0 => object.clone(),
                _ => return Err(SlotError::Empty(index).into()),
            };
            slot.refs += 1;
            (object, slot.iid.clone(), slot.generation)
        };
        Ok(SlotPin {
            table: self.clone(),
            handle: SlotHandle::new(index, generation),
            object,
            iid,
        })
    }

    /// Adds a user reference; returns the new use count
    pub fn add_user(&self, index: u32) -> Result<u32, KernelError> {
        let mut slots = self.slots.lock();
        let slot = live_slot(&mut slots, index)?;
        slot.uses += 1;
        if slot.uses == 1 {
            slot.refs += 1;
        }
        Ok(slot.uses)
    }

    /// Drops a user reference; returns the new use count
    pub fn release_user(&self, index: u32) -> Result<u32, KernelError> {
        let uses = {
            let mut slots = self.slots.lock();
            let slot = live_slot(&mut slots, index)?;
            if slot.uses == 0 {
                return Err(KernelError::BadDescriptor(format!(
                    "slot {} has no users",
                    index
                )));
            }
            slot.uses -= 1;
            slot.uses
        };
        if uses == 0 {
            self.release(index);
        }
        Ok(uses)
    }

    /// Drops a proxy reference; the last one frees the slot
    pub fn release(&self, index: u32) -> u32 {
        let (refs, freed) = {
            let mut slots = self.slots.lock();
            let slot = match slots.get_mut(index as usize) {
                Some(slot) if slot.refs > 0 => slot,
                _ => return 0,
            };
            slot.refs -= 1;
            if slot.refs == 0 {
                slot.uses = 0;
                slot.iid.clear();
                (0, slot.object.take())
            } else {
                (slot.refs, None)
            }
        };
        if freed.is_some() {
            log::trace!("capability slot {} freed", index);
        }
        drop(freed);
        refs
    }

    fn release_pinned(&self, handle: SlotHandle) {
        let current = {
            let slots = self.slots.lock();
            slots
                .get(handle.index() as usize)
                .map(|s| s.generation == handle.generation())
                .unwrap_or(false)
        };
        if current {
            self.release(handle.index());
        }
    }

    /// Clones the object in a slot
    pub fn get(&self, index: u32) -> Option<ObjectRef> {
        let slots = self.slots.lock();
        slots
            .get(index as usize)
            .filter(|s| s.refs > 0)
            .and_then(|s| s.object.clone())
    }

    pub fn iid(&self, index: u32) -> Option<String> {
        let slots = self.slots.lock();
        slots
            .get(index as usize)
            .filter(|s| s.refs > 0)
            .map(|s| s.iid.clone())
    }

    pub fn uses(&self, index: u32) -> u32 {
        self.slots
            .lock()
            .get(index as usize)
            .map(|s| s.uses)
            .unwrap_or(0)
    }

    pub fn refs(&self, index: u32) -> u32 {
        self.slots
            .lock()
            .get(index as usize)
            .map(|s| s.refs)
            .unwrap_or(0)
    }

    pub fn handle(&self, index: u32) -> Option<SlotHandle> {
        let slots = self.slots.lock();
        slots
            .get(index as usize)
            .filter(|s| s.refs > 0)
            .map(|s| SlotHandle::new(index, s.generation))
    }

    /// Number of live slots
    pub fn in_use(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.refs > 0).count()
    }

    /// Frees every slot regardless of its counts
    pub fn force_release_all(&self) -> usize {
        let objects: Vec<ObjectRef> = {
            let mut slots = self.slots.lock();
            slots
                .iter_mut()
                .filter_map(|slot| {
                    slot.refs = 0;
                    slot.uses = 0;
                    slot.iid.clear();
                    slot.object.take()
                })
                .collect()
        };
        let count = objects.len();
        drop(objects);
        count
    }
}

fn live_slot(slots: &mut [Slot], index: u32) -> Result<&mut Slot, KernelError> {
    match slots.get_mut(index as usize) {
        Some(slot) if slot.refs > 0 && slot.object.is_some() => Ok(slot),
        Some(_) => Err(SlotError::Empty(index).into()),
        None => Err(SlotError::OutOfRange(index).into()),
    }
}

/// A slot held alive for one call
///
/// Dropping the pin gives back its proxy reference.
pub struct SlotPin {
    table: Arc<SyscallTable>,
    handle: SlotHandle,
    object: ObjectRef,
    iid: String,
}

impl SlotPin {
    pub fn index(&self) -> u32 {
        self.handle.index()
    }

    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    pub fn iid(&self) -> &str {
        &self.iid
    }
}

impl Drop for SlotPin {
    fn drop(&mut self) {
        self.table.release_pinned(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::KernelObject;
    use crate::test_utils::CountingObject;

    fn object() -> (Arc<CountingObject>, ObjectRef) {
        let object = Arc::new(CountingObject::new("Interface"));
        let reference = ObjectRef::new(object.clone() as Arc<dyn KernelObject>);
        (object, reference)
    }

    #[test]
    fn test_kernel_reference_held_while_used() {
        let table = SyscallTable::new(4);
        let (object, reference) = object();
        let slot = table.set(reference, "Interface", true).unwrap();
        assert_eq!(object.count(), 1);

        assert_eq!(table.add_user(slot), Ok(2));
        assert_eq!(object.count(), 1);
        assert_eq!(table.release_user(slot), Ok(1));
        assert_eq!(object.count(), 1);
        assert_eq!(table.release_user(slot), Ok(0));
        assert_eq!(object.count(), 0);
        assert_eq!(table.in_use(), 0);
        assert!(table.release_user(slot).is_err());
    }

    #[test]
    fn test_unused_slot_released_explicitly() {
        let table = SyscallTable::new(4);
        let (object, reference) = object();
        let slot = table.set(reference, "Interface", false).unwrap();
        assert_eq!(table.uses(slot), 0);
        table.add_user(slot).unwrap();
        assert_eq!(table.refs(slot), 2);
        table.release(slot);
        assert_eq!(object.count(), 1);
        table.release_user(slot).unwrap();
        assert_eq!(object.count(), 0);
    }

    #[test]
    fn test_full_table_releases_object() {
        let table = SyscallTable::new(1);
        let (_, first) = object();
        table.set(first, "Interface", true).unwrap();
        let (second, reference) = object();
        assert_eq!(
            table.set(reference, "Interface", true),
            Err(KernelError::ResourceExhausted(Resource::CapabilitySlots))
        );
        assert_eq!(second.count(), 0);
    }

    #[test]
    fn test_pin_keeps_slot_alive() {
        let table = Arc::new(SyscallTable::new(2));
        let (object, reference) = object();
        let slot = table.set(reference, "Interface", true).unwrap();
        let pin = table.pin(slot).unwrap();
        assert_eq!(pin.iid(), "Interface");
        table.release_user(slot).unwrap();
        assert_eq!(table.in_use(), 1);
        drop(pin);
        assert_eq!(table.in_use(), 0);
        assert_eq!(object.count(), 0);
        assert!(table.pin(slot).is_err());
        assert!(table.pin(9).is_err());
    }

    #[test]
    fn test_find_and_force_release() {
        let table = SyscallTable::new(3);
        let (object, reference) = object();
        let slot = table.set(reference.clone(), "Interface", true).unwrap();
        assert_eq!(table.find(&reference), Some(slot));
        drop(reference);
        assert_eq!(table.force_release_all(), 1);
        assert_eq!(object.count(), 0);
        assert_eq!(table.find(&ObjectRef::new(object.clone())), None);
    }
}
