//! Kernel objects and object references
//!
//! Everything a capability can name implements [`KernelObject`]. Objects
//! carry their own reference count, separate from Rust ownership: the count
//! is what user code observes through `addRef`/`release`, while the `Arc`
//! only keeps the memory alive.
//!
//! An [`ObjectRef`] is one counted reference. It either points at an object
//! hosted in the kernel or at an upcall proxy slot standing for an object
//! exported by another process. Cloning an `ObjectRef` takes a reference
//! and dropping it gives the reference back, so a reference can never leak
//! past the value that holds it.
//!
//! ## Example
//!
//! ```
//! use sim_kernel::object::ObjectRef;
//! use sim_kernel::test_utils::CountingObject;
//! use std::sync::Arc;
//!
//! let object = Arc::new(CountingObject::new("Interface"));
//! let first = ObjectRef::new(object.clone());
//! let second = first.clone();
//! assert_eq!(object.count(), 2);
//! drop(first);
//! drop(second);
//! assert_eq!(object.count(), 0);
//! ```

use crate::pageable::Pageable;
use crate::upcall::UpcallRef;
use crate::SimulatedKernel;
use core_types::{ProcessId, ThreadId};
use kernel_api::KernelError;
use reflect::{Catalog, MethodSignature};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// A decoded argument or result carrying kernel object references
pub type Value = reflect::Value<ObjectRef>;

/// An object reachable through a capability
pub trait KernelObject: Send + Sync {
    /// Most derived interface the object implements
    fn interface_id(&self) -> &str;

    fn add_ref(&self) -> u32;

    fn release(&self) -> u32;

    /// Returns true if the object can be used as `iid`
    fn query_interface(&self, iid: &str, catalog: &Catalog) -> bool {
        catalog.is_derived_from(self.interface_id(), iid)
    }

    /// Runs a method declared by the object's interface chain
    ///
    /// Root methods never reach this; they are handled by the dispatcher.
    fn invoke(&self, call: &mut MethodCall<'_>) -> Result<Value, KernelError>;

    /// The pages behind the object, if it can back a mapping
    fn as_pageable(&self) -> Option<Arc<dyn Pageable>> {
        None
    }
}

/// An atomic reference count for kernel objects
#[derive(Debug)]
pub struct RefCount(AtomicU32);

impl RefCount {
    pub fn new(initial: u32) -> Self {
        Self(AtomicU32::new(initial))
    }

    pub fn add_ref(&self) -> u32 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements, saturating at zero; returns the new count
    pub fn release(&self) -> u32 {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return 0;
            }
            match self.0.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current - 1,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new(0)
    }
}

/// One counted reference to an object
pub enum ObjectRef {
    Kernel(Arc<dyn KernelObject>),
    Upcall(UpcallRef),
}

impl ObjectRef {
    /// Takes a new reference on a kernel object
    pub fn new(object: Arc<dyn KernelObject>) -> Self {
        object.add_ref();
        ObjectRef::Kernel(object)
    }

    /// Wraps an object whose reference was already counted
    pub fn adopt(object: Arc<dyn KernelObject>) -> Self {
        ObjectRef::Kernel(object)
    }

    pub fn kernel(&self) -> Option<&Arc<dyn KernelObject>> {
        match self {
            ObjectRef::Kernel(object) => Some(object),
            ObjectRef::Upcall(_) => None,
        }
    }

    pub fn upcall(&self) -> Option<&UpcallRef> {
        match self {
            ObjectRef::Upcall(proxy) => Some(proxy),
            ObjectRef::Kernel(_) => None,
        }
    }

    /// True if both references name the same object or proxy slot
    pub fn same_object(&self, other: &ObjectRef) -> bool {
        match (self, other) {
            (ObjectRef::Kernel(a), ObjectRef::Kernel(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            (ObjectRef::Upcall(a), ObjectRef::Upcall(b)) => a.same_slot(b),
            _ => false,
        }
    }

    /// True if this references exactly `object`
    pub fn is(&self, object: &Arc<dyn KernelObject>) -> bool {
        match self {
            ObjectRef::Kernel(a) => Arc::as_ptr(a) as *const () == Arc::as_ptr(object) as *const (),
            ObjectRef::Upcall(_) => false,
        }
    }
}

impl Clone for ObjectRef {
    fn clone(&self) -> Self {
        match self {
            ObjectRef::Kernel(object) => ObjectRef::new(object.clone()),
            ObjectRef::Upcall(proxy) => ObjectRef::Upcall(proxy.clone()),
        }
    }
}

impl Drop for ObjectRef {
    fn drop(&mut self) {
        if let ObjectRef::Kernel(object) = self {
            object.release();
        }
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.same_object(other)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectRef::Kernel(object) => f
                .debug_tuple("Kernel")
                .field(&object.interface_id())
                .finish(),
            ObjectRef::Upcall(proxy) => f.debug_tuple("Upcall").field(&proxy.handle()).finish(),
        }
    }
}

/// One method invocation handed to a kernel object
pub struct MethodCall<'a> {
    pub kernel: &'a mut SimulatedKernel,
    pub thread: ThreadId,
    /// Process the call is made on behalf of
    pub process: ProcessId,
    pub method: &'a MethodSignature,
    pub args: &'a mut Vec<Value>,
}

impl<'a> MethodCall<'a> {
    pub fn name(&self) -> &str {
        &self.method.name
    }

    pub fn arg(&self, index: usize) -> Result<&Value, KernelError> {
        self.args
            .get(index)
            .ok_or_else(|| KernelError::InvalidArgument(format!("missing argument {}", index)))
    }

    pub fn arg_u64(&self, index: usize) -> Result<u64, KernelError> {
        self.arg(index)?
            .as_u64()
            .ok_or_else(|| bad_argument(index, "an integer"))
    }

    pub fn arg_i64(&self, index: usize) -> Result<i64, KernelError> {
        self.arg(index)?
            .as_i64()
            .ok_or_else(|| bad_argument(index, "an integer"))
    }

    pub fn arg_bool(&self, index: usize) -> Result<bool, KernelError> {
        match self.arg(index)? {
            Value::Bool(v) => Ok(*v),
            _ => Err(bad_argument(index, "a bool")),
        }
    }

    pub fn arg_str(&self, index: usize) -> Result<&str, KernelError> {
        self.arg(index)?
            .as_str()
            .ok_or_else(|| bad_argument(index, "a string"))
    }

    /// Clones the object reference passed at `index`
    pub fn arg_object(&self, index: usize) -> Result<Option<ObjectRef>, KernelError> {
        self.arg(index)?
            .as_object()
            .cloned()
            .ok_or_else(|| bad_argument(index, "an interface pointer"))
    }

    /// Replaces the contents of an output buffer
    pub fn set_output(&mut self, index: usize, bytes: Vec<u8>) -> Result<(), KernelError> {
        match self.args.get_mut(index) {
            Some(Value::Bytes(buffer)) => {
                let n = bytes.len().min(buffer.len());
                buffer[..n].copy_from_slice(&bytes[..n]);
                Ok(())
            }
            _ => Err(bad_argument(index, "a buffer")),
        }
    }

    pub fn unknown_method(&self, interface: &str) -> KernelError {
        KernelError::InvalidArgument(format!("{} does not implement {}", interface, self.name()))
    }
}

fn bad_argument(index: usize, expected: &str) -> KernelError {
    KernelError::InvalidArgument(format!("argument {} is not {}", index, expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::CountingObject;

    #[test]
    fn test_ref_count_saturates() {
        let count = RefCount::new(1);
        assert_eq!(count.add_ref(), 2);
        assert_eq!(count.release(), 1);
        assert_eq!(count.release(), 0);
        assert_eq!(count.release(), 0);
    }

    #[test]
    fn test_adopt_does_not_count() {
        let object = Arc::new(CountingObject::new("Interface"));
        object.add_ref();
        let adopted = ObjectRef::adopt(object.clone());
        assert_eq!(object.count(), 1);
        drop(adopted);
        assert_eq!(object.count(), 0);
    }

    #[test]
    fn test_same_object() {
        let a: Arc<dyn KernelObject> = Arc::new(CountingObject::new("Interface"));
        let b: Arc<dyn KernelObject> = Arc::new(CountingObject::new("Interface"));
        let ra = ObjectRef::new(a.clone());
        let rb = ObjectRef::new(b);
        assert_eq!(ra, ra.clone());
        assert_ne!(ra, rb);
        assert!(ra.is(&a));
    }
}
