//! Kernel error types

use crate::errno;
use core_types::{MemoryError, SlotError};
use reflect::CatalogError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A bounded kernel resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resource {
    /// Capability slots of one process
    CapabilitySlots,
    /// Global upcall proxy slots
    UpcallSlots,
    /// Pages of swap or backing store
    Memory,
    /// Kernel buffer used to marshal one argument
    MarshalBuffer,
    /// Upcall records of one server process
    UpcallRecords,
}

impl Resource {
    pub fn errno(&self) -> i32 {
        match self {
            Resource::CapabilitySlots => errno::EMFILE,
            Resource::UpcallSlots => errno::ENFILE,
            Resource::Memory | Resource::UpcallRecords => errno::ENOMEM,
            Resource::MarshalBuffer => errno::ENOBUFS,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::CapabilitySlots => write!(f, "capability slots"),
            Resource::UpcallSlots => write!(f, "upcall slots"),
            Resource::Memory => write!(f, "memory"),
            Resource::MarshalBuffer => write!(f, "marshal buffer"),
            Resource::UpcallRecords => write!(f, "upcall records"),
        }
    }
}

/// Errors that can occur when interacting with the kernel
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KernelError {
    /// The capability does not name a live object
    #[error("Bad descriptor: {0}")]
    BadDescriptor(String),

    /// The method number is not declared by the interface chain
    #[error("Interface {interface} has no method {method}")]
    NoSuchMethod { interface: String, method: u32 },

    /// A user pointer failed validation or could not be faulted in
    #[error("Memory fault at {addr:#x}")]
    MemoryFault { addr: u64 },

    /// A bounded resource ran out
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(Resource),

    /// Upcall bookkeeping was found in an unexpected state
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// An argument is malformed
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The calling thread blocked; the call is re-issued once it is woken
    #[error("Operation would block")]
    WouldBlock,

    /// The calling thread was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// A method body failed with its own error number
    #[error("Object error {0}")]
    ObjectError(i32),
}

impl KernelError {
    /// Returns the negative error number placed in the error word
    pub fn errno(&self) -> i32 {
        let code = match self {
            KernelError::BadDescriptor(_) => errno::EBADF,
            KernelError::NoSuchMethod { .. } => errno::ENOSYS,
            KernelError::MemoryFault { .. } => errno::EFAULT,
            KernelError::ResourceExhausted(resource) => resource.errno(),
            KernelError::ProtocolViolation(_) => errno::EPROTO,
            KernelError::InvalidArgument(_) => errno::EINVAL,
            KernelError::WouldBlock => errno::EAGAIN,
            KernelError::Cancelled => errno::ECANCELED,
            KernelError::ObjectError(code) => code.abs(),
        };
        -code
    }

    /// Rebuilds an error from an error word
    ///
    /// Codes without a structured counterpart come back as `ObjectError`.
    pub fn from_errno(code: i32) -> Self {
        match code.abs() {
            errno::EBADF => KernelError::BadDescriptor(String::from("from error word")),
            errno::EFAULT => KernelError::MemoryFault { addr: 0 },
            errno::EMFILE => KernelError::ResourceExhausted(Resource::CapabilitySlots),
            errno::ENFILE => KernelError::ResourceExhausted(Resource::UpcallSlots),
            errno::ENOMEM => KernelError::ResourceExhausted(Resource::Memory),
            errno::ENOBUFS => KernelError::ResourceExhausted(Resource::MarshalBuffer),
            errno::EAGAIN => KernelError::WouldBlock,
            errno::ECANCELED => KernelError::Cancelled,
            other => KernelError::ObjectError(other),
        }
    }
}

impl From<MemoryError> for KernelError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::NotMapped(addr)
            | MemoryError::PermissionDenied { addr, .. }
            | MemoryError::BelowBackedFloor(addr) => KernelError::MemoryFault { addr },
            MemoryError::NoPage(_) => KernelError::ResourceExhausted(Resource::Memory),
            other => KernelError::InvalidArgument(other.to_string()),
        }
    }
}

impl From<SlotError> for KernelError {
    fn from(err: SlotError) -> Self {
        match err {
            SlotError::Full => KernelError::ResourceExhausted(Resource::CapabilitySlots),
            other => KernelError::BadDescriptor(other.to_string()),
        }
    }
}

impl From<CatalogError> for KernelError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NoSuchMethod { interface, method } => {
                KernelError::NoSuchMethod { interface, method }
            }
            CatalogError::UnknownInterface(iid) => KernelError::NoSuchMethod {
                interface: iid,
                method: u32::MAX,
            },
            other => KernelError::InvalidArgument(other.to_string()),
        }
    }
}
