//! Process operations and the system call convention

use crate::KernelError;
use core_types::{MapFlags, ProcessId, Protection, ThreadId, WORD_SIZE};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Arguments of a `map` request
///
/// `addr` is a hint unless `flags` contains `FIXED`, in which case the range
/// must be free and inside the user address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapRequest {
    pub addr: u64,
    pub length: u64,
    pub prot: Protection,
    pub flags: MapFlags,
    /// Byte offset into the backing object
    pub offset: u64,
}

impl MapRequest {
    /// Anonymous private read-write memory
    pub fn anonymous(addr: u64, length: u64) -> Self {
        Self {
            addr,
            length,
            prot: Protection::read_write(),
            flags: MapFlags::PRIVATE,
            offset: 0,
        }
    }

    pub fn with_prot(mut self, prot: Protection) -> Self {
        self.prot = prot;
        self
    }

    pub fn with_flags(mut self, flags: MapFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }
}

/// One word-level system call
///
/// `self_ptr` is `base + slot * WORD_SIZE` for an ordinary call. A value
/// outside the table range is the address of a variant return slot, and the
/// real interface pointer is then the first argument word.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallRequest {
    pub self_ptr: u64,
    pub method: u32,
    pub args: Vec<u64>,
    /// Base of the caller's interface table, 0 to reuse the cached base
    pub base: u64,
}

impl SyscallRequest {
    /// Builds a call on the given slot of a table at `base`
    pub fn new(base: u64, slot: u32, method: u32) -> Self {
        Self {
            self_ptr: base + slot as u64 * WORD_SIZE,
            method,
            args: Vec::new(),
            base,
        }
    }

    pub fn arg(mut self, word: u64) -> Self {
        self.args.push(word);
        self
    }

    pub fn args(mut self, words: &[u64]) -> Self {
        self.args.extend_from_slice(words);
        self
    }
}

/// Result and error words handed back to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyscallOutcome {
    pub result: u64,
    /// Zero on success, a negative error number otherwise
    pub error: i32,
}

impl SyscallOutcome {
    pub fn ok(result: u64) -> Self {
        Self { result, error: 0 }
    }

    pub fn err(error: &KernelError) -> Self {
        Self {
            result: 0,
            error: error.errno(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error == 0
    }

    pub fn into_result(self) -> Result<u64, KernelError> {
        if self.error == 0 {
            Ok(self.result)
        } else {
            Err(KernelError::from_errno(self.error))
        }
    }
}

impl From<Result<u64, KernelError>> for SyscallOutcome {
    fn from(result: Result<u64, KernelError>) -> Self {
        match result {
            Ok(word) => SyscallOutcome::ok(word),
            Err(err) => SyscallOutcome::err(&err),
        }
    }
}

/// The process-level kernel API
///
/// # Example
///
/// ```ignore
/// use kernel_api::{MapRequest, ProcessApi};
///
/// fn heap<K: ProcessApi>(kernel: &mut K, process: core_types::ProcessId) {
///     let addr = kernel.map(process, MapRequest::anonymous(0, 8192), None).unwrap();
///     kernel.unmap(process, addr, 8192).unwrap();
/// }
/// ```
pub trait ProcessApi {
    /// Backing object type accepted by `map`
    type Pageable: ?Sized;

    /// Maps a range, returning its start address
    fn map(
        &mut self,
        process: ProcessId,
        request: MapRequest,
        pageable: Option<Arc<Self::Pageable>>,
    ) -> Result<u64, KernelError>;

    /// Unmaps every page touching `[addr, addr + length)`
    fn unmap(&mut self, process: ProcessId, addr: u64, length: u64) -> Result<(), KernelError>;

    /// Moves the break by `increment`, returning the previous break
    fn set_break(&mut self, process: ProcessId, increment: i64) -> Result<u64, KernelError>;

    /// Creates a thread that will run `entry(arg)` once started
    fn create_thread(
        &mut self,
        process: ProcessId,
        entry: u64,
        arg: u64,
    ) -> Result<ThreadId, KernelError>;

    /// Issues a system call on behalf of `thread`
    fn system_call(&mut self, thread: ThreadId, request: SyscallRequest) -> SyscallOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_self_pointer() {
        let request = SyscallRequest::new(0x7fe0_0000, 3, 4).arg(1).arg(2);
        assert_eq!(request.self_ptr, 0x7fe0_0018);
        assert_eq!(request.args, vec![1, 2]);
    }

    #[test]
    fn test_outcome_from_result() {
        let ok: SyscallOutcome = Ok(7).into();
        assert!(ok.is_ok());
        assert_eq!(ok.into_result(), Ok(7));

        let err: SyscallOutcome = Err(KernelError::Cancelled).into();
        assert!(!err.is_ok());
        assert_eq!(err.into_result(), Err(KernelError::Cancelled));
    }

    #[test]
    fn test_map_request_serializes() {
        let request = MapRequest::anonymous(0x1000, 4096).with_flags(MapFlags::PRIVATE | MapFlags::FIXED);
        let json = serde_json::to_string(&request).unwrap();
        let back: MapRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
    }
}
