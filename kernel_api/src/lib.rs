//! # Kernel API
//!
//! This crate defines the boundary between user-level code and the kernel:
//! the error taxonomy every call can fail with, the word-level system call
//! convention, and the process operations the kernel exposes.
//!
//! ## Philosophy
//!
//! The kernel provides **mechanisms**, not policies:
//! - Address-space mapping (not file I/O)
//! - Capability slots (never raw object pointers)
//! - Reflected method dispatch (not hand-written system call stubs)
//! - Synchronous cross-process calls (not message queues)
//!
//! ## Design Goals
//!
//! 1. **Testability**: The entire API can be driven from tests
//! 2. **Explicitness**: Every failure has a stable error code
//! 3. **Isolation**: A caller can only name what its own table holds
//!
//! ## Non-Goals
//!
//! This is NOT:
//! - POSIX (no fork, exec, signals, files)
//! - The binary ABI of a particular CPU

pub mod errno;
pub mod error;
pub mod kernel;

pub use error::{KernelError, Resource};
pub use kernel::{MapRequest, ProcessApi, SyscallOutcome, SyscallRequest};
