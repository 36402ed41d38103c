//! Resilience Test Utilities
//!
//! Shared helpers for the integration suites under `tests/`.
//!
//! ## Test Philosophy
//!
//! - **Everything through the gate**: tests drive the kernel with system
//!   calls the way user code would, not by poking at internals
//! - **Deterministic failures**: faults are reproducible via `FaultPlan`
//! - **No reference leaks**: every slot, proxy and record a test creates
//!   must be accounted for when it is done

use core_types::{MapFlags, ProcessId, Protection, ThreadId};
use kernel_api::KernelError;
use sim_kernel::address_space::FaultStats;
use sim_kernel::object::ObjectRef;
use sim_kernel::objects::{PageableObject, CURRENT_PROCESS_INTERFACE, PAGEABLE_INTERFACE, THREAD_INTERFACE};
use sim_kernel::pageable::Pageable;
use sim_kernel::test_utils::call;
use sim_kernel::SimulatedKernel;
use std::sync::Arc;

pub use sim_kernel::test_utils::{two_processes, TwoProcesses, COUNTER_INTERFACE};

/// A kernel with one process
pub fn boot() -> (SimulatedKernel, ProcessId, ThreadId) {
    let mut kernel = SimulatedKernel::new();
    let (pid, main) = kernel
        .create_process()
        .unwrap_or_else(|err| panic!("bootstrap failed: {}", err));
    (kernel, pid, main)
}

/// Address of the `CurrentProcess` slot
pub fn slot0(kernel: &SimulatedKernel, pid: ProcessId) -> u64 {
    kernel
        .process(pid)
        .map(|p| p.slot_address(0))
        .unwrap_or_else(|| panic!("no process {}", pid))
}

/// Issues a system call and turns the error word into a `Result`
pub fn syscall(
    kernel: &mut SimulatedKernel,
    thread: ThreadId,
    slot: u64,
    iid: &str,
    method: &str,
    args: &[u64],
) -> Result<u64, KernelError> {
    call(kernel, thread, slot, iid, method, args).into_result()
}

/// Creates and starts a thread through `CurrentProcess.createThread`
///
/// Returns the new thread and the address of its `Thread` slot.
pub fn spawn(
    kernel: &mut SimulatedKernel,
    pid: ProcessId,
    caller: ThreadId,
) -> Result<(ThreadId, u64), KernelError> {
    let before = kernel.scheduler().threads_of(pid);
    let slot = slot0(kernel, pid);
    let thread_slot = syscall(kernel, caller, slot, CURRENT_PROCESS_INTERFACE, "createThread", &[0x1000, 0])?;
    let tid = kernel
        .scheduler()
        .threads_of(pid)
        .into_iter()
        .find(|t| !before.contains(t))
        .ok_or_else(|| KernelError::InvalidArgument("no new thread".to_string()))?;
    syscall(kernel, caller, thread_slot, THREAD_INTERFACE, "start", &[])?;
    Ok((tid, thread_slot))
}

/// Maps `length` bytes through `CurrentProcess.map`
pub fn map(
    kernel: &mut SimulatedKernel,
    pid: ProcessId,
    thread: ThreadId,
    length: u64,
    prot: Protection,
    flags: MapFlags,
    pageable: u64,
) -> Result<u64, KernelError> {
    let slot = slot0(kernel, pid);
    syscall(
        kernel,
        thread,
        slot,
        CURRENT_PROCESS_INTERFACE,
        "map",
        &[0, length, u64::from(prot.bits()), u64::from(flags.bits()), pageable, 0],
    )
}

/// Hands `pid` a capability for a backing object; returns its slot address
pub fn grant_pageable(
    kernel: &mut SimulatedKernel,
    pid: ProcessId,
    pageable: Arc<dyn Pageable>,
) -> Result<u64, KernelError> {
    let object = ObjectRef::new(Arc::new(PageableObject::new(pageable)));
    kernel.grant(pid, object, PAGEABLE_INTERFACE)
}

pub fn fault_stats(kernel: &SimulatedKernel, pid: ProcessId) -> FaultStats {
    kernel
        .process(pid)
        .map(|p| p.lock().space.stats())
        .unwrap_or_default()
}

/// The audit log as JSON, for failure messages
pub fn audit_json(kernel: &SimulatedKernel) -> String {
    serde_json::to_string_pretty(kernel.audit_log().events()).unwrap_or_default()
}
