//! # Simulated Kernel
//!
//! This crate provides a simulated implementation of the process and
//! cross-process call layer of the kernel.
//!
//! ## Purpose
//!
//! The simulated kernel allows testing the protection boundary without
//! hardware:
//! - Runs under `cargo test`
//! - Deterministic (ticks instead of wall time, no real concurrency)
//! - Inspectable (page tables, capability tables and audit trails are
//!   reachable from tests)
//!
//! ## Philosophy
//!
//! **Testability is a first-class design constraint.**
//!
//! This is not a "toy" or "mock". Address spaces really fault pages in and
//! copy them on write, capabilities really count references, and an upcall
//! really lays its arguments out on a stack in the server's memory before
//! the server's object sees them.
//!
//! ## Architecture
//!
//! - [`address_space`], [`mmu`], [`swap`], [`pageable`]: paging
//! - [`scheduler`], [`thread`], [`monitor`]: threads and rendezvous
//! - [`process`], [`capability_table`], [`upcall`]: per-process state
//! - [`syscall_gate`], [`upcall_gate`], [`marshal`]: the two dispatchers
//! - [`objects`]: objects the kernel itself hosts
//!
//! ## Example
//!
//! ```
//! use sim_kernel::SimulatedKernel;
//! use kernel_api::{MapRequest, ProcessApi};
//!
//! let mut kernel = SimulatedKernel::new();
//! let (pid, _main) = kernel.create_process().unwrap();
//! let addr = kernel.map(pid, MapRequest::anonymous(0, 8192), None).unwrap();
//! kernel.user_write(pid, addr, b"hello").unwrap();
//! assert_eq!(kernel.user_read(pid, addr, 5).unwrap(), b"hello");
//! ```

pub mod address_space;
pub mod capability_table;
pub mod config;
pub mod fault_injection;
pub mod kernel_audit;
pub mod marshal;
pub mod mmu;
pub mod monitor;
pub mod object;
pub mod objects;
pub mod page;
pub mod pageable;
pub mod process;
pub mod scheduler;
pub mod swap;
pub mod syscall_gate;
pub mod test_utils;
pub mod thread;
pub mod upcall;
pub mod upcall_gate;

use config::{ConfigError, KernelConfig};
use core_types::{MemoryAccessType, ProcessId, ThreadId, PAGE_SIZE};
use fault_injection::{FaultInjector, FaultPlan};
use kernel_api::errno::EFAULT;
use kernel_api::{KernelError, MapRequest, ProcessApi, SyscallOutcome, SyscallRequest};
use kernel_audit::{KernelAuditLog, KernelEvent};
use object::{KernelObject, ObjectRef};
use objects::{ContextObject, CurrentProcessObject, MonitorObject, ThreadObject, CURRENT_PROCESS_INTERFACE};
use pageable::Pageable;
use process::{ContextSlot, Process};
use reflect::{Catalog, InterfaceDescriptor};
use scheduler::{Detached, ExitOutcome, Scheduler, SchedulerConfig, CANCELED_EXIT_VALUE};
use std::collections::HashMap;
use std::sync::Arc;
use swap::Swap;
use thread::{ThreadState, WaitReason};
use upcall::UpcallTable;

/// Simulated kernel state
///
/// Owns every process, the scheduler and the global pools. Unlike a real
/// kernel, this state is directly accessible for testing.
pub struct SimulatedKernel {
    config: KernelConfig,
    catalog: Catalog,
    swap: Arc<Swap>,
    scheduler: Arc<spin::Mutex<Scheduler>>,
    processes: HashMap<ProcessId, Arc<Process>>,
    upcalls: Arc<UpcallTable>,
    /// The name registry every process starts with as root and current
    root_context: Arc<ContextObject>,
    faults: FaultInjector,
    audit: KernelAuditLog,
}

impl SimulatedKernel {
    /// Creates a kernel with the default configuration
    pub fn new() -> Self {
        Self::build(KernelConfig::default())
    }

    /// Creates a kernel with a validated configuration
    pub fn with_config(config: KernelConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: KernelConfig) -> Self {
        let faults = FaultInjector::disabled();
        let swap = Arc::new(Swap::new(
            config.swap_slots_per_block,
            config.swap_max_blocks,
            faults.clone(),
        ));
        let scheduler = Scheduler::with_config(SchedulerConfig {
            cores: config.cores,
            quantum_ticks: config.quantum_ticks,
            max_priority_chain: config.max_priority_chain,
        });
        let mut catalog = Catalog::new();
        for descriptor in objects::builtin_interfaces() {
            if let Err(err) = catalog.register(descriptor) {
                log::error!("built-in interface rejected: {}", err);
            }
        }
        Self {
            upcalls: Arc::new(UpcallTable::new(config.upcall_slots as usize)),
            config,
            catalog,
            swap,
            scheduler: Arc::new(spin::Mutex::new(scheduler)),
            processes: HashMap::new(),
            root_context: Arc::new(ContextObject::new()),
            faults,
            audit: KernelAuditLog::new(),
        }
    }

    /// Arms the faults of `plan`
    ///
    /// The swap pool, every address space and the upcall path share one
    /// injector, so the plan applies to processes created before or after.
    pub fn with_fault_plan(self, plan: &FaultPlan) -> Self {
        self.faults.apply(plan);
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn register_interface(&mut self, descriptor: InterfaceDescriptor) -> Result<(), KernelError> {
        self.catalog.register(descriptor)?;
        Ok(())
    }

    /// Loads interface descriptors from JSON; returns how many were added
    pub fn load_interfaces(&mut self, json: &str) -> Result<usize, KernelError> {
        Ok(self.catalog.load_json(json)?)
    }

    pub fn swap(&self) -> &Arc<Swap> {
        &self.swap
    }

    pub fn upcall_table(&self) -> &Arc<UpcallTable> {
        &self.upcalls
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Locks the scheduler
    ///
    /// Never drop an object reference while the guard is alive: releasing a
    /// thread or monitor object takes this lock again.
    pub fn scheduler(&self) -> spin::MutexGuard<'_, Scheduler> {
        self.scheduler.lock()
    }

    pub fn root_context(&self) -> &Arc<ContextObject> {
        &self.root_context
    }

    pub fn audit_log(&self) -> &KernelAuditLog {
        &self.audit
    }

    pub fn clear_audit_log(&mut self) {
        self.audit.clear();
    }

    pub(crate) fn record(&mut self, event: KernelEvent) {
        let now = self.scheduler.lock().ticks();
        self.audit.record(now, event);
    }

    pub fn now(&self) -> u64 {
        self.scheduler.lock().ticks()
    }

    /// Advances time, waking sleepers
    pub fn tick(&mut self, delta: u64) {
        self.scheduler.lock().tick(delta);
    }

    pub fn process(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.processes.get(&pid).cloned()
    }

    pub fn process_arc(&self, pid: ProcessId) -> Result<Arc<Process>, KernelError> {
        self.process(pid)
            .ok_or_else(|| KernelError::BadDescriptor(format!("no process {}", pid)))
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// Creates a process with a started main thread
    ///
    /// Slot 0 of the new capability table is the process's
    /// `CurrentProcess` object; its root and current contexts are the
    /// kernel's root context. The caller owns one process reference, given
    /// back with [`SimulatedKernel::release_process`].
    pub fn create_process(&mut self) -> Result<(ProcessId, ThreadId), KernelError> {
        let process = Arc::new(Process::new(&self.config, self.swap.clone(), self.faults.clone()));
        let pid = process.id();
        let current: Arc<dyn KernelObject> = Arc::new(CurrentProcessObject::new(pid));
        process
            .table()
            .set(ObjectRef::new(current), CURRENT_PROCESS_INTERFACE, true)?;
        let root: Arc<dyn KernelObject> = self.root_context.clone();
        for slot in [ContextSlot::Root, ContextSlot::Current] {
            let previous = process.set_context(slot, Some(ObjectRef::new(root.clone())));
            drop(previous);
        }
        self.processes.insert(pid, process);
        self.record(KernelEvent::ProcessCreated { process: pid });
        log::debug!("created {}", pid);

        let main = self.spawn_thread(pid, 0, 0)?;
        {
            let mut scheduler = self.scheduler.lock();
            scheduler.start(main)?;
            scheduler.release(main);
        }
        Ok((pid, main))
    }

    fn spawn_thread(&mut self, pid: ProcessId, entry: u64, arg: u64) -> Result<ThreadId, KernelError> {
        let process = self.process_arc(pid)?;
        let stack = process.attach_thread()?;
        let top = match process.install_tls(stack.end) {
            Ok(top) => top,
            Err(err) => {
                process.detach_thread(Some(stack));
                return Err(err);
            }
        };
        let tid = {
            let mut scheduler = self.scheduler.lock();
            let tid = scheduler.create_thread(Some(pid), entry, arg);
            if let Some(thread) = scheduler.get_mut(tid) {
                thread.user_stack = Some(stack);
                thread.frame = vec![0, entry, arg];
            }
            tid
        };
        process.add_ref();
        log::trace!("{} in {}: stack {}, tls top {:#x}", tid, pid, stack, top);
        Ok(tid)
    }

    pub fn start_thread(&mut self, tid: ThreadId) -> Result<(), KernelError> {
        self.scheduler.lock().start(tid)?;
        Ok(())
    }

    /// Wraps the creator's reference on a thread in a `Thread` object
    pub fn thread_object(&self, tid: ThreadId) -> ObjectRef {
        ObjectRef::new(Arc::new(ThreadObject::new(tid, self.scheduler.clone())))
    }

    pub fn create_monitor(&self) -> ObjectRef {
        let monitor = self.scheduler.lock().create_monitor();
        ObjectRef::new(Arc::new(MonitorObject::new(monitor, self.scheduler.clone())))
    }

    pub fn sleep(&mut self, tid: ThreadId, ticks: u64) -> Result<(), KernelError> {
        self.scheduler.lock().sleep(tid, ticks)?;
        Ok(())
    }

    /// Exits the calling thread
    ///
    /// Inside an upcall this returns to the client with `value` as the
    /// call's error code instead.
    pub fn exit_thread(&mut self, tid: ThreadId, value: i32) -> Result<(), KernelError> {
        let outcome = self.scheduler.lock().exit(tid, value)?;
        match outcome {
            ExitOutcome::ReturnedFromUpcall(code) => {
                log::debug!("{} exits from an upcall with {}", tid, code);
            }
            ExitOutcome::Terminated(detached) => self.detach(detached),
        }
        Ok(())
    }

    pub fn cancel_thread(&mut self, tid: ThreadId) -> Result<(), KernelError> {
        let detached = self.scheduler.lock().cancel(tid)?;
        if let Some(detached) = detached {
            self.detach(detached);
        }
        Ok(())
    }

    /// Honours a pending cancellation; true if the thread terminated
    pub fn test_cancel(&mut self, tid: ThreadId) -> Result<bool, KernelError> {
        let detached = self.scheduler.lock().test_cancel(tid)?;
        match detached {
            Some(detached) => {
                self.detach(detached);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes a terminated thread from its process
    ///
    /// Unmaps its stack and drops the process reference held for it. The
    /// last thread out marks the process exited and wakes its waiters.
    fn detach(&mut self, detached: Detached) {
        let pid = match detached.process {
            Some(pid) => pid,
            None => return,
        };
        let process = match self.process(pid) {
            Some(process) => process,
            None => return,
        };
        let remaining = process.detach_thread(detached.user_stack);
        self.record(KernelEvent::ThreadDetached {
            thread: detached.thread,
            process: pid,
        });
        if remaining == 0 {
            let (first_exit, status, waiters) = {
                let mut inner = process.lock();
                let first_exit = !inner.exited;
                inner.exited = true;
                let status = *inner.exit_value.get_or_insert(0);
                (first_exit, status, std::mem::take(&mut inner.waiters))
            };
            if first_exit {
                self.record(KernelEvent::ProcessExited {
                    process: pid,
                    status,
                });
            }
            let mut scheduler = self.scheduler.lock();
            for waiter in waiters {
                scheduler.wake(waiter);
            }
        }
        process.release();
        self.reap(pid);
    }

    /// Destroys a process once it has no threads and no references
    fn reap(&mut self, pid: ProcessId) {
        let done = match self.processes.get(&pid) {
            Some(process) => process.refs() == 0 && process.thread_count() == 0,
            None => false,
        };
        if !done {
            return;
        }
        if let Some(process) = self.processes.remove(&pid) {
            process.destroy();
            self.record(KernelEvent::ProcessDestroyed { process: pid });
            log::debug!("destroyed {}", pid);
        }
    }

    /// Gives back the creator's process reference
    pub fn release_process(&mut self, pid: ProcessId) -> Result<u32, KernelError> {
        let refs = self.process_arc(pid)?.release();
        self.reap(pid);
        Ok(refs)
    }

    /// Exits the calling thread's process
    ///
    /// Every other thread is cancelled asynchronously; one inside an upcall
    /// stops when the upcall returns. The caller terminates immediately.
    pub fn exit_process(&mut self, tid: ThreadId, status: i32) -> Result<(), KernelError> {
        let (pid, in_upcall) = {
            let scheduler = self.scheduler.lock();
            let thread = scheduler
                .get(tid)
                .ok_or_else(|| KernelError::BadDescriptor(format!("no thread {}", tid)))?;
            (thread.current_process, thread.in_upcall())
        };
        if in_upcall {
            return self.exit_thread(tid, status);
        }
        let pid = pid.ok_or_else(|| KernelError::InvalidArgument(format!("{} has no process", tid)))?;
        self.mark_exited(pid, status)?;
        let detached = self.cancel_all(pid, Some(tid));
        for detached in detached {
            self.detach(detached);
        }
        self.exit_thread(tid, status)
    }

    /// Terminates a process from outside
    ///
    /// Cancellation is asynchronous: waiting and runnable threads terminate
    /// at once, others at their next cancellation point.
    pub fn kill_process(&mut self, pid: ProcessId, status: i32) -> Result<(), KernelError> {
        self.mark_exited(pid, status)?;
        let detached = self.cancel_all(pid, None);
        for detached in detached {
            self.detach(detached);
        }
        Ok(())
    }

    fn mark_exited(&mut self, pid: ProcessId, status: i32) -> Result<(), KernelError> {
        let process = self.process_arc(pid)?;
        let first_exit = {
            let mut inner = process.lock();
            let first_exit = !inner.exited;
            if first_exit {
                inner.exited = true;
                inner.exit_value = Some(status);
            }
            first_exit
        };
        if first_exit {
            self.record(KernelEvent::ProcessExited {
                process: pid,
                status,
            });
            log::debug!("{} exits with {}", pid, status);
        }
        Ok(())
    }

    /// Cancels every thread of `pid` but `except`, overriding their cancel state
    fn cancel_all(&mut self, pid: ProcessId, except: Option<ThreadId>) -> Vec<Detached> {
        let mut scheduler = self.scheduler.lock();
        let mut detached = Vec::new();
        for tid in scheduler.threads_of(pid) {
            if Some(tid) == except {
                continue;
            }
            let result = match scheduler.state(tid) {
                Some(ThreadState::New) => scheduler
                    .exit(tid, CANCELED_EXIT_VALUE)
                    .map(|outcome| match outcome {
                        ExitOutcome::Terminated(d) => Some(d),
                        ExitOutcome::ReturnedFromUpcall(_) => None,
                    }),
                Some(ThreadState::Terminated) | None => continue,
                Some(_) => scheduler
                    .set_cancel_state(tid, true)
                    .and_then(|_| scheduler.set_cancel_type(tid, true))
                    .and_then(|_| scheduler.cancel(tid)),
            };
            match result {
                Ok(Some(d)) => detached.push(d),
                Ok(None) => {}
                Err(err) => log::warn!("cancelling {}: {}", tid, err),
            }
        }
        detached
    }

    /// Waits for a process to exit and lose its last thread
    ///
    /// Returns `WouldBlock` after blocking the caller; re-issue once woken.
    pub fn wait_process(&mut self, tid: ThreadId, pid: ProcessId) -> Result<i32, KernelError> {
        let process = self.process_arc(pid)?;
        {
            let mut inner = process.lock();
            if inner.exited && inner.thread_count == 0 {
                return Ok(inner.exit_value.unwrap_or(0));
            }
            if !inner.waiters.contains(&tid) {
                inner.waiters.push(tid);
            }
        }
        if let Err(err) = self.scheduler.lock().block(tid, WaitReason::Process(pid)) {
            process.lock().waiters.retain(|t| *t != tid);
            return Err(err.into());
        }
        Err(KernelError::WouldBlock)
    }

    pub fn has_exited(&self, pid: ProcessId) -> Result<bool, KernelError> {
        Ok(self.process_arc(pid)?.has_exited())
    }

    pub fn exit_value(&self, pid: ProcessId) -> Result<Option<i32>, KernelError> {
        Ok(self.process_arc(pid)?.exit_value())
    }

    /// Publishes a kernel-side object as implemented by `pid`
    ///
    /// Returns the export address other processes pass to reach it.
    pub fn export(
        &mut self,
        pid: ProcessId,
        object: Arc<dyn KernelObject>,
        iid: &str,
    ) -> Result<u64, KernelError> {
        if !self.catalog.contains(iid) {
            return Err(KernelError::InvalidArgument(format!("unknown interface {}", iid)));
        }
        self.process_arc(pid)?.export(object, iid)
    }

    /// Installs a capability in `pid`'s table; returns its slot address
    pub fn grant(&mut self, pid: ProcessId, object: ObjectRef, iid: &str) -> Result<u64, KernelError> {
        let process = self.process_arc(pid)?;
        let index = process.table().set(object, iid, true)?;
        self.record(KernelEvent::SlotSet {
            process: pid,
            slot: index,
            iid: iid.to_string(),
        });
        Ok(process.slot_address(index))
    }

    /// Performs one user-mode access, resolving faults like the hardware trap
    ///
    /// A fault that cannot be resolved kills the process.
    pub fn user_access(
        &mut self,
        pid: ProcessId,
        addr: u64,
        access: MemoryAccessType,
    ) -> Result<(), KernelError> {
        let process = self.process_arc(pid)?;
        let result = {
            let mut inner = process.lock();
            if !inner.space.would_fault(addr, access) {
                return Ok(());
            }
            let result = inner.space.touch(addr, access);
            if result.is_err() {
                inner.space.dump();
            }
            result
        };
        self.record(KernelEvent::PageFault {
            process: pid,
            addr,
            access,
            resolved: result.is_ok(),
        });
        if let Err(err) = result {
            log::warn!("{}: unresolved fault at {:#x}: {}", pid, addr, err);
            self.record(KernelEvent::ProcessKilled { process: pid, addr });
            self.kill_process(pid, -EFAULT)?;
            return Err(KernelError::MemoryFault { addr });
        }
        Ok(())
    }

    fn touch_range(
        &mut self,
        pid: ProcessId,
        addr: u64,
        len: usize,
        access: MemoryAccessType,
    ) -> Result<(), KernelError> {
        if len == 0 {
            return Ok(());
        }
        let end = addr
            .checked_add(len as u64)
            .ok_or(KernelError::MemoryFault { addr })?;
        let mut page = core_types::page_trunc(addr);
        while page < end {
            self.user_access(pid, page.max(addr), access)?;
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// Reads user memory the way user code would
    pub fn user_read(&mut self, pid: ProcessId, addr: u64, len: usize) -> Result<Vec<u8>, KernelError> {
        self.touch_range(pid, addr, len, MemoryAccessType::Read)?;
        let mut buf = vec![0u8; len];
        let n = self.process_arc(pid)?.read(addr, &mut buf);
        buf.truncate(n);
        Ok(buf)
    }

    /// Writes user memory the way user code would
    pub fn user_write(&mut self, pid: ProcessId, addr: u64, data: &[u8]) -> Result<(), KernelError> {
        self.touch_range(pid, addr, data.len(), MemoryAccessType::Write)?;
        let n = self.process_arc(pid)?.write(addr, data);
        if n != data.len() {
            return Err(KernelError::MemoryFault { addr: addr + n as u64 });
        }
        Ok(())
    }

    /// `returnFromUpcall` issued by user code
    ///
    /// The dispatcher completes the return when the server's method body
    /// finishes; with no upcall in flight this is a no-op.
    pub fn return_from_upcall(&mut self, tid: ThreadId) -> bool {
        let in_upcall = self
            .scheduler
            .lock()
            .innermost_upcall(tid)
            .is_some();
        if !in_upcall {
            log::debug!("{}: stray return from upcall", tid);
            self.record(KernelEvent::StrayReturn { thread: tid });
        }
        in_upcall
    }
}

impl Default for SimulatedKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessApi for SimulatedKernel {
    type Pageable = dyn Pageable;

    fn map(
        &mut self,
        process: ProcessId,
        request: MapRequest,
        pageable: Option<Arc<dyn Pageable>>,
    ) -> Result<u64, KernelError> {
        let process = self.process_arc(process)?;
        let addr = process.lock().space.map(
            request.addr,
            request.length,
            request.prot,
            request.flags,
            pageable,
            request.offset,
        )?;
        Ok(addr)
    }

    fn unmap(&mut self, process: ProcessId, addr: u64, length: u64) -> Result<(), KernelError> {
        self.process_arc(process)?.lock().space.unmap(addr, length);
        Ok(())
    }

    fn set_break(&mut self, process: ProcessId, increment: i64) -> Result<u64, KernelError> {
        let previous = self.process_arc(process)?.lock().space.set_break(increment)?;
        Ok(previous)
    }

    fn create_thread(
        &mut self,
        process: ProcessId,
        entry: u64,
        arg: u64,
    ) -> Result<ThreadId, KernelError> {
        self.spawn_thread(process, entry, arg)
    }

    fn system_call(&mut self, thread: ThreadId, request: SyscallRequest) -> SyscallOutcome {
        self.dispatch_system_call(thread, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::CountingObject;
    use core_types::{MapFlags, Protection};

    #[test]
    fn test_create_process_bootstraps_slot_zero() {
        let mut kernel = SimulatedKernel::new();
        let (pid, main) = kernel.create_process().unwrap();
        let process = kernel.process(pid).unwrap();
        assert_eq!(process.table().iid(0).as_deref(), Some(CURRENT_PROCESS_INTERFACE));
        assert_eq!(process.table().uses(0), 1);
        assert_eq!(process.thread_count(), 1);
        assert_eq!(kernel.scheduler().state(main), Some(ThreadState::Runnable));
        assert!(process.context(ContextSlot::Root).is_some());
        assert!(kernel
            .audit_log()
            .has_event(|e| matches!(e, KernelEvent::ProcessCreated { process } if *process == pid)));
    }

    #[test]
    fn test_thread_stacks_are_private_per_process() {
        let mut kernel = SimulatedKernel::new();
        let (a, _) = kernel.create_process().unwrap();
        let (b, _) = kernel.create_process().unwrap();
        let ta = kernel.create_thread(a, 0x1000, 1).unwrap();
        let stack = kernel.scheduler().get(ta).unwrap().user_stack.unwrap();
        assert!(kernel.process(a).unwrap().is_valid(stack.start, PAGE_SIZE, true));
        assert!(!kernel.process(b).unwrap().is_valid(stack.start, PAGE_SIZE, true));
        assert_eq!(kernel.scheduler().get(ta).unwrap().frame, vec![0, 0x1000, 1]);
    }

    #[test]
    fn test_last_thread_exit_ends_process() {
        let mut kernel = SimulatedKernel::new();
        let (pid, main) = kernel.create_process().unwrap();
        kernel.exit_thread(main, 3).unwrap();
        assert!(kernel.has_exited(pid).unwrap());
        assert_eq!(kernel.exit_value(pid).unwrap(), Some(0));
        assert_eq!(kernel.process(pid).unwrap().thread_count(), 0);

        kernel.release_process(pid).unwrap();
        assert!(kernel.process(pid).is_none());
        assert!(kernel
            .audit_log()
            .has_event(|e| matches!(e, KernelEvent::ProcessDestroyed { process } if *process == pid)));
    }

    #[test]
    fn test_exit_process_cancels_other_threads() {
        let mut kernel = SimulatedKernel::new();
        let (pid, main) = kernel.create_process().unwrap();
        let worker = kernel.create_thread(pid, 0x2000, 0).unwrap();
        kernel.start_thread(worker).unwrap();
        kernel.sleep(worker, 100).unwrap();
        let idle = kernel.create_thread(pid, 0x3000, 0).unwrap();

        kernel.exit_process(main, 7).unwrap();
        assert_eq!(kernel.exit_value(pid).unwrap(), Some(7));
        assert_eq!(kernel.scheduler().state(worker), Some(ThreadState::Terminated));
        assert_eq!(kernel.scheduler().get(worker).and_then(|t| t.exit_value), Some(CANCELED_EXIT_VALUE));
        assert_eq!(kernel.scheduler().state(idle), Some(ThreadState::Terminated));
        assert_eq!(kernel.process(pid).unwrap().thread_count(), 0);
        assert!(kernel.create_thread(pid, 0x4000, 0).is_err());
    }

    #[test]
    fn test_wait_process_blocks_until_exit() {
        let mut kernel = SimulatedKernel::new();
        let (parent, waiter) = kernel.create_process().unwrap();
        let (child, child_main) = kernel.create_process().unwrap();

        assert_eq!(kernel.wait_process(waiter, child), Err(KernelError::WouldBlock));
        assert_eq!(kernel.scheduler().state(waiter), Some(ThreadState::Waiting));

        kernel.exit_process(child_main, 42).unwrap();
        assert_eq!(kernel.scheduler().state(waiter), Some(ThreadState::Runnable));
        assert_eq!(kernel.wait_process(waiter, child), Ok(42));
        assert!(kernel.process(parent).is_some());
    }

    #[test]
    fn test_unresolved_fault_kills_process() {
        let mut kernel = SimulatedKernel::new();
        let (pid, main) = kernel.create_process().unwrap();
        let result = kernel.user_access(pid, 0x10_0000, MemoryAccessType::Read);
        assert_eq!(result, Err(KernelError::MemoryFault { addr: 0x10_0000 }));
        assert_eq!(kernel.exit_value(pid).unwrap(), Some(-EFAULT));
        assert_eq!(kernel.scheduler().state(main), None);
        assert!(kernel
            .audit_log()
            .has_event(|e| matches!(e, KernelEvent::ProcessKilled { .. })));
    }

    #[test]
    fn test_map_through_process_api() {
        let mut kernel = SimulatedKernel::new();
        let (pid, _) = kernel.create_process().unwrap();
        let request = MapRequest::anonymous(0, 2 * PAGE_SIZE)
            .with_prot(Protection::READ)
            .with_flags(MapFlags::PRIVATE);
        let addr = kernel.map(pid, request, None).unwrap();
        assert!(kernel.user_read(pid, addr, 16).unwrap().iter().all(|b| *b == 0));
        assert!(kernel.user_write(pid, addr, b"x").is_err());
        assert!(kernel.has_exited(pid).unwrap());
    }

    #[test]
    fn test_resident_access_records_no_fault() {
        let mut kernel = SimulatedKernel::new();
        let (pid, _) = kernel.create_process().unwrap();
        let request = MapRequest::anonymous(0, PAGE_SIZE).with_flags(MapFlags::PRIVATE);
        let addr = kernel.map(pid, request, None).unwrap();

        kernel.user_access(pid, addr, MemoryAccessType::Write).unwrap();
        kernel.user_access(pid, addr, MemoryAccessType::Read).unwrap();
        kernel.user_access(pid, addr + 8, MemoryAccessType::Write).unwrap();
        let faults = kernel
            .audit_log()
            .events()
            .iter()
            .filter(|e| matches!(e.event, KernelEvent::PageFault { .. }))
            .count();
        assert_eq!(faults, 1);
    }

    #[test]
    fn test_stray_return_from_upcall_is_recorded() {
        let mut kernel = SimulatedKernel::new();
        let (_, main) = kernel.create_process().unwrap();
        assert!(!kernel.return_from_upcall(main));
        assert_eq!(
            kernel
                .audit_log()
                .count_events(|e| matches!(e, KernelEvent::StrayReturn { .. })),
            1
        );
    }

    #[test]
    fn test_export_requires_known_interface() {
        let mut kernel = SimulatedKernel::new();
        let (pid, _) = kernel.create_process().unwrap();
        let object: Arc<dyn KernelObject> = Arc::new(CountingObject::new("Interface"));
        assert!(kernel.export(pid, object.clone(), "Nope").is_err());
        let addr = kernel.export(pid, object, "Interface").unwrap();
        assert!(kernel.process(pid).unwrap().export_at(addr).is_some());
    }
}
