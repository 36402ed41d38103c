//! System call gate
//!
//! The single entry from user mode into the kernel. A call names a slot of
//! the caller's interface table and a method number; the gate resolves the
//! method through the catalog, decodes the argument words against its
//! signature and hands the call to the object behind the slot.
//!
//! ```text
//! self_ptr ──► slot ──► (object, iid) ──► catalog.resolve(iid, method)
//!                                              │
//!                    kernel object ◄── invoke ─┴─ upcall ──► server process
//! ```
//!
//! The root methods `queryInterface`, `addRef` and `release` act on the
//! slot itself and never reach the object. Errors come back as a negative
//! error number in the error word; the result word is then zero.

use crate::kernel_audit::KernelEvent;
use crate::marshal::{Marshaller, Side};
use crate::object::{MethodCall, ObjectRef};
use crate::objects::MONITOR_INTERFACE;
use crate::process::Process;
use crate::thread::ThreadState;
use crate::SimulatedKernel;
use core_types::{ProcessId, ThreadId, WORD_SIZE};
use kernel_api::{KernelError, SyscallOutcome, SyscallRequest};
use reflect::{ResolvedMethod, RootMethod, TypeSpec};
use std::sync::Arc;

/// What the audit log records about a call
#[derive(Default)]
struct Trace {
    process: Option<ProcessId>,
    slot: u32,
    method: String,
}

impl SimulatedKernel {
    pub(crate) fn dispatch_system_call(&mut self, thread: ThreadId, request: SyscallRequest) -> SyscallOutcome {
        let mut trace = Trace::default();
        let result = self.enter_gate(thread, &request, &mut trace);
        if let Err(err) = &result {
            match err {
                KernelError::WouldBlock => log::trace!("{}: {} blocks", thread, trace.method),
                _ => log::debug!("{}: {} failed: {}", thread, trace.method, err),
            }
        }
        if let Some(process) = trace.process {
            self.record(KernelEvent::SystemCall {
                process,
                thread,
                slot: trace.slot,
                method: trace.method,
                errno: result.as_ref().err().map(|e| e.errno()).unwrap_or(0),
            });
        }
        SyscallOutcome::from(result)
    }

    fn enter_gate(
        &mut self,
        tid: ThreadId,
        request: &SyscallRequest,
        trace: &mut Trace,
    ) -> Result<u64, KernelError> {
        match self.scheduler.lock().state(tid) {
            Some(ThreadState::Waiting) => return Err(KernelError::WouldBlock),
            Some(ThreadState::Terminated) | None => {
                return Err(KernelError::InvalidArgument(format!("{} cannot call", tid)))
            }
            Some(_) => {}
        }
        if self.test_cancel(tid)? {
            return Err(KernelError::Cancelled);
        }
        let pid = self
            .scheduler
            .lock()
            .get(tid)
            .and_then(|t| t.current_process)
            .ok_or_else(|| KernelError::InvalidArgument(format!("{} has no process", tid)))?;
        let process = self.process_arc(pid)?;
        trace.process = Some(pid);

        if request.self_ptr % WORD_SIZE != 0 || request.base % WORD_SIZE != 0 {
            return Err(KernelError::BadDescriptor(format!(
                "misaligned interface pointer {:#x}",
                request.self_ptr
            )));
        }
        if request.base != 0 {
            process.lock().ipt_base = request.base;
        }

        // A pointer outside the table is a variant slot; the interface
        // pointer then leads the argument words.
        let (self_word, variant_slot, words) = match process.slot_index(request.self_ptr) {
            Some(_) => (request.self_ptr, None, &request.args[..]),
            None => match request.args.split_first() {
                Some((first, rest)) => (*first, Some(request.self_ptr), rest),
                None => {
                    return Err(KernelError::BadDescriptor(format!(
                        "{:#x} is not an interface pointer",
                        request.self_ptr
                    )))
                }
            },
        };
        let index = process.slot_index(self_word).ok_or_else(|| {
            KernelError::BadDescriptor(format!("{:#x} is not an interface pointer", self_word))
        })?;
        trace.slot = index;
        let pin = process.table().pin(index)?;
        let resolved = self.catalog.resolve(pin.iid(), request.method)?;
        trace.method = format!("{}.{}", resolved.interface, resolved.signature.name);

        if (resolved.signature.returns == TypeSpec::Any) != variant_slot.is_some() {
            return Err(KernelError::BadDescriptor(format!(
                "{} needs {} variant slot",
                trace.method,
                if variant_slot.is_some() { "no" } else { "a" }
            )));
        }
        if process.lock().trace {
            log::debug!("{} in {}: {} on slot {}", tid, pid, trace.method, index);
        } else {
            log::trace!("{} in {}: {} on slot {}", tid, pid, trace.method, index);
        }

        if let Some(root) = resolved.root_method() {
            return self.root_call(&process, index, pin.object(), root, words);
        }

        let upcalls = self.upcalls.clone();
        let mut marshaller = Marshaller::new(&process, &upcalls, self.config.max_marshal_bytes, Side::Caller);
        let mut decoded = marshaller.decode_call(&resolved.signature, variant_slot, words)?;

        let target = pin.object().clone();
        let value = match &target {
            ObjectRef::Kernel(object) => {
                let mut call = MethodCall {
                    kernel: self,
                    thread: tid,
                    process: pid,
                    method: &resolved.signature,
                    args: &mut decoded.args,
                };
                object.invoke(&mut call)
            }
            ObjectRef::Upcall(proxy) => self.upcall(tid, proxy, &resolved, &decoded.ret, &mut decoded.args),
        }?;
        drop(target);

        marshaller.write_outputs(&decoded.outputs, &decoded.args)?;
        let word = marshaller.encode_result(&resolved.signature, &decoded.ret, &decoded.args, value);
        for slot in marshaller.take_new_slots() {
            let iid = process.table().iid(slot).unwrap_or_default();
            self.record(KernelEvent::SlotSet { process: pid, slot, iid });
        }
        let word = word?;

        if pin.iid() == MONITOR_INTERFACE {
            self.track_monitor_hold(&process, index, &resolved, word)?;
        }
        drop(pin);
        Ok(word)
    }

    fn root_call(
        &mut self,
        process: &Arc<Process>,
        index: u32,
        object: &ObjectRef,
        root: RootMethod,
        words: &[u64],
    ) -> Result<u64, KernelError> {
        let table = process.table();
        match root {
            RootMethod::AddRef => table.add_user(index).map(u64::from),
            RootMethod::Release => {
                let uses = table.release_user(index)?;
                if uses == 0 {
                    self.record(KernelEvent::SlotReleased {
                        process: process.id(),
                        slot: index,
                    });
                }
                Ok(u64::from(uses))
            }
            RootMethod::QueryInterface => {
                let addr = words
                    .first()
                    .copied()
                    .ok_or_else(|| KernelError::InvalidArgument("queryInterface needs an iid".to_string()))?;
                let upcalls = self.upcalls.clone();
                let mut marshaller =
                    Marshaller::new(process, &upcalls, self.config.max_marshal_bytes, Side::Caller);
                let iid = marshaller.read_string(addr)?;
                if !self.catalog.contains(&iid) {
                    return Ok(0);
                }
                let found = match object {
                    ObjectRef::Kernel(kernel_object) => {
                        if kernel_object.query_interface(&iid, &self.catalog) {
                            Some(object.clone())
                        } else {
                            None
                        }
                    }
                    ObjectRef::Upcall(proxy) => {
                        let entry = proxy.entry()?;
                        self.query_upcall(&entry, &iid)?.map(ObjectRef::Upcall)
                    }
                };
                let word = marshaller.encode_object(found, &iid)?;
                for slot in marshaller.take_new_slots() {
                    self.record(KernelEvent::SlotSet {
                        process: process.id(),
                        slot,
                        iid: iid.clone(),
                    });
                }
                Ok(word)
            }
        }
    }

    /// Keeps a monitor's slot in use while the caller holds the monitor
    fn track_monitor_hold(
        &mut self,
        process: &Process,
        index: u32,
        resolved: &ResolvedMethod,
        word: u64,
    ) -> Result<(), KernelError> {
        let table = process.table();
        match resolved.signature.name.as_str() {
            "lock" => {
                table.add_user(index)?;
            }
            "tryLock" if word == 1 => {
                table.add_user(index)?;
            }
            "unlock" => {
                table.release_user(index)?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{CURRENT_PROCESS_INTERFACE, THREAD_INTERFACE};
    use crate::test_utils::{call, put_str, scratch_page};
    use kernel_api::{errno, ProcessApi};
    use reflect::ROOT_INTERFACE;

    fn booted() -> (SimulatedKernel, ProcessId, ThreadId, u64) {
        let mut kernel = SimulatedKernel::new();
        let (pid, main) = kernel.create_process().unwrap();
        let slot0 = kernel.process(pid).unwrap().slot_address(0);
        (kernel, pid, main, slot0)
    }

    #[test]
    fn test_kernel_method_through_slot_zero() {
        let (mut kernel, pid, main, slot0) = booted();
        let mapped = call(&mut kernel, main, slot0, CURRENT_PROCESS_INTERFACE, "map", &[0, 8192, 0x3, 0x2, 0, 0]);
        assert!(mapped.is_ok());
        assert!(kernel.process(pid).unwrap().is_valid(mapped.result, 8192, false));
        assert!(kernel.audit_log().has_event(|e| matches!(
            e,
            KernelEvent::SystemCall { process, errno: 0, .. } if *process == pid
        )));

        let bad = call(&mut kernel, main, slot0, CURRENT_PROCESS_INTERFACE, "map", &[0, 8192, 0x80, 0x2, 0, 0]);
        assert_eq!(bad.error, -errno::EINVAL);
    }

    #[test]
    fn test_unknown_method_number() {
        let (mut kernel, _, main, slot0) = booted();
        let outcome = kernel.system_call(main, SyscallRequest { self_ptr: slot0, method: 999, args: vec![], base: 0 });
        assert_eq!(outcome.error, -errno::ENOSYS);
        assert_eq!(outcome.result, 0);
    }

    #[test]
    fn test_misaligned_pointer_is_bad_descriptor() {
        let (mut kernel, _, main, slot0) = booted();
        let outcome = kernel.system_call(main, SyscallRequest { self_ptr: slot0 + 3, method: 0, args: vec![], base: 0 });
        assert_eq!(outcome.error, -errno::EBADF);
    }

    #[test]
    fn test_empty_slot_is_bad_descriptor() {
        let (mut kernel, _, main, slot0) = booted();
        let outcome = call(&mut kernel, main, slot0 + 5 * WORD_SIZE, ROOT_INTERFACE, "addRef", &[]);
        assert_eq!(outcome.error, -errno::EBADF);
    }

    #[test]
    fn test_release_frees_slot() {
        let (mut kernel, pid, main, slot0) = booted();
        let outcome = call(&mut kernel, main, slot0, CURRENT_PROCESS_INTERFACE, "createThread", &[0x1000, 0]);
        let thread_slot = outcome.result;
        assert!(kernel.process(pid).unwrap().slot_index(thread_slot).is_some());

        assert_eq!(call(&mut kernel, main, thread_slot, ROOT_INTERFACE, "addRef", &[]).result, 2);
        assert_eq!(call(&mut kernel, main, thread_slot, ROOT_INTERFACE, "release", &[]).result, 1);
        assert_eq!(call(&mut kernel, main, thread_slot, ROOT_INTERFACE, "release", &[]).result, 0);
        let again = call(&mut kernel, main, thread_slot, THREAD_INTERFACE, "getState", &[]);
        assert_eq!(again.error, -errno::EBADF);
    }

    #[test]
    fn test_query_interface() {
        let (mut kernel, pid, main, slot0) = booted();
        let page = scratch_page(&mut kernel, pid).unwrap();
        let thread = call(&mut kernel, main, slot0, CURRENT_PROCESS_INTERFACE, "createThread", &[0x1000, 0]).result;

        put_str(&kernel, pid, page, "Monitor").unwrap();
        let miss = call(&mut kernel, main, thread, ROOT_INTERFACE, "queryInterface", &[page]);
        assert_eq!(miss, SyscallOutcome::ok(0));

        put_str(&kernel, pid, page, "NoSuchInterface").unwrap();
        let unknown = call(&mut kernel, main, thread, ROOT_INTERFACE, "queryInterface", &[page]);
        assert_eq!(unknown, SyscallOutcome::ok(0));

        put_str(&kernel, pid, page, ROOT_INTERFACE).unwrap();
        let hit = call(&mut kernel, main, thread, ROOT_INTERFACE, "queryInterface", &[page]);
        assert!(hit.is_ok());
        assert_ne!(hit.result, thread);
        let process = kernel.process(pid).unwrap();
        let index = process.slot_index(hit.result).unwrap();
        assert_eq!(process.table().iid(index).as_deref(), Some(ROOT_INTERFACE));
    }

    #[test]
    fn test_waiting_thread_cannot_call() {
        let (mut kernel, _, main, slot0) = booted();
        let slept = call(&mut kernel, main, slot0, CURRENT_PROCESS_INTERFACE, "sleep", &[10]);
        assert!(slept.is_ok());
        let blocked = call(&mut kernel, main, slot0, CURRENT_PROCESS_INTERFACE, "getNow", &[]);
        assert_eq!(blocked.error, -errno::EAGAIN);
    }

    #[test]
    fn test_monitor_contention_blocks() {
        let (mut kernel, pid, main, slot0) = booted();
        let other = kernel.create_thread(pid, 0x2000, 0).unwrap();
        kernel.start_thread(other).unwrap();
        let monitor = call(&mut kernel, main, slot0, CURRENT_PROCESS_INTERFACE, "createMonitor", &[]).result;

        assert!(call(&mut kernel, main, monitor, MONITOR_INTERFACE, "lock", &[]).is_ok());
        let process = kernel.process(pid).unwrap();
        let index = process.slot_index(monitor).unwrap();
        assert_eq!(process.table().uses(index), 2);

        let contended = call(&mut kernel, other, monitor, MONITOR_INTERFACE, "lock", &[]);
        assert_eq!(contended.error, -errno::EAGAIN);
        assert_eq!(kernel.scheduler().state(other), Some(ThreadState::Waiting));

        assert!(call(&mut kernel, main, monitor, MONITOR_INTERFACE, "unlock", &[]).is_ok());
        assert_eq!(process.table().uses(index), 1);
        assert_ne!(kernel.scheduler().state(other), Some(ThreadState::Waiting));
    }

    #[test]
    fn test_runtime_entry_and_tls_reach_new_threads() {
        let (mut kernel, pid, main, slot0) = booted();
        let page = scratch_page(&mut kernel, pid).unwrap();
        kernel.user_write(pid, page, b"tls!").unwrap();

        assert!(call(&mut kernel, main, slot0, CURRENT_PROCESS_INTERFACE, "setStartup", &[0x4000]).is_ok());
        assert!(call(&mut kernel, main, slot0, CURRENT_PROCESS_INTERFACE, "setFocus", &[0x77]).is_ok());
        assert!(call(&mut kernel, main, slot0, CURRENT_PROCESS_INTERFACE, "setTls", &[page, 4, 16, 16]).is_ok());
        let oversized = call(&mut kernel, main, slot0, CURRENT_PROCESS_INTERFACE, "setTls", &[page, 4, 2, 16]);
        assert_eq!(oversized.error, -errno::EINVAL);
        {
            let process = kernel.process(pid).unwrap();
            let inner = process.lock();
            assert_eq!((inner.startup, inner.focus), (0x4000, 0x77));
        }

        let before = kernel.scheduler().threads_of(pid);
        assert!(call(&mut kernel, main, slot0, CURRENT_PROCESS_INTERFACE, "createThread", &[0x1000, 0]).is_ok());
        let tid = kernel
            .scheduler()
            .threads_of(pid)
            .into_iter()
            .find(|t| !before.contains(t))
            .unwrap();
        let stack = kernel.scheduler().get(tid).and_then(|t| t.user_stack).unwrap();
        assert_eq!(kernel.user_read(pid, stack.end - 16, 4).unwrap(), b"tls!");
    }
}
