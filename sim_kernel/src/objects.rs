//! Kernel-hosted objects
//!
//! The objects a process reaches through system calls rather than
//! upcalls. Their interfaces are registered in every kernel's catalog by
//! [`builtin_interfaces`].
//!
//! - `CurrentProcess`: slot 0 of every process
//! - `Thread`, `Monitor`: handed out by `CurrentProcess`
//! - `Context`: a name registry shared by all processes
//! - `Pageable`: a backing object that `map` accepts

use crate::object::{KernelObject, MethodCall, ObjectRef, RefCount, Value};
use crate::pageable::Pageable;
use crate::process::ContextSlot;
use crate::scheduler::{JoinOutcome, LockOutcome, Scheduler, WaitOutcome};
use crate::thread::ThreadState;
use core_types::{MapFlags, MonitorId, ProcessId, Protection, ThreadId};
use kernel_api::{KernelError, MapRequest, ProcessApi};
use reflect::{Direction, InterfaceDescriptor, MethodSignature, Parameter, TypeSpec, ROOT_INTERFACE};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const CURRENT_PROCESS_INTERFACE: &str = "CurrentProcess";
pub const THREAD_INTERFACE: &str = "Thread";
pub const MONITOR_INTERFACE: &str = "Monitor";
pub const CONTEXT_INTERFACE: &str = "Context";
pub const PAGEABLE_INTERFACE: &str = "Pageable";

/// Interfaces of the kernel-hosted objects, parents first
pub fn builtin_interfaces() -> Vec<InterfaceDescriptor> {
    let context = TypeSpec::interface(CONTEXT_INTERFACE);
    let any_object = TypeSpec::interface(ROOT_INTERFACE);
    let mut current = InterfaceDescriptor::new(CURRENT_PROCESS_INTERFACE, ROOT_INTERFACE)
        .method(
            MethodSignature::new("map")
                .param("addr", TypeSpec::U64)
                .param("length", TypeSpec::U64)
                .param("prot", TypeSpec::U32)
                .param("flags", TypeSpec::U32)
                .param("pageable", TypeSpec::interface(PAGEABLE_INTERFACE))
                .param("offset", TypeSpec::U64)
                .returns(TypeSpec::U64),
        )
        .method(
            MethodSignature::new("unmap")
                .param("addr", TypeSpec::U64)
                .param("length", TypeSpec::U64),
        )
        .method(
            MethodSignature::new("setBreak")
                .param("increment", TypeSpec::I64)
                .returns(TypeSpec::U64),
        )
        .method(
            MethodSignature::new("createThread")
                .param("entry", TypeSpec::U64)
                .param("arg", TypeSpec::U64)
                .returns(TypeSpec::interface(THREAD_INTERFACE)),
        )
        .method(MethodSignature::new("createMonitor").returns(TypeSpec::interface(MONITOR_INTERFACE)))
        .method(MethodSignature::new("exit").param("status", TypeSpec::I32))
        .method(
            MethodSignature::new("trace")
                .param("on", TypeSpec::Bool)
                .returns(TypeSpec::Bool),
        )
        .method(MethodSignature::new("setStartup").param("entry", TypeSpec::U64))
        .method(MethodSignature::new("setFocus").param("focus", TypeSpec::U64))
        .method(
            MethodSignature::new("setTls")
                .param("image", TypeSpec::sequence(TypeSpec::U8))
                .param("size", TypeSpec::U64)
                .param("align", TypeSpec::U64),
        )
        .method(MethodSignature::new("sleep").param("ticks", TypeSpec::U64))
        .method(MethodSignature::new("getNow").returns(TypeSpec::U64));
    for (name, ty) in [
        ("Root", &context),
        ("Current", &context),
        ("Input", &any_object),
        ("Output", &any_object),
        ("Error", &any_object),
    ] {
        current = current
            .method(MethodSignature::new(&format!("get{}", name)).returns(ty.clone()))
            .method(MethodSignature::new(&format!("set{}", name)).param("object", ty.clone()));
    }

    let thread = InterfaceDescriptor::new(THREAD_INTERFACE, ROOT_INTERFACE)
        .method(MethodSignature::new("start"))
        .method(MethodSignature::new("join").returns(TypeSpec::I32))
        .method(MethodSignature::new("cancel"))
        .method(MethodSignature::new("getPriority").returns(TypeSpec::U8))
        .method(
            MethodSignature::new("setPriority")
                .param("priority", TypeSpec::U8)
                .returns(TypeSpec::U8),
        )
        .method(MethodSignature::new("getState").returns(TypeSpec::U32))
        .method(
            MethodSignature::new("setCancelState")
                .param("enable", TypeSpec::Bool)
                .returns(TypeSpec::Bool),
        )
        .method(
            MethodSignature::new("setCancelType")
                .param("asynchronous", TypeSpec::Bool)
                .returns(TypeSpec::Bool),
        )
        .method(MethodSignature::new("testCancel"));

    let monitor = InterfaceDescriptor::new(MONITOR_INTERFACE, ROOT_INTERFACE)
        .method(MethodSignature::new("lock"))
        .method(MethodSignature::new("tryLock").returns(TypeSpec::Bool))
        .method(MethodSignature::new("unlock"))
        .method(MethodSignature::new("wait"))
        .method(MethodSignature::new("notify").returns(TypeSpec::Bool))
        .method(MethodSignature::new("notifyAll").returns(TypeSpec::U32))
        .method(MethodSignature::new("holdsLock").returns(TypeSpec::Bool));

    let context = InterfaceDescriptor::new(CONTEXT_INTERFACE, ROOT_INTERFACE)
        .method(
            MethodSignature::new("bind")
                .param("name", TypeSpec::String)
                .param("iid", TypeSpec::String)
                .with_param(Parameter::new("object", any_object.clone()).with_iid_is(1)),
        )
        .method(
            MethodSignature::new("lookup")
                .param("name", TypeSpec::String)
                .param("iid", TypeSpec::String)
                .returns(any_object.clone())
                .returns_iid_is(1),
        )
        .method(
            MethodSignature::new("unbind")
                .param("name", TypeSpec::String)
                .returns(TypeSpec::Bool),
        )
        .method(
            MethodSignature::new("list")
                .with_param(
                    Parameter::new("names", TypeSpec::sequence(TypeSpec::U8))
                        .with_direction(Direction::Out),
                )
                .returns(TypeSpec::U32),
        );

    let pageable = InterfaceDescriptor::new(PAGEABLE_INTERFACE, ROOT_INTERFACE)
        .method(MethodSignature::new("getSize").returns(TypeSpec::U64));

    vec![current, thread, monitor, context, pageable]
}

/// Slot 0 of a process: operations on the process itself
pub struct CurrentProcessObject {
    process: ProcessId,
    refs: RefCount,
}

impl CurrentProcessObject {
    pub fn new(process: ProcessId) -> Self {
        Self {
            process,
            refs: RefCount::default(),
        }
    }
}

impl KernelObject for CurrentProcessObject {
    fn interface_id(&self) -> &str {
        CURRENT_PROCESS_INTERFACE
    }

    fn add_ref(&self) -> u32 {
        self.refs.add_ref()
    }

    fn release(&self) -> u32 {
        self.refs.release()
    }

    fn invoke(&self, call: &mut MethodCall<'_>) -> Result<Value, KernelError> {
        let pid = self.process;
        let method = call.method;
        match method.name.as_str() {
            "map" => {
                let prot = Protection::from_bits(call.arg_u64(2)? as u32)
                    .ok_or_else(|| KernelError::InvalidArgument("bad protection".to_string()))?;
                let flags = MapFlags::from_bits(call.arg_u64(3)? as u32)
                    .ok_or_else(|| KernelError::InvalidArgument("bad map flags".to_string()))?;
                let request = MapRequest {
                    addr: call.arg_u64(0)?,
                    length: call.arg_u64(1)?,
                    prot,
                    flags,
                    offset: call.arg_u64(5)?,
                };
                let pageable = match call.arg_object(4)? {
                    None => None,
                    Some(object) => Some(
                        object
                            .kernel()
                            .and_then(|o| o.as_pageable())
                            .ok_or_else(|| {
                                KernelError::InvalidArgument("object cannot back a mapping".to_string())
                            })?,
                    ),
                };
                call.kernel.map(pid, request, pageable).map(Value::U64)
            }
            "unmap" => {
                let (addr, length) = (call.arg_u64(0)?, call.arg_u64(1)?);
                call.kernel.unmap(pid, addr, length).map(|_| Value::Void)
            }
            "setBreak" => {
                let increment = call.arg_i64(0)?;
                call.kernel.set_break(pid, increment).map(Value::U64)
            }
            "createThread" => {
                let (entry, arg) = (call.arg_u64(0)?, call.arg_u64(1)?);
                let thread = call.kernel.create_thread(pid, entry, arg)?;
                Ok(Value::Object(Some(call.kernel.thread_object(thread))))
            }
            "createMonitor" => Ok(Value::Object(Some(call.kernel.create_monitor()))),
            "exit" => {
                let status = call.arg_i64(0)? as i32;
                call.kernel.exit_process(call.thread, status)?;
                Ok(Value::Void)
            }
            "trace" => {
                let on = call.arg_bool(0)?;
                let process = call.kernel.process_arc(pid)?;
                let mut inner = process.lock();
                let previous = inner.trace;
                inner.trace = on;
                Ok(Value::Bool(previous))
            }
            "setStartup" => {
                let entry = call.arg_u64(0)?;
                call.kernel.process_arc(pid)?.lock().startup = entry;
                Ok(Value::Void)
            }
            "setFocus" => {
                let focus = call.arg_u64(0)?;
                call.kernel.process_arc(pid)?.lock().focus = focus;
                Ok(Value::Void)
            }
            "setTls" => {
                let image = call
                    .arg(0)?
                    .as_bytes()
                    .map(|b| b.to_vec())
                    .unwrap_or_default();
                let (size, align) = (call.arg_u64(1)?, call.arg_u64(2)?);
                if (image.len() as u64) > size || (align != 0 && !align.is_power_of_two()) {
                    return Err(KernelError::InvalidArgument("bad TLS image".to_string()));
                }
                call.kernel.process_arc(pid)?.lock().tls = crate::process::TlsImage { image, size, align };
                Ok(Value::Void)
            }
            "sleep" => {
                let ticks = call.arg_u64(0)?;
                call.kernel.sleep(call.thread, ticks)?;
                Ok(Value::Void)
            }
            "getNow" => Ok(Value::U64(call.kernel.now())),
            other => match context_accessor(other) {
                Some((slot, false)) => {
                    let process = call.kernel.process_arc(pid)?;
                    Ok(Value::Object(process.context(slot)))
                }
                Some((slot, true)) => {
                    let object = call.arg_object(0)?;
                    let process = call.kernel.process_arc(pid)?;
                    let previous = process.set_context(slot, object);
                    drop(previous);
                    Ok(Value::Void)
                }
                None => Err(call.unknown_method(CURRENT_PROCESS_INTERFACE)),
            },
        }
    }
}

/// Maps `getRoot`/`setRoot` style names to a context slot and a setter flag
fn context_accessor(name: &str) -> Option<(ContextSlot, bool)> {
    let (setter, rest) = if let Some(rest) = name.strip_prefix("get") {
        (false, rest)
    } else {
        (true, name.strip_prefix("set")?)
    };
    let slot = match rest {
        "Root" => ContextSlot::Root,
        "Current" => ContextSlot::Current,
        "Input" => ContextSlot::Input,
        "Output" => ContextSlot::Output,
        "Error" => ContextSlot::Error,
        _ => return None,
    };
    Some((slot, setter))
}

/// A thread handle
///
/// Holds one scheduler reference to the thread, given back when the last
/// object reference goes.
pub struct ThreadObject {
    thread: ThreadId,
    refs: RefCount,
    scheduler: Arc<spin::Mutex<Scheduler>>,
}

impl ThreadObject {
    /// Wraps a scheduler reference the caller already holds
    pub fn new(thread: ThreadId, scheduler: Arc<spin::Mutex<Scheduler>>) -> Self {
        Self {
            thread,
            refs: RefCount::default(),
            scheduler,
        }
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }
}

fn state_code(state: ThreadState) -> u32 {
    match state {
        ThreadState::New => 0,
        ThreadState::Runnable => 1,
        ThreadState::Running => 2,
        ThreadState::Waiting => 3,
        ThreadState::Terminated => 4,
    }
}

impl KernelObject for ThreadObject {
    fn interface_id(&self) -> &str {
        THREAD_INTERFACE
    }

    fn add_ref(&self) -> u32 {
        self.refs.add_ref()
    }

    fn release(&self) -> u32 {
        let refs = self.refs.release();
        if refs == 0 {
            self.scheduler.lock().release(self.thread);
        }
        refs
    }

    fn invoke(&self, call: &mut MethodCall<'_>) -> Result<Value, KernelError> {
        let target = self.thread;
        let method = call.method;
        match method.name.as_str() {
            "start" => call.kernel.start_thread(target).map(|_| Value::Void),
            "join" => match call.kernel.scheduler().join(call.thread, target)? {
                JoinOutcome::Exited(value) => Ok(Value::I32(value)),
                JoinOutcome::Blocked => Err(KernelError::WouldBlock),
            },
            "cancel" => call.kernel.cancel_thread(target).map(|_| Value::Void),
            "getPriority" => call
                .kernel
                .scheduler()
                .priority(target)
                .map(Value::U8)
                .ok_or_else(|| KernelError::BadDescriptor(format!("no thread {}", target))),
            "setPriority" => {
                let priority = call.arg_u64(0)? as u8;
                Ok(Value::U8(call.kernel.scheduler().set_priority(target, priority)?))
            }
            "getState" => call
                .kernel
                .scheduler()
                .state(target)
                .map(|s| Value::U32(state_code(s)))
                .ok_or_else(|| KernelError::BadDescriptor(format!("no thread {}", target))),
            "setCancelState" => {
                let enable = call.arg_bool(0)?;
                Ok(Value::Bool(call.kernel.scheduler().set_cancel_state(target, enable)?))
            }
            "setCancelType" => {
                let asynchronous = call.arg_bool(0)?;
                Ok(Value::Bool(
                    call.kernel.scheduler().set_cancel_type(target, asynchronous)?,
                ))
            }
            "testCancel" => {
                if target != call.thread {
                    return Err(KernelError::InvalidArgument(
                        "testCancel applies to the calling thread".to_string(),
                    ));
                }
                if call.kernel.test_cancel(target)? {
                    return Err(KernelError::Cancelled);
                }
                Ok(Value::Void)
            }
            _ => Err(call.unknown_method(THREAD_INTERFACE)),
        }
    }
}

/// A monitor handle
///
/// Blocking operations return `WouldBlock` and are re-issued once the
/// calling thread is woken.
pub struct MonitorObject {
    monitor: MonitorId,
    refs: RefCount,
    scheduler: Arc<spin::Mutex<Scheduler>>,
}

impl MonitorObject {
    pub fn new(monitor: MonitorId, scheduler: Arc<spin::Mutex<Scheduler>>) -> Self {
        Self {
            monitor,
            refs: RefCount::default(),
            scheduler,
        }
    }

    pub fn monitor(&self) -> MonitorId {
        self.monitor
    }
}

impl KernelObject for MonitorObject {
    fn interface_id(&self) -> &str {
        MONITOR_INTERFACE
    }

    fn add_ref(&self) -> u32 {
        self.refs.add_ref()
    }

    fn release(&self) -> u32 {
        let refs = self.refs.release();
        if refs == 0 {
            self.scheduler.lock().monitor_release(self.monitor);
        }
        refs
    }

    fn invoke(&self, call: &mut MethodCall<'_>) -> Result<Value, KernelError> {
        let (thread, monitor) = (call.thread, self.monitor);
        let method = call.method;
        let mut scheduler = call.kernel.scheduler();
        match method.name.as_str() {
            "lock" => match scheduler.lock(thread, monitor)? {
                LockOutcome::Acquired => Ok(Value::Void),
                LockOutcome::Blocked => Err(KernelError::WouldBlock),
            },
            "tryLock" => Ok(Value::Bool(scheduler.try_lock(thread, monitor)?)),
            "unlock" => {
                scheduler.unlock(thread, monitor)?;
                Ok(Value::Void)
            }
            "wait" => match scheduler.wait(thread, monitor)? {
                WaitOutcome::Reacquired => Ok(Value::Void),
                WaitOutcome::Waiting | WaitOutcome::Blocked => Err(KernelError::WouldBlock),
            },
            "notify" => Ok(Value::Bool(scheduler.notify(thread, monitor)?)),
            "notifyAll" => Ok(Value::U32(scheduler.notify_all(thread, monitor)? as u32)),
            "holdsLock" => Ok(Value::Bool(scheduler.holds_lock(thread, monitor))),
            _ => Err(call.unknown_method(MONITOR_INTERFACE)),
        }
    }
}

/// A name registry
///
/// Bindings keep the interface they were published as; `lookup` hands a
/// binding out only as that interface or one of its ancestors.
#[derive(Default)]
pub struct ContextObject {
    refs: RefCount,
    bindings: spin::Mutex<BTreeMap<String, (String, ObjectRef)>>,
}

impl ContextObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, name: &str, iid: &str, object: ObjectRef) -> Result<(), KernelError> {
        let mut bindings = self.bindings.lock();
        if bindings.contains_key(name) {
            drop(bindings);
            drop(object);
            return Err(KernelError::InvalidArgument(format!("{} is already bound", name)));
        }
        bindings.insert(name.to_string(), (iid.to_string(), object));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<(String, ObjectRef)> {
        self.bindings.lock().get(name).cloned()
    }

    pub fn unbind(&self, name: &str) -> bool {
        let removed = self.bindings.lock().remove(name);
        removed.is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.bindings.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.lock().is_empty()
    }
}

impl KernelObject for ContextObject {
    fn interface_id(&self) -> &str {
        CONTEXT_INTERFACE
    }

    fn add_ref(&self) -> u32 {
        self.refs.add_ref()
    }

    fn release(&self) -> u32 {
        self.refs.release()
    }

    fn invoke(&self, call: &mut MethodCall<'_>) -> Result<Value, KernelError> {
        let method = call.method;
        match method.name.as_str() {
            "bind" => {
                let name = call.arg_str(0)?.to_string();
                let iid = call.arg_str(1)?.to_string();
                if !call.kernel.catalog().contains(&iid) {
                    return Err(KernelError::InvalidArgument(format!("unknown interface {}", iid)));
                }
                let object = call
                    .arg_object(2)?
                    .ok_or_else(|| KernelError::InvalidArgument("cannot bind null".to_string()))?;
                self.bind(&name, &iid, object)?;
                log::debug!("bound {} as {}", name, iid);
                Ok(Value::Void)
            }
            "lookup" => {
                let name = call.arg_str(0)?.to_string();
                let iid = call.arg_str(1)?.to_string();
                match self.lookup(&name) {
                    Some((bound, object)) if call.kernel.catalog().is_derived_from(&bound, &iid) => {
                        Ok(Value::Object(Some(object)))
                    }
                    Some((bound, _)) => Err(KernelError::InvalidArgument(format!(
                        "{} is bound as {}, not {}",
                        name, bound, iid
                    ))),
                    None => Ok(Value::Object(None)),
                }
            }
            "unbind" => {
                let name = call.arg_str(0)?.to_string();
                Ok(Value::Bool(self.unbind(&name)))
            }
            "list" => {
                let names = self.names();
                let mut listing = Vec::new();
                for name in &names {
                    listing.extend_from_slice(name.as_bytes());
                    listing.push(0);
                }
                let capacity = call.arg(0)?.as_bytes().map(|b| b.len()).unwrap_or(0);
                if listing.len() > capacity {
                    return Err(KernelError::ResourceExhausted(kernel_api::Resource::MarshalBuffer));
                }
                call.set_output(0, listing)?;
                Ok(Value::U32(names.len() as u32))
            }
            _ => Err(call.unknown_method(CONTEXT_INTERFACE)),
        }
    }
}

/// A backing object that can be passed to `map`
pub struct PageableObject {
    pageable: Arc<dyn Pageable>,
    refs: RefCount,
}

impl PageableObject {
    pub fn new(pageable: Arc<dyn Pageable>) -> Self {
        Self {
            pageable,
            refs: RefCount::default(),
        }
    }
}

impl KernelObject for PageableObject {
    fn interface_id(&self) -> &str {
        PAGEABLE_INTERFACE
    }

    fn add_ref(&self) -> u32 {
        self.refs.add_ref()
    }

    fn release(&self) -> u32 {
        self.refs.release()
    }

    fn invoke(&self, call: &mut MethodCall<'_>) -> Result<Value, KernelError> {
        match call.name() {
            "getSize" => Ok(Value::U64(self.pageable.size())),
            _ => Err(call.unknown_method(PAGEABLE_INTERFACE)),
        }
    }

    fn as_pageable(&self) -> Option<Arc<dyn Pageable>> {
        Some(self.pageable.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflect::Catalog;

    #[test]
    fn test_builtin_interfaces_register() {
        let mut catalog = Catalog::new();
        for descriptor in builtin_interfaces() {
            catalog.register(descriptor).unwrap();
        }
        let set_error = catalog
            .method_number(CURRENT_PROCESS_INTERFACE, "setError")
            .unwrap();
        let resolved = catalog.resolve(CURRENT_PROCESS_INTERFACE, set_error).unwrap();
        assert_eq!(resolved.signature.params.len(), 1);
        assert_eq!(catalog.method_number(THREAD_INTERFACE, "start"), Ok(3));
        assert!(catalog.is_derived_from(CONTEXT_INTERFACE, ROOT_INTERFACE));
    }

    #[test]
    fn test_context_accessors() {
        assert_eq!(context_accessor("getRoot"), Some((ContextSlot::Root, false)));
        assert_eq!(context_accessor("setError"), Some((ContextSlot::Error, true)));
        assert_eq!(context_accessor("getNow"), None);
        assert_eq!(context_accessor("map"), None);
    }

    #[test]
    fn test_context_bindings_hold_references() {
        let context = ContextObject::new();
        let object = Arc::new(ContextObject::new());
        context
            .bind("nested", CONTEXT_INTERFACE, ObjectRef::new(object.clone()))
            .unwrap();
        assert_eq!(object.refs.get(), 1);
        assert!(context
            .bind("nested", CONTEXT_INTERFACE, ObjectRef::new(object.clone()))
            .is_err());
        assert_eq!(object.refs.get(), 1);
        assert_eq!(context.names(), vec!["nested".to_string()]);
        assert!(context.unbind("nested"));
        assert_eq!(object.refs.get(), 0);
        assert!(!context.unbind("nested"));
    }
}
