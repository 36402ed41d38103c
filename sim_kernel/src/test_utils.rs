//! Test utilities
//!
//! Objects, interfaces and fixtures shared by the unit tests and the
//! resilience suite.

use crate::fault_injection::FaultPlan;
use crate::object::{KernelObject, MethodCall, RefCount, Value};
use crate::objects::{CONTEXT_INTERFACE, CURRENT_PROCESS_INTERFACE};
use crate::SimulatedKernel;
use core_types::{ProcessId, ThreadId, PAGE_SIZE};
use kernel_api::{KernelError, MapRequest, ProcessApi, SyscallOutcome, SyscallRequest};
use reflect::{Direction, InterfaceDescriptor, MethodSignature, Parameter, TypeSpec, ROOT_INTERFACE};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub const COUNTER_INTERFACE: &str = "Counter";

/// An object that only counts references
///
/// `invoke` rejects every method.
pub struct CountingObject {
    iid: String,
    refs: RefCount,
    releases: AtomicU32,
}

impl CountingObject {
    pub fn new(iid: &str) -> Self {
        Self {
            iid: iid.to_string(),
            refs: RefCount::default(),
            releases: AtomicU32::new(0),
        }
    }

    /// Current reference count
    pub fn count(&self) -> u32 {
        self.refs.get()
    }

    /// Number of `release` calls seen
    pub fn releases(&self) -> u32 {
        self.releases.load(Ordering::SeqCst)
    }
}

impl KernelObject for CountingObject {
    fn interface_id(&self) -> &str {
        &self.iid
    }

    fn add_ref(&self) -> u32 {
        self.refs.add_ref()
    }

    fn release(&self) -> u32 {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.refs.release()
    }

    fn invoke(&self, call: &mut MethodCall<'_>) -> Result<Value, KernelError> {
        Err(call.unknown_method(&self.iid))
    }
}

/// The `Counter` interface served by [`CounterObject`]
pub fn counter_interface() -> InterfaceDescriptor {
    InterfaceDescriptor::new(COUNTER_INTERFACE, ROOT_INTERFACE)
        .method(MethodSignature::new("increment").returns(TypeSpec::I32))
        .method(MethodSignature::new("get").returns(TypeSpec::I32))
        .method(
            MethodSignature::new("echo")
                .param("text", TypeSpec::String)
                .returns(TypeSpec::String),
        )
        .method(
            MethodSignature::new("fill").with_param(
                Parameter::new("buf", TypeSpec::sequence(TypeSpec::U8)).with_direction(Direction::Out),
            ),
        )
        .method(
            MethodSignature::new("reverse")
                .param("bytes", TypeSpec::sequence(TypeSpec::U8))
                .returns(TypeSpec::sequence(TypeSpec::U8)),
        )
        .method(MethodSignature::new("quit").param("status", TypeSpec::I32))
}

#[derive(Default)]
struct CounterState {
    value: i32,
    seen_in: Vec<Option<ProcessId>>,
    methods: Vec<String>,
}

/// A counter exported by a server process
#[derive(Default)]
pub struct CounterObject {
    refs: RefCount,
    state: spin::Mutex<CounterState>,
}

impl CounterObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> i32 {
        self.state.lock().value
    }

    pub fn count(&self) -> u32 {
        self.refs.get()
    }

    /// The process the calling thread was running in, per call
    pub fn seen_in(&self) -> Vec<Option<ProcessId>> {
        self.state.lock().seen_in.clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.state.lock().methods.clone()
    }
}

impl KernelObject for CounterObject {
    fn interface_id(&self) -> &str {
        COUNTER_INTERFACE
    }

    fn add_ref(&self) -> u32 {
        self.refs.add_ref()
    }

    fn release(&self) -> u32 {
        self.refs.release()
    }

    fn invoke(&self, call: &mut MethodCall<'_>) -> Result<Value, KernelError> {
        let current = call.kernel.scheduler().get(call.thread).and_then(|t| t.current_process);
        {
            let mut state = self.state.lock();
            state.seen_in.push(current);
            state.methods.push(call.name().to_string());
        }
        let method = call.method;
        match method.name.as_str() {
            "increment" => {
                let mut state = self.state.lock();
                state.value += 1;
                Ok(Value::I32(state.value))
            }
            "get" => Ok(Value::I32(self.value())),
            "echo" => Ok(Value::Str(call.arg_str(0)?.to_string())),
            "fill" => {
                let len = call.arg(0)?.as_bytes().map(|b| b.len()).unwrap_or(0);
                call.set_output(0, (0..len).map(|i| i as u8).collect())?;
                Ok(Value::Void)
            }
            "reverse" => {
                let mut bytes = call
                    .arg(0)?
                    .as_bytes()
                    .map(|b| b.to_vec())
                    .unwrap_or_default();
                bytes.reverse();
                Ok(Value::Bytes(bytes))
            }
            "quit" => {
                let status = call.arg_i64(0)? as i32;
                call.kernel.exit_thread(call.thread, status)?;
                Ok(Value::Void)
            }
            _ => Err(call.unknown_method(COUNTER_INTERFACE)),
        }
    }
}

/// Runs a test against a kernel with a fault plan applied
///
/// # Example
///
/// ```
/// use sim_kernel::fault_injection::{FaultPlan, MemoryFault};
/// use sim_kernel::test_utils::with_fault_plan;
///
/// with_fault_plan(
///     FaultPlan::new().with_memory_fault(MemoryFault::ExhaustSwapAfter { pages: 4 }),
///     |kernel| assert_eq!(kernel.process_count(), 0),
/// );
/// ```
pub fn with_fault_plan<F>(plan: FaultPlan, f: F)
where
    F: FnOnce(&mut SimulatedKernel),
{
    let mut kernel = SimulatedKernel::new().with_fault_plan(&plan);
    f(&mut kernel);
}

/// Advances the clock one tick at a time
pub fn run_for_ticks(kernel: &mut SimulatedKernel, ticks: u64) {
    for _ in 0..ticks {
        kernel.tick(1);
    }
}

/// Maps one anonymous read/write page into `pid`
pub fn scratch_page(kernel: &mut SimulatedKernel, pid: ProcessId) -> Result<u64, KernelError> {
    kernel.map(pid, MapRequest::anonymous(0, PAGE_SIZE), None)
}

/// Writes a NUL-terminated string into `pid`'s memory
pub fn put_str(kernel: &SimulatedKernel, pid: ProcessId, addr: u64, s: &str) -> Result<(), KernelError> {
    let process = kernel.process_arc(pid)?;
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    if process.write(addr, &bytes) != bytes.len() {
        return Err(KernelError::MemoryFault { addr });
    }
    Ok(())
}

/// Issues a system call naming the method by interface and name
pub fn call(
    kernel: &mut SimulatedKernel,
    thread: ThreadId,
    slot_addr: u64,
    iid: &str,
    method: &str,
    args: &[u64],
) -> SyscallOutcome {
    let number = match kernel.catalog().method_number(iid, method) {
        Ok(number) => number,
        Err(err) => return SyscallOutcome::err(&err.into()),
    };
    let request = SyscallRequest {
        self_ptr: slot_addr,
        method: number,
        args: args.to_vec(),
        base: 0,
    };
    kernel.system_call(thread, request)
}

/// A client and a server process sharing a counter
///
/// The server exports a [`CounterObject`] and binds it as `counter` in the
/// root context; the client has looked it up, so `counter_addr` is a slot
/// of the client's table backed by an upcall proxy.
pub struct TwoProcesses {
    pub kernel: SimulatedKernel,
    pub client: ProcessId,
    pub client_thread: ThreadId,
    pub server: ProcessId,
    pub server_thread: ThreadId,
    pub counter: Arc<CounterObject>,
    pub export_addr: u64,
    pub counter_addr: u64,
    /// A read/write page in the client
    pub client_page: u64,
}

pub fn two_processes() -> Result<TwoProcesses, KernelError> {
    let mut kernel = SimulatedKernel::new();
    kernel.register_interface(counter_interface())?;
    let (client, client_thread) = kernel.create_process()?;
    let (server, server_thread) = kernel.create_process()?;

    let counter = Arc::new(CounterObject::new());
    let export_addr = kernel.export(server, counter.clone(), COUNTER_INTERFACE)?;

    let server_page = scratch_page(&mut kernel, server)?;
    put_str(&kernel, server, server_page, "counter")?;
    put_str(&kernel, server, server_page + 64, COUNTER_INTERFACE)?;
    let server_slot0 = kernel.process_arc(server)?.slot_address(0);
    let root = call(&mut kernel, server_thread, server_slot0, CURRENT_PROCESS_INTERFACE, "getRoot", &[])
        .into_result()?;
    call(
        &mut kernel,
        server_thread,
        root,
        CONTEXT_INTERFACE,
        "bind",
        &[server_page, server_page + 64, export_addr],
    )
    .into_result()?;

    let client_page = scratch_page(&mut kernel, client)?;
    put_str(&kernel, client, client_page, "counter")?;
    put_str(&kernel, client, client_page + 64, COUNTER_INTERFACE)?;
    let client_slot0 = kernel.process_arc(client)?.slot_address(0);
    let root = call(&mut kernel, client_thread, client_slot0, CURRENT_PROCESS_INTERFACE, "getRoot", &[])
        .into_result()?;
    let counter_addr = call(
        &mut kernel,
        client_thread,
        root,
        CONTEXT_INTERFACE,
        "lookup",
        &[client_page, client_page + 64],
    )
    .into_result()?;
    if counter_addr == 0 {
        return Err(KernelError::BadDescriptor("counter is not bound".to_string()));
    }

    Ok(TwoProcesses {
        kernel,
        client,
        client_thread,
        server,
        server_thread,
        counter,
        export_addr,
        counter_addr,
        client_page,
    })
}
