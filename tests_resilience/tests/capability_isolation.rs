//! Capability Isolation Integration Tests
//!
//! Interface pointers are indexes into the calling process's own table:
//! - the same address names unrelated slots in different processes
//! - slots come and go with their user counts
//! - upcall proxies pass their first use and last release to the object

use kernel_api::{errno, SyscallOutcome};
use reflect::ROOT_INTERFACE;
use sim_kernel::config::KernelConfig;
use sim_kernel::kernel_audit::KernelEvent;
use sim_kernel::object::ObjectRef;
use sim_kernel::objects::{CONTEXT_INTERFACE, CURRENT_PROCESS_INTERFACE, MONITOR_INTERFACE};
use sim_kernel::test_utils::{call, put_str, scratch_page};
use sim_kernel::SimulatedKernel;
use tests_resilience::{boot, slot0, syscall, two_processes, COUNTER_INTERFACE};

#[test]
fn test_slot_address_means_nothing_in_another_process() {
    let mut kernel = SimulatedKernel::new();
    let (a, a_main) = kernel.create_process().unwrap();
    let (b, b_main) = kernel.create_process().unwrap();

    let a0 = slot0(&kernel, a);
    let monitor = syscall(&mut kernel, a_main, a0, CURRENT_PROCESS_INTERFACE, "createMonitor", &[]).unwrap();
    assert!(syscall(&mut kernel, a_main, monitor, MONITOR_INTERFACE, "lock", &[]).is_ok());

    // Same address, B's table: nothing there
    let stolen = call(&mut kernel, b_main, monitor, MONITOR_INTERFACE, "unlock", &[]);
    assert_eq!(stolen.error, -errno::EBADF);
    assert!(kernel.audit_log().has_event(|e| matches!(
        e,
        KernelEvent::SystemCall { process, errno, .. } if *process == b && *errno == -errno::EBADF
    )));
}

#[test]
fn test_capability_table_exhaustion() {
    let config = KernelConfig::default().with_capability_slots(4);
    let mut kernel = SimulatedKernel::with_config(config).unwrap();
    let (pid, main) = kernel.create_process().unwrap();
    let s0 = slot0(&kernel, pid);

    for _ in 0..3 {
        assert!(syscall(&mut kernel, main, s0, CURRENT_PROCESS_INTERFACE, "createMonitor", &[]).is_ok());
    }
    let full = call(&mut kernel, main, s0, CURRENT_PROCESS_INTERFACE, "createMonitor", &[]);
    assert_eq!(full.error, -errno::EMFILE);
    assert_eq!(full.result, 0);
    assert_eq!(kernel.process(pid).unwrap().table().in_use(), 4);
}

#[test]
fn test_released_slot_is_reused() {
    let (mut kernel, pid, main) = boot();
    let s0 = slot0(&kernel, pid);
    let first = syscall(&mut kernel, main, s0, CURRENT_PROCESS_INTERFACE, "createMonitor", &[]).unwrap();
    assert_eq!(syscall(&mut kernel, main, first, ROOT_INTERFACE, "release", &[]), Ok(0));
    assert!(kernel.audit_log().has_event(|e| matches!(e, KernelEvent::SlotReleased { .. })));

    let second = syscall(&mut kernel, main, s0, CURRENT_PROCESS_INTERFACE, "createMonitor", &[]).unwrap();
    assert_eq!(second, first);
    assert!(syscall(&mut kernel, main, second, MONITOR_INTERFACE, "tryLock", &[]).is_ok());
}

#[test]
fn test_proxy_reference_counts() {
    let mut fx = two_processes().unwrap();
    // The client's slot is the proxy's first use
    assert_eq!(fx.counter.count(), 1);

    let client = fx.kernel.process(fx.client).unwrap();
    let index = client.slot_index(fx.counter_addr).unwrap();
    let object = client.table().get(index);
    let handle = match object.as_ref().and_then(ObjectRef::upcall) {
        Some(proxy) => proxy.handle(),
        None => panic!("expected an upcall slot, got {:?}", object),
    };
    // The context binding and the client's slot
    assert_eq!(fx.kernel.upcall_table().refs(handle), 2);

    assert_eq!(syscall(&mut fx.kernel, fx.client_thread, fx.counter_addr, ROOT_INTERFACE, "addRef", &[]), Ok(2));
    assert_eq!(fx.counter.count(), 1);
    assert_eq!(syscall(&mut fx.kernel, fx.client_thread, fx.counter_addr, ROOT_INTERFACE, "release", &[]), Ok(1));
    assert_eq!(syscall(&mut fx.kernel, fx.client_thread, fx.counter_addr, ROOT_INTERFACE, "release", &[]), Ok(0));
    assert_eq!(fx.kernel.upcall_table().refs(handle), 1);
    assert_eq!(fx.counter.count(), 1);

    // Unbinding drops the last proxy reference and passes the release on
    let page = scratch_page(&mut fx.kernel, fx.server).unwrap();
    put_str(&fx.kernel, fx.server, page, "counter").unwrap();
    let s0 = slot0(&fx.kernel, fx.server);
    let root = syscall(&mut fx.kernel, fx.server_thread, s0, CURRENT_PROCESS_INTERFACE, "getRoot", &[]).unwrap();
    assert_eq!(syscall(&mut fx.kernel, fx.server_thread, root, CONTEXT_INTERFACE, "unbind", &[page]), Ok(1));
    assert_eq!(fx.kernel.upcall_table().in_use(), 0);
    assert_eq!(fx.counter.count(), 0);
}

#[test]
fn test_query_interface_on_proxy() {
    let mut fx = two_processes().unwrap();
    let page = fx.client_page + 256;

    put_str(&fx.kernel, fx.client, page, MONITOR_INTERFACE).unwrap();
    let miss = call(&mut fx.kernel, fx.client_thread, fx.counter_addr, ROOT_INTERFACE, "queryInterface", &[page]);
    assert_eq!(miss, SyscallOutcome::ok(0));

    put_str(&fx.kernel, fx.client, page, COUNTER_INTERFACE).unwrap();
    let again = syscall(&mut fx.kernel, fx.client_thread, fx.counter_addr, ROOT_INTERFACE, "queryInterface", &[page]).unwrap();
    assert_ne!(again, fx.counter_addr);
    assert_eq!(syscall(&mut fx.kernel, fx.client_thread, again, COUNTER_INTERFACE, "increment", &[]), Ok(1));
    assert_eq!(fx.kernel.upcall_table().in_use(), 2);
}
