//! Memory Isolation Integration Tests
//!
//! These tests drive maps through `CurrentProcess.map` and touch them the
//! way user code would:
//! - maps never overlap and stay inside the user range
//! - private file maps copy on write, shared ones write through
//! - anonymous pages are zero filled and survive a trip through swap
//! - a fault the kernel cannot resolve kills the process

use core_types::{MapFlags, MemoryAccessType, Protection, PAGE_SIZE};
use kernel_api::{errno, KernelError};
use sim_kernel::fault_injection::{FaultPlan, MemoryFault};
use sim_kernel::kernel_audit::KernelEvent;
use sim_kernel::objects::CURRENT_PROCESS_INTERFACE;
use sim_kernel::pageable::MemoryFile;
use sim_kernel::test_utils::call;
use sim_kernel::SimulatedKernel;
use std::sync::Arc;
use tests_resilience::{boot, fault_stats, grant_pageable, map, slot0, syscall};

#[test]
fn test_maps_are_disjoint_and_in_range() {
    let (mut kernel, pid, main) = boot();
    for pages in [1, 3, 2, 8] {
        map(&mut kernel, pid, main, pages * PAGE_SIZE, Protection::read_write(), MapFlags::PRIVATE, 0).unwrap();
    }
    let first = map(&mut kernel, pid, main, PAGE_SIZE, Protection::READ, MapFlags::PRIVATE, 0).unwrap();
    let s0 = slot0(&kernel, pid);
    assert!(call(&mut kernel, main, s0, CURRENT_PROCESS_INTERFACE, "unmap", &[first, PAGE_SIZE]).is_ok());

    let process = kernel.process(pid).unwrap();
    let inner = process.lock();
    let range = inner.space.user_range();
    let maps = inner.space.maps();
    for pair in maps.windows(2) {
        assert!(pair[0].end <= pair[1].start);
    }
    for m in maps {
        assert!(range.start <= m.start && m.end <= range.end);
    }
}

#[test]
fn test_same_address_is_private_to_each_process() {
    let mut kernel = SimulatedKernel::new();
    let (a, a_main) = kernel.create_process().unwrap();
    let (b, b_main) = kernel.create_process().unwrap();
    let addr_a = map(&mut kernel, a, a_main, PAGE_SIZE, Protection::read_write(), MapFlags::PRIVATE, 0).unwrap();
    let addr_b = map(&mut kernel, b, b_main, PAGE_SIZE, Protection::read_write(), MapFlags::PRIVATE, 0).unwrap();
    assert_eq!(addr_a, addr_b);

    kernel.user_write(a, addr_a, b"from a").unwrap();
    kernel.user_write(b, addr_b, b"from b").unwrap();
    assert_eq!(kernel.user_read(a, addr_a, 6).unwrap(), b"from a");
    assert_eq!(kernel.user_read(b, addr_b, 6).unwrap(), b"from b");
}

#[test]
fn test_private_write_to_untouched_file_page() {
    let (mut kernel, pid, main) = boot();
    let file = Arc::new(MemoryFile::from_bytes(&[5u8; 4096]));
    let cap = grant_pageable(&mut kernel, pid, file.clone()).unwrap();
    let addr = map(&mut kernel, pid, main, PAGE_SIZE, Protection::read_write(), MapFlags::PRIVATE, cap).unwrap();

    kernel.user_write(pid, addr, b"new").unwrap();
    let stats = fault_stats(&kernel, pid);
    assert_eq!(stats.validity, 1);
    assert_eq!(stats.protection, 0);

    let mut buf = [0u8; 3];
    file.read_at(0, &mut buf);
    assert_eq!(buf, [5, 5, 5]);
    assert_eq!(file.total_pins(), 0);
}

#[test]
fn test_copy_on_write_between_processes() {
    let mut kernel = SimulatedKernel::new();
    let (a, a_main) = kernel.create_process().unwrap();
    let (b, b_main) = kernel.create_process().unwrap();
    let file = Arc::new(MemoryFile::from_bytes(&[7u8; 8192]));

    let cap_a = grant_pageable(&mut kernel, a, file.clone()).unwrap();
    let cap_b = grant_pageable(&mut kernel, b, file.clone()).unwrap();
    let addr_a = map(&mut kernel, a, a_main, 8192, Protection::read_write(), MapFlags::PRIVATE, cap_a).unwrap();
    let addr_b = map(&mut kernel, b, b_main, 8192, Protection::read_write(), MapFlags::PRIVATE, cap_b).unwrap();

    assert_eq!(kernel.user_read(a, addr_a, 1).unwrap(), [7]);
    assert_eq!(kernel.user_read(b, addr_b, 1).unwrap(), [7]);
    let page_a = kernel.process(a).unwrap().lock().space.resident_page(addr_a).unwrap();
    let page_b = kernel.process(b).unwrap().lock().space.resident_page(addr_b).unwrap();
    assert!(page_a.same_frame(&page_b));
    assert_eq!(file.pin_count(0), 2);
    drop((page_a, page_b));

    kernel.user_write(a, addr_a, &[9]).unwrap();
    assert_eq!(kernel.user_read(a, addr_a, 1).unwrap(), [9]);
    assert_eq!(kernel.user_read(b, addr_b, 1).unwrap(), [7]);
    let stats = fault_stats(&kernel, a);
    assert_eq!(stats.copy_on_write, 1);
    assert_eq!(file.pin_count(0), 1);
}

#[test]
fn test_shared_file_map_writes_through() {
    let mut kernel = SimulatedKernel::new();
    let (a, a_main) = kernel.create_process().unwrap();
    let (b, b_main) = kernel.create_process().unwrap();
    let file = Arc::new(MemoryFile::new(4096));
    let cap_a = grant_pageable(&mut kernel, a, file.clone()).unwrap();
    let cap_b = grant_pageable(&mut kernel, b, file.clone()).unwrap();
    let addr_a = map(&mut kernel, a, a_main, PAGE_SIZE, Protection::read_write(), MapFlags::SHARED, cap_a).unwrap();
    let addr_b = map(&mut kernel, b, b_main, PAGE_SIZE, Protection::READ, MapFlags::SHARED, cap_b).unwrap();

    kernel.user_write(a, addr_a + 16, b"hello").unwrap();
    assert_eq!(kernel.user_read(b, addr_b + 16, 5).unwrap(), b"hello");
    let mut buf = [0u8; 5];
    file.read_at(16, &mut buf);
    assert_eq!(&buf, b"hello");
}

#[test]
fn test_anonymous_pages_zero_fill_and_swap() {
    let (mut kernel, pid, main) = boot();
    let addr = map(&mut kernel, pid, main, 2 * PAGE_SIZE, Protection::read_write(), MapFlags::PRIVATE, 0).unwrap();
    assert_eq!(kernel.user_read(pid, addr, 16).unwrap(), vec![0u8; 16]);
    assert!(fault_stats(&kernel, pid).zero_fills >= 1);

    kernel.user_write(pid, addr + PAGE_SIZE, b"persist").unwrap();
    let process = kernel.process(pid).unwrap();
    assert!(process.lock().space.page_out(addr + PAGE_SIZE));
    assert!(!process.lock().space.mmu().is_valid(addr + PAGE_SIZE));
    assert_eq!(kernel.user_read(pid, addr + PAGE_SIZE, 7).unwrap(), b"persist");
}

#[test]
fn test_unresolved_fault_kills_process() {
    let (mut kernel, pid, main) = boot();
    let addr = map(&mut kernel, pid, main, PAGE_SIZE, Protection::READ, MapFlags::PRIVATE, 0).unwrap();
    assert!(kernel.user_access(pid, addr, MemoryAccessType::Read).is_ok());

    let result = kernel.user_access(pid, addr, MemoryAccessType::Write);
    assert_eq!(result, Err(KernelError::MemoryFault { addr }));
    assert!(kernel.has_exited(pid).unwrap());
    assert_eq!(kernel.exit_value(pid).unwrap(), Some(-errno::EFAULT));
    assert!(kernel.audit_log().has_event(|e| matches!(
        e,
        KernelEvent::ProcessKilled { process, .. } if *process == pid
    )));
}

#[test]
fn test_swap_exhaustion_kills_process() {
    let mut kernel = SimulatedKernel::new()
        .with_fault_plan(&FaultPlan::new().with_memory_fault(MemoryFault::ExhaustSwapAfter { pages: 1 }));
    let (pid, main) = kernel.create_process().unwrap();
    let addr = map(&mut kernel, pid, main, 4 * PAGE_SIZE, Protection::read_write(), MapFlags::PRIVATE, 0).unwrap();

    let result = kernel.user_write(pid, addr, &vec![1u8; 4 * PAGE_SIZE as usize]);
    assert!(matches!(result, Err(KernelError::MemoryFault { .. })));
    assert!(kernel.has_exited(pid).unwrap());
}

#[test]
fn test_break_follows_data_segment() {
    let (mut kernel, pid, main) = boot();
    let s0 = slot0(&kernel, pid);
    let data = map(
        &mut kernel,
        pid,
        main,
        2 * PAGE_SIZE,
        Protection::read_write(),
        MapFlags::PRIVATE | MapFlags::DATA,
        0,
    )
    .unwrap();
    let top = data + 2 * PAGE_SIZE;

    assert_eq!(syscall(&mut kernel, main, s0, CURRENT_PROCESS_INTERFACE, "setBreak", &[PAGE_SIZE]), Ok(top));
    kernel.user_write(pid, top, b"heap").unwrap();
    assert_eq!(kernel.user_read(pid, top, 4).unwrap(), b"heap");

    let shrink = (-(PAGE_SIZE as i64)) as u64;
    assert_eq!(
        syscall(&mut kernel, main, s0, CURRENT_PROCESS_INTERFACE, "setBreak", &[shrink]),
        Ok(top + PAGE_SIZE)
    );
    assert_eq!(syscall(&mut kernel, main, s0, CURRENT_PROCESS_INTERFACE, "setBreak", &[0]), Ok(top));
    assert!(!kernel.process(pid).unwrap().is_valid(top, 1, false));
}

#[test]
fn test_break_without_data_segment_fails() {
    let (mut kernel, pid, main) = boot();
    let s0 = slot0(&kernel, pid);
    let outcome = call(&mut kernel, main, s0, CURRENT_PROCESS_INTERFACE, "setBreak", &[PAGE_SIZE]);
    assert_eq!(outcome.error, -errno::EFAULT);
    assert!(!kernel.has_exited(pid).unwrap());
}

#[test]
fn test_map_length_overflow_is_rejected() {
    let (mut kernel, pid, main) = boot();
    let s0 = slot0(&kernel, pid);
    let rw = u64::from(Protection::read_write().bits());
    let private = u64::from(MapFlags::PRIVATE.bits());

    let unaligned = call(
        &mut kernel,
        main,
        s0,
        CURRENT_PROCESS_INTERFACE,
        "map",
        &[1, u64::MAX, rw, private, 0, 1],
    );
    assert_eq!(unaligned.error, -errno::EINVAL);
    let wrapping = call(
        &mut kernel,
        main,
        s0,
        CURRENT_PROCESS_INTERFACE,
        "map",
        &[0, u64::MAX - 16, rw, private, 0, 0],
    );
    assert_eq!(wrapping.error, -errno::EINVAL);

    assert!(!kernel.has_exited(pid).unwrap());
    assert!(kernel.process(pid).unwrap().lock().space.maps().iter().all(|m| m.end > m.start));
}
