//! Deterministic fault injection for testing
//!
//! This module lets tests force the failures that are otherwise hard to
//! reach: running out of swap, a backing object refusing a page, or a
//! server process that cannot set up another upcall record.
//!
//! ## Design Philosophy
//!
//! - **Deterministic**: Faults fire after an exact number of operations
//! - **Composable**: A plan can combine memory and upcall faults
//! - **Shared**: One injector is cloned into every component it affects
//!
//! ## Example
//!
//! ```
//! use sim_kernel::fault_injection::{FaultInjector, FaultPlan, MemoryFault};
//!
//! let plan = FaultPlan::new().with_memory_fault(MemoryFault::ExhaustSwapAfter { pages: 1 });
//! let injector = FaultInjector::new(plan);
//! assert!(injector.take_swap_page());
//! assert!(!injector.take_swap_page());
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A fault to inject into memory management
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryFault {
    /// Swap hands out this many more pages, then reports exhaustion
    ExhaustSwapAfter { pages: u64 },

    /// The next N `Pageable::get` calls made to resolve faults fail
    FailPageableGets { count: usize },
}

/// A fault to inject into upcall dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpcallFault {
    /// The next N attempts to create an upcall record fail
    FailRecordCreation { count: usize },
}

/// A plan describing all faults to inject
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    memory_faults: Vec<MemoryFault>,
    upcall_faults: Vec<UpcallFault>,
}

impl FaultPlan {
    /// Creates a new empty fault plan
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a memory fault to the plan
    pub fn with_memory_fault(mut self, fault: MemoryFault) -> Self {
        self.memory_faults.push(fault);
        self
    }

    /// Adds an upcall fault to the plan
    pub fn with_upcall_fault(mut self, fault: UpcallFault) -> Self {
        self.upcall_faults.push(fault);
        self
    }

    pub fn memory_faults(&self) -> &[MemoryFault] {
        &self.memory_faults
    }

    pub fn upcall_faults(&self) -> &[UpcallFault] {
        &self.upcall_faults
    }
}

const UNLIMITED: u64 = u64::MAX;

#[derive(Debug)]
struct InjectorState {
    swap_pages_left: AtomicU64,
    pageable_failures: AtomicUsize,
    record_failures: AtomicUsize,
}

/// Applies a fault plan
///
/// Cloning shares the counters, so the swap pool, the address spaces and
/// the upcall path all draw from the same plan.
#[derive(Debug, Clone)]
pub struct FaultInjector {
    state: Arc<InjectorState>,
}

impl FaultInjector {
    /// Creates an injector with the given plan
    pub fn new(plan: FaultPlan) -> Self {
        let injector = Self::disabled();
        injector.apply(&plan);
        injector
    }

    /// Creates an injector that never fires
    pub fn disabled() -> Self {
        Self {
            state: Arc::new(InjectorState {
                swap_pages_left: AtomicU64::new(UNLIMITED),
                pageable_failures: AtomicUsize::new(0),
                record_failures: AtomicUsize::new(0),
            }),
        }
    }

    /// Adds the faults of `plan` to the live counters
    pub fn apply(&self, plan: &FaultPlan) {
        for fault in plan.memory_faults() {
            match fault {
                MemoryFault::ExhaustSwapAfter { pages } => {
                    self.state.swap_pages_left.store(*pages, Ordering::SeqCst);
                }
                MemoryFault::FailPageableGets { count } => {
                    self.state
                        .pageable_failures
                        .fetch_add(*count, Ordering::SeqCst);
                }
            }
        }
        for fault in plan.upcall_faults() {
            match fault {
                UpcallFault::FailRecordCreation { count } => {
                    self.state.record_failures.fetch_add(*count, Ordering::SeqCst);
                }
            }
        }
    }

    /// Consumes one swap page from the budget; false once it is spent
    pub fn take_swap_page(&self) -> bool {
        let result = self
            .state
            .swap_pages_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                UNLIMITED => Some(UNLIMITED),
                0 => None,
                n => Some(n - 1),
            });
        result.is_ok()
    }

    /// Returns true if this `Pageable::get` must fail
    pub fn take_pageable_failure(&self) -> bool {
        take_one(&self.state.pageable_failures)
    }

    /// Returns true if this record creation must fail
    pub fn take_record_failure(&self) -> bool {
        take_one(&self.state.record_failures)
    }
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::disabled()
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_never_fires() {
        let injector = FaultInjector::disabled();
        for _ in 0..100 {
            assert!(injector.take_swap_page());
        }
        assert!(!injector.take_pageable_failure());
        assert!(!injector.take_record_failure());
    }

    #[test]
    fn test_counted_faults() {
        let plan = FaultPlan::new()
            .with_memory_fault(MemoryFault::FailPageableGets { count: 2 })
            .with_upcall_fault(UpcallFault::FailRecordCreation { count: 1 });
        let injector = FaultInjector::new(plan);

        assert!(injector.take_pageable_failure());
        assert!(injector.take_pageable_failure());
        assert!(!injector.take_pageable_failure());

        assert!(injector.take_record_failure());
        assert!(!injector.take_record_failure());
    }

    #[test]
    fn test_clones_share_budget() {
        let injector = FaultInjector::new(
            FaultPlan::new().with_memory_fault(MemoryFault::ExhaustSwapAfter { pages: 2 }),
        );
        let other = injector.clone();
        assert!(injector.take_swap_page());
        assert!(other.take_swap_page());
        assert!(!injector.take_swap_page());
    }
}
