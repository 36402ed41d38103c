//! Kernel Audit Trail
//!
//! Records what the dispatch paths did, in order, for verification in tests.
//!
//! ## Philosophy
//!
//! - Test-facing: this is not diagnostic logging; `log` covers that
//! - Deterministic: events are stamped with scheduler ticks, not wall time
//! - Queryable: tests assert on the trail with predicates
//!
//! ## Example
//!
//! ```
//! use sim_kernel::kernel_audit::{KernelAuditLog, KernelEvent};
//! use core_types::ProcessId;
//!
//! let mut audit_log = KernelAuditLog::new();
//! let process = ProcessId::new();
//! audit_log.record(3, KernelEvent::ProcessCreated { process });
//!
//! assert_eq!(audit_log.len(), 1);
//! assert!(audit_log.has_event(|e| matches!(e, KernelEvent::ProcessCreated { .. })));
//! ```

use core_types::{MemoryAccessType, ProcessId, ThreadId};
use serde::{Deserialize, Serialize};

/// Something the kernel did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelEvent {
    ProcessCreated {
        process: ProcessId,
    },
    ProcessExited {
        process: ProcessId,
        status: i32,
    },
    /// The process took a fault the kernel could not resolve
    ProcessKilled {
        process: ProcessId,
        addr: u64,
    },
    ProcessDestroyed {
        process: ProcessId,
    },
    ThreadDetached {
        thread: ThreadId,
        process: ProcessId,
    },
    /// A thread switched to another process's page tables
    AddressSpaceLoaded {
        thread: ThreadId,
        process: ProcessId,
    },
    SystemCall {
        process: ProcessId,
        thread: ThreadId,
        slot: u32,
        method: String,
        errno: i32,
    },
    SlotSet {
        process: ProcessId,
        slot: u32,
        iid: String,
    },
    SlotReleased {
        process: ProcessId,
        slot: u32,
    },
    UpcallRecordInit {
        server: ProcessId,
    },
    UpcallLeap {
        thread: ThreadId,
        client: ProcessId,
        server: ProcessId,
        method: String,
    },
    UpcallReturn {
        thread: ThreadId,
        server: ProcessId,
        errno: i32,
    },
    /// `returnFromUpcall` with no upcall in flight
    StrayReturn {
        thread: ThreadId,
    },
    PageFault {
        process: ProcessId,
        addr: u64,
        access: MemoryAccessType,
        resolved: bool,
    },
}

/// A single audit event with timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelAuditEvent {
    /// Scheduler ticks when the event occurred
    pub timestamp_ticks: u64,
    pub event: KernelEvent,
}

/// Chronological record of kernel events
#[derive(Debug, Default)]
pub struct KernelAuditLog {
    events: Vec<KernelAuditEvent>,
}

impl KernelAuditLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, timestamp_ticks: u64, event: KernelEvent) {
        self.events.push(KernelAuditEvent {
            timestamp_ticks,
            event,
        });
    }

    pub fn events(&self) -> &[KernelAuditEvent] {
        &self.events
    }

    /// Events concerning one process
    pub fn events_for_process(&self, process: ProcessId) -> Vec<&KernelAuditEvent> {
        self.events
            .iter()
            .filter(|e| match &e.event {
                KernelEvent::ProcessCreated { process: p }
                | KernelEvent::ProcessExited { process: p, .. }
                | KernelEvent::ProcessKilled { process: p, .. }
                | KernelEvent::ProcessDestroyed { process: p }
                | KernelEvent::ThreadDetached { process: p, .. }
                | KernelEvent::AddressSpaceLoaded { process: p, .. }
                | KernelEvent::SystemCall { process: p, .. }
                | KernelEvent::SlotSet { process: p, .. }
                | KernelEvent::SlotReleased { process: p, .. }
                | KernelEvent::UpcallRecordInit { server: p }
                | KernelEvent::UpcallReturn { server: p, .. }
                | KernelEvent::PageFault { process: p, .. } => *p == process,
                KernelEvent::UpcallLeap { client, server, .. } => {
                    *client == process || *server == process
                }
                KernelEvent::StrayReturn { .. } => false,
            })
            .collect()
    }

    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&KernelEvent) -> bool,
    {
        self.events.iter().filter(|e| predicate(&e.event)).count()
    }

    pub fn has_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&KernelEvent) -> bool,
    {
        self.events.iter().any(|e| predicate(&e.event))
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_log_creation() {
        let log = KernelAuditLog::new();
        assert_eq!(log.len(), 0);
        assert!(log.is_empty());
    }

    #[test]
    fn test_events_for_process() {
        let mut log = KernelAuditLog::new();
        let a = ProcessId::new();
        let b = ProcessId::new();
        log.record(0, KernelEvent::ProcessCreated { process: a });
        log.record(1, KernelEvent::ProcessCreated { process: b });
        log.record(
            2,
            KernelEvent::UpcallLeap {
                thread: ThreadId::new(),
                client: a,
                server: b,
                method: "increment".to_string(),
            },
        );
        assert_eq!(log.events_for_process(a).len(), 2);
        assert_eq!(log.events_for_process(b).len(), 2);
        assert_eq!(log.events()[2].timestamp_ticks, 2);
    }

    #[test]
    fn test_count_and_clear() {
        let mut log = KernelAuditLog::new();
        let thread = ThreadId::new();
        log.record(0, KernelEvent::StrayReturn { thread });
        log.record(0, KernelEvent::StrayReturn { thread });
        assert_eq!(
            log.count_events(|e| matches!(e, KernelEvent::StrayReturn { .. })),
            2
        );
        log.clear();
        assert!(log.is_empty());
    }
}
