//! Threads
//!
//! A [`Thread`] is the schedulable unit. Its state machine is
//!
//! ```text
//! New -> Runnable <-> Running -> Waiting -> Runnable ... -> Terminated
//! ```
//!
//! `Terminated` is absorbing. The scheduler owns every `Thread` and drives
//! all transitions; this module only holds the per-thread data.

use core_types::{MonitorId, ProcessId, ThreadId, VirtRange};
use serde::{Deserialize, Serialize};

pub const PRIORITY_LOWEST: u8 = 1;
pub const PRIORITY_NORMAL: u8 = 15;
pub const PRIORITY_HIGHEST: u8 = 31;

/// Thread lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreadState {
    New,
    Runnable,
    Running,
    Waiting,
    Terminated,
}

bitflags::bitflags! {
    /// Cancellation attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CancelFlags: u32 {
        /// Cancellation is honored at all
        const ENABLE = 0x1;
        /// Cancellation terminates the thread without waiting for a test point
        const ASYNCHRONOUS = 0x2;
        /// A cancellation is pending
        const REQUESTED = 0x4;
    }
}

/// What a waiting thread is blocked on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitReason {
    /// Acquiring a monitor owned by another thread
    Monitor(MonitorId),
    /// Waiting on a monitor's condition queue
    Condition(MonitorId),
    /// Waiting for another thread to terminate
    Join(ThreadId),
    /// Sleeping until the given tick
    Sleep { until: u64 },
    /// Waiting for a process to exit
    Process(ProcessId),
}

/// One nested cross-process call in flight on a thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpcallFrame {
    pub client: ProcessId,
    pub server: ProcessId,
    /// Set when the thread exits while running in the server
    pub exit_code: Option<i32>,
}

/// A schedulable thread
#[derive(Debug, Clone)]
pub struct Thread {
    pub id: ThreadId,
    pub state: ThreadState,
    pub base_priority: u8,
    /// Base priority raised by inheritance from held monitors
    pub priority: u8,
    pub cancel: CancelFlags,
    /// Monitors owned by this thread, in acquisition order
    pub held_monitors: Vec<MonitorId>,
    pub blocked_on: Option<WaitReason>,
    /// Monitor and lock count to restore after a condition wait
    pub pending_reacquire: Option<(MonitorId, u32)>,
    /// Set once `unlock_all_monitors` has run
    pub monitors_released: bool,
    /// Owning process; `None` for kernel threads
    pub process: Option<ProcessId>,
    /// Address space the thread currently runs in
    pub current_process: Option<ProcessId>,
    pub user_stack: Option<VirtRange>,
    pub entry: u64,
    pub arg: u64,
    /// Initial user frame words, pushed by the creator
    pub frame: Vec<u64>,
    /// Active upcalls, innermost last
    pub upcalls: Vec<UpcallFrame>,
    pub exit_value: Option<i32>,
    pub join_waiters: Vec<ThreadId>,
    pub refs: u32,
    pub core: Option<usize>,
    pub ticks_in_quantum: u64,
}

impl Thread {
    pub fn new(process: Option<ProcessId>, entry: u64, arg: u64) -> Self {
        Self {
            id: ThreadId::new(),
            state: ThreadState::New,
            base_priority: PRIORITY_NORMAL,
            priority: PRIORITY_NORMAL,
            cancel: CancelFlags::ENABLE,
            held_monitors: Vec::new(),
            blocked_on: None,
            pending_reacquire: None,
            monitors_released: false,
            process,
            current_process: process,
            user_stack: None,
            entry,
            arg,
            frame: Vec::new(),
            upcalls: Vec::new(),
            exit_value: None,
            join_waiters: Vec::new(),
            refs: 1,
            core: None,
            ticks_in_quantum: 0,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state == ThreadState::Terminated
    }

    pub fn in_upcall(&self) -> bool {
        !self.upcalls.is_empty()
    }

    /// True if a pending cancellation should take effect now
    pub fn cancel_pending(&self) -> bool {
        self.cancel
            .contains(CancelFlags::ENABLE | CancelFlags::REQUESTED)
    }

    pub fn holds(&self, monitor: MonitorId) -> bool {
        self.held_monitors.contains(&monitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_thread_defaults() {
        let pid = ProcessId::new();
        let thread = Thread::new(Some(pid), 0x1000, 7);
        assert_eq!(thread.state, ThreadState::New);
        assert_eq!(thread.priority, PRIORITY_NORMAL);
        assert_eq!(thread.current_process, Some(pid));
        assert!(thread.cancel.contains(CancelFlags::ENABLE));
        assert!(!thread.cancel_pending());
        assert_eq!(thread.refs, 1);
    }

    #[test]
    fn test_cancel_pending_needs_enable() {
        let mut thread = Thread::new(None, 0, 0);
        thread.cancel = CancelFlags::REQUESTED;
        assert!(!thread.cancel_pending());
        thread.cancel |= CancelFlags::ENABLE;
        assert!(thread.cancel_pending());
    }
}
