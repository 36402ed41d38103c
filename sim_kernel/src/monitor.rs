//! Monitors
//!
//! A monitor is a recursive lock with one condition queue. Threads blocked
//! on the lock are the waiters whose priority the owner inherits; threads
//! on the condition queue do not donate priority.

use core_types::{MonitorId, ThreadId};

#[derive(Debug, Clone)]
pub struct Monitor {
    pub id: MonitorId,
    pub owner: Option<ThreadId>,
    pub lock_count: u32,
    /// Threads blocked acquiring the lock
    pub waiters: Vec<ThreadId>,
    /// Threads in `wait`
    pub cond_waiters: Vec<ThreadId>,
    pub refs: u32,
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            id: MonitorId::new(),
            owner: None,
            lock_count: 0,
            waiters: Vec::new(),
            cond_waiters: Vec::new(),
            refs: 1,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.owner.is_some()
    }

    /// Removes a thread from both queues
    pub fn forget(&mut self, thread: ThreadId) {
        self.waiters.retain(|t| *t != thread);
        self.cond_waiters.retain(|t| *t != thread);
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}
