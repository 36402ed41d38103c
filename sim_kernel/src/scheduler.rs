//! Scheduler
//!
//! The scheduler owns every [`Thread`] and [`Monitor`] and performs all
//! state transitions. Holding its lock stands in for raising the interrupt
//! level: nothing else can observe a thread half way through a transition.
//!
//! ## Philosophy
//!
//! - **Determinism first**: same calls and same ticks give the same
//!   schedule.
//! - **No hidden suspension**: a blocking operation returns `Blocked` and
//!   the caller re-issues it once the thread is woken.
//! - **Explicit wait-for graph**: priority inheritance and deadlock
//!   detection walk `blocked_on` edges, bounded by `max_priority_chain`.
//!
//! ## Design
//!
//! - One FIFO run queue per priority level; the highest level wins.
//! - One running slot per core.
//! - A thread runs for `quantum_ticks` before it is preempted in favor of a
//!   runnable thread of equal or higher priority.

use crate::monitor::Monitor;
use crate::thread::{
    CancelFlags, Thread, ThreadState, UpcallFrame, WaitReason, PRIORITY_HIGHEST, PRIORITY_LOWEST,
};
use core_types::{MonitorId, ProcessId, ThreadId, VirtRange};
use kernel_api::errno::ECANCELED;
use kernel_api::KernelError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

/// Exit value of a cancelled thread
pub const CANCELED_EXIT_VALUE: i32 = -ECANCELED;

/// Identifier for a CPU core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoreId(pub usize);

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub cores: usize,
    /// Ticks a thread may run before being preempted
    pub quantum_ticks: u64,
    /// Longest wait-for chain followed by priority propagation
    pub max_priority_chain: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cores: 1,
            quantum_ticks: 10,
            max_priority_chain: 64,
        }
    }
}

/// Scheduling event for the audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleEvent {
    ThreadSelected {
        thread_id: ThreadId,
        core_id: CoreId,
        timestamp_ticks: u64,
    },
    ThreadPreempted {
        thread_id: ThreadId,
        core_id: CoreId,
        reason: PreemptionReason,
        timestamp_ticks: u64,
    },
    ThreadBlocked {
        thread_id: ThreadId,
        reason: WaitReason,
        timestamp_ticks: u64,
    },
    ThreadWoken {
        thread_id: ThreadId,
        timestamp_ticks: u64,
    },
    ThreadExited {
        thread_id: ThreadId,
        exit_value: i32,
        timestamp_ticks: u64,
    },
    CancelRequested {
        thread_id: ThreadId,
        asynchronous: bool,
        timestamp_ticks: u64,
    },
    PriorityChanged {
        thread_id: ThreadId,
        from: u8,
        to: u8,
        timestamp_ticks: u64,
    },
}

/// Reason for preemption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreemptionReason {
    QuantumExpired,
    Yielded,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("No such thread: {0}")]
    NoSuchThread(ThreadId),

    #[error("No such monitor: {0}")]
    NoSuchMonitor(MonitorId),

    #[error("No such core: {0}")]
    NoSuchCore(usize),

    #[error("{thread} is {state:?}")]
    InvalidState { thread: ThreadId, state: ThreadState },

    #[error("{thread} does not own {monitor}")]
    NotOwner { thread: ThreadId, monitor: MonitorId },

    #[error("{0} would wait on itself")]
    WouldDeadlock(ThreadId),
}

impl From<SchedulerError> for KernelError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::NoSuchThread(_)
            | SchedulerError::NoSuchMonitor(_)
            | SchedulerError::NoSuchCore(_) => KernelError::BadDescriptor(err.to_string()),
            SchedulerError::InvalidState { .. }
            | SchedulerError::NotOwner { .. }
            | SchedulerError::WouldDeadlock(_) => KernelError::InvalidArgument(err.to_string()),
        }
    }
}

/// Result of `join`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Exited(i32),
    Blocked,
}

/// Result of `lock`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    Blocked,
}

/// Result of `wait`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Released the monitor and joined the condition queue
    Waiting,
    /// Re-issued after a notify and got the monitor back
    Reacquired,
    /// Re-issued after a notify but the monitor is taken
    Blocked,
}

/// What is left to clean up after a thread terminates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detached {
    pub thread: ThreadId,
    pub process: Option<ProcessId>,
    pub user_stack: Option<VirtRange>,
}

/// Result of `exit`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Terminated(Detached),
    /// The thread was inside an upcall; the call returns to the client
    ReturnedFromUpcall(i32),
}

pub struct Scheduler {
    config: SchedulerConfig,
    threads: HashMap<ThreadId, Thread>,
    monitors: HashMap<MonitorId, Monitor>,
    run_queues: Vec<VecDeque<ThreadId>>,
    cores: Vec<Option<ThreadId>>,
    current_ticks: u64,
    audit_log: Vec<ScheduleEvent>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        let cores = config.cores.max(1);
        Self {
            config,
            threads: HashMap::new(),
            monitors: HashMap::new(),
            run_queues: (0..=PRIORITY_HIGHEST).map(|_| VecDeque::new()).collect(),
            cores: vec![None; cores],
            current_ticks: 0,
            audit_log: Vec::new(),
        }
    }

    fn thread(&self, id: ThreadId) -> Result<&Thread, SchedulerError> {
        self.threads.get(&id).ok_or(SchedulerError::NoSuchThread(id))
    }

    fn thread_mut(&mut self, id: ThreadId) -> Result<&mut Thread, SchedulerError> {
        self.threads
            .get_mut(&id)
            .ok_or(SchedulerError::NoSuchThread(id))
    }

    fn monitor_mut(&mut self, id: MonitorId) -> Result<&mut Monitor, SchedulerError> {
        self.monitors
            .get_mut(&id)
            .ok_or(SchedulerError::NoSuchMonitor(id))
    }

    pub fn get(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(&id)
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(&id)
    }

    pub fn state(&self, id: ThreadId) -> Option<ThreadState> {
        self.threads.get(&id).map(|t| t.state)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Threads belonging to a process
    pub fn threads_of(&self, process: ProcessId) -> Vec<ThreadId> {
        let mut ids: Vec<ThreadId> = self
            .threads
            .values()
            .filter(|t| t.process == Some(process))
            .map(|t| t.id)
            .collect();
        ids.sort();
        ids
    }

    /// Registers a new thread in the `New` state
    pub fn add(&mut self, thread: Thread) -> ThreadId {
        let id = thread.id;
        self.threads.insert(id, thread);
        id
    }

    pub fn create_thread(&mut self, process: Option<ProcessId>, entry: u64, arg: u64) -> ThreadId {
        self.add(Thread::new(process, entry, arg))
    }

    /// Makes a new thread runnable
    ///
    /// The scheduler holds a reference on the thread until it terminates.
    pub fn start(&mut self, id: ThreadId) -> Result<(), SchedulerError> {
        let thread = self.thread_mut(id)?;
        if thread.state != ThreadState::New {
            return Err(SchedulerError::InvalidState {
                thread: id,
                state: thread.state,
            });
        }
        thread.state = ThreadState::Runnable;
        thread.refs += 1;
        self.enqueue(id);
        Ok(())
    }

    fn enqueue(&mut self, id: ThreadId) {
        if let Some(thread) = self.threads.get(&id) {
            self.run_queues[thread.priority as usize].push_back(id);
        }
    }

    fn dequeue(&mut self, id: ThreadId) {
        for queue in self.run_queues.iter_mut() {
            queue.retain(|t| *t != id);
        }
    }

    fn pop_next(&mut self) -> Option<ThreadId> {
        self.run_queues
            .iter_mut()
            .rev()
            .find_map(|queue| queue.pop_front())
    }

    fn highest_runnable(&self) -> Option<u8> {
        self.run_queues
            .iter()
            .rposition(|queue| !queue.is_empty())
            .map(|p| p as u8)
    }

    fn check_core(&self, core: CoreId) -> Result<(), SchedulerError> {
        if core.0 < self.cores.len() {
            Ok(())
        } else {
            Err(SchedulerError::NoSuchCore(core.0))
        }
    }

    fn preempt_on(&mut self, core: CoreId, reason: PreemptionReason) -> Option<ThreadId> {
        let id = self.cores.get_mut(core.0)?.take()?;
        let thread = self.threads.get_mut(&id)?;
        if thread.state != ThreadState::Running {
            return None;
        }
        thread.state = ThreadState::Runnable;
        thread.core = None;
        thread.ticks_in_quantum = 0;
        self.enqueue(id);
        self.audit_log.push(ScheduleEvent::ThreadPreempted {
            thread_id: id,
            core_id: core,
            reason,
            timestamp_ticks: self.current_ticks,
        });
        Some(id)
    }

    fn dispatch(&mut self, id: ThreadId, core: CoreId) {
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.state = ThreadState::Running;
            thread.core = Some(core.0);
            thread.ticks_in_quantum = 0;
            self.cores[core.0] = Some(id);
            self.audit_log.push(ScheduleEvent::ThreadSelected {
                thread_id: id,
                core_id: core,
                timestamp_ticks: self.current_ticks,
            });
        }
    }

    /// Runs a specific runnable thread on a core
    pub fn run(&mut self, id: ThreadId, core: CoreId) -> Result<(), SchedulerError> {
        self.check_core(core)?;
        let thread = self.thread(id)?;
        match (thread.state, thread.core) {
            (ThreadState::Running, Some(c)) if c == core.0 => return Ok(()),
            (ThreadState::Runnable, _) => {}
            (state, _) => return Err(SchedulerError::InvalidState { thread: id, state }),
        }
        self.preempt_on(core, PreemptionReason::Yielded);
        self.dequeue(id);
        self.dispatch(id, core);
        Ok(())
    }

    /// Yields the core and runs the highest-priority runnable thread
    pub fn schedule(&mut self, core: CoreId) -> Option<ThreadId> {
        self.check_core(core).ok()?;
        self.preempt_on(core, PreemptionReason::Yielded);
        let next = self.pop_next()?;
        self.dispatch(next, core);
        Some(next)
    }

    /// Thread running on a core
    pub fn current(&self, core: CoreId) -> Option<ThreadId> {
        self.cores.get(core.0).copied().flatten()
    }

    pub fn ticks(&self) -> u64 {
        self.current_ticks
    }

    /// Advances time, waking sleepers and preempting expired quanta
    pub fn tick(&mut self, delta: u64) {
        self.current_ticks = self.current_ticks.saturating_add(delta);
        for id in self.cores.iter().flatten() {
            if let Some(thread) = self.threads.get_mut(id) {
                thread.ticks_in_quantum += delta;
            }
        }

        let now = self.current_ticks;
        let mut sleepers: Vec<(u64, ThreadId)> = self
            .threads
            .values()
            .filter_map(|t| match t.blocked_on {
                Some(WaitReason::Sleep { until }) if until <= now => Some((until, t.id)),
                _ => None,
            })
            .collect();
        sleepers.sort();
        for (_, id) in sleepers {
            self.wake(id);
        }

        for core in 0..self.cores.len() {
            let core = CoreId(core);
            let (quantum_used, priority) = match self.current(core).and_then(|id| self.get(id)) {
                Some(thread) => (thread.ticks_in_quantum, thread.priority),
                None => continue,
            };
            let contender = self.highest_runnable().map(|p| p >= priority);
            if quantum_used >= self.config.quantum_ticks && contender == Some(true) {
                self.preempt_on(core, PreemptionReason::QuantumExpired);
                if let Some(next) = self.pop_next() {
                    self.dispatch(next, core);
                }
            }
        }
    }

    /// Moves a thread to `Waiting`
    pub fn block(&mut self, id: ThreadId, reason: WaitReason) -> Result<(), SchedulerError> {
        match reason {
            WaitReason::Monitor(m) | WaitReason::Condition(m) if !self.monitors.contains_key(&m) => {
                return Err(SchedulerError::NoSuchMonitor(m));
            }
            WaitReason::Join(target) if !self.threads.contains_key(&target) => {
                return Err(SchedulerError::NoSuchThread(target));
            }
            _ => {}
        }
        let thread = self.thread_mut(id)?;
        if !matches!(thread.state, ThreadState::Runnable | ThreadState::Running) {
            return Err(SchedulerError::InvalidState {
                thread: id,
                state: thread.state,
            });
        }
        let core = thread.core.take();
        thread.state = ThreadState::Waiting;
        thread.blocked_on = Some(reason);
        thread.ticks_in_quantum = 0;
        if let Some(core) = core {
            self.cores[core] = None;
        }
        self.dequeue(id);

        match reason {
            WaitReason::Monitor(m) => self.monitor_mut(m)?.waiters.push(id),
            WaitReason::Condition(m) => self.monitor_mut(m)?.cond_waiters.push(id),
            WaitReason::Join(target) => self.thread_mut(target)?.join_waiters.push(id),
            WaitReason::Sleep { .. } | WaitReason::Process(_) => {}
        }
        self.audit_log.push(ScheduleEvent::ThreadBlocked {
            thread_id: id,
            reason,
            timestamp_ticks: self.current_ticks,
        });
        if let WaitReason::Monitor(m) = reason {
            if let Some(owner) = self.monitors.get(&m).and_then(|mon| mon.owner) {
                self.update_priority(owner);
            }
        }
        Ok(())
    }

    fn unlink(&mut self, id: ThreadId, reason: WaitReason) {
        match reason {
            WaitReason::Monitor(m) | WaitReason::Condition(m) => {
                if let Some(monitor) = self.monitors.get_mut(&m) {
                    monitor.forget(id);
                }
            }
            WaitReason::Join(target) => {
                if let Some(target) = self.threads.get_mut(&target) {
                    target.join_waiters.retain(|t| *t != id);
                }
            }
            WaitReason::Sleep { .. } | WaitReason::Process(_) => {}
        }
    }

    /// Makes a waiting thread runnable; false if it was not waiting
    pub fn wake(&mut self, id: ThreadId) -> bool {
        let reason = match self.threads.get_mut(&id) {
            Some(thread) if thread.state == ThreadState::Waiting => {
                thread.state = ThreadState::Runnable;
                thread.blocked_on.take()
            }
            _ => return false,
        };
        if let Some(reason) = reason {
            self.unlink(id, reason);
        }
        self.enqueue(id);
        self.audit_log.push(ScheduleEvent::ThreadWoken {
            thread_id: id,
            timestamp_ticks: self.current_ticks,
        });
        if let Some(WaitReason::Monitor(m)) = reason {
            if let Some(owner) = self.monitors.get(&m).and_then(|mon| mon.owner) {
                self.update_priority(owner);
            }
        }
        true
    }

    pub fn sleep(&mut self, id: ThreadId, ticks: u64) -> Result<(), SchedulerError> {
        if ticks == 0 {
            self.thread(id)?;
            return Ok(());
        }
        let until = self.current_ticks.saturating_add(ticks);
        self.block(id, WaitReason::Sleep { until })
    }

    /// Exits the thread, or returns from the innermost upcall
    pub fn exit(&mut self, id: ThreadId, value: i32) -> Result<ExitOutcome, SchedulerError> {
        let thread = self.thread_mut(id)?;
        if thread.is_terminated() {
            return Err(SchedulerError::InvalidState {
                thread: id,
                state: thread.state,
            });
        }
        if let Some(frame) = thread.upcalls.last_mut() {
            frame.exit_code = Some(value);
            return Ok(ExitOutcome::ReturnedFromUpcall(value));
        }
        self.terminate(id, value).map(ExitOutcome::Terminated)
    }

    fn terminate(&mut self, id: ThreadId, value: i32) -> Result<Detached, SchedulerError> {
        let thread = self.thread_mut(id)?;
        let previous = thread.state;
        if previous == ThreadState::Terminated {
            return Err(SchedulerError::InvalidState {
                thread: id,
                state: previous,
            });
        }
        let core = thread.core.take();
        let reason = thread.blocked_on.take();
        thread.pending_reacquire = None;
        if let Some(core) = core {
            self.cores[core] = None;
        }
        if let Some(reason) = reason {
            self.unlink(id, reason);
        }
        self.dequeue(id);
        self.unlock_all_monitors(id);

        let thread = self.thread_mut(id)?;
        thread.state = ThreadState::Terminated;
        thread.exit_value = Some(value);
        let joiners = std::mem::take(&mut thread.join_waiters);
        let detached = Detached {
            thread: id,
            process: thread.process,
            user_stack: thread.user_stack,
        };
        for joiner in joiners {
            self.wake(joiner);
        }
        self.audit_log.push(ScheduleEvent::ThreadExited {
            thread_id: id,
            exit_value: value,
            timestamp_ticks: self.current_ticks,
        });
        if let Some(WaitReason::Monitor(m)) = reason {
            if let Some(owner) = self.monitors.get(&m).and_then(|mon| mon.owner) {
                self.update_priority(owner);
            }
        }
        if previous != ThreadState::New {
            self.release(id);
        }
        Ok(detached)
    }

    pub fn add_ref(&mut self, id: ThreadId) -> u32 {
        match self.threads.get_mut(&id) {
            Some(thread) => {
                thread.refs += 1;
                thread.refs
            }
            None => 0,
        }
    }

    /// Drops a reference; a thread that is done and unreferenced is reaped
    pub fn release(&mut self, id: ThreadId) -> u32 {
        let thread = match self.threads.get_mut(&id) {
            Some(thread) => thread,
            None => return 0,
        };
        thread.refs = thread.refs.saturating_sub(1);
        let refs = thread.refs;
        if refs == 0 && matches!(thread.state, ThreadState::Terminated | ThreadState::New) {
            self.threads.remove(&id);
            log::trace!("reaped {}", id);
        }
        refs
    }

    /// Requests cancellation
    ///
    /// Returns the detached thread if cancellation terminated it at once.
    pub fn cancel(&mut self, id: ThreadId) -> Result<Option<Detached>, SchedulerError> {
        let now = self.current_ticks;
        let thread = self.thread_mut(id)?;
        if thread.is_terminated() || !thread.cancel.contains(CancelFlags::ENABLE) {
            return Ok(None);
        }
        let asynchronous = thread.cancel.contains(CancelFlags::ASYNCHRONOUS);
        let immediate = asynchronous
            && matches!(thread.state, ThreadState::Waiting | ThreadState::Runnable)
            && !thread.in_upcall();
        thread.cancel |= CancelFlags::REQUESTED;
        let waiting = thread.state == ThreadState::Waiting;
        self.audit_log.push(ScheduleEvent::CancelRequested {
            thread_id: id,
            asynchronous,
            timestamp_ticks: now,
        });
        if immediate {
            return self.terminate(id, CANCELED_EXIT_VALUE).map(Some);
        }
        if waiting {
            self.wake(id);
        }
        Ok(None)
    }

    /// Terminates the thread if a cancellation is pending
    pub fn test_cancel(&mut self, id: ThreadId) -> Result<Option<Detached>, SchedulerError> {
        let thread = self.thread(id)?;
        if thread.is_terminated() || !thread.cancel_pending() || thread.in_upcall() {
            return Ok(None);
        }
        self.terminate(id, CANCELED_EXIT_VALUE).map(Some)
    }

    /// Enables or disables cancellation; returns the previous setting
    pub fn set_cancel_state(&mut self, id: ThreadId, enable: bool) -> Result<bool, SchedulerError> {
        let thread = self.thread_mut(id)?;
        let previous = thread.cancel.contains(CancelFlags::ENABLE);
        thread.cancel.set(CancelFlags::ENABLE, enable);
        Ok(previous)
    }

    /// Selects asynchronous or deferred cancellation; returns the previous setting
    pub fn set_cancel_type(
        &mut self,
        id: ThreadId,
        asynchronous: bool,
    ) -> Result<bool, SchedulerError> {
        let thread = self.thread_mut(id)?;
        let previous = thread.cancel.contains(CancelFlags::ASYNCHRONOUS);
        thread.cancel.set(CancelFlags::ASYNCHRONOUS, asynchronous);
        Ok(previous)
    }

    /// Waits for `target` to terminate
    ///
    /// Re-issue after `Blocked` once the caller is woken.
    pub fn join(&mut self, id: ThreadId, target: ThreadId) -> Result<JoinOutcome, SchedulerError> {
        if id == target {
            return Err(SchedulerError::WouldDeadlock(id));
        }
        let t = self.thread(target)?;
        if t.is_terminated() {
            return Ok(JoinOutcome::Exited(t.exit_value.unwrap_or(0)));
        }
        self.block(id, WaitReason::Join(target))?;
        Ok(JoinOutcome::Blocked)
    }

    /// Sets the base priority; returns the previous one
    pub fn set_priority(&mut self, id: ThreadId, priority: u8) -> Result<u8, SchedulerError> {
        let priority = priority.clamp(PRIORITY_LOWEST, PRIORITY_HIGHEST);
        let thread = self.thread_mut(id)?;
        let previous = thread.base_priority;
        thread.base_priority = priority;
        self.update_priority(id);
        Ok(previous)
    }

    pub fn priority(&self, id: ThreadId) -> Option<u8> {
        self.threads.get(&id).map(|t| t.priority)
    }

    /// Highest effective priority among the threads blocked on a monitor
    pub fn monitor_priority(&self, monitor: MonitorId) -> u8 {
        self.monitors
            .get(&monitor)
            .map(|m| {
                m.waiters
                    .iter()
                    .filter_map(|w| self.threads.get(w))
                    .map(|t| t.priority)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    fn inherited_priority(&self, id: ThreadId) -> u8 {
        match self.threads.get(&id) {
            Some(thread) => thread
                .held_monitors
                .iter()
                .map(|m| self.monitor_priority(*m))
                .fold(thread.base_priority, u8::max),
            None => 0,
        }
    }

    /// Recomputes the effective priority and propagates it along the chain
    pub fn update_priority(&mut self, id: ThreadId) {
        let mut next = Some(id);
        let mut steps = 0usize;
        while let Some(current) = next {
            if steps >= self.config.max_priority_chain {
                log::warn!("priority chain from {} longer than {}", id, steps);
                break;
            }
            steps += 1;
            let wanted = self.inherited_priority(current);
            if self.priority(current) == Some(wanted) {
                break;
            }
            next = self.set_effective_priority(current, wanted);
        }
    }

    /// Drops inherited priority back to what the held monitors justify
    pub fn reset_priority(&mut self, id: ThreadId) {
        self.update_priority(id);
    }

    /// Sets the effective priority and repositions the thread
    ///
    /// Returns the owner of the monitor the thread is blocked on, whose
    /// priority must be recomputed next.
    pub fn set_effective_priority(&mut self, id: ThreadId, priority: u8) -> Option<ThreadId> {
        let now = self.current_ticks;
        let thread = self.threads.get_mut(&id)?;
        let from = thread.priority;
        let runnable = thread.state == ThreadState::Runnable;
        thread.priority = priority;
        let blocked_on = thread.blocked_on;
        if runnable {
            self.dequeue(id);
            self.enqueue(id);
        }
        self.audit_log.push(ScheduleEvent::PriorityChanged {
            thread_id: id,
            from,
            to: priority,
            timestamp_ticks: now,
        });
        match blocked_on {
            Some(WaitReason::Monitor(m)) => self
                .monitors
                .get(&m)
                .and_then(|mon| mon.owner)
                .filter(|owner| *owner != id),
            _ => None,
        }
    }

    /// Follows the wait-for chain from `id` looking for a cycle back to it
    pub fn is_deadlocked(&self, id: ThreadId) -> bool {
        let mut current = id;
        for _ in 0..self.config.max_priority_chain {
            let next = match self.threads.get(&current).and_then(|t| t.blocked_on) {
                Some(WaitReason::Monitor(m)) => self.monitors.get(&m).and_then(|mon| mon.owner),
                Some(WaitReason::Join(target)) => Some(target),
                _ => None,
            };
            match next {
                Some(next) if next == id => return true,
                Some(next) => current = next,
                None => return false,
            }
        }
        false
    }

    pub fn holds_lock(&self, id: ThreadId, monitor: MonitorId) -> bool {
        self.threads
            .get(&id)
            .map(|t| t.holds(monitor))
            .unwrap_or(false)
    }

    pub fn create_monitor(&mut self) -> MonitorId {
        let monitor = Monitor::new();
        let id = monitor.id;
        self.monitors.insert(id, monitor);
        id
    }

    pub fn monitor(&self, id: MonitorId) -> Option<&Monitor> {
        self.monitors.get(&id)
    }

    pub fn monitor_add_ref(&mut self, id: MonitorId) -> u32 {
        match self.monitors.get_mut(&id) {
            Some(monitor) => {
                monitor.refs += 1;
                monitor.refs
            }
            None => 0,
        }
    }

    /// Drops a reference; the last one destroys the monitor
    pub fn monitor_release(&mut self, id: MonitorId) -> u32 {
        let monitor = match self.monitors.get_mut(&id) {
            Some(monitor) => monitor,
            None => return 0,
        };
        monitor.refs = monitor.refs.saturating_sub(1);
        if monitor.refs > 0 {
            return monitor.refs;
        }
        if let Some(monitor) = self.monitors.remove(&id) {
            if let Some(owner) = monitor.owner.and_then(|o| self.threads.get_mut(&o)) {
                owner.held_monitors.retain(|m| *m != id);
            }
            for waiter in monitor.waiters.iter().chain(monitor.cond_waiters.iter()) {
                self.wake(*waiter);
            }
            if let Some(owner) = monitor.owner {
                self.update_priority(owner);
            }
        }
        0
    }

    fn acquire(&mut self, id: ThreadId, monitor: MonitorId, count: u32) -> Result<(), SchedulerError> {
        let m = self.monitor_mut(monitor)?;
        m.owner = Some(id);
        m.lock_count = count;
        self.thread_mut(id)?.held_monitors.push(monitor);
        self.update_priority(id);
        Ok(())
    }

    /// Acquires a monitor, recursively if already owned
    pub fn lock(&mut self, id: ThreadId, monitor: MonitorId) -> Result<LockOutcome, SchedulerError> {
        self.thread(id)?;
        match self.monitor_mut(monitor)?.owner {
            None => {
                self.acquire(id, monitor, 1)?;
                Ok(LockOutcome::Acquired)
            }
            Some(owner) if owner == id => {
                self.monitor_mut(monitor)?.lock_count += 1;
                Ok(LockOutcome::Acquired)
            }
            Some(_) => {
                self.block(id, WaitReason::Monitor(monitor))?;
                Ok(LockOutcome::Blocked)
            }
        }
    }

    pub fn try_lock(&mut self, id: ThreadId, monitor: MonitorId) -> Result<bool, SchedulerError> {
        self.thread(id)?;
        match self.monitor_mut(monitor)?.owner {
            None => {
                self.acquire(id, monitor, 1)?;
                Ok(true)
            }
            Some(owner) if owner == id => {
                self.monitor_mut(monitor)?.lock_count += 1;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    fn check_owner(&self, id: ThreadId, monitor: MonitorId) -> Result<u32, SchedulerError> {
        let m = self
            .monitors
            .get(&monitor)
            .ok_or(SchedulerError::NoSuchMonitor(monitor))?;
        if m.owner != Some(id) {
            return Err(SchedulerError::NotOwner {
                thread: id,
                monitor,
            });
        }
        Ok(m.lock_count)
    }

    fn release_lock(&mut self, id: ThreadId, monitor: MonitorId) {
        let waiters = match self.monitors.get_mut(&monitor) {
            Some(m) => {
                m.owner = None;
                m.lock_count = 0;
                std::mem::take(&mut m.waiters)
            }
            None => Vec::new(),
        };
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.held_monitors.retain(|m| *m != monitor);
        }
        for waiter in waiters {
            self.wake(waiter);
        }
        self.reset_priority(id);
    }

    pub fn unlock(&mut self, id: ThreadId, monitor: MonitorId) -> Result<(), SchedulerError> {
        self.check_owner(id, monitor)?;
        let m = self.monitor_mut(monitor)?;
        m.lock_count -= 1;
        if m.lock_count == 0 {
            self.release_lock(id, monitor);
        }
        Ok(())
    }

    /// Waits on the monitor's condition
    ///
    /// The first call releases the monitor completely and returns
    /// `Waiting`. Once notified the thread re-issues the call, which takes
    /// the monitor back with its previous lock count.
    pub fn wait(&mut self, id: ThreadId, monitor: MonitorId) -> Result<WaitOutcome, SchedulerError> {
        let pending = self.thread(id)?.pending_reacquire;
        if let Some((m, count)) = pending.filter(|(m, _)| *m == monitor) {
            let owner = self
                .monitors
                .get(&m)
                .ok_or(SchedulerError::NoSuchMonitor(m))?
                .owner;
            return match owner {
                None => {
                    self.thread_mut(id)?.pending_reacquire = None;
                    self.acquire(id, m, count)?;
                    Ok(WaitOutcome::Reacquired)
                }
                Some(owner) if owner == id => {
                    self.thread_mut(id)?.pending_reacquire = None;
                    Ok(WaitOutcome::Reacquired)
                }
                Some(_) => {
                    self.block(id, WaitReason::Monitor(m))?;
                    Ok(WaitOutcome::Blocked)
                }
            };
        }

        let count = self.check_owner(id, monitor)?;
        self.release_lock(id, monitor);
        self.thread_mut(id)?.pending_reacquire = Some((monitor, count));
        self.block(id, WaitReason::Condition(monitor))?;
        Ok(WaitOutcome::Waiting)
    }

    /// Wakes one condition waiter; false if there was none
    pub fn notify(&mut self, id: ThreadId, monitor: MonitorId) -> Result<bool, SchedulerError> {
        self.check_owner(id, monitor)?;
        let m = self.monitor_mut(monitor)?;
        if m.cond_waiters.is_empty() {
            return Ok(false);
        }
        let waiter = m.cond_waiters.remove(0);
        self.wake(waiter);
        Ok(true)
    }

    /// Wakes every condition waiter; returns how many
    pub fn notify_all(&mut self, id: ThreadId, monitor: MonitorId) -> Result<usize, SchedulerError> {
        self.check_owner(id, monitor)?;
        let waiters = std::mem::take(&mut self.monitor_mut(monitor)?.cond_waiters);
        let count = waiters.len();
        for waiter in waiters {
            self.wake(waiter);
        }
        Ok(count)
    }

    /// Releases every monitor the thread holds; runs at most once
    pub fn unlock_all_monitors(&mut self, id: ThreadId) {
        let held = match self.threads.get_mut(&id) {
            Some(thread) if !thread.monitors_released => {
                thread.monitors_released = true;
                thread.held_monitors.clone()
            }
            _ => return,
        };
        for monitor in held {
            self.release_lock(id, monitor);
        }
    }

    pub fn push_upcall(&mut self, id: ThreadId, frame: UpcallFrame) -> Result<(), SchedulerError> {
        let thread = self.thread_mut(id)?;
        thread.current_process = Some(frame.server);
        thread.upcalls.push(frame);
        Ok(())
    }

    /// Pops the innermost upcall and switches back to its client
    pub fn pop_upcall(&mut self, id: ThreadId) -> Option<UpcallFrame> {
        let thread = self.threads.get_mut(&id)?;
        let frame = thread.upcalls.pop()?;
        thread.current_process = Some(frame.client);
        Some(frame)
    }

    pub fn innermost_upcall(&self, id: ThreadId) -> Option<&UpcallFrame> {
        self.threads.get(&id).and_then(|t| t.upcalls.last())
    }

    pub fn audit_log(&self) -> &[ScheduleEvent] {
        &self.audit_log
    }

    pub fn clear_audit_log(&mut self) {
        self.audit_log.clear();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
