//! Cooperative task scheduler
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

// Wait: re-run on the next pass, the processor may sleep in between.
// Yield: the task has more work, re-run before the processor may sleep.
// Sleep: parked until a signal arrives.
// TimedWait: parked until the monotonic clock passes a deadline.
//
// All switches happen at task return, a running task is never preempted.

use core::sync::atomic::{AtomicU16, Ordering};

use log::{trace, warn};

use crate::mem::{Arena, Handle};
use crate::{time_reached, Ts};

/// Task list capacity
pub const MAX_TASKS: usize = 24;

pub const MAX_SIGNALS: u8 = 16;

/// Signal raised by the radio receive interrupt
pub const SIG_RF_RECEIVE: u8 = 0;

/// Guard region size for stack watermarking
pub const STACK_GUARD_SIZE: usize = 512;

const STACK_WARN_THRESHOLD: usize = (STACK_GUARD_SIZE / 4) * 3;
const GUARD_FILL: u8 = 0x47;

/// What a task wants the scheduler to do next
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Disposition {
    Yield,
    Wait,
    Sleep,
    TimedWait(Ts),
    Done,
}

/// Signal bit set, written from interrupt context, read from tasks
pub struct Signals {
    bits: AtomicU16,
}

impl Signals {
    pub const fn new() -> Self {
        Signals {
            bits: AtomicU16::new(0),
        }
    }

    /// ISR safe
    pub fn set(&self, signum: u8) {
        debug_assert!(signum < MAX_SIGNALS);
        self.bits.fetch_or(1 << signum, Ordering::SeqCst);
    }

    pub fn clear(&self, signum: u8) {
        debug_assert!(signum < MAX_SIGNALS);
        self.bits.fetch_and(!(1 << signum), Ordering::SeqCst);
    }

    pub fn signalled(&self, signum: u8) -> bool {
        self.snapshot() & (1 << signum) != 0
    }

    pub fn snapshot(&self) -> u16 {
        self.bits.load(Ordering::SeqCst)
    }
}

/// Per-task bookkeeping handed to the task on each run
pub struct TaskState {
    /// Resume label for the task state machine
    pub resume: u16,
    /// Arena block holding private task state, if any
    pub data: Option<Handle>,

    name: &'static str,
    signal_mask: u16,
    sleeping: bool,
    timed: bool,
    deadline: Ts,
    runs: u32,
}

impl TaskState {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn runs(&self) -> u32 {
        self.runs
    }
}

pub type TaskFn<C> = fn(&mut C, &mut TaskState) -> Disposition;

struct TaskEntry<C> {
    func: TaskFn<C>,
    state: TaskState,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TaskHandle(u8);

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum GuardLevel {
    Ok,
    Warn,
    Fatal,
}

/// Canary filled guard region, sampled once per scheduler pass
pub struct StackGuard {
    region: [u8; STACK_GUARD_SIZE],
}

impl StackGuard {
    fn new() -> Self {
        StackGuard {
            region: [GUARD_FILL; STACK_GUARD_SIZE],
        }
    }

    /// Bytes consumed from the guarded region
    pub fn usage(&self) -> usize {
        let intact = self
            .region
            .iter()
            .take_while(|v| **v == GUARD_FILL)
            .count();
        STACK_GUARD_SIZE - intact
    }

    pub fn check(&self) -> GuardLevel {
        let usage = self.usage();
        if usage >= STACK_GUARD_SIZE {
            GuardLevel::Fatal
        } else if usage >= STACK_WARN_THRESHOLD {
            GuardLevel::Warn
        } else {
            GuardLevel::Ok
        }
    }

    #[cfg(test)]
    pub(crate) fn scribble(&mut self, n: usize) {
        for v in self.region.iter_mut().take(n) {
            *v = 0;
        }
    }
}

/// Outcome of one scheduler pass
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PassResult {
    /// A task yielded, run another pass before sleeping
    pub active: bool,
    pub guard: GuardLevel,
}

pub struct Scheduler<C> {
    tasks: heapless::Vec<Option<TaskEntry<C>>, MAX_TASKS>,
    /// Data blocks of finished tasks, reaped by the owner
    reap: heapless::Vec<Handle, MAX_TASKS>,
    guard: StackGuard,
}

impl<C> Scheduler<C> {
    pub fn new() -> Self {
        Self {
            tasks: heapless::Vec::new(),
            reap: heapless::Vec::new(),
            guard: StackGuard::new(),
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_some()).count()
    }

    /// Register a task. Tasks run in spawn order each pass.
    pub fn spawn(&mut self, func: TaskFn<C>, name: &'static str) -> Result<TaskHandle, ()> {
        self.spawn_with(func, name, 0, None)
    }

    /// Register a task subscribed to a signal mask, with optional
    /// arena-backed private state
    pub fn spawn_with(
        &mut self,
        func: TaskFn<C>,
        name: &'static str,
        signal_mask: u16,
        data: Option<Handle>,
    ) -> Result<TaskHandle, ()> {
        let entry = TaskEntry {
            func,
            state: TaskState {
                resume: 0,
                data,
                name,
                signal_mask,
                sleeping: false,
                timed: false,
                deadline: 0,
                runs: 0,
            },
        };

        // reuse a vacated slot before growing the list
        if let Some(slot) = self.tasks.iter().position(|t| t.is_none()) {
            self.tasks[slot] = Some(entry);
            return Ok(TaskHandle(slot as u8));
        }

        let slot = self.tasks.len();
        if self.tasks.push(Some(entry)).is_err() {
            warn!("task list full, cannot spawn {}", name);
            return Err(());
        }

        Ok(TaskHandle(slot as u8))
    }

    /// Allocate private state in the arena and spawn with it attached
    pub fn spawn_with_state(
        &mut self,
        func: TaskFn<C>,
        name: &'static str,
        signal_mask: u16,
        state_size: usize,
        mem: &mut Arena,
    ) -> Result<TaskHandle, ()> {
        let data = match mem.alloc(state_size) {
            Ok(h) => Some(h),
            Err(_) => return Err(()),
        };
        match self.spawn_with(func, name, signal_mask, data) {
            Ok(h) => Ok(h),
            Err(_) => {
                if let Some(h) = data {
                    let _ = mem.free(h);
                }
                Err(())
            }
        }
    }

    /// Rewind a task to its initial resume label
    pub fn restart(&mut self, handle: TaskHandle) {
        if let Some(Some(entry)) = self.tasks.get_mut(handle.0 as usize) {
            entry.state.resume = 0;
            entry.state.sleeping = false;
            entry.state.timed = false;
        }
    }

    /// Remove a task, releasing its private state immediately
    pub fn kill(&mut self, handle: TaskHandle, mem: &mut Arena) {
        if let Some(slot) = self.tasks.get_mut(handle.0 as usize) {
            if let Some(entry) = slot.take() {
                if let Some(h) = entry.state.data {
                    let _ = mem.free(h);
                }
            }
        }
    }

    /// Free state blocks of tasks that returned `Done`
    pub fn reap(&mut self, mem: &mut Arena) {
        while let Some(h) = self.reap.pop() {
            let _ = mem.free(h);
        }
    }

    pub fn stack_guard(&self) -> &StackGuard {
        &self.guard
    }

    #[cfg(test)]
    pub(crate) fn stack_guard_mut(&mut self) -> &mut StackGuard {
        &mut self.guard
    }

    fn runnable(state: &TaskState, now: Ts) -> bool {
        if state.sleeping {
            return false;
        }
        if state.timed {
            return time_reached(now, state.deadline);
        }
        true
    }

    fn run_task(&mut self, ctx: &mut C, slot: usize, now: Ts) -> bool {
        let entry = match self.tasks.get_mut(slot) {
            Some(Some(e)) => e,
            _ => return false,
        };

        entry.state.sleeping = false;
        entry.state.timed = false;
        entry.state.runs = entry.state.runs.wrapping_add(1);

        let func = entry.func;
        let disposition = func(ctx, &mut entry.state);

        trace!("task {} at {} ms: {:?}", entry.state.name, now, disposition);

        match disposition {
            Disposition::Yield => true,
            Disposition::Wait => false,
            Disposition::Sleep => {
                entry.state.sleeping = true;
                false
            }
            Disposition::TimedWait(deadline) => {
                entry.state.timed = true;
                entry.state.deadline = deadline;
                false
            }
            Disposition::Done => {
                if let Some(h) = entry.state.data {
                    let _ = self.reap.push(h);
                }
                self.tasks[slot] = None;
                false
            }
        }
    }

    /// Run one scheduler pass. Signalled tasks run as soon as the signal
    /// is observed, ahead of the normal iteration order.
    pub fn run(&mut self, ctx: &mut C, now: Ts, signals: &Signals) -> PassResult {
        let mut ran: u32 = 0;
        let mut active = false;

        for i in 0..self.tasks.len() {
            // preempt iteration for pending signals
            let sig = signals.snapshot();
            if sig != 0 {
                for j in 0..self.tasks.len() {
                    if ran & (1 << j) != 0 {
                        continue;
                    }
                    let subscribed = match &self.tasks[j] {
                        Some(e) => e.state.signal_mask & sig != 0,
                        None => false,
                    };
                    if subscribed {
                        ran |= 1 << j;
                        active |= self.run_task(ctx, j, now);
                    }
                }
            }

            if ran & (1 << i) != 0 {
                continue;
            }
            let runnable = match &self.tasks[i] {
                Some(e) => Self::runnable(&e.state, now),
                None => false,
            };
            if runnable {
                ran |= 1 << i;
                active |= self.run_task(ctx, i, now);
            }
        }

        PassResult {
            active,
            guard: self.guard.check(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Ctx {
        log: std::vec::Vec<&'static str>,
        count: u32,
    }

    fn record_a(ctx: &mut Ctx, _t: &mut TaskState) -> Disposition {
        ctx.log.push("a");
        Disposition::Wait
    }

    fn record_b(ctx: &mut Ctx, _t: &mut TaskState) -> Disposition {
        ctx.log.push("b");
        Disposition::Wait
    }

    fn record_sig(ctx: &mut Ctx, _t: &mut TaskState) -> Disposition {
        ctx.log.push("sig");
        Disposition::Sleep
    }

    fn count_once(ctx: &mut Ctx, _t: &mut TaskState) -> Disposition {
        ctx.count += 1;
        Disposition::Done
    }

    fn count_timed(ctx: &mut Ctx, task: &mut TaskState) -> Disposition {
        ctx.count += 1;
        Disposition::TimedWait(task.deadline.wrapping_add(100))
    }

    #[test]
    fn insertion_order() {
        let mut sched: Scheduler<Ctx> = Scheduler::new();
        let mut ctx = Ctx {
            log: std::vec::Vec::new(),
            count: 0,
        };
        let signals = Signals::new();

        sched.spawn(record_a, "a").unwrap();
        sched.spawn(record_b, "b").unwrap();

        sched.run(&mut ctx, 0, &signals);
        sched.run(&mut ctx, 1, &signals);

        assert_eq!(&ctx.log, &["a", "b", "a", "b"]);
    }

    #[test]
    fn signalled_task_runs_first() {
        let mut sched: Scheduler<Ctx> = Scheduler::new();
        let mut ctx = Ctx {
            log: std::vec::Vec::new(),
            count: 0,
        };
        let signals = Signals::new();

        sched.spawn(record_a, "a").unwrap();
        sched.spawn(record_b, "b").unwrap();
        sched
            .spawn_with(record_sig, "sig", 1 << SIG_RF_RECEIVE, None)
            .unwrap();

        // first pass runs everything once, then the subscriber sleeps
        sched.run(&mut ctx, 0, &signals);
        assert_eq!(&ctx.log, &["a", "b", "sig"]);

        // no signal: the sleeping task stays parked
        ctx.log.clear();
        sched.run(&mut ctx, 1, &signals);
        assert_eq!(&ctx.log, &["a", "b"]);

        ctx.log.clear();
        signals.set(SIG_RF_RECEIVE);
        sched.run(&mut ctx, 2, &signals);

        // signal observed before the first ordinary task
        assert_eq!(ctx.log[0], "sig");
        signals.clear(SIG_RF_RECEIVE);
    }

    #[test]
    fn done_removes_task() {
        let mut sched: Scheduler<Ctx> = Scheduler::new();
        let mut ctx = Ctx {
            log: std::vec::Vec::new(),
            count: 0,
        };
        let signals = Signals::new();

        sched.spawn(count_once, "once").unwrap();
        assert_eq!(sched.task_count(), 1);

        sched.run(&mut ctx, 0, &signals);
        sched.run(&mut ctx, 1, &signals);

        assert_eq!(ctx.count, 1);
        assert_eq!(sched.task_count(), 0);
    }

    #[test]
    fn timed_wait_until_deadline() {
        let mut sched: Scheduler<Ctx> = Scheduler::new();
        let mut ctx = Ctx {
            log: std::vec::Vec::new(),
            count: 0,
        };
        let signals = Signals::new();

        sched.spawn(count_timed, "timed").unwrap();

        sched.run(&mut ctx, 0, &signals);
        assert_eq!(ctx.count, 1);

        // parked until the deadline passes
        sched.run(&mut ctx, 50, &signals);
        assert_eq!(ctx.count, 1);

        sched.run(&mut ctx, 100, &signals);
        assert_eq!(ctx.count, 2);
    }

    #[test]
    fn restart_rewinds_resume() {
        fn staged(ctx: &mut Ctx, task: &mut TaskState) -> Disposition {
            ctx.count += task.resume as u32;
            task.resume += 1;
            Disposition::Wait
        }

        let mut sched: Scheduler<Ctx> = Scheduler::new();
        let mut ctx = Ctx {
            log: std::vec::Vec::new(),
            count: 0,
        };
        let signals = Signals::new();

        let h = sched.spawn(staged, "staged").unwrap();
        sched.run(&mut ctx, 0, &signals);
        sched.run(&mut ctx, 1, &signals);
        assert_eq!(ctx.count, 1);

        sched.restart(h);
        sched.run(&mut ctx, 2, &signals);
        // resume label was rewound to 0
        assert_eq!(ctx.count, 1);
    }

    #[test]
    fn spawn_limit_is_soft() {
        let mut sched: Scheduler<Ctx> = Scheduler::new();

        for _ in 0..MAX_TASKS {
            sched.spawn(record_a, "fill").unwrap();
        }
        assert!(sched.spawn(record_a, "overflow").is_err());
    }

    #[test]
    fn guard_levels() {
        let mut sched: Scheduler<Ctx> = Scheduler::new();
        assert_eq!(sched.stack_guard().check(), GuardLevel::Ok);

        sched.stack_guard_mut().scribble(STACK_WARN_THRESHOLD + 1);
        assert_eq!(sched.stack_guard().check(), GuardLevel::Warn);

        sched.stack_guard_mut().scribble(STACK_GUARD_SIZE);
        assert_eq!(sched.stack_guard().check(), GuardLevel::Fatal);
    }
}
