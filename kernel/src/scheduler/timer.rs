/*
 * Per-CPU Timers
 *
 * Each CPU keeps its armed timers in a list sorted by deadline and drives a
 * single one-shot clock event, always programmed for the earliest deadline.
 * When the clock event fires, every timer that is due expires and the clock
 * event is reprogrammed for the next one.
 *
 * Why this is important:
 * - Sleeps and wait timeouts are timers owned by a thread: expiry wakes the
 *   thread through the same path as any other wakeup
 * - The preemption timer of each CPU is a timer owned by the CPU itself
 * - Timers of a migrating thread are unlinked from the old CPU and relinked
 *   on the new one (suspend/resume)
 *
 * Cancelling a timer never reprograms the clock event; the next interrupt
 * may then find nothing to expire, which is harmless.
 */

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;

use spin::Mutex;

use super::thread::Thread;
use crate::arch::{Instant, Machine};

/// Passes of the expiry loop before the rest is left to the next interrupt
const MAX_EXPIRY_PASSES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Free,
    Armed,
    Expired,
}

#[derive(Debug)]
pub(crate) enum TimerOwner {
    Thread(Weak<Thread>),
    /// The CPU's preemption timer; expiry itself does nothing
    Cpu,
}

#[derive(Debug)]
struct Slot {
    state: TimerState,
    deadline: Instant,
    cpu: usize,
}

/// State shared between a timer, its owner and a CPU's timer list
#[derive(Debug)]
pub(crate) struct TimerBase {
    owner: TimerOwner,
    slot: Mutex<Slot>,
}

impl TimerBase {
    pub(crate) fn new(owner: TimerOwner) -> Arc<Self> {
        Arc::new(Self {
            owner,
            slot: Mutex::new(Slot {
                state: TimerState::Free,
                deadline: Instant::BOOT,
                cpu: 0,
            }),
        })
    }

    pub(crate) fn state(&self) -> TimerState {
        self.slot.lock().state
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.slot.lock().deadline
    }

    /// CPU whose list holds (or last held) the timer
    pub(crate) fn cpu(&self) -> usize {
        self.slot.lock().cpu
    }

    fn key(self: &Arc<Self>) -> (Instant, usize) {
        (self.deadline(), Arc::as_ptr(self) as usize)
    }

    fn owner_thread(&self) -> Option<Arc<Thread>> {
        match &self.owner {
            TimerOwner::Thread(t) => t.upgrade(),
            TimerOwner::Cpu => None,
        }
    }

    fn expire(&self) {
        self.slot.lock().state = TimerState::Expired;
        if let Some(t) = self.owner_thread() {
            t.timers.forget(self);
        }
    }

    /// Deliver an expiry to the owner; called without any CPU lock held
    pub(crate) fn fire(&self) {
        if let Some(t) = self.owner_thread() {
            t.wake();
        }
    }
}

/// Armed timers of one CPU, sorted by (deadline, address)
#[derive(Debug, Default)]
pub(crate) struct TimerList {
    armed: BTreeMap<(Instant, usize), Arc<TimerBase>>,
    // deadline currently programmed into the clock event
    programmed: Option<Instant>,
}

impl TimerList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.armed.len()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.armed.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Arm `t` for `deadline` on this list
    pub(crate) fn arm(
        &mut self,
        t: &Arc<TimerBase>,
        deadline: Instant,
        machine: &dyn Machine,
        cpu: usize,
    ) {
        {
            let mut slot = t.slot.lock();
            assert!(slot.state != TimerState::Armed, "timer armed twice");
            slot.state = TimerState::Armed;
            slot.deadline = deadline;
            slot.cpu = cpu;
        }
        self.link(t, machine, cpu);
    }

    /// Link an armed timer, keeping its deadline
    pub(crate) fn link(&mut self, t: &Arc<TimerBase>, machine: &dyn Machine, cpu: usize) {
        t.slot.lock().cpu = cpu;
        self.armed.insert(t.key(), t.clone());
        self.rearm(machine, cpu);
    }

    /// Unlink `t` without touching its state or the clock event
    pub(crate) fn unlink(&mut self, t: &Arc<TimerBase>) -> bool {
        self.armed.remove(&t.key()).is_some()
    }

    /// Unlink and free `t`
    pub(crate) fn cancel(&mut self, t: &Arc<TimerBase>) {
        let armed = t.state() == TimerState::Armed;
        if armed {
            self.unlink(t);
        }
        t.slot.lock().state = TimerState::Free;
        if !armed {
            return;
        }
        if let Some(owner) = t.owner_thread() {
            owner.timers.forget(t);
        }
    }

    /// Expire every due timer and reprogram the clock event.
    ///
    /// The caller fires the returned timers once the CPU lock is dropped.
    pub(crate) fn expire_due(&mut self, machine: &dyn Machine, cpu: usize) -> Vec<Arc<TimerBase>> {
        let mut expired = Vec::new();
        // the clock event is one-shot: whatever was programmed has fired
        self.programmed = None;
        for _ in 0..MAX_EXPIRY_PASSES {
            let now = machine.now();
            while let Some(entry) = self.armed.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                let t = entry.remove();
                t.expire();
                expired.push(t);
            }
            match self.next_deadline() {
                None => return expired,
                // the next deadline may have passed while expiring
                Some(next) if next > machine.now() => break,
                Some(_) => {}
            }
        }
        self.rearm(machine, cpu);
        expired
    }

    fn rearm(&mut self, machine: &dyn Machine, cpu: usize) {
        let Some(next) = self.next_deadline() else {
            return;
        };
        if self.programmed.is_none_or(|programmed| next < programmed) {
            self.programmed = Some(next);
            machine.set_clock_event(cpu, Some(next));
        }
    }
}

/// The active timers of a thread
#[derive(Debug, Default)]
pub(crate) struct TimerClient {
    active: Mutex<Vec<Arc<TimerBase>>>,
    need_reload: AtomicBool,
}

impl TimerClient {
    fn track(&self, t: &Arc<TimerBase>) {
        self.active.lock().push(t.clone());
    }

    fn forget(&self, t: &TimerBase) {
        self.active.lock().retain(|a| !core::ptr::eq(Arc::as_ptr(a), t));
    }

    /// Unlink every active timer from `list` before the thread leaves the CPU
    pub(crate) fn suspend(&self, list: &mut TimerList) {
        let active = self.active.lock();
        for t in active.iter() {
            list.unlink(t);
        }
        if !active.is_empty() {
            self.need_reload.store(true, Ordering::Release);
        }
    }

    /// Relink suspended timers on the thread's new CPU
    pub(crate) fn resume(&self, list: &mut TimerList, machine: &dyn Machine, cpu: usize) {
        if !self.need_reload.swap(false, Ordering::AcqRel) {
            return;
        }
        for t in self.active.lock().iter() {
            list.link(t, machine, cpu);
        }
    }
}

/// A one-shot timer owned by a thread; expiry wakes the thread
#[derive(Debug)]
pub struct Timer {
    base: Arc<TimerBase>,
    owner: Arc<Thread>,
}

impl Timer {
    pub fn new(owner: &Arc<Thread>) -> Self {
        Self {
            base: TimerBase::new(TimerOwner::Thread(Arc::downgrade(owner))),
            owner: owner.clone(),
        }
    }

    /// Arm the timer on the calling thread's CPU
    pub fn set(&self, deadline: Instant) {
        let me = Thread::current();
        let cpu = me.running_cpu();
        let sched = me.sched();
        let mut st = cpu.state.lock();
        st.timers.arm(&self.base, deadline, sched.machine(), cpu.index());
        self.owner.timers.track(&self.base);
    }

    /// Arm the timer `after` from now
    pub fn set_after(&self, after: Duration) {
        self.set(self.owner.sched().machine().now() + after);
    }

    pub fn cancel(&self) {
        if self.base.state() == TimerState::Free {
            return;
        }
        let sched = self.owner.sched();
        let cpu = sched.cpu_at(self.base.cpu());
        cpu.state.lock().timers.cancel(&self.base);
    }

    /// Cancel, then arm again
    pub fn reset(&self, deadline: Instant) {
        self.cancel();
        self.set(deadline);
    }

    pub fn expired(&self) -> bool {
        self.base.state() == TimerState::Expired
    }

    pub fn state(&self) -> TimerState {
        self.base.state()
    }

    pub fn deadline(&self) -> Instant {
        self.base.deadline()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}
