/*
 * Per-CPU Scheduler Core
 *
 * Every CPU owns a run queue, a virtual clock, a timer list and one
 * incoming wakeup queue per possible waker. The heart of the module is
 * `reschedule_from_interrupt`, which charges the running thread for the
 * time it used, picks the runnable thread with the lowest runtime and
 * switches to it.
 *
 * Why this is important:
 * - The state lock of a CPU is only taken by code running on that CPU, plus
 *   the few remote readers of its timer list; wakers from other CPUs go
 *   through the lock-free incoming queues
 * - The running thread keeps the CPU for as long as its runtime stays below
 *   the queue head's; the preemption timer is programmed for the moment
 *   that stops being true
 * - The idle thread lives in the run queue with an infinite runtime, so it
 *   is picked exactly when nothing else can run
 *
 * Interrupts are not asynchronous here: a CPU notices pending timer and
 * wakeup interrupts at its interrupt points (preempt_point, leaving a
 * preempt_disable section, yielding, waiting, and halting in idle).
 */

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering, fence};
use core::time::Duration;

use spin::{Mutex, Once};

use super::Scheduler;
use super::runqueue::{RunQueue, Schedulable};
use super::runtime::{Renormalized, ThreadRuntime, Tuning, VirtualClock};
use super::thread::Thread;
use super::timer::{TimerBase, TimerList, TimerOwner};
use super::types::{CpuId, CpuSet, Status};
use super::wakeup::WakeupQueue;
use crate::arch::{Instant, Machine, Pending};
use crate::config::SchedConfig;

/// Scheduling state of a CPU, guarded by `Cpu::state`
pub(crate) struct CpuSched {
    pub(crate) runqueue: RunQueue<Arc<Thread>>,
    pub(crate) clock: VirtualClock,
    pub(crate) timers: TimerList,
    preemption_timer: Arc<TimerBase>,
    pub(crate) running_since: Instant,
    // finished thread waiting for the next thread on this CPU to destroy it
    pub(crate) terminating_thread: Option<Arc<Thread>>,
}

impl CpuSched {
    /// Apply `f` to the runtime of `t`, following a clock rescale if needed
    fn account(
        &mut self,
        t: &Thread,
        tuning: &Tuning,
        f: impl FnOnce(&mut ThreadRuntime, &mut VirtualClock, &Tuning) -> Renormalized,
    ) {
        let renormalized = {
            let mut rt = t.runtime.lock();
            f(&mut rt, &mut self.clock, tuning)
        };
        if renormalized == Renormalized::Yes {
            log::debug!("runtime clock rescaled by {}", tuning.c_max);
            self.runqueue.renormalize(tuning.c_max);
        }
    }

    fn cancel_preemption(&mut self) {
        let timer = self.preemption_timer.clone();
        self.timers.cancel(&timer);
    }

    fn arm_preemption(&mut self, deadline: Instant, machine: &dyn Machine, cpu: usize) {
        let timer = self.preemption_timer.clone();
        self.timers.arm(&timer, deadline, machine, cpu);
    }
}

pub struct Cpu {
    id: CpuId,
    pub(crate) state: Mutex<CpuSched>,
    pub(crate) incoming: Box<[WakeupQueue]>,
    pub(crate) incoming_mask: CpuSet,
    idle_poll: AtomicBool,
    load: AtomicUsize,
    idle: Once<Arc<Thread>>,
    stat_switches: AtomicU64,
    stat_balanced: AtomicU64,
}

impl Cpu {
    /// `sources` is the number of wakeup source slots: one per CPU plus
    /// one for wakers outside any kernel thread
    pub(crate) fn new(id: CpuId, sources: usize, config: &SchedConfig) -> Self {
        Self {
            id,
            state: Mutex::new(CpuSched {
                runqueue: RunQueue::new(),
                clock: VirtualClock::new(config.c_initial),
                timers: TimerList::new(),
                preemption_timer: TimerBase::new(TimerOwner::Cpu),
                running_since: Instant::BOOT,
                terminating_thread: None,
            }),
            incoming: (0..sources).map(|_| WakeupQueue::new()).collect(),
            incoming_mask: CpuSet::new(),
            idle_poll: AtomicBool::new(false),
            load: AtomicUsize::new(0),
            idle: Once::new(),
            stat_switches: AtomicU64::new(0),
            stat_balanced: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub(crate) fn index(&self) -> usize {
        self.id.as_usize()
    }

    /// Runnable threads queued on this CPU, the idle thread excluded
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    pub fn stat_switches(&self) -> u64 {
        self.stat_switches.load(Ordering::Relaxed)
    }

    /// Threads this CPU's load balancer pushed to other CPUs
    pub fn stat_balanced(&self) -> u64 {
        self.stat_balanced.load(Ordering::Relaxed)
    }

    pub(crate) fn note_balanced(&self) {
        self.stat_balanced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn idle_thread(&self) -> Option<&Arc<Thread>> {
        self.idle.get()
    }

    pub(crate) fn set_idle_thread(&self, idle: Arc<Thread>) {
        self.idle.call_once(|| idle);
    }

    /// How often this CPU's virtual clock was scaled back into range
    pub fn renormalizations(&self) -> i32 {
        self.state.lock().clock.renormalize_count()
    }

    /// Ids of the queued threads, most deserving first
    pub fn queued(&self) -> alloc::vec::Vec<super::types::ThreadId> {
        self.state.lock().runqueue.iter().map(|t| t.id()).collect()
    }

    fn update_load(&self, st: &CpuSched) {
        // the idle thread is always queued or running, never counted
        let queued = st.runqueue.iter().filter(|t| !t.is_idle()).count();
        self.load.store(queued, Ordering::Relaxed);
    }

    pub(crate) fn enqueue(&self, st: &mut CpuSched, t: Arc<Thread>) {
        st.runqueue.enqueue(t);
        self.update_load(st);
    }

    fn dequeue_first(&self, st: &mut CpuSched) -> Option<Arc<Thread>> {
        let t = st.runqueue.pop_first();
        self.update_load(st);
        t
    }

    pub(crate) fn erase(&self, st: &mut CpuSched, t: &Arc<Thread>) -> Option<Arc<Thread>> {
        let t = st.runqueue.erase(t);
        self.update_load(st);
        t
    }

    pub(crate) fn take_migratable(&self, st: &mut CpuSched) -> Option<Arc<Thread>> {
        let t = st
            .runqueue
            .take_last_matching(|t| t.migration_lock_counter.load(Ordering::Acquire) == 0);
        self.update_load(st);
        t
    }

    /// Charge the running thread, pick the next one and switch to it
    ///
    /// With `called_from_yield` the current thread gives the CPU away even
    /// if it is still the most deserving one, and the new thread may run
    /// for `preempt_after` before the preemption timer fires.
    pub(crate) fn reschedule_from_interrupt(
        &self,
        called_from_yield: bool,
        preempt_after: Duration,
    ) {
        let p = Thread::current();
        let sched = p.sched();
        let machine = sched.machine();
        let tuning = sched.tuning();
        let cpu = self.index();

        p.need_reschedule.store(false, Ordering::Relaxed);
        self.handle_incoming_wakeups(&p);

        let n = {
            let mut st = self.state.lock();
            let now = machine.now();
            if now < st.running_since {
                let skew = st.running_since.saturating_duration_since(now);
                log::warn!("{}: clock went backwards by {:?}", self.id, skew);
            }
            let mut interval = now.saturating_duration_since(st.running_since);
            st.running_since = now;
            if interval.is_zero() {
                // clock did not move: charge something so nobody runs forever
                interval = sched.config().context_switch_penalty;
            }

            let p_status = p.status();
            assert_ne!(p_status, Status::Queued, "{} is running while queued", p.id());
            p.stats.add_cpu_time(interval);
            st.account(&p, tuning, |rt, clock, tuning| rt.ran_for(clock, interval, tuning));

            let mut requeue = false;
            if p_status == Status::Running {
                let head = st.runqueue.first().map(Schedulable::local_runtime);
                let Some(head) = head else {
                    st.cancel_preemption();
                    return;
                };
                if !called_from_yield && p.local_runtime() < head {
                    st.cancel_preemption();
                    let delta = p.runtime.lock().time_until(head, &st.clock, tuning);
                    if let Some(delta) = delta.filter(|d| !d.is_zero()) {
                        st.arm_preemption(now + delta, machine, cpu);
                    }
                    return;
                }
                st.account(&p, tuning, ThreadRuntime::hysteresis_run_stop);
                p.set_status(Status::Queued);
                p.stats.preemptions.fetch_add(1, Ordering::Relaxed);
                requeue = true;
            } else {
                st.account(&p, tuning, ThreadRuntime::hysteresis_run_stop);
            }

            if p.tcpu_index() != cpu {
                // leaving for another CPU
                let mut rt = p.runtime.lock();
                rt.export_runtime(&st.clock);
            }

            let n = self
                .dequeue_first(&mut st)
                .unwrap_or_else(|| panic!("{}: run queue empty, idle thread missing", self.id));
            if requeue {
                self.enqueue(&mut st, p.clone());
            }
            assert_eq!(n.status(), Status::Queued, "{} picked while not queued", n.id());
            n.set_status(Status::Running);
            st.account(&n, tuning, ThreadRuntime::hysteresis_run_start);
            if p.status() == Status::Queued && !p.is_idle() {
                st.account(&n, tuning, ThreadRuntime::add_context_switch_penalty);
            }

            st.cancel_preemption();
            if called_from_yield {
                st.arm_preemption(now + preempt_after, machine, cpu);
            } else if let Some(head) = st.runqueue.first().map(Schedulable::local_runtime) {
                let delta = n.runtime.lock().time_until(head, &st.clock, tuning);
                if let Some(delta) = delta.filter(|d| !d.is_zero()) {
                    st.arm_preemption(now + delta, machine, cpu);
                }
            }

            n.running_on.store(cpu, Ordering::Release);
            n.stats.switches.fetch_add(1, Ordering::Relaxed);
            self.stat_switches.fetch_add(1, Ordering::Relaxed);
            log::trace!("sched_switch {} -> {} on {}", p.id(), n.id(), self.id);
            n
        };

        if !p.context.switch_to(&n.context) {
            // destroyed while switched out
            return;
        }
        drop(n);
        // possibly on another CPU by now
        p.running_cpu().reap_terminating();
    }

    /// Move every thread woken on this CPU into the run queue
    pub(crate) fn handle_incoming_wakeups(&self, current: &Arc<Thread>) {
        let sources = self.incoming_mask.fetch_clear();
        let mut sources = sources.peekable();
        if sources.peek().is_none() {
            return;
        }
        let sched = current.sched();
        let machine = sched.machine();
        let tuning = sched.tuning();

        let mut st = self.state.lock();
        for source in sources {
            while let Some(t) = self.incoming[source].pop() {
                if Arc::ptr_eq(&t, current) {
                    t.set_status(Status::Running);
                } else if t.tcpu_index() != self.index() {
                    // lost a race with a migration; the new CPU owns it
                    log::trace!(
                        "{}: dropping wakeup of {} owned by cpu{}",
                        self.id,
                        t.id(),
                        t.tcpu_index()
                    );
                } else {
                    t.set_status(Status::Queued);
                    t.runtime.lock().update_after_sleep(&st.clock, tuning);
                    t.timers.resume(&mut st.timers, machine, self.index());
                    self.enqueue(&mut st, t);
                }
            }
        }
    }

    /// Interrupt this CPU so it notices new wakeups, unless it will anyway
    pub(crate) fn send_wakeup_ipi(&self, machine: &dyn Machine) {
        fence(Ordering::SeqCst);
        // load() leaves out the idle thread, so 0 means nothing else is queued
        if !self.idle_poll.load(Ordering::Relaxed) && self.load() == 0 {
            machine.send_wakeup_ipi(self.index());
        }
    }

    /// Hand a thread taken off this CPU (queued or just woken) to `target`
    pub(crate) fn migrate_out(
        &self,
        st: &mut CpuSched,
        t: Arc<Thread>,
        target: &Cpu,
        sched: &Scheduler,
    ) {
        t.set_status(Status::Waking);
        t.timers.suspend(&mut st.timers);
        t.detached.cpu.store(target.index(), Ordering::Release);
        t.stats.migrations.fetch_add(1, Ordering::Relaxed);
        {
            let mut rt = t.runtime.lock();
            rt.update_after_sleep(&st.clock, sched.tuning());
            rt.export_runtime(&st.clock);
        }
        log::debug!("sched_migrate {} {} -> {}", t.id(), self.id, target.id);
        target.push_incoming(self.index(), t, false);
        target.incoming_mask.set(self.index());
        target.send_wakeup_ipi(sched.machine());
    }

    /// Queue `t` for this CPU from wakeup source slot `source`
    pub(crate) fn push_incoming(&self, source: usize, t: Arc<Thread>, local: bool) {
        let mut t = t;
        while let Err(back) = self.incoming[source].push(t) {
            assert!(!local, "{}: incoming wakeup queue is full", self.id);
            core::hint::spin_loop();
            t = back;
        }
    }

    fn idle_poll_start(&self) {
        self.idle_poll.store(true, Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }

    fn idle_poll_end(&self) {
        self.idle_poll.store(false, Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }

    /// Body of the idle thread
    pub(crate) fn idle(&self) {
        log::debug!("{}: idle thread running", self.id);
        loop {
            self.do_idle();
            schedule();
        }
    }

    /// Poll, then halt, until something is runnable
    fn do_idle(&self) {
        let me = Thread::current();
        let sched = me.sched();
        let spins = sched.config().idle_poll_spins;
        loop {
            self.idle_poll_start();
            for _ in 0..spins {
                if !self.incoming_mask.is_empty() {
                    self.idle_poll_end();
                    return;
                }
                core::hint::spin_loop();
            }
            self.idle_poll_end();
            if !self.incoming_mask.is_empty() {
                return;
            }
            sched.machine().halt(self.index());
            preempt_point();
            if self.load() > 0 {
                return;
            }
        }
    }

    /// Expire this CPU's due timers and deliver them
    fn timers_fired(&self, sched: &Scheduler) {
        let expired = self.state.lock().timers.expire_due(sched.machine(), self.index());
        for t in expired {
            t.fire();
        }
    }

    /// Destroy the thread that terminated before the last switch here
    pub(crate) fn reap_terminating(&self) {
        let dead = self.state.lock().terminating_thread.take();
        let Some(dead) = dead else {
            return;
        };
        let me = Thread::current();
        // destroying may wake a joiner; that must not switch away from here
        me.preempt_disable();
        dead.destroy();
        me.preempt_enable_no_resched();
    }
}

impl core::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cpu")
            .field("id", &self.id)
            .field("load", &self.load())
            .finish()
    }
}

/// Deliver the interrupts pending on the current CPU
///
/// A no-op outside kernel threads.
pub fn preempt_point() {
    let Some(me) = Thread::try_current() else {
        return;
    };
    let sched = me.sched();
    let pending = {
        let cpu = me.running_cpu();
        let pending = sched.machine().take_pending(cpu.index());
        if pending.contains(Pending::TIMER) {
            cpu.timers_fired(sched);
        }
        pending
    };
    if !pending.is_empty() || me.need_reschedule.load(Ordering::Relaxed) {
        preempt();
    }
}

/// Reschedule now if allowed, otherwise as soon as preemption is enabled
pub fn preempt() {
    let me = Thread::current();
    if me.preemptable() {
        me.running_cpu().reschedule_from_interrupt(false, Duration::ZERO);
    } else {
        me.need_reschedule.store(true, Ordering::Relaxed);
    }
}

/// Let the scheduler pick the next thread for the current CPU
pub fn schedule() {
    let me = Thread::current();
    me.running_cpu().reschedule_from_interrupt(false, Duration::ZERO);
}

pub fn preempt_disable() {
    Thread::current().preempt_disable();
}

pub fn preempt_enable() {
    Thread::current().preempt_enable();
}

pub fn preemptable() -> bool {
    Thread::try_current().is_some_and(|t| t.preemptable())
}

/// Give the CPU to another runnable thread, if there is one
pub fn yield_now() {
    let thyst = Thread::current().sched().config().thyst;
    yield_for(thyst);
}

/// Like `yield_now`, letting the next thread run for `preempt_after`
/// before it can be preempted
pub fn yield_for(preempt_after: Duration) {
    preempt_point();
    let me = Thread::current();
    let cpu = me.running_cpu();
    cpu.handle_incoming_wakeups(&me);
    {
        let st = cpu.state.lock();
        match st.runqueue.first() {
            None => return,
            Some(next) if next.is_idle() => return,
            Some(_) => {}
        }
    }
    assert_eq!(me.status(), Status::Running, "{} yielding while not running", me.id());
    cpu.reschedule_from_interrupt(true, preempt_after);
}
