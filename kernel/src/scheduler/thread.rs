/*
 * Kernel Threads
 *
 * This module defines the thread object and its lifecycle: creation,
 * start, wakeup, termination, join and detach, plus the process-wide thread
 * registry.
 *
 * Why this is important:
 * - The thread status is the single source of truth for where a thread is:
 *   on a run queue (queued), on an incoming wakeup queue (waking), on a CPU
 *   (running) or blocked (waiting); never two at once
 * - A thread cannot free its own stack while running on it, so a finished
 *   thread parks itself as its CPU's "terminating thread" and is destroyed
 *   by the next thread that runs there
 * - destroy() and join() race for the joiner slot; whoever claims it first
 *   is responsible for the final transition and wakeup of the other
 *
 * Threads stay alive while they are started and not yet destroyed, even if
 * their creator dropped every handle.
 */

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};

use lazy_static::lazy_static;
use spin::Mutex;

use super::Scheduler;
use super::cpu::Cpu;
use super::runqueue::Schedulable;
use super::runtime::{PRIORITY_DEFAULT, ThreadRuntime};
use super::timer::TimerClient;
use super::types::{AtomicStatus, CpuId, Runtime, Status, StatusMask, ThreadId};
use super::wait::wait_until;
use super::wakeup::wake_impl;
use crate::arch::Context;
use crate::arch::hosted::{ThreadExit, unwind_thread};

/// Default stack size of a kernel thread
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

const NO_CPU: usize = usize::MAX;

const ATTACHED: u8 = 0;
const DETACHED: u8 = 1;
const ATTACHED_COMPLETE: u8 = 2;

lazy_static! {
    static ref THREAD_MAP: Mutex<BTreeMap<u32, Weak<Thread>>> = Mutex::new(BTreeMap::new());
}

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

std::thread_local! {
    static CURRENT: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
}

/// Thread creation attributes
#[derive(Debug, Clone, PartialEq)]
pub struct Attr {
    name: heapless::String<16>,
    stack_size: usize,
    stack: Option<Box<[u8]>>,
    pinned_cpu: Option<CpuId>,
    detached: bool,
    priority: Runtime,
}

impl Default for Attr {
    fn default() -> Self {
        Self {
            name: heapless::String::new(),
            stack_size: DEFAULT_STACK_SIZE,
            stack: None,
            pinned_cpu: None,
            detached: false,
            priority: PRIORITY_DEFAULT,
        }
    }
}

impl Attr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the thread; names longer than 16 bytes are truncated
    pub fn name(mut self, name: &str) -> Self {
        self.name.clear();
        for ch in name.chars() {
            if self.name.push(ch).is_err() {
                break;
            }
        }
        self
    }

    pub fn stack(mut self, size: usize) -> Self {
        self.stack_size = size;
        self.stack = None;
        self
    }

    /// Run on a stack the caller allocated; the thread owns it until it is
    /// dropped. The hosted backend sizes the backing OS thread's stack from
    /// it.
    pub fn stack_buffer(mut self, stack: Box<[u8]>) -> Self {
        self.stack_size = stack.len();
        self.stack = Some(stack);
        self
    }

    /// Run only on `cpu`
    pub fn pin(mut self, cpu: CpuId) -> Self {
        self.pinned_cpu = Some(cpu);
        self
    }

    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    /// Runtime weight: larger values get a smaller share of the CPU
    pub fn priority(mut self, priority: Runtime) -> Self {
        self.priority = priority;
        self
    }

    pub fn pinned_cpu(&self) -> Option<CpuId> {
        self.pinned_cpu
    }
}

/// Part of a thread that stays valid for holders of a [`ThreadHandle`]
#[derive(Debug)]
pub(crate) struct DetachedState {
    pub(crate) t: Weak<Thread>,
    pub(crate) cpu: AtomicUsize,
    pub(crate) st: AtomicStatus,
    pub(crate) lock_sent: AtomicBool,
}

/// A weak reference that can still wake the thread
#[derive(Debug, Clone)]
pub struct ThreadHandle(Arc<DetachedState>);

impl ThreadHandle {
    pub fn wake(&self) {
        wake_impl(&self.0, StatusMask::WAITING);
    }

    /// Run `action`, then wake the thread, even if the action lets it exit
    pub fn wake_with(&self, action: impl FnOnce()) {
        action();
        wake_impl(&self.0, StatusMask::WAITING);
    }

    pub fn status(&self) -> Status {
        self.0.st.load()
    }

    pub fn thread(&self) -> Option<Arc<Thread>> {
        self.0.t.upgrade()
    }
}

#[derive(Debug)]
enum JoinSlot {
    Empty,
    Joiner(ThreadHandle),
    Destroyed,
}

/// Per-thread scheduling counters
#[derive(Debug, Default)]
pub(crate) struct ThreadStats {
    pub(crate) switches: AtomicU64,
    pub(crate) preemptions: AtomicU64,
    pub(crate) migrations: AtomicU64,
    cpu_time_ns: AtomicU64,
}

impl ThreadStats {
    pub(crate) fn add_cpu_time(&self, interval: Duration) {
        let ns = u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX);
        self.cpu_time_ns.fetch_add(ns, Ordering::Relaxed);
    }

    fn cpu_time(&self) -> Duration {
        Duration::from_nanos(self.cpu_time_ns.load(Ordering::Relaxed))
    }
}

pub struct Thread {
    id: ThreadId,
    name: heapless::String<16>,
    sched: Arc<Scheduler>,
    func: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
    pub(crate) detached: Arc<DetachedState>,
    pub(crate) runtime: Mutex<ThreadRuntime>,
    pub(crate) migration_lock_counter: AtomicU32,
    pub(crate) pinned: AtomicBool,
    // pin requested before the thread was started
    pub(crate) pinned_cpu: AtomicUsize,
    preempt_counter: AtomicU32,
    pub(crate) need_reschedule: AtomicBool,
    // CPU currently executing the thread; differs from detached.cpu only
    // while the thread is migrating itself
    pub(crate) running_on: AtomicUsize,
    joiner: Mutex<JoinSlot>,
    detach_state: AtomicU8,
    cleanup: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
    interrupted: AtomicBool,
    pub(crate) timers: TimerClient,
    pub(crate) tls: Mutex<Vec<Option<Box<[u8]>>>>,
    pub(crate) stats: ThreadStats,
    pub(crate) context: Context,
    _stack: Option<Box<[u8]>>,
    keepalive: Mutex<Option<Arc<Thread>>>,
    is_idle: bool,
}

impl Thread {
    pub(crate) fn create<F>(
        sched: &Arc<Scheduler>,
        f: F,
        mut attr: Attr,
        is_idle: bool,
    ) -> Arc<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut map = THREAD_MAP.lock();
        let id = next_free_id(&map);
        let pinned = attr.pinned_cpu.map(CpuId::as_usize);
        let stack = attr.stack.take();
        let os_name = if attr.name.is_empty() {
            alloc::format!("thread-{}", id.0)
        } else {
            attr.name.to_string()
        };
        let t = Arc::new_cyclic(|me: &Weak<Thread>| {
            map.insert(id.0, me.clone());
            let entry = me.clone();
            Thread {
                id,
                name: attr.name.clone(),
                sched: sched.clone(),
                func: Mutex::new(Some(Box::new(f))),
                detached: Arc::new(DetachedState {
                    t: me.clone(),
                    cpu: AtomicUsize::new(pinned.unwrap_or(0)),
                    st: AtomicStatus::new(Status::Unstarted),
                    lock_sent: AtomicBool::new(false),
                }),
                runtime: Mutex::new(ThreadRuntime::new(attr.priority)),
                migration_lock_counter: AtomicU32::new(u32::from(pinned.is_some())),
                pinned: AtomicBool::new(pinned.is_some()),
                pinned_cpu: AtomicUsize::new(pinned.unwrap_or(NO_CPU)),
                preempt_counter: AtomicU32::new(0),
                need_reschedule: AtomicBool::new(false),
                running_on: AtomicUsize::new(pinned.unwrap_or(0)),
                joiner: Mutex::new(JoinSlot::Empty),
                detach_state: AtomicU8::new(if attr.detached { DETACHED } else { ATTACHED }),
                cleanup: Mutex::new(None),
                interrupted: AtomicBool::new(false),
                timers: TimerClient::default(),
                tls: Mutex::new(Vec::new()),
                stats: ThreadStats::default(),
                context: Context::new(
                    &os_name,
                    attr.stack_size,
                    Box::new(move || Thread::trampoline(entry)),
                ),
                _stack: stack,
                keepalive: Mutex::new(None),
                is_idle,
            }
        });
        drop(map);
        log::trace!("sched_create {} \"{}\"", t.id, t.name);
        t
    }

    /// Create a thread on the scheduler of the calling thread
    pub fn make<F>(f: F, attr: Attr) -> Arc<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let me = Thread::current();
        Thread::create(me.sched(), f, attr, false)
    }

    /// The thread running this code
    ///
    /// # Panics
    ///
    /// Panics when called outside a kernel thread.
    pub fn current() -> Arc<Thread> {
        Thread::try_current().unwrap_or_else(|| panic!("not running on a kernel thread"))
    }

    pub fn try_current() -> Option<Arc<Thread>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    fn is_current(&self) -> bool {
        CURRENT.with(|c| c.borrow().as_ref().is_some_and(|t| core::ptr::eq(&**t, self)))
    }

    /// Body of every backing OS thread
    fn trampoline(me: Weak<Thread>) {
        let Some(t) = me.upgrade() else {
            return;
        };
        CURRENT.with(|c| *c.borrow_mut() = Some(t.clone()));
        t.running_cpu().reap_terminating();

        let body = t.func.lock().take();
        let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
            if let Some(body) = body {
                body();
            }
        }));
        if let Err(payload) = outcome {
            if !payload.is::<ThreadExit>() {
                let message = panic_message(&*payload);
                log::error!("{} \"{}\" panicked: {}", t.id, t.name, message);
                t.sched.record_panic(alloc::format!("{} \"{}\": {}", t.id, t.name, message));
            }
        }

        t.complete();
        CURRENT.with(|c| c.borrow_mut().take());
    }

    /// Start running the thread
    ///
    /// Before the scheduler runs, the thread is parked as prestarted and
    /// launched by `Scheduler::start`.
    pub fn start(self: &Arc<Self>) {
        {
            let mut early = self.sched.prestarted.lock();
            assert_eq!(self.status(), Status::Unstarted, "{} started twice", self.id);
            if !self.sched.is_started() {
                self.set_status(Status::Prestarted);
                early.push(self.clone());
                return;
            }
        }
        self.launch();
    }

    pub(crate) fn launch(self: &Arc<Self>) {
        let cpu = match self.pinned_cpu.load(Ordering::Acquire) {
            NO_CPU => Thread::try_current()
                .filter(|me| Arc::ptr_eq(&me.sched, &self.sched))
                .map_or(0, |me| me.tcpu_index()),
            cpu => cpu,
        };
        self.detached.cpu.store(cpu, Ordering::Release);
        self.keep_alive();
        self.set_status(Status::Waiting);
        self.wake();
    }

    /// Hold a reference to the thread until it is destroyed
    pub(crate) fn keep_alive(self: &Arc<Self>) {
        *self.keepalive.lock() = Some(self.clone());
    }

    /// Finish the calling thread: mark it terminating and schedule away
    /// until the next thread on this CPU destroys it
    fn complete(self: &Arc<Self>) {
        let _ = self.detach_state.compare_exchange(
            ATTACHED,
            ATTACHED_COMPLETE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.preempt_disable();
        self.set_status(Status::Terminating);
        log::trace!("sched_complete {}", self.id);

        let cpu = self.running_cpu();
        let previous = cpu.state.lock().terminating_thread.replace(self.clone());
        if let Some(previous) = previous {
            previous.destroy();
        }
        loop {
            self.running_cpu().reschedule_from_interrupt(false, Duration::ZERO);
            if self.context.is_released() {
                return;
            }
        }
    }

    /// Final transition of a terminated thread, run by another thread
    pub(crate) fn destroy(&self) {
        assert_eq!(self.status(), Status::Terminating, "{} destroyed while alive", self.id);
        self.context.release();
        let (joiner, detached) = {
            let mut slot = self.joiner.lock();
            let joiner = match core::mem::replace(&mut *slot, JoinSlot::Destroyed) {
                JoinSlot::Joiner(joiner) => Some(joiner),
                _ => {
                    self.set_status(Status::Terminated);
                    None
                }
            };
            (joiner, self.is_detached())
        };
        if let Some(joiner) = joiner {
            joiner.wake_with(|| self.set_status(Status::Terminated));
        }
        if detached {
            self.run_cleanup();
        }
        log::trace!("sched_destroy {}", self.id);
        let keepalive = self.keepalive.lock().take();
        drop(keepalive);
    }

    /// Wait for the thread to terminate
    ///
    /// Returns at once for a thread that was never started.
    pub fn join(&self) {
        if self.status() == Status::Unstarted {
            return;
        }
        assert_ne!(self.detach_state.load(Ordering::Acquire), DETACHED, "{} is detached", self.id);
        assert!(!self.is_current(), "{} joining itself", self.id);
        let me = Thread::current();
        {
            let mut slot = self.joiner.lock();
            match *slot {
                JoinSlot::Empty => *slot = JoinSlot::Joiner(me.handle()),
                JoinSlot::Destroyed => return,
                JoinSlot::Joiner(_) => panic!("{} joined twice", self.id),
            }
        }
        wait_until(|| self.status() == Status::Terminated);
    }

    /// Give up the right to join; the thread is released when it ends
    pub fn detach(&self) {
        let finished = {
            let slot = self.joiner.lock();
            let previous = self.detach_state.swap(DETACHED, Ordering::AcqRel);
            assert_ne!(previous, DETACHED, "{} detached twice", self.id);
            matches!(*slot, JoinSlot::Destroyed)
        };
        // destroy() already ran and left the cleanup to us
        if finished {
            self.run_cleanup();
        }
    }

    /// Work to do once a detached thread is gone
    ///
    /// Runs exactly once, after the thread terminated and was destroyed,
    /// either on the CPU it completed on with preemption disabled or in
    /// `detach` when that comes later. It must not block. A thread that is
    /// joined instead never runs its cleanup.
    pub fn set_cleanup(&self, cleanup: impl FnOnce() + Send + 'static) {
        *self.cleanup.lock() = Some(Box::new(cleanup));
    }

    fn run_cleanup(&self) {
        let cleanup = self.cleanup.lock().take();
        if let Some(cleanup) = cleanup {
            log::trace!("sched_cleanup {}", self.id);
            cleanup();
        }
    }

    pub fn is_detached(&self) -> bool {
        self.detach_state.load(Ordering::Acquire) == DETACHED
    }

    pub fn wake(&self) {
        wake_impl(&self.detached, StatusMask::WAITING);
    }

    /// Run `action`, then wake the thread
    pub fn wake_with(&self, action: impl FnOnce()) {
        let ds = self.detached.clone();
        action();
        wake_impl(&ds, StatusMask::WAITING);
    }

    /// Like `wake_with`, also completing a lock handoff (`sending_lock`)
    pub fn wake_with_from_mutex(&self, action: impl FnOnce()) {
        let ds = self.detached.clone();
        action();
        wake_impl(&ds, StatusMask::WAITING | StatusMask::SENDING_LOCK);
    }

    /// Start handing a lock to this waiting thread
    ///
    /// Returns false if the thread is not waiting; it then has to acquire
    /// the lock itself. On success the thread stays blocked until
    /// `wake_with_from_mutex`.
    pub fn wake_lock(&self, handoff: impl FnOnce()) -> bool {
        if self
            .detached
            .st
            .compare_exchange(Status::Waiting, Status::SendingLock)
            .is_err()
        {
            return false;
        }
        self.detached.lock_sent.store(true, Ordering::Release);
        handoff();
        true
    }

    /// Whether a lock was handed over while waiting; clears the flag
    pub fn take_lock_sent(&self) -> bool {
        self.detached.lock_sent.swap(false, Ordering::AcqRel)
    }

    /// Terminate a thread that is blocked; fails on any other state
    pub fn unsafe_stop(&self) -> bool {
        self.detached
            .st
            .compare_exchange(Status::Waiting, Status::Terminated)
            .is_ok()
    }

    /// Set the interrupted flag and wake the thread
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.wake();
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub(crate) fn set_interrupted(&self, interrupted: bool) {
        self.interrupted.store(interrupted, Ordering::Release);
    }

    pub fn handle(&self) -> ThreadHandle {
        ThreadHandle(self.detached.clone())
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> Status {
        self.detached.st.load()
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.detached.st.store(status);
    }

    pub fn is_idle(&self) -> bool {
        self.is_idle
    }

    pub fn sched(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    pub fn priority(&self) -> Runtime {
        self.runtime.lock().priority()
    }

    pub fn set_priority(&self, priority: Runtime) {
        assert!(priority.is_finite(), "only idle threads have infinite priority");
        self.runtime.lock().set_priority(priority);
    }

    /// Local runtime as seen by the CPU the thread belongs to
    pub fn local_runtime(&self) -> Runtime {
        self.runtime.lock().local()
    }

    /// CPU the thread belongs to
    pub fn tcpu(&self) -> &Cpu {
        self.sched.cpu_at(self.tcpu_index())
    }

    pub(crate) fn tcpu_index(&self) -> usize {
        self.detached.cpu.load(Ordering::Acquire)
    }

    /// CPU currently executing the thread
    pub(crate) fn running_cpu(&self) -> &Cpu {
        self.sched.cpu_at(self.running_on.load(Ordering::Acquire))
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    pub fn migration_locked(&self) -> bool {
        self.migration_lock_counter.load(Ordering::Acquire) > 0
    }

    pub fn preempt_disable(&self) {
        self.preempt_counter.fetch_add(1, Ordering::AcqRel);
    }

    /// Re-enable preemption; at zero, pending interrupts are delivered
    pub fn preempt_enable(&self) {
        let previous = self.preempt_counter.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "{}: unbalanced preempt_enable", self.id);
        if previous == 1 && self.is_current() {
            super::cpu::preempt_point();
        }
    }

    /// Leave a preempt_disable section without delivering interrupts
    pub(crate) fn preempt_enable_no_resched(&self) {
        let previous = self.preempt_counter.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "{}: unbalanced preempt_enable", self.id);
    }

    pub fn preemptable(&self) -> bool {
        self.preempt_counter.load(Ordering::Acquire) == 0
    }

    pub fn stat_switches(&self) -> u64 {
        self.stats.switches.load(Ordering::Relaxed)
    }

    pub fn stat_preemptions(&self) -> u64 {
        self.stats.preemptions.load(Ordering::Relaxed)
    }

    pub fn stat_migrations(&self) -> u64 {
        self.stats.migrations.load(Ordering::Relaxed)
    }

    /// CPU time consumed up to the last context switch
    pub fn total_cpu_time(&self) -> Duration {
        self.stats.cpu_time()
    }

    /// CPU time consumed, including the running interval of the caller
    pub fn thread_clock(&self) -> Duration {
        let total = self.stats.cpu_time();
        if !self.is_current() {
            return total;
        }
        let since = self.running_cpu().state.lock().running_since;
        total + self.sched.machine().now().saturating_duration_since(since)
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        THREAD_MAP.lock().remove(&self.id.0);
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .field("cpu", &self.tcpu_index())
            .finish()
    }
}

impl Schedulable for Arc<Thread> {
    fn local_runtime(&self) -> Runtime {
        self.runtime.lock().local()
    }

    fn queue_addr(&self) -> usize {
        Arc::as_ptr(self) as usize
    }

    fn renormalize(&self, c_max: Runtime) {
        self.runtime.lock().renormalize(c_max);
    }
}

fn next_free_id(map: &BTreeMap<u32, Weak<Thread>>) -> ThreadId {
    loop {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 && !map.contains_key(&id) {
            return ThreadId(id);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}

/// Leave the calling kernel thread; it completes as if its body returned
pub fn exit() -> ! {
    assert!(Thread::try_current().is_some(), "exit() outside a kernel thread");
    unwind_thread()
}

/// Live thread with the given id
pub fn find_by_id(id: ThreadId) -> Option<Arc<Thread>> {
    THREAD_MAP.lock().get(&id.0).and_then(Weak::upgrade)
}

/// Number of live threads, across every scheduler instance
pub fn numthreads() -> usize {
    THREAD_MAP.lock().values().filter(|t| t.strong_count() > 0).count()
}

/// Call `f` on every live thread
///
/// The threads are collected first, so `f` may create or join threads.
pub fn with_all_threads(mut f: impl FnMut(&Arc<Thread>)) {
    let threads: Vec<Arc<Thread>> = THREAD_MAP.lock().values().filter_map(Weak::upgrade).collect();
    for t in &threads {
        f(t);
    }
}
