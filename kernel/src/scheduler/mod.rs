/*
 * Fair-Share Thread Scheduler
 *
 * This module implements a per-CPU, preemptive, fair-share scheduler. Each
 * CPU picks the runnable thread that consumed the least priority-weighted
 * CPU time "recently", where recent history decays exponentially with time
 * constant tau.
 *
 * THREAD LIFECYCLE:
 * ================
 *
 *   prestarted -> unstarted -> waiting -> waking -> queued <-> running
 *                                 ^                              |
 *                                 +------------------------------+
 *                                                                |
 *                                       terminated <- terminating
 *
 * - waiting:      blocked, or about to block (see wait.rs)
 * - sending_lock: waiting while a lock is being handed to the thread
 * - waking:       claimed by a waker, sitting on an incoming wakeup queue
 * - queued:       on its CPU's run queue
 * - terminating:  finished, waiting for the next thread on its CPU to
 *                 destroy it
 *
 * KEY PIECES:
 * ==========
 *
 * 1. RUNTIME ACCOUNTING (runtime.rs): per-CPU virtual clock plus one
 *    runtime per thread
 * 2. RUN QUEUE (runqueue.rs): runnable threads ordered by runtime
 * 3. RESCHEDULE (cpu.rs): charge, pick, program the preemption timer, switch
 * 4. WAKEUPS (wakeup.rs): lock-free hand-off of woken threads to their CPU
 * 5. TIMERS (timer.rs): per-CPU sorted timer lists over one clock event
 * 6. MIGRATION (migrate.rs, balance.rs): pinning and load balancing
 *
 * A `Scheduler` owns all CPUs of one machine. Several schedulers can exist
 * side by side; threads never cross from one to another.
 */

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;

use spin::Mutex;

pub mod balance;
pub mod cpu;
pub mod migrate;
pub mod runqueue;
pub mod runtime;
pub mod thread;
pub mod timer;
pub mod tls;
pub mod types;
pub mod wait;
pub mod wakeup;

pub use cpu::{
    Cpu, preempt, preempt_disable, preempt_enable, preempt_point, preemptable, schedule, yield_for,
    yield_now,
};
pub use migrate::{MigrationGuard, migrate_disable, migrate_enable};
pub use runtime::{PRIORITY_DEFAULT, PRIORITY_IDLE, PRIORITY_INFINITY};
pub use thread::{Attr, Thread, ThreadHandle, exit, find_by_id, numthreads, with_all_threads};
pub use timer::{Timer, TimerState};
pub use tls::TlsTemplate;
pub use types::{CpuId, MAX_CPUS, Runtime, Status, ThreadId};
pub use wait::{
    QueueWaiter, WaitGuard, WaitQueue, Waitable, sleep, sleep_until, wait_for, wait_until,
    wait_until_interruptible,
};

use crate::arch::hosted::ThreadExit;
use crate::arch::{HostedMachine, Machine};
use crate::config::SchedConfig;
use crate::error::SchedError;
use runtime::Tuning;

/// The scheduler of one machine
pub struct Scheduler {
    config: SchedConfig,
    tuning: Tuning,
    machine: Arc<dyn Machine>,
    cpus: Box<[Cpu]>,
    started: AtomicBool,
    // threads started before the scheduler
    pub(crate) prestarted: Mutex<Vec<Arc<Thread>>>,
    panics: Mutex<Vec<String>>,
}

impl Scheduler {
    pub fn new(config: SchedConfig, machine: Arc<dyn Machine>) -> Result<Arc<Self>, SchedError> {
        config.validate()?;
        let ncpus = machine.cpu_count();
        if ncpus == 0 {
            return Err(SchedError::NoCpus);
        }
        if ncpus > MAX_CPUS {
            return Err(SchedError::TooManyCpus {
                requested: ncpus,
                max: MAX_CPUS,
            });
        }
        // one wakeup source slot per CPU, plus one for outside wakers
        let cpus = (0..ncpus)
            .map(|i| Cpu::new(CpuId(i as u32), ncpus + 1, &config))
            .collect();
        log::info!("scheduler: {} cpus, tau {:?}, thyst {:?}", ncpus, config.tau, config.thyst);
        Ok(Arc::new(Self {
            tuning: config.tuning(),
            config,
            machine,
            cpus,
            started: AtomicBool::new(false),
            prestarted: Mutex::new(Vec::new()),
            panics: Mutex::new(Vec::new()),
        }))
    }

    /// A scheduler for `cpus` CPUs emulated on the host
    pub fn hosted(cpus: usize, config: SchedConfig) -> Result<Arc<Self>, SchedError> {
        let machine = HostedMachine::new(cpus)?;
        Scheduler::new(config, Arc::new(machine))
    }

    /// Bring up every CPU, then launch the threads started so far
    pub fn start(self: &Arc<Self>) -> Result<(), SchedError> {
        let early = {
            let mut early = self.prestarted.lock();
            if self.started.swap(true, Ordering::AcqRel) {
                return Err(SchedError::AlreadyStarted);
            }
            core::mem::take(&mut *early)
        };

        let now = self.machine.now();
        for cpu in self.cpus.iter() {
            let sched = self.clone();
            let idx = cpu.index();
            let idle = Thread::create(
                self,
                move || sched.cpu_at(idx).idle(),
                Attr::new()
                    .name(&alloc::format!("idle{}", idx))
                    .pin(cpu.id())
                    .priority(PRIORITY_IDLE),
                true,
            );
            idle.set_status(Status::Running);
            idle.keep_alive();
            cpu.state.lock().running_since = now;
            cpu.set_idle_thread(idle.clone());
            log::info!("{}: online", cpu.id());
            idle.context.resume();
        }

        if self.config.load_balancer {
            for cpu in self.cpus.iter() {
                let sched = self.clone();
                let idx = cpu.index();
                let balancer = Thread::create(
                    self,
                    move || sched.cpu_at(idx).load_balance(),
                    Attr::new()
                        .name(&alloc::format!("balancer{}", idx))
                        .pin(cpu.id())
                        .priority(self.config.balancer_priority),
                    false,
                );
                balancer.launch();
            }
        }

        for t in early {
            t.set_status(Status::Unstarted);
            t.launch();
        }
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Create a thread; it runs once started
    pub fn thread<F>(self: &Arc<Self>, f: F, attr: Attr) -> Result<Arc<Thread>, SchedError>
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(cpu) = attr.pinned_cpu() {
            self.cpu(cpu)?;
        }
        Ok(Thread::create(self, f, attr, false))
    }

    /// Create and start a thread with default attributes
    pub fn spawn<F>(self: &Arc<Self>, f: F) -> Arc<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let t = Thread::create(self, f, Attr::new(), false);
        t.start();
        t
    }

    /// Run `f` as the main kernel thread and wait for its result
    ///
    /// Starts the scheduler if needed. A panic of `f` is re-raised here; so
    /// is any panic recorded by another kernel thread.
    pub fn run_main<F, R>(self: &Arc<Self>, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if !self.is_started() {
            // losing a race with another starter is fine
            let _ = self.start();
        }
        let (tx, rx) = mpsc::sync_channel(1);
        let main = Thread::create(
            self,
            move || match panic::catch_unwind(AssertUnwindSafe(f)) {
                Err(payload) if payload.is::<ThreadExit>() => panic::resume_unwind(payload),
                outcome => {
                    let _ = tx.send(outcome);
                }
            },
            Attr::new().name("main"),
            false,
        );
        main.start();

        let outcome = rx.recv();
        let panics = self.take_panics();
        match outcome {
            Ok(Ok(value)) => {
                if !panics.is_empty() {
                    panic!("kernel thread panicked: {}", panics.join("; "));
                }
                value
            }
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => panic!("main thread exited without a result"),
        }
    }

    pub(crate) fn record_panic(&self, message: String) {
        self.panics.lock().push(message);
    }

    /// Panics of kernel threads since the last call
    pub fn take_panics(&self) -> Vec<String> {
        core::mem::take(&mut *self.panics.lock())
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub(crate) fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    pub fn machine(&self) -> &dyn Machine {
        &*self.machine
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpus(&self) -> &[Cpu] {
        &self.cpus
    }

    pub fn cpu(&self, id: CpuId) -> Result<&Cpu, SchedError> {
        self.cpus.get(id.as_usize()).ok_or(SchedError::NoSuchCpu(id.as_usize()))
    }

    pub(crate) fn cpu_at(&self, idx: usize) -> &Cpu {
        &self.cpus[idx]
    }

    /// Wakeup source slot of wakers outside any kernel thread
    pub(crate) fn external_slot(&self) -> usize {
        self.cpus.len()
    }
}

impl core::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler")
            .field("cpus", &self.cpus)
            .field("started", &self.is_started())
            .finish()
    }
}
