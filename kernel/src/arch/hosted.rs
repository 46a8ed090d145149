/*
 * Hosted Machine
 *
 * This module runs the scheduler on a development host. Every emulated CPU
 * is a set of interrupt flags plus a one-shot deadline guarded by a mutex,
 * and every kernel thread is backed by its own OS thread.
 *
 * Why this is important:
 * - The scheduler core can be exercised end to end (wakeups, timers,
 *   preemption, migration) without booting a kernel
 * - Clock events and wakeup IPIs behave like their hardware counterparts:
 *   they only mark interrupts pending, and the CPU notices them at its next
 *   interrupt point or when it halts
 *
 * Context switching works by handing a baton. At any moment exactly one
 * backing OS thread per CPU is allowed to run scheduler code; switching
 * resumes the next thread's gate and parks the current one on its own gate.
 * A thread whose gate is released after it terminated never runs again.
 */

use std::panic;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::{Instant, Machine, Pending};
use crate::error::SchedError;
use crate::scheduler::types::MAX_CPUS;

/// Smallest stack handed to a backing OS thread
const MIN_STACK_SIZE: usize = 64 * 1024;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct IrqState {
    pending: Pending,
    deadline: Option<Instant>,
}

impl IrqState {
    /// Turn a deadline that has passed into a pending timer interrupt
    fn expire(&mut self, now: Instant) {
        if self.deadline.is_some_and(|d| d <= now) {
            self.deadline = None;
            self.pending |= Pending::TIMER;
        }
    }
}

#[derive(Debug, Default)]
struct HostedCpu {
    irq: Mutex<IrqState>,
    wakeup: Condvar,
    ipis: AtomicU64,
}

/// A machine whose CPUs are emulated on the host
#[derive(Debug)]
pub struct HostedMachine {
    boot: std::time::Instant,
    cpus: Box<[HostedCpu]>,
}

impl HostedMachine {
    pub fn new(cpus: usize) -> Result<Self, SchedError> {
        if cpus == 0 {
            return Err(SchedError::NoCpus);
        }
        if cpus > MAX_CPUS {
            return Err(SchedError::TooManyCpus {
                requested: cpus,
                max: MAX_CPUS,
            });
        }
        Ok(Self {
            boot: std::time::Instant::now(),
            cpus: (0..cpus).map(|_| HostedCpu::default()).collect(),
        })
    }

    /// Number of wakeup IPIs delivered to `cpu` so far
    pub fn ipi_count(&self, cpu: usize) -> u64 {
        self.cpus[cpu].ipis.load(Ordering::Relaxed)
    }
}

impl Machine for HostedMachine {
    fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    fn now(&self) -> Instant {
        let ns = self.boot.elapsed().as_nanos();
        Instant::from_nanos(u64::try_from(ns).unwrap_or(u64::MAX))
    }

    fn set_clock_event(&self, cpu: usize, deadline: Option<Instant>) {
        let c = &self.cpus[cpu];
        lock(&c.irq).deadline = deadline;
        c.wakeup.notify_all();
    }

    fn send_wakeup_ipi(&self, cpu: usize) {
        let c = &self.cpus[cpu];
        lock(&c.irq).pending |= Pending::WAKEUP;
        c.ipis.fetch_add(1, Ordering::Relaxed);
        c.wakeup.notify_all();
    }

    fn halt(&self, cpu: usize) {
        let c = &self.cpus[cpu];
        let mut irq = lock(&c.irq);
        loop {
            let now = self.now();
            irq.expire(now);
            if !irq.pending.is_empty() {
                return;
            }
            irq = match irq.deadline {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(now);
                    c.wakeup
                        .wait_timeout(irq, timeout)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0)
                }
                None => c.wakeup.wait(irq).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    fn take_pending(&self, cpu: usize) -> Pending {
        let mut irq = lock(&self.cpus[cpu].irq);
        irq.expire(self.now());
        core::mem::take(&mut irq.pending)
    }
}

/// Unwind payload used by `exit()` to leave a kernel thread's body early
#[derive(Debug)]
pub struct ThreadExit;

/// Leave the calling kernel thread's body, running destructors on the way
pub fn unwind_thread() -> ! {
    panic::resume_unwind(Box::new(ThreadExit))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Parked,
    Resumed,
    Released,
}

type Entry = Box<dyn FnOnce() + Send + 'static>;

/// Execution context of one kernel thread
///
/// The backing OS thread is spawned the first time the context is resumed.
pub struct Context {
    name: String,
    stack_size: usize,
    entry: Mutex<Option<Entry>>,
    gate: Mutex<Gate>,
    resumed: Condvar,
}

impl Context {
    pub fn new(name: &str, stack_size: usize, entry: Entry) -> Self {
        Self {
            name: name.into(),
            stack_size: stack_size.max(MIN_STACK_SIZE),
            entry: Mutex::new(Some(entry)),
            gate: Mutex::new(Gate::Parked),
            resumed: Condvar::new(),
        }
    }

    /// Hand the CPU to `next` and park until this context is resumed.
    ///
    /// Returns false if the context was released instead: its thread has
    /// been destroyed and the caller must unwind without touching any CPU.
    pub fn switch_to(&self, next: &Context) -> bool {
        next.resume();
        self.park()
    }

    /// Let this context run, starting its backing OS thread if needed
    pub fn resume(&self) {
        if let Some(entry) = lock(&self.entry).take() {
            let spawned = thread::Builder::new()
                .name(self.name.clone())
                .stack_size(self.stack_size)
                .spawn(entry);
            if let Err(err) = spawned {
                panic!("cannot start backing thread for {}: {}", self.name, err);
            }
            return;
        }
        let mut gate = lock(&self.gate);
        if *gate == Gate::Parked {
            *gate = Gate::Resumed;
        }
        self.resumed.notify_one();
    }

    /// Block the calling backing thread until resumed or released
    pub fn park(&self) -> bool {
        let mut gate = lock(&self.gate);
        loop {
            match *gate {
                Gate::Resumed => {
                    *gate = Gate::Parked;
                    return true;
                }
                Gate::Released => return false,
                Gate::Parked => {
                    gate = self.resumed.wait(gate).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Mark the context dead; a parked backing thread wakes up and exits
    pub fn release(&self) {
        *lock(&self.gate) = Gate::Released;
        self.resumed.notify_all();
    }

    pub fn is_released(&self) -> bool {
        *lock(&self.gate) == Gate::Released
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("gate", &*lock(&self.gate))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;

    #[test]
    fn rejects_bad_cpu_counts() {
        assert_eq!(HostedMachine::new(0).err(), Some(SchedError::NoCpus));
        assert_eq!(
            HostedMachine::new(MAX_CPUS + 1).err(),
            Some(SchedError::TooManyCpus {
                requested: MAX_CPUS + 1,
                max: MAX_CPUS
            })
        );
    }

    #[test]
    fn clock_event_becomes_pending_timer() {
        let m = HostedMachine::new(2).unwrap();
        assert!(m.take_pending(0).is_empty());
        m.set_clock_event(0, Some(m.now()));
        assert_eq!(m.take_pending(0), Pending::TIMER);
        assert!(m.take_pending(0).is_empty());
        assert!(m.take_pending(1).is_empty());
    }

    #[test]
    fn halt_returns_on_deadline_and_ipi() {
        let m = Arc::new(HostedMachine::new(1).unwrap());
        let start = m.now();
        m.set_clock_event(0, Some(start + Duration::from_millis(20)));
        m.halt(0);
        assert!(m.now().saturating_duration_since(start) >= Duration::from_millis(20));
        assert_eq!(m.take_pending(0), Pending::TIMER);

        let remote = m.clone();
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.send_wakeup_ipi(0);
        });
        m.halt(0);
        sender.join().unwrap();
        assert_eq!(m.take_pending(0), Pending::WAKEUP);
        assert_eq!(m.ipi_count(0), 1);
    }

    #[test]
    fn baton_passes_between_contexts() {
        let (tx, rx) = mpsc::channel();
        let ctx = Arc::new(Context::new("baton", 0, Box::new(|| {})));
        // the worker below plays the part of ctx's backing thread
        lock(&ctx.entry).take();
        let worker_ctx = ctx.clone();
        let worker = Context::new(
            "worker",
            0,
            Box::new(move || {
                tx.send("started").unwrap();
                assert!(worker_ctx.park());
                tx.send("resumed").unwrap();
                assert!(!worker_ctx.park());
                tx.send("released").unwrap();
            }),
        );
        worker.resume();
        assert_eq!(rx.recv().unwrap(), "started");
        ctx.resume();
        assert_eq!(rx.recv().unwrap(), "resumed");
        ctx.release();
        assert_eq!(rx.recv().unwrap(), "released");
        assert!(ctx.is_released());
    }
}
