/*
 * Thread Migration and Pinning
 *
 * A thread is moved between CPUs only by code running on the CPU it
 * currently belongs to: the thread itself, the CPU's load balancer, or a
 * short-lived helper thread pinned there. That keeps every run queue and
 * timer list private to its own CPU.
 *
 * Why this is important:
 * - A migrating thread leaves with a CPU-independent runtime and is
 *   rescaled to the destination clock when it arrives
 * - Its armed timers are unlinked from the old CPU and relinked on the new
 * - A migration-locked thread is never moved by the load balancer, and
 *   pinning it from outside waits for the lock to be dropped
 */

use alloc::sync::Arc;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use core::time::Duration;

use super::Scheduler;
use super::thread::{Attr, Thread};
use super::types::{CpuId, Status};
use super::wait::{sleep, wait_until};
use crate::error::SchedError;

const PIN_RETRY: u8 = 0;
const PIN_DONE: u8 = 1;
const PIN_LOCKED: u8 = 2;

pub fn migrate_disable() {
    Thread::current().migration_lock_counter.fetch_add(1, Ordering::AcqRel);
}

pub fn migrate_enable() {
    let previous = Thread::current().migration_lock_counter.fetch_sub(1, Ordering::AcqRel);
    assert!(previous > 0, "unbalanced migrate_enable");
}

/// Keeps the current thread on its CPU while alive
#[derive(Debug)]
pub struct MigrationGuard {
    _not_send: PhantomData<*const ()>,
}

impl MigrationGuard {
    pub fn new() -> Self {
        migrate_disable();
        Self { _not_send: PhantomData }
    }
}

impl Drop for MigrationGuard {
    fn drop(&mut self) {
        migrate_enable();
    }
}

impl Thread {
    fn mark_pinned(&self) {
        if !self.pinned.swap(true, Ordering::AcqRel) {
            self.migration_lock_counter.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn mark_unpinned(&self) {
        if self.pinned.swap(false, Ordering::AcqRel) {
            self.migration_lock_counter.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Move the calling thread to `target` and keep it there
    pub fn pin_current(target: CpuId) -> Result<(), SchedError> {
        let t = Thread::current();
        let sched = t.sched().clone();
        let target_cpu = sched.cpu(target)?;
        t.mark_pinned();

        let source = t.running_cpu();
        if source.index() == target_cpu.index() {
            return Ok(());
        }

        // Someone on the source CPU has to wake us once we are off it.
        let go = Arc::new(AtomicBool::new(false));
        let wakeme = {
            let go = go.clone();
            let t = t.clone();
            Thread::create(
                &sched,
                move || {
                    wait_until(|| go.load(Ordering::Acquire));
                    t.wake();
                },
                Attr::new().name("wakeme").pin(source.id()),
                false,
            )
        };
        wakeme.start();

        {
            let mut st = source.state.lock();
            log::debug!("sched_migrate {} {} -> {}", t.id(), source.id(), target_cpu.id());
            t.stats.migrations.fetch_add(1, Ordering::Relaxed);
            t.timers.suspend(&mut st.timers);
            t.detached.cpu.store(target_cpu.index(), Ordering::Release);
            t.set_status(Status::Waiting);
        }
        wakeme.wake_with(|| go.store(true, Ordering::Release));
        source.reschedule_from_interrupt(false, Duration::ZERO);
        wakeme.join();
        Ok(())
    }

    /// Move this thread to `target` and keep it there
    ///
    /// Must be called from a kernel thread. Pinning a thread that already
    /// terminated does nothing.
    pub fn pin(self: &Arc<Self>, target: CpuId) -> Result<(), SchedError> {
        let sched = self.sched().clone();
        sched.cpu(target)?;
        if Thread::try_current().is_some_and(|me| Arc::ptr_eq(&me, self)) {
            return Thread::pin_current(target);
        }
        match self.status() {
            Status::Unstarted | Status::Prestarted => {
                self.pinned_cpu.store(target.as_usize(), Ordering::Release);
                self.detached.cpu.store(target.as_usize(), Ordering::Release);
                self.mark_pinned();
                return Ok(());
            }
            Status::Terminating | Status::Terminated => {
                log::debug!("pin of terminated {} ignored", self.id());
                return Ok(());
            }
            _ => {}
        }

        let mut attempts = 0;
        loop {
            let source = self.tcpu().id();
            let outcome = Arc::new(AtomicU8::new(PIN_RETRY));
            let helper = {
                let t = self.clone();
                let outcome = outcome.clone();
                let helper_sched = sched.clone();
                Thread::create(
                    &sched,
                    move || {
                        let result = move_from_here(&helper_sched, &t, source, target);
                        outcome.store(result, Ordering::Release);
                    },
                    Attr::new().name("pin").pin(source),
                    false,
                )
            };
            helper.start();
            helper.join();
            match outcome.load(Ordering::Acquire) {
                PIN_DONE => return Ok(()),
                PIN_LOCKED => {
                    attempts += 1;
                    if attempts >= sched.config().pin_retry_limit {
                        panic!(
                            "{} stayed migration-locked, cannot pin it to {}",
                            self.id(),
                            target
                        );
                    }
                    sleep(sched.config().pin_retry_sleep);
                }
                _ => {}
            }
        }
    }

    /// Let the thread migrate again
    pub fn unpin(self: &Arc<Self>) {
        if Thread::try_current().is_some_and(|me| Arc::ptr_eq(&me, self)) {
            self.mark_unpinned();
            return;
        }
        if matches!(self.status(), Status::Unstarted | Status::Prestarted) {
            self.pinned_cpu.store(usize::MAX, Ordering::Release);
            self.mark_unpinned();
            return;
        }
        let sched = self.sched().clone();
        let t = self.clone();
        let helper = Thread::create(
            &sched,
            move || {
                // follow the thread until we share its CPU
                let me = Thread::current();
                loop {
                    let there = t.tcpu().id();
                    if me.running_cpu().id() == there {
                        break;
                    }
                    if Thread::pin_current(there).is_err() {
                        return;
                    }
                }
                t.mark_unpinned();
            },
            Attr::new().name("unpin").pin(self.tcpu().id()),
            false,
        );
        helper.start();
        helper.join();
    }
}

/// Runs on `source`: send `t` to `target` if it still belongs here
fn move_from_here(sched: &Arc<Scheduler>, t: &Arc<Thread>, source: CpuId, target: CpuId) -> u8 {
    let me = Thread::current();
    let cpu = me.running_cpu();
    assert_eq!(cpu.id(), source, "pin helper running on the wrong cpu");
    if t.tcpu().id() != source {
        return PIN_RETRY;
    }
    // the pin itself holds one count; anything above it is a migrate_disable()
    if t.migration_lock_counter.load(Ordering::Acquire) > u32::from(t.is_pinned()) {
        return PIN_LOCKED;
    }

    if source != target {
        let target_cpu = sched.cpu_at(target.as_usize());
        let mut st = cpu.state.lock();
        match t.status() {
            Status::Queued => {
                let Some(queued) = cpu.erase(&mut st, t) else {
                    return PIN_RETRY;
                };
                cpu.migrate_out(&mut st, queued, target_cpu, sched);
            }
            status @ (Status::Waiting | Status::SendingLock) => {
                if t.detached.st.compare_exchange(status, Status::Waking).is_err() {
                    return PIN_RETRY;
                }
                cpu.migrate_out(&mut st, t.clone(), target_cpu, sched);
            }
            Status::Waking => return PIN_RETRY,
            Status::Unstarted | Status::Prestarted => {
                t.pinned_cpu.store(target.as_usize(), Ordering::Release);
                t.detached.cpu.store(target.as_usize(), Ordering::Release);
            }
            Status::Terminating | Status::Terminated => {
                log::debug!("pin of terminated {} ignored", t.id());
                return PIN_DONE;
            }
            status => panic!(
                "{} is {:?} on {} while the pin helper runs there",
                t.id(),
                status,
                source
            ),
        }
    }
    t.mark_pinned();
    PIN_DONE
}
