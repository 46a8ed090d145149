/*
 * Blocking Waits
 *
 * A thread blocks by publishing "waiting" in its status, re-checking its
 * wake condition, and only then scheduling away. Any waker that changes the
 * condition afterwards finds the thread waiting and wakes it, so a wakeup
 * can never be lost between the check and the switch.
 *
 * Preemption stays disabled between prepare_wait and stop_wait: a thread
 * that was preempted while "waiting" would never be requeued.
 */

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;

use spin::{Mutex, MutexGuard};

use super::cpu::schedule;
use super::thread::{Thread, ThreadHandle};
use super::timer::Timer;
use super::types::Status;
use crate::arch::Instant;
use crate::error::Interrupted;

impl Thread {
    pub(crate) fn prepare_wait(&self) {
        self.preempt_disable();
        assert_eq!(self.status(), Status::Running, "{} waits while not running", self.id());
        self.set_status(Status::Waiting);
    }

    pub(crate) fn stop_wait(&self) {
        let st = &self.detached.st;
        if st.compare_exchange(Status::Waiting, Status::Running).is_ok() {
            self.preempt_enable();
            return;
        }
        self.preempt_enable();
        if st.load() == Status::Terminated {
            // stopped by unsafe_stop: never runs again
            schedule();
        }
        while matches!(st.load(), Status::Waking | Status::SendingLock) {
            schedule();
        }
        assert_eq!(st.load(), Status::Running, "{} left a wait in a bad state", self.id());
    }
}

/// RAII form of prepare_wait / stop_wait
pub struct WaitGuard<'a> {
    t: &'a Thread,
    active: bool,
}

impl<'a> WaitGuard<'a> {
    pub fn new(t: &'a Thread) -> Self {
        t.prepare_wait();
        Self { t, active: true }
    }

    /// End the wait early
    pub fn stop(&mut self) {
        if self.active {
            self.active = false;
            self.t.stop_wait();
        }
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Block the calling thread until `pred` holds
///
/// `pred` runs with preemption disabled; whoever makes it true must wake
/// the thread afterwards.
pub fn wait_until(mut pred: impl FnMut() -> bool) {
    let me = Thread::current();
    assert!(me.preemptable(), "{} would block with preemption disabled", me.id());
    if pred() {
        return;
    }
    loop {
        let _wait = WaitGuard::new(&me);
        if pred() {
            return;
        }
        schedule();
    }
}

/// Like `wait_until`, but `Thread::interrupt` cuts it short
pub fn wait_until_interruptible(mut pred: impl FnMut() -> bool) -> Result<(), Interrupted> {
    let me = Thread::current();
    assert!(me.preemptable(), "{} would block with preemption disabled", me.id());
    me.set_interrupted(false);
    loop {
        let mut wait = WaitGuard::new(&me);
        if pred() {
            return Ok(());
        }
        if me.interrupted() {
            wait.stop();
            me.set_interrupted(false);
            return Err(Interrupted);
        }
        schedule();
    }
}

/// Block the calling thread until `deadline`
pub fn sleep_until(deadline: Instant) {
    let me = Thread::current();
    let timer = Timer::new(&me);
    timer.set(deadline);
    wait_until(|| timer.expired());
}

/// Block the calling thread for `duration`
pub fn sleep(duration: Duration) {
    let deadline = Thread::current().sched().machine().now() + duration;
    sleep_until(deadline);
}

/// Something `wait_for` can block on
///
/// `arm` registers the calling thread so that whoever makes `poll` true
/// wakes it; `disarm` undoes that once the wait is over.
pub trait Waitable {
    fn arm(&mut self) {}
    fn poll(&self) -> bool;
    fn disarm(&mut self) {}
}

impl Waitable for Timer {
    fn poll(&self) -> bool {
        self.expired()
    }
}

/// Block until at least one of `objects` is ready
///
/// Every object is armed before the first check and disarmed afterwards,
/// so the caller can ask each one whether it fired.
pub fn wait_for(objects: &mut [&mut dyn Waitable]) {
    for object in objects.iter_mut() {
        object.arm();
    }
    wait_until(|| objects.iter().any(|object| object.poll()));
    for object in objects.iter_mut() {
        object.disarm();
    }
}

#[derive(Debug)]
struct WaitRecord {
    handle: ThreadHandle,
    woken: AtomicBool,
}

impl WaitRecord {
    fn woken(&self) -> bool {
        self.woken.load(Ordering::Acquire)
    }

    fn wake(&self) {
        self.handle.wake_with(|| self.woken.store(true, Ordering::Release));
    }
}

/// Threads waiting for a condition guarded by a spin mutex
///
/// The mutex must only be held for short sections without interrupt points.
#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: Mutex<VecDeque<Arc<WaitRecord>>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    fn enqueue_current(&self) -> Arc<WaitRecord> {
        let record = Arc::new(WaitRecord {
            handle: Thread::current().handle(),
            woken: AtomicBool::new(false),
        });
        self.waiters.lock().push_back(record.clone());
        record
    }

    fn remove(&self, record: &Arc<WaitRecord>) -> bool {
        let mut waiters = self.waiters.lock();
        let before = waiters.len();
        waiters.retain(|r| !Arc::ptr_eq(r, record));
        waiters.len() != before
    }

    /// Release `guard`, block until woken, and lock `mutex` again
    pub fn wait<'a, T>(&self, mutex: &'a Mutex<T>, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let record = self.enqueue_current();
        drop(guard);
        wait_until(|| record.woken());
        mutex.lock()
    }

    /// Like `wait`, giving up after `timeout`; the flag is true on timeout
    pub fn wait_timeout<'a, T>(
        &self,
        mutex: &'a Mutex<T>,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        let me = Thread::current();
        let record = self.enqueue_current();
        drop(guard);
        let timer = Timer::new(&me);
        timer.set_after(timeout);
        wait_until(|| record.woken() || timer.expired());
        drop(timer);
        // a wake_one racing with the timeout still counts as a wakeup
        let timed_out = !record.woken() && self.remove(&record);
        (mutex.lock(), timed_out)
    }

    /// Wake the longest waiting thread; false if nobody waits
    pub fn wake_one(&self) -> bool {
        let record = self.waiters.lock().pop_front();
        match record {
            Some(record) => {
                record.wake();
                true
            }
            None => false,
        }
    }

    /// Wake every waiting thread and return how many there were
    pub fn wake_all(&self) -> usize {
        let records = core::mem::take(&mut *self.waiters.lock());
        for record in &records {
            record.wake();
        }
        records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    /// A waiter for `wait_for`, queued while it is armed
    pub fn waiter(&self) -> QueueWaiter<'_> {
        QueueWaiter {
            queue: self,
            record: None,
            woken: false,
        }
    }
}

/// Waits for a `wake_one` or `wake_all` on a `WaitQueue`
#[derive(Debug)]
pub struct QueueWaiter<'a> {
    queue: &'a WaitQueue,
    record: Option<Arc<WaitRecord>>,
    woken: bool,
}

impl QueueWaiter<'_> {
    pub fn woken(&self) -> bool {
        self.woken || self.poll()
    }
}

impl Waitable for QueueWaiter<'_> {
    fn arm(&mut self) {
        if self.record.is_none() {
            self.woken = false;
            self.record = Some(self.queue.enqueue_current());
        }
    }

    fn poll(&self) -> bool {
        self.record.as_ref().is_some_and(|record| record.woken())
    }

    fn disarm(&mut self) {
        if let Some(record) = self.record.take() {
            // popped by a waker that has not flagged it yet
            self.woken = record.woken() || !self.queue.remove(&record);
        }
    }
}

impl Drop for QueueWaiter<'_> {
    fn drop(&mut self) {
        self.disarm();
    }
}
