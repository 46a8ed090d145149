/*
 * Cross-CPU Wakeups
 *
 * Waking a thread never touches the target CPU's run queue. The waker
 * claims the thread (waiting -> waking), pushes it on the target's incoming
 * queue reserved for the waker's own CPU, and flags that queue in the
 * target's incoming mask. The target drains its queues at its next
 * reschedule.
 *
 * Each (target, source) queue has a single producer: the thread running on
 * the source CPU. Wakers outside any kernel thread share one extra slot,
 * which is why the queues are multi-producer.
 */

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use heapless::mpmc::MpMcQueue;

use super::thread::{DetachedState, Thread};
use super::types::{Status, StatusMask};

/// Capacity of one incoming wakeup queue
pub(crate) const INCOMING_CAPACITY: usize = 1024;

/// Threads woken onto one CPU from one source
pub(crate) struct WakeupQueue(MpMcQueue<Arc<Thread>, INCOMING_CAPACITY>);

impl WakeupQueue {
    pub(crate) fn new() -> Self {
        Self(MpMcQueue::new())
    }

    pub(crate) fn push(&self, t: Arc<Thread>) -> Result<(), Arc<Thread>> {
        self.0.enqueue(t)
    }

    pub(crate) fn pop(&self) -> Option<Arc<Thread>> {
        self.0.dequeue()
    }
}

/// Claim a thread whose status is in `allowed` and send it to its CPU
pub(crate) fn wake_impl(ds: &DetachedState, allowed: StatusMask) {
    let mut old = Status::Waiting;
    loop {
        match ds.st.compare_exchange(old, Status::Waking) {
            Ok(_) => break,
            Err(actual) if allowed.contains(actual.mask()) => old = actual,
            Err(_) => return,
        }
    }
    let Some(t) = ds.t.upgrade() else {
        return;
    };

    let sched = t.sched().clone();
    let me = Thread::try_current().filter(|me| Arc::ptr_eq(me.sched(), &sched));
    let source = me
        .as_ref()
        .map_or(sched.external_slot(), |me| me.running_on.load(Ordering::Acquire));
    let target_idx = ds.cpu.load(Ordering::Acquire);
    let target = sched.cpu_at(target_idx);
    let local = source == target_idx;

    if let Some(me) = &me {
        me.preempt_disable();
    }
    log::trace!("sched_wake {} on {}", t.id(), target.id());
    target.push_incoming(source, t, local);
    if !target.incoming_mask.test_all_and_set(source) {
        match &me {
            Some(me) if local => me.need_reschedule.store(true, Ordering::Relaxed),
            _ => target.send_wakeup_ipi(sched.machine()),
        }
    }
    if let Some(me) = &me {
        // the reschedule is left to the next interrupt point
        me.preempt_enable_no_resched();
    }
}
