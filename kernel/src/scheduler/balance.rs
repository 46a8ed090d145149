/*
 * Load Balancing
 *
 * Every CPU runs a balancer thread that periodically looks for the least
 * loaded CPU and, when the imbalance is worth it, pushes away the queued
 * thread that deserves the CPU least. The thread travels like any other
 * wakeup, through the target's incoming queue.
 */

use alloc::sync::Arc;

use super::Scheduler;
use super::cpu::Cpu;
use super::thread::Thread;
use super::timer::Timer;
use super::types::{Status, ThreadId};
use super::wait::wait_until;

impl Cpu {
    /// Body of the balancer thread of this CPU
    pub(crate) fn load_balance(&self) {
        let me = Thread::current();
        let sched = me.sched().clone();
        let interval = sched.config().load_balance_interval;
        let timer = Timer::new(&me);
        log::info!("{}: load balancer running every {:?}", self.id(), interval);
        loop {
            timer.set_after(interval);
            wait_until(|| timer.expired());
            if let Some(moved) = self.balance_once(&sched) {
                log::trace!("{}: balanced {} away", self.id(), moved);
            }
        }
    }

    /// Push one thread to the least loaded CPU if that evens things out
    ///
    /// Runs on this CPU. Returns the thread that was moved.
    pub(crate) fn balance_once(&self, sched: &Arc<Scheduler>) -> Option<ThreadId> {
        if self.load() == 0 {
            return None;
        }
        let min = sched.cpus().iter().min_by_key(|cpu| cpu.load())?;
        if min.id() == self.id() {
            return None;
        }
        // a difference of one would just move the imbalance around
        if min.load() + 1 >= self.load() {
            return None;
        }

        let mut st = self.state.lock();
        let t = self.take_migratable(&mut st)?;
        assert_eq!(t.status(), Status::Queued, "{} taken off the queue while not queued", t.id());
        let id = t.id();
        self.migrate_out(&mut st, t, min, sched);
        self.note_balanced();
        Some(id)
    }
}
