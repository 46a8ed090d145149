/*
 * Shared Test Harness
 *
 * Brings up a hosted machine with the requested number of CPUs. The load
 * balancer is off unless a test asks for it, so thread placement stays
 * predictable.
 */

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cluu_sched::scheduler::{Status, Thread, sleep};
use cluu_sched::{SchedConfig, Scheduler};
use log::LevelFilter;

pub fn init_logging() {
    // several tests in one binary: only the first install succeeds
    let _ = cluu_sched::utils::logger::init(LevelFilter::Warn);
}

pub fn machine(cpus: usize) -> Arc<Scheduler> {
    machine_with(cpus, SchedConfig::default().with_load_balancer(false))
}

pub fn machine_with(cpus: usize, config: SchedConfig) -> Arc<Scheduler> {
    init_logging();
    match Scheduler::hosted(cpus, config) {
        Ok(sched) => sched,
        Err(err) => panic!("cannot bring up a {}-cpu machine: {}", cpus, err),
    }
}

/// Sleep in small steps until `t` reaches `status`
pub fn wait_for_status(t: &Thread, status: Status) {
    for _ in 0..2_000 {
        if t.status() == status {
            return;
        }
        sleep(Duration::from_millis(1));
    }
    panic!("{} never became {:?}, still {:?}", t.id(), status, t.status());
}

/// Spin on interrupt points for `duration` of wall time
pub fn busy_for(duration: Duration) -> u64 {
    let me = Thread::current();
    let machine = me.sched().machine();
    let end = machine.now() + duration;
    let mut rounds = 0;
    while machine.now() < end {
        rounds += 1;
        cluu_sched::scheduler::preempt_point();
    }
    rounds
}
