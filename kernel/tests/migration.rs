/*
 * Migration Tests
 *
 * Pinning the calling thread and other threads, unpinning, migration locks,
 * timers following a migrated thread, and the load balancer.
 */

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use cluu_sched::scheduler::{CpuId, MigrationGuard, Status, Thread, sleep, wait_until};
use cluu_sched::{Attr, SchedConfig};

use common::{busy_for, machine, machine_with, wait_for_status};

#[test]
fn pinning_the_current_thread_moves_it() {
    let sched = machine(2);
    let (before, after, pinned) = sched.run_main(|| {
        let me = Thread::current();
        let before = me.tcpu().id();
        let target = if before == CpuId(0) { CpuId(1) } else { CpuId(0) };
        Thread::pin_current(target).unwrap();
        // stays there across reschedules
        busy_for(Duration::from_millis(20));
        (before, me.tcpu().id(), me.is_pinned())
    });
    assert_ne!(before, after);
    assert!(pinned);
}

#[test]
fn pinning_to_the_current_cpu_only_pins() {
    let sched = machine(2);
    let (cpu, migrations, locked) = sched.run_main(|| {
        let me = Thread::current();
        let here = me.tcpu().id();
        Thread::pin_current(here).unwrap();
        (me.tcpu().id() == here, me.stat_migrations(), me.migration_locked())
    });
    assert!(cpu);
    assert_eq!(migrations, 0);
    assert!(locked);
}

#[test]
fn pinning_a_waiting_thread_moves_it() {
    let sched = machine(2);
    let ran_on = sched.run_main(|| {
        let go = Arc::new(AtomicBool::new(false));
        let ran_on = Arc::new(AtomicU32::new(u32::MAX));
        let t = {
            let go = go.clone();
            let ran_on = ran_on.clone();
            Thread::make(
                move || {
                    wait_until(|| go.load(Ordering::Acquire));
                    ran_on.store(Thread::current().tcpu().id().0, Ordering::Release);
                },
                Attr::new().pin(CpuId(0)),
            )
        };
        t.start();
        wait_for_status(&t, Status::Waiting);

        t.pin(CpuId(1)).unwrap();
        assert_eq!(t.tcpu().id(), CpuId(1));
        assert!(t.is_pinned());

        t.wake_with(|| go.store(true, Ordering::Release));
        t.join();
        ran_on.load(Ordering::Acquire)
    });
    assert_eq!(ran_on, 1);
}

#[test]
fn pinning_an_unstarted_thread_sets_its_cpu() {
    let sched = machine(2);
    let ran_on = sched.run_main(|| {
        let ran_on = Arc::new(AtomicU32::new(u32::MAX));
        let t = {
            let ran_on = ran_on.clone();
            Thread::make(
                move || ran_on.store(Thread::current().tcpu().id().0, Ordering::Release),
                Attr::new(),
            )
        };
        t.pin(CpuId(1)).unwrap();
        t.start();
        t.join();
        ran_on.load(Ordering::Acquire)
    });
    assert_eq!(ran_on, 1);
}

#[test]
fn pinning_a_finished_thread_is_a_no_op() {
    let sched = machine(2);
    sched.run_main(|| {
        let t = Thread::make(|| {}, Attr::new());
        t.start();
        t.join();
        assert_eq!(t.pin(CpuId(1)), Ok(()));
        assert_eq!(t.status(), Status::Terminated);
    });
}

#[test]
fn pinning_to_a_missing_cpu_fails() {
    let sched = machine(2);
    let result = sched.run_main(|| Thread::pin_current(CpuId(5)));
    assert_eq!(result, Err(cluu_sched::SchedError::NoSuchCpu(5)));
}

#[test]
fn unpin_releases_the_migration_lock() {
    let sched = machine(2);
    sched.run_main(|| {
        let me = Thread::current();
        Thread::pin_current(CpuId(1)).unwrap();
        assert!(me.migration_locked());
        me.unpin();
        assert!(!me.is_pinned());
        assert!(!me.migration_locked());

        let go = Arc::new(AtomicBool::new(false));
        let t = {
            let go = go.clone();
            Thread::make(
                move || wait_until(|| go.load(Ordering::Acquire)),
                Attr::new().pin(CpuId(0)),
            )
        };
        t.start();
        wait_for_status(&t, Status::Waiting);
        t.unpin();
        assert!(!t.is_pinned());
        assert!(!t.migration_locked());
        t.wake_with(|| go.store(true, Ordering::Release));
        t.join();
    });
}

#[test]
fn migration_guard_nests() {
    let sched = machine(1);
    sched.run_main(|| {
        let me = Thread::current();
        {
            let _outer = MigrationGuard::new();
            let _inner = MigrationGuard::new();
            assert!(me.migration_locked());
        }
        assert!(!me.migration_locked());
    });
}

#[test]
fn pin_waits_for_migrate_disable_of_a_pinned_thread() {
    let sched = machine(2);
    let (held_on, ran_on) = sched.run_main(|| {
        let released = Arc::new(AtomicBool::new(false));
        let go = Arc::new(AtomicBool::new(false));
        let ran_on = Arc::new(AtomicU32::new(u32::MAX));
        let t = {
            let released = released.clone();
            let go = go.clone();
            let ran_on = ran_on.clone();
            Thread::make(
                move || {
                    {
                        let _guard = MigrationGuard::new();
                        wait_until(|| released.load(Ordering::Acquire));
                    }
                    wait_until(|| go.load(Ordering::Acquire));
                    ran_on.store(Thread::current().tcpu().id().0, Ordering::Release);
                },
                Attr::new().pin(CpuId(0)),
            )
        };
        t.start();
        wait_for_status(&t, Status::Waiting);

        let pinner = {
            let t = t.clone();
            Thread::make(move || t.pin(CpuId(1)).unwrap(), Attr::new())
        };
        pinner.start();
        sleep(Duration::from_millis(50));
        let held_on = t.tcpu().id();

        t.wake_with(|| released.store(true, Ordering::Release));
        pinner.join();
        assert_eq!(t.tcpu().id(), CpuId(1));
        t.wake_with(|| go.store(true, Ordering::Release));
        t.join();
        (held_on, ran_on.load(Ordering::Acquire))
    });
    assert_eq!(held_on, CpuId(0), "pin moved a thread holding a migration lock");
    assert_eq!(ran_on, 1);
}

#[test]
fn sleeping_thread_wakes_on_its_new_cpu() {
    let sched = machine(2);
    let (elapsed, cpu) = sched.run_main(|| {
        let result = Arc::new(spin::Mutex::new(None));
        let t = {
            let result = result.clone();
            Thread::make(
                move || {
                    let me = Thread::current();
                    let machine = me.sched().machine();
                    let start = machine.now();
                    sleep(Duration::from_millis(100));
                    let elapsed = machine.now().saturating_duration_since(start);
                    *result.lock() = Some((elapsed, me.tcpu().id()));
                },
                Attr::new().pin(CpuId(0)),
            )
        };
        t.start();
        wait_for_status(&t, Status::Waiting);
        t.pin(CpuId(1)).unwrap();
        t.join();
        let outcome = result.lock().take();
        outcome.expect("sleeper never finished")
    });
    assert!(elapsed >= Duration::from_millis(100), "woke after {:?}", elapsed);
    assert_eq!(cpu, CpuId(1));
}

#[test]
fn load_balancer_spreads_busy_threads() {
    let config = SchedConfig::default()
        .with_load_balancer(true)
        .with_load_balance_interval(Duration::from_millis(10));
    let sched = machine_with(2, config);
    let moved = sched.run_main(|| {
        Thread::pin_current(CpuId(0)).unwrap();
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let t = Thread::make(
                    || {
                        busy_for(Duration::from_millis(300));
                    },
                    Attr::new(),
                );
                t.start();
                t
            })
            .collect();
        for t in &threads {
            t.join();
        }
        threads.iter().map(|t| t.stat_migrations()).sum::<u64>()
    });
    assert!(moved > 0);
    assert!(sched.cpus()[0].stat_balanced() > 0);
}

#[test]
fn balancer_leaves_migration_locked_threads_alone() {
    let config = SchedConfig::default()
        .with_load_balancer(true)
        .with_load_balance_interval(Duration::from_millis(10));
    let sched = machine_with(2, config);
    let migrations = sched.run_main(|| {
        let threads: Vec<_> = (0..3)
            .map(|_| {
                let t = Thread::make(
                    || {
                        busy_for(Duration::from_millis(150));
                    },
                    Attr::new().pin(CpuId(0)),
                );
                t.start();
                t
            })
            .collect();
        for t in &threads {
            t.join();
        }
        threads.iter().map(|t| t.stat_migrations()).sum::<u64>()
    });
    assert_eq!(migrations, 0);
}
