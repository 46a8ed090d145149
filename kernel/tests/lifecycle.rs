/*
 * Thread Lifecycle Tests
 *
 * Join and detach, the thread registry, thread-local storage and
 * statistics. The registry is process wide, so every test in this binary
 * runs serially.
 */

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cluu_sched::scheduler::{
    Status, Thread, ThreadId, find_by_id, numthreads, sleep, wait_until, with_all_threads,
};
use cluu_sched::{Attr, TlsTemplate};
use serial_test::serial;

use common::{busy_for, machine, wait_for_status};

#[test]
#[serial]
fn registry_tracks_live_threads() {
    let sched = machine(1);
    let threads: Vec<_> = (0..3)
        .map(|i| sched.thread(|| {}, Attr::new().name(&format!("reg{}", i))).unwrap())
        .collect();
    assert!(numthreads() >= 3);

    let id = threads[1].id();
    let found = find_by_id(id).expect("registered thread not found");
    assert_eq!(found.name(), "reg1");
    drop(found);

    let mut seen = 0;
    with_all_threads(|t| {
        if threads.iter().any(|mine| mine.id() == t.id()) {
            seen += 1;
        }
    });
    assert_eq!(seen, 3);

    let ids: Vec<_> = threads.iter().map(|t| t.id()).collect();
    drop(threads);
    assert!(ids.iter().all(|&id| find_by_id(id).is_none()));
}

#[test]
#[serial]
fn thread_ids_are_unique() {
    let sched = machine(1);
    let threads: Vec<_> = (0..16).map(|_| sched.thread(|| {}, Attr::new()).unwrap()).collect();
    let mut ids: Vec<_> = threads.iter().map(|t| t.id()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), threads.len());
}

#[test]
#[serial]
fn joining_an_unstarted_thread_returns_at_once() {
    let sched = machine(1);
    sched.run_main(|| {
        let t = Thread::make(|| {}, Attr::new());
        t.join();
        assert_eq!(t.status(), Status::Unstarted);
    });
}

#[test]
#[serial]
fn join_waits_for_a_sleeping_thread() {
    let sched = machine(2);
    let waited = sched.run_main(|| {
        let me = Thread::current();
        let machine = me.sched().machine();
        let start = machine.now();
        let t = Thread::make(|| sleep(Duration::from_millis(40)), Attr::new());
        t.start();
        t.join();
        machine.now().saturating_duration_since(start)
    });
    assert!(waited >= Duration::from_millis(40));
}

#[test]
#[serial]
fn detached_threads_release_themselves() {
    let sched = machine(2);
    let id = sched.run_main(|| {
        let done = Arc::new(AtomicBool::new(false));
        let t = {
            let done = done.clone();
            Thread::make(
                move || {
                    sleep(Duration::from_millis(5));
                    done.store(true, Ordering::Release);
                },
                Attr::new().detached(true),
            )
        };
        assert!(t.is_detached());
        let id = t.id();
        t.start();
        drop(t);
        wait_until_done(&done);
        id
    });
    // destroyed by the next thread that ran on its cpu
    assert_unregistered(id);
}

fn assert_unregistered(id: ThreadId) {
    for _ in 0..200 {
        if find_by_id(id).is_none() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("{} is still registered", id);
}

fn wait_until_done(done: &AtomicBool) {
    while !done.load(Ordering::Acquire) {
        sleep(Duration::from_millis(1));
    }
}

#[test]
#[serial]
fn detaching_a_finished_thread_releases_it() {
    let sched = machine(1);
    let id = sched.run_main(|| {
        let t = Thread::make(|| {}, Attr::new());
        let id = t.id();
        t.start();
        wait_for_status(&t, Status::Terminated);
        t.detach();
        assert!(t.is_detached());
        id
    });
    assert_unregistered(id);
}

#[test]
#[serial]
fn detached_thread_runs_its_cleanup() {
    let sched = machine(2);
    let cleaned = sched.run_main(|| {
        let cleaned = Arc::new(AtomicBool::new(false));
        let t = Thread::make(|| sleep(Duration::from_millis(5)), Attr::new().detached(true));
        {
            let cleaned = cleaned.clone();
            t.set_cleanup(move || cleaned.store(true, Ordering::Release));
        }
        t.start();
        drop(t);
        for _ in 0..2_000 {
            if cleaned.load(Ordering::Acquire) {
                break;
            }
            sleep(Duration::from_millis(1));
        }
        cleaned.load(Ordering::Acquire)
    });
    assert!(cleaned);
}

#[test]
#[serial]
fn detaching_a_finished_thread_runs_its_cleanup() {
    let sched = machine(1);
    sched.run_main(|| {
        let cleaned = Arc::new(AtomicBool::new(false));
        let t = Thread::make(|| {}, Attr::new());
        {
            let cleaned = cleaned.clone();
            t.set_cleanup(move || cleaned.store(true, Ordering::Release));
        }
        t.start();
        wait_for_status(&t, Status::Terminated);
        assert!(!cleaned.load(Ordering::Acquire));
        t.detach();
        assert!(cleaned.load(Ordering::Acquire));
    });
}

#[test]
#[serial]
fn joined_thread_skips_its_cleanup() {
    let sched = machine(1);
    let cleaned = sched.run_main(|| {
        let cleaned = Arc::new(AtomicBool::new(false));
        let t = Thread::make(|| {}, Attr::new());
        {
            let cleaned = cleaned.clone();
            t.set_cleanup(move || cleaned.store(true, Ordering::Release));
        }
        t.start();
        t.join();
        sleep(Duration::from_millis(10));
        cleaned.load(Ordering::Acquire)
    });
    assert!(!cleaned);
}

#[test]
#[serial]
fn thread_runs_on_a_caller_allocated_stack() {
    let sched = machine(1);
    let sum = sched.run_main(|| {
        let stack = vec![0u8; 256 * 1024].into_boxed_slice();
        let sum = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let t = {
            let sum = sum.clone();
            Thread::make(
                move || {
                    let local = [1u64; 1024];
                    sum.store(local.iter().sum(), Ordering::Release);
                },
                Attr::new().stack_buffer(stack),
            )
        };
        t.start();
        t.join();
        sum.load(Ordering::Acquire)
    });
    assert_eq!(sum, 1024);
}

#[test]
#[serial]
#[should_panic(expected = "joined twice")]
fn second_joiner_is_fatal() {
    let sched = machine(2);
    sched.run_main(|| {
        let go = Arc::new(AtomicBool::new(false));
        let target = {
            let go = go.clone();
            Thread::make(move || wait_until(|| go.load(Ordering::Acquire)), Attr::new())
        };
        target.start();
        let first = {
            let target = target.clone();
            Thread::make(move || target.join(), Attr::new())
        };
        first.start();
        wait_for_status(&first, Status::Waiting);
        target.join();
    });
}

#[test]
#[serial]
fn thread_local_blocks_are_per_thread() {
    let sched = machine(2);
    let template = TlsTemplate::new(&[7, 7], 2);
    let blocks = sched.run_main(move || {
        let threads: Vec<_> = (0..2u8)
            .map(|i| {
                let template = template.clone();
                let t = Thread::make(
                    move || {
                        let me = Thread::current();
                        assert!(me.with_tls(0, |_| ()).is_none());
                        me.setup_tls(0, &template);
                        me.with_tls(0, |block| block[2] = i + 1);
                        // setting up again keeps the contents
                        me.setup_tls(0, &template);
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
        threads
            .iter()
            .map(|t| t.with_tls(0, |block| block.to_vec()).unwrap_or_default())
            .collect::<Vec<_>>()
    });
    assert_eq!(blocks, [vec![7, 7, 1, 0], vec![7, 7, 2, 0]]);
}

#[test]
#[serial]
fn statistics_count_cpu_time_and_switches() {
    let sched = machine(1);
    let (cpu_time, clock_grew, switches) = sched.run_main(|| {
        let me = Thread::current();
        let before = me.thread_clock();
        busy_for(Duration::from_millis(20));
        let clock_grew = me.thread_clock() >= before + Duration::from_millis(20);

        let t = Thread::make(
            || {
                busy_for(Duration::from_millis(10));
            },
            Attr::new(),
        );
        t.start();
        t.join();
        (t.total_cpu_time(), clock_grew, t.stat_switches())
    });
    assert!(cpu_time >= Duration::from_millis(10));
    assert!(clock_grew);
    assert!(switches >= 1);
}
