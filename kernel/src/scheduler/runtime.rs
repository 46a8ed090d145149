/*
 * Thread Runtime Accounting
 *
 * Every thread carries a "local runtime" (Rtt), a priority-weighted measure
 * of the CPU time it consumed recently. The run queue is sorted by it, and
 * the thread with the lowest value runs next.
 *
 * Why this is important:
 * - Sharing is continuous, not quantum based: running for t moves the CPU's
 *   normalization constant c to c * exp(t / tau), and the running thread's
 *   runtime grows by priority * (c_new - c_old)
 * - Old history decays exponentially without ever touching sleeping threads,
 *   because only c grows
 * - The inverse relation (a logarithm) tells exactly when the running thread
 *   will stop being the most deserving one, which is when the preemption
 *   timer is programmed to fire
 *
 * c grows without bound, so when it crosses c_max the CPU divides c and the
 * runtime of every runnable thread by c_max and bumps its renormalization
 * count. Sleeping threads catch up lazily in `update_after_sleep`.
 */

use core::time::Duration;

use super::types::Runtime;

/// Priority of ordinary threads
pub const PRIORITY_DEFAULT: Runtime = 1.0;
/// Priority of idle threads: their runtime is always infinite
pub const PRIORITY_IDLE: Runtime = Runtime::INFINITY;
/// The most favoured priority a thread can get
pub const PRIORITY_INFINITY: Runtime = 0.00001;

/// Runtime constants, converted to runtime units (nanoseconds)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tuning {
    pub tau: Runtime,
    pub thyst: Runtime,
    pub context_switch_penalty: Runtime,
    pub c_max: Runtime,
}

/// Per-CPU normalization constant and its epoch counter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VirtualClock {
    c: Runtime,
    renormalize_count: i32,
}

impl VirtualClock {
    pub fn new(c_initial: Runtime) -> Self {
        Self {
            c: c_initial,
            renormalize_count: 0,
        }
    }

    pub fn c(&self) -> Runtime {
        self.c
    }

    pub fn renormalize_count(&self) -> i32 {
        self.renormalize_count
    }
}

/// Signals that the CPU's clock was rescaled and the run queue must follow
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renormalized {
    No,
    Yes,
}

/// A thread's view of its own runtime
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThreadRuntime {
    priority: Runtime,
    rtt: Runtime,
    // -1: the runtime is global (new thread, or exported for migration)
    renormalize_count: i32,
}

impl ThreadRuntime {
    pub fn new(priority: Runtime) -> Self {
        assert!(priority > 0.0, "thread priority must be positive, got {}", priority);
        Self {
            priority,
            rtt: if priority.is_infinite() { Runtime::INFINITY } else { 0.0 },
            renormalize_count: -1,
        }
    }

    /// Runtime in the local scale of the CPU the thread is queued on
    pub fn local(&self) -> Runtime {
        self.rtt
    }

    pub fn priority(&self) -> Runtime {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Runtime) {
        assert!(priority > 0.0, "thread priority must be positive, got {}", priority);
        self.priority = priority;
        if priority.is_infinite() {
            self.rtt = Runtime::INFINITY;
        }
    }

    pub fn is_global(&self) -> bool {
        self.renormalize_count == -1
    }

    /// Account `time` of execution to the running thread
    pub fn ran_for(
        &mut self,
        clock: &mut VirtualClock,
        time: Duration,
        tuning: &Tuning,
    ) -> Renormalized {
        self.advance(clock, time.as_nanos() as Runtime, tuning)
    }

    /// Borrow `thyst` of runtime when switched in
    pub fn hysteresis_run_start(
        &mut self,
        clock: &mut VirtualClock,
        tuning: &Tuning,
    ) -> Renormalized {
        self.advance(clock, -tuning.thyst, tuning)
    }

    /// Return the runtime borrowed by `hysteresis_run_start`
    pub fn hysteresis_run_stop(
        &mut self,
        clock: &mut VirtualClock,
        tuning: &Tuning,
    ) -> Renormalized {
        self.advance(clock, tuning.thyst, tuning)
    }

    /// Charge the cost of a cold start on the CPU
    pub fn add_context_switch_penalty(
        &mut self,
        clock: &mut VirtualClock,
        tuning: &Tuning,
    ) -> Renormalized {
        self.advance(clock, tuning.context_switch_penalty, tuning)
    }

    fn advance(&mut self, clock: &mut VirtualClock, ns: Runtime, tuning: &Tuning) -> Renormalized {
        assert!(self.priority > 0.0);

        // A new thread has no history yet, so any epoch is its own.
        if self.rtt == 0.0 {
            self.renormalize_count = clock.renormalize_count;
        }

        let c = clock.c;
        let c_new = c * libm::expf(ns / tuning.tau);
        if !c_new.is_finite() {
            log::warn!(
                "runtime interval of {}ns overflows the normalization constant, ignored",
                ns
            );
            return Renormalized::No;
        }

        // inf * 0 is NaN, so idle threads are handled apart
        if self.priority.is_infinite() {
            self.rtt = Runtime::INFINITY;
        } else {
            self.rtt += self.priority * (c_new - c);
        }
        clock.c = c_new;

        if c_new < tuning.c_max {
            return Renormalized::No;
        }
        clock.c /= tuning.c_max;
        clock.renormalize_count += 1;
        self.renormalize(tuning.c_max);
        Renormalized::Yes
    }

    /// Follow a rescale of the CPU clock; global runtimes are left alone
    pub fn renormalize(&mut self, c_max: Runtime) {
        if self.renormalize_count >= 0 {
            self.rtt /= c_max;
            self.renormalize_count += 1;
        }
    }

    /// Convert to the CPU-independent scale before leaving a CPU
    pub fn export_runtime(&mut self, clock: &VirtualClock) {
        self.rtt /= clock.c;
        self.renormalize_count = -1;
    }

    /// Bring the runtime into the scale of `clock` after a sleep or migration
    pub fn update_after_sleep(&mut self, clock: &VirtualClock, tuning: &Tuning) {
        let count = clock.renormalize_count;
        if self.renormalize_count == count {
            return;
        }
        if self.renormalize_count == -1 {
            self.rtt *= clock.c;
        } else if self.renormalize_count + 1 == count {
            self.rtt /= tuning.c_max;
        } else if self.rtt.is_finite() {
            // Two or more rescales missed: negligible at the current scale.
            self.rtt = 0.0;
        }
        self.renormalize_count = count;
    }

    /// Wall-clock time until this thread's runtime reaches `target`.
    ///
    /// Returns `None` when that never happens: idle priority or an infinite
    /// target.
    pub fn time_until(
        &self,
        target: Runtime,
        clock: &VirtualClock,
        tuning: &Tuning,
    ) -> Option<Duration> {
        if self.priority.is_infinite() || target.is_infinite() {
            return None;
        }
        if target <= self.rtt {
            return Some(Duration::ZERO);
        }
        let ns = tuning.tau * libm::logf((target - self.rtt) / self.priority / clock.c + 1.0);
        if !ns.is_finite() || ns >= u64::MAX as Runtime {
            return None;
        }
        Some(Duration::from_nanos(ns.max(0.0) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> Tuning {
        Tuning {
            tau: 200_000_000.0,
            thyst: 5_000_000.0,
            context_switch_penalty: 10_000.0,
            c_max: 9_223_372_036_854_775_808.0,
        }
    }

    fn approx(a: Runtime, b: Runtime) -> bool {
        (a - b).abs() <= 1e-4 * a.abs().max(b.abs()).max(1.0)
    }

    #[test]
    fn runtime_never_decreases_while_running() {
        let tuning = tuning();
        let mut clock = VirtualClock::new(1.0);
        let mut rt = ThreadRuntime::new(PRIORITY_DEFAULT);
        let mut last = rt.local();
        for ms in [0u64, 1, 3, 10, 50, 7, 120, 2] {
            let _ = rt.ran_for(&mut clock, Duration::from_millis(ms), &tuning);
            assert!(rt.local() >= last, "{} < {}", rt.local(), last);
            if ms > 0 {
                assert!(rt.local() > last);
            }
            last = rt.local();
        }
    }

    #[test]
    fn higher_priority_value_accumulates_faster() {
        let tuning = tuning();
        let mut clock_a = VirtualClock::new(1.0);
        let mut clock_b = VirtualClock::new(1.0);
        let mut fast = ThreadRuntime::new(PRIORITY_DEFAULT);
        let mut slow = ThreadRuntime::new(4.0);
        let _ = fast.ran_for(&mut clock_a, Duration::from_millis(20), &tuning);
        let _ = slow.ran_for(&mut clock_b, Duration::from_millis(20), &tuning);
        assert!(approx(slow.local(), 4.0 * fast.local()));
    }

    #[test]
    fn migration_rescales_to_destination_clock() {
        let tuning = tuning();
        let source = VirtualClock { c: 2.0, renormalize_count: 0 };
        let destination = VirtualClock { c: 3.0, renormalize_count: 0 };
        let mut rt = ThreadRuntime { priority: 1.0, rtt: 10.0, renormalize_count: 0 };

        rt.export_runtime(&source);
        assert!(rt.is_global());
        rt.update_after_sleep(&destination, &tuning);
        assert!(approx(rt.local(), 10.0 * (3.0 / 2.0)));
        assert_eq!(rt.renormalize_count, 0);
    }

    #[test]
    fn export_then_update_restores_local_runtime() {
        let tuning = tuning();
        let mut clock = VirtualClock::new(1.0);
        let mut rt = ThreadRuntime::new(PRIORITY_DEFAULT);
        let _ = rt.ran_for(&mut clock, Duration::from_millis(37), &tuning);
        let before = rt.local();
        rt.export_runtime(&clock);
        rt.update_after_sleep(&clock, &tuning);
        assert!(approx(rt.local(), before));
    }

    #[test]
    fn sleepers_catch_up_with_missed_rescales() {
        let tuning = tuning();
        let clock = VirtualClock { c: 1.5, renormalize_count: 3 };

        let mut same = ThreadRuntime { priority: 1.0, rtt: 8.0, renormalize_count: 3 };
        same.update_after_sleep(&clock, &tuning);
        assert_eq!(same.local(), 8.0);

        let mut one_behind = ThreadRuntime {
            priority: 1.0,
            rtt: 8.0 * tuning.c_max,
            renormalize_count: 2,
        };
        one_behind.update_after_sleep(&clock, &tuning);
        assert!(approx(one_behind.local(), 8.0));
        assert_eq!(one_behind.renormalize_count, 3);

        let mut far_behind = ThreadRuntime { priority: 1.0, rtt: 8.0, renormalize_count: 0 };
        far_behind.update_after_sleep(&clock, &tuning);
        assert_eq!(far_behind.local(), 0.0);

        let mut idle = ThreadRuntime::new(PRIORITY_IDLE);
        idle.renormalize_count = 0;
        idle.update_after_sleep(&clock, &tuning);
        assert!(idle.local().is_infinite());
    }

    #[test]
    fn crossing_c_max_rescales_clock_and_thread() {
        let tuning = tuning();
        let mut clock = VirtualClock { c: 0.99 * tuning.c_max, renormalize_count: 0 };
        let mut rt = ThreadRuntime::new(PRIORITY_DEFAULT);
        // exp(t / tau) == 1.05
        let t = Duration::from_nanos((tuning.tau * libm::logf(1.05)) as u64);

        assert_eq!(rt.ran_for(&mut clock, t, &tuning), Renormalized::Yes);
        assert_eq!(clock.renormalize_count(), 1);
        assert!(approx(clock.c(), 0.99 * 1.05));
        assert_eq!(rt.renormalize_count, 1);
        assert!(approx(rt.local(), 0.99 * 0.05));
    }

    #[test]
    fn overflowing_interval_is_ignored() {
        let tuning = tuning();
        let mut clock = VirtualClock::new(1.0);
        let mut rt = ThreadRuntime::new(PRIORITY_DEFAULT);
        let _ = rt.ran_for(&mut clock, Duration::from_millis(5), &tuning);
        let (before, c_before) = (rt.local(), clock.c());

        assert_eq!(rt.ran_for(&mut clock, Duration::from_secs(3600), &tuning), Renormalized::No);
        assert_eq!(rt.local(), before);
        assert_eq!(clock.c(), c_before);
    }

    #[test]
    fn idle_runtime_stays_infinite() {
        let tuning = tuning();
        let mut clock = VirtualClock::new(1.0);
        let mut idle = ThreadRuntime::new(PRIORITY_IDLE);
        let _ = idle.ran_for(&mut clock, Duration::from_millis(3), &tuning);
        assert!(idle.local().is_infinite());
        assert!(!idle.local().is_nan());
        assert!(clock.c() > 1.0);
    }

    #[test]
    fn time_until_inverts_ran_for() {
        let tuning = tuning();
        let mut clock = VirtualClock::new(1.0);
        let mut rt = ThreadRuntime::new(PRIORITY_DEFAULT);

        let delta = rt.time_until(0.5, &clock, &tuning).unwrap();
        let expected = tuning.tau * libm::logf(1.5);
        assert!(approx(delta.as_nanos() as Runtime, expected));

        let _ = rt.ran_for(&mut clock, delta, &tuning);
        assert!(approx(rt.local(), 0.5));
    }

    #[test]
    fn time_until_sentinels() {
        let tuning = tuning();
        let clock = VirtualClock::new(1.0);
        let rt = ThreadRuntime { priority: 1.0, rtt: 2.0, renormalize_count: 0 };
        assert_eq!(rt.time_until(Runtime::INFINITY, &clock, &tuning), None);
        assert_eq!(rt.time_until(1.0, &clock, &tuning), Some(Duration::ZERO));
        assert_eq!(ThreadRuntime::new(PRIORITY_IDLE).time_until(5.0, &clock, &tuning), None);
    }

    #[test]
    fn hysteresis_start_and_stop_cancel_out() {
        let tuning = tuning();
        let mut clock = VirtualClock::new(1.0);
        let mut rt = ThreadRuntime::new(PRIORITY_DEFAULT);
        let _ = rt.ran_for(&mut clock, Duration::from_millis(50), &tuning);
        let (before, c_before) = (rt.local(), clock.c());

        let _ = rt.hysteresis_run_start(&mut clock, &tuning);
        assert!(rt.local() < before);
        let _ = rt.hysteresis_run_stop(&mut clock, &tuning);
        assert!(approx(rt.local(), before));
        assert!(approx(clock.c(), c_before));

        let _ = rt.add_context_switch_penalty(&mut clock, &tuning);
        assert!(rt.local() > before);
    }
}
