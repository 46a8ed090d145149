/*
 * Machine Abstraction Layer
 *
 * This module defines the boundary between the scheduler core and the
 * hardware it runs on. The core needs very little from the machine: a
 * monotonic clock, one one-shot clock event per CPU, a wakeup IPI, a way to
 * halt an idle CPU until something happens, and the set of interrupts that
 * became pending since the CPU last looked.
 *
 * Why this is important:
 * - Keeps every hardware dependency of the scheduler behind one trait
 * - Lets the timer list reprogram a single clock device per CPU
 * - Allows the whole scheduler to run on a development host (see hosted.rs)
 *
 * Context switching is the one primitive that is not expressed through the
 * trait: it is provided by the backend's per-thread `Context` type.
 */

pub mod hosted;

use core::fmt;
use core::ops::Add;
use core::time::Duration;

use bitflags::bitflags;

pub use self::hosted::{Context, HostedMachine};

/// A point on the machine's monotonic uptime clock, in nanoseconds since boot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Instant(u64);

impl Instant {
    pub const BOOT: Instant = Instant(0);

    pub const fn from_nanos(ns: u64) -> Self {
        Instant(ns)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, or zero if the clock went backwards
    pub fn saturating_duration_since(self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        let ns = u64::try_from(rhs.as_nanos()).unwrap_or(u64::MAX);
        Instant(self.0.saturating_add(ns))
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.0 / 1_000_000_000, self.0 % 1_000_000_000)
    }
}

bitflags! {
    /// Interrupts pending on a CPU
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Pending: u8 {
        /// The CPU's one-shot clock event reached its deadline
        const TIMER = 1 << 0;
        /// Another CPU sent a wakeup IPI
        const WAKEUP = 1 << 1;
    }
}

/// Hardware services the scheduler core depends on
pub trait Machine: Send + Sync {
    /// Number of CPUs, fixed for the lifetime of the machine
    fn cpu_count(&self) -> usize;

    /// Current monotonic uptime
    fn now(&self) -> Instant;

    /// Program the one-shot clock event of `cpu`; `None` disarms it.
    ///
    /// Reaching the deadline marks [`Pending::TIMER`] on that CPU.
    fn set_clock_event(&self, cpu: usize, deadline: Option<Instant>);

    /// Interrupt `cpu` so that it notices newly queued wakeups
    fn send_wakeup_ipi(&self, cpu: usize);

    /// Stop `cpu` until an interrupt is pending on it
    fn halt(&self, cpu: usize);

    /// Take (and clear) the interrupts pending on `cpu`
    fn take_pending(&self, cpu: usize) -> Pending;
}
