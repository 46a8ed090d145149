/*
 * Scheduler Configuration
 *
 * All tuning constants of the fair-share algorithm, the load balancer and
 * the idle loop live here instead of being hard-coded, so a machine can be
 * tuned without touching the scheduler core.
 *
 * Why this is important:
 * - tau sets the length of the scheduling history: after a long-sleeping
 *   thread wakes next to a CPU hog it gets to run for about ln2 * tau
 * - thyst sets the hysteresis: two CPU-bound threads of equal priority
 *   alternate in slices of about 2 * thyst
 * - c_max bounds the per-CPU normalization constant before it is rescaled
 */

use core::time::Duration;

use crate::error::SchedError;
use crate::scheduler::runtime::{PRIORITY_DEFAULT, Tuning};
use crate::scheduler::types::Runtime;

#[derive(Debug, Clone, PartialEq)]
pub struct SchedConfig {
    /// Time constant of the exponential runtime decay
    pub tau: Duration,
    /// Runtime lent to a thread while it runs
    pub thyst: Duration,
    /// Runtime charged to a thread for being switched in
    pub context_switch_penalty: Duration,
    /// Initial value of every CPU's normalization constant
    pub c_initial: Runtime,
    /// Normalization constant ceiling; crossing it rescales by `c_max`
    pub c_max: Runtime,
    /// Start one load balancer thread per CPU
    pub load_balancer: bool,
    pub load_balance_interval: Duration,
    pub balancer_priority: Runtime,
    /// Spins of the idle loop before it halts the CPU
    pub idle_poll_spins: u32,
    /// Sleep between attempts to pin a migration-locked thread
    pub pin_retry_sleep: Duration,
    pub pin_retry_limit: u32,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            tau: Duration::from_millis(200),
            thyst: Duration::from_millis(5),
            context_switch_penalty: Duration::from_micros(10),
            c_initial: 1.0,
            c_max: 9_223_372_036_854_775_808.0, // 2^63
            load_balancer: true,
            load_balance_interval: Duration::from_millis(100),
            balancer_priority: PRIORITY_DEFAULT * 2.0,
            idle_poll_spins: 10_000,
            pin_retry_sleep: Duration::from_millis(1),
            pin_retry_limit: 10_000,
        }
    }
}

impl SchedConfig {
    pub fn with_tau(mut self, tau: Duration) -> Self {
        self.tau = tau;
        self
    }

    pub fn with_thyst(mut self, thyst: Duration) -> Self {
        self.thyst = thyst;
        self
    }

    pub fn with_load_balancer(mut self, enabled: bool) -> Self {
        self.load_balancer = enabled;
        self
    }

    pub fn with_load_balance_interval(mut self, interval: Duration) -> Self {
        self.load_balance_interval = interval;
        self
    }

    pub fn with_idle_poll_spins(mut self, spins: u32) -> Self {
        self.idle_poll_spins = spins;
        self
    }

    pub fn with_c_max(mut self, c_max: Runtime) -> Self {
        self.c_max = c_max;
        self
    }

    /// Check that every parameter is in range
    pub fn validate(&self) -> Result<(), SchedError> {
        if self.tau.is_zero() {
            return Err(SchedError::InvalidConfig("tau must be positive"));
        }
        if self.thyst >= self.tau {
            return Err(SchedError::InvalidConfig("thyst must be shorter than tau"));
        }
        if self.context_switch_penalty.is_zero() {
            return Err(SchedError::InvalidConfig("context switch penalty must be positive"));
        }
        if !(self.c_initial.is_finite() && self.c_initial > 0.0) {
            return Err(SchedError::InvalidConfig("c_initial must be positive and finite"));
        }
        if !self.c_max.is_finite() || self.c_max <= self.c_initial {
            return Err(SchedError::InvalidConfig("c_max must be finite and above c_initial"));
        }
        if self.load_balancer && self.load_balance_interval.is_zero() {
            return Err(SchedError::InvalidConfig("load balance interval must be positive"));
        }
        if !(self.balancer_priority > 0.0) {
            return Err(SchedError::InvalidConfig("balancer priority must be positive"));
        }
        Ok(())
    }

    /// The constants used by the runtime accounting, in runtime units
    pub(crate) fn tuning(&self) -> Tuning {
        Tuning {
            tau: self.tau.as_nanos() as Runtime,
            thyst: self.thyst.as_nanos() as Runtime,
            context_switch_penalty: self.context_switch_penalty.as_nanos() as Runtime,
            c_max: self.c_max,
        }
    }
}
