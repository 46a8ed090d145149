/*
 * Scheduler Errors
 *
 * Invariant violations inside the scheduler are fatal and surface as
 * panics. The types here cover the few failures that can happen at the API
 * boundary: bad configuration, bad CPU numbers, starting twice, and an
 * interruptible wait that was interrupted.
 */

use core::fmt;

/// Boundary errors reported by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// A tuning parameter is out of range
    InvalidConfig(&'static str),
    /// The machine has more CPUs than a scheduler can manage
    TooManyCpus { requested: usize, max: usize },
    /// The machine has no CPUs
    NoCpus,
    /// `Scheduler::start` was called twice
    AlreadyStarted,
    /// A CPU number does not name a CPU of this machine
    NoSuchCpu(usize),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::InvalidConfig(what) => {
                write!(f, "Invalid scheduler configuration: {}", what)
            }
            SchedError::TooManyCpus { requested, max } => {
                write!(f, "Too many CPUs: {} requested, at most {} supported", requested, max)
            }
            SchedError::NoCpus => write!(f, "Machine has no CPUs"),
            SchedError::AlreadyStarted => write!(f, "Scheduler already started"),
            SchedError::NoSuchCpu(cpu) => write!(f, "No such CPU: {}", cpu),
        }
    }
}

impl core::error::Error for SchedError {}

/// An interruptible wait was cut short by `Thread::interrupt`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Wait interrupted")
    }
}

impl core::error::Error for Interrupted {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_problem() {
        assert_eq!(
            SchedError::TooManyCpus { requested: 70, max: 63 }.to_string(),
            "Too many CPUs: 70 requested, at most 63 supported"
        );
        assert_eq!(SchedError::NoSuchCpu(4).to_string(), "No such CPU: 4");
        assert_eq!(
            SchedError::InvalidConfig("tau must be positive").to_string(),
            "Invalid scheduler configuration: tau must be positive"
        );
    }
}
