/*
 * CLUU Fair-Share Scheduler
 *
 * A per-CPU, preemptive, fair-share thread scheduler together with the
 * machine layer it runs on. The `hosted` machine emulates the CPUs on a
 * development host, so whole multi-CPU systems can be brought up inside a
 * test.
 *
 * Typical use:
 *
 *   let sched = Scheduler::hosted(4, SchedConfig::default())?;
 *   let total = sched.run_main(|| { ... });
 */

extern crate alloc;

pub mod arch;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod utils;

pub use config::SchedConfig;
pub use error::{Interrupted, SchedError};
pub use scheduler::{
    Attr, CpuId, MigrationGuard, Scheduler, Status, Thread, ThreadHandle, ThreadId, Timer,
    TlsTemplate, WaitQueue,
};
