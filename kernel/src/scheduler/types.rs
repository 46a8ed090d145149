/*
 * Scheduler Type Definitions
 *
 * This module defines the small, Copy-able types shared by every layer of
 * the scheduler: CPU and thread identifiers, the thread lifecycle status,
 * the allowed-state masks used by wakeups, and the CPU bit set used by the
 * incoming-wakeup channel.
 */

use core::fmt;
use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use bitflags::bitflags;

/// Virtual runtime accounting unit
pub type Runtime = f32;

/// Maximum number of CPUs a scheduler instance can manage
///
/// The incoming-wakeup mask is a 64-bit word with one bit per source CPU,
/// and one extra bit is reserved for wakeups issued from outside any CPU
/// (interrupt-less host code, boot code).
pub const MAX_CPUS: usize = 63;

/// CPU identifier
///
/// Represents a logical CPU core, indexing the scheduler's CPU table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(pub u32);

impl CpuId {
    /// Bootstrap processor (CPU 0)
    pub const BSP: CpuId = CpuId(0);

    /// Get the CPU ID as a usize for indexing
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Thread identifier
///
/// Unique among live threads. Assigned sequentially, skipping ids still in
/// use, so the 32-bit counter may wrap around over a long uptime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

/// Thread lifecycle status
///
/// State machine transition matrix:
///
/// ```text
///   Initial       Next          Async?  Event
///
///   Unstarted     Waiting       sync    start()  followed by wake()
///   Unstarted     Prestarted    sync    start()  before the scheduler runs
///   Prestarted    Unstarted     sync    scheduler start, followed by start()
///   Waiting       Waking        async   wake()
///   Waiting       Running       sync    wait cancelled (predicate became true)
///   Waiting       SendingLock   async   wake_lock()
///   SendingLock   Waking        async   lock handed over
///   Running       Waiting       sync    prepare_wait()
///   Running       Queued        sync    context switch
///   Running       Terminating   sync    thread function completion
///   Queued        Running       sync    context switch
///   Waking        Queued        async   incoming wakeup queue drained
///   Waking        Running       sync    thread pulls itself out of the queue
///   Terminating   Terminated    async   post context switch
/// ```
///
/// `wake()` on any state except the allowed ones is discarded.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Invalid = 0,
    Prestarted = 1,
    Unstarted = 2,
    Waiting = 3,
    SendingLock = 4,
    Running = 5,
    Queued = 6,
    Waking = 7,
    Terminating = 8,
    Terminated = 9,
}

impl Status {
    fn from_u8(raw: u8) -> Status {
        match raw {
            1 => Status::Prestarted,
            2 => Status::Unstarted,
            3 => Status::Waiting,
            4 => Status::SendingLock,
            5 => Status::Running,
            6 => Status::Queued,
            7 => Status::Waking,
            8 => Status::Terminating,
            9 => Status::Terminated,
            _ => Status::Invalid,
        }
    }

    /// The single-bit mask for this status
    pub fn mask(self) -> StatusMask {
        StatusMask::from_bits_retain(1 << (self as u8))
    }
}

bitflags! {
    /// Set of statuses a wakeup is allowed to start from
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusMask: u16 {
        const WAITING = 1 << (Status::Waiting as u8);
        const SENDING_LOCK = 1 << (Status::SendingLock as u8);
    }
}

/// Atomically updated thread status
#[derive(Debug)]
pub struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub const fn new(status: Status) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn load(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, status: Status) {
        self.0.store(status as u8, Ordering::Release);
    }

    /// Compare-and-swap; on failure returns the status actually observed
    pub fn compare_exchange(&self, current: Status, new: Status) -> Result<Status, Status> {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(Status::from_u8)
            .map_err(Status::from_u8)
    }
}

/// Lock-free set of CPU indices (one bit each)
///
/// Used as the "which source queues have pending wakeups" mask of every CPU.
#[derive(Debug, Default)]
pub struct CpuSet(AtomicU64);

impl CpuSet {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn set(&self, idx: usize) {
        self.0.fetch_or(1 << idx, Ordering::Release);
    }

    pub fn clear(&self, idx: usize) {
        self.0.fetch_and(!(1 << idx), Ordering::Release);
    }

    /// Set `idx` and report whether *any* bit was set before
    pub fn test_all_and_set(&self, idx: usize) -> bool {
        self.0.fetch_or(1 << idx, Ordering::Release) != 0
    }

    /// Atomically take the whole set, leaving it empty
    pub fn fetch_clear(&self) -> CpuBits {
        if self.0.load(Ordering::Relaxed) == 0 {
            return CpuBits(0);
        }
        CpuBits(self.0.swap(0, Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.0.load(Ordering::Relaxed) == 0
    }
}

/// A snapshot of a [`CpuSet`], iterable in ascending index order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuBits(u64);

impl Iterator for CpuBits {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let idx = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(idx)
    }
}
