/*
 * Per-CPU Run Queue
 *
 * An ordered set of the runnable threads of one CPU. The key is the
 * thread's local runtime, and equal runtimes are ordered by the entry's
 * address, so no two entries ever compare equal and extraction order is
 * deterministic.
 *
 * A queued thread's runtime must not change while it sits in the queue:
 * the key would go stale. The only exception is a CPU-wide rescale, which
 * rebuilds every key (see `renormalize`).
 */

use alloc::collections::BTreeMap;
use core::cmp::Ordering;

use super::types::Runtime;

/// Anything the run queue can order
pub trait Schedulable {
    /// Current local runtime (the primary sort key)
    fn local_runtime(&self) -> Runtime;
    /// Stable identity, used to break ties
    fn queue_addr(&self) -> usize;
    /// Divide the runtime by `c_max` after the CPU clock was rescaled
    fn renormalize(&self, c_max: Runtime);
}

#[derive(Debug, Clone, Copy)]
struct RunKey {
    rtt: Runtime,
    addr: usize,
}

impl RunKey {
    fn of<T: Schedulable>(t: &T) -> Self {
        Self {
            rtt: t.local_runtime(),
            addr: t.queue_addr(),
        }
    }
}

impl PartialEq for RunKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RunKey {}

impl PartialOrd for RunKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RunKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rtt
            .total_cmp(&other.rtt)
            .then_with(|| self.addr.cmp(&other.addr))
    }
}

/// Runnable threads ordered by (local runtime, address)
#[derive(Debug)]
pub struct RunQueue<T> {
    tree: BTreeMap<RunKey, T>,
}

impl<T> Default for RunQueue<T> {
    fn default() -> Self {
        Self { tree: BTreeMap::new() }
    }
}

impl<T: Schedulable> RunQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn enqueue(&mut self, t: T) {
        let key = RunKey::of(&t);
        let previous = self.tree.insert(key, t);
        assert!(previous.is_none(), "thread queued twice");
    }

    /// The most deserving thread, left in the queue
    pub fn first(&self) -> Option<&T> {
        self.tree.values().next()
    }

    pub fn pop_first(&mut self) -> Option<T> {
        self.tree.pop_first().map(|(_, t)| t)
    }

    /// Remove `t`; returns it if it was queued
    pub fn erase(&mut self, t: &T) -> Option<T> {
        self.tree.remove(&RunKey::of(t))
    }

    /// Remove the least deserving thread matching `pred`
    pub fn take_last_matching(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        let key = self
            .tree
            .iter()
            .rev()
            .find(|(_, t)| pred(t))
            .map(|(key, _)| *key)?;
        self.tree.remove(&key)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.tree.values()
    }

    /// Rescale every queued runtime by `c_max` and rebuild the keys
    pub fn renormalize(&mut self, c_max: Runtime) {
        let entries = core::mem::take(&mut self.tree);
        for (_, t) in entries {
            t.renormalize(c_max);
            self.enqueue(t);
        }
    }
}
