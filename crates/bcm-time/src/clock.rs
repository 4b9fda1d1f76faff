use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

/// Monotonic guest virtual time source.
pub trait Clock {
    /// Nanoseconds since the clock's epoch (platform reset).
    fn now_ns(&self) -> u64;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ns(&self) -> u64 {
        (**self).now_ns()
    }
}

/// Deterministic clock advanced explicitly by the caller.
///
/// Clones share the same underlying time, so a test can keep one handle while the devices under
/// test hold others.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_ns: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ns(&self, now_ns: u64) {
        self.now_ns.set(now_ns);
    }

    /// # Panics
    ///
    /// Panics if advancing would overflow `u64` (~584 years).
    pub fn advance_ns(&self, ns: u64) {
        let next = self
            .now_ns
            .get()
            .checked_add(ns)
            .expect("virtual clock overflowed u64::MAX");
        self.now_ns.set(next);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.get()
    }
}

/// Wall-clock backed time, anchored at construction.
#[derive(Debug, Clone)]
pub struct HostClock {
    epoch: Instant,
    offset_ns: u64,
}

impl HostClock {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Resume counting from `offset_ns`, e.g. after restoring a snapshot.
    pub fn starting_at(offset_ns: u64) -> Self {
        Self {
            epoch: Instant::now(),
            offset_ns,
        }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for HostClock {
    fn now_ns(&self) -> u64 {
        let elapsed = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.offset_ns.saturating_add(elapsed)
    }
}
