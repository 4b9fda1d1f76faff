use memory::MmioHandler;
use tracing::trace;

/// Catch-all for the parts of the peripheral window with no device model.
///
/// Mapped underneath the real devices so firmware probing unimplemented blocks reads zero
/// instead of open-bus RAM.
#[derive(Debug, Default)]
pub struct UnmappedPeripherals {
    accesses: u64,
}

impl UnmappedPeripherals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of accesses that landed here.
    pub fn accesses(&self) -> u64 {
        self.accesses
    }
}

impl MmioHandler for UnmappedPeripherals {
    fn read(&mut self, offset: u64, size: usize) -> u64 {
        self.accesses += 1;
        trace!(offset, size, "read from unimplemented peripheral");
        0
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) {
        self.accesses += 1;
        trace!(offset, size, value, "write to unimplemented peripheral ignored");
    }
}
