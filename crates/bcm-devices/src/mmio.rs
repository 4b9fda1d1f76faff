//! Register window decoding shared by all BCM2835 peripherals.

use memory::MmioHandler;
use thiserror::Error;
use tracing::warn;

/// Width of every peripheral register.
pub const REGISTER_SIZE: usize = 4;

/// A peripheral exposing 32-bit registers in a fixed-size window.
pub trait RegisterDevice {
    const NAME: &'static str;
    const WINDOW_SIZE: u64;

    /// Returns `None` for an offset with no register behind it.
    fn read_reg(&mut self, offset: u64) -> Option<u32>;

    /// Returns `false` for an offset with no writable register behind it.
    fn write_reg(&mut self, offset: u64, value: u32) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("offset 0x{offset:x} outside 0x{window:x}-byte register window")]
    OutOfRange { offset: u64, window: u64 },
    #[error("offset 0x{offset:x} is not register aligned")]
    Misaligned { offset: u64 },
    #[error("{size}-byte access to a 32-bit register window")]
    UnsupportedSize { size: usize },
}

/// Validate an access against a register window and return the register offset.
pub fn decode_access(offset: u64, size: usize, window: u64) -> Result<u64, AccessError> {
    if size != REGISTER_SIZE {
        return Err(AccessError::UnsupportedSize { size });
    }
    let in_range = offset
        .checked_add(REGISTER_SIZE as u64)
        .is_some_and(|end| end <= window);
    if !in_range {
        return Err(AccessError::OutOfRange { offset, window });
    }
    if offset % REGISTER_SIZE as u64 != 0 {
        return Err(AccessError::Misaligned { offset });
    }
    Ok(offset)
}

/// Adapts a [`RegisterDevice`] to the physical memory bus.
///
/// Bad accesses are reported on the `guest_error` target and otherwise ignored: reads return 0
/// and writes are dropped.
pub struct RegisterMmio<D> {
    dev: D,
}

impl<D: RegisterDevice> RegisterMmio<D> {
    pub fn new(dev: D) -> Self {
        Self { dev }
    }

    pub fn device(&self) -> &D {
        &self.dev
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.dev
    }
}

impl<D: RegisterDevice> MmioHandler for RegisterMmio<D> {
    fn read(&mut self, offset: u64, size: usize) -> u64 {
        let reg = match decode_access(offset, size, D::WINDOW_SIZE) {
            Ok(reg) => reg,
            Err(err) => {
                warn!(target: "guest_error", device = D::NAME, %err, "bad register read");
                return 0;
            }
        };
        match self.dev.read_reg(reg) {
            Some(value) => u64::from(value),
            None => {
                warn!(target: "guest_error", device = D::NAME, offset = reg, "read of undefined register");
                0
            }
        }
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) {
        let reg = match decode_access(offset, size, D::WINDOW_SIZE) {
            Ok(reg) => reg,
            Err(err) => {
                warn!(target: "guest_error", device = D::NAME, %err, value, "bad register write");
                return;
            }
        };
        if !self.dev.write_reg(reg, value as u32) {
            warn!(target: "guest_error", device = D::NAME, offset = reg, value, "write to undefined register");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Scratch {
        regs: [u32; 2],
    }

    impl RegisterDevice for Scratch {
        const NAME: &'static str = "scratch";
        const WINDOW_SIZE: u64 = 0x10;

        fn read_reg(&mut self, offset: u64) -> Option<u32> {
            self.regs.get(offset as usize / 4).copied()
        }

        fn write_reg(&mut self, offset: u64, value: u32) -> bool {
            match self.regs.get_mut(offset as usize / 4) {
                Some(reg) => {
                    *reg = value;
                    true
                }
                None => false,
            }
        }
    }

    #[test]
    fn decode_rejects_bad_accesses() {
        assert_eq!(decode_access(0x4, 4, 0x10), Ok(0x4));
        assert_eq!(decode_access(0xc, 4, 0x10), Ok(0xc));
        assert_eq!(
            decode_access(0x10, 4, 0x10),
            Err(AccessError::OutOfRange {
                offset: 0x10,
                window: 0x10
            })
        );
        assert_eq!(
            decode_access(u64::MAX - 1, 4, 0x10),
            Err(AccessError::OutOfRange {
                offset: u64::MAX - 1,
                window: 0x10
            })
        );
        assert_eq!(
            decode_access(0x2, 4, 0x10),
            Err(AccessError::Misaligned { offset: 0x2 })
        );
        assert_eq!(
            decode_access(0x0, 2, 0x10),
            Err(AccessError::UnsupportedSize { size: 2 })
        );
    }

    #[test]
    fn undefined_registers_read_zero_and_ignore_writes() {
        let mut mmio = RegisterMmio::new(Scratch::default());

        mmio.write(0x4, 4, 0xdead_beef);
        assert_eq!(mmio.read(0x4, 4), 0xdead_beef);

        mmio.write(0x8, 4, 0x1234);
        assert_eq!(mmio.read(0x8, 4), 0);
        mmio.write(0x40, 4, 0x1234);
        assert_eq!(mmio.read(0x40, 4), 0);
        mmio.write(0x0, 1, 0xff);
        assert_eq!(mmio.device().regs, [0, 0xdead_beef]);
    }
}
