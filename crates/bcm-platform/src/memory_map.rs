//! Physical memory map.

use bcm_devices::mailbox::MailboxChannelId;

/// ARM-side physical base of the peripheral window.
pub const PERIPHERAL_BASE: u64 = 0x2000_0000;
pub const PERIPHERAL_SIZE: u64 = 0x0100_0000;
/// Where the VideoCore sees the same peripherals.
pub const BUS_PERIPHERAL_BASE: u64 = 0x7e00_0000;

pub const SYSTEM_TIMER_BASE: u64 = PERIPHERAL_BASE + 0x3000;
/// ARM semaphores, doorbells and mailboxes.
pub const ARMCTRL_SBM_BASE: u64 = PERIPHERAL_BASE + 0xb800;
/// Mailbox-addressed peripherals sit in otherwise unused space past the SBM block.
const MBOX_DEVICE_BASE: u64 = ARMCTRL_SBM_BASE + 0x400;

/// SDRAM is visible in four 1 GiB banks that differ only in cache policy.
pub const RAM_BANK_SIZE: u64 = 1 << 30;
pub const RAM_BANKS: u32 = 4;

pub const fn mailbox_device_base(channel: MailboxChannelId) -> u64 {
    MBOX_DEVICE_BASE + ((channel.raw() as u64) << 4)
}

/// VideoCore bus address of an ARM-side peripheral address.
pub const fn bus_alias(paddr: u64) -> u64 {
    paddr - PERIPHERAL_BASE + BUS_PERIPHERAL_BASE
}
