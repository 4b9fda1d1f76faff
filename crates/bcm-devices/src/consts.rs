//! Constants shared between the GPU-side peripherals and the board wiring.

/// Size of the video RAM carved from the top of SDRAM.
pub const VCRAM_SIZE: u64 = 0x0400_0000;

/// Power management mailbox channel.
pub const MBOX_CHAN_POWER: u32 = 0;
/// Framebuffer configuration mailbox channel.
pub const MBOX_CHAN_FB: u32 = 1;
/// VCHIQ mailbox channel.
pub const MBOX_CHAN_VCHIQ: u32 = 3;
/// Property tag mailbox channel.
pub const MBOX_CHAN_PROPERTY: u32 = 8;
pub const MBOX_CHAN_COUNT: u32 = 9;
