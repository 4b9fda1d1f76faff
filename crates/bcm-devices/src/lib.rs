//! BCM2835 peripheral register devices.
//!
//! Every device here exposes a small fixed-size register window through [`mmio::RegisterDevice`]
//! and signals the interrupt controller through an [`irq::IrqLine`] handle owned by the platform.
//! Placement in the physical address space is the platform's concern.
#![forbid(unsafe_code)]

pub mod consts;
pub mod framebuffer;
pub mod irq;
pub mod mailbox;
pub mod mmio;
pub mod system_timer;
pub mod unmapped;
