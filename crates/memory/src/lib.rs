//! Guest physical memory for the BCM2835 board model.
//!
//! - [`GuestMemory`] is the fallible, bounds-checked storage contract (RAM/VRAM backing).
//! - [`MemoryBus`] is the infallible view used by devices that touch guest memory as a side
//!   channel (for example the framebuffer descriptor protocol).
//! - [`PhysicalMemoryBus`] routes physical accesses to MMIO windows first and RAM second.

mod bus;
mod mapped;
mod mmio;
mod phys;
mod shared;

pub use bus::MemoryBus;
pub use mapped::{AliasedGuestMemory, AliasedGuestMemoryError, GuestMemoryMapping};
pub use mmio::{MapError, MmioHandler, PhysicalMemoryBus, SharedMmio};
pub use phys::{DenseMemory, GuestMemory, GuestMemoryError, GuestMemoryResult};
pub use shared::SharedGuestMemory;

#[cfg(test)]
mod tests;
