//! Raspberry Pi (BCM2835) board wiring.
//!
//! Places the peripheral models from `bcm-devices` in the physical address space, mirrors them
//! at their VideoCore bus addresses, aliases SDRAM across the four cache-policy banks and routes
//! interrupt outputs into an [`interrupts::InterruptRouter`].
#![forbid(unsafe_code)]

pub mod config;
pub mod interrupts;
mod machine;
pub mod memory_map;

pub use config::PlatformConfig;
pub use machine::{Bcm2835, PlatformError, PollOutcome, WakeSource};
