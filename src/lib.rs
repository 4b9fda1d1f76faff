//! Raspberry Pi (BCM2835) peripheral models and board wiring, re-exported under one crate.

pub use bcm_devices as devices;
pub use bcm_io_snapshot as io_snapshot;
pub use bcm_platform as platform;
pub use bcm_time as time;
pub use memory;

pub use bcm_platform::{Bcm2835, PlatformConfig, PlatformError, PollOutcome};
