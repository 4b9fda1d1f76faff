//! Guest virtual time and wake-up scheduling primitives.
//!
//! Guest virtual time (monotonic nanoseconds since reset) is the single source of truth for the
//! timer devices. In production it is derived from a monotonic host clock; unit tests drive it
//! deterministically through [`ManualClock`].
//!
//! Devices never store callbacks. A device that needs to run at a future instant holds a
//! [`Wakeup`] handle and calls [`Wakeup::arm`] / [`Wakeup::cancel`] synchronously from its
//! register handlers. The platform drains due deadlines from a [`TimerQueue`] and dispatches
//! them back to the owning device.
#![forbid(unsafe_code)]

mod clock;
mod timer_queue;
mod wakeup;

pub use clock::{Clock, HostClock, ManualClock};
pub use timer_queue::{TimerError, TimerEvent, TimerId, TimerQueue};
pub use wakeup::{OneShotWakeup, QueuedWakeup, Wakeup};
