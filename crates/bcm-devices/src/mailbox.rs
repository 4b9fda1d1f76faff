//! Mailbox doorbell channels.
//!
//! Each channel is a single pending latch with an interrupt output. A write to the command
//! register sets the latch; a read of the identity register returns the channel number and
//! acknowledges it, which lets one interrupt handler identify and clear the source in one access.

use std::fmt;

use bcm_io_snapshot::io::state::{
    IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use tracing::trace;

use crate::consts::{
    MBOX_CHAN_COUNT, MBOX_CHAN_FB, MBOX_CHAN_POWER, MBOX_CHAN_PROPERTY, MBOX_CHAN_VCHIQ,
};
use crate::irq::IrqLine;
use crate::mmio::RegisterDevice;

pub const MAILBOX_CHANNEL_WINDOW_SIZE: u64 = 0x10;

/// Read: channel id (acknowledges). Write: command.
pub(crate) const REG_IDENT: u64 = 0x00;
/// Read: pending latch.
pub(crate) const REG_STATUS: u64 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MailboxChannelId(u8);

impl MailboxChannelId {
    pub const POWER: Self = Self(MBOX_CHAN_POWER as u8);
    pub const FRAMEBUFFER: Self = Self(MBOX_CHAN_FB as u8);
    pub const VCHIQ: Self = Self(MBOX_CHAN_VCHIQ as u8);
    pub const PROPERTY: Self = Self(MBOX_CHAN_PROPERTY as u8);

    pub fn new(raw: u32) -> Option<Self> {
        (raw < MBOX_CHAN_COUNT).then_some(Self(raw as u8))
    }

    pub const fn raw(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for MailboxChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mailbox channel {}", self.0)
    }
}

/// Pending/acknowledge latch shared by every mailbox-driven device.
pub struct MailboxChannel<I: IrqLine> {
    id: MailboxChannelId,
    pending: bool,
    irq: I,
}

impl<I: IrqLine> MailboxChannel<I> {
    pub fn new(id: MailboxChannelId, irq: I) -> Self {
        Self {
            id,
            pending: false,
            irq,
        }
    }

    pub fn channel(&self) -> MailboxChannelId {
        self.id
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn irq(&self) -> &I {
        &self.irq
    }

    /// Latch a request and assert the interrupt.
    pub fn push(&mut self) {
        trace!(channel = self.id.raw(), "mailbox push");
        self.pending = true;
        self.irq.raise();
    }

    /// Clear the latch and deassert the interrupt, returning the channel number.
    pub fn acknowledge(&mut self) -> u32 {
        trace!(channel = self.id.raw(), was_pending = self.pending, "mailbox acknowledge");
        self.pending = false;
        self.irq.lower();
        self.id.raw()
    }

    pub fn status(&self) -> u32 {
        u32::from(self.pending)
    }

    /// Drop any outstanding request without reporting it to the guest.
    pub fn reset(&mut self) {
        self.pending = false;
        self.irq.lower();
    }
}

/// Mailbox channel with no side effects beyond the doorbell (power, VCHIQ).
pub struct MailboxDevice<I: IrqLine> {
    channel: MailboxChannel<I>,
}

impl<I: IrqLine> MailboxDevice<I> {
    pub fn new(id: MailboxChannelId, irq: I) -> Self {
        Self {
            channel: MailboxChannel::new(id, irq),
        }
    }

    pub fn power(irq: I) -> Self {
        Self::new(MailboxChannelId::POWER, irq)
    }

    pub fn vchiq(irq: I) -> Self {
        Self::new(MailboxChannelId::VCHIQ, irq)
    }

    pub fn channel(&self) -> &MailboxChannel<I> {
        &self.channel
    }

    pub fn is_pending(&self) -> bool {
        self.channel.is_pending()
    }
}

impl<I: IrqLine> RegisterDevice for MailboxDevice<I> {
    const NAME: &'static str = "mailbox_channel";
    const WINDOW_SIZE: u64 = MAILBOX_CHANNEL_WINDOW_SIZE;

    fn read_reg(&mut self, offset: u64) -> Option<u32> {
        match offset {
            REG_IDENT => Some(self.channel.acknowledge()),
            REG_STATUS => Some(self.channel.status()),
            _ => None,
        }
    }

    fn write_reg(&mut self, offset: u64, _value: u32) -> bool {
        match offset {
            REG_IDENT => {
                self.channel.push();
                true
            }
            _ => false,
        }
    }
}

impl<I: IrqLine> IoSnapshot for MailboxDevice<I> {
    const DEVICE_ID: [u8; 4] = *b"MBOX";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    // The pending latch is not persisted; restoring clears it.
    fn save_state(&self) -> Vec<u8> {
        SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION).finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;
        self.channel.reset();
        Ok(())
    }
}
