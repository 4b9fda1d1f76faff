//! BCM2835 system timer.
//!
//! A free-running 64-bit counter ticking at 1 MHz plus four 32-bit compare channels. A channel
//! matches when the low 32 bits of the counter reach its compare value; the match bit stays
//! latched (and the channel's interrupt asserted) until the guest writes a 1 to it in `CS`.
//!
//! The device keeps exactly one wake-up armed, for the nearest unmatched compare value. Compare
//! values behind the counter are reached after the counter wraps (about 71.6 minutes).

use bcm_io_snapshot::io::state::codec::{Decoder, Encoder};
use bcm_io_snapshot::io::state::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use bcm_time::{Clock, Wakeup};
use tracing::{debug, trace};

use crate::irq::IrqLine;
use crate::mmio::RegisterDevice;

pub const SYSTEM_TIMER_WINDOW_SIZE: u64 = 0x1000;
pub const SYSTEM_TIMER_CHANNELS: usize = 4;

const REG_CS: u64 = 0x00;
const REG_CLO: u64 = 0x04;
const REG_CHI: u64 = 0x08;
const REG_C0: u64 = 0x0c;
const REG_C3: u64 = 0x18;

const MATCH_MASK: u32 = (1 << SYSTEM_TIMER_CHANNELS) - 1;
const NS_PER_US: u64 = 1_000;

pub struct SystemTimer<C: Clock, W: Wakeup, I: IrqLine> {
    clock: C,
    wakeup: W,
    irqs: [I; SYSTEM_TIMER_CHANNELS],
    compare: [u32; SYSTEM_TIMER_CHANNELS],
    match_bits: u32,
    /// Compare value the wake-up is armed for.
    next: Option<u32>,
    armed_deadline_ns: Option<u64>,
}

impl<C: Clock, W: Wakeup, I: IrqLine> SystemTimer<C, W, I> {
    pub fn new(clock: C, wakeup: W, irqs: [I; SYSTEM_TIMER_CHANNELS]) -> Self {
        let mut timer = Self {
            clock,
            wakeup,
            irqs,
            compare: [0; SYSTEM_TIMER_CHANNELS],
            match_bits: 0,
            next: None,
            armed_deadline_ns: None,
        };
        timer.reschedule();
        timer
    }

    /// Counter value in microseconds.
    pub fn counter(&self) -> u64 {
        self.clock.now_ns() / NS_PER_US
    }

    /// # Panics
    ///
    /// Panics if `channel >= SYSTEM_TIMER_CHANNELS`.
    pub fn compare(&self, channel: usize) -> u32 {
        self.compare[channel]
    }

    pub fn match_bits(&self) -> u32 {
        self.match_bits
    }

    pub fn next_compare(&self) -> Option<u32> {
        self.next
    }

    pub fn armed_deadline_ns(&self) -> Option<u64> {
        self.armed_deadline_ns
    }

    /// # Panics
    ///
    /// Panics if `channel >= SYSTEM_TIMER_CHANNELS`.
    pub fn irq(&self, channel: usize) -> &I {
        &self.irqs[channel]
    }

    pub fn wakeup(&self) -> &W {
        &self.wakeup
    }

    /// Guest write to `CS`: every set bit acknowledges the corresponding channel.
    pub fn write_match(&mut self, value: u32) {
        self.catch_up();
        let cleared = self.match_bits & value & MATCH_MASK;
        self.match_bits &= !value & MATCH_MASK;
        for (channel, irq) in self.irqs.iter().enumerate() {
            if cleared & (1 << channel) != 0 {
                irq.lower();
            }
        }
        self.reschedule();
    }

    /// Guest write to `C0`..`C3`.
    ///
    /// # Panics
    ///
    /// Panics if `channel >= SYSTEM_TIMER_CHANNELS`.
    pub fn write_compare(&mut self, channel: usize, value: u32) {
        self.catch_up();
        self.compare[channel] = value;
        self.reschedule();
    }

    /// Arm the wake-up for the nearest unmatched compare value, or cancel it when every channel
    /// is matched.
    pub fn reschedule(&mut self) {
        let now_us = self.counter();
        let clo = now_us as u32;

        let nearest = (0..SYSTEM_TIMER_CHANNELS)
            .filter(|&channel| self.match_bits & (1 << channel) == 0)
            .map(|channel| {
                let compare = self.compare[channel];
                (compare.wrapping_sub(clo), compare)
            })
            .min_by_key(|&(delta, _)| delta);

        match nearest {
            Some((delta, compare)) => {
                let deadline_ns = (now_us + u64::from(delta)).saturating_mul(NS_PER_US);
                trace!(compare, delta, deadline_ns, "system timer armed");
                self.next = Some(compare);
                self.armed_deadline_ns = Some(deadline_ns);
                self.wakeup.arm(deadline_ns);
            }
            None => {
                trace!("system timer idle: all channels matched");
                self.next = None;
                self.armed_deadline_ns = None;
                self.wakeup.cancel();
            }
        }
    }

    /// Wake-up handler.
    ///
    /// Latches every unmatched channel whose compare value equals the armed one. When the
    /// wake-up is delivered late, channels whose compare value the counter passed in the
    /// meantime are latched too.
    pub fn tick(&mut self) {
        self.latch_reached();
        self.reschedule();
    }

    fn latch_reached(&mut self) {
        let Some(next) = self.next.take() else {
            return;
        };
        let now_ns = self.clock.now_ns();
        let late_us = self
            .armed_deadline_ns
            .take()
            .map_or(0, |deadline| now_ns.saturating_sub(deadline) / NS_PER_US);
        let window = u32::try_from(late_us).unwrap_or(u32::MAX);

        for channel in 0..SYSTEM_TIMER_CHANNELS {
            let bit = 1 << channel;
            if self.match_bits & bit == 0 && self.compare[channel].wrapping_sub(next) <= window {
                debug!(channel, compare = self.compare[channel], "system timer match");
                self.match_bits |= bit;
                self.irqs[channel].raise();
            }
        }
    }

    /// Latch what an overdue, not yet delivered wake-up would have, before a register write
    /// moves the schedule away from it.
    fn catch_up(&mut self) {
        let now_ns = self.clock.now_ns();
        if self.armed_deadline_ns.is_some_and(|deadline| deadline < now_ns) {
            trace!(now_ns, "system timer write after an undelivered deadline");
            self.latch_reached();
        }
    }

    /// Run the wake-up handler if the armed deadline has passed.
    ///
    /// For owners that drive the timer by polling instead of through a timer queue.
    pub fn poll(&mut self) -> bool {
        match self.armed_deadline_ns {
            Some(deadline) if deadline <= self.clock.now_ns() => {
                self.tick();
                true
            }
            _ => false,
        }
    }

    /// Drive every interrupt line from the latched match bits.
    pub fn sync_irq_levels(&self) {
        for (channel, irq) in self.irqs.iter().enumerate() {
            irq.set_level(self.match_bits & (1 << channel) != 0);
        }
    }
}

fn compare_channel(offset: u64) -> Option<usize> {
    (REG_C0..=REG_C3)
        .contains(&offset)
        .then(|| ((offset - REG_C0) / 4) as usize)
}

impl<C: Clock, W: Wakeup, I: IrqLine> RegisterDevice for SystemTimer<C, W, I> {
    const NAME: &'static str = "system_timer";
    const WINDOW_SIZE: u64 = SYSTEM_TIMER_WINDOW_SIZE;

    fn read_reg(&mut self, offset: u64) -> Option<u32> {
        match offset {
            REG_CS => Some(self.match_bits),
            REG_CLO => Some(self.counter() as u32),
            REG_CHI => Some((self.counter() >> 32) as u32),
            _ => compare_channel(offset).map(|channel| self.compare[channel]),
        }
    }

    fn write_reg(&mut self, offset: u64, value: u32) -> bool {
        if offset == REG_CS {
            self.write_match(value);
            return true;
        }
        match compare_channel(offset) {
            Some(channel) => {
                self.write_compare(channel, value);
                true
            }
            None => false,
        }
    }
}

impl<C: Clock, W: Wakeup, I: IrqLine> IoSnapshot for SystemTimer<C, W, I> {
    const DEVICE_ID: [u8; 4] = *b"BCST";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        const TAG_MATCH: u16 = 1;
        const TAG_COMPARE: u16 = 2;

        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u32(TAG_MATCH, self.match_bits);

        let mut enc = Encoder::new().u32(self.compare.len() as u32);
        for &compare in &self.compare {
            enc = enc.u32(compare);
        }
        w.field_bytes(TAG_COMPARE, enc.finish());

        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_MATCH: u16 = 1;
        const TAG_COMPARE: u16 = 2;

        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        let mut compare = [0u32; SYSTEM_TIMER_CHANNELS];
        if let Some(buf) = r.bytes(TAG_COMPARE) {
            let mut d = Decoder::new(buf);
            let count = d.u32()? as usize;
            if count > SYSTEM_TIMER_CHANNELS {
                return Err(SnapshotError::InvalidFieldEncoding("system timer compare count"));
            }
            for slot in compare.iter_mut().take(count) {
                *slot = d.u32()?;
            }
            d.finish()?;
        }
        let match_bits = r.u32(TAG_MATCH)?.unwrap_or(0) & MATCH_MASK;

        self.compare = compare;
        self.match_bits = match_bits;
        self.sync_irq_levels();
        self.reschedule();
        Ok(())
    }
}
