use std::cell::{Ref, RefCell};
use std::rc::Rc;

use bcm_devices::framebuffer::{
    DisplaySurface, FramebufferConfig, FramebufferController, FramebufferError,
};
use bcm_devices::mailbox::{MailboxChannelId, MailboxDevice, MAILBOX_CHANNEL_WINDOW_SIZE};
use bcm_devices::mmio::RegisterMmio;
use bcm_devices::system_timer::{SystemTimer, SYSTEM_TIMER_WINDOW_SIZE};
use bcm_devices::unmapped::UnmappedPeripherals;
use bcm_io_snapshot::io::state::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use bcm_time::{Clock, HostClock, QueuedWakeup, TimerQueue};
use memory::{
    AliasedGuestMemory, AliasedGuestMemoryError, DenseMemory, GuestMemoryError, MapError,
    MemoryBus, MmioHandler, PhysicalMemoryBus, SharedGuestMemory, SharedMmio,
};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::PlatformConfig;
use crate::interrupts::{InterruptRouter, IrqEvent, IrqSource, RouterIrq};
use crate::memory_map::{
    bus_alias, mailbox_device_base, BUS_PERIPHERAL_BASE, PERIPHERAL_BASE, PERIPHERAL_SIZE,
    RAM_BANKS, RAM_BANK_SIZE, SYSTEM_TIMER_BASE,
};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("invalid platform config: {0}")]
    InvalidConfig(String),
    #[error("failed to parse platform config: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("failed to allocate guest RAM: {0}")]
    GuestMemory(#[from] GuestMemoryError),
    #[error("failed to alias guest RAM: {0}")]
    RamAliasing(#[from] AliasedGuestMemoryError),
    #[error("failed to map peripheral: {0}")]
    Map(#[from] MapError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("machine halted: {0}")]
    Halted(#[from] FramebufferError),
}

/// Owner of a timer-queue deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeSource {
    SystemTimer,
    Vblank,
}

/// What a call to [`Bcm2835::poll`] dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub timer_ticks: usize,
    /// A display refresh is due.
    pub vblank: bool,
}

type TimerDevice<C> = SystemTimer<C, QueuedWakeup<WakeSource>, RouterIrq>;
type MailboxMmio = SharedMmio<RegisterMmio<MailboxDevice<RouterIrq>>>;
type FramebufferMmio = SharedMmio<RegisterMmio<FramebufferController<SharedGuestMemory, RouterIrq>>>;

/// The BCM2835 peripheral set wired to guest RAM.
pub struct Bcm2835<C: Clock = HostClock> {
    config: PlatformConfig,
    clock: C,
    bus: PhysicalMemoryBus,
    interrupts: Rc<RefCell<InterruptRouter>>,
    timers: Rc<RefCell<TimerQueue<WakeSource>>>,
    system_timer: SharedMmio<RegisterMmio<TimerDevice<C>>>,
    power: MailboxMmio,
    vchiq: MailboxMmio,
    framebuffer: FramebufferMmio,
    halted: Option<FramebufferError>,
}

impl Bcm2835<HostClock> {
    pub fn new(config: PlatformConfig) -> Result<Self, PlatformError> {
        Self::with_clock(config, HostClock::new())
    }
}

impl<C: Clock + Clone + 'static> Bcm2835<C> {
    pub fn with_clock(config: PlatformConfig, clock: C) -> Result<Self, PlatformError> {
        config.validate()?;

        let dense = DenseMemory::new(config.ram_size_bytes)?;
        let banks = AliasedGuestMemory::mirrored(Box::new(dense), RAM_BANK_SIZE, RAM_BANKS)?;
        let ram = SharedGuestMemory::new(Box::new(banks));
        let mut bus = PhysicalMemoryBus::new(ram.clone());

        let interrupts = Rc::new(RefCell::new(InterruptRouter::new()));
        let timers = Rc::new(RefCell::new(TimerQueue::new()));
        let irq = |source| RouterIrq::new(interrupts.clone(), source);

        let system_timer = SharedMmio::new(RegisterMmio::new(SystemTimer::new(
            clock.clone(),
            QueuedWakeup::new(timers.clone(), WakeSource::SystemTimer),
            [0, 1, 2, 3].map(|channel| irq(IrqSource::SystemTimer(channel))),
        )));
        let mailbox = |id| {
            SharedMmio::new(RegisterMmio::new(MailboxDevice::new(
                id,
                irq(IrqSource::Mailbox(id)),
            )))
        };
        let power = mailbox(MailboxChannelId::POWER);
        let vchiq = mailbox(MailboxChannelId::VCHIQ);

        let vcram_base = u32::try_from(config.vcram_base()).map_err(|_| {
            PlatformError::InvalidConfig(format!(
                "video RAM base 0x{:x} is not 32-bit addressable",
                config.vcram_base()
            ))
        })?;
        let framebuffer = SharedMmio::new(RegisterMmio::new(FramebufferController::new(
            ram,
            vcram_base,
            irq(IrqSource::Mailbox(MailboxChannelId::FRAMEBUFFER)),
        )));

        map_peripheral(
            &mut bus,
            SYSTEM_TIMER_BASE,
            SYSTEM_TIMER_WINDOW_SIZE,
            system_timer.clone(),
        )?;
        for (id, dev) in [
            (MailboxChannelId::POWER, &power),
            (MailboxChannelId::VCHIQ, &vchiq),
        ] {
            map_peripheral(
                &mut bus,
                mailbox_device_base(id),
                MAILBOX_CHANNEL_WINDOW_SIZE,
                dev.clone(),
            )?;
        }
        map_peripheral(
            &mut bus,
            mailbox_device_base(MailboxChannelId::FRAMEBUFFER),
            MAILBOX_CHANNEL_WINDOW_SIZE,
            framebuffer.clone(),
        )?;
        bus.map_background(PERIPHERAL_BASE, PERIPHERAL_SIZE, Box::new(UnmappedPeripherals::new()))?;
        bus.map_background(
            BUS_PERIPHERAL_BASE,
            PERIPHERAL_SIZE,
            Box::new(UnmappedPeripherals::new()),
        )?;

        let first_vblank = clock.now_ns() + config.vblank_period_ns();
        timers.borrow_mut().schedule(first_vblank, WakeSource::Vblank);

        info!(
            ram_size = config.ram_size_bytes,
            vcram_base, vblank_hz = config.vblank_hz, "bcm2835 platform ready"
        );

        Ok(Self {
            config,
            clock,
            bus,
            interrupts,
            timers,
            system_timer,
            power,
            vchiq,
            framebuffer,
            halted: None,
        })
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Guest-physical address space, for loading guest code and data.
    pub fn bus_mut(&mut self) -> &mut PhysicalMemoryBus {
        &mut self.bus
    }

    pub fn read_u32(&mut self, paddr: u64) -> u32 {
        self.bus.read_u32(paddr)
    }

    pub fn write_u32(&mut self, paddr: u64, value: u32) {
        self.bus.write_u32(paddr, value);
        self.check_fatal();
    }

    pub fn interrupts(&self) -> Ref<'_, InterruptRouter> {
        self.interrupts.borrow()
    }

    pub fn take_irq_events(&self) -> Vec<IrqEvent> {
        self.interrupts.borrow_mut().take_events()
    }

    pub fn framebuffer_config(&self) -> FramebufferConfig {
        *self.framebuffer.0.borrow().device().config()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    fn check_fatal(&mut self) {
        if self.halted.is_some() {
            return;
        }
        if let Some(err) = self.framebuffer.0.borrow_mut().device_mut().take_fatal() {
            error!(%err, "halting machine");
            self.halted = Some(err);
        }
    }

    /// Earliest pending wake-up, for hosts that step virtual time between events.
    pub fn next_deadline_ns(&self) -> Option<u64> {
        self.timers.borrow().next_deadline()
    }

    /// Dispatch every wake-up whose deadline has passed.
    ///
    /// Fails with [`PlatformError::Halted`] once a peripheral has hit an unsupported mode.
    pub fn poll(&mut self) -> Result<PollOutcome, PlatformError> {
        self.check_fatal();
        if let Some(err) = &self.halted {
            return Err(PlatformError::Halted(err.clone()));
        }

        let now = self.clock.now_ns();
        let period = self.config.vblank_period_ns();
        let mut outcome = PollOutcome::default();
        loop {
            let event = self.timers.borrow_mut().pop_due(now);
            let Some(event) = event else { break };
            match event.payload {
                WakeSource::SystemTimer => {
                    self.system_timer.0.borrow_mut().device_mut().tick();
                    outcome.timer_ticks += 1;
                }
                WakeSource::Vblank => {
                    outcome.vblank = true;
                    let missed = (now - event.deadline_ns) / period;
                    let next = event.deadline_ns + (missed + 1) * period;
                    if missed > 0 {
                        debug!(missed, "skipped vblank periods");
                    }
                    self.timers.borrow_mut().schedule(next, WakeSource::Vblank);
                }
            }
        }
        Ok(outcome)
    }

    /// Present the framebuffer to `surface`. Returns whether a frame was presented.
    pub fn refresh_display(&mut self, surface: &mut impl DisplaySurface) -> bool {
        self.framebuffer
            .0
            .borrow_mut()
            .device_mut()
            .update_display(surface)
    }

    pub fn invalidate_display(&mut self) {
        self.framebuffer.0.borrow_mut().device_mut().invalidate_display();
    }
}

fn map_peripheral<H: MmioHandler + 'static>(
    bus: &mut PhysicalMemoryBus,
    paddr: u64,
    len: u64,
    dev: SharedMmio<H>,
) -> Result<(), MapError> {
    bus.map_mmio(paddr, len, Box::new(dev.clone()))?;
    bus.map_mmio(bus_alias(paddr), len, Box::new(dev))
}

const TAG_SYSTEM_TIMER: u16 = 1;
const TAG_POWER: u16 = 2;
const TAG_FRAMEBUFFER: u16 = 3;
const TAG_VCHIQ: u16 = 4;

impl<C: Clock + Clone + 'static> IoSnapshot for Bcm2835<C> {
    const DEVICE_ID: [u8; 4] = *b"BCM2";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    /// Device state only; guest RAM is saved separately by the host.
    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_bytes(
            TAG_SYSTEM_TIMER,
            self.system_timer.0.borrow().device().save_state(),
        );
        w.field_bytes(TAG_POWER, self.power.0.borrow().device().save_state());
        w.field_bytes(
            TAG_FRAMEBUFFER,
            self.framebuffer.0.borrow().device().save_state(),
        );
        w.field_bytes(TAG_VCHIQ, self.vchiq.0.borrow().device().save_state());
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        if let Some(buf) = r.bytes(TAG_SYSTEM_TIMER) {
            self.system_timer.0.borrow_mut().device_mut().load_state(buf)?;
        }
        if let Some(buf) = r.bytes(TAG_POWER) {
            self.power.0.borrow_mut().device_mut().load_state(buf)?;
        }
        if let Some(buf) = r.bytes(TAG_FRAMEBUFFER) {
            self.framebuffer.0.borrow_mut().device_mut().load_state(buf)?;
        }
        if let Some(buf) = r.bytes(TAG_VCHIQ) {
            self.vchiq.0.borrow_mut().device_mut().load_state(buf)?;
        }
        Ok(())
    }
}
