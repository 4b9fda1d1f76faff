//! Interrupt fan-in.
//!
//! Collects the level of every peripheral interrupt output. The ARM interrupt controller and CPU
//! injection consume this state; they are not modelled here.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use bcm_devices::irq::IrqLine;
use bcm_devices::mailbox::MailboxChannelId;
use tracing::debug;

/// GPU IRQ numbers of the system timer channels.
pub const INTERRUPT_TIMER0: u32 = 0;
pub const INTERRUPT_TIMER1: u32 = 1;
pub const INTERRUPT_TIMER2: u32 = 2;
pub const INTERRUPT_TIMER3: u32 = 3;

/// Number of lines on the ARM interrupt controller.
pub const ARMCTRL_IRQ_COUNT: u32 = 72;
/// Mailbox channel devices signal on pseudo-lines above the controller's range.
pub const MBOX_IRQ_BASE: u32 = ARMCTRL_IRQ_COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IrqSource {
    SystemTimer(u8),
    Mailbox(MailboxChannelId),
}

impl IrqSource {
    pub fn line(self) -> u32 {
        match self {
            IrqSource::SystemTimer(channel) => INTERRUPT_TIMER0 + u32::from(channel),
            IrqSource::Mailbox(channel) => MBOX_IRQ_BASE + channel.raw(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqEvent {
    Raise(IrqSource),
    Lower(IrqSource),
}

#[derive(Debug, Default)]
pub struct InterruptRouter {
    levels: BTreeMap<IrqSource, bool>,
    events: Vec<IrqEvent>,
}

impl InterruptRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a line level; only transitions are logged as events.
    pub fn set_level(&mut self, source: IrqSource, level: bool) {
        let previous = self.levels.insert(source, level).unwrap_or(false);
        if previous == level {
            return;
        }
        debug!(?source, line = source.line(), level, "irq line changed");
        self.events.push(if level {
            IrqEvent::Raise(source)
        } else {
            IrqEvent::Lower(source)
        });
    }

    pub fn is_asserted(&self, source: IrqSource) -> bool {
        self.levels.get(&source).copied().unwrap_or(false)
    }

    /// Line numbers currently asserted, ascending.
    pub fn asserted_lines(&self) -> Vec<u32> {
        let mut lines: Vec<u32> = self
            .levels
            .iter()
            .filter(|(_, &level)| level)
            .map(|(source, _)| source.line())
            .collect();
        lines.sort_unstable();
        lines
    }

    pub fn events(&self) -> &[IrqEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<IrqEvent> {
        std::mem::take(&mut self.events)
    }
}

/// A device's handle on one router input.
#[derive(Clone)]
pub struct RouterIrq {
    router: Rc<RefCell<InterruptRouter>>,
    source: IrqSource,
}

impl RouterIrq {
    pub fn new(router: Rc<RefCell<InterruptRouter>>, source: IrqSource) -> Self {
        Self { router, source }
    }

    pub fn source(&self) -> IrqSource {
        self.source
    }
}

impl IrqLine for RouterIrq {
    fn set_level(&self, level: bool) {
        self.router.borrow_mut().set_level(self.source, level);
    }
}
