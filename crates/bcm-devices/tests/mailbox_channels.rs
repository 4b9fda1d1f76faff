use std::cell::RefCell;
use std::rc::Rc;

use bcm_devices::consts::{MBOX_CHAN_POWER, MBOX_CHAN_VCHIQ};
use bcm_devices::irq::IrqLine;
use bcm_devices::mailbox::{MailboxChannelId, MailboxDevice};
use bcm_devices::mmio::RegisterMmio;
use bcm_io_snapshot::io::state::{IoSnapshot, SnapshotError};
use memory::MmioHandler;

#[derive(Clone, Default)]
struct TestIrqLine(Rc<RefCell<Vec<bool>>>);

impl TestIrqLine {
    fn level(&self) -> bool {
        self.0.borrow().last().copied().unwrap_or(false)
    }
}

impl IrqLine for TestIrqLine {
    fn set_level(&self, level: bool) {
        self.0.borrow_mut().push(level);
    }
}

#[test]
fn command_write_then_identity_read_round_trips() {
    let devices: [(fn(TestIrqLine) -> MailboxDevice<TestIrqLine>, u32); 2] = [
        (MailboxDevice::power, MBOX_CHAN_POWER),
        (MailboxDevice::vchiq, MBOX_CHAN_VCHIQ),
    ];
    for (dev, id) in devices {
        let irq = TestIrqLine::default();
        let mut mmio = RegisterMmio::new(dev(irq.clone()));

        mmio.write(0x0, 4, 0xabcd_ef00);
        assert_eq!(mmio.read(0x4, 4), 1);
        assert!(irq.level());

        assert_eq!(mmio.read(0x0, 4), u64::from(id));
        assert!(!irq.level());
        assert_eq!(mmio.read(0x4, 4), 0);
        assert_eq!(*irq.0.borrow(), vec![true, false]);
    }
}

#[test]
fn status_reads_are_idempotent() {
    let irq = TestIrqLine::default();
    let mut mmio = RegisterMmio::new(MailboxDevice::power(irq.clone()));
    mmio.write(0x0, 4, 0);

    assert_eq!(mmio.read(0x4, 4), mmio.read(0x4, 4));
    assert!(mmio.device().is_pending());
    assert_eq!(irq.0.borrow().len(), 1);
}

#[test]
fn bad_accesses_are_no_ops() {
    let irq = TestIrqLine::default();
    let mut mmio = RegisterMmio::new(MailboxDevice::vchiq(irq.clone()));

    mmio.write(0x8, 4, 1);
    mmio.write(0x4, 4, 1);
    mmio.write(0x0, 2, 1);
    assert_eq!(mmio.read(0x10, 4), 0);
    assert_eq!(mmio.read(0x2, 4), 0);
    assert!(!mmio.device().is_pending());
    assert!(irq.0.borrow().is_empty());
}

#[test]
fn restore_drops_an_outstanding_request() {
    let irq = TestIrqLine::default();
    let mut mmio = RegisterMmio::new(MailboxDevice::new(MailboxChannelId::VCHIQ, irq.clone()));
    let snap = mmio.device().save_state();

    mmio.write(0x0, 4, 0);
    assert!(irq.level());

    let dev = mmio.device_mut();
    dev.load_state(&snap).unwrap();
    assert!(!dev.is_pending());
    assert!(!irq.level());

    let err = dev.load_state(b"BCMS").unwrap_err();
    assert_eq!(err, SnapshotError::UnexpectedEof);
}
