use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::bus::MemoryBus;
use crate::phys::{GuestMemory, GuestMemoryResult};

/// Cloneable handle to guest RAM shared between the physical bus and bus-mastering devices.
///
/// The platform is single-threaded, so sharing uses `Rc<RefCell<..>>`. The physical bus never
/// holds a RAM borrow while dispatching to an MMIO handler, which lets a device reached through
/// MMIO read and write guest RAM through its own handle.
#[derive(Clone)]
pub struct SharedGuestMemory(Rc<RefCell<Box<dyn GuestMemory>>>);

impl SharedGuestMemory {
    pub fn new(mem: Box<dyn GuestMemory>) -> Self {
        Self(Rc::new(RefCell::new(mem)))
    }
}

impl fmt::Debug for SharedGuestMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedGuestMemory")
            .field("size", &self.size())
            .finish()
    }
}

impl GuestMemory for SharedGuestMemory {
    fn size(&self) -> u64 {
        self.0.borrow().size()
    }

    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        self.0.borrow().read_into(paddr, dst)
    }

    fn write_from(&mut self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        self.0.borrow_mut().write_from(paddr, src)
    }
}

/// Bus-master view: out-of-range reads float high, out-of-range writes are dropped.
impl MemoryBus for SharedGuestMemory {
    fn read_physical(&mut self, paddr: u64, buf: &mut [u8]) {
        if self.read_into(paddr, buf).is_err() {
            buf.fill(0xFF);
        }
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) {
        if let Err(err) = self.write_from(paddr, buf) {
            tracing::trace!(%err, "dropping bus-master write");
        }
    }
}
