use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

use crate::bus::MemoryBus;
use crate::phys::GuestMemory;
use crate::shared::SharedGuestMemory;

/// Memory-mapped I/O window handler.
///
/// `offset` is relative to the start of the window the handler was mapped at. `size` is the access
/// width in bytes (1, 2, 4 or 8); values are little-endian and zero-extended to `u64`.
pub trait MmioHandler {
    fn read(&mut self, offset: u64, size: usize) -> u64;
    fn write(&mut self, offset: u64, size: usize, value: u64);
}

impl<T: MmioHandler + ?Sized> MmioHandler for Box<T> {
    fn read(&mut self, offset: u64, size: usize) -> u64 {
        (**self).read(offset, size)
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) {
        (**self).write(offset, size, value);
    }
}

/// Shared handle to an MMIO handler, used to map one device at several physical addresses.
pub struct SharedMmio<H: ?Sized>(pub Rc<RefCell<H>>);

impl<H: ?Sized> Clone for SharedMmio<H> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<H> SharedMmio<H> {
    pub fn new(handler: H) -> Self {
        Self(Rc::new(RefCell::new(handler)))
    }
}

impl<H: MmioHandler + ?Sized> MmioHandler for SharedMmio<H> {
    fn read(&mut self, offset: u64, size: usize) -> u64 {
        self.0.borrow_mut().read(offset, size)
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) {
        self.0.borrow_mut().write(offset, size, value);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("MMIO window at 0x{start:x} has zero length")]
    ZeroLength { start: u64 },
    #[error("MMIO window at 0x{start:x} (len 0x{len:x}) wraps the physical address space")]
    AddressOverflow { start: u64, len: u64 },
    #[error("MMIO window [0x{start:x}, 0x{end:x}) overlaps existing window [0x{existing_start:x}, 0x{existing_end:x})")]
    Overlap {
        start: u64,
        end: u64,
        existing_start: u64,
        existing_end: u64,
    },
}

struct MmioRegion {
    start: u64,
    end: u64,
    handler: Box<dyn MmioHandler>,
}

#[derive(Default)]
struct RegionSet {
    regions: Vec<MmioRegion>,
}

impl RegionSet {
    fn insert(
        &mut self,
        start: u64,
        len: u64,
        handler: Box<dyn MmioHandler>,
    ) -> Result<(), MapError> {
        if len == 0 {
            return Err(MapError::ZeroLength { start });
        }
        let end = start
            .checked_add(len)
            .ok_or(MapError::AddressOverflow { start, len })?;

        let idx = self.regions.partition_point(|r| r.start < start);
        for neighbour in [idx.checked_sub(1), Some(idx)].into_iter().flatten() {
            if let Some(r) = self.regions.get(neighbour) {
                if start < r.end && r.start < end {
                    return Err(MapError::Overlap {
                        start,
                        end,
                        existing_start: r.start,
                        existing_end: r.end,
                    });
                }
            }
        }

        self.regions.insert(idx, MmioRegion { start, end, handler });
        Ok(())
    }

    fn find(&mut self, paddr: u64) -> Option<&mut MmioRegion> {
        let idx = self.regions.partition_point(|r| r.start <= paddr).checked_sub(1)?;
        let region = self.regions.get_mut(idx)?;
        (paddr < region.end).then_some(region)
    }
}

/// Physical address router: MMIO windows, then background windows, then RAM.
///
/// Background windows model catch-all decoders (an address range that responds to every access
/// without backing a real device); regular windows inside them take precedence. Accesses that
/// hit neither MMIO nor RAM read as all ones and drop writes.
pub struct PhysicalMemoryBus {
    ram: SharedGuestMemory,
    mmio: RegionSet,
    background: RegionSet,
}

impl PhysicalMemoryBus {
    pub fn new(ram: SharedGuestMemory) -> Self {
        Self {
            ram,
            mmio: RegionSet::default(),
            background: RegionSet::default(),
        }
    }

    pub fn ram(&self) -> &SharedGuestMemory {
        &self.ram
    }

    pub fn map_mmio(
        &mut self,
        start: u64,
        len: u64,
        handler: Box<dyn MmioHandler>,
    ) -> Result<(), MapError> {
        self.mmio.insert(start, len, handler)
    }

    pub fn map_background(
        &mut self,
        start: u64,
        len: u64,
        handler: Box<dyn MmioHandler>,
    ) -> Result<(), MapError> {
        self.background.insert(start, len, handler)
    }

    fn mmio_region(&mut self, paddr: u64) -> Option<&mut MmioRegion> {
        if let Some(idx) = self.mmio_index(paddr) {
            return self.mmio.regions.get_mut(idx);
        }
        self.background.find(paddr)
    }

    fn mmio_index(&self, paddr: u64) -> Option<usize> {
        let idx = self
            .mmio
            .regions
            .partition_point(|r| r.start <= paddr)
            .checked_sub(1)?;
        (paddr < self.mmio.regions[idx].end).then_some(idx)
    }

    fn read_at(&mut self, paddr: u64, dst: &mut [u8]) {
        if let Some(region) = self.mmio_region(paddr) {
            let offset = paddr - region.start;
            let fits = paddr
                .checked_add(dst.len() as u64)
                .is_some_and(|end| end <= region.end);
            if fits && matches!(dst.len(), 1 | 2 | 4 | 8) {
                let value = region.handler.read(offset, dst.len());
                dst.copy_from_slice(&value.to_le_bytes()[..dst.len()]);
                return;
            }
            // Unaligned or oversized access: decompose into byte accesses.
            for (i, byte) in dst.iter_mut().enumerate() {
                *byte = match paddr.checked_add(i as u64) {
                    Some(addr) => {
                        let mut b = [0u8; 1];
                        self.read_at(addr, &mut b);
                        b[0]
                    }
                    None => 0xFF,
                };
            }
            return;
        }

        if self.ram.read_into(paddr, dst).is_err() {
            dst.fill(0xFF);
        }
    }

    fn write_at(&mut self, paddr: u64, src: &[u8]) {
        if let Some(region) = self.mmio_region(paddr) {
            let offset = paddr - region.start;
            let fits = paddr
                .checked_add(src.len() as u64)
                .is_some_and(|end| end <= region.end);
            if fits && matches!(src.len(), 1 | 2 | 4 | 8) {
                let mut buf = [0u8; 8];
                buf[..src.len()].copy_from_slice(src);
                region
                    .handler
                    .write(offset, src.len(), u64::from_le_bytes(buf));
                return;
            }
            for (i, byte) in src.iter().enumerate() {
                if let Some(addr) = paddr.checked_add(i as u64) {
                    self.write_at(addr, &[*byte]);
                }
            }
            return;
        }

        if let Err(err) = self.ram.write_from(paddr, src) {
            tracing::trace!(%err, "dropping write to unbacked physical memory");
        }
    }
}

impl MemoryBus for PhysicalMemoryBus {
    fn read_physical(&mut self, paddr: u64, buf: &mut [u8]) {
        if !buf.is_empty() {
            self.read_at(paddr, buf);
        }
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) {
        if !buf.is_empty() {
            self.write_at(paddr, buf);
        }
    }
}
