use crate::phys::{check_range, GuestMemory, GuestMemoryResult};
use thiserror::Error;

/// A guest-physical → inner-memory mapping region.
///
/// The guest-physical address range `[phys_start, phys_end)` is mapped to the inner backend address
/// range `[inner_offset, inner_offset + (phys_end - phys_start))`. Several regions may target the
/// same inner range; that is how bank aliases are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestMemoryMapping {
    pub phys_start: u64,
    pub phys_end: u64,
    pub inner_offset: u64,
}

impl GuestMemoryMapping {
    #[inline]
    fn len(&self) -> u64 {
        self.phys_end.saturating_sub(self.phys_start)
    }

    #[inline]
    fn map_addr(&self, paddr: u64) -> u64 {
        self.inner_offset + (paddr - self.phys_start)
    }
}

/// Errors constructing an [`AliasedGuestMemory`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AliasedGuestMemoryError {
    #[error("aliased memory region {index} is empty: phys_start=0x{phys_start:x} phys_end=0x{phys_end:x}")]
    EmptyRegion {
        index: usize,
        phys_start: u64,
        phys_end: u64,
    },
    #[error("aliased memory region {index} out of phys range: phys_end=0x{phys_end:x} phys_size=0x{phys_size:x}")]
    RegionOutOfPhysRange {
        index: usize,
        phys_end: u64,
        phys_size: u64,
    },
    #[error("aliased memory region {index} (phys_start=0x{phys_start:x}) overlaps region {prev_index} (ends 0x{prev_end:x})")]
    Overlap {
        prev_index: usize,
        prev_end: u64,
        index: usize,
        phys_start: u64,
    },
    #[error("aliased memory region {index} maps past the backing store: inner_offset=0x{inner_offset:x} len=0x{len:x} inner_size=0x{inner_size:x}")]
    InnerOutOfRange {
        index: usize,
        inner_offset: u64,
        len: u64,
        inner_size: u64,
    },
}

/// A [`GuestMemory`] wrapper exposing one backing store through several guest-physical windows.
///
/// Accesses into unmapped gaps succeed, returning `0xFF` on reads (open-bus) and ignoring writes.
/// The BCM2835 uses this to mirror SDRAM into four 1 GiB banks selected by address bits 30-31,
/// each bank carrying a different cache policy on real hardware.
pub struct AliasedGuestMemory {
    inner: Box<dyn GuestMemory>,
    phys_size: u64,
    regions: Vec<GuestMemoryMapping>,
}

impl AliasedGuestMemory {
    /// Wrap `inner` and expose it via the guest-physical `regions` within `[0, phys_size)`.
    ///
    /// `regions` are sorted by `phys_start` and must be disjoint in the guest-physical space.
    pub fn new(
        inner: Box<dyn GuestMemory>,
        phys_size: u64,
        mut regions: Vec<GuestMemoryMapping>,
    ) -> Result<Self, AliasedGuestMemoryError> {
        regions.sort_by_key(|r| r.phys_start);

        let inner_size = inner.size();
        let mut prev_end = 0u64;

        for (idx, r) in regions.iter().enumerate() {
            if r.phys_end <= r.phys_start {
                return Err(AliasedGuestMemoryError::EmptyRegion {
                    index: idx,
                    phys_start: r.phys_start,
                    phys_end: r.phys_end,
                });
            }
            if r.phys_end > phys_size {
                return Err(AliasedGuestMemoryError::RegionOutOfPhysRange {
                    index: idx,
                    phys_end: r.phys_end,
                    phys_size,
                });
            }
            if idx > 0 && r.phys_start < prev_end {
                return Err(AliasedGuestMemoryError::Overlap {
                    prev_index: idx - 1,
                    prev_end,
                    index: idx,
                    phys_start: r.phys_start,
                });
            }

            let len = r.len();
            let fits = r
                .inner_offset
                .checked_add(len)
                .is_some_and(|end| end <= inner_size);
            if !fits {
                return Err(AliasedGuestMemoryError::InnerOutOfRange {
                    index: idx,
                    inner_offset: r.inner_offset,
                    len,
                    inner_size,
                });
            }

            prev_end = r.phys_end;
        }

        Ok(Self {
            inner,
            phys_size,
            regions,
        })
    }

    /// Mirror the whole of `inner` at the start of `banks` consecutive windows of `bank_size`.
    pub fn mirrored(
        inner: Box<dyn GuestMemory>,
        bank_size: u64,
        banks: u32,
    ) -> Result<Self, AliasedGuestMemoryError> {
        let len = inner.size();
        let regions = (0..u64::from(banks))
            .map(|bank| GuestMemoryMapping {
                phys_start: bank * bank_size,
                phys_end: bank * bank_size + len,
                inner_offset: 0,
            })
            .collect();
        Self::new(inner, bank_size * u64::from(banks), regions)
    }

    pub fn regions(&self) -> &[GuestMemoryMapping] {
        &self.regions
    }

    #[inline]
    fn first_region_index_for_addr(&self, paddr: u64) -> usize {
        // Regions are sorted and disjoint, so `phys_end` is strictly increasing.
        self.regions.partition_point(|r| r.phys_end <= paddr)
    }

    fn region_containing(&self, paddr: u64, len: usize) -> Option<&GuestMemoryMapping> {
        let end = paddr.checked_add(len as u64)?;
        let idx = self
            .regions
            .partition_point(|r| r.phys_start <= paddr)
            .checked_sub(1)?;
        let region = self.regions.get(idx)?;
        (paddr < region.phys_end && end <= region.phys_end).then_some(region)
    }
}

impl GuestMemory for AliasedGuestMemory {
    fn size(&self) -> u64 {
        self.phys_size
    }

    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let end = check_range(self.phys_size, paddr, dst.len())?;
        if dst.is_empty() {
            return Ok(());
        }

        dst.fill(0xFF);

        let mut idx = self.first_region_index_for_addr(paddr);
        while let Some(region) = self.regions.get(idx) {
            if region.phys_start >= end {
                break;
            }
            let inter_start = paddr.max(region.phys_start);
            let inter_end = end.min(region.phys_end);
            if inter_start < inter_end {
                let off = (inter_start - paddr) as usize;
                let len = (inter_end - inter_start) as usize;
                self.inner
                    .read_into(region.map_addr(inter_start), &mut dst[off..off + len])?;
            }
            idx += 1;
        }

        Ok(())
    }

    fn write_from(&mut self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        let end = check_range(self.phys_size, paddr, src.len())?;
        if src.is_empty() {
            return Ok(());
        }

        let mut idx = self.first_region_index_for_addr(paddr);
        while let Some(region) = self.regions.get(idx) {
            if region.phys_start >= end {
                break;
            }
            let inter_start = paddr.max(region.phys_start);
            let inter_end = end.min(region.phys_end);
            if inter_start < inter_end {
                let off = (inter_start - paddr) as usize;
                let len = (inter_end - inter_start) as usize;
                let inner_addr = region.map_addr(inter_start);
                self.inner.write_from(inner_addr, &src[off..off + len])?;
            }
            idx += 1;
        }

        Ok(())
    }

    fn get_slice(&self, paddr: u64, len: usize) -> Option<&[u8]> {
        let region = self.region_containing(paddr, len)?;
        self.inner.get_slice(region.map_addr(paddr), len)
    }

    fn get_slice_mut(&mut self, paddr: u64, len: usize) -> Option<&mut [u8]> {
        let inner_addr = self.region_containing(paddr, len)?.map_addr(paddr);
        self.inner.get_slice_mut(inner_addr, len)
    }
}
