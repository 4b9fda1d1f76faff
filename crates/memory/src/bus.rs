/// Side-channel view of guest physical memory.
///
/// Devices that read or write guest-resident structures go through this trait. Accesses never
/// fail: unbacked reads float high and unbacked writes are dropped, which is what a bus master
/// observes on the board. All multi-byte values are little-endian.
pub trait MemoryBus {
    fn read_physical(&mut self, paddr: u64, buf: &mut [u8]);
    fn write_physical(&mut self, paddr: u64, buf: &[u8]);

    fn read_u8(&mut self, paddr: u64) -> u8 {
        let mut byte = [0u8];
        self.read_physical(paddr, &mut byte);
        byte[0]
    }

    fn write_u8(&mut self, paddr: u64, val: u8) {
        self.write_physical(paddr, &[val]);
    }

    /// Word access; `paddr` need not be aligned.
    fn read_u32(&mut self, paddr: u64) -> u32 {
        let mut word = [0u8; 4];
        self.read_physical(paddr, &mut word);
        u32::from_le_bytes(word)
    }

    fn write_u32(&mut self, paddr: u64, val: u32) {
        self.write_physical(paddr, &val.to_le_bytes());
    }
}

impl<T: MemoryBus + ?Sized> MemoryBus for &mut T {
    fn read_physical(&mut self, paddr: u64, buf: &mut [u8]) {
        (**self).read_physical(paddr, buf);
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) {
        (**self).write_physical(paddr, buf);
    }
}
