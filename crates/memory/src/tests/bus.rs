use crate::{
    DenseMemory, GuestMemory, MapError, MemoryBus, MmioHandler, PhysicalMemoryBus,
    SharedGuestMemory, SharedMmio,
};
use std::sync::{Arc, Mutex};

type Reads = Arc<Mutex<Vec<(u64, usize)>>>;
type Writes = Arc<Mutex<Vec<(u64, usize, u64)>>>;

struct RecordingMmio {
    reads: Reads,
    writes: Writes,
    value: u64,
}

impl MmioHandler for RecordingMmio {
    fn read(&mut self, offset: u64, size: usize) -> u64 {
        self.reads.lock().unwrap().push((offset, size));
        self.value
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) {
        self.writes.lock().unwrap().push((offset, size, value));
    }
}

fn recording(value: u64) -> (RecordingMmio, Reads, Writes) {
    let reads = Arc::new(Mutex::new(Vec::new()));
    let writes = Arc::new(Mutex::new(Vec::new()));
    let handler = RecordingMmio {
        reads: reads.clone(),
        writes: writes.clone(),
        value,
    };
    (handler, reads, writes)
}

fn new_bus(ram: u64) -> PhysicalMemoryBus {
    PhysicalMemoryBus::new(SharedGuestMemory::new(Box::new(DenseMemory::new(ram).unwrap())))
}

#[test]
fn mmio_precedes_ram() {
    let (handler, reads, writes) = recording(0xFE);

    let mut bus = new_bus(0x2000);
    bus.write_u32(0x1000, 0x11);
    bus.map_mmio(0x1000, 0x10, Box::new(handler)).unwrap();

    assert_eq!(bus.read_u32(0x1004), 0xFE);
    bus.write_u32(0x1008, 0x77);

    assert_eq!(reads.lock().unwrap().as_slice(), &[(4, 4)]);
    assert_eq!(writes.lock().unwrap().as_slice(), &[(8, 4, 0x77)]);
    assert_eq!(bus.ram().read_u32_le(0x1000).unwrap(), 0x11);
}

#[test]
fn specific_windows_take_precedence_over_background_windows() {
    let (device, device_reads, _) = recording(0xAA);
    let (catch_all, catch_all_reads, catch_all_writes) = recording(0);

    let mut bus = new_bus(0x100);
    bus.map_background(0x8000, 0x1000, Box::new(catch_all)).unwrap();
    bus.map_mmio(0x8100, 0x10, Box::new(device)).unwrap();

    assert_eq!(bus.read_u32(0x8100), 0xAA);
    assert_eq!(bus.read_u32(0x8200), 0);
    bus.write_u32(0x8FFC, 5);

    assert_eq!(device_reads.lock().unwrap().as_slice(), &[(0, 4)]);
    assert_eq!(catch_all_reads.lock().unwrap().as_slice(), &[(0x200, 4)]);
    assert_eq!(catch_all_writes.lock().unwrap().as_slice(), &[(0xFFC, 4, 5)]);
}

#[test]
fn shared_handler_sees_accesses_from_every_alias() {
    let (handler, reads, _) = recording(1);
    let shared = SharedMmio::new(handler);

    let mut bus = new_bus(0x100);
    bus.map_mmio(0x1000, 0x10, Box::new(shared.clone())).unwrap();
    bus.map_mmio(0x7000, 0x10, Box::new(shared)).unwrap();

    bus.read_u32(0x1004);
    bus.read_u32(0x7004);
    assert_eq!(reads.lock().unwrap().as_slice(), &[(4, 4), (4, 4)]);
}

#[test]
fn overlapping_windows_are_rejected() {
    let mut bus = new_bus(0x100);
    bus.map_mmio(0x1000, 0x100, Box::new(recording(0).0)).unwrap();

    assert_eq!(
        bus.map_mmio(0x10F0, 0x20, Box::new(recording(0).0)),
        Err(MapError::Overlap {
            start: 0x10F0,
            end: 0x1110,
            existing_start: 0x1000,
            existing_end: 0x1100,
        })
    );
    assert_eq!(
        bus.map_mmio(0x2000, 0, Box::new(recording(0).0)),
        Err(MapError::ZeroLength { start: 0x2000 })
    );
    assert!(bus.map_mmio(0x1100, 0x10, Box::new(recording(0).0)).is_ok());
}

#[test]
fn accesses_straddling_a_window_are_split_into_bytes() {
    let (handler, reads, _) = recording(0x5A);
    let mut bus = new_bus(0x2000);
    bus.map_mmio(0x1000, 2, Box::new(handler)).unwrap();
    bus.write_u8(0x1002, 0x11);
    bus.write_u8(0x1003, 0x22);

    assert_eq!(bus.read_u32(0x1000), 0x2211_5A5A);
    assert_eq!(reads.lock().unwrap().as_slice(), &[(0, 1), (1, 1)]);
}

#[test]
fn unbacked_reads_return_all_ones() {
    let mut bus = new_bus(0x10);

    assert_eq!(bus.read_u8(0x1000), 0xFF);
    assert_eq!(bus.read_u32(0x1000), 0xFFFF_FFFF);
    bus.write_u32(0x1000, 0);
    assert_eq!(bus.read_u32(0x1000), 0xFFFF_FFFF);
}
