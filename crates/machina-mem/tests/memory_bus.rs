use machina_mem::{MemoryBus, MmioHandler, PhysicalMemory, PhysicalMemoryOptions, WriteObserver};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct TestMmio {
    writes: Mutex<Vec<(u64, Vec<u8>)>>,
}

impl MmioHandler for TestMmio {
    fn read(&self, offset: u64, data: &mut [u8]) {
        for (i, b) in data.iter_mut().enumerate() {
            *b = 0xA0u8.wrapping_add(offset as u8).wrapping_add(i as u8);
        }
    }

    fn write(&self, offset: u64, data: &[u8]) {
        self.writes.lock().unwrap().push((offset, data.to_vec()));
    }
}

fn make_ram(size: u64) -> Arc<PhysicalMemory> {
    Arc::new(
        PhysicalMemory::with_options(size, PhysicalMemoryOptions { chunk_size: 4096 }).unwrap(),
    )
}

#[test]
fn mmio_mapping_boundaries() {
    let ram = make_ram(0x200);
    ram.write_u8(0x7F, 0x11);
    ram.write_u8(0x90, 0x22);

    let mut bus = MemoryBus::new(ram.clone());
    let mmio = Arc::new(TestMmio::default());
    bus.register_mmio(0x80..0x90, mmio.clone()).unwrap();

    assert_eq!(bus.read_u8(0x7F), 0x11);
    assert_eq!(bus.read_u8(0x80), 0xA0);
    assert_eq!(bus.read_u8(0x8F), 0xA0 + 0x0F);
    assert_eq!(bus.read_u8(0x90), 0x22);

    // Writes are routed to the MMIO handler with LE byte order.
    bus.write_u32(0x84, 0x1122_3344);
    let writes = mmio.writes.lock().unwrap();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].0, 0x04);
    assert_eq!(writes[0].1, vec![0x44, 0x33, 0x22, 0x11]);

    // MMIO writes must not touch underlying RAM.
    assert_eq!(ram.read_u32(0x84), 0);
}

#[test]
fn rom_writes_are_ignored() {
    let ram = make_ram(0x200);
    let mut bus = MemoryBus::new(ram.clone());

    bus.register_rom(0x40, Arc::from([0xDEu8, 0xAD, 0xBE, 0xEF]))
        .unwrap();

    bus.write_u32(0x40, 0x1122_3344);

    let mut buf = [0u8; 4];
    bus.read_bytes(0x40, &mut buf);
    assert_eq!(buf, [0xDE, 0xAD, 0xBE, 0xEF]);

    // Verify the write didn't fall through into RAM.
    let mut raw = [0u8; 4];
    ram.read_bytes(0x40, &mut raw);
    assert_eq!(raw, [0, 0, 0, 0]);
}

#[test]
fn open_bus_reads_as_ff_and_ignores_writes() {
    let ram = make_ram(0x100);
    let mut bus = MemoryBus::new(ram.clone());

    ram.write_u8(0x50, 0x12);
    bus.register_open_bus(0x50..0x60).unwrap();

    assert_eq!(bus.read_u8(0x4F), 0x00);
    assert_eq!(bus.read_u8(0x50), 0xFF);
    assert_eq!(bus.read_u8(0x5F), 0xFF);
    assert_eq!(bus.read_u8(0x60), 0x00);

    bus.write_u8(0x50, 0x34);
    assert_eq!(ram.read_u8(0x50), 0x12);
}

#[test]
fn reads_past_ram_with_no_mapping_are_zero() {
    let ram = make_ram(0x1000);
    let mut bus = MemoryBus::new(ram);
    assert_eq!(bus.read_u32(0x10_0000), 0);
    // Writes to unbacked space are silently dropped.
    bus.write_u32(0x10_0000, 0xDEAD_BEEF);
    assert_eq!(bus.read_u32(0x10_0000), 0);
}

#[test]
fn overlapping_mappings_are_rejected() {
    let ram = make_ram(0x1000);
    let mut bus = MemoryBus::new(ram);

    bus.register_rom(0x100, Arc::from([0u8; 16])).unwrap();

    let err = bus
        .register_mmio(0x108..0x110, Arc::new(TestMmio::default()))
        .unwrap_err();
    assert!(matches!(err, machina_mem::MemoryBusError::Overlap { .. }));

    bus.register_mmio(0x200..0x210, Arc::new(TestMmio::default()))
        .unwrap();
}

#[test]
fn invalid_ranges_are_rejected() {
    let ram = make_ram(0x1000);
    let mut bus = MemoryBus::new(ram);

    let err = bus
        .register_mmio(0x200..0x200, Arc::new(TestMmio::default()))
        .unwrap_err();
    assert!(matches!(err, machina_mem::MemoryBusError::InvalidRange { .. }));
}

#[test]
fn typed_read_crossing_ram_to_rom_boundary() {
    let ram = make_ram(0x210);
    let mut bus = MemoryBus::new(ram.clone());

    bus.register_rom(0x200, Arc::from([0xFEu8, 0xED])).unwrap();

    ram.write_u8(0x1FF, 0xAA);
    assert_eq!(bus.read_u16(0x1FF), 0xFEAA);
}

#[test]
fn register_mmio_fn_works() {
    let ram = make_ram(0x100);
    let mut bus = MemoryBus::new(ram);

    let writes = Arc::new(Mutex::new(Vec::<(u64, Vec<u8>)>::new()));
    let writes_clone = writes.clone();

    bus.register_mmio_fn(
        0x20..0x30,
        |offset, data| {
            for (i, b) in data.iter_mut().enumerate() {
                *b = 0xF0u8.wrapping_add(offset as u8).wrapping_add(i as u8);
            }
        },
        move |offset, data| {
            writes_clone.lock().unwrap().push((offset, data.to_vec()));
        },
    )
    .unwrap();

    assert_eq!(bus.read_u8(0x20), 0xF0);
    bus.write_u16(0x22, 0xBEEF);
    let writes = writes.lock().unwrap();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].0, 0x02);
    assert_eq!(writes[0].1, vec![0xEF, 0xBE]);
}

struct CellWatch {
    range: std::ops::Range<u64>,
    seen: Arc<Mutex<Vec<(u64, u8, u8)>>>,
}

impl WriteObserver for CellWatch {
    fn watches(&self, addr: u64) -> bool {
        self.range.contains(&addr)
    }

    fn on_write(&mut self, addr: u64, prev: u8, next: u8) {
        self.seen.lock().unwrap().push((addr, prev, next));
    }
}

#[test]
fn observers_see_prev_and_next_for_watched_bytes_only() {
    let ram = make_ram(0x1000);
    let mut bus = MemoryBus::new(ram);

    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.add_observer(Box::new(CellWatch {
        range: 0x100..0x102,
        seen: seen.clone(),
    }));

    bus.write_u8(0x100, 0x41);
    bus.write_u8(0x100, 0x42);
    bus.write_u8(0x300, 0x99); // outside the watch window

    let seen = seen.lock().unwrap();
    assert_eq!(seen.as_slice(), &[(0x100, 0x00, 0x41), (0x100, 0x41, 0x42)]);
}
