//! The system bus: guest RAM plus MMIO and port-I/O routing into the device
//! models. Implements the physical-address [`machina_mmu::MemoryBus`] the
//! paging unit walks, so page tables, devices and DMA all see one address
//! space.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use machina_devices::{
    Cmos, DualPic, I8042Controller, IoApic, IrqSink, LocalApic, Pit8254, IOAPIC_BASE, LAPIC_BASE,
};

const APIC_WINDOW: u64 = 0x1000;
const COM1_BASE: u16 = 0x3F8;

/// IRQ pulses emitted by devices, drained by the machine between
/// instructions.
#[derive(Clone, Default)]
pub struct IrqQueue(Arc<Mutex<VecDeque<u8>>>);

impl IrqQueue {
    pub fn push(&self, irq: u8) {
        self.0.lock().unwrap().push_back(irq);
    }

    pub fn pop(&self) -> Option<u8> {
        self.0.lock().unwrap().pop_front()
    }
}

impl IrqSink for IrqQueue {
    fn raise_irq(&mut self, irq: u8) {
        self.push(irq);
    }
}

pub struct DeviceSet {
    pub pic: DualPic,
    pub pit: Pit8254,
    pub cmos: Cmos,
    pub kbc: I8042Controller,
    pub lapic: LocalApic,
    pub ioapic: IoApic,
    pub apic_enabled: bool,
    pub irq_queue: IrqQueue,
    /// Bytes the guest pushed out COM1; drained by tests and the CLI.
    pub serial_out: Vec<u8>,
    port92: u8,
    port61: u8,
}

impl DeviceSet {
    pub fn new(apic_enabled: bool) -> Self {
        let irq_queue = IrqQueue::default();
        let mut kbc = I8042Controller::new();
        kbc.set_irq_sink(Box::new(irq_queue.clone()));
        Self {
            pic: DualPic::new(),
            pit: Pit8254::new(),
            cmos: Cmos::default(),
            kbc,
            lapic: LocalApic::new(),
            ioapic: IoApic::new(),
            apic_enabled,
            irq_queue,
            serial_out: Vec::new(),
            port92: 0x02,
            port61: 0,
        }
    }

    /// A20 line as seen by the chipset: either fast gate bit or KBC output
    /// port.
    pub fn a20_enabled(&self) -> bool {
        self.port92 & 0x02 != 0 && self.kbc.a20_enabled()
    }

    pub fn set_a20(&mut self, enabled: bool) {
        if enabled {
            self.port92 |= 0x02;
        } else {
            self.port92 &= !0x02;
        }
        self.kbc.set_a20(enabled);
    }
}

pub struct SystemBus {
    pub mem: machina_mem::MemoryBus,
    pub devices: DeviceSet,
}

impl SystemBus {
    pub fn new(mem: machina_mem::MemoryBus, devices: DeviceSet) -> Self {
        Self { mem, devices }
    }

    fn apic_window(&self, paddr: u64) -> Option<(bool, u64)> {
        if !self.devices.apic_enabled {
            return None;
        }
        if (LAPIC_BASE..LAPIC_BASE + APIC_WINDOW).contains(&paddr) {
            return Some((true, paddr - LAPIC_BASE));
        }
        if (IOAPIC_BASE..IOAPIC_BASE + APIC_WINDOW).contains(&paddr) {
            return Some((false, paddr - IOAPIC_BASE));
        }
        None
    }

    fn apic_read_u32(&mut self, local: bool, offset: u64) -> u32 {
        if local {
            self.devices.lapic.mmio_read(offset)
        } else {
            self.devices.ioapic.mmio_read(offset)
        }
    }

    fn apic_write_u32(&mut self, local: bool, offset: u64, value: u32) {
        if local {
            self.devices.lapic.mmio_write(offset, value);
        } else {
            self.devices.ioapic.mmio_write(offset, value);
        }
    }
}

impl machina_mmu::MemoryBus for SystemBus {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        if let Some((local, offset)) = self.apic_window(paddr) {
            let word = self.apic_read_u32(local, offset & !0x3);
            return (word >> ((offset & 0x3) * 8)) as u8;
        }
        self.mem.read_u8(paddr)
    }

    fn read_u16(&mut self, paddr: u64) -> u16 {
        if let Some((local, offset)) = self.apic_window(paddr) {
            let word = self.apic_read_u32(local, offset & !0x3);
            return (word >> ((offset & 0x2) * 8)) as u16;
        }
        self.mem.read_u16(paddr)
    }

    fn read_u32(&mut self, paddr: u64) -> u32 {
        if let Some((local, offset)) = self.apic_window(paddr) {
            return self.apic_read_u32(local, offset & !0x3);
        }
        self.mem.read_u32(paddr)
    }

    fn read_u64(&mut self, paddr: u64) -> u64 {
        if self.apic_window(paddr).is_some() {
            let lo = u64::from(self.read_u32(paddr));
            let hi = u64::from(self.read_u32(paddr + 4));
            return lo | hi << 32;
        }
        self.mem.read_u64(paddr)
    }

    fn write_u8(&mut self, paddr: u64, value: u8) {
        if let Some((local, offset)) = self.apic_window(paddr) {
            // Sub-word APIC writes are rare; widen to the register.
            let mut word = self.apic_read_u32(local, offset & !0x3);
            let shift = (offset & 0x3) * 8;
            word = word & !(0xFF << shift) | u32::from(value) << shift;
            self.apic_write_u32(local, offset & !0x3, word);
            return;
        }
        self.mem.write_u8(paddr, value);
    }

    fn write_u16(&mut self, paddr: u64, value: u16) {
        if let Some((local, offset)) = self.apic_window(paddr) {
            let mut word = self.apic_read_u32(local, offset & !0x3);
            let shift = (offset & 0x2) * 8;
            word = word & !(0xFFFF << shift) | u32::from(value) << shift;
            self.apic_write_u32(local, offset & !0x3, word);
            return;
        }
        self.mem.write_u16(paddr, value);
    }

    fn write_u32(&mut self, paddr: u64, value: u32) {
        if let Some((local, offset)) = self.apic_window(paddr) {
            self.apic_write_u32(local, offset & !0x3, value);
            return;
        }
        self.mem.write_u32(paddr, value);
    }

    fn write_u64(&mut self, paddr: u64, value: u64) {
        if self.apic_window(paddr).is_some() {
            self.write_u32(paddr, value as u32);
            self.write_u32(paddr + 4, (value >> 32) as u32);
            return;
        }
        self.mem.write_u64(paddr, value);
    }

    fn io_read(&mut self, port: u16, size: u8) -> u32 {
        let devices = &mut self.devices;
        let byte = match port {
            0x20 | 0x21 | 0xA0 | 0xA1 => devices.pic.io_read(port),
            0x40..=0x43 => devices.pit.io_read(port),
            0x60 | 0x64 => devices.kbc.read_port(port),
            0x61 => devices.port61,
            0x70 | 0x71 => devices.cmos.io_read(port),
            0x92 => devices.port92,
            p if p == COM1_BASE + 5 => 0x60, // LSR: transmitter idle
            p if (COM1_BASE..COM1_BASE + 8).contains(&p) => 0x00,
            _ => return open_bus(size),
        };
        // Wide reads of byte-wide legacy ports float the upper lanes.
        u32::from(byte) | open_bus(size) & !0xFF
    }

    fn io_write(&mut self, port: u16, _size: u8, value: u32) {
        let devices = &mut self.devices;
        let byte = value as u8;
        match port {
            0x20 | 0x21 | 0xA0 | 0xA1 => devices.pic.io_write(port, byte),
            0x40..=0x43 => devices.pit.io_write(port, byte),
            0x60 | 0x64 => devices.kbc.write_port(port, byte),
            0x61 => {
                devices.port61 = byte;
                devices.pit.set_gate2(byte & 0x01 != 0);
            }
            0x70 | 0x71 => devices.cmos.io_write(port, byte),
            0x92 => {
                devices.port92 = byte & !0x01; // bit 0 (fast reset) self-clears
                devices.kbc.set_a20(byte & 0x02 != 0);
            }
            p if p == COM1_BASE => devices.serial_out.push(byte),
            0x80 => {} // POST diagnostic port
            _ => {}
        }
    }
}

fn open_bus(size: u8) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}
