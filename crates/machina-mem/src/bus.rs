use std::ops::Range;
use std::sync::Arc;

use crate::{MemoryBusError, PhysicalMemory};

/// A memory-mapped device window.
///
/// Handlers take `&self`; devices with mutable state wrap it in interior
/// mutability so the bus itself stays shareable.
pub trait MmioHandler: Send + Sync {
    fn read(&self, offset: u64, data: &mut [u8]);
    fn write(&self, offset: u64, data: &[u8]);
}

struct FnMmio<R, W> {
    read: R,
    write: W,
}

impl<R, W> MmioHandler for FnMmio<R, W>
where
    R: Fn(u64, &mut [u8]) + Send + Sync,
    W: Fn(u64, &[u8]) + Send + Sync,
{
    fn read(&self, offset: u64, data: &mut [u8]) {
        (self.read)(offset, data)
    }

    fn write(&self, offset: u64, data: &[u8]) {
        (self.write)(offset, data)
    }
}

/// Observer invoked synchronously after every guest store to a watched byte.
///
/// Observers mutate only their own captured state; they receive the previous
/// and new byte values so a watcher can report transitions without re-reading
/// the bus.
pub trait WriteObserver: Send {
    fn watches(&self, addr: u64) -> bool;
    fn on_write(&mut self, addr: u64, prev: u8, next: u8);
}

enum Mapping {
    Mmio { range: Range<u64>, handler: Arc<dyn MmioHandler> },
    Rom { start: u64, data: Arc<[u8]> },
    OpenBus { range: Range<u64> },
}

impl Mapping {
    fn range(&self) -> Range<u64> {
        match self {
            Mapping::Mmio { range, .. } => range.clone(),
            Mapping::Rom { start, data } => *start..*start + data.len() as u64,
            Mapping::OpenBus { range } => range.clone(),
        }
    }
}

/// Physical address router: RAM backing store with MMIO windows, ROM shadows
/// and open-bus holes layered on top.
///
/// Routing is per byte: a multi-byte access that straddles a window edge is
/// decomposed so each byte reaches the mapping that owns it. Addresses beyond
/// RAM with no mapping read as zero and swallow writes, which is what legacy
/// guests probing for memory expect.
pub struct MemoryBus {
    ram: Arc<PhysicalMemory>,
    mappings: Vec<Mapping>,
    observers: Vec<Box<dyn WriteObserver>>,
}

impl MemoryBus {
    pub fn new(ram: Arc<PhysicalMemory>) -> Self {
        Self {
            ram,
            mappings: Vec::new(),
            observers: Vec::new(),
        }
    }

    pub fn ram(&self) -> &Arc<PhysicalMemory> {
        &self.ram
    }

    fn check_range(&self, range: &Range<u64>) -> Result<(), MemoryBusError> {
        if range.start >= range.end {
            return Err(MemoryBusError::InvalidRange {
                start: range.start,
                end: range.end,
            });
        }
        for existing in &self.mappings {
            let e = existing.range();
            if range.start < e.end && e.start < range.end {
                return Err(MemoryBusError::Overlap {
                    start: range.start,
                    end: range.end,
                });
            }
        }
        Ok(())
    }

    pub fn register_mmio(
        &mut self,
        range: Range<u64>,
        handler: Arc<dyn MmioHandler>,
    ) -> Result<(), MemoryBusError> {
        self.check_range(&range)?;
        self.mappings.push(Mapping::Mmio { range, handler });
        Ok(())
    }

    pub fn register_mmio_fn<R, W>(
        &mut self,
        range: Range<u64>,
        read: R,
        write: W,
    ) -> Result<(), MemoryBusError>
    where
        R: Fn(u64, &mut [u8]) + Send + Sync + 'static,
        W: Fn(u64, &[u8]) + Send + Sync + 'static,
    {
        self.register_mmio(range, Arc::new(FnMmio { read, write }))
    }

    pub fn register_rom(&mut self, start: u64, data: Arc<[u8]>) -> Result<(), MemoryBusError> {
        let range = start..start + data.len() as u64;
        self.check_range(&range)?;
        self.mappings.push(Mapping::Rom { start, data });
        Ok(())
    }

    /// Marks a hole that reads as `0xFF` and drops writes, like a floating ISA
    /// bus.
    pub fn register_open_bus(&mut self, range: Range<u64>) -> Result<(), MemoryBusError> {
        self.check_range(&range)?;
        self.mappings.push(Mapping::OpenBus { range });
        Ok(())
    }

    pub fn add_observer(&mut self, observer: Box<dyn WriteObserver>) {
        self.observers.push(observer);
    }

    fn mapping_at(&self, addr: u64) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.range().contains(&addr))
    }

    /// Length of the run starting at `addr` that stays within the same
    /// mapping (or within unmapped RAM), capped at `max`.
    fn run_len(&self, addr: u64, max: usize) -> usize {
        let mut len = max as u64;
        match self.mapping_at(addr) {
            Some(m) => len = len.min(m.range().end - addr),
            None => {
                for m in &self.mappings {
                    let r = m.range();
                    if r.start > addr {
                        len = len.min(r.start - addr);
                    }
                }
            }
        }
        len as usize
    }

    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) {
        let mut pos = addr;
        let mut remaining = buf;
        while !remaining.is_empty() {
            let run = self.run_len(pos, remaining.len()).max(1);
            let (head, tail) = remaining.split_at_mut(run);
            match self.mapping_at(pos) {
                Some(Mapping::Mmio { range, handler }) => handler.read(pos - range.start, head),
                Some(Mapping::Rom { start, data }) => {
                    let off = (pos - start) as usize;
                    head.copy_from_slice(&data[off..off + run]);
                }
                Some(Mapping::OpenBus { .. }) => head.fill(0xFF),
                None => self.ram.read_bytes(pos, head),
            }
            remaining = tail;
            pos += run as u64;
        }
    }

    pub fn write_bytes(&mut self, addr: u64, buf: &[u8]) {
        let mut pos = addr;
        let mut remaining = buf;
        while !remaining.is_empty() {
            let run = self.run_len(pos, remaining.len()).max(1);
            let (head, tail) = remaining.split_at(run);
            match self.mapping_at(pos) {
                Some(Mapping::Mmio { range, handler }) => handler.write(pos - range.start, head),
                Some(Mapping::Rom { .. }) | Some(Mapping::OpenBus { .. }) => {}
                None => {
                    self.notify_observers(pos, head);
                    self.ram.write_bytes(pos, head);
                }
            }
            remaining = tail;
            pos += run as u64;
        }
    }

    fn notify_observers(&mut self, addr: u64, data: &[u8]) {
        if self.observers.is_empty() {
            return;
        }
        for (i, &next) in data.iter().enumerate() {
            let byte_addr = addr + i as u64;
            // Observers are rare and narrow; probe membership before paying
            // for the previous-value read.
            if !self.observers.iter().any(|o| o.watches(byte_addr)) {
                continue;
            }
            let prev = self.ram.read_u8(byte_addr);
            for obs in self.observers.iter_mut() {
                if obs.watches(byte_addr) {
                    obs.on_write(byte_addr, prev, next);
                }
            }
        }
    }

    pub fn read_u8(&self, addr: u64) -> u8 {
        let mut buf = [0u8; 1];
        self.read_bytes(addr, &mut buf);
        buf[0]
    }

    pub fn read_u16(&self, addr: u64) -> u16 {
        let mut buf = [0u8; 2];
        self.read_bytes(addr, &mut buf);
        u16::from_le_bytes(buf)
    }

    pub fn read_u32(&self, addr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf);
        u32::from_le_bytes(buf)
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_bytes(addr, &mut buf);
        u64::from_le_bytes(buf)
    }

    pub fn write_u8(&mut self, addr: u64, value: u8) {
        self.write_bytes(addr, &[value]);
    }

    pub fn write_u16(&mut self, addr: u64, value: u16) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) {
        self.write_bytes(addr, &value.to_le_bytes());
    }
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBus")
            .field("ram", &self.ram)
            .field("mappings", &self.mappings.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}
