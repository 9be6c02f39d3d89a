//! Linear-address bus consumed by the interpreter, and the paging adapter
//! that backs it with a physical [`machina_mmu::MemoryBus`].

use machina_mmu::{translate, Access, PagingConfig, TranslateError};

use crate::state::{
    CpuState, CR0_PG, CR0_WP, CR4_PAE, CR4_PSE, EFER_LMA, EFER_NXE,
};
use crate::Exception;

/// CPU-visible memory: linear addresses, faults as values.
///
/// Port I/O rides along so the interpreter can execute IN/OUT against the
/// same object; the default implementation floats the bus.
pub trait CpuBus {
    fn read_u8(&mut self, addr: u64) -> Result<u8, Exception>;
    fn read_u16(&mut self, addr: u64) -> Result<u16, Exception>;
    fn read_u32(&mut self, addr: u64) -> Result<u32, Exception>;
    fn read_u64(&mut self, addr: u64) -> Result<u64, Exception>;
    fn write_u8(&mut self, addr: u64, value: u8) -> Result<(), Exception>;
    fn write_u16(&mut self, addr: u64, value: u16) -> Result<(), Exception>;
    fn write_u32(&mut self, addr: u64, value: u32) -> Result<(), Exception>;
    fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), Exception>;

    /// Instruction fetch; distinguished so page faults carry the I/D bit.
    fn fetch_u8(&mut self, addr: u64) -> Result<u8, Exception> {
        self.read_u8(addr)
    }

    /// Refreshes any cached translation state from the CPU.
    fn sync(&mut self, _state: &CpuState) {}

    fn io_read(&mut self, _port: u16, size: u8) -> u32 {
        match size {
            1 => 0xFF,
            2 => 0xFFFF,
            _ => 0xFFFF_FFFF,
        }
    }

    fn io_write(&mut self, _port: u16, _size: u8, _value: u32) {}
}

/// Flat test memory: identity-mapped, never faults, open-bus I/O.
#[derive(Clone, Debug)]
pub struct FlatTestBus {
    data: Vec<u8>,
}

impl FlatTestBus {
    pub fn new(size: usize) -> Self {
        Self { data: vec![0; size] }
    }

    pub fn load(&mut self, addr: u64, bytes: &[u8]) {
        let start = addr as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn get(&self, addr: u64) -> u8 {
        self.data.get(addr as usize).copied().unwrap_or(0)
    }

    fn put(&mut self, addr: u64, value: u8) {
        if let Some(slot) = self.data.get_mut(addr as usize) {
            *slot = value;
        }
    }
}

impl CpuBus for FlatTestBus {
    fn read_u8(&mut self, addr: u64) -> Result<u8, Exception> {
        Ok(self.get(addr))
    }

    fn read_u16(&mut self, addr: u64) -> Result<u16, Exception> {
        Ok(u16::from(self.get(addr)) | u16::from(self.get(addr + 1)) << 8)
    }

    fn read_u32(&mut self, addr: u64) -> Result<u32, Exception> {
        let mut v = 0u32;
        for i in (0..4).rev() {
            v = v << 8 | u32::from(self.get(addr + i));
        }
        Ok(v)
    }

    fn read_u64(&mut self, addr: u64) -> Result<u64, Exception> {
        let mut v = 0u64;
        for i in (0..8).rev() {
            v = v << 8 | u64::from(self.get(addr + i));
        }
        Ok(v)
    }

    fn write_u8(&mut self, addr: u64, value: u8) -> Result<(), Exception> {
        self.put(addr, value);
        Ok(())
    }

    fn write_u16(&mut self, addr: u64, value: u16) -> Result<(), Exception> {
        for (i, b) in value.to_le_bytes().iter().enumerate() {
            self.put(addr + i as u64, *b);
        }
        Ok(())
    }

    fn write_u32(&mut self, addr: u64, value: u32) -> Result<(), Exception> {
        for (i, b) in value.to_le_bytes().iter().enumerate() {
            self.put(addr + i as u64, *b);
        }
        Ok(())
    }

    fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), Exception> {
        for (i, b) in value.to_le_bytes().iter().enumerate() {
            self.put(addr + i as u64, *b);
        }
        Ok(())
    }
}

fn map_translate_error(err: TranslateError) -> Exception {
    match err {
        TranslateError::PageFault(pf) => Exception::PageFault {
            addr: pf.linear,
            error_code: pf.error_code,
        },
        TranslateError::NonCanonical => Exception::gp0(),
    }
}

/// Adapts a physical-address bus into the CPU's linear-address view by
/// running every access through the page walker.
///
/// Call [`PagingBus::sync`] after mutating CR0/CR3/CR4/EFER (the interpreter
/// does this at every instruction boundary) so the cached [`PagingConfig`]
/// matches the architectural state.
#[derive(Debug)]
pub struct PagingBus<B> {
    inner: B,
    cfg: PagingConfig,
    user: bool,
}

impl<B: machina_mmu::MemoryBus> PagingBus<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            cfg: PagingConfig { a20_enabled: true, ..Default::default() },
            user: false,
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut B {
        &mut self.inner
    }

    pub fn into_inner(self) -> B {
        self.inner
    }

    pub fn sync(&mut self, state: &CpuState) {
        self.cfg = PagingConfig {
            paging: state.control.cr0 & CR0_PG != 0,
            pse: state.control.cr4 & CR4_PSE != 0,
            pae: state.control.cr4 & CR4_PAE != 0,
            long: state.msr.efer & EFER_LMA != 0,
            write_protect: state.control.cr0 & CR0_WP != 0,
            nx_enable: state.msr.efer & EFER_NXE != 0,
            cr3: state.control.cr3,
            a20_enabled: state.a20_enabled,
        };
        self.user = state.cpl() == 3;
    }

    fn access(&self, write: bool, fetch: bool) -> Access {
        Access { write, user: self.user, fetch }
    }

    fn translate_one(&mut self, addr: u64, access: Access) -> Result<u64, Exception> {
        translate(&self.cfg, &mut self.inner, addr, access).map_err(map_translate_error)
    }

    fn read_n(&mut self, addr: u64, buf: &mut [u8], fetch: bool) -> Result<(), Exception> {
        let len = buf.len() as u64;
        // Fast path: access confined to a single page.
        if (addr & 0xFFF) + len <= 0x1000 {
            let phys = self.translate_one(addr, self.access(false, fetch))?;
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = self.inner.read_u8(phys + i as u64);
            }
            return Ok(());
        }
        // Page-straddling accesses translate per byte so the fault address
        // lands on the exact straddling byte.
        for (i, slot) in buf.iter_mut().enumerate() {
            let phys = self.translate_one(addr + i as u64, self.access(false, fetch))?;
            *slot = self.inner.read_u8(phys);
        }
        Ok(())
    }

    fn write_n(&mut self, addr: u64, bytes: &[u8]) -> Result<(), Exception> {
        let len = bytes.len() as u64;
        if (addr & 0xFFF) + len <= 0x1000 {
            let phys = self.translate_one(addr, self.access(true, false))?;
            for (i, b) in bytes.iter().enumerate() {
                self.inner.write_u8(phys + i as u64, *b);
            }
            return Ok(());
        }
        // Probe both pages before writing anything so a faulting straddle
        // does not perform a partial store.
        for i in 0..len {
            self.translate_one(addr + i, self.access(true, false))?;
        }
        for (i, b) in bytes.iter().enumerate() {
            let phys = self.translate_one(addr + i as u64, self.access(true, false))?;
            self.inner.write_u8(phys, *b);
        }
        Ok(())
    }
}

impl<B: machina_mmu::MemoryBus> CpuBus for PagingBus<B> {
    fn read_u8(&mut self, addr: u64) -> Result<u8, Exception> {
        let phys = self.translate_one(addr, self.access(false, false))?;
        Ok(self.inner.read_u8(phys))
    }

    fn read_u16(&mut self, addr: u64) -> Result<u16, Exception> {
        let mut buf = [0u8; 2];
        self.read_n(addr, &mut buf, false)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&mut self, addr: u64) -> Result<u32, Exception> {
        let mut buf = [0u8; 4];
        self.read_n(addr, &mut buf, false)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&mut self, addr: u64) -> Result<u64, Exception> {
        let mut buf = [0u8; 8];
        self.read_n(addr, &mut buf, false)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u8(&mut self, addr: u64, value: u8) -> Result<(), Exception> {
        self.write_n(addr, &[value])
    }

    fn write_u16(&mut self, addr: u64, value: u16) -> Result<(), Exception> {
        self.write_n(addr, &value.to_le_bytes())
    }

    fn write_u32(&mut self, addr: u64, value: u32) -> Result<(), Exception> {
        self.write_n(addr, &value.to_le_bytes())
    }

    fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), Exception> {
        self.write_n(addr, &value.to_le_bytes())
    }

    fn fetch_u8(&mut self, addr: u64) -> Result<u8, Exception> {
        let phys = self.translate_one(addr, self.access(false, true))?;
        Ok(self.inner.read_u8(phys))
    }

    fn sync(&mut self, state: &CpuState) {
        PagingBus::sync(self, state)
    }

    fn io_read(&mut self, port: u16, size: u8) -> u32 {
        self.inner.io_read(port, size)
    }

    fn io_write(&mut self, port: u16, size: u8, value: u32) {
        self.inner.io_write(port, size, value)
    }
}
