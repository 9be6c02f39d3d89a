//! BIOS interrupt services (INT 10h/13h/15h/16h) emulated at contract level
//! above guest memory, the boot medium and the keyboard queue.
//!
//! The services run against capability traits ([`firmware::Memory`],
//! [`firmware::BlockDevice`], [`firmware::Keyboard`]) so they can be tested
//! with plain vectors and wired to the machine's bus alike.

mod cpu;
pub mod firmware;
mod int10;
mod int13;
mod int15;
mod int16;
pub mod types;

pub use cpu::RealModeCpu;

use firmware::{BlockDevice, Keyboard, Memory, VbeServices};

/// Boot-time configuration of the firmware.
#[derive(Debug, Clone)]
pub struct BiosConfig {
    /// Installed RAM in bytes, reported through INT 15h.
    pub memory_size: u64,
    /// Default boot drive passed to the boot sector in DL.
    pub boot_drive: u8,
}

impl Default for BiosConfig {
    fn default() -> Self {
        Self {
            memory_size: 16 * 1024 * 1024,
            boot_drive: 0x80,
        }
    }
}

/// El Torito boot metadata cached at POST for INT 13h AH=4Bh.
#[derive(Debug, Clone, Copy)]
pub struct ElToritoStatus {
    pub drive: u8,
    pub media_type: u8,
    pub boot_image_lba: u32,
    pub boot_catalog_lba: u32,
    pub load_segment: u16,
    pub sector_count: u16,
}

pub struct Bios {
    pub(crate) config: BiosConfig,
    pub(crate) vbe: Option<Box<dyn VbeServices>>,
    pub(crate) last_disk_status: u8,
    pub(crate) eltorito: Option<ElToritoStatus>,
    /// A20 state as toggled through INT 15h; the machine mirrors this into
    /// the address gate after each service call.
    pub a20_enabled: bool,
}

impl Bios {
    pub fn new(config: BiosConfig) -> Self {
        Self {
            config,
            vbe: None,
            last_disk_status: 0,
            eltorito: None,
            a20_enabled: true,
        }
    }

    pub fn config(&self) -> &BiosConfig {
        &self.config
    }

    pub fn set_vbe_handler(&mut self, vbe: Box<dyn VbeServices>) {
        self.vbe = Some(vbe);
    }

    pub fn set_eltorito_status(&mut self, status: ElToritoStatus) {
        self.eltorito = Some(status);
    }

    /// Seeds the BIOS data area: equipment word, conventional memory size,
    /// and 80x25 text mode state.
    pub fn post(&mut self, mem: &mut dyn Memory) {
        use types::*;
        // Equipment: video type 80x25 color, one diskette drive.
        mem.write_u16(BDA_EQUIPMENT, 0x0021);
        mem.write_u16(BDA_MEMORY_KB, 640);
        mem.write_u8(BDA_VIDEO_MODE, 0x03);
        mem.write_u16(BDA_TEXT_COLUMNS, 80);
        mem.write_u16(BDA_VIDEO_PAGE_SIZE, 0x1000);
        mem.write_u8(BDA_TEXT_ROWS_MINUS_ONE, 24);
        mem.write_u16(BDA_CURSOR_SHAPE, 0x0607);
        for page in 0..8u32 {
            mem.write_u16(BDA_CURSOR_POS + page * 2, 0);
        }
    }

    /// Dispatches a software interrupt to the matching service.
    pub fn handle_interrupt(
        &mut self,
        vector: u8,
        cpu: &mut RealModeCpu,
        mem: &mut dyn Memory,
        disk: &mut dyn BlockDevice,
        kbd: &mut dyn Keyboard,
    ) {
        match vector {
            0x10 => int10::handle(self, cpu, mem),
            0x13 => int13::handle(self, cpu, mem, disk),
            0x15 => int15::handle(self, cpu, mem),
            0x16 => int16::handle(cpu, kbd),
            0x11 => {
                // Equipment list.
                cpu.set_ax(mem.read_u16(types::BDA_EQUIPMENT));
            }
            0x12 => {
                // Conventional memory size in KiB.
                cpu.set_ax(mem.read_u16(types::BDA_MEMORY_KB));
            }
            0x1A => {
                // Time of day: ticks since midnight; a fixed value keeps
                // guests deterministic.
                match cpu.ah() {
                    0x00 => {
                        cpu.set_cx(0);
                        cpu.set_dx(0);
                        cpu.set_al(0);
                    }
                    _ => cpu.set_cf(false),
                }
            }
            other => {
                tracing::debug!(vector = other, "unhandled BIOS interrupt");
                cpu.set_cf(true);
            }
        }
    }
}
