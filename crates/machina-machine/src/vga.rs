//! Display plumbing: the VGA text-cell observer that mirrors guest VRAM
//! writes to the [`ScreenWriter`] sink, and the VBE device with its linear
//! framebuffer window.

use std::sync::{Arc, Mutex};

use machina_bios::firmware::{Memory, VbeServices};
use machina_bios::RealModeCpu;
use machina_mem::{MmioHandler, WriteObserver};

use crate::screen::{Rgb, ScreenWriter};

pub const VGA_TEXT_BASE: u64 = 0xB8000;
const TEXT_COLS: u64 = 80;
const TEXT_ROWS: u64 = 25;
const TEXT_BYTES: u64 = TEXT_COLS * TEXT_ROWS * 2;

pub const LFB_BASE: u64 = 0xE000_0000;
/// Sink flushes are coalesced to at most one per this many framebuffer
/// bytes written.
const FLUSH_GRANULARITY: u64 = 4096;

pub type SharedScreen = Arc<Mutex<Box<dyn ScreenWriter>>>;

/// Forwards text-cell writes to the screen sink as they land in VRAM.
///
/// The blink bit (attribute bit 7) is passed through; background color uses
/// only bits 4..6, matching VGA's default blink-enabled state.
pub struct VgaTextObserver {
    screen: SharedScreen,
    /// Local cell cache so attribute-only writes can replay the character.
    cells: Vec<(u8, u8)>,
}

impl VgaTextObserver {
    pub fn new(screen: SharedScreen) -> Self {
        Self {
            screen,
            cells: vec![(b' ', 0x07); (TEXT_COLS * TEXT_ROWS) as usize],
        }
    }
}

impl WriteObserver for VgaTextObserver {
    fn watches(&self, addr: u64) -> bool {
        (VGA_TEXT_BASE..VGA_TEXT_BASE + TEXT_BYTES).contains(&addr)
    }

    fn on_write(&mut self, addr: u64, _prev: u8, next: u8) {
        let offset = addr - VGA_TEXT_BASE;
        let cell_index = (offset / 2) as usize;
        let is_attr = offset % 2 == 1;
        let cell = &mut self.cells[cell_index];
        if is_attr {
            cell.1 = next;
        } else {
            cell.0 = next;
        }

        let row = (offset / 2 / TEXT_COLS) as u32;
        let col = (offset / 2 % TEXT_COLS) as u32;
        let (ch, attr) = *cell;
        let Ok(mut screen) = self.screen.lock() else {
            return;
        };
        screen.set_cursor(row, col);
        screen.write_char_at_cursor(char::from(ch), 1, Some(attr));
        screen.flush_if_needed();
    }
}

/// A VBE graphics mode exposed through INT 10h AH=4Fh.
#[derive(Debug, Clone, Copy)]
struct VbeMode {
    number: u16,
    width: u16,
    height: u16,
}

const MODES: &[VbeMode] = &[
    VbeMode { number: 0x112, width: 640, height: 480 },
    VbeMode { number: 0x115, width: 800, height: 600 },
    VbeMode { number: 0x118, width: 1024, height: 768 },
];

const BITS_PER_PIXEL: u8 = 32;

#[derive(Debug, Default)]
pub struct VbeState {
    pub current_mode: Option<u16>,
    pub width: u32,
    pub height: u32,
}

/// The linear framebuffer window. Pixel words are cached so reads return
/// what was written; aligned 32-bit stores paint through to the sink.
pub struct LfbSurface {
    state: Mutex<LfbInner>,
    screen: SharedScreen,
}

struct LfbInner {
    pixels: Vec<u32>,
    width: u32,
    bytes_since_flush: u64,
}

impl LfbSurface {
    pub fn new(screen: SharedScreen, max_pixels: usize) -> Self {
        Self {
            state: Mutex::new(LfbInner {
                pixels: vec![0; max_pixels],
                width: 1024,
                bytes_since_flush: 0,
            }),
            screen,
        }
    }

    pub fn set_geometry(&self, width: u32) {
        self.state.lock().unwrap().width = width.max(1);
    }
}

impl MmioHandler for LfbSurface {
    fn read(&self, offset: u64, data: &mut [u8]) {
        let inner = self.state.lock().unwrap();
        for (i, byte) in data.iter_mut().enumerate() {
            let off = offset + i as u64;
            let word = inner.pixels.get((off / 4) as usize).copied().unwrap_or(0);
            *byte = (word >> ((off % 4) * 8)) as u8;
        }
    }

    fn write(&self, offset: u64, data: &[u8]) {
        let mut inner = self.state.lock().unwrap();
        for (i, byte) in data.iter().enumerate() {
            let off = offset + i as u64;
            let index = (off / 4) as usize;
            if index >= inner.pixels.len() {
                continue;
            }
            let shift = (off % 4) * 8;
            let word = inner.pixels[index] & !(0xFF << shift) | u32::from(*byte) << shift;
            inner.pixels[index] = word;
            // Paint once the pixel's last byte lands (covers both aligned
            // dword stores and byte-wise fills).
            if off % 4 == 3 || i == data.len() - 1 {
                let x = index as u32 % inner.width;
                let y = index as u32 / inner.width;
                if let Ok(mut screen) = self.screen.lock() {
                    screen.dot(x, y, Rgb::from_xrgb(word));
                }
            }
        }
        inner.bytes_since_flush += data.len() as u64;
        if inner.bytes_since_flush >= FLUSH_GRANULARITY {
            inner.bytes_since_flush = 0;
            if let Ok(mut screen) = self.screen.lock() {
                screen.flush_if_needed();
            }
        }
    }
}

/// INT 10h AH=4Fh handler backed by the mode table above.
pub struct VbeDevice {
    pub state: Arc<Mutex<VbeState>>,
    pub lfb: Arc<LfbSurface>,
    screen: SharedScreen,
}

impl VbeDevice {
    pub fn new(state: Arc<Mutex<VbeState>>, lfb: Arc<LfbSurface>, screen: SharedScreen) -> Self {
        Self { state, lfb, screen }
    }

    fn mode(number: u16) -> Option<&'static VbeMode> {
        MODES.iter().find(|m| m.number == number & 0x1FF)
    }
}

const VBE_OK: u16 = 0x004F;
const VBE_FAIL: u16 = 0x014F;

impl VbeServices for VbeDevice {
    fn handle_int10(&mut self, cpu: &mut RealModeCpu, mem: &mut dyn Memory) {
        match cpu.ax() {
            // Controller information.
            0x4F00 => {
                let dest = RealModeCpu::linear(cpu.es, cpu.di());
                for (i, b) in b"VESA".iter().enumerate() {
                    mem.write_u8(dest + i as u32, *b);
                }
                mem.write_u16(dest + 4, 0x0200); // VBE 2.0
                mem.write_u32(dest + 6, 0); // OEM string (none)
                mem.write_u32(dest + 10, 0x1); // capabilities
                // Mode list follows the info block in the caller's buffer.
                let list_off = 34u32;
                mem.write_u16(dest + 14, cpu.di().wrapping_add(list_off as u16));
                mem.write_u16(dest + 16, cpu.es);
                for (i, mode) in MODES.iter().enumerate() {
                    mem.write_u16(dest + list_off + i as u32 * 2, mode.number);
                }
                mem.write_u16(dest + list_off + MODES.len() as u32 * 2, 0xFFFF);
                mem.write_u16(dest + 18, 256); // total memory in 64K blocks
                cpu.set_ax(VBE_OK);
                cpu.set_cf(false);
            }
            // Mode information.
            0x4F01 => {
                let Some(mode) = Self::mode(cpu.cx()) else {
                    cpu.set_ax(VBE_FAIL);
                    cpu.set_cf(true);
                    return;
                };
                let dest = RealModeCpu::linear(cpu.es, cpu.di());
                for i in 0..256 {
                    mem.write_u8(dest + i, 0);
                }
                // Supported | color | graphics | LFB available.
                mem.write_u16(dest, 0x009B);
                mem.write_u16(dest + 16, u16::from(BITS_PER_PIXEL / 8) * mode.width); // pitch
                mem.write_u16(dest + 18, mode.width);
                mem.write_u16(dest + 20, mode.height);
                mem.write_u8(dest + 25, BITS_PER_PIXEL);
                mem.write_u8(dest + 27, 0x06); // direct color
                mem.write_u32(dest + 40, LFB_BASE as u32);
                cpu.set_ax(VBE_OK);
                cpu.set_cf(false);
            }
            // Set mode.
            0x4F02 => {
                let request = cpu.bx();
                let Some(mode) = Self::mode(request) else {
                    cpu.set_ax(VBE_FAIL);
                    cpu.set_cf(true);
                    return;
                };
                {
                    let mut state = self.state.lock().unwrap();
                    state.current_mode = Some(mode.number);
                    state.width = u32::from(mode.width);
                    state.height = u32::from(mode.height);
                }
                self.lfb.set_geometry(u32::from(mode.width));
                if let Ok(mut screen) = self.screen.lock() {
                    screen.clear();
                }
                cpu.set_ax(VBE_OK);
                cpu.set_cf(false);
            }
            // Current mode query.
            0x4F03 => {
                let mode = self.state.lock().unwrap().current_mode.unwrap_or(0x03);
                cpu.set_bx(mode);
                cpu.set_ax(VBE_OK);
                cpu.set_cf(false);
            }
            _ => {
                cpu.set_ax(VBE_FAIL);
                cpu.set_cf(true);
            }
        }
    }
}
