//! INT 10h video services over the VGA text and graphics windows.

use crate::firmware::Memory;
use crate::types::*;
use crate::{Bios, RealModeCpu};

const TEXT_COLS: u32 = 80;
const TEXT_ROWS: u32 = 25;
const BLANK_CELL_CHAR: u8 = b' ';
const DEFAULT_ATTR: u8 = 0x07;

pub(crate) fn handle(bios: &mut Bios, cpu: &mut RealModeCpu, mem: &mut dyn Memory) {
    match cpu.ah() {
        0x00 => set_mode(cpu, mem),
        0x01 => {
            // Set cursor shape: CH start line, CL end line.
            mem.write_u16(
                BDA_CURSOR_SHAPE,
                u16::from(cpu.ch()) << 8 | u16::from(cpu.cl()),
            );
        }
        0x02 => set_cursor(mem, cpu.bh(), cpu.dh(), cpu.dl()),
        0x03 => {
            let pos = cursor(mem, cpu.bh());
            cpu.set_dh((pos >> 8) as u8);
            cpu.set_dl(pos as u8);
            let shape = mem.read_u16(BDA_CURSOR_SHAPE);
            cpu.set_ch((shape >> 8) as u8);
            cpu.set_cl(shape as u8);
        }
        0x05 => mem.write_u8(BDA_ACTIVE_PAGE, cpu.al()),
        0x06 => scroll(mem, cpu, true),
        0x07 => scroll(mem, cpu, false),
        0x08 => {
            let pos = cursor(mem, cpu.bh());
            let addr = cell_addr(pos >> 8, pos & 0xFF);
            cpu.set_al(mem.read_u8(addr));
            cpu.set_ah(mem.read_u8(addr + 1));
        }
        0x09 | 0x0A => {
            // Write char (and attribute for 09) CX times; cursor stays put.
            let with_attr = cpu.ah() == 0x09;
            let pos = cursor(mem, cpu.bh());
            let mut addr = cell_addr(pos >> 8, pos & 0xFF);
            for _ in 0..cpu.cx() {
                mem.write_u8(addr, cpu.al());
                if with_attr {
                    mem.write_u8(addr + 1, cpu.bl());
                }
                addr += 2;
            }
        }
        0x0E => teletype(mem, cpu.al(), cpu.bh()),
        0x0F => {
            cpu.set_al(mem.read_u8(BDA_VIDEO_MODE));
            cpu.set_ah(mem.read_u8(BDA_TEXT_COLUMNS));
            cpu.set_bh(mem.read_u8(BDA_ACTIVE_PAGE));
        }
        0x13 => write_string(cpu, mem),
        0x4F => match bios.vbe.take() {
            Some(mut vbe) => {
                vbe.handle_int10(cpu, mem);
                bios.vbe = Some(vbe);
            }
            None => {
                // VBE function supported marker with a failure status.
                cpu.set_ax(0x024F);
                cpu.set_cf(true);
            }
        },
        other => {
            tracing::debug!(function = other, "unhandled INT 10h function");
        }
    }
}

fn set_mode(cpu: &mut RealModeCpu, mem: &mut dyn Memory) {
    let mode = cpu.al() & 0x7F;
    let no_clear = cpu.al() & 0x80 != 0;
    mem.write_u8(BDA_VIDEO_MODE, mode);
    mem.write_u8(BDA_ACTIVE_PAGE, 0);
    mem.write_u16(BDA_VIDEO_PAGE_START, 0);
    mem.write_u8(BDA_TEXT_ROWS_MINUS_ONE, (TEXT_ROWS - 1) as u8);
    for page in 0..8u32 {
        mem.write_u16(BDA_CURSOR_POS + page * 2, 0);
    }

    match mode {
        0x13 => {
            mem.write_u16(BDA_TEXT_COLUMNS, 40);
            mem.write_u16(BDA_VIDEO_PAGE_SIZE, 0xFA00);
            if !no_clear {
                for offset in 0..320 * 200u32 {
                    mem.write_u8(VGA_GRAPHICS_BASE + offset, 0);
                }
            }
        }
        _ => {
            // Text modes; only 80x25 geometry is modeled.
            mem.write_u16(BDA_TEXT_COLUMNS, TEXT_COLS as u16);
            mem.write_u16(BDA_VIDEO_PAGE_SIZE, 0x1000);
            if !no_clear {
                for cell in 0..TEXT_COLS * TEXT_ROWS {
                    mem.write_u8(VGA_TEXT_BASE + cell * 2, BLANK_CELL_CHAR);
                    mem.write_u8(VGA_TEXT_BASE + cell * 2 + 1, DEFAULT_ATTR);
                }
            }
        }
    }
}

fn cursor(mem: &dyn Memory, page: u8) -> u16 {
    mem.read_u16(BDA_CURSOR_POS + u32::from(page & 0x7) * 2)
}

fn set_cursor(mem: &mut dyn Memory, page: u8, row: u8, col: u8) {
    mem.write_u16(
        BDA_CURSOR_POS + u32::from(page & 0x7) * 2,
        u16::from(row) << 8 | u16::from(col),
    );
}

fn cell_addr(row: u16, col: u16) -> u32 {
    VGA_TEXT_BASE + (u32::from(row) * TEXT_COLS + u32::from(col)) * 2
}

fn scroll_up_one(mem: &mut dyn Memory) {
    for row in 1..TEXT_ROWS {
        for col in 0..TEXT_COLS {
            let src = VGA_TEXT_BASE + (row * TEXT_COLS + col) * 2;
            let dst = VGA_TEXT_BASE + ((row - 1) * TEXT_COLS + col) * 2;
            let ch = mem.read_u8(src);
            let attr = mem.read_u8(src + 1);
            mem.write_u8(dst, ch);
            mem.write_u8(dst + 1, attr);
        }
    }
    for col in 0..TEXT_COLS {
        let addr = VGA_TEXT_BASE + ((TEXT_ROWS - 1) * TEXT_COLS + col) * 2;
        mem.write_u8(addr, BLANK_CELL_CHAR);
        mem.write_u8(addr + 1, DEFAULT_ATTR);
    }
}

fn teletype(mem: &mut dyn Memory, ch: u8, page: u8) {
    let pos = cursor(mem, page);
    let mut row = pos >> 8;
    let mut col = pos & 0xFF;

    match ch {
        b'\r' => col = 0,
        b'\n' => row += 1,
        0x08 => col = col.saturating_sub(1),
        0x07 => {} // bell
        _ => {
            // Character byte only; the existing attribute is preserved.
            mem.write_u8(cell_addr(row, col), ch);
            col += 1;
            if col >= TEXT_COLS as u16 {
                col = 0;
                row += 1;
            }
        }
    }

    if row >= TEXT_ROWS as u16 {
        scroll_up_one(mem);
        row = TEXT_ROWS as u16 - 1;
    }
    set_cursor(mem, page, row as u8, col as u8);
}

fn scroll(mem: &mut dyn Memory, cpu: &RealModeCpu, up: bool) {
    let lines = u32::from(cpu.al());
    let attr = cpu.bh();
    let top = u32::from(cpu.ch());
    let left = u32::from(cpu.cl());
    let bottom = u32::from(cpu.dh()).min(TEXT_ROWS - 1);
    let right = u32::from(cpu.dl()).min(TEXT_COLS - 1);
    if top > bottom || left > right {
        return;
    }

    let height = bottom - top + 1;
    let blank = |mem: &mut dyn Memory, row: u32| {
        for col in left..=right {
            let addr = VGA_TEXT_BASE + (row * TEXT_COLS + col) * 2;
            mem.write_u8(addr, BLANK_CELL_CHAR);
            mem.write_u8(addr + 1, attr);
        }
    };

    if lines == 0 || lines >= height {
        for row in top..=bottom {
            blank(mem, row);
        }
        return;
    }

    let copy_row = |mem: &mut dyn Memory, dst: u32, src: u32| {
        for col in left..=right {
            let from = VGA_TEXT_BASE + (src * TEXT_COLS + col) * 2;
            let to = VGA_TEXT_BASE + (dst * TEXT_COLS + col) * 2;
            let ch = mem.read_u8(from);
            let at = mem.read_u8(from + 1);
            mem.write_u8(to, ch);
            mem.write_u8(to + 1, at);
        }
    };

    if up {
        for row in top..=bottom - lines {
            copy_row(mem, row, row + lines);
        }
        for row in bottom - lines + 1..=bottom {
            blank(mem, row);
        }
    } else {
        for row in (top + lines..=bottom).rev() {
            copy_row(mem, row, row - lines);
        }
        for row in top..top + lines {
            blank(mem, row);
        }
    }
}

fn write_string(cpu: &mut RealModeCpu, mem: &mut dyn Memory) {
    let mode = cpu.al();
    let with_attrs = mode & 0x02 != 0;
    let move_cursor = mode & 0x01 != 0;
    let page = cpu.bh();
    let count = u32::from(cpu.cx());
    let mut addr = RealModeCpu::linear(cpu.es, cpu.bp() as u16);

    let saved = cursor(mem, page);
    set_cursor(mem, page, cpu.dh(), cpu.dl());

    for _ in 0..count {
        let ch = mem.read_u8(addr);
        addr += 1;
        let attr = if with_attrs {
            let a = mem.read_u8(addr);
            addr += 1;
            a
        } else {
            cpu.bl()
        };
        let pos = cursor(mem, page);
        if !matches!(ch, b'\r' | b'\n' | 0x07 | 0x08) {
            mem.write_u8(cell_addr(pos >> 8, pos & 0xFF) + 1, attr);
        }
        teletype(mem, ch, page);
    }

    if !move_cursor {
        mem.write_u16(BDA_CURSOR_POS + u32::from(page & 0x7) * 2, saved);
    }
}
