//! INT 15h system services: A20 gate control, the E820 memory map, and the
//! protected-mode block move.

use crate::firmware::Memory;
use crate::types::{E820_TYPE_RAM, E820_TYPE_RESERVED, SMAP_SIGNATURE};
use crate::{Bios, RealModeCpu};

pub(crate) fn handle(bios: &mut Bios, cpu: &mut RealModeCpu, mem: &mut dyn Memory) {
    match cpu.ax() {
        // A20 gate control.
        0x2400 => {
            bios.a20_enabled = false;
            cpu.set_ah(0);
            cpu.set_cf(false);
            return;
        }
        0x2401 => {
            bios.a20_enabled = true;
            cpu.set_ah(0);
            cpu.set_cf(false);
            return;
        }
        0x2402 => {
            cpu.set_al(u8::from(bios.a20_enabled));
            cpu.set_ah(0);
            cpu.set_cf(false);
            return;
        }
        0x2403 => {
            // A20 support query: both keyboard controller and port 92h.
            cpu.set_bx(0x0003);
            cpu.set_ah(0);
            cpu.set_cf(false);
            return;
        }
        _ => {}
    }

    if cpu.eax == 0xE820 {
        e820(bios, cpu, mem);
        return;
    }

    match cpu.ah() {
        0x87 => block_move(cpu, mem),
        0x88 => {
            // Extended memory above 1 MiB, in KiB, capped at the interface's
            // 16-bit ceiling (64 MiB - 1 KiB).
            let above_1m = bios.config.memory_size.saturating_sub(0x10_0000) / 1024;
            cpu.set_ax(above_1m.min(0xFFFF) as u16);
            cpu.set_cf(false);
        }
        0xC0 => {
            // System configuration table: not provided.
            cpu.set_ah(0x86);
            cpu.set_cf(true);
        }
        other => {
            tracing::debug!(function = other, "unhandled INT 15h function");
            cpu.set_ah(0x86);
            cpu.set_cf(true);
        }
    }
}

/// Address-range descriptors reported to the guest, in ascending order.
fn memory_map(bios: &Bios) -> Vec<(u64, u64, u32)> {
    let mut map = vec![
        // Conventional memory up to the EBDA.
        (0x0000_0000, 0x0009_F000, E820_TYPE_RAM),
        // EBDA + option-ROM + BIOS window.
        (0x0009_F000, 0x0006_1000, E820_TYPE_RESERVED),
    ];
    if bios.config.memory_size > 0x0010_0000 {
        map.push((
            0x0010_0000,
            bios.config.memory_size - 0x0010_0000,
            E820_TYPE_RAM,
        ));
    }
    // APIC MMIO windows.
    map.push((0xFEC0_0000, 0x1000, E820_TYPE_RESERVED));
    map.push((0xFEE0_0000, 0x1000, E820_TYPE_RESERVED));
    map
}

fn e820(bios: &mut Bios, cpu: &mut RealModeCpu, mem: &mut dyn Memory) {
    if cpu.edx != SMAP_SIGNATURE || cpu.ecx < 20 {
        cpu.set_cf(true);
        cpu.set_ah(0x86);
        return;
    }
    let map = memory_map(bios);
    let index = cpu.ebx as usize;
    let Some(&(base, length, kind)) = map.get(index) else {
        cpu.set_cf(true);
        cpu.set_ah(0x86);
        return;
    };

    let dest = RealModeCpu::linear(cpu.es, cpu.di());
    mem.write_u32(dest, base as u32);
    mem.write_u32(dest + 4, (base >> 32) as u32);
    mem.write_u32(dest + 8, length as u32);
    mem.write_u32(dest + 12, (length >> 32) as u32);
    mem.write_u32(dest + 16, kind);

    cpu.eax = SMAP_SIGNATURE;
    cpu.ecx = 20;
    cpu.ebx = if index + 1 == map.len() {
        0
    } else {
        (index + 1) as u32
    };
    cpu.set_cf(false);
}

/// AH=87h: copy CX words between extended-memory regions described by a
/// caller-built GDT at ES:SI (descriptors 2 and 3 are source/destination).
fn block_move(cpu: &mut RealModeCpu, mem: &mut dyn Memory) {
    let table = RealModeCpu::linear(cpu.es, cpu.si());
    let descriptor_base = |mem: &dyn Memory, index: u32| -> u32 {
        let entry = table + index * 8;
        u32::from(mem.read_u16(entry + 2))
            | u32::from(mem.read_u8(entry + 4)) << 16
            | u32::from(mem.read_u8(entry + 7)) << 24
    };

    let source = descriptor_base(mem, 2);
    let dest = descriptor_base(mem, 3);
    let bytes = u32::from(cpu.cx()) * 2;
    for i in 0..bytes {
        let byte = mem.read_u8(source + i);
        mem.write_u8(dest + i, byte);
    }
    cpu.set_ah(0);
    cpu.set_cf(false);
}
