//! System-level and miscellaneous instruction bodies: flags/stack images,
//! descriptor-table loads, control registers, MSRs, CPUID, I/O privilege,
//! bit-string ops and the legacy BCD adjusts.

use machina_x86::{SegReg, Width};

use crate::interp::{alu, branch, Exec, Flow};
use crate::mem::CpuBus;
use crate::segmentation::{self, read_descriptor};
use crate::state::{
    CpuMode, CR0_TS, CR4_TSD, EFER_LMA, EFER_LME, EFER_NXE, EFER_SCE, RFLAGS_AC, RFLAGS_AF,
    RFLAGS_CF, RFLAGS_DF, RFLAGS_ID, RFLAGS_IF, RFLAGS_IOPL_MASK, RFLAGS_NT, RFLAGS_OF,
    RFLAGS_PF, RFLAGS_SF, RFLAGS_TF, RFLAGS_ZF, SEG_ACCESS_DPL_SHIFT, SEG_ACCESS_EXECUTABLE,
    SEG_ACCESS_NON_SYSTEM, SEG_ACCESS_PRESENT, SEG_ACCESS_RW, SEG_FLAG_GRANULARITY,
    SEG_FLAG_LONG,
};
use crate::Exception;

// ----- Flag images ----------------------------------------------------------

pub(crate) fn pushf<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    let sw = ex.stack_width();
    // RF and VM never appear in the pushed image.
    let image = ex.st.rflags() & 0x00FC_FFFF;
    ex.push(sw, image & sw.mask())
}

pub(crate) fn popf<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    let sw = ex.stack_width();
    let value = ex.pop(sw)?;

    let mut mask = RFLAGS_CF
        | RFLAGS_PF
        | RFLAGS_AF
        | RFLAGS_ZF
        | RFLAGS_SF
        | RFLAGS_TF
        | RFLAGS_DF
        | RFLAGS_OF
        | RFLAGS_NT;
    if sw != Width::W16 {
        mask |= RFLAGS_AC | RFLAGS_ID;
    }
    let real = ex.st.mode == CpuMode::Real;
    let cpl = ex.st.cpl();
    if real || cpl == 0 {
        mask |= RFLAGS_IOPL_MASK;
    }
    if real || cpl <= ex.st.iopl() {
        mask |= RFLAGS_IF;
    }

    let merged = (ex.st.rflags() & !mask) | (value & mask);
    ex.st.set_rflags(merged);
    Ok(())
}

// ----- PUSHA/POPA -----------------------------------------------------------

pub(crate) fn pusha<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    if ex.st.is_64bit() {
        return Err(Exception::InvalidOpcode);
    }
    let w = ex.d.op_size;
    let original_sp = ex.st.read_gpr(w, 4, true);
    for slot in [0u8, 1, 2, 3] {
        let v = ex.st.read_gpr(w, slot, true);
        ex.push(w, v)?;
    }
    ex.push(w, original_sp)?;
    for slot in [5u8, 6, 7] {
        let v = ex.st.read_gpr(w, slot, true);
        ex.push(w, v)?;
    }
    Ok(())
}

pub(crate) fn popa<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    if ex.st.is_64bit() {
        return Err(Exception::InvalidOpcode);
    }
    let w = ex.d.op_size;
    for slot in [7u8, 6, 5] {
        let v = ex.pop(w)?;
        ex.st.write_gpr(w, slot, true, v);
    }
    // The saved SP is discarded.
    let _ = ex.pop(w)?;
    for slot in [3u8, 2, 1, 0] {
        let v = ex.pop(w)?;
        ex.st.write_gpr(w, slot, true, v);
    }
    Ok(())
}

// ----- Legacy BCD adjusts ---------------------------------------------------

pub(crate) fn bcd_adjust<B: CpuBus>(ex: &mut Exec<'_, B>, op: u8) -> Result<(), Exception> {
    if ex.st.is_64bit() {
        return Err(Exception::InvalidOpcode);
    }
    let al = ex.st.read_gpr8(0, false);
    let af = ex.st.flag(RFLAGS_AF);
    let cf = ex.st.flag(RFLAGS_CF);

    match op {
        0x27 => {
            // DAA
            let mut result = al;
            let mut new_cf = false;
            if al & 0x0F > 9 || af {
                result = result.wrapping_add(6);
                new_cf = cf || al > 0xF9;
                ex.st.set_flag(RFLAGS_AF, true);
            } else {
                ex.st.set_flag(RFLAGS_AF, false);
            }
            if al > 0x99 || cf {
                result = result.wrapping_add(0x60);
                new_cf = true;
            }
            ex.st.set_flag(RFLAGS_CF, new_cf);
            ex.st.write_gpr8(0, false, result);
            alu::set_szp(ex.st, Width::W8, u64::from(result));
        }
        0x2F => {
            // DAS
            let mut result = al;
            let mut new_cf = false;
            if al & 0x0F > 9 || af {
                result = result.wrapping_sub(6);
                new_cf = cf || al < 6;
                ex.st.set_flag(RFLAGS_AF, true);
            } else {
                ex.st.set_flag(RFLAGS_AF, false);
            }
            if al > 0x99 || cf {
                result = result.wrapping_sub(0x60);
                new_cf = true;
            }
            ex.st.set_flag(RFLAGS_CF, new_cf);
            ex.st.write_gpr8(0, false, result);
            alu::set_szp(ex.st, Width::W8, u64::from(result));
        }
        0x37 => {
            // AAA
            if al & 0x0F > 9 || af {
                let ax = ex.st.read_gpr16(0).wrapping_add(0x106);
                ex.st.write_gpr16(0, ax);
                ex.st.set_flag(RFLAGS_AF, true);
                ex.st.set_flag(RFLAGS_CF, true);
            } else {
                ex.st.set_flag(RFLAGS_AF, false);
                ex.st.set_flag(RFLAGS_CF, false);
            }
            let al = ex.st.read_gpr8(0, false) & 0x0F;
            ex.st.write_gpr8(0, false, al);
        }
        _ => {
            // AAS
            if al & 0x0F > 9 || af {
                let ax = ex.st.read_gpr16(0).wrapping_sub(6);
                ex.st.write_gpr16(0, ax);
                let ah = ex.st.read_gpr8(0, true).wrapping_sub(1);
                ex.st.write_gpr8(0, true, ah);
                ex.st.set_flag(RFLAGS_AF, true);
                ex.st.set_flag(RFLAGS_CF, true);
            } else {
                ex.st.set_flag(RFLAGS_AF, false);
                ex.st.set_flag(RFLAGS_CF, false);
            }
            let al = ex.st.read_gpr8(0, false) & 0x0F;
            ex.st.write_gpr8(0, false, al);
        }
    }
    Ok(())
}

pub(crate) fn aam<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    if ex.st.is_64bit() {
        return Err(Exception::InvalidOpcode);
    }
    let base = ex.d.imm as u8;
    if base == 0 {
        return Err(Exception::DivideError);
    }
    let al = ex.st.read_gpr8(0, false);
    ex.st.write_gpr8(0, true, al / base);
    let al = al % base;
    ex.st.write_gpr8(0, false, al);
    alu::set_szp(ex.st, Width::W8, u64::from(al));
    Ok(())
}

pub(crate) fn aad<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    if ex.st.is_64bit() {
        return Err(Exception::InvalidOpcode);
    }
    let base = ex.d.imm as u8;
    let al = ex.st.read_gpr8(0, false);
    let ah = ex.st.read_gpr8(0, true);
    let result = al.wrapping_add(ah.wrapping_mul(base));
    ex.st.write_gpr8(0, false, result);
    ex.st.write_gpr8(0, true, 0);
    alu::set_szp(ex.st, Width::W8, u64::from(result));
    Ok(())
}

// ----- Protected-mode helpers ----------------------------------------------

pub(crate) fn arpl<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    if ex.st.mode == CpuMode::Real {
        return Err(Exception::InvalidOpcode);
    }
    let dst = ex.rm_read(Width::W16)? as u16;
    let src = ex.reg_read(Width::W16) as u16;
    if dst & 0b11 < src & 0b11 {
        ex.rm_write(Width::W16, u64::from(dst & !0b11 | src & 0b11))?;
        ex.st.set_flag(RFLAGS_ZF, true);
    } else {
        ex.st.set_flag(RFLAGS_ZF, false);
    }
    Ok(())
}

pub(crate) fn bound<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    if ex.st.is_64bit() || ex.modrm().is_register() {
        return Err(Exception::InvalidOpcode);
    }
    let w = ex.d.op_size;
    let (seg, off) = ex.ea()?;
    let lower = ex.read_mem(seg, off, w)?;
    let upper = ex.read_mem(seg, off.wrapping_add(u64::from(w.bytes())), w)?;
    let sext = |v: u64| match w {
        Width::W16 => i64::from(v as u16 as i16),
        _ => i64::from(v as u32 as i32),
    };
    let index = sext(ex.reg_read(w));
    if index < sext(lower) || index > sext(upper) {
        return Err(Exception::BoundRange);
    }
    Ok(())
}

/// LES/LDS/LSS/LFS/LGS.
pub(crate) fn load_far_pointer<B: CpuBus>(
    ex: &mut Exec<'_, B>,
    seg: SegReg,
) -> Result<(), Exception> {
    if matches!(ex.d.opcode, crate::decode::Opcode::Primary(_)) && ex.st.is_64bit() {
        // C4/C5 are VEX territory in 64-bit mode; not supported here.
        return Err(Exception::InvalidOpcode);
    }
    if ex.modrm().is_register() {
        return Err(Exception::InvalidOpcode);
    }
    let w = ex.d.op_size;
    let (mseg, off) = ex.ea()?;
    let offset = ex.read_mem(mseg, off, w)?;
    let selector = ex.read_mem(mseg, off.wrapping_add(u64::from(w.bytes())), Width::W16)? as u16;
    segmentation::load_data_segment(ex.st, ex.bus, seg, selector)?;
    if seg == SegReg::Ss {
        ex.st.interrupt_shadow = 2;
    }
    ex.reg_write(w, offset);
    Ok(())
}

pub(crate) fn enter<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    let sw = ex.stack_width();
    let alloc = ex.d.imm;
    let level = (ex.d.imm2 & 0x1F) as u32;

    let rbp = ex.st.read_gpr64(5);
    ex.push(sw, rbp & sw.mask())?;
    let frame = ex.rsp_read();

    if level > 0 {
        let bytes = u64::from(sw.bytes());
        let mask = ex.stack_addr_width().mask();
        let mut bp = rbp & mask;
        for _ in 1..level {
            bp = bp.wrapping_sub(bytes) & mask;
            let lin = segmentation::segment_offset_linear(
                ex.st,
                SegReg::Ss,
                bp,
                u32::from(sw.bytes()),
                ex.stack_addr_width(),
            )?;
            let saved = match sw {
                Width::W16 => u64::from(ex.bus.read_u16(lin)?),
                Width::W32 => u64::from(ex.bus.read_u32(lin)?),
                _ => ex.bus.read_u64(lin)?,
            };
            ex.push(sw, saved)?;
        }
        ex.push(sw, frame)?;
    }

    match ex.stack_addr_width() {
        Width::W16 => ex.st.write_gpr16(5, frame as u16),
        Width::W32 => ex.st.write_gpr32(5, frame as u32),
        _ => ex.st.write_gpr64(5, frame),
    }
    let sp = ex.rsp_read().wrapping_sub(alloc);
    ex.rsp_write(sp);
    Ok(())
}

pub(crate) fn leave<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    let sw = ex.stack_width();
    let rbp = ex.st.read_gpr64(5) & ex.stack_addr_width().mask();
    ex.rsp_write(rbp);
    let value = ex.pop(sw)?;
    match sw {
        Width::W16 => ex.st.write_gpr16(5, value as u16),
        Width::W32 => ex.st.write_gpr32(5, value as u32),
        _ => ex.st.write_gpr64(5, value),
    }
    Ok(())
}

// ----- HLT / interrupt-flag ops --------------------------------------------

pub(crate) fn hlt<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    if ex.st.cpl() != 0 {
        return Err(Exception::gp0());
    }
    if ex.st.pending_bios_int_valid {
        ex.flow = Flow::Bios(ex.st.pending_bios_int);
    } else {
        ex.flow = Flow::Halt;
    }
    Ok(())
}

pub(crate) fn cli_sti<B: CpuBus>(ex: &mut Exec<'_, B>, enable: bool) -> Result<(), Exception> {
    if ex.st.mode != CpuMode::Real && ex.st.iopl() < ex.st.cpl() {
        return Err(Exception::gp0());
    }
    if enable {
        if !ex.st.flag(RFLAGS_IF) {
            // STI delays delivery until after the next instruction.
            ex.st.interrupt_shadow = 2;
        }
        ex.st.set_flag(RFLAGS_IF, true);
    } else {
        ex.st.set_flag(RFLAGS_IF, false);
    }
    Ok(())
}

pub(crate) fn check_io_permission(st: &crate::state::CpuState) -> Result<(), Exception> {
    // No TSS I/O permission bitmap is modeled; IOPL alone gates port access.
    if st.mode != CpuMode::Real && st.cpl() > st.iopl() {
        return Err(Exception::gp0());
    }
    Ok(())
}

// ----- Group 3 / Group 5 ----------------------------------------------------

pub(crate) fn group3<B: CpuBus>(ex: &mut Exec<'_, B>, op: u8) -> Result<(), Exception> {
    let w = if op == 0xF6 { Width::W8 } else { ex.d.op_size };
    match ex.modrm().reg & 0b111 {
        0 | 1 => {
            let value = ex.rm_read(w)?;
            let imm = (ex.d.imm_sext() as u64) & w.mask();
            alu::set_logic_flags(ex.st, w, value & imm);
            Ok(())
        }
        2 => {
            let value = ex.rm_read(w)?;
            ex.rm_write(w, !value & w.mask())
        }
        3 => {
            let value = ex.rm_read(w)?;
            let result = alu::neg_with_flags(ex.st, w, value);
            ex.rm_write(w, result)
        }
        4 | 5 => {
            let signed = ex.modrm().reg & 0b111 == 5;
            let src = ex.rm_read(w)?;
            let acc = ex.acc_read(w);
            let (lo, hi) = if signed {
                alu::mul_signed(ex.st, w, acc, src)
            } else {
                alu::mul_unsigned(ex.st, w, acc, src)
            };
            if w == Width::W8 {
                // AX = AL * r/m8.
                ex.st.write_gpr16(0, (hi << 8 | lo & 0xFF) as u16);
            } else {
                ex.acc_write(w, lo);
                ex.st.write_gpr(w, 2, true, hi);
            }
            Ok(())
        }
        _ => {
            let signed = ex.modrm().reg & 0b111 == 7;
            let divisor = ex.rm_read(w)?;
            let (lo, hi) = if w == Width::W8 {
                let ax = u64::from(ex.st.read_gpr16(0));
                (ax & 0xFF, ax >> 8)
            } else {
                (ex.acc_read(w), ex.st.read_gpr(w, 2, true))
            };
            let (quotient, remainder) = if signed {
                alu::div_signed(w, lo, hi, divisor)?
            } else {
                alu::div_unsigned(w, lo, hi, divisor)?
            };
            if w == Width::W8 {
                ex.st.write_gpr8(0, false, quotient as u8);
                ex.st.write_gpr8(0, true, remainder as u8);
            } else {
                ex.acc_write(w, quotient);
                ex.st.write_gpr(w, 2, true, remainder);
            }
            Ok(())
        }
    }
}

pub(crate) fn group5<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    let w = ex.d.op_size;
    match ex.modrm().reg & 0b111 {
        0 | 1 => {
            let dec = ex.modrm().reg & 1 == 1;
            let value = ex.rm_read(w)?;
            let result = alu::inc_dec_with_flags(ex.st, w, value, dec);
            ex.rm_write(w, result)
        }
        2 => {
            // Near indirect branches default to 64-bit operands in long mode.
            let w = if ex.st.is_64bit() { Width::W64 } else { w };
            let target = ex.rm_read(w)?;
            branch::call_near_indirect(ex, target)
        }
        3 => branch::far_indirect(ex, true),
        4 => {
            let w = if ex.st.is_64bit() { Width::W64 } else { w };
            let target = ex.rm_read(w)?;
            branch::jump_near_indirect(ex, target)
        }
        5 => branch::far_indirect(ex, false),
        6 => {
            let sw = ex.stack_width();
            let value = ex.rm_read(sw)?;
            ex.push(sw, value)
        }
        _ => Err(Exception::InvalidOpcode),
    }
}

// ----- Descriptor-table instructions ---------------------------------------

pub(crate) fn group6<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    if ex.st.mode == CpuMode::Real {
        return Err(Exception::InvalidOpcode);
    }
    match ex.modrm().reg & 0b111 {
        0 => ex.rm_write(Width::W16, u64::from(ex.st.tables.ldtr.selector)),
        1 => ex.rm_write(Width::W16, u64::from(ex.st.tables.tr.selector)),
        2 | 3 => {
            // LLDT / LTR.
            if ex.st.cpl() != 0 {
                return Err(Exception::gp0());
            }
            let load_tr = ex.modrm().reg & 0b111 == 3;
            let selector = ex.rm_read(Width::W16)? as u16;
            if selector & !0b11 == 0 {
                if load_tr {
                    return Err(Exception::GeneralProtection(0));
                }
                ex.st.tables.ldtr = Default::default();
                return Ok(());
            }
            let desc = read_descriptor(ex.st, ex.bus, selector)?
                .ok_or(Exception::GeneralProtection(selector & !0b11))?;
            if !desc.is_system() || !desc.present() {
                return Err(Exception::GeneralProtection(selector & !0b11));
            }
            let target = if load_tr {
                &mut ex.st.tables.tr
            } else {
                &mut ex.st.tables.ldtr
            };
            target.selector = selector;
            target.base = desc.base();
            target.limit = desc.limit_bytes();
            target.access = desc.access();
            Ok(())
        }
        4 | 5 => {
            // VERR / VERW.
            let check_write = ex.modrm().reg & 0b111 == 5;
            let selector = ex.rm_read(Width::W16)? as u16;
            let ok = match read_descriptor(ex.st, ex.bus, selector)? {
                Some(desc) if !desc.is_system() && desc.present() => {
                    let priv_ok = desc.is_conforming()
                        || desc.dpl() >= ex.st.cpl().max((selector & 0b11) as u8);
                    priv_ok
                        && if check_write {
                            desc.is_writable_data()
                        } else {
                            desc.is_readable()
                        }
                }
                _ => false,
            };
            ex.st.set_flag(RFLAGS_ZF, ok);
            Ok(())
        }
        _ => Err(Exception::InvalidOpcode),
    }
}

pub(crate) fn group7<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    let modrm = ex.modrm();
    if modrm.is_register() {
        return match (modrm.reg & 0b111, modrm.rm & 0b111) {
            // SWAPGS.
            (7, 0) if ex.st.is_64bit() => {
                if ex.st.cpl() != 0 {
                    return Err(Exception::gp0());
                }
                core::mem::swap(&mut ex.st.segments.gs.base, &mut ex.st.msr.kernel_gs_base);
                Ok(())
            }
            // RDTSCP.
            (7, 1) => {
                let tsc = ex.st.tsc;
                ex.st.write_gpr32(0, tsc as u32);
                ex.st.write_gpr32(2, (tsc >> 32) as u32);
                ex.st.write_gpr32(1, 0);
                Ok(())
            }
            _ => Err(Exception::InvalidOpcode),
        };
    }

    match modrm.reg & 0b111 {
        0 | 1 => {
            // SGDT / SIDT.
            let table = if modrm.reg & 0b111 == 0 {
                ex.st.tables.gdtr
            } else {
                ex.st.tables.idtr
            };
            let (seg, off) = ex.ea()?;
            ex.write_mem(seg, off, Width::W16, u64::from(table.limit))?;
            if ex.st.is_64bit() {
                ex.write_mem(seg, off.wrapping_add(2), Width::W64, table.base)
            } else {
                let base = if ex.d.op_size == Width::W16 {
                    table.base & 0x00FF_FFFF
                } else {
                    table.base
                };
                ex.write_mem(seg, off.wrapping_add(2), Width::W32, base)
            }
        }
        2 | 3 => {
            // LGDT / LIDT.
            if ex.st.cpl() != 0 {
                return Err(Exception::gp0());
            }
            let (seg, off) = ex.ea()?;
            let limit = ex.read_mem(seg, off, Width::W16)? as u16;
            let base = if ex.st.is_64bit() {
                ex.read_mem(seg, off.wrapping_add(2), Width::W64)?
            } else {
                let raw = ex.read_mem(seg, off.wrapping_add(2), Width::W32)?;
                if ex.d.op_size == Width::W16 {
                    raw & 0x00FF_FFFF
                } else {
                    raw
                }
            };
            let table = if modrm.reg & 0b111 == 2 {
                &mut ex.st.tables.gdtr
            } else {
                &mut ex.st.tables.idtr
            };
            table.base = base;
            table.limit = limit;
            Ok(())
        }
        4 => ex.rm_write(Width::W16, ex.st.control.cr0 & 0xFFFF),
        6 => {
            // LMSW: can set PE but never clear it.
            if ex.st.cpl() != 0 {
                return Err(Exception::gp0());
            }
            let value = ex.rm_read(Width::W16)?;
            let pe = ex.st.control.cr0 & 1 | value & 1;
            ex.st.control.cr0 = (ex.st.control.cr0 & !0xE) | (value & 0xE) | pe;
            ex.st.update_mode();
            Ok(())
        }
        7 => {
            // INVLPG: no TLB to flush.
            if ex.st.cpl() != 0 {
                return Err(Exception::gp0());
            }
            let _ = ex.ea()?;
            Ok(())
        }
        _ => Err(Exception::InvalidOpcode),
    }
}

pub(crate) fn lar<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    access_check(ex, true)
}

pub(crate) fn lsl<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    access_check(ex, false)
}

fn access_check<B: CpuBus>(ex: &mut Exec<'_, B>, rights: bool) -> Result<(), Exception> {
    if ex.st.mode == CpuMode::Real {
        return Err(Exception::InvalidOpcode);
    }
    let w = ex.d.op_size;
    let selector = ex.rm_read(Width::W16)? as u16;
    let result = match read_descriptor(ex.st, ex.bus, selector)? {
        Some(desc) if desc.present() => {
            let priv_ok = desc.is_conforming()
                || desc.dpl() >= ex.st.cpl().max((selector & 0b11) as u8);
            if priv_ok {
                if rights {
                    Some((desc.raw >> 32) & 0x00F0_FF00)
                } else {
                    Some(u64::from(desc.limit_bytes()))
                }
            } else {
                None
            }
        }
        _ => None,
    };
    match result {
        Some(value) => {
            ex.reg_write(w, value & w.mask());
            ex.st.set_flag(RFLAGS_ZF, true);
        }
        None => ex.st.set_flag(RFLAGS_ZF, false),
    }
    Ok(())
}

// ----- Control/debug registers, MSRs ---------------------------------------

pub(crate) fn mov_control<B: CpuBus>(ex: &mut Exec<'_, B>, write: bool) -> Result<(), Exception> {
    if ex.st.cpl() != 0 {
        return Err(Exception::gp0());
    }
    let w = if ex.st.mode == CpuMode::Long {
        Width::W64
    } else {
        Width::W32
    };
    let modrm = ex.modrm();
    let cr = modrm.reg;
    if write {
        let value = ex.st.read_gpr(w, modrm.rm, true);
        match cr {
            0 => {
                ex.st.control.cr0 = value;
                ex.st.update_mode();
            }
            2 => ex.st.control.cr2 = value,
            3 => ex.st.control.cr3 = value,
            4 => {
                ex.st.control.cr4 = value;
                ex.st.update_mode();
            }
            8 => ex.st.control.cr8 = value & 0xF,
            _ => return Err(Exception::InvalidOpcode),
        }
    } else {
        let value = match cr {
            0 => ex.st.control.cr0,
            2 => ex.st.control.cr2,
            3 => ex.st.control.cr3,
            4 => ex.st.control.cr4,
            8 => ex.st.control.cr8,
            _ => return Err(Exception::InvalidOpcode),
        };
        ex.st.write_gpr(w, modrm.rm, true, value);
    }
    Ok(())
}

pub(crate) fn mov_debug<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    // Debug registers are accepted but not modeled: reads produce zero.
    if ex.st.cpl() != 0 {
        return Err(Exception::gp0());
    }
    if matches!(ex.d.opcode, crate::decode::Opcode::TwoByte(0x21)) {
        let w = if ex.st.mode == CpuMode::Long {
            Width::W64
        } else {
            Width::W32
        };
        let rm = ex.modrm().rm;
        ex.st.write_gpr(w, rm, true, 0);
    }
    Ok(())
}

pub(crate) fn rdtsc<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    if ex.st.control.cr4 & CR4_TSD != 0 && ex.st.cpl() != 0 {
        return Err(Exception::gp0());
    }
    let tsc = ex.st.tsc;
    ex.st.write_gpr32(0, tsc as u32);
    ex.st.write_gpr32(2, (tsc >> 32) as u32);
    Ok(())
}

const MSR_APIC_BASE: u32 = 0x1B;
const MSR_TSC: u32 = 0x10;
const MSR_PAT: u32 = 0x277;
const MSR_EFER: u32 = 0xC000_0080;
const MSR_STAR: u32 = 0xC000_0081;
const MSR_LSTAR: u32 = 0xC000_0082;
const MSR_SFMASK: u32 = 0xC000_0084;
const MSR_FS_BASE: u32 = 0xC000_0100;
const MSR_GS_BASE: u32 = 0xC000_0101;
const MSR_KERNEL_GS_BASE: u32 = 0xC000_0102;

const PAT_DEFAULT: u64 = 0x0007_0406_0007_0406;

pub(crate) fn rdmsr<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    if ex.st.cpl() != 0 {
        return Err(Exception::gp0());
    }
    let index = ex.st.read_gpr32(1);
    let value = match index {
        MSR_TSC => ex.st.tsc,
        MSR_APIC_BASE => ex.st.msr.apic_base,
        MSR_PAT => PAT_DEFAULT,
        MSR_EFER => ex.st.msr.efer,
        MSR_STAR => ex.st.msr.star,
        MSR_LSTAR => ex.st.msr.lstar,
        MSR_SFMASK => ex.st.msr.sfmask,
        MSR_FS_BASE => ex.st.segments.fs.base,
        MSR_GS_BASE => ex.st.segments.gs.base,
        MSR_KERNEL_GS_BASE => ex.st.msr.kernel_gs_base,
        _ => return Err(Exception::gp0()),
    };
    ex.st.write_gpr32(0, value as u32);
    ex.st.write_gpr32(2, (value >> 32) as u32);
    Ok(())
}

pub(crate) fn wrmsr<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    if ex.st.cpl() != 0 {
        return Err(Exception::gp0());
    }
    let index = ex.st.read_gpr32(1);
    let value = u64::from(ex.st.read_gpr32(0)) | u64::from(ex.st.read_gpr32(2)) << 32;
    match index {
        MSR_TSC => ex.st.tsc = value,
        MSR_APIC_BASE => ex.st.msr.apic_base = value,
        MSR_PAT => {}
        MSR_EFER => {
            let keep = ex.st.msr.efer & EFER_LMA;
            ex.st.msr.efer = value & (EFER_SCE | EFER_LME | EFER_NXE) | keep;
            ex.st.update_mode();
        }
        MSR_STAR => ex.st.msr.star = value,
        MSR_LSTAR => ex.st.msr.lstar = value,
        MSR_SFMASK => ex.st.msr.sfmask = value,
        MSR_FS_BASE => ex.st.segments.fs.base = value,
        MSR_GS_BASE => ex.st.segments.gs.base = value,
        MSR_KERNEL_GS_BASE => ex.st.msr.kernel_gs_base = value,
        _ => return Err(Exception::gp0()),
    }
    Ok(())
}

pub(crate) fn cpuid<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    let leaf = ex.st.read_gpr32(0);
    let (eax, ebx, ecx, edx) = match leaf {
        0 => (
            0xD,
            u32::from_le_bytes(*b"Genu"),
            u32::from_le_bytes(*b"ntel"),
            u32::from_le_bytes(*b"ineI"),
        ),
        1 => {
            // Family 6, model 42, stepping 1.
            const FEATURES_EDX: u32 = 0x0003_FBFF & !(1 << 10);
            (0x0002_06A1, 0, 0, FEATURES_EDX)
        }
        0x8000_0000 => (0x8000_0008, 0, 0, 0),
        0x8000_0001 => (0, 0, 1, 1 << 11 | 1 << 20 | 1 << 29),
        0x8000_0008 => (0x3024, 0, 0, 0),
        _ => (0, 0, 0, 0),
    };
    ex.st.write_gpr32(0, eax);
    ex.st.write_gpr32(3, ebx);
    ex.st.write_gpr32(1, ecx);
    ex.st.write_gpr32(2, edx);
    Ok(())
}

// ----- SYSCALL/SYSRET -------------------------------------------------------

pub(crate) fn syscall<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    if !ex.st.is_64bit() || ex.st.msr.efer & EFER_SCE == 0 {
        return Err(Exception::InvalidOpcode);
    }
    ex.st.write_gpr64(1, ex.next_rip); // RCX
    ex.st.write_gpr64(11, ex.st.rflags()); // R11
    let flags = ex.st.rflags() & !ex.st.msr.sfmask;
    ex.st.set_rflags(flags & !(1 << 16)); // RF cleared

    let base_sel = (ex.st.msr.star >> 32) as u16 & 0xFFFC;
    ex.st.segments.cs = flat_code64(base_sel);
    ex.st.segments.ss = flat_data(base_sel + 8);
    ex.st.update_mode();
    ex.st.set_rip(ex.st.msr.lstar);
    ex.flow = Flow::Jump;
    Ok(())
}

pub(crate) fn sysret<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    if !ex.st.is_64bit() || ex.st.msr.efer & EFER_SCE == 0 {
        return Err(Exception::InvalidOpcode);
    }
    if ex.st.cpl() != 0 {
        return Err(Exception::gp0());
    }
    let rcx = ex.st.read_gpr64(1);
    if !machina_mmu::is_canonical(rcx) {
        return Err(Exception::gp0());
    }
    let flags = ex.st.read_gpr64(11);
    ex.st.set_rflags(flags & !(1 << 16 | 1 << 17));

    let base_sel = (ex.st.msr.star >> 48) as u16;
    ex.st.segments.cs = flat_code64(base_sel.wrapping_add(16) | 0b11);
    ex.st.segments.ss = flat_data(base_sel.wrapping_add(8) | 0b11);
    ex.st.update_mode();
    ex.st.set_rip(rcx);
    ex.flow = Flow::Jump;
    Ok(())
}

fn flat_code64(selector: u16) -> crate::state::SegmentRegister {
    let dpl = (selector & 0b11) as u8;
    crate::state::SegmentRegister {
        selector,
        base: 0,
        limit: 0xFFFF_FFFF,
        access: SEG_ACCESS_PRESENT
            | SEG_ACCESS_NON_SYSTEM
            | SEG_ACCESS_EXECUTABLE
            | SEG_ACCESS_RW
            | dpl << SEG_ACCESS_DPL_SHIFT,
        flags: SEG_FLAG_LONG | SEG_FLAG_GRANULARITY,
    }
}

fn flat_data(selector: u16) -> crate::state::SegmentRegister {
    let dpl = (selector & 0b11) as u8;
    crate::state::SegmentRegister {
        selector,
        base: 0,
        limit: 0xFFFF_FFFF,
        access: SEG_ACCESS_PRESENT
            | SEG_ACCESS_NON_SYSTEM
            | SEG_ACCESS_RW
            | dpl << SEG_ACCESS_DPL_SHIFT,
        flags: crate::state::SEG_FLAG_DEFAULT_BIG | SEG_FLAG_GRANULARITY,
    }
}

pub(crate) fn clts<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    if ex.st.cpl() != 0 {
        return Err(Exception::gp0());
    }
    ex.st.control.cr0 &= !CR0_TS;
    Ok(())
}

// ----- Bit-string operations ------------------------------------------------

fn bit_op(st: &mut crate::state::CpuState, kind: u8, value: u64, bit: u32) -> (u64, bool) {
    let mask = 1u64 << bit;
    let carry = value & mask != 0;
    st.set_flag(RFLAGS_CF, carry);
    let new = match kind {
        // BT
        0 => value,
        // BTS
        1 => value | mask,
        // BTR
        2 => value & !mask,
        // BTC
        _ => value ^ mask,
    };
    (new, kind != 0)
}

fn bit_kind_from_opcode(op: u8) -> u8 {
    match op {
        0xA3 => 0,
        0xAB => 1,
        0xB3 => 2,
        _ => 3,
    }
}

pub(crate) fn bit_test_reg<B: CpuBus>(ex: &mut Exec<'_, B>, op: u8) -> Result<(), Exception> {
    let w = ex.d.op_size;
    let kind = bit_kind_from_opcode(op);
    let bits = i64::from(w.bits());
    let index = match w {
        Width::W16 => i64::from(ex.reg_read(w) as u16 as i16),
        Width::W32 => i64::from(ex.reg_read(w) as u32 as i32),
        _ => ex.reg_read(w) as i64,
    };

    if ex.modrm().is_register() {
        let bit = index.rem_euclid(bits) as u32;
        let value = ex.rm_read(w)?;
        let (new, write) = bit_op(ex.st, kind, value, bit);
        if write {
            ex.rm_write(w, new)?;
        }
        return Ok(());
    }

    // Memory form: the index addresses a bit string relative to the operand.
    let (seg, off) = ex.ea()?;
    let element = index.div_euclid(bits) * i64::from(w.bytes());
    let bit = index.rem_euclid(bits) as u32;
    let off = off.wrapping_add(element as u64) & ex.d.addr_size.mask();
    let value = ex.read_mem(seg, off, w)?;
    let (new, write) = bit_op(ex.st, kind, value, bit);
    if write {
        ex.write_mem(seg, off, w, new)?;
    }
    Ok(())
}

pub(crate) fn bit_test_imm<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    let w = ex.d.op_size;
    let kind = match ex.modrm().reg & 0b111 {
        4 => 0,
        5 => 1,
        6 => 2,
        7 => 3,
        _ => return Err(Exception::InvalidOpcode),
    };
    let bit = (ex.d.imm as u32) % w.bits();
    let value = ex.rm_read(w)?;
    let (new, write) = bit_op(ex.st, kind, value, bit);
    if write {
        ex.rm_write(w, new)?;
    }
    Ok(())
}

pub(crate) fn bit_scan<B: CpuBus>(ex: &mut Exec<'_, B>, forward: bool) -> Result<(), Exception> {
    let w = ex.d.op_size;
    let value = ex.rm_read(w)? & w.mask();
    if value == 0 {
        ex.st.set_flag(RFLAGS_ZF, true);
        return Ok(());
    }
    ex.st.set_flag(RFLAGS_ZF, false);
    let index = if forward {
        value.trailing_zeros()
    } else {
        63 - value.leading_zeros()
    };
    ex.reg_write(w, u64::from(index));
    Ok(())
}

// ----- Compare-and-exchange -------------------------------------------------

pub(crate) fn cmpxchg<B: CpuBus>(ex: &mut Exec<'_, B>, byte_sized: bool) -> Result<(), Exception> {
    let w = if byte_sized { Width::W8 } else { ex.d.op_size };
    let current = ex.rm_read(w)?;
    let acc = ex.acc_read(w);
    alu::sub_with_flags(ex.st, w, acc, current, false);
    if acc & w.mask() == current & w.mask() {
        let replacement = ex.reg_read(w);
        ex.rm_write(w, replacement)?;
    } else {
        ex.acc_write(w, current);
    }
    Ok(())
}

pub(crate) fn cmpxchg8b<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    let modrm = ex.modrm();
    if modrm.reg & 0b111 != 1 || modrm.is_register() || ex.st.prefixes.rex_w() {
        return Err(Exception::InvalidOpcode);
    }
    let (seg, off) = ex.ea()?;
    let current = ex.read_mem(seg, off, Width::W64)?;
    let expected = u64::from(ex.st.read_gpr32(0)) | u64::from(ex.st.read_gpr32(2)) << 32;
    if current == expected {
        let replacement = u64::from(ex.st.read_gpr32(3)) | u64::from(ex.st.read_gpr32(1)) << 32;
        ex.write_mem(seg, off, Width::W64, replacement)?;
        ex.st.set_flag(RFLAGS_ZF, true);
    } else {
        ex.st.write_gpr32(0, current as u32);
        ex.st.write_gpr32(2, (current >> 32) as u32);
        ex.st.set_flag(RFLAGS_ZF, false);
    }
    Ok(())
}
