//! Near and far control transfers.

use machina_x86::Width;

use crate::interp::{Exec, Flow};
use crate::mem::CpuBus;
use crate::segmentation;
use crate::state::CpuMode;
use crate::Exception;

/// Mask applied to a freshly computed instruction pointer.
fn branch_mask<B: CpuBus>(ex: &Exec<'_, B>) -> u64 {
    if ex.st.is_64bit() {
        u64::MAX
    } else if ex.d.op_size == Width::W16 {
        0xFFFF
    } else {
        0xFFFF_FFFF
    }
}

pub(crate) fn jump_rel<B: CpuBus>(ex: &mut Exec<'_, B>) {
    let target = ex.next_rip.wrapping_add(ex.d.imm_sext() as u64) & branch_mask(ex);
    ex.st.set_rip(target);
    ex.flow = Flow::Jump;
}

pub(crate) fn call_rel<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    ex.push(ex.stack_width(), ex.next_rip)?;
    jump_rel(ex);
    Ok(())
}

pub(crate) fn jump_near_indirect<B: CpuBus>(
    ex: &mut Exec<'_, B>,
    target: u64,
) -> Result<(), Exception> {
    ex.st.set_rip(target & branch_mask(ex));
    ex.flow = Flow::Jump;
    Ok(())
}

pub(crate) fn call_near_indirect<B: CpuBus>(
    ex: &mut Exec<'_, B>,
    target: u64,
) -> Result<(), Exception> {
    ex.push(ex.stack_width(), ex.next_rip)?;
    jump_near_indirect(ex, target)
}

pub(crate) fn ret_near<B: CpuBus>(ex: &mut Exec<'_, B>, with_imm: bool) -> Result<(), Exception> {
    let sw = ex.stack_width();
    let target = ex.pop(sw)?;
    if with_imm {
        let sp = ex.rsp_read().wrapping_add(ex.d.imm);
        ex.rsp_write(sp);
    }
    ex.st.set_rip(target & branch_mask(ex));
    ex.flow = Flow::Jump;
    Ok(())
}

fn far_transfer<B: CpuBus>(
    ex: &mut Exec<'_, B>,
    selector: u16,
    offset: u64,
    push_return: bool,
) -> Result<(), Exception> {
    if push_return {
        let sw = ex.stack_width();
        ex.push(sw, u64::from(ex.st.segments.cs.selector))?;
        ex.push(sw, ex.next_rip)?;
    }
    segmentation::load_code_segment(ex.st, ex.bus, selector, None)?;
    let mask = if ex.st.is_64bit() {
        u64::MAX
    } else if ex.d.op_size == Width::W16 {
        0xFFFF
    } else {
        0xFFFF_FFFF
    };
    ex.st.set_rip(offset & mask);
    ex.flow = Flow::Jump;
    Ok(())
}

pub(crate) fn jump_far_direct<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    if ex.st.is_64bit() {
        return Err(Exception::InvalidOpcode);
    }
    far_transfer(ex, ex.d.imm2 as u16, ex.d.imm, false)
}

pub(crate) fn call_far_direct<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    if ex.st.is_64bit() {
        return Err(Exception::InvalidOpcode);
    }
    far_transfer(ex, ex.d.imm2 as u16, ex.d.imm, true)
}

/// Far transfer through a m16:16/m16:32/m16:64 memory operand (FF /3, /5).
pub(crate) fn far_indirect<B: CpuBus>(
    ex: &mut Exec<'_, B>,
    call: bool,
) -> Result<(), Exception> {
    if ex.modrm().is_register() {
        return Err(Exception::InvalidOpcode);
    }
    let (seg, off) = ex.ea()?;
    let w = ex.d.op_size;
    let offset = ex.read_mem(seg, off, w)?;
    let selector = ex.read_mem(seg, off.wrapping_add(u64::from(w.bytes())), Width::W16)? as u16;
    far_transfer(ex, selector, offset, call)
}

pub(crate) fn ret_far<B: CpuBus>(ex: &mut Exec<'_, B>, with_imm: bool) -> Result<(), Exception> {
    let sw = ex.stack_width();
    let offset = ex.pop(sw)?;
    let selector = ex.pop(sw)? as u16;
    if with_imm {
        let sp = ex.rsp_read().wrapping_add(ex.d.imm);
        ex.rsp_write(sp);
    }

    if ex.st.mode == CpuMode::Real {
        ex.st.segments.cs.load_real_mode(selector);
        ex.st.set_rip(offset & 0xFFFF);
        ex.flow = Flow::Jump;
        return Ok(());
    }

    let cpl = ex.st.cpl();
    let rpl = (selector & 0b11) as u8;
    if rpl < cpl {
        return Err(Exception::GeneralProtection(selector & !0b11));
    }

    if rpl > cpl {
        // Outer return: the caller's SS:SP sit above the return address.
        let new_sp = ex.pop(sw)?;
        let new_ss = ex.pop(sw)? as u16;
        segmentation::load_code_segment(ex.st, ex.bus, selector, Some(rpl))?;
        segmentation::load_data_segment(ex.st, ex.bus, machina_x86::SegReg::Ss, new_ss)?;
        ex.rsp_write(new_sp);
    } else {
        segmentation::load_code_segment(ex.st, ex.bus, selector, Some(cpl))?;
    }
    let mask = if ex.st.is_64bit() {
        u64::MAX
    } else if ex.d.op_size == Width::W16 {
        0xFFFF
    } else {
        0xFFFF_FFFF
    };
    ex.st.set_rip(offset & mask);
    ex.flow = Flow::Jump;
    Ok(())
}

/// LOOP/LOOPE/LOOPNE/JrCXZ.
pub(crate) fn loop_group<B: CpuBus>(ex: &mut Exec<'_, B>, op: u8) -> Result<(), Exception> {
    let mask = ex.d.addr_size.mask();
    if op == 0xE3 {
        if ex.st.read_gpr64(1) & mask == 0 {
            jump_rel(ex);
        }
        return Ok(());
    }

    let count = ex.st.read_gpr64(1).wrapping_sub(1) & mask;
    match ex.d.addr_size {
        Width::W16 => ex.st.write_gpr16(1, count as u16),
        Width::W32 => ex.st.write_gpr32(1, count as u32),
        _ => ex.st.write_gpr64(1, count),
    }
    let zf = ex.st.flag(crate::state::RFLAGS_ZF);
    let take = match op {
        0xE0 => count != 0 && !zf,
        0xE1 => count != 0 && zf,
        _ => count != 0,
    };
    if take {
        jump_rel(ex);
    }
    Ok(())
}
