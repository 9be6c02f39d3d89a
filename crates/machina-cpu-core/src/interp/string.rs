//! String operations (MOVS/CMPS/STOS/LODS/SCAS/INS/OUTS) with REP handling.
//!
//! Registers are written back after every element so a fault mid-string
//! leaves a restartable state: re-executing the instruction continues where
//! the fault hit.

use machina_x86::{SegReg, Width};

use crate::interp::{alu, Exec};
use crate::mem::CpuBus;
use crate::state::{RepPrefix, RFLAGS_DF, RFLAGS_ZF};
use crate::Exception;

const RSI: usize = 6;
const RDI: usize = 7;
const RCX: usize = 1;

struct StringOp {
    width: Width,
    addr_mask: u64,
    step: u64,
    rep: RepPrefix,
}

impl StringOp {
    fn new<B: CpuBus>(ex: &Exec<'_, B>, width: Width) -> Self {
        let step = u64::from(width.bytes());
        let step = if ex.st.flag(RFLAGS_DF) { step.wrapping_neg() } else { step };
        Self {
            width,
            addr_mask: ex.d.addr_size.mask(),
            step,
            rep: ex.st.prefixes.rep,
        }
    }

    fn count<B: CpuBus>(&self, ex: &Exec<'_, B>) -> u64 {
        if self.rep == RepPrefix::None {
            1
        } else {
            ex.st.read_gpr64(RCX) & self.addr_mask
        }
    }

    fn write_index<B: CpuBus>(&self, ex: &mut Exec<'_, B>, slot: usize, value: u64) {
        let merged = (ex.st.read_gpr64(slot) & !self.addr_mask) | (value & self.addr_mask);
        // 32-bit address size still zero-extends per the GPR write rule.
        if self.addr_mask == 0xFFFF_FFFF {
            ex.st.write_gpr32(slot, merged as u32);
        } else {
            ex.st.write_gpr64(slot, merged);
        }
    }

    fn advance<B: CpuBus>(&self, ex: &mut Exec<'_, B>, slot: usize) {
        let next = ex.st.read_gpr64(slot).wrapping_add(self.step);
        self.write_index(ex, slot, next);
    }

    fn consume_count<B: CpuBus>(&self, ex: &mut Exec<'_, B>, remaining: u64) {
        if self.rep != RepPrefix::None {
            self.write_index(ex, RCX, remaining);
        }
    }

    /// REPE/REPNE termination test after a comparing element.
    fn compare_terminates<B: CpuBus>(&self, ex: &Exec<'_, B>) -> bool {
        match self.rep {
            RepPrefix::Rep => !ex.st.flag(RFLAGS_ZF),
            RepPrefix::Repne => ex.st.flag(RFLAGS_ZF),
            RepPrefix::None => false,
        }
    }
}

fn element_width<B: CpuBus>(ex: &Exec<'_, B>, byte_opcode: u8) -> Width {
    if matches!(ex.d.opcode, crate::decode::Opcode::Primary(op) if op == byte_opcode) {
        Width::W8
    } else {
        ex.d.op_size
    }
}

pub(crate) fn movs<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    let op = StringOp::new(ex, element_width(ex, 0xA4));
    let src_seg = ex.data_seg(SegReg::Ds);
    let mut remaining = op.count(ex);
    while remaining > 0 {
        let si = ex.st.read_gpr64(RSI) & op.addr_mask;
        let di = ex.st.read_gpr64(RDI) & op.addr_mask;
        let value = ex.read_mem(src_seg, si, op.width)?;
        ex.write_mem(SegReg::Es, di, op.width, value)?;
        op.advance(ex, RSI);
        op.advance(ex, RDI);
        remaining -= 1;
        op.consume_count(ex, remaining);
    }
    Ok(())
}

pub(crate) fn stos<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    let op = StringOp::new(ex, element_width(ex, 0xAA));
    let value = ex.acc_read(op.width);
    let mut remaining = op.count(ex);
    while remaining > 0 {
        let di = ex.st.read_gpr64(RDI) & op.addr_mask;
        ex.write_mem(SegReg::Es, di, op.width, value)?;
        op.advance(ex, RDI);
        remaining -= 1;
        op.consume_count(ex, remaining);
    }
    Ok(())
}

pub(crate) fn lods<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    let op = StringOp::new(ex, element_width(ex, 0xAC));
    let seg = ex.data_seg(SegReg::Ds);
    let mut remaining = op.count(ex);
    while remaining > 0 {
        let si = ex.st.read_gpr64(RSI) & op.addr_mask;
        let value = ex.read_mem(seg, si, op.width)?;
        ex.acc_write(op.width, value);
        op.advance(ex, RSI);
        remaining -= 1;
        op.consume_count(ex, remaining);
    }
    Ok(())
}

pub(crate) fn cmps<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    let op = StringOp::new(ex, element_width(ex, 0xA6));
    let src_seg = ex.data_seg(SegReg::Ds);
    let mut remaining = op.count(ex);
    while remaining > 0 {
        let si = ex.st.read_gpr64(RSI) & op.addr_mask;
        let di = ex.st.read_gpr64(RDI) & op.addr_mask;
        let a = ex.read_mem(src_seg, si, op.width)?;
        let b = ex.read_mem(SegReg::Es, di, op.width)?;
        alu::sub_with_flags(ex.st, op.width, a, b, false);
        op.advance(ex, RSI);
        op.advance(ex, RDI);
        remaining -= 1;
        op.consume_count(ex, remaining);
        if op.compare_terminates(ex) {
            break;
        }
    }
    Ok(())
}

pub(crate) fn scas<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    let op = StringOp::new(ex, element_width(ex, 0xAE));
    let acc = ex.acc_read(op.width);
    let mut remaining = op.count(ex);
    while remaining > 0 {
        let di = ex.st.read_gpr64(RDI) & op.addr_mask;
        let value = ex.read_mem(SegReg::Es, di, op.width)?;
        alu::sub_with_flags(ex.st, op.width, acc, value, false);
        op.advance(ex, RDI);
        remaining -= 1;
        op.consume_count(ex, remaining);
        if op.compare_terminates(ex) {
            break;
        }
    }
    Ok(())
}

/// INS (6C/6D) and OUTS (6E/6F).
pub(crate) fn ins_outs<B: CpuBus>(ex: &mut Exec<'_, B>, opcode: u8) -> Result<(), Exception> {
    crate::interp::system::check_io_permission(ex.st)?;
    let output = opcode >= 0x6E;
    // I/O tops out at 32 bits; REX.W has no effect on INS/OUTS.
    let width = if opcode & 1 == 0 {
        Width::W8
    } else if ex.d.op_size == Width::W64 {
        Width::W32
    } else {
        ex.d.op_size
    };
    let op = StringOp::new(ex, width);
    let port = ex.st.read_gpr16(2);
    let mut remaining = op.count(ex);
    while remaining > 0 {
        if output {
            let si = ex.st.read_gpr64(RSI) & op.addr_mask;
            let seg = ex.data_seg(SegReg::Ds);
            let value = ex.read_mem(seg, si, width)?;
            ex.bus.io_write(port, width.bytes(), value as u32);
            op.advance(ex, RSI);
        } else {
            let di = ex.st.read_gpr64(RDI) & op.addr_mask;
            let value = u64::from(ex.bus.io_read(port, width.bytes()));
            ex.write_mem(SegReg::Es, di, width, value)?;
            op.advance(ex, RDI);
        }
        remaining -= 1;
        op.consume_count(ex, remaining);
    }
    Ok(())
}
