//! Interrupt and fault delivery: IVT traversal in real mode, IDT gates in
//! protected and long mode, with stack switches on privilege change.

use machina_x86::{SegReg, Width};

use crate::interp::{Exec, Flow};
use crate::mem::CpuBus;
use crate::segmentation::{self, read_descriptor};
use crate::state::{
    CpuMode, CpuState, RFLAGS_AC, RFLAGS_AF, RFLAGS_CF, RFLAGS_DF, RFLAGS_ID, RFLAGS_IF,
    RFLAGS_NT, RFLAGS_OF, RFLAGS_PF, RFLAGS_RF, RFLAGS_SF, RFLAGS_TF, RFLAGS_ZF,
};
use crate::Exception;

/// What kind of event is being delivered; gates differ on privilege checking
/// and error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// Hardware interrupt from the PIC/APIC. No gate-DPL check.
    External,
    /// INT n / INT3 / INTO / INT1: gate DPL must admit the current CPL.
    Software,
    /// Processor exception, with its architectural error code if any.
    Fault(Option<u32>),
}

impl Event {
    fn error_code(&self) -> Option<u32> {
        match self {
            Event::Fault(code) => *code,
            _ => None,
        }
    }
}

/// Delivers `vector`, pushing a return frame that resumes at `return_rip`.
///
/// A returned `Err` means delivery itself faulted; the caller applies the
/// double-fault/triple-fault escalation rules.
pub fn deliver<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    vector: u8,
    event: Event,
    return_rip: u64,
) -> Result<(), Exception> {
    match state.mode {
        CpuMode::Real => deliver_real(state, bus, vector, return_rip),
        CpuMode::Protected => deliver_protected(state, bus, vector, event, return_rip),
        CpuMode::Long => deliver_long(state, bus, vector, event, return_rip),
    }
}

fn deliver_real<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    vector: u8,
    return_rip: u64,
) -> Result<(), Exception> {
    let entry = state.tables.idtr.base.wrapping_add(u64::from(vector) * 4);
    let offset = bus.read_u16(entry)?;
    let segment = bus.read_u16(entry.wrapping_add(2))?;

    let mut sp = u64::from(state.read_gpr16(4));
    let ss_base = state.segments.ss.base;
    let mut push16 = |bus: &mut B, value: u16| -> Result<(), Exception> {
        sp = sp.wrapping_sub(2) & 0xFFFF;
        bus.write_u16(ss_base.wrapping_add(sp), value)
    };
    push16(bus, state.rflags() as u16)?;
    push16(bus, state.segments.cs.selector)?;
    push16(bus, return_rip as u16)?;
    state.write_gpr16(4, sp as u16);

    state.set_flag(RFLAGS_IF, false);
    state.set_flag(RFLAGS_TF, false);
    state.segments.cs.load_real_mode(segment);
    state.set_rip(u64::from(offset));

    // Latch the vector so a HLT in the firmware stub surfaces as a BIOS
    // service request.
    state.pending_bios_int = vector;
    state.pending_bios_int_valid = true;
    Ok(())
}

struct Gate {
    selector: u16,
    offset: u64,
    gate_type: u8,
    dpl: u8,
    present: bool,
}

fn read_gate32<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    vector: u8,
) -> Result<Gate, Exception> {
    let index = u64::from(vector) * 8;
    if index + 7 > u64::from(state.tables.idtr.limit) {
        return Err(Exception::GeneralProtection(u16::from(vector) << 3 | 2));
    }
    let raw = bus.read_u64(state.tables.idtr.base.wrapping_add(index))?;
    Ok(Gate {
        selector: (raw >> 16) as u16,
        offset: raw & 0xFFFF | (raw >> 48 & 0xFFFF) << 16,
        gate_type: (raw >> 40 & 0xF) as u8,
        dpl: (raw >> 45 & 0b11) as u8,
        present: raw >> 47 & 1 != 0,
    })
}

fn read_gate64<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    vector: u8,
) -> Result<Gate, Exception> {
    let index = u64::from(vector) * 16;
    if index + 15 > u64::from(state.tables.idtr.limit) {
        return Err(Exception::GeneralProtection(u16::from(vector) << 3 | 2));
    }
    let low = bus.read_u64(state.tables.idtr.base.wrapping_add(index))?;
    let high = bus.read_u64(state.tables.idtr.base.wrapping_add(index + 8))?;
    Ok(Gate {
        selector: (low >> 16) as u16,
        offset: low & 0xFFFF | (low >> 48 & 0xFFFF) << 16 | (high & 0xFFFF_FFFF) << 32,
        gate_type: (low >> 40 & 0xF) as u8,
        dpl: (low >> 45 & 0b11) as u8,
        present: low >> 47 & 1 != 0,
    })
}

fn deliver_protected<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    vector: u8,
    event: Event,
    return_rip: u64,
) -> Result<(), Exception> {
    let gate = read_gate32(state, bus, vector)?;
    let err_sel = u16::from(vector) << 3 | 2;

    // Interrupt and trap gates only; task gates are not modeled.
    let is_interrupt_gate = matches!(gate.gate_type, 0x6 | 0xE);
    let is_trap_gate = matches!(gate.gate_type, 0x7 | 0xF);
    if !is_interrupt_gate && !is_trap_gate {
        return Err(Exception::GeneralProtection(err_sel));
    }
    let gate16 = matches!(gate.gate_type, 0x6 | 0x7);
    if event == Event::Software && gate.dpl < state.cpl() {
        return Err(Exception::GeneralProtection(err_sel));
    }
    if !gate.present {
        return Err(Exception::SegmentNotPresent(err_sel));
    }

    let target = read_descriptor(state, bus, gate.selector)?
        .ok_or(Exception::GeneralProtection(gate.selector & !0b11))?;
    if target.is_system() || !target.is_code() {
        return Err(Exception::GeneralProtection(gate.selector & !0b11));
    }
    if !target.present() {
        return Err(Exception::SegmentNotPresent(gate.selector & !0b11));
    }

    let cpl = state.cpl();
    let target_dpl = if target.is_conforming() { cpl } else { target.dpl() };
    let width = if gate16 { Width::W16 } else { Width::W32 };

    let old_flags = state.rflags();
    let old_cs = state.segments.cs.selector;
    let old_ss = state.segments.ss.selector;
    let old_sp = state.read_gpr64(4);

    if target_dpl < cpl {
        // Inter-privilege: switch to the ring stack from the TSS.
        let tss = state.tables.tr;
        let (new_sp, new_ss) = {
            let sp = u64::from(bus.read_u32(tss.base.wrapping_add(4))?);
            let ss = bus.read_u16(tss.base.wrapping_add(8))?;
            (sp, ss)
        };
        let ss_desc = read_descriptor(state, bus, new_ss)?
            .ok_or(Exception::InvalidTss(new_ss & !0b11))?;
        if !ss_desc.is_writable_data() || !ss_desc.present() {
            return Err(Exception::InvalidTss(new_ss & !0b11));
        }

        let mut cache = ss_desc.to_cache(new_ss);
        cache.selector = new_ss & !0b11 | u16::from(target_dpl);
        state.segments.ss = cache;

        let mut frame = StackFrame::new(state, new_sp, width);
        frame.push(bus, u64::from(old_ss))?;
        frame.push(bus, old_sp)?;
        frame.push(bus, old_flags)?;
        frame.push(bus, u64::from(old_cs))?;
        frame.push(bus, return_rip)?;
        if let Some(code) = event.error_code() {
            frame.push(bus, u64::from(code))?;
        }
        frame.commit(state);
    } else {
        let mut frame = StackFrame::new(state, old_sp, width);
        frame.push(bus, old_flags)?;
        frame.push(bus, u64::from(old_cs))?;
        frame.push(bus, return_rip)?;
        if let Some(code) = event.error_code() {
            frame.push(bus, u64::from(code))?;
        }
        frame.commit(state);
    }

    let mut cs_cache = target.to_cache(gate.selector);
    cs_cache.selector = gate.selector & !0b11 | u16::from(target_dpl);
    state.segments.cs = cs_cache;
    state.update_mode();

    if is_interrupt_gate {
        state.set_flag(RFLAGS_IF, false);
    }
    state.set_flag(RFLAGS_TF, false);
    state.set_flag(RFLAGS_NT, false);
    state.set_flag(RFLAGS_RF, false);

    let offset_mask = if gate16 { 0xFFFF } else { 0xFFFF_FFFF };
    state.set_rip(gate.offset & offset_mask);
    Ok(())
}

fn deliver_long<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    vector: u8,
    event: Event,
    return_rip: u64,
) -> Result<(), Exception> {
    let gate = read_gate64(state, bus, vector)?;
    let err_sel = u16::from(vector) << 3 | 2;

    if !matches!(gate.gate_type, 0xE | 0xF) {
        return Err(Exception::GeneralProtection(err_sel));
    }
    if event == Event::Software && gate.dpl < state.cpl() {
        return Err(Exception::GeneralProtection(err_sel));
    }
    if !gate.present {
        return Err(Exception::SegmentNotPresent(err_sel));
    }

    let target = read_descriptor(state, bus, gate.selector)?
        .ok_or(Exception::GeneralProtection(gate.selector & !0b11))?;
    if target.is_system() || !target.is_code() || !target.present() {
        return Err(Exception::GeneralProtection(gate.selector & !0b11));
    }

    let cpl = state.cpl();
    let target_dpl = if target.is_conforming() { cpl } else { target.dpl() };

    let old_flags = state.rflags();
    let old_cs = state.segments.cs.selector;
    let old_ss = state.segments.ss.selector;
    let old_sp = state.read_gpr64(4);

    let new_sp = if target_dpl < cpl {
        // RSP0 from the 64-bit TSS (IST dispatch is not modeled).
        bus.read_u64(state.tables.tr.base.wrapping_add(4))?
    } else {
        old_sp
    };

    if target_dpl < cpl {
        // The inner-ring SS is the null selector with the new RPL.
        state.segments.ss = crate::state::SegmentRegister {
            selector: u16::from(target_dpl),
            base: 0,
            limit: 0,
            access: 0,
            flags: 0,
        };
    }

    // Long-mode delivery always pushes SS:RSP and aligns the frame.
    let mut frame = StackFrame::new(state, new_sp & !0xF, Width::W64);
    frame.push(bus, u64::from(old_ss))?;
    frame.push(bus, old_sp)?;
    frame.push(bus, old_flags)?;
    frame.push(bus, u64::from(old_cs))?;
    frame.push(bus, return_rip)?;
    if let Some(code) = event.error_code() {
        frame.push(bus, u64::from(code))?;
    }
    frame.commit(state);

    let mut cs_cache = target.to_cache(gate.selector);
    cs_cache.selector = gate.selector & !0b11 | u16::from(target_dpl);
    state.segments.cs = cs_cache;
    state.update_mode();

    if gate.gate_type == 0xE {
        state.set_flag(RFLAGS_IF, false);
    }
    state.set_flag(RFLAGS_TF, false);
    state.set_flag(RFLAGS_NT, false);
    state.set_flag(RFLAGS_RF, false);

    state.set_rip(gate.offset);
    Ok(())
}

/// Builds an interrupt stack frame against the (possibly just switched) SS,
/// committing RSP only after every push has succeeded.
struct StackFrame {
    base: u64,
    sp: u64,
    width: Width,
    sp_mask: u64,
}

impl StackFrame {
    fn new(state: &CpuState, sp: u64, width: Width) -> Self {
        let sp_mask = if state.mode == CpuMode::Long {
            u64::MAX
        } else if state.segments.ss.default_big() {
            0xFFFF_FFFF
        } else {
            0xFFFF
        };
        Self {
            base: if state.mode == CpuMode::Long { 0 } else { state.segments.ss.base },
            sp,
            width,
            sp_mask,
        }
    }

    fn push<B: CpuBus>(&mut self, bus: &mut B, value: u64) -> Result<(), Exception> {
        self.sp = self.sp.wrapping_sub(u64::from(self.width.bytes())) & self.sp_mask;
        let addr = self.base.wrapping_add(self.sp);
        match self.width {
            Width::W16 => bus.write_u16(addr, value as u16),
            Width::W32 => bus.write_u32(addr, value as u32),
            _ => bus.write_u64(addr, value),
        }
    }

    fn commit(self, state: &mut CpuState) {
        if self.sp_mask == 0xFFFF {
            state.write_gpr16(4, self.sp as u16);
        } else if self.sp_mask == 0xFFFF_FFFF {
            state.write_gpr32(4, self.sp as u32);
        } else {
            state.write_gpr64(4, self.sp);
        }
    }
}

/// INT n / INT3 / INTO / INT1 from the interpreter.
pub(crate) fn software_interrupt<B: CpuBus>(
    ex: &mut Exec<'_, B>,
    vector: u8,
) -> Result<(), Exception> {
    deliver(ex.st, ex.bus, vector, Event::Software, ex.next_rip)?;
    ex.flow = Flow::Jump;
    Ok(())
}

/// IRET/IRETD/IRETQ.
pub(crate) fn iret<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    let st_mode = ex.st.mode;
    match st_mode {
        CpuMode::Real => {
            let w = ex.d.op_size;
            let ip = ex.pop(w)?;
            let cs = ex.pop(w)? as u16;
            let flags = ex.pop(w)?;
            let merged = if w == Width::W16 {
                ex.st.rflags() & !0xFFFF | flags & 0xFFFF
            } else {
                flags
            };
            ex.st.set_rflags(merged);
            ex.st.segments.cs.load_real_mode(cs);
            ex.st.set_rip(ip & 0xFFFF);
            ex.st.clear_pending_bios_int();
            ex.flow = Flow::Jump;
            Ok(())
        }
        CpuMode::Protected | CpuMode::Long => iret_protected(ex),
    }
}

fn iret_protected<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    if ex.st.flag(RFLAGS_NT) {
        // Nested-task returns need the task register machinery; refuse.
        return Err(Exception::gp0());
    }
    let long = ex.st.mode == CpuMode::Long;
    let w = if long { Width::W64 } else { ex.d.op_size };

    let rip = ex.pop(w)?;
    let cs_sel = ex.pop(w)? as u16;
    let flags_image = ex.pop(w)?;

    let cpl = ex.st.cpl();
    let rpl = (cs_sel & 0b11) as u8;
    if rpl < cpl {
        return Err(Exception::GeneralProtection(cs_sel & !0b11));
    }

    // In 64-bit mode SS:RSP is always part of the frame; elsewhere only when
    // returning to an outer ring.
    let outer = rpl > cpl;
    let (new_sp, new_ss) = if long || outer {
        let sp = ex.pop(w)?;
        let ss = ex.pop(w)? as u16;
        (Some(sp), Some(ss))
    } else {
        (None, None)
    };

    segmentation::load_code_segment(ex.st, ex.bus, cs_sel, Some(rpl))?;

    if let (Some(sp), Some(ss)) = (new_sp, new_ss) {
        if ss & !0b11 == 0 && long && rpl == 0 {
            // Returning to ring 0 with a null SS is legal in long mode.
            ex.st.segments.ss = crate::state::SegmentRegister {
                selector: ss,
                ..Default::default()
            };
        } else {
            segmentation::load_data_segment(ex.st, ex.bus, SegReg::Ss, ss)?;
        }
        ex.rsp_write(sp);
    }

    // Restore flags with the same privilege filtering POPF applies.
    let mut mask: u64 = RFLAGS_CF
        | RFLAGS_PF
        | RFLAGS_AF
        | RFLAGS_ZF
        | RFLAGS_SF
        | RFLAGS_TF
        | RFLAGS_DF
        | RFLAGS_OF
        | RFLAGS_AC
        | RFLAGS_ID
        | RFLAGS_NT;
    if cpl == 0 {
        mask |= crate::state::RFLAGS_IOPL_MASK;
    }
    if cpl <= ex.st.iopl() {
        mask |= RFLAGS_IF;
    }
    let flags_image = if w == Width::W16 {
        ex.st.rflags() & !0xFFFF | flags_image & 0xFFFF
    } else {
        flags_image
    };
    let merged = (ex.st.rflags() & !mask) | (flags_image & mask);
    ex.st.set_rflags(merged);

    ex.st.set_rip(if long { rip } else { rip & w.mask() });
    ex.st.clear_pending_bios_int();
    ex.flow = Flow::Jump;
    Ok(())
}
