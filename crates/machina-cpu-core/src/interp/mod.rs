//! The tier-0 interpreter: decode one instruction at CS:RIP, execute it, and
//! report faults as values. One handler body per operation; 16/32/64-bit
//! behavior is selected from the resolved operand/address sizes rather than
//! per-mode handler registries.

pub mod alu;
mod branch;
mod string;
mod system;

use machina_x86::{SegReg, Width};

use crate::decode::{self, Decoded, Fetcher, ModRm, Opcode};
use crate::interrupts;
use crate::mem::CpuBus;
use crate::segmentation;
use crate::state::{CpuMode, CpuState, Prefixes, RFLAGS_OF, RFLAGS_DF};
use crate::Exception;

use alu::AluOp;

/// Outcome of a successfully executed instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepExit {
    Normal,
    /// HLT executed; the CPU is idle until an interrupt or external wake.
    Halted,
    /// HLT executed inside the firmware stub with a latched vector: the
    /// embedder services the BIOS call and resumes at the stub's IRET.
    BiosInterrupt(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Next,
    Jump,
    Halt,
    Bios(u8),
}

/// Executes a single instruction. On `Err`, RIP still points at the faulting
/// instruction and CR2 has been updated for page faults.
pub fn step<B: CpuBus>(state: &mut CpuState, bus: &mut B) -> Result<StepExit, Exception> {
    bus.sync(state);
    state.prefixes = Prefixes::default();

    let ip_mask = ip_mask(state);
    let rip = state.rip() & ip_mask;
    let fetch_base = state.segments.cs.base.wrapping_add(rip);

    let result = (|| {
        let mut fetcher = Fetcher::new(bus, fetch_base);
        let d = decode::decode(state, &mut fetcher)?;
        let next_rip = rip.wrapping_add(u64::from(d.len)) & ip_mask;

        if state.prefixes.lock && !lock_allowed(&d) {
            return Err(Exception::InvalidOpcode);
        }

        let mut ex = Exec { st: state, bus, d, next_rip, flow: Flow::Next };
        dispatch(&mut ex)?;
        Ok((ex.flow, next_rip))
    })();

    state.tsc = state.tsc.wrapping_add(1);

    match result {
        Ok((flow, next_rip)) => {
            match flow {
                Flow::Next => state.set_rip(next_rip),
                Flow::Jump => {}
                Flow::Halt => {
                    state.set_rip(next_rip);
                    state.halted = true;
                    return Ok(StepExit::Halted);
                }
                Flow::Bios(vector) => {
                    state.set_rip(next_rip);
                    return Ok(StepExit::BiosInterrupt(vector));
                }
            }
            Ok(StepExit::Normal)
        }
        Err(err) => {
            if let Exception::PageFault { addr, .. } = err {
                state.control.cr2 = addr;
            }
            Err(err)
        }
    }
}

fn ip_mask(state: &CpuState) -> u64 {
    match state.mode {
        CpuMode::Real => 0xFFFF,
        CpuMode::Long if !state.compatibility_mode => u64::MAX,
        _ => {
            if state.segments.cs.default_big() {
                0xFFFF_FFFF
            } else {
                0xFFFF
            }
        }
    }
}

fn lock_allowed(d: &Decoded) -> bool {
    let has_mem = d.modrm.map(|m| !m.is_register()).unwrap_or(false);
    if !has_mem {
        return false;
    }
    match d.opcode {
        Opcode::Primary(op) => matches!(
            op,
            0x00 | 0x01 | 0x08 | 0x09 | 0x10 | 0x11 | 0x18 | 0x19 | 0x20 | 0x21 | 0x28 | 0x29
                | 0x30 | 0x31 | 0x80 | 0x81 | 0x83 | 0x86 | 0x87 | 0xF6 | 0xF7 | 0xFE | 0xFF
        ),
        Opcode::TwoByte(op) => {
            matches!(op, 0xAB | 0xB3 | 0xBB | 0xB0 | 0xB1 | 0xBA | 0xC0 | 0xC1 | 0xC7)
        }
        _ => false,
    }
}

pub(crate) struct Exec<'a, B: CpuBus> {
    pub st: &'a mut CpuState,
    pub bus: &'a mut B,
    pub d: Decoded,
    pub next_rip: u64,
    pub flow: Flow,
}

impl<'a, B: CpuBus> Exec<'a, B> {
    fn rex_present(&self) -> bool {
        self.st.prefixes.rex.is_some()
    }

    fn modrm(&self) -> ModRm {
        self.d.modrm.expect("opcode template declares a ModRM byte")
    }

    fn data_seg(&self, default: SegReg) -> SegReg {
        self.st.prefixes.segment.unwrap_or(default)
    }

    /// Resolves the ModRM memory operand to `(segment, offset)`. Offsets are
    /// already wrapped to the effective address size.
    fn ea(&mut self) -> Result<(SegReg, u64), Exception> {
        let modrm = self.modrm();
        debug_assert!(!modrm.is_register());
        let d = &self.d;
        let st = &self.st;
        let disp = d.disp as u64;

        if d.addr_size == Width::W16 {
            let rm = modrm.rm & 0b111;
            let (base, default_seg) = match rm {
                0 => (st.read_gpr16(3).wrapping_add(st.read_gpr16(6)), SegReg::Ds), // BX+SI
                1 => (st.read_gpr16(3).wrapping_add(st.read_gpr16(7)), SegReg::Ds), // BX+DI
                2 => (st.read_gpr16(5).wrapping_add(st.read_gpr16(6)), SegReg::Ss), // BP+SI
                3 => (st.read_gpr16(5).wrapping_add(st.read_gpr16(7)), SegReg::Ss), // BP+DI
                4 => (st.read_gpr16(6), SegReg::Ds),                                // SI
                5 => (st.read_gpr16(7), SegReg::Ds),                                // DI
                6 => {
                    if modrm.mode == 0 {
                        (0, SegReg::Ds) // disp16
                    } else {
                        (st.read_gpr16(5), SegReg::Ss) // BP
                    }
                }
                _ => (st.read_gpr16(3), SegReg::Ds), // BX
            };
            let offset = u64::from(base.wrapping_add(disp as u16));
            return Ok((self.data_seg(default_seg), offset));
        }

        let mask = d.addr_size.mask();
        let mut default_seg = SegReg::Ds;
        let offset = if let Some(sib) = modrm.sib {
            let scale = sib >> 6;
            let index_enc = (sib >> 3 & 0b111) | self.st.prefixes.rex_x() << 3;
            let base_enc = modrm.rm;
            let mut addr = 0u64;
            if index_enc != 0b100 {
                addr = st
                    .read_gpr64(usize::from(index_enc))
                    .wrapping_shl(u32::from(scale));
            }
            if modrm.mode == 0 && base_enc & 0b111 == 0b101 {
                // disp32, no base register.
            } else {
                if matches!(base_enc & 0b111, 0b100 | 0b101) {
                    default_seg = SegReg::Ss;
                }
                addr = addr.wrapping_add(st.read_gpr64(usize::from(base_enc)));
            }
            addr.wrapping_add(disp)
        } else if modrm.mode == 0 && modrm.rm & 0b111 == 0b101 {
            if st.is_64bit() {
                // RIP-relative: displacement from the end of the instruction.
                self.next_rip.wrapping_add(disp)
            } else {
                disp
            }
        } else {
            if modrm.rm & 0b111 == 0b101 {
                default_seg = SegReg::Ss;
            }
            st.read_gpr64(usize::from(modrm.rm)).wrapping_add(disp)
        };

        Ok((self.data_seg(default_seg), offset & mask))
    }

    fn read_mem(&mut self, seg: SegReg, offset: u64, w: Width) -> Result<u64, Exception> {
        let lin = segmentation::segment_offset_linear(
            self.st,
            seg,
            offset,
            u32::from(w.bytes()),
            self.d.addr_size,
        )?;
        Ok(match w {
            Width::W8 => u64::from(self.bus.read_u8(lin)?),
            Width::W16 => u64::from(self.bus.read_u16(lin)?),
            Width::W32 => u64::from(self.bus.read_u32(lin)?),
            Width::W64 => self.bus.read_u64(lin)?,
        })
    }

    fn write_mem(&mut self, seg: SegReg, offset: u64, w: Width, value: u64) -> Result<(), Exception> {
        let lin = segmentation::segment_offset_linear(
            self.st,
            seg,
            offset,
            u32::from(w.bytes()),
            self.d.addr_size,
        )?;
        match w {
            Width::W8 => self.bus.write_u8(lin, value as u8),
            Width::W16 => self.bus.write_u16(lin, value as u16),
            Width::W32 => self.bus.write_u32(lin, value as u32),
            Width::W64 => self.bus.write_u64(lin, value),
        }
    }

    fn rm_read(&mut self, w: Width) -> Result<u64, Exception> {
        let modrm = self.modrm();
        if modrm.is_register() {
            Ok(self.st.read_gpr(w, modrm.rm, self.rex_present()))
        } else {
            let (seg, off) = self.ea()?;
            self.read_mem(seg, off, w)
        }
    }

    fn rm_write(&mut self, w: Width, value: u64) -> Result<(), Exception> {
        let modrm = self.modrm();
        if modrm.is_register() {
            self.st.write_gpr(w, modrm.rm, self.rex_present(), value);
            Ok(())
        } else {
            let (seg, off) = self.ea()?;
            self.write_mem(seg, off, w, value)
        }
    }

    fn reg_read(&self, w: Width) -> u64 {
        self.st.read_gpr(w, self.modrm().reg, self.rex_present())
    }

    fn reg_write(&mut self, w: Width, value: u64) {
        let reg = self.modrm().reg;
        let rex = self.rex_present();
        self.st.write_gpr(w, reg, rex, value);
    }

    /// Width of stack pushes/pops: 64-bit mode promotes to 64 (0x66 demotes
    /// to 16); elsewhere the operand size rules.
    fn stack_width(&self) -> Width {
        if self.st.is_64bit() {
            if self.st.prefixes.operand_size {
                Width::W16
            } else {
                Width::W64
            }
        } else {
            self.d.op_size
        }
    }

    /// Width of RSP arithmetic, from the SS descriptor's B bit.
    fn stack_addr_width(&self) -> Width {
        if self.st.is_64bit() {
            Width::W64
        } else if self.st.segments.ss.default_big() {
            Width::W32
        } else {
            Width::W16
        }
    }

    fn rsp_read(&self) -> u64 {
        self.st.read_gpr64(4) & self.stack_addr_width().mask()
    }

    pub(crate) fn rsp_write(&mut self, value: u64) {
        let w = self.stack_addr_width();
        match w {
            Width::W16 => self.st.write_gpr16(4, value as u16),
            Width::W32 => self.st.write_gpr32(4, value as u32),
            _ => self.st.write_gpr64(4, value),
        }
    }

    fn push(&mut self, w: Width, value: u64) -> Result<(), Exception> {
        let sp = self
            .rsp_read()
            .wrapping_sub(u64::from(w.bytes()))
            & self.stack_addr_width().mask();
        let lin = segmentation::segment_offset_linear(
            self.st,
            SegReg::Ss,
            sp,
            u32::from(w.bytes()),
            self.stack_addr_width(),
        )?;
        match w {
            Width::W16 => self.bus.write_u16(lin, value as u16)?,
            Width::W32 => self.bus.write_u32(lin, value as u32)?,
            _ => self.bus.write_u64(lin, value)?,
        }
        self.rsp_write(sp);
        Ok(())
    }

    pub(crate) fn pop(&mut self, w: Width) -> Result<u64, Exception> {
        let sp = self.rsp_read();
        let lin = segmentation::segment_offset_linear(
            self.st,
            SegReg::Ss,
            sp,
            u32::from(w.bytes()),
            self.stack_addr_width(),
        )?;
        let value = match w {
            Width::W16 => u64::from(self.bus.read_u16(lin)?),
            Width::W32 => u64::from(self.bus.read_u32(lin)?),
            _ => self.bus.read_u64(lin)?,
        };
        self.rsp_write(sp.wrapping_add(u64::from(w.bytes())));
        Ok(value)
    }

    fn acc_read(&self, w: Width) -> u64 {
        self.st.read_gpr(w, 0, true)
    }

    fn acc_write(&mut self, w: Width, value: u64) {
        self.st.write_gpr(w, 0, true, value);
    }
}

fn dispatch<B: CpuBus>(ex: &mut Exec<'_, B>) -> Result<(), Exception> {
    match ex.d.opcode {
        Opcode::Primary(op) => dispatch_primary(ex, op),
        Opcode::TwoByte(op) => dispatch_two_byte(ex, op),
        Opcode::ThreeByte38(_) | Opcode::ThreeByte3A(_) => Err(Exception::InvalidOpcode),
    }
}

fn dispatch_primary<B: CpuBus>(ex: &mut Exec<'_, B>, op: u8) -> Result<(), Exception> {
    let w = ex.d.op_size;
    match op {
        // ALU blocks: 8 ops x 6 encodings.
        0x00..=0x3D if op & 0b111 <= 5 && !matches!(op, 0x0F | 0x26 | 0x2E | 0x36 | 0x3E) => {
            let alu_op = AluOp::from_block(op >> 3);
            match op & 0b111 {
                0 => {
                    // r/m8, r8
                    let dst = ex.rm_read(Width::W8)?;
                    let src = ex.reg_read(Width::W8);
                    let res = alu::alu(ex.st, alu_op, Width::W8, dst, src);
                    if alu_op.writes_back() {
                        ex.rm_write(Width::W8, res)?;
                    }
                }
                1 => {
                    let dst = ex.rm_read(w)?;
                    let src = ex.reg_read(w);
                    let res = alu::alu(ex.st, alu_op, w, dst, src);
                    if alu_op.writes_back() {
                        ex.rm_write(w, res)?;
                    }
                }
                2 => {
                    let dst = ex.reg_read(Width::W8);
                    let src = ex.rm_read(Width::W8)?;
                    let res = alu::alu(ex.st, alu_op, Width::W8, dst, src);
                    if alu_op.writes_back() {
                        ex.reg_write(Width::W8, res);
                    }
                }
                3 => {
                    let dst = ex.reg_read(w);
                    let src = ex.rm_read(w)?;
                    let res = alu::alu(ex.st, alu_op, w, dst, src);
                    if alu_op.writes_back() {
                        ex.reg_write(w, res);
                    }
                }
                4 => {
                    let dst = ex.acc_read(Width::W8);
                    let res = alu::alu(ex.st, alu_op, Width::W8, dst, ex.d.imm);
                    if alu_op.writes_back() {
                        ex.acc_write(Width::W8, res);
                    }
                }
                _ => {
                    let dst = ex.acc_read(w);
                    let src = ex.d.imm_for_alu();
                    let res = alu::alu(ex.st, alu_op, w, dst, src);
                    if alu_op.writes_back() {
                        ex.acc_write(w, res);
                    }
                }
            }
            Ok(())
        }

        // PUSH/POP segment registers (legacy modes only).
        0x06 | 0x0E | 0x16 | 0x1E => {
            if ex.st.is_64bit() {
                return Err(Exception::InvalidOpcode);
            }
            let seg = match op {
                0x06 => SegReg::Es,
                0x0E => SegReg::Cs,
                0x16 => SegReg::Ss,
                _ => SegReg::Ds,
            };
            let sel = u64::from(ex.st.segments.get(seg).selector);
            ex.push(ex.stack_width(), sel)
        }
        0x07 | 0x17 | 0x1F => {
            if ex.st.is_64bit() {
                return Err(Exception::InvalidOpcode);
            }
            let seg = match op {
                0x07 => SegReg::Es,
                0x17 => SegReg::Ss,
                _ => SegReg::Ds,
            };
            let sel = ex.pop(ex.stack_width())? as u16;
            segmentation::load_data_segment(ex.st, ex.bus, seg, sel)?;
            if seg == SegReg::Ss {
                ex.st.interrupt_shadow = 2;
            }
            Ok(())
        }

        0x27 | 0x2F | 0x37 | 0x3F => system::bcd_adjust(ex, op),

        // INC/DEC r16/r32 (decoded as REX in 64-bit mode and never reaches
        // here there).
        0x40..=0x4F => {
            if ex.st.is_64bit() {
                return Err(Exception::InvalidOpcode);
            }
            let enc = op & 0b111;
            let dec = op & 0x08 != 0;
            let value = ex.st.read_gpr(w, enc, true);
            let res = alu::inc_dec_with_flags(ex.st, w, value, dec);
            ex.st.write_gpr(w, enc, true, res);
            Ok(())
        }

        0x50..=0x57 => {
            let enc = (op & 0b111) | ex.st.prefixes.rex_b() << 3;
            let sw = ex.stack_width();
            let value = ex.st.read_gpr(sw, enc, true);
            ex.push(sw, value)
        }
        0x58..=0x5F => {
            let enc = (op & 0b111) | ex.st.prefixes.rex_b() << 3;
            let sw = ex.stack_width();
            let value = ex.pop(sw)?;
            ex.st.write_gpr(sw, enc, true, value);
            Ok(())
        }

        0x60 => system::pusha(ex),
        0x61 => system::popa(ex),
        0x62 => system::bound(ex),
        0x63 => {
            if ex.st.is_64bit() {
                // MOVSXD r, r/m32.
                let src = ex.rm_read(Width::W32)?;
                if ex.st.prefixes.rex_w() {
                    ex.reg_write(Width::W64, i64::from(src as u32 as i32) as u64);
                } else {
                    ex.reg_write(Width::W32, src);
                }
                Ok(())
            } else {
                system::arpl(ex)
            }
        }

        0x68 => {
            let value = (ex.d.imm_sext() as u64) & ex.stack_width().mask();
            ex.push(ex.stack_width(), value)
        }
        0x6A => {
            let value = (ex.d.imm_sext() as u64) & ex.stack_width().mask();
            ex.push(ex.stack_width(), value)
        }
        0x69 | 0x6B => {
            let src = ex.rm_read(w)?;
            let (lo, _hi) = alu::mul_signed(ex.st, w, src, ex.d.imm_for_alu());
            ex.reg_write(w, lo);
            Ok(())
        }

        0x6C..=0x6F => string::ins_outs(ex, op),

        0x70..=0x7F => {
            if alu::condition(ex.st, op & 0xF) {
                branch::jump_rel(ex);
            }
            Ok(())
        }

        0x80..=0x83 => {
            let w = if op & 1 == 0 { Width::W8 } else { w };
            let alu_op = AluOp::from_block(ex.modrm().reg);
            let dst = ex.rm_read(w)?;
            let src = (ex.d.imm_sext() as u64) & w.mask();
            let res = alu::alu(ex.st, alu_op, w, dst, src);
            if alu_op.writes_back() {
                ex.rm_write(w, res)?;
            }
            Ok(())
        }

        0x84 | 0x85 => {
            let w = if op == 0x84 { Width::W8 } else { w };
            let a = ex.rm_read(w)?;
            let b = ex.reg_read(w);
            alu::set_logic_flags(ex.st, w, a & b);
            Ok(())
        }
        0x86 | 0x87 => {
            let w = if op == 0x86 { Width::W8 } else { w };
            let rm = ex.rm_read(w)?;
            let reg = ex.reg_read(w);
            ex.rm_write(w, reg)?;
            ex.reg_write(w, rm);
            Ok(())
        }

        0x88 | 0x89 => {
            let w = if op == 0x88 { Width::W8 } else { w };
            let value = ex.reg_read(w);
            ex.rm_write(w, value)
        }
        0x8A | 0x8B => {
            let w = if op == 0x8A { Width::W8 } else { w };
            let value = ex.rm_read(w)?;
            ex.reg_write(w, value);
            Ok(())
        }
        0x8C => {
            // MOV r/m16, Sreg (register destinations widen with zero-extend).
            let seg =
                SegReg::from_encoding(ex.modrm().reg & 0b111).ok_or(Exception::InvalidOpcode)?;
            let sel = u64::from(ex.st.segments.get(seg).selector);
            if ex.modrm().is_register() {
                ex.rm_write(w, sel)
            } else {
                ex.rm_write(Width::W16, sel)
            }
        }
        0x8D => {
            // LEA: address arithmetic only, no memory access.
            if ex.modrm().is_register() {
                return Err(Exception::InvalidOpcode);
            }
            let (_seg, offset) = ex.ea()?;
            ex.reg_write(w, offset & w.mask());
            Ok(())
        }
        0x8E => {
            let seg =
                SegReg::from_encoding(ex.modrm().reg & 0b111).ok_or(Exception::InvalidOpcode)?;
            if seg == SegReg::Cs {
                return Err(Exception::InvalidOpcode);
            }
            let sel = ex.rm_read(Width::W16)? as u16;
            segmentation::load_data_segment(ex.st, ex.bus, seg, sel)?;
            if seg == SegReg::Ss {
                ex.st.interrupt_shadow = 2;
            }
            Ok(())
        }
        0x8F => {
            if ex.modrm().reg & 0b111 != 0 {
                return Err(Exception::InvalidOpcode);
            }
            let sw = ex.stack_width();
            let value = ex.pop(sw)?;
            ex.rm_write(sw, value)
        }

        0x90..=0x97 => {
            let enc = (op & 0b111) | ex.st.prefixes.rex_b() << 3;
            if enc == 0 {
                // NOP (including F3 90 PAUSE).
                return Ok(());
            }
            let acc = ex.acc_read(w);
            let other = ex.st.read_gpr(w, enc, true);
            ex.acc_write(w, other);
            ex.st.write_gpr(w, enc, true, acc);
            Ok(())
        }

        0x98 => {
            // CBW/CWDE/CDQE.
            let value = match w {
                Width::W16 => i64::from(ex.acc_read(Width::W8) as u8 as i8) as u64,
                Width::W32 => i64::from(ex.acc_read(Width::W16) as u16 as i16) as u64,
                _ => i64::from(ex.acc_read(Width::W32) as u32 as i32) as u64,
            };
            ex.acc_write(w, value & w.mask());
            Ok(())
        }
        0x99 => {
            // CWD/CDQ/CQO: sign of the accumulator fills rDX.
            let negative = ex.acc_read(w) & w.sign_bit() != 0;
            let fill = if negative { w.mask() } else { 0 };
            ex.st.write_gpr(w, 2, true, fill);
            Ok(())
        }

        0x9A => branch::call_far_direct(ex),
        0x9B => Ok(()), // WAIT/FWAIT
        0x9C => system::pushf(ex),
        0x9D => system::popf(ex),
        0x9E => {
            // SAHF.
            let ah = ex.st.read_gpr8(0, true);
            let flags = ex.st.rflags() & !0xFF | u64::from(ah) & 0b1101_0101;
            ex.st.set_rflags(flags);
            Ok(())
        }
        0x9F => {
            // LAHF.
            let flags = (ex.st.rflags() & 0b1101_0101 | 0b10) as u8;
            ex.st.write_gpr8(0, true, flags);
            Ok(())
        }

        0xA0..=0xA3 => {
            // MOV accumulator <-> moffs.
            let w = if op & 1 == 0 { Width::W8 } else { w };
            let seg = ex.data_seg(SegReg::Ds);
            let offset = ex.d.imm;
            if op < 0xA2 {
                let value = ex.read_mem(seg, offset, w)?;
                ex.acc_write(w, value);
            } else {
                let value = ex.acc_read(w);
                ex.write_mem(seg, offset, w, value)?;
            }
            Ok(())
        }

        0xA4 | 0xA5 => string::movs(ex),
        0xA6 | 0xA7 => string::cmps(ex),
        0xA8 | 0xA9 => {
            let w = if op == 0xA8 { Width::W8 } else { w };
            let a = ex.acc_read(w);
            alu::set_logic_flags(ex.st, w, a & ex.d.imm_for_alu());
            Ok(())
        }
        0xAA | 0xAB => string::stos(ex),
        0xAC | 0xAD => string::lods(ex),
        0xAE | 0xAF => string::scas(ex),

        0xB0..=0xB7 => {
            let enc = (op & 0b111) | ex.st.prefixes.rex_b() << 3;
            let rex = ex.rex_present();
            ex.st.write_gpr(Width::W8, enc, rex, ex.d.imm);
            Ok(())
        }
        0xB8..=0xBF => {
            let enc = (op & 0b111) | ex.st.prefixes.rex_b() << 3;
            ex.st.write_gpr(w, enc, true, ex.d.imm);
            Ok(())
        }

        0xC0 | 0xC1 | 0xD0..=0xD3 => {
            let w = if op & 1 == 0 { Width::W8 } else { w };
            let count = match op {
                0xC0 | 0xC1 => ex.d.imm,
                0xD0 | 0xD1 => 1,
                _ => u64::from(ex.st.read_gpr8(1, false)), // CL
            };
            let value = ex.rm_read(w)?;
            let index = ex.modrm().reg;
            let result = alu::shift(ex.st, index, w, value, count);
            ex.rm_write(w, result)
        }

        0xC2 | 0xC3 => branch::ret_near(ex, op == 0xC2),
        0xC4 | 0xC5 => {
            let seg = if op == 0xC4 { SegReg::Es } else { SegReg::Ds };
            system::load_far_pointer(ex, seg)
        }
        0xC6 | 0xC7 => {
            let w = if op == 0xC6 { Width::W8 } else { w };
            let value = (ex.d.imm_sext() as u64) & w.mask();
            ex.rm_write(w, value)
        }
        0xC8 => system::enter(ex),
        0xC9 => system::leave(ex),
        0xCA | 0xCB => branch::ret_far(ex, op == 0xCA),

        0xCC => interrupts::software_interrupt(ex, 3),
        0xCD => {
            let vector = ex.d.imm as u8;
            interrupts::software_interrupt(ex, vector)
        }
        0xCE => {
            if ex.st.is_64bit() {
                return Err(Exception::InvalidOpcode);
            }
            if ex.st.flag(RFLAGS_OF) {
                interrupts::software_interrupt(ex, 4)
            } else {
                Ok(())
            }
        }
        0xCF => interrupts::iret(ex),

        0xD4 => system::aam(ex),
        0xD5 => system::aad(ex),
        0xD6 => {
            // SALC.
            if ex.st.is_64bit() {
                return Err(Exception::InvalidOpcode);
            }
            let value = if ex.st.flag(crate::state::RFLAGS_CF) { 0xFF } else { 0 };
            ex.st.write_gpr8(0, false, value);
            Ok(())
        }
        0xD7 => {
            // XLAT: AL = [rBX + AL].
            let seg = ex.data_seg(SegReg::Ds);
            let base = ex.st.read_gpr64(3) & ex.d.addr_size.mask();
            let offset =
                base.wrapping_add(u64::from(ex.st.read_gpr8(0, false))) & ex.d.addr_size.mask();
            let value = ex.read_mem(seg, offset, Width::W8)?;
            ex.st.write_gpr8(0, false, value as u8);
            Ok(())
        }

        // x87 escapes: accepted and ignored; the operand (if any) is decoded
        // but not touched.
        0xD8..=0xDF => Ok(()),

        0xE0..=0xE3 => branch::loop_group(ex, op),

        0xE4 | 0xE5 | 0xEC | 0xED => {
            let w = if op & 1 == 0 {
                Width::W8
            } else if w == Width::W64 {
                Width::W32
            } else {
                w
            };
            system::check_io_permission(ex.st)?;
            let port = if op < 0xEC {
                ex.d.imm as u16
            } else {
                ex.st.read_gpr16(2)
            };
            let value = u64::from(ex.bus.io_read(port, w.bytes()));
            ex.acc_write(w, value & w.mask());
            Ok(())
        }
        0xE6 | 0xE7 | 0xEE | 0xEF => {
            let w = if op & 1 == 0 {
                Width::W8
            } else if w == Width::W64 {
                Width::W32
            } else {
                w
            };
            system::check_io_permission(ex.st)?;
            let port = if op < 0xEE {
                ex.d.imm as u16
            } else {
                ex.st.read_gpr16(2)
            };
            let value = ex.acc_read(w) as u32;
            ex.bus.io_write(port, w.bytes(), value);
            Ok(())
        }

        0xE8 => branch::call_rel(ex),
        0xE9 | 0xEB => {
            branch::jump_rel(ex);
            Ok(())
        }
        0xEA => branch::jump_far_direct(ex),

        0xF1 => interrupts::software_interrupt(ex, 1),
        0xF4 => system::hlt(ex),
        0xF5 => {
            let cf = ex.st.flag(crate::state::RFLAGS_CF);
            ex.st.set_flag(crate::state::RFLAGS_CF, !cf);
            Ok(())
        }
        0xF6 | 0xF7 => system::group3(ex, op),
        0xF8 => {
            ex.st.set_flag(crate::state::RFLAGS_CF, false);
            Ok(())
        }
        0xF9 => {
            ex.st.set_flag(crate::state::RFLAGS_CF, true);
            Ok(())
        }
        0xFA | 0xFB => system::cli_sti(ex, op == 0xFB),
        0xFC => {
            ex.st.set_flag(RFLAGS_DF, false);
            Ok(())
        }
        0xFD => {
            ex.st.set_flag(RFLAGS_DF, true);
            Ok(())
        }
        0xFE => {
            let dec = match ex.modrm().reg & 0b111 {
                0 => false,
                1 => true,
                _ => return Err(Exception::InvalidOpcode),
            };
            let value = ex.rm_read(Width::W8)?;
            let res = alu::inc_dec_with_flags(ex.st, Width::W8, value, dec);
            ex.rm_write(Width::W8, res)
        }
        0xFF => system::group5(ex),

        _ => Err(Exception::InvalidOpcode),
    }
}

fn dispatch_two_byte<B: CpuBus>(ex: &mut Exec<'_, B>, op: u8) -> Result<(), Exception> {
    let w = ex.d.op_size;
    match op {
        0x00 => system::group6(ex),
        0x01 => system::group7(ex),
        0x02 => system::lar(ex),
        0x03 => system::lsl(ex),
        0x05 => system::syscall(ex),
        0x06 => system::clts(ex),
        0x07 => system::sysret(ex),
        0x08 | 0x09 => {
            // INVD/WBINVD: privileged cache management, no caches to manage.
            if ex.st.cpl() != 0 {
                return Err(Exception::gp0());
            }
            Ok(())
        }
        0x0B => Err(Exception::InvalidOpcode), // UD2
        0x0D | 0x18..=0x1F => Ok(()),          // prefetch/hint NOP space

        0x20 | 0x22 => system::mov_control(ex, op == 0x22),
        0x21 | 0x23 => system::mov_debug(ex),

        0x30 => system::wrmsr(ex),
        0x31 => system::rdtsc(ex),
        0x32 => system::rdmsr(ex),
        0x33 => {
            // RDPMC: no performance counters; return zeros.
            if ex.st.cpl() != 0 {
                return Err(Exception::gp0());
            }
            ex.st.write_gpr32(0, 0);
            ex.st.write_gpr32(2, 0);
            Ok(())
        }

        0x40..=0x4F => {
            // CMOVcc: the load happens regardless of the condition.
            let src = ex.rm_read(w)?;
            let value = if alu::condition(ex.st, op & 0xF) {
                src
            } else {
                ex.reg_read(w)
            };
            ex.reg_write(w, value);
            Ok(())
        }

        0x80..=0x8F => {
            if alu::condition(ex.st, op & 0xF) {
                branch::jump_rel(ex);
            }
            Ok(())
        }
        0x90..=0x9F => {
            let value = u64::from(alu::condition(ex.st, op & 0xF));
            ex.rm_write(Width::W8, value)
        }

        0xA0 | 0xA8 => {
            let seg = if op == 0xA0 { SegReg::Fs } else { SegReg::Gs };
            let sel = u64::from(ex.st.segments.get(seg).selector);
            ex.push(ex.stack_width(), sel)
        }
        0xA1 | 0xA9 => {
            let seg = if op == 0xA1 { SegReg::Fs } else { SegReg::Gs };
            let sel = ex.pop(ex.stack_width())? as u16;
            segmentation::load_data_segment(ex.st, ex.bus, seg, sel)
        }
        0xA2 => system::cpuid(ex),

        0xA3 | 0xAB | 0xB3 | 0xBB => system::bit_test_reg(ex, op),
        0xBA => system::bit_test_imm(ex),

        0xA4 | 0xA5 | 0xAC | 0xAD => {
            let count = if op & 1 == 0 {
                ex.d.imm
            } else {
                u64::from(ex.st.read_gpr8(1, false))
            };
            let left = op < 0xA8;
            let value = ex.rm_read(w)?;
            let filler = ex.reg_read(w);
            let result = alu::double_shift(ex.st, w, value, filler, count, left);
            ex.rm_write(w, result)
        }

        0xAF => {
            let dst = ex.reg_read(w);
            let src = ex.rm_read(w)?;
            let (lo, _hi) = alu::mul_signed(ex.st, w, dst, src);
            ex.reg_write(w, lo);
            Ok(())
        }

        0xB0 | 0xB1 => system::cmpxchg(ex, op == 0xB0),
        0xB2 => system::load_far_pointer(ex, SegReg::Ss),
        0xB4 => system::load_far_pointer(ex, SegReg::Fs),
        0xB5 => system::load_far_pointer(ex, SegReg::Gs),

        0xB6 | 0xB7 => {
            // MOVZX.
            let src_w = if op == 0xB6 { Width::W8 } else { Width::W16 };
            let value = ex.rm_read(src_w)?;
            ex.reg_write(w, value);
            Ok(())
        }
        0xBE | 0xBF => {
            let src_w = if op == 0xBE { Width::W8 } else { Width::W16 };
            let value = ex.rm_read(src_w)?;
            let extended = match src_w {
                Width::W8 => i64::from(value as u8 as i8) as u64,
                _ => i64::from(value as u16 as i16) as u64,
            };
            ex.reg_write(w, extended & w.mask());
            Ok(())
        }

        0xBC | 0xBD => system::bit_scan(ex, op == 0xBC),

        0xC0 | 0xC1 => {
            // XADD.
            let w = if op == 0xC0 { Width::W8 } else { w };
            let rm = ex.rm_read(w)?;
            let reg = ex.reg_read(w);
            let sum = alu::add_with_flags(ex.st, w, rm, reg, false);
            ex.reg_write(w, rm);
            ex.rm_write(w, sum)
        }
        0xC7 => system::cmpxchg8b(ex),
        0xC8..=0xCF => {
            // BSWAP.
            let enc = (op & 0b111) | ex.st.prefixes.rex_b() << 3;
            let value = ex.st.read_gpr(w, enc, true);
            let swapped = match w {
                Width::W64 => value.swap_bytes(),
                Width::W32 => u64::from((value as u32).swap_bytes()),
                _ => u64::from((value as u16).swap_bytes()),
            };
            ex.st.write_gpr(w, enc, true, swapped);
            Ok(())
        }

        _ => Err(Exception::InvalidOpcode),
    }
}
