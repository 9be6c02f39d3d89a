//! Instruction decode: prefix loop, opcode escapes, ModRM/SIB and immediate
//! capture. The decoder is table-driven per opcode byte; handler selection
//! happens in the interpreter's dispatch match.

use machina_x86::{SegReg, Width};

use crate::mem::CpuBus;
use crate::state::{CpuState, Prefixes, RepPrefix, Rex};
use crate::Exception;

pub const MAX_INSTR_LEN: u8 = 15;

/// Opcode with the escape plane folded in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Primary(u8),
    TwoByte(u8),
    ThreeByte38(u8),
    ThreeByte3A(u8),
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ModRm {
    pub mode: u8,
    /// REX.R-extended reg field.
    pub reg: u8,
    /// REX.B-extended rm field (base register when a SIB byte is present).
    pub rm: u8,
    pub sib: Option<u8>,
}

impl ModRm {
    pub fn is_register(&self) -> bool {
        self.mode == 0b11
    }
}

/// Immediate shapes named by the opcode tables (SDM operand codes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Imm {
    None,
    /// 8-bit.
    Ib,
    /// 16-bit regardless of operand size (RET/RETF/ENTER).
    Iw,
    /// Operand-size immediate capped at 32 bits.
    Iz,
    /// Full operand-size immediate (MOV r64, imm64).
    Iv,
    /// 8-bit relative branch target.
    Jb,
    /// Operand-size relative branch target (16/32).
    Jz,
    /// Far pointer: offset (operand size) + 16-bit selector.
    Ap,
    /// Address-size absolute offset (MOV AL/eAX, moffs).
    Ob,
    /// ENTER: 16-bit then 8-bit.
    IwIb,
}

struct Template {
    modrm: bool,
    imm: Imm,
}

const fn t(modrm: bool, imm: Imm) -> Template {
    Template { modrm, imm }
}

fn primary_template(op: u8) -> Result<Template, Exception> {
    Ok(match op {
        // ALU op blocks: 00-03 modrm forms, 04/05 accumulator-immediate.
        0x00..=0x03
        | 0x08..=0x0B
        | 0x10..=0x13
        | 0x18..=0x1B
        | 0x20..=0x23
        | 0x28..=0x2B
        | 0x30..=0x33
        | 0x38..=0x3B => t(true, Imm::None),
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => t(false, Imm::Ib),
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => t(false, Imm::Iz),
        // PUSH/POP seg, BCD adjusts, INC/DEC/PUSH/POP r.
        0x06 | 0x07 | 0x0E | 0x16 | 0x17 | 0x1E | 0x1F => t(false, Imm::None),
        0x27 | 0x2F | 0x37 | 0x3F => t(false, Imm::None),
        0x40..=0x5F => t(false, Imm::None),
        0x60 | 0x61 => t(false, Imm::None),
        0x62 => t(true, Imm::None),
        0x63 => t(true, Imm::None),
        0x68 => t(false, Imm::Iz),
        0x69 => t(true, Imm::Iz),
        0x6A => t(false, Imm::Ib),
        0x6B => t(true, Imm::Ib),
        0x6C..=0x6F => t(false, Imm::None),
        0x70..=0x7F => t(false, Imm::Jb),
        0x80 | 0x82 => t(true, Imm::Ib),
        0x81 => t(true, Imm::Iz),
        0x83 => t(true, Imm::Ib),
        0x84..=0x8E => t(true, Imm::None),
        0x8F => t(true, Imm::None),
        0x90..=0x97 => t(false, Imm::None),
        0x98 | 0x99 | 0x9B..=0x9F => t(false, Imm::None),
        0x9A => t(false, Imm::Ap),
        0xA0..=0xA3 => t(false, Imm::Ob),
        0xA4..=0xA7 => t(false, Imm::None),
        0xA8 => t(false, Imm::Ib),
        0xA9 => t(false, Imm::Iz),
        0xAA..=0xAF => t(false, Imm::None),
        0xB0..=0xB7 => t(false, Imm::Ib),
        0xB8..=0xBF => t(false, Imm::Iv),
        0xC0 | 0xC1 => t(true, Imm::Ib),
        0xC2 => t(false, Imm::Iw),
        0xC3 => t(false, Imm::None),
        0xC4 | 0xC5 => t(true, Imm::None),
        0xC6 => t(true, Imm::Ib),
        0xC7 => t(true, Imm::Iz),
        0xC8 => t(false, Imm::IwIb),
        0xC9 => t(false, Imm::None),
        0xCA => t(false, Imm::Iw),
        0xCB | 0xCC | 0xCE | 0xCF => t(false, Imm::None),
        0xCD => t(false, Imm::Ib),
        0xD0..=0xD3 => t(true, Imm::None),
        0xD4 | 0xD5 => t(false, Imm::Ib),
        0xD6 | 0xD7 => t(false, Imm::None),
        // x87 escapes: operands are consumed, the op itself is a no-op here.
        0xD8..=0xDF => t(true, Imm::None),
        0xE0..=0xE3 => t(false, Imm::Jb),
        0xE4 | 0xE5 | 0xE6 | 0xE7 => t(false, Imm::Ib),
        0xE8 | 0xE9 => t(false, Imm::Jz),
        0xEA => t(false, Imm::Ap),
        0xEB => t(false, Imm::Jb),
        0xEC..=0xEF => t(false, Imm::None),
        0xF1 | 0xF4 | 0xF5 | 0xF8..=0xFD => t(false, Imm::None),
        // Group 3: the TEST forms (/0, /1) carry an immediate, discovered
        // after the ModRM byte is read.
        0xF6 | 0xF7 => t(true, Imm::None),
        0xFE | 0xFF => t(true, Imm::None),
        _ => return Err(Exception::InvalidOpcode),
    })
}

fn two_byte_template(op: u8) -> Result<Template, Exception> {
    Ok(match op {
        0x00 | 0x01 | 0x02 | 0x03 => t(true, Imm::None),
        0x05 | 0x06 | 0x07 | 0x08 | 0x09 | 0x0B => t(false, Imm::None),
        0x0D => t(true, Imm::None),
        0x18..=0x1F => t(true, Imm::None),
        0x20..=0x23 => t(true, Imm::None),
        0x30..=0x33 => t(false, Imm::None),
        0x40..=0x4F => t(true, Imm::None),
        0x80..=0x8F => t(false, Imm::Jz),
        0x90..=0x9F => t(true, Imm::None),
        0xA0 | 0xA1 | 0xA2 => t(false, Imm::None),
        0xA3 => t(true, Imm::None),
        0xA4 => t(true, Imm::Ib),
        0xA5 => t(true, Imm::None),
        0xA8 | 0xA9 => t(false, Imm::None),
        0xAB | 0xAF => t(true, Imm::None),
        0xAC => t(true, Imm::Ib),
        0xAD => t(true, Imm::None),
        0xB0 | 0xB1 | 0xB2 | 0xB3 | 0xB4 | 0xB5 | 0xB6 | 0xB7 => t(true, Imm::None),
        0xBA => t(true, Imm::Ib),
        0xBB..=0xBF => t(true, Imm::None),
        0xC0 | 0xC1 => t(true, Imm::None),
        0xC7 => t(true, Imm::None),
        0xC8..=0xCF => t(false, Imm::None),
        _ => return Err(Exception::InvalidOpcode),
    })
}

/// A fully decoded instruction, ready for dispatch.
#[derive(Clone, Copy, Debug)]
pub struct Decoded {
    pub opcode: Opcode,
    pub modrm: Option<ModRm>,
    pub disp: i64,
    pub imm: u64,
    pub imm_width: Width,
    /// Second immediate: far-pointer selector, ENTER nesting level.
    pub imm2: u64,
    pub len: u8,
    pub op_size: Width,
    pub addr_size: Width,
}

/// Streams instruction bytes through the bus, bounding the fetch window.
pub struct Fetcher<'a, B: CpuBus> {
    bus: &'a mut B,
    base: u64,
    len: u8,
}

impl<'a, B: CpuBus> Fetcher<'a, B> {
    pub fn new(bus: &'a mut B, base: u64) -> Self {
        Self { bus, base, len: 0 }
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    fn next_u8(&mut self) -> Result<u8, Exception> {
        if self.len >= MAX_INSTR_LEN {
            return Err(Exception::gp0());
        }
        let byte = self.bus.fetch_u8(self.base.wrapping_add(u64::from(self.len)))?;
        self.len += 1;
        Ok(byte)
    }

    fn next_u16(&mut self) -> Result<u16, Exception> {
        let lo = self.next_u8()?;
        let hi = self.next_u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn next_u32(&mut self) -> Result<u32, Exception> {
        let mut bytes = [0u8; 4];
        for b in &mut bytes {
            *b = self.next_u8()?;
        }
        Ok(u32::from_le_bytes(bytes))
    }

    fn next_u64(&mut self) -> Result<u64, Exception> {
        let mut bytes = [0u8; 8];
        for b in &mut bytes {
            *b = self.next_u8()?;
        }
        Ok(u64::from_le_bytes(bytes))
    }
}

fn effective_sizes(state: &CpuState, prefixes: &Prefixes) -> (Width, Width) {
    let op_size = if state.is_64bit() {
        if prefixes.rex_w() {
            // REX.W beats 0x66.
            Width::W64
        } else if prefixes.operand_size {
            Width::W16
        } else {
            Width::W32
        }
    } else {
        match (state.default_operand_size(), prefixes.operand_size) {
            (Width::W16, false) | (Width::W32, true) => Width::W16,
            _ => Width::W32,
        }
    };

    let addr_size = if state.is_64bit() {
        // 16-bit addressing does not exist in 64-bit mode.
        if prefixes.address_size {
            Width::W32
        } else {
            Width::W64
        }
    } else {
        match (state.default_address_size(), prefixes.address_size) {
            (Width::W16, false) | (Width::W32, true) => Width::W16,
            _ => Width::W32,
        }
    };

    (op_size, addr_size)
}

/// Decodes one instruction starting at the fetcher's base, recording prefix
/// state in `state.prefixes`.
pub fn decode<B: CpuBus>(
    state: &mut CpuState,
    fetch: &mut Fetcher<'_, B>,
) -> Result<Decoded, Exception> {
    let mut prefixes = Prefixes::default();
    let long64 = state.is_64bit();

    // Legacy prefixes: any count, any order, last of each class wins.
    let mut byte;
    loop {
        byte = fetch.next_u8()?;
        match byte {
            0x66 => prefixes.operand_size = true,
            0x67 => prefixes.address_size = true,
            0xF0 => prefixes.lock = true,
            0xF2 => prefixes.rep = RepPrefix::Repne,
            0xF3 => prefixes.rep = RepPrefix::Rep,
            0x26 => prefixes.segment = Some(SegReg::Es),
            0x2E => prefixes.segment = Some(SegReg::Cs),
            0x36 => prefixes.segment = Some(SegReg::Ss),
            0x3E => prefixes.segment = Some(SegReg::Ds),
            0x64 => prefixes.segment = Some(SegReg::Fs),
            0x65 => prefixes.segment = Some(SegReg::Gs),
            0x40..=0x4F if long64 => {
                // REX must immediately precede the opcode; a later legacy
                // prefix voids it, which re-entering this arm models.
                prefixes.rex = Some(Rex::from_byte(byte));
            }
            _ => break,
        }
        if !(0x40..=0x4F).contains(&byte) {
            // Any legacy prefix after REX cancels the REX.
            prefixes.rex = None;
        }
    }

    let opcode = if byte == 0x0F {
        let second = fetch.next_u8()?;
        match second {
            0x38 => Opcode::ThreeByte38(fetch.next_u8()?),
            0x3A => Opcode::ThreeByte3A(fetch.next_u8()?),
            _ => Opcode::TwoByte(second),
        }
    } else {
        Opcode::Primary(byte)
    };

    let template = match opcode {
        Opcode::Primary(op) => primary_template(op)?,
        Opcode::TwoByte(op) => two_byte_template(op)?,
        // The escape path is decoded, but no three-byte instruction is
        // implemented by this core.
        Opcode::ThreeByte38(_) | Opcode::ThreeByte3A(_) => {
            return Err(Exception::InvalidOpcode)
        }
    };

    let (op_size, addr_size) = effective_sizes(state, &prefixes);

    let mut decoded = Decoded {
        opcode,
        modrm: None,
        disp: 0,
        imm: 0,
        imm_width: Width::W8,
        imm2: 0,
        len: 0,
        op_size,
        addr_size,
    };

    if template.modrm {
        let modrm = parse_modrm(fetch, &prefixes, addr_size, &mut decoded)?;
        decoded.modrm = Some(modrm);
    }

    // Group 3 hides a TEST immediate behind /0 and /1. The opcode extension
    // is the low three reg bits; REX.R has no meaning for groups.
    let imm_kind = match (opcode, decoded.modrm) {
        (Opcode::Primary(0xF6), Some(m)) if m.reg & 0b111 <= 1 => Imm::Ib,
        (Opcode::Primary(0xF7), Some(m)) if m.reg & 0b111 <= 1 => Imm::Iz,
        _ => template.imm,
    };

    read_immediate(fetch, imm_kind, op_size, addr_size, &mut decoded)?;

    decoded.len = fetch.len();
    state.prefixes = prefixes;
    Ok(decoded)
}

fn parse_modrm<B: CpuBus>(
    fetch: &mut Fetcher<'_, B>,
    prefixes: &Prefixes,
    addr_size: Width,
    decoded: &mut Decoded,
) -> Result<ModRm, Exception> {
    let byte = fetch.next_u8()?;
    let mode = byte >> 6;
    let reg = (byte >> 3 & 0b111) | prefixes.rex_r() << 3;
    let mut rm = (byte & 0b111) | prefixes.rex_b() << 3;
    let mut sib = None;

    if mode != 0b11 {
        if addr_size == Width::W16 {
            match (mode, byte & 0b111) {
                (0, 0b110) => decoded.disp = i64::from(fetch.next_u16()? as i16),
                (1, _) => decoded.disp = i64::from(fetch.next_u8()? as i8),
                (2, _) => decoded.disp = i64::from(fetch.next_u16()? as i16),
                _ => {}
            }
        } else {
            if byte & 0b111 == 0b100 {
                // SIB byte; the encoded base replaces rm.
                let s = fetch.next_u8()?;
                sib = Some(s);
                rm = (s & 0b111) | prefixes.rex_b() << 3;
            }
            match (mode, byte & 0b111, sib) {
                // disp32-only (or RIP-relative in 64-bit mode).
                (0, 0b101, _) => decoded.disp = i64::from(fetch.next_u32()? as i32),
                (0, _, Some(s)) if s & 0b111 == 0b101 => {
                    decoded.disp = i64::from(fetch.next_u32()? as i32)
                }
                (1, _, _) => decoded.disp = i64::from(fetch.next_u8()? as i8),
                (2, _, _) => decoded.disp = i64::from(fetch.next_u32()? as i32),
                _ => {}
            }
        }
    }

    Ok(ModRm { mode, reg, rm, sib })
}

fn read_immediate<B: CpuBus>(
    fetch: &mut Fetcher<'_, B>,
    kind: Imm,
    op_size: Width,
    addr_size: Width,
    decoded: &mut Decoded,
) -> Result<(), Exception> {
    match kind {
        Imm::None => {}
        Imm::Ib | Imm::Jb => {
            decoded.imm = u64::from(fetch.next_u8()?);
            decoded.imm_width = Width::W8;
        }
        Imm::Iw => {
            decoded.imm = u64::from(fetch.next_u16()?);
            decoded.imm_width = Width::W16;
        }
        Imm::Iz | Imm::Jz => {
            if op_size == Width::W16 {
                decoded.imm = u64::from(fetch.next_u16()?);
                decoded.imm_width = Width::W16;
            } else {
                decoded.imm = u64::from(fetch.next_u32()?);
                decoded.imm_width = Width::W32;
            }
        }
        Imm::Iv => match op_size {
            Width::W16 => {
                decoded.imm = u64::from(fetch.next_u16()?);
                decoded.imm_width = Width::W16;
            }
            Width::W64 => {
                decoded.imm = fetch.next_u64()?;
                decoded.imm_width = Width::W64;
            }
            _ => {
                decoded.imm = u64::from(fetch.next_u32()?);
                decoded.imm_width = Width::W32;
            }
        },
        Imm::Ap => {
            if op_size == Width::W16 {
                decoded.imm = u64::from(fetch.next_u16()?);
                decoded.imm_width = Width::W16;
            } else {
                decoded.imm = u64::from(fetch.next_u32()?);
                decoded.imm_width = Width::W32;
            }
            decoded.imm2 = u64::from(fetch.next_u16()?);
        }
        Imm::Ob => {
            decoded.imm = match addr_size {
                Width::W16 => u64::from(fetch.next_u16()?),
                Width::W32 => u64::from(fetch.next_u32()?),
                _ => fetch.next_u64()?,
            };
            decoded.imm_width = addr_size;
        }
        Imm::IwIb => {
            decoded.imm = u64::from(fetch.next_u16()?);
            decoded.imm_width = Width::W16;
            decoded.imm2 = u64::from(fetch.next_u8()?);
        }
    }
    Ok(())
}

impl Decoded {
    /// Immediate sign-extended to 64 bits.
    pub fn imm_sext(&self) -> i64 {
        match self.imm_width {
            Width::W8 => i64::from(self.imm as u8 as i8),
            Width::W16 => i64::from(self.imm as u16 as i16),
            Width::W32 => i64::from(self.imm as u32 as i32),
            Width::W64 => self.imm as i64,
        }
    }

    /// Immediate sign-extended to the operand size then zero-extended,
    /// the usual ALU source form.
    pub fn imm_for_alu(&self) -> u64 {
        (self.imm_sext() as u64) & self.op_size.mask()
    }
}
