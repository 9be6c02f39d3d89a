//! Architectural CPU state: register file, flags, segmentation caches,
//! control/model-specific registers and the mode machinery derived from them.

use machina_x86::{Register, SegReg, Width};

/// GPR slot indices into [`CpuState::gpr`].
pub mod gpr {
    pub const RAX: usize = 0;
    pub const RCX: usize = 1;
    pub const RDX: usize = 2;
    pub const RBX: usize = 3;
    pub const RSP: usize = 4;
    pub const RBP: usize = 5;
    pub const RSI: usize = 6;
    pub const RDI: usize = 7;
    pub const R8: usize = 8;
    pub const R9: usize = 9;
    pub const R10: usize = 10;
    pub const R11: usize = 11;
    pub const R12: usize = 12;
    pub const R13: usize = 13;
    pub const R14: usize = 14;
    pub const R15: usize = 15;
}

pub const RFLAGS_CF: u64 = 1 << 0;
pub const RFLAGS_RESERVED1: u64 = 1 << 1;
pub const RFLAGS_PF: u64 = 1 << 2;
pub const RFLAGS_AF: u64 = 1 << 4;
pub const RFLAGS_ZF: u64 = 1 << 6;
pub const RFLAGS_SF: u64 = 1 << 7;
pub const RFLAGS_TF: u64 = 1 << 8;
pub const RFLAGS_IF: u64 = 1 << 9;
pub const RFLAGS_DF: u64 = 1 << 10;
pub const RFLAGS_OF: u64 = 1 << 11;
pub const RFLAGS_IOPL_SHIFT: u32 = 12;
pub const RFLAGS_IOPL_MASK: u64 = 0b11 << RFLAGS_IOPL_SHIFT;
pub const RFLAGS_NT: u64 = 1 << 14;
pub const RFLAGS_RF: u64 = 1 << 16;
pub const RFLAGS_VM: u64 = 1 << 17;
pub const RFLAGS_AC: u64 = 1 << 18;
pub const RFLAGS_ID: u64 = 1 << 21;

/// Flag bits an instruction's arithmetic may rewrite.
pub const RFLAGS_STATUS_MASK: u64 =
    RFLAGS_CF | RFLAGS_PF | RFLAGS_AF | RFLAGS_ZF | RFLAGS_SF | RFLAGS_OF;

pub const CR0_PE: u64 = 1 << 0;
pub const CR0_MP: u64 = 1 << 1;
pub const CR0_EM: u64 = 1 << 2;
pub const CR0_TS: u64 = 1 << 3;
pub const CR0_ET: u64 = 1 << 4;
pub const CR0_NE: u64 = 1 << 5;
pub const CR0_WP: u64 = 1 << 16;
pub const CR0_AM: u64 = 1 << 18;
pub const CR0_NW: u64 = 1 << 29;
pub const CR0_CD: u64 = 1 << 30;
pub const CR0_PG: u64 = 1 << 31;

pub const CR4_VME: u64 = 1 << 0;
pub const CR4_PVI: u64 = 1 << 1;
pub const CR4_TSD: u64 = 1 << 2;
pub const CR4_DE: u64 = 1 << 3;
pub const CR4_PSE: u64 = 1 << 4;
pub const CR4_PAE: u64 = 1 << 5;
pub const CR4_MCE: u64 = 1 << 6;
pub const CR4_PGE: u64 = 1 << 7;
pub const CR4_PCE: u64 = 1 << 8;
pub const CR4_OSFXSR: u64 = 1 << 9;
pub const CR4_OSXMMEXCPT: u64 = 1 << 10;

pub const EFER_SCE: u64 = 1 << 0;
pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;
pub const EFER_NXE: u64 = 1 << 11;

// Access-byte bits of a cached segment descriptor.
pub const SEG_ACCESS_ACCESSED: u8 = 1 << 0;
/// Writable for data, readable for code.
pub const SEG_ACCESS_RW: u8 = 1 << 1;
/// Expand-down for data, conforming for code.
pub const SEG_ACCESS_DC: u8 = 1 << 2;
pub const SEG_ACCESS_EXECUTABLE: u8 = 1 << 3;
/// S bit: set for code/data, clear for system descriptors.
pub const SEG_ACCESS_NON_SYSTEM: u8 = 1 << 4;
pub const SEG_ACCESS_DPL_SHIFT: u32 = 5;
pub const SEG_ACCESS_DPL_MASK: u8 = 0b11 << SEG_ACCESS_DPL_SHIFT;
pub const SEG_ACCESS_PRESENT: u8 = 1 << 7;

// Flags nibble (bits 52..56 of a descriptor).
pub const SEG_FLAG_AVL: u8 = 1 << 0;
pub const SEG_FLAG_LONG: u8 = 1 << 1;
pub const SEG_FLAG_DEFAULT_BIG: u8 = 1 << 2;
pub const SEG_FLAG_GRANULARITY: u8 = 1 << 3;

/// A segment register together with its cached descriptor.
///
/// The cache is refreshed when the selector is written; ordinary accesses
/// consult only the cache, never the descriptor tables.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentRegister {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub access: u8,
    pub flags: u8,
}

impl SegmentRegister {
    pub fn dpl(&self) -> u8 {
        (self.access & SEG_ACCESS_DPL_MASK) >> SEG_ACCESS_DPL_SHIFT
    }

    pub fn present(&self) -> bool {
        self.access & SEG_ACCESS_PRESENT != 0
    }

    pub fn is_system(&self) -> bool {
        self.access & SEG_ACCESS_NON_SYSTEM == 0
    }

    pub fn is_code(&self) -> bool {
        !self.is_system() && self.access & SEG_ACCESS_EXECUTABLE != 0
    }

    pub fn is_conforming(&self) -> bool {
        self.is_code() && self.access & SEG_ACCESS_DC != 0
    }

    pub fn is_expand_down(&self) -> bool {
        !self.is_system()
            && self.access & SEG_ACCESS_EXECUTABLE == 0
            && self.access & SEG_ACCESS_DC != 0
    }

    pub fn is_writable_data(&self) -> bool {
        !self.is_system()
            && self.access & SEG_ACCESS_EXECUTABLE == 0
            && self.access & SEG_ACCESS_RW != 0
    }

    pub fn long(&self) -> bool {
        self.flags & SEG_FLAG_LONG != 0
    }

    pub fn default_big(&self) -> bool {
        self.flags & SEG_FLAG_DEFAULT_BIG != 0
    }

    /// Real-mode selector load: base = selector * 16, attributes untouched
    /// except for a 64 KiB limit.
    pub fn load_real_mode(&mut self, selector: u16) {
        self.selector = selector;
        self.base = u64::from(selector) << 4;
        self.limit = 0xFFFF;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableRegister {
    pub base: u64,
    pub limit: u16,
}

/// LDTR / TR: a selector plus the cached system-segment descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SystemSegment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub access: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Segments {
    pub es: SegmentRegister,
    pub cs: SegmentRegister,
    pub ss: SegmentRegister,
    pub ds: SegmentRegister,
    pub fs: SegmentRegister,
    pub gs: SegmentRegister,
}

impl Segments {
    pub fn get(&self, seg: SegReg) -> &SegmentRegister {
        match seg {
            SegReg::Es => &self.es,
            SegReg::Cs => &self.cs,
            SegReg::Ss => &self.ss,
            SegReg::Ds => &self.ds,
            SegReg::Fs => &self.fs,
            SegReg::Gs => &self.gs,
        }
    }

    pub fn get_mut(&mut self, seg: SegReg) -> &mut SegmentRegister {
        match seg {
            SegReg::Es => &mut self.es,
            SegReg::Cs => &mut self.cs,
            SegReg::Ss => &mut self.ss,
            SegReg::Ds => &mut self.ds,
            SegReg::Fs => &mut self.fs,
            SegReg::Gs => &mut self.gs,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tables {
    pub gdtr: TableRegister,
    pub idtr: TableRegister,
    pub ldtr: SystemSegment,
    pub tr: SystemSegment,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            gdtr: TableRegister { base: 0, limit: 0xFFFF },
            // Real-mode IVT: 256 4-byte vectors.
            idtr: TableRegister { base: 0, limit: 0x3FF },
            ldtr: SystemSegment::default(),
            tr: SystemSegment::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControlRegisters {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    /// Task-priority mirror of the local APIC TPR.
    pub cr8: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModelSpecific {
    pub efer: u64,
    pub star: u64,
    pub lstar: u64,
    pub sfmask: u64,
    pub kernel_gs_base: u64,
    pub apic_base: u64,
}

/// Effective execution mode, derived from CR0/EFER and the CS cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuMode {
    Real,
    Protected,
    Long,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RepPrefix {
    #[default]
    None,
    Rep,
    Repne,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rex {
    pub w: bool,
    pub r: bool,
    pub x: bool,
    pub b: bool,
}

impl Rex {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            w: byte & 0x8 != 0,
            r: byte & 0x4 != 0,
            x: byte & 0x2 != 0,
            b: byte & 0x1 != 0,
        }
    }
}

/// Prefix state for the instruction currently being decoded. Cleared at the
/// start of every instruction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Prefixes {
    pub operand_size: bool,
    pub address_size: bool,
    pub lock: bool,
    pub rep: RepPrefix,
    pub segment: Option<SegReg>,
    pub rex: Option<Rex>,
}

impl Prefixes {
    pub fn rex_w(&self) -> bool {
        self.rex.map(|r| r.w).unwrap_or(false)
    }

    pub fn rex_r(&self) -> u8 {
        u8::from(self.rex.map(|r| r.r).unwrap_or(false))
    }

    pub fn rex_x(&self) -> u8 {
        u8::from(self.rex.map(|r| r.x).unwrap_or(false))
    }

    pub fn rex_b(&self) -> u8 {
        u8::from(self.rex.map(|r| r.b).unwrap_or(false))
    }
}

#[derive(Clone, Debug)]
pub struct CpuState {
    pub gpr: [u64; 16],
    rip: u64,
    rflags: u64,
    pub segments: Segments,
    pub tables: Tables,
    pub control: ControlRegisters,
    pub msr: ModelSpecific,
    /// Effective mode; refresh with [`CpuState::update_mode`] after touching
    /// CR0/CR4/EFER or CS.
    pub mode: CpuMode,
    /// Long mode with a 16/32-bit code segment.
    pub compatibility_mode: bool,
    pub halted: bool,
    pub a20_enabled: bool,
    /// Instruction countdown during which external interrupts are inhibited
    /// (MOV/POP SS, STI).
    pub interrupt_shadow: u8,
    /// Vector latched at real-mode interrupt delivery so a HLT inside the
    /// firmware stub segment can surface as a BIOS service exit.
    pub pending_bios_int: u8,
    pub pending_bios_int_valid: bool,
    pub tsc: u64,
    pub prefixes: Prefixes,
}

impl Default for CpuState {
    fn default() -> Self {
        CpuState::new(CpuMode::Real)
    }
}

impl CpuState {
    pub fn new(mode: CpuMode) -> Self {
        let mut state = Self {
            gpr: [0; 16],
            rip: 0,
            rflags: RFLAGS_RESERVED1,
            segments: Segments::default(),
            tables: Tables::default(),
            control: ControlRegisters::default(),
            msr: ModelSpecific {
                apic_base: 0xFEE0_0000 | (1 << 11) | (1 << 8),
                ..Default::default()
            },
            mode: CpuMode::Real,
            compatibility_mode: false,
            halted: false,
            a20_enabled: true,
            interrupt_shadow: 0,
            pending_bios_int: 0,
            pending_bios_int_valid: false,
            tsc: 0,
            prefixes: Prefixes::default(),
        };
        match mode {
            CpuMode::Real => {
                state.segments.cs = SegmentRegister {
                    selector: 0,
                    base: 0,
                    limit: 0xFFFF,
                    access: SEG_ACCESS_PRESENT
                        | SEG_ACCESS_NON_SYSTEM
                        | SEG_ACCESS_EXECUTABLE
                        | SEG_ACCESS_RW,
                    flags: 0,
                };
                for seg in [SegReg::Es, SegReg::Ss, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
                    *state.segments.get_mut(seg) = SegmentRegister {
                        selector: 0,
                        base: 0,
                        limit: 0xFFFF,
                        access: SEG_ACCESS_PRESENT | SEG_ACCESS_NON_SYSTEM | SEG_ACCESS_RW,
                        flags: 0,
                    };
                }
            }
            CpuMode::Protected => {
                state.control.cr0 = CR0_PE;
                state.flat_segments(SEG_FLAG_DEFAULT_BIG);
            }
            CpuMode::Long => {
                state.control.cr0 = CR0_PE | CR0_PG;
                state.control.cr4 = CR4_PAE;
                state.msr.efer = EFER_SCE | EFER_LME | EFER_LMA;
                state.flat_segments(SEG_FLAG_LONG);
            }
        }
        state.update_mode();
        state
    }

    fn flat_segments(&mut self, cs_flags: u8) {
        self.segments.cs = SegmentRegister {
            selector: 0x08,
            base: 0,
            limit: 0xFFFF_FFFF,
            access: SEG_ACCESS_PRESENT
                | SEG_ACCESS_NON_SYSTEM
                | SEG_ACCESS_EXECUTABLE
                | SEG_ACCESS_RW,
            flags: cs_flags | SEG_FLAG_GRANULARITY,
        };
        let data = SegmentRegister {
            selector: 0x10,
            base: 0,
            limit: 0xFFFF_FFFF,
            access: SEG_ACCESS_PRESENT | SEG_ACCESS_NON_SYSTEM | SEG_ACCESS_RW,
            flags: SEG_FLAG_DEFAULT_BIG | SEG_FLAG_GRANULARITY,
        };
        for seg in [SegReg::Es, SegReg::Ss, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
            *self.segments.get_mut(seg) = data;
        }
    }

    pub fn rip(&self) -> u64 {
        self.rip
    }

    pub fn set_rip(&mut self, rip: u64) {
        self.rip = rip;
    }

    pub fn rflags(&self) -> u64 {
        self.rflags
    }

    pub fn set_rflags(&mut self, value: u64) {
        // Bit 1 always reads as set; 3, 5 and 15 always as clear.
        self.rflags = (value | RFLAGS_RESERVED1) & !(1 << 3 | 1 << 5 | 1 << 15);
    }

    pub fn flag(&self, mask: u64) -> bool {
        self.rflags & mask != 0
    }

    pub fn set_flag(&mut self, mask: u64, value: bool) {
        if value {
            self.rflags |= mask;
        } else {
            self.rflags &= !mask;
        }
    }

    pub fn iopl(&self) -> u8 {
        ((self.rflags & RFLAGS_IOPL_MASK) >> RFLAGS_IOPL_SHIFT) as u8
    }

    /// Current privilege level. Real mode always runs at CPL 0; otherwise the
    /// RPL of the loaded CS selector tracks the CPL.
    pub fn cpl(&self) -> u8 {
        match self.mode {
            CpuMode::Real => 0,
            _ => (self.segments.cs.selector & 0b11) as u8,
        }
    }

    /// True in 64-bit submode (long mode with a 64-bit code segment).
    pub fn is_64bit(&self) -> bool {
        self.mode == CpuMode::Long && !self.compatibility_mode
    }

    pub fn paging_enabled(&self) -> bool {
        self.control.cr0 & CR0_PG != 0
    }

    pub fn protected_mode(&self) -> bool {
        self.control.cr0 & CR0_PE != 0
    }

    /// Derives the effective mode from CR0.PE/PG, EFER.LME and the CS cache,
    /// maintaining EFER.LMA along the way. Call after any write to CR0, CR4,
    /// EFER or CS.
    pub fn update_mode(&mut self) {
        let pe = self.control.cr0 & CR0_PE != 0;
        let pg = self.control.cr0 & CR0_PG != 0;
        let lme = self.msr.efer & EFER_LME != 0;

        if lme && pg && self.control.cr4 & CR4_PAE != 0 {
            self.msr.efer |= EFER_LMA;
        } else if !pg {
            self.msr.efer &= !EFER_LMA;
        }

        if self.msr.efer & EFER_LMA != 0 {
            self.mode = CpuMode::Long;
            self.compatibility_mode = !self.segments.cs.long();
        } else if pe {
            self.mode = CpuMode::Protected;
            self.compatibility_mode = false;
        } else {
            self.mode = CpuMode::Real;
            self.compatibility_mode = false;
        }
    }

    pub fn set_protected_enable(&mut self, enable: bool) {
        if enable {
            self.control.cr0 |= CR0_PE;
        } else {
            self.control.cr0 &= !CR0_PE;
        }
        self.update_mode();
    }

    /// Default operand size from the mode and the CS D/L bits.
    pub fn default_operand_size(&self) -> Width {
        match self.mode {
            CpuMode::Real => Width::W16,
            CpuMode::Long if !self.compatibility_mode => Width::W32,
            _ => {
                if self.segments.cs.default_big() {
                    Width::W32
                } else {
                    Width::W16
                }
            }
        }
    }

    pub fn default_address_size(&self) -> Width {
        match self.mode {
            CpuMode::Real => Width::W16,
            CpuMode::Long if !self.compatibility_mode => Width::W64,
            _ => {
                if self.segments.cs.default_big() {
                    Width::W32
                } else {
                    Width::W16
                }
            }
        }
    }

    pub fn clear_pending_bios_int(&mut self) {
        self.pending_bios_int = 0;
        self.pending_bios_int_valid = false;
    }

    // ----- GPR access -------------------------------------------------------

    pub fn read_gpr64(&self, index: usize) -> u64 {
        self.gpr[index]
    }

    pub fn write_gpr64(&mut self, index: usize, value: u64) {
        self.gpr[index] = value;
    }

    pub fn read_gpr32(&self, index: usize) -> u32 {
        self.gpr[index] as u32
    }

    /// 32-bit writes zero-extend into the full 64-bit register.
    pub fn write_gpr32(&mut self, index: usize, value: u32) {
        self.gpr[index] = u64::from(value);
    }

    pub fn read_gpr16(&self, index: usize) -> u16 {
        self.gpr[index] as u16
    }

    pub fn write_gpr16(&mut self, index: usize, value: u16) {
        self.gpr[index] = (self.gpr[index] & !0xFFFF) | u64::from(value);
    }

    pub fn read_gpr8(&self, index: usize, high: bool) -> u8 {
        if high {
            (self.gpr[index] >> 8) as u8
        } else {
            self.gpr[index] as u8
        }
    }

    pub fn write_gpr8(&mut self, index: usize, high: bool, value: u8) {
        if high {
            self.gpr[index] = (self.gpr[index] & !0xFF00) | (u64::from(value) << 8);
        } else {
            self.gpr[index] = (self.gpr[index] & !0xFF) | u64::from(value);
        }
    }

    /// Width-dispatching GPR read for ModRM-encoded operands. `enc` is the
    /// REX-extended register number; without a REX prefix, byte encodings
    /// 4..8 select the legacy high-byte registers.
    pub fn read_gpr(&self, width: Width, enc: u8, rex_present: bool) -> u64 {
        match width {
            Width::W8 => {
                if !rex_present && (4..8).contains(&enc) {
                    u64::from(self.read_gpr8(usize::from(enc - 4), true))
                } else {
                    u64::from(self.read_gpr8(usize::from(enc), false))
                }
            }
            Width::W16 => u64::from(self.read_gpr16(usize::from(enc))),
            Width::W32 => u64::from(self.read_gpr32(usize::from(enc))),
            Width::W64 => self.read_gpr64(usize::from(enc)),
        }
    }

    pub fn write_gpr(&mut self, width: Width, enc: u8, rex_present: bool, value: u64) {
        match width {
            Width::W8 => {
                if !rex_present && (4..8).contains(&enc) {
                    self.write_gpr8(usize::from(enc - 4), true, value as u8);
                } else {
                    self.write_gpr8(usize::from(enc), false, value as u8);
                }
            }
            Width::W16 => self.write_gpr16(usize::from(enc), value as u16),
            Width::W32 => self.write_gpr32(usize::from(enc), value as u32),
            Width::W64 => self.write_gpr64(usize::from(enc), value),
        }
    }

    // ----- Named-register access (embedder/test convenience) ---------------

    pub fn read_reg(&self, reg: Register) -> u64 {
        if let Some(seg) = reg.segment() {
            return u64::from(self.segments.get(seg).selector);
        }
        let index = reg
            .gpr_index()
            .expect("register is either a segment or a GPR");
        match reg.width() {
            Width::W8 => u64::from(self.read_gpr8(index, reg.is_high_byte())),
            Width::W16 => u64::from(self.read_gpr16(index)),
            Width::W32 => u64::from(self.read_gpr32(index)),
            Width::W64 => self.read_gpr64(index),
        }
    }

    pub fn write_reg(&mut self, reg: Register, value: u64) {
        if let Some(seg) = reg.segment() {
            match self.mode {
                CpuMode::Real => self.segments.get_mut(seg).load_real_mode(value as u16),
                _ => self.segments.get_mut(seg).selector = value as u16,
            }
            if seg == SegReg::Cs {
                self.update_mode();
            }
            return;
        }
        let index = reg
            .gpr_index()
            .expect("register is either a segment or a GPR");
        match reg.width() {
            Width::W8 => self.write_gpr8(index, reg.is_high_byte(), value as u8),
            Width::W16 => self.write_gpr16(index, value as u16),
            Width::W32 => self.write_gpr32(index, value as u32),
            Width::W64 => self.write_gpr64(index, value),
        }
    }
}
