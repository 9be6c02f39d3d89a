//! Selector resolution against the descriptor tables and the far-transfer
//! privilege rules. Loaded descriptors are cached in the segment registers;
//! nothing here is consulted on ordinary data accesses except the cache.

use machina_x86::{SegReg, Width};

use crate::mem::CpuBus;
use crate::state::{
    CpuMode, CpuState, SegmentRegister, SEG_ACCESS_DC, SEG_ACCESS_EXECUTABLE,
    SEG_ACCESS_NON_SYSTEM, SEG_ACCESS_PRESENT, SEG_ACCESS_RW,
};
use crate::Exception;

/// A decoded 8-byte GDT/LDT entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Descriptor {
    pub raw: u64,
}

impl Descriptor {
    pub fn base(&self) -> u64 {
        let raw = self.raw;
        (raw >> 16 & 0xFFFF) | (raw >> 32 & 0xFF) << 16 | (raw >> 56 & 0xFF) << 24
    }

    pub fn limit_raw(&self) -> u32 {
        ((self.raw & 0xFFFF) | (self.raw >> 48 & 0xF) << 16) as u32
    }

    /// Limit in bytes, scaled by the granularity bit.
    pub fn limit_bytes(&self) -> u32 {
        let raw = self.limit_raw();
        if self.granularity() {
            (raw << 12) | 0xFFF
        } else {
            raw
        }
    }

    pub fn access(&self) -> u8 {
        (self.raw >> 40 & 0xFF) as u8
    }

    pub fn flags(&self) -> u8 {
        (self.raw >> 52 & 0xF) as u8
    }

    pub fn present(&self) -> bool {
        self.access() & SEG_ACCESS_PRESENT != 0
    }

    pub fn dpl(&self) -> u8 {
        self.access() >> 5 & 0b11
    }

    pub fn is_system(&self) -> bool {
        self.access() & SEG_ACCESS_NON_SYSTEM == 0
    }

    pub fn is_code(&self) -> bool {
        !self.is_system() && self.access() & SEG_ACCESS_EXECUTABLE != 0
    }

    pub fn is_conforming(&self) -> bool {
        self.is_code() && self.access() & SEG_ACCESS_DC != 0
    }

    pub fn is_writable_data(&self) -> bool {
        !self.is_system()
            && self.access() & SEG_ACCESS_EXECUTABLE == 0
            && self.access() & SEG_ACCESS_RW != 0
    }

    pub fn is_readable(&self) -> bool {
        // Data segments are always readable; code segments only with the R
        // bit.
        !self.is_code() || self.access() & SEG_ACCESS_RW != 0
    }

    pub fn granularity(&self) -> bool {
        self.flags() & 0x8 != 0
    }

    pub fn to_cache(&self, selector: u16) -> SegmentRegister {
        SegmentRegister {
            selector,
            base: self.base(),
            limit: self.limit_bytes(),
            access: self.access(),
            flags: self.flags(),
        }
    }
}

/// Reads the descriptor named by `selector` from the GDT or LDT.
///
/// Returns `None` for the null selector or when the entry lies beyond the
/// table limit; callers decide between #GP and #NP.
pub fn read_descriptor<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    selector: u16,
) -> Result<Option<Descriptor>, Exception> {
    let index = u64::from(selector >> 3);
    let local = selector & 0x4 != 0;
    let (table_base, table_limit) = if local {
        (state.tables.ldtr.base, state.tables.ldtr.limit as u64)
    } else {
        (state.tables.gdtr.base, u64::from(state.tables.gdtr.limit))
    };
    if !local && index == 0 {
        return Ok(None);
    }
    if index * 8 + 7 > table_limit {
        return Ok(None);
    }
    let raw = bus.read_u64(table_base + index * 8)?;
    Ok(Some(Descriptor { raw }))
}

/// Base of a segment for effective-address formation. In 64-bit submode only
/// FS/GS carry a base.
pub fn segment_base(state: &CpuState, seg: SegReg) -> u64 {
    if state.is_64bit() && !matches!(seg, SegReg::Fs | SegReg::Gs) {
        0
    } else {
        state.segments.get(seg).base
    }
}

/// Translates `segment:offset` into a linear address for an access of `len`
/// bytes, enforcing the cached limit outside 64-bit submode.
pub fn segment_offset_linear(
    state: &CpuState,
    seg: SegReg,
    offset: u64,
    len: u32,
    addr_size: Width,
) -> Result<u64, Exception> {
    let offset = offset & addr_size.mask();
    if state.is_64bit() {
        return Ok(segment_base(state, seg).wrapping_add(offset));
    }

    let cache = state.segments.get(seg);
    if state.mode != CpuMode::Real {
        let last = offset + u64::from(len) - 1;
        let ok = if cache.is_expand_down() {
            // Valid range is (limit, top-of-segment].
            let top = if cache.default_big() { 0xFFFF_FFFF } else { 0xFFFF };
            offset > u64::from(cache.limit) && last <= top
        } else {
            last <= u64::from(cache.limit)
        };
        if !ok {
            return Err(match seg {
                SegReg::Ss => Exception::ss0(),
                _ => Exception::gp0(),
            });
        }
    }
    Ok(cache.base.wrapping_add(offset) & 0xFFFF_FFFF)
}

/// Loads a data segment register (DS/ES/FS/GS/SS) in any mode, applying the
/// protected-mode validity and privilege rules.
pub fn load_data_segment<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    seg: SegReg,
    selector: u16,
) -> Result<(), Exception> {
    debug_assert_ne!(seg, SegReg::Cs);

    if state.mode == CpuMode::Real {
        state.segments.get_mut(seg).load_real_mode(selector);
        return Ok(());
    }

    let rpl = (selector & 0b11) as u8;
    let cpl = state.cpl();

    if selector & !0b11 == 0 {
        // Null selector: allowed everywhere except SS (outside 64-bit CPL0).
        if seg == SegReg::Ss && !(state.mode == CpuMode::Long && cpl == 0) {
            return Err(Exception::gp0());
        }
        let cache = state.segments.get_mut(seg);
        cache.selector = selector;
        cache.base = 0;
        cache.limit = 0;
        cache.access = 0;
        cache.flags = 0;
        return Ok(());
    }

    let desc = read_descriptor(state, bus, selector)?
        .ok_or(Exception::GeneralProtection(selector & !0b11))?;

    if seg == SegReg::Ss {
        if !desc.is_writable_data() || rpl != cpl || desc.dpl() != cpl {
            return Err(Exception::GeneralProtection(selector & !0b11));
        }
        if !desc.present() {
            return Err(Exception::StackFault(selector & !0b11));
        }
    } else {
        if desc.is_system() || !desc.is_readable() {
            return Err(Exception::GeneralProtection(selector & !0b11));
        }
        // Data and non-conforming code require DPL >= max(CPL, RPL).
        if !desc.is_conforming() && desc.dpl() < cpl.max(rpl) {
            return Err(Exception::GeneralProtection(selector & !0b11));
        }
        if !desc.present() {
            return Err(Exception::SegmentNotPresent(selector & !0b11));
        }
    }

    *state.segments.get_mut(seg) = desc.to_cache(selector);
    Ok(())
}

/// Loads CS for a far transfer (JMP/CALL/RET/IRET/interrupt dispatch).
///
/// Non-conforming code requires `max(CPL, RPL) <= DPL` and the CPL becomes
/// the descriptor's DPL; conforming code requires `CPL >= DPL` and preserves
/// CPL. `override_cpl` forces the resulting CPL (used by interrupt delivery
/// and inter-level returns).
pub fn load_code_segment<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    selector: u16,
    override_cpl: Option<u8>,
) -> Result<(), Exception> {
    if state.mode == CpuMode::Real {
        state.segments.cs.load_real_mode(selector);
        state.update_mode();
        return Ok(());
    }

    if selector & !0b11 == 0 {
        return Err(Exception::gp0());
    }
    let desc = read_descriptor(state, bus, selector)?
        .ok_or(Exception::GeneralProtection(selector & !0b11))?;

    if desc.is_system() || !desc.is_code() {
        return Err(Exception::GeneralProtection(selector & !0b11));
    }
    if !desc.present() {
        return Err(Exception::SegmentNotPresent(selector & !0b11));
    }

    let cpl = state.cpl();
    let rpl = (selector & 0b11) as u8;
    let new_cpl = match override_cpl {
        Some(forced) => forced,
        None => {
            if desc.is_conforming() {
                if cpl < desc.dpl() {
                    return Err(Exception::GeneralProtection(selector & !0b11));
                }
                cpl
            } else {
                if cpl.max(rpl) > desc.dpl() {
                    return Err(Exception::GeneralProtection(selector & !0b11));
                }
                desc.dpl()
            }
        }
    };

    let mut cache = desc.to_cache(selector);
    // The cached selector's RPL tracks the CPL.
    cache.selector = (selector & !0b11) | u16::from(new_cpl);
    state.segments.cs = cache;
    // CS reload refreshes the default operand/address size (D and L bits).
    state.update_mode();
    Ok(())
}
