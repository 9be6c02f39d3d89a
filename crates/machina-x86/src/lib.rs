//! Architectural x86 register naming shared by the CPU core and its embedders.
//!
//! The emulator stores general-purpose registers as sixteen 64-bit slots; this
//! crate provides the width-aware names (`AL`, `AX`, `EAX`, `RAX`, ...) used at
//! API boundaries and in tests, plus the segment-register identifiers.

/// A named architectural register at a specific access width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum Register {
    // 8-bit low/high legacy names.
    AL,
    CL,
    DL,
    BL,
    AH,
    CH,
    DH,
    BH,
    // 16-bit.
    AX,
    CX,
    DX,
    BX,
    SP,
    BP,
    SI,
    DI,
    // 32-bit.
    EAX,
    ECX,
    EDX,
    EBX,
    ESP,
    EBP,
    ESI,
    EDI,
    // 64-bit.
    RAX,
    RCX,
    RDX,
    RBX,
    RSP,
    RBP,
    RSI,
    RDI,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    // Segment registers.
    ES,
    CS,
    SS,
    DS,
    FS,
    GS,
}

/// Access width of a [`Register`], in bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    pub fn bytes(self) -> u8 {
        match self {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
            Width::W64 => 8,
        }
    }

    pub fn bits(self) -> u32 {
        u32::from(self.bytes()) * 8
    }

    /// All-ones mask of the width, as a u64.
    pub fn mask(self) -> u64 {
        match self {
            Width::W8 => 0xFF,
            Width::W16 => 0xFFFF,
            Width::W32 => 0xFFFF_FFFF,
            Width::W64 => u64::MAX,
        }
    }

    /// The sign bit of the width.
    pub fn sign_bit(self) -> u64 {
        1u64 << (self.bits() - 1)
    }
}

/// Segment register identifiers in descriptor-table encoding order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub fn from_encoding(enc: u8) -> Option<SegReg> {
        Some(match enc {
            0 => SegReg::Es,
            1 => SegReg::Cs,
            2 => SegReg::Ss,
            3 => SegReg::Ds,
            4 => SegReg::Fs,
            5 => SegReg::Gs,
            _ => return None,
        })
    }
}

impl Register {
    /// Width of the register.
    pub fn width(self) -> Width {
        use Register::*;
        match self {
            AL | CL | DL | BL | AH | CH | DH | BH => Width::W8,
            AX | CX | DX | BX | SP | BP | SI | DI | ES | CS | SS | DS | FS | GS => Width::W16,
            EAX | ECX | EDX | EBX | ESP | EBP | ESI | EDI => Width::W32,
            _ => Width::W64,
        }
    }

    /// GPR slot index (0..16) for general-purpose names, `None` for segments.
    pub fn gpr_index(self) -> Option<usize> {
        use Register::*;
        Some(match self {
            AL | AX | EAX | RAX | AH => 0,
            CL | CX | ECX | RCX | CH => 1,
            DL | DX | EDX | RDX | DH => 2,
            BL | BX | EBX | RBX | BH => 3,
            SP | ESP | RSP => 4,
            BP | EBP | RBP => 5,
            SI | ESI | RSI => 6,
            DI | EDI | RDI => 7,
            R8 => 8,
            R9 => 9,
            R10 => 10,
            R11 => 11,
            R12 => 12,
            R13 => 13,
            R14 => 14,
            R15 => 15,
            _ => return None,
        })
    }

    /// True for the legacy high-byte names (AH/CH/DH/BH), which alias bits
    /// 8..16 of their 64-bit slot.
    pub fn is_high_byte(self) -> bool {
        matches!(
            self,
            Register::AH | Register::CH | Register::DH | Register::BH
        )
    }

    /// Segment identifier for segment-register names.
    pub fn segment(self) -> Option<SegReg> {
        Some(match self {
            Register::ES => SegReg::Es,
            Register::CS => SegReg::Cs,
            Register::SS => SegReg::Ss,
            Register::DS => SegReg::Ds,
            Register::FS => SegReg::Fs,
            Register::GS => SegReg::Gs,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_byte_names_alias_the_low_slots() {
        assert_eq!(Register::AH.gpr_index(), Some(0));
        assert!(Register::AH.is_high_byte());
        assert!(!Register::SP.is_high_byte());
        assert_eq!(Register::SP.gpr_index(), Some(4));
    }

    #[test]
    fn segment_encodings_roundtrip() {
        for enc in 0..6u8 {
            let seg = SegReg::from_encoding(enc).unwrap();
            assert_eq!(seg as u8, enc);
        }
        assert_eq!(SegReg::from_encoding(6), None);
    }
}
