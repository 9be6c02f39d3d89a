use crate::{is_canonical, Access, MemoryBus, PagingConfig, PteFlags};

/// A page fault produced by a failed walk.
///
/// `error_code` uses the architectural #PF layout: bit 0 P (violation vs
/// not-present), bit 1 W/R, bit 2 U/S, bit 3 RSVD, bit 4 I/D.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    pub linear: u64,
    pub error_code: u32,
}

pub const PF_PRESENT: u32 = 1 << 0;
pub const PF_WRITE: u32 = 1 << 1;
pub const PF_USER: u32 = 1 << 2;
pub const PF_RESERVED: u32 = 1 << 3;
pub const PF_FETCH: u32 = 1 << 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranslateError {
    PageFault(PageFault),
    /// Long-mode access to a non-canonical linear address (#GP(0) / #SS(0)
    /// at the caller's discretion).
    NonCanonical,
}

const PHYS_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

fn base_error(access: Access) -> u32 {
    let mut code = 0;
    if access.write {
        code |= PF_WRITE;
    }
    if access.user {
        code |= PF_USER;
    }
    if access.fetch {
        code |= PF_FETCH;
    }
    code
}

fn fault(linear: u64, access: Access, bits: u32) -> TranslateError {
    TranslateError::PageFault(PageFault {
        linear,
        error_code: base_error(access) | bits,
    })
}

struct Level {
    entry_addr: u64,
    entry: u64,
    wide: bool,
}

fn check_permissions(
    levels: &[Level],
    cfg: &PagingConfig,
    linear: u64,
    access: Access,
) -> Result<(), TranslateError> {
    // Effective rights are the intersection across levels.
    let mut writable = true;
    let mut user = true;
    let mut no_exec = false;
    for level in levels {
        let flags = PteFlags::from_bits_retain(level.entry);
        writable &= flags.contains(PteFlags::WRITABLE);
        user &= flags.contains(PteFlags::USER);
        if level.wide && cfg.nx_enable {
            no_exec |= flags.contains(PteFlags::NO_EXECUTE);
        }
    }

    if access.user && !user {
        return Err(fault(linear, access, PF_PRESENT));
    }
    if access.write && !writable && (access.user || cfg.write_protect) {
        return Err(fault(linear, access, PF_PRESENT));
    }
    if access.fetch && no_exec {
        return Err(fault(linear, access, PF_PRESENT));
    }
    Ok(())
}

fn set_accessed_dirty<B: MemoryBus>(bus: &mut B, levels: &[Level], write: bool) {
    for (i, level) in levels.iter().enumerate() {
        let leaf = i == levels.len() - 1;
        let mut entry = level.entry;
        entry |= PteFlags::ACCESSED.bits();
        if leaf && write {
            entry |= PteFlags::DIRTY.bits();
        }
        if entry != level.entry {
            if level.wide {
                bus.write_u64(level.entry_addr, entry);
            } else {
                bus.write_u32(level.entry_addr, entry as u32);
            }
        }
    }
}

/// Walks the paging structures for `linear` and returns the physical address.
///
/// Check ordering per level: Present, then reserved bits, then (once the leaf
/// is reached) U/S and R/W across the whole path. A bits are set on every
/// traversed entry and the D bit on the leaf for writes, only after all
/// checks pass.
pub fn translate<B: MemoryBus>(
    cfg: &PagingConfig,
    bus: &mut B,
    linear: u64,
    access: Access,
) -> Result<u64, TranslateError> {
    if cfg.long && !is_canonical(linear) {
        return Err(TranslateError::NonCanonical);
    }
    if !cfg.paging {
        return Ok(cfg.apply_a20(linear & cfg.linear_mask()));
    }
    let phys = if cfg.long {
        walk_long(cfg, bus, linear, access)?
    } else if cfg.pae {
        walk_pae(cfg, bus, linear, access)?
    } else {
        walk_legacy32(cfg, bus, linear, access)?
    };
    Ok(cfg.apply_a20(phys))
}

fn walk_legacy32<B: MemoryBus>(
    cfg: &PagingConfig,
    bus: &mut B,
    linear: u64,
    access: Access,
) -> Result<u64, TranslateError> {
    let linear = linear & 0xFFFF_FFFF;
    let pd_base = cfg.cr3 & 0xFFFF_F000;
    let pde_addr = pd_base + ((linear >> 22) & 0x3FF) * 4;
    let pde = bus.read_u32(pde_addr) as u64;
    if pde & PteFlags::PRESENT.bits() == 0 {
        return Err(fault(linear, access, 0));
    }

    if cfg.pse && pde & PteFlags::PAGE_SIZE.bits() != 0 {
        // 4 MiB page. Bits 21..13 are reserved unless PSE-36 is in play,
        // which this machine does not advertise.
        if pde & 0x003F_E000 != 0 {
            return Err(fault(linear, access, PF_PRESENT | PF_RESERVED));
        }
        let levels = [Level { entry_addr: pde_addr, entry: pde, wide: false }];
        check_permissions(&levels, cfg, linear, access)?;
        set_accessed_dirty(bus, &levels, access.write);
        return Ok((pde & 0xFFC0_0000) | (linear & 0x003F_FFFF));
    }

    let pt_base = pde & 0xFFFF_F000;
    let pte_addr = pt_base + ((linear >> 12) & 0x3FF) * 4;
    let pte = bus.read_u32(pte_addr) as u64;
    if pte & PteFlags::PRESENT.bits() == 0 {
        return Err(fault(linear, access, 0));
    }

    let levels = [
        Level { entry_addr: pde_addr, entry: pde, wide: false },
        Level { entry_addr: pte_addr, entry: pte, wide: false },
    ];
    check_permissions(&levels, cfg, linear, access)?;
    set_accessed_dirty(bus, &levels, access.write);
    Ok((pte & 0xFFFF_F000) | (linear & 0xFFF))
}

fn reserved_bits_set(cfg: &PagingConfig, entry: u64) -> bool {
    !cfg.nx_enable && entry & PteFlags::NO_EXECUTE.bits() != 0
}

fn walk_pae<B: MemoryBus>(
    cfg: &PagingConfig,
    bus: &mut B,
    linear: u64,
    access: Access,
) -> Result<u64, TranslateError> {
    let linear = linear & 0xFFFF_FFFF;
    let pdpt_base = cfg.cr3 & 0xFFFF_FFE0;
    let pdpte_addr = pdpt_base + ((linear >> 30) & 0x3) * 8;
    let pdpte = bus.read_u64(pdpte_addr);
    if pdpte & PteFlags::PRESENT.bits() == 0 {
        return Err(fault(linear, access, 0));
    }
    // Legacy-PAE PDPTEs have no R/W or U/S semantics; bits 1..2 and 63 are
    // reserved.
    if pdpte & 0x6 != 0 || pdpte & PteFlags::NO_EXECUTE.bits() != 0 {
        return Err(fault(linear, access, PF_PRESENT | PF_RESERVED));
    }

    let pd_base = pdpte & PHYS_ADDR_MASK;
    let pde_addr = pd_base + ((linear >> 21) & 0x1FF) * 8;
    let pde = bus.read_u64(pde_addr);
    if pde & PteFlags::PRESENT.bits() == 0 {
        return Err(fault(linear, access, 0));
    }
    if reserved_bits_set(cfg, pde) {
        return Err(fault(linear, access, PF_PRESENT | PF_RESERVED));
    }

    if pde & PteFlags::PAGE_SIZE.bits() != 0 {
        // 2 MiB page; bits 20..13 must be zero.
        if pde & 0x001F_E000 != 0 {
            return Err(fault(linear, access, PF_PRESENT | PF_RESERVED));
        }
        let levels = [Level { entry_addr: pde_addr, entry: pde, wide: true }];
        check_permissions(&levels, cfg, linear, access)?;
        set_accessed_dirty(bus, &levels, access.write);
        return Ok((pde & 0x000F_FFFF_FFE0_0000) | (linear & 0x001F_FFFF));
    }

    let pt_base = pde & PHYS_ADDR_MASK;
    let pte_addr = pt_base + ((linear >> 12) & 0x1FF) * 8;
    let pte = bus.read_u64(pte_addr);
    if pte & PteFlags::PRESENT.bits() == 0 {
        return Err(fault(linear, access, 0));
    }
    if reserved_bits_set(cfg, pte) {
        return Err(fault(linear, access, PF_PRESENT | PF_RESERVED));
    }

    let levels = [
        Level { entry_addr: pde_addr, entry: pde, wide: true },
        Level { entry_addr: pte_addr, entry: pte, wide: true },
    ];
    check_permissions(&levels, cfg, linear, access)?;
    set_accessed_dirty(bus, &levels, access.write);
    Ok((pte & PHYS_ADDR_MASK) | (linear & 0xFFF))
}

fn walk_long<B: MemoryBus>(
    cfg: &PagingConfig,
    bus: &mut B,
    linear: u64,
    access: Access,
) -> Result<u64, TranslateError> {
    let mut levels: Vec<Level> = Vec::with_capacity(4);
    let mut table = cfg.cr3 & PHYS_ADDR_MASK;

    // PML4 (shift 39), PDPT (30), PD (21), PT (12).
    for (depth, shift) in [39u32, 30, 21, 12].into_iter().enumerate() {
        let entry_addr = table + ((linear >> shift) & 0x1FF) * 8;
        let entry = bus.read_u64(entry_addr);
        if entry & PteFlags::PRESENT.bits() == 0 {
            return Err(fault(linear, access, 0));
        }
        if reserved_bits_set(cfg, entry) {
            return Err(fault(linear, access, PF_PRESENT | PF_RESERVED));
        }

        let large = entry & PteFlags::PAGE_SIZE.bits() != 0;
        levels.push(Level { entry_addr, entry, wide: true });

        match (depth, large) {
            // PS in a PML4E is reserved.
            (0, true) => {
                return Err(fault(linear, access, PF_PRESENT | PF_RESERVED));
            }
            // 1 GiB page.
            (1, true) => {
                check_permissions(&levels, cfg, linear, access)?;
                set_accessed_dirty(bus, &levels, access.write);
                return Ok((entry & 0x000F_FFFF_C000_0000) | (linear & 0x3FFF_FFFF));
            }
            // 2 MiB page.
            (2, true) => {
                check_permissions(&levels, cfg, linear, access)?;
                set_accessed_dirty(bus, &levels, access.write);
                return Ok((entry & 0x000F_FFFF_FFE0_0000) | (linear & 0x001F_FFFF));
            }
            (3, _) => {
                check_permissions(&levels, cfg, linear, access)?;
                set_accessed_dirty(bus, &levels, access.write);
                return Ok((entry & PHYS_ADDR_MASK) | (linear & 0xFFF));
            }
            _ => table = entry & PHYS_ADDR_MASK,
        }
    }
    unreachable!("4-level walk always terminates at the PT level");
}
