//! INT 13h disk services: CHS and LBA-extended transfers over a
//! [`BlockDevice`], with CD-ROM (El Torito) drive semantics for DL >= 0xE0.

use crate::firmware::{BlockDevice, DiskError, Memory};
use crate::types::BDA_LAST_DISK_STATUS;
use crate::{Bios, RealModeCpu};

const STATUS_OK: u8 = 0x00;
const STATUS_INVALID: u8 = 0x01;
const STATUS_WRITE_PROTECTED: u8 = 0x03;
const STATUS_READ_FAILURE: u8 = 0x04;

// Fixed-disk geometry reported by AH=08h and used for CHS arithmetic.
const HDD_HEADS: u64 = 16;
const HDD_SECTORS_PER_TRACK: u64 = 63;

/// 512-byte virtual sectors per CD-ROM (2048-byte) block.
const CD_FACTOR: u64 = 4;

pub(crate) fn handle(
    bios: &mut Bios,
    cpu: &mut RealModeCpu,
    mem: &mut dyn Memory,
    disk: &mut dyn BlockDevice,
) {
    let function = cpu.ah();
    let status = service(bios, cpu, mem, disk);
    mem.write_u8(BDA_LAST_DISK_STATUS, status);
    bios.last_disk_status = status;
    cpu.set_cf(status != STATUS_OK);
    // A few functions return their own payload in AH on success.
    let keep_ah = status == STATUS_OK && matches!(function, 0x01 | 0x15 | 0x41);
    if !keep_ah {
        cpu.set_ah(status);
    }
}

fn is_cd_drive(drive: u8) -> bool {
    drive >= 0xE0
}

fn service(
    bios: &mut Bios,
    cpu: &mut RealModeCpu,
    mem: &mut dyn Memory,
    disk: &mut dyn BlockDevice,
) -> u8 {
    match cpu.ah() {
        // Reset.
        0x00 => STATUS_OK,
        // Last status.
        0x01 => {
            cpu.set_al(bios.last_disk_status);
            STATUS_OK
        }
        // CHS read/write.
        0x02 | 0x03 => {
            let write = cpu.ah() == 0x03;
            chs_transfer(cpu, mem, disk, write)
        }
        // Get geometry.
        0x08 => {
            if is_cd_drive(cpu.dl()) {
                return STATUS_INVALID;
            }
            let total = disk.sector_count();
            let cylinders =
                (total / (HDD_HEADS * HDD_SECTORS_PER_TRACK)).clamp(1, 1024) as u16;
            let max_cyl = cylinders - 1;
            cpu.set_ch(max_cyl as u8);
            cpu.set_cl((HDD_SECTORS_PER_TRACK as u8) | ((max_cyl >> 2) & 0xC0) as u8);
            cpu.set_dh((HDD_HEADS - 1) as u8);
            cpu.set_dl(1); // drive count
            STATUS_OK
        }
        // Disk type.
        0x15 => {
            cpu.set_ah(0x03); // fixed disk with changeline... reported via AH
            STATUS_OK
        }
        // Extensions installation check.
        0x41 => {
            if cpu.bx() != 0x55AA {
                return STATUS_INVALID;
            }
            cpu.set_bx(0xAA55);
            cpu.set_ah(0x21); // EDD 1.1
            cpu.set_cx(0x0001); // extended disk access
            STATUS_OK
        }
        // Extended read/write through a disk address packet.
        0x42 | 0x43 => {
            let write = cpu.ah() == 0x43;
            extended_transfer(cpu, mem, disk, write)
        }
        // Extended geometry.
        0x48 => {
            let addr = RealModeCpu::linear(cpu.ds, cpu.si());
            let size = mem.read_u16(addr);
            if size < 0x1A {
                return STATUS_INVALID;
            }
            let total = disk.sector_count();
            mem.write_u16(addr, 0x1A);
            mem.write_u16(addr + 2, 0); // flags: CHS invalid
            mem.write_u32(addr + 4, 0); // cylinders
            mem.write_u32(addr + 8, 0); // heads
            mem.write_u32(addr + 12, 0); // sectors/track
            mem.write_u32(addr + 16, total as u32);
            mem.write_u32(addr + 20, (total >> 32) as u32);
            mem.write_u16(
                addr + 24,
                if is_cd_drive(cpu.dl()) { 2048 } else { 512 },
            );
            STATUS_OK
        }
        // El Torito disk emulation services: AL=01h returns the boot
        // specification packet cached at POST.
        0x4B => {
            let Some(info) = bios.eltorito else {
                return STATUS_INVALID;
            };
            let addr = RealModeCpu::linear(cpu.es, cpu.di());
            mem.write_u8(addr, 0x13); // packet size
            mem.write_u8(addr + 1, info.media_type);
            mem.write_u8(addr + 2, info.drive);
            mem.write_u8(addr + 3, 0); // controller index
            mem.write_u32(addr + 4, info.boot_image_lba);
            mem.write_u32(addr + 8, info.boot_catalog_lba);
            mem.write_u16(addr + 12, info.load_segment);
            mem.write_u16(addr + 14, info.sector_count);
            STATUS_OK
        }
        other => {
            tracing::debug!(function = other, "unhandled INT 13h function");
            STATUS_INVALID
        }
    }
}

fn chs_transfer(
    cpu: &mut RealModeCpu,
    mem: &mut dyn Memory,
    disk: &mut dyn BlockDevice,
    write: bool,
) -> u8 {
    if is_cd_drive(cpu.dl()) {
        // CD-ROM drives only speak the extended interface.
        return STATUS_INVALID;
    }
    let count = u64::from(cpu.al());
    let sector = u64::from(cpu.cl() & 0x3F);
    let cylinder = u64::from(cpu.ch()) | u64::from(cpu.cl() & 0xC0) << 2;
    let head = u64::from(cpu.dh());
    if sector == 0 || count == 0 {
        return STATUS_INVALID;
    }
    let lba = (cylinder * HDD_HEADS + head) * HDD_SECTORS_PER_TRACK + sector - 1;
    let dest = RealModeCpu::linear(cpu.es, cpu.bx());
    match transfer(mem, disk, lba, count, dest, write) {
        Ok(()) => {
            cpu.set_al(count as u8);
            STATUS_OK
        }
        Err(status) => status,
    }
}

fn extended_transfer(
    cpu: &mut RealModeCpu,
    mem: &mut dyn Memory,
    disk: &mut dyn BlockDevice,
    write: bool,
) -> u8 {
    let dap = RealModeCpu::linear(cpu.ds, cpu.si());
    if mem.read_u8(dap) < 0x10 {
        return STATUS_INVALID;
    }
    let count = u64::from(mem.read_u16(dap + 2));
    let offset = mem.read_u16(dap + 4);
    let segment = mem.read_u16(dap + 6);
    let lba = u64::from(mem.read_u32(dap + 8)) | u64::from(mem.read_u32(dap + 12)) << 32;
    let dest = RealModeCpu::linear(segment, offset);

    // CD-ROM requests count in 2048-byte blocks; the medium itself is
    // addressed in 512-byte sectors, so scale by the block factor.
    let (lba, count) = if is_cd_drive(cpu.dl()) {
        (lba * CD_FACTOR, count * CD_FACTOR)
    } else {
        (lba, count)
    };

    match transfer(mem, disk, lba, count, dest, write) {
        Ok(()) => STATUS_OK,
        Err(status) => status,
    }
}

fn transfer(
    mem: &mut dyn Memory,
    disk: &mut dyn BlockDevice,
    lba: u64,
    count: u64,
    dest: u32,
    write: bool,
) -> Result<(), u8> {
    let mut buf = [0u8; 512];
    for i in 0..count {
        let addr = dest + (i as u32) * 512;
        if write {
            for (j, slot) in buf.iter_mut().enumerate() {
                *slot = mem.read_u8(addr + j as u32);
            }
            disk.write_sector(lba + i, &buf).map_err(map_disk_err)?;
        } else {
            disk.read_sector(lba + i, &mut buf).map_err(map_disk_err)?;
            for (j, byte) in buf.iter().enumerate() {
                mem.write_u8(addr + j as u32, *byte);
            }
        }
    }
    Ok(())
}

fn map_disk_err(err: DiskError) -> u8 {
    match err {
        DiskError::OutOfRange => STATUS_INVALID,
        DiskError::ReadOnly => STATUS_WRITE_PROTECTED,
        DiskError::IoError => STATUS_READ_FAILURE,
    }
}
