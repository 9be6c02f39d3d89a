//! ISO 9660 volume parsing and El Torito boot-catalog handling.
//!
//! Volume descriptors are scanned from LBA 16 until the set terminator; the
//! boot record names the catalog sector, whose validation entry must carry
//! header id 0x01, key bytes 0x55AA and a zero 16-bit checksum. The
//! initial/default entry (plus any section entries) then locates the boot
//! image on the medium.

use crate::disk::{DiskError, VirtualDisk};

pub const ISO_SECTOR_SIZE: usize = 2048;

const VOLUME_DESCRIPTOR_START_LBA: u64 = 16;
const STANDARD_IDENTIFIER: &[u8; 5] = b"CD001";
const EL_TORITO_SYSTEM_ID: &str = "EL TORITO SPECIFICATION";
const DEFAULT_LOAD_SEGMENT: u16 = 0x07C0;
const DEFAULT_SECTOR_COUNT: u16 = 4;

#[derive(Debug, thiserror::Error)]
pub enum IsoError {
    #[error("missing ISO9660 standard identifier (CD001) in volume descriptor at LBA {lba}")]
    MissingIdentifier { lba: u64 },
    #[error("no primary volume descriptor found")]
    NoPrimaryDescriptor,
    #[error("no El Torito boot record found")]
    NoBootRecord,
    #[error("boot catalog validation entry is malformed")]
    BadValidationEntry,
    #[error("boot catalog initial entry is not bootable (indicator {indicator:#04x})")]
    NotBootable { indicator: u8 },
    #[error("no such file: {0}")]
    FileNotFound(String),
    #[error("medium error: {0}")]
    Disk(#[from] DiskError),
}

/// El Torito media type of a boot entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    NoEmulation,
    Floppy12M,
    Floppy144M,
    Floppy288M,
    HardDisk,
}

impl MediaType {
    fn from_byte(byte: u8) -> MediaType {
        match byte & 0x0F {
            1 => MediaType::Floppy12M,
            2 => MediaType::Floppy144M,
            3 => MediaType::Floppy288M,
            4 => MediaType::HardDisk,
            _ => MediaType::NoEmulation,
        }
    }

    /// Nominal image size for floppy-emulation types.
    pub fn floppy_bytes(self) -> Option<usize> {
        match self {
            MediaType::Floppy12M => Some(1_228_800),
            MediaType::Floppy144M => Some(1_474_560),
            MediaType::Floppy288M => Some(2_949_120),
            _ => None,
        }
    }
}

/// A decoded 32-byte boot-catalog entry.
#[derive(Debug, Clone, Copy)]
pub struct BootEntry {
    pub bootable: bool,
    pub media_type: MediaType,
    pub load_segment: u16,
    pub system_type: u8,
    pub sector_count: u16,
    pub load_rba: u32,
}

impl BootEntry {
    fn parse(raw: &[u8]) -> BootEntry {
        let load_segment = u16::from_le_bytes([raw[2], raw[3]]);
        let sector_count = u16::from_le_bytes([raw[6], raw[7]]);
        BootEntry {
            bootable: raw[0] == 0x88,
            media_type: MediaType::from_byte(raw[1]),
            load_segment: if load_segment == 0 {
                DEFAULT_LOAD_SEGMENT
            } else {
                load_segment
            },
            system_type: raw[4],
            sector_count: if sector_count == 0 {
                DEFAULT_SECTOR_COUNT
            } else {
                sector_count
            },
            load_rba: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
        }
    }
}

/// The boot image materialized from the catalog's chosen entry.
#[derive(Debug, Clone)]
pub struct BootImage {
    pub load_segment: u16,
    /// `load_segment * 16`.
    pub load_address: u64,
    pub media_type: MediaType,
    pub data: Vec<u8>,
}

/// An ISO 9660 volume over any [`VirtualDisk`].
#[derive(Debug)]
pub struct IsoImage<D: VirtualDisk> {
    disk: D,
    /// Root directory extent (LBA, byte size) from the PVD.
    root_dir: (u32, u32),
    boot_catalog_lba: u32,
    default_entry: BootEntry,
    /// Section entries following the initial/default one, already filtered
    /// to the x86 platform.
    section_entries: Vec<BootEntry>,
}

impl<D: VirtualDisk> IsoImage<D> {
    /// Parses the volume descriptors and the El Torito catalog.
    pub fn open(mut disk: D) -> Result<IsoImage<D>, IsoError> {
        let mut lba = VOLUME_DESCRIPTOR_START_LBA;
        let mut root_dir = None;
        let mut boot_catalog_lba = None;

        loop {
            let mut sector = [0u8; ISO_SECTOR_SIZE];
            disk.read_at(lba * ISO_SECTOR_SIZE as u64, &mut sector)?;
            if &sector[1..6] != STANDARD_IDENTIFIER {
                return Err(IsoError::MissingIdentifier { lba });
            }
            match sector[0] {
                // Boot record: system id names El Torito, catalog LBA at
                // offset 0x47.
                0 => {
                    let sys_id = std::str::from_utf8(&sector[7..39])
                        .unwrap_or("")
                        .trim_end_matches([' ', '\0']);
                    if sys_id == EL_TORITO_SYSTEM_ID {
                        let raw: [u8; 4] = sector[0x47..0x4B].try_into().unwrap();
                        boot_catalog_lba = Some(u32::from_le_bytes(raw));
                    }
                }
                // Primary volume descriptor: root directory record at 156.
                1 => {
                    let record = &sector[156..156 + 34];
                    let extent: [u8; 4] = record[2..6].try_into().unwrap();
                    let size: [u8; 4] = record[10..14].try_into().unwrap();
                    root_dir = Some((u32::from_le_bytes(extent), u32::from_le_bytes(size)));
                }
                // Set terminator.
                255 => break,
                _ => {}
            }
            lba += 1;
        }

        let root_dir = root_dir.ok_or(IsoError::NoPrimaryDescriptor)?;
        let boot_catalog_lba = boot_catalog_lba.ok_or(IsoError::NoBootRecord)?;

        let mut catalog = [0u8; ISO_SECTOR_SIZE];
        disk.read_at(
            u64::from(boot_catalog_lba) * ISO_SECTOR_SIZE as u64,
            &mut catalog,
        )?;

        let validation = &catalog[0..32];
        if validation[0] != 0x01 || validation[0x1E] != 0x55 || validation[0x1F] != 0xAA {
            return Err(IsoError::BadValidationEntry);
        }
        let mut checksum: u16 = 0;
        for pair in validation.chunks_exact(2) {
            checksum = checksum.wrapping_add(u16::from_le_bytes([pair[0], pair[1]]));
        }
        if checksum != 0 {
            return Err(IsoError::BadValidationEntry);
        }

        let default_entry = BootEntry::parse(&catalog[32..64]);
        if !default_entry.bootable {
            return Err(IsoError::NotBootable { indicator: catalog[32] });
        }

        // Optional section headers (0x90 non-final, 0x91 final) with their
        // entries; only BIOS/x86 (platform 0) sections are retained.
        let mut section_entries = Vec::new();
        let mut platform_id = validation[1];
        for raw in catalog[64..].chunks_exact(32) {
            match raw[0] {
                0x90 | 0x91 => platform_id = raw[1],
                0x88 | 0x00 => {
                    if platform_id == 0 && raw[0] == 0x88 {
                        section_entries.push(BootEntry::parse(raw));
                    }
                }
                _ => break,
            }
        }

        Ok(IsoImage {
            disk,
            root_dir,
            boot_catalog_lba,
            default_entry,
            section_entries,
        })
    }

    pub fn boot_catalog_lba(&self) -> u32 {
        self.boot_catalog_lba
    }

    pub fn default_entry(&self) -> &BootEntry {
        &self.default_entry
    }

    pub fn section_entries(&self) -> &[BootEntry] {
        &self.section_entries
    }

    /// Reads whole 2048-byte sectors.
    pub fn read_sectors(&mut self, lba: u64, count: usize) -> Result<Vec<u8>, IsoError> {
        let mut data = vec![0u8; count * ISO_SECTOR_SIZE];
        self.disk.read_at(lba * ISO_SECTOR_SIZE as u64, &mut data)?;
        Ok(data)
    }

    /// Materializes the boot image for the default entry.
    ///
    /// Floppy-emulation types load the full nominal floppy size regardless
    /// of the catalog's sector count; no-emulation (and hard-disk) entries
    /// load exactly `sector_count` virtual 512-byte sectors.
    pub fn boot_image(&mut self) -> Result<BootImage, IsoError> {
        let entry = self.default_entry;
        let size = match entry.media_type.floppy_bytes() {
            Some(bytes) => bytes,
            None => usize::from(entry.sector_count) * 512,
        };
        let mut data = vec![0u8; size];
        // Short images are legal: the tail past end-of-medium stays zeroed.
        let capacity = self.disk.capacity_bytes();
        let start = u64::from(entry.load_rba) * ISO_SECTOR_SIZE as u64;
        let available = capacity.saturating_sub(start).min(size as u64) as usize;
        if available > 0 {
            self.disk.read_at(start, &mut data[..available])?;
        }

        Ok(BootImage {
            load_segment: entry.load_segment,
            load_address: u64::from(entry.load_segment) << 4,
            media_type: entry.media_type,
            data,
        })
    }

    /// Looks up `path` (`/`-separated, case-insensitive) through the
    /// directory records and returns the file contents. Debug utility.
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>, IsoError> {
        let mut extent = self.root_dir;
        let mut components = path
            .split('/')
            .filter(|c| !c.is_empty())
            .peekable();

        while let Some(component) = components.next() {
            let is_last = components.peek().is_none();
            let (lba, size) = extent;
            let dir = self.read_extent(lba, size)?;
            let entry = find_directory_record(&dir, component)
                .ok_or_else(|| IsoError::FileNotFound(path.to_string()))?;
            if is_last {
                return self.read_extent(entry.0, entry.1).map_err(Into::into);
            }
            if !entry.2 {
                return Err(IsoError::FileNotFound(path.to_string()));
            }
            extent = (entry.0, entry.1);
        }
        Err(IsoError::FileNotFound(path.to_string()))
    }

    fn read_extent(&mut self, lba: u32, size: u32) -> Result<Vec<u8>, IsoError> {
        let sectors = (size as usize).div_ceil(ISO_SECTOR_SIZE);
        let mut data = self.read_sectors(u64::from(lba), sectors)?;
        data.truncate(size as usize);
        Ok(data)
    }

    pub fn into_disk(self) -> D {
        self.disk
    }

    pub fn disk_mut(&mut self) -> &mut D {
        &mut self.disk
    }
}

/// Scans a directory extent for a record whose identifier matches `name`.
/// Returns `(extent_lba, size, is_directory)`.
fn find_directory_record(dir: &[u8], name: &str) -> Option<(u32, u32, bool)> {
    let mut pos = 0;
    while pos + 33 <= dir.len() {
        let len = usize::from(dir[pos]);
        if len == 0 {
            // Records never straddle sector boundaries; skip the pad.
            let next = (pos / ISO_SECTOR_SIZE + 1) * ISO_SECTOR_SIZE;
            if next <= pos || next >= dir.len() {
                break;
            }
            pos = next;
            continue;
        }
        let record = &dir[pos..(pos + len).min(dir.len())];
        pos += len;

        let name_len = usize::from(record[32]);
        if record.len() < 33 + name_len {
            continue;
        }
        let raw_name = &record[33..33 + name_len];
        // 0x00/0x01 are the self/parent pseudo-entries.
        if raw_name == [0] || raw_name == [1] {
            continue;
        }
        let ident = std::str::from_utf8(raw_name).unwrap_or("");
        // File identifiers carry a ";1" version suffix.
        let ident = ident.split(';').next().unwrap_or(ident);
        if ident.eq_ignore_ascii_case(name) {
            let extent: [u8; 4] = record[2..6].try_into().ok()?;
            let size: [u8; 4] = record[10..14].try_into().ok()?;
            let is_dir = record[25] & 0x02 != 0;
            return Some((
                u32::from_le_bytes(extent),
                u32::from_le_bytes(size),
                is_dir,
            ));
        }
    }
    None
}
