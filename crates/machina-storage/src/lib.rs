//! Boot media: byte-addressed virtual disks and the ISO 9660 / El Torito
//! loader that extracts a boot image from CD-ROM images.

pub mod disk;
pub mod iso;

pub use disk::{DiskError, FileDisk, MemDisk, Result, VirtualDisk, SECTOR_SIZE};
pub use iso::{BootEntry, BootImage, IsoError, IsoImage, MediaType, ISO_SECTOR_SIZE};
