use machina_storage::{IsoError, IsoImage, MediaType, MemDisk, ISO_SECTOR_SIZE};

const ISO9660_VERSION: u8 = 1;

// The boot system ID in the boot record volume descriptor is space-padded.
const EL_TORITO_BOOT_SYSTEM_ID_SPACES: [u8; 32] = {
    let mut out = [b' '; 32];
    let src = *b"EL TORITO SPECIFICATION";
    let mut i = 0;
    while i < src.len() {
        out[i] = src[i];
        i += 1;
    }
    out
};

fn write_block(img: &mut Vec<u8>, lba: usize, block: &[u8]) {
    let off = lba * ISO_SECTOR_SIZE;
    if img.len() < off + ISO_SECTOR_SIZE {
        img.resize(off + ISO_SECTOR_SIZE, 0);
    }
    img[off..off + block.len()].copy_from_slice(block);
}

fn descriptor_header(kind: u8) -> [u8; ISO_SECTOR_SIZE] {
    let mut block = [0u8; ISO_SECTOR_SIZE];
    block[0] = kind;
    block[1..6].copy_from_slice(b"CD001");
    block[6] = ISO9660_VERSION;
    block
}

fn validation_entry() -> [u8; 32] {
    let mut validation = [0u8; 32];
    validation[0] = 0x01;
    validation[0x1E] = 0x55;
    validation[0x1F] = 0xAA;
    let mut sum: u16 = 0;
    for chunk in validation.chunks_exact(2) {
        sum = sum.wrapping_add(u16::from_le_bytes([chunk[0], chunk[1]]));
    }
    validation[0x1C..0x1E].copy_from_slice(&(0u16.wrapping_sub(sum)).to_le_bytes());
    validation
}

struct IsoSpec {
    boot_catalog_lba: u32,
    boot_image_lba: u32,
    media_type: u8,
    load_segment: u16,
    sector_count: u16,
}

fn build_iso(spec: &IsoSpec, boot_image: &[u8]) -> Vec<u8> {
    let mut img = Vec::new();

    // PVD with a minimal (empty) root directory record.
    let mut pvd = descriptor_header(1);
    pvd[156] = 34; // record length
    pvd[156 + 2..156 + 6].copy_from_slice(&30u32.to_le_bytes()); // extent
    pvd[156 + 10..156 + 14].copy_from_slice(&0u32.to_le_bytes()); // size
    pvd[156 + 25] = 0x02; // directory
    write_block(&mut img, 16, &pvd);

    let mut brvd = descriptor_header(0);
    brvd[7..39].copy_from_slice(&EL_TORITO_BOOT_SYSTEM_ID_SPACES);
    brvd[0x47..0x4B].copy_from_slice(&spec.boot_catalog_lba.to_le_bytes());
    write_block(&mut img, 17, &brvd);

    write_block(&mut img, 18, &descriptor_header(255));

    let mut catalog = [0u8; ISO_SECTOR_SIZE];
    catalog[0..32].copy_from_slice(&validation_entry());
    let mut initial = [0u8; 32];
    initial[0] = 0x88;
    initial[1] = spec.media_type;
    initial[2..4].copy_from_slice(&spec.load_segment.to_le_bytes());
    initial[6..8].copy_from_slice(&spec.sector_count.to_le_bytes());
    initial[8..12].copy_from_slice(&spec.boot_image_lba.to_le_bytes());
    catalog[32..64].copy_from_slice(&initial);
    write_block(&mut img, spec.boot_catalog_lba as usize, &catalog);

    for (i, chunk) in boot_image.chunks(ISO_SECTOR_SIZE).enumerate() {
        write_block(&mut img, spec.boot_image_lba as usize + i, chunk);
    }

    img
}

#[test]
fn no_emulation_boot_image_is_sector_count_times_512() {
    let mut payload = vec![0u8; 4 * 512];
    payload[0] = 0xB8; // something recognizable at the entry point
    payload[510] = 0x55;
    payload[511] = 0xAA;

    let iso = build_iso(
        &IsoSpec {
            boot_catalog_lba: 19,
            boot_image_lba: 20,
            media_type: 0,
            load_segment: 0x07C0,
            sector_count: 4,
        },
        &payload,
    );
    let expected_offset = 20 * ISO_SECTOR_SIZE;
    let expected = iso[expected_offset..expected_offset + 2048].to_vec();

    let mut image = IsoImage::open(MemDisk::new(iso)).unwrap();
    let boot = image.boot_image().unwrap();

    assert_eq!(boot.data.len(), 4 * 512);
    assert_eq!(boot.load_segment, 0x07C0);
    assert_eq!(boot.load_address, 0x7C00);
    assert_eq!(boot.media_type, MediaType::NoEmulation);
    assert_eq!(boot.data, expected);
}

#[test]
fn zero_fields_take_el_torito_defaults() {
    let iso = build_iso(
        &IsoSpec {
            boot_catalog_lba: 19,
            boot_image_lba: 20,
            media_type: 0,
            load_segment: 0,
            sector_count: 0,
        },
        &[0xAA; 2048],
    );

    let mut image = IsoImage::open(MemDisk::new(iso)).unwrap();
    let entry = *image.default_entry();
    assert_eq!(entry.load_segment, 0x07C0);
    assert_eq!(entry.sector_count, 4);

    let boot = image.boot_image().unwrap();
    assert_eq!(boot.data.len(), 2048);
}

#[test]
fn floppy_emulation_loads_full_nominal_size() {
    let iso = build_iso(
        &IsoSpec {
            boot_catalog_lba: 19,
            boot_image_lba: 20,
            media_type: 2, // 1.44 MB
            load_segment: 0,
            sector_count: 1,
        },
        &[0x42; 4096],
    );

    let mut image = IsoImage::open(MemDisk::new(iso)).unwrap();
    let boot = image.boot_image().unwrap();
    assert_eq!(boot.media_type, MediaType::Floppy144M);
    assert_eq!(boot.data.len(), 1_474_560);
    assert_eq!(boot.data[0], 0x42);
    assert_eq!(
        boot.data[1_474_559], 0,
        "bytes past end of medium read as zero"
    );
}

#[test]
fn read_sectors_returns_raw_cd_blocks() {
    let mut payload = vec![0u8; 2048];
    payload[0..4].copy_from_slice(b"CDOK");
    let iso = build_iso(
        &IsoSpec {
            boot_catalog_lba: 19,
            boot_image_lba: 22,
            media_type: 0,
            load_segment: 0,
            sector_count: 1,
        },
        &payload,
    );

    let mut image = IsoImage::open(MemDisk::new(iso)).unwrap();
    let data = image.read_sectors(22, 1).unwrap();
    assert_eq!(&data[0..4], b"CDOK");
    assert_eq!(data.len(), 2048);
}

#[test]
fn missing_identifier_is_rejected() {
    let img = vec![0u8; 20 * ISO_SECTOR_SIZE];
    let err = IsoImage::open(MemDisk::new(img)).unwrap_err();
    assert!(matches!(err, IsoError::MissingIdentifier { lba: 16 }));
}

#[test]
fn corrupt_validation_entry_is_rejected() {
    let mut iso = build_iso(
        &IsoSpec {
            boot_catalog_lba: 19,
            boot_image_lba: 20,
            media_type: 0,
            load_segment: 0,
            sector_count: 1,
        },
        &[0; 512],
    );
    // Flip a byte inside the validation entry without fixing the checksum.
    iso[19 * ISO_SECTOR_SIZE + 4] ^= 0xFF;
    let err = IsoImage::open(MemDisk::new(iso)).unwrap_err();
    assert!(matches!(err, IsoError::BadValidationEntry));
}

#[test]
fn non_bootable_entry_is_rejected() {
    let mut iso = build_iso(
        &IsoSpec {
            boot_catalog_lba: 19,
            boot_image_lba: 20,
            media_type: 0,
            load_segment: 0,
            sector_count: 1,
        },
        &[0; 512],
    );
    iso[19 * ISO_SECTOR_SIZE + 32] = 0x00; // clear the boot indicator
    let err = IsoImage::open(MemDisk::new(iso)).unwrap_err();
    assert!(matches!(err, IsoError::NotBootable { indicator: 0 }));
}

#[test]
fn catalog_bytes_roundtrip_through_parse() {
    // The parsed entry reflects the exact bytes that went into the catalog.
    let spec = IsoSpec {
        boot_catalog_lba: 21,
        boot_image_lba: 33,
        media_type: 0,
        load_segment: 0x1000,
        sector_count: 8,
    };
    let iso = build_iso(&spec, &[0; 512]);
    let image = IsoImage::open(MemDisk::new(iso)).unwrap();
    let entry = image.default_entry();
    assert_eq!(entry.load_segment, 0x1000);
    assert_eq!(entry.sector_count, 8);
    assert_eq!(entry.load_rba, 33);
    assert_eq!(image.boot_catalog_lba(), 21);
}
