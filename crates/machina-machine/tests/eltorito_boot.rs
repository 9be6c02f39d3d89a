//! End-to-end El Torito no-emulation boot: POST parses the catalog, loads
//! the image at its load segment, and the booted code reads more of the CD
//! through INT 13h AH=42h.

use machina_machine::{BootKind, Machine, MachineConfig, RunExit};
use pretty_assertions::assert_eq;

const ISO_BLOCK: usize = 2048;

const EL_TORITO_SYSTEM_ID: [u8; 32] = {
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
    let off = lba * ISO_BLOCK;
    if img.len() < off + ISO_BLOCK {
        img.resize(off + ISO_BLOCK, 0);
    }
    img[off..off + block.len()].copy_from_slice(block);
}

fn build_iso(
    boot_catalog_lba: u32,
    boot_image_lba: u32,
    boot_image: &[u8; ISO_BLOCK],
    load_segment: u16,
    sector_count: u16,
) -> Vec<u8> {
    let mut img = Vec::new();

    let mut pvd = [0u8; ISO_BLOCK];
    pvd[0] = 0x01;
    pvd[1..6].copy_from_slice(b"CD001");
    pvd[6] = 1;
    write_block(&mut img, 16, &pvd);

    let mut brvd = [0u8; ISO_BLOCK];
    brvd[0] = 0x00;
    brvd[1..6].copy_from_slice(b"CD001");
    brvd[6] = 1;
    brvd[7..39].copy_from_slice(&EL_TORITO_SYSTEM_ID);
    brvd[0x47..0x4B].copy_from_slice(&boot_catalog_lba.to_le_bytes());
    write_block(&mut img, 17, &brvd);

    let mut term = [0u8; ISO_BLOCK];
    term[0] = 0xFF;
    term[1..6].copy_from_slice(b"CD001");
    term[6] = 1;
    write_block(&mut img, 18, &term);

    let mut catalog = [0u8; ISO_BLOCK];
    let mut validation = [0u8; 32];
    validation[0] = 0x01;
    validation[0x1E] = 0x55;
    validation[0x1F] = 0xAA;
    let mut sum: u16 = 0;
    for chunk in validation.chunks_exact(2) {
        sum = sum.wrapping_add(u16::from_le_bytes([chunk[0], chunk[1]]));
    }
    validation[0x1C..0x1E].copy_from_slice(&(0u16.wrapping_sub(sum)).to_le_bytes());
    catalog[0..32].copy_from_slice(&validation);

    let mut initial = [0u8; 32];
    initial[0] = 0x88;
    initial[1] = 0x00; // no emulation
    initial[2..4].copy_from_slice(&load_segment.to_le_bytes());
    initial[6..8].copy_from_slice(&sector_count.to_le_bytes());
    initial[8..12].copy_from_slice(&boot_image_lba.to_le_bytes());
    catalog[32..64].copy_from_slice(&initial);
    write_block(&mut img, boot_catalog_lba as usize, &catalog);

    write_block(&mut img, boot_image_lba as usize, boot_image);
    img
}

fn rel8(from_next: usize, to: usize) -> u8 {
    let diff = to as i32 - from_next as i32;
    assert!((-128..=127).contains(&diff));
    diff as i8 as u8
}

const SUCCESS: u8 = b'S';
const FAIL: u8 = b'F';
const DATA_LBA: u32 = 22;

/// Reads one CD block from `DATA_LBA` via INT 13h AH=42h, verifies the
/// marker, and reports a single byte through COM1 before halting.
fn build_boot_image() -> [u8; ISO_BLOCK] {
    let mut code: Vec<u8> = Vec::new();

    code.extend_from_slice(&[0x31, 0xC0]); // xor ax, ax
    code.extend_from_slice(&[0x8E, 0xD8]); // mov ds, ax

    code.push(0xBE); // mov si, imm16 (patched below)
    let si_imm = code.len();
    code.extend_from_slice(&[0, 0]);

    code.extend_from_slice(&[0xB4, 0x42]); // mov ah, 0x42
    code.extend_from_slice(&[0xCD, 0x13]); // int 0x13

    code.push(0x72); // jc fail
    let jc_off = code.len();
    code.push(0);

    code.extend_from_slice(&[0xBB, 0x00, 0x05]); // mov bx, 0x0500
    code.extend_from_slice(&[0x81, 0x3F, 0x43, 0x44]); // cmp word [bx], "CD"
    code.push(0x75); // jne fail
    let jne1_off = code.len();
    code.push(0);
    code.extend_from_slice(&[0x81, 0x7F, 0x02, 0x4F, 0x4B]); // cmp word [bx+2], "OK"
    code.push(0x75); // jne fail
    let jne2_off = code.len();
    code.push(0);

    // success:
    code.extend_from_slice(&[0xBA, 0xF8, 0x03]); // mov dx, 0x3F8
    code.extend_from_slice(&[0xB0, SUCCESS]); // mov al, 'S'
    code.push(0xEE); // out dx, al
    code.extend_from_slice(&[0xFA, 0xF4]); // cli; hlt

    let fail_label = code.len();
    code.extend_from_slice(&[0xBA, 0xF8, 0x03]);
    code.extend_from_slice(&[0xB0, FAIL]);
    code.push(0xEE);
    code.extend_from_slice(&[0xFA, 0xF4]);

    // Disk address packet: one 2048-byte block from DATA_LBA into 0000:0500.
    let dap_off = code.len();
    let mut dap = [0u8; 16];
    dap[0] = 0x10;
    dap[2..4].copy_from_slice(&1u16.to_le_bytes());
    dap[4..6].copy_from_slice(&0x0500u16.to_le_bytes());
    dap[6..8].copy_from_slice(&0u16.to_le_bytes());
    dap[8..16].copy_from_slice(&u64::from(DATA_LBA).to_le_bytes());
    code.extend_from_slice(&dap);

    let dap_addr = 0x7C00u16 + dap_off as u16;
    code[si_imm..si_imm + 2].copy_from_slice(&dap_addr.to_le_bytes());
    code[jc_off] = rel8(jc_off + 1, fail_label);
    code[jne1_off] = rel8(jne1_off + 1, fail_label);
    code[jne2_off] = rel8(jne2_off + 1, fail_label);

    let mut img = [0u8; ISO_BLOCK];
    img[..code.len()].copy_from_slice(&code);
    img[510] = 0x55;
    img[511] = 0xAA;
    img
}

fn run_until_halt(m: &mut Machine) {
    for _ in 0..100 {
        match m.run_slice(10_000) {
            RunExit::Halted { .. } => return,
            RunExit::Completed { .. } => continue,
            other => panic!("unexpected exit: {other:?}"),
        }
    }
    panic!("machine did not halt within the slice budget");
}

#[test]
fn boots_el_torito_no_emulation_image() {
    let boot_image = build_boot_image();
    let mut iso = build_iso(20, 21, &boot_image, 0x07C0, 4);

    let mut data = [0u8; ISO_BLOCK];
    data[0..4].copy_from_slice(b"CDOK");
    write_block(&mut iso, DATA_LBA as usize, &data);

    let mut m = Machine::new(MachineConfig {
        boot: BootKind::Iso,
        ..MachineConfig::with_memory(16 * 1024 * 1024)
    })
    .unwrap();
    m.attach_iso_bytes(iso).unwrap();
    m.reset();

    // POST left the machine at the El Torito entry point.
    assert_eq!(m.cpu().segments.cs.selector, 0x07C0);
    assert_eq!(m.cpu().rip(), 0);
    assert_eq!(m.cpu().read_gpr8(2, false), 0xE0, "boot drive in DL");

    // The image bytes must be in memory at load_segment * 16.
    let loaded = m.read_physical_bytes(0x7C00, ISO_BLOCK);
    assert_eq!(loaded, boot_image.to_vec());

    run_until_halt(&mut m);
    assert_eq!(m.take_serial_output(), vec![SUCCESS]);
}

#[test]
fn boot_image_size_follows_sector_count() {
    // sector_count = 2 loads exactly 1024 bytes; the tail of the block must
    // stay zero in guest memory even though the ISO has data there.
    let mut boot_image = [0u8; ISO_BLOCK];
    boot_image.fill(0xEE);
    boot_image[0] = 0xF4; // hlt
    boot_image[510] = 0x55;
    boot_image[511] = 0xAA;

    let iso = build_iso(20, 21, &boot_image, 0x07C0, 2);

    let mut m = Machine::new(MachineConfig {
        boot: BootKind::Iso,
        ..MachineConfig::with_memory(16 * 1024 * 1024)
    })
    .unwrap();
    m.attach_iso_bytes(iso).unwrap();
    m.reset();

    let loaded = m.read_physical_bytes(0x7C00, ISO_BLOCK);
    assert_eq!(&loaded[..1024], &boot_image[..1024]);
    assert!(loaded[1024..].iter().all(|&b| b == 0));
}

#[test]
fn int13_ah4b_reports_cached_boot_metadata() {
    let mut boot_image = [0u8; ISO_BLOCK];
    // mov ax, 0x4B01; mov dx, 0x00E0; xor di,di; mov es,di; mov di,0x600;
    // int 0x13; cli; hlt
    let code: [u8; 17] = [
        0xB8, 0x01, 0x4B, // mov ax, 0x4B01
        0xBA, 0xE0, 0x00, // mov dx, 0x00E0
        0x31, 0xFF, // xor di, di
        0x8E, 0xC7, // mov es, di
        0xBF, 0x00, 0x06, // mov di, 0x0600
        0xCD, 0x13, // int 0x13
        0xFA, 0xF4, // cli; hlt
    ];
    boot_image[..code.len()].copy_from_slice(&code);
    boot_image[510] = 0x55;
    boot_image[511] = 0xAA;

    let iso = build_iso(20, 21, &boot_image, 0x07C0, 4);

    let mut m = Machine::new(MachineConfig {
        boot: BootKind::Iso,
        ..MachineConfig::with_memory(16 * 1024 * 1024)
    })
    .unwrap();
    m.attach_iso_bytes(iso).unwrap();
    m.reset();
    run_until_halt(&mut m);

    assert_eq!(m.read_physical_u8(0x600), 0x13);
    assert_eq!(m.read_physical_u8(0x601), 0x00); // no-emulation
    assert_eq!(m.read_physical_u8(0x602), 0xE0); // boot drive
    assert_eq!(m.read_physical_u32(0x604), 21); // boot image LBA
    assert_eq!(m.read_physical_u32(0x608), 20); // catalog LBA
    assert_eq!(m.read_physical_u16(0x60C), 0x07C0);
    assert_eq!(m.read_physical_u16(0x60E), 4);
}
