//! Real-to-protected transition driven from a boot sector: LGDT, CR0.PE,
//! then a far jump through a 32-bit code descriptor.

use machina_machine::{HaltReason, Machine, MachineConfig, RunExit};
use machina_x86::Width;

/// GDT at 0x7C38 (null, code32, data32); descriptor pointer at 0x7C30;
/// protected-mode body at 0x7C20.
fn protected_switch_sector() -> Vec<u8> {
    let mut image = vec![0x90u8; 512]; // NOP padding

    let code: [u8; 19] = [
        0xFA, // cli
        0x0F, 0x01, 0x16, 0x30, 0x7C, // lgdt [0x7C30]
        0x0F, 0x20, 0xC0, // mov eax, cr0
        0x0C, 0x01, // or al, 1
        0x0F, 0x22, 0xC0, // mov cr0, eax
        0xEA, 0x20, 0x7C, 0x08, 0x00, // jmp 0x08:0x7C20
    ];
    image[..code.len()].copy_from_slice(&code);

    // Protected-mode entry (32-bit default): mov ebx, 0x11223344; hlt.
    let entry: [u8; 6] = [0xBB, 0x44, 0x33, 0x22, 0x11, 0xF4];
    image[0x20..0x20 + entry.len()].copy_from_slice(&entry);

    // GDTR image: limit 0x17, base 0x7C38.
    image[0x30..0x32].copy_from_slice(&0x17u16.to_le_bytes());
    image[0x32..0x36].copy_from_slice(&0x7C38u32.to_le_bytes());

    // Flat 32-bit code and data descriptors.
    let code32: [u8; 8] = [0xFF, 0xFF, 0x00, 0x00, 0x00, 0x9A, 0xCF, 0x00];
    let data32: [u8; 8] = [0xFF, 0xFF, 0x00, 0x00, 0x00, 0x92, 0xCF, 0x00];
    image[0x38..0x40].fill(0);
    image[0x40..0x48].copy_from_slice(&code32);
    image[0x48..0x50].copy_from_slice(&data32);

    image[510] = 0x55;
    image[511] = 0xAA;
    image
}

#[test]
fn far_jump_enters_32_bit_protected_mode() {
    let mut m = Machine::new(MachineConfig::with_memory(8 * 1024 * 1024)).unwrap();
    m.set_disk_image(protected_switch_sector()).unwrap();
    m.reset();

    match m.run_slice(1_000) {
        RunExit::Halted { reason } => assert_eq!(reason, HaltReason::Wait),
        other => panic!("unexpected exit: {other:?}"),
    }

    let cpu = m.cpu();
    assert!(cpu.protected_mode());
    assert_eq!(cpu.cpl(), 0);
    assert_eq!(cpu.segments.cs.selector, 0x08);
    assert_eq!(cpu.segments.cs.base, 0);
    assert!(cpu.segments.cs.default_big());
    assert_eq!(cpu.default_operand_size(), Width::W32);
    assert_eq!(cpu.default_address_size(), Width::W32);

    // The fetch after the far jump came from the protected entry point.
    assert_eq!(cpu.read_gpr32(3), 0x1122_3344);
    assert_eq!(cpu.rip(), 0x7C26);
}
