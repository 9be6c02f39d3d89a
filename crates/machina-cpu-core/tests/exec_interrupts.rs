use machina_cpu_core::exec::{Interpreter, Vcpu};
use machina_cpu_core::mem::{CpuBus, FlatTestBus};
use machina_cpu_core::state::{gpr, CpuMode, RFLAGS_IF, SEG_ACCESS_PRESENT};
use machina_x86::Register;

#[allow(clippy::too_many_arguments)]
fn make_descriptor(
    base: u32,
    limit_raw: u32,
    typ: u8,
    s: bool,
    dpl: u8,
    present: bool,
    avl: bool,
    l: bool,
    db: bool,
    g: bool,
) -> u64 {
    let mut raw = 0u64;
    raw |= (limit_raw & 0xFFFF) as u64;
    raw |= ((base & 0xFFFF) as u64) << 16;
    raw |= (((base >> 16) & 0xFF) as u64) << 32;
    let access =
        (typ as u64) | ((s as u64) << 4) | (((dpl as u64) & 0x3) << 5) | ((present as u64) << 7);
    raw |= access << 40;
    raw |= (((limit_raw >> 16) & 0xF) as u64) << 48;
    let flags = (avl as u64) | ((l as u64) << 1) | ((db as u64) << 2) | ((g as u64) << 3);
    raw |= flags << 52;
    raw |= (((base >> 24) & 0xFF) as u64) << 56;
    raw
}

fn setup_gdt(bus: &mut impl CpuBus, gdt_base: u64, descriptors: &[u64]) {
    for (i, &desc) in descriptors.iter().enumerate() {
        bus.write_u64(gdt_base + (i as u64) * 8, desc).unwrap();
    }
}

fn write_idt_gate32(
    mem: &mut impl CpuBus,
    base: u64,
    vector: u8,
    selector: u16,
    offset: u32,
    type_attr: u8,
) {
    let addr = base + (vector as u64) * 8;
    mem.write_u16(addr, (offset & 0xFFFF) as u16).unwrap();
    mem.write_u16(addr + 2, selector).unwrap();
    mem.write_u8(addr + 4, 0).unwrap();
    mem.write_u8(addr + 5, type_attr).unwrap();
    mem.write_u16(addr + 6, (offset >> 16) as u16).unwrap();
}

fn write_idt_gate64(
    mem: &mut impl CpuBus,
    base: u64,
    vector: u8,
    selector: u16,
    offset: u64,
    ist: u8,
    type_attr: u8,
) {
    let addr = base + (vector as u64) * 16;
    mem.write_u16(addr, (offset & 0xFFFF) as u16).unwrap();
    mem.write_u16(addr + 2, selector).unwrap();
    mem.write_u8(addr + 4, ist & 0x7).unwrap();
    mem.write_u8(addr + 5, type_attr).unwrap();
    mem.write_u16(addr + 6, ((offset >> 16) & 0xFFFF) as u16)
        .unwrap();
    mem.write_u32(addr + 8, ((offset >> 32) & 0xFFFF_FFFF) as u32)
        .unwrap();
    mem.write_u32(addr + 12, 0).unwrap();
}

fn run_to_halt<B: CpuBus>(cpu: &mut Vcpu<B>, interp: &mut Interpreter, max_iters: u64) {
    for _ in 0..max_iters {
        if cpu.exit.is_some() {
            panic!("unexpected CPU exit: {:?}", cpu.exit);
        }
        if cpu.cpu.state.halted {
            return;
        }
        interp.exec_block(cpu);
    }
    panic!("program did not halt");
}

#[test]
fn int_and_iretd_roundtrip_in_protected_mode() {
    let mut bus = FlatTestBus::new(0x20000);

    let handler = 0x2000u32;
    let idt_base = 0x1000u64;

    // Code: int 0x80; hlt
    bus.load(0, &[0xCD, 0x80, 0xF4]);
    // Handler: mov eax, 0x42; iretd
    bus.load(handler as u64, &[0xB8, 0x42, 0x00, 0x00, 0x00, 0xCF]);

    write_idt_gate32(&mut bus, idt_base, 0x80, 0x08, handler, 0x8E);

    let mut cpu = Vcpu::new_with_mode(CpuMode::Protected, bus);
    cpu.cpu.state.tables.idtr.base = idt_base;
    cpu.cpu.state.tables.idtr.limit = 0x7FF;
    cpu.cpu.state.write_gpr32(gpr::RSP, 0x1000);
    cpu.cpu.state.set_rflags(0x202);
    cpu.cpu.state.set_rip(0);

    let mut interp = Interpreter::new(64);
    run_to_halt(&mut cpu, &mut interp, 16);

    assert!(cpu.cpu.state.halted);
    assert_eq!(cpu.cpu.state.read_reg(Register::EAX), 0x42);
    assert_eq!(cpu.cpu.state.read_gpr32(gpr::RSP), 0x1000);
    assert_ne!(cpu.cpu.state.rflags() & RFLAGS_IF, 0);
}

#[test]
fn mov_ss_sets_interrupt_shadow_in_real_mode() {
    let mut bus = FlatTestBus::new(0x20000);

    let code_base = 0x0100u64;
    // mov ss, ax; nop
    bus.load(code_base, &[0x8E, 0xD0, 0x90]);

    // IVT[0x20] -> 0000:0500
    let vector = 0x20u8;
    let handler_off = 0x0500u16;
    bus.write_u16(u64::from(vector) * 4, handler_off).unwrap();
    bus.write_u16(u64::from(vector) * 4 + 2, 0).unwrap();
    bus.load(u64::from(handler_off), &[0xF4]); // handler: HLT

    let mut cpu = Vcpu::new_with_mode(CpuMode::Real, bus);
    cpu.cpu.state.write_reg(Register::SP, 0x8000);
    cpu.cpu.state.write_reg(Register::AX, 0x1000);
    cpu.cpu.state.set_rflags(0x0202); // IF=1
    cpu.cpu.state.set_rip(code_base);

    // Execute MOV SS, AX; the shadow must inhibit delivery for exactly one
    // further instruction.
    let exit = cpu.step();
    assert_eq!(exit, machina_cpu_core::StepExit::Normal);
    assert_eq!(cpu.cpu.state.rip(), code_base + 2);
    assert_eq!(cpu.cpu.state.read_reg(Register::SS), 0x1000);

    cpu.cpu.pending.inject_external_interrupt(vector);
    assert!(
        !cpu.maybe_deliver_interrupt(),
        "external interrupt should be blocked by the MOV SS shadow"
    );
    assert_eq!(cpu.cpu.pending.external_interrupts.len(), 1);

    // The following instruction executes with the interrupt still queued.
    cpu.step();
    assert_eq!(cpu.cpu.state.rip(), code_base + 3);
    assert_eq!(cpu.cpu.pending.external_interrupts.len(), 1);

    // Shadow aged out; delivery proceeds.
    assert!(cpu.maybe_deliver_interrupt());
    assert_eq!(cpu.cpu.pending.external_interrupts.len(), 0);
    assert_eq!(cpu.cpu.state.rip(), u64::from(handler_off));
    assert_eq!(cpu.cpu.state.read_reg(Register::SP), 0x7FFA);
}

#[test]
fn int_iretq_cpl3_to_cpl0_stack_switch() {
    let mut bus = FlatTestBus::new(0x40000);

    let code_base = 0x1000u64;
    let handler1 = 0x3000u64;
    let handler2 = 0x3100u64;
    let idt_base = 0x2000u64;

    // Code (CPL3): int 0x80; int 0x81
    bus.load(code_base, &[0xCD, 0x80, 0xCD, 0x81]);

    // Handler 1 (CPL0): mov rax, 0x1234; iretq
    bus.load(
        handler1,
        &[
            0x48, 0xB8, 0x34, 0x12, 0, 0, 0, 0, 0, 0, // mov rax, 0x1234
            0x48, 0xCF, // iretq
        ],
    );
    // Handler 2 (CPL0): mov ebx, 0x5678; hlt
    bus.load(handler2, &[0xBB, 0x78, 0x56, 0x00, 0x00, 0xF4]);

    write_idt_gate64(&mut bus, idt_base, 0x80, 0x08, handler1, 0, 0xEE);
    write_idt_gate64(&mut bus, idt_base, 0x81, 0x08, handler2, 0, 0xEE);

    // GDT: null, code64 CPL0 at 0x08, user code64 at 0x33, user data at 0x2B.
    let gdt_base = 0x4000u64;
    let code64 = make_descriptor(0, 0xFFFFF, 0xA, true, 0, true, false, true, false, true);
    let user_code64 = make_descriptor(0, 0xFFFFF, 0xA, true, 3, true, false, true, false, true);
    let user_data = make_descriptor(0, 0xFFFFF, 0x2, true, 3, true, false, false, true, true);
    setup_gdt(&mut bus, gdt_base, &[0, code64, 0, 0, 0, user_data, user_code64]);

    let mut cpu = Vcpu::new_with_mode(CpuMode::Long, bus);
    cpu.cpu.state.tables.gdtr.base = gdt_base;
    cpu.cpu.state.tables.gdtr.limit = 8 * 8 - 1;
    cpu.cpu.state.tables.idtr.base = idt_base;
    cpu.cpu.state.tables.idtr.limit = 0x0FFF;
    cpu.cpu.state.segments.cs.selector = 0x33; // CPL3
    cpu.cpu.state.segments.ss.selector = 0x2B;
    cpu.cpu.state.segments.cs.base = 0;
    cpu.cpu.state.segments.ss.base = 0;
    cpu.cpu.state.write_gpr64(gpr::RSP, 0x7000);
    cpu.cpu.state.set_rflags(0x202);
    cpu.cpu.state.set_rip(code_base);

    let tss_base = 0x10000u64;
    cpu.cpu.state.tables.tr.selector = 0x40;
    cpu.cpu.state.tables.tr.base = tss_base;
    cpu.cpu.state.tables.tr.limit = 0x67;
    cpu.cpu.state.tables.tr.access = SEG_ACCESS_PRESENT | 0x9;
    cpu.bus.write_u64(tss_base + 4, 0x9000).unwrap(); // RSP0

    let mut interp = Interpreter::new(64);
    run_to_halt(&mut cpu, &mut interp, 32);

    assert!(cpu.cpu.state.halted);
    assert_eq!(cpu.cpu.state.read_reg(Register::RAX), 0x1234);
    assert_eq!(cpu.cpu.state.read_reg(Register::EBX), 0x5678);

    // The second interrupt captured the restored CPL3 RSP/SS, proving the
    // first IRETQ returned correctly.
    let frame_base = cpu.cpu.state.read_gpr64(gpr::RSP);
    assert_eq!(frame_base, 0x9000 - 40);
    assert_eq!(cpu.cpu.state.segments.cs.selector, 0x08);
    assert_eq!(cpu.cpu.state.segments.ss.selector & !0b11, 0);
    assert_ne!(cpu.bus.read_u64(frame_base + 16).unwrap() & RFLAGS_IF, 0);
    assert_eq!(cpu.bus.read_u64(frame_base + 24).unwrap(), 0x7000); // old RSP
    assert_eq!(cpu.bus.read_u64(frame_base + 32).unwrap(), 0x2B); // old SS
}

#[test]
fn cli_in_user_mode_delivers_gp_through_tss_stack_switch() {
    let mut bus = FlatTestBus::new(0x20000);

    let idt_base = 0x1000u64;
    let handler = 0x2000u32;
    let tss_base = 0x3000u64;
    let gdt_base = 0x4000u64;

    // Code (CPL3): cli; hlt (the HLT must never run).
    bus.load(0, &[0xFA, 0xF4]);
    // #GP handler (CPL0): hlt.
    bus.load(handler as u64, &[0xF4]);
    write_idt_gate32(&mut bus, idt_base, 13, 0x08, handler, 0x8E);

    let code32 = make_descriptor(0, 0xFFFFF, 0xA, true, 0, true, false, false, true, true);
    let data32 = make_descriptor(0, 0xFFFFF, 0x2, true, 0, true, false, false, true, true);
    let user_code = make_descriptor(0, 0xFFFFF, 0xA, true, 3, true, false, false, true, true);
    let user_data = make_descriptor(0, 0xFFFFF, 0x2, true, 3, true, false, false, true, true);
    setup_gdt(&mut bus, gdt_base, &[0, code32, data32, user_code, user_data]);

    let mut cpu = Vcpu::new_with_mode(CpuMode::Protected, bus);
    cpu.cpu.state.tables.gdtr.base = gdt_base;
    cpu.cpu.state.tables.gdtr.limit = 5 * 8 - 1;
    cpu.cpu.state.tables.idtr.base = idt_base;
    cpu.cpu.state.tables.idtr.limit = 0x7FF;
    cpu.cpu.state.segments.cs.selector = 0x1B; // CPL3
    cpu.cpu.state.segments.ss.selector = 0x23;
    cpu.cpu.state.write_gpr32(gpr::RSP, 0x7000);
    cpu.cpu.state.set_rflags(0x202); // IF=1, IOPL=0
    cpu.cpu.state.set_rip(0);

    // Ring-0 stack for the privilege switch.
    cpu.cpu.state.tables.tr.selector = 0x28;
    cpu.cpu.state.tables.tr.base = tss_base;
    cpu.cpu.state.tables.tr.limit = 0x67;
    cpu.cpu.state.tables.tr.access = SEG_ACCESS_PRESENT | 0x9;
    cpu.bus.write_u32(tss_base + 4, 0x9000).unwrap(); // ESP0
    cpu.bus.write_u16(tss_base + 8, 0x10).unwrap(); // SS0

    // Single-step so the fault delivery is observable before the handler
    // body runs.
    let mut interp = Interpreter::new(1);
    interp.exec_block(&mut cpu);
    assert_eq!(cpu.cpu.state.rip(), u64::from(handler));
    assert_eq!(cpu.cpu.state.segments.cs.selector, 0x08);

    run_to_halt(&mut cpu, &mut interp, 8);
    assert!(cpu.cpu.state.halted);
}

#[test]
fn real_mode_int_latches_bios_vector_for_hlt_stub() {
    let mut bus = FlatTestBus::new(0x100000);

    // Real-mode code: int 0x10.
    let code_base = 0x0100u64;
    bus.load(code_base, &[0xCD, 0x10]);

    // IVT entry points into a ROM stub that begins with HLT; IRET.
    let vector = 0x10u8;
    let stub_seg = 0xF000u16;
    bus.write_u16(u64::from(vector) * 4, 0).unwrap();
    bus.write_u16(u64::from(vector) * 4 + 2, stub_seg).unwrap();
    let stub_phys = u64::from(stub_seg) << 4;
    bus.load(stub_phys, &[0xF4, 0xCF]);

    let mut cpu = Vcpu::new_with_mode(CpuMode::Real, bus);
    cpu.cpu.state.write_reg(Register::SP, 0x8000);
    cpu.cpu.state.set_rflags(0x0002);
    cpu.cpu.state.set_rip(code_base);

    // INT 0x10 branches into the stub and latches the vector.
    assert_eq!(cpu.step(), machina_cpu_core::StepExit::Normal);
    assert_eq!(cpu.cpu.state.segments.cs.selector, stub_seg);
    assert_eq!(cpu.cpu.state.rip(), 0);
    assert!(cpu.cpu.state.pending_bios_int_valid);
    assert_eq!(cpu.cpu.state.pending_bios_int, vector);

    // The stub's HLT surfaces as a BIOS-service exit, not a halt.
    assert_eq!(cpu.step(), machina_cpu_core::StepExit::BiosInterrupt(vector));
    assert!(!cpu.cpu.state.halted);
    assert_eq!(cpu.cpu.state.rip(), 1);
    assert!(cpu.cpu.state.pending_bios_int_valid);
}
