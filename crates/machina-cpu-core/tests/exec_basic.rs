use machina_cpu_core::exec::{Interpreter, Vcpu};
use machina_cpu_core::mem::{CpuBus, FlatTestBus};
use machina_cpu_core::state::{gpr, CpuMode, RFLAGS_CF, RFLAGS_ZF};
use machina_x86::Register;

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
fn mov_r64_imm64_with_rex_w() {
    let mut bus = FlatTestBus::new(0x1000);
    // mov rax, 0x8877665544332211; hlt
    bus.load(
        0,
        &[0x48, 0xB8, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0xF4],
    );

    let mut cpu = Vcpu::new_with_mode(CpuMode::Long, bus);
    cpu.cpu.state.set_rip(0);
    let mut interp = Interpreter::new(16);
    run_to_halt(&mut cpu, &mut interp, 4);

    assert_eq!(cpu.cpu.state.read_reg(Register::RAX), 0x8877_6655_4433_2211);
}

#[test]
fn mov_r32_imm32_zero_extends_in_long_mode() {
    let mut bus = FlatTestBus::new(0x1000);
    // Same byte tail without REX.W: mov eax, 0x44332211 (the rest of the
    // quadword becomes separate instructions, so halt right after).
    bus.load(0, &[0xB8, 0x11, 0x22, 0x33, 0x44, 0xF4]);

    let mut cpu = Vcpu::new_with_mode(CpuMode::Long, bus);
    cpu.cpu.state.write_gpr64(gpr::RAX, 0xFFFF_FFFF_FFFF_FFFF);
    cpu.cpu.state.set_rip(0);
    let mut interp = Interpreter::new(16);
    run_to_halt(&mut cpu, &mut interp, 4);

    assert_eq!(cpu.cpu.state.read_reg(Register::RAX), 0x4433_2211);
}

#[test]
fn real_mode_arithmetic_and_flags() {
    let mut bus = FlatTestBus::new(0x10000);
    // mov ax, 0xFFFF; add ax, 1; hlt
    bus.load(0x100, &[0xB8, 0xFF, 0xFF, 0x05, 0x01, 0x00, 0xF4]);

    let mut cpu = Vcpu::new_with_mode(CpuMode::Real, bus);
    cpu.cpu.state.set_rip(0x100);
    let mut interp = Interpreter::new(16);
    run_to_halt(&mut cpu, &mut interp, 4);

    assert_eq!(cpu.cpu.state.read_reg(Register::AX), 0);
    assert_ne!(cpu.cpu.state.rflags() & RFLAGS_CF, 0);
    assert_ne!(cpu.cpu.state.rflags() & RFLAGS_ZF, 0);
}

#[test]
fn real_mode_stack_push_pop() {
    let mut bus = FlatTestBus::new(0x10000);
    // mov ax, 0x1234; push ax; pop bx; hlt
    bus.load(0x100, &[0xB8, 0x34, 0x12, 0x50, 0x5B, 0xF4]);

    let mut cpu = Vcpu::new_with_mode(CpuMode::Real, bus);
    cpu.cpu.state.write_reg(Register::SP, 0x8000);
    cpu.cpu.state.set_rip(0x100);
    let mut interp = Interpreter::new(16);
    run_to_halt(&mut cpu, &mut interp, 8);

    assert_eq!(cpu.cpu.state.read_reg(Register::BX), 0x1234);
    assert_eq!(cpu.cpu.state.read_reg(Register::SP), 0x8000);
}

#[test]
fn rep_movsb_copies_forward() {
    let mut bus = FlatTestBus::new(0x10000);
    bus.load(0x2000, b"machina!");
    // cld; mov cx, 8; mov si, 0x2000; mov di, 0x3000; rep movsb; hlt
    bus.load(
        0x100,
        &[
            0xFC, 0xB9, 0x08, 0x00, 0xBE, 0x00, 0x20, 0xBF, 0x00, 0x30, 0xF3, 0xA4, 0xF4,
        ],
    );

    let mut cpu = Vcpu::new_with_mode(CpuMode::Real, bus);
    cpu.cpu.state.set_rip(0x100);
    let mut interp = Interpreter::new(64);
    run_to_halt(&mut cpu, &mut interp, 8);

    let mut copied = [0u8; 8];
    for (i, slot) in copied.iter_mut().enumerate() {
        *slot = cpu.bus.read_u8(0x3000 + i as u64).unwrap();
    }
    assert_eq!(&copied, b"machina!");
    assert_eq!(cpu.cpu.state.read_reg(Register::CX), 0);
    assert_eq!(cpu.cpu.state.read_reg(Register::SI), 0x2008);
    assert_eq!(cpu.cpu.state.read_reg(Register::DI), 0x3008);
}

#[test]
fn write_then_read_register_roundtrips_at_width() {
    let mut state = machina_cpu_core::state::CpuState::new(CpuMode::Long);
    state.write_reg(Register::RBX, 0x1122_3344_5566_7788);
    assert_eq!(state.read_reg(Register::BL), 0x88);
    assert_eq!(state.read_reg(Register::BH), 0x77);
    assert_eq!(state.read_reg(Register::BX), 0x7788);
    assert_eq!(state.read_reg(Register::EBX), 0x5566_7788);

    // 32-bit writes clear the upper half.
    state.write_reg(Register::EBX, 0x1);
    assert_eq!(state.read_reg(Register::RBX), 0x1);

    // 16-bit and 8-bit writes merge.
    state.write_reg(Register::BX, 0xAAAA);
    assert_eq!(state.read_reg(Register::RBX), 0xAAAA);
}

#[test]
fn unknown_opcode_raises_ud() {
    let mut bus = FlatTestBus::new(0x1000);
    bus.load(0, &[0x0F, 0xFF]); // no such instruction
    let mut state = machina_cpu_core::state::CpuState::new(CpuMode::Protected);
    state.set_rip(0);
    let err = machina_cpu_core::exec::step(&mut state, &mut bus).unwrap_err();
    assert_eq!(err, machina_cpu_core::Exception::InvalidOpcode);
    assert_eq!(state.rip(), 0, "faulting instruction must not advance RIP");
}

#[test]
fn lock_prefix_on_non_lockable_opcode_is_ud() {
    let mut bus = FlatTestBus::new(0x1000);
    bus.load(0, &[0xF0, 0x90]); // lock nop
    let mut state = machina_cpu_core::state::CpuState::new(CpuMode::Protected);
    state.set_rip(0);
    let err = machina_cpu_core::exec::step(&mut state, &mut bus).unwrap_err();
    assert_eq!(err, machina_cpu_core::Exception::InvalidOpcode);
}

#[test]
fn operand_size_prefix_flips_in_both_directions() {
    // 16-bit default: 0x66 selects 32-bit operands.
    let mut bus = FlatTestBus::new(0x10000);
    bus.load(0x100, &[0x66, 0xB8, 0x78, 0x56, 0x34, 0x12, 0xF4]); // mov eax, imm32
    let mut cpu = Vcpu::new_with_mode(CpuMode::Real, bus);
    cpu.cpu.state.set_rip(0x100);
    let mut interp = Interpreter::new(8);
    run_to_halt(&mut cpu, &mut interp, 4);
    assert_eq!(cpu.cpu.state.read_reg(Register::EAX), 0x1234_5678);

    // 32-bit default: 0x66 selects 16-bit operands.
    let mut bus = FlatTestBus::new(0x10000);
    bus.load(0, &[0x66, 0xB8, 0xCD, 0xAB, 0xF4]); // mov ax, imm16
    let mut cpu = Vcpu::new_with_mode(CpuMode::Protected, bus);
    cpu.cpu.state.write_reg(Register::EAX, 0xFFFF_FFFF);
    cpu.cpu.state.set_rip(0);
    let mut interp = Interpreter::new(8);
    run_to_halt(&mut cpu, &mut interp, 4);
    assert_eq!(cpu.cpu.state.read_reg(Register::EAX), 0xFFFF_ABCD);
}

#[test]
fn xchg_and_test_update_state() {
    let mut bus = FlatTestBus::new(0x10000);
    // mov ax, 1; mov bx, 2; xchg ax, bx; test ax, ax; hlt
    bus.load(
        0x100,
        &[0xB8, 0x01, 0x00, 0xBB, 0x02, 0x00, 0x93, 0x85, 0xC0, 0xF4],
    );
    let mut cpu = Vcpu::new_with_mode(CpuMode::Real, bus);
    cpu.cpu.state.set_rip(0x100);
    let mut interp = Interpreter::new(16);
    run_to_halt(&mut cpu, &mut interp, 4);

    assert_eq!(cpu.cpu.state.read_reg(Register::AX), 2);
    assert_eq!(cpu.cpu.state.read_reg(Register::BX), 1);
    assert_eq!(cpu.cpu.state.rflags() & RFLAGS_ZF, 0);
}
