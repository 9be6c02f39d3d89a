//! Run-loop control: instruction budgets, debug stops, and restartability.

use machina_machine::{DebugConfig, Machine, MachineConfig, RunExit};

/// An endless `inc ax; jmp $-1` loop.
fn spin_sector() -> Vec<u8> {
    let mut image = vec![0u8; 512];
    image[0] = 0x40; // inc ax
    image[1] = 0xEB; // jmp -3
    image[2] = 0xFD;
    image[510] = 0x55;
    image[511] = 0xAA;
    image
}

#[test]
fn max_instructions_reports_budget_exhausted() {
    let mut m = Machine::new(MachineConfig {
        max_instructions: Some(100),
        ..MachineConfig::with_memory(2 * 1024 * 1024)
    })
    .unwrap();
    m.set_disk_image(spin_sector()).unwrap();
    m.reset();

    match m.run_slice(10_000) {
        RunExit::BudgetExhausted { executed } => assert_eq!(executed, 100),
        other => panic!("unexpected exit: {other:?}"),
    }

    // The budget is a hard ceiling; further slices make no progress.
    assert!(matches!(
        m.run_slice(10),
        RunExit::BudgetExhausted { executed: 100 }
    ));
}

#[test]
fn slice_budget_returns_completed_and_is_restartable() {
    let mut m = Machine::new(MachineConfig::with_memory(2 * 1024 * 1024)).unwrap();
    m.set_disk_image(spin_sector()).unwrap();
    m.reset();

    assert!(matches!(
        m.run_slice(50),
        RunExit::Completed { executed: 50 }
    ));
    let ax_after_50 = m.cpu().read_gpr64(0) & 0xFFFF;

    assert!(matches!(
        m.run_slice(50),
        RunExit::Completed { executed: 50 }
    ));
    let ax_after_100 = m.cpu().read_gpr64(0) & 0xFFFF;
    assert!(ax_after_100 > ax_after_50, "state advances across slices");
}

#[test]
fn stop_ip_halts_before_the_marked_instruction() {
    let mut image = vec![0u8; 512];
    // nop; nop; hlt
    image[0] = 0x90;
    image[1] = 0x90;
    image[2] = 0xF4;
    image[510] = 0x55;
    image[511] = 0xAA;

    let mut debug = DebugConfig::default();
    debug.stop_ip.insert(0x7C02);

    let mut m = Machine::new(MachineConfig {
        debug,
        ..MachineConfig::with_memory(2 * 1024 * 1024)
    })
    .unwrap();
    m.set_disk_image(image).unwrap();
    m.reset();

    match m.run_slice(100) {
        RunExit::DebugStop { rip } => assert_eq!(rip, 0x7C02),
        other => panic!("unexpected exit: {other:?}"),
    }
    assert!(!m.cpu().halted, "the HLT at the stop address must not run");
}

#[test]
fn zero_opcode_guard_stops_runaway_execution() {
    // No terminator: execution falls through the zeroed image; ADD [BX+SI],AL
    // decodes from 00 00 and would spin forever.
    let mut image = vec![0u8; 512];
    image[510] = 0x55;
    image[511] = 0xAA;

    let mut m = Machine::new(MachineConfig {
        debug: DebugConfig {
            zero_opcode_loop_limit: Some(16),
            ..DebugConfig::default()
        },
        ..MachineConfig::with_memory(2 * 1024 * 1024)
    })
    .unwrap();
    m.set_disk_image(image).unwrap();
    m.reset();

    assert!(matches!(m.run_slice(100_000), RunExit::DebugStop { .. }));
}

#[test]
fn invalid_configuration_is_rejected_at_construction() {
    let err = Machine::new(MachineConfig {
        memory_size: 1024,
        ..MachineConfig::default()
    });
    assert!(err.is_err());

    let err = Machine::new(MachineConfig {
        memory_size: 8 * 1024 * 1024 * 1024,
        max_memory_size: 4 * 1024 * 1024 * 1024,
        ..MachineConfig::default()
    });
    assert!(err.is_err());
}
