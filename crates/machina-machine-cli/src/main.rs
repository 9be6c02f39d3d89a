//! Headless machine runner: boots an image, executes with an instruction
//! budget, and prints whatever the guest wrote to the BIOS console and COM1.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use machina_machine::{
    BootKind, DebugConfig, HaltReason, Machine, MachineConfig, RunExit,
};
use machina_storage::FileDisk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BootArg {
    /// Raw boot sector (0x55AA signature).
    Sector,
    /// ISO 9660 / El Torito CD image.
    Iso,
    /// Pick from the file extension.
    Auto,
}

#[derive(Debug, Parser)]
#[command(name = "machina", about = "Boot a PC image in the machina emulator")]
struct Args {
    /// Boot medium: a raw boot-sector/disk image or an ISO.
    image: PathBuf,

    /// How to interpret the boot medium.
    #[arg(long, value_enum, default_value_t = BootArg::Auto)]
    boot: BootArg,

    /// Guest RAM size in MiB.
    #[arg(long, default_value_t = 64)]
    memory_mib: u64,

    /// Stop after this many executed instructions.
    #[arg(long)]
    max_instructions: Option<u64>,

    /// Stop after roughly this many wall-clock seconds.
    #[arg(long)]
    stop_after_secs: Option<u64>,

    /// Enable the local APIC / I/O APIC instead of the PIC pair alone.
    #[arg(long)]
    enable_apic: bool,

    /// Log every execution of the given linear address (hex, repeatable).
    #[arg(long = "trace-ip", value_parser = parse_hex)]
    trace_ip: Vec<u64>,

    /// Stop when execution reaches the given linear address (hex,
    /// repeatable).
    #[arg(long = "stop-ip", value_parser = parse_hex)]
    stop_ip: Vec<u64>,

    /// Instructions per run-loop slice.
    #[arg(long, default_value_t = 100_000)]
    slice: u64,
}

fn parse_hex(s: &str) -> Result<u64, String> {
    let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(trimmed, 16).map_err(|e| format!("bad hex address {s:?}: {e}"))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let boot = match args.boot {
        BootArg::Sector => BootKind::BootSignature,
        BootArg::Iso => BootKind::Iso,
        BootArg::Auto => {
            let is_iso = args
                .image
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("iso"))
                .unwrap_or(false);
            if is_iso {
                BootKind::Iso
            } else {
                BootKind::BootSignature
            }
        }
    };

    let mut debug = DebugConfig {
        stop_after_secs: args.stop_after_secs,
        ..DebugConfig::default()
    };
    debug.trace_ip.extend(args.trace_ip.iter().copied());
    debug.stop_ip.extend(args.stop_ip.iter().copied());

    let config = MachineConfig {
        memory_size: args.memory_mib * 1024 * 1024,
        boot,
        max_instructions: args.max_instructions,
        enable_apic: args.enable_apic,
        debug,
        ..MachineConfig::default()
    };

    let mut machine = Machine::new(config).context("building the machine")?;

    let disk = FileDisk::open(&args.image)
        .with_context(|| format!("opening {}", args.image.display()))?;
    match boot {
        BootKind::Iso => machine
            .attach_iso(Box::new(disk))
            .context("parsing the ISO boot catalog")?,
        BootKind::BootSignature => machine.attach_disk(Box::new(disk)),
    }

    machine.reset();

    let outcome = loop {
        match machine.run_slice(args.slice) {
            RunExit::Completed { .. } => continue,
            other => break other,
        }
    };

    match outcome {
        RunExit::Halted { reason: HaltReason::Wait } => {
            tracing::info!("guest halted waiting for interrupts")
        }
        RunExit::Halted { reason: HaltReason::Triple } => {
            tracing::warn!("guest triple-faulted")
        }
        RunExit::BudgetExhausted { executed } => {
            tracing::info!(executed, "instruction budget exhausted")
        }
        RunExit::DebugStop { rip } => {
            tracing::info!(rip = format_args!("{rip:#x}"), "debug stop")
        }
        RunExit::Completed { .. } => unreachable!("completed slices loop above"),
    }

    let tty = machine.bios_tty_output().to_vec();
    if !tty.is_empty() {
        println!("--- BIOS console ---");
        println!("{}", String::from_utf8_lossy(&tty));
    }
    let serial = machine.take_serial_output();
    if !serial.is_empty() {
        println!("--- COM1 ---");
        println!("{}", String::from_utf8_lossy(&serial));
    }

    if machine.cpu().halted && tty.is_empty() && serial.is_empty() {
        bail!("guest halted without producing output");
    }
    Ok(())
}
