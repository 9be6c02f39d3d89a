//! The machina PC machine: CPU core, memory bus, legacy platform devices,
//! BIOS services and boot media wired into a single-stepping emulator with
//! host-facing display/input boundaries.

mod bus;
mod config;
mod machine;
mod screen;
mod vga;

pub use bus::{DeviceSet, IrqQueue, SystemBus};
pub use config::{
    Architecture, BootKind, DebugConfig, MachineConfig, MachineError, WatchAccess,
};
pub use machine::{HaltReason, Machine, RunExit};
pub use screen::{modifiers, InputEvent, InputSource, NullInput, NullScreen, Rgb, ScreenWriter};
pub use vga::{LfbSurface, SharedScreen, VgaTextObserver, LFB_BASE, VGA_TEXT_BASE};
