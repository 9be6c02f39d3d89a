//! 8042 keyboard controller: output buffer and status at ports 0x60/0x64,
//! the A20 line on output-port bit 1, and a set-1 scancode queue that raises
//! IRQ 1 through an [`IrqSink`].

use std::collections::VecDeque;

/// Receives IRQ pulses from the controller.
pub trait IrqSink: Send {
    fn raise_irq(&mut self, irq: u8);
}

const STATUS_OUTPUT_FULL: u8 = 1 << 0;
const STATUS_SYSTEM_FLAG: u8 = 1 << 2;
const STATUS_COMMAND: u8 = 1 << 3;

const OUTPUT_PORT_RESET: u8 = 1 << 0;
const OUTPUT_PORT_A20: u8 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingWrite {
    None,
    CommandByte,
    OutputPort,
}

pub struct I8042Controller {
    output: VecDeque<u8>,
    command_byte: u8,
    output_port: u8,
    pending: PendingWrite,
    keyboard_enabled: bool,
    last_write_was_command: bool,
    irq_sink: Option<Box<dyn IrqSink>>,
    /// Set when the guest requested a CPU reset via pulse command 0xFE or
    /// the output port.
    reset_requested: bool,
}

impl std::fmt::Debug for I8042Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("I8042Controller")
            .field("buffered", &self.output.len())
            .field("a20", &self.a20_enabled())
            .finish()
    }
}

impl Default for I8042Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl I8042Controller {
    pub fn new() -> Self {
        Self {
            output: VecDeque::new(),
            // Translation + IRQ1 enabled, system flag set.
            command_byte: 0x45,
            // A20 open, reset line high.
            output_port: OUTPUT_PORT_A20 | OUTPUT_PORT_RESET,
            pending: PendingWrite::None,
            keyboard_enabled: true,
            last_write_was_command: false,
            irq_sink: None,
            reset_requested: false,
        }
    }

    pub fn set_irq_sink(&mut self, sink: Box<dyn IrqSink>) {
        self.irq_sink = Some(sink);
    }

    pub fn a20_enabled(&self) -> bool {
        self.output_port & OUTPUT_PORT_A20 != 0
    }

    pub fn set_a20(&mut self, enabled: bool) {
        if enabled {
            self.output_port |= OUTPUT_PORT_A20;
        } else {
            self.output_port &= !OUTPUT_PORT_A20;
        }
    }

    pub fn take_reset_request(&mut self) -> bool {
        std::mem::take(&mut self.reset_requested)
    }

    fn push_output(&mut self, byte: u8) {
        self.output.push_back(byte);
        if self.command_byte & 0x01 != 0 {
            if let Some(sink) = self.irq_sink.as_mut() {
                sink.raise_irq(1);
            }
        }
    }

    /// Queues a set-1 scancode byte from the host input layer.
    pub fn inject_scancode(&mut self, byte: u8) {
        if self.keyboard_enabled {
            self.push_output(byte);
        }
    }

    pub fn read_port(&mut self, port: u16) -> u8 {
        match port {
            0x60 => {
                let byte = self.output.pop_front().unwrap_or(0);
                // More buffered bytes re-assert the interrupt so the guest
                // drains one byte per IRQ 1, as on real hardware.
                if !self.output.is_empty() && self.command_byte & 0x01 != 0 {
                    if let Some(sink) = self.irq_sink.as_mut() {
                        sink.raise_irq(1);
                    }
                }
                byte
            }
            0x64 => {
                let mut status = STATUS_SYSTEM_FLAG;
                if !self.output.is_empty() {
                    status |= STATUS_OUTPUT_FULL;
                }
                if self.last_write_was_command {
                    status |= STATUS_COMMAND;
                }
                status
            }
            _ => 0xFF,
        }
    }

    pub fn write_port(&mut self, port: u16, value: u8) {
        match port {
            0x60 => self.write_data(value),
            0x64 => self.write_command(value),
            _ => {}
        }
    }

    fn write_command(&mut self, command: u8) {
        self.last_write_was_command = true;
        match command {
            0x20 => {
                let byte = self.command_byte;
                self.push_output(byte);
            }
            0x60 => self.pending = PendingWrite::CommandByte,
            0xA7 | 0xA8 => {} // aux port enable/disable (no mouse modeled)
            0xAA => self.push_output(0x55), // controller self-test
            0xAB => self.push_output(0x00), // interface test: pass
            0xAD => self.keyboard_enabled = false,
            0xAE => self.keyboard_enabled = true,
            0xD0 => {
                let byte = self.output_port;
                self.push_output(byte);
            }
            0xD1 => self.pending = PendingWrite::OutputPort,
            0xF0..=0xFF => {
                // Pulse output lines; bit 0 low means CPU reset.
                if command & 0x01 == 0 {
                    self.reset_requested = true;
                }
            }
            other => {
                tracing::trace!(command = other, "unhandled 8042 command");
            }
        }
    }

    fn write_data(&mut self, value: u8) {
        self.last_write_was_command = false;
        match self.pending {
            PendingWrite::CommandByte => {
                self.command_byte = value;
                self.pending = PendingWrite::None;
            }
            PendingWrite::OutputPort => {
                let was_high = self.output_port & OUTPUT_PORT_RESET != 0;
                self.output_port = value;
                if was_high && value & OUTPUT_PORT_RESET == 0 {
                    self.reset_requested = true;
                }
                self.pending = PendingWrite::None;
            }
            PendingWrite::None => {
                // Byte for the keyboard device itself.
                match value {
                    0xFF => {
                        self.push_output(0xFA); // ACK
                        self.push_output(0xAA); // self-test passed
                    }
                    _ => self.push_output(0xFA),
                }
            }
        }
    }

}
