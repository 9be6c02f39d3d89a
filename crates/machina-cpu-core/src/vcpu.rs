//! The virtual CPU: couples architectural state with a bus, drains pending
//! events at instruction boundaries, and applies the double-fault and
//! triple-fault escalation rules.

use std::collections::VecDeque;

use crate::interp::{self, StepExit};
use crate::interrupts::{self, Event};
use crate::mem::CpuBus;
use crate::state::{CpuMode, CpuState, RFLAGS_IF};
use crate::Exception;

/// Events queued for delivery at the next instruction boundary.
#[derive(Clone, Debug, Default)]
pub struct PendingEvents {
    pub external_interrupts: VecDeque<u8>,
}

impl PendingEvents {
    pub fn inject_external_interrupt(&mut self, vector: u8) {
        self.external_interrupts.push_back(vector);
    }

    pub fn clear(&mut self) {
        self.external_interrupts.clear();
    }
}

#[derive(Clone, Debug, Default)]
pub struct Cpu {
    pub state: CpuState,
    pub pending: PendingEvents,
}

/// Terminal CPU conditions that end execution entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuExit {
    TripleFault,
}

pub struct Vcpu<B: CpuBus> {
    pub cpu: Cpu,
    pub bus: B,
    pub exit: Option<CpuExit>,
    /// Most recent fault routed through the delivery path; embedder debug
    /// hooks read and clear this.
    pub last_fault: Option<Exception>,
}

impl<B: CpuBus> Vcpu<B> {
    pub fn new_with_mode(mode: CpuMode, bus: B) -> Self {
        Self {
            cpu: Cpu { state: CpuState::new(mode), pending: PendingEvents::default() },
            bus,
            exit: None,
            last_fault: None,
        }
    }

    /// Executes one instruction, delivering any fault it raises. Returns the
    /// step outcome; a triple fault parks the CPU and sets [`Vcpu::exit`].
    pub fn step(&mut self) -> StepExit {
        if self.exit.is_some() || self.cpu.state.halted {
            return StepExit::Halted;
        }
        let shadow_was = self.cpu.state.interrupt_shadow;
        let result = interp::step(&mut self.cpu.state, &mut self.bus);

        // One boundary consumes one shadow count, but only for shadows that
        // were armed before this instruction (so the arming instruction
        // itself still protects its successor).
        if shadow_was > 0 && self.cpu.state.interrupt_shadow == shadow_was {
            self.cpu.state.interrupt_shadow -= 1;
        } else if self.cpu.state.interrupt_shadow > shadow_was {
            self.cpu.state.interrupt_shadow -= 1;
        }

        match result {
            Ok(exit) => exit,
            Err(fault) => {
                self.raise(fault);
                StepExit::Normal
            }
        }
    }

    /// Delivers a fault raised by the current instruction, escalating to
    /// #DF and then to a triple fault if delivery itself keeps faulting.
    pub fn raise(&mut self, fault: Exception) {
        self.last_fault = Some(fault);
        let rip = self.cpu.state.rip();
        let event = Event::Fault(fault.error_code());
        match interrupts::deliver(&mut self.cpu.state, &mut self.bus, fault.vector(), event, rip) {
            Ok(()) => {}
            Err(second) => {
                let escalates = (fault.is_contributory() || fault.is_page_fault())
                    && (second.is_contributory() || second.is_page_fault());
                if !escalates {
                    // A benign nested fault is delivered in its own right.
                    return self.raise_double_checked(second);
                }
                let df = Exception::DoubleFault;
                match interrupts::deliver(
                    &mut self.cpu.state,
                    &mut self.bus,
                    df.vector(),
                    Event::Fault(df.error_code()),
                    rip,
                ) {
                    Ok(()) => {}
                    Err(_) => {
                        self.exit = Some(CpuExit::TripleFault);
                        self.cpu.state.halted = true;
                    }
                }
            }
        }
    }

    fn raise_double_checked(&mut self, fault: Exception) {
        let rip = self.cpu.state.rip();
        let event = Event::Fault(fault.error_code());
        if interrupts::deliver(&mut self.cpu.state, &mut self.bus, fault.vector(), event, rip)
            .is_err()
        {
            self.exit = Some(CpuExit::TripleFault);
            self.cpu.state.halted = true;
        }
    }

    /// True when IF is set and no delivery inhibition is active.
    pub fn can_take_interrupt(&self) -> bool {
        self.exit.is_none()
            && self.cpu.state.interrupt_shadow == 0
            && self.cpu.state.rflags() & RFLAGS_IF != 0
    }

    /// Pops and delivers the highest-priority pending external interrupt.
    /// Returns true when a vector was dispatched; a halted CPU wakes.
    pub fn maybe_deliver_interrupt(&mut self) -> bool {
        if !self.can_take_interrupt() {
            return false;
        }
        let Some(vector) = self.cpu.pending.external_interrupts.pop_front() else {
            return false;
        };
        self.cpu.state.halted = false;
        let rip = self.cpu.state.rip();
        if let Err(fault) =
            interrupts::deliver(&mut self.cpu.state, &mut self.bus, vector, Event::External, rip)
        {
            self.raise(fault);
        }
        true
    }
}

/// Convenience block runner used by tests and simple embedders: executes up
/// to `block_size` instructions, delivering pending interrupts at each
/// boundary, and stops early on halt, BIOS service exits or CPU exits.
pub struct Interpreter {
    block_size: u64,
}

impl Interpreter {
    pub fn new(block_size: u64) -> Self {
        Self { block_size: block_size.max(1) }
    }

    pub fn exec_block<B: CpuBus>(&mut self, vcpu: &mut Vcpu<B>) -> u64 {
        let mut executed = 0;
        while executed < self.block_size {
            vcpu.maybe_deliver_interrupt();
            if vcpu.exit.is_some() || vcpu.cpu.state.halted {
                break;
            }
            match vcpu.step() {
                StepExit::Normal => executed += 1,
                StepExit::Halted => {
                    executed += 1;
                    // A pending unmasked interrupt wakes the CPU right away.
                    vcpu.maybe_deliver_interrupt();
                    break;
                }
                StepExit::BiosInterrupt(_) => {
                    executed += 1;
                    break;
                }
            }
        }
        executed
    }
}
