//! The machine façade: wires CPU, memory, devices, firmware and boot media
//! together and drives execution one instruction at a time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use machina_bios::firmware::{BlockDevice, DiskError as BiosDiskError, Keyboard, Memory};
use machina_bios::{Bios, BiosConfig, ElToritoStatus, RealModeCpu};
use machina_cpu_core::state::{CpuMode, CpuState, RFLAGS_CF, RFLAGS_ZF};
use machina_cpu_core::{PagingBus, StepExit, Vcpu};
use machina_mem::PhysicalMemory;
use machina_storage::{IsoImage, MediaType, MemDisk, VirtualDisk};

use crate::bus::{DeviceSet, SystemBus};
use crate::config::{BootKind, MachineConfig, MachineError};
use crate::screen::{InputEvent, InputSource, NullInput, NullScreen, ScreenWriter};
use crate::vga::{LfbSurface, SharedScreen, VbeDevice, VbeState, VgaTextObserver, LFB_BASE};

const BOOT_SECTOR_LOAD: u64 = 0x7C00;
const BIOS_STUB_SEGMENT: u16 = 0xF000;
const BDA_TICK_COUNT: u32 = 0x046C;
const MAX_LFB_PIXELS: usize = 1024 * 768;

/// Why `run_slice` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The slice budget was consumed; call again to continue.
    Completed { executed: u64 },
    Halted { reason: HaltReason },
    /// The configured `max_instructions` total was reached.
    BudgetExhausted { executed: u64 },
    /// A debug stop condition (stop IP, RSP floor, zero-opcode guard) hit.
    DebugStop { rip: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// HLT with no deliverable interrupt: the guest is idle.
    Wait,
    /// Triple fault; the CPU will not run again until reset.
    Triple,
}

pub struct Machine {
    config: MachineConfig,
    vcpu: Vcpu<PagingBus<SystemBus>>,
    bios: Bios,
    /// BIOS keystroke queue: `scancode << 8 | ascii` words for INT 16h.
    bios_keys: VecDeque<u16>,
    shift_down: bool,
    boot_disk: Option<Box<dyn VirtualDisk>>,
    iso: Option<IsoImage<Box<dyn VirtualDisk>>>,
    boot_drive: u8,
    screen: SharedScreen,
    input: Box<dyn InputSource>,
    vbe_state: Arc<Mutex<VbeState>>,
    executed: u64,
    tty_output: Vec<u8>,
    zero_opcode_run: u32,
    quit_requested: bool,
    last_bios_a20: bool,
    last_cr8: u8,
    rip_mirror: Arc<AtomicU64>,
    has_watch: bool,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Machine, MachineError> {
        config.validate()?;

        let ram = Arc::new(PhysicalMemory::new(config.memory_size)?);
        let mut mem = machina_mem::MemoryBus::new(ram);

        let screen: SharedScreen = Arc::new(Mutex::new(Box::new(NullScreen::default())));
        let vbe_state = Arc::new(Mutex::new(VbeState::default()));
        let lfb = Arc::new(LfbSurface::new(screen.clone(), MAX_LFB_PIXELS));
        mem.register_mmio(LFB_BASE..LFB_BASE + (MAX_LFB_PIXELS as u64) * 4, lfb.clone())?;
        mem.add_observer(Box::new(VgaTextObserver::new(screen.clone())));

        let rip_mirror = Arc::new(AtomicU64::new(0));
        let has_watch = config.debug.watch_access.is_some();
        if let Some(watch) = config.debug.watch_access.clone() {
            mem.add_observer(Box::new(WatchObserver {
                watch,
                hits: 0,
                rip: rip_mirror.clone(),
            }));
        }

        let devices = DeviceSet::new(config.enable_apic);
        let bus = SystemBus::new(mem, devices);
        let vcpu = Vcpu::new_with_mode(CpuMode::Real, PagingBus::new(bus));

        let boot_drive = match config.boot {
            BootKind::BootSignature => 0x80,
            BootKind::Iso => 0xE0,
        };
        let mut bios = Bios::new(BiosConfig {
            memory_size: config.memory_size,
            boot_drive,
        });
        bios.set_vbe_handler(Box::new(VbeDevice::new(
            vbe_state.clone(),
            lfb,
            screen.clone(),
        )));

        Ok(Machine {
            config,
            vcpu,
            bios,
            bios_keys: VecDeque::new(),
            shift_down: false,
            boot_disk: None,
            iso: None,
            boot_drive,
            screen,
            input: Box::new(NullInput),
            vbe_state,
            executed: 0,
            tty_output: Vec::new(),
            zero_opcode_run: 0,
            quit_requested: false,
            last_bios_a20: true,
            last_cr8: 0,
            rip_mirror,
            has_watch,
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    // ----- Wiring -----------------------------------------------------------

    pub fn set_screen(&mut self, screen: Box<dyn ScreenWriter>) {
        *self.screen.lock().unwrap() = screen;
    }

    pub fn set_input(&mut self, input: Box<dyn InputSource>) {
        self.input = input;
    }

    pub fn set_disk_image(&mut self, bytes: Vec<u8>) -> Result<(), MachineError> {
        self.boot_disk = Some(Box::new(MemDisk::new(bytes)));
        Ok(())
    }

    pub fn attach_disk(&mut self, disk: Box<dyn VirtualDisk>) {
        self.boot_disk = Some(disk);
    }

    pub fn attach_iso_bytes(&mut self, bytes: Vec<u8>) -> Result<(), MachineError> {
        let disk: Box<dyn VirtualDisk> = Box::new(MemDisk::read_only(bytes));
        self.iso = Some(IsoImage::open(disk)?);
        Ok(())
    }

    pub fn attach_iso(&mut self, disk: Box<dyn VirtualDisk>) -> Result<(), MachineError> {
        self.iso = Some(IsoImage::open(disk)?);
        Ok(())
    }

    pub fn set_boot_drive(&mut self, drive: u8) {
        self.boot_drive = drive;
    }

    pub fn vbe_mode(&self) -> Option<u16> {
        self.vbe_state.lock().unwrap().current_mode
    }

    // ----- State access -----------------------------------------------------

    pub fn cpu(&self) -> &CpuState {
        &self.vcpu.cpu.state
    }

    pub fn cpu_mut(&mut self) -> &mut CpuState {
        &mut self.vcpu.cpu.state
    }

    pub fn devices(&self) -> &DeviceSet {
        &self.vcpu.bus.inner().devices
    }

    pub fn devices_mut(&mut self) -> &mut DeviceSet {
        &mut self.vcpu.bus.inner_mut().devices
    }

    pub fn instructions_executed(&self) -> u64 {
        self.executed
    }

    pub fn read_physical_bytes(&mut self, addr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.vcpu.bus.inner_mut().mem.read_bytes(addr, &mut buf);
        buf
    }

    pub fn write_physical(&mut self, addr: u64, bytes: &[u8]) {
        self.vcpu.bus.inner_mut().mem.write_bytes(addr, bytes);
    }

    pub fn read_physical_u8(&mut self, addr: u64) -> u8 {
        self.vcpu.bus.inner_mut().mem.read_u8(addr)
    }

    pub fn read_physical_u16(&mut self, addr: u64) -> u16 {
        self.vcpu.bus.inner_mut().mem.read_u16(addr)
    }

    pub fn read_physical_u32(&mut self, addr: u64) -> u32 {
        self.vcpu.bus.inner_mut().mem.read_u32(addr)
    }

    pub fn take_serial_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.vcpu.bus.inner_mut().devices.serial_out)
    }

    /// Everything INT 10h teletype has printed since reset.
    pub fn bios_tty_output(&self) -> &[u8] {
        &self.tty_output
    }

    pub fn quit_requested(&self) -> bool {
        self.quit_requested
    }

    // ----- Reset / POST -----------------------------------------------------

    /// Firmware POST: seeds the BDA and IVT, loads the boot image, and
    /// leaves CS:IP at its entry with DL = boot drive.
    pub fn reset(&mut self) {
        self.vcpu.cpu.state = CpuState::new(CpuMode::Real);
        self.vcpu.cpu.pending.clear();
        self.vcpu.exit = None;
        self.vcpu.last_fault = None;
        self.tty_output.clear();
        self.zero_opcode_run = 0;

        {
            let bus = self.vcpu.bus.inner_mut();
            let mut view = BiosMemory(&mut bus.mem);
            self.bios.post(&mut view);

            // One ROM stub serves every vector: HLT surfaces the latched
            // vector to the machine, IRET resumes the guest.
            bus.mem
                .write_bytes(u64::from(BIOS_STUB_SEGMENT) << 4, &[0xF4, 0xCF]);
            for vector in 0..256u64 {
                bus.mem.write_u16(vector * 4, 0x0000);
                bus.mem.write_u16(vector * 4 + 2, BIOS_STUB_SEGMENT);
            }

            // Classic BIOS PIC remap: master IRQs at 0x08, slave at 0x70,
            // all lines unmasked.
            for (port_cmd, port_data, base, wiring) in
                [(0x20u16, 0x21u16, 0x08u8, 0x04u8), (0xA0, 0xA1, 0x70, 0x02)]
            {
                bus.devices.pic.io_write(port_cmd, 0x11);
                bus.devices.pic.io_write(port_data, base);
                bus.devices.pic.io_write(port_data, wiring);
                bus.devices.pic.io_write(port_data, 0x01);
                bus.devices.pic.io_write(port_data, 0x00);
            }
        }

        let outcome = match self.config.boot {
            BootKind::BootSignature => self.load_boot_sector(),
            BootKind::Iso => self.load_el_torito(),
        };
        if let Err(message) = outcome {
            self.print_tty(message);
            self.vcpu.cpu.state.halted = true;
        }
    }

    fn load_boot_sector(&mut self) -> Result<(), &'static str> {
        let Some(disk) = self.boot_disk.as_mut() else {
            return Err("Disk read error");
        };
        let mut sector = [0u8; 512];
        if disk.read_at(0, &mut sector).is_err() {
            return Err("Disk read error");
        }
        if sector[510] != 0x55 || sector[511] != 0xAA {
            return Err("Invalid boot signature");
        }
        self.write_physical(BOOT_SECTOR_LOAD, &sector);

        let state = &mut self.vcpu.cpu.state;
        state.segments.cs.load_real_mode(0);
        state.set_rip(BOOT_SECTOR_LOAD);
        state.segments.ss.load_real_mode(0);
        state.write_gpr16(4, BOOT_SECTOR_LOAD as u16); // SP below the image
        state.write_gpr8(2, false, self.boot_drive); // DL
        state.set_rflags(0x202); // IF=1 at the firmware handoff
        Ok(())
    }

    fn load_el_torito(&mut self) -> Result<(), &'static str> {
        let Some(iso) = self.iso.as_mut() else {
            return Err("Disk read error");
        };
        let image = iso.boot_image().map_err(|_| "Disk read error")?;
        let entry = *iso.default_entry();
        let boot_catalog_lba = iso.boot_catalog_lba();

        let load_address = image.load_address;
        let load_segment = image.load_segment;
        self.write_physical(load_address, &image.data);

        self.bios.set_eltorito_status(ElToritoStatus {
            drive: self.boot_drive,
            media_type: match image.media_type {
                MediaType::NoEmulation => 0,
                MediaType::Floppy12M => 1,
                MediaType::Floppy144M => 2,
                MediaType::Floppy288M => 3,
                MediaType::HardDisk => 4,
            },
            boot_image_lba: entry.load_rba,
            boot_catalog_lba,
            load_segment,
            sector_count: entry.sector_count,
        });

        let state = &mut self.vcpu.cpu.state;
        state.segments.cs.load_real_mode(load_segment);
        state.set_rip(0);
        state.segments.ss.load_real_mode(0);
        state.write_gpr16(4, 0x7000);
        state.write_gpr8(2, false, self.boot_drive);
        state.set_rflags(0x202);
        Ok(())
    }

    fn print_tty(&mut self, message: &str) {
        self.tty_output.extend_from_slice(message.as_bytes());
        if let Ok(mut screen) = self.screen.lock() {
            screen.write(message);
            screen.newline();
            screen.flush_if_needed();
        }
    }

    // ----- Input ------------------------------------------------------------

    pub fn inject_key(&mut self, scancode: u8) {
        self.handle_input_event(InputEvent::KeyDown { scancode, modifiers: 0 });
        self.handle_input_event(InputEvent::KeyUp { scancode });
    }

    pub fn inject_event(&mut self, event: InputEvent) {
        self.handle_input_event(event);
    }

    fn pump_input(&mut self) {
        while let Some(event) = self.input.poll_event() {
            self.handle_input_event(event);
        }
    }

    fn handle_input_event(&mut self, event: InputEvent) {
        match event {
            InputEvent::KeyDown { scancode, modifiers: _ } => {
                // Shift state is tracked from the scancode stream itself when
                // the controller drain runs; the modifier bits are advisory
                // for sinks. The BIOS key queue is fed from the drain (IRQ 1
                // or an INT 16h poll), never here, so bytes are not seen
                // twice.
                self.devices_mut().kbc.inject_scancode(scancode);
            }
            InputEvent::KeyUp { scancode } => {
                self.devices_mut().kbc.inject_scancode(scancode | 0x80);
            }
            InputEvent::MouseMove { .. } | InputEvent::MouseButton { .. } => {
                // No pointing device is modeled; events are consumed so the
                // host queue cannot back up.
            }
            InputEvent::Quit => self.quit_requested = true,
        }
    }

    // ----- IRQ routing ------------------------------------------------------

    fn apic_active(&self) -> bool {
        let devices = self.devices();
        devices.apic_enabled && devices.lapic.software_enabled()
    }

    fn route_irq(&mut self, irq: u8) {
        if self.apic_active() {
            // ISA IRQ0 rides I/O APIC pin 2 on PC chipsets.
            let pin = if irq == 0 { 2 } else { irq };
            let devices = self.devices_mut();
            if let Some(vector) = devices.ioapic.redirect(pin) {
                devices.lapic.inject(vector);
                return;
            }
        }
        self.devices_mut().pic.raise_irq(irq);
    }

    fn tick_devices(&mut self) {
        while let Some(irq) = self.devices_mut().irq_queue.pop() {
            self.route_irq(irq);
        }
        // One PIT input cycle per executed instruction keeps timing
        // deterministic and independent of host speed.
        let fires = self.devices_mut().pit.tick(1);
        for _ in 0..fires {
            self.route_irq(0);
        }
        if self.apic_active() {
            self.devices_mut().lapic.tick(1);
        }

        // Mirror chipset-side A20 changes (KBC command, port 92h) into the
        // address gate the MMU applies.
        let a20 = self.devices().a20_enabled();
        if a20 != self.vcpu.cpu.state.a20_enabled {
            self.vcpu.cpu.state.a20_enabled = a20;
            self.bios.a20_enabled = a20;
            self.last_bios_a20 = a20;
        }

        // CR8 and the local APIC TPR are two views of the same priority
        // register; whichever side moved since the last boundary wins.
        if self.devices().apic_enabled {
            let cr8 = (self.vcpu.cpu.state.control.cr8 & 0xF) as u8;
            let tpr = self.devices().lapic.tpr_class();
            if cr8 != self.last_cr8 {
                self.devices_mut().lapic.set_tpr_class(cr8);
                self.last_cr8 = cr8;
            } else if tpr != self.last_cr8 {
                self.vcpu.cpu.state.control.cr8 = u64::from(tpr);
                self.last_cr8 = tpr;
            }
        }
    }

    fn dispatch_pending_irqs(&mut self) {
        if !self.vcpu.can_take_interrupt() {
            return;
        }
        let vector = if self.apic_active() {
            self.devices_mut().lapic.acknowledge()
        } else {
            self.devices_mut().pic.acknowledge()
        };
        if let Some(vector) = vector {
            self.vcpu.cpu.pending.inject_external_interrupt(vector);
            self.vcpu.maybe_deliver_interrupt();
        }
    }

    // ----- Execution --------------------------------------------------------

    /// Runs up to `limit` instructions, returning at halts, budget limits or
    /// debug stops. State is always consistent and restartable on return.
    pub fn run_slice(&mut self, limit: u64) -> RunExit {
        let started = Instant::now();
        let mut executed_now = 0u64;

        while executed_now < limit {
            if self.vcpu.exit.is_some() {
                return RunExit::Halted { reason: HaltReason::Triple };
            }
            if let Some(budget) = self.config.max_instructions {
                if self.executed >= budget {
                    return RunExit::BudgetExhausted { executed: self.executed };
                }
            }
            if let Some(secs) = self.config.debug.stop_after_secs {
                if started.elapsed().as_secs() >= secs {
                    return RunExit::BudgetExhausted { executed: self.executed };
                }
            }
            if let Some(max) = self.config.debug.stop_after_insns {
                if self.executed >= max {
                    return RunExit::DebugStop { rip: self.cpu().rip() };
                }
            }

            self.pump_input();
            self.tick_devices();
            self.dispatch_pending_irqs();

            if self.vcpu.cpu.state.halted {
                // HLT idles until an unmasked interrupt arrives; nothing is
                // pending, so hand control back to the host.
                return RunExit::Halted { reason: HaltReason::Wait };
            }

            if let Some(stop) = self.debug_pre_step() {
                return stop;
            }

            match self.vcpu.step() {
                StepExit::Normal => {
                    self.executed += 1;
                    executed_now += 1;
                    self.debug_post_step();
                }
                StepExit::Halted => {
                    self.executed += 1;
                    executed_now += 1;
                    // Give pending interrupts one chance to wake the CPU
                    // before reporting the halt.
                    self.tick_devices();
                    self.dispatch_pending_irqs();
                    if self.vcpu.cpu.state.halted {
                        return RunExit::Halted { reason: HaltReason::Wait };
                    }
                }
                StepExit::BiosInterrupt(vector) => {
                    self.executed += 1;
                    executed_now += 1;
                    self.service_bios_interrupt(vector);
                }
            }
        }
        RunExit::Completed { executed: executed_now }
    }

    fn debug_pre_step(&mut self) -> Option<RunExit> {
        let debug = &self.config.debug;
        let rip = self.vcpu.cpu.state.rip();
        let linear = self.vcpu.cpu.state.segments.cs.base.wrapping_add(rip);
        if self.has_watch {
            self.rip_mirror.store(linear, Ordering::Relaxed);
        }

        if debug.stop_ip.contains(&linear) || debug.stop_cflow_to.contains(&linear) {
            return Some(RunExit::DebugStop { rip: linear });
        }
        if debug.trace_ip.contains(&linear) || debug.trace_cflow_to.contains(&linear) {
            tracing::info!(rip = format_args!("{linear:#x}"), "trace point");
        }
        if let Some(floor) = debug.stop_on_rsp_below {
            if self.vcpu.cpu.state.read_gpr64(4) < floor {
                return Some(RunExit::DebugStop { rip: linear });
            }
        }
        if let Some(every) = debug.ip_sample_every {
            if every > 0 && self.executed % every == 0 {
                tracing::debug!(
                    executed = self.executed,
                    rip = format_args!("{linear:#x}"),
                    "ip sample"
                );
            }
        }
        if let Some(limit) = debug.zero_opcode_loop_limit {
            let opcode = self.vcpu.bus.inner_mut().mem.read_u8(linear);
            if opcode == 0 {
                self.zero_opcode_run += 1;
                if self.zero_opcode_run >= limit {
                    tracing::warn!(rip = format_args!("{linear:#x}"), "zero-opcode run guard");
                    return Some(RunExit::DebugStop { rip: linear });
                }
            } else {
                self.zero_opcode_run = 0;
            }
        }
        None
    }

    fn debug_post_step(&mut self) {
        if self.config.debug.dump_page_fault_context {
            if let Some(machina_cpu_core::Exception::PageFault { addr, error_code }) =
                self.vcpu.last_fault.take()
            {
                let state = &self.vcpu.cpu.state;
                tracing::warn!(
                    cr2 = format_args!("{addr:#x}"),
                    error_code,
                    rip = format_args!("{:#x}", state.rip()),
                    cr3 = format_args!("{:#x}", state.control.cr3),
                    "page fault"
                );
            }
        } else {
            self.vcpu.last_fault = None;
        }
    }

    // ----- BIOS bridge ------------------------------------------------------

    /// Services a latched BIOS interrupt at the firmware stub's HLT. The
    /// stub's IRET then resumes the guest.
    fn service_bios_interrupt(&mut self, vector: u8) {
        match vector {
            // Hardware timer: bump the BDA tick count and EOI.
            0x08 => {
                let bus = self.vcpu.bus.inner_mut();
                let ticks = bus.mem.read_u32(u64::from(BDA_TICK_COUNT));
                bus.mem
                    .write_u32(u64::from(BDA_TICK_COUNT), ticks.wrapping_add(1));
                bus.devices.pic.io_write(0x20, 0x20);
            }
            // Keyboard: drain the controller into the BIOS key queue.
            0x09 => {
                let byte = self.devices_mut().kbc.read_port(0x60);
                self.note_scancode_for_bios(byte);
                self.devices_mut().pic.io_write(0x20, 0x20);
            }
            0x0A..=0x0F => {
                self.devices_mut().pic.io_write(0x20, 0x20);
            }
            0x70..=0x77 => {
                let devices = self.devices_mut();
                devices.pic.io_write(0xA0, 0x20);
                devices.pic.io_write(0x20, 0x20);
            }
            _ => self.service_software_interrupt(vector),
        }
        self.vcpu.cpu.state.clear_pending_bios_int();
        self.sync_a20();
    }

    fn drain_kbc_into_bios_queue(&mut self) {
        while self.devices_mut().kbc.read_port(0x64) & 0x01 != 0 {
            let byte = self.devices_mut().kbc.read_port(0x60);
            self.note_scancode_for_bios(byte);
        }
    }

    fn note_scancode_for_bios(&mut self, byte: u8) {
        match byte {
            0x2A | 0x36 => self.shift_down = true,
            0xAA | 0xB6 => self.shift_down = false,
            b if b & 0x80 == 0 => {
                let ascii = scancode_to_ascii(b, self.shift_down).unwrap_or(0);
                self.bios_keys.push_back(u16::from(b) << 8 | u16::from(ascii));
            }
            _ => {}
        }
    }

    fn service_software_interrupt(&mut self, vector: u8) {
        if vector == 0x16 {
            // Guests that poll with interrupts masked still get their keys:
            // drain whatever the controller has buffered.
            self.drain_kbc_into_bios_queue();
        }
        let tty_teletype = {
            let state = &self.vcpu.cpu.state;
            vector == 0x10 && state.read_gpr8(0, true) == 0x0E
        };

        // The stub was entered through the IVT, so the caller's FLAGS image
        // sits at SS:SP+4; CF/ZF results must be patched there for IRET to
        // return them.
        let (flags_addr, stacked_flags) = {
            let state = &self.vcpu.cpu.state;
            let sp = u64::from(state.read_gpr16(4));
            let addr = state.segments.ss.base.wrapping_add((sp + 4) & 0xFFFF);
            let flags = self.vcpu.bus.inner_mut().mem.read_u16(addr);
            (addr, flags)
        };

        let mut rcpu = {
            let state = &self.vcpu.cpu.state;
            RealModeCpu {
                eax: state.read_gpr32(0),
                ebx: state.read_gpr32(3),
                ecx: state.read_gpr32(1),
                edx: state.read_gpr32(2),
                esi: state.read_gpr32(6),
                edi: state.read_gpr32(7),
                ebp: state.read_gpr32(5),
                esp: state.read_gpr32(4),
                cs: state.segments.cs.selector,
                ds: state.segments.ds.selector,
                es: state.segments.es.selector,
                ss: state.segments.ss.selector,
                eflags: u32::from(stacked_flags),
            }
        };

        if tty_teletype {
            let ch = rcpu.al();
            self.tty_output.push(ch);
        }

        {
            let drive = if vector == 0x13 { rcpu.dl() } else { self.boot_drive };
            let Machine { vcpu, bios, iso, boot_disk, bios_keys, .. } = self;
            let bus = vcpu.bus.inner_mut();
            let mut view = BiosMemory(&mut bus.mem);
            let mut kbd = QueueKeyboard { queue: bios_keys };

            let iso_disk = iso.as_mut().map(|image| image.disk_mut());
            let mut disk = DriveSelect {
                disk: if drive >= 0xE0 {
                    iso_disk.map(|d| d as &mut dyn VirtualDisk)
                } else {
                    boot_disk.as_mut().map(|d| d as &mut dyn VirtualDisk)
                },
            };

            bios.handle_interrupt(vector, &mut rcpu, &mut view, &mut disk, &mut kbd);
        }

        // Copy results back into the architectural state and the stacked
        // flags image.
        {
            let state = &mut self.vcpu.cpu.state;
            state.write_gpr32(0, rcpu.eax);
            state.write_gpr32(3, rcpu.ebx);
            state.write_gpr32(1, rcpu.ecx);
            state.write_gpr32(2, rcpu.edx);
            state.write_gpr32(6, rcpu.esi);
            state.write_gpr32(7, rcpu.edi);
            state.write_gpr32(5, rcpu.ebp);
            state.segments.ds.load_real_mode(rcpu.ds);
            state.segments.es.load_real_mode(rcpu.es);

            let mut live = state.rflags();
            live = live & !(RFLAGS_CF | RFLAGS_ZF)
                | u64::from(rcpu.eflags & 0x41); // CF | ZF
            state.set_rflags(live);
        }
        let patched = (stacked_flags & !0x0041) | (rcpu.eflags as u16 & 0x0041);
        self.vcpu.bus.inner_mut().mem.write_u16(flags_addr, patched);
    }

    fn sync_a20(&mut self) {
        // An INT 15h service that toggled the gate drives the chipset; the
        // chipset paths (KBC command, port 92h) rule otherwise.
        let bios_a20 = self.bios.a20_enabled;
        if bios_a20 != self.last_bios_a20 {
            self.last_bios_a20 = bios_a20;
            self.devices_mut().set_a20(bios_a20);
        }
        let enabled = self.devices().a20_enabled();
        self.bios.a20_enabled = enabled;
        self.last_bios_a20 = enabled;
        self.vcpu.cpu.state.a20_enabled = enabled;
    }
}

/// Write watchpoint fed by the memory bus observers; reports through
/// tracing and stops after the configured hit limit.
struct WatchObserver {
    watch: crate::config::WatchAccess,
    hits: u64,
    rip: Arc<AtomicU64>,
}

impl machina_mem::WriteObserver for WatchObserver {
    fn watches(&self, addr: u64) -> bool {
        self.watch.writes && (self.watch.start..self.watch.end).contains(&addr)
    }

    fn on_write(&mut self, addr: u64, prev: u8, next: u8) {
        if self.watch.limit != 0 && self.hits >= self.watch.limit {
            return;
        }
        let rip = self.rip.load(Ordering::Relaxed);
        if self
            .watch
            .exclude_ip_ranges
            .iter()
            .any(|&(start, end)| (start..end).contains(&rip))
        {
            return;
        }
        self.hits += 1;
        tracing::info!(
            addr = format_args!("{addr:#x}"),
            prev = format_args!("{prev:#04x}"),
            next = format_args!("{next:#04x}"),
            rip = format_args!("{rip:#x}"),
            "watchpoint write"
        );
    }
}

/// BIOS view of guest memory, routed through the system bus so VRAM
/// observers fire.
struct BiosMemory<'a>(&'a mut machina_mem::MemoryBus);

impl Memory for BiosMemory<'_> {
    fn read_u8(&self, paddr: u32) -> u8 {
        self.0.read_u8(u64::from(paddr))
    }

    fn write_u8(&mut self, paddr: u32, value: u8) {
        self.0.write_u8(u64::from(paddr), value);
    }
}

struct QueueKeyboard<'a> {
    queue: &'a mut VecDeque<u16>,
}

impl Keyboard for QueueKeyboard<'_> {
    fn pop_key(&mut self) -> Option<u16> {
        self.queue.pop_front()
    }

    fn peek_key(&mut self) -> Option<u16> {
        self.queue.front().copied()
    }
}

/// INT 13h target selected by drive number; `None` reports I/O errors.
struct DriveSelect<'a> {
    disk: Option<&'a mut dyn VirtualDisk>,
}

impl BlockDevice for DriveSelect<'_> {
    fn read_sector(&mut self, lba: u64, buf512: &mut [u8; 512]) -> Result<(), BiosDiskError> {
        let Some(disk) = self.disk.as_mut() else {
            return Err(BiosDiskError::IoError);
        };
        disk.read_at(lba * 512, buf512).map_err(map_disk_error)
    }

    fn write_sector(&mut self, lba: u64, buf512: &[u8; 512]) -> Result<(), BiosDiskError> {
        let Some(disk) = self.disk.as_mut() else {
            return Err(BiosDiskError::IoError);
        };
        disk.write_at(lba * 512, buf512).map_err(map_disk_error)
    }

    fn sector_count(&self) -> u64 {
        self.disk
            .as_ref()
            .map(|d| d.capacity_bytes() / 512)
            .unwrap_or(0)
    }
}

fn map_disk_error(err: machina_storage::DiskError) -> BiosDiskError {
    match err {
        machina_storage::DiskError::OutOfBounds { .. }
        | machina_storage::DiskError::OffsetOverflow => BiosDiskError::OutOfRange,
        machina_storage::DiskError::ReadOnly => BiosDiskError::ReadOnly,
        _ => BiosDiskError::IoError,
    }
}

/// Set-1 make-code to ASCII, with shift handling for the US layout subset
/// BIOS guests expect.
fn scancode_to_ascii(scancode: u8, shift: bool) -> Option<u8> {
    // Indexed by make code: 0x02 = '1', 0x10 = 'q', 0x1E = 'a', 0x2C = 'z'.
    const PLAIN: &[u8] =
        b"\x00\x001234567890-=\x08\tqwertyuiop[]\r\x00asdfghjkl;'`\x00\\zxcvbnm,./";
    const SHIFTED: &[u8] =
        b"\x00\x00!@#$%^&*()_+\x08\tQWERTYUIOP{}\r\x00ASDFGHJKL:\"~\x00|ZXCVBNM<>?";
    let table = if shift { SHIFTED } else { PLAIN };
    match scancode {
        0x39 => Some(b' '),
        0x01 => Some(0x1B),
        sc if usize::from(sc) < table.len() => {
            let ch = table[usize::from(sc)];
            (ch != 0).then_some(ch)
        }
        _ => None,
    }
}
