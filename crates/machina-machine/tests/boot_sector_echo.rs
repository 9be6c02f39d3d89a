//! Real-mode boot-sector echo: the guest polls INT 16h and teletypes each
//! key through INT 10h; keystrokes fed through the input boundary must come
//! back out through the screen sink in order.

use std::sync::{Arc, Mutex};

use machina_machine::{
    HaltReason, InputEvent, Machine, MachineConfig, Rgb, RunExit, ScreenWriter,
};
use pretty_assertions::assert_eq;

#[derive(Debug, Default)]
struct Recording {
    chars: Vec<(u32, u32, char, u8)>,
    text: String,
}

#[derive(Default)]
struct RecordingScreen {
    cursor: (u32, u32),
    log: Arc<Mutex<Recording>>,
}

impl ScreenWriter for RecordingScreen {
    fn write(&mut self, text: &str) {
        self.log.lock().unwrap().text.push_str(text);
    }

    fn newline(&mut self) {
        self.log.lock().unwrap().text.push('\n');
    }

    fn dot(&mut self, _x: u32, _y: u32, _color: Rgb) {}

    fn set_cursor(&mut self, row: u32, col: u32) {
        self.cursor = (row, col);
    }

    fn get_cursor(&mut self) -> (u32, u32) {
        self.cursor
    }

    fn write_char_at_cursor(&mut self, ch: char, count: u32, attribute: Option<u8>) {
        let mut log = self.log.lock().unwrap();
        for _ in 0..count {
            log.chars
                .push((self.cursor.0, self.cursor.1, ch, attribute.unwrap_or(0x07)));
        }
    }

    fn clear(&mut self) {}

    fn fill_area(&mut self, _row: u32, _col: u32, _w: u32, _h: u32, _attr: u8) {}

    fn set_attr(&mut self, _attribute: u8) {}

    fn flush_if_needed(&mut self) {}
}

/// Echo loop:
///   poll: mov ah, 0 / int 16h / jz poll
///         mov ah, 0Eh / int 10h / jmp poll
fn echo_boot_sector() -> Vec<u8> {
    let mut image = vec![0u8; 512];
    let code: [u8; 12] = [
        0xB4, 0x00, // mov ah, 0
        0xCD, 0x16, // int 16h
        0x74, 0xFA, // jz -6 (poll again)
        0xB4, 0x0E, // mov ah, 0Eh
        0xCD, 0x10, // int 10h
        0xEB, 0xF4, // jmp -12
    ];
    image[..code.len()].copy_from_slice(&code);
    image[510] = 0x55;
    image[511] = 0xAA;
    image
}

#[test]
fn keystrokes_echo_through_int16_and_int10() {
    let mut m = Machine::new(MachineConfig::with_memory(4 * 1024 * 1024)).unwrap();
    m.set_disk_image(echo_boot_sector()).unwrap();

    let log = Arc::new(Mutex::new(Recording::default()));
    m.set_screen(Box::new(RecordingScreen { cursor: (0, 0), log: log.clone() }));
    m.reset();

    assert_eq!(m.cpu().segments.cs.selector, 0);
    assert_eq!(m.cpu().rip(), 0x7C00);

    // Let the guest spin on an empty queue first.
    assert!(matches!(m.run_slice(2_000), RunExit::Completed { .. }));
    assert!(log.lock().unwrap().chars.is_empty());

    // Shift-held 'A', 'B', 'C' make/break pairs.
    for scancode in [0x1E, 0x30, 0x2E] {
        m.inject_event(InputEvent::KeyDown { scancode: 0x2A, modifiers: 0 });
        m.inject_key(scancode);
        m.inject_event(InputEvent::KeyUp { scancode: 0x2A });
        m.run_slice(5_000);
    }

    let recorded = log.lock().unwrap();
    let glyphs: Vec<(u32, u32, char)> = recorded
        .chars
        .iter()
        .map(|&(row, col, ch, _attr)| (row, col, ch))
        .collect();
    assert_eq!(glyphs, vec![(0, 0, 'A'), (0, 1, 'B'), (0, 2, 'C')]);

    drop(recorded);
    assert_eq!(m.bios_tty_output(), b"ABC");
}

#[test]
fn input_source_events_feed_the_same_path() {
    let mut m = Machine::new(MachineConfig::with_memory(4 * 1024 * 1024)).unwrap();
    m.set_disk_image(echo_boot_sector()).unwrap();

    let log = Arc::new(Mutex::new(Recording::default()));
    m.set_screen(Box::new(RecordingScreen { cursor: (0, 0), log: log.clone() }));

    let mut events = std::collections::VecDeque::new();
    events.push_back(InputEvent::KeyDown { scancode: 0x23, modifiers: 0 }); // 'h'
    events.push_back(InputEvent::KeyUp { scancode: 0x23 });
    events.push_back(InputEvent::KeyDown { scancode: 0x17, modifiers: 0 }); // 'i'
    events.push_back(InputEvent::KeyUp { scancode: 0x17 });
    m.set_input(Box::new(events));
    m.reset();

    m.run_slice(20_000);
    assert_eq!(m.bios_tty_output(), b"hi");
}

#[test]
fn missing_boot_signature_reports_and_halts() {
    let mut m = Machine::new(MachineConfig::with_memory(4 * 1024 * 1024)).unwrap();
    m.set_disk_image(vec![0u8; 512]).unwrap();
    m.reset();

    assert!(m.cpu().halted);
    assert_eq!(m.bios_tty_output(), b"Invalid boot signature");
    assert_eq!(
        m.run_slice(100),
        RunExit::Halted { reason: HaltReason::Wait }
    );
}
