//! INT 16h keyboard services over the [`Keyboard`] capability.

use crate::firmware::Keyboard;
use crate::RealModeCpu;

pub(crate) fn handle(cpu: &mut RealModeCpu, kbd: &mut dyn Keyboard) {
    match cpu.ah() {
        // Read keystroke. Blocking on real hardware; here an empty queue
        // reports ZF=1 with AX=0 and the caller's HLT loop retries, which
        // keeps the machine's run loop non-blocking.
        0x00 | 0x10 => match kbd.pop_key() {
            Some(key) => {
                cpu.set_ax(key);
                cpu.set_zf(false);
            }
            None => {
                cpu.set_ax(0);
                cpu.set_zf(true);
            }
        },
        // Peek.
        0x01 | 0x11 => match kbd.peek_key() {
            Some(key) => {
                cpu.set_ax(key);
                cpu.set_zf(false);
            }
            None => {
                cpu.set_ax(0);
                cpu.set_zf(true);
            }
        },
        // Shift flags.
        0x02 | 0x12 => {
            cpu.set_al(kbd.shift_state());
        }
        other => {
            tracing::debug!(function = other, "unhandled INT 16h function");
        }
    }
    cpu.set_cf(false);
}
