//! The i8042 keyboard controller: command-byte state machine, output
//! buffer arbitration between the two PS/2 children, IRQ generation.

use crate::keyboard::Ps2Keyboard;
use crate::mouse::Ps2Mouse;
use crate::{IrqSink, NullIrqSink};

// Controller commands (port 0x64).
const CCMD_READ_MODE: u8 = 0x20;
const CCMD_WRITE_MODE: u8 = 0x60;
const CCMD_GET_VERSION: u8 = 0xA1;
const CCMD_MOUSE_DISABLE: u8 = 0xA7;
const CCMD_MOUSE_ENABLE: u8 = 0xA8;
const CCMD_TEST_MOUSE: u8 = 0xA9;
const CCMD_SELF_TEST: u8 = 0xAA;
const CCMD_KBD_TEST: u8 = 0xAB;
const CCMD_KBD_DISABLE: u8 = 0xAD;
const CCMD_KBD_ENABLE: u8 = 0xAE;
const CCMD_READ_INPORT: u8 = 0xC0;
const CCMD_READ_OUTPORT: u8 = 0xD0;
const CCMD_WRITE_OUTPORT: u8 = 0xD1;
const CCMD_WRITE_OBUF: u8 = 0xD2;
const CCMD_WRITE_AUX_OBUF: u8 = 0xD3;
const CCMD_WRITE_MOUSE: u8 = 0xD4;
const CCMD_DISABLE_A20: u8 = 0xDD;
const CCMD_ENABLE_A20: u8 = 0xDF;
const CCMD_RESET: u8 = 0xFE;

// Status register bits.
const STAT_OBF: u8 = 0x01;
const STAT_SELFTEST: u8 = 0x04;
const STAT_CMD: u8 = 0x08;
const STAT_UNLOCKED: u8 = 0x10;
const STAT_MOUSE_OBF: u8 = 0x20;

// Command-byte (mode) bits.
const MODE_KBD_INT: u8 = 0x01;
const MODE_MOUSE_INT: u8 = 0x02;
const MODE_DISABLE_KBD: u8 = 0x10;
const MODE_DISABLE_MOUSE: u8 = 0x20;
const MODE_KCC: u8 = 0x40;

const PENDING_KBD: u8 = 1;
const PENDING_AUX: u8 = 2;

const IRQ_KBD: u8 = 1;
const IRQ_MOUSE: u8 = 12;

pub struct I8042Controller {
    mode: u8,
    status: u8,
    /// Controller command whose data byte is still outstanding.
    write_cmd: Option<u8>,
    /// Bitmask of children with output available.
    pending: u8,
    kbd: Ps2Keyboard,
    mouse: Ps2Mouse,
    sink: Box<dyn IrqSink>,
    /// 0xFE was written; the machine polls and performs the reset.
    reset_requested: bool,
    /// A20 gate state. The physical gate is hardwired enabled on this
    /// machine; the bit only records what the guest asked for.
    a20_requested: bool,
}

impl Default for I8042Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl I8042Controller {
    pub fn new() -> Self {
        Self {
            mode: MODE_KBD_INT | MODE_MOUSE_INT | MODE_KCC,
            status: STAT_CMD | STAT_UNLOCKED,
            write_cmd: None,
            pending: 0,
            kbd: Ps2Keyboard::new(),
            mouse: Ps2Mouse::new(),
            sink: Box::new(NullIrqSink),
            reset_requested: false,
            a20_requested: true,
        }
    }

    pub fn set_irq_sink(&mut self, sink: Box<dyn IrqSink>) {
        self.sink = sink;
    }

    pub fn set_e0_delay_us(&mut self, us: u64) {
        self.kbd.set_e0_delay_us(us);
    }

    pub fn reset(&mut self) {
        self.mode = MODE_KBD_INT | MODE_MOUSE_INT | MODE_KCC;
        self.status = STAT_CMD | STAT_UNLOCKED;
        self.write_cmd = None;
        self.pending = 0;
        self.kbd.reset();
        self.mouse.reset();
        self.reset_requested = false;
        self.sink.set_irq(IRQ_KBD, false);
        self.sink.set_irq(IRQ_MOUSE, false);
    }

    /// True once after the guest wrote the 0xFE reset pulse.
    pub fn take_reset_request(&mut self) -> bool {
        std::mem::take(&mut self.reset_requested)
    }

    pub fn keyboard_mut(&mut self) -> &mut Ps2Keyboard {
        &mut self.kbd
    }

    pub fn mouse_mut(&mut self) -> &mut Ps2Mouse {
        &mut self.mouse
    }

    /// Recomputes OBF/AUX status and both IRQ lines. Keyboard data takes
    /// priority over mouse data.
    fn update_irq(&mut self) {
        self.pending = 0;
        if self.kbd.has_output() {
            self.pending |= PENDING_KBD;
        }
        if self.mouse.has_output() {
            self.pending |= PENDING_AUX;
        }

        let mut irq_kbd = false;
        let mut irq_mouse = false;
        self.status &= !(STAT_OBF | STAT_MOUSE_OBF);
        if self.pending != 0 {
            self.status |= STAT_OBF;
            if self.pending == PENDING_AUX {
                self.status |= STAT_MOUSE_OBF;
                if self.mode & MODE_MOUSE_INT != 0 {
                    irq_mouse = true;
                }
            } else if self.mode & MODE_KBD_INT != 0 && self.mode & MODE_DISABLE_KBD == 0 {
                irq_kbd = true;
            }
        }
        self.sink.set_irq(IRQ_KBD, irq_kbd);
        self.sink.set_irq(IRQ_MOUSE, irq_mouse);
    }

    /// Periodic housekeeping: releases the delayed 0xE0 second byte and
    /// re-publishes the IRQ lines.
    pub fn step(&mut self, now_us: u64) {
        self.kbd.step(now_us);
        self.update_irq();
    }

    /// Host keyboard event (Linux-evdev keycode).
    pub fn inject_key(&mut self, is_down: bool, keycode: u16, now_us: u64) {
        self.kbd.put_keycode(is_down, keycode, now_us);
        self.update_irq();
    }

    /// Host mouse event.
    pub fn inject_mouse(&mut self, dx: i32, dy: i32, dz: i32, buttons: u8) {
        self.mouse.inject_event(dx, dy, dz, buttons);
        self.update_irq();
    }

    pub fn read_port(&mut self, port: u16) -> u8 {
        match port & 7 {
            4 => self.status,
            _ => {
                // Port 0x60: drain whichever child owns the output buffer.
                let value = if self.pending == PENDING_AUX {
                    self.mouse.read_data()
                } else {
                    self.kbd.read_data()
                };
                // Reading deasserts the line; it re-asserts if data is
                // left so the guest sees a fresh edge per byte.
                self.sink.set_irq(IRQ_KBD, false);
                self.sink.set_irq(IRQ_MOUSE, false);
                self.update_irq();
                value
            }
        }
    }

    pub fn write_port(&mut self, port: u16, value: u8) {
        // Input latency is not modeled, so IBF never sticks.
        match port & 7 {
            4 => self.write_command(value),
            _ => self.write_data(value),
        }
    }

    fn write_command(&mut self, value: u8) {
        match value {
            CCMD_READ_MODE => {
                let mode = self.mode;
                self.kbd_queue(mode);
            }
            CCMD_WRITE_MODE | CCMD_WRITE_OBUF | CCMD_WRITE_AUX_OBUF | CCMD_WRITE_MOUSE
            | CCMD_WRITE_OUTPORT => {
                self.write_cmd = Some(value);
            }
            CCMD_MOUSE_DISABLE => {
                self.mode |= MODE_DISABLE_MOUSE;
            }
            CCMD_MOUSE_ENABLE => {
                self.mode &= !MODE_DISABLE_MOUSE;
            }
            CCMD_TEST_MOUSE => self.kbd_queue(0x00),
            CCMD_SELF_TEST => {
                self.status |= STAT_SELFTEST;
                self.kbd_queue(0x55);
            }
            CCMD_KBD_TEST => self.kbd_queue(0x00),
            CCMD_KBD_DISABLE => {
                self.mode |= MODE_DISABLE_KBD;
                self.update_irq();
            }
            CCMD_KBD_ENABLE => {
                self.mode &= !MODE_DISABLE_KBD;
                self.update_irq();
            }
            CCMD_READ_INPORT => self.kbd_queue(0x00),
            CCMD_READ_OUTPORT => {
                let mut v = 0x01 | ((self.a20_requested as u8) << 1);
                if self.status & STAT_OBF != 0 {
                    v |= 0x10;
                }
                if self.status & STAT_MOUSE_OBF != 0 {
                    v |= 0x20;
                }
                self.kbd_queue(v);
            }
            CCMD_ENABLE_A20 => self.a20_requested = true,
            CCMD_DISABLE_A20 => self.a20_requested = false,
            CCMD_GET_VERSION => self.kbd_queue(0x00),
            CCMD_RESET => self.reset_requested = true,
            0xFF => {}
            _ => {}
        }
    }

    fn write_data(&mut self, value: u8) {
        match self.write_cmd.take() {
            None => {
                self.kbd.receive_byte(value);
                self.update_irq();
            }
            Some(CCMD_WRITE_MODE) => {
                self.mode = value;
                self.kbd.set_translation(self.mode & MODE_KCC != 0);
                self.update_irq();
            }
            Some(CCMD_WRITE_OBUF) => self.kbd_queue(value),
            Some(CCMD_WRITE_AUX_OBUF) => self.aux_queue(value),
            Some(CCMD_WRITE_OUTPORT) => {
                self.a20_requested = value & 0x02 != 0;
                if value & 0x01 == 0 {
                    self.reset_requested = true;
                }
            }
            Some(CCMD_WRITE_MOUSE) => {
                self.mouse.receive_byte(value);
                self.update_irq();
            }
            Some(_) => {}
        }
    }

    /// Places a byte in the keyboard output buffer as if the keyboard had
    /// sent it.
    fn kbd_queue(&mut self, value: u8) {
        self.kbd.keyboard_queue_raw(value);
        self.update_irq();
    }

    fn aux_queue(&mut self, value: u8) {
        self.mouse.mouse_queue_raw(value);
        self.update_irq();
    }
}
