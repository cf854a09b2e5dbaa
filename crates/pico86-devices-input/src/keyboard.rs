//! PS/2 keyboard: guest command handling and host-keycode injection with
//! the delayed byte after an 0xE0 prefix.

use crate::queue::Ps2Queue;
use crate::scancodes::{EXT_TO_SET1, EXT_KEY_MAX, EXT_KEY_MIN};

const CMD_SET_LEDS: u8 = 0xED;
const CMD_ECHO: u8 = 0xEE;
const CMD_GET_ID: u8 = 0xF2;
const CMD_SET_RATE: u8 = 0xF3;
const CMD_ENABLE: u8 = 0xF4;
const CMD_RESET_DISABLE: u8 = 0xF5;
const CMD_RESET_ENABLE: u8 = 0xF6;
const CMD_RESET: u8 = 0xFF;

const REPLY_POR: u8 = 0xAA;
const REPLY_ACK: u8 = 0xFA;
const REPLY_RESEND: u8 = 0xFE;

/// Default gap between an 0xE0 prefix and its second byte. Some DOS-era
/// software reads port 0x60 twice expecting to see the prefix stick
/// around; the exact duration is empirical.
pub const DEFAULT_E0_DELAY_US: u64 = 1000;

pub struct Ps2Keyboard {
    queue: Ps2Queue,
    /// Command awaiting its data byte (SET_LEDS / SET_RATE).
    write_cmd: Option<u8>,
    scan_enabled: bool,
    /// Scan-code translation bit from the controller; set 1 is native
    /// here, so the flag is bookkeeping only.
    translate: bool,
    delayed: Option<(u64, u8)>,
    e0_delay_us: u64,
}

impl Default for Ps2Keyboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Ps2Keyboard {
    pub fn new() -> Self {
        Self {
            queue: Ps2Queue::new(),
            write_cmd: None,
            scan_enabled: true,
            translate: false,
            delayed: None,
            e0_delay_us: DEFAULT_E0_DELAY_US,
        }
    }

    pub fn set_e0_delay_us(&mut self, us: u64) {
        self.e0_delay_us = us;
    }

    pub fn set_translation(&mut self, enabled: bool) {
        self.translate = enabled;
    }

    /// The controller's KCC bit. Codes are produced in set 1 natively, so
    /// this only records what the guest asked for.
    pub fn translation_enabled(&self) -> bool {
        self.translate
    }

    pub fn reset(&mut self) {
        self.queue.clear();
        self.write_cmd = None;
        self.scan_enabled = true;
        self.delayed = None;
    }

    pub fn has_output(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn pop_output(&mut self) -> Option<u8> {
        self.queue.pop()
    }

    /// Guest-facing read of the data FIFO (replays the last byte when
    /// empty).
    pub fn read_data(&mut self) -> u8 {
        self.queue.read()
    }

    fn queue(&mut self, b: u8) {
        self.queue.push(b);
    }

    /// Controller-injected byte (commands 0x20/0xAA/0xD2...), bypassing
    /// keyboard command handling.
    pub(crate) fn keyboard_queue_raw(&mut self, b: u8) {
        self.queue.push(b);
    }

    /// Releases a pending delayed scancode whose deadline has passed.
    pub fn step(&mut self, now_us: u64) {
        if let Some((due, code)) = self.delayed {
            if now_us >= due {
                self.delayed = None;
                self.queue(code);
            }
        }
    }

    /// Host key event in Linux-evdev encoding.
    pub fn put_keycode(&mut self, is_down: bool, keycode: u16, now_us: u64) {
        // A still-pending delayed byte is flushed first so ordering holds.
        if let Some((_, code)) = self.delayed.take() {
            self.queue(code);
        }
        let break_bit = if is_down { 0 } else { 0x80 };

        if keycode >= 0xE000 {
            // Pre-encoded extended pair: emit the prefix now, the second
            // byte after a longer grace period.
            self.queue((keycode >> 8) as u8);
            self.delayed = Some((now_us + 10 * self.e0_delay_us, (keycode as u8) | break_bit));
        } else if keycode >= EXT_KEY_MIN as u16 {
            if keycode > EXT_KEY_MAX as u16 {
                return;
            }
            let code = EXT_TO_SET1[(keycode - EXT_KEY_MIN as u16) as usize];
            if code == 0 {
                return;
            }
            self.queue(0xE0);
            self.delayed = Some((now_us + self.e0_delay_us, code | break_bit));
        } else {
            self.queue(keycode as u8 | break_bit);
        }
    }

    /// Byte written by the guest through the controller.
    pub fn receive_byte(&mut self, value: u8) {
        match self.write_cmd.take() {
            Some(CMD_SET_LEDS) | Some(CMD_SET_RATE) => {
                self.queue(REPLY_ACK);
            }
            _ => match value {
                0x00 => self.queue(REPLY_ACK),
                0x05 => self.queue(REPLY_RESEND),
                CMD_GET_ID => {
                    self.queue(REPLY_ACK);
                    self.queue(0xAB);
                    self.queue(0x83);
                }
                CMD_ECHO => self.queue(CMD_ECHO),
                CMD_ENABLE => {
                    self.scan_enabled = true;
                    self.queue(REPLY_ACK);
                }
                CMD_SET_LEDS | CMD_SET_RATE => {
                    self.write_cmd = Some(value);
                    self.queue(REPLY_ACK);
                }
                CMD_RESET_DISABLE => {
                    self.scan_enabled = false;
                    self.queue(REPLY_ACK);
                }
                CMD_RESET_ENABLE => {
                    self.scan_enabled = true;
                    self.queue(REPLY_ACK);
                }
                CMD_RESET => {
                    self.scan_enabled = true;
                    self.queue(REPLY_ACK);
                    self.queue(REPLY_POR);
                }
                _ => self.queue(REPLY_ACK),
            },
        }
    }
}
