//! PS/2 mouse with the IntelliMouse (IMPS/2) and IntelliMouse Explorer
//! (IMEX) sample-rate escape sequences.

use crate::queue::Ps2Queue;

const AUX_SET_SCALE11: u8 = 0xE6;
const AUX_SET_SCALE21: u8 = 0xE7;
const AUX_SET_RES: u8 = 0xE8;
const AUX_GET_SCALE: u8 = 0xE9;
const AUX_SET_STREAM: u8 = 0xEA;
const AUX_POLL: u8 = 0xEB;
const AUX_RESET_WRAP: u8 = 0xEC;
const AUX_SET_WRAP: u8 = 0xEE;
const AUX_SET_REMOTE: u8 = 0xF0;
const AUX_GET_TYPE: u8 = 0xF2;
const AUX_SET_SAMPLE: u8 = 0xF3;
const AUX_ENABLE_DEV: u8 = 0xF4;
const AUX_DISABLE_DEV: u8 = 0xF5;
const AUX_SET_DEFAULT: u8 = 0xF6;
const AUX_RESET: u8 = 0xFF;
const AUX_ACK: u8 = 0xFA;

const STATUS_REMOTE: u8 = 0x40;
const STATUS_ENABLED: u8 = 0x20;
const STATUS_SCALE21: u8 = 0x10;

pub const MOUSE_BUTTON_LEFT: u8 = 0x01;
pub const MOUSE_BUTTON_RIGHT: u8 = 0x02;
pub const MOUSE_BUTTON_MIDDLE: u8 = 0x04;

/// Device IDs reported by GET_TYPE: 0 = plain, 3 = IMPS/2, 4 = IMEX.
const TYPE_PLAIN: u8 = 0;
const TYPE_IMPS2: u8 = 3;
const TYPE_IMEX: u8 = 4;

/// Packet-space headroom kept so a burst of motion cannot wedge the FIFO.
const QUEUE_HEADROOM: usize = 16;

pub struct Ps2Mouse {
    queue: Ps2Queue,
    write_cmd: Option<u8>,
    status: u8,
    resolution: u8,
    sample_rate: u8,
    wrap: bool,
    mouse_type: u8,
    /// Sample-rate escape recognizer: 0 idle, 1 saw 200, 2 saw 200,100,
    /// 3 saw 200,200.
    detect_state: u8,
    dx: i32,
    dy: i32,
    dz: i32,
    buttons: u8,
}

impl Default for Ps2Mouse {
    fn default() -> Self {
        Self::new()
    }
}

impl Ps2Mouse {
    pub fn new() -> Self {
        Self {
            queue: Ps2Queue::new(),
            write_cmd: None,
            status: 0,
            resolution: 0,
            sample_rate: 0,
            wrap: false,
            mouse_type: TYPE_PLAIN,
            detect_state: 0,
            dx: 0,
            dy: 0,
            dz: 0,
            buttons: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn device_id(&self) -> u8 {
        self.mouse_type
    }

    pub fn has_output(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn pop_output(&mut self) -> Option<u8> {
        self.queue.pop()
    }

    pub fn read_data(&mut self) -> u8 {
        self.queue.read()
    }

    fn queue(&mut self, b: u8) {
        self.queue.push(b);
    }

    /// Controller-injected byte (command 0xD3), bypassing mouse command
    /// handling.
    pub(crate) fn mouse_queue_raw(&mut self, b: u8) {
        self.queue.push(b);
    }

    /// Accumulates a host event. In stream mode with room in the FIFO the
    /// deltas are flushed as packets immediately; oversized deltas produce
    /// multiple packets.
    pub fn inject_event(&mut self, dx: i32, dy: i32, dz: i32, buttons: u8) {
        if self.status & STATUS_ENABLED == 0 {
            return;
        }
        self.dx += dx;
        // Host deltas are screen-oriented (y grows downward); PS/2 y grows
        // upward.
        self.dy -= dy;
        self.dz += dz;

        if self.dx == 0 && self.dy == 0 && self.dz == 0 && self.buttons == buttons {
            return;
        }
        // A wheel-only event on a plain mouse has nothing to report.
        if self.dx == 0
            && self.dy == 0
            && self.buttons == buttons
            && self.mouse_type == TYPE_PLAIN
        {
            self.dz = 0;
            return;
        }
        self.buttons = buttons;

        if self.status & STATUS_REMOTE == 0 && self.queue.room() > QUEUE_HEADROOM {
            loop {
                self.send_packet();
                if self.dx == 0 && self.dy == 0 && self.dz == 0 {
                    break;
                }
            }
        }
    }

    pub fn inject_motion(&mut self, dx: i32, dy: i32, dz: i32) {
        let buttons = self.buttons;
        self.inject_event(dx, dy, dz, buttons);
    }

    pub fn inject_buttons(&mut self, buttons: u8) {
        self.inject_event(0, 0, 0, buttons);
    }

    fn send_packet(&mut self) {
        let dx1 = self.dx.clamp(-127, 127);
        let dy1 = self.dy.clamp(-127, 127);
        let header = 0x08
            | (((dx1 < 0) as u8) << 4)
            | (((dy1 < 0) as u8) << 5)
            | (self.buttons & 0x07);
        self.queue(header);
        self.queue(dx1 as u8);
        self.queue(dy1 as u8);

        let mut dz1 = 0;
        match self.mouse_type {
            TYPE_IMPS2 => {
                dz1 = self.dz.clamp(-127, 127);
                self.queue(dz1 as u8);
            }
            TYPE_IMEX => {
                dz1 = self.dz.clamp(-7, 7);
                let b = (dz1 as u8 & 0x0F) | ((self.buttons & 0x18) << 1);
                self.queue(b);
            }
            _ => {
                // Plain mice have no wheel byte; swallow the delta.
                dz1 = self.dz;
            }
        }

        self.dx -= dx1;
        self.dy -= dy1;
        self.dz -= dz1;
    }

    /// Byte written by the guest (via i8042 command 0xD4).
    pub fn receive_byte(&mut self, value: u8) {
        match self.write_cmd.take() {
            Some(AUX_SET_SAMPLE) => {
                self.sample_rate = value;
                // The 200,100,80 / 200,200,80 escape sequences promote the
                // device to IMPS/2 / IMEX.
                self.detect_state = match (self.detect_state, value) {
                    (0, 200) => 1,
                    (1, 100) => 2,
                    (1, 200) => 3,
                    (2, 80) => {
                        self.mouse_type = TYPE_IMPS2;
                        0
                    }
                    (3, 80) => {
                        self.mouse_type = TYPE_IMEX;
                        0
                    }
                    _ => 0,
                };
                self.queue(AUX_ACK);
            }
            Some(AUX_SET_RES) => {
                self.resolution = value;
                self.queue(AUX_ACK);
            }
            _ => {
                if self.wrap {
                    if value == AUX_RESET_WRAP {
                        self.wrap = false;
                        self.queue(AUX_ACK);
                        return;
                    } else if value != AUX_RESET {
                        // Wrap mode echoes everything else back.
                        self.queue(value);
                        return;
                    }
                }
                match value {
                    AUX_SET_SCALE11 => {
                        self.status &= !STATUS_SCALE21;
                        self.queue(AUX_ACK);
                    }
                    AUX_SET_SCALE21 => {
                        self.status |= STATUS_SCALE21;
                        self.queue(AUX_ACK);
                    }
                    AUX_SET_STREAM => {
                        self.status &= !STATUS_REMOTE;
                        self.queue(AUX_ACK);
                    }
                    AUX_SET_WRAP => {
                        self.wrap = true;
                        self.queue(AUX_ACK);
                    }
                    AUX_SET_REMOTE => {
                        self.status |= STATUS_REMOTE;
                        self.queue(AUX_ACK);
                    }
                    AUX_GET_TYPE => {
                        self.queue(AUX_ACK);
                        let t = self.mouse_type;
                        self.queue(t);
                    }
                    AUX_SET_RES | AUX_SET_SAMPLE => {
                        self.write_cmd = Some(value);
                        self.queue(AUX_ACK);
                    }
                    AUX_GET_SCALE => {
                        self.queue(AUX_ACK);
                        let (s, r, sr) = (self.status, self.resolution, self.sample_rate);
                        self.queue(s);
                        self.queue(r);
                        self.queue(sr);
                    }
                    AUX_POLL => {
                        self.queue(AUX_ACK);
                        self.send_packet();
                    }
                    AUX_ENABLE_DEV => {
                        self.status |= STATUS_ENABLED;
                        self.queue(AUX_ACK);
                    }
                    AUX_DISABLE_DEV => {
                        self.status &= !STATUS_ENABLED;
                        self.queue(AUX_ACK);
                    }
                    AUX_SET_DEFAULT => {
                        self.sample_rate = 100;
                        self.resolution = 2;
                        self.status = 0;
                        self.queue(AUX_ACK);
                    }
                    AUX_RESET => {
                        self.sample_rate = 100;
                        self.resolution = 2;
                        self.status = 0;
                        self.mouse_type = TYPE_PLAIN;
                        self.wrap = false;
                        self.queue(AUX_ACK);
                        self.queue(0xAA);
                        let t = self.mouse_type;
                        self.queue(t);
                    }
                    _ => {}
                }
            }
        }
    }
}
