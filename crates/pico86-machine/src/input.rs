//! Cross-context host input plumbing.
//!
//! The producer side (host keyboard thread, network receive context) holds
//! cloneable senders backed by bounded mutex-protected queues; the
//! interpreter context drains them at the top of each run slice. These are
//! the only structures shared across contexts besides the NE2000 ISR.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const INPUT_QUEUE_CAP: usize = 256;
const FRAME_QUEUE_CAP: usize = 64;

#[derive(Clone, Copy, Debug)]
pub enum InputEvent {
    Key { is_down: bool, keycode: u16 },
    Mouse { dx: i32, dy: i32, dz: i32, buttons: u8 },
}

#[derive(Clone, Default)]
pub struct InputQueue {
    events: Arc<Mutex<VecDeque<InputEvent>>>,
}

impl InputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer side; full queues drop the oldest event.
    pub fn push(&self, event: InputEvent) {
        let mut q = self.events.lock().unwrap();
        if q.len() >= INPUT_QUEUE_CAP {
            q.pop_front();
        }
        q.push_back(event);
    }

    pub(crate) fn drain(&self) -> Vec<InputEvent> {
        let mut q = self.events.lock().unwrap();
        q.drain(..).collect()
    }

    pub(crate) fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

/// Single-producer single-consumer frame ring into the NE2000 receive
/// path.
#[derive(Clone, Default)]
pub struct FrameQueue {
    frames: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full rings drop the incoming frame, as a real NIC would.
    pub fn push(&self, frame: Vec<u8>) {
        let mut q = self.frames.lock().unwrap();
        if q.len() < FRAME_QUEUE_CAP {
            q.push_back(frame);
        }
    }

    pub(crate) fn pop(&self) -> Option<Vec<u8>> {
        self.frames.lock().unwrap().pop_front()
    }

    pub(crate) fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }
}
