//! Linux-evdev keycode to PS/2 set-1 translation.
//!
//! Keycodes below 96 are set-1 make codes already. Keycodes 96..=127 are
//! the "extended" keys (keypad enter, right ctrl/alt, cursor block, win
//! keys) and map through a fixed table to an 0xE0-prefixed code.

pub const EXT_KEY_MIN: u8 = 96;
pub const EXT_KEY_MAX: u8 = 127;

/// Set-1 code for each evdev keycode in 96..=127; 0 marks keys with no
/// PS/2 equivalent.
pub(crate) const EXT_TO_SET1: [u8; 32] = [
    0x1C, 0x1D, 0x35, 0x00, 0x38, 0x00, 0x47, 0x48, //
    0x49, 0x4B, 0x4D, 0x4F, 0x50, 0x51, 0x52, 0x53, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x5B, 0x5C, 0x5D,
];

/// The full set-1 byte sequence a make (or break) of `keycode` produces.
/// Returns an empty vector for unmapped keys.
pub fn set1_sequence(is_down: bool, keycode: u8) -> Vec<u8> {
    let break_bit = if is_down { 0 } else { 0x80 };
    if keycode < EXT_KEY_MIN {
        vec![keycode | break_bit]
    } else if keycode <= EXT_KEY_MAX {
        match EXT_TO_SET1[(keycode - EXT_KEY_MIN) as usize] {
            0 => Vec::new(),
            code => vec![0xE0, code | break_bit],
        }
    } else {
        Vec::new()
    }
}
