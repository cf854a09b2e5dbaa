use pico86_devices_input::{set1_sequence, I8042Controller, Ps2Keyboard, EXT_KEY_MIN};

fn drain(kbd: &mut Ps2Keyboard) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(b) = kbd.pop_output() {
        out.push(b);
    }
    out
}

#[test]
fn plain_keycodes_pass_through_as_set1_make_break() {
    let mut kbd = Ps2Keyboard::new();
    kbd.put_keycode(true, 30, 0); // "A"
    kbd.put_keycode(false, 30, 0);
    assert_eq!(drain(&mut kbd), vec![0x1E, 0x9E]);
}

#[test]
fn extended_keys_get_an_e0_prefix_with_a_delayed_second_byte() {
    let mut kbd = Ps2Keyboard::new();
    // Keypad enter (evdev 96) maps to E0 1C.
    kbd.put_keycode(true, 96, 0);
    assert_eq!(drain(&mut kbd), vec![0xE0], "second byte must be delayed");

    // Before the deadline nothing new appears.
    kbd.step(500);
    assert_eq!(drain(&mut kbd), Vec::<u8>::new());

    // At/after the deadline the scancode is released.
    kbd.step(1000);
    assert_eq!(drain(&mut kbd), vec![0x1C]);
}

#[test]
fn e0_delay_is_configurable() {
    let mut kbd = Ps2Keyboard::new();
    kbd.set_e0_delay_us(5000);
    kbd.put_keycode(true, 97, 0); // right ctrl: E0 1D
    kbd.step(1000);
    assert_eq!(drain(&mut kbd), vec![0xE0]);
    kbd.step(5000);
    assert_eq!(drain(&mut kbd), vec![0x1D]);
}

#[test]
fn a_following_key_flushes_the_pending_delayed_byte_in_order() {
    let mut kbd = Ps2Keyboard::new();
    kbd.put_keycode(true, 103, 0); // cursor up: E0 48
    kbd.put_keycode(true, 30, 0); // "A" arrives before the delay expires
    assert_eq!(drain(&mut kbd), vec![0xE0, 0x48, 0x1E]);
}

#[test]
fn unmapped_extended_keycodes_are_dropped() {
    let mut kbd = Ps2Keyboard::new();
    kbd.put_keycode(true, 99, 0); // hole in the translation table
    kbd.step(u64::MAX);
    assert_eq!(drain(&mut kbd), Vec::<u8>::new());
}

#[test]
fn every_evdev_code_roundtrips_through_the_reference_table() {
    // The keyboard path must agree with the table for the whole input
    // range, break bit included.
    for keycode in 0u8..=127 {
        for is_down in [true, false] {
            let mut kbd = Ps2Keyboard::new();
            kbd.put_keycode(is_down, keycode as u16, 0);
            kbd.step(u64::MAX); // release any delayed byte
            let produced = drain(&mut kbd);
            assert_eq!(
                produced,
                set1_sequence(is_down, keycode),
                "keycode {keycode} is_down {is_down}"
            );
        }
    }
}

#[test]
fn raw_extended_pairs_emit_prefix_then_delayed_code() {
    let mut kbd = Ps2Keyboard::new();
    // Pre-encoded pair 0xE05B (left win) injected directly.
    kbd.put_keycode(true, 0xE05B, 0);
    assert_eq!(drain(&mut kbd), vec![0xE0]);
    kbd.step(20_000);
    assert_eq!(drain(&mut kbd), vec![0x5B]);
}

#[test]
fn empty_queue_read_replays_the_last_byte() {
    let mut i8042 = I8042Controller::new();
    i8042.inject_key(true, 30, 0);
    assert_eq!(i8042.read_port(0x60), 0x1E);
    // EMM386 polls port 0x60 without checking OBF and expects the last
    // byte to stick.
    assert_eq!(i8042.read_port(0x60), 0x1E);
}

#[test]
fn keyboard_commands_are_acknowledged() {
    let mut kbd = Ps2Keyboard::new();
    kbd.receive_byte(0xFF); // reset
    assert_eq!(drain(&mut kbd), vec![0xFA, 0xAA]);

    kbd.receive_byte(0xF2); // get id
    assert_eq!(drain(&mut kbd), vec![0xFA, 0xAB, 0x83]);

    kbd.receive_byte(0xED); // set leds
    kbd.receive_byte(0x07);
    assert_eq!(drain(&mut kbd), vec![0xFA, 0xFA]);
}

#[test]
fn reference_table_covers_the_extended_range_shape() {
    // Below the extended range: identity make codes.
    assert_eq!(set1_sequence(true, 1), vec![0x01]);
    assert_eq!(set1_sequence(false, 1), vec![0x81]);
    // First extended key.
    assert_eq!(set1_sequence(true, EXT_KEY_MIN), vec![0xE0, 0x1C]);
}
