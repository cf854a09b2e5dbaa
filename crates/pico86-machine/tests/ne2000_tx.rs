mod common;

use common::{build_bios, Asm};
use pico86_machine::{Machine, MachineConfig, RunExit};
use pico86_pc_constants::NE2000_IO_BASE;

/// The guest brings up the NIC, loads a 64-byte frame into card memory
/// through remote DMA, and transmits it.
fn build_tx_body(frame: &[u8]) -> Vec<u8> {
    let base = NE2000_IO_BASE;
    let mut asm = Asm::new();

    // Stop the card and pick word-wide DMA.
    asm.out_port(base, 0x21); // CR: page 0, STOP
    asm.out_port(base + 0x0E, 0x49); // DCR

    // Ring setup (unused for TX but keeps the card sane).
    asm.out_port(base + 0x01, 0x46); // PSTART
    asm.out_port(base + 0x02, 0x80); // PSTOP
    asm.out_port(base + 0x03, 0x46); // BOUNDARY

    // Remote DMA write of the frame to 0x4000.
    asm.out_port(base + 0x08, 0x00); // RSAR lo
    asm.out_port(base + 0x09, 0x40); // RSAR hi
    asm.out_port(base + 0x0A, frame.len() as u8); // RBCR lo
    asm.out_port(base + 0x0B, 0x00); // RBCR hi
    asm.out_port(base, 0x12); // CR: remote write + START
    asm.mov_dx(base + 0x10);
    for pair in frame.chunks(2) {
        let word = pair[0] as u16 | ((pair[1] as u16) << 8);
        asm.mov_ax(word).out_dx_ax();
    }

    // Transmit: TPSR = 0x40, TBCR = len, kick CR.
    asm.out_port(base + 0x04, 0x40);
    asm.out_port(base + 0x05, frame.len() as u8);
    asm.out_port(base + 0x06, 0x00);
    asm.out_port(base, 0x26); // CR: TRANSMIT + START

    // Read ISR and report it over serial, then halt.
    asm.mov_dx(base + 0x07);
    asm.raw(&[0xEC]); // in al, dx
    asm.mov_dx(0x3F8).out_dx_al().hlt();
    asm.code
}

fn test_frame() -> Vec<u8> {
    let mut frame = vec![0xFF; 6];
    frame.extend_from_slice(&[0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
    frame.extend_from_slice(&[0x08, 0x06]);
    while frame.len() < 64 {
        frame.push(frame.len() as u8);
    }
    frame
}

#[test]
fn guest_programmed_transmit_reaches_the_host_shim() {
    let frame = test_frame();
    let mut m = Machine::new(MachineConfig {
        ram_size_bytes: 2 * 1024 * 1024,
        bios: build_bios(&build_tx_body(&frame)),
        ..Default::default()
    })
    .unwrap();

    for _ in 0..100 {
        if let RunExit::Halted { .. } = m.run_slice(10_000) {
            break;
        }
    }

    let sent = m.take_transmitted_frames();
    assert_eq!(sent, vec![frame], "the exact bytes the guest loaded");

    // The guest-visible ISR has PTX (0x02) and RDC (0x40) set.
    let serial = m.take_serial_output();
    assert_eq!(serial.len(), 1);
    assert_ne!(serial[0] & 0x02, 0, "ISR.PTX");
    assert_ne!(serial[0] & 0x40, 0, "ISR.RDC");
}

#[test]
fn injected_frames_appear_in_the_receive_ring() {
    // Bring the card up for receive (broadcast accepted), then halt; the
    // host injects a frame and the guest-visible ISR gains PRX.
    let base = NE2000_IO_BASE;
    let mut asm = Asm::new();
    asm.out_port(base, 0x21);
    asm.out_port(base + 0x0E, 0x49);
    asm.out_port(base + 0x01, 0x46);
    asm.out_port(base + 0x02, 0x80);
    asm.out_port(base + 0x03, 0x46);
    asm.out_port(base + 0x0C, 0x04); // RCR: broadcast
    asm.out_port(base, 0x61); // page 1
    asm.out_port(base + 0x07, 0x47); // CURR
    asm.out_port(base, 0x22); // page 0, START
    asm.hlt();
    // After the wake-less resume (second slice), read ISR to serial.
    asm.mov_dx(base + 0x07);
    asm.raw(&[0xEC]);
    asm.mov_dx(0x3F8).out_dx_al().hlt();

    let mut m = Machine::new(MachineConfig {
        ram_size_bytes: 2 * 1024 * 1024,
        bios: build_bios(&asm.code),
        ..Default::default()
    })
    .unwrap();

    for _ in 0..100 {
        if let RunExit::Halted { .. } = m.run_slice(10_000) {
            break;
        }
    }

    m.inject_frame(&test_frame());

    // Un-halt the CPU directly; the next slice executes the ISR read that
    // follows the HLT.
    m.cpu_mut().state.halted = false;
    for _ in 0..100 {
        if let RunExit::Halted { .. } = m.run_slice(10_000) {
            break;
        }
    }
    let serial = m.take_serial_output();
    assert_eq!(serial.len(), 1);
    assert_ne!(serial[0] & 0x01, 0, "ISR.PRX after host injection");
}
