mod common;

use common::{build_bios, Asm};
use pico86_machine::{ConfigError, Machine, MachineConfig, RunExit};
use pretty_assertions::assert_eq;

fn run_until_halt(m: &mut Machine) {
    for _ in 0..100 {
        match m.run_slice(10_000) {
            RunExit::Halted { .. } => return,
            RunExit::Completed { .. } => continue,
        }
    }
    panic!("guest never halted");
}

#[test]
fn boot_writes_one_byte_to_the_serial_sink_and_halts() {
    // The minimal kernel of scenario one: write 0x41 to COM1, halt.
    let mut asm = Asm::new();
    asm.mov_dx(0x3F8).mov_al(0x41).out_dx_al().hlt();

    let mut m = Machine::new(MachineConfig {
        ram_size_bytes: 2 * 1024 * 1024,
        bios: build_bios(&asm.code),
        ..Default::default()
    })
    .unwrap();

    run_until_halt(&mut m);

    assert_eq!(m.take_serial_output(), vec![0x41], "exactly one byte");
    assert!(m.cpu().state.halted);
}

#[test]
fn payload_blob_is_loaded_and_reachable() {
    // The BIOS reads the payload's first byte from 1 MiB and echoes it.
    // (The payload region is above the 1 MiB real-mode horizon, so the
    // BIOS stages it through a flat ES via unreal-mode-free 32-bit moves
    // is overkill here; instead the blob is placed low.)
    let mut asm = Asm::new();
    asm.raw(&[0x31, 0xC0]) // xor ax, ax
        .raw(&[0x8E, 0xD8]) // mov ds, ax
        .raw(&[0xA0, 0x00, 0x60]) // mov al, [0x6000]
        .mov_dx(0x3F8)
        .out_dx_al()
        .hlt();

    let mut m = Machine::new(MachineConfig {
        ram_size_bytes: 2 * 1024 * 1024,
        bios: build_bios(&asm.code),
        kernel: Some((vec![0x7E], 0x6000)),
        ..Default::default()
    })
    .unwrap();

    run_until_halt(&mut m);
    assert_eq!(m.take_serial_output(), vec![0x7E]);
}

#[test]
fn pci_config_ports_float_high() {
    // in al, dx from 0xCFC must read 0xFF on this PCI-less board.
    let mut asm = Asm::new();
    asm.mov_dx(0x0CFC)
        .raw(&[0xEC]) // in al, dx
        .mov_dx(0x3F8)
        .out_dx_al()
        .hlt();

    let mut m = Machine::new(MachineConfig {
        ram_size_bytes: 2 * 1024 * 1024,
        bios: build_bios(&asm.code),
        ..Default::default()
    })
    .unwrap();

    run_until_halt(&mut m);
    assert_eq!(m.take_serial_output(), vec![0xFF]);
}

#[test]
fn bios_shadow_ignores_guest_stores() {
    // Store into the BIOS image, then read back and report the byte.
    let mut asm = Asm::new();
    asm.mov_ax(0xF000)
        .raw(&[0x8E, 0xD8]) // mov ds, ax
        .raw(&[0xC6, 0x06, 0x00, 0x70, 0x00]) // mov byte [0x7000], 0
        .raw(&[0xA0, 0x00, 0x70]) // mov al, [0x7000]
        .mov_dx(0x3F8)
        .out_dx_al()
        .hlt();

    let mut body = asm.code.clone();
    // Distinct marker byte inside the BIOS at F000:7000.
    body.resize(0x7001, 0);
    body[0x7000] = 0xBD;

    let mut m = Machine::new(MachineConfig {
        ram_size_bytes: 2 * 1024 * 1024,
        bios: build_bios(&body),
        ..Default::default()
    })
    .unwrap();

    run_until_halt(&mut m);
    assert_eq!(m.take_serial_output(), vec![0xBD], "ROM store was dropped");
}

#[test]
fn config_validation_rejects_bad_boots() {
    let err = Machine::new(MachineConfig {
        ram_size_bytes: 4096,
        bios: vec![0xF4],
        ..Default::default()
    })
    .unwrap_err();
    assert!(matches!(err, ConfigError::BadRamSize(_)));

    let err = Machine::new(MachineConfig {
        ram_size_bytes: 2 * 1024 * 1024,
        bios: Vec::new(),
        ..Default::default()
    })
    .unwrap_err();
    assert!(matches!(err, ConfigError::MissingBios));

    let err = Machine::new(MachineConfig {
        ram_size_bytes: 2 * 1024 * 1024,
        bios: vec![0; 0x20000],
        ..Default::default()
    })
    .unwrap_err();
    assert!(matches!(err, ConfigError::BiosTooLarge { .. }));
}
