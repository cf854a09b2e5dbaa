mod common;

use common::{build_bios, Asm};
use pico86_machine::{Machine, MachineConfig, RunExit};
use pico86_pc_constants::{MASTER_CMD, MASTER_DATA, PIT_CH0, PIT_CMD, SLAVE_DATA};

/// Remaps the PIC, installs an IRQ0 handler in the IVT, programs PIT
/// channel 0 as a rate generator, then executes STI;HLT. The timer must
/// wake the CPU even though the machine parks on HLT, after which the
/// guest prints "OK".
fn build_body() -> Vec<u8> {
    let mut asm = Asm::new();
    // cli ; xor ax, ax ; mov ds, ax ; mov ss, ax ; mov sp, 0x7000
    asm.raw(&[0xFA, 0x31, 0xC0, 0x8E, 0xD8, 0x8E, 0xD0, 0xBC, 0x00, 0x70]);

    // ICW1: init + ICW4 on both chips.
    asm.mov_al(0x11).out_imm(MASTER_CMD as u8);
    asm.mov_al(0x11).out_imm(0xA0);
    // ICW2: master vectors at 0x20, slave at 0x28.
    asm.mov_al(0x20).out_imm(MASTER_DATA as u8);
    asm.mov_al(0x28).out_imm(SLAVE_DATA as u8);
    // ICW3: cascade wiring.
    asm.mov_al(0x04).out_imm(MASTER_DATA as u8);
    asm.mov_al(0x02).out_imm(SLAVE_DATA as u8);
    // ICW4: 8086 mode.
    asm.mov_al(0x01).out_imm(MASTER_DATA as u8);
    asm.mov_al(0x01).out_imm(SLAVE_DATA as u8);
    // Unmask only IRQ0; mask the whole slave.
    asm.mov_al(0xFE).out_imm(MASTER_DATA as u8);
    asm.mov_al(0xFF).out_imm(SLAVE_DATA as u8);

    // IVT[0x20] = F000:handler — the offset immediate is patched below.
    asm.raw(&[0xC7, 0x06, 0x80, 0x00, 0x00, 0x00]); // mov word [0x80], imm16
    let handler_imm_at = asm.code.len() - 2;
    asm.raw(&[0xC7, 0x06, 0x82, 0x00, 0x00, 0xF0]); // mov word [0x82], 0xF000

    // PIT channel 0: lobyte/hibyte, mode 2, small reload.
    asm.mov_al(0x34).out_imm(PIT_CMD as u8);
    asm.mov_al(0x20).out_imm(PIT_CH0 as u8);
    asm.mov_al(0x00).out_imm(PIT_CH0 as u8);

    // sti ; hlt ; then report and park.
    asm.raw(&[0xFB, 0xF4]);
    asm.mov_dx(0x3F8).mov_al(b'O').out_dx_al();
    asm.mov_al(b'K').out_dx_al();
    asm.hlt();

    // IRQ0 handler: mask the timer, EOI, IRET.
    let handler_offset = asm.code.len() as u16;
    asm.raw(&[0x50]); // push ax
    asm.mov_al(0xFF).out_imm(MASTER_DATA as u8);
    asm.mov_al(0x20).out_imm(MASTER_CMD as u8);
    asm.raw(&[0x58, 0xCF]); // pop ax ; iret

    asm.code[handler_imm_at] = handler_offset as u8;
    asm.code[handler_imm_at + 1] = (handler_offset >> 8) as u8;
    asm.code
}

#[test]
fn pit_irq0_wakes_hlt_and_the_guest_prints_ok() {
    let mut m = Machine::new(MachineConfig {
        ram_size_bytes: 2 * 1024 * 1024,
        bios: build_bios(&build_body()),
        ..Default::default()
    })
    .unwrap();

    let mut saw_ok = false;
    for _ in 0..1_000 {
        let exit = m.run_slice(10_000);
        if m.serial_output_bytes() == b"OK" && matches!(exit, RunExit::Halted { .. }) {
            saw_ok = true;
            break;
        }
    }
    assert!(
        saw_ok,
        "guest never printed OK (timers likely not advancing during HLT); serial={:?}",
        m.serial_output_bytes()
    );
    assert_eq!(m.take_serial_output(), b"OK");
}

#[test]
fn halted_idle_does_not_consume_the_instruction_budget() {
    // A guest that halts with interrupts off is observably idle: the slice
    // returns immediately with nothing executed after the first call.
    let mut asm = Asm::new();
    asm.raw(&[0xFA]).hlt(); // cli ; hlt

    let mut m = Machine::new(MachineConfig {
        ram_size_bytes: 2 * 1024 * 1024,
        bios: build_bios(&asm.code),
        ..Default::default()
    })
    .unwrap();

    // First slice executes the two instructions and parks.
    let first = m.run_slice(10_000);
    assert!(matches!(first, RunExit::Halted { .. }));

    let again = m.run_slice(10_000);
    assert_eq!(again, RunExit::Halted { executed: 0 });
}
