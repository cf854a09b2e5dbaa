use pico86_interrupts::DualPic;

/// Classic BIOS programming: vectors 0x20/0x28, cascade on IRQ2.
fn init_pics(pic: &mut DualPic) {
    pic.write_port(0x20, 0x11); // ICW1: init + ICW4
    pic.write_port(0xA0, 0x11);
    pic.write_port(0x21, 0x20); // ICW2 master: base 0x20
    pic.write_port(0xA1, 0x28); // ICW2 slave: base 0x28
    pic.write_port(0x21, 0x04); // ICW3: slave on IRQ2
    pic.write_port(0xA1, 0x02);
    pic.write_port(0x21, 0x01); // ICW4: 8086 mode
    pic.write_port(0xA1, 0x01);
    pic.write_port(0x21, 0x00); // unmask all
    pic.write_port(0xA1, 0x00);
}

#[test]
fn init_sequence_programs_vector_bases() {
    let mut pic = DualPic::new();
    init_pics(&mut pic);

    pic.set_irq(0, true);
    assert!(pic.intr_pending());
    assert_eq!(pic.acknowledge(), Some(0x20));

    pic.set_irq(8, true);
    assert_eq!(pic.acknowledge(), Some(0x28));
}

#[test]
fn masked_lines_do_not_assert() {
    let mut pic = DualPic::new();
    init_pics(&mut pic);
    pic.write_port(0x21, 0xFF); // mask everything on the master

    pic.set_irq(1, true);
    assert!(!pic.intr_pending());

    pic.write_port(0x21, 0xFD); // unmask IRQ1
    assert!(pic.intr_pending());
    assert_eq!(pic.acknowledge(), Some(0x21));
}

#[test]
fn priority_prefers_lower_irq_numbers() {
    let mut pic = DualPic::new();
    init_pics(&mut pic);

    pic.set_irq(4, true);
    pic.set_irq(1, true);
    assert_eq!(pic.acknowledge(), Some(0x21));
    // IRQ1 is now in service; IRQ4 must wait for EOI.
    assert!(!pic.intr_pending());

    pic.write_port(0x20, 0x20); // non-specific EOI
    assert!(pic.intr_pending());
    assert_eq!(pic.acknowledge(), Some(0x24));
}

#[test]
fn specific_eoi_clears_exactly_one_in_service_bit() {
    let mut pic = DualPic::new();
    init_pics(&mut pic);

    pic.set_irq(3, true);
    assert_eq!(pic.acknowledge(), Some(0x23));
    assert_eq!(pic.registers().master_isr, 0x08);

    pic.write_port(0x20, 0x60 | 3); // specific EOI for IRQ3
    assert_eq!(pic.registers().master_isr, 0x00);
}

#[test]
fn acknowledge_moves_request_to_in_service() {
    let mut pic = DualPic::new();
    init_pics(&mut pic);

    pic.set_irq(0, true);
    pic.set_irq(0, false); // edge already latched
    assert_eq!(pic.registers().master_irr & 1, 1);

    assert_eq!(pic.acknowledge(), Some(0x20));
    let regs = pic.registers();
    assert_eq!(regs.master_irr & 1, 0);
    assert_eq!(regs.master_isr & 1, 1);
}

#[test]
fn slave_interrupts_cascade_through_irq2() {
    let mut pic = DualPic::new();
    init_pics(&mut pic);

    pic.set_irq(12, true);
    assert!(pic.intr_pending());
    assert_eq!(pic.acknowledge(), Some(0x2C));

    // In service on both chips; EOI both to recover.
    assert_ne!(pic.registers().slave_isr, 0);
    pic.write_port(0xA0, 0x20);
    pic.write_port(0x20, 0x20);
    assert!(!pic.intr_pending());
}

#[test]
fn ocw3_selects_irr_or_isr_readback() {
    let mut pic = DualPic::new();
    init_pics(&mut pic);

    pic.set_irq(5, true);
    pic.write_port(0x20, 0x0A); // read IRR
    assert_eq!(pic.read_port(0x20), 0x20);

    assert_eq!(pic.acknowledge(), Some(0x25));
    pic.write_port(0x20, 0x0B); // read ISR
    assert_eq!(pic.read_port(0x20), 0x20);
}

#[test]
fn delivered_vector_is_always_the_highest_unmasked_request() {
    // The §-invariant for the aggregate: the acknowledged vector comes
    // from IRR & !IMR and outranks anything in service.
    let mut pic = DualPic::new();
    init_pics(&mut pic);

    for irq in [7u8, 5, 3] {
        pic.set_irq(irq, true);
    }
    let regs = pic.registers();
    let pending = regs.master_irr & !regs.master_imr;
    let winner = pending.trailing_zeros() as u8;
    assert_eq!(pic.acknowledge(), Some(0x20 + winner));
}

#[test]
fn auto_eoi_leaves_isr_clear() {
    let mut pic = DualPic::new();
    pic.write_port(0x20, 0x11);
    pic.write_port(0x21, 0x20);
    pic.write_port(0x21, 0x04);
    pic.write_port(0x21, 0x03); // ICW4: 8086 + auto-EOI
    pic.write_port(0x21, 0x00);

    pic.set_irq(0, true);
    pic.set_irq(0, false);
    assert_eq!(pic.acknowledge(), Some(0x20));
    assert_eq!(pic.registers().master_isr, 0);
    // A second edge delivers again without any EOI.
    pic.set_irq(0, true);
    assert_eq!(pic.acknowledge(), Some(0x20));
}
