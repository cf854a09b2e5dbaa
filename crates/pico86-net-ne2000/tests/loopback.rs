//! Transmit/receive behavior against a host shim that echoes frames.

use std::cell::RefCell;
use std::rc::Rc;

use pico86_net_ne2000::{Ne2000, NetBackend, PMEM_START};

const MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

struct CaptureBackend {
    frames: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl NetBackend for CaptureBackend {
    fn transmit(&mut self, frame: &[u8]) {
        self.frames.borrow_mut().push(frame.to_vec());
    }
}

/// Programs the ring and enables receive the way real drivers do.
fn start_card(ne: &mut Ne2000) {
    ne.write_reg(0x00, 0x21); // page 0, STOP
    ne.write_reg(0x0E, 0x49); // DCR: word-wide, FIFO
    ne.write_reg(0x01, 0x46); // PSTART
    ne.write_reg(0x02, 0x80); // PSTOP
    ne.write_reg(0x03, 0x46); // BOUNDARY
    ne.write_reg(0x0C, 0x04); // RCR: accept broadcast
    ne.write_reg(0x0F, 0x3F); // IMR: all events
    ne.write_reg(0x00, 0x61); // page 1
    ne.write_reg(0x07, 0x47); // CURR
    ne.write_reg(0x00, 0x22); // page 0, START
}

/// Writes a frame into card memory via remote DMA at `addr`.
fn dma_write(ne: &mut Ne2000, addr: u16, data: &[u8]) {
    ne.write_reg(0x08, addr as u8);
    ne.write_reg(0x09, (addr >> 8) as u8);
    ne.write_reg(0x0A, data.len() as u8);
    ne.write_reg(0x0B, (data.len() >> 8) as u8);
    ne.write_reg(0x00, 0x12); // remote write, START
    for pair in data.chunks(2) {
        let word = pair[0] as u16 | ((*pair.get(1).unwrap_or(&0) as u16) << 8);
        ne.data_write(word);
    }
}

fn build_frame() -> Vec<u8> {
    let mut frame = vec![0xFF; 6]; // broadcast destination
    frame.extend_from_slice(&MAC);
    frame.extend_from_slice(&[0x08, 0x00]);
    while frame.len() < 64 {
        frame.push(frame.len() as u8);
    }
    frame
}

#[test]
fn transmit_hands_the_exact_frame_to_the_backend_and_sets_ptx() {
    let frames = Rc::new(RefCell::new(Vec::new()));
    let mut ne = Ne2000::new(MAC);
    ne.set_backend(Box::new(CaptureBackend {
        frames: frames.clone(),
    }));
    start_card(&mut ne);

    let frame = build_frame();
    dma_write(&mut ne, 0x4000, &frame);
    // RDC must have fired for the completed remote DMA.
    assert_ne!(ne.read_reg(0x07) & 0x40, 0, "ISR.RDC after DMA");

    ne.write_reg(0x04, 0x40); // TPSR = 0x40
    ne.write_reg(0x05, frame.len() as u8); // TBCR lo
    ne.write_reg(0x06, 0); // TBCR hi
    ne.write_reg(0x00, 0x26); // TRANSMIT | START

    assert_eq!(&*frames.borrow(), &[frame]);
    assert_ne!(ne.read_reg(0x07) & 0x02, 0, "ISR.PTX set");
    assert!(ne.irq_level(), "IRQ line asserted while ISR & IMR != 0");
    assert_eq!(ne.read_reg(0x04) & 0x01, 0x01, "TSR reports PTX");
}

#[test]
fn echoed_frame_lands_in_the_ring_with_a_header_and_prx() {
    let mut ne = Ne2000::new(MAC);
    start_card(&mut ne);
    // Clear the DMA/transmit residue so only PRX remains visible.
    ne.write_reg(0x07, 0x7F);

    let frame = build_frame();
    assert!(ne.can_receive());
    ne.receive(&frame);

    assert_ne!(ne.read_reg(0x07) & 0x01, 0, "ISR.PRX set");
    assert!(ne.irq_level());

    // The packet starts at CURR (0x47) with the 4-byte ring header.
    let base = 0x4700;
    let ring = ne.ring().to_vec();
    let total_len = frame.len() + 4;
    assert_eq!(ring[base] & 0x01, 0x01, "status: RX ok");
    assert_eq!(ring[base + 2] as usize, total_len & 0xFF);
    assert_eq!(ring[base + 3] as usize, total_len >> 8);
    assert_eq!(&ring[base + 4..base + 4 + frame.len()], &frame[..]);

    // CURR advanced past the packet, page aligned.
    ne.write_reg(0x00, 0x62); // page 1
    let curr = ne.read_reg(0x07);
    assert_eq!(curr, ring[base + 1], "header next pointer matches CURR");
}

#[test]
fn unicast_filter_matches_only_the_programmed_mac() {
    let mut ne = Ne2000::new(MAC);
    start_card(&mut ne);
    ne.write_reg(0x07, 0x7F);

    let mut other = build_frame();
    other[..6].copy_from_slice(&[0x10, 0x22, 0x33, 0x44, 0x55, 0x66]);
    ne.receive(&other);
    assert_eq!(ne.read_reg(0x07) & 0x01, 0, "foreign unicast dropped");

    let mut ours = build_frame();
    ours[..6].copy_from_slice(&MAC);
    ne.receive(&ours);
    assert_ne!(ne.read_reg(0x07) & 0x01, 0, "own MAC accepted");
}

#[test]
fn broadcast_requires_the_rcr_bit() {
    let mut ne = Ne2000::new(MAC);
    start_card(&mut ne);
    ne.write_reg(0x0C, 0x00); // RCR: no broadcast
    ne.write_reg(0x07, 0x7F);

    ne.receive(&build_frame());
    assert_eq!(ne.read_reg(0x07) & 0x01, 0);

    ne.write_reg(0x0C, 0x04);
    ne.receive(&build_frame());
    assert_ne!(ne.read_reg(0x07) & 0x01, 0);
}

#[test]
fn remote_dma_roundtrips_through_card_memory() {
    let mut ne = Ne2000::new(MAC);
    start_card(&mut ne);

    let data: Vec<u8> = (0..32).collect();
    dma_write(&mut ne, PMEM_START as u16, &data);

    // Read it back through the data port.
    ne.write_reg(0x08, 0x00);
    ne.write_reg(0x09, (PMEM_START >> 8) as u8);
    ne.write_reg(0x0A, data.len() as u8);
    ne.write_reg(0x0B, 0);
    ne.write_reg(0x00, 0x0A); // remote read, START

    let mut got = Vec::new();
    for _ in 0..data.len() / 2 {
        let w = ne.data_read();
        got.push(w as u8);
        got.push((w >> 8) as u8);
    }
    assert_eq!(got, data);
}

#[test]
fn zero_length_remote_dma_completes_immediately() {
    let mut ne = Ne2000::new(MAC);
    start_card(&mut ne);
    ne.write_reg(0x07, 0x7F); // clear ISR

    ne.write_reg(0x0A, 0);
    ne.write_reg(0x0B, 0);
    ne.write_reg(0x00, 0x0A); // remote read with RBCR == 0
    assert_ne!(ne.read_reg(0x07) & 0x40, 0, "RDC on zero-length transfer");
}

#[test]
fn isr_bits_are_write_one_to_clear_and_gate_the_irq() {
    let mut ne = Ne2000::new(MAC);
    start_card(&mut ne);
    ne.write_reg(0x07, 0x7F);
    ne.receive(&build_frame());
    assert!(ne.irq_level());

    ne.write_reg(0x0F, 0x00); // mask everything
    assert!(!ne.irq_level());

    ne.write_reg(0x0F, 0x3F);
    assert!(ne.irq_level());
    ne.write_reg(0x07, 0x01); // ack PRX
    assert!(!ne.irq_level());
}

#[test]
fn physical_address_registers_roundtrip() {
    let mut ne = Ne2000::new(MAC);
    start_card(&mut ne);
    ne.write_reg(0x00, 0x61); // page 1
    for (i, b) in MAC.iter().enumerate() {
        ne.write_reg(0x01 + i as u8, *b);
    }
    for (i, b) in MAC.iter().enumerate() {
        assert_eq!(ne.read_reg(0x01 + i as u8), *b);
    }
}
