//! Differential property: materializing EFLAGS right after an arithmetic
//! opcode must equal an eager reference computation of the six bits.

#![cfg(not(target_arch = "wasm32"))]

use pico86_cpu_core::interp::step;
use pico86_cpu_core::mem::FlatTestBus;
use pico86_cpu_core::state::{
    gpr, CpuMode, ARITH_FLAGS, FLAG_AF, FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF,
};
use pico86_cpu_core::CpuCore;
use proptest::prelude::*;

fn exec_flags(code: &[u8], eax: u32, ebx: u32, carry_in: bool) -> (u32, u32) {
    let mut bus = FlatTestBus::new(0x10000);
    let mut cpu = CpuCore::new(CpuMode::Protected);
    cpu.state.set_eip(0x1000);
    cpu.state.gpr[gpr::EAX] = eax;
    cpu.state.gpr[gpr::EBX] = ebx;
    cpu.state.set_flags(if carry_in { FLAG_CF } else { 0 });
    bus.load(0x1000, code);
    step(&mut cpu, &mut bus).expect("alu op");
    (cpu.state.flags() & ARITH_FLAGS, cpu.state.gpr[gpr::EAX])
}

fn parity(b: u8) -> u32 {
    if b.count_ones() % 2 == 0 {
        FLAG_PF
    } else {
        0
    }
}

/// Eager 32-bit ADD/ADC reference.
fn reference_add(a: u32, b: u32, cin: bool) -> (u32, u32) {
    let wide = a as u64 + b as u64 + cin as u64;
    let r = wide as u32;
    let mut f = 0;
    if wide > u32::MAX as u64 {
        f |= FLAG_CF;
    }
    if (!(a ^ b) & (a ^ r)) & 0x8000_0000 != 0 {
        f |= FLAG_OF;
    }
    if (a ^ b ^ r) & 0x10 != 0 {
        f |= FLAG_AF;
    }
    if r == 0 {
        f |= FLAG_ZF;
    }
    if r & 0x8000_0000 != 0 {
        f |= FLAG_SF;
    }
    f |= parity(r as u8);
    (f, r)
}

fn reference_sub(a: u32, b: u32, cin: bool) -> (u32, u32) {
    let r = a.wrapping_sub(b).wrapping_sub(cin as u32);
    let mut f = 0;
    if (a as u64) < b as u64 + cin as u64 {
        f |= FLAG_CF;
    }
    if ((a ^ b) & (a ^ r)) & 0x8000_0000 != 0 {
        f |= FLAG_OF;
    }
    if (a ^ b ^ r) & 0x10 != 0 {
        f |= FLAG_AF;
    }
    if r == 0 {
        f |= FLAG_ZF;
    }
    if r & 0x8000_0000 != 0 {
        f |= FLAG_SF;
    }
    f |= parity(r as u8);
    (f, r)
}

fn reference_logic(r: u32) -> u32 {
    let mut f = 0;
    if r == 0 {
        f |= FLAG_ZF;
    }
    if r & 0x8000_0000 != 0 {
        f |= FLAG_SF;
    }
    f | parity(r as u8)
}

proptest! {
    #[test]
    fn add_matches_eager_reference(a in any::<u32>(), b in any::<u32>()) {
        // add eax, ebx
        let (flags, result) = exec_flags(&[0x01, 0xD8], a, b, false);
        let (ref_flags, ref_result) = reference_add(a, b, false);
        prop_assert_eq!(result, ref_result);
        prop_assert_eq!(flags, ref_flags);
    }

    #[test]
    fn adc_matches_eager_reference(a in any::<u32>(), b in any::<u32>(), c in any::<bool>()) {
        // adc eax, ebx
        let (flags, result) = exec_flags(&[0x11, 0xD8], a, b, c);
        let (ref_flags, ref_result) = reference_add(a, b, c);
        prop_assert_eq!(result, ref_result);
        prop_assert_eq!(flags, ref_flags);
    }

    #[test]
    fn sub_matches_eager_reference(a in any::<u32>(), b in any::<u32>()) {
        // sub eax, ebx
        let (flags, result) = exec_flags(&[0x29, 0xD8], a, b, false);
        let (ref_flags, ref_result) = reference_sub(a, b, false);
        prop_assert_eq!(result, ref_result);
        prop_assert_eq!(flags, ref_flags);
    }

    #[test]
    fn sbb_matches_eager_reference(a in any::<u32>(), b in any::<u32>(), c in any::<bool>()) {
        // sbb eax, ebx
        let (flags, result) = exec_flags(&[0x19, 0xD8], a, b, c);
        let (ref_flags, ref_result) = reference_sub(a, b, c);
        prop_assert_eq!(result, ref_result);
        prop_assert_eq!(flags, ref_flags);
    }

    #[test]
    fn cmp_sets_flags_without_writing(a in any::<u32>(), b in any::<u32>()) {
        // cmp eax, ebx
        let (flags, result) = exec_flags(&[0x39, 0xD8], a, b, false);
        let (ref_flags, _) = reference_sub(a, b, false);
        prop_assert_eq!(result, a, "CMP must not write its destination");
        prop_assert_eq!(flags, ref_flags);
    }

    #[test]
    fn logic_ops_clear_cf_of_af(a in any::<u32>(), b in any::<u32>(), cin in any::<bool>()) {
        // xor eax, ebx
        let (flags, result) = exec_flags(&[0x31, 0xD8], a, b, cin);
        prop_assert_eq!(result, a ^ b);
        prop_assert_eq!(flags, reference_logic(a ^ b));
    }

    #[test]
    fn inc_keeps_cf_and_computes_the_rest(a in any::<u32>(), cin in any::<bool>()) {
        // inc eax
        let (flags, result) = exec_flags(&[0x40], a, 0, cin);
        let r = a.wrapping_add(1);
        prop_assert_eq!(result, r);
        let mut expect = if cin { FLAG_CF } else { 0 };
        if r == 0x8000_0000 {
            expect |= FLAG_OF;
        }
        if r & 0xF == 0 {
            expect |= FLAG_AF;
        }
        if r == 0 {
            expect |= FLAG_ZF;
        }
        if r & 0x8000_0000 != 0 {
            expect |= FLAG_SF;
        }
        expect |= parity(r as u8);
        prop_assert_eq!(flags, expect);
    }

    #[test]
    fn shl_matches_eager_reference(a in any::<u32>(), count in 1u32..32) {
        // shl eax, imm8
        let (flags, result) = exec_flags(&[0xC1, 0xE0, count as u8], a, 0, false);
        let r = a << count;
        prop_assert_eq!(result, r);
        let cf = (a >> (32 - count)) & 1 != 0;
        prop_assert_eq!(flags & FLAG_CF != 0, cf);
        prop_assert_eq!(flags & FLAG_ZF != 0, r == 0);
        prop_assert_eq!(flags & FLAG_SF != 0, r & 0x8000_0000 != 0);
        prop_assert_eq!(flags & FLAG_PF != 0, (r as u8).count_ones() % 2 == 0);
    }

    #[test]
    fn neg_borrows_unless_zero(a in any::<u32>()) {
        // neg eax
        let (flags, result) = exec_flags(&[0xF7, 0xD8], a, 0, false);
        prop_assert_eq!(result, a.wrapping_neg());
        prop_assert_eq!(flags & FLAG_CF != 0, a != 0);
        prop_assert_eq!(flags & FLAG_ZF != 0, a == 0);
    }
}
