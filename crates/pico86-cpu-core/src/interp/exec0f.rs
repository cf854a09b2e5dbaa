//! Two-byte (0F-prefixed) opcode map: system instructions, Jcc/SETcc,
//! bit operations, wide moves, and the generation-gated 486/Pentium set.

use crate::exceptions::Exception;
use crate::flags::{FlagOp, Width};
use crate::interp::decode::{modrm, read_reg, read_rm, write_reg, write_rm, RmRef};
use crate::interp::exec::{alu_compute, commit_alu_flags, condition, AluOp};
use crate::interp::{Ctx, Fetcher, StepExit};
use crate::interrupts::{pop16, pop32, push16, push32, CpuCore};
use crate::mem::CpuBus;
use crate::seg::{self, Descriptor};
use crate::state::{
    gpr, CpuGeneration, SegReg, CR0_TS, FLAG_CF, FLAG_ZF,
};

pub(crate) fn dispatch<B: CpuBus>(
    cpu: &mut CpuCore,
    bus: &mut B,
    ctx: &mut Ctx,
    f: &mut Fetcher,
    opcode: u8,
) -> Result<StepExit, Exception> {
    let code32 = cpu.state.code_32();
    match opcode {
        0x00 => group6(cpu, bus, ctx, f),
        0x01 => group7(cpu, bus, ctx, f),

        // --- LAR / LSL ---
        0x02 | 0x03 => {
            if !cpu.state.protected() {
                return Err(Exception::InvalidOpcode);
            }
            let w = ctx.width();
            let m = modrm(&cpu.state, bus, ctx, f)?;
            let sel = read_rm(&cpu.state, bus, &m, Width::W16)? as u16;
            match descriptor_for_access_check(cpu, bus, sel) {
                Some(desc) => {
                    let v = if opcode == 0x02 {
                        ((desc.access as u32) << 8) | (((desc.flags as u32) & 0xF) << 20)
                    } else {
                        desc.limit
                    };
                    write_reg(&mut cpu.state, m.reg, w, v & w.mask());
                    cpu.state.set_flag(FLAG_ZF, true);
                }
                None => cpu.state.set_flag(FLAG_ZF, false),
            }
            Ok(StepExit::Continue)
        }

        // --- CLTS ---
        0x06 => {
            if cpu.state.protected() && cpu.state.cpl() != 0 {
                return Err(Exception::gp0());
            }
            cpu.state.control.cr0 &= !CR0_TS;
            Ok(StepExit::Continue)
        }

        // --- INVD / WBINVD: no cache model, privileged no-ops ---
        0x08 | 0x09 => {
            if cpu.state.protected() && cpu.state.cpl() != 0 {
                return Err(Exception::gp0());
            }
            Ok(StepExit::Continue)
        }

        0x0B => Err(Exception::InvalidOpcode),

        // --- MOV to/from CRn / DRn ---
        0x20 | 0x21 | 0x22 | 0x23 => {
            if cpu.state.protected() && cpu.state.cpl() != 0 {
                return Err(Exception::gp0());
            }
            // Always register form; the mod bits are ignored.
            let b = f.fetch8(&cpu.state, bus)?;
            let reg = ((b >> 3) & 7) as usize;
            let rm = (b & 7) as usize;
            match opcode {
                0x20 => {
                    let v = match reg {
                        0 => cpu.state.control.cr0,
                        2 => cpu.state.control.cr2,
                        3 => cpu.state.control.cr3,
                        4 => cpu.state.control.cr4,
                        _ => return Err(Exception::InvalidOpcode),
                    };
                    cpu.state.write_gpr32(rm, v);
                }
                0x22 => {
                    let v = cpu.state.read_gpr32(rm);
                    match reg {
                        0 => cpu.state.control.cr0 = v,
                        2 => cpu.state.control.cr2 = v,
                        3 => cpu.state.control.cr3 = v,
                        4 => cpu.state.control.cr4 = v,
                        _ => return Err(Exception::InvalidOpcode),
                    }
                    bus.sync_paging(&cpu.state);
                }
                0x21 => {
                    let v = cpu.state.dr[reg.min(7)];
                    cpu.state.write_gpr32(rm, v);
                }
                _ => {
                    let v = cpu.state.read_gpr32(rm);
                    cpu.state.dr[reg.min(7)] = v;
                }
            }
            Ok(StepExit::Continue)
        }

        // --- WRMSR / RDTSC / RDMSR ---
        0x30 | 0x32 => {
            if cpu.state.generation < CpuGeneration::Pentium {
                cpu.log_undefined_opcode(0x0F00 | opcode as u16);
                return Err(Exception::InvalidOpcode);
            }
            if cpu.state.protected() && cpu.state.cpl() != 0 {
                return Err(Exception::gp0());
            }
            // No MSRs are modeled; every access is a protection fault.
            Err(Exception::gp0())
        }
        0x31 => {
            if cpu.state.generation < CpuGeneration::Pentium {
                cpu.log_undefined_opcode(0x0F31);
                return Err(Exception::InvalidOpcode);
            }
            let tsc = cpu.state.instructions_retired;
            cpu.state.gpr[gpr::EAX] = tsc as u32;
            cpu.state.gpr[gpr::EDX] = (tsc >> 32) as u32;
            Ok(StepExit::Continue)
        }

        // --- Jcc rel16/32 ---
        0x80..=0x8F => {
            let disp = f.fetch_imm(&cpu.state, bus, ctx.opsize32)?;
            let disp = if ctx.opsize32 {
                disp
            } else {
                disp as u16 as i16 as i32 as u32
            };
            if condition(&cpu.state, opcode & 0xF) {
                let target = f.next_eip(code32).wrapping_add(disp);
                cpu.state
                    .set_eip(if ctx.opsize32 { target } else { target & 0xFFFF });
                return Ok(StepExit::Branch);
            }
            Ok(StepExit::Continue)
        }

        // --- SETcc ---
        0x90..=0x9F => {
            let m = modrm(&cpu.state, bus, ctx, f)?;
            let v = condition(&cpu.state, opcode & 0xF) as u32;
            write_rm(&mut cpu.state, bus, &m, Width::W8, v)?;
            Ok(StepExit::Continue)
        }

        // --- push/pop FS/GS ---
        0xA0 | 0xA8 => {
            let sel = if opcode == 0xA0 {
                cpu.state.segments.fs.selector
            } else {
                cpu.state.segments.gs.selector
            };
            if ctx.opsize32 {
                push32(&mut cpu.state, bus, sel as u32)?;
            } else {
                push16(&mut cpu.state, bus, sel)?;
            }
            Ok(StepExit::Continue)
        }
        0xA1 | 0xA9 => {
            let sel = if ctx.opsize32 {
                pop32(&mut cpu.state, bus)? as u16
            } else {
                pop16(&mut cpu.state, bus)?
            };
            let segr = if opcode == 0xA1 { SegReg::Fs } else { SegReg::Gs };
            seg::load_seg(&mut cpu.state, bus, segr, sel)?;
            Ok(StepExit::Continue)
        }

        // --- CPUID ---
        0xA2 => {
            if cpu.state.generation < CpuGeneration::Pentium {
                cpu.log_undefined_opcode(0x0FA2);
                return Err(Exception::InvalidOpcode);
            }
            cpuid(cpu);
            Ok(StepExit::Continue)
        }

        // --- bit tests ---
        0xA3 | 0xAB | 0xB3 | 0xBB => {
            let w = ctx.width();
            let m = modrm(&cpu.state, bus, ctx, f)?;
            let bit = read_reg(&cpu.state, m.reg, w);
            bit_op(cpu, bus, &m, w, bit, true, opcode)?;
            Ok(StepExit::Continue)
        }
        0xBA => {
            let w = ctx.width();
            let m = modrm(&cpu.state, bus, ctx, f)?;
            if m.reg < 4 {
                return Err(Exception::InvalidOpcode);
            }
            let bit = f.fetch8(&cpu.state, bus)? as u32;
            // Map /4../7 onto the BT/BTS/BTR/BTC opcode identities.
            let equiv = [0xA3u8, 0xAB, 0xB3, 0xBB][m.reg - 4];
            bit_op(cpu, bus, &m, w, bit, false, equiv)?;
            Ok(StepExit::Continue)
        }

        // --- SHLD / SHRD ---
        0xA4 | 0xA5 | 0xAC | 0xAD => {
            let w = ctx.width();
            let m = modrm(&cpu.state, bus, ctx, f)?;
            let count = if opcode & 1 == 0 {
                f.fetch8(&cpu.state, bus)?
            } else {
                cpu.state.read_gpr8(1)
            } & 0x1F;
            if count == 0 {
                return Ok(StepExit::Continue);
            }
            let bits = w.bits();
            if count as u32 >= bits {
                // Undefined for 16-bit; modulo behavior not modeled.
                return Ok(StepExit::Continue);
            }
            let a = read_rm(&cpu.state, bus, &m, w)? & w.mask();
            let b = read_reg(&cpu.state, m.reg, w) & w.mask();
            let c = count as u32;
            let (r, cf) = if opcode < 0xA8 {
                // SHLD: shift a left, fill from b's high bits.
                let r = ((a << c) | (b >> (bits - c))) & w.mask();
                (r, (a >> (bits - c)) & 1 != 0)
            } else {
                // SHRD: shift a right, fill from b's low bits.
                let r = ((a >> c) | (b << (bits - c))) & w.mask();
                (r, (a >> (c - 1)) & 1 != 0)
            };
            write_rm(&mut cpu.state, bus, &m, w, r)?;
            let of = ((a ^ r) & w.sign_bit()) != 0;
            cpu.state
                .set_lazy(FlagOp::Shift(w), r, cf as u32 | ((of as u32) << 1));
            Ok(StepExit::Continue)
        }

        // --- IMUL r, rm ---
        0xAF => {
            let w = ctx.width();
            let m = modrm(&cpu.state, bus, ctx, f)?;
            let a = read_reg(&cpu.state, m.reg, w);
            let b = read_rm(&cpu.state, bus, &m, w)?;
            let sx = |v: u32| -> i64 {
                match w {
                    Width::W8 => v as u8 as i8 as i64,
                    Width::W16 => v as u16 as i16 as i64,
                    Width::W32 => v as i32 as i64,
                }
            };
            let full = sx(a) * sx(b);
            let r = (full as u32) & w.mask();
            write_reg(&mut cpu.state, m.reg, w, r);
            cpu.state
                .set_lazy(FlagOp::Mul(w), r, (sx(r) != full) as u32);
            Ok(StepExit::Continue)
        }

        // --- CMPXCHG ---
        0xB0 | 0xB1 => {
            if cpu.state.generation < CpuGeneration::I486 {
                cpu.log_undefined_opcode(0x0F00 | opcode as u16);
                return Err(Exception::InvalidOpcode);
            }
            let w = if opcode == 0xB0 { Width::W8 } else { ctx.width() };
            let m = modrm(&cpu.state, bus, ctx, f)?;
            crate::interp::decode::check_rm_writable(&cpu.state, &m, w)?;
            let dst = read_rm(&cpu.state, bus, &m, w)?;
            let acc = read_reg(&cpu.state, gpr::EAX, w);
            let r = alu_compute(&cpu.state, AluOp::Sub, w, acc, dst);
            if acc & w.mask() == dst & w.mask() {
                let src = read_reg(&cpu.state, m.reg, w);
                write_rm(&mut cpu.state, bus, &m, w, src)?;
            } else {
                write_reg(&mut cpu.state, gpr::EAX, w, dst);
            }
            commit_alu_flags(&mut cpu.state, AluOp::Cmp, w, r, dst);
            Ok(StepExit::Continue)
        }

        // --- LSS / LFS / LGS ---
        0xB2 | 0xB4 | 0xB5 => {
            let m = modrm(&cpu.state, bus, ctx, f)?;
            let (s, off) = m.mem()?;
            let (offset, sel_off) = if ctx.opsize32 {
                (seg::read32(&cpu.state, bus, s, off)?, 4)
            } else {
                (seg::read16(&cpu.state, bus, s, off)? as u32, 2)
            };
            let sel = seg::read16(&cpu.state, bus, s, off.wrapping_add(sel_off))?;
            let segr = match opcode {
                0xB2 => SegReg::Ss,
                0xB4 => SegReg::Fs,
                _ => SegReg::Gs,
            };
            seg::load_seg(&mut cpu.state, bus, segr, sel)?;
            write_reg(&mut cpu.state, m.reg, ctx.width(), offset);
            if segr == SegReg::Ss {
                return Ok(StepExit::ContinueInhibitInterrupts);
            }
            Ok(StepExit::Continue)
        }

        // --- MOVZX / MOVSX ---
        0xB6 | 0xB7 | 0xBE | 0xBF => {
            let src_w = if opcode & 1 == 0 { Width::W8 } else { Width::W16 };
            let m = modrm(&cpu.state, bus, ctx, f)?;
            let v = read_rm(&cpu.state, bus, &m, src_w)?;
            let v = if opcode >= 0xBE {
                match src_w {
                    Width::W8 => v as u8 as i8 as i32 as u32,
                    _ => v as u16 as i16 as i32 as u32,
                }
            } else {
                v
            };
            write_reg(&mut cpu.state, m.reg, ctx.width(), v);
            Ok(StepExit::Continue)
        }

        // --- BSF / BSR ---
        0xBC | 0xBD => {
            let w = ctx.width();
            let m = modrm(&cpu.state, bus, ctx, f)?;
            let v = read_rm(&cpu.state, bus, &m, w)? & w.mask();
            if v == 0 {
                cpu.state.set_flag(FLAG_ZF, true);
            } else {
                let r = if opcode == 0xBC {
                    v.trailing_zeros()
                } else {
                    31 - v.leading_zeros()
                };
                write_reg(&mut cpu.state, m.reg, w, r);
                cpu.state.set_flag(FLAG_ZF, false);
            }
            Ok(StepExit::Continue)
        }

        // --- XADD ---
        0xC0 | 0xC1 => {
            if cpu.state.generation < CpuGeneration::I486 {
                cpu.log_undefined_opcode(0x0F00 | opcode as u16);
                return Err(Exception::InvalidOpcode);
            }
            let w = if opcode == 0xC0 { Width::W8 } else { ctx.width() };
            let m = modrm(&cpu.state, bus, ctx, f)?;
            crate::interp::decode::check_rm_writable(&cpu.state, &m, w)?;
            let a = read_rm(&cpu.state, bus, &m, w)?;
            let b = read_reg(&cpu.state, m.reg, w);
            let r = alu_compute(&cpu.state, AluOp::Add, w, a, b);
            write_rm(&mut cpu.state, bus, &m, w, r)?;
            write_reg(&mut cpu.state, m.reg, w, a);
            commit_alu_flags(&mut cpu.state, AluOp::Add, w, r, b);
            Ok(StepExit::Continue)
        }

        // --- CMPXCHG8B ---
        0xC7 => {
            if cpu.state.generation < CpuGeneration::Pentium {
                cpu.log_undefined_opcode(0x0FC7);
                return Err(Exception::InvalidOpcode);
            }
            let m = modrm(&cpu.state, bus, ctx, f)?;
            if m.reg != 1 || !m.is_mem() {
                return Err(Exception::InvalidOpcode);
            }
            let (s, off) = m.mem()?;
            let lo = seg::read32(&cpu.state, bus, s, off)?;
            let hi = seg::read32(&cpu.state, bus, s, off.wrapping_add(4))?;
            let edx_eax = ((cpu.state.gpr[gpr::EDX] as u64) << 32) | cpu.state.gpr[gpr::EAX] as u64;
            let mem = ((hi as u64) << 32) | lo as u64;
            if edx_eax == mem {
                seg::write32(&cpu.state, bus, s, off, cpu.state.gpr[gpr::EBX])?;
                seg::write32(
                    &cpu.state,
                    bus,
                    s,
                    off.wrapping_add(4),
                    cpu.state.gpr[gpr::ECX],
                )?;
                cpu.state.set_flag(FLAG_ZF, true);
            } else {
                cpu.state.gpr[gpr::EAX] = lo;
                cpu.state.gpr[gpr::EDX] = hi;
                cpu.state.set_flag(FLAG_ZF, false);
            }
            Ok(StepExit::Continue)
        }

        // --- BSWAP ---
        0xC8..=0xCF => {
            if cpu.state.generation < CpuGeneration::I486 {
                cpu.log_undefined_opcode(0x0F00 | opcode as u16);
                return Err(Exception::InvalidOpcode);
            }
            let r = (opcode & 7) as usize;
            cpu.state.gpr[r] = cpu.state.gpr[r].swap_bytes();
            Ok(StepExit::Continue)
        }

        _ => {
            cpu.log_undefined_opcode(0x0F00 | opcode as u16);
            Err(Exception::InvalidOpcode)
        }
    }
}

/// BT/BTS/BTR/BTC. Register-sourced bit offsets address the bit string
/// around the memory operand (signed displacement in operand units).
fn bit_op<B: CpuBus>(
    cpu: &mut CpuCore,
    bus: &mut B,
    m: &crate::interp::ModRm,
    w: Width,
    bit: u32,
    reg_sourced: bool,
    opcode: u8,
) -> Result<(), Exception> {
    let bits = w.bits();
    let target = match m.rm {
        RmRef::Reg(_) => *m,
        RmRef::Mem { seg, offset } if reg_sourced => {
            let signed = match w {
                Width::W8 => bit as u8 as i8 as i32,
                Width::W16 => bit as u16 as i16 as i32,
                Width::W32 => bit as i32,
            };
            let unit_index = signed.div_euclid(bits as i32);
            let bytes = (bits / 8) as i32;
            crate::interp::ModRm {
                reg: m.reg,
                rm: RmRef::Mem {
                    seg,
                    offset: offset.wrapping_add((unit_index * bytes) as u32),
                },
            }
        }
        RmRef::Mem { .. } => *m,
    };
    let shift = bit % bits;
    let v = read_rm(&cpu.state, bus, &target, w)?;
    let set = (v >> shift) & 1 != 0;
    let new = match opcode {
        0xAB => v | (1 << shift),
        0xB3 => v & !(1 << shift),
        0xBB => v ^ (1 << shift),
        _ => v,
    };
    if opcode != 0xA3 {
        write_rm(&mut cpu.state, bus, &target, w, new & w.mask())?;
    }
    cpu.state.set_flag(FLAG_CF, set);
    Ok(())
}

/// LAR/LSL visibility: None means ZF is cleared.
fn descriptor_for_access_check<B: CpuBus>(
    cpu: &mut CpuCore,
    bus: &mut B,
    sel: u16,
) -> Option<Descriptor> {
    if sel & 0xFFFC == 0 {
        return None;
    }
    let (lo, hi, _) = seg::read_descriptor(&cpu.state, bus, sel).ok()?;
    let desc = Descriptor::decode(lo, hi);
    if !desc.present() {
        return None;
    }
    if desc.is_system() {
        // Only LDT and TSS types participate.
        if !matches!(desc.access & 0x1F, 0x01 | 0x02 | 0x03 | 0x09 | 0x0B) {
            return None;
        }
    } else if !desc.is_conforming() {
        let cpl = cpu.state.cpl();
        let rpl = (sel & 3) as u8;
        if desc.dpl() < cpl || desc.dpl() < rpl {
            return None;
        }
    }
    Some(desc)
}

fn cpuid(cpu: &mut CpuCore) {
    let leaf = cpu.state.gpr[gpr::EAX];
    match leaf {
        0 => {
            cpu.state.gpr[gpr::EAX] = 1;
            // "GenuineIntel" in the EBX/EDX/ECX order the convention uses.
            cpu.state.gpr[gpr::EBX] = u32::from_le_bytes(*b"Genu");
            cpu.state.gpr[gpr::EDX] = u32::from_le_bytes(*b"ineI");
            cpu.state.gpr[gpr::ECX] = u32::from_le_bytes(*b"ntel");
        }
        _ => {
            // Family 5, stepping 0.
            cpu.state.gpr[gpr::EAX] = 0x0500;
            cpu.state.gpr[gpr::EBX] = 0;
            cpu.state.gpr[gpr::ECX] = 0;
            const FEAT_TSC: u32 = 1 << 4;
            const FEAT_PSE: u32 = 1 << 3;
            const FEAT_PGE: u32 = 1 << 13;
            const FEAT_CX8: u32 = 1 << 8;
            const FEAT_FPU: u32 = 1 << 0;
            let mut edx = FEAT_TSC | FEAT_PSE | FEAT_PGE | FEAT_CX8;
            if cpu.state.fpu_present {
                edx |= FEAT_FPU;
            }
            cpu.state.gpr[gpr::EDX] = edx;
        }
    }
}

// --- group 6/7: descriptor-table and system-register forms ---

fn group6<B: CpuBus>(
    cpu: &mut CpuCore,
    bus: &mut B,
    ctx: &mut Ctx,
    f: &mut Fetcher,
) -> Result<StepExit, Exception> {
    if !cpu.state.protected() {
        return Err(Exception::InvalidOpcode);
    }
    let m = modrm(&cpu.state, bus, ctx, f)?;
    match m.reg {
        0 => {
            // SLDT
            let sel = cpu.state.tables.ldtr.selector as u32;
            write_rm(&mut cpu.state, bus, &m, Width::W16, sel)?;
            Ok(StepExit::Continue)
        }
        1 => {
            let sel = cpu.state.tables.tr.selector as u32;
            write_rm(&mut cpu.state, bus, &m, Width::W16, sel)?;
            Ok(StepExit::Continue)
        }
        2 | 3 => {
            // LLDT / LTR: ring 0 only.
            if cpu.state.cpl() != 0 {
                return Err(Exception::gp0());
            }
            let sel = read_rm(&cpu.state, bus, &m, Width::W16)? as u16;
            if sel & 0xFFFC == 0 {
                if m.reg == 2 {
                    cpu.state.tables.ldtr = crate::state::SystemSeg::default();
                    return Ok(StepExit::Continue);
                }
                return Err(Exception::gp0());
            }
            if sel & 0x4 != 0 {
                return Err(Exception::GeneralProtection(sel & 0xFFFC));
            }
            let (lo, hi, desc_addr) = seg::read_descriptor(&cpu.state, bus, sel)?;
            let desc = Descriptor::decode(lo, hi);
            let want = if m.reg == 2 { 0x02 } else { 0x09 };
            if desc.access & 0x1F != want {
                return Err(Exception::GeneralProtection(sel & 0xFFFC));
            }
            if !desc.present() {
                return Err(Exception::SegmentNotPresent(sel & 0xFFFC));
            }
            let entry = crate::state::SystemSeg {
                selector: sel,
                base: desc.base,
                limit: desc.limit,
                access: desc.access,
            };
            if m.reg == 2 {
                cpu.state.tables.ldtr = entry;
            } else {
                // LTR marks the TSS busy.
                bus.write_u32(desc_addr.wrapping_add(4), hi | (0x02 << 8))?;
                cpu.state.tables.tr = entry;
                cpu.state.tables.tr.access |= 0x02;
            }
            Ok(StepExit::Continue)
        }
        4 | 5 => {
            // VERR / VERW
            let sel = read_rm(&cpu.state, bus, &m, Width::W16)? as u16;
            let ok = verify_segment(cpu, bus, sel, m.reg == 5);
            cpu.state.set_flag(FLAG_ZF, ok);
            Ok(StepExit::Continue)
        }
        _ => Err(Exception::InvalidOpcode),
    }
}

fn verify_segment<B: CpuBus>(cpu: &mut CpuCore, bus: &mut B, sel: u16, write: bool) -> bool {
    if sel & 0xFFFC == 0 {
        return false;
    }
    let Ok((lo, hi, _)) = seg::read_descriptor(&cpu.state, bus, sel) else {
        return false;
    };
    let desc = Descriptor::decode(lo, hi);
    if desc.is_system() || !desc.present() {
        return false;
    }
    if !desc.is_conforming() {
        let cpl = cpu.state.cpl();
        let rpl = (sel & 3) as u8;
        if desc.dpl() < cpl || desc.dpl() < rpl {
            return false;
        }
    }
    if write {
        desc.is_writable_data()
    } else {
        desc.is_readable()
    }
}

fn group7<B: CpuBus>(
    cpu: &mut CpuCore,
    bus: &mut B,
    ctx: &mut Ctx,
    f: &mut Fetcher,
) -> Result<StepExit, Exception> {
    let m = modrm(&cpu.state, bus, ctx, f)?;
    match m.reg {
        0 | 1 => {
            // SGDT / SIDT: 6-byte pseudo-descriptor.
            let (s, off) = m.mem()?;
            let t = if m.reg == 0 {
                cpu.state.tables.gdtr
            } else {
                cpu.state.tables.idtr
            };
            seg::write16(&cpu.state, bus, s, off, t.limit as u16)?;
            let base = if ctx.opsize32 { t.base } else { t.base & 0x00FF_FFFF };
            seg::write32(&cpu.state, bus, s, off.wrapping_add(2), base)?;
            Ok(StepExit::Continue)
        }
        2 | 3 => {
            // LGDT / LIDT: ring 0.
            if cpu.state.protected() && cpu.state.cpl() != 0 {
                return Err(Exception::gp0());
            }
            let (s, off) = m.mem()?;
            let limit = seg::read16(&cpu.state, bus, s, off)? as u32;
            let mut base = seg::read32(&cpu.state, bus, s, off.wrapping_add(2))?;
            if !ctx.opsize32 {
                base &= 0x00FF_FFFF;
            }
            let t = crate::state::DescriptorTable { base, limit };
            if m.reg == 2 {
                cpu.state.tables.gdtr = t;
            } else {
                cpu.state.tables.idtr = t;
            }
            Ok(StepExit::Continue)
        }
        4 => {
            // SMSW
            let v = cpu.state.control.cr0 & 0xFFFF;
            write_rm(&mut cpu.state, bus, &m, Width::W16, v)?;
            Ok(StepExit::Continue)
        }
        6 => {
            // LMSW: can set PE but never clear it.
            if cpu.state.protected() && cpu.state.cpl() != 0 {
                return Err(Exception::gp0());
            }
            let v = read_rm(&cpu.state, bus, &m, Width::W16)?;
            let old = cpu.state.control.cr0;
            cpu.state.control.cr0 = (old & !0xF) | (v & 0xE) | ((old | v) & 1);
            bus.sync_paging(&cpu.state);
            Ok(StepExit::Continue)
        }
        7 => {
            // INVLPG
            if cpu.state.protected() && cpu.state.cpl() != 0 {
                return Err(Exception::gp0());
            }
            let (seg_r, off) = m.mem()?;
            let base = cpu.state.segments.get(seg_r).base;
            bus.invlpg(base.wrapping_add(off));
            Ok(StepExit::Continue)
        }
        _ => Err(Exception::InvalidOpcode),
    }
}
