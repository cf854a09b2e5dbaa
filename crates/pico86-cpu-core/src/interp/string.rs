//! String operations (MOVS/CMPS/STOS/LODS/SCAS, INS/OUTS) with REP
//! handling.
//!
//! A REP runs in bounded chunks: if the count has not reached zero after a
//! chunk, EIP is left at the instruction so it resumes on the next step,
//! which keeps external interrupts deliverable mid-copy. REP with a zero
//! count performs no access and leaves flags untouched.

use crate::exceptions::Exception;
use crate::flags::{FlagOp, Width};
use crate::interp::{Ctx, Rep, StepExit};
use crate::interrupts::CpuCore;
use crate::mem::CpuBus;
use crate::seg;
use crate::state::{gpr, CpuState, SegReg, FLAG_DF};

/// Iterations executed per step before yielding to the event loop.
const REP_CHUNK: u32 = 4096;

fn elem_width(opcode: u8, ctx: &Ctx) -> Width {
    if opcode & 1 == 0 {
        Width::W8
    } else {
        ctx.width()
    }
}

fn elem_size(w: Width) -> u32 {
    match w {
        Width::W8 => 1,
        Width::W16 => 2,
        Width::W32 => 4,
    }
}

fn index(state: &CpuState, r: usize, addr32: bool) -> u32 {
    if addr32 {
        state.gpr[r]
    } else {
        state.gpr[r] & 0xFFFF
    }
}

fn advance(state: &mut CpuState, r: usize, addr32: bool, delta: u32) {
    let step = if state.flag(FLAG_DF) {
        delta.wrapping_neg()
    } else {
        delta
    };
    if addr32 {
        state.gpr[r] = state.gpr[r].wrapping_add(step);
    } else {
        let v = (state.gpr[r] as u16).wrapping_add(step as u16);
        state.gpr[r] = (state.gpr[r] & 0xFFFF_0000) | v as u32;
    }
}

fn count(state: &CpuState, addr32: bool) -> u32 {
    index(state, gpr::ECX, addr32)
}

fn dec_count(state: &mut CpuState, addr32: bool) {
    if addr32 {
        state.gpr[gpr::ECX] = state.gpr[gpr::ECX].wrapping_sub(1);
    } else {
        let v = (state.gpr[gpr::ECX] as u16).wrapping_sub(1);
        state.gpr[gpr::ECX] = (state.gpr[gpr::ECX] & 0xFFFF_0000) | v as u32;
    }
}

fn read_elem<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    s: SegReg,
    off: u32,
    w: Width,
) -> Result<u32, Exception> {
    match w {
        Width::W8 => Ok(seg::read8(state, bus, s, off)? as u32),
        Width::W16 => Ok(seg::read16(state, bus, s, off)? as u32),
        Width::W32 => seg::read32(state, bus, s, off),
    }
}

fn write_elem<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    s: SegReg,
    off: u32,
    w: Width,
    v: u32,
) -> Result<(), Exception> {
    match w {
        Width::W8 => seg::write8(state, bus, s, off, v as u8),
        Width::W16 => seg::write16(state, bus, s, off, v as u16),
        Width::W32 => seg::write32(state, bus, s, off, v),
    }
}

pub(crate) fn string_op<B: CpuBus>(
    cpu: &mut CpuCore,
    bus: &mut B,
    ctx: &Ctx,
    opcode: u8,
) -> Result<StepExit, Exception> {
    let w = elem_width(opcode, ctx);
    let size = elem_size(w);
    let a32 = ctx.addrsize32;
    let src_seg = ctx.seg(SegReg::Ds);
    let rep = ctx.rep;

    if rep.is_some() && count(&cpu.state, a32) == 0 {
        return Ok(StepExit::Continue);
    }

    let mut iterations = if rep.is_some() { REP_CHUNK } else { 1 };
    loop {
        let state = &mut cpu.state;
        match opcode & 0x0F {
            // MOVS
            0x4 | 0x5 => {
                let v = read_elem(state, bus, src_seg, index(state, gpr::ESI, a32), w)?;
                write_elem(state, bus, SegReg::Es, index(state, gpr::EDI, a32), w, v)?;
                advance(state, gpr::ESI, a32, size);
                advance(state, gpr::EDI, a32, size);
            }
            // CMPS: src - dst, flags like SUB.
            0x6 | 0x7 => {
                let a = read_elem(state, bus, src_seg, index(state, gpr::ESI, a32), w)?;
                let b = read_elem(state, bus, SegReg::Es, index(state, gpr::EDI, a32), w)?;
                let r = a.wrapping_sub(b) & w.mask();
                state.set_lazy(FlagOp::Sub(w), r, b & w.mask());
                advance(state, gpr::ESI, a32, size);
                advance(state, gpr::EDI, a32, size);
            }
            // STOS
            0xA | 0xB => {
                let v = crate::interp::decode::read_reg(state, gpr::EAX, w);
                write_elem(state, bus, SegReg::Es, index(state, gpr::EDI, a32), w, v)?;
                advance(state, gpr::EDI, a32, size);
            }
            // LODS
            0xC | 0xD => {
                let v = read_elem(state, bus, src_seg, index(state, gpr::ESI, a32), w)?;
                crate::interp::decode::write_reg(state, gpr::EAX, w, v);
                advance(state, gpr::ESI, a32, size);
            }
            // SCAS: eAX - [ES:DI].
            _ => {
                let a = crate::interp::decode::read_reg(state, gpr::EAX, w);
                let b = read_elem(state, bus, SegReg::Es, index(state, gpr::EDI, a32), w)?;
                let r = a.wrapping_sub(b) & w.mask();
                state.set_lazy(FlagOp::Sub(w), r, b & w.mask());
                advance(state, gpr::EDI, a32, size);
            }
        }

        let Some(rep_kind) = rep else {
            return Ok(StepExit::Continue);
        };
        dec_count(&mut cpu.state, a32);
        if count(&cpu.state, a32) == 0 {
            return Ok(StepExit::Continue);
        }
        // REPZ/REPNZ termination applies to CMPS and SCAS only.
        if matches!(opcode & 0x0F, 0x6 | 0x7 | 0xE | 0xF) {
            let zf = cpu.state.zf();
            let stop = match rep_kind {
                Rep::Repz => !zf,
                Rep::Repnz => zf,
            };
            if stop {
                return Ok(StepExit::Continue);
            }
        }
        iterations -= 1;
        if iterations == 0 {
            // Yield with EIP still at this instruction; it re-enters with
            // the updated registers after the next event sample.
            return Ok(StepExit::Branch);
        }
    }
}

pub(crate) fn ins_outs<B: CpuBus>(
    cpu: &mut CpuCore,
    bus: &mut B,
    ctx: &Ctx,
    opcode: u8,
) -> Result<StepExit, Exception> {
    let w = elem_width(opcode, ctx);
    let size = elem_size(w);
    let a32 = ctx.addrsize32;
    let rep = ctx.rep;
    let port = cpu.state.read_gpr16(gpr::EDX);

    if rep.is_some() && count(&cpu.state, a32) == 0 {
        return Ok(StepExit::Continue);
    }

    let mut iterations = if rep.is_some() { REP_CHUNK } else { 1 };
    loop {
        let state = &mut cpu.state;
        if opcode & 2 == 0 {
            // INS: port -> ES:DI.
            let v = bus.io_read(port, size as u8)?;
            write_elem(state, bus, SegReg::Es, index(state, gpr::EDI, a32), w, v)?;
            advance(state, gpr::EDI, a32, size);
        } else {
            // OUTS: DS:SI -> port.
            let v = read_elem(state, bus, ctx.seg(SegReg::Ds), index(state, gpr::ESI, a32), w)?;
            bus.io_write(port, size as u8, v)?;
            advance(state, gpr::ESI, a32, size);
        }

        if rep.is_none() {
            return Ok(StepExit::Continue);
        }
        dec_count(&mut cpu.state, a32);
        if count(&cpu.state, a32) == 0 {
            return Ok(StepExit::Continue);
        }
        iterations -= 1;
        if iterations == 0 {
            return Ok(StepExit::Branch);
        }
    }
}
