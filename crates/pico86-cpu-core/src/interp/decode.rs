//! ModR/M and SIB decoding with the documented 16- and 32-bit effective
//! address rules.

use pico86_mmu::Access;

use crate::exceptions::Exception;
use crate::flags::Width;
use crate::interp::{Ctx, Fetcher};
use crate::mem::CpuBus;
use crate::seg;
use crate::state::{gpr, CpuState, SegReg};

/// Where an r/m operand lives.
#[derive(Clone, Copy, Debug)]
pub enum RmRef {
    Reg(usize),
    Mem { seg: SegReg, offset: u32 },
}

/// A decoded ModR/M byte.
#[derive(Clone, Copy, Debug)]
pub struct ModRm {
    /// The `reg` field (register number or opcode extension).
    pub reg: usize,
    pub rm: RmRef,
}

impl ModRm {
    pub fn is_mem(&self) -> bool {
        matches!(self.rm, RmRef::Mem { .. })
    }

    /// Memory operand address, for LEA and the load-far instructions.
    pub fn mem(&self) -> Result<(SegReg, u32), Exception> {
        match self.rm {
            RmRef::Mem { seg, offset } => Ok((seg, offset)),
            // Register form where memory is required.
            RmRef::Reg(_) => Err(Exception::InvalidOpcode),
        }
    }
}

pub fn modrm<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    ctx: &Ctx,
    f: &mut Fetcher,
) -> Result<ModRm, Exception> {
    let b = f.fetch8(state, bus)?;
    let md = b >> 6;
    let reg = ((b >> 3) & 7) as usize;
    let rm = (b & 7) as usize;

    if md == 3 {
        return Ok(ModRm {
            reg,
            rm: RmRef::Reg(rm),
        });
    }

    let (seg, offset) = if ctx.addrsize32 {
        ea32(state, bus, ctx, f, md, rm)?
    } else {
        ea16(state, bus, ctx, f, md, rm)?
    };
    Ok(ModRm {
        reg,
        rm: RmRef::Mem { seg, offset },
    })
}

fn ea16<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    ctx: &Ctx,
    f: &mut Fetcher,
    md: u8,
    rm: usize,
) -> Result<(SegReg, u32), Exception> {
    let g = &state.gpr;
    let (base, default_seg) = match rm {
        0 => (g[gpr::EBX].wrapping_add(g[gpr::ESI]), SegReg::Ds),
        1 => (g[gpr::EBX].wrapping_add(g[gpr::EDI]), SegReg::Ds),
        2 => (g[gpr::EBP].wrapping_add(g[gpr::ESI]), SegReg::Ss),
        3 => (g[gpr::EBP].wrapping_add(g[gpr::EDI]), SegReg::Ss),
        4 => (g[gpr::ESI], SegReg::Ds),
        5 => (g[gpr::EDI], SegReg::Ds),
        6 => {
            if md == 0 {
                let disp = f.fetch16(state, bus)? as u32;
                return Ok((ctx.seg(SegReg::Ds), disp));
            }
            (g[gpr::EBP], SegReg::Ss)
        }
        _ => (g[gpr::EBX], SegReg::Ds),
    };
    let disp = match md {
        0 => 0,
        1 => f.fetch8(state, bus)? as i8 as i32 as u32,
        _ => f.fetch16(state, bus)? as u32,
    };
    Ok((ctx.seg(default_seg), base.wrapping_add(disp) & 0xFFFF))
}

fn ea32<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    ctx: &Ctx,
    f: &mut Fetcher,
    md: u8,
    rm: usize,
) -> Result<(SegReg, u32), Exception> {
    let mut default_seg = SegReg::Ds;
    let mut base: u32;

    if rm == 4 {
        let sib = f.fetch8(state, bus)?;
        let scale = sib >> 6;
        let index = ((sib >> 3) & 7) as usize;
        let sib_base = (sib & 7) as usize;

        base = if sib_base == 5 && md == 0 {
            f.fetch32(state, bus)?
        } else {
            if sib_base == gpr::ESP || sib_base == gpr::EBP {
                default_seg = SegReg::Ss;
            }
            state.gpr[sib_base]
        };
        if index != 4 {
            base = base.wrapping_add(state.gpr[index] << scale);
        }
    } else if rm == 5 && md == 0 {
        base = f.fetch32(state, bus)?;
    } else {
        if rm == gpr::EBP {
            default_seg = SegReg::Ss;
        }
        base = state.gpr[rm];
    }

    let disp = match md {
        0 => 0,
        1 => f.fetch8(state, bus)? as i8 as i32 as u32,
        _ => f.fetch32(state, bus)?,
    };
    Ok((ctx.seg(default_seg), base.wrapping_add(disp)))
}

// --- operand access through a decoded ModR/M ---

pub fn read_rm<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    m: &ModRm,
    w: Width,
) -> Result<u32, Exception> {
    match m.rm {
        RmRef::Reg(r) => Ok(read_reg(state, r, w)),
        RmRef::Mem { seg, offset } => match w {
            Width::W8 => Ok(seg::read8(state, bus, seg, offset)? as u32),
            Width::W16 => Ok(seg::read16(state, bus, seg, offset)? as u32),
            Width::W32 => seg::read32(state, bus, seg, offset),
        },
    }
}

pub fn write_rm<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    m: &ModRm,
    w: Width,
    value: u32,
) -> Result<(), Exception> {
    match m.rm {
        RmRef::Reg(r) => {
            write_reg(state, r, w, value);
            Ok(())
        }
        RmRef::Mem { seg, offset } => match w {
            Width::W8 => seg::write8(state, bus, seg, offset, value as u8),
            Width::W16 => seg::write16(state, bus, seg, offset, value as u16),
            Width::W32 => seg::write32(state, bus, seg, offset, value),
        },
    }
}

/// Pre-checks writability of a read-modify-write destination so the read
/// half of an RMW does not succeed against a write-protected target.
pub fn check_rm_writable(state: &CpuState, m: &ModRm, w: Width) -> Result<(), Exception> {
    if let RmRef::Mem { seg, offset } = m.rm {
        let width = match w {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
        };
        seg::linearize(state, seg, offset, width, Access::Write).map(|_| ())
    } else {
        Ok(())
    }
}

pub fn read_reg(state: &CpuState, r: usize, w: Width) -> u32 {
    match w {
        Width::W8 => state.read_gpr8(r) as u32,
        Width::W16 => state.read_gpr16(r) as u32,
        Width::W32 => state.read_gpr32(r),
    }
}

pub fn write_reg(state: &mut CpuState, r: usize, w: Width, value: u32) {
    match w {
        Width::W8 => state.write_gpr8(r, value as u8),
        Width::W16 => state.write_gpr16(r, value as u16),
        Width::W32 => state.write_gpr32(r, value),
    }
}
