//! Segmentation: the descriptor cache contract (base+offset with present,
//! limit and rights checks on every reference) and selector loads through
//! the GDT/LDT.

use pico86_mmu::Access;

use crate::exceptions::Exception;
use crate::mem::CpuBus;
use crate::state::{
    CpuState, SegReg, SegmentCache, SEG_ACCESS_PRESENT, SEG_ACCESS_S, SEG_FLAG_G,
    SEG_TYPE_ACCESSED, SEG_TYPE_CODE,
};

/// A granularity-expanded descriptor, decoded from its raw eight bytes.
#[derive(Clone, Copy, Debug)]
pub struct Descriptor {
    pub base: u32,
    pub limit: u32,
    pub access: u8,
    pub flags: u8,
}

impl Descriptor {
    pub fn decode(lo: u32, hi: u32) -> Self {
        let base = (lo >> 16) | ((hi & 0xFF) << 16) | (hi & 0xFF00_0000);
        let mut limit = (lo & 0xFFFF) | (hi & 0x000F_0000);
        let flags = ((hi >> 20) & 0xF) as u8;
        if flags & SEG_FLAG_G != 0 {
            limit = (limit << 12) | 0xFFF;
        }
        Self {
            base,
            limit,
            access: ((hi >> 8) & 0xFF) as u8,
            flags,
        }
    }

    pub fn dpl(&self) -> u8 {
        (self.access >> 5) & 3
    }

    pub fn present(&self) -> bool {
        self.access & SEG_ACCESS_PRESENT != 0
    }

    pub fn is_system(&self) -> bool {
        self.access & SEG_ACCESS_S == 0
    }

    pub fn is_code(&self) -> bool {
        !self.is_system() && self.access & SEG_TYPE_CODE != 0
    }

    pub fn is_writable_data(&self) -> bool {
        !self.is_system() && !self.is_code() && self.access & 0x02 != 0
    }

    pub fn is_readable(&self) -> bool {
        !self.is_system() && (!self.is_code() || self.access & 0x02 != 0)
    }

    pub fn is_conforming(&self) -> bool {
        self.is_code() && self.access & 0x04 != 0
    }

    pub fn cache(&self, selector: u16) -> SegmentCache {
        SegmentCache {
            selector,
            base: self.base,
            limit: self.limit,
            access: self.access,
            flags: self.flags,
            valid: true,
        }
    }
}

/// Error code for a selector-shaped fault: index, TI, plus EXT=0.
fn sel_error(selector: u16) -> u16 {
    selector & 0xFFFC
}

/// Reads the raw descriptor a selector names, checking the table limit.
/// Returns the two dwords and the descriptor's linear address (for accessed
/// and busy bit writeback).
pub fn read_descriptor<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    selector: u16,
) -> Result<(u32, u32, u32), Exception> {
    let index = (selector & 0xFFF8) as u32;
    let (base, limit) = if selector & 0x4 != 0 {
        let ldt = &state.tables.ldtr;
        if ldt.selector & 0xFFFC == 0 {
            return Err(Exception::GeneralProtection(sel_error(selector)));
        }
        (ldt.base, ldt.limit)
    } else {
        (state.tables.gdtr.base, state.tables.gdtr.limit)
    };
    if index + 7 > limit {
        return Err(Exception::GeneralProtection(sel_error(selector)));
    }
    let addr = base.wrapping_add(index);
    let lo = bus.read_u32(addr)?;
    let hi = bus.read_u32(addr.wrapping_add(4))?;
    Ok((lo, hi, addr))
}

fn mark_accessed<B: CpuBus>(bus: &mut B, desc_addr: u32, hi: u32) -> Result<(), Exception> {
    if hi & ((SEG_TYPE_ACCESSED as u32) << 8) == 0 {
        bus.write_u32(desc_addr.wrapping_add(4), hi | ((SEG_TYPE_ACCESSED as u32) << 8))?;
    }
    Ok(())
}

/// Loads a data/stack segment register (not CS) and refills its cache.
pub fn load_seg<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    seg: SegReg,
    selector: u16,
) -> Result<(), Exception> {
    debug_assert!(seg != SegReg::Cs, "CS loads go through far transfers");

    if !state.protected() {
        *state.segments.get_mut(seg) = SegmentCache::real_mode(selector);
        return Ok(());
    }

    if selector & 0xFFFC == 0 {
        // Null selector: legal for data segments, fatal for SS.
        if seg == SegReg::Ss {
            return Err(Exception::gp0());
        }
        *state.segments.get_mut(seg) = SegmentCache::null();
        state.segments.get_mut(seg).selector = selector;
        return Ok(());
    }

    let (lo, hi, desc_addr) = read_descriptor(state, bus, selector)?;
    let desc = Descriptor::decode(lo, hi);
    let rpl = (selector & 3) as u8;
    let cpl = state.cpl();

    if seg == SegReg::Ss {
        if rpl != cpl || desc.dpl() != cpl || !desc.is_writable_data() {
            return Err(Exception::GeneralProtection(sel_error(selector)));
        }
        if !desc.present() {
            return Err(Exception::StackFault(sel_error(selector)));
        }
    } else {
        if !desc.is_readable() {
            return Err(Exception::GeneralProtection(sel_error(selector)));
        }
        // Data and non-conforming code must satisfy DPL >= max(CPL, RPL).
        if !desc.is_conforming() && desc.dpl() < cpl.max(rpl) {
            return Err(Exception::GeneralProtection(sel_error(selector)));
        }
        if !desc.present() {
            return Err(Exception::SegmentNotPresent(sel_error(selector)));
        }
    }

    mark_accessed(bus, desc_addr, hi)?;
    *state.segments.get_mut(seg) = desc.cache(selector);
    Ok(())
}

/// Checks a reference of `width` bytes at `offset` against a segment cache
/// and returns the linear address.
pub fn linearize(
    state: &CpuState,
    seg: SegReg,
    offset: u32,
    width: u32,
    access: Access,
) -> Result<u32, Exception> {
    let cache = state.segments.get(seg);
    let stack = seg == SegReg::Ss;
    let fail = || -> Exception {
        if stack {
            Exception::StackFault(0)
        } else {
            Exception::gp0()
        }
    };

    if !cache.valid || !cache.is_present() {
        return Err(fail());
    }

    if state.protected() {
        match access {
            Access::Write => {
                if !cache.is_writable() {
                    return Err(fail());
                }
            }
            Access::Read => {
                if !cache.is_readable() {
                    return Err(fail());
                }
            }
            // Executability was established when CS was loaded; a fetch
            // through the cache only re-checks limit and presence (this is
            // what keeps big-real-mode fetches working after a mode switch).
            Access::Exec => {}
        }
    }

    let last = offset.wrapping_add(width - 1);
    if cache.is_expand_down() {
        // Valid range is (limit, upper]; upper is 64K or 4G per the B bit.
        let upper: u32 = if cache.db() { 0xFFFF_FFFF } else { 0xFFFF };
        if offset <= cache.limit || last > upper || last < offset {
            return Err(fail());
        }
    } else if last > cache.limit || last < offset {
        return Err(fail());
    }

    Ok(cache.base.wrapping_add(offset))
}

/// Data read through a segment.
pub fn read8<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    seg: SegReg,
    offset: u32,
) -> Result<u8, Exception> {
    let lin = linearize(state, seg, offset, 1, Access::Read)?;
    bus.read_u8(lin)
}

pub fn read16<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    seg: SegReg,
    offset: u32,
) -> Result<u16, Exception> {
    let lin = linearize(state, seg, offset, 2, Access::Read)?;
    bus.read_u16(lin)
}

pub fn read32<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    seg: SegReg,
    offset: u32,
) -> Result<u32, Exception> {
    let lin = linearize(state, seg, offset, 4, Access::Read)?;
    bus.read_u32(lin)
}

pub fn write8<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    seg: SegReg,
    offset: u32,
    val: u8,
) -> Result<(), Exception> {
    let lin = linearize(state, seg, offset, 1, Access::Write)?;
    bus.write_u8(lin, val)
}

pub fn write16<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    seg: SegReg,
    offset: u32,
    val: u16,
) -> Result<(), Exception> {
    let lin = linearize(state, seg, offset, 2, Access::Write)?;
    bus.write_u16(lin, val)
}

pub fn write32<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    seg: SegReg,
    offset: u32,
    val: u32,
) -> Result<(), Exception> {
    let lin = linearize(state, seg, offset, 4, Access::Write)?;
    bus.write_u32(lin, val)
}

/// Loads CS for a far control transfer (JMP/CALL/RET/IRET/interrupt entry).
/// `new_cpl` is the privilege the transfer lands at; the cached selector's
/// RPL is forced to it so the CPL==CS.RPL invariant holds.
pub fn load_cs_far<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    selector: u16,
    new_cpl: u8,
) -> Result<(), Exception> {
    if !state.protected() {
        state.segments.cs = SegmentCache::real_mode(selector);
        return Ok(());
    }
    if selector & 0xFFFC == 0 {
        return Err(Exception::gp0());
    }
    let (lo, hi, desc_addr) = read_descriptor(state, bus, selector)?;
    let desc = Descriptor::decode(lo, hi);
    if !desc.is_code() {
        return Err(Exception::GeneralProtection(sel_error(selector)));
    }
    if desc.is_conforming() {
        if desc.dpl() > new_cpl {
            return Err(Exception::GeneralProtection(sel_error(selector)));
        }
    } else if desc.dpl() != new_cpl {
        return Err(Exception::GeneralProtection(sel_error(selector)));
    }
    if !desc.present() {
        return Err(Exception::SegmentNotPresent(sel_error(selector)));
    }
    mark_accessed(bus, desc_addr, hi)?;
    let mut cache = desc.cache(selector);
    cache.selector = (selector & !3) | new_cpl as u16;
    state.segments.cs = cache;
    Ok(())
}
