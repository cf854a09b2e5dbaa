//! 32-bit TSS task switching: the save/load of the whole register set used
//! by task gates, far transfers to a TSS, and IRET with NT set.

use crate::exceptions::Exception;
use crate::mem::CpuBus;
use crate::seg::{self, Descriptor};
use crate::state::{CpuState, SegReg, SegmentCache, FLAG_NT};

// 32-bit TSS field offsets.
const TSS_BACKLINK: u32 = 0;
pub const TSS_ESP0: u32 = 4;
pub const TSS_SS0: u32 = 8;
const TSS_CR3: u32 = 28;
const TSS_EIP: u32 = 32;
const TSS_EFLAGS: u32 = 36;
const TSS_GPR: u32 = 40;
const TSS_SEG: u32 = 72;
const TSS_LDT: u32 = 96;

/// Minimum limit of a valid 32-bit TSS.
pub const TSS_MIN_LIMIT: u32 = 0x67;

const TSS_TYPE_AVAIL32: u8 = 0x9;
const TSS_TYPE_BUSY32: u8 = 0xB;
const TSS_TYPE_BUSY_BIT: u8 = 0x2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskSwitchSource {
    /// JMP: old task marked available, NT not set in the new task.
    Jump,
    /// CALL or interrupt through a task gate: back link written, NT set.
    Call,
    /// IRET with NT: old task marked available, return via back link.
    Return,
}

/// Reads the outer-ring stack pointer pair from the current TSS.
pub fn ring0_stack<B: CpuBus>(state: &CpuState, bus: &mut B) -> Result<(u16, u32), Exception> {
    let tr = &state.tables.tr;
    if tr.selector & 0xFFFC == 0 || tr.limit < TSS_MIN_LIMIT {
        return Err(Exception::InvalidTss(tr.selector & 0xFFFC));
    }
    let esp0 = bus.read_u32(tr.base.wrapping_add(TSS_ESP0))?;
    let ss0 = bus.read_u16(tr.base.wrapping_add(TSS_SS0))?;
    Ok((ss0, esp0))
}

fn save_current<B: CpuBus>(state: &CpuState, bus: &mut B) -> Result<(), Exception> {
    let base = state.tables.tr.base;
    bus.write_u32(base + TSS_EIP, state.eip())?;
    bus.write_u32(base + TSS_EFLAGS, state.flags())?;
    for (i, r) in state.gpr.iter().enumerate() {
        bus.write_u32(base + TSS_GPR + (i as u32) * 4, *r)?;
    }
    let segs = [
        state.segments.es.selector,
        state.segments.cs.selector,
        state.segments.ss.selector,
        state.segments.ds.selector,
        state.segments.fs.selector,
        state.segments.gs.selector,
    ];
    for (i, s) in segs.iter().enumerate() {
        bus.write_u32(base + TSS_SEG + (i as u32) * 4, *s as u32)?;
    }
    Ok(())
}

fn set_tss_busy<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    selector: u16,
    busy: bool,
) -> Result<(), Exception> {
    let (_, hi, addr) = seg::read_descriptor(state, bus, selector)?;
    let new_hi = if busy {
        hi | ((TSS_TYPE_BUSY_BIT as u32) << 8)
    } else {
        hi & !((TSS_TYPE_BUSY_BIT as u32) << 8)
    };
    if new_hi != hi {
        bus.write_u32(addr.wrapping_add(4), new_hi)?;
    }
    Ok(())
}

/// Performs a full task switch to the TSS named by `selector`.
pub fn task_switch<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    selector: u16,
    source: TaskSwitchSource,
) -> Result<(), Exception> {
    let err_sel = selector & 0xFFFC;
    let (lo, hi, _) = seg::read_descriptor(state, bus, selector)?;
    let desc = Descriptor::decode(lo, hi);
    // Raw descriptor limit, not granularity expanded past what decode did.
    let desc_type = desc.access & 0x1F;

    match source {
        TaskSwitchSource::Return => {
            if desc_type != TSS_TYPE_BUSY32 {
                return Err(Exception::InvalidTss(err_sel));
            }
        }
        _ => {
            if desc_type != TSS_TYPE_AVAIL32 {
                return Err(Exception::GeneralProtection(err_sel));
            }
        }
    }
    if !desc.present() {
        return Err(Exception::SegmentNotPresent(err_sel));
    }
    if desc.limit < TSS_MIN_LIMIT {
        return Err(Exception::InvalidTss(err_sel));
    }

    let old_tr = state.tables.tr;

    // Save the outgoing machine state into the old TSS.
    save_current(state, bus)?;

    match source {
        TaskSwitchSource::Jump | TaskSwitchSource::Return => {
            set_tss_busy(state, bus, old_tr.selector, false)?;
        }
        TaskSwitchSource::Call => {
            bus.write_u32(desc.base + TSS_BACKLINK, old_tr.selector as u32)?;
        }
    }
    if source != TaskSwitchSource::Return {
        set_tss_busy(state, bus, selector, true)?;
    }

    // Load the incoming task.
    let new_cr3 = bus.read_u32(desc.base + TSS_CR3)?;
    let new_eip = bus.read_u32(desc.base + TSS_EIP)?;
    let mut new_flags = bus.read_u32(desc.base + TSS_EFLAGS)?;
    if source == TaskSwitchSource::Call {
        new_flags |= FLAG_NT;
    }
    let mut gpr = [0u32; 8];
    for (i, r) in gpr.iter_mut().enumerate() {
        *r = bus.read_u32(desc.base + TSS_GPR + (i as u32) * 4)?;
    }
    let mut sels = [0u16; 6];
    for (i, s) in sels.iter_mut().enumerate() {
        *s = bus.read_u32(desc.base + TSS_SEG + (i as u32) * 4)? as u16;
    }
    let ldt_sel = bus.read_u32(desc.base + TSS_LDT)? as u16;

    state.control.cr3 = new_cr3;
    state.set_eip(new_eip);
    state.set_flags(new_flags);
    state.gpr = gpr;

    state.tables.tr = crate::state::SystemSeg {
        selector,
        base: desc.base,
        limit: desc.limit,
        access: desc.access | TSS_TYPE_BUSY_BIT,
    };

    // Reload LDTR from the incoming task before any selector is resolved.
    if ldt_sel & 0xFFFC != 0 {
        let (llo, lhi, _) = seg::read_descriptor(state, bus, ldt_sel)?;
        let ldesc = Descriptor::decode(llo, lhi);
        if ldesc.access & 0x1F != 0x02 || !ldesc.present() {
            return Err(Exception::InvalidTss(ldt_sel & 0xFFFC));
        }
        state.tables.ldtr = crate::state::SystemSeg {
            selector: ldt_sel,
            base: ldesc.base,
            limit: ldesc.limit,
            access: ldesc.access,
        };
    } else {
        state.tables.ldtr = crate::state::SystemSeg::default();
    }

    // Re-check and reload every segment register from the new task image.
    let new_cpl = (sels[1] & 3) as u8;
    // CS first so CPL is right for the data-segment checks.
    state.segments.cs = SegmentCache::null();
    seg::load_cs_far(state, bus, sels[1], new_cpl).map_err(reclass_for_task_switch)?;
    seg::load_seg(state, bus, SegReg::Ss, sels[2]).map_err(reclass_for_task_switch)?;
    seg::load_seg(state, bus, SegReg::Es, sels[0]).map_err(reclass_for_task_switch)?;
    seg::load_seg(state, bus, SegReg::Ds, sels[3]).map_err(reclass_for_task_switch)?;
    seg::load_seg(state, bus, SegReg::Fs, sels[4]).map_err(reclass_for_task_switch)?;
    seg::load_seg(state, bus, SegReg::Gs, sels[5]).map_err(reclass_for_task_switch)?;

    Ok(())
}

/// Segment faults raised while loading the incoming task's registers are
/// reported as #TS so the handler can tell them from ordinary loads.
fn reclass_for_task_switch(e: Exception) -> Exception {
    match e {
        Exception::GeneralProtection(sel) => Exception::InvalidTss(sel),
        other => other,
    }
}

/// The back link read by an IRET out of a nested task.
pub fn back_link<B: CpuBus>(state: &CpuState, bus: &mut B) -> Result<u16, Exception> {
    Ok(bus.read_u16(state.tables.tr.base + TSS_BACKLINK)?)
}
