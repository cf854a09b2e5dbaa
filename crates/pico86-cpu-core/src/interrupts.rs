//! Event delivery: faults, traps, software interrupts and external
//! interrupts, through the IVT or IDT, with double/triple-fault escalation.

use std::collections::VecDeque;

use crate::exceptions::{Exception, FaultClass};
use crate::interp;
use crate::mem::CpuBus;
use crate::seg::{self, Descriptor};
use crate::state::{
    CpuMode, CpuState, SegReg, FLAG_IF, FLAG_NT, FLAG_RF, FLAG_TF,
};
use crate::tss::{self, TaskSwitchSource};

/// Reasons the CPU core stops cooperating entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuExit {
    /// A fault occurred while delivering a double fault: machine reset.
    TripleFault,
}

/// A device aggregate (the PIC) the core acknowledges vectors from.
pub trait InterruptController {
    fn poll_interrupt(&mut self) -> Option<u8>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EventKind {
    /// External (hardware) interrupt: no DPL check, EXT=1 in error codes.
    External,
    /// INT n / INT3 / INTO: gate DPL checked against CPL.
    Software,
    /// Exception: no DPL check, EXT semantics.
    Exception,
}

#[derive(Clone, Copy, Debug)]
struct PendingFault {
    exception: Exception,
}

/// The pending-event word sampled at every instruction boundary.
#[derive(Debug, Default)]
pub struct PendingEvents {
    pub external_interrupts: VecDeque<u8>,
    fault: Option<PendingFault>,
    software: Option<(u8, u32)>,
    /// STI / MOV SS shadow: one instruction must retire before external
    /// interrupts are sampled again.
    interrupt_shadow: bool,
}

impl PendingEvents {
    pub fn inject_external_interrupt(&mut self, vector: u8) {
        self.external_interrupts.push_back(vector);
    }

    /// Queues a software interrupt; `return_eip` is the address pushed for
    /// IRET (the instruction after INT n).
    pub fn raise_software_interrupt(&mut self, vector: u8, return_eip: u32) {
        self.software = Some((vector, return_eip));
    }

    /// Records a fault. For faults EIP has already been rewound to the
    /// faulting instruction; #PF latches CR2 here.
    pub fn raise_exception_fault(&mut self, state: &mut CpuState, exception: Exception) {
        if let Exception::PageFault { addr, .. } = exception {
            state.control.cr2 = addr;
        }
        self.fault = Some(PendingFault { exception });
    }

    pub fn inhibit_interrupts_for_one_instruction(&mut self) {
        self.interrupt_shadow = true;
    }

    pub fn retire_instruction(&mut self) {
        self.interrupt_shadow = false;
    }

    pub fn shadow_active(&self) -> bool {
        self.interrupt_shadow
    }

    pub fn has_event(&self) -> bool {
        self.fault.is_some() || self.software.is_some() || !self.external_interrupts.is_empty()
    }
}

pub struct CpuCore {
    pub state: CpuState,
    pub pending: PendingEvents,
    /// Real-mode interrupt vectors intercepted by the embedder (the disk
    /// BIOS hook) instead of dispatching through the IVT.
    hooked_vectors: [bool; 256],
    /// Bitmap over opcodes already reported as unimplemented, so each is
    /// logged once.
    ud_logged: [u64; 64],
}

impl CpuCore {
    pub fn new(mode: CpuMode) -> Self {
        Self {
            state: CpuState::new(mode),
            pending: PendingEvents::default(),
            hooked_vectors: [false; 256],
            ud_logged: [0; 64],
        }
    }

    /// Logs an unimplemented/undefined opcode the first time it is seen.
    /// Two-byte opcodes are keyed as 0x0Fxx.
    pub(crate) fn log_undefined_opcode(&mut self, opcode: u16) {
        let idx = (opcode as usize) & 0xFFF;
        let (word, bit) = (idx / 64, idx % 64);
        if self.ud_logged[word] & (1 << bit) == 0 {
            self.ud_logged[word] |= 1 << bit;
            tracing::warn!(
                opcode = format_args!("{opcode:#06x}"),
                eip = format_args!("{:#010x}", self.state.eip()),
                "undefined or unimplemented opcode, raising #UD"
            );
        }
    }

    pub fn reset(&mut self) {
        self.state.reset();
        self.pending = PendingEvents::default();
    }

    pub fn hook_vector(&mut self, vector: u8, hooked: bool) {
        self.hooked_vectors[vector as usize] = hooked;
    }

    pub(crate) fn vector_hooked(&self, vector: u8) -> bool {
        self.hooked_vectors[vector as usize] && !self.state.protected()
    }

    /// Executes one instruction, delivering any fault it raises. Faults
    /// rewind EIP to the instruction start before delivery; traps keep the
    /// advanced EIP.
    pub fn step<B: CpuBus>(&mut self, bus: &mut B) -> Result<interp::StepExit, CpuExit> {
        let eip0 = self.state.eip();
        match interp::step(self, bus) {
            Ok(interp::StepExit::ContinueInhibitInterrupts) => {
                self.state.instructions_retired += 1;
                self.pending.inhibit_interrupts_for_one_instruction();
                Ok(interp::StepExit::ContinueInhibitInterrupts)
            }
            Ok(exit) => {
                self.state.instructions_retired += 1;
                self.pending.retire_instruction();
                Ok(exit)
            }
            Err(e) => {
                if !e.is_trap() {
                    self.state.set_eip(eip0);
                }
                self.pending.retire_instruction();
                self.pending.raise_exception_fault(&mut self.state, e);
                self.deliver_pending_event(bus)?;
                Ok(interp::StepExit::Branch)
            }
        }
    }

    /// Delivers the queued fault or software interrupt, escalating nested
    /// delivery faults per the contributory rules.
    pub fn deliver_pending_event<B: CpuBus>(&mut self, bus: &mut B) -> Result<(), CpuExit> {
        if let Some(pf) = self.pending.fault.take() {
            return self.deliver_fault_chain(bus, pf.exception);
        }
        if let Some((vector, return_eip)) = self.pending.software.take() {
            let saved_eip = self.state.eip();
            self.state.set_eip(return_eip);
            if let Err(e) = self.dispatch(bus, vector, EventKind::Software, None) {
                // A failed software INT is a fault on the INT instruction.
                self.state.set_eip(saved_eip);
                self.pending.raise_exception_fault(&mut self.state, e);
                return self.deliver_pending_event(bus);
            }
        }
        Ok(())
    }

    fn deliver_fault_chain<B: CpuBus>(
        &mut self,
        bus: &mut B,
        exception: Exception,
    ) -> Result<(), CpuExit> {
        match self.dispatch(bus, exception.vector(), EventKind::Exception, exception.error_code()) {
            Ok(()) => Ok(()),
            Err(nested) => {
                if exception == Exception::DoubleFault {
                    return Err(CpuExit::TripleFault);
                }
                if let Exception::PageFault { addr, .. } = nested {
                    self.state.control.cr2 = addr;
                }
                let escalate = matches!(
                    (exception.class(), nested.class()),
                    (FaultClass::Contributory, FaultClass::Contributory)
                        | (FaultClass::Page, FaultClass::Contributory)
                        | (FaultClass::Page, FaultClass::Page)
                );
                if escalate {
                    self.deliver_fault_chain(bus, Exception::DoubleFault)
                } else {
                    self.deliver_fault_chain(bus, nested)
                }
            }
        }
    }

    /// External interrupt path: delivers the front of the queue when IF is
    /// set and no shadow is active. Wakes a halted CPU.
    pub fn deliver_external_interrupt<B: CpuBus>(&mut self, bus: &mut B) -> Result<(), CpuExit> {
        if self.pending.shadow_active() || !self.state.flag(FLAG_IF) {
            return Ok(());
        }
        let Some(vector) = self.pending.external_interrupts.pop_front() else {
            return Ok(());
        };
        self.state.halted = false;
        if let Err(e) = self.dispatch(bus, vector, EventKind::External, None) {
            self.pending.raise_exception_fault(&mut self.state, e);
            return self.deliver_pending_event(bus);
        }
        Ok(())
    }

    /// Samples the interrupt controller at an instruction boundary:
    /// already-queued vectors win, then the controller is acknowledged.
    pub fn poll_and_deliver_external_interrupt<B: CpuBus, C: InterruptController>(
        &mut self,
        bus: &mut B,
        ctrl: &mut C,
    ) -> Result<(), CpuExit> {
        if self.pending.shadow_active() || !self.state.flag(FLAG_IF) {
            return Ok(());
        }
        if self.pending.external_interrupts.is_empty() {
            if let Some(vector) = ctrl.poll_interrupt() {
                self.pending.inject_external_interrupt(vector);
            }
        }
        self.deliver_external_interrupt(bus)
    }

    /// Software interrupt entry used by INT n / INT3 / INTO execution.
    pub(crate) fn software_interrupt<B: CpuBus>(
        &mut self,
        bus: &mut B,
        vector: u8,
    ) -> Result<(), Exception> {
        self.dispatch(bus, vector, EventKind::Software, None)
    }

    // --- delivery machinery ---

    fn dispatch<B: CpuBus>(
        &mut self,
        bus: &mut B,
        vector: u8,
        kind: EventKind,
        error_code: Option<u32>,
    ) -> Result<(), Exception> {
        if self.state.protected() {
            self.dispatch_protected(bus, vector, kind, error_code)
        } else {
            self.dispatch_real(bus, vector)
        }
    }

    fn dispatch_real<B: CpuBus>(&mut self, bus: &mut B, vector: u8) -> Result<(), Exception> {
        let state = &mut self.state;
        let entry = (vector as u32) * 4;
        if entry + 3 > state.tables.idtr.limit {
            return Err(Exception::gp0());
        }
        let base = state.tables.idtr.base;
        let ip = bus.read_u16(base.wrapping_add(entry))?;
        let cs = bus.read_u16(base.wrapping_add(entry + 2))?;

        let flags = state.flags() as u16;
        let old_cs = state.segments.cs.selector;
        let old_ip = state.eip() as u16;
        push16(state, bus, flags)?;
        push16(state, bus, old_cs)?;
        push16(state, bus, old_ip)?;

        state.set_flag(FLAG_IF, false);
        state.set_flag(FLAG_TF, false);
        state.set_flag(FLAG_RF, false);
        state.segments.cs = crate::state::SegmentCache::real_mode(cs);
        state.set_eip(ip as u32);
        Ok(())
    }

    fn dispatch_protected<B: CpuBus>(
        &mut self,
        bus: &mut B,
        vector: u8,
        kind: EventKind,
        error_code: Option<u32>,
    ) -> Result<(), Exception> {
        let ext: u16 = if kind == EventKind::Software { 0 } else { 1 };

        let entry = (vector as u32) * 8;
        if entry + 7 > self.state.tables.idtr.limit {
            return Err(Exception::GeneralProtection(((vector as u16) << 3) | 2 | ext));
        }
        let gate_addr = self.state.tables.idtr.base.wrapping_add(entry);
        let lo = bus.read_u32(gate_addr)?;
        let hi = bus.read_u32(gate_addr.wrapping_add(4))?;

        let gate_type = ((hi >> 8) & 0x1F) as u8;
        let gate_dpl = ((hi >> 13) & 3) as u8;
        let present = hi & 0x8000 != 0;

        if kind == EventKind::Software && gate_dpl < self.state.cpl() {
            return Err(Exception::GeneralProtection(((vector as u16) << 3) | 2));
        }
        if !present {
            return Err(Exception::SegmentNotPresent(((vector as u16) << 3) | 2 | ext));
        }

        match gate_type {
            0x05 => {
                // Task gate: the selector names a TSS, offset is unused.
                let tss_sel = (lo >> 16) as u16;
                tss::task_switch(&mut self.state, bus, tss_sel, TaskSwitchSource::Call)?;
                if let Some(ec) = error_code {
                    push32(&mut self.state, bus, ec)?;
                }
                Ok(())
            }
            0x06 | 0x07 | 0x0E | 0x0F => {
                let gate32 = gate_type & 0x08 != 0;
                let trap = gate_type & 0x01 != 0;
                let selector = (lo >> 16) as u16;
                let offset = if gate32 {
                    (lo & 0xFFFF) | (hi & 0xFFFF_0000)
                } else {
                    lo & 0xFFFF
                };
                self.enter_gate(bus, selector, offset, gate32, trap, error_code, ext)
            }
            _ => Err(Exception::GeneralProtection(((vector as u16) << 3) | 2 | ext)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn enter_gate<B: CpuBus>(
        &mut self,
        bus: &mut B,
        selector: u16,
        offset: u32,
        gate32: bool,
        trap: bool,
        error_code: Option<u32>,
        _ext: u16,
    ) -> Result<(), Exception> {
        let state = &mut self.state;
        if selector & 0xFFFC == 0 {
            return Err(Exception::gp0());
        }
        let (dlo, dhi, _) = seg::read_descriptor(state, bus, selector)?;
        let desc = Descriptor::decode(dlo, dhi);
        let cpl = state.cpl();
        if !desc.is_code() || desc.dpl() > cpl {
            return Err(Exception::GeneralProtection(selector & 0xFFFC));
        }
        if !desc.present() {
            return Err(Exception::SegmentNotPresent(selector & 0xFFFC));
        }

        let old_flags = state.flags();
        let old_cs = state.segments.cs.selector;
        let old_eip = state.eip();

        let privilege_change = !desc.is_conforming() && desc.dpl() < cpl;
        if privilege_change {
            let new_cpl = desc.dpl();
            let (ss0, esp0) = tss::ring0_stack(state, bus)?;
            let old_ss = state.segments.ss.selector;
            let old_esp = state.gpr[crate::state::gpr::ESP];

            // Switch to the inner stack, then build the frame there.
            seg::load_cs_far(state, bus, selector, new_cpl)?;
            seg::load_seg(state, bus, SegReg::Ss, (ss0 & !3) | new_cpl as u16).map_err(|e| {
                match e {
                    Exception::GeneralProtection(s) => Exception::InvalidTss(s),
                    other => other,
                }
            })?;
            state.gpr[crate::state::gpr::ESP] = esp0;

            push_gate(state, bus, old_ss as u32, gate32)?;
            push_gate(state, bus, old_esp, gate32)?;
            push_gate(state, bus, old_flags, gate32)?;
            push_gate(state, bus, old_cs as u32, gate32)?;
            push_gate(state, bus, old_eip, gate32)?;
            if let Some(ec) = error_code {
                push_gate(state, bus, ec, gate32)?;
            }
        } else {
            seg::load_cs_far(state, bus, selector, cpl)?;
            push_gate(state, bus, old_flags, gate32)?;
            push_gate(state, bus, old_cs as u32, gate32)?;
            push_gate(state, bus, old_eip, gate32)?;
            if let Some(ec) = error_code {
                push_gate(state, bus, ec, gate32)?;
            }
        }

        state.set_eip(if gate32 { offset } else { offset & 0xFFFF });
        if !trap {
            state.set_flag(FLAG_IF, false);
        }
        state.set_flag(FLAG_TF, false);
        state.set_flag(FLAG_NT, false);
        state.set_flag(FLAG_RF, false);
        Ok(())
    }

    /// IRET/IRETD. Protection failures are delivered as faults rather than
    /// surfaced to the caller.
    pub fn iret<B: CpuBus>(&mut self, bus: &mut B) -> Result<(), CpuExit> {
        let opsize32 = self.state.code_32();
        let eip0 = self.state.eip();
        match iret_inner(&mut self.state, bus, opsize32) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state.set_eip(eip0);
                self.pending.raise_exception_fault(&mut self.state, e);
                self.deliver_pending_event(bus)
            }
        }
    }

    /// IRET as invoked from the interpreter: errors propagate as ordinary
    /// instruction faults.
    pub(crate) fn iret_instr<B: CpuBus>(
        &mut self,
        bus: &mut B,
        opsize32: bool,
    ) -> Result<(), Exception> {
        iret_inner(&mut self.state, bus, opsize32)
    }
}

// --- stack helpers shared with the interpreter ---

fn push_gate<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    value: u32,
    gate32: bool,
) -> Result<(), Exception> {
    if gate32 {
        push32(state, bus, value)
    } else {
        push16(state, bus, value as u16)
    }
}

pub(crate) fn push16<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    value: u16,
) -> Result<(), Exception> {
    let esp = state.gpr[crate::state::gpr::ESP];
    let new_esp = if state.stack_32() {
        esp.wrapping_sub(2)
    } else {
        (esp & 0xFFFF_0000) | (esp as u16).wrapping_sub(2) as u32
    };
    let offset = if state.stack_32() {
        new_esp
    } else {
        new_esp & 0xFFFF
    };
    seg::write16(state, bus, SegReg::Ss, offset, value)?;
    state.gpr[crate::state::gpr::ESP] = new_esp;
    Ok(())
}

pub(crate) fn push32<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    value: u32,
) -> Result<(), Exception> {
    let esp = state.gpr[crate::state::gpr::ESP];
    let new_esp = if state.stack_32() {
        esp.wrapping_sub(4)
    } else {
        (esp & 0xFFFF_0000) | (esp as u16).wrapping_sub(4) as u32
    };
    let offset = if state.stack_32() {
        new_esp
    } else {
        new_esp & 0xFFFF
    };
    seg::write32(state, bus, SegReg::Ss, offset, value)?;
    state.gpr[crate::state::gpr::ESP] = new_esp;
    Ok(())
}

pub(crate) fn pop16<B: CpuBus>(state: &mut CpuState, bus: &mut B) -> Result<u16, Exception> {
    let esp = state.gpr[crate::state::gpr::ESP];
    let offset = if state.stack_32() { esp } else { esp & 0xFFFF };
    let value = seg::read16(state, bus, SegReg::Ss, offset)?;
    state.gpr[crate::state::gpr::ESP] = if state.stack_32() {
        esp.wrapping_add(2)
    } else {
        (esp & 0xFFFF_0000) | (esp as u16).wrapping_add(2) as u32
    };
    Ok(value)
}

pub(crate) fn pop32<B: CpuBus>(state: &mut CpuState, bus: &mut B) -> Result<u32, Exception> {
    let esp = state.gpr[crate::state::gpr::ESP];
    let offset = if state.stack_32() { esp } else { esp & 0xFFFF };
    let value = seg::read32(state, bus, SegReg::Ss, offset)?;
    state.gpr[crate::state::gpr::ESP] = if state.stack_32() {
        esp.wrapping_add(4)
    } else {
        (esp & 0xFFFF_0000) | (esp as u16).wrapping_add(4) as u32
    };
    Ok(value)
}

/// Applies a POPF/IRET flag image with the privilege rules: IOPL changes
/// only at CPL 0, IF changes only when CPL <= IOPL, VM never changes.
/// `cpl` is the privilege level the instruction executed at (IRET applies
/// it before the ring transition commits).
pub(crate) fn write_flags_privileged(state: &mut CpuState, value: u32, opsize32: bool, cpl: u8) {
    use crate::state::{FLAG_IOPL_MASK, FLAG_VM};

    let mut mask: u32 = if opsize32 { 0x003F_7FD5 } else { 0x0000_7FD5 };
    mask &= !FLAG_VM;
    if cpl > 0 {
        mask &= !FLAG_IOPL_MASK;
        if cpl > state.iopl() {
            mask &= !FLAG_IF;
        }
    }
    state.set_flags_masked(value, mask);
}

fn iret_inner<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    opsize32: bool,
) -> Result<(), Exception> {
    if !state.protected() {
        // Real mode: plain frame pop.
        if opsize32 {
            let eip = pop32(state, bus)?;
            let cs = pop32(state, bus)? as u16;
            let flags = pop32(state, bus)?;
            state.segments.cs = crate::state::SegmentCache::real_mode(cs);
            state.set_eip(eip);
            state.set_flags(flags);
        } else {
            let ip = pop16(state, bus)?;
            let cs = pop16(state, bus)?;
            let flags = pop16(state, bus)?;
            let full = (state.flags() & 0xFFFF_0000) | flags as u32;
            state.segments.cs = crate::state::SegmentCache::real_mode(cs);
            state.set_eip(ip as u32);
            state.set_flags(full);
        }
        return Ok(());
    }

    if state.flag(FLAG_NT) {
        // Return from a nested task via the back link.
        let link = tss::back_link(state, bus)?;
        return tss::task_switch(state, bus, link, TaskSwitchSource::Return);
    }

    let esp_before = state.gpr[crate::state::gpr::ESP];
    let (new_eip, new_cs, new_flags) = if opsize32 {
        let eip = pop32(state, bus)?;
        let cs = pop32(state, bus)? as u16;
        let fl = pop32(state, bus)?;
        (eip, cs, fl)
    } else {
        let ip = pop16(state, bus)?;
        let cs = pop16(state, bus)?;
        let fl = pop16(state, bus)?;
        (ip as u32, cs, (state.flags() & 0xFFFF_0000) | fl as u32)
    };

    let cpl = state.cpl();
    let rpl = (new_cs & 3) as u8;
    if new_cs & 0xFFFC == 0 || rpl < cpl {
        state.gpr[crate::state::gpr::ESP] = esp_before;
        return Err(Exception::gp0());
    }

    if rpl == cpl {
        seg::load_cs_far(state, bus, new_cs, cpl).map_err(|e| {
            state.gpr[crate::state::gpr::ESP] = esp_before;
            e
        })?;
        state.set_eip(new_eip);
        write_flags_privileged(state, new_flags, opsize32, cpl);
        return Ok(());
    }

    // Outer-ring return: also restores SS:ESP from the frame.
    let (new_esp, new_ss) = if opsize32 {
        let esp = pop32(state, bus)?;
        let ss = pop32(state, bus)? as u16;
        (esp, ss)
    } else {
        let sp = pop16(state, bus)?;
        let ss = pop16(state, bus)?;
        (sp as u32, ss)
    };

    let restore = |state: &mut CpuState| {
        state.gpr[crate::state::gpr::ESP] = esp_before;
    };

    seg::load_cs_far(state, bus, new_cs, rpl).map_err(|e| {
        restore(state);
        e
    })?;
    seg::load_seg(state, bus, SegReg::Ss, new_ss)?;
    state.gpr[crate::state::gpr::ESP] = new_esp;
    state.set_eip(new_eip);
    write_flags_privileged(state, new_flags, opsize32, cpl);

    // Data segments the outer ring must not see: null them.
    for segr in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
        let cache = *state.segments.get(segr);
        if cache.valid && !cache.is_conforming() && cache.dpl() < state.cpl() {
            *state.segments.get_mut(segr) = crate::state::SegmentCache::null();
        }
    }
    Ok(())
}
