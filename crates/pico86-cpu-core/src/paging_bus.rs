//! `PagingBus` adapts a physical [`MemoryBus`] into the faultable linear
//! [`CpuBus`] by running every access through segmentation's downstream
//! neighbor: the MMU.
//!
//! Multi-byte accesses that straddle a page boundary translate both pages
//! before any byte is written, so a #PF on the second half never leaves a
//! partial store behind.

use pico86_mmu::{Access, MemoryBus, Mmu, PageFault};

use crate::exceptions::Exception;
use crate::mem::CpuBus;
use crate::state::CpuState;

pub struct PagingBus<M: MemoryBus> {
    mem: M,
    mmu: Mmu,
}

impl From<PageFault> for Exception {
    fn from(pf: PageFault) -> Self {
        Exception::PageFault {
            addr: pf.addr,
            error_code: pf.error_code,
        }
    }
}

impl<M: MemoryBus> PagingBus<M> {
    pub fn new(mem: M) -> Self {
        Self {
            mem,
            mmu: Mmu::new(),
        }
    }

    /// Adopts the CPU's current CR0/CR3/CR4 and privilege level. Call after
    /// any write to those registers or any CPL change.
    pub fn sync(&mut self, state: &CpuState) {
        self.mmu.sync(
            state.control.cr0,
            state.control.cr3,
            state.control.cr4,
            state.cpl(),
        );
    }

    pub fn inner_mut(&mut self) -> &mut M {
        &mut self.mem
    }

    pub fn into_inner(self) -> M {
        self.mem
    }

    fn translate(&mut self, addr: u32, access: Access) -> Result<u32, Exception> {
        Ok(self.mmu.translate(&mut self.mem, addr, access)?)
    }

    /// Translates every page an `len`-byte access touches, returning the
    /// physical address of the first byte.
    fn translate_span(&mut self, addr: u32, len: u32, access: Access) -> Result<u32, Exception> {
        let first = self.translate(addr, access)?;
        let last = addr.wrapping_add(len - 1);
        if addr >> 12 != last >> 12 {
            self.translate(last, access)?;
        }
        Ok(first)
    }

    fn crosses_page(addr: u32, len: u32) -> bool {
        addr >> 12 != addr.wrapping_add(len - 1) >> 12
    }
}

impl<M: MemoryBus> CpuBus for PagingBus<M> {
    fn read_u8(&mut self, addr: u32) -> Result<u8, Exception> {
        let p = self.translate(addr, Access::Read)?;
        Ok(self.mem.read_u8(p))
    }

    fn read_u16(&mut self, addr: u32) -> Result<u16, Exception> {
        if Self::crosses_page(addr, 2) {
            let lo = self.read_u8(addr)? as u16;
            let hi = self.read_u8(addr.wrapping_add(1))? as u16;
            return Ok(lo | (hi << 8));
        }
        let p = self.translate(addr, Access::Read)?;
        Ok(self.mem.read_u16(p))
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, Exception> {
        if Self::crosses_page(addr, 4) {
            let mut v = 0u32;
            for i in 0..4 {
                v |= (self.read_u8(addr.wrapping_add(i))? as u32) << (i * 8);
            }
            return Ok(v);
        }
        let p = self.translate(addr, Access::Read)?;
        Ok(self.mem.read_u32(p))
    }

    fn write_u8(&mut self, addr: u32, val: u8) -> Result<(), Exception> {
        let p = self.translate(addr, Access::Write)?;
        self.mem.write_u8(p, val);
        Ok(())
    }

    fn write_u16(&mut self, addr: u32, val: u16) -> Result<(), Exception> {
        if Self::crosses_page(addr, 2) {
            self.translate_span(addr, 2, Access::Write)?;
            self.write_u8(addr, val as u8)?;
            self.write_u8(addr.wrapping_add(1), (val >> 8) as u8)?;
            return Ok(());
        }
        let p = self.translate(addr, Access::Write)?;
        self.mem.write_u16(p, val);
        Ok(())
    }

    fn write_u32(&mut self, addr: u32, val: u32) -> Result<(), Exception> {
        if Self::crosses_page(addr, 4) {
            self.translate_span(addr, 4, Access::Write)?;
            for i in 0..4 {
                self.write_u8(addr.wrapping_add(i), (val >> (i * 8)) as u8)?;
            }
            return Ok(());
        }
        let p = self.translate(addr, Access::Write)?;
        self.mem.write_u32(p, val);
        Ok(())
    }

    fn fetch_u8(&mut self, addr: u32) -> Result<u8, Exception> {
        let p = self.translate(addr, Access::Exec)?;
        Ok(self.mem.read_u8(p))
    }

    fn invlpg(&mut self, addr: u32) {
        self.mmu.invlpg(addr);
    }

    fn sync_paging(&mut self, state: &CpuState) {
        self.sync(state);
    }
}
