use bitflags::bitflags;

use crate::Access;

/// Direct-mapped translation cache, indexed by the low bits of the linear
/// page number.
pub const TLB_ENTRIES: usize = 256;

const INVALID_TAG: u32 = !0;

bitflags! {
    /// Per-entry permission/attribute bits, pre-resolved for the current
    /// privilege mode at fill time.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TlbFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const GLOBAL = 1 << 3;
    }
}

#[derive(Clone, Copy)]
struct TlbEntry {
    /// Linear page number, or `INVALID_TAG`.
    tag: u32,
    /// Physical page frame (low 12 bits clear).
    page: u32,
    flags: TlbFlags,
}

const EMPTY: TlbEntry = TlbEntry {
    tag: INVALID_TAG,
    page: 0,
    flags: TlbFlags::empty(),
};

pub struct Tlb {
    entries: [TlbEntry; TLB_ENTRIES],
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

impl Tlb {
    pub fn new() -> Self {
        Self {
            entries: [EMPTY; TLB_ENTRIES],
        }
    }

    #[inline]
    fn slot(linear: u32) -> usize {
        (linear >> 12) as usize & (TLB_ENTRIES - 1)
    }

    /// The hot path: tag compare plus permission mask.
    #[inline]
    pub fn lookup(&self, linear: u32, access: Access) -> Option<u32> {
        let e = &self.entries[Self::slot(linear)];
        if e.tag != linear >> 12 {
            return None;
        }
        let needed = match access {
            Access::Read => TlbFlags::READ,
            Access::Write => TlbFlags::WRITE,
            Access::Exec => TlbFlags::EXEC,
        };
        if !e.flags.contains(needed) {
            return None;
        }
        Some(e.page | (linear & 0xFFF))
    }

    pub fn insert(&mut self, linear: u32, page: u32, flags: TlbFlags) {
        self.entries[Self::slot(linear)] = TlbEntry {
            tag: linear >> 12,
            page,
            flags,
        };
    }

    pub fn invlpg(&mut self, linear: u32) {
        let e = &mut self.entries[Self::slot(linear)];
        if e.tag == linear >> 12 {
            *e = EMPTY;
        }
    }

    pub fn flush_all(&mut self) {
        self.entries = [EMPTY; TLB_ENTRIES];
    }

    pub fn flush_nonglobal(&mut self) {
        for e in self.entries.iter_mut() {
            if !e.flags.contains(TlbFlags::GLOBAL) {
                *e = EMPTY;
            }
        }
    }
}
