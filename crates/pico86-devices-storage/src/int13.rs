//! INT 13h service dispatch. The machine hooks vector 13h in real mode
//! and calls [`DiskController::int13`] with the CPU registers; the service
//! mutates AX/CF (and the guest buffer) and execution resumes after the
//! INT instruction — no IVT dispatch, no handler code in guest memory.

use memory::PhysMemory;
use pico86_cpu_core::state::{gpr, CpuState, SegReg, FLAG_CF};

use crate::geometry::DriveKind;
use crate::{DiskController, CDROM_SECTOR_SIZE};

pub const DISK_BIOS_VECTOR: u8 = 0x13;

// BIOS status codes returned in AH.
const STATUS_OK: u8 = 0x00;
const STATUS_INVALID: u8 = 0x01;
const STATUS_SECTOR_NOT_FOUND: u8 = 0x04;
const STATUS_WRITE_PROTECTED: u8 = 0x03;
const STATUS_TIMEOUT: u8 = 0x80;

fn ah(state: &CpuState) -> u8 {
    state.read_gpr8(4)
}

fn al(state: &CpuState) -> u8 {
    state.read_gpr8(0)
}

fn set_ah(state: &mut CpuState, v: u8) {
    state.write_gpr8(4, v);
}

impl DiskController {
    fn finish(&mut self, state: &mut CpuState, status: u8) {
        self.last_status = status;
        set_ah(state, status);
        state.set_flag(FLAG_CF, status != STATUS_OK);
    }

    /// Entry point for a hooked INT 13h. Registers follow the standard
    /// BIOS calling convention.
    pub fn int13(&mut self, state: &mut CpuState, mem: &mut PhysMemory) {
        let function = ah(state);
        let dl = state.read_gpr8(2);

        match function {
            // Reset / get last status: no drive access needed.
            0x00 => self.finish(state, STATUS_OK),
            0x01 => {
                let status = self.last_status;
                set_ah(state, status);
                state.set_flag(FLAG_CF, false);
            }
            0x02 | 0x03 => self.chs_transfer(state, mem, function == 0x03),
            0x04 => self.finish(state, STATUS_OK),
            0x08 => self.get_params(state, dl),
            0x15 => self.drive_type(state, dl),
            0x41 => self.ext_check(state, dl),
            0x42 | 0x43 => self.ext_transfer(state, mem, function == 0x43),
            _ => {
                tracing::debug!(function, dl, "unsupported disk service");
                self.finish(state, STATUS_INVALID);
            }
        }
    }

    fn resolve(&mut self, dl: u8) -> Option<usize> {
        let index = Self::drive_index(dl)?;
        self.drives[index].is_inserted().then_some(index)
    }

    fn chs_transfer(&mut self, state: &mut CpuState, mem: &mut PhysMemory, write: bool) {
        let dl = state.read_gpr8(2);
        let Some(index) = self.resolve(dl) else {
            self.finish(state, STATUS_TIMEOUT);
            return;
        };
        let drive = &mut self.drives[index];
        if drive.kind == DriveKind::Cdrom {
            // CHS addressing does not apply to 2048-byte media.
            self.finish(state, STATUS_INVALID);
            return;
        }

        let count = al(state) as u32;
        let cl = state.read_gpr8(1);
        let ch = state.read_gpr8(5);
        let dh = state.read_gpr8(6);
        let cylinder = ch as u32 | (((cl as u32) & 0xC0) << 2);
        let sector = (cl & 0x3F) as u32;
        let head = dh as u32;

        let geometry = drive.geometry;
        let Some(offset) = geometry.chs_to_offset(cylinder, head, sector) else {
            self.finish(state, STATUS_SECTOR_NOT_FOUND);
            return;
        };
        let bytes = count as usize * geometry.bytes_per_sector as usize;
        let image = drive.image.as_mut().expect("resolved drive has media");
        if offset + bytes as u64 > image.len() {
            self.finish(state, STATUS_SECTOR_NOT_FOUND);
            return;
        }

        let buffer = state.segments.es.base.wrapping_add(state.read_gpr16(gpr::EBX) as u32);
        let ok = transfer(image.as_mut(), mem, offset, buffer, bytes, write);
        if ok {
            // AL returns the sectors transferred.
            state.write_gpr8(0, count as u8);
            self.finish(state, STATUS_OK);
        } else {
            self.finish(state, STATUS_SECTOR_NOT_FOUND);
        }
    }

    fn get_params(&mut self, state: &mut CpuState, dl: u8) {
        let Some(index) = Self::drive_index(dl) else {
            self.finish(state, STATUS_INVALID);
            return;
        };
        let drive = &self.drives[index];
        if !drive.is_inserted() {
            self.finish(state, STATUS_TIMEOUT);
            return;
        }
        let g = drive.geometry;
        let max_cyl = g.cylinders.saturating_sub(1);
        state.write_gpr8(5, max_cyl as u8); // CH
        state.write_gpr8(
            1,
            (g.sectors_per_track as u8 & 0x3F) | (((max_cyl >> 8) as u8 & 0x03) << 6),
        ); // CL
        state.write_gpr8(6, g.heads.saturating_sub(1) as u8); // DH
        let dl_count = if dl < 0x80 {
            self.floppy_count()
        } else {
            self.hard_count()
        };
        state.write_gpr8(2, dl_count); // DL
        if dl < 0x80 {
            // BL: drive type (4 = 1.44M).
            state.write_gpr8(3, 0x04);
        }
        self.finish(state, STATUS_OK);
    }

    fn drive_type(&mut self, state: &mut CpuState, dl: u8) {
        match self.resolve(dl) {
            None => {
                set_ah(state, 0x00); // no such drive
                state.set_flag(FLAG_CF, false);
            }
            Some(index) => {
                let drive = &self.drives[index];
                match drive.kind {
                    DriveKind::Floppy => {
                        set_ah(state, 0x01);
                    }
                    _ => {
                        set_ah(state, 0x03);
                        let sectors = drive
                            .geometry
                            .total_sectors(drive.image.as_ref().map_or(0, |i| i.len()));
                        state.write_gpr16(gpr::ECX, (sectors >> 16) as u16);
                        state.write_gpr16(gpr::EDX, sectors as u16);
                    }
                }
                state.set_flag(FLAG_CF, false);
            }
        }
    }

    fn ext_check(&mut self, state: &mut CpuState, dl: u8) {
        if self.resolve(dl).is_none() {
            self.finish(state, STATUS_TIMEOUT);
            return;
        }
        if state.read_gpr16(gpr::EBX) != 0x55AA {
            self.finish(state, STATUS_INVALID);
            return;
        }
        state.write_gpr16(gpr::EBX, 0xAA55);
        set_ah(state, 0x30); // EDD 3.0
        state.write_gpr16(gpr::ECX, 0x0001); // extended access functions
        state.set_flag(FLAG_CF, false);
        self.last_status = STATUS_OK;
    }

    fn ext_transfer(&mut self, state: &mut CpuState, mem: &mut PhysMemory, write: bool) {
        let dl = state.read_gpr8(2);
        let Some(index) = self.resolve(dl) else {
            self.finish(state, STATUS_TIMEOUT);
            return;
        };
        let drive = &mut self.drives[index];
        if write && drive.kind == DriveKind::Cdrom {
            self.finish(state, STATUS_WRITE_PROTECTED);
            return;
        }

        // Disk Address Packet at DS:SI.
        let dap = state
            .segments
            .get(SegReg::Ds)
            .base
            .wrapping_add(state.read_gpr16(gpr::ESI) as u32);
        let size = mem.read_u8(dap);
        if size < 0x10 {
            self.finish(state, STATUS_INVALID);
            return;
        }
        let count = mem.read_u16(dap.wrapping_add(2)) as usize;
        let buf_off = mem.read_u16(dap.wrapping_add(4)) as u32;
        let buf_seg = mem.read_u16(dap.wrapping_add(6)) as u32;
        let lba = mem.read_u32(dap.wrapping_add(8)) as u64
            | ((mem.read_u32(dap.wrapping_add(12)) as u64) << 32);

        let sector_size = drive.geometry.bytes_per_sector as usize;
        debug_assert!(
            drive.kind != DriveKind::Cdrom || sector_size == CDROM_SECTOR_SIZE,
            "CD-ROM geometry must use 2048-byte sectors"
        );
        let offset = lba * sector_size as u64;
        let bytes = count * sector_size;
        let image = drive.image.as_mut().expect("resolved drive has media");
        if offset + bytes as u64 > image.len() {
            self.finish(state, STATUS_SECTOR_NOT_FOUND);
            return;
        }

        let buffer = (buf_seg << 4).wrapping_add(buf_off);
        if transfer(image.as_mut(), mem, offset, buffer, bytes, write) {
            self.finish(state, STATUS_OK);
        } else {
            self.finish(state, STATUS_SECTOR_NOT_FOUND);
        }
    }
}

/// Moves `bytes` between the image at `offset` and guest physical memory
/// at `buffer`.
fn transfer(
    image: &mut dyn crate::DiskImage,
    mem: &mut PhysMemory,
    offset: u64,
    buffer: u32,
    bytes: usize,
    write: bool,
) -> bool {
    let mut chunk = vec![0u8; bytes];
    if write {
        mem.read_block(buffer, &mut chunk);
        if let Err(err) = image.write_at(offset, &chunk) {
            tracing::warn!(%err, "disk write failed");
            return false;
        }
    } else {
        if let Err(err) = image.read_at(offset, &mut chunk) {
            tracing::warn!(%err, "disk read failed");
            return false;
        }
        mem.write_block(buffer, &chunk);
    }
    true
}
