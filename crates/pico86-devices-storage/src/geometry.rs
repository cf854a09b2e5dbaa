//! CHS geometry derived from image size.

use crate::image::DiskError;
use crate::{CDROM_SECTOR_SIZE, SECTOR_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveKind {
    Floppy,
    Hard,
    Cdrom,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub cylinders: u32,
    pub heads: u32,
    pub sectors_per_track: u32,
    pub bytes_per_sector: u32,
}

/// Standard floppy formats: (total KiB, cylinders, heads, sectors).
const FLOPPY_FORMATS: [(u64, u32, u32, u32); 6] = [
    (160, 40, 1, 8),
    (360, 40, 2, 9),
    (720, 80, 2, 9),
    (1200, 80, 2, 15),
    (1440, 80, 2, 18),
    (2880, 80, 2, 36),
];

impl Geometry {
    pub fn default_for(kind: DriveKind) -> Self {
        match kind {
            DriveKind::Floppy => Geometry {
                cylinders: 80,
                heads: 2,
                sectors_per_track: 18,
                bytes_per_sector: SECTOR_SIZE as u32,
            },
            DriveKind::Hard => Geometry {
                cylinders: 0,
                heads: 16,
                sectors_per_track: 63,
                bytes_per_sector: SECTOR_SIZE as u32,
            },
            DriveKind::Cdrom => Geometry {
                cylinders: 0,
                heads: 1,
                sectors_per_track: 1,
                bytes_per_sector: CDROM_SECTOR_SIZE as u32,
            },
        }
    }

    pub fn from_size(kind: DriveKind, len: u64) -> Result<Self, DiskError> {
        match kind {
            DriveKind::Floppy => {
                let kib = len / 1024;
                for (total, c, h, s) in FLOPPY_FORMATS {
                    if kib == total {
                        return Ok(Geometry {
                            cylinders: c,
                            heads: h,
                            sectors_per_track: s,
                            bytes_per_sector: SECTOR_SIZE as u32,
                        });
                    }
                }
                // Odd sizes still boot as long as a whole number of
                // sectors exists; present them as single-track media.
                if len % SECTOR_SIZE as u64 != 0 {
                    return Err(DiskError::BadImageSize(len));
                }
                Ok(Geometry {
                    cylinders: (len / (SECTOR_SIZE as u64 * 18 * 2)).max(1) as u32,
                    heads: 2,
                    sectors_per_track: 18,
                    bytes_per_sector: SECTOR_SIZE as u32,
                })
            }
            DriveKind::Hard => {
                if len % SECTOR_SIZE as u64 != 0 {
                    return Err(DiskError::BadImageSize(len));
                }
                let track = SECTOR_SIZE as u64 * 63 * 16;
                Ok(Geometry {
                    cylinders: len.div_ceil(track).max(1) as u32,
                    heads: 16,
                    sectors_per_track: 63,
                    bytes_per_sector: SECTOR_SIZE as u32,
                })
            }
            DriveKind::Cdrom => Ok(Geometry {
                cylinders: 0,
                heads: 1,
                sectors_per_track: 1,
                bytes_per_sector: CDROM_SECTOR_SIZE as u32,
            }),
        }
    }

    pub fn total_sectors(&self, image_len: u64) -> u64 {
        image_len / self.bytes_per_sector as u64
    }

    /// CHS → byte offset; `sector` is 1-based per the BIOS convention.
    pub fn chs_to_offset(&self, cylinder: u32, head: u32, sector: u32) -> Option<u64> {
        if sector == 0 || sector > self.sectors_per_track || head >= self.heads {
            return None;
        }
        let lba =
            (cylinder as u64 * self.heads as u64 + head as u64) * self.sectors_per_track as u64
                + (sector as u64 - 1);
        Some(lba * self.bytes_per_sector as u64)
    }
}
