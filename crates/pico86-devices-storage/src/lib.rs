//! Drive images and the legacy INT 13h disk service.
//!
//! Up to five drives: two floppies (DL 00h/01h), two hard disks (80h/81h)
//! and one CD-ROM (82h, 2048-byte sectors). The service operates directly
//! on CPU registers and guest physical memory; transfers complete
//! synchronously and report status in AH/CF per the BIOS convention.

mod geometry;
mod image;
mod int13;

pub use geometry::{DriveKind, Geometry};
pub use image::{DiskError, DiskImage, FileDisk, MemDisk};
pub use int13::DISK_BIOS_VECTOR;

pub const SECTOR_SIZE: usize = 512;
pub const CDROM_SECTOR_SIZE: usize = 2048;

pub const DRIVE_COUNT: usize = 5;

pub struct Drive {
    pub kind: DriveKind,
    image: Option<Box<dyn DiskImage>>,
    geometry: Geometry,
}

impl Drive {
    fn empty(kind: DriveKind) -> Self {
        Self {
            kind,
            image: None,
            geometry: Geometry::default_for(kind),
        }
    }

    pub fn is_inserted(&self) -> bool {
        self.image.is_some()
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }
}

pub struct DiskController {
    drives: [Drive; DRIVE_COUNT],
    last_status: u8,
}

impl Default for DiskController {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskController {
    pub fn new() -> Self {
        Self {
            drives: [
                Drive::empty(DriveKind::Floppy),
                Drive::empty(DriveKind::Floppy),
                Drive::empty(DriveKind::Hard),
                Drive::empty(DriveKind::Hard),
                Drive::empty(DriveKind::Cdrom),
            ],
            last_status: 0,
        }
    }

    /// Inserts a disk image; the geometry is recomputed from its size.
    pub fn insert(&mut self, index: usize, image: Box<dyn DiskImage>) -> Result<(), DiskError> {
        let drive = self
            .drives
            .get_mut(index)
            .ok_or(DiskError::NoSuchDrive(index))?;
        drive.geometry = Geometry::from_size(drive.kind, image.len())?;
        drive.image = Some(image);
        Ok(())
    }

    pub fn eject(&mut self, index: usize) {
        if let Some(drive) = self.drives.get_mut(index) {
            drive.image = None;
            drive.geometry = Geometry::default_for(drive.kind);
        }
    }

    pub fn drive(&self, index: usize) -> Option<&Drive> {
        self.drives.get(index)
    }

    /// BIOS drive number → internal index.
    fn drive_index(dl: u8) -> Option<usize> {
        match dl {
            0x00 => Some(0),
            0x01 => Some(1),
            0x80 => Some(2),
            0x81 => Some(3),
            0x82 => Some(4),
            _ => None,
        }
    }

    pub fn floppy_count(&self) -> u8 {
        self.drives[..2].iter().filter(|d| d.is_inserted()).count() as u8
    }

    pub fn hard_count(&self) -> u8 {
        self.drives[2..4].iter().filter(|d| d.is_inserted()).count() as u8
    }
}
