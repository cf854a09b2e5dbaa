//! The linear-address bus the interpreter executes against, plus a flat
//! test bus for unit tests.

use crate::exceptions::Exception;

/// Linear-address loads/stores/fetches and port I/O, as seen from inside
/// the instruction stream. Every access can fault.
pub trait CpuBus {
    fn read_u8(&mut self, addr: u32) -> Result<u8, Exception>;
    fn read_u16(&mut self, addr: u32) -> Result<u16, Exception>;
    fn read_u32(&mut self, addr: u32) -> Result<u32, Exception>;
    fn write_u8(&mut self, addr: u32, val: u8) -> Result<(), Exception>;
    fn write_u16(&mut self, addr: u32, val: u16) -> Result<(), Exception>;
    fn write_u32(&mut self, addr: u32, val: u32) -> Result<(), Exception>;

    /// Instruction fetch; distinguished so paging can apply execute
    /// permission and report I/D in the #PF error code.
    fn fetch_u8(&mut self, addr: u32) -> Result<u8, Exception> {
        self.read_u8(addr)
    }

    /// `size` is 1, 2 or 4. The default floats high like an empty ISA bus.
    fn io_read(&mut self, port: u16, size: u8) -> Result<u32, Exception> {
        let _ = port;
        Ok(match size {
            1 => 0xFF,
            2 => 0xFFFF,
            _ => 0xFFFF_FFFF,
        })
    }

    fn io_write(&mut self, port: u16, size: u8, val: u32) -> Result<(), Exception> {
        let _ = (port, size, val);
        Ok(())
    }

    /// Invalidate one TLB entry (INVLPG). Flat buses have nothing to do.
    fn invlpg(&mut self, addr: u32) {
        let _ = addr;
    }

    /// Re-adopt the CPU's paging controls (CR0/CR3/CR4, CPL). Called at
    /// instruction boundaries and around privilege transitions.
    fn sync_paging(&mut self, state: &crate::state::CpuState) {
        let _ = state;
    }
}

/// Flat RAM with no translation: the unit-test bus.
#[derive(Clone, Debug)]
pub struct FlatTestBus {
    pub mem: Vec<u8>,
    /// Port writes observed, for asserting on OUT behavior.
    pub io_log: Vec<(u16, u32)>,
}

impl FlatTestBus {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            io_log: Vec::new(),
        }
    }

    pub fn load(&mut self, addr: u32, data: &[u8]) {
        let start = addr as usize;
        self.mem[start..start + data.len()].copy_from_slice(data);
    }

    fn slot(&self, addr: u32, len: usize) -> Result<usize, Exception> {
        let start = addr as usize;
        if start + len > self.mem.len() {
            return Err(Exception::gp0());
        }
        Ok(start)
    }
}

impl CpuBus for FlatTestBus {
    fn read_u8(&mut self, addr: u32) -> Result<u8, Exception> {
        let i = self.slot(addr, 1)?;
        Ok(self.mem[i])
    }

    fn read_u16(&mut self, addr: u32) -> Result<u16, Exception> {
        let i = self.slot(addr, 2)?;
        Ok(u16::from_le_bytes([self.mem[i], self.mem[i + 1]]))
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, Exception> {
        let i = self.slot(addr, 4)?;
        Ok(u32::from_le_bytes([
            self.mem[i],
            self.mem[i + 1],
            self.mem[i + 2],
            self.mem[i + 3],
        ]))
    }

    fn write_u8(&mut self, addr: u32, val: u8) -> Result<(), Exception> {
        let i = self.slot(addr, 1)?;
        self.mem[i] = val;
        Ok(())
    }

    fn write_u16(&mut self, addr: u32, val: u16) -> Result<(), Exception> {
        let i = self.slot(addr, 2)?;
        self.mem[i..i + 2].copy_from_slice(&val.to_le_bytes());
        Ok(())
    }

    fn write_u32(&mut self, addr: u32, val: u32) -> Result<(), Exception> {
        let i = self.slot(addr, 4)?;
        self.mem[i..i + 4].copy_from_slice(&val.to_le_bytes());
        Ok(())
    }

    fn io_write(&mut self, port: u16, _size: u8, val: u32) -> Result<(), Exception> {
        self.io_log.push((port, val));
        Ok(())
    }
}
