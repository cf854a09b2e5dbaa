//! The CPU-facing bus: linear memory through the paging MMU, port I/O
//! into the device fabric.

use memory::PhysMemory;
use pico86_cpu_core::mem::CpuBus;
use pico86_cpu_core::state::CpuState;
use pico86_cpu_core::{Exception, PagingBus};

use crate::devices::Devices;

pub(crate) struct MachineBus<'a> {
    pub paging: &'a mut PagingBus<PhysMemory>,
    pub devices: &'a mut Devices,
}

impl CpuBus for MachineBus<'_> {
    fn read_u8(&mut self, addr: u32) -> Result<u8, Exception> {
        self.paging.read_u8(addr)
    }

    fn read_u16(&mut self, addr: u32) -> Result<u16, Exception> {
        self.paging.read_u16(addr)
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, Exception> {
        self.paging.read_u32(addr)
    }

    fn write_u8(&mut self, addr: u32, val: u8) -> Result<(), Exception> {
        self.paging.write_u8(addr, val)
    }

    fn write_u16(&mut self, addr: u32, val: u16) -> Result<(), Exception> {
        self.paging.write_u16(addr, val)
    }

    fn write_u32(&mut self, addr: u32, val: u32) -> Result<(), Exception> {
        self.paging.write_u32(addr, val)
    }

    fn fetch_u8(&mut self, addr: u32) -> Result<u8, Exception> {
        self.paging.fetch_u8(addr)
    }

    fn io_read(&mut self, port: u16, size: u8) -> Result<u32, Exception> {
        Ok(self.devices.io_read(port, size))
    }

    fn io_write(&mut self, port: u16, size: u8, val: u32) -> Result<(), Exception> {
        self.devices.io_write(port, size, val);
        Ok(())
    }

    fn invlpg(&mut self, addr: u32) {
        self.paging.invlpg(addr);
    }

    fn sync_paging(&mut self, state: &CpuState) {
        self.paging.sync(state);
    }
}
