//! The wired PC: CPU core, MMU, RAM/MMIO router, and the legacy device
//! fabric, driven by a cooperative outer loop.
//!
//! Collaborators boot it with [`MachineConfig`], call
//! [`Machine::run_slice`] from their frame loop, and inject host input and
//! network frames between slices. HLT surfaces as [`RunExit::Halted`]
//! rather than spinning; virtual time keeps advancing across halted
//! slices so timer interrupts still wake the guest.

mod bus;
mod devices;
mod input;

use memory::{PhysMemory, RamWindow};
use pico86_cpu_core::interp::StepExit;
use pico86_cpu_core::state::{CpuGeneration, FLAG_IF};
use pico86_cpu_core::{CpuCore, CpuExit, CpuMode, InterruptController, PagingBus};
use pico86_devices_storage::{DiskError, DiskImage, DISK_BIOS_VECTOR};
use pico86_interrupts::DualPic;
use pico86_net_ne2000::NetBackend;
use pico86_pc_constants as pc;
use thiserror::Error;

use bus::MachineBus;
use devices::Devices;
pub use input::{FrameQueue, InputEvent, InputQueue};
pub use pico86_devices_storage::{FileDisk, MemDisk};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("RAM size {0:#x} is not usable (1 MiB to 256 MiB, page aligned)")]
    BadRamSize(usize),
    #[error("BIOS image is empty")]
    MissingBios,
    #[error("BIOS image ({len} bytes) does not fit at {addr:#x}")]
    BiosTooLarge { len: usize, addr: u32 },
    #[error("blob ({len} bytes) at {addr:#x} exceeds guest RAM")]
    BlobOutOfRange { len: usize, addr: u32 },
    #[error("disk error: {0}")]
    Disk(#[from] DiskError),
}

pub struct MachineConfig {
    pub ram_size_bytes: usize,
    pub vga_ram_size_bytes: usize,
    pub cpu_generation: CpuGeneration,
    pub fpu_present: bool,
    pub bios: Vec<u8>,
    pub bios_load_addr: u32,
    pub vga_bios: Option<Vec<u8>>,
    /// Optional kernel/payload blob loaded before the first instruction.
    pub kernel: Option<(Vec<u8>, u32)>,
    pub mac: [u8; 6],
    pub ne2000_io_base: u16,
    pub ne2000_irq: u8,
    /// Gap between the 0xE0 scancode prefix and its second byte.
    pub e0_delay_us: u64,
    /// Virtual-clock rate: guest instructions per microsecond.
    pub instructions_per_us: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_size_bytes: 8 * 1024 * 1024,
            vga_ram_size_bytes: pc::VGA_APERTURE_LEN as usize,
            cpu_generation: CpuGeneration::I486,
            fpu_present: false,
            bios: Vec::new(),
            bios_load_addr: pc::BIOS_BASE,
            vga_bios: None,
            kernel: None,
            mac: [0x52, 0x54, 0x00, 0x12, 0x34, 0x56],
            ne2000_io_base: pc::NE2000_IO_BASE,
            ne2000_irq: pc::IRQ_NE2000,
            e0_delay_us: 1000,
            instructions_per_us: 20,
        }
    }
}

/// Why `run_slice` returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunExit {
    /// The instruction budget was consumed.
    Completed { executed: u64 },
    /// The CPU is halted waiting for an interrupt.
    Halted { executed: u64 },
}

struct PicPoller {
    pic: std::rc::Rc<std::cell::RefCell<DualPic>>,
}

impl InterruptController for PicPoller {
    fn poll_interrupt(&mut self) -> Option<u8> {
        let mut pic = self.pic.borrow_mut();
        if pic.intr_pending() {
            pic.acknowledge()
        } else {
            None
        }
    }
}

/// Glue letting the NE2000 hand transmitted frames to the host shim.
struct TxQueueBackend {
    frames: std::sync::Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
}

impl NetBackend for TxQueueBackend {
    fn transmit(&mut self, frame: &[u8]) {
        self.frames.lock().unwrap().push(frame.to_vec());
    }
}

pub struct Machine {
    cpu: CpuCore,
    paging: PagingBus<PhysMemory>,
    devices: Devices,
    config: MachineConfig,
    input: InputQueue,
    frames_in: FrameQueue,
    tx_frames: std::sync::Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
    /// Instructions retired since power-on; the virtual clock numerator.
    total_insns: u64,
    /// Extra virtual time accumulated while halted.
    idle_us: u64,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine").finish_non_exhaustive()
    }
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Self, ConfigError> {
        let ram = config.ram_size_bytes;
        if !(0x10_0000..=0x1000_0000).contains(&ram) || ram % 4096 != 0 {
            return Err(ConfigError::BadRamSize(ram));
        }
        if config.bios.is_empty() {
            return Err(ConfigError::MissingBios);
        }
        let bios_end = config.bios_load_addr as u64 + config.bios.len() as u64;
        if config.bios.len() > pc::BIOS_MAX_LEN as usize || bios_end > ram as u64 {
            return Err(ConfigError::BiosTooLarge {
                len: config.bios.len(),
                addr: config.bios_load_addr,
            });
        }
        if let Some((blob, addr)) = &config.kernel {
            if *addr as u64 + blob.len() as u64 > ram as u64 {
                return Err(ConfigError::BlobOutOfRange {
                    len: blob.len(),
                    addr: *addr,
                });
            }
        }

        let mut mem = PhysMemory::new(ram);
        let window = config
            .vga_ram_size_bytes
            .min(pc::VGA_APERTURE_LEN as usize);
        mem.map_mmio(
            pc::VGA_APERTURE_BASE,
            pc::VGA_APERTURE_LEN,
            Box::new(RamWindow::new(window)),
        )
        .expect("VGA aperture is the first mapping");

        let mut devices = Devices::new(
            config.mac,
            config.ne2000_io_base,
            config.ne2000_irq,
            config.e0_delay_us,
        );
        let tx_frames = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        devices.ne2000.set_backend(Box::new(TxQueueBackend {
            frames: tx_frames.clone(),
        }));

        let mut machine = Self {
            cpu: CpuCore::new(CpuMode::Real),
            paging: PagingBus::new(mem),
            devices,
            config,
            input: InputQueue::new(),
            frames_in: FrameQueue::new(),
            tx_frames,
            total_insns: 0,
            idle_us: 0,
        };
        machine.load_images();
        machine.reset();
        Ok(machine)
    }

    fn load_images(&mut self) {
        let mem = self.paging.inner_mut();
        mem.load_image(self.config.bios_load_addr, &self.config.bios);
        mem.mark_rom(self.config.bios_load_addr, self.config.bios.len() as u32);
        if let Some(vga_bios) = &self.config.vga_bios {
            mem.load_image(pc::VGA_BIOS_BASE, vga_bios);
            mem.mark_rom(pc::VGA_BIOS_BASE, vga_bios.len() as u32);
        }
        if let Some((blob, addr)) = &self.config.kernel {
            mem.load_image(*addr, blob);
        }
    }

    /// Full machine reset: device queues dropped, controllers at power-on
    /// defaults, BIOS re-copied, CPU back at F000:FFF0.
    pub fn reset(&mut self) {
        tracing::debug!("machine reset");
        self.cpu.reset();
        self.cpu.state.generation = self.config.cpu_generation;
        self.cpu.state.fpu_present = self.config.fpu_present;
        self.cpu.hook_vector(DISK_BIOS_VECTOR, true);
        self.devices.reset();
        self.input.clear();
        self.frames_in.clear();
        self.load_images();
        let state = &self.cpu.state;
        self.paging.sync(state);
    }

    fn now_us(&self) -> u64 {
        self.total_insns / self.config.instructions_per_us + self.idle_us
    }

    /// Executes up to `max_insns` guest instructions, then returns to the
    /// caller's device/render loop.
    pub fn run_slice(&mut self, max_insns: u64) -> RunExit {
        self.drain_host_input();

        let mut executed = 0u64;
        while executed < max_insns {
            if executed % 64 == 0 {
                let now = self.now_us();
                self.devices.tick(now);
            }

            // Instruction-boundary event sampling.
            let mut poller = PicPoller {
                pic: self.devices.pic.clone(),
            };
            let mut bus = MachineBus {
                paging: &mut self.paging,
                devices: &mut self.devices,
            };
            if let Err(CpuExit::TripleFault) = self
                .cpu
                .poll_and_deliver_external_interrupt(&mut bus, &mut poller)
            {
                self.reset();
                continue;
            }

            if self.cpu.state.halted {
                // Idle: burn the rest of the slice as virtual time so the
                // PIT/RTC keep running, then let the wake path re-sample.
                let skipped = (max_insns - executed).max(1);
                self.idle_us += skipped / self.config.instructions_per_us + 1;
                let now = self.now_us();
                self.devices.tick(now);
                if !self.pending_wake() {
                    return RunExit::Halted { executed };
                }
                continue;
            }

            let mut bus = MachineBus {
                paging: &mut self.paging,
                devices: &mut self.devices,
            };
            match self.cpu.step(&mut bus) {
                Ok(StepExit::HookedInterrupt(vector)) => {
                    debug_assert_eq!(vector, DISK_BIOS_VECTOR);
                    self.devices
                        .disks
                        .int13(&mut self.cpu.state, self.paging.inner_mut());
                }
                Ok(_) => {}
                Err(CpuExit::TripleFault) => {
                    tracing::warn!(
                        cpu = %self.cpu.state.debug_snapshot(),
                        "triple fault, resetting machine"
                    );
                    self.reset();
                }
            }
            executed += 1;
            self.total_insns += 1;

            if self.devices.i8042.take_reset_request() {
                self.reset();
            }
        }
        RunExit::Completed { executed }
    }

    /// Whether a deliverable interrupt is pending for a halted CPU.
    fn pending_wake(&self) -> bool {
        self.cpu.state.flag(FLAG_IF) && self.devices.pic.borrow().intr_pending()
    }

    fn drain_host_input(&mut self) {
        let now = self.now_us();
        for event in self.input.drain() {
            match event {
                InputEvent::Key { is_down, keycode } => {
                    self.devices.i8042.inject_key(is_down, keycode, now);
                }
                InputEvent::Mouse { dx, dy, dz, buttons } => {
                    self.devices.i8042.inject_mouse(dx, dy, dz, buttons);
                }
            }
        }
        while self.devices.ne2000.can_receive() {
            let Some(frame) = self.frames_in.pop() else {
                break;
            };
            self.devices.ne2000.receive(&frame);
        }
        self.devices.sync_ne2000_irq();
    }

    // --- collaborator entry points ---

    /// Injects one keyboard byte event (Linux-evdev keycode).
    pub fn inject_key(&mut self, is_down: bool, keycode: u16) {
        let now = self.now_us();
        self.devices.i8042.inject_key(is_down, keycode, now);
    }

    /// Injects a mouse movement/button event.
    pub fn inject_mouse(&mut self, dx: i32, dy: i32, dz: i32, buttons: u8) {
        self.devices.i8042.inject_mouse(dx, dy, dz, buttons);
    }

    /// Injects a received network frame.
    pub fn inject_frame(&mut self, frame: &[u8]) {
        self.frames_in.push(frame.to_vec());
        self.drain_host_input();
    }

    /// Cloneable producer handle for a host input thread.
    pub fn input_queue(&self) -> InputQueue {
        self.input.clone()
    }

    /// Cloneable producer handle for the network receive context.
    pub fn frame_queue(&self) -> FrameQueue {
        self.frames_in.clone()
    }

    /// Frames the guest transmitted since the last call.
    pub fn take_transmitted_frames(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.tx_frames.lock().unwrap())
    }

    pub fn serial_output_bytes(&self) -> &[u8] {
        &self.devices.serial_out
    }

    pub fn take_serial_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.devices.serial_out)
    }

    /// Copies out of the VGA aperture for the display collaborator.
    pub fn read_vga(&mut self, offset: u32, buf: &mut [u8]) {
        self.paging
            .inner_mut()
            .read_block(pc::VGA_APERTURE_BASE.wrapping_add(offset), buf);
    }

    pub fn insert_disk(&mut self, index: usize, image: Box<dyn DiskImage>) -> Result<(), DiskError> {
        self.devices.disks.insert(index, image)
    }

    pub fn eject_disk(&mut self, index: usize) {
        self.devices.disks.eject(index);
    }

    /// Direct CPU access, for tests and debuggers.
    pub fn cpu(&self) -> &CpuCore {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut CpuCore {
        &mut self.cpu
    }

    /// Guest physical memory access, for loaders and tests.
    pub fn memory_mut(&mut self) -> &mut PhysMemory {
        self.paging.inner_mut()
    }
}
