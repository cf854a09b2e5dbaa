//! Headless front end: boots a machine from image files, runs it, and
//! mirrors guest serial output to stdout.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use pico86_devices_storage::FileDisk;
use pico86_machine::{Machine, MachineConfig, RunExit};

#[derive(Parser)]
#[command(name = "pico86", about = "Run a guest image in the pico86 machine")]
struct Args {
    /// System BIOS image (loaded at 0xF0000).
    #[arg(long)]
    bios: PathBuf,

    /// VGA option ROM (loaded at 0xC0000).
    #[arg(long)]
    vga_bios: Option<PathBuf>,

    /// Raw payload loaded at 1 MiB.
    #[arg(long)]
    kernel: Option<PathBuf>,

    /// Floppy image for drive 0.
    #[arg(long)]
    floppy: Option<PathBuf>,

    /// Hard-disk image for drive 0x80 (opened read-write).
    #[arg(long)]
    disk: Option<PathBuf>,

    /// Guest RAM size in MiB.
    #[arg(long, default_value_t = 8)]
    ram_mib: usize,

    /// Stop after this many guest instructions (0 = run until halt).
    #[arg(long, default_value_t = 0)]
    max_instructions: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = Args::parse();

    let bios = std::fs::read(&args.bios)
        .with_context(|| format!("reading BIOS image {}", args.bios.display()))?;
    let vga_bios = args
        .vga_bios
        .as_ref()
        .map(std::fs::read)
        .transpose()
        .context("reading VGA BIOS image")?;
    let kernel = args
        .kernel
        .as_ref()
        .map(std::fs::read)
        .transpose()
        .context("reading kernel image")?
        .map(|blob| (blob, 0x10_0000));

    let config = MachineConfig {
        ram_size_bytes: args.ram_mib * 1024 * 1024,
        bios,
        vga_bios,
        kernel,
        ..Default::default()
    };
    let mut machine = Machine::new(config).context("booting machine")?;

    if let Some(path) = &args.floppy {
        let image = FileDisk::open(path, false)
            .with_context(|| format!("opening floppy image {}", path.display()))?;
        machine.insert_disk(0, Box::new(image))?;
    }
    if let Some(path) = &args.disk {
        let image = FileDisk::open(path, true)
            .with_context(|| format!("opening disk image {}", path.display()))?;
        machine.insert_disk(2, Box::new(image))?;
    }

    let mut total = 0u64;
    let mut stdout = std::io::stdout();
    loop {
        let exit = machine.run_slice(100_000);
        let out = machine.take_serial_output();
        if !out.is_empty() {
            stdout.write_all(&out)?;
            stdout.flush()?;
        }
        match exit {
            RunExit::Completed { executed } => total += executed,
            RunExit::Halted { executed } => {
                total += executed;
                tracing::info!(total, "guest halted");
                break;
            }
        }
        if args.max_instructions != 0 && total >= args.max_instructions {
            tracing::info!(total, "instruction budget reached");
            break;
        }
    }
    Ok(())
}
