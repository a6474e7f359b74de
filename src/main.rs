use std::fs;
use std::path::PathBuf;
use std::sync::mpsc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use log::{debug, info};

use common::cli::{GlobalOpts, JitOpts};
use common::{ControlMessage, EmulationCore, UpdateMessage};
use vr4300::Vr4300Core;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Cores {
    Vr4300,
}

#[derive(Parser)]
#[command(about = "Runs raw guest images on a block-recompiling CPU core")]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts<Cores>,

    #[command(flatten)]
    jit: JitOpts,

    /// Raw big-endian image
    image: PathBuf,

    /// Guest address the image is loaded at
    #[arg(long, default_value = "0x80000000", value_parser = parse_address)]
    base: u32,

    /// Where execution starts [default: --base]
    #[arg(long, value_parser = parse_address)]
    entry: Option<u32>,

    /// Bytes of guest RAM
    #[arg(long, default_value_t = 8 << 20)]
    ram_size: usize,

    /// Budget-sized slices to run unless the guest halts first
    #[arg(long, default_value_t = 1)]
    slices: u64,
}

fn parse_address(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("`{text}` is not a 32-bit address: {e}"))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let image = fs::read(&cli.image).with_context(|| format!("reading {}", cli.image.display()))?;
    let image_len = image.len();
    let core: Box<dyn EmulationCore> = match cli.global.core.unwrap_or(Cores::Vr4300) {
        Cores::Vr4300 => Box::new(
            Vr4300Core::new(image, cli.base, cli.entry.unwrap_or(cli.base))
                .with_ram_size(cli.ram_size)
                .with_jit(&cli.jit),
        ),
    };
    info!("{}: {image_len} bytes at {:#010x}", core.name(), cli.base);

    let report = if cli.global.threaded {
        run_threaded(core.as_ref(), cli.slices)?
    } else {
        run(core.as_ref(), cli.slices)?
    };
    println!("{report}");
    Ok(())
}

/// One slice per `run` call, on this thread.
fn run(core: &dyn EmulationCore, slices: u64) -> anyhow::Result<String> {
    let mut instance = core.new()?;
    let (tx_control, rx_control) = mpsc::channel();
    let (tx_update, rx_update) = mpsc::sync_channel(16);

    for _ in 0..slices {
        tx_control.send(ControlMessage::Pause)?;
        instance.run(&rx_control, tx_update.clone())?;
        match rx_update.try_recv() {
            Ok(UpdateMessage::Halted) => break,
            Ok(UpdateMessage::Slice { cycles }) => debug!("slice of {cycles} cycles"),
            Err(_) => {}
        }
    }
    Ok(core.report(instance.as_mut()))
}

fn run_threaded(core: &dyn EmulationCore, slices: u64) -> anyhow::Result<String> {
    let mut instance = core.new_threadded()?;
    instance.start()?;

    let mut seen = 0;
    while seen < slices {
        match instance.wait_update()? {
            UpdateMessage::Halted => break,
            UpdateMessage::Slice { cycles } => {
                seen += 1;
                debug!("slice {seen}: {cycles} cycles");
            }
        }
    }
    instance.pause()?;
    Ok(instance.report(core))
}
