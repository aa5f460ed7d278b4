use std::{fs, path::PathBuf};

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, LevelFilter};
use miette::{IntoDiagnostic, Result, WrapErr};
use papyrix_flasher::{
    constants::{
        BOOTLOADER_ADDRESS, DEFAULT_BAUD_RATE, FIRMWARE_ADDRESS, PARTITION_TABLE_ADDRESS,
    },
    detect,
    flasher::{FlashRegion, Flasher, ProgressCallbacks},
    interface::{list_ports, SerialInterface},
    logging::initialize_logger,
};

#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Flash firmware to a connected device
    ///
    /// Writes the bootloader (0x0) and partition table (0x8000) when
    /// provided, and the firmware image at 0x10000. The device is rebooted
    /// into the new firmware afterwards.
    Flash(FlashArgs),
    /// Print information about a connected device
    BoardInfo(ConnectArgs),
    /// List the available serial ports
    ListPorts,
}

#[derive(Debug, Args)]
struct ConnectArgs {
    /// Serial port to use (auto-detected when omitted)
    #[arg(short = 'p', long)]
    port: Option<String>,
    /// Baud rate
    #[arg(short = 'b', long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,
}

#[derive(Debug, Args)]
struct FlashArgs {
    #[command(flatten)]
    connect_args: ConnectArgs,
    /// Firmware image to write at 0x10000
    firmware: PathBuf,
    /// Bootloader image to write at 0x0
    #[arg(long, value_name = "FILE")]
    bootloader: Option<PathBuf>,
    /// Partition table to write at 0x8000
    #[arg(long, value_name = "FILE")]
    partition_table: Option<PathBuf>,
    /// Flash the firmware only, skipping bootloader and partition table
    #[arg(long)]
    firmware_only: bool,
    /// Skip the MD5 verification of the written regions
    #[arg(long)]
    no_verify: bool,
}

fn main() -> Result<()> {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    let cli = Cli::parse();

    match cli.subcommand {
        Commands::Flash(args) => flash(args),
        Commands::BoardInfo(args) => board_info(args),
        Commands::ListPorts => print_ports(),
    }
}

fn flash(args: FlashArgs) -> Result<()> {
    let firmware = fs::read(&args.firmware)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to read firmware file {}", args.firmware.display()))?;
    info!(
        "Firmware: {} ({} bytes)",
        args.firmware.display(),
        firmware.len()
    );

    let bootloader = read_optional(args.bootloader.as_deref(), args.firmware_only)?;
    let partition_table = read_optional(args.partition_table.as_deref(), args.firmware_only)?;

    let mut regions = Vec::new();
    if let Some(data) = bootloader.as_deref() {
        regions.push(FlashRegion {
            addr: BOOTLOADER_ADDRESS,
            data,
            name: "bootloader",
        });
    }
    if let Some(data) = partition_table.as_deref() {
        regions.push(FlashRegion {
            addr: PARTITION_TABLE_ADDRESS,
            data,
            name: "partitions",
        });
    }
    regions.push(FlashRegion {
        addr: FIRMWARE_ADDRESS,
        data: &firmware,
        name: "firmware",
    });

    let port_name = resolve_port(&args.connect_args)?;
    info!("Port: {} @ {} baud", port_name, args.connect_args.baud);

    let port = SerialInterface::open(&port_name, args.connect_args.baud)?;
    let mut flasher = Flasher::new(Box::new(port));

    info!("Connecting to bootloader...");
    flasher.connect()?;

    for region in &regions {
        info!(
            "Flashing {} at {:#x} ({} bytes)...",
            region.name,
            region.addr,
            region.data.len()
        );

        let mut progress = FlashProgress::default();
        flasher.flash_image_compressed(region.data, region.addr, Some(&mut progress))?;

        if !args.no_verify {
            flasher.verify_flash(region.addr, region.data)?;
        }
    }

    info!("Flash complete, rebooting device...");
    flasher.reboot()?;

    Ok(())
}

fn board_info(args: ConnectArgs) -> Result<()> {
    if let Some(port) = &args.port {
        let device = detect::detect_on_port(port, args.baud)?;
        println!("Port: {}", device.port);
        println!("Chip: {}", device.chip_name());
        return Ok(());
    }

    info!("Scanning for devices...");
    let devices = detect::list_devices(args.baud)?;
    if devices.is_empty() {
        println!("No devices found");
        return Ok(());
    }

    for device in devices {
        println!("Port: {}", device.port);
        println!("Chip: {}", device.chip_name());
        println!();
    }

    Ok(())
}

fn print_ports() -> Result<()> {
    let ports = list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }

    for port in ports {
        println!("{port}");
    }

    Ok(())
}

fn resolve_port(args: &ConnectArgs) -> Result<String> {
    if let Some(port) = &args.port {
        return Ok(port.clone());
    }

    info!("Detecting device...");
    let device = detect::detect_device(args.baud)?;
    info!("Found {} on {}", device.chip_name(), device.port);

    Ok(device.port)
}

fn read_optional(path: Option<&std::path::Path>, firmware_only: bool) -> Result<Option<Vec<u8>>> {
    match path {
        Some(path) if !firmware_only => {
            let data = fs::read(path)
                .into_diagnostic()
                .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
            Ok(Some(data))
        }
        _ => Ok(None),
    }
}

/// Progress bar for a single flash region
#[derive(Default)]
struct FlashProgress {
    bar: Option<ProgressBar>,
}

impl ProgressCallbacks for FlashProgress {
    fn init(&mut self, addr: u32, total: usize) {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        bar.set_message(format!("{addr:#X}"));

        self.bar = Some(bar)
    }

    fn update(&mut self, current: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}
