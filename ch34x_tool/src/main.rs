//! Host tool for CH340/CH341 USB-serial bridges.
//!
//! Talks to the chip directly over libusb: computes the baud-rate registers,
//! runs the vendor initialisation sequence and pushes bytes out the bulk
//! endpoint.

mod device;
mod logger;
mod report;
mod sender;

use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use futures::executor::block_on;
use rusb::Context;

use ch34x_uart::config::{clock, defaults, reg};
use ch34x_uart::{
    BaudRateResolver, Ch34xDriver, DataBits, FlowControl, LineConfig, ModemControl, Parity,
    StopBits,
};

use device::{open_first, DeviceInfo, DeviceSelector, RusbTransport, Timeouts};
use sender::{parse_byte, parse_hex};

#[derive(Parser)]
#[command(name = "ch34x-tool")]
#[command(about = "Configure a CH340/CH341 USB-serial bridge and send data through it")]
struct Args {
    /// Increase log output (-v info, -vv every transfer)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List connected CH34x devices
    List {
        /// Only list devices with this VID:PID (hex)
        #[arg(short, long)]
        device: Option<DeviceSelector>,
    },

    /// Show the divider search for a baud rate (no device needed)
    Calc {
        /// Baud rate
        #[arg(short, long)]
        baud: u32,

        /// Search only the four stages of the limited prescaler
        #[arg(long)]
        limited: bool,
    },

    /// Print the chip version and current UART registers
    Info(DeviceArgs),

    /// Configure the UART and send data out the bulk endpoint
    Send(SendArgs),
}

#[derive(clap::Args)]
struct DeviceArgs {
    /// Device as VID:PID (hex); defaults to the first supported device
    #[arg(short, long)]
    device: Option<DeviceSelector>,

    /// Control transfer timeout in milliseconds
    #[arg(long, default_value_t = defaults::CONTROL_TIMEOUT_MS)]
    control_timeout_ms: u64,

    /// Bulk transfer timeout in milliseconds
    #[arg(long, default_value_t = defaults::BULK_TIMEOUT_MS)]
    bulk_timeout_ms: u64,
}

impl DeviceArgs {
    fn timeouts(&self) -> Timeouts {
        Timeouts {
            control: Duration::from_millis(self.control_timeout_ms),
            bulk: Duration::from_millis(self.bulk_timeout_ms),
        }
    }
}

#[derive(clap::Args)]
struct SendArgs {
    #[command(flatten)]
    device: DeviceArgs,

    /// Baud rate
    #[arg(short, long, default_value_t = defaults::BAUD_RATE)]
    baud: u32,

    #[arg(long, value_enum, default_value_t = DataBitsArg::Eight)]
    data_bits: DataBitsArg,

    #[arg(long, value_enum, default_value_t = ParityArg::None)]
    parity: ParityArg,

    #[arg(long, value_enum, default_value_t = StopBitsArg::One)]
    stop_bits: StopBitsArg,

    /// Enable RTS/CTS hardware flow control
    #[arg(long)]
    rtscts: bool,

    /// Leave DTR and RTS deasserted
    #[arg(long)]
    no_modem: bool,

    /// Read the baud registers back after configuring
    #[arg(long)]
    verify: bool,

    /// Search only the four stages of the limited prescaler
    #[arg(long)]
    limited: bool,

    /// Bytes to send as hex, e.g. "01 02 03 aa"; overrides --fill and --size
    #[arg(long)]
    payload: Option<String>,

    /// Fill byte for generated packets (hex)
    #[arg(long, default_value = "aa", value_parser = parse_byte)]
    fill: u8,

    /// Size of generated packets in bytes
    #[arg(long, default_value_t = 4096)]
    size: usize,

    /// Number of packets to send
    #[arg(short = 'n', long, default_value_t = 1)]
    packets: u64,
}

#[derive(Clone, Copy, ValueEnum)]
enum DataBitsArg {
    #[value(name = "5")]
    Five,
    #[value(name = "6")]
    Six,
    #[value(name = "7")]
    Seven,
    #[value(name = "8")]
    Eight,
}

impl From<DataBitsArg> for DataBits {
    fn from(arg: DataBitsArg) -> Self {
        match arg {
            DataBitsArg::Five => DataBits::Five,
            DataBitsArg::Six => DataBits::Six,
            DataBitsArg::Seven => DataBits::Seven,
            DataBitsArg::Eight => DataBits::Eight,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ParityArg {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl From<ParityArg> for Parity {
    fn from(arg: ParityArg) -> Self {
        match arg {
            ParityArg::None => Parity::None,
            ParityArg::Odd => Parity::Odd,
            ParityArg::Even => Parity::Even,
            ParityArg::Mark => Parity::Mark,
            ParityArg::Space => Parity::Space,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StopBitsArg {
    #[value(name = "1")]
    One,
    #[value(name = "2")]
    Two,
}

impl From<StopBitsArg> for StopBits {
    fn from(arg: StopBitsArg) -> Self {
        match arg {
            StopBitsArg::One => StopBits::One,
            StopBitsArg::Two => StopBits::Two,
        }
    }
}

impl SendArgs {
    fn line_config(&self) -> LineConfig {
        LineConfig {
            baud_rate: self.baud,
            data_bits: self.data_bits.into(),
            parity: self.parity.into(),
            stop_bits: self.stop_bits.into(),
            flow_control: if self.rtscts {
                FlowControl::RtsCts
            } else {
                FlowControl::None
            },
            modem: ModemControl {
                dtr: !self.no_modem,
                rts: !self.no_modem,
            },
            verify: self.verify,
        }
    }

    fn payload(&self) -> Result<Vec<u8>> {
        match &self.payload {
            Some(text) => parse_hex(text).map_err(anyhow::Error::msg),
            None if self.size == 0 => anyhow::bail!("--size must be at least 1"),
            None => Ok(vec![self.fill; self.size]),
        }
    }
}

fn resolver(limited: bool) -> BaudRateResolver {
    if limited {
        BaudRateResolver::limited(clock::REFERENCE_HZ)
    } else {
        BaudRateResolver::new(clock::REFERENCE_HZ)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init(args.verbose);

    match args.command {
        Command::List { device } => list(device),
        Command::Calc { baud, limited } => {
            report::print_candidates(&resolver(limited), baud);
            Ok(())
        }
        Command::Info(device) => info(&device),
        Command::Send(send) => send_data(&send),
    }
}

/// Open the device, run `session`, then release the device whatever the
/// session returned.
fn with_driver<R, F>(args: &DeviceArgs, resolver: BaudRateResolver, session: F) -> Result<R>
where
    F: FnOnce(&mut Ch34xDriver<RusbTransport>, &DeviceInfo) -> Result<R>,
{
    let context = Context::new().context("Failed to initialise libusb")?;
    let (transport, info) = open_first(&context, args.device, args.timeouts())?;
    println!("Device: {}", info);

    let mut driver = Ch34xDriver::with_resolver(transport, resolver);
    let result = session(&mut driver, &info);
    let closed = block_on(driver.close());

    let value = result?;
    closed.context("Failed to release device")?;
    Ok(value)
}

fn list(selector: Option<DeviceSelector>) -> Result<()> {
    let context = Context::new().context("Failed to initialise libusb")?;
    let devices = device::find_devices(&context, selector)?;

    if devices.is_empty() {
        println!("{}", "No CH34x devices found".yellow());
        return Ok(());
    }

    for (_, info) in devices {
        println!("{}", info);
    }
    Ok(())
}

fn info(args: &DeviceArgs) -> Result<()> {
    let resolver = BaudRateResolver::default();

    with_driver(args, resolver, |driver, info| {
        let version = block_on(driver.read_version()).context("Failed to read chip version")?;
        let baud_regs = block_on(driver.read_register_pair(reg::pair(reg::DIVISOR, reg::PRESCALER)))
            .context("Failed to read baud registers")?;
        let lcr_regs = block_on(driver.read_register_pair(reg::pair(reg::LCR2, reg::LCR)))
            .context("Failed to read line control registers")?;

        let decoded = resolver.decode(baud_regs[0], baud_regs[1]);
        report::print_info(info, version, baud_regs, lcr_regs, decoded);
        Ok(())
    })
}

fn send_data(args: &SendArgs) -> Result<()> {
    let line = args.line_config();
    let payload = args.payload()?;

    println!("{}", "CH34x Bulk Sender".bold());
    println!("Baud: {}", line.baud_rate);
    println!("LCR: 0x{:02x}", line.lcr());
    println!();

    with_driver(&args.device, resolver(args.limited), |driver, _| {
        let version = block_on(driver.read_version()).context("Failed to read chip version")?;
        println!("Chip version: {}", version);

        let solution = block_on(driver.configure(&line)).context("Failed to configure UART")?;
        println!("{} {}", "Configured:".green(), solution);

        println!(
            "\nSending {} packet(s) of {} bytes...\n",
            args.packets,
            payload.len()
        );
        let summary = sender::send(driver, &payload, args.packets, report::print_sample)?;
        report::print_summary(&summary);
        Ok(())
    })
}
