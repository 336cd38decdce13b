use beeflash::flasher::{Config, Flasher, Outcome, Task};
use beeflash::serial::SerialPlatform;
use clap::Parser;
use std::process::ExitCode;

/// Firmware flash tool for ConBee/RaspBee Zigbee coordinators
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Force device reboot without programming
    #[arg(short = 'r')]
    reset: bool,

    /// Flash the given GCF firmware file
    #[arg(short = 'f', value_name = "firmware")]
    file: Option<String>,

    /// Serial device path, e.g. /dev/ttyUSB0
    #[arg(short = 'd', value_name = "device")]
    device: Option<String>,

    /// Connect and debug-print received packets
    #[arg(short = 'c')]
    connect: bool,

    /// List detected devices
    #[arg(short = 'l')]
    list: bool,

    /// Retry until timeout (seconds) is reached
    #[arg(short = 't', value_name = "seconds",
          value_parser = clap::value_parser!(u64).range(0..=3600))]
    timeout: Option<u64>,

    /// Debug log level
    #[arg(short = 'x', value_name = "level", default_value_t = 0,
          value_parser = clap::value_parser!(u8).range(0..=3))]
    debug_level: u8,

    /// Sniffer on the given Zigbee channel (requires sniffer firmware);
    /// captured traffic is sent to UDP port 17754
    #[arg(short = 's', value_name = "channel",
          value_parser = clap::value_parser!(u8).range(11..=26))]
    sniff_channel: Option<u8>,

    /// Send sniffer traffic to Wireshark running on this host
    #[arg(short = 'H', value_name = "host", default_value = "127.0.0.1")]
    sniff_host: String,

    /// Network server listen port
    #[arg(short = 'p', value_name = "port")]
    listen_port: Option<u16>,

    /// Interactive mode for debugging
    #[arg(short = 'i')]
    interactive: bool,

    #[arg(short = '?', hide = true, action = clap::ArgAction::Help)]
    help_alias: Option<bool>,
}

impl Cli {
    fn task(&self) -> Task {
        if self.file.is_some() {
            Task::Program
        } else if self.reset {
            Task::Reset
        } else if self.connect {
            Task::Connect
        } else if self.list {
            Task::List
        } else if self.sniff_channel.is_some() {
            Task::Sniff
        } else {
            Task::Help
        }
    }
}

fn run(args: Cli) -> anyhow::Result<ExitCode> {
    let config = Config {
        task: args.task(),
        device: args.device.unwrap_or_default(),
        file_path: args.file.unwrap_or_default(),
        timeout_secs: args.timeout,
        debug_level: args.debug_level,
        sniff_channel: args.sniff_channel.unwrap_or(0),
        sniff_host: args.sniff_host,
        interactive: args.interactive,
    };

    let mut platform = SerialPlatform::new(args.interactive, args.listen_port)?;
    let mut flasher = Flasher::new(config);

    platform.run(&mut flasher);

    Ok(match flasher.outcome() {
        Outcome::Success => ExitCode::SUCCESS,
        Outcome::ConfigError => ExitCode::from(2),
        Outcome::Pending | Outcome::Failed => ExitCode::FAILURE,
    })
}

fn main() -> ExitCode {
    let args = Cli::parse();

    let level = match args.debug_level {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };

    simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )
    .expect("Failed to initialize logger");

    match run(args) {
        Ok(code) => code,
        Err(err) => {
            if log::log_enabled!(log::Level::Debug) {
                log::error!("{err:?}");
            } else {
                log::error!("{err:#}");
            }
            ExitCode::from(2)
        }
    }
}
