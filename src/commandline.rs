use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use seplosbms_lib::protocol::Address;
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn parse_address(value: &str) -> Result<Address, String> {
    let address: u8 = value
        .parse()
        .map_err(|err| format!("'{value}' is not a number: {err}"))?;
    Address::new(address).map_err(|err| err.to_string())
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Scan addresses 0 to 15 and list the packs that answer
    Scan,
    /// Show telemetry of one pack: cell voltages, temperatures, current, voltage, SOC and SOH
    Telemetry {
        /// Address of the pack (0-15)
        #[arg(short, long, value_parser = parse_address, default_value = "0")]
        address: Address,
    },
    /// Show alarm and warning states of one pack
    Alarm {
        /// Address of the pack (0-15)
        #[arg(short, long, value_parser = parse_address, default_value = "0")]
        address: Address,
    },
    /// Scan the bus, poll every pack once and show all samples
    All,
    /// Run in daemon mode, continuously polling all packs and printing the latest samples
    Daemon {
        /// Output format of the printed samples
        #[arg(long, value_enum, default_value_t = OutputFormat::Console)]
        format: OutputFormat,
        /// Interval for printing the latest samples (e.g., "10s", "1m")
        #[arg(long, short, value_parser = humantime::parse_duration, default_value = "10s")]
        report_interval: Duration,
        /// YAML file overriding device, timeout, store size and polling interval
        #[arg(long)]
        config_file: Option<String>,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    /// Debug representation of every sample
    Console,
    /// One "address/kind/field value" line per value
    Simple,
    /// One JSON document per report
    Json,
}

const fn about_text() -> &'static str {
    "seplos bms command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Time to wait for the response of a pack (e.g., "250ms", "1s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "250ms")]
    pub timeout: Duration,

    /// Number of samples kept per pack for telemetry and alarms each
    #[arg(long, default_value = "100")]
    pub store_size: usize,

    /// Pause between two polling cycles over all packs (e.g., "0s", "500ms")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "0s")]
    pub interval: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_daemon_arguments() {
        let args = CliArgs::parse_from([
            "seplosbms",
            "--timeout",
            "500ms",
            "daemon",
            "--format",
            "json",
            "--report-interval",
            "1m",
        ]);
        assert_eq!(args.timeout, Duration::from_millis(500));
        assert_eq!(args.store_size, 100);
        assert_eq!(
            args.command,
            CliCommands::Daemon {
                format: OutputFormat::Json,
                report_interval: Duration::from_secs(60),
                config_file: None,
            }
        );
    }

    #[test]
    fn reject_address_out_of_range() {
        assert!(parse_address("15").is_ok());
        assert!(parse_address("16").is_err());
        assert!(parse_address("x").is_err());
        assert!(CliArgs::try_parse_from(["seplosbms", "telemetry", "--address", "16"]).is_err());
    }
}
