use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use seplosbms_lib::connector::SeplosBms;
use std::{ops::Deref, panic, sync::Arc};

mod commandline;
mod config;
mod daemon;

use commandline::{CliArgs, CliCommands};
use config::{ConfigFile, Settings};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

macro_rules! print_telemetry {
    ($bms:expr, $address:expr) => {
        println!(
            "Telemetry {}: {:?}",
            $address,
            $bms.request_telemetry($address)
                .await
                .with_context(|| format!("Cannot get telemetry from {}", $address))?
        )
    };
}
macro_rules! print_alarm {
    ($bms:expr, $address:expr) => {
        println!(
            "Alarm {}: {:?}",
            $address,
            $bms.request_alarm($address)
                .await
                .with_context(|| format!("Cannot get alarms from {}", $address))?
        )
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let mut settings = Settings::from(&args);
    if let CliCommands::Daemon {
        config_file: Some(config_file),
        ..
    } = &args.command
    {
        let config = ConfigFile::load(config_file)
            .with_context(|| format!("Failed to open config file at '{config_file}'"))?;
        info!("Successfully loaded config from {config_file}: {config:?}");
        config.apply(&mut settings);
    }
    debug!("Settings: {settings:?}");

    let bms = Arc::new(SeplosBms::new(&settings.device));
    bms.set_timeout(settings.timeout);
    bms.set_store_size(settings.store_size);
    bms.set_interval(settings.interval);

    match args.command {
        CliCommands::Scan => {
            let devices = bms
                .initialize()
                .await
                .with_context(|| format!("Cannot open serial port '{}'", settings.device))?;
            println!("Devices: {devices:?}");
        }
        CliCommands::Telemetry { address } => {
            bms.open()
                .await
                .with_context(|| format!("Cannot open serial port '{}'", settings.device))?;
            print_telemetry!(bms, address);
        }
        CliCommands::Alarm { address } => {
            bms.open()
                .await
                .with_context(|| format!("Cannot open serial port '{}'", settings.device))?;
            print_alarm!(bms, address);
        }
        CliCommands::All => {
            let devices = bms
                .initialize()
                .await
                .with_context(|| format!("Cannot open serial port '{}'", settings.device))?;
            println!("Devices: {devices:?}");
            bms.poll_once().await;
            for (address, samples) in bms.telemetry_history() {
                println!("Telemetry {address}: {samples:?}");
            }
            for (address, samples) in bms.alarm_history() {
                println!("Alarm {address}: {samples:?}");
            }
        }
        CliCommands::Daemon {
            format,
            report_interval,
            ..
        } => {
            bms.initialize()
                .await
                .with_context(|| format!("Cannot open serial port '{}'", settings.device))?;
            daemon::run(bms.clone(), format, report_interval).await?;
        }
    }

    bms.shutdown().await;
    Ok(())
}
