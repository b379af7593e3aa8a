use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use jkbms_lib::ble::{BleConfig, JkBms};
use log::*;
use std::{ops::Deref, panic, time::Duration};

mod commandline;
mod daemon;
mod mqtt;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .with_context(|| "Cannot init logging")?
        .start()
        .with_context(|| "Cannot start logging")?;

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
    Ok(log_handle)
}

macro_rules! print_info {
    ($bms:expr, $timeout:expr) => {
        for (name, value) in $bms
            .read_info($timeout)
            .await
            .with_context(|| "Cannot get device info")?
            .fields()
        {
            println!("{name}: {value}");
        }
    };
}
macro_rules! print_cell_data {
    ($bms:expr, $timeout:expr) => {
        for (name, value) in $bms
            .read_cell_data($timeout)
            .await
            .with_context(|| "Cannot get cell data")?
            .text_fields()
        {
            println!("{name}: {value}");
        }
    };
}

async fn run_once(config: &BleConfig, timeout: Duration, command: CliCommands) -> Result<()> {
    let mut bms = JkBms::connect(config)
        .await
        .with_context(|| format!("Cannot connect to '{}'", config.device_name))?;

    let result: Result<()> = async {
        match command {
            CliCommands::Info => print_info!(bms, timeout),
            CliCommands::CellData => print_cell_data!(bms, timeout),
            CliCommands::All => {
                print_info!(bms, timeout);
                print_cell_data!(bms, timeout);
            }
            CliCommands::Daemon { .. } => {}
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    bms.disconnect()
        .await
        .with_context(|| "Cannot disconnect")?;
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter())?;

    let config = args.ble_config();

    match args.command {
        CliCommands::Daemon {
            output,
            interval,
            error_backoff,
        } => daemon::run(config, args.timeout, output, interval, error_backoff).await,
        command => run_once(&config, args.timeout, command).await,
    }
}
