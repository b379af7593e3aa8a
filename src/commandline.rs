use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use jkbms_lib::ble::BleConfig;
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show device information: vendor, hardware/software version, uptime, power up count
    Info,
    /// Show cell voltages, wire resistances and pack measurements
    CellData,
    /// Show device information followed by cell data
    All,
    /// Run in daemon mode, periodically fetching and outputting cell data
    Daemon {
        /// Output destination for metrics
        #[command(subcommand)]
        output: DaemonOutput,
        /// Interval for fetching metrics (e.g., "10s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "60s")]
        interval: Duration,
        /// Delay before the next cycle after a failed one (e.g., "30s", "2m")
        #[clap(long, value_parser = humantime::parse_duration, default_value = "120s")]
        error_backoff: Duration,
    },
}

/// Width of the cell voltage and wire resistance fields
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum CellEncoding {
    /// 2 byte integers in mV / mOhm (current firmware)
    TwoByte,
    /// Proprietary 4 byte encoding (older firmware)
    FourByte,
}

impl From<CellEncoding> for jkbms_lib::CellEncoding {
    fn from(value: CellEncoding) -> Self {
        match value {
            CellEncoding::TwoByte => jkbms_lib::CellEncoding::TwoByte,
            CellEncoding::FourByte => jkbms_lib::CellEncoding::FourByte,
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously read metrics and print them to the standard output (console).
    Console,
    /// Continuously read metrics and publish them to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Simple)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "jk bms bluetooth command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Advertised Bluetooth name of the BMS (e.g., JK-B2A24S)
    #[arg(short, long)]
    pub name: String,

    #[command(subcommand)]
    pub command: CliCommands,

    /// How long to scan for the device (e.g., "10s", "1m")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "30s")]
    pub scan_timeout: Duration,

    /// How long to wait for the answer to a command (e.g., "5s", "10s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "10s")]
    pub timeout: Duration,

    /// Number of connection attempts
    #[arg(long, default_value = "30")]
    pub connect_attempts: u32,

    /// Delay between connection attempts (e.g., "2s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "2s")]
    pub retry_delay: Duration,

    /// Cell field width of the BMS firmware
    #[arg(long, value_enum, default_value_t = CellEncoding::TwoByte)]
    pub cell_encoding: CellEncoding,
}

impl CliArgs {
    pub fn ble_config(&self) -> BleConfig {
        BleConfig {
            device_name: self.name.clone(),
            scan_timeout: self.scan_timeout,
            connect_attempts: self.connect_attempts,
            retry_delay: self.retry_delay,
            cell_encoding: self.cell_encoding.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_defaults() {
        let args = CliArgs::parse_from(["jkbms", "--name", "JK-B2A24S", "daemon", "console"]);
        assert_eq!(
            args.command,
            CliCommands::Daemon {
                output: DaemonOutput::Console,
                interval: Duration::from_secs(60),
                error_backoff: Duration::from_secs(120),
            }
        );
        let config = args.ble_config();
        assert_eq!(config.device_name, "JK-B2A24S");
        assert_eq!(config.scan_timeout, Duration::from_secs(30));
        assert_eq!(config.connect_attempts, 30);
        assert_eq!(config.retry_delay, Duration::from_secs(2));
        assert_eq!(config.cell_encoding, jkbms_lib::CellEncoding::TwoByte);
    }

    #[test]
    fn mqtt_output_and_options() {
        let args = CliArgs::parse_from([
            "jkbms",
            "-n",
            "JKBMS-Top",
            "--cell-encoding",
            "four-byte",
            "--timeout",
            "2s 500ms",
            "daemon",
            "--interval",
            "5m",
            "mqtt",
            "--format",
            "json",
        ]);
        assert_eq!(args.timeout, Duration::from_millis(2500));
        assert_eq!(
            args.ble_config().cell_encoding,
            jkbms_lib::CellEncoding::FourByte
        );
        match args.command {
            CliCommands::Daemon {
                output,
                interval,
                ..
            } => {
                assert_eq!(interval, Duration::from_secs(300));
                assert_eq!(
                    output,
                    DaemonOutput::Mqtt {
                        config_file: "mqtt.yaml".to_string(),
                        format: MqttFormat::Json
                    }
                );
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn name_is_required() {
        assert!(CliArgs::try_parse_from(["jkbms", "info"]).is_err());
    }
}
