//! Asynchronous BLE client for JK BMS devices using `bluest` on the Tokio runtime.
//!
//! The BMS exposes a single characteristic (`FFE1` of service `FFE0`) that
//! takes command frames on write and streams record fragments as notifications.
//!
//! # Example
//!
//! ```no_run
//! use jkbms_lib::ble::{BleConfig, Error, JkBms};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let config = BleConfig::new("JK-B2A24S");
//!     let mut bms = JkBms::connect(&config).await?;
//!
//!     let snapshot = bms.fetch(Duration::from_secs(10)).await?;
//!     println!("Total: {}", snapshot.cell_data.total_voltage);
//!
//!     bms.disconnect().await?;
//!     Ok(())
//! }
//! ```

use crate::decoder::Decoder;
use crate::protocol::Command;
use crate::record::{CellData, CellEncoding, Info, Payload, Record};
use bluest::{Adapter, Characteristic, Device, Uuid};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Service carrying the JK BMS serial characteristic.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
/// Characteristic used for commands (write) and records (notify).
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Errors specific to the BLE client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No Bluetooth adapter found")]
    AdapterNotFound,
    #[error("Device '{0}' not found")]
    DeviceNotFound(String),
    #[error("Connecting failed after {attempts} attempt(s): {source}")]
    ConnectFailed {
        attempts: u32,
        #[source]
        source: bluest::Error,
    },
    #[error("Service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    /// An error from the `bluest` crate.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] bluest::Error),
    /// No record of the expected type arrived in time.
    #[error("Timeout waiting for the answer to {0:?}")]
    Timeout(Command),
    #[error("Notification stream ended")]
    NotificationsEnded,
}

type Result<T> = std::result::Result<T, Error>;

/// How to find and connect to a BMS.
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Advertised name of the BMS.
    pub device_name: String,
    pub scan_timeout: Duration,
    pub connect_attempts: u32,
    pub retry_delay: Duration,
    pub cell_encoding: CellEncoding,
}

impl BleConfig {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            scan_timeout: Duration::from_secs(30),
            connect_attempts: 30,
            retry_delay: Duration::from_secs(2),
            cell_encoding: CellEncoding::default(),
        }
    }
}

/// Result of one [`JkBms::fetch`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Snapshot {
    /// `None` if the BMS did not answer the info request.
    pub info: Option<Info>,
    pub cell_data: CellData,
}

/// A connected JK BMS.
///
/// Owns the decoder of its connection, several devices need several instances.
pub struct JkBms {
    adapter: Adapter,
    device: Device,
    characteristic: Characteristic,
    decoder: Decoder,
}

impl JkBms {
    /// Scans for the device named in `config`, connects and discovers the characteristic.
    pub async fn connect(config: &BleConfig) -> Result<Self> {
        let adapter = Adapter::default().await.ok_or(Error::AdapterNotFound)?;
        adapter.wait_available().await?;

        let device = timeout(
            config.scan_timeout,
            Self::discover_device(&adapter, &config.device_name),
        )
        .await
        .map_err(|_| Error::DeviceNotFound(config.device_name.clone()))??;
        log::info!("Found device '{}' ({:?})", config.device_name, device.id());

        Self::connect_with_retries(&adapter, &device, config).await?;

        let service = device
            .discover_services_with_uuid(SERVICE_UUID)
            .await?
            .first()
            .ok_or(Error::ServiceNotFound(SERVICE_UUID))?
            .clone();
        let characteristic = service
            .discover_characteristics_with_uuid(CHARACTERISTIC_UUID)
            .await?
            .first()
            .ok_or(Error::CharacteristicNotFound(CHARACTERISTIC_UUID))?
            .clone();

        Ok(Self {
            adapter,
            device,
            characteristic,
            decoder: Decoder::new(config.cell_encoding),
        })
    }

    async fn discover_device(adapter: &Adapter, name: &str) -> Result<Device> {
        let mut adapter_events = adapter.scan(&[]).await?;
        while let Some(advertising) = adapter_events.next().await {
            match advertising.device.name_async().await {
                Ok(device_name) if device_name == name => return Ok(advertising.device),
                Ok(device_name) => log::trace!("Ignoring device '{device_name}'"),
                Err(err) => log::trace!("Device without name: {err}"),
            }
        }
        Err(Error::DeviceNotFound(name.to_string()))
    }

    async fn connect_with_retries(
        adapter: &Adapter,
        device: &Device,
        config: &BleConfig,
    ) -> Result<()> {
        let attempts = config.connect_attempts.max(1);
        let mut attempt = 1;
        loop {
            match adapter.connect_device(device).await {
                Ok(()) => {
                    log::debug!("Connected after {attempt} attempt(s)");
                    return Ok(());
                }
                Err(err) if attempt < attempts => {
                    log::warn!("Failed connect try {attempt} of {attempts}, repeating ({err})");
                    tokio::time::sleep(config.retry_delay).await;
                    attempt += 1;
                }
                Err(source) => return Err(Error::ConnectFailed { attempts, source }),
            }
        }
    }

    /// Sends `command` and waits for the first record of the type it is answered with.
    ///
    /// Records of other types and records failing to decode are logged and skipped.
    pub async fn request(&mut self, command: Command, wait: Duration) -> Result<Record> {
        let expected = command.expected_record();
        let deadline = Instant::now() + wait;
        self.decoder.reset();

        let mut notifications = self.characteristic.notify().await?;
        log::trace!("Sending {command:?}: {:02X?}", command.request());
        self.characteristic.write(&command.request()).await?;

        loop {
            let chunk = match timeout_at(deadline, notifications.next()).await {
                Err(_) => return Err(Error::Timeout(command)),
                Ok(None) => return Err(Error::NotificationsEnded),
                Ok(Some(chunk)) => chunk?,
            };
            match self.decoder.feed(&chunk) {
                Some(Ok(record)) if record.record_type() == Some(expected) => return Ok(record),
                Some(Ok(record)) => log::debug!(
                    "Skipping record #{} while waiting for {expected:?}",
                    record.sequence_number
                ),
                Some(Err(err)) => log::warn!("Dropping record: {err}"),
                None => {}
            }
        }
    }

    pub async fn read_info(&mut self, wait: Duration) -> Result<Info> {
        match self.request(Command::GetInfo, wait).await?.payload {
            Payload::Info(info) => Ok(info),
            _ => Err(Error::Timeout(Command::GetInfo)),
        }
    }

    pub async fn read_cell_data(&mut self, wait: Duration) -> Result<CellData> {
        match self.request(Command::GetCellInfo, wait).await?.payload {
            Payload::CellData(cell_data) => Ok(cell_data),
            _ => Err(Error::Timeout(Command::GetCellInfo)),
        }
    }

    /// Reads device info followed by cell data. A missing info answer is not fatal.
    pub async fn fetch(&mut self, wait: Duration) -> Result<Snapshot> {
        let info = match self.read_info(wait).await {
            Ok(info) => Some(info),
            Err(err) => {
                log::warn!("Reading device info failed: {err}");
                None
            }
        };
        let cell_data = self.read_cell_data(wait).await?;
        Ok(Snapshot { info, cell_data })
    }

    pub async fn disconnect(self) -> Result<()> {
        self.adapter.disconnect_device(&self.device).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuids() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "0000ffe0-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            CHARACTERISTIC_UUID.to_string(),
            "0000ffe1-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn config_defaults() {
        let config = BleConfig::new("JK-B2A24S");
        assert_eq!(config.device_name, "JK-B2A24S");
        assert_eq!(config.connect_attempts, 30);
        assert_eq!(config.retry_delay, Duration::from_secs(2));
        assert_eq!(config.cell_encoding, CellEncoding::TwoByte);
    }
}
