#![cfg_attr(docsrs, feature(doc_cfg))]
//! # jkbms_lib
//!
//! This crate decodes the Bluetooth LE protocol of JK BMS (Battery Management System) devices
//! and provides an asynchronous client to query them.
//!
//! The decoding core is transport agnostic and performs no I/O: feed the raw notification
//! chunks of one connection into a [`Decoder`] and receive typed [`Record`]s.
//!
//! ## Features
//!
//! This crate uses a feature-based system to keep dependencies minimal.
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `jkbms` command-line tool.
//!
//! ### Client Features
//! - `ble`: Enables the **asynchronous** BLE client using `bluest` and `tokio`.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for serializing/deserializing data structures.
//! - `bin-dependencies`: Enables all features required by the `jkbms` binary executable (currently `ble` and `serde`).

/// Contains error types for the library.
mod error;
/// Protocol constants, checksum and command frames.
pub mod protocol;
/// Field level decoders.
pub mod decode;
/// Reassembly of notification chunks into frames.
pub mod framer;
/// Record types and the record parser.
pub mod record;
mod decoder;

pub use decoder::Decoder;
pub use error::Error;
pub use record::{CellData, CellEncoding, Info, Payload, Record, RecordType};

/// Asynchronous BLE client for JK BMS communication.
#[cfg_attr(docsrs, doc(cfg(feature = "ble")))]
#[cfg(feature = "ble")]
pub mod ble;
