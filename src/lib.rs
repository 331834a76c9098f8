//! `ruuvitag-monitor` library.
//!
//! Decodes RuuviTag manufacturer data (formats 3 and 5) from BLE
//! advertisements and offers two ways to consume it:
//!
//! - [`ScanDaemon`]: continuous passive scan that keeps the last reading and a
//!   sticky movement flag per tag, delivering every update to a [`Handler`].
//! - [`BoundedScan`]: one-shot active scan with a time budget, yielding
//!   readings as they arrive.
//!
//! The binary (`src/main.rs`) is responsible for logging setup and process exit
//! codes. The command-line flow lives in [`crate::app`] where it can be tested
//! with an injected radio and output stream.

pub mod app;
pub mod bounded;
pub mod daemon;
pub mod decoder;
pub mod dispatch;
pub mod mac_address;
pub mod output;
pub mod radio;
pub mod reading;
pub mod registry;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use bounded::{BoundedScan, scan, scan_with};
pub use daemon::{DaemonHandle, DaemonState, ScanDaemon, ScanError, ScanStats, StopHandle};
pub use decoder::{DecodeError, decode, decode_at};
pub use dispatch::{Handler, HandlerError, NoopHandler};
pub use mac_address::MacAddress;
pub use output::OutputFormatter;
pub use output::influxdb::InfluxDbFormatter;
pub use radio::{Backend, Radio, RadioError, RawAdvertisement, ScanMode};
pub use reading::{FieldValue, Reading};
pub use registry::{DeviceState, Registry, SharedRegistry};
