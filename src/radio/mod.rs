//! Radio abstraction over BLE scanning backends.
//!
//! The scan daemon and the bounded scan only need three operations from a
//! radio: start scanning, wait a bounded time for advertisements, and stop.
//! Backends differ in how they get there but all hand over the raw
//! advertisement bytes, leaving decoding to [`crate::decoder`].

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::mac_address::MacAddress;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// A single advertisement as received from the air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAdvertisement {
    pub address: MacAddress,
    pub payload: Vec<u8>,
}

/// Whether the radio sends scan requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Listen only
    Passive,
    /// Request scan responses from advertisers
    Active,
}

/// Failure of the radio itself. Scanning cannot continue after one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// Backend not available (not compiled in)
    #[error("Backend '{0}' not available (not compiled in)")]
    BackendNotAvailable(String),
    /// `poll` called before `start` or after `stop`
    #[error("Radio is not scanning")]
    NotScanning,
}

/// Boxed future returned by [`Radio`] methods.
pub type RadioFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RadioError>> + Send + 'a>>;

/// A BLE scanning capability.
pub trait Radio: Send {
    /// Begin scanning in the given mode.
    fn start(&mut self, mode: ScanMode) -> RadioFuture<'_, ()>;

    /// Wait at most `timeout` for advertisements and return what arrived.
    /// An empty batch is not an error.
    fn poll(&mut self, timeout: Duration) -> RadioFuture<'_, Vec<RawAdvertisement>>;

    /// Stop scanning and release the scan session.
    fn stop(&mut self) -> RadioFuture<'_, ()>;
}

impl<R: Radio + ?Sized> Radio for Box<R> {
    fn start(&mut self, mode: ScanMode) -> RadioFuture<'_, ()> {
        (**self).start(mode)
    }

    fn poll(&mut self, timeout: Duration) -> RadioFuture<'_, Vec<RawAdvertisement>> {
        (**self).poll(timeout)
    }

    fn stop(&mut self) -> RadioFuture<'_, ()> {
        (**self).stop()
    }
}

#[cfg(not(any(feature = "bluer", feature = "hci")))]
compile_error!("At least one radio backend feature (bluer, hci) must be enabled");

/// Available radio backends. The first compiled-in one is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    #[default]
    #[value(alias = "bluez")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    #[cfg_attr(not(feature = "bluer"), default)]
    #[value(alias = "raw")]
    Hci,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match clap::ValueEnum::to_possible_value(self) {
            Some(value) => f.write_str(value.get_name()),
            None => Ok(()),
        }
    }
}

/// Case-insensitive, accepts the same names and aliases as the command line.
impl FromStr for Backend {
    type Err = RadioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as clap::ValueEnum>::from_str(s, true)
            .map_err(|_| RadioError::BackendNotAvailable(s.to_string()))
    }
}

/// Create a radio for the given backend and adapter index (`hci<N>`).
///
/// Nothing touches the hardware until [`Radio::start`] is called.
pub fn open(backend: Backend, interface_index: u16) -> Box<dyn Radio> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => Box::new(bluer::BluerRadio::new(interface_index)),
        #[cfg(feature = "hci")]
        Backend::Hci => Box::new(hci::HciRadio::new(interface_index)),
    }
}
