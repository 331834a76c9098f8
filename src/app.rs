//! Command-line runner for `ruuvitag-monitor`.
//!
//! This module is intentionally decoupled from process setup (logging, exit
//! codes, signal handling) so it can be tested with a scripted radio and an
//! in-memory output.

use crate::bounded::BoundedScan;
use crate::daemon::{DEFAULT_POLL_INTERVAL, ScanDaemon, ScanError, StopHandle};
use crate::dispatch::HandlerError;
use crate::output::{self, Format};
use crate::radio::{Backend, Radio};
use crate::registry::{DeviceState, SharedRegistry};
use clap::Parser;
use log::info;
use std::future::Future;
use std::io;
use std::io::Write;
use std::time::Duration;
use thiserror::Error;

/// Command-line options.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Bluetooth backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Index of the Bluetooth adapter (hci<N>)
    #[arg(short = 'i', long, default_value_t = 0)]
    pub interface: u16,

    /// Scan once for this long, print every reading and exit.
    /// Without it, scan until interrupted and track tag state.
    /// Accepts duration with suffix: 3s, 1m, 500ms, 2h.
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Longest time a single radio poll may block
    #[arg(long, value_parser = parse_duration, default_value = "100ms")]
    pub poll_interval: Duration,

    /// Output format
    #[arg(long, default_value_t, value_enum)]
    pub format: Format,

    /// The name of the measurement in InfluxDB line protocol.
    #[arg(long, default_value = "ruuvi_measurement")]
    pub influxdb_measurement: String,

    /// Verbose output, log discarded advertisements and state changes
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            interface: 0,
            timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            format: Format::default(),
            influxdb_measurement: "ruuvi_measurement".to_string(),
            verbose: false,
        }
    }
}

/// Errors returned by [`run_with_io`].
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Parse a duration from a human-readable string.
///
/// Supports `ms`, `s`, `m` and `h` suffixes; a bare number is seconds.
///
/// # Examples
/// ```
/// use ruuvitag_monitor::app::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    // "ms" must be tried before "m" and "s"
    const UNITS: [(&str, u64); 4] = [("ms", 1), ("h", 3_600_000), ("m", 60_000), ("s", 1000)];

    let (number, millis_per_unit) = UNITS
        .iter()
        .find_map(|&(suffix, millis)| src.strip_suffix(suffix).map(|n| (n, millis)))
        .unwrap_or((src, 1000));

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {src}"))?;

    value
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration too large: {src}"))
}

/// Run a bounded scan or the continuous daemon, depending on `options.timeout`.
///
/// - Bounded: every decoded reading is written to `out` until the timeout
///   or until `shutdown` completes, whichever comes first.
/// - Continuous: each registry update is written to `out`; new tags and
///   movement are logged and the movement flag is cleared once reported.
///   Runs until `shutdown` completes or the radio fails.
pub async fn run_with_io<R, S>(
    options: Options,
    radio: R,
    shutdown: S,
    out: &mut dyn Write,
) -> Result<(), RunError>
where
    R: Radio,
    S: Future<Output = ()>,
{
    match options.timeout {
        Some(timeout) => run_bounded(&options, radio, timeout, shutdown, out).await,
        None => run_continuous(&options, radio, shutdown, out).await,
    }
}

async fn run_bounded<R, S>(
    options: &Options,
    radio: R,
    timeout: Duration,
    shutdown: S,
    out: &mut dyn Write,
) -> Result<(), RunError>
where
    R: Radio,
    S: Future<Output = ()>,
{
    let formatter = output::formatter(options.format, &options.influxdb_measurement);
    let mut scan = BoundedScan::new(radio, timeout).with_poll_interval(options.poll_interval);
    tokio::pin!(shutdown);

    loop {
        let reading = tokio::select! {
            reading = scan.next() => reading,
            () = &mut shutdown => {
                scan.cancel().await;
                None
            }
        };
        let Some(reading) = reading else { break };

        if let Err(e) = writeln!(out, "{}", formatter.format(&reading)) {
            scan.cancel().await;
            return Err(e.into());
        }
    }

    match scan.error() {
        Some(e) => Err(ScanError::Radio(e.clone()).into()),
        None => Ok(()),
    }
}

async fn run_continuous<R, S>(
    options: &Options,
    radio: R,
    shutdown: S,
    out: &mut dyn Write,
) -> Result<(), RunError>
where
    R: Radio,
    S: Future<Output = ()>,
{
    let formatter = output::formatter(options.format, &options.influxdb_measurement);
    let registry = SharedRegistry::new();
    let stop = StopHandle::new();
    let mut write_error: Option<io::Error> = None;

    let result = {
        let handler = |state: &DeviceState, is_new: bool| -> Result<(), HandlerError> {
            let reading = &state.last_reading;
            if is_new {
                info!("New tag {} (data format {})", reading.address, reading.protocol_version);
            }
            if state.movement_detected {
                info!(
                    "Movement detected on {} (counter {})",
                    reading.address, reading.movement_counter
                );
                registry.clear_movement(&reading.address);
            }

            if let Err(e) = writeln!(out, "{}", formatter.format(reading)) {
                // Nothing useful can happen once the output is gone.
                stop.stop();
                let message = e.to_string();
                write_error.get_or_insert(e);
                return Err(message.into());
            }
            Ok(())
        };

        let mut daemon = ScanDaemon::with_registry(radio, registry.clone(), handler)
            .with_stop_handle(stop.clone())
            .with_poll_interval(options.poll_interval);

        let run = daemon.run();
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => result,
            () = shutdown => {
                stop.stop();
                run.await
            }
        }
    };

    if let Some(e) = write_error {
        return Err(e.into());
    }

    let stats = result?;
    info!(
        "Scan finished: {} tags, {} readings, {} unrecognized, {} truncated",
        registry.len(),
        stats.decoded,
        stats.not_recognized,
        stats.truncated
    );
    Ok(())
}
