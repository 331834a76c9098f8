//! Output formatters for readings.
//!
//! This module provides a trait for formatting readings and implementations
//! for the supported output formats: a human-readable line and InfluxDB line
//! protocol.

pub mod influxdb;

use crate::reading::Reading;

/// Trait for formatting readings into output lines.
pub trait OutputFormatter: Send + Sync {
    /// Format a reading as a single line, without trailing newline.
    fn format(&self, reading: &Reading) -> String;
}

/// Human-readable rendering, see the `Display` impl of [`Reading`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TextFormatter;

impl OutputFormatter for TextFormatter {
    fn format(&self, reading: &Reading) -> String {
        reading.to_string()
    }
}

/// Output formats selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Format {
    /// One human-readable line per reading
    #[default]
    Text,
    /// InfluxDB line protocol (e.g. for Telegraf execd)
    Influx,
}

/// Build the formatter for a format.
pub fn formatter(format: Format, influxdb_measurement: &str) -> Box<dyn OutputFormatter> {
    match format {
        Format::Text => Box::new(TextFormatter),
        Format::Influx => Box::new(influxdb::InfluxDbFormatter::new(
            influxdb_measurement.to_string(),
        )),
    }
}
