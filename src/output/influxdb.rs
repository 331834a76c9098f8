//! InfluxDB line protocol output formatter.

use crate::output::OutputFormatter;
use crate::reading::{self, Reading};
use std::collections::BTreeMap;
use std::fmt;
#[cfg(test)]
use std::time::Duration;
use std::time::SystemTime;

/// A field value as it appears on the wire.
#[derive(Debug, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    String(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::Float(num) => write!(f, "{num}"),
            FieldValue::Integer(num) => write!(f, "{num}i"),
            FieldValue::String(s) => {
                write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
            }
        }
    }
}

/// Escape commas, spaces and (for tags) equals signs in identifiers.
fn escape(value: &str, chars: &[char]) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if chars.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// One line of InfluxDB line protocol.
#[derive(Debug)]
pub struct DataPoint {
    pub measurement: String,
    pub tags: BTreeMap<&'static str, String>,
    pub fields: BTreeMap<&'static str, FieldValue>,
    pub timestamp: Option<SystemTime>,
}

impl fmt::Display for DataPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&escape(&self.measurement, &[',', ' ']))?;
        for (key, value) in &self.tags {
            write!(f, ",{key}={}", escape(value, &[',', ' ', '=']))?;
        }

        for (i, (key, value)) in self.fields.iter().enumerate() {
            let separator = if i == 0 { ' ' } else { ',' };
            write!(f, "{separator}{key}={value}")?;
        }

        // Pre-epoch timestamps are left out and InfluxDB assigns its own.
        if let Some(since_epoch) = self
            .timestamp
            .and_then(|time| time.duration_since(SystemTime::UNIX_EPOCH).ok())
        {
            write!(f, " {}", since_epoch.as_nanos())?;
        }
        Ok(())
    }
}

/// Reading fields that become tags or the timestamp rather than fields.
const NON_FIELD_NAMES: [&str; 3] = ["address", "protocol_version", "captured_at"];

/// InfluxDB line protocol formatter.
///
/// Tags are the tag address and data format; every numeric reading field
/// becomes a field. NaN values (fields the data format does not carry) are
/// left out since line protocol cannot represent them.
pub struct InfluxDbFormatter {
    /// The measurement name in InfluxDB
    measurement_name: String,
}

impl InfluxDbFormatter {
    pub fn new(measurement_name: String) -> Self {
        Self { measurement_name }
    }

    fn fields(r: &Reading) -> BTreeMap<&'static str, FieldValue> {
        r.fields()
            .into_iter()
            .filter(|(name, _)| !NON_FIELD_NAMES.contains(name))
            .filter_map(|(name, value)| {
                let value = match value {
                    reading::FieldValue::Float(v) if v.is_nan() => return None,
                    reading::FieldValue::Float(v) => FieldValue::Float(v),
                    reading::FieldValue::Integer(v) => FieldValue::Integer(v),
                    reading::FieldValue::Text(s) => FieldValue::String(s),
                    reading::FieldValue::Timestamp(_) => return None,
                };
                Some((name, value))
            })
            .collect()
    }

    fn to_data_point(&self, r: &Reading) -> DataPoint {
        DataPoint {
            measurement: self.measurement_name.clone(),
            tags: BTreeMap::from([
                ("mac", r.address.to_string()),
                ("protocol", r.protocol_version.to_string()),
            ]),
            fields: Self::fields(r),
            timestamp: Some(r.captured_at),
        }
    }
}

impl OutputFormatter for InfluxDbFormatter {
    fn format(&self, reading: &Reading) -> String {
        self.to_data_point(reading).to_string()
    }
}
