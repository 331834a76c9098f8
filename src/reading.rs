//! Decoded RuuviTag reading.

use crate::mac_address::MacAddress;
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Names of every field exposed through [`Reading::field`], in display order.
pub const FIELD_NAMES: [&str; 14] = [
    "address",
    "protocol_version",
    "temperature",
    "humidity",
    "pressure",
    "acceleration_x",
    "acceleration_y",
    "acceleration_z",
    "battery_voltage",
    "tx_power",
    "movement_counter",
    "measurement_sequence",
    "source_mac",
    "captured_at",
];

/// One decoded snapshot of a tag's sensors.
///
/// Units:
/// - Temperature in Celsius
/// - Humidity in percent (0-100)
/// - Pressure in hectopascals
/// - Acceleration in g (standard gravity)
/// - Battery voltage in Volts
/// - TX power in dBm
///
/// Fields a protocol version does not carry are NaN (floats), 0 (counters)
/// or `None` (source MAC). They are never filtered here.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Address the advertisement was received from
    pub address: MacAddress,
    /// Data format, 3 or 5
    pub protocol_version: u8,
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub acceleration_x: f64,
    pub acceleration_y: f64,
    pub acceleration_z: f64,
    pub battery_voltage: f64,
    /// Format 5 only
    pub tx_power: f64,
    /// Format 5 only
    pub movement_counter: u8,
    /// Format 5 only
    pub measurement_sequence: u16,
    /// MAC embedded in a format 5 payload, not checked against `address`
    pub source_mac: Option<MacAddress>,
    /// When the advertisement was decoded
    pub captured_at: SystemTime,
}

/// A single named value of a [`Reading`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Text(String),
    Timestamp(SystemTime),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(num) => write!(f, "{num}"),
            FieldValue::Integer(num) => write!(f, "{num}"),
            FieldValue::Text(s) => write!(f, "{s}"),
            FieldValue::Timestamp(t) => match iso8601(*t) {
                Some(iso) => f.write_str(&iso),
                None => write!(f, "{t:?}"),
            },
        }
    }
}

/// Render a timestamp as RFC 3339 (ISO-8601) in UTC.
pub fn iso8601(time: SystemTime) -> Option<String> {
    OffsetDateTime::from(time).format(&Rfc3339).ok()
}

impl Reading {
    /// A reading with every measured value at its "not present" default.
    pub fn empty(address: MacAddress, protocol_version: u8, captured_at: SystemTime) -> Self {
        Self {
            address,
            protocol_version,
            temperature: f64::NAN,
            humidity: f64::NAN,
            pressure: f64::NAN,
            acceleration_x: f64::NAN,
            acceleration_y: f64::NAN,
            acceleration_z: f64::NAN,
            battery_voltage: f64::NAN,
            tx_power: f64::NAN,
            movement_counter: 0,
            measurement_sequence: 0,
            source_mac: None,
            captured_at,
        }
    }

    /// Look up a field by name. Returns `None` for unknown names and for
    /// `source_mac` when the protocol does not carry it.
    pub fn field(&self, name: &str) -> Option<FieldValue> {
        let value = match name {
            "address" => FieldValue::Text(self.address.to_string()),
            "protocol_version" => FieldValue::Integer(i64::from(self.protocol_version)),
            "temperature" => FieldValue::Float(self.temperature),
            "humidity" => FieldValue::Float(self.humidity),
            "pressure" => FieldValue::Float(self.pressure),
            "acceleration_x" => FieldValue::Float(self.acceleration_x),
            "acceleration_y" => FieldValue::Float(self.acceleration_y),
            "acceleration_z" => FieldValue::Float(self.acceleration_z),
            "battery_voltage" => FieldValue::Float(self.battery_voltage),
            "tx_power" => FieldValue::Float(self.tx_power),
            "movement_counter" => FieldValue::Integer(i64::from(self.movement_counter)),
            "measurement_sequence" => FieldValue::Integer(i64::from(self.measurement_sequence)),
            "source_mac" => FieldValue::Text(self.source_mac?.to_string()),
            "captured_at" => FieldValue::Timestamp(self.captured_at),
            _ => return None,
        };
        Some(value)
    }

    /// Every present field keyed by name.
    pub fn fields(&self) -> BTreeMap<&'static str, FieldValue> {
        FIELD_NAMES
            .iter()
            .filter_map(|&name| self.field(name).map(|value| (name, value)))
            .collect()
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RuuviTag V{} {} {:.2}°C, {:.2}%, {}",
            self.protocol_version,
            self.address,
            self.temperature,
            self.humidity,
            iso8601(self.captured_at).unwrap_or_else(|| format!("{:?}", self.captured_at))
        )
    }
}
