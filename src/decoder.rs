//! RuuviTag payload decoding for data formats 3 and 5.
//!
//! The decoder does not care where the bytes came from: it looks for a
//! manufacturer-data marker anywhere in the advertisement, so both complete AD
//! structures (HCI) and re-framed manufacturer data (BlueZ) decode the same.
//!
//! See: https://github.com/ruuvi/ruuvi-sensor-protocols

use crate::mac_address::MacAddress;
use crate::reading::Reading;
use std::time::SystemTime;
use thiserror::Error;

/// AD type 0xFF followed by Ruuvi manufacturer ID 0x0499 (little-endian) and
/// the data format byte.
pub const FORMAT_3_MARKER: [u8; 4] = [0xFF, 0x99, 0x04, 0x03];
pub const FORMAT_5_MARKER: [u8; 4] = [0xFF, 0x99, 0x04, 0x05];

/// Bytes following the marker in each layout.
pub const FORMAT_3_LEN: usize = 13;
pub const FORMAT_5_LEN: usize = 23;

/// Errors returned by [`decode`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// No Ruuvi marker in the payload. Expected for any other device on air.
    #[error("Not a RuuviTag payload")]
    NotRecognized,
    /// Marker present but the payload ends before the fixed layout does.
    #[error("Truncated format {format} payload: expected {expected} bytes, got {actual}")]
    Truncated {
        format: u8,
        expected: usize,
        actual: usize,
    },
}

/// Decode an advertisement payload, stamping it with the current time.
pub fn decode(address: MacAddress, raw: &[u8]) -> Result<Reading, DecodeError> {
    decode_at(address, raw, SystemTime::now())
}

/// Decode an advertisement payload with an explicit capture time.
///
/// Format 3 wins if both markers are present, since its marker is looked for
/// first across the whole buffer.
pub fn decode_at(
    address: MacAddress,
    raw: &[u8],
    captured_at: SystemTime,
) -> Result<Reading, DecodeError> {
    if let Some(body) = find_body(raw, &FORMAT_3_MARKER) {
        let body = fixed(body, 3, FORMAT_3_LEN)?;
        return Ok(decode_v3(address, body, captured_at));
    }

    if let Some(body) = find_body(raw, &FORMAT_5_MARKER) {
        let body = fixed(body, 5, FORMAT_5_LEN)?;
        return Ok(decode_v5(address, body, captured_at));
    }

    Err(DecodeError::NotRecognized)
}

/// Bytes after the first occurrence of `marker`.
fn find_body<'a>(raw: &'a [u8], marker: &[u8; 4]) -> Option<&'a [u8]> {
    raw.windows(marker.len())
        .position(|window| window == marker)
        .map(|at| &raw[at + marker.len()..])
}

fn fixed(body: &[u8], format: u8, expected: usize) -> Result<&[u8], DecodeError> {
    body.get(..expected).ok_or(DecodeError::Truncated {
        format,
        expected,
        actual: body.len(),
    })
}

fn be_u16(body: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([body[at], body[at + 1]])
}

fn be_i16(body: &[u8], at: usize) -> i16 {
    i16::from_be_bytes([body[at], body[at + 1]])
}

fn pressure_hpa(raw: u16) -> f64 {
    (f64::from(raw) + 50_000.0) / 100.0
}

fn milli(raw: i16) -> f64 {
    f64::from(raw) / 1000.0
}

// Layout: humidity u8, temperature i8, temperature fraction u8, pressure u16,
// acceleration x/y/z i16, battery u16.
fn decode_v3(address: MacAddress, body: &[u8], captured_at: SystemTime) -> Reading {
    let temperature_integer = body[1] as i8;
    let temperature_fraction = body[2];

    Reading {
        // The fraction is added as-is, so -5 with 50 hundredths reads -4.5.
        temperature: f64::from(temperature_integer) + f64::from(temperature_fraction) / 100.0,
        humidity: f64::from(body[0]) * 0.5,
        pressure: pressure_hpa(be_u16(body, 3)),
        acceleration_x: milli(be_i16(body, 5)),
        acceleration_y: milli(be_i16(body, 7)),
        acceleration_z: milli(be_i16(body, 9)),
        battery_voltage: f64::from(be_u16(body, 11)) / 1000.0,
        ..Reading::empty(address, 3, captured_at)
    }
}

// Layout: temperature i16, humidity u16, pressure u16, acceleration x/y/z i16,
// power u16 (11 bit battery, 5 bit tx power), movement u8, sequence u16, MAC u48.
fn decode_v5(address: MacAddress, body: &[u8], captured_at: SystemTime) -> Reading {
    let power = be_u16(body, 12);
    let battery_raw = power >> 5;
    let tx_power_raw = power & 0x1F;

    let mut source_mac = [0u8; 6];
    source_mac.copy_from_slice(&body[17..23]);

    Reading {
        address,
        protocol_version: 5,
        temperature: f64::from(be_i16(body, 0)) * 0.005,
        humidity: f64::from(be_u16(body, 2)) * 0.0025,
        pressure: pressure_hpa(be_u16(body, 4)),
        acceleration_x: milli(be_i16(body, 6)),
        acceleration_y: milli(be_i16(body, 8)),
        acceleration_z: milli(be_i16(body, 10)),
        battery_voltage: (f64::from(battery_raw) + 1600.0) / 1000.0,
        tx_power: -40.0 + f64::from(tx_power_raw),
        movement_counter: body[14],
        measurement_sequence: be_u16(body, 15),
        source_mac: Some(MacAddress(source_mac)),
        captured_at,
    }
}
