use crate::mac_address::MacAddress;
use crate::radio::{Radio, RadioError, RadioFuture, RawAdvertisement, ScanMode};
use crate::reading::Reading;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Format 3 payload: 25.0 %, 20.10 °C, 740.00 hPa, (-1.0, 0.5, 1.036) g, 2.899 V.
pub fn v3_payload() -> Vec<u8> {
    vec![
        0xFF, 0x99, 0x04, 0x03, // Marker
        0x32, // Humidity: 50 * 0.5 = 25.0 %
        0x14, // Temperature: 20
        0x0A, // Temperature fraction: .10
        0x5D, 0xC0, // Pressure: (24000 + 50000) / 100 = 740.00 hPa
        0xFC, 0x18, // Acceleration X: -1000 mG
        0x01, 0xF4, // Acceleration Y: 500 mG
        0x04, 0x0C, // Acceleration Z: 1036 mG
        0x0B, 0x53, // Battery: 2899 mV
    ]
}

/// Format 5 payload with movement counter 66.
pub fn v5_payload() -> Vec<u8> {
    vec![
        0xFF, 0x99, 0x04, 0x05, // Marker
        0x12, 0xFC, // Temperature: 24.30°C (0x12FC = 4860, 4860 * 0.005 = 24.30)
        0x53, 0x94, // Humidity: 53.49% (0x5394 = 21396, 21396 * 0.0025 = 53.49)
        0xC3, 0x7C, // Pressure: 1000.44 hPa (0xC37C = 50044, 50044 + 50000 = 100044 Pa)
        0x00, 0x04, // Acceleration X: 4 mG
        0xFF, 0xFC, // Acceleration Y: -4 mG
        0x04, 0x0C, // Acceleration Z: 1036 mG
        0xAC, 0x36, // Battery: 2977 mV, TX Power: -18 dBm
        0x42, // Movement counter: 66
        0x00, 0xCD, // Sequence: 205
        0xCB, 0xB8, 0x33, 0x4C, 0x88, 0x4F, // Source MAC
    ]
}

/// Same as [`v5_payload`] with a different movement counter.
pub fn v5_payload_with_movement(movement_counter: u8) -> Vec<u8> {
    let mut payload = v5_payload();
    payload[18] = movement_counter;
    payload
}

/// Values to encode into a synthetic format 5 payload.
pub struct V5Fields {
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub acceleration: (f64, f64, f64),
    pub battery_voltage: f64,
    pub tx_power: f64,
    pub movement_counter: u8,
    pub measurement_sequence: u16,
    pub source_mac: MacAddress,
}

/// Encode a format 5 payload, marker included.
pub fn encode_v5(fields: &V5Fields) -> Vec<u8> {
    let milli = |g: f64| ((g * 1000.0).round() as i16).to_be_bytes();
    let battery_raw = ((fields.battery_voltage * 1000.0).round() as u16) - 1600;
    let tx_raw = (fields.tx_power + 40.0).round() as u16;
    let power = (battery_raw << 5) | (tx_raw & 0x1F);

    let mut out = vec![0xFF, 0x99, 0x04, 0x05];
    out.extend(((fields.temperature / 0.005).round() as i16).to_be_bytes());
    out.extend(((fields.humidity / 0.0025).round() as u16).to_be_bytes());
    out.extend((((fields.pressure * 100.0).round() - 50_000.0) as u16).to_be_bytes());
    out.extend(milli(fields.acceleration.0));
    out.extend(milli(fields.acceleration.1));
    out.extend(milli(fields.acceleration.2));
    out.extend(power.to_be_bytes());
    out.push(fields.movement_counter);
    out.extend(fields.measurement_sequence.to_be_bytes());
    out.extend(fields.source_mac.0);
    out
}

/// A format 5 reading with the given movement counter, for registry tests.
pub fn reading_with_movement(address: MacAddress, movement_counter: u8) -> Reading {
    Reading {
        temperature: 21.0,
        humidity: 40.0,
        movement_counter,
        ..Reading::empty(address, 5, SystemTime::UNIX_EPOCH)
    }
}

pub fn advertisement(address: MacAddress, payload: Vec<u8>) -> RawAdvertisement {
    RawAdvertisement { address, payload }
}

/// One scripted answer to [`Radio::poll`].
#[derive(Debug, Clone)]
pub enum Step {
    Batch(Vec<RawAdvertisement>),
    Fail(String),
}

/// Everything a [`FakeRadio`] was asked to do.
#[derive(Debug, Default)]
pub struct RadioLog {
    pub started: Vec<ScanMode>,
    pub polls: usize,
    pub stopped: usize,
}

/// A radio that replays scripted poll results, then idles until the poll
/// timeout expires.
#[derive(Debug)]
pub struct FakeRadio {
    steps: VecDeque<Step>,
    start_failure: Option<String>,
    pub log: Arc<Mutex<RadioLog>>,
}

impl FakeRadio {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: steps.into(),
            start_failure: None,
            log: Arc::default(),
        }
    }

    /// Make every `start` call fail with a Bluetooth error.
    pub fn failing_start(mut self, reason: &str) -> Self {
        self.start_failure = Some(reason.to_string());
        self
    }
}

impl Radio for FakeRadio {
    fn start(&mut self, mode: ScanMode) -> RadioFuture<'_, ()> {
        self.log.lock().unwrap().started.push(mode);
        let result = match &self.start_failure {
            Some(reason) => Err(RadioError::Bluetooth(reason.clone())),
            None => Ok(()),
        };
        Box::pin(async move { result })
    }

    fn poll(&mut self, timeout: Duration) -> RadioFuture<'_, Vec<RawAdvertisement>> {
        self.log.lock().unwrap().polls += 1;
        let step = self.steps.pop_front();
        Box::pin(async move {
            match step {
                Some(Step::Batch(batch)) => Ok(batch),
                Some(Step::Fail(reason)) => Err(RadioError::Bluetooth(reason)),
                None => {
                    tokio::time::sleep(timeout).await;
                    Ok(Vec::new())
                }
            }
        })
    }

    fn stop(&mut self) -> RadioFuture<'_, ()> {
        self.log.lock().unwrap().stopped += 1;
        Box::pin(async { Ok(()) })
    }
}
