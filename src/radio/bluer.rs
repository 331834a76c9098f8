//! BlueZ D-Bus backend.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.
//!
//! BlueZ hands out manufacturer data already split by company ID, so each
//! entry is framed back into `FF <id lo> <id hi> <data>` before it is passed on.

use super::{RadioError, RadioFuture, RawAdvertisement, ScanMode};
use crate::mac_address::MacAddress;
use bluer::monitor::{Monitor, MonitorEvent, Pattern};
use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session};
use futures::{Stream, StreamExt};
use log::debug;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Ruuvi Innovations manufacturer ID (little-endian bytes for pattern matching).
const RUUVI_MANUFACTURER_ID_BYTES: [u8; 2] = [0x99, 0x04];

/// Bluetooth manufacturer-specific data type (AD type 0xFF)
const MANUFACTURER_DATA_TYPE: u8 = 0xff;

/// Buffered advertisements between the BlueZ event task and `poll`.
const ADVERTISEMENT_CHANNEL_BUFFER_SIZE: usize = 100;

type Forwarded = Result<RawAdvertisement, RadioError>;

impl From<bluer::Error> for RadioError {
    fn from(err: bluer::Error) -> Self {
        RadioError::Bluetooth(err.to_string())
    }
}

struct ScanSession {
    rx: mpsc::Receiver<Forwarded>,
    task: JoinHandle<()>,
}

/// Radio backed by a BlueZ adapter (`hci<N>`).
pub struct BluerRadio {
    interface_index: u16,
    session: Option<ScanSession>,
}

impl BluerRadio {
    pub fn new(interface_index: u16) -> Self {
        Self {
            interface_index,
            session: None,
        }
    }

    async fn start_session(&mut self, mode: ScanMode) -> Result<(), RadioError> {
        let session = Session::new().await?;
        let adapter = session.adapter(&format!("hci{}", self.interface_index))?;
        adapter.set_powered(true).await?;

        let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);

        let task = match mode {
            ScanMode::Passive => {
                // Passive scanning in BlueZ goes through the advertisement monitor API.
                let pattern = Pattern {
                    data_type: MANUFACTURER_DATA_TYPE,
                    start_position: 0,
                    content: RUUVI_MANUFACTURER_ID_BYTES.to_vec(),
                };
                let monitor_manager = adapter.monitor().await?;
                let monitor_handle = monitor_manager
                    .register(Monitor {
                        patterns: Some(vec![pattern]),
                        ..Default::default()
                    })
                    .await?;
                let found = monitor_handle.filter_map(|event| async move {
                    match event {
                        MonitorEvent::DeviceFound(device_id) => Some(device_id.device),
                        _ => None,
                    }
                });

                tokio::spawn(async move {
                    // Keep all Bluetooth state alive by moving it into this task
                    let _session = session;
                    let _monitor_manager = monitor_manager;
                    forward_devices(&adapter, found, &tx).await;
                })
            }
            ScanMode::Active => {
                adapter
                    .set_discovery_filter(DiscoveryFilter {
                        transport: DiscoveryTransport::Le,
                        duplicate_data: true,
                        ..Default::default()
                    })
                    .await?;
                let events = adapter.discover_devices_with_changes().await?;
                let found = events.filter_map(|event| async move {
                    match event {
                        AdapterEvent::DeviceAdded(address) => Some(address),
                        _ => None,
                    }
                });

                tokio::spawn(async move {
                    let _session = session;
                    forward_devices(&adapter, found, &tx).await;
                })
            }
        };

        self.session = Some(ScanSession { rx, task });
        Ok(())
    }
}

/// Read advertisements of every reported device into the channel until the
/// event stream ends or the receiver goes away.
async fn forward_devices(
    adapter: &Adapter,
    found: impl Stream<Item = Address>,
    tx: &mpsc::Sender<Forwarded>,
) {
    let mut found = std::pin::pin!(found);

    while let Some(address) = found.next().await {
        let advertisements = match read_advertisements(adapter, address).await {
            Ok(advertisements) => advertisements,
            Err(e) => {
                // Devices can disappear between the event and the property read.
                debug!("Skipping {address}: {e}");
                continue;
            }
        };
        for advertisement in advertisements {
            if tx.send(Ok(advertisement)).await.is_err() {
                return;
            }
        }
    }

    let _ = tx
        .send(Err(RadioError::Bluetooth(
            "BlueZ event stream ended".to_string(),
        )))
        .await;
}

async fn read_advertisements(
    adapter: &Adapter,
    address: Address,
) -> Result<Vec<RawAdvertisement>, bluer::Error> {
    let device = adapter.device(address)?;
    let mac: MacAddress = address.into();

    let Some(manufacturer_data) = device.manufacturer_data().await? else {
        return Ok(Vec::new());
    };

    Ok(manufacturer_data
        .into_iter()
        .map(|(id, data)| RawAdvertisement {
            address: mac,
            payload: frame_manufacturer_data(id, &data),
        })
        .collect())
}

/// Rebuild the AD structure body BlueZ stripped: type, company ID, data.
fn frame_manufacturer_data(id: u16, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(3 + data.len());
    payload.push(MANUFACTURER_DATA_TYPE);
    payload.extend_from_slice(&id.to_le_bytes());
    payload.extend_from_slice(data);
    payload
}

impl super::Radio for BluerRadio {
    fn start(&mut self, mode: ScanMode) -> RadioFuture<'_, ()> {
        Box::pin(self.start_session(mode))
    }

    fn poll(&mut self, timeout: Duration) -> RadioFuture<'_, Vec<RawAdvertisement>> {
        Box::pin(async move {
            let session = self.session.as_mut().ok_or(RadioError::NotScanning)?;
            let mut batch = Vec::new();

            match tokio::time::timeout(timeout, session.rx.recv()).await {
                Err(_elapsed) => return Ok(batch),
                Ok(None) => {
                    return Err(RadioError::Bluetooth(
                        "BlueZ scan task exited".to_string(),
                    ));
                }
                Ok(Some(first)) => batch.push(first?),
            }

            // Drain whatever else is already queued
            while let Ok(next) = session.rx.try_recv() {
                batch.push(next?);
            }

            Ok(batch)
        })
    }

    fn stop(&mut self) -> RadioFuture<'_, ()> {
        Box::pin(async move {
            if let Some(session) = self.session.take() {
                session.task.abort();
                // Dropping the task drops the BlueZ session, ending discovery.
                let _ = session.task.await;
            }
            Ok(())
        })
    }
}
