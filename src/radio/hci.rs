//! Raw HCI socket backend.
//!
//! This backend uses raw Linux HCI sockets to scan for BLE advertisements
//! without requiring the BlueZ daemon. It requires CAP_NET_RAW and
//! CAP_NET_ADMIN capabilities or root privileges.

use super::{RadioError, RadioFuture, RawAdvertisement, ScanMode};
use crate::mac_address::MacAddress;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use log::debug;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;
use tokio::io::unix::AsyncFd;

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const HCI_FILTER: c_int = 2;

// HCI packet types
const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

// HCI events
const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta event sub-events
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// HCI commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// Scan types
const LE_SCAN_PASSIVE: u8 = 0x00;
const LE_SCAN_ACTIVE: u8 = 0x01;

// Own address type
const LE_PUBLIC_ADDRESS: u8 = 0x00;

// Filter policy
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

/// Max HCI event size
const HCI_MAX_EVENT_SIZE: usize = 258;

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    fn set_event(&mut self, event: u8) {
        let bit = event as usize;
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }
}

/// Create an HCI command packet
fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(HCI_COMMAND_PKT);
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// LE Set Scan Parameters: 10ms interval and window (0.625ms units).
fn scan_parameters(mode: ScanMode) -> [u8; 7] {
    let scan_type = match mode {
        ScanMode::Passive => LE_SCAN_PASSIVE,
        ScanMode::Active => LE_SCAN_ACTIVE,
    };
    let interval = 0x0010u16.to_le_bytes();
    let window = 0x0010u16.to_le_bytes();
    [
        scan_type,
        interval[0],
        interval[1],
        window[0],
        window[1],
        LE_PUBLIC_ADDRESS,
        FILTER_POLICY_ACCEPT_ALL,
    ]
}

/// LE Set Scan Enable, never filtering duplicates.
fn scan_enable(enable: bool) -> [u8; 2] {
    [u8::from(enable), 0x00]
}

fn os_error(context: &str) -> RadioError {
    RadioError::Bluetooth(format!("{context}: {}", io::Error::last_os_error()))
}

/// Open a raw HCI socket
fn open_hci_socket() -> Result<OwnedFd, RadioError> {
    // SOCK_NONBLOCK is required for AsyncFd to work properly
    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            SOCK_RAW | SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            BTPROTO_HCI,
        )
    };

    if fd < 0 {
        return Err(os_error("Failed to create HCI socket"));
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Bind HCI socket to a device
fn bind_hci_socket(fd: &OwnedFd, dev_id: u16) -> Result<(), RadioError> {
    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: 0, // HCI_CHANNEL_RAW
    };

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrHci as *const sockaddr,
            mem::size_of::<SockaddrHci>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(os_error("Failed to bind HCI socket"));
    }

    Ok(())
}

/// Only let LE meta events through
fn set_hci_filter(fd: &OwnedFd) -> Result<(), RadioError> {
    let mut filter = HciFilter::new();
    filter.set_ptype(HCI_EVENT_PKT);
    filter.set_event(EVT_LE_META_EVENT);

    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            0, // SOL_HCI
            HCI_FILTER,
            &filter as *const HciFilter as *const c_void,
            mem::size_of::<HciFilter>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(os_error("Failed to set HCI filter"));
    }

    Ok(())
}

fn send_hci_command(fd: &OwnedFd, ocf: u16, params: &[u8]) -> Result<(), RadioError> {
    let packet = hci_command_packet(OGF_LE_CTL, ocf, params);
    let ret = unsafe {
        libc::write(
            fd.as_raw_fd(),
            packet.as_ptr() as *const c_void,
            packet.len(),
        )
    };

    if ret < 0 {
        return Err(os_error("Failed to send HCI command"));
    }

    Ok(())
}

fn configure_le_scan(fd: &OwnedFd, mode: ScanMode) -> Result<(), RadioError> {
    // Parameters cannot change while a previous scan is still enabled.
    send_hci_command(fd, OCF_LE_SET_SCAN_ENABLE, &scan_enable(false))?;
    send_hci_command(fd, OCF_LE_SET_SCAN_PARAMETERS, &scan_parameters(mode))?;
    send_hci_command(fd, OCF_LE_SET_SCAN_ENABLE, &scan_enable(true))
}

/// Extract the first report of an LE advertising report event.
///
/// The AD structures are passed on untouched.
fn parse_advertising_report(data: &[u8]) -> Option<RawAdvertisement> {
    // Skip HCI header (1 byte packet type + 1 byte event code + 1 byte param len + 1 byte subevent)
    let report = data.get(4..)?;

    // Number of reports
    if *report.first()? == 0 {
        return None;
    }

    // Skip: num_reports(1) + event_type(1) + addr_type(1)
    let addr: [u8; 6] = report.get(3..9)?.try_into().ok()?;

    let data_len = *report.get(9)? as usize;
    let ad_data = report.get(10..10 + data_len)?;

    Some(RawAdvertisement {
        address: MacAddress::from_le_bytes(addr),
        payload: ad_data.to_vec(),
    })
}

struct HciSockets {
    events: AsyncFd<OwnedFd>,
    commands: OwnedFd,
}

/// Radio on a raw HCI device (`hci<N>`).
pub struct HciRadio {
    dev_id: u16,
    sockets: Option<HciSockets>,
}

impl HciRadio {
    pub fn new(dev_id: u16) -> Self {
        Self {
            dev_id,
            sockets: None,
        }
    }

    fn open(&self, mode: ScanMode) -> Result<HciSockets, RadioError> {
        let events = open_hci_socket()?;
        bind_hci_socket(&events, self.dev_id)?;
        set_hci_filter(&events)?;

        // Commands go out on a separate socket bound to the same device
        let commands = open_hci_socket()?;
        bind_hci_socket(&commands, self.dev_id)?;
        configure_le_scan(&commands, mode)?;

        let events = AsyncFd::new(events)
            .map_err(|e| RadioError::Bluetooth(format!("Failed to create async fd: {e}")))?;

        Ok(HciSockets { events, commands })
    }
}

/// Read every packet available on the socket right now.
fn drain_events(
    guard: &mut tokio::io::unix::AsyncFdReadyGuard<'_, OwnedFd>,
    batch: &mut Vec<RawAdvertisement>,
) -> Result<(), RadioError> {
    let mut buf = [0u8; HCI_MAX_EVENT_SIZE];

    loop {
        let n = match guard.try_io(|inner| {
            let ret = unsafe {
                libc::read(
                    inner.as_raw_fd(),
                    buf.as_mut_ptr() as *mut c_void,
                    buf.len(),
                )
            };
            if ret < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(ret as usize)
            }
        }) {
            Ok(Ok(n)) if n > 0 => n,
            Ok(Ok(_)) => return Ok(()), // EOF or empty read
            Ok(Err(e)) => {
                return Err(RadioError::Bluetooth(format!(
                    "Failed to read HCI socket: {e}"
                )));
            }
            Err(_would_block) => return Ok(()),
        };

        if n >= 4
            && buf[0] == HCI_EVENT_PKT
            && buf[1] == EVT_LE_META_EVENT
            && buf[3] == EVT_LE_ADVERTISING_REPORT
            && let Some(advertisement) = parse_advertising_report(&buf[..n])
        {
            batch.push(advertisement);
        }
    }
}

impl super::Radio for HciRadio {
    fn start(&mut self, mode: ScanMode) -> RadioFuture<'_, ()> {
        Box::pin(async move {
            let sockets = self.open(mode)?;
            debug!("HCI scan enabled on hci{} ({mode:?})", self.dev_id);
            self.sockets = Some(sockets);
            Ok(())
        })
    }

    fn poll(&mut self, timeout: Duration) -> RadioFuture<'_, Vec<RawAdvertisement>> {
        Box::pin(async move {
            let sockets = self.sockets.as_ref().ok_or(RadioError::NotScanning)?;
            let mut batch = Vec::new();

            let mut guard = match tokio::time::timeout(timeout, sockets.events.readable()).await {
                Err(_elapsed) => return Ok(batch),
                Ok(Err(e)) => {
                    return Err(RadioError::Bluetooth(format!(
                        "HCI socket not readable: {e}"
                    )));
                }
                Ok(Ok(guard)) => guard,
            };

            drain_events(&mut guard, &mut batch)?;
            Ok(batch)
        })
    }

    fn stop(&mut self) -> RadioFuture<'_, ()> {
        Box::pin(async move {
            if let Some(sockets) = self.sockets.take() {
                send_hci_command(&sockets.commands, OCF_LE_SET_SCAN_ENABLE, &scan_enable(false))?;
                debug!("HCI scan disabled on hci{}", self.dev_id);
            }
            Ok(())
        })
    }
}
