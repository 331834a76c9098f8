//! Per-tag state tracking.
//!
//! The registry keeps the last reading seen from every tag along with a sticky
//! movement flag. Only the scan daemon writes readings into it; the movement
//! flag is cleared by whoever consumes movement events, and the convention is
//! that a single consumer clears a given tag's flag.

use crate::mac_address::MacAddress;
use crate::reading::Reading;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Last known state of one tag.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub last_reading: Reading,
    /// Set when the movement counter changes, cleared only by
    /// [`Registry::clear_movement`].
    pub movement_detected: bool,
}

/// Map from tag address to its last known state.
#[derive(Debug, Default)]
pub struct Registry {
    devices: HashMap<MacAddress, DeviceState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reading and return the resulting state plus whether this is
    /// the first time the tag has been seen.
    ///
    /// The stored reading is replaced wholesale, so a tag that switches from
    /// format 5 to format 3 loses its movement counter and TX power.
    pub fn apply(&mut self, reading: Reading) -> (DeviceState, bool) {
        match self.devices.get_mut(&reading.address) {
            Some(state) => {
                if state.last_reading.movement_counter != reading.movement_counter {
                    state.movement_detected = true;
                }
                state.last_reading = reading;
                (state.clone(), false)
            }
            None => {
                let state = DeviceState {
                    last_reading: reading,
                    movement_detected: false,
                };
                self.devices
                    .insert(state.last_reading.address, state.clone());
                (state, true)
            }
        }
    }

    /// Clear the movement flag of a tag.
    ///
    /// Returns the previous value, or `None` if the tag is unknown.
    pub fn clear_movement(&mut self, address: &MacAddress) -> Option<bool> {
        self.devices
            .get_mut(address)
            .map(|state| std::mem::replace(&mut state.movement_detected, false))
    }

    pub fn get(&self, address: &MacAddress) -> Option<&DeviceState> {
        self.devices.get(address)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Addresses of every known tag, sorted.
    pub fn addresses(&self) -> Vec<MacAddress> {
        let mut addresses: Vec<_> = self.devices.keys().copied().collect();
        addresses.sort();
        addresses
    }
}

/// A registry shared between the scan daemon and outside readers.
///
/// The lock is held only for the duration of a single call, never while a
/// handler runs.
#[derive(Debug, Clone, Default)]
pub struct SharedRegistry(Arc<Mutex<Registry>>);

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn apply(&self, reading: Reading) -> (DeviceState, bool) {
        self.lock().apply(reading)
    }

    pub fn clear_movement(&self, address: &MacAddress) -> Option<bool> {
        self.lock().clear_movement(address)
    }

    /// A copy of one tag's state.
    pub fn get(&self, address: &MacAddress) -> Option<DeviceState> {
        self.lock().get(address).cloned()
    }

    /// Copies of every tag's state, sorted by address.
    pub fn snapshot(&self) -> Vec<DeviceState> {
        let registry = self.lock();
        registry
            .addresses()
            .iter()
            .filter_map(|address| registry.get(address).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
