//! One-shot, time-limited scan.
//!
//! A [`BoundedScan`] is a pull-based sequence of readings: the radio is started
//! in active mode on the first [`BoundedScan::next`] call, readings are handed
//! out as they arrive and the sequence ends for good once the time budget is
//! spent. There is no registry and no movement tracking; every reading stands
//! alone.

use crate::daemon::DEFAULT_POLL_INTERVAL;
use crate::decoder::decode;
use crate::radio::{self, Backend, Radio, RadioError, ScanMode};
use crate::reading::Reading;
use log::{debug, warn};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Scanning { deadline: Instant },
    Exhausted,
}

/// Readings collected from one active scan of fixed duration.
pub struct BoundedScan<R> {
    radio: R,
    budget: Duration,
    poll_interval: Duration,
    phase: Phase,
    pending: VecDeque<Reading>,
    error: Option<RadioError>,
}

/// Scan `hci<interface_index>` with the default backend for `timeout`.
pub fn scan(interface_index: u16, timeout: Duration) -> BoundedScan<Box<dyn Radio>> {
    scan_with(Backend::default(), interface_index, timeout)
}

/// Scan with an explicit backend.
pub fn scan_with(
    backend: Backend,
    interface_index: u16,
    timeout: Duration,
) -> BoundedScan<Box<dyn Radio>> {
    BoundedScan::new(radio::open(backend, interface_index), timeout)
}

impl<R: Radio> BoundedScan<R> {
    pub fn new(radio: R, budget: Duration) -> Self {
        Self {
            radio,
            budget,
            poll_interval: DEFAULT_POLL_INTERVAL,
            phase: Phase::NotStarted,
            pending: VecDeque::new(),
            error: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Radio failure that ended the scan early, if any.
    pub fn error(&self) -> Option<&RadioError> {
        self.error.as_ref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.phase == Phase::Exhausted && self.pending.is_empty()
    }

    /// Next decoded reading, or `None` once the budget has elapsed.
    pub async fn next(&mut self) -> Option<Reading> {
        loop {
            if let Some(reading) = self.pending.pop_front() {
                return Some(reading);
            }

            match self.phase {
                Phase::Exhausted => return None,
                Phase::NotStarted => {
                    if self.budget.is_zero() {
                        self.phase = Phase::Exhausted;
                        continue;
                    }
                    if let Err(e) = self.radio.start(ScanMode::Active).await {
                        warn!("Failed to start scanning: {e}");
                        self.error = Some(e);
                        self.phase = Phase::Exhausted;
                        continue;
                    }
                    self.phase = Phase::Scanning {
                        deadline: Instant::now() + self.budget,
                    };
                }
                Phase::Scanning { deadline } => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        self.finish().await;
                        continue;
                    }

                    match self.radio.poll(remaining.min(self.poll_interval)).await {
                        Ok(batch) => {
                            for advertisement in batch {
                                match decode(advertisement.address, &advertisement.payload) {
                                    Ok(reading) => self.pending.push_back(reading),
                                    Err(e) => debug!("Skipping {}: {e}", advertisement.address),
                                }
                            }
                        }
                        Err(e) => {
                            warn!("Radio failure, scan ended early: {e}");
                            self.error = Some(e);
                            self.finish().await;
                        }
                    }
                }
            }
        }
    }

    /// Drain the whole scan into a vector.
    pub async fn collect(mut self) -> Vec<Reading> {
        let mut readings = Vec::new();
        while let Some(reading) = self.next().await {
            readings.push(reading);
        }
        readings
    }

    /// End the scan early. The radio is stopped if it was started and the
    /// sequence is exhausted from here on.
    pub async fn cancel(&mut self) {
        self.pending.clear();
        match self.phase {
            Phase::Scanning { .. } => self.finish().await,
            Phase::NotStarted | Phase::Exhausted => self.phase = Phase::Exhausted,
        }
    }

    async fn finish(&mut self) {
        if let Err(e) = self.radio.stop().await {
            warn!("Radio did not stop cleanly: {e}");
            self.error.get_or_insert(e);
        }
        self.phase = Phase::Exhausted;
    }
}
