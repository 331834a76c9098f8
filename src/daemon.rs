//! Continuous scanning with per-tag state tracking.
//!
//! A [`ScanDaemon`] polls a [`Radio`] in passive mode, decodes every
//! advertisement, records successful readings in its registry and hands the
//! resulting state to a [`Handler`]. It moves through
//! `Idle → Scanning → Stopping → Stopped` exactly once; scanning again needs a
//! new daemon.

use crate::decoder::{DecodeError, decode};
use crate::dispatch::{self, Handler};
use crate::radio::{Radio, RadioError, RawAdvertisement, ScanMode};
use crate::registry::SharedRegistry;
use log::{debug, error, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// How long a single radio poll may block. Bounds shutdown latency.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors that end a daemon run.
#[derive(Error, Debug, PartialEq)]
pub enum ScanError {
    #[error(transparent)]
    Radio(#[from] RadioError),
    #[error("Scan daemon already ran; create a new one to scan again")]
    AlreadyStopped,
    #[error("Scan task failed: {0}")]
    Task(String),
}

/// Lifecycle of a [`ScanDaemon`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Idle,
    Scanning,
    Stopping,
    Stopped,
}

/// Counters collected over one daemon run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Advertisements returned by the radio
    pub received: u64,
    /// Advertisements decoded and dispatched
    pub decoded: u64,
    pub not_recognized: u64,
    pub truncated: u64,
    /// Handler invocations that returned an error
    pub handler_failures: u64,
}

/// Cooperative stop signal, checked by the daemon between polls.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Continuous passive scan feeding a registry and a handler.
pub struct ScanDaemon<R, H> {
    radio: R,
    handler: H,
    registry: SharedRegistry,
    stop: StopHandle,
    poll_interval: Duration,
    state: DaemonState,
    stats: ScanStats,
}

impl<R: Radio, H: Handler> ScanDaemon<R, H> {
    /// Create a daemon with a fresh, empty registry.
    pub fn new(radio: R, handler: H) -> Self {
        Self::with_registry(radio, SharedRegistry::new(), handler)
    }

    /// Create a daemon writing into the given registry.
    ///
    /// Useful when the handler itself needs the registry, for example to
    /// clear movement flags it has acted on.
    pub fn with_registry(radio: R, registry: SharedRegistry, handler: H) -> Self {
        Self {
            radio,
            handler,
            registry,
            stop: StopHandle::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            state: DaemonState::Idle,
            stats: ScanStats::default(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Use an existing stop signal, e.g. one shared with a shutdown hook.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn transition(&mut self, next: DaemonState) {
        debug!("Scan daemon {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Scan until stopped or until the radio fails.
    ///
    /// Decode failures are counted and skipped. A radio failure stops the
    /// radio and is returned; there is no retry.
    pub async fn run(&mut self) -> Result<ScanStats, ScanError> {
        if self.state != DaemonState::Idle {
            return Err(ScanError::AlreadyStopped);
        }

        if let Err(e) = self.radio.start(ScanMode::Passive).await {
            error!("Failed to start scanning: {e}");
            self.transition(DaemonState::Stopped);
            return Err(e.into());
        }
        self.transition(DaemonState::Scanning);

        let result = self.scan_loop().await;

        self.transition(DaemonState::Stopping);
        let stopped = self.radio.stop().await;
        self.transition(DaemonState::Stopped);

        match (result, stopped) {
            (Err(e), stopped) => {
                error!("Radio failure, scanning stopped: {e}");
                if let Err(stop_err) = stopped {
                    warn!("Radio did not stop cleanly: {stop_err}");
                }
                Err(e.into())
            }
            (Ok(()), Err(e)) => Err(e.into()),
            (Ok(()), Ok(())) => Ok(self.stats),
        }
    }

    async fn scan_loop(&mut self) -> Result<(), RadioError> {
        while !self.stop.is_stop_requested() {
            let batch = self.radio.poll(self.poll_interval).await?;
            for advertisement in batch {
                self.process(advertisement);
            }
        }
        Ok(())
    }

    fn process(&mut self, advertisement: RawAdvertisement) {
        self.stats.received += 1;

        let reading = match decode(advertisement.address, &advertisement.payload) {
            Ok(reading) => reading,
            Err(DecodeError::NotRecognized) => {
                self.stats.not_recognized += 1;
                return;
            }
            Err(e @ DecodeError::Truncated { .. }) => {
                self.stats.truncated += 1;
                warn!("Discarding advertisement from {}: {e}", advertisement.address);
                return;
            }
        };
        self.stats.decoded += 1;

        let (state, is_new) = self.registry.apply(reading);
        if is_new {
            debug!("New tag {}", advertisement.address);
        }

        if let Err(e) = dispatch::deliver(&mut self.handler, &state, is_new) {
            self.stats.handler_failures += 1;
            warn!("Handler failed for {}: {e}", advertisement.address);
        }
    }
}

impl<R, H> ScanDaemon<R, H>
where
    R: Radio + 'static,
    H: Handler + Send + 'static,
{
    /// Run the daemon on its own task.
    pub fn spawn(mut self) -> DaemonHandle {
        let stop = self.stop_handle();
        let registry = self.registry();
        let task = tokio::spawn(async move { self.run().await });
        DaemonHandle {
            stop,
            registry,
            task,
        }
    }
}

/// Controls a daemon started with [`ScanDaemon::spawn`].
#[derive(Debug)]
pub struct DaemonHandle {
    stop: StopHandle,
    registry: SharedRegistry,
    task: JoinHandle<Result<ScanStats, ScanError>>,
}

impl DaemonHandle {
    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn stop_handle(&self) -> &StopHandle {
        &self.stop
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Wait for the daemon to finish.
    pub async fn join(self) -> Result<ScanStats, ScanError> {
        self.task
            .await
            .map_err(|e| ScanError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{HandlerError, NoopHandler};
    use crate::mac_address::MacAddress;
    use crate::registry::DeviceState;
    use crate::test_utils::{
        FakeRadio, Step, TEST_MAC, advertisement, v3_payload, v5_payload,
        v5_payload_with_movement,
    };
    use std::sync::Mutex;

    const OTHER_MAC: MacAddress = MacAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    const FAST_POLL: Duration = Duration::from_millis(5);

    type Seen = Arc<Mutex<Vec<(MacAddress, bool, bool)>>>;

    /// A handler recording (address, is_new, movement_detected) that stops the
    /// daemon after `limit` deliveries.
    fn recording_handler(
        seen: Seen,
        stop: StopHandle,
        limit: usize,
    ) -> impl FnMut(&DeviceState, bool) -> Result<(), HandlerError> + Send + 'static {
        move |state: &DeviceState, is_new: bool| {
            let mut seen = seen.lock().unwrap();
            seen.push((state.last_reading.address, is_new, state.movement_detected));
            if seen.len() >= limit {
                stop.stop();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dispatches_in_arrival_order_and_discards_failures() {
        let truncated = v5_payload()[..10].to_vec();
        let radio = FakeRadio::new(vec![
            Step::Batch(vec![
                advertisement(TEST_MAC, v5_payload()),
                advertisement(OTHER_MAC, vec![0x02, 0x01, 0x06]),
                advertisement(OTHER_MAC, truncated),
                advertisement(OTHER_MAC, v3_payload()),
            ]),
            Step::Batch(vec![advertisement(TEST_MAC, v5_payload())]),
        ]);
        let log = radio.log.clone();
        let seen = Seen::default();
        let stop = StopHandle::new();

        let mut daemon = ScanDaemon::new(radio, recording_handler(seen.clone(), stop.clone(), 3))
            .with_stop_handle(stop)
            .with_poll_interval(FAST_POLL);
        assert_eq!(daemon.state(), DaemonState::Idle);

        let stats = daemon.run().await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (TEST_MAC, true, false),
                (OTHER_MAC, true, false),
                (TEST_MAC, false, false),
            ]
        );
        assert_eq!(
            stats,
            ScanStats {
                received: 5,
                decoded: 3,
                not_recognized: 1,
                truncated: 1,
                handler_failures: 0,
            }
        );
        assert_eq!(daemon.registry().len(), 2);

        let log = log.lock().unwrap();
        assert_eq!(log.started, vec![ScanMode::Passive]);
        assert_eq!(log.polls, 2);
        assert_eq!(log.stopped, 1);
    }

    #[tokio::test]
    async fn test_stop_is_observed_only_at_poll_boundary() {
        let radio = FakeRadio::new(vec![
            Step::Batch(vec![
                advertisement(TEST_MAC, v5_payload()),
                advertisement(OTHER_MAC, v5_payload()),
                advertisement(TEST_MAC, v5_payload()),
            ]),
            Step::Batch(vec![advertisement(OTHER_MAC, v5_payload())]),
        ]);
        let seen = Seen::default();
        let stop = StopHandle::new();

        // Stop is requested on the first delivery, the rest of the batch still runs.
        let mut daemon = ScanDaemon::new(radio, recording_handler(seen.clone(), stop.clone(), 1))
            .with_stop_handle(stop)
            .with_poll_interval(FAST_POLL);
        daemon.run().await.unwrap();

        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_movement_detected_is_sticky_across_deliveries() {
        let radio = FakeRadio::new(vec![
            Step::Batch(vec![advertisement(TEST_MAC, v5_payload_with_movement(1))]),
            Step::Batch(vec![advertisement(TEST_MAC, v5_payload_with_movement(2))]),
            Step::Batch(vec![advertisement(TEST_MAC, v5_payload_with_movement(2))]),
        ]);
        let seen = Seen::default();
        let stop = StopHandle::new();

        let mut daemon = ScanDaemon::new(radio, recording_handler(seen.clone(), stop.clone(), 3))
            .with_stop_handle(stop)
            .with_poll_interval(FAST_POLL);
        daemon.run().await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (TEST_MAC, true, false),
                (TEST_MAC, false, true),
                (TEST_MAC, false, true),
            ]
        );
    }

    #[tokio::test]
    async fn test_handler_can_clear_movement_through_registry() {
        let radio = FakeRadio::new(vec![
            Step::Batch(vec![advertisement(TEST_MAC, v5_payload_with_movement(1))]),
            Step::Batch(vec![advertisement(TEST_MAC, v5_payload_with_movement(2))]),
            Step::Batch(vec![advertisement(TEST_MAC, v5_payload_with_movement(2))]),
        ]);
        let registry = SharedRegistry::new();
        let stop = StopHandle::new();
        let flags = Arc::new(Mutex::new(Vec::new()));

        let handler = {
            let registry = registry.clone();
            let stop = stop.clone();
            let flags = flags.clone();
            move |state: &DeviceState, _is_new: bool| -> Result<(), HandlerError> {
                let mut flags = flags.lock().unwrap();
                flags.push(state.movement_detected);
                if state.movement_detected {
                    registry.clear_movement(&state.last_reading.address);
                }
                if flags.len() == 3 {
                    stop.stop();
                }
                Ok(())
            }
        };

        let mut daemon = ScanDaemon::with_registry(radio, registry.clone(), handler)
            .with_stop_handle(stop)
            .with_poll_interval(FAST_POLL);
        daemon.run().await.unwrap();

        assert_eq!(*flags.lock().unwrap(), vec![false, true, false]);
        assert!(!registry.get(&TEST_MAC).unwrap().movement_detected);
    }

    #[tokio::test]
    async fn test_handler_failures_do_not_stop_scanning() {
        let radio = FakeRadio::new(vec![
            Step::Batch(vec![advertisement(TEST_MAC, v5_payload())]),
            Step::Batch(vec![advertisement(TEST_MAC, v5_payload())]),
        ]);
        let stop = StopHandle::new();
        let calls = Arc::new(Mutex::new(0));

        let handler = {
            let stop = stop.clone();
            let calls = calls.clone();
            move |_: &DeviceState, _: bool| -> Result<(), HandlerError> {
                let mut calls = calls.lock().unwrap();
                *calls += 1;
                if *calls == 2 {
                    stop.stop();
                }
                Err("sink unavailable".into())
            }
        };

        let mut daemon = ScanDaemon::new(radio, handler)
            .with_stop_handle(stop)
            .with_poll_interval(FAST_POLL);
        let stats = daemon.run().await.unwrap();

        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(stats.handler_failures, 2);
        assert_eq!(stats.decoded, 2);
    }

    #[tokio::test]
    async fn test_radio_failure_is_fatal_and_propagated() {
        let radio = FakeRadio::new(vec![
            Step::Batch(vec![advertisement(TEST_MAC, v5_payload())]),
            Step::Fail("adapter removed".to_string()),
            Step::Batch(vec![advertisement(TEST_MAC, v5_payload())]),
        ]);
        let log = radio.log.clone();

        let mut daemon = ScanDaemon::new(radio, NoopHandler).with_poll_interval(FAST_POLL);
        let result = daemon.run().await;

        assert_eq!(
            result,
            Err(ScanError::Radio(RadioError::Bluetooth(
                "adapter removed".to_string()
            )))
        );
        assert_eq!(daemon.state(), DaemonState::Stopped);
        assert_eq!(daemon.stats().decoded, 1);

        let log = log.lock().unwrap();
        assert_eq!(log.polls, 2);
        assert_eq!(log.stopped, 1);
    }

    #[tokio::test]
    async fn test_start_failure_goes_straight_to_stopped() {
        let radio = FakeRadio::new(vec![Step::Batch(vec![advertisement(
            TEST_MAC,
            v5_payload(),
        )])])
        .failing_start("adapter powered off");
        let log = radio.log.clone();

        let mut daemon = ScanDaemon::new(radio, NoopHandler).with_poll_interval(FAST_POLL);
        let result = daemon.run().await;

        assert_eq!(
            result,
            Err(ScanError::Radio(RadioError::Bluetooth(
                "adapter powered off".to_string()
            )))
        );
        assert_eq!(daemon.state(), DaemonState::Stopped);
        assert_eq!(daemon.stats(), ScanStats::default());
        assert!(daemon.registry().is_empty());
        // A failed daemon is not restartable either.
        assert_eq!(daemon.run().await, Err(ScanError::AlreadyStopped));

        let log = log.lock().unwrap();
        assert_eq!(log.started, vec![ScanMode::Passive]);
        assert_eq!(log.polls, 0);
        assert_eq!(log.stopped, 0);
    }

    #[tokio::test]
    async fn test_daemon_cannot_be_restarted() {
        let radio = FakeRadio::new(Vec::new());
        let log = radio.log.clone();
        let mut daemon = ScanDaemon::new(radio, NoopHandler).with_poll_interval(FAST_POLL);

        // Stopping before the first poll still starts and tears down the radio.
        daemon.stop_handle().stop();
        tokio_test::assert_ok!(daemon.run().await);
        assert_eq!(daemon.state(), DaemonState::Stopped);

        assert_eq!(daemon.run().await, Err(ScanError::AlreadyStopped));

        let log = log.lock().unwrap();
        assert_eq!(log.started.len(), 1);
        assert_eq!(log.polls, 0);
        assert_eq!(log.stopped, 1);
    }

    #[tokio::test]
    async fn test_spawned_daemon_stops_on_request() {
        let radio = FakeRadio::new(vec![Step::Batch(vec![advertisement(
            TEST_MAC,
            v5_payload(),
        )])]);
        let handle = ScanDaemon::new(radio, NoopHandler)
            .with_poll_interval(FAST_POLL)
            .spawn();

        for _ in 0..200 {
            if !handle.registry().is_empty() {
                break;
            }
            tokio::time::sleep(FAST_POLL).await;
        }
        assert_eq!(handle.registry().len(), 1);

        handle.stop();
        let stats = handle.join().await.unwrap();
        assert_eq!(stats.decoded, 1);
    }
}
