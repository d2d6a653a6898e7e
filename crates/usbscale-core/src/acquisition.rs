//! Background acquisition worker.
//!
//! The worker owns the [`ScaleLink`] and runs a single state machine:
//!
//! ```text
//! Searching ──ok──▶ Connected ⇄ ReadingError
//!     │                 │
//!     └──fail──▶ ReconnectWait ◀──fatal / give-up
//!                       │
//!                       └──found──▶ Connected
//! ```
//!
//! It publishes every weight and connection change to [`ScaleState`] and
//! emits a [`ScaleEvent`] for each. The loop never ends on its own; only a
//! stop request (cancellation token, or dropping the [`AcquisitionHandle`])
//! terminates it.
//!
//! Two escalation triggers are tracked independently and whichever fires
//! first wins: the per-read retry budget for transient transport errors, and
//! the consecutive failed iteration counter.

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use usbscale_types::{DeviceLabel, WeightReading};

use crate::error::{Error, ErrorKind, Result};
use crate::events::{DisconnectReason, EventDispatcher, ScaleEvent};
use crate::state::ScaleState;
use crate::traits::ScaleLink;

/// Retry budget for transient errors, and the empty-read limit.
pub const MAX_ATTEMPTS: u32 = 5;

/// Failed iterations in a row before the worker gives up on the session.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Timing and retry policy of the acquisition worker.
///
/// All intervals are fixed; there is no exponential backoff.
#[derive(Debug, Clone)]
pub struct AcquisitionOptions {
    /// Timeout of a single frame read.
    pub read_timeout: Duration,
    /// Delay between two read iterations.
    pub sample_interval: Duration,
    /// Delay after reconfiguring the device on a transient error.
    pub transient_backoff: Duration,
    /// Period of the reconnect search.
    pub reconnect_interval: Duration,
    /// Transient-error retry budget and empty-read limit.
    pub max_attempts: u32,
    /// Failed iterations in a row before escalating.
    pub max_consecutive_errors: u32,
}

impl Default for AcquisitionOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(1000),
            sample_interval: Duration::from_millis(200),
            transient_backoff: Duration::from_millis(500),
            reconnect_interval: Duration::from_secs(5),
            max_attempts: MAX_ATTEMPTS,
            max_consecutive_errors: MAX_CONSECUTIVE_ERRORS,
        }
    }
}

impl AcquisitionOptions {
    /// Validate the options and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("read_timeout", self.read_timeout),
            ("sample_interval", self.sample_interval),
            ("transient_backoff", self.transient_backoff),
            ("reconnect_interval", self.reconnect_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(Error::invalid_config(format!("{name} must be > 0")));
            }
        }
        if self.max_attempts == 0 {
            return Err(Error::invalid_config("max_attempts must be >= 1"));
        }
        if self.max_consecutive_errors == 0 {
            return Err(Error::invalid_config("max_consecutive_errors must be >= 1"));
        }
        Ok(())
    }
}

/// Observable phase of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcquisitionPhase {
    /// Looking for the scale for the first time.
    Searching,
    /// Reading frames.
    Connected,
    /// Recovering from a transient read error.
    ReadingError,
    /// Waiting for the scale to come back.
    ReconnectWait,
    /// The worker has exited.
    Stopped,
}

impl AcquisitionPhase {
    /// Short machine-friendly name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquisitionPhase::Searching => "searching",
            AcquisitionPhase::Connected => "connected",
            AcquisitionPhase::ReadingError => "reading_error",
            AcquisitionPhase::ReconnectWait => "reconnect_wait",
            AcquisitionPhase::Stopped => "stopped",
        }
    }
}

impl fmt::Display for AcquisitionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requests the worker serializes with its own link access.
#[derive(Debug)]
enum Command {
    SearchNow { reply: oneshot::Sender<bool> },
}

/// Result of one read attempt, after transient errors were retried.
#[derive(Debug)]
enum ReadOutcome {
    Sample(WeightReading),
    Empty,
    Lost {
        reason: DisconnectReason,
        message: String,
    },
    Failed(String),
    Stopped,
}

/// Control handle for a running acquisition worker.
///
/// Dropping the handle stops the worker.
#[derive(Debug)]
pub struct AcquisitionHandle {
    commands: mpsc::Sender<Command>,
    phase: watch::Receiver<AcquisitionPhase>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl AcquisitionHandle {
    /// Ask the worker to look for the scale right away.
    ///
    /// The request is executed by the worker itself, so it never races with
    /// its own reads. Returns whether a scale is connected afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the worker has stopped.
    pub async fn search_now(&self) -> Result<bool> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::SearchNow { reply })
            .await
            .map_err(|_| Error::Cancelled)?;
        response.await.map_err(|_| Error::Cancelled)
    }

    /// Current phase of the worker.
    pub fn phase(&self) -> AcquisitionPhase {
        *self.phase.borrow()
    }

    /// Watch phase changes.
    pub fn phase_receiver(&self) -> watch::Receiver<AcquisitionPhase> {
        self.phase.clone()
    }

    /// Request a cooperative stop without waiting for it.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the worker has exited.
    pub fn is_stopped(&self) -> bool {
        match &self.task {
            Some(task) => task.is_finished(),
            None => self.phase() == AcquisitionPhase::Stopped,
        }
    }

    /// Stop the worker and wait until it has released the scale.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            error!("Acquisition worker ended abnormally: {}", e);
        }
    }
}

impl Drop for AcquisitionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The acquisition state machine.
pub struct AcquisitionWorker<L> {
    link: L,
    state: ScaleState,
    events: EventDispatcher,
    options: AcquisitionOptions,
    commands: mpsc::Receiver<Command>,
    phase: watch::Sender<AcquisitionPhase>,
    cancel: CancellationToken,
    consecutive_errors: u32,
    empty_reads: u32,
    connected: bool,
}

impl<L: ScaleLink + 'static> AcquisitionWorker<L> {
    /// Create a worker and its control handle without starting it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `options` do not validate.
    pub fn new(
        link: L,
        state: ScaleState,
        events: EventDispatcher,
        options: AcquisitionOptions,
    ) -> Result<(Self, AcquisitionHandle)> {
        options.validate()?;

        let (command_tx, command_rx) = mpsc::channel(8);
        let (phase_tx, phase_rx) = watch::channel(AcquisitionPhase::Searching);
        let cancel = CancellationToken::new();

        let worker = Self {
            link,
            state,
            events,
            options,
            commands: command_rx,
            phase: phase_tx,
            cancel: cancel.clone(),
            consecutive_errors: 0,
            empty_reads: 0,
            connected: false,
        };
        let handle = AcquisitionHandle {
            commands: command_tx,
            phase: phase_rx,
            cancel,
            task: None,
        };
        Ok((worker, handle))
    }

    /// Create a worker and run it on the tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `options` do not validate.
    pub fn spawn(
        link: L,
        state: ScaleState,
        events: EventDispatcher,
        options: AcquisitionOptions,
    ) -> Result<AcquisitionHandle> {
        let (worker, mut handle) = Self::new(link, state, events, options)?;
        handle.task = Some(tokio::spawn(worker.run()));
        Ok(handle)
    }

    /// Run until stopped, then release the scale.
    pub async fn run(mut self) {
        info!("Acquisition worker started");
        let mut phase = AcquisitionPhase::Searching;

        while !self.cancel.is_cancelled() {
            self.set_phase(phase);
            phase = match phase {
                AcquisitionPhase::Searching => self.search().await,
                AcquisitionPhase::Connected | AcquisitionPhase::ReadingError => {
                    self.read_cycle().await
                }
                AcquisitionPhase::ReconnectWait => self.reconnect_wait().await,
                AcquisitionPhase::Stopped => break,
            };
        }

        self.mark_disconnected(DisconnectReason::Stopped, None).await;
        self.set_phase(AcquisitionPhase::Stopped);
        info!("Acquisition worker stopped");
    }

    fn set_phase(&self, phase: AcquisitionPhase) {
        self.phase.send_if_modified(|current| {
            if *current == phase {
                return false;
            }
            debug!("Acquisition phase {} -> {}", current, phase);
            *current = phase;
            true
        });
    }

    async fn search(&mut self) -> AcquisitionPhase {
        if self.try_connect().await {
            return AcquisitionPhase::Connected;
        }
        self.state.set_connected(false, None);
        self.events.send(ScaleEvent::ErrorOccurred {
            message: "No scale found".to_string(),
        });
        AcquisitionPhase::ReconnectWait
    }

    async fn try_connect(&mut self) -> bool {
        match self.link.find_and_connect().await {
            Ok(label) => {
                self.on_connected(label);
                true
            }
            Err(e) => {
                debug!("Connect attempt failed: {}", e);
                false
            }
        }
    }

    fn on_connected(&mut self, label: DeviceLabel) {
        self.consecutive_errors = 0;
        self.empty_reads = 0;
        self.state.set_connected(true, Some(&label));

        if !self.connected {
            self.connected = true;
            info!("Connected to {} ({})", label.name, label.connection);
            self.events.send(ScaleEvent::ConnectionChanged {
                connected: true,
                label: Some(label),
                reason: None,
            });
        }
    }

    async fn mark_disconnected(&mut self, reason: DisconnectReason, message: Option<String>) {
        self.link.disconnect().await;
        self.state.set_connected(false, None);
        self.consecutive_errors = 0;
        self.empty_reads = 0;

        if std::mem::replace(&mut self.connected, false) {
            info!(?reason, "Scale connection lost");
            self.events.send(ScaleEvent::ConnectionChanged {
                connected: false,
                label: None,
                reason: Some(reason),
            });
        }
        if let Some(message) = message {
            self.events.send(ScaleEvent::ErrorOccurred { message });
        }
    }

    /// Sleep unless stopped first. Returns `false` when stopped.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(duration) => true,
        }
    }

    /// Execute queued commands. Returns the next phase if one of them ended
    /// the read cycle.
    async fn handle_commands(&mut self) -> Option<AcquisitionPhase> {
        loop {
            match self.commands.try_recv() {
                Ok(Command::SearchNow { reply }) => {
                    let found = self.try_connect().await;
                    if !found {
                        self.mark_disconnected(
                            DisconnectReason::DeviceRemoved,
                            Some("No scale found".to_string()),
                        )
                        .await;
                    }
                    let _ = reply.send(found);
                    if !found {
                        return Some(AcquisitionPhase::ReconnectWait);
                    }
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => return Some(AcquisitionPhase::Stopped),
            }
        }
    }

    async fn read_cycle(&mut self) -> AcquisitionPhase {
        if let Some(next) = self.handle_commands().await {
            return next;
        }

        if !self.link.is_alive().await {
            warn!("Scale disconnected during read");
            self.mark_disconnected(
                DisconnectReason::LivenessLost,
                Some("Scale disconnected during read".to_string()),
            )
            .await;
            return AcquisitionPhase::ReconnectWait;
        }

        match self.read_with_retry().await {
            ReadOutcome::Sample(reading) => {
                self.empty_reads = 0;
                self.consecutive_errors = 0;
                self.state.set_weight(&reading);
                self.events.send(ScaleEvent::WeightUpdated { reading });
                self.next_iteration().await
            }
            ReadOutcome::Empty => {
                self.empty_reads += 1;
                debug!(
                    "Empty read ({}/{})",
                    self.empty_reads, self.options.max_attempts
                );
                if self.empty_reads < self.options.max_attempts {
                    return AcquisitionPhase::Connected;
                }
                error!(
                    "No data from scale after {} reads, assuming it is gone",
                    self.empty_reads
                );
                self.mark_disconnected(
                    DisconnectReason::EmptyReads,
                    Some("Scale disconnected during read".to_string()),
                )
                .await;
                AcquisitionPhase::ReconnectWait
            }
            ReadOutcome::Lost { reason, message } => {
                self.mark_disconnected(reason, Some(message)).await;
                AcquisitionPhase::ReconnectWait
            }
            ReadOutcome::Failed(message) => {
                self.consecutive_errors += 1;
                error!(
                    "Error in read loop ({}/{}): {}",
                    self.consecutive_errors, self.options.max_consecutive_errors, message
                );
                if self.consecutive_errors < self.options.max_consecutive_errors {
                    return self.next_iteration().await;
                }
                self.mark_disconnected(
                    DisconnectReason::RepeatedFailures,
                    Some(format!("Repeated read errors: {message}")),
                )
                .await;
                AcquisitionPhase::ReconnectWait
            }
            ReadOutcome::Stopped => AcquisitionPhase::Stopped,
        }
    }

    async fn next_iteration(&self) -> AcquisitionPhase {
        if self.pause(self.options.sample_interval).await {
            AcquisitionPhase::Connected
        } else {
            AcquisitionPhase::Stopped
        }
    }

    async fn read_with_retry(&mut self) -> ReadOutcome {
        let mut remaining = self.options.max_attempts;

        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return ReadOutcome::Stopped,
                result = self.link.read_one(self.options.read_timeout) => result,
            };

            let err = match result {
                Ok(Some(reading)) => return ReadOutcome::Sample(reading),
                Ok(None) => return ReadOutcome::Empty,
                Err(err) => err,
            };

            match err.kind() {
                ErrorKind::Transient => {
                    remaining -= 1;
                    warn!("USB read error: {}. Attempts left: {}", err, remaining);

                    if remaining == 0 {
                        let exhausted = Error::RetriesExhausted {
                            attempts: self.options.max_attempts,
                            last: err.to_string(),
                        };
                        error!("{}", exhausted);
                        return ReadOutcome::Lost {
                            reason: DisconnectReason::RetriesExhausted,
                            message: exhausted.to_string(),
                        };
                    }

                    self.set_phase(AcquisitionPhase::ReadingError);
                    if let Err(e) = self.link.reconfigure().await {
                        error!("Error while reconfiguring scale: {}", e);
                        return ReadOutcome::Lost {
                            reason: DisconnectReason::ReconfigureFailed,
                            message: format!("Could not reconfigure scale: {e}"),
                        };
                    }
                    if !self.pause(self.options.transient_backoff).await {
                        return ReadOutcome::Stopped;
                    }
                    if !self.link.is_alive().await {
                        warn!("Scale disconnected during read");
                        return ReadOutcome::Lost {
                            reason: DisconnectReason::LivenessLost,
                            message: "Scale disconnected during read".to_string(),
                        };
                    }
                }
                ErrorKind::Fatal | ErrorKind::NotFound => {
                    error!("Scale disconnected: {}", err);
                    return ReadOutcome::Lost {
                        reason: DisconnectReason::DeviceRemoved,
                        message: "Scale disconnected during read".to_string(),
                    };
                }
                ErrorKind::Other => return ReadOutcome::Failed(err.to_string()),
            }
        }
    }

    async fn reconnect_wait(&mut self) -> AcquisitionPhase {
        let period = self.options.reconnect_interval;
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Waiting for scale, retrying every {:?}", period);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return AcquisitionPhase::Stopped,
                _ = timer.tick() => {
                    info!("Attempting automatic reconnection to scale");
                    if self.try_connect().await {
                        return AcquisitionPhase::Connected;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(Command::SearchNow { reply }) => {
                        let found = self.try_connect().await;
                        let _ = reply.send(found);
                        if found {
                            return AcquisitionPhase::Connected;
                        }
                    }
                    None => return AcquisitionPhase::Stopped,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventReceiver;
    use crate::mock::{MockRead, MockScale};

    struct Harness {
        worker: AcquisitionWorker<MockScale>,
        handle: AcquisitionHandle,
        scale: MockScale,
        state: ScaleState,
        events: EventReceiver,
    }

    fn harness(scale: MockScale) -> Harness {
        let state = ScaleState::new();
        let dispatcher = EventDispatcher::default();
        let events = dispatcher.subscribe();
        let (worker, handle) = AcquisitionWorker::new(
            scale.clone(),
            state.clone(),
            dispatcher,
            AcquisitionOptions::default(),
        )
        .unwrap();
        Harness {
            worker,
            handle,
            scale,
            state,
            events,
        }
    }

    fn drain(events: &mut EventReceiver) -> Vec<ScaleEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn disconnects(events: &[ScaleEvent]) -> usize {
        events.iter().filter(|e| e.is_connection(false)).count()
    }

    fn spawn(scale: &MockScale) -> (AcquisitionHandle, ScaleState, EventReceiver) {
        let state = ScaleState::new();
        let dispatcher = EventDispatcher::default();
        let events = dispatcher.subscribe();
        let handle = AcquisitionWorker::spawn(
            scale.clone(),
            state.clone(),
            dispatcher,
            AcquisitionOptions::default(),
        )
        .unwrap();
        (handle, state, events)
    }

    #[test]
    fn test_default_options() {
        let options = AcquisitionOptions::default();
        assert_eq!(options.read_timeout, Duration::from_millis(1000));
        assert_eq!(options.sample_interval, Duration::from_millis(200));
        assert_eq!(options.transient_backoff, Duration::from_millis(500));
        assert_eq!(options.reconnect_interval, Duration::from_secs(5));
        assert_eq!(options.max_attempts, 5);
        assert_eq!(options.max_consecutive_errors, 3);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_invalid_options() {
        let options = AcquisitionOptions {
            reconnect_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(Error::InvalidConfig(_))));

        let options = AcquisitionOptions {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(AcquisitionPhase::ReconnectWait.to_string(), "reconnect_wait");
        assert_eq!(AcquisitionPhase::Connected.as_str(), "connected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_success_publishes_connected() {
        let mut h = harness(MockScale::new());
        assert_eq!(h.worker.search().await, AcquisitionPhase::Connected);

        let snapshot = h.state.read();
        assert!(snapshot.connected);
        assert_eq!(snapshot.device_type.as_str(), "USB");
        assert_eq!(snapshot.device_name, "Dymo M5/M10");

        let events = drain(&mut h.events);
        assert_eq!(events.len(), 1);
        assert!(events[0].is_connection(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_failure_notifies_once() {
        let mut h = harness(MockScale::absent());
        assert_eq!(h.worker.search().await, AcquisitionPhase::ReconnectWait);
        assert!(!h.state.read().connected);

        let events = drain(&mut h.events);
        assert_eq!(
            events,
            vec![ScaleEvent::ErrorOccurred {
                message: "No scale found".to_string()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_weights_in_order() {
        let scale = MockScale::new().with_reads([
            MockRead::Frame(vec![0, 0, 0, 0, 100, 0]),
            MockRead::Frame(vec![0, 0, 0, 0, 44, 1]),
        ]);
        let mut h = harness(scale);
        h.worker.search().await;

        assert_eq!(h.worker.read_cycle().await, AcquisitionPhase::Connected);
        assert_eq!(h.state.read().weight_grams, 100);
        assert_eq!(h.worker.read_cycle().await, AcquisitionPhase::Connected);
        assert_eq!(h.state.read().weight_grams, 300);

        let weights: Vec<u16> = drain(&mut h.events)
            .into_iter()
            .filter_map(|e| match e {
                ScaleEvent::WeightUpdated { reading } => Some(reading.grams),
                _ => None,
            })
            .collect();
        assert_eq!(weights, vec![100, 300]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_recover_within_budget() {
        let scale = MockScale::new().with_reads([
            MockRead::Transient,
            MockRead::Transient,
            MockRead::Transient,
            MockRead::grams(250),
        ]);
        let mut h = harness(scale);
        h.worker.search().await;
        h.worker.consecutive_errors = 2;
        drain(&mut h.events);

        assert_eq!(h.worker.read_cycle().await, AcquisitionPhase::Connected);
        assert_eq!(h.worker.consecutive_errors, 0);
        assert!(h.state.read().connected);
        assert_eq!(h.state.read().weight_grams, 250);
        assert_eq!(h.scale.reconfigure_calls(), 3);
        assert_eq!(disconnects(&drain(&mut h.events)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_escalates_once() {
        let scale = MockScale::new().with_reads(vec![MockRead::Transient; 5]);
        let mut h = harness(scale);
        h.worker.search().await;
        drain(&mut h.events);

        let start = Instant::now();
        assert_eq!(h.worker.read_cycle().await, AcquisitionPhase::ReconnectWait);
        // Four backoffs between five attempts
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2000), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(2100), "{:?}", elapsed);

        assert_eq!(h.scale.read_calls(), 5);
        assert_eq!(h.scale.reconfigure_calls(), 4);
        assert!(!h.state.read().connected);
        assert_eq!(h.scale.open_handles(), 0);

        let events = drain(&mut h.events);
        assert_eq!(disconnects(&events), 1);
        assert!(events.iter().any(|e| matches!(
            e,
            ScaleEvent::ConnectionChanged {
                reason: Some(DisconnectReason::RetriesExhausted),
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_gate_skips_read() {
        let mut h = harness(MockScale::new().with_reads([MockRead::grams(10)]));
        h.worker.search().await;
        h.scale.set_alive(false);

        assert_eq!(h.worker.read_cycle().await, AcquisitionPhase::ReconnectWait);
        assert_eq!(h.scale.read_calls(), 0);
        assert!(!h.state.read().connected);

        let events = drain(&mut h.events);
        assert!(events.iter().any(|e| matches!(
            e,
            ScaleEvent::ErrorOccurred { message } if message == "Scale disconnected during read"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_reads_escalate() {
        let mut h = harness(MockScale::new().with_reads(vec![MockRead::Empty; 5]));
        h.worker.search().await;
        drain(&mut h.events);

        for _ in 0..4 {
            assert_eq!(h.worker.read_cycle().await, AcquisitionPhase::Connected);
            assert!(h.state.read().connected);
        }
        assert_eq!(h.worker.read_cycle().await, AcquisitionPhase::ReconnectWait);
        assert!(!h.state.read().connected);
        assert_eq!(h.scale.read_calls(), 5);
        assert_eq!(disconnects(&drain(&mut h.events)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_read_escalates_immediately() {
        let mut h = harness(MockScale::new().with_reads([MockRead::Fatal]));
        h.worker.search().await;

        assert_eq!(h.worker.read_cycle().await, AcquisitionPhase::ReconnectWait);
        assert_eq!(h.scale.reconfigure_calls(), 0);
        assert_eq!(h.scale.open_handles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_failure_escalates() {
        let mut h = harness(MockScale::new().with_reads([MockRead::Transient]));
        h.worker.search().await;
        h.scale.set_fail_reconfigure(true);

        assert_eq!(h.worker.read_cycle().await, AcquisitionPhase::ReconnectWait);
        assert_eq!(h.scale.reconfigure_calls(), 1);
        assert!(!h.state.read().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_failures_escalate_after_three() {
        let scale = MockScale::new().with_reads(vec![MockRead::Unexpected; 3]);
        let mut h = harness(scale);
        h.worker.search().await;
        drain(&mut h.events);

        assert_eq!(h.worker.read_cycle().await, AcquisitionPhase::Connected);
        assert_eq!(h.worker.read_cycle().await, AcquisitionPhase::Connected);
        assert!(h.state.read().connected);
        assert_eq!(h.worker.consecutive_errors, 2);

        assert_eq!(h.worker.read_cycle().await, AcquisitionPhase::ReconnectWait);
        assert!(!h.state.read().connected);

        let events = drain(&mut h.events);
        assert_eq!(disconnects(&events), 1);
        assert!(events.iter().any(|e| matches!(
            e,
            ScaleEvent::ErrorOccurred { message } if message.starts_with("Repeated read errors")
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_now_while_connected_keeps_one_handle() {
        let mut h = harness(MockScale::new().with_reads([MockRead::grams(5)]));
        h.worker.search().await;

        let (reply, response) = oneshot::channel();
        h.handle
            .commands
            .send(Command::SearchNow { reply })
            .await
            .unwrap();
        assert_eq!(h.worker.read_cycle().await, AcquisitionPhase::Connected);
        assert!(response.await.unwrap());
        assert_eq!(h.scale.max_open_handles(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_stops_read_cycle() {
        let mut h = harness(MockScale::new());
        h.worker.search().await;
        drop(h.handle);
        assert_eq!(h.worker.read_cycle().await, AcquisitionPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_at_startup_then_attached() {
        let scale = MockScale::absent();
        let (handle, state, mut events) = spawn(&scale);

        sleep(Duration::from_millis(100)).await;
        assert!(!state.read().connected);
        assert_eq!(handle.phase(), AcquisitionPhase::ReconnectWait);

        scale.push_reads([MockRead::grams(180)]);
        scale.set_present(true);
        sleep(Duration::from_millis(5000)).await;
        assert!(state.read().connected);
        assert_eq!(state.read().weight_grams, 180);
        assert_eq!(scale.connect_calls(), 2);
        assert_eq!(handle.phase(), AcquisitionPhase::Connected);

        // Still reading a second later
        sleep(Duration::from_millis(1000)).await;
        assert!(state.read().connected);
        assert_eq!(scale.connect_calls(), 2);

        let events = drain(&mut events);
        assert_eq!(events.iter().filter(|e| e.is_connection(true)).count(), 1);
        assert_eq!(disconnects(&events), 0);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_wait_does_not_repeat_notifications() {
        let scale = MockScale::absent();
        let (handle, _state, mut events) = spawn(&scale);

        sleep(Duration::from_millis(21_000)).await;
        // Initial search plus one search per 5 s tick
        assert_eq!(scale.connect_calls(), 5);

        let events = drain(&mut events);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ScaleEvent::ErrorOccurred { .. }));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reads_during_reconnect_wait() {
        let scale = MockScale::new();
        let (handle, state, _events) = spawn(&scale);

        // Script is empty and nothing was ever served: five one-second
        // empty reads, then the session is given up at t = 5 s
        sleep(Duration::from_millis(100)).await;
        assert_eq!(scale.read_calls(), 1);
        assert!(state.read().connected);

        sleep(Duration::from_millis(5000)).await;
        assert_eq!(scale.read_calls(), 5);
        assert!(!state.read().connected);
        assert_eq!(handle.phase(), AcquisitionPhase::ReconnectWait);

        sleep(Duration::from_millis(4800)).await;
        assert_eq!(scale.read_calls(), 5);
        assert_eq!(scale.connect_calls(), 1);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(scale.connect_calls(), 2);
        assert!(scale.read_calls() > 5);
        assert_eq!(scale.max_open_handles(), 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_now_during_reconnect_wait() {
        let scale = MockScale::absent();
        let (handle, state, _events) = spawn(&scale);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.phase(), AcquisitionPhase::ReconnectWait);
        assert!(!handle.search_now().await.unwrap());

        scale.set_present(true);
        scale.push_reads([MockRead::grams(300)]);
        assert!(handle.search_now().await.unwrap());
        assert!(state.read().connected);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(state.read().weight_grams, 300);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_scale() {
        let scale = MockScale::new().with_reads([MockRead::grams(120)]);
        let (handle, state, mut events) = spawn(&scale);

        sleep(Duration::from_millis(1000)).await;
        assert!(state.read().connected);

        assert!(!handle.is_stopped());

        let start = Instant::now();
        handle.shutdown().await;
        assert!(start.elapsed() < Duration::from_secs(1));

        assert!(!state.read().connected);
        assert_eq!(state.read().weight_grams, 120);
        assert_eq!(scale.open_handles(), 0);

        let events = drain(&mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            ScaleEvent::ConnectionChanged {
                reason: Some(DisconnectReason::Stopped),
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_now_after_stop() {
        let scale = MockScale::new();
        let (handle, _state, _events) = spawn(&scale);
        handle.stop();

        let mut phase = handle.phase_receiver();
        phase
            .wait_for(|p| *p == AcquisitionPhase::Stopped)
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert!(handle.is_stopped());
        assert!(matches!(handle.search_now().await, Err(Error::Cancelled)));
    }
}
