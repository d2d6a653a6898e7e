//! Mock scale implementation for testing.
//!
//! This module provides a scripted scale that can be used for unit testing
//! without USB hardware.
//!
//! The [`MockScale`] implements the [`ScaleLink`] trait, so the acquisition
//! worker can drive it exactly like a real scale. Clones share state: keep
//! one clone in the test to script behavior and inspect counters while the
//! worker owns another.
//!
//! # Features
//!
//! - **Scripted reads**: queue frames, empty reads and errors
//! - **Presence and liveness**: plug, unplug, or let the handle go stale
//! - **Failure injection**: make the reconfigure step fail
//! - **Handle accounting**: track open handles to catch leaks

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use nusb::transfer::TransferError;

use usbscale_types::usb::{DYMO_M10_NAME, DYMO_M10_PRODUCT_ID, DYMO_VENDOR_ID};
use usbscale_types::{DeviceLabel, WeightReading};

use crate::error::{Error, Result};
use crate::traits::ScaleLink;

/// One scripted outcome of [`ScaleLink::read_one`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRead {
    /// The device returns this raw frame.
    Frame(Vec<u8>),
    /// The read times out. Takes the full read timeout.
    Empty,
    /// A recoverable transfer error (endpoint stall).
    Transient,
    /// The device disappears mid-read.
    Fatal,
    /// A failure outside the transport.
    Unexpected,
}

impl MockRead {
    /// Frame carrying the given weight in grams.
    pub fn grams(grams: u16) -> Self {
        let [lo, hi] = grams.to_le_bytes();
        MockRead::Frame(vec![3, 2, 2, 0, lo, hi])
    }
}

#[derive(Debug)]
struct MockInner {
    label: DeviceLabel,
    present: AtomicBool,
    alive: AtomicBool,
    connected: AtomicBool,
    fail_reconfigure: AtomicBool,
    reads: Mutex<VecDeque<MockRead>>,
    last_frame: Mutex<Option<Vec<u8>>>,
    read_latency_ms: AtomicU64,
    open_handles: AtomicU32,
    max_open_handles: AtomicU32,
    connect_calls: AtomicU32,
    alive_calls: AtomicU32,
    read_calls: AtomicU32,
    reconfigure_calls: AtomicU32,
}

/// A mock scale for testing.
///
/// When the scripted reads run out, the mock keeps returning the last frame
/// it served (a scale at rest keeps reporting the same weight), or empty
/// reads if it never served one. Empty reads block for the whole read
/// timeout, so tests that rely on them should run with paused time.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use usbscale_core::{MockRead, MockScale, ScaleLink};
///
/// #[tokio::main]
/// async fn main() {
///     let mut scale = MockScale::new().with_reads([MockRead::grams(250)]);
///     scale.find_and_connect().await.unwrap();
///
///     let reading = scale.read_one(Duration::from_secs(1)).await.unwrap();
///     assert_eq!(reading.unwrap().grams, 250);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MockScale {
    inner: Arc<MockInner>,
}

impl Default for MockScale {
    fn default() -> Self {
        Self::new()
    }
}

impl MockScale {
    /// Create a present, healthy mock scale with no scripted reads.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                label: DeviceLabel::usb(DYMO_M10_NAME),
                present: AtomicBool::new(true),
                alive: AtomicBool::new(true),
                connected: AtomicBool::new(false),
                fail_reconfigure: AtomicBool::new(false),
                reads: Mutex::new(VecDeque::new()),
                last_frame: Mutex::new(None),
                read_latency_ms: AtomicU64::new(0),
                open_handles: AtomicU32::new(0),
                max_open_handles: AtomicU32::new(0),
                connect_calls: AtomicU32::new(0),
                alive_calls: AtomicU32::new(0),
                read_calls: AtomicU32::new(0),
                reconfigure_calls: AtomicU32::new(0),
            }),
        }
    }

    /// Create a mock scale that is not plugged in.
    pub fn absent() -> Self {
        let scale = Self::new();
        scale.set_present(false);
        scale
    }

    /// Queue scripted reads.
    pub fn with_reads(self, reads: impl IntoIterator<Item = MockRead>) -> Self {
        self.push_reads(reads);
        self
    }

    /// Append scripted reads.
    pub fn push_reads(&self, reads: impl IntoIterator<Item = MockRead>) {
        lock(&self.inner.reads).extend(reads);
    }

    /// Plug or unplug the scale. Unplugging also makes the handle stale.
    pub fn set_present(&self, present: bool) {
        self.inner.present.store(present, Ordering::SeqCst);
        self.inner.alive.store(present, Ordering::SeqCst);
    }

    /// Control the liveness check independently of presence.
    pub fn set_alive(&self, alive: bool) {
        self.inner.alive.store(alive, Ordering::SeqCst);
    }

    /// Make [`ScaleLink::reconfigure`] fail with a transient error.
    pub fn set_fail_reconfigure(&self, fail: bool) {
        self.inner.fail_reconfigure.store(fail, Ordering::SeqCst);
    }

    /// Simulated time each read blocks for.
    pub fn set_read_latency(&self, latency: Duration) {
        self.inner
            .read_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of transport handles currently open.
    pub fn open_handles(&self) -> u32 {
        self.inner.open_handles.load(Ordering::SeqCst)
    }

    /// Highest number of handles that were open at the same time.
    pub fn max_open_handles(&self) -> u32 {
        self.inner.max_open_handles.load(Ordering::SeqCst)
    }

    /// Number of `find_and_connect` calls.
    pub fn connect_calls(&self) -> u32 {
        self.inner.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of `is_alive` calls.
    pub fn alive_calls(&self) -> u32 {
        self.inner.alive_calls.load(Ordering::SeqCst)
    }

    /// Number of `read_one` calls.
    pub fn read_calls(&self) -> u32 {
        self.inner.read_calls.load(Ordering::SeqCst)
    }

    /// Number of `reconfigure` calls.
    pub fn reconfigure_calls(&self) -> u32 {
        self.inner.reconfigure_calls.load(Ordering::SeqCst)
    }

    /// Scripted reads not consumed yet.
    pub fn pending_reads(&self) -> usize {
        lock(&self.inner.reads).len()
    }

    fn open_handle(&self) {
        let open = self.inner.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_open_handles.fetch_max(open, Ordering::SeqCst);
        self.inner.connected.store(true, Ordering::SeqCst);
    }

    fn release_handle(&self) {
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            self.inner.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn next_read(&self) -> MockRead {
        if let Some(read) = lock(&self.inner.reads).pop_front() {
            return read;
        }
        match lock(&self.inner.last_frame).clone() {
            Some(frame) => MockRead::Frame(frame),
            None => MockRead::Empty,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl ScaleLink for MockScale {
    async fn find_and_connect(&mut self) -> Result<DeviceLabel> {
        self.inner.connect_calls.fetch_add(1, Ordering::SeqCst);

        if self.inner.connected.load(Ordering::SeqCst) {
            if self.inner.alive.load(Ordering::SeqCst) {
                return Ok(self.inner.label.clone());
            }
            self.release_handle();
        }

        if !self.inner.present.load(Ordering::SeqCst) {
            return Err(Error::device_not_found(DYMO_VENDOR_ID, DYMO_M10_PRODUCT_ID));
        }

        self.open_handle();
        Ok(self.inner.label.clone())
    }

    async fn is_alive(&self) -> bool {
        self.inner.alive_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.connected.load(Ordering::SeqCst) && self.inner.alive.load(Ordering::SeqCst)
    }

    async fn disconnect(&mut self) {
        self.release_handle();
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn label(&self) -> Option<&DeviceLabel> {
        self.is_connected().then_some(&self.inner.label)
    }

    async fn read_one(&mut self, timeout: Duration) -> Result<Option<WeightReading>> {
        self.inner.read_calls.fetch_add(1, Ordering::SeqCst);

        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }

        let latency = Duration::from_millis(self.inner.read_latency_ms.load(Ordering::SeqCst))
            .min(timeout);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match self.next_read() {
            MockRead::Frame(frame) => {
                let reading = WeightReading::from_frame(&frame).ok();
                *lock(&self.inner.last_frame) = Some(frame);
                Ok(reading)
            }
            MockRead::Empty => {
                // A real empty read only returns once the timeout expires
                tokio::time::sleep(timeout - latency).await;
                Ok(None)
            }
            MockRead::Transient => Err(Error::Transfer(TransferError::Stall)),
            MockRead::Fatal => {
                self.release_handle();
                Err(Error::Transfer(TransferError::Disconnected))
            }
            MockRead::Unexpected => Err(Error::Unexpected("mock failure".to_string())),
        }
    }

    async fn reconfigure(&mut self) -> Result<()> {
        self.inner.reconfigure_calls.fetch_add(1, Ordering::SeqCst);

        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        if self.inner.fail_reconfigure.load(Ordering::SeqCst) {
            return Err(Error::Usb(std::io::Error::other("Resource busy")));
        }
        Ok(())
    }
}
