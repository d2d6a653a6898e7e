//! USB scale connection and communication.
//!
//! This module provides the real [`ScaleLink`] implementation on top of
//! `nusb`: it enumerates the bus for the scale's vendor/product pair, claims
//! the HID interface, resolves its first IN endpoint and reads report frames
//! from it.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use nusb::transfer::{Control, ControlType, Direction, EndpointType, Recipient, RequestBuffer};
use tokio::task::spawn_blocking;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use usbscale_types::usb::{DYMO_M10_NAME, DYMO_M10_PRODUCT_ID, DYMO_VENDOR_ID, SCALE_INTERFACE};
use usbscale_types::{DeviceLabel, WeightReading};

use crate::error::{Error, ErrorKind, Result};
use crate::traits::ScaleLink;

/// Timeout of the liveness request.
const LIVENESS_TIMEOUT: Duration = Duration::from_millis(250);

/// Standard GET_STATUS request.
const GET_STATUS: u8 = 0x00;

/// The endpoint frames are read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadEndpoint {
    /// Endpoint address (direction bit set).
    pub address: u8,
    /// Largest packet the endpoint delivers.
    pub max_packet_size: usize,
    /// Interrupt for HID scales; bulk is accepted too.
    pub transfer_type: EndpointType,
}

/// An open session: device handle, claimed interface and read endpoint.
struct UsbSession {
    // Held so the device stays open as long as the session
    _device: nusb::Device,
    interface: nusb::Interface,
    endpoint: ReadEndpoint,
    label: DeviceLabel,
}

impl UsbSession {
    /// Send GET_STATUS to the device. Any failure means the scale is gone.
    ///
    /// Cached descriptors survive an unplug, so only a request that reaches
    /// the device tells.
    async fn check_alive(&self) -> bool {
        let interface = self.interface.clone();
        let result = spawn_blocking(move || {
            let mut status = [0u8; 2];
            interface.control_in_blocking(
                Control {
                    control_type: ControlType::Standard,
                    recipient: Recipient::Device,
                    request: GET_STATUS,
                    value: 0,
                    index: 0,
                },
                &mut status,
                LIVENESS_TIMEOUT,
            )
        })
        .await;

        match result {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!("Connection check: scale not reachable - {}", e);
                false
            }
            Err(e) => {
                warn!("Connection check did not complete: {}", e);
                false
            }
        }
    }
}

/// A USB-attached scale.
///
/// Holds at most one open session. Dropping the session releases the
/// claimed interface and the device handle.
pub struct UsbScale {
    vendor_id: u16,
    product_id: u16,
    model_name: String,
    session: Option<UsbSession>,
}

impl std::fmt::Debug for UsbScale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbScale")
            .field("vendor_id", &format_args!("{:#06x}", self.vendor_id))
            .field("product_id", &format_args!("{:#06x}", self.product_id))
            .field("connected", &self.session.is_some())
            .field("endpoint", &self.session.as_ref().map(|s| s.endpoint))
            .finish()
    }
}

impl Default for UsbScale {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbScale {
    /// Create a link for the Dymo M5/M10.
    pub fn new() -> Self {
        Self::with_ids(DYMO_VENDOR_ID, DYMO_M10_PRODUCT_ID, DYMO_M10_NAME)
    }

    /// Create a link for another vendor/product pair with the same frame layout.
    pub fn with_ids(vendor_id: u16, product_id: u16, model_name: impl Into<String>) -> Self {
        Self {
            vendor_id,
            product_id,
            model_name: model_name.into(),
            session: None,
        }
    }

    /// The endpoint of the open session, if any.
    pub fn endpoint(&self) -> Option<ReadEndpoint> {
        self.session.as_ref().map(|s| s.endpoint)
    }

    /// Enumerate, open and claim on the blocking pool; these are plain
    /// syscalls that may stall for a moment.
    async fn open_session(&self) -> Result<UsbSession> {
        let (vendor_id, product_id) = (self.vendor_id, self.product_id);
        let label = DeviceLabel::usb(self.model_name.clone());
        spawn_blocking(move || open_session_blocking(vendor_id, product_id, label))
            .await
            .map_err(|e| Error::Unexpected(format!("USB open task failed: {e}")))?
    }

    fn release(&mut self) {
        if self.session.take().is_some() {
            info!("Scale disconnected");
        }
    }
}

fn open_session_blocking(vendor_id: u16, product_id: u16, label: DeviceLabel) -> Result<UsbSession> {
    let info = nusb::list_devices()?
        .find(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
        .ok_or_else(|| Error::device_not_found(vendor_id, product_id))?;

    debug!(
        bus = info.bus_number(),
        address = info.device_address(),
        product = info.product_string().unwrap_or("?"),
        "Found scale on the bus"
    );

    let device = info.open()?;
    // Detaches the kernel HID driver on Linux; plain claim elsewhere.
    let interface = device.detach_and_claim_interface(SCALE_INTERFACE)?;
    let endpoint = resolve_read_endpoint(&device)?;

    debug!(
        address = endpoint.address,
        max_packet_size = endpoint.max_packet_size,
        "Claimed scale interface"
    );

    Ok(UsbSession {
        _device: device,
        interface,
        endpoint,
        label,
    })
}

/// Find the first IN endpoint of the scale interface's default alt setting.
fn resolve_read_endpoint(device: &nusb::Device) -> Result<ReadEndpoint> {
    let config = device.active_configuration().map_err(io::Error::other)?;

    for alt in config.interface_alt_settings() {
        if alt.interface_number() != SCALE_INTERFACE || alt.alternate_setting() != 0 {
            continue;
        }
        if let Some(ep) = alt.endpoints().find(|ep| ep.direction() == Direction::In) {
            return Ok(ReadEndpoint {
                address: ep.address(),
                max_packet_size: ep.max_packet_size(),
                transfer_type: ep.transfer_type(),
            });
        }
    }

    Err(Error::EndpointNotFound {
        interface: SCALE_INTERFACE,
    })
}

#[async_trait]
impl ScaleLink for UsbScale {
    async fn find_and_connect(&mut self) -> Result<DeviceLabel> {
        if let Some(session) = &self.session {
            if session.check_alive().await {
                debug!("Scale session still valid");
                return Ok(session.label.clone());
            }
            self.release();
        }

        match self.open_session().await {
            Ok(session) => {
                info!("USB scale found: {}", session.label.name);
                let label = session.label.clone();
                self.session = Some(session);
                Ok(label)
            }
            Err(e) => {
                if e.kind() == ErrorKind::NotFound {
                    warn!("Scale not found");
                } else {
                    warn!("Error while searching for USB scale: {}", e);
                }
                Err(e)
            }
        }
    }

    async fn is_alive(&self) -> bool {
        match &self.session {
            Some(session) => session.check_alive().await,
            None => false,
        }
    }

    async fn disconnect(&mut self) {
        self.release();
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn label(&self) -> Option<&DeviceLabel> {
        self.session.as_ref().map(|s| &s.label)
    }

    async fn read_one(&mut self, read_timeout: Duration) -> Result<Option<WeightReading>> {
        let session = self.session.as_ref().ok_or(Error::NotConnected)?;
        let endpoint = session.endpoint;
        let request = RequestBuffer::new(endpoint.max_packet_size);

        let transfer = match endpoint.transfer_type {
            EndpointType::Bulk => session.interface.bulk_in(endpoint.address, request),
            _ => session.interface.interrupt_in(endpoint.address, request),
        };

        // Dropping the transfer future on timeout cancels the transfer.
        let completion = match timeout(read_timeout, transfer).await {
            Ok(completion) => completion,
            Err(_) => {
                debug!("No frame within {:?}", read_timeout);
                return Ok(None);
            }
        };

        let data = match completion.into_result() {
            Ok(data) => data,
            Err(e) => {
                let err = Error::from(e);
                if err.is_fatal() {
                    self.release();
                }
                return Err(err);
            }
        };

        match WeightReading::from_frame(&data) {
            Ok(reading) => {
                debug!(grams = reading.grams, "Weight read");
                Ok(Some(reading))
            }
            Err(e) => {
                warn!("Invalid frame {:02x?}: {}", data, e);
                Ok(None)
            }
        }
    }

    async fn reconfigure(&mut self) -> Result<()> {
        let session = self.session.as_ref().ok_or(Error::NotConnected)?;
        let result = session
            .interface
            .set_alt_setting(0)
            .and_then(|()| session.interface.clear_halt(session.endpoint.address));

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = Error::from(e);
                warn!("Error while reconfiguring scale: {}", err);
                if err.is_fatal() {
                    self.release();
                }
                Err(err)
            }
        }
    }
}
