//! Real USB transport: device discovery, configuration, and the
//! interrupt-transfer pump that keeps an Overbridge device fed.
//!
//! `rusb`'s safe API has no equivalent of libusb's native async
//! completion-callback scheduling, so the "exactly one IN and one OUT
//! transfer in flight at all times" invariant from spec §4.2 is modelled
//! here with two dedicated blocking OS threads, one per endpoint
//! direction (see [`crate::Overbridge`]), instead of literal libusb
//! callbacks — the observable behaviour (continuous pumping, OUT
//! resubmission only after the previous OUT completes, no starvation) is
//! the same.

use std::time::Duration;

use rusb::{Direction, Recipient, RequestType, UsbContext};

use crate::device::ELEKTRON_VENDOR_ID;
use crate::error::OwError;

/// Audio OUT (host → device) interrupt endpoint address.
pub const EP_AUDIO_OUT: u8 = 0x03;
/// Audio IN (device → host) interrupt endpoint address.
pub const EP_AUDIO_IN: u8 = 0x83;

const USB_CONFIGURATION: u8 = 1;
/// The two interfaces carrying the audio interrupt endpoints.
const AUDIO_INTERFACES: [u8; 2] = [1, 2];
const AUDIO_ALT_SETTING: u8 = 3;
/// Interfaces a kernel driver (e.g. USB audio class or HID) may already
/// hold; detached before claiming the audio interfaces and reattached on
/// release, per spec §6.
const KERNEL_OWNED_INTERFACES: [u8; 2] = [4, 5];

/// Vendor control request that reads (or writes) the device's name.
const NAME_REQUEST: u8 = 1;
/// Side-effect-only request the firmware expects right after a name read.
const NAME_INIT_REQUEST: u8 = 2;
const NAME_MAX_LEN: usize = 32;

/// A claimed, configured Overbridge USB device ready to pump transfers.
///
/// Everything here is blocking/synchronous; [`crate::Overbridge`] is what
/// turns these calls into the continuously-pumping audio thread pair.
pub struct UsbDevice {
    handle: rusb::DeviceHandle<rusb::Context>,
    bus: u8,
    address: u8,
    detached_kernel_driver: Vec<u8>,
}

impl UsbDevice {
    /// Opens the first device matching `product_id` under the Elektron
    /// vendor id, sets configuration 1, detaches any kernel driver bound
    /// to interfaces 4/5, claims interfaces 1 and 2 at alt setting 3, and
    /// clears halt on both audio endpoints.
    pub fn open(product_id: u16) -> Result<Self, OwError> {
        let context = rusb::Context::new().map_err(|_| OwError::UsbInitFailed)?;
        let devices = context.devices().map_err(|_| OwError::UsbInitFailed)?;

        for device in devices.iter() {
            let Ok(desc) = device.device_descriptor() else { continue };
            if desc.vendor_id() != ELEKTRON_VENDOR_ID || desc.product_id() != product_id {
                continue;
            }

            let mut handle = device.open().map_err(|_| OwError::UsbOpen)?;
            let bus = device.bus_number();
            let address = device.address();

            handle.set_active_configuration(USB_CONFIGURATION).map_err(|_| OwError::UsbSetConfig)?;

            let mut detached = Vec::new();
            for iface in KERNEL_OWNED_INTERFACES {
                if handle.kernel_driver_active(iface).unwrap_or(false) {
                    handle.detach_kernel_driver(iface).map_err(|_| OwError::UsbClaimIf)?;
                    detached.push(iface);
                }
            }

            for iface in AUDIO_INTERFACES {
                handle.claim_interface(iface).map_err(|_| OwError::UsbClaimIf)?;
                handle.set_alternate_setting(iface, AUDIO_ALT_SETTING).map_err(|_| OwError::UsbSetAlt)?;
            }

            handle.clear_halt(EP_AUDIO_OUT).map_err(|_| OwError::UsbClearEp)?;
            handle.clear_halt(EP_AUDIO_IN).map_err(|_| OwError::UsbClearEp)?;

            return Ok(UsbDevice { handle, bus, address, detached_kernel_driver: detached });
        }

        Err(OwError::UsbDeviceNotFound)
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Reads the device's product name over the vendor control channel,
    /// then issues the side-effect-only follow-up request the firmware
    /// expects after a name read (spec §6, "a second control IN is issued
    /// after for side-effect initialisation").
    pub fn read_name(&self) -> Result<String, OwError> {
        let mut buf = [0u8; NAME_MAX_LEN];
        let n = self
            .handle
            .read_control(
                rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device),
                NAME_REQUEST,
                0,
                0,
                &mut buf,
                Duration::from_millis(100),
            )
            .map_err(|_| OwError::Generic)?;

        let _ = self.handle.read_control(
            rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device),
            NAME_INIT_REQUEST,
            0,
            0,
            &mut [],
            Duration::from_millis(100),
        );

        Ok(String::from_utf8_lossy(&buf[..n]).trim_end_matches('\0').to_string())
    }

    /// Writes a new device name (truncated to 32 bytes) over the vendor
    /// control channel.
    pub fn write_name(&self, name: &str) -> Result<(), OwError> {
        let mut payload = name.as_bytes().to_vec();
        payload.truncate(NAME_MAX_LEN);
        self.handle
            .write_control(
                rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device),
                NAME_REQUEST,
                0,
                0,
                &payload,
                Duration::from_millis(100),
            )
            .map_err(|_| OwError::Generic)?;
        Ok(())
    }

    /// Submits one OUT interrupt transfer, blocking up to `timeout`
    /// (0 = infinite, per the `usb_xfr_timeout_ms` tunable).
    pub fn write_out(&self, bytes: &[u8], timeout: Duration) -> Result<(), OwError> {
        self.handle.write_interrupt(EP_AUDIO_OUT, bytes, timeout).map(|_| ()).map_err(|_| OwError::UsbPrepareTransfer)
    }

    /// Submits one IN interrupt transfer, blocking up to `timeout`, and
    /// returns the number of bytes received.
    pub fn read_in(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, OwError> {
        self.handle.read_interrupt(EP_AUDIO_IN, buf, timeout).map_err(|_| OwError::UsbPrepareTransfer)
    }

    /// Releases the claimed interfaces and reattaches any kernel driver
    /// this handle detached at open time.
    pub fn release(self) {
        for iface in AUDIO_INTERFACES {
            let _ = self.handle.release_interface(iface);
        }
        for iface in &self.detached_kernel_driver {
            let _ = self.handle.attach_kernel_driver(*iface);
        }
    }
}
