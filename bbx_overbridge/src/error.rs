//! Error types for the Overbridge synchronisation core.
//!
//! Mirrors the shape of [`bbx_core::error::BbxError`]: a flat,
//! `repr(C)`-friendly enum with a human-readable [`Display`] impl, so the
//! same error value can cross an FFI boundary if a future host adapter
//! needs it.

use core::fmt;

/// Error codes surfaced by `bbx_overbridge`.
///
/// Variants map directly onto the setup-time failure taxonomy: USB
/// enumeration/configuration failures, and missing pieces of the host
/// [`crate::context::Context`] contract. Hot-path conditions (ring
/// overflow, short reads) are never represented here — they are logged
/// and counted, not propagated, per the engine's error-handling design.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwError {
    /// No error occurred.
    Ok = 0,
    /// An unspecified or configuration-range error occurred.
    Generic = 1,
    /// `libusb`/`rusb` context initialisation failed.
    UsbInitFailed = 2,
    /// Failed to open the matched USB device.
    UsbOpen = 3,
    /// Failed to set the USB configuration.
    UsbSetConfig = 4,
    /// Failed to claim a USB interface.
    UsbClaimIf = 5,
    /// Failed to set a USB interface's alternate setting.
    UsbSetAlt = 6,
    /// Failed to clear halt on a USB endpoint.
    UsbClearEp = 7,
    /// Failed to allocate or prepare a USB transfer.
    UsbPrepareTransfer = 8,
    /// No device matching a known vendor/product id was found.
    UsbDeviceNotFound = 9,
    /// The host context is missing a `read_space` ring operation.
    MissingRingReadSpace = 10,
    /// The host context is missing a `write_space` ring operation.
    MissingRingWriteSpace = 11,
    /// The host context is missing a `read` ring operation.
    MissingRingRead = 12,
    /// The host context is missing a `write` ring operation.
    MissingRingWrite = 13,
    /// The o2h (device-to-host) ring buffer handle is missing.
    MissingO2hBuf = 14,
    /// The h2o (host-to-device) ring buffer handle is missing.
    MissingH2oBuf = 15,
    /// The host context is missing a `get_time` callback.
    MissingGetTime = 16,
    /// An enabled direction requires a DLL but none was supplied.
    MissingDll = 17,
}

impl fmt::Display for OwError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwError::Ok => write!(f, "no error"),
            OwError::Generic => write!(f, "generic error"),
            OwError::UsbInitFailed => write!(f, "USB context initialization failed"),
            OwError::UsbOpen => write!(f, "could not open USB device"),
            OwError::UsbSetConfig => write!(f, "could not set USB configuration"),
            OwError::UsbClaimIf => write!(f, "could not claim USB interface"),
            OwError::UsbSetAlt => write!(f, "could not set USB alternate setting"),
            OwError::UsbClearEp => write!(f, "could not clear USB endpoint halt"),
            OwError::UsbPrepareTransfer => write!(f, "could not prepare USB transfer"),
            OwError::UsbDeviceNotFound => write!(f, "no matching USB device found"),
            OwError::MissingRingReadSpace => write!(f, "context is missing a ring read_space operation"),
            OwError::MissingRingWriteSpace => write!(f, "context is missing a ring write_space operation"),
            OwError::MissingRingRead => write!(f, "context is missing a ring read operation"),
            OwError::MissingRingWrite => write!(f, "context is missing a ring write operation"),
            OwError::MissingO2hBuf => write!(f, "context is missing the o2h ring buffer"),
            OwError::MissingH2oBuf => write!(f, "context is missing the h2o ring buffer"),
            OwError::MissingGetTime => write!(f, "context is missing get_time"),
            OwError::MissingDll => write!(f, "an enabled direction requires a DLL but none was provided"),
        }
    }
}

impl std::error::Error for OwError {}

/// Result type alias for `bbx_overbridge` operations.
pub type Result<T> = core::result::Result<T, OwError>;
