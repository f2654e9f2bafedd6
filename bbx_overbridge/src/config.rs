//! Validated startup configuration for an engine/resampler pair.
//!
//! There is no file format and no persistence here — per the core's
//! non-goals, configuration *storage* is a front-end concern. This is
//! just the inline range validation the engine needs before it touches
//! any hardware.

use crate::error::OwError;

const BLOCKS_PER_TRANSFER_RANGE: std::ops::RangeInclusive<u32> = 2..=32;
const XFR_TIMEOUT_MS_RANGE: std::ops::RangeInclusive<u32> = 0..=25;
const RESAMPLER_QUALITY_RANGE: std::ops::RangeInclusive<u32> = 0..=4;

/// Tunables read once at `start()` and otherwise immutable for the life
/// of an engine/resampler pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    /// Interrupt-transfer blocks batched per USB transfer, 2..=32.
    pub blocks_per_transfer: u32,
    /// libusb transfer timeout in milliseconds, 0..=25 (0 = infinite).
    pub usb_xfr_timeout_ms: u32,
    /// Resampler sinc quality, 0 (best) through 4 (zero-order hold).
    pub resampler_quality: u32,
    /// Cadence, in seconds, of the periodic state-report log line.
    pub report_period_seconds: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig { blocks_per_transfer: 24, usb_xfr_timeout_ms: 10, resampler_quality: 2, report_period_seconds: 2 }
    }
}

impl EngineConfig {
    /// Checks every tunable against its documented range, returning the
    /// first violation found as `OwError::Generic` — matching end-to-end
    /// scenario E, which expects out-of-range `blocks_per_transfer` to be
    /// rejected at construction with a generic error, not a specific tag.
    pub fn validate(&self) -> Result<(), OwError> {
        if !BLOCKS_PER_TRANSFER_RANGE.contains(&self.blocks_per_transfer) {
            return Err(OwError::Generic);
        }
        if !XFR_TIMEOUT_MS_RANGE.contains(&self.usb_xfr_timeout_ms) {
            return Err(OwError::Generic);
        }
        if !RESAMPLER_QUALITY_RANGE.contains(&self.resampler_quality) {
            return Err(OwError::Generic);
        }
        if self.report_period_seconds == 0 {
            return Err(OwError::Generic);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn blocks_per_transfer_out_of_range_is_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.blocks_per_transfer = 64;
        assert_eq!(cfg.validate(), Err(OwError::Generic));

        cfg.blocks_per_transfer = 1;
        assert_eq!(cfg.validate(), Err(OwError::Generic));
    }

    #[test]
    fn blocks_per_transfer_boundaries_are_accepted() {
        let mut cfg = EngineConfig::default();
        cfg.blocks_per_transfer = 32;
        assert!(cfg.validate().is_ok());
        cfg.blocks_per_transfer = 2;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn xfr_timeout_out_of_range_is_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.usb_xfr_timeout_ms = 26;
        assert_eq!(cfg.validate(), Err(OwError::Generic));
    }

    #[test]
    fn resampler_quality_out_of_range_is_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.resampler_quality = 5;
        assert_eq!(cfg.validate(), Err(OwError::Generic));
    }
}
