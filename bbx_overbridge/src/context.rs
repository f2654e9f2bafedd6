//! The host adapter contract: everything a caller must hand the engine
//! at `start()` beyond the device itself.
//!
//! A [`Context`] is assembled once per run and never mutated in place —
//! buffer sizes and sample rates are reinitialised only while stopped
//! (see [`crate::resampler::Resampler::set_buffer_size`]).

use std::sync::Arc;

use bbx_core::{Consumer, Producer};
use spin::Mutex;

use crate::dll::DeviceDll;
use crate::error::OwError;

/// Which directions the caller wants the engine to push audio through.
/// A raw capture/dump tool that only wants o2h, for instance, leaves
/// `h2o_audio` false and need not supply an h2o ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    pub o2h_audio: bool,
    pub h2o_audio: bool,
}

/// Target for [`Context::set_rt_priority`] — the one real-time thread
/// the engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtThread {
    Audio,
}

pub type GetTime = Arc<dyn Fn() -> u64 + Send + Sync>;
pub type SetRtPriority = Arc<dyn Fn(RtThread, i32) + Send + Sync>;

/// Everything the engine needs from its caller to run: the producing
/// end of the o2h ring (the engine is the sole writer), the consuming
/// end of the h2o ring (the engine is the sole reader), a monotonic
/// microsecond clock, an optional real-time priority hook, and —
/// whenever either direction is enabled — a device-side DLL to drive
/// from USB IN completions.
///
/// The opposite ends of both rings (the o2h consumer, the h2o producer)
/// belong to whoever reads device audio and supplies host audio —
/// ordinarily a [`crate::resampler::Resampler`], but a standalone capture
/// tool can hold them directly instead, exactly as the engine can run
/// without a resampler at all.
#[derive(Default)]
pub struct Context {
    pub options: Options,
    pub o2h_producer: Option<Producer>,
    pub h2o_consumer: Option<Consumer>,
    pub get_time: Option<GetTime>,
    pub set_rt_priority: Option<SetRtPriority>,
    pub dll: Option<Arc<Mutex<DeviceDll>>>,
}

impl Context {
    /// Checks the contract the engine relies on, returning the first
    /// violation as a distinct [`OwError`] tag. Called once at the top of
    /// `start()`; on failure the engine allocates nothing.
    pub fn validate(&self) -> Result<(), OwError> {
        if self.get_time.is_none() {
            return Err(OwError::MissingGetTime);
        }
        if self.options.o2h_audio && self.o2h_producer.is_none() {
            return Err(OwError::MissingO2hBuf);
        }
        if self.options.h2o_audio && self.h2o_consumer.is_none() {
            return Err(OwError::MissingH2oBuf);
        }
        if (self.options.o2h_audio || self.options.h2o_audio) && self.dll.is_none() {
            return Err(OwError::MissingDll);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bbx_core::SpscRingBuffer;

    fn get_time_stub() -> GetTime {
        Arc::new(|| 0)
    }

    #[test]
    fn empty_context_with_no_audio_requested_validates() {
        let mut ctx = Context::default();
        ctx.get_time = Some(get_time_stub());
        assert!(ctx.validate().is_ok());
    }

    #[test]
    fn missing_get_time_is_rejected() {
        let ctx = Context::default();
        assert_eq!(ctx.validate(), Err(OwError::MissingGetTime));
    }

    #[test]
    fn enabling_o2h_without_a_producer_is_rejected() {
        let mut ctx = Context::default();
        ctx.get_time = Some(get_time_stub());
        ctx.options.o2h_audio = true;
        assert_eq!(ctx.validate(), Err(OwError::MissingO2hBuf));
    }

    #[test]
    fn enabling_audio_without_a_dll_is_rejected() {
        let mut ctx = Context::default();
        ctx.get_time = Some(get_time_stub());
        ctx.options.o2h_audio = true;
        let (producer, _consumer) = SpscRingBuffer::new(1024);
        ctx.o2h_producer = Some(producer);
        assert_eq!(ctx.validate(), Err(OwError::MissingDll));
    }

    #[test]
    fn fully_populated_context_validates() {
        let mut ctx = Context::default();
        ctx.get_time = Some(get_time_stub());
        ctx.options.o2h_audio = true;
        ctx.options.h2o_audio = true;
        let (o2h_producer, _o2h_consumer) = SpscRingBuffer::new(1024);
        let (_h2o_producer, h2o_consumer) = SpscRingBuffer::new(1024);
        ctx.o2h_producer = Some(o2h_producer);
        ctx.h2o_consumer = Some(h2o_consumer);
        ctx.dll = Some(Arc::new(Mutex::new(DeviceDll::new())));
        assert!(ctx.validate().is_ok());
    }
}
