//! Sample-rate adaptation and target-delay control.
//!
//! The resampler sits between the host process callback and the two audio
//! rings the engine drains and fills. Every process cycle it re-derives the
//! device/host ratio from the host side of the DLL, converts device audio
//! into exactly one host-buffer's worth of output ([`Resampler::read_audio`]),
//! and converts one host-buffer's worth of input into a ratio-sized chunk of
//! device audio ([`Resampler::write_audio`]). [`Resampler::compute_ratios`]
//! drives the Ready → Boot → Tune → Run startup state machine and promotes
//! the engine in lockstep.

use std::sync::Arc;

use bbx_core::{Consumer, Producer};
use rubato::{Resampler as _, SincFixedIn, SincFixedOut, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use spin::Mutex;
use tracing::{info, trace, warn};

use crate::device::DeviceDesc;
use crate::dll::HostDll;
use crate::engine::{Engine, EngineStatus};
use crate::error::OwError;

/// Boot phase duration before the DLL must be coarsely tuned.
const BOOT_SECS: f64 = 3.0;
/// Tune phase duration before the DLL must be tightly tuned.
const TUNE_SECS: f64 = 4.0;

const BOOT_TUNED_THRESHOLD: f64 = 1.0e-3;
const TUNE_TUNED_THRESHOLD: f64 = 1.0e-5;

const BOOT_BANDWIDTH: f64 = 1.0;
const TUNE_BANDWIDTH: f64 = 0.5;
const RUN_BANDWIDTH: f64 = 0.05;

/// Frames a short o2h read is allowed to fall back to once priming has
/// succeeded. Matches the original's `MAX_READ_FRAMES`.
const MAX_READ_FRAMES: usize = 5;

/// Startup phase, in the order described in spec §4.3's timeline table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResamplerStatus {
    Ready,
    Boot,
    Tune,
    Run,
}

/// Snapshot of resampler state, published under a spin mutex for readers
/// outside the host process thread (diagnostics, a future GUI).
#[derive(Debug, Clone, Copy)]
pub struct ResamplerState {
    pub status: ResamplerStatus,
    pub o2h_ratio: f64,
    pub h2o_ratio: f64,
    pub target_delay_frames: f64,
}

impl Default for ResamplerState {
    fn default() -> Self {
        ResamplerState { status: ResamplerStatus::Ready, o2h_ratio: 1.0, h2o_ratio: 1.0, target_delay_frames: 0.0 }
    }
}

/// Maps the `resampler_quality` tunable (0 = best, 4 = zero-order hold) onto
/// `rubato`'s sinc interpolation parameters. Quality 4 is modelled as a tiny
/// nearest-neighbour window rather than linear interpolation, matching the
/// original's "zero-order hold" description literally.
fn sinc_params_for_quality(quality: u32) -> SincInterpolationParameters {
    let (sinc_len, oversampling_factor, interpolation) = match quality {
        0 => (256, 256, SincInterpolationType::Cubic),
        1 => (128, 128, SincInterpolationType::Cubic),
        2 => (64, 64, SincInterpolationType::Cubic),
        3 => (32, 32, SincInterpolationType::Linear),
        _ => (16, 8, SincInterpolationType::Nearest),
    };
    SincInterpolationParameters { sinc_len, f_cutoff: 0.95, oversampling_factor, interpolation, window: WindowFunction::Blackman }
}

/// Maximum relative ratio excursion the converters are built to tolerate;
/// generously wide since host sample rates range from 44.1 kHz to 192 kHz
/// against a fixed 48 kHz device rate.
const MAX_RELATIVE_RATIO: f64 = 4.0;

fn deinterleave(bytes: &[u8], channels: usize, planar: &mut [Vec<f32>]) -> usize {
    let frame_bytes = channels * 4;
    let frames = bytes.len() / frame_bytes;
    for ch in planar.iter_mut() {
        ch.clear();
    }
    for f in 0..frames {
        let base = f * frame_bytes;
        for (ch, plane) in planar.iter_mut().enumerate() {
            let off = base + ch * 4;
            plane.push(f32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]]));
        }
    }
    frames
}

fn interleave(planar: &[Vec<f32>], frames: usize, out: &mut Vec<u8>) {
    out.clear();
    let channels = planar.len();
    out.reserve(frames * channels * 4);
    for f in 0..frames {
        for plane in planar {
            out.extend_from_slice(&plane[f].to_le_bytes());
        }
    }
}

/// Fractional rate converter pair plus the host side of the DLL. One
/// resampler serves exactly one engine/device pair, created and destroyed
/// alongside it.
pub struct Resampler {
    device: &'static DeviceDesc,
    bufsize: usize,
    samplerate: f64,
    quality: u32,

    engine: Arc<Engine>,
    host_dll: HostDll,

    o2h: SincFixedOut<f32>,
    h2o: SincFixedIn<f32>,

    o2h_in: Vec<Vec<f32>>,
    o2h_out: Vec<Vec<f32>>,
    h2o_in: Vec<Vec<f32>>,
    h2o_out: Vec<Vec<f32>>,

    o2h_byte_buf: Vec<u8>,
    h2o_byte_buf: Vec<u8>,

    /// The opposite ends of the engine's two rings: the resampler is the
    /// sole reader of device-to-host audio and the sole writer of
    /// host-to-device audio. `None` when that direction is disabled.
    o2h_consumer: Option<Consumer>,
    h2o_producer: Option<Producer>,

    /// Leftover bytes read from the o2h ring that did not amount to a whole
    /// chunk, kept across cycles while priming (spec §4.3 "discard queued
    /// bytes that are not a whole-N multiple").
    o2h_prime_queue: Vec<u8>,
    reading_at_o2h_end: bool,

    h2o_acc: f64,

    boot_start_usec: u64,
    tune_start_usec: u64,
    log_control_cycles: u64,
    cycles_since_log: u64,

    state: Mutex<ResamplerState>,
}

impl Resampler {
    /// Builds a resampler for `device`, sized for `bufsize` host frames at
    /// `samplerate` Hz, sharing `engine`'s device-side DLL snapshot.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &'static DeviceDesc,
        engine: Arc<Engine>,
        samplerate: f64,
        bufsize: usize,
        quality: u32,
        report_period_seconds: u32,
        o2h_consumer: Option<Consumer>,
        h2o_producer: Option<Producer>,
    ) -> Result<Self, OwError> {
        let params = sinc_params_for_quality(quality);

        let o2h = SincFixedOut::<f32>::new(samplerate / 48_000.0, MAX_RELATIVE_RATIO, params, bufsize, device.outputs())
            .map_err(|_| OwError::Generic)?;
        let h2o = SincFixedIn::<f32>::new(48_000.0 / samplerate, MAX_RELATIVE_RATIO, params, bufsize, device.inputs())
            .map_err(|_| OwError::Generic)?;

        let o2h_in = o2h.input_buffer_allocate(true);
        let o2h_out = o2h.output_buffer_allocate(true);
        let h2o_in = h2o.input_buffer_allocate(true);
        let h2o_out = h2o.output_buffer_allocate(true);

        let frames_per_transfer = engine.frames_per_transfer() as f64;
        let log_control_cycles = ((report_period_seconds as f64) * samplerate / bufsize as f64).max(1.0) as u64;

        let mut resampler = Resampler {
            device,
            bufsize,
            samplerate,
            quality,
            engine,
            host_dll: HostDll::new(),
            o2h,
            h2o,
            o2h_in,
            o2h_out,
            h2o_in,
            h2o_out,
            o2h_byte_buf: Vec::with_capacity(bufsize * device.o2h_frame_bytes() * 8),
            h2o_byte_buf: Vec::with_capacity(bufsize * device.h2o_frame_bytes() * 8),
            o2h_consumer,
            h2o_producer,
            o2h_prime_queue: Vec::new(),
            reading_at_o2h_end: false,
            h2o_acc: 0.0,
            boot_start_usec: 0,
            tune_start_usec: 0,
            log_control_cycles,
            cycles_since_log: 0,
            state: Mutex::new(ResamplerState::default()),
        };
        let _ = frames_per_transfer;
        resampler.reset();
        Ok(resampler)
    }

    pub fn state(&self) -> ResamplerState {
        *self.state.lock()
    }

    fn publish(&self, status: ResamplerStatus) {
        let mut s = self.state.lock();
        s.status = status;
        s.o2h_ratio = self.host_dll.ratio();
        s.h2o_ratio = 1.0 / self.host_dll.ratio();
        s.target_delay_frames = self.host_dll.target_delay();
    }

    /// Full reset: reinitialises the DLL, clears ratios back to nominal,
    /// and re-primes the o2h underflow state machine. Safe to call
    /// repeatedly (testable property 7): the second call observes the same
    /// post-reset fields as the first.
    pub fn reset(&mut self) {
        let frames_per_transfer = self.engine.frames_per_transfer();
        self.host_dll.init();
        self.host_dll.reset(self.samplerate, 48_000.0, self.bufsize as u32, frames_per_transfer);
        self.reading_at_o2h_end = false;
        self.o2h_prime_queue.clear();
        self.h2o_acc = 0.0;
        self.publish(ResamplerStatus::Ready);
    }

    /// Reinitialises buffer-size-dependent state. Only valid while the
    /// resampler is `Ready` (stopped) per spec §3's lifecycle rule; while
    /// running, callers must go through [`Resampler::request_reset`] instead,
    /// which forces the engine back to `Boot` first.
    pub fn set_buffer_size(&mut self, bufsize: usize) -> Result<(), OwError> {
        if self.state().status != ResamplerStatus::Ready {
            return Err(OwError::Generic);
        }
        self.bufsize = bufsize;
        let params = sinc_params_for_quality(self.quality);
        self.o2h = SincFixedOut::<f32>::new(self.samplerate / 48_000.0, MAX_RELATIVE_RATIO, params, bufsize, self.device.outputs())
            .map_err(|_| OwError::Generic)?;
        self.h2o = SincFixedIn::<f32>::new(48_000.0 / self.samplerate, MAX_RELATIVE_RATIO, params, bufsize, self.device.inputs())
            .map_err(|_| OwError::Generic)?;
        self.o2h_in = self.o2h.input_buffer_allocate(true);
        self.o2h_out = self.o2h.output_buffer_allocate(true);
        self.h2o_in = self.h2o.input_buffer_allocate(true);
        self.h2o_out = self.h2o.output_buffer_allocate(true);
        self.reset();
        Ok(())
    }

    /// A buffer-size/sample-rate change requested while running: per spec
    /// §4.3, this forces a full reset, drops the resampler back to `Ready`,
    /// and forces the engine back to `Boot` if it was already past it.
    pub fn request_reset(&mut self) {
        self.reset();
        if self.engine.status() > EngineStatus::Boot {
            self.engine.set_status(EngineStatus::Boot);
        }
    }

    /// Per-cycle entry point 1 of 3: re-derives the ratio from the DLL and
    /// drives the Ready → Boot → Tune → Run startup state machine.
    ///
    /// Returns `Ok(())` once ratios are valid, or `Err(OwError::Generic)`
    /// ("not ready") while still waiting on the engine to prime.
    pub fn compute_ratios(&mut self, now_usec: u64, audio_running_cb: impl FnOnce()) -> Result<(), OwError> {
        let status = self.state().status;
        let engine_status = self.engine.status();

        if status == ResamplerStatus::Ready && engine_status <= EngineStatus::Boot {
            if engine_status == EngineStatus::Ready {
                self.engine.set_status(EngineStatus::Steady);
                info!(device = self.device.name, "resampler alive, promoting engine to steady");
            }
            return Err(OwError::Generic);
        }

        self.host_dll.load_device_snapshot(&self.engine.device_dll().lock());
        self.host_dll.update_error(now_usec);

        if status == ResamplerStatus::Ready && engine_status == EngineStatus::Wait {
            self.host_dll.set_loop_filter(BOOT_BANDWIDTH, self.bufsize as u32, self.samplerate);
            self.boot_start_usec = now_usec;
            self.publish(ResamplerStatus::Boot);
            info!(device = self.device.name, "resampler booting");
        }

        self.host_dll.update();
        self.publish(self.state().status);

        let status = self.state().status;
        if status == ResamplerStatus::Boot
            && elapsed_secs(self.boot_start_usec, now_usec) > BOOT_SECS
            && self.host_dll.tuned(BOOT_TUNED_THRESHOLD, self.bufsize as u32)
        {
            self.host_dll.set_loop_filter(TUNE_BANDWIDTH, self.bufsize as u32, self.samplerate);
            self.tune_start_usec = now_usec;
            self.publish(ResamplerStatus::Tune);
            info!(device = self.device.name, "resampler tuning");
        } else if status == ResamplerStatus::Tune
            && elapsed_secs(self.tune_start_usec, now_usec) > TUNE_SECS
            && self.host_dll.tuned(TUNE_TUNED_THRESHOLD, self.bufsize as u32)
        {
            self.host_dll.set_loop_filter(RUN_BANDWIDTH, self.bufsize as u32, self.samplerate);
            self.publish(ResamplerStatus::Run);
            self.engine.set_status(EngineStatus::Run);
            audio_running_cb();
            info!(device = self.device.name, "resampler running: audio flowing end-to-end");
        }

        self.cycles_since_log += 1;
        if self.cycles_since_log >= self.log_control_cycles {
            self.cycles_since_log = 0;
            let state = self.state();
            info!(
                device = self.device.name,
                o2h_ratio = state.o2h_ratio,
                h2o_ratio = state.h2o_ratio,
                o2h_latency = self.engine.o2h_latency().current,
                h2o_latency = self.engine.h2o_latency().current,
                "resampler status"
            );
        }

        Ok(())
    }

    /// Per-cycle entry point 2 of 3: pulls exactly `output[i].len()` host
    /// frames of device-to-host audio through the o2h converter.
    pub fn read_audio(&mut self, output: &mut [&mut [f32]]) {
        let channels = self.device.outputs();
        debug_assert_eq!(output.len(), channels);
        let n = self.bufsize;

        let ratio = self.host_dll.ratio();
        let _ = self.o2h.set_resample_ratio(ratio, true);

        let frame_bytes = channels * 4;
        let needed_frames = self.o2h.input_frames_next();
        let needed_bytes = needed_frames * frame_bytes;

        self.o2h_byte_buf.clear();
        self.o2h_byte_buf.extend_from_slice(&self.o2h_prime_queue);
        self.o2h_prime_queue.clear();

        if let Some(consumer) = self.o2h_consumer.as_mut() {
            let available = consumer.read_space().min(needed_bytes.saturating_sub(self.o2h_byte_buf.len()));
            let start = self.o2h_byte_buf.len();
            self.o2h_byte_buf.resize(start + available, 0);
            consumer.read(Some(&mut self.o2h_byte_buf[start..]), available);
        }

        let have_frames = self.o2h_byte_buf.len() / frame_bytes;
        if have_frames < needed_frames {
            if !self.reading_at_o2h_end {
                // Priming: keep only whole-frame bytes, discard the rest,
                // and wait for a cycle with enough data to flip the flag.
                let whole = have_frames * frame_bytes;
                self.o2h_prime_queue.extend_from_slice(&self.o2h_byte_buf[..whole]);
                self.o2h_byte_buf.clear();
                for out_ch in output.iter_mut() {
                    out_ch.fill(0.0);
                }
                if have_frames >= needed_frames.min(MAX_READ_FRAMES) {
                    self.reading_at_o2h_end = true;
                }
                return;
            } else {
                // Running underflow: bound the short read, invalidate the
                // running max so the next healthy cycle rebuilds it.
                let bounded = have_frames.min(MAX_READ_FRAMES);
                let bytes = bounded * frame_bytes;
                self.o2h_byte_buf.truncate(bytes);
                self.engine.reset_latencies_max_to_min();
                warn!(device = self.device.name, have_frames, needed_frames, "o2h underflow, short read");
            }
        }

        let frames = deinterleave(&self.o2h_byte_buf, channels, &mut self.o2h_in);
        for plane in &mut self.o2h_in {
            plane.resize(needed_frames.max(frames), 0.0);
        }

        let (consumed, produced) =
            self.o2h.process_into_buffer(&self.o2h_in, &mut self.o2h_out, None).unwrap_or((0, 0));

        self.host_dll.add_frames(consumed as i64);

        for (ch, out_ch) in output.iter_mut().enumerate() {
            let len = produced.min(n).min(self.o2h_out[ch].len());
            out_ch[..len].copy_from_slice(&self.o2h_out[ch][..len]);
            for v in out_ch[len..].iter_mut() {
                *v = 0.0;
            }
        }

        trace!(device = self.device.name, consumed, produced, "o2h cycle");
    }

    /// Per-cycle entry point 3 of 3: converts exactly `input[i].len()` host
    /// frames of host-to-device audio through the h2o converter at `1/r`
    /// and writes the result to the h2o ring. No-ops before `Run`.
    pub fn write_audio(&mut self, input: &[&[f32]]) {
        if self.state().status != ResamplerStatus::Run {
            return;
        }
        let channels = self.device.inputs();
        debug_assert_eq!(input.len(), channels);
        let n = self.bufsize;

        let ratio = 1.0 / self.host_dll.ratio();
        let _ = self.h2o.set_resample_ratio(ratio, true);

        self.h2o_acc += n as f64 * (ratio - 1.0);

        for (ch, plane) in self.h2o_in.iter_mut().enumerate() {
            plane.resize(n, 0.0);
            plane.copy_from_slice(&input[ch][..n]);
        }

        let (_, produced) = self.h2o.process_into_buffer(&self.h2o_in, &mut self.h2o_out, None).unwrap_or((0, 0));
        let inc = self.h2o_acc.floor();
        let target = (n as f64 + inc) as usize;
        self.h2o_acc -= inc;
        let frames = produced.min(target).min(self.h2o_out[0].len());

        interleave(&self.h2o_out, frames, &mut self.h2o_byte_buf);

        if let Some(producer) = self.h2o_producer.as_mut() {
            let space = producer.write_space();
            if self.h2o_byte_buf.len() <= space {
                producer.write(&self.h2o_byte_buf);
            } else {
                warn!(device = self.device.name, "h2o overflow, dropping cycle's audio");
            }
        }
    }

    pub fn samplerate(&self) -> f64 {
        self.samplerate
    }

    pub fn bufsize(&self) -> usize {
        self.bufsize
    }
}

fn elapsed_secs(start_usec: u64, now_usec: u64) -> f64 {
    const MASK: u64 = 0x0FFF_FFFF;
    let start = (start_usec & MASK) as i64;
    let now = (now_usec & MASK) as i64;
    let mut delta = now - start;
    if delta < 0 {
        delta += 1i64 << 28;
    }
    delta as f64 * 1.0e-6
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device;

    fn make_engine() -> Arc<Engine> {
        let desc = device::lookup(0x000c).unwrap();
        Arc::new(Engine::new(desc, 4))
    }

    #[test]
    fn new_resampler_starts_ready() {
        let engine = make_engine();
        let r = Resampler::new(device::lookup(0x000c).unwrap(), engine, 48_000.0, 64, 2, 2, None, None).unwrap();
        assert_eq!(r.state().status, ResamplerStatus::Ready);
    }

    #[test]
    fn reset_is_idempotent() {
        let engine = make_engine();
        let mut r = Resampler::new(device::lookup(0x000c).unwrap(), engine, 48_000.0, 64, 2, 2, None, None).unwrap();
        r.reset();
        let first = r.state();
        r.reset();
        let second = r.state();
        assert_eq!(first.status, second.status);
        assert!((first.target_delay_frames - second.target_delay_frames).abs() < 1e-9);
    }

    #[test]
    fn bufsize_change_while_stopped_matches_scenario_c() {
        let engine = make_engine();
        engine.init_device_dll(48_000.0);
        let mut r = Resampler::new(device::lookup(0x000c).unwrap(), engine, 48_000.0, 64, 2, 2, None, None).unwrap();
        r.set_buffer_size(128).unwrap();
        // target_delay = 2*bufsize + 1.5*frames_per_transfer = 2*128 + 1.5*(4*7) = 298
        assert!((r.state().target_delay_frames - 298.0).abs() < 1e-9, "{}", r.state().target_delay_frames);
    }

    #[test]
    fn elapsed_secs_handles_28_bit_wraparound() {
        let quantum = 1u64 << 28;
        let start = quantum - 100;
        let now = 50; // wrapped past the quantum boundary
        let secs = elapsed_secs(start, now);
        assert!((secs - 150.0e-6).abs() < 1e-9, "{secs}");
    }

    #[test]
    fn set_buffer_size_rejected_while_running() {
        let engine = make_engine();
        let mut r = Resampler::new(device::lookup(0x000c).unwrap(), engine, 48_000.0, 64, 2, 2, None, None).unwrap();
        r.publish(ResamplerStatus::Run);
        assert!(r.set_buffer_size(128).is_err());
    }

    #[test]
    fn write_audio_keeps_h2o_acc_bounded_for_non_unity_ratio() {
        // samplerate != 48_000 so Resampler::new's initial reset() leaves
        // host_dll.ratio() away from 1.0 (44100/48000 here).
        let engine = make_engine();
        let desc = device::lookup(0x000c).unwrap();
        let (h2o_producer, h2o_consumer) = bbx_core::SpscRingBuffer::new(1 << 20);
        let mut r = Resampler::new(desc, engine, 44_100.0, 64, 2, 2, None, Some(h2o_producer)).unwrap();
        r.publish(ResamplerStatus::Run);

        let channels = desc.inputs();
        let zeros = vec![0.0f32; 64];
        let input: Vec<&[f32]> = (0..channels).map(|_| zeros.as_slice()).collect();

        for _ in 0..500 {
            r.write_audio(&input);
            assert!((-1.0..1.0).contains(&r.h2o_acc), "h2o_acc diverged out of [-1, 1): {}", r.h2o_acc);
        }

        let _ = h2o_consumer.read_space();
    }
}
