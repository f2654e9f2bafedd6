//! USB transfer scheduler: the component that owns the two audio
//! interrupt endpoints, runs the dedicated audio thread, and drives the
//! device side of the DLL.
//!
//! The literal libusb async-transfer/callback plumbing lives in
//! [`crate::usb`]; this module only knows about one thing per cycle — a
//! block of bytes in, a block of bytes out — through the
//! [`crate::usb::UsbTransport`] trait, so it can be driven by a real
//! device or by a test double with no hardware involved.

use std::sync::Arc;

use spin::Mutex;
use tracing::{info, warn};

use crate::context::Context;
use crate::device::{DeviceDesc, TrackDesc};
use crate::dll::DeviceDll;
use crate::protocol;

/// Bytes one ring-buffer sample occupies: audio crosses the rings as raw
/// `f32`, independent of the device's 3- or 4-byte wire sample width.
const RING_SAMPLE_BYTES: usize = 4;

/// Engine lifecycle. Declaration order is significant: derived
/// `PartialOrd`/`Ord` compare by this order, and the engine's transition
/// logic leans on that (`status < Run`, `status >= Wait`, …) exactly as
/// the original's integer status codes did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EngineStatus {
    Error,
    Stop,
    Ready,
    Steady,
    Boot,
    Wait,
    Clear,
    Run,
}

/// Running current/min/max observation of a ring's host-frame latency.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyCounters {
    pub current: usize,
    pub min: usize,
    pub max: usize,
}

impl LatencyCounters {
    fn observe(&mut self, value: usize) {
        self.current = value;
        if self.min == 0 || value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    fn reset(&mut self) {
        self.current = 0;
        self.max = 0;
    }

    /// Forces `max` back down to the last known floor. Used once after a
    /// forced underflow so a subsequent genuine spike is still detected.
    pub fn reset_max_to_min(&mut self) {
        self.max = self.min;
    }
}

/// Fields shared between the audio thread and any caller polling state,
/// guarded by a spin mutex per spec — these are touched every cycle and
/// a blocking mutex would be the wrong tool on the real-time thread.
#[derive(Default)]
struct SharedState {
    status_raw: Option<EngineStatus>,
    o2h_latency: LatencyCounters,
    h2o_latency: LatencyCounters,
}

/// Per-transfer scratch state. Held behind its own mutex (rather than as
/// plain fields) so `run_cycle` can take `&self`: the engine is shared as
/// an `Arc<Engine>` with the resampler, but only ever driven by the one
/// USB IN thread at a time.
struct TransferBufs {
    o2h: Vec<f32>,
    h2o: Vec<f32>,
    out_counter: u16,
}

/// Owns the two USB interrupt endpoints (conceptually — the actual USB
/// handle lives behind [`crate::usb::UsbDevice`]), encodes/decodes
/// wire blocks, and drives the device side of the DLL on every completed
/// IN transfer.
pub struct Engine {
    device: &'static DeviceDesc,
    blocks_per_transfer: usize,
    shared: Mutex<SharedState>,
    device_dll: Arc<Mutex<DeviceDll>>,
    bufs: Mutex<TransferBufs>,
}

impl Engine {
    pub fn new(device: &'static DeviceDesc, blocks_per_transfer: usize) -> Self {
        let o2h_frames = protocol::FRAMES_PER_BLOCK * blocks_per_transfer * device.outputs();
        let h2o_frames = protocol::FRAMES_PER_BLOCK * blocks_per_transfer * device.inputs();
        Engine {
            device,
            blocks_per_transfer,
            shared: Mutex::new(SharedState { status_raw: Some(EngineStatus::Stop), ..Default::default() }),
            device_dll: Arc::new(Mutex::new(DeviceDll::new())),
            bufs: Mutex::new(TransferBufs { o2h: vec![0.0; o2h_frames], h2o: vec![0.0; h2o_frames], out_counter: 0 }),
        }
    }

    pub fn device(&self) -> &'static DeviceDesc {
        self.device
    }

    /// Frames contributed by one USB transfer (`7 * blocks_per_transfer`),
    /// the quantity the DLL is updated with on every completed IN transfer.
    pub fn frames_per_transfer(&self) -> u32 {
        (protocol::FRAMES_PER_BLOCK * self.blocks_per_transfer) as u32
    }

    pub fn device_dll(&self) -> Arc<Mutex<DeviceDll>> {
        self.device_dll.clone()
    }

    pub fn status(&self) -> EngineStatus {
        self.shared.lock().status_raw.unwrap_or(EngineStatus::Error)
    }

    pub fn set_status(&self, status: EngineStatus) {
        self.shared.lock().status_raw = Some(status);
    }

    pub fn o2h_latency(&self) -> LatencyCounters {
        self.shared.lock().o2h_latency
    }

    pub fn h2o_latency(&self) -> LatencyCounters {
        self.shared.lock().h2o_latency
    }

    pub fn reset_latencies_max_to_min(&self) {
        let mut shared = self.shared.lock();
        shared.o2h_latency.reset_max_to_min();
        shared.h2o_latency.reset_max_to_min();
    }

    /// Zeroes the per-cycle latency trackers. Called on every Boot/Clear
    /// re-entry of the audio loop, matching `run_audio`'s loop preamble.
    fn reset_cycle_latencies(&self) {
        let mut shared = self.shared.lock();
        shared.o2h_latency.reset();
        shared.h2o_latency.reset();
    }

    /// Bootstraps the device-side DLL for a fresh run, matching
    /// `run_audio`'s call to `ow_dll_overbridge_init` before the first
    /// transfer is ever submitted.
    pub fn init_device_dll(&self, device_samplerate: f64) {
        let frames_per_transfer = (protocol::FRAMES_PER_BLOCK * self.blocks_per_transfer) as u32;
        self.device_dll.lock().init(device_samplerate, frames_per_transfer);
    }

    /// One IN + one OUT exchange: decodes the just-received device audio,
    /// drives the device DLL, pushes o2h audio into the ring (once
    /// running), pulls h2o audio from the ring and encodes it for the
    /// next OUT transfer. `now_usec` is the host adapter's monotonic
    /// clock at IN-completion time.
    ///
    /// Returns the bytes to submit as the next OUT transfer.
    pub fn run_cycle(&self, context: &mut Context, in_bytes: &[u8], now_usec: u64) -> Vec<u8> {
        self.device_dll.lock().update((protocol::FRAMES_PER_BLOCK * self.blocks_per_transfer) as u32, now_usec);

        let mut bufs = self.bufs.lock();

        let headers_ok = protocol::decode_transfer(in_bytes, self.device.output_tracks, self.blocks_per_transfer, &mut bufs.o2h);
        if !headers_ok {
            warn!(device = self.device.name, "o2h: unexpected block header, dropping cycle's data integrity guarantee");
        }

        let status = self.status();
        if status >= EngineStatus::Run {
            if let Some(producer) = context.o2h_producer.as_mut() {
                let bytes = bytemuck_f32_to_bytes(&bufs.o2h);
                let space = producer.write_space();
                if bytes.len() <= space {
                    producer.write(&bytes);
                } else {
                    warn!(device = self.device.name, "o2h: audio ring buffer overflow, discarding data");
                }
            }
            let o2h_read_space = context.o2h_producer.as_ref().map(|p| p.capacity().saturating_sub(p.write_space())).unwrap_or(0);
            self.shared.lock().o2h_latency.observe(o2h_read_space);
        }

        let transfer_frames = protocol::FRAMES_PER_BLOCK * self.blocks_per_transfer;
        let channels = self.device.inputs();
        let frame_bytes = channels * RING_SAMPLE_BYTES;
        let transfer_bytes = transfer_frames * frame_bytes;
        if let Some(consumer) = context.h2o_consumer.as_mut() {
            let available = consumer.read_space();
            if available >= transfer_bytes {
                let mut raw = vec![0u8; transfer_bytes];
                consumer.read(Some(&mut raw), transfer_bytes);
                bytemuck_bytes_to_f32(&raw, &mut bufs.h2o);
            } else if available >= frame_bytes {
                // Partial underflow: stretch what we have up to a full
                // transfer with a one-shot, coarse-quality resample rather
                // than blocking or dropping the whole cycle.
                let avail_frames = available / frame_bytes;
                let avail_bytes = avail_frames * frame_bytes;
                let mut raw = vec![0u8; avail_bytes];
                consumer.read(Some(&mut raw), avail_bytes);
                let mut avail_f32 = vec![0.0f32; avail_frames * channels];
                bytemuck_bytes_to_f32(&raw, &mut avail_f32);
                let stretched = resample_underflow_to_frames(self.device.input_tracks, &avail_f32, avail_frames, transfer_frames);
                bufs.h2o[..transfer_frames * channels].copy_from_slice(&stretched);
                warn!(device = self.device.name, avail_frames, transfer_frames, "h2o underflow, stretched with one-shot resample");
            } else {
                bufs.h2o[..transfer_frames * channels].fill(0.0);
            }
            self.shared.lock().h2o_latency.observe(consumer.read_space());
        } else {
            bufs.h2o[..transfer_frames * channels].fill(0.0);
        }

        let frame_bytes = protocol::frame_bytes(self.device.input_tracks);
        let mut out = vec![0u8; protocol::transfer_bytes(self.blocks_per_transfer, frame_bytes)];
        let mut counter = bufs.out_counter;
        protocol::encode_transfer(&mut out, self.device.input_tracks, self.blocks_per_transfer, &mut counter, &bufs.h2o);
        bufs.out_counter = counter;

        out
    }

    /// The Boot → Wait → Clear/Run handshake that wraps each pass of the
    /// audio thread's outer loop. `has_dll` mirrors `engine->context->dll`
    /// being non-null in the original — a standalone, resampler-less
    /// engine always runs free-running instead.
    pub fn advance_loop_entry(&self, has_dll: bool) {
        self.reset_cycle_latencies();
        let mut shared = self.shared.lock();
        let status = shared.status_raw.unwrap_or(EngineStatus::Error);
        if status == EngineStatus::Clear {
            shared.status_raw = Some(EngineStatus::Run);
            return;
        }
        if has_dll {
            if status == EngineStatus::Boot {
                shared.status_raw = Some(EngineStatus::Wait);
                info!(device = self.device.name, "engine waiting for resampler boot");
            }
        } else if status == EngineStatus::Boot {
            shared.status_raw = Some(EngineStatus::Run);
        }
    }
}

/// One-shot, coarse-quality sinc resample of `avail_frames` frames of
/// `data` (frame-major, one sample per track) up to exactly `out_frames`
/// frames. Used only on the h2o underflow path, where a fresh converter
/// per call is acceptable because the condition is rare and brief.
fn resample_underflow_to_frames(tracks: &[TrackDesc], data: &[f32], avail_frames: usize, out_frames: usize) -> Vec<f32> {
    use rubato::{Resampler as _, SincFixedOut, SincInterpolationParameters, SincInterpolationType, WindowFunction};

    let channels = tracks.len();
    if avail_frames == 0 || out_frames == 0 {
        return vec![0.0; out_frames * channels];
    }

    let params = SincInterpolationParameters {
        sinc_len: 16,
        f_cutoff: 0.9,
        oversampling_factor: 8,
        interpolation: SincInterpolationType::Nearest,
        window: WindowFunction::Blackman,
    };
    let ratio = out_frames as f64 / avail_frames as f64;
    let mut resampler = match SincFixedOut::<f32>::new(ratio, 8.0, params, out_frames, channels) {
        Ok(r) => r,
        Err(_) => return vec![0.0; out_frames * channels],
    };

    let mut planar_in: Vec<Vec<f32>> = vec![Vec::with_capacity(avail_frames); channels];
    for f in 0..avail_frames {
        for (ch, plane) in planar_in.iter_mut().enumerate() {
            plane.push(data[f * channels + ch]);
        }
    }
    let needed = resampler.input_frames_next();
    for plane in &mut planar_in {
        let pad = plane.last().copied().unwrap_or(0.0);
        plane.resize(needed, pad);
    }

    let mut planar_out = resampler.output_buffer_allocate(true);
    let (_, produced) = resampler.process_into_buffer(&planar_in, &mut planar_out, None).unwrap_or((0, 0));

    let mut out = vec![0.0f32; out_frames * channels];
    let produced = produced.min(out_frames);
    for f in 0..produced {
        for ch in 0..channels {
            out[f * channels + ch] = planar_out[ch][f];
        }
    }
    out
}

fn bytemuck_f32_to_bytes(src: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() * 4);
    for v in src {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn bytemuck_bytes_to_f32(src: &[u8], dst: &mut [f32]) {
    for (chunk, out) in src.chunks_exact(4).zip(dst.iter_mut()) {
        *out = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device;

    #[test]
    fn status_ordering_matches_original_integer_codes() {
        assert!(EngineStatus::Error < EngineStatus::Stop);
        assert!(EngineStatus::Stop < EngineStatus::Ready);
        assert!(EngineStatus::Ready < EngineStatus::Steady);
        assert!(EngineStatus::Steady < EngineStatus::Boot);
        assert!(EngineStatus::Boot < EngineStatus::Wait);
        assert!(EngineStatus::Wait < EngineStatus::Clear);
        assert!(EngineStatus::Clear < EngineStatus::Run);
    }

    #[test]
    fn new_engine_starts_stopped() {
        let desc = device::lookup(0x000c).unwrap();
        let engine = Engine::new(desc, 4);
        assert_eq!(engine.status(), EngineStatus::Stop);
    }

    #[test]
    fn clear_status_promotes_to_run_on_next_loop_entry() {
        let desc = device::lookup(0x000c).unwrap();
        let engine = Engine::new(desc, 4);
        engine.set_status(EngineStatus::Clear);
        engine.advance_loop_entry(true);
        assert_eq!(engine.status(), EngineStatus::Run);
    }

    #[test]
    fn boot_status_advances_to_wait_when_a_dll_is_present() {
        let desc = device::lookup(0x000c).unwrap();
        let engine = Engine::new(desc, 4);
        engine.set_status(EngineStatus::Boot);
        engine.advance_loop_entry(true);
        assert_eq!(engine.status(), EngineStatus::Wait);
    }

    #[test]
    fn without_a_dll_the_engine_runs_free_running() {
        let desc = device::lookup(0x000c).unwrap();
        let engine = Engine::new(desc, 4);
        engine.set_status(EngineStatus::Boot);
        engine.advance_loop_entry(false);
        assert_eq!(engine.status(), EngineStatus::Run);
    }

    #[test]
    fn loop_entry_never_stomps_error_or_stop_back_to_run() {
        let desc = device::lookup(0x000c).unwrap();

        let engine = Engine::new(desc, 4);
        engine.set_status(EngineStatus::Error);
        engine.advance_loop_entry(true);
        assert_eq!(engine.status(), EngineStatus::Error);
        engine.advance_loop_entry(false);
        assert_eq!(engine.status(), EngineStatus::Error);

        let engine = Engine::new(desc, 4);
        engine.set_status(EngineStatus::Stop);
        engine.advance_loop_entry(true);
        assert_eq!(engine.status(), EngineStatus::Stop);
        engine.advance_loop_entry(false);
        assert_eq!(engine.status(), EngineStatus::Stop);
    }

    #[test]
    fn latency_counters_track_running_extremes() {
        let mut counters = LatencyCounters::default();
        counters.observe(100);
        counters.observe(50);
        counters.observe(200);
        assert_eq!(counters.current, 200);
        assert_eq!(counters.min, 50);
        assert_eq!(counters.max, 200);
    }

    #[test]
    fn reset_max_to_min_drops_the_ceiling_once() {
        let mut counters = LatencyCounters::default();
        counters.observe(100);
        counters.observe(400);
        counters.reset_max_to_min();
        assert_eq!(counters.max, counters.min);
    }

    #[test]
    fn h2o_partial_underflow_stretches_instead_of_silencing() {
        let desc = device::lookup(0x000c).unwrap();
        let blocks_per_transfer = 4;
        let engine = Engine::new(desc, blocks_per_transfer);
        engine.set_status(EngineStatus::Run);

        let mut ctx = Context::default();
        let (mut h2o_producer, h2o_consumer) = bbx_core::SpscRingBuffer::new(1 << 16);
        ctx.h2o_consumer = Some(h2o_consumer);

        // Only enqueue 3 frames' worth, well under one full transfer.
        let partial_frames = 3;
        let samples = vec![0.5f32; partial_frames * desc.inputs()];
        let bytes = bytemuck_f32_to_bytes(&samples);
        h2o_producer.write(&bytes);

        let frame_bytes = protocol::frame_bytes(desc.output_tracks) * protocol::FRAMES_PER_BLOCK * blocks_per_transfer;
        let in_bytes = vec![0u8; frame_bytes];
        let out = engine.run_cycle(&mut ctx, &in_bytes, 0);

        assert!(!out.is_empty());
        for sample in &engine.bufs.lock().h2o {
            assert!(sample.is_finite());
        }
    }

    #[test]
    fn resample_underflow_to_frames_fills_the_requested_length() {
        let desc = device::lookup(0x000c).unwrap();
        let avail_frames = 3;
        let data = vec![0.25f32; avail_frames * desc.inputs()];
        let out = resample_underflow_to_frames(desc.input_tracks, &data, avail_frames, 28);
        assert_eq!(out.len(), 28 * desc.inputs());
        assert!(out.iter().all(|v| v.is_finite()));
    }
}
