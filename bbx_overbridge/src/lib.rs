//! Real-time USB audio synchronisation core for Elektron Overbridge
//! hardware.
//!
//! [`Overbridge`] is the facade a host audio adapter talks to: it wires
//! together the [`device`] catalog, the [`context::Context`] contract,
//! the [`engine::Engine`] (USB transfer scheduler and device-side DLL),
//! and the [`resampler::Resampler`] (host-side DLL and fractional rate
//! conversion), and spawns the dedicated real-time audio thread pair that
//! pumps USB transfers in the background.
//!
//! A host-side process callback drives the engine through three calls
//! per cycle, in order: [`Overbridge::compute_ratios`],
//! [`Overbridge::read_audio`], [`Overbridge::write_audio`].

pub mod config;
pub mod context;
pub mod device;
pub mod dll;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod resampler;
pub mod usb;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bbx_core::SpscRingBuffer;
use tracing::{info, warn};

pub use config::EngineConfig;
pub use context::{Context, GetTime, Options, RtThread, SetRtPriority};
pub use device::DeviceDesc;
pub use engine::{Engine, EngineStatus};
pub use error::{OwError, Result};
pub use resampler::{Resampler, ResamplerState, ResamplerStatus};
pub use usb::UsbDevice;

/// Ring buffer capacity, in bytes, for each direction. Generously sized
/// relative to any realistic `bufsize`/samplerate combination; actual
/// occupancy is governed by the DLL's target delay, not this ceiling.
const RING_CAPACITY_BYTES: usize = 1 << 20;

/// A running (or not-yet-started) Overbridge synchronisation core for one
/// device. Owns the engine, the resampler, and — once [`Overbridge::start`]
/// has been called with a real USB handle — the two dedicated transfer
/// threads that keep the device fed.
pub struct Overbridge {
    device: &'static DeviceDesc,
    config: EngineConfig,
    engine: Arc<Engine>,
    resampler: spin::Mutex<Resampler>,
    /// The engine-side ends of the two rings whose opposite ends were
    /// handed to the resampler in [`Overbridge::new`]; taken by
    /// [`Overbridge::start`] to build the [`Context`] the audio threads run.
    pending_o2h_producer: Option<bbx_core::Producer>,
    pending_h2o_consumer: Option<bbx_core::Consumer>,
    threads: Option<RunningThreads>,
}

struct RunningThreads {
    stop: Arc<AtomicBool>,
    in_thread: Option<JoinHandle<()>>,
    out_thread: Option<JoinHandle<()>>,
}

impl Overbridge {
    /// Builds the rings, the engine, and the resampler for `device`, but
    /// does not touch any hardware or spawn any thread yet — that is
    /// [`Overbridge::start`]'s job. `config` is validated up front so a
    /// caller never pays for ring/converter allocation on a doomed setup.
    pub fn new(
        device: &'static DeviceDesc,
        config: EngineConfig,
        samplerate: f64,
        bufsize: usize,
        report_period_seconds: u32,
    ) -> Result<Self> {
        config.validate()?;

        let engine = Arc::new(Engine::new(device, config.blocks_per_transfer as usize));

        let (o2h_producer, o2h_consumer) = SpscRingBuffer::new(RING_CAPACITY_BYTES);
        let (h2o_producer, h2o_consumer) = SpscRingBuffer::new(RING_CAPACITY_BYTES);

        let resampler = Resampler::new(
            device,
            engine.clone(),
            samplerate,
            bufsize,
            config.resampler_quality,
            report_period_seconds,
            Some(o2h_consumer),
            Some(h2o_producer),
        )?;

        Ok(Overbridge {
            device,
            config,
            engine,
            resampler: spin::Mutex::new(resampler),
            pending_o2h_producer: Some(o2h_producer),
            pending_h2o_consumer: Some(h2o_consumer),
            threads: None,
        })
    }

    pub fn device(&self) -> &'static DeviceDesc {
        self.device
    }

    pub fn samplerate(&self) -> f64 {
        self.resampler.lock().samplerate()
    }

    pub fn bufsize(&self) -> usize {
        self.resampler.lock().bufsize()
    }

    pub fn o2h_frame_size(&self) -> usize {
        self.device.outputs()
    }

    pub fn h2o_frame_size(&self) -> usize {
        self.device.inputs()
    }

    pub fn target_delay_frames(&self) -> f64 {
        self.resampler.lock().state().target_delay_frames
    }

    pub fn state(&self) -> ResamplerState {
        self.resampler.lock().state()
    }

    pub fn status(&self) -> EngineStatus {
        self.engine.status()
    }

    /// Claims `usb`, assembles the host context, and spawns the two
    /// dedicated audio threads: one blocking on IN transfers and driving
    /// [`Engine::run_cycle`], one blocking on OUT transfers with the
    /// bytes the cycle produced. `get_time`/`set_rt_priority` are the
    /// host adapter's monotonic clock and optional priority hook.
    pub fn start(&mut self, usb: UsbDevice, options: Options, get_time: GetTime, set_rt_priority: Option<SetRtPriority>) -> Result<()> {
        if self.threads.is_some() {
            return Err(OwError::Generic);
        }

        let mut context = Context::default();
        context.options = options;
        context.get_time = Some(get_time.clone());
        context.set_rt_priority = set_rt_priority.clone();
        context.dll = Some(self.engine.device_dll());
        if options.o2h_audio {
            context.o2h_producer = self.pending_o2h_producer.take();
        }
        if options.h2o_audio {
            context.h2o_consumer = self.pending_h2o_consumer.take();
        }
        context.validate()?;

        self.engine.init_device_dll(48_000.0);
        self.engine.set_status(EngineStatus::Ready);

        let timeout = if self.config.usb_xfr_timeout_ms == 0 {
            Duration::from_secs(0)
        } else {
            Duration::from_millis(self.config.usb_xfr_timeout_ms as u64)
        };

        let stop = Arc::new(AtomicBool::new(false));
        let usb = Arc::new(usb);

        let (out_tx, out_rx) = std::sync::mpsc::channel::<Vec<u8>>();

        let out_usb = usb.clone();
        let out_stop = stop.clone();
        let out_engine = self.engine.clone();
        let out_thread = std::thread::Builder::new()
            .name("overbridge-out".into())
            .spawn(move || {
                if let Some(hook) = set_rt_priority.as_ref() {
                    hook(RtThread::Audio, 90);
                }
                while !out_stop.load(Ordering::Relaxed) {
                    // Error/Stop are the only states below Ready; every
                    // other status (Ready..=Run) is a legitimate in-flight
                    // startup or steady-state phase the thread must keep
                    // pumping through. Per spec §4.2/§7 a fatal submission
                    // failure or an explicit stop must end the thread on
                    // its own rather than retrying against a dead device.
                    if out_engine.status() < EngineStatus::Ready {
                        break;
                    }
                    match out_rx.recv_timeout(Duration::from_millis(100)) {
                        Ok(bytes) => {
                            if let Err(e) = out_usb.write_out(&bytes, timeout) {
                                warn!(device = out_engine.device().name, error = %e, "OUT transfer failed");
                                out_engine.set_status(EngineStatus::Error);
                                break;
                            }
                        }
                        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("failed to spawn overbridge-out thread");

        let in_usb = usb.clone();
        let in_stop = stop.clone();
        let in_engine = self.engine.clone();
        let frame_bytes_in = self.device.o2h_frame_bytes();
        let transfer_bytes_in = protocol::transfer_bytes(self.config.blocks_per_transfer as usize, frame_bytes_in);
        let has_dll = options.o2h_audio || options.h2o_audio;
        let in_thread = std::thread::Builder::new()
            .name("overbridge-in".into())
            .spawn(move || {
                let mut context = context;
                let mut in_buf = vec![0u8; transfer_bytes_in];
                loop {
                    if in_stop.load(Ordering::Relaxed) {
                        break;
                    }
                    // See the out-thread's matching check: Error/Stop are
                    // the only statuses below Ready, and are the only ones
                    // that should end the thread unprompted.
                    if in_engine.status() < EngineStatus::Ready {
                        break;
                    }
                    in_engine.advance_loop_entry(has_dll);
                    match in_usb.read_in(&mut in_buf, timeout) {
                        Ok(n) if n == in_buf.len() => {
                            let now = (get_time)();
                            let out_bytes = in_engine.run_cycle(&mut context, &in_buf, now);
                            if out_tx.send(out_bytes).is_err() {
                                break;
                            }
                        }
                        Ok(_) => {
                            warn!(device = in_engine.device().name, "short IN transfer, skipping cycle");
                        }
                        Err(e) => {
                            warn!(device = in_engine.device().name, error = %e, "IN transfer failed");
                            in_engine.set_status(EngineStatus::Error);
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn overbridge-in thread");

        self.threads = Some(RunningThreads { stop, in_thread: Some(in_thread), out_thread: Some(out_thread) });
        info!(device = self.device.name, "overbridge started");
        Ok(())
    }

    /// Per-cycle entry point 1 of 3, proxied to the resampler: re-derives
    /// the ratio from the DLL and drives the startup state machine.
    pub fn compute_ratios(&self, now_usec: u64) -> Result<()> {
        let device = self.device;
        self.resampler.lock().compute_ratios(now_usec, || {
            info!(device = device.name, "audio now flowing end-to-end");
        })
    }

    /// Per-cycle entry point 2 of 3, proxied to the resampler.
    pub fn read_audio(&self, output: &mut [&mut [f32]]) {
        self.resampler.lock().read_audio(output);
    }

    /// Per-cycle entry point 3 of 3, proxied to the resampler.
    pub fn write_audio(&self, input: &[&[f32]]) {
        self.resampler.lock().write_audio(input);
    }

    /// Applies a new buffer size. Only valid while stopped
    /// ([`ResamplerStatus::Ready`]); while running, use
    /// [`Overbridge::request_reset`] instead.
    pub fn set_buffer_size(&self, bufsize: usize) -> Result<()> {
        self.resampler.lock().set_buffer_size(bufsize)
    }

    /// Forces a full reset and, if the engine was already running, drops
    /// it back to [`EngineStatus::Boot`] so the startup sequence replays.
    pub fn request_reset(&self) {
        self.resampler.lock().request_reset();
    }

    /// Signals both audio threads to stop and waits for them to exit.
    /// Idempotent: calling it twice, or before [`Overbridge::start`], is
    /// a no-op.
    pub fn stop(&mut self) {
        self.engine.set_status(EngineStatus::Stop);
        if let Some(mut threads) = self.threads.take() {
            threads.stop.store(true, Ordering::Relaxed);
            if let Some(h) = threads.in_thread.take() {
                let _ = h.join();
            }
            if let Some(h) = threads.out_thread.take() {
                let _ = h.join();
            }
        }
    }

    /// Blocks until both audio threads have exited, without signalling
    /// them to stop. Used by a caller that has arranged for the engine to
    /// reach [`EngineStatus::Error`]/[`EngineStatus::Stop`] on its own
    /// (e.g. device unplug) and just wants to observe the shutdown.
    pub fn wait(&mut self) {
        if let Some(threads) = self.threads.as_mut() {
            if let Some(h) = threads.in_thread.take() {
                let _ = h.join();
            }
            if let Some(h) = threads.out_thread.take() {
                let _ = h.join();
            }
        }
    }
}

impl Drop for Overbridge {
    fn drop(&mut self) {
        self.stop();
    }
}
