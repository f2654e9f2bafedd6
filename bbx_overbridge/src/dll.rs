//! Delay-locked loop: the phase-locked loop that keeps a continuously
//! updated device-rate/host-rate ratio and a target delay at the host
//! boundary.
//!
//! Two independent sub-models make up the loop: [`DeviceDll`], updated
//! from the USB IN completion handler every transfer, and [`HostDll`],
//! updated once per host process cycle. The two only ever meet through
//! [`HostDll::load_device_snapshot`], which copies the device side's two
//! timestamped instants under the engine's spin mutex (see
//! [`crate::engine`]) — there is no other shared state between them.

use std::f64::consts::PI;

/// Below this many seconds of drift, a raw time delta is assumed to be a
/// same-cycle measurement rather than a wrap of the 28-bit microsecond
/// clock; beyond it, `wrap` folds in a full quantum. Matches the original
/// `MODTIME_THRESHOLD`; comfortably smaller than the ~268 s period the
/// 28-bit clock can represent, so normal scheduling jitter never
/// triggers a spurious wrap. Do not widen without re-deriving the
/// bandwidth constants this loop filter assumes.
const MODTIME_THRESHOLD: f64 = 200.0;

/// `2^28` microseconds expressed in seconds — the wraparound period of
/// the low-28-bit monotonic clock both DLL sides run on.
pub const T_QUANTUM: f64 = (1u64 << 28) as f64 * 1.0e-6;

const TIME_MASK: u64 = 0x0FFF_FFFF;

/// Reduces a microsecond monotonic timestamp to the low 28 bits and
/// converts to seconds, matching the host adapter's `get_time()` contract.
fn usec_to_sec(t_usec: u64) -> f64 {
    (t_usec & TIME_MASK) as i64 as f64 * 1.0e-6
}

fn wrap(d: f64, q: f64) -> f64 {
    let mut d = d;
    if d < -MODTIME_THRESHOLD {
        d += q;
    }
    if d > MODTIME_THRESHOLD {
        d -= q;
    }
    d
}

/// A timestamped frame count: one sample of "at host/device time `time`,
/// the device had produced `frames` frames since start".
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Instant {
    pub time: f64,
    pub frames: u32,
}

/// Device-side half of the DLL: tracks the device's own clock against
/// arrival time of completed USB IN transfers, producing a smoothed
/// `(i0, i1)` bracket the host side later interpolates against.
#[derive(Debug, Clone, Copy)]
pub struct DeviceDll {
    i0: Instant,
    i1: Instant,
    dt: f64,
    w1: f64,
    w2: f64,
    boot: bool,
}

impl Default for DeviceDll {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceDll {
    pub fn new() -> Self {
        DeviceDll { i0: Instant::default(), i1: Instant::default(), dt: 0.0, w1: 0.0, w2: 0.0, boot: true }
    }

    /// Resets the loop filter coefficients for a nominal frame period of
    /// `frames_per_transfer / samplerate` seconds and marks the next
    /// `update` call as the bootstrap sample.
    pub fn init(&mut self, samplerate: f64, frames_per_transfer: u32) {
        self.dt = frames_per_transfer as f64 / samplerate;
        let w = 2.0 * PI * 0.1 * self.dt;
        self.w1 = 1.6 * w;
        self.w2 = w * w;
        self.boot = true;
    }

    /// Called from the USB IN completion handler with the number of
    /// frames just received and the current monotonic microsecond time.
    pub fn update(&mut self, frames: u32, t_usec: u64) {
        let time = usec_to_sec(t_usec);

        if self.boot {
            self.i0.time = time;
            self.i1.time = self.i0.time + self.dt;
            self.i0.frames = 0;
            self.i1.frames = frames;
            self.boot = false;
        }

        let mut err = time - self.i1.time;
        if err < -MODTIME_THRESHOLD {
            self.i1.time -= T_QUANTUM;
            err = time - self.i1.time;
        }

        self.i0.time = self.i1.time;
        self.i1.time += self.w1 * err + self.dt;
        self.dt += self.w2 * err;

        self.i0.frames = self.i1.frames;
        self.i1.frames = self.i1.frames.wrapping_add(frames);
    }

    /// Snapshot of the two timestamped instants, taken under the engine's
    /// spin mutex and handed to [`HostDll::load_device_snapshot`].
    pub fn snapshot(&self) -> (Instant, Instant) {
        (self.i0, self.i1)
    }
}

/// Host-side half of the DLL: a three-pole loop filter that turns the
/// device-side snapshot plus host wall-clock time into a resampling
/// ratio and a target-delay error term.
#[derive(Debug, Clone, Copy)]
pub struct HostDll {
    ratio: f64,
    frames: u32,
    w0: f64,
    w1: f64,
    w2: f64,
    target_delay: f64,
    z1: f64,
    z2: f64,
    z3: f64,
    err: f64,
    i0: Instant,
    i1: Instant,
    boot: bool,
}

impl Default for HostDll {
    fn default() -> Self {
        let mut dll = HostDll {
            ratio: 1.0,
            frames: 0,
            w0: 0.0,
            w1: 0.0,
            w2: 0.0,
            target_delay: 0.0,
            z1: 0.0,
            z2: 0.0,
            z3: 0.0,
            err: 0.0,
            i0: Instant::default(),
            i1: Instant::default(),
            boot: true,
        };
        dll.init();
        dll
    }
}

impl HostDll {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the host side as not-yet-bootstrapped. Called once when a
    /// resampler is created and again by [`crate::resampler::Resampler::reset`].
    pub fn init(&mut self) {
        self.boot = true;
    }

    /// Recomputes `ratio` and `target_delay` for a new sample-rate pair
    /// and buffer sizes; clears the loop filter's integrator state.
    pub fn reset(&mut self, output_samplerate: f64, input_samplerate: f64, output_frames: u32, input_frames: u32) {
        self.z1 = 0.0;
        self.z2 = 0.0;
        self.z3 = 0.0;

        self.ratio = output_samplerate / input_samplerate;
        self.frames = (-(output_frames as f64) / self.ratio) as i64 as u32;
        self.target_delay = 2.0 * output_frames as f64 + 1.5 * input_frames as f64;
    }

    /// Recomputes the three loop-filter coefficients for a loop bandwidth
    /// `bw` (Hz); called on every Boot → Tune → Run transition with a
    /// progressively narrower bandwidth.
    pub fn set_loop_filter(&mut self, bw: f64, output_frames: u32, output_samplerate: f64) {
        let w = 2.0 * PI * 20.0 * bw * output_frames as f64 / output_samplerate;
        self.w0 = 1.0 - (-w).exp();
        let w = 2.0 * PI * bw * self.ratio / output_samplerate;
        self.w1 = w * 1.6;
        self.w2 = w * output_frames as f64 / 1.6;
    }

    /// Copies the device side's `(i0, i1)` bracket into the host side.
    /// Must be called with the engine's spin mutex held, since the
    /// device side is written concurrently from the USB IN callback.
    pub fn load_device_snapshot(&mut self, device: &DeviceDll) {
        let (i0, i1) = device.snapshot();
        self.i0 = i0;
        self.i1 = i1;
    }

    /// Updates `err` from the current `(i0, i1)` bracket and host time.
    /// On the bootstrap call, folds the whole error into `frames` instead
    /// of the loop filter so the first ratio isn't computed from a huge
    /// initial transient.
    pub fn update_error(&mut self, t_usec: u64) {
        let time = usec_to_sec(t_usec);

        let delta_frames_exp = self.i1.frames.wrapping_sub(self.i0.frames) as i32 as f64;
        let dn = wrap(time - self.i0.time, T_QUANTUM);
        let dd = wrap(self.i1.time - self.i0.time, T_QUANTUM);
        let delta_overbridge = delta_frames_exp * dn / dd;
        let delta_frames_act = self.i0.frames.wrapping_sub(self.frames) as i32 as f64;
        self.err = delta_frames_act + delta_overbridge - self.target_delay;

        if self.boot {
            let n = (self.err + 0.5).floor() as i32;
            self.frames = self.frames.wrapping_add(n as u32);
            self.err -= n as f64;
            self.boot = false;
        }
    }

    /// Advances the three-pole loop filter one step and republishes
    /// `ratio`. Must follow an [`HostDll::update_error`] call in the same
    /// process cycle.
    pub fn update(&mut self) {
        self.z1 += self.w0 * (self.w1 * self.err - self.z1);
        self.z2 += self.w0 * (self.z1 - self.z2);
        self.z3 += self.w2 * self.z2;
        self.ratio = 1.0 - self.z2 - self.z3;
    }

    /// `true` once `|err|` has settled under `threshold·host_bufsize`.
    /// The caller passes a looser `threshold` during Boot and a tighter
    /// one during Tune (see [`crate::resampler`]).
    pub fn tuned(&self, threshold: f64, host_bufsize: u32) -> bool {
        self.err.abs() < threshold * host_bufsize as f64
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn err(&self) -> f64 {
        self.err
    }

    pub fn target_delay(&self) -> f64 {
        self.target_delay
    }

    /// Accumulated host-observed device frame count. The resampler's o2h
    /// reader advances this by the number of frames it actually consumed
    /// from the ring each cycle.
    pub fn frames(&self) -> u32 {
        self.frames
    }

    pub fn add_frames(&mut self, frames: i64) {
        self.frames = self.frames.wrapping_add(frames as i32 as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_folds_in_a_quantum_past_the_threshold() {
        assert_eq!(wrap(0.0, T_QUANTUM), 0.0);
        assert_eq!(wrap(-300.0, T_QUANTUM), -300.0 + T_QUANTUM);
        assert_eq!(wrap(300.0, T_QUANTUM), 300.0 - T_QUANTUM);
        assert_eq!(wrap(100.0, T_QUANTUM), 100.0);
    }

    #[test]
    fn device_dll_bootstraps_on_first_update() {
        let mut dll = DeviceDll::new();
        dll.init(48000.0, 7 * 24);
        dll.update(7 * 24, 1_000_000);
        let (i0, i1) = dll.snapshot();
        assert_eq!(i0.frames, 0);
        assert_eq!(i1.frames, 7 * 24);
        assert!(i1.time > i0.time);
    }

    #[test]
    fn device_dll_accumulates_frames_across_updates() {
        let mut dll = DeviceDll::new();
        dll.init(48000.0, 168);
        dll.update(168, 1_000_000);
        dll.update(168, 1_003_500);
        let (_, i1) = dll.snapshot();
        assert_eq!(i1.frames, 336);
    }

    #[test]
    fn host_dll_reset_sets_ratio_and_target_delay_per_formula() {
        let mut dll = HostDll::new();
        dll.reset(48000.0, 48000.0, 64, 168);
        assert!((dll.ratio() - 1.0).abs() < 1e-12);
        // target_delay = 2 * output_frames + 1.5 * input_frames = 2*64 + 1.5*168 = 380
        assert!((dll.target_delay() - 380.0).abs() < 1e-9);
    }

    #[test]
    fn host_dll_reset_is_idempotent() {
        let mut dll = HostDll::new();
        dll.reset(48000.0, 48000.0, 64, 168);
        let after_first = (dll.ratio(), dll.target_delay(), dll.frames());
        dll.reset(48000.0, 48000.0, 64, 168);
        let after_second = (dll.ratio(), dll.target_delay(), dll.frames());
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn stationary_clock_converges_ratio_to_one() {
        let mut device = DeviceDll::new();
        let frames_per_transfer = 168u32;
        device.init(48000.0, frames_per_transfer);

        let mut host = HostDll::new();
        host.reset(48000.0, 48000.0, 64, frames_per_transfer);
        host.set_loop_filter(1.0, 64, 48000.0);

        let mut t = 0u64;
        let period_us = (frames_per_transfer as f64 / 48000.0 * 1.0e6) as u64;
        for _ in 0..2000 {
            t += period_us;
            device.update(frames_per_transfer, t);
            host.load_device_snapshot(&device);
            host.update_error(t);
            host.update();
            host.add_frames(frames_per_transfer as i64);
        }

        assert!(host.tuned(1e-3, 64), "err = {}", host.err());
        assert!((host.ratio() - 1.0).abs() < 1e-4, "ratio = {}", host.ratio());
    }
}
