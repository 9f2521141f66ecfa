//! Spectral Subtraction Noise Canceller
//!
//! # Perceptual Contract
//! - **Target Source**: Speech over stationary background noise (fans, HVAC,
//!   road rumble).
//! - **Intended Effect**: Lower the stationary noise bed while keeping speech
//!   harmonics intact.
//! - **Failure Modes**:
//!   - "Musical noise" (isolated tonal blips) at high strength with low
//!     smoothing and low artifact suppression.
//!   - Slow recovery when the noise bed drops suddenly and release is long.
//! - **Will Not Do**:
//!   - Suppress non-stationary noise (door slams, keyboard clicks).
//!
//! # Lifecycle
//! - **Unallocated**: before `allocate()` and after `release()`. Audio passes
//!   through untouched.
//! - **Active**: STFT analysis/synthesis, one shared detector, per-channel
//!   synthesis.
//! - **Bypassed**: `apply()` returns before touching any transform state.
//!
//! # Transform
//! sqrt-Hann analysis and synthesis windows, FFT size and hop from
//! `ChainConfig` (512 / 128 by default, 75 % overlap). Overlap-add output is
//! normalised by the accumulated squared window, so unity gains reconstruct
//! the input exactly, delayed by one FFT frame.
//!
//! # Noise Floor Tracking
//! Per-bin magnitude follower updated once per hop:
//! - bins within `SPEECH_MARGIN` of the floor rise with `noise_attack_ms`
//! - bins further above (speech-like) rise with `SPEECH_RISE_MS`
//! - bins below the floor fall with `noise_release_ms`

use ringbuf::{Consumer, Producer, RingBuffer};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

use crate::dsp::utils::{
    db_to_lin, lerp, make_sqrt_hann_window, power_to_db, time_constant_coeff, MAG_FLOOR,
};
use crate::params::NoiseCancellerParams;

// Constants: unless marked "Must not change", these are tunable for behavior.
// Ring capacity as a multiple of the FFT size.
// Must not go below 2: the output ring holds one frame of latency plus a hop.
const RINGBUF_CAP_MULT: usize = 2;
// Guard for the overlap-add normaliser.
const OLA_NORM_EPS: f32 = 1e-3;
// Linear ratio above the floor treated as speech (2.0 = +6 dB).
// Increasing: floor follows louder content; decreasing: floor protects more bins.
const SPEECH_MARGIN: f32 = 2.0;
// Rise time (ms) for bins well above the floor.
// Increasing: speech leaks less into the floor; decreasing: faster adaptation to new noise.
const SPEECH_RISE_MS: f32 = 4000.0;
/// Reported floor before the first frame has been analysed.
pub const NOISE_FLOOR_IDLE_DB: f32 = -60.0;

/// Per-channel streaming STFT (WOLA) state.
struct ChannelStream {
    input_producer: Producer<f32>,
    input_consumer: Consumer<f32>,
    output_producer: Producer<f32>,
    output_consumer: Consumer<f32>,

    scratch: Vec<Complex<f32>>,
    overlap: Vec<f32>,
    ola_norm: Vec<f32>,
}

impl ChannelStream {
    fn new(win: usize) -> Self {
        let cap = win * RINGBUF_CAP_MULT;
        let (in_prod, in_cons) = RingBuffer::<f32>::new(cap).split();
        let (out_prod, out_cons) = RingBuffer::<f32>::new(cap).split();

        let mut stream = Self {
            input_producer: in_prod,
            input_consumer: in_cons,
            output_producer: out_prod,
            output_consumer: out_cons,
            scratch: vec![Complex::new(0.0, 0.0); win],
            overlap: vec![0.0; win],
            ola_norm: vec![0.0; win],
        };
        stream.prime(win);
        stream
    }

    // One frame of zeros in the output ring sets the latency
    fn prime(&mut self, win: usize) {
        for _ in 0..win {
            let _ = self.output_producer.push(0.0);
        }
    }

    fn reset(&mut self, win: usize) {
        while self.input_consumer.pop().is_some() {}
        while self.output_consumer.pop().is_some() {}
        self.prime(win);
        self.overlap.fill(0.0);
        self.ola_norm.fill(0.0);
    }

    fn memory_bytes(&self, win: usize) -> usize {
        let rings = 2 * win * RINGBUF_CAP_MULT * std::mem::size_of::<f32>();
        let buffers = self.scratch.len() * std::mem::size_of::<Complex<f32>>()
            + (self.overlap.len() + self.ola_norm.len()) * std::mem::size_of::<f32>();
        rings + buffers
    }
}

/// Everything the transform needs; present only between allocate and release.
struct SpectralEngine {
    win: usize,
    hop: usize,

    window: Vec<f32>,
    window_energy: f32,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    fft_scratch: Vec<Complex<f32>>,
    ifft_scratch: Vec<Complex<f32>>,

    channels: Vec<ChannelStream>,

    // Shared detector
    mono: ChannelStream,
    mag: Vec<f32>,
    noise_floor: Vec<f32>,
    prev_gains: Vec<f32>,
    gains: Vec<f32>,
    floor_initialized: bool,
}

/// Per-frame settings derived from the parameters once per block.
#[derive(Clone, Copy)]
struct FrameSettings {
    strength: f32,
    gain_floor: f32,
    smoothing: f32,
    artifact_suppress: f32,
    attack_coeff: f32,
    release_coeff: f32,
    speech_coeff: f32,
}

impl SpectralEngine {
    fn new(win: usize, hop: usize, channels: usize) -> Self {
        let nyq = win / 2;
        let window = make_sqrt_hann_window(win);
        let window_energy = window.iter().map(|w| w * w).sum::<f32>().max(MAG_FLOOR);

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(win);
        let ifft = planner.plan_fft_inverse(win);
        let fft_scratch = vec![Complex::default(); fft.get_inplace_scratch_len()];
        let ifft_scratch = vec![Complex::default(); ifft.get_inplace_scratch_len()];

        Self {
            win,
            hop,
            window,
            window_energy,
            fft,
            ifft,
            fft_scratch,
            ifft_scratch,
            channels: (0..channels).map(|_| ChannelStream::new(win)).collect(),
            mono: ChannelStream::new(win),
            mag: vec![0.0; nyq + 1],
            noise_floor: vec![0.0; nyq + 1],
            prev_gains: vec![1.0; nyq + 1],
            gains: vec![1.0; nyq + 1],
            floor_initialized: false,
        }
    }

    fn reset(&mut self) {
        let win = self.win;
        for ch in self.channels.iter_mut() {
            ch.reset(win);
        }
        self.mono.reset(win);
        self.noise_floor.fill(0.0);
        self.prev_gains.fill(1.0);
        self.gains.fill(1.0);
        self.floor_initialized = false;
    }

    fn memory_bytes(&self) -> usize {
        let f = std::mem::size_of::<f32>();
        let c = std::mem::size_of::<Complex<f32>>();
        let streams: usize = self
            .channels
            .iter()
            .chain(std::iter::once(&self.mono))
            .map(|s| s.memory_bytes(self.win))
            .sum();
        streams
            + self.window.len() * f
            + (self.fft_scratch.len() + self.ifft_scratch.len()) * c
            + (self.mag.len()
                + self.noise_floor.len()
                + self.prev_gains.len()
                + self.gains.len())
                * f
    }

    fn forward(&mut self, which: Option<usize>) {
        let stream = match which {
            Some(ch) => &mut self.channels[ch],
            None => &mut self.mono,
        };
        for (i, v) in stream.input_consumer.iter().take(self.win).enumerate() {
            stream.scratch[i] = Complex::new(*v * self.window[i], 0.0);
        }

        #[cfg(debug_assertions)]
        assert_no_alloc::assert_no_alloc(|| {
            self.fft
                .process_with_scratch(&mut stream.scratch, &mut self.fft_scratch);
        });
        #[cfg(not(debug_assertions))]
        self.fft
            .process_with_scratch(&mut stream.scratch, &mut self.fft_scratch);
    }

    /// Analyse the mono proxy frame and leave the spectral gains in `self.gains`.
    fn analyze(&mut self, s: &FrameSettings) {
        self.forward(None);

        let nyq = self.win / 2;
        for k in 0..=nyq {
            self.mag[k] = self.mono.scratch[k].norm().max(MAG_FLOOR);
        }

        // 1) Noise floor
        if !self.floor_initialized {
            self.noise_floor.copy_from_slice(&self.mag);
            self.floor_initialized = true;
        } else {
            for k in 0..=nyq {
                let nf = self.noise_floor[k];
                let m = self.mag[k];
                let coeff = if m > nf {
                    if m < nf * SPEECH_MARGIN {
                        s.attack_coeff
                    } else {
                        s.speech_coeff
                    }
                } else {
                    s.release_coeff
                };
                self.noise_floor[k] = (coeff * nf + (1.0 - coeff) * m).max(MAG_FLOOR);
            }
        }

        // 2) Subtraction gains with temporal smoothing
        for k in 0..=nyq {
            let m = self.mag[k];
            let raw = ((m - s.strength * self.noise_floor[k]) / m).clamp(s.gain_floor, 1.0);
            let g = s.smoothing * self.prev_gains[k] + (1.0 - s.smoothing) * raw;
            self.prev_gains[k] = g;
        }

        // 3) Cross-bin smoothing against musical noise
        for k in 0..=nyq {
            let lo = self.prev_gains[k.saturating_sub(1)];
            let hi = self.prev_gains[(k + 1).min(nyq)];
            let mid = self.prev_gains[k];
            let avg = (lo + mid + hi) / 3.0;
            self.gains[k] = lerp(mid, avg, s.artifact_suppress).clamp(s.gain_floor, 1.0);
        }
    }

    /// Apply `self.gains` to one channel's current frame and emit a hop.
    fn synthesize(&mut self, ch: usize) {
        self.forward(Some(ch));

        let win = self.win;
        let hop = self.hop;
        let nyq = win / 2;
        let stream = &mut self.channels[ch];

        for k in 0..=nyq {
            stream.scratch[k] *= self.gains[k];
        }

        // Restore conjugate symmetry
        stream.scratch[0].im = 0.0;
        stream.scratch[nyq].im = 0.0;
        for k in 1..nyq {
            stream.scratch[win - k] = stream.scratch[k].conj();
        }

        #[cfg(debug_assertions)]
        assert_no_alloc::assert_no_alloc(|| {
            self.ifft
                .process_with_scratch(&mut stream.scratch, &mut self.ifft_scratch);
        });
        #[cfg(not(debug_assertions))]
        self.ifft
            .process_with_scratch(&mut stream.scratch, &mut self.ifft_scratch);

        // Overlap-add synthesis
        let norm = 1.0 / win as f32;
        for i in 0..win {
            let w = self.window[i];
            stream.overlap[i] += stream.scratch[i].re * norm * w;
            stream.ola_norm[i] += w * w;
        }

        for i in 0..hop {
            let denom = stream.ola_norm[i].max(OLA_NORM_EPS);
            let _ = stream.output_producer.push(stream.overlap[i] / denom);
        }

        stream.overlap.copy_within(hop..win, 0);
        stream.ola_norm.copy_within(hop..win, 0);
        stream.overlap[win - hop..].fill(0.0);
        stream.ola_norm[win - hop..].fill(0.0);
    }

    fn process(&mut self, block: &mut [f32], s: &FrameSettings) {
        let channels = self.channels.len();
        for frame in block.chunks_exact_mut(channels) {
            // Largest-magnitude sample drives the shared detector
            let mut proxy = 0.0f32;
            for (ch, &x) in frame.iter().enumerate() {
                let _ = self.channels[ch].input_producer.push(x);
                if x.abs() > proxy.abs() {
                    proxy = x;
                }
            }
            let _ = self.mono.input_producer.push(proxy);

            if self.mono.input_consumer.len() >= self.win {
                self.analyze(s);
                for ch in 0..channels {
                    self.synthesize(ch);
                    self.channels[ch].input_consumer.discard(self.hop);
                }
                self.mono.input_consumer.discard(self.hop);
            }

            for (ch, x) in frame.iter_mut().enumerate() {
                *x = self.channels[ch].output_consumer.pop().unwrap_or(0.0);
            }
        }
    }

    fn noise_floor_db(&self) -> f32 {
        if !self.floor_initialized {
            return NOISE_FLOOR_IDLE_DB;
        }
        let mean_sq = self.noise_floor.iter().map(|m| m * m).sum::<f32>()
            / self.noise_floor.len() as f32;
        power_to_db(mean_sq / self.window_energy).min(0.0)
    }
}

pub struct NoiseCanceller {
    sample_rate: f32,
    channels: usize,
    win: usize,
    hop: usize,
    engine: Option<SpectralEngine>,
    frames_processed: u64,
}

impl NoiseCanceller {
    /// No transform memory is held until `allocate()`.
    pub fn new(sample_rate: f32, channels: usize, fft_size: usize, hop_size: usize) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            win: fft_size,
            hop: hop_size,
            engine: None,
            frames_processed: 0,
        }
    }

    /// Build transform buffers and FFT plans. Allocates; never call from the
    /// audio callback without permission.
    pub fn allocate(&mut self) {
        if self.engine.is_none() {
            self.engine = Some(SpectralEngine::new(self.win, self.hop, self.channels));
        }
        self.reset();
    }

    /// Drop transform buffers.
    pub fn release(&mut self) {
        self.engine = None;
    }

    pub fn is_allocated(&self) -> bool {
        self.engine.is_some()
    }

    pub fn apply(&mut self, block: &mut [f32], params: &NoiseCancellerParams) {
        if !params.enabled {
            return;
        }
        let Some(engine) = self.engine.as_mut() else {
            return;
        };

        let frame_rate = self.sample_rate / self.hop as f32;
        let settings = FrameSettings {
            strength: params.strength,
            gain_floor: db_to_lin(params.spectral_floor_db + params.residual_boost_db).min(1.0),
            smoothing: params.smoothing,
            artifact_suppress: params.artifact_suppress,
            attack_coeff: time_constant_coeff(params.noise_attack_ms, frame_rate),
            release_coeff: time_constant_coeff(params.noise_release_ms, frame_rate),
            speech_coeff: time_constant_coeff(SPEECH_RISE_MS, frame_rate),
        };

        engine.process(block, &settings);
        self.frames_processed += (block.len() / self.channels) as u64;
    }

    /// Clear streaming and detector state without reallocating.
    pub fn reset(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.reset();
        }
    }

    pub fn noise_floor_db(&self) -> f32 {
        self.engine
            .as_ref()
            .map(|e| e.noise_floor_db())
            .unwrap_or(NOISE_FLOOR_IDLE_DB)
    }

    /// Added delay in samples (one FFT frame).
    pub fn latency_samples(&self) -> usize {
        self.win
    }

    pub fn latency_ms(&self) -> f32 {
        self.win as f32 * 1000.0 / self.sample_rate
    }

    pub fn memory_bytes(&self) -> usize {
        self.engine.as_ref().map(|e| e.memory_bytes()).unwrap_or(0)
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }
}
