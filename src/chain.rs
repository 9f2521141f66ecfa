//! Chain Orchestrator.
//!
//! [`VoiceChain`] lives on the audio thread and owns every piece of runtime
//! state. [`ChainController`] is the cloneable control-surface handle: it
//! writes parameters, requests lifecycle changes and reads telemetry, all
//! through lock-free cells the audio thread polls at block boundaries.
//!
//! Stage order is fixed in code:
//! AGC -> Equalizer -> Voice Gain -> Noise Canceller -> Compressor -> Limiter.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use assert_no_alloc::permit_alloc;
use log::Level;

use crate::config::ChainConfig;
use crate::debug::{log_ring, LogDrain, RtLogger};
use crate::dsp::utils::all_finite;
use crate::dsp::{Agc, Compressor, Equalizer, Limiter, NoiseCanceller, VoiceGain};
use crate::meters::{
    AtomicF32, BlockReadings, TelemetryCollector, TelemetrySnapshot, IDLE_LEVEL_DB,
    TELEMETRY_WORDS,
};
use crate::params::{
    AgcParams, BandOrder, ChainParams, CompressorParams, LimiterParams, NoiseCancellerParams,
    ParameterStore, Stage, EQ_BANDS,
};
use crate::presets::NoisePreset;
use crate::rt_log;
use crate::snapshot::SnapshotCell;

const REQUEST_NONE: u8 = 0;
const REQUEST_START: u8 = 1;
const REQUEST_STOP: u8 = 2;

// Attempts the controller makes before falling back to default telemetry.
const TELEMETRY_READ_ATTEMPTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Stopped,
    Running,
}

/// What `process_block` did with the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Every stage ran and produced finite output.
    Processed,
    /// Non-finite samples were replaced with silence at least once.
    Silenced,
    /// The chain is stopped; the buffer was left untouched.
    Stopped,
    /// The buffer did not match the configured layout; left untouched.
    Rejected,
}

impl BlockOutcome {
    fn worst(self, other: BlockOutcome) -> BlockOutcome {
        use BlockOutcome::*;
        match (self, other) {
            (Rejected, _) | (_, Rejected) => Rejected,
            (Silenced, _) | (_, Silenced) => Silenced,
            (Stopped, _) | (_, Stopped) => Stopped,
            _ => Processed,
        }
    }
}

/// State shared between the audio thread and every controller clone.
struct Shared {
    config: ChainConfig,
    params: ParameterStore,
    telemetry: SnapshotCell<TelemetrySnapshot, TELEMETRY_WORDS>,
    request: AtomicU8,
    running: AtomicBool,
    xruns: AtomicU64,
    io_input_ms: AtomicF32,
    io_output_ms: AtomicF32,
    diagnostics: Mutex<LogDrain>,
}

// =============================================================================
// Audio side
// =============================================================================

pub struct VoiceChain {
    shared: Arc<Shared>,
    config: ChainConfig,
    state: ChainState,

    agc: Agc,
    equalizer: Equalizer,
    voice_gain: VoiceGain,
    noise_canceller: NoiseCanceller,
    compressor: Compressor,
    limiter: Limiter,

    // Last consistent parameter set seen by the audio thread
    params: ChainParams,
    prev_enabled: [bool; 5],

    telemetry: TelemetryCollector,
    rt_log: RtLogger,
    planar_scratch: Vec<f32>,
}

impl VoiceChain {
    /// Build a stopped chain with default parameters.
    pub fn new(config: ChainConfig) -> anyhow::Result<(VoiceChain, ChainController)> {
        Self::with_params(config, ChainParams::default())
    }

    pub fn with_params(
        config: ChainConfig,
        params: ChainParams,
    ) -> anyhow::Result<(VoiceChain, ChainController)> {
        config.validate()?;

        let sr = config.sample_rate;
        let ch = config.channels;
        let (rt_log, drain) = log_ring();
        let store = ParameterStore::new(params);
        let initial = store.current();

        let shared = Arc::new(Shared {
            config,
            params: store,
            telemetry: SnapshotCell::new(TelemetrySnapshot::default()),
            request: AtomicU8::new(REQUEST_NONE),
            running: AtomicBool::new(false),
            xruns: AtomicU64::new(0),
            io_input_ms: AtomicF32::new(0.0),
            io_output_ms: AtomicF32::new(0.0),
            diagnostics: Mutex::new(drain),
        });

        let chain = VoiceChain {
            shared: Arc::clone(&shared),
            config,
            state: ChainState::Stopped,
            agc: Agc::new(sr, ch),
            equalizer: Equalizer::new(sr, ch, config.eq_q),
            voice_gain: VoiceGain::new(ch),
            noise_canceller: NoiseCanceller::new(sr, ch, config.nc_fft_size, config.nc_hop_size),
            compressor: Compressor::new(sr, ch),
            limiter: Limiter::new(sr, ch),
            params: initial,
            prev_enabled: enabled_flags(&initial),
            telemetry: TelemetryCollector::new(sr),
            rt_log,
            planar_scratch: vec![0.0; config.max_block_frames * ch],
        };

        log::info!(
            "voice chain created: {} Hz, {} ch, FFT {}/{}",
            sr,
            ch,
            config.nc_fft_size,
            config.nc_hop_size
        );

        Ok((chain, ChainController { shared }))
    }

    pub fn controller(&self) -> ChainController {
        ChainController {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ChainState::Running
    }

    /// Allocate and reset all runtime state, then run. Allocates.
    pub fn start(&mut self) {
        self.start_internal();
        log::info!("voice chain started");
    }

    /// Stop and release transform buffers. A no-op when already stopped.
    pub fn stop(&mut self) {
        if self.stop_internal() {
            log::info!("voice chain stopped");
        }
    }

    fn start_internal(&mut self) {
        self.params = self.shared.params.load(&self.params);
        self.prev_enabled = enabled_flags(&self.params);

        self.agc.reset();
        self.equalizer.reset();
        self.voice_gain.reset();
        self.noise_canceller.allocate();
        self.compressor.reset();
        self.limiter.reset();
        self.telemetry.reset();

        self.shared.telemetry.publish(self.telemetry.last());
        self.state = ChainState::Running;
        self.shared.running.store(true, Ordering::Release);
    }

    fn stop_internal(&mut self) -> bool {
        if self.state == ChainState::Stopped {
            return false;
        }
        self.state = ChainState::Stopped;
        self.shared.running.store(false, Ordering::Release);
        self.noise_canceller.release();
        true
    }

    /// Apply a start/stop requested by a controller. Runs on the audio
    /// thread, so (de)allocation is explicitly permitted here.
    fn apply_lifecycle_request(&mut self) {
        match self.shared.request.swap(REQUEST_NONE, Ordering::AcqRel) {
            REQUEST_START => {
                permit_alloc(|| self.start_internal());
                rt_log!(self.rt_log, Level::Info, "voice chain started (requested)");
            }
            REQUEST_STOP => {
                if permit_alloc(|| self.stop_internal()) {
                    rt_log!(self.rt_log, Level::Info, "voice chain stopped (requested)");
                }
            }
            _ => {}
        }
    }

    /// Process one interleaved block in place.
    ///
    /// Never allocates, locks or fails. While stopped the block is left
    /// untouched.
    pub fn process_block(&mut self, block: &mut [f32]) -> BlockOutcome {
        self.apply_lifecycle_request();
        if self.state != ChainState::Running {
            return BlockOutcome::Stopped;
        }

        let channels = self.config.channels;
        let whole = block.len() - block.len() % channels;
        // A trailing partial frame cannot be processed; keep it silent
        block[whole..].fill(0.0);
        let block = &mut block[..whole];
        if block.is_empty() {
            return BlockOutcome::Processed;
        }

        match catch_unwind(AssertUnwindSafe(|| self.process_internal(&mut *block))) {
            Ok(outcome) => outcome,
            Err(_) => {
                block.fill(0.0);
                self.reset_stages();
                self.telemetry.note_non_finite_block();
                rt_log!(self.rt_log, Level::Error, "stage panicked, block silenced");
                BlockOutcome::Silenced
            }
        }
    }

    fn process_internal(&mut self, block: &mut [f32]) -> BlockOutcome {
        let started = Instant::now();
        let frames = block.len() / self.config.channels;

        let params = self.shared.params.load(&self.params);
        self.params = params;
        self.handle_enable_transitions(&params);

        let mut outcome = BlockOutcome::Processed;

        if !all_finite(block) {
            block.fill(0.0);
            self.telemetry.note_non_finite_block();
            rt_log!(self.rt_log, Level::Warn, "non-finite input, block silenced");
            outcome = BlockOutcome::Silenced;
        }

        self.agc.apply(block, &params.agc);
        if self.silence_if_poisoned(block, Stage::Agc) {
            outcome = BlockOutcome::Silenced;
        }

        self.equalizer.apply(block, &params.equalizer);
        if self.silence_if_poisoned(block, Stage::Equalizer) {
            outcome = BlockOutcome::Silenced;
        }

        self.voice_gain.apply(block, &params.voice_gain);
        if !all_finite(block) {
            block.fill(0.0);
            self.voice_gain.reset();
            self.telemetry.note_non_finite_block();
            rt_log!(self.rt_log, Level::Warn, "non-finite output from voice gain, block silenced");
            outcome = BlockOutcome::Silenced;
        }

        let mut nc_elapsed = Duration::ZERO;
        if params.noise_canceller.enabled {
            let nc_started = Instant::now();
            self.noise_canceller.apply(block, &params.noise_canceller);
            nc_elapsed = nc_started.elapsed();
            if self.silence_if_poisoned(block, Stage::NoiseCanceller) {
                outcome = BlockOutcome::Silenced;
            }
        }

        self.compressor.apply(block, &params.compressor);
        if self.silence_if_poisoned(block, Stage::Compressor) {
            outcome = BlockOutcome::Silenced;
        }

        // Safety stage, always last
        self.limiter.apply(block, &params.limiter);
        if self.silence_if_poisoned(block, Stage::Limiter) {
            outcome = BlockOutcome::Silenced;
        }

        let nc_on = params.noise_canceller.enabled && self.noise_canceller.is_allocated();
        let readings = BlockReadings {
            output: &*block,
            frames,
            elapsed: started.elapsed(),
            nc_elapsed,
            agc_gain_db: if params.agc.enabled {
                self.agc.current_gain_db()
            } else {
                0.0
            },
            agc_level_db: if params.agc.enabled {
                self.agc.current_level_db()
            } else {
                IDLE_LEVEL_DB
            },
            compressor_gr_db: if params.compressor.enabled {
                self.compressor.gain_reduction_db()
            } else {
                0.0
            },
            limiter_gr_db: if params.limiter.enabled {
                self.limiter.gain_reduction_db()
            } else {
                0.0
            },
            noise_floor_db: self.noise_canceller.noise_floor_db(),
            io_input_ms: self.shared.io_input_ms.get(),
            io_output_ms: self.shared.io_output_ms.get(),
            processing_latency_ms: if nc_on {
                self.noise_canceller.latency_ms()
            } else {
                0.0
            },
            stage_memory_bytes: self.noise_canceller.memory_bytes() as u64,
        };
        let snapshot = self.telemetry.finish_block(&readings);
        self.shared.telemetry.publish(&snapshot);

        outcome
    }

    /// Zero the block and reset `stage` if it produced non-finite samples.
    fn silence_if_poisoned(&mut self, block: &mut [f32], stage: Stage) -> bool {
        if all_finite(block) {
            return false;
        }
        block.fill(0.0);
        self.reset_stage(stage);
        self.telemetry.note_non_finite_block();
        rt_log!(
            self.rt_log,
            Level::Warn,
            "non-finite output from {}, block silenced",
            stage.name()
        );
        true
    }

    /// A stage switched from disabled to enabled starts from clean state.
    fn handle_enable_transitions(&mut self, params: &ChainParams) {
        let now = enabled_flags(params);
        for (i, stage) in Stage::ALL.iter().enumerate() {
            if now[i] && !self.prev_enabled[i] {
                self.reset_stage(*stage);
            }
        }
        self.prev_enabled = now;
    }

    fn reset_stage(&mut self, stage: Stage) {
        match stage {
            Stage::Agc => self.agc.reset(),
            Stage::Equalizer => self.equalizer.reset(),
            Stage::NoiseCanceller => self.noise_canceller.reset(),
            Stage::Compressor => self.compressor.reset(),
            Stage::Limiter => self.limiter.reset(),
        }
    }

    fn reset_stages(&mut self) {
        for stage in Stage::ALL {
            self.reset_stage(stage);
        }
        self.voice_gain.reset();
    }

    /// Process planar channel buffers of equal length, in chunks of at most
    /// `max_block_frames`.
    pub fn process_planar(&mut self, planes: &mut [&mut [f32]]) -> BlockOutcome {
        let channels = self.config.channels;
        if planes.len() != channels {
            return BlockOutcome::Rejected;
        }
        let frames = planes[0].len();
        if planes.iter().any(|p| p.len() != frames) {
            return BlockOutcome::Rejected;
        }

        let mut scratch = std::mem::take(&mut self.planar_scratch);
        let chunk = (scratch.len() / channels).max(1);
        let mut outcome = BlockOutcome::Processed;

        let mut start = 0;
        while start < frames {
            let n = chunk.min(frames - start);
            let buf = &mut scratch[..n * channels];
            for (ch, plane) in planes.iter().enumerate() {
                for i in 0..n {
                    buf[i * channels + ch] = plane[start + i];
                }
            }

            outcome = outcome.worst(self.process_block(buf));

            for (ch, plane) in planes.iter_mut().enumerate() {
                for i in 0..n {
                    plane[start + i] = buf[i * channels + ch];
                }
            }
            start += n;
        }

        self.planar_scratch = scratch;
        outcome
    }

    pub fn noise_canceller_allocated(&self) -> bool {
        self.noise_canceller.is_allocated()
    }

    pub fn equalizer_coefficient_updates(&self) -> u64 {
        self.equalizer.coefficient_updates()
    }

    pub fn non_finite_blocks(&self) -> u64 {
        self.telemetry.non_finite_blocks()
    }

    /// Parameters the audio thread used for the most recent block.
    pub fn active_params(&self) -> &ChainParams {
        &self.params
    }

    /// Added delay of the current configuration in frames.
    pub fn latency_frames(&self) -> usize {
        if self.params.noise_canceller.enabled {
            self.noise_canceller.latency_samples()
        } else {
            0
        }
    }
}

fn enabled_flags(p: &ChainParams) -> [bool; 5] {
    let mut flags = [false; 5];
    for (flag, stage) in flags.iter_mut().zip(Stage::ALL.iter()) {
        *flag = p.stage_enabled(*stage);
    }
    flags
}

// =============================================================================
// Control side
// =============================================================================

/// Control-surface handle. Cheap to clone, `Send + Sync`, and safe to use in
/// any lifecycle state: parameters written while stopped apply on the next
/// start or block.
#[derive(Clone)]
pub struct ChainController {
    shared: Arc<Shared>,
}

impl ChainController {
    pub fn config(&self) -> &ChainConfig {
        &self.shared.config
    }

    // --- Lifecycle -----------------------------------------------------------

    /// Ask the audio thread to start at its next block boundary.
    pub fn request_start(&self) {
        self.shared.request.store(REQUEST_START, Ordering::Release);
    }

    /// Ask the audio thread to stop at its next block boundary.
    pub fn request_stop(&self) {
        self.shared.request.store(REQUEST_STOP, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    // --- I/O layer reports ---------------------------------------------------

    pub fn report_xrun(&self) {
        self.shared.xruns.fetch_add(1, Ordering::Relaxed);
    }

    /// Latency contributed by the audio driver, outside the chain.
    pub fn set_io_latency_ms(&self, input_ms: f32, output_ms: f32) {
        let clean = |v: f32| if v.is_finite() { v.max(0.0) } else { 0.0 };
        self.shared.io_input_ms.set(clean(input_ms));
        self.shared.io_output_ms.set(clean(output_ms));
    }

    // --- Parameters ----------------------------------------------------------

    pub fn params(&self) -> ChainParams {
        self.shared.params.current()
    }

    pub fn set_all_params(&self, params: ChainParams) -> ChainParams {
        self.shared.params.replace_all(params)
    }

    pub fn set_agc_params(&self, params: AgcParams) -> AgcParams {
        self.shared.params.set_agc(params)
    }

    pub fn set_agc_max_gain_db(&self, db: f32) -> f32 {
        self.shared.params.set_agc_max_gain_db(db)
    }

    pub fn set_agc_min_gain_db(&self, db: f32) -> f32 {
        self.shared.params.set_agc_min_gain_db(db)
    }

    pub fn set_eq_bands(&self, gains_db: &[f32]) -> [f32; EQ_BANDS] {
        self.shared.params.set_eq_bands(gains_db)
    }

    pub fn set_eq_band_gain(&self, index: usize, db: f32) -> bool {
        self.shared.params.set_eq_band_gain(index, db)
    }

    pub fn set_eq_precalc(&self, precalc: bool) {
        self.shared.params.set_eq_precalc(precalc)
    }

    pub fn set_eq_band_order(&self, order: BandOrder) {
        self.shared.params.set_eq_band_order(order)
    }

    pub fn set_noise_canceller_params(&self, params: NoiseCancellerParams) -> NoiseCancellerParams {
        self.shared.params.set_noise_canceller(params)
    }

    pub fn apply_noise_preset(&self, preset: NoisePreset) -> NoiseCancellerParams {
        self.shared.params.apply_noise_preset(preset)
    }

    pub fn apply_noise_preset_index(&self, index: i32) -> bool {
        self.shared.params.apply_noise_preset_index(index)
    }

    pub fn set_compressor_params(&self, params: CompressorParams) -> CompressorParams {
        self.shared.params.set_compressor(params)
    }

    pub fn set_limiter_params(&self, params: LimiterParams) -> LimiterParams {
        self.shared.params.set_limiter(params)
    }

    pub fn set_voice_gain_db(&self, db: f32) -> f32 {
        self.shared.params.set_voice_gain_db(db)
    }

    pub fn voice_gain_db(&self) -> f32 {
        self.shared.params.current().voice_gain.gain_db
    }

    pub fn set_stage_enabled(&self, stage: Stage, enabled: bool) {
        self.shared.params.set_stage_enabled(stage, enabled)
    }

    pub fn stage_enabled(&self, stage: Stage) -> bool {
        self.shared.params.stage_enabled(stage)
    }

    // --- Telemetry -----------------------------------------------------------

    /// Latest published snapshot; defaults until the first block runs.
    pub fn telemetry(&self) -> TelemetrySnapshot {
        let mut snapshot = None;
        for _ in 0..TELEMETRY_READ_ATTEMPTS {
            snapshot = self.shared.telemetry.try_read();
            if snapshot.is_some() {
                break;
            }
            std::thread::yield_now();
        }
        let mut t = snapshot.unwrap_or_default();
        t.xrun_count = self.shared.xruns.load(Ordering::Relaxed);
        t.sanitized_param_count = self.shared.params.sanitized_count();
        t.running = self.is_running();
        t
    }

    pub fn telemetry_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(&self.telemetry())?)
    }

    pub fn agc_current_gain_db(&self) -> f32 {
        self.telemetry().agc_current_gain_db
    }

    pub fn agc_current_level_db(&self) -> f32 {
        self.telemetry().agc_current_level_db
    }

    pub fn compressor_gain_reduction_db(&self) -> f32 {
        self.telemetry().compressor_gain_reduction_db
    }

    pub fn limiter_gain_reduction_db(&self) -> f32 {
        self.telemetry().limiter_gain_reduction_db
    }

    pub fn noise_floor_db(&self) -> f32 {
        self.telemetry().noise_floor_db
    }

    pub fn xrun_count(&self) -> u64 {
        self.shared.xruns.load(Ordering::Relaxed)
    }

    // --- Diagnostics ---------------------------------------------------------

    /// Forward queued audio-thread diagnostics to `log`.
    pub fn drain_diagnostics(&self) -> usize {
        self.shared
            .diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(channels: usize) -> (VoiceChain, ChainController) {
        VoiceChain::new(ChainConfig {
            channels,
            ..ChainConfig::default()
        })
        .unwrap()
    }

    fn assert_send<T: Send>() {}
    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_handles_cross_threads() {
        assert_send::<VoiceChain>();
        assert_send_sync::<ChainController>();
    }

    #[test]
    fn test_stopped_chain_is_noop() {
        let (mut chain, ctl) = chain(1);
        let mut block = vec![0.7; 64];
        assert_eq!(chain.process_block(&mut block), BlockOutcome::Stopped);
        assert!(block.iter().all(|&s| s == 0.7));

        // stop() without start() is harmless
        chain.stop();
        assert!(!ctl.is_running());
    }

    #[test]
    fn test_requests_apply_at_block_boundary() {
        let (mut chain, ctl) = chain(1);
        ctl.request_start();
        assert!(!ctl.is_running());

        let mut block = vec![0.1; 128];
        assert_eq!(chain.process_block(&mut block), BlockOutcome::Processed);
        assert!(ctl.is_running());
        assert_eq!(chain.state(), ChainState::Running);
        assert!(chain.noise_canceller_allocated());

        ctl.request_stop();
        let mut block = vec![0.1; 128];
        assert_eq!(chain.process_block(&mut block), BlockOutcome::Stopped);
        assert!(!ctl.is_running());
        assert!(!chain.noise_canceller_allocated());
        assert_eq!(chain.state(), ChainState::Stopped);
        assert!(ctl.drain_diagnostics() >= 2);
    }

    #[test]
    fn test_disabled_agc_reports_unity_gain() {
        let (mut chain, ctl) = chain(1);
        ctl.set_agc_params(AgcParams {
            enabled: true,
            ..AgcParams::default()
        });
        chain.start();

        // Quiet tone drives the gain up
        let mut n = 0;
        for _ in 0..200 {
            let mut block: Vec<f32> = (0..240)
                .map(|i| 0.01 * ((n + i) as f32 * 0.03).sin())
                .collect();
            chain.process_block(&mut block);
            n += 240;
        }
        assert!(ctl.agc_current_gain_db() > 1.0);
        assert!(ctl.agc_current_level_db() > -60.0);

        ctl.set_stage_enabled(Stage::Agc, false);
        let mut block = vec![0.01; 240];
        chain.process_block(&mut block);
        assert_eq!(ctl.agc_current_gain_db(), 0.0);
        assert_eq!(ctl.agc_current_level_db(), IDLE_LEVEL_DB);
        assert!(block.iter().all(|&s| s == 0.01));
    }

    #[test]
    fn test_controller_getters_follow_telemetry() {
        let (mut chain, ctl) = chain(2);
        assert_eq!(ctl.config().channels, 2);
        assert_eq!(chain.config().channels, 2);

        ctl.set_limiter_params(LimiterParams {
            enabled: true,
            threshold_db: -6.0,
            ..LimiterParams::default()
        });
        ctl.set_stage_enabled(Stage::NoiseCanceller, true);
        ctl.report_xrun();
        chain.start();

        let mut block = vec![0.9; 512];
        chain.process_block(&mut block);

        let t = ctl.telemetry();
        assert_eq!(ctl.xrun_count(), 1);
        assert_eq!(ctl.limiter_gain_reduction_db(), t.limiter_gain_reduction_db);
        assert!(ctl.limiter_gain_reduction_db() > 0.0);
        assert_eq!(ctl.noise_floor_db(), t.noise_floor_db);
        assert_eq!(ctl.compressor_gain_reduction_db(), 0.0);
    }

    #[test]
    fn test_set_all_params_replaces_every_group() {
        let (mut chain, ctl) = chain(1);
        let mut p = ChainParams::default();
        p.equalizer.enabled = true;
        p.equalizer.band_gains_db[4] = 30.0;
        p.compressor.enabled = true;
        p.voice_gain.gain_db = -3.0;

        let stored = ctl.set_all_params(p);
        assert_eq!(stored.equalizer.band_gains_db[4], 12.0);
        assert_eq!(ctl.params(), stored);

        chain.start();
        let mut block = vec![0.1; 256];
        chain.process_block(&mut block);
        assert_eq!(chain.active_params(), &stored);
        let updates = chain.equalizer_coefficient_updates();
        assert!(updates > 0);

        // Cached coefficients are not rebuilt while gains stay put
        let mut block = vec![0.1; 256];
        chain.process_block(&mut block);
        assert_eq!(chain.equalizer_coefficient_updates(), updates);
    }

    #[test]
    fn test_non_finite_input_is_silenced() {
        let (mut chain, ctl) = chain(2);
        chain.start();
        let mut block = vec![0.2; 256];
        block[17] = f32::NAN;
        assert_eq!(chain.process_block(&mut block), BlockOutcome::Silenced);
        assert!(block.iter().all(|&s| s == 0.0));

        // The next block flows again
        let mut block = vec![0.2; 256];
        assert_eq!(chain.process_block(&mut block), BlockOutcome::Processed);
        assert!(block.iter().any(|&s| s != 0.0));
        assert_eq!(ctl.telemetry().non_finite_block_count, 1);
    }

    #[test]
    fn test_telemetry_defaults_after_start() {
        let (mut chain, ctl) = chain(1);
        chain.start();
        let t = ctl.telemetry();
        assert_eq!(t.agc_current_gain_db, 0.0);
        assert_eq!(t.agc_current_level_db, -60.0);
        assert!(t.running);
    }

    #[test]
    fn test_xruns_and_latency_reach_telemetry() {
        let (mut chain, ctl) = chain(1);
        ctl.set_io_latency_ms(4.0, 6.0);
        ctl.report_xrun();
        ctl.report_xrun();
        ctl.set_stage_enabled(Stage::NoiseCanceller, true);

        chain.start();
        let mut block = vec![0.0; 480];
        chain.process_block(&mut block);

        let t = ctl.telemetry();
        assert_eq!(t.xrun_count, 2);
        assert_eq!(t.callback_size_frames, 480);
        let expected = 10.0 + 512.0 * 1000.0 / 48000.0;
        assert!((t.latency_total_ms - expected).abs() < 1e-3);
        assert!(t.stage_memory_bytes > 0);
        assert!(ctl.telemetry_json().unwrap().contains("xRunCount"));
    }

    #[test]
    fn test_planar_matches_interleaved() {
        let (mut a, _) = chain(2);
        let (mut b, _) = chain(2);
        a.start();
        b.start();

        let left: Vec<f32> = (0..1500).map(|i| (i as f32 * 0.02).sin()).collect();
        let right: Vec<f32> = (0..1500).map(|i| 0.5 * (i as f32 * 0.03).cos()).collect();

        let mut interleaved: Vec<f32> =
            left.iter().zip(&right).flat_map(|(l, r)| [*l, *r]).collect();
        for chunk in interleaved.chunks_mut(512 * 2) {
            a.process_block(chunk);
        }

        let mut l = left.clone();
        let mut r = right.clone();
        let mut planes = [&mut l[..], &mut r[..]];
        assert_eq!(b.process_planar(&mut planes), BlockOutcome::Processed);

        for i in 0..1500 {
            assert!((interleaved[2 * i] - l[i]).abs() < 1e-6);
            assert!((interleaved[2 * i + 1] - r[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_planar_rejects_wrong_layout() {
        let (mut chain, _) = chain(2);
        chain.start();
        let mut only = vec![0.0; 64];
        let mut planes = [&mut only[..]];
        assert_eq!(chain.process_planar(&mut planes), BlockOutcome::Rejected);
    }
}
