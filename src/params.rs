//! Stage parameters and the Parameter Store.
//!
//! Every setter validates and clamps its input before acceptance and never
//! fails. Non-finite floats are rejected per field: the field keeps its
//! previous value and the sanitized-parameter counter increments.
//!
//! The store keeps an authoritative copy under a control-side mutex (which
//! also serializes writers) and publishes each group through its own
//! [`SnapshotCell`] for the audio thread.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::presets::NoisePreset;
use crate::snapshot::{bool_word, f32_word, word_bool, word_f32, Packed, SnapshotCell};

pub const EQ_BANDS: usize = 10;

/// Fixed ascending band centers (Hz).
pub const EQ_CENTER_FREQS_HZ: [f32; EQ_BANDS] = [
    32.0, 64.0, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0,
];

/// Smallest distance kept between the AGC gain bounds (dB).
pub const AGC_MIN_GAIN_SPAN_DB: f32 = 0.1;

const AGC_TARGET_RANGE: RangeInclusive<f32> = -40.0..=-10.0;
const AGC_MAX_GAIN_RANGE: RangeInclusive<f32> = 0.0..=40.0;
const AGC_MIN_GAIN_RANGE: RangeInclusive<f32> = -20.0..=0.0;
const AGC_TIME_S_RANGE: RangeInclusive<f32> = 0.001..=10.0;
const AGC_NOISE_THRESHOLD_RANGE: RangeInclusive<f32> = -90.0..=0.0;
const AGC_WINDOW_S_RANGE: RangeInclusive<f32> = 0.005..=2.0;

pub const EQ_GAIN_RANGE: RangeInclusive<f32> = -12.0..=12.0;

const NC_UNIT_RANGE: RangeInclusive<f32> = 0.0..=1.0;
const NC_FLOOR_RANGE: RangeInclusive<f32> = -80.0..=-30.0;
const NC_ATTACK_RANGE: RangeInclusive<f32> = 5.0..=100.0;
const NC_RELEASE_RANGE: RangeInclusive<f32> = 50.0..=1500.0;
const NC_RESIDUAL_RANGE: RangeInclusive<f32> = -6.0..=6.0;

const COMP_THRESHOLD_RANGE: RangeInclusive<f32> = -60.0..=0.0;
const COMP_RATIO_RANGE: RangeInclusive<f32> = 1.0..=50.0;
const COMP_ATTACK_RANGE: RangeInclusive<f32> = 0.1..=1000.0;
const COMP_RELEASE_RANGE: RangeInclusive<f32> = 1.0..=5000.0;
const COMP_KNEE_RANGE: RangeInclusive<f32> = 0.0..=24.0;
const COMP_MAKEUP_RANGE: RangeInclusive<f32> = -24.0..=24.0;

// 0 dBFS or above clamps to the top of this range.
const LIMITER_THRESHOLD_RANGE: RangeInclusive<f32> = -30.0..=-0.1;
const LIMITER_RELEASE_RANGE: RangeInclusive<f32> = 1.0..=2000.0;
const LIMITER_LOOKAHEAD_RANGE: RangeInclusive<f32> = 0.0..=20.0;

pub const VOICE_GAIN_RANGE: RangeInclusive<f32> = -12.0..=12.0;

// =============================================================================
// Stage identifiers
// =============================================================================

/// Stages that can be switched on and off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Agc,
    Equalizer,
    NoiseCanceller,
    Compressor,
    Limiter,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Agc,
        Stage::Equalizer,
        Stage::NoiseCanceller,
        Stage::Compressor,
        Stage::Limiter,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Agc => "agc",
            Stage::Equalizer => "equalizer",
            Stage::NoiseCanceller => "noise_canceller",
            Stage::Compressor => "compressor",
            Stage::Limiter => "limiter",
        }
    }

    pub fn from_index(index: i32) -> Option<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }
}

/// Cascade order of the EQ sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum BandOrder {
    #[default]
    Ascending,
    Descending,
    GainAscending,
    GainDescending,
}

impl BandOrder {
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(BandOrder::Ascending),
            1 => Some(BandOrder::Descending),
            2 => Some(BandOrder::GainAscending),
            3 => Some(BandOrder::GainDescending),
            _ => None,
        }
    }
}

// =============================================================================
// Parameter records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgcParams {
    pub enabled: bool,
    pub target_level_db: f32,
    pub max_gain_db: f32,
    pub min_gain_db: f32,
    pub attack_time_s: f32,
    pub release_time_s: f32,
    pub noise_threshold_db: f32,
    pub window_size_s: f32,
}

impl Default for AgcParams {
    fn default() -> Self {
        Self {
            enabled: false,
            target_level_db: -20.0,
            max_gain_db: 20.0,
            min_gain_db: -10.0,
            attack_time_s: 0.5,
            release_time_s: 0.1,
            noise_threshold_db: -50.0,
            window_size_s: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EqParams {
    pub enabled: bool,
    pub band_gains_db: [f32; EQ_BANDS],
    /// Cache coefficients and refresh them only when a gain changes.
    pub precalc_coefficients: bool,
    pub band_order: BandOrder,
}

impl Default for EqParams {
    fn default() -> Self {
        Self {
            enabled: false,
            band_gains_db: [0.0; EQ_BANDS],
            precalc_coefficients: true,
            band_order: BandOrder::Ascending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NoiseCancellerParams {
    pub enabled: bool,
    pub strength: f32,
    pub spectral_floor_db: f32,
    pub smoothing: f32,
    pub noise_attack_ms: f32,
    pub noise_release_ms: f32,
    pub residual_boost_db: f32,
    pub artifact_suppress: f32,
    pub preset_id: NoisePreset,
}

impl NoiseCancellerParams {
    /// Replace every tunable with the preset's bundle; `enabled` is kept.
    pub fn with_preset(self, preset: NoisePreset) -> Self {
        let v = preset.values();
        Self {
            enabled: self.enabled,
            strength: v.strength,
            spectral_floor_db: v.spectral_floor_db,
            smoothing: v.smoothing,
            noise_attack_ms: v.noise_attack_ms,
            noise_release_ms: v.noise_release_ms,
            residual_boost_db: v.residual_boost_db,
            artifact_suppress: v.artifact_suppress,
            preset_id: preset,
        }
    }
}

impl Default for NoiseCancellerParams {
    fn default() -> Self {
        let disabled = Self {
            enabled: false,
            strength: 0.0,
            spectral_floor_db: 0.0,
            smoothing: 0.0,
            noise_attack_ms: 0.0,
            noise_release_ms: 0.0,
            residual_boost_db: 0.0,
            artifact_suppress: 0.0,
            preset_id: NoisePreset::Default,
        };
        disabled.with_preset(NoisePreset::Default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompressorParams {
    pub enabled: bool,
    pub threshold_db: f32,
    pub ratio: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    pub knee_db: f32,
    pub makeup_gain_db: f32,
}

impl Default for CompressorParams {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_db: -20.0,
            ratio: 4.0,
            attack_ms: 10.0,
            release_ms: 100.0,
            knee_db: 6.0,
            makeup_gain_db: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimiterParams {
    pub enabled: bool,
    pub threshold_db: f32,
    pub release_ms: f32,
    /// Accepted and stored, not used by the detector.
    pub lookahead_ms: f32,
}

impl Default for LimiterParams {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_db: -1.0,
            release_ms: 50.0,
            lookahead_ms: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoiceGainParams {
    pub gain_db: f32,
}

/// Every parameter group of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainParams {
    pub agc: AgcParams,
    pub equalizer: EqParams,
    pub noise_canceller: NoiseCancellerParams,
    pub compressor: CompressorParams,
    pub limiter: LimiterParams,
    pub voice_gain: VoiceGainParams,
}

impl ChainParams {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        use anyhow::Context;
        serde_json::from_str(json).context("parsing chain parameters")
    }

    pub fn stage_enabled(&self, stage: Stage) -> bool {
        match stage {
            Stage::Agc => self.agc.enabled,
            Stage::Equalizer => self.equalizer.enabled,
            Stage::NoiseCanceller => self.noise_canceller.enabled,
            Stage::Compressor => self.compressor.enabled,
            Stage::Limiter => self.limiter.enabled,
        }
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Per-call field validator: clamps finite values, rejects non-finite ones.
struct Sanitizer {
    rejected: u32,
}

impl Sanitizer {
    fn new() -> Self {
        Self { rejected: 0 }
    }

    fn float(&mut self, field: &str, value: f32, previous: f32, range: RangeInclusive<f32>) -> f32 {
        if !value.is_finite() {
            self.rejected += 1;
            log::warn!("{field}: rejected non-finite value {value}, keeping {previous}");
            return previous;
        }
        let clamped = value.clamp(*range.start(), *range.end());
        if clamped != value {
            log::debug!("{field}: clamped {value} to {clamped}");
        }
        clamped
    }
}

fn sanitize_eq_gain(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(*EQ_GAIN_RANGE.start(), *EQ_GAIN_RANGE.end())
    } else {
        0.0
    }
}

/// Pads short arrays with 0 dB, ignores extra entries, zeroes non-finite gains.
/// Returns the gains plus the number of non-finite entries found.
pub fn sanitize_band_gains(gains: &[f32]) -> ([f32; EQ_BANDS], u32) {
    let mut out = [0.0; EQ_BANDS];
    let mut rejected = 0;
    for (slot, &g) in out.iter_mut().zip(gains.iter()) {
        if !g.is_finite() {
            rejected += 1;
        }
        *slot = sanitize_eq_gain(g);
    }
    (out, rejected)
}

/// Keeps `max - min >= AGC_MIN_GAIN_SPAN_DB` by moving `min` (max is the
/// most recently set bound).
fn enforce_agc_bounds_prefer_max(p: &mut AgcParams) {
    if p.max_gain_db - p.min_gain_db < AGC_MIN_GAIN_SPAN_DB {
        p.min_gain_db = p.max_gain_db - AGC_MIN_GAIN_SPAN_DB;
    }
}

impl AgcParams {
    fn sanitized(self, prev: &AgcParams, s: &mut Sanitizer) -> AgcParams {
        let mut p = AgcParams {
            enabled: self.enabled,
            target_level_db: s.float(
                "agc.targetLevelDb",
                self.target_level_db,
                prev.target_level_db,
                AGC_TARGET_RANGE,
            ),
            max_gain_db: s.float(
                "agc.maxGainDb",
                self.max_gain_db,
                prev.max_gain_db,
                AGC_MAX_GAIN_RANGE,
            ),
            min_gain_db: s.float(
                "agc.minGainDb",
                self.min_gain_db,
                prev.min_gain_db,
                AGC_MIN_GAIN_RANGE,
            ),
            attack_time_s: s.float(
                "agc.attackTimeS",
                self.attack_time_s,
                prev.attack_time_s,
                AGC_TIME_S_RANGE,
            ),
            release_time_s: s.float(
                "agc.releaseTimeS",
                self.release_time_s,
                prev.release_time_s,
                AGC_TIME_S_RANGE,
            ),
            noise_threshold_db: s.float(
                "agc.noiseThresholdDb",
                self.noise_threshold_db,
                prev.noise_threshold_db,
                AGC_NOISE_THRESHOLD_RANGE,
            ),
            window_size_s: s.float(
                "agc.windowSizeS",
                self.window_size_s,
                prev.window_size_s,
                AGC_WINDOW_S_RANGE,
            ),
        };
        enforce_agc_bounds_prefer_max(&mut p);
        p
    }
}

impl EqParams {
    fn sanitized(self, s: &mut Sanitizer) -> EqParams {
        let (band_gains_db, rejected) = sanitize_band_gains(&self.band_gains_db);
        s.rejected += rejected;
        EqParams {
            band_gains_db,
            ..self
        }
    }
}

impl NoiseCancellerParams {
    fn sanitized(self, prev: &NoiseCancellerParams, s: &mut Sanitizer) -> NoiseCancellerParams {
        NoiseCancellerParams {
            enabled: self.enabled,
            strength: s.float("nc.strength", self.strength, prev.strength, NC_UNIT_RANGE),
            spectral_floor_db: s.float(
                "nc.spectralFloorDb",
                self.spectral_floor_db,
                prev.spectral_floor_db,
                NC_FLOOR_RANGE,
            ),
            smoothing: s.float(
                "nc.smoothing",
                self.smoothing,
                prev.smoothing,
                NC_UNIT_RANGE,
            ),
            noise_attack_ms: s.float(
                "nc.noiseAttackMs",
                self.noise_attack_ms,
                prev.noise_attack_ms,
                NC_ATTACK_RANGE,
            ),
            noise_release_ms: s.float(
                "nc.noiseReleaseMs",
                self.noise_release_ms,
                prev.noise_release_ms,
                NC_RELEASE_RANGE,
            ),
            residual_boost_db: s.float(
                "nc.residualBoostDb",
                self.residual_boost_db,
                prev.residual_boost_db,
                NC_RESIDUAL_RANGE,
            ),
            artifact_suppress: s.float(
                "nc.artifactSuppress",
                self.artifact_suppress,
                prev.artifact_suppress,
                NC_UNIT_RANGE,
            ),
            preset_id: self.preset_id,
        }
    }
}

impl CompressorParams {
    fn sanitized(self, prev: &CompressorParams, s: &mut Sanitizer) -> CompressorParams {
        CompressorParams {
            enabled: self.enabled,
            threshold_db: s.float(
                "comp.thresholdDb",
                self.threshold_db,
                prev.threshold_db,
                COMP_THRESHOLD_RANGE,
            ),
            ratio: s.float("comp.ratio", self.ratio, prev.ratio, COMP_RATIO_RANGE),
            attack_ms: s.float(
                "comp.attackMs",
                self.attack_ms,
                prev.attack_ms,
                COMP_ATTACK_RANGE,
            ),
            release_ms: s.float(
                "comp.releaseMs",
                self.release_ms,
                prev.release_ms,
                COMP_RELEASE_RANGE,
            ),
            knee_db: s.float("comp.kneeDb", self.knee_db, prev.knee_db, COMP_KNEE_RANGE),
            makeup_gain_db: s.float(
                "comp.makeupGainDb",
                self.makeup_gain_db,
                prev.makeup_gain_db,
                COMP_MAKEUP_RANGE,
            ),
        }
    }
}

impl LimiterParams {
    fn sanitized(self, prev: &LimiterParams, s: &mut Sanitizer) -> LimiterParams {
        LimiterParams {
            enabled: self.enabled,
            threshold_db: s.float(
                "limiter.thresholdDb",
                self.threshold_db,
                prev.threshold_db,
                LIMITER_THRESHOLD_RANGE,
            ),
            release_ms: s.float(
                "limiter.releaseMs",
                self.release_ms,
                prev.release_ms,
                LIMITER_RELEASE_RANGE,
            ),
            lookahead_ms: s.float(
                "limiter.lookaheadMs",
                self.lookahead_ms,
                prev.lookahead_ms,
                LIMITER_LOOKAHEAD_RANGE,
            ),
        }
    }
}

impl VoiceGainParams {
    fn sanitized(self, prev: &VoiceGainParams, s: &mut Sanitizer) -> VoiceGainParams {
        VoiceGainParams {
            gain_db: s.float(
                "voiceGain.gainDb",
                self.gain_db,
                prev.gain_db,
                VOICE_GAIN_RANGE,
            ),
        }
    }
}

impl ChainParams {
    fn sanitized(self, prev: &ChainParams, s: &mut Sanitizer) -> ChainParams {
        ChainParams {
            agc: self.agc.sanitized(&prev.agc, s),
            equalizer: self.equalizer.sanitized(s),
            noise_canceller: self.noise_canceller.sanitized(&prev.noise_canceller, s),
            compressor: self.compressor.sanitized(&prev.compressor, s),
            limiter: self.limiter.sanitized(&prev.limiter, s),
            voice_gain: self.voice_gain.sanitized(&prev.voice_gain, s),
        }
    }

    /// Validate a whole parameter set against the defaults.
    pub fn validated(self) -> ChainParams {
        self.sanitized(&ChainParams::default(), &mut Sanitizer::new())
    }
}

// =============================================================================
// Packed snapshot layouts
// =============================================================================

pub const AGC_WORDS: usize = 8;
pub const EQ_WORDS: usize = EQ_BANDS + 3;
pub const NC_WORDS: usize = 9;
pub const COMP_WORDS: usize = 7;
pub const LIMITER_WORDS: usize = 4;
pub const VOICE_GAIN_WORDS: usize = 1;

impl Packed<AGC_WORDS> for AgcParams {
    fn pack(&self) -> [u32; AGC_WORDS] {
        [
            bool_word(self.enabled),
            f32_word(self.target_level_db),
            f32_word(self.max_gain_db),
            f32_word(self.min_gain_db),
            f32_word(self.attack_time_s),
            f32_word(self.release_time_s),
            f32_word(self.noise_threshold_db),
            f32_word(self.window_size_s),
        ]
    }

    fn unpack(w: &[u32; AGC_WORDS]) -> Self {
        Self {
            enabled: word_bool(w[0]),
            target_level_db: word_f32(w[1]),
            max_gain_db: word_f32(w[2]),
            min_gain_db: word_f32(w[3]),
            attack_time_s: word_f32(w[4]),
            release_time_s: word_f32(w[5]),
            noise_threshold_db: word_f32(w[6]),
            window_size_s: word_f32(w[7]),
        }
    }
}

impl Packed<EQ_WORDS> for EqParams {
    fn pack(&self) -> [u32; EQ_WORDS] {
        let mut w = [0u32; EQ_WORDS];
        w[0] = bool_word(self.enabled);
        for (slot, g) in w[1..=EQ_BANDS].iter_mut().zip(self.band_gains_db.iter()) {
            *slot = f32_word(*g);
        }
        w[EQ_BANDS + 1] = bool_word(self.precalc_coefficients);
        w[EQ_BANDS + 2] = self.band_order as u32;
        w
    }

    fn unpack(w: &[u32; EQ_WORDS]) -> Self {
        let mut band_gains_db = [0.0; EQ_BANDS];
        for (g, slot) in band_gains_db.iter_mut().zip(w[1..=EQ_BANDS].iter()) {
            *g = word_f32(*slot);
        }
        Self {
            enabled: word_bool(w[0]),
            band_gains_db,
            precalc_coefficients: word_bool(w[EQ_BANDS + 1]),
            band_order: BandOrder::from_index(w[EQ_BANDS + 2]).unwrap_or_default(),
        }
    }
}

impl Packed<NC_WORDS> for NoiseCancellerParams {
    fn pack(&self) -> [u32; NC_WORDS] {
        [
            bool_word(self.enabled),
            f32_word(self.strength),
            f32_word(self.spectral_floor_db),
            f32_word(self.smoothing),
            f32_word(self.noise_attack_ms),
            f32_word(self.noise_release_ms),
            f32_word(self.residual_boost_db),
            f32_word(self.artifact_suppress),
            self.preset_id.index(),
        ]
    }

    fn unpack(w: &[u32; NC_WORDS]) -> Self {
        Self {
            enabled: word_bool(w[0]),
            strength: word_f32(w[1]),
            spectral_floor_db: word_f32(w[2]),
            smoothing: word_f32(w[3]),
            noise_attack_ms: word_f32(w[4]),
            noise_release_ms: word_f32(w[5]),
            residual_boost_db: word_f32(w[6]),
            artifact_suppress: word_f32(w[7]),
            preset_id: NoisePreset::from_index(w[8] as i32).unwrap_or_default(),
        }
    }
}

impl Packed<COMP_WORDS> for CompressorParams {
    fn pack(&self) -> [u32; COMP_WORDS] {
        [
            bool_word(self.enabled),
            f32_word(self.threshold_db),
            f32_word(self.ratio),
            f32_word(self.attack_ms),
            f32_word(self.release_ms),
            f32_word(self.knee_db),
            f32_word(self.makeup_gain_db),
        ]
    }

    fn unpack(w: &[u32; COMP_WORDS]) -> Self {
        Self {
            enabled: word_bool(w[0]),
            threshold_db: word_f32(w[1]),
            ratio: word_f32(w[2]),
            attack_ms: word_f32(w[3]),
            release_ms: word_f32(w[4]),
            knee_db: word_f32(w[5]),
            makeup_gain_db: word_f32(w[6]),
        }
    }
}

impl Packed<LIMITER_WORDS> for LimiterParams {
    fn pack(&self) -> [u32; LIMITER_WORDS] {
        [
            bool_word(self.enabled),
            f32_word(self.threshold_db),
            f32_word(self.release_ms),
            f32_word(self.lookahead_ms),
        ]
    }

    fn unpack(w: &[u32; LIMITER_WORDS]) -> Self {
        Self {
            enabled: word_bool(w[0]),
            threshold_db: word_f32(w[1]),
            release_ms: word_f32(w[2]),
            lookahead_ms: word_f32(w[3]),
        }
    }
}

impl Packed<VOICE_GAIN_WORDS> for VoiceGainParams {
    fn pack(&self) -> [u32; VOICE_GAIN_WORDS] {
        [f32_word(self.gain_db)]
    }

    fn unpack(w: &[u32; VOICE_GAIN_WORDS]) -> Self {
        Self {
            gain_db: word_f32(w[0]),
        }
    }
}

// =============================================================================
// Parameter Store
// =============================================================================

/// Thread-safe holder of the current configuration of every stage.
///
/// Writers (control surface) go through the mutex; the audio thread only
/// touches the snapshot cells via [`ParameterStore::load`].
pub struct ParameterStore {
    control: Mutex<ChainParams>,
    agc: SnapshotCell<AgcParams, AGC_WORDS>,
    equalizer: SnapshotCell<EqParams, EQ_WORDS>,
    noise_canceller: SnapshotCell<NoiseCancellerParams, NC_WORDS>,
    compressor: SnapshotCell<CompressorParams, COMP_WORDS>,
    limiter: SnapshotCell<LimiterParams, LIMITER_WORDS>,
    voice_gain: SnapshotCell<VoiceGainParams, VOICE_GAIN_WORDS>,
    sanitized: AtomicU64,
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new(ChainParams::default())
    }
}

impl ParameterStore {
    pub fn new(initial: ChainParams) -> Self {
        let mut s = Sanitizer::new();
        let p = initial.sanitized(&ChainParams::default(), &mut s);
        Self {
            control: Mutex::new(p),
            agc: SnapshotCell::new(p.agc),
            equalizer: SnapshotCell::new(p.equalizer),
            noise_canceller: SnapshotCell::new(p.noise_canceller),
            compressor: SnapshotCell::new(p.compressor),
            limiter: SnapshotCell::new(p.limiter),
            voice_gain: SnapshotCell::new(p.voice_gain),
            sanitized: AtomicU64::new(u64::from(s.rejected)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChainParams> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn count(&self, s: &Sanitizer) {
        if s.rejected > 0 {
            self.sanitized.fetch_add(u64::from(s.rejected), Ordering::Relaxed);
        }
    }

    /// Number of non-finite parameter values rejected so far.
    pub fn sanitized_count(&self) -> u64 {
        self.sanitized.load(Ordering::Relaxed)
    }

    /// Authoritative control-side copy of every group.
    pub fn current(&self) -> ChainParams {
        *self.lock()
    }

    /// Audio-thread read: newest consistent value of each group, or the
    /// matching group of `last_good` when a writer is mid-publish.
    #[inline]
    pub fn load(&self, last_good: &ChainParams) -> ChainParams {
        ChainParams {
            agc: self.agc.read_or(last_good.agc),
            equalizer: self.equalizer.read_or(last_good.equalizer),
            noise_canceller: self.noise_canceller.read_or(last_good.noise_canceller),
            compressor: self.compressor.read_or(last_good.compressor),
            limiter: self.limiter.read_or(last_good.limiter),
            voice_gain: self.voice_gain.read_or(last_good.voice_gain),
        }
    }

    pub fn replace_all(&self, params: ChainParams) -> ChainParams {
        let mut guard = self.lock();
        let mut s = Sanitizer::new();
        let p = params.sanitized(&guard, &mut s);
        *guard = p;
        self.agc.publish(&p.agc);
        self.equalizer.publish(&p.equalizer);
        self.noise_canceller.publish(&p.noise_canceller);
        self.compressor.publish(&p.compressor);
        self.limiter.publish(&p.limiter);
        self.voice_gain.publish(&p.voice_gain);
        self.count(&s);
        p
    }

    // --- AGC -----------------------------------------------------------------

    pub fn set_agc(&self, params: AgcParams) -> AgcParams {
        let mut guard = self.lock();
        let mut s = Sanitizer::new();
        let p = params.sanitized(&guard.agc, &mut s);
        guard.agc = p;
        self.agc.publish(&p);
        self.count(&s);
        p
    }

    /// Sets the upper AGC bound; it is pushed above the current lower bound.
    pub fn set_agc_max_gain_db(&self, db: f32) -> f32 {
        let mut guard = self.lock();
        let mut s = Sanitizer::new();
        let mut p = guard.agc;
        p.max_gain_db = s
            .float("agc.maxGainDb", db, p.max_gain_db, AGC_MAX_GAIN_RANGE)
            .max(p.min_gain_db + AGC_MIN_GAIN_SPAN_DB);
        guard.agc = p;
        self.agc.publish(&p);
        self.count(&s);
        p.max_gain_db
    }

    /// Sets the lower AGC bound; it is pushed below the current upper bound.
    pub fn set_agc_min_gain_db(&self, db: f32) -> f32 {
        let mut guard = self.lock();
        let mut s = Sanitizer::new();
        let mut p = guard.agc;
        p.min_gain_db = s
            .float("agc.minGainDb", db, p.min_gain_db, AGC_MIN_GAIN_RANGE)
            .min(p.max_gain_db - AGC_MIN_GAIN_SPAN_DB);
        guard.agc = p;
        self.agc.publish(&p);
        self.count(&s);
        p.min_gain_db
    }

    // --- Equalizer -----------------------------------------------------------

    /// Replace the band gains. Short arrays are padded with 0 dB.
    pub fn set_eq_bands(&self, gains: &[f32]) -> [f32; EQ_BANDS] {
        let (bands, rejected) = sanitize_band_gains(gains);
        if gains.len() != EQ_BANDS {
            log::debug!("eq: got {} band gains, expected {}", gains.len(), EQ_BANDS);
        }
        let mut guard = self.lock();
        guard.equalizer.band_gains_db = bands;
        self.equalizer.publish(&guard.equalizer);
        self.sanitized
            .fetch_add(u64::from(rejected), Ordering::Relaxed);
        bands
    }

    /// Set one band; returns `false` (and changes nothing) for a bad index.
    pub fn set_eq_band_gain(&self, index: usize, db: f32) -> bool {
        if index >= EQ_BANDS {
            log::debug!("eq: ignoring gain for band {index}");
            return false;
        }
        if !db.is_finite() {
            self.sanitized.fetch_add(1, Ordering::Relaxed);
        }
        let mut guard = self.lock();
        guard.equalizer.band_gains_db[index] = sanitize_eq_gain(db);
        self.equalizer.publish(&guard.equalizer);
        true
    }

    pub fn set_eq_precalc(&self, precalc: bool) {
        let mut guard = self.lock();
        guard.equalizer.precalc_coefficients = precalc;
        self.equalizer.publish(&guard.equalizer);
    }

    pub fn set_eq_band_order(&self, order: BandOrder) {
        let mut guard = self.lock();
        guard.equalizer.band_order = order;
        self.equalizer.publish(&guard.equalizer);
    }

    // --- Noise canceller -----------------------------------------------------

    pub fn set_noise_canceller(&self, params: NoiseCancellerParams) -> NoiseCancellerParams {
        let mut guard = self.lock();
        let mut s = Sanitizer::new();
        let p = params.sanitized(&guard.noise_canceller, &mut s);
        guard.noise_canceller = p;
        self.noise_canceller.publish(&p);
        self.count(&s);
        p
    }

    /// Apply a preset bundle in a single publish.
    pub fn apply_noise_preset(&self, preset: NoisePreset) -> NoiseCancellerParams {
        let mut guard = self.lock();
        let mut s = Sanitizer::new();
        let p = guard
            .noise_canceller
            .with_preset(preset)
            .sanitized(&guard.noise_canceller, &mut s);
        guard.noise_canceller = p;
        self.noise_canceller.publish(&p);
        self.count(&s);
        log::info!("noise canceller preset {} applied", preset.name());
        p
    }

    /// Bridge entry point; an unknown index leaves the parameters untouched.
    pub fn apply_noise_preset_index(&self, index: i32) -> bool {
        match NoisePreset::from_index(index) {
            Some(preset) => {
                self.apply_noise_preset(preset);
                true
            }
            None => {
                log::warn!("ignoring unknown noise preset index {index}");
                false
            }
        }
    }

    // --- Dynamics ------------------------------------------------------------

    pub fn set_compressor(&self, params: CompressorParams) -> CompressorParams {
        let mut guard = self.lock();
        let mut s = Sanitizer::new();
        let p = params.sanitized(&guard.compressor, &mut s);
        guard.compressor = p;
        self.compressor.publish(&p);
        self.count(&s);
        p
    }

    pub fn set_limiter(&self, params: LimiterParams) -> LimiterParams {
        let mut guard = self.lock();
        let mut s = Sanitizer::new();
        let p = params.sanitized(&guard.limiter, &mut s);
        guard.limiter = p;
        self.limiter.publish(&p);
        self.count(&s);
        p
    }

    pub fn set_voice_gain_db(&self, db: f32) -> f32 {
        let mut guard = self.lock();
        let mut s = Sanitizer::new();
        let p = VoiceGainParams { gain_db: db }.sanitized(&guard.voice_gain, &mut s);
        guard.voice_gain = p;
        self.voice_gain.publish(&p);
        self.count(&s);
        p.gain_db
    }

    // --- Enable flags --------------------------------------------------------

    pub fn set_stage_enabled(&self, stage: Stage, enabled: bool) {
        let mut guard = self.lock();
        match stage {
            Stage::Agc => {
                guard.agc.enabled = enabled;
                self.agc.publish(&guard.agc);
            }
            Stage::Equalizer => {
                guard.equalizer.enabled = enabled;
                self.equalizer.publish(&guard.equalizer);
            }
            Stage::NoiseCanceller => {
                guard.noise_canceller.enabled = enabled;
                self.noise_canceller.publish(&guard.noise_canceller);
            }
            Stage::Compressor => {
                guard.compressor.enabled = enabled;
                self.compressor.publish(&guard.compressor);
            }
            Stage::Limiter => {
                guard.limiter.enabled = enabled;
                self.limiter.publish(&guard.limiter);
            }
        }
    }

    pub fn stage_enabled(&self, stage: Stage) -> bool {
        self.lock().stage_enabled(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_gain_reads_back_clamped() {
        let store = ParameterStore::default();
        assert_eq!(store.set_voice_gain_db(20.0), 12.0);
        assert_eq!(store.current().voice_gain.gain_db, 12.0);
        assert_eq!(store.set_voice_gain_db(-40.0), -12.0);
    }

    #[test]
    fn test_non_finite_fields_keep_previous_value() {
        let store = ParameterStore::default();
        let mut comp = store.current().compressor;
        comp.ratio = f32::NAN;
        comp.threshold_db = -30.0;
        let stored = store.set_compressor(comp);

        assert_eq!(stored.ratio, CompressorParams::default().ratio);
        assert_eq!(stored.threshold_db, -30.0);
        assert_eq!(store.sanitized_count(), 1);
    }

    #[test]
    fn test_limiter_threshold_never_reaches_zero() {
        let store = ParameterStore::default();
        let lim = store.set_limiter(LimiterParams {
            threshold_db: 3.0,
            lookahead_ms: 5.0,
            ..LimiterParams::default()
        });
        assert!(lim.threshold_db < 0.0);
        assert_eq!(lim.lookahead_ms, 5.0);
    }

    #[test]
    fn test_eq_band_sanitizing() {
        let store = ParameterStore::default();
        let bands = store.set_eq_bands(&[3.0, f32::INFINITY, 30.0]);
        assert_eq!(bands[0], 3.0);
        assert_eq!(bands[1], 0.0);
        assert_eq!(bands[2], 12.0);
        assert!(bands[3..].iter().all(|&g| g == 0.0));

        let long: Vec<f32> = (0..14).map(|i| i as f32).collect();
        let bands = store.set_eq_bands(&long);
        assert_eq!(bands[9], 9.0);

        assert!(!store.set_eq_band_gain(10, 1.0));
        assert!(store.set_eq_band_gain(9, f32::NAN));
        assert_eq!(store.current().equalizer.band_gains_db[9], 0.0);
    }

    #[test]
    fn test_agc_bounds_last_writer_wins() {
        let store = ParameterStore::default();

        // Lower bound set last: it yields to the upper bound
        store.set_agc_max_gain_db(0.0);
        let min = store.set_agc_min_gain_db(0.0);
        assert!(min < 0.0);

        // Upper bound set last: it is pushed above the lower bound
        store.set_agc_min_gain_db(-0.05);
        let p = store.current().agc;
        assert!(p.max_gain_db > p.min_gain_db);

        let whole = store.set_agc(AgcParams {
            max_gain_db: 0.0,
            min_gain_db: 0.0,
            ..AgcParams::default()
        });
        assert_eq!(whole.max_gain_db, 0.0);
        assert!(whole.min_gain_db < whole.max_gain_db);
    }

    #[test]
    fn test_invalid_preset_index_leaves_params() {
        let store = ParameterStore::default();
        store.apply_noise_preset(NoisePreset::Outdoor);
        let before = store.current().noise_canceller;

        assert!(!store.apply_noise_preset_index(7));
        assert_eq!(store.current().noise_canceller, before);

        assert!(store.apply_noise_preset_index(1));
        assert_eq!(store.current().noise_canceller.preset_id, NoisePreset::Voice);
    }

    #[test]
    fn test_presets_pass_through_sanitizer() {
        let store = ParameterStore::default();
        for preset in NoisePreset::all_presets() {
            let prev = store.current().noise_canceller;
            let applied = store.apply_noise_preset(preset);

            let mut s = Sanitizer::new();
            let expected = prev.with_preset(preset).sanitized(&prev, &mut s);
            assert_eq!(applied, expected, "{}", preset.name());
            assert_eq!(store.current().noise_canceller, applied);
            assert!(NC_UNIT_RANGE.contains(&applied.strength));
            assert!(NC_FLOOR_RANGE.contains(&applied.spectral_floor_db));
            assert!(NC_ATTACK_RANGE.contains(&applied.noise_attack_ms));
            assert!(NC_RELEASE_RANGE.contains(&applied.noise_release_ms));
            assert!(NC_RESIDUAL_RANGE.contains(&applied.residual_boost_db));
        }
        assert_eq!(store.sanitized_count(), 0);
    }

    #[test]
    fn test_load_sees_published_values() {
        let store = ParameterStore::default();
        store.set_stage_enabled(Stage::Compressor, true);
        store.set_eq_band_order(BandOrder::GainDescending);

        let seen = store.load(&ChainParams::default());
        assert!(seen.compressor.enabled);
        assert_eq!(seen.equalizer.band_order, BandOrder::GainDescending);
        assert_eq!(seen, store.current());
    }

    #[test]
    fn test_params_from_json_uses_defaults_for_missing_fields() {
        let p = ChainParams::from_json(r#"{ "compressor": { "enabled": true, "ratio": 2.0 } }"#)
            .unwrap()
            .validated();
        assert!(p.compressor.enabled);
        assert_eq!(p.compressor.ratio, 2.0);
        assert_eq!(p.compressor.threshold_db, -20.0);
        assert!(p.limiter.enabled);
    }
}
