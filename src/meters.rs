//! Telemetry for the control surface.
//!
//! The audio thread fills a [`TelemetrySnapshot`] once per block through the
//! [`TelemetryCollector`] and publishes it with a [`SnapshotCell`]. Counters
//! fed from outside the audio thread (xruns, I/O latency) live in plain
//! atomics and are merged in when the controller reads a snapshot.
//!
//! [`SnapshotCell`]: crate::snapshot::SnapshotCell

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::dsp::utils::{lin_to_db, METER_FLOOR_DB};
use crate::snapshot::{f32_word, word_f32, Packed};

/// Level reported before the first block has been processed.
pub const IDLE_LEVEL_DB: f32 = -60.0;

// Smoothing for the CPU load reading (per block).
// Increasing: faster but noisier reading; decreasing: steadier reading.
const CPU_EMA_ALPHA: f32 = 0.1;
// Smoothing for the latency EMA (per block).
const LATENCY_EMA_ALPHA: f32 = 0.05;

/// Lock-free f32 cell (bit pattern in an `AtomicU32`).
#[derive(Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(val: f32) -> Self {
        Self(AtomicU32::new(val.to_bits()))
    }

    pub fn set(&self, val: f32) {
        self.0.store(val.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Read-mostly view of the chain, recomputed every block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub peak_db: f32,
    pub rms_db: f32,
    pub agc_current_gain_db: f32,
    pub agc_current_level_db: f32,
    pub compressor_gain_reduction_db: f32,
    pub limiter_gain_reduction_db: f32,
    pub noise_floor_db: f32,
    pub cpu_usage_percent: f32,
    pub latency_input_ms: f32,
    pub latency_output_ms: f32,
    pub latency_total_ms: f32,
    pub latency_ema_ms: f32,
    pub latency_min_ms: f32,
    pub latency_max_ms: f32,
    #[serde(rename = "xRunCount")]
    pub xrun_count: u64,
    pub callback_size_frames: u32,
    pub non_finite_block_count: u64,
    pub sanitized_param_count: u64,
    pub noise_canceller_cpu_ms: f32,
    pub processing_latency_ms: f32,
    pub stage_memory_bytes: u64,
    pub running: bool,
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self {
            peak_db: IDLE_LEVEL_DB,
            rms_db: IDLE_LEVEL_DB,
            agc_current_gain_db: 0.0,
            agc_current_level_db: IDLE_LEVEL_DB,
            compressor_gain_reduction_db: 0.0,
            limiter_gain_reduction_db: 0.0,
            noise_floor_db: IDLE_LEVEL_DB,
            cpu_usage_percent: 0.0,
            latency_input_ms: 0.0,
            latency_output_ms: 0.0,
            latency_total_ms: 0.0,
            latency_ema_ms: 0.0,
            latency_min_ms: 0.0,
            latency_max_ms: 0.0,
            xrun_count: 0,
            callback_size_frames: 0,
            non_finite_block_count: 0,
            sanitized_param_count: 0,
            noise_canceller_cpu_ms: 0.0,
            processing_latency_ms: 0.0,
            stage_memory_bytes: 0,
            running: false,
        }
    }
}

pub const TELEMETRY_WORDS: usize = 21;

fn split_u64(v: u64) -> (u32, u32) {
    (v as u32, (v >> 32) as u32)
}

fn join_u64(lo: u32, hi: u32) -> u64 {
    u64::from(lo) | (u64::from(hi) << 32)
}

// xrun_count, sanitized_param_count and running are merged in by the reader.
impl Packed<TELEMETRY_WORDS> for TelemetrySnapshot {
    fn pack(&self) -> [u32; TELEMETRY_WORDS] {
        let (nf_lo, nf_hi) = split_u64(self.non_finite_block_count);
        let (mem_lo, mem_hi) = split_u64(self.stage_memory_bytes);
        [
            f32_word(self.peak_db),
            f32_word(self.rms_db),
            f32_word(self.agc_current_gain_db),
            f32_word(self.agc_current_level_db),
            f32_word(self.compressor_gain_reduction_db),
            f32_word(self.limiter_gain_reduction_db),
            f32_word(self.noise_floor_db),
            f32_word(self.cpu_usage_percent),
            f32_word(self.latency_input_ms),
            f32_word(self.latency_output_ms),
            f32_word(self.latency_total_ms),
            f32_word(self.latency_ema_ms),
            f32_word(self.latency_min_ms),
            f32_word(self.latency_max_ms),
            self.callback_size_frames,
            nf_lo,
            nf_hi,
            f32_word(self.noise_canceller_cpu_ms),
            f32_word(self.processing_latency_ms),
            mem_lo,
            mem_hi,
        ]
    }

    fn unpack(w: &[u32; TELEMETRY_WORDS]) -> Self {
        Self {
            peak_db: word_f32(w[0]),
            rms_db: word_f32(w[1]),
            agc_current_gain_db: word_f32(w[2]),
            agc_current_level_db: word_f32(w[3]),
            compressor_gain_reduction_db: word_f32(w[4]),
            limiter_gain_reduction_db: word_f32(w[5]),
            noise_floor_db: word_f32(w[6]),
            cpu_usage_percent: word_f32(w[7]),
            latency_input_ms: word_f32(w[8]),
            latency_output_ms: word_f32(w[9]),
            latency_total_ms: word_f32(w[10]),
            latency_ema_ms: word_f32(w[11]),
            latency_min_ms: word_f32(w[12]),
            latency_max_ms: word_f32(w[13]),
            callback_size_frames: w[14],
            non_finite_block_count: join_u64(w[15], w[16]),
            noise_canceller_cpu_ms: word_f32(w[17]),
            processing_latency_ms: word_f32(w[18]),
            stage_memory_bytes: join_u64(w[19], w[20]),
            xrun_count: 0,
            sanitized_param_count: 0,
            running: false,
        }
    }
}

/// Per-block readings gathered by the orchestrator.
pub struct BlockReadings<'a> {
    pub output: &'a [f32],
    pub frames: usize,
    pub elapsed: Duration,
    pub nc_elapsed: Duration,
    pub agc_gain_db: f32,
    pub agc_level_db: f32,
    pub compressor_gr_db: f32,
    pub limiter_gr_db: f32,
    pub noise_floor_db: f32,
    pub io_input_ms: f32,
    pub io_output_ms: f32,
    pub processing_latency_ms: f32,
    pub stage_memory_bytes: u64,
}

/// Audio-thread accumulator behind the published snapshot.
pub struct TelemetryCollector {
    sample_rate: f32,
    cpu_ema: f32,
    latency_ema: f32,
    latency_min: f32,
    latency_max: f32,
    latency_seen: bool,
    non_finite_blocks: u64,
    last: TelemetrySnapshot,
}

impl TelemetryCollector {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate,
            cpu_ema: 0.0,
            latency_ema: 0.0,
            latency_min: 0.0,
            latency_max: 0.0,
            latency_seen: false,
            non_finite_blocks: 0,
            last: TelemetrySnapshot::default(),
        }
    }

    /// Forget statistics from a previous run. The non-finite counter is
    /// cumulative for the lifetime of the chain.
    pub fn reset(&mut self) {
        let non_finite_blocks = self.non_finite_blocks;
        *self = Self::new(self.sample_rate);
        self.non_finite_blocks = non_finite_blocks;
        self.last.non_finite_block_count = non_finite_blocks;
    }

    pub fn note_non_finite_block(&mut self) {
        self.non_finite_blocks += 1;
    }

    pub fn non_finite_blocks(&self) -> u64 {
        self.non_finite_blocks
    }

    pub fn last(&self) -> &TelemetrySnapshot {
        &self.last
    }

    pub fn finish_block(&mut self, r: &BlockReadings<'_>) -> TelemetrySnapshot {
        let mut peak = 0.0f32;
        let mut sum_sq = 0.0f32;
        for &s in r.output {
            peak = peak.max(s.abs());
            sum_sq += s * s;
        }
        let rms = (sum_sq / r.output.len().max(1) as f32).sqrt();

        // CPU load as a share of the block's real-time budget
        let budget_s = r.frames as f32 / self.sample_rate;
        if budget_s > 0.0 {
            let load = 100.0 * r.elapsed.as_secs_f32() / budget_s;
            self.cpu_ema += CPU_EMA_ALPHA * (load - self.cpu_ema);
        }

        let total = r.io_input_ms + r.io_output_ms + r.processing_latency_ms;
        if self.latency_seen {
            self.latency_ema += LATENCY_EMA_ALPHA * (total - self.latency_ema);
            self.latency_min = self.latency_min.min(total);
            self.latency_max = self.latency_max.max(total);
        } else {
            self.latency_ema = total;
            self.latency_min = total;
            self.latency_max = total;
            self.latency_seen = true;
        }

        let level_floor = |db: f32| if db.is_finite() { db } else { METER_FLOOR_DB };

        self.last = TelemetrySnapshot {
            peak_db: lin_to_db(peak),
            rms_db: lin_to_db(rms),
            agc_current_gain_db: r.agc_gain_db,
            agc_current_level_db: level_floor(r.agc_level_db),
            compressor_gain_reduction_db: r.compressor_gr_db.max(0.0),
            limiter_gain_reduction_db: r.limiter_gr_db.max(0.0),
            noise_floor_db: level_floor(r.noise_floor_db).min(0.0),
            cpu_usage_percent: self.cpu_ema,
            latency_input_ms: r.io_input_ms,
            latency_output_ms: r.io_output_ms,
            latency_total_ms: total,
            latency_ema_ms: self.latency_ema,
            latency_min_ms: self.latency_min,
            latency_max_ms: self.latency_max,
            xrun_count: 0,
            callback_size_frames: u32::try_from(r.frames).unwrap_or(u32::MAX),
            non_finite_block_count: self.non_finite_blocks,
            sanitized_param_count: 0,
            noise_canceller_cpu_ms: r.nc_elapsed.as_secs_f32() * 1000.0,
            processing_latency_ms: r.processing_latency_ms,
            stage_memory_bytes: r.stage_memory_bytes,
            running: true,
        };
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readings(output: &[f32], io_in: f32) -> BlockReadings<'_> {
        BlockReadings {
            output,
            frames: output.len(),
            elapsed: Duration::from_micros(100),
            nc_elapsed: Duration::ZERO,
            agc_gain_db: 3.0,
            agc_level_db: -30.0,
            compressor_gr_db: 1.5,
            limiter_gr_db: 0.0,
            noise_floor_db: -70.0,
            io_input_ms: io_in,
            io_output_ms: 5.0,
            processing_latency_ms: 0.0,
            stage_memory_bytes: 4096,
        }
    }

    #[test]
    fn test_defaults_before_first_block() {
        let t = TelemetrySnapshot::default();
        assert_eq!(t.agc_current_gain_db, 0.0);
        assert_eq!(t.peak_db, IDLE_LEVEL_DB);
        assert_eq!(t.xrun_count, 0);
    }

    #[test]
    fn test_levels_and_latency_stats() {
        let mut c = TelemetryCollector::new(48000.0);
        let block = vec![0.5; 480];

        let t = c.finish_block(&readings(&block, 5.0));
        assert!((t.peak_db + 6.02).abs() < 0.01);
        assert!((t.rms_db + 6.02).abs() < 0.01);
        assert_eq!(t.latency_total_ms, 10.0);
        assert_eq!(t.callback_size_frames, 480);

        let t = c.finish_block(&readings(&block, 15.0));
        assert_eq!(t.latency_min_ms, 10.0);
        assert_eq!(t.latency_max_ms, 20.0);
        assert!(t.latency_ema_ms > 10.0 && t.latency_ema_ms < 20.0);
        assert!(t.cpu_usage_percent > 0.0);
    }

    #[test]
    fn test_pack_keeps_counters() {
        let t = TelemetrySnapshot {
            non_finite_block_count: (1u64 << 33) + 5,
            stage_memory_bytes: 123_456,
            ..TelemetrySnapshot::default()
        };
        let back = TelemetrySnapshot::unpack(&t.pack());
        assert_eq!(back, t);
    }
}
