//! Linked Feed-Forward Compressor
//!
//! # Perceptual Contract
//! - **Target Source**: Speech after noise cancellation.
//! - **Intended Effect**: Reduce dynamic range above `threshold_db` with a
//!   smooth knee, then restore level with makeup gain.
//! - **Failure Modes**:
//!   - "Pumping" if release is too fast for the gain reduction amount.
//! - **Will Not Do**:
//!   - Brickwall limiting (handled by Limiter).
//!
//! # Lifecycle
//! - **Active**: Normal operation.
//! - **Bypassed**: Passes audio through bit-identically.
//!
//! # Detector
//! One peak envelope over the frame's maximum magnitude drives every channel.
//! Ratio 1:1 produces zero gain reduction, so with 0 dB makeup the stage is
//! an exact unity multiply.

use crate::dsp::envelope::PeakFollower;
use crate::dsp::utils::{db_to_lin, frame_max_abs};
use crate::params::CompressorParams;

// Half scalar used in knee computation.
// Must not change: knee math relies on 0.5.
const HALF: f32 = 0.5;

pub struct Compressor {
    channels: usize,
    envelope: PeakFollower,
    gain_reduction_db: f32,
}

impl Compressor {
    pub fn new(sample_rate: f32, channels: usize) -> Self {
        let defaults = CompressorParams::default();
        Self {
            channels: channels.max(1),
            envelope: PeakFollower::new(sample_rate, defaults.attack_ms, defaults.release_ms),
            gain_reduction_db: 0.0,
        }
    }

    /// Static gain computer: reduction in dB (>= 0) for a level `over_db`
    /// relative to the threshold.
    #[inline]
    pub fn soft_knee(over_db: f32, ratio: f32, knee_db: f32) -> f32 {
        let slope = 1.0 - 1.0 / ratio.max(1.0);
        if knee_db <= 0.0 {
            return over_db.max(0.0) * slope;
        }

        let half = HALF * knee_db;
        if over_db <= -half {
            0.0
        } else if over_db >= half {
            over_db * slope
        } else {
            let x = over_db + half;
            (x * x) / (2.0 * knee_db) * slope
        }
    }

    pub fn apply(&mut self, block: &mut [f32], params: &CompressorParams) {
        if !params.enabled {
            return;
        }

        self.envelope
            .set_times_ms(params.attack_ms, params.release_ms);

        let makeup_db = params.makeup_gain_db;
        let mut block_gr = 0.0f32;

        for frame in block.chunks_exact_mut(self.channels) {
            self.envelope.process(frame_max_abs(frame));
            let over_db = self.envelope.value_db() - params.threshold_db;
            let gr = Self::soft_knee(over_db, params.ratio, params.knee_db).max(0.0);
            block_gr = block_gr.max(gr);

            let total_db = makeup_db - gr;
            if total_db == 0.0 {
                continue;
            }
            let g = db_to_lin(total_db);
            for s in frame.iter_mut() {
                *s *= g;
            }
        }

        self.gain_reduction_db = block_gr;
    }

    /// Largest reduction applied in the last block (dB, >= 0).
    pub fn gain_reduction_db(&self) -> f32 {
        self.gain_reduction_db
    }

    pub fn reset(&mut self) {
        self.envelope.reset();
        self.gain_reduction_db = 0.0;
    }
}
