//! Output Limiter
//!
//! # Perceptual Contract
//! - **Target Source**: Final output signal.
//! - **Intended Effect**: Guarantee no sample exceeds `10^(threshold_db/20)`.
//! - **Failure Modes**:
//!   - Audible distortion/crunch if driven too hard (>6dB gain reduction).
//! - **Will Not Do**:
//!   - Color the sound below the ceiling.
//!   - Provide "glue" compression (this is purely for safety).
//!
//! # Lifecycle
//! - **Active**: Normal operation. Always the last stage of the chain.
//! - **Bypassed**: Passes audio through (unsafe!).
//!
//! # Design Notes
//! - Attack is instantaneous: the gain drops to the required value on the
//!   sample that needs it. Release is a one-pole recovery.
//! - A final hard clamp to the ceiling absorbs floating-point rounding.
//! - `lookahead_ms` is accepted and ignored.

use crate::dsp::utils::{frame_max_abs, lin_to_db, time_constant_coeff};
use crate::params::LimiterParams;

pub struct Limiter {
    sample_rate: f32,
    channels: usize,
    release_ms: f32,
    release_coeff: f32,
    gain: f32,
    gain_reduction_db: f32,
}

impl Limiter {
    pub fn new(sample_rate: f32, channels: usize) -> Self {
        let release_ms = LimiterParams::default().release_ms;
        Self {
            sample_rate,
            channels: channels.max(1),
            release_ms,
            release_coeff: time_constant_coeff(release_ms, sample_rate),
            gain: 1.0,
            gain_reduction_db: 0.0,
        }
    }

    pub fn apply(&mut self, block: &mut [f32], params: &LimiterParams) {
        if !params.enabled {
            return;
        }

        if params.release_ms != self.release_ms {
            self.release_ms = params.release_ms;
            self.release_coeff = time_constant_coeff(params.release_ms, self.sample_rate);
        }

        let ceiling = 10.0_f32.powf(params.threshold_db.min(0.0) / 20.0);
        let mut min_gain = 1.0f32;

        for frame in block.chunks_exact_mut(self.channels) {
            let peak = frame_max_abs(frame);
            let required = if peak > ceiling { ceiling / peak } else { 1.0 };

            if required < self.gain {
                self.gain = required;
            } else {
                self.gain = self.release_coeff * self.gain + (1.0 - self.release_coeff) * required;
            }
            min_gain = min_gain.min(self.gain);

            if self.gain < 1.0 {
                for s in frame.iter_mut() {
                    *s *= self.gain;
                }
            }
            for s in frame.iter_mut() {
                *s = s.clamp(-ceiling, ceiling);
            }
        }

        self.gain_reduction_db = (-lin_to_db(min_gain)).max(0.0);
    }

    /// Largest reduction applied in the last block (dB, >= 0).
    pub fn gain_reduction_db(&self) -> f32 {
        self.gain_reduction_db
    }

    pub fn reset(&mut self) {
        self.gain = 1.0;
        self.gain_reduction_db = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 48000.0;

    #[test]
    fn test_hot_sine_never_exceeds_ceiling() {
        let mut lim = Limiter::new(SR, 2);
        let params = LimiterParams {
            threshold_db: -1.0,
            ..LimiterParams::default()
        };
        let ceiling = 10.0_f32.powf(-1.0 / 20.0);

        // +6 dBFS burst, interleaved stereo
        let amp = 10.0_f32.powf(6.0 / 20.0);
        let mut block: Vec<f32> = (0..4800)
            .flat_map(|i| {
                let x = amp * (2.0 * std::f32::consts::PI * 997.0 * i as f32 / SR).sin();
                [x, -0.5 * x]
            })
            .collect();

        for chunk in block.chunks_mut(256) {
            lim.apply(chunk, &params);
            assert!(lim.gain_reduction_db() >= 0.0);
        }
        assert!(block.iter().all(|s| s.abs() <= ceiling));
        assert!(lim.gain_reduction_db() > 6.0);
    }

    #[test]
    fn test_single_sample_transient() {
        let mut lim = Limiter::new(SR, 1);
        let params = LimiterParams {
            threshold_db: -6.0,
            ..LimiterParams::default()
        };
        let mut block = vec![0.0; 64];
        block[10] = 100.0;
        lim.apply(&mut block, &params);
        assert!(block[10] <= 10.0_f32.powf(-6.0 / 20.0));
    }

    #[test]
    fn test_quiet_signal_untouched() {
        let mut lim = Limiter::new(SR, 1);
        let input: Vec<f32> = (0..512).map(|i| 0.3 * (i as f32 * 0.05).sin()).collect();
        let mut out = input.clone();
        lim.apply(&mut out, &LimiterParams::default());
        assert_eq!(out, input);
        assert_eq!(lim.gain_reduction_db(), 0.0);
    }

    #[test]
    fn test_lookahead_is_accepted() {
        let mut lim = Limiter::new(SR, 1);
        let params = LimiterParams {
            lookahead_ms: 5.0,
            ..LimiterParams::default()
        };
        let mut block = vec![2.0; 32];
        lim.apply(&mut block, &params);
        assert!(block.iter().all(|s| s.abs() <= 1.0));
    }
}
