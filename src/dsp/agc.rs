//! Automatic Gain Control
//!
//! # Perceptual Contract
//! - **Target Source**: Raw microphone input with unknown level.
//! - **Intended Effect**: Bring speech to `target_level_db` within the
//!   configured gain bounds.
//! - **Failure Modes**:
//!   - Slow swell after a long pause if attack is very slow.
//! - **Will Not Do**:
//!   - Adapt on silence or room tone (adaptation freezes below
//!     `noise_threshold_db`).
//!
//! # Time Constants
//! Attack governs how fast gain is *increased*, release how fast it is
//! *decreased*. Both are one-pole smoothers running per frame on the gain in
//! dB, so the applied gain always lies on the path between the old value and
//! the clamped target.

use crate::dsp::envelope::RmsIntegrator;
use crate::dsp::utils::{db_to_lin, frame_max_abs, time_constant_coeff};
use crate::params::AgcParams;

/// Reported input level before any audio has been measured.
pub const AGC_IDLE_LEVEL_DB: f32 = -60.0;

pub struct Agc {
    sample_rate: f32,
    channels: usize,
    level: RmsIntegrator,

    attack_s: f32,
    release_s: f32,
    attack_coeff: f32,
    release_coeff: f32,

    gain_db: f32,
    level_db: f32,
}

impl Agc {
    pub fn new(sample_rate: f32, channels: usize) -> Self {
        let defaults = AgcParams::default();
        let mut agc = Self {
            sample_rate,
            channels: channels.max(1),
            level: RmsIntegrator::new(sample_rate, defaults.window_size_s),
            attack_s: 0.0,
            release_s: 0.0,
            attack_coeff: 0.0,
            release_coeff: 0.0,
            gain_db: 0.0,
            level_db: AGC_IDLE_LEVEL_DB,
        };
        agc.update_times(defaults.attack_time_s, defaults.release_time_s);
        agc
    }

    fn update_times(&mut self, attack_s: f32, release_s: f32) {
        if attack_s != self.attack_s {
            self.attack_s = attack_s;
            self.attack_coeff = time_constant_coeff(attack_s * 1000.0, self.sample_rate);
        }
        if release_s != self.release_s {
            self.release_s = release_s;
            self.release_coeff = time_constant_coeff(release_s * 1000.0, self.sample_rate);
        }
    }

    pub fn apply(&mut self, block: &mut [f32], params: &AgcParams) {
        if !params.enabled {
            return;
        }

        // Inverted bounds: leave the block alone rather than invert the gain
        let (min_db, max_db) = (params.min_gain_db, params.max_gain_db);
        if !(max_db > min_db) {
            return;
        }

        self.update_times(params.attack_time_s, params.release_time_s);
        self.level.set_window_s(params.window_size_s);

        for frame in block.chunks_exact_mut(self.channels) {
            self.level.process(frame_max_abs(frame));
            self.level_db = self.level.level_db();

            if self.level_db >= params.noise_threshold_db {
                let desired = (params.target_level_db - self.level_db).clamp(min_db, max_db);
                let coeff = if desired > self.gain_db {
                    self.attack_coeff
                } else {
                    self.release_coeff
                };
                self.gain_db = coeff * self.gain_db + (1.0 - coeff) * desired;
            }

            // Bounds may have moved since the last block
            self.gain_db = self.gain_db.clamp(min_db, max_db);

            let g = db_to_lin(self.gain_db);
            for s in frame.iter_mut() {
                *s *= g;
            }
        }
    }

    pub fn current_gain_db(&self) -> f32 {
        self.gain_db
    }

    pub fn current_level_db(&self) -> f32 {
        self.level_db
    }

    pub fn reset(&mut self) {
        self.level.reset();
        self.gain_db = 0.0;
        self.level_db = AGC_IDLE_LEVEL_DB;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 48000.0;

    fn tone(amp: f32, len: usize, offset: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amp * (2.0 * std::f32::consts::PI * 220.0 * (i + offset) as f32 / SR).sin())
            .collect()
    }

    fn params() -> AgcParams {
        AgcParams {
            enabled: true,
            target_level_db: -20.0,
            max_gain_db: 25.0,
            min_gain_db: -10.0,
            attack_time_s: 0.2,
            release_time_s: 0.1,
            noise_threshold_db: -60.0,
            window_size_s: 0.1,
        }
    }

    #[test]
    fn test_quiet_tone_converges_to_target() {
        let mut agc = Agc::new(SR, 1);
        // RMS of -40 dBFS
        let amp = 0.01 * std::f32::consts::SQRT_2;
        let p = params();

        for b in 0..(5 * 48000 / 480) {
            let mut block = tone(amp, 480, b * 480);
            agc.apply(&mut block, &p);
            let g = agc.current_gain_db();
            assert!(g >= p.min_gain_db && g <= p.max_gain_db);
        }
        assert!((agc.current_gain_db() - 20.0).abs() < 1.0, "got {}", agc.current_gain_db());
        assert!((agc.current_level_db() + 40.0).abs() < 0.5);
    }

    #[test]
    fn test_gain_clamped_to_max() {
        let mut agc = Agc::new(SR, 1);
        let p = AgcParams {
            max_gain_db: 10.0,
            ..params()
        };
        let amp = 0.01 * std::f32::consts::SQRT_2;
        for b in 0..400 {
            let mut block = tone(amp, 480, b * 480);
            agc.apply(&mut block, &p);
        }
        assert!(agc.current_gain_db() <= 10.0);
        assert!(agc.current_gain_db() > 9.0);
    }

    #[test]
    fn test_adaptation_freezes_below_noise_threshold() {
        let mut agc = Agc::new(SR, 1);
        let p = AgcParams {
            noise_threshold_db: -50.0,
            ..params()
        };
        // -70 dBFS tone sits below the threshold
        let amp = 0.000316 * std::f32::consts::SQRT_2;
        for b in 0..200 {
            let mut block = tone(amp, 480, b * 480);
            agc.apply(&mut block, &p);
        }
        assert_eq!(agc.current_gain_db(), 0.0);
    }

    #[test]
    fn test_disabled_is_bit_identical() {
        let mut agc = Agc::new(SR, 2);
        let input = tone(0.3, 512, 0);
        let mut out = input.clone();
        agc.apply(&mut out, &AgcParams::default());
        assert_eq!(out, input);
    }
}
