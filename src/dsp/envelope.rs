//! Envelope Followers for the Dynamics Stages
//!
//! Shared time-domain level trackers used by the AGC, compressor and limiter.
//! Each follower works on a linked detector value (the frame's maximum
//! magnitude across channels), so one envelope drives every channel.
//!
//! # Design Notes
//! - Coefficients are recomputed only when the time constants change; the
//!   stages call `set_times_ms()` once per block with the current parameters
//! - **No Allocations**: Sample-accurate, deterministic, stack-only.
//!
//! # Followers
//! - **PeakFollower**: asymmetric attack/release on the rectified input.
//! - **RmsIntegrator**: leaky integrator of signal power over a window.

use crate::dsp::utils::{flush_denormal, lin_to_db, time_constant_coeff};

/// Asymmetric attack/release peak follower.
#[derive(Debug, Clone)]
pub struct PeakFollower {
    sample_rate: f32,
    attack_ms: f32,
    release_ms: f32,
    att_coeff: f32,
    rel_coeff: f32,
    state: f32,
}

impl PeakFollower {
    pub fn new(sample_rate: f32, attack_ms: f32, release_ms: f32) -> Self {
        Self {
            sample_rate,
            attack_ms,
            release_ms,
            att_coeff: time_constant_coeff(attack_ms, sample_rate),
            rel_coeff: time_constant_coeff(release_ms, sample_rate),
            state: 0.0,
        }
    }

    /// Update time constants; a no-op when nothing changed.
    pub fn set_times_ms(&mut self, attack_ms: f32, release_ms: f32) {
        if attack_ms != self.attack_ms {
            self.attack_ms = attack_ms;
            self.att_coeff = time_constant_coeff(attack_ms, self.sample_rate);
        }
        if release_ms != self.release_ms {
            self.release_ms = release_ms;
            self.rel_coeff = time_constant_coeff(release_ms, self.sample_rate);
        }
    }

    #[inline]
    pub fn process(&mut self, detector: f32) -> f32 {
        let x = detector.abs();
        let coeff = if x > self.state {
            self.att_coeff
        } else {
            self.rel_coeff
        };
        self.state = flush_denormal(coeff * self.state + (1.0 - coeff) * x);
        self.state
    }

    pub fn value(&self) -> f32 {
        self.state
    }

    pub fn value_db(&self) -> f32 {
        lin_to_db(self.state)
    }

    pub fn reset(&mut self) {
        self.state = 0.0;
    }
}

/// Leaky-integrator RMS estimate over a window expressed in seconds.
#[derive(Debug, Clone)]
pub struct RmsIntegrator {
    sample_rate: f32,
    window_s: f32,
    coeff: f32,
    power: f32,
}

impl RmsIntegrator {
    pub fn new(sample_rate: f32, window_s: f32) -> Self {
        let mut rms = Self {
            sample_rate,
            window_s: 0.0,
            coeff: 0.0,
            power: 0.0,
        };
        rms.set_window_s(window_s);
        rms
    }

    pub fn set_window_s(&mut self, window_s: f32) {
        if window_s == self.window_s {
            return;
        }
        self.window_s = window_s;
        let window_samples = (window_s * self.sample_rate).max(1.0);
        self.coeff = (-1.0 / window_samples).exp();
    }

    #[inline]
    pub fn process(&mut self, x: f32) -> f32 {
        self.power = flush_denormal(self.coeff * self.power + (1.0 - self.coeff) * x * x);
        // Protect against negative zero / NaN
        if !(self.power > 0.0) {
            self.power = 0.0;
        }
        self.power
    }

    pub fn rms(&self) -> f32 {
        self.power.sqrt()
    }

    pub fn level_db(&self) -> f32 {
        lin_to_db(self.rms())
    }

    pub fn reset(&mut self) {
        self.power = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_follower_attack_faster_than_release() {
        let mut f = PeakFollower::new(48000.0, 1.0, 100.0);
        for _ in 0..480 {
            f.process(1.0);
        }
        assert!(f.value() > 0.99);

        for _ in 0..480 {
            f.process(0.0);
        }
        // 10 ms into a 100 ms release we have lost only ~10%
        assert!(f.value() > 0.85 && f.value() < 0.95, "got {}", f.value());
    }

    #[test]
    fn test_rms_integrator_converges_to_sine_rms() {
        let sr = 48000.0;
        let mut rms = RmsIntegrator::new(sr, 0.05);
        for i in 0..48000 {
            let x = (2.0 * std::f32::consts::PI * 440.0 * i as f32 / sr).sin();
            rms.process(x);
        }
        assert!((rms.level_db() + 3.01).abs() < 0.2, "got {}", rms.level_db());
    }

    #[test]
    fn test_reset_clears_state() {
        let mut f = PeakFollower::new(48000.0, 1.0, 10.0);
        f.process(0.5);
        f.reset();
        assert_eq!(f.value(), 0.0);
    }
}
