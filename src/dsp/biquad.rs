//! Biquad Filter Implementation (IIR 2nd Order)
//!
//! Second-order recursive sections used by the equalizer. Coefficients live in
//! their own `Copy` type so a stage can compute them once, cache them, and
//! hand them to any number of per-channel delay lines.
//!
//! # Design Notes
//! - Transposed direct form II, one multiply-add chain per sample
//! - Coefficient updates never touch the delay line; call `reset_state()`
//!   explicitly when the signal path changes underneath the filter
//! - All operations are safe for the audio thread (no allocations)

use std::f32::consts::PI;

use crate::dsp::utils::flush_denormal;

/// Gains closer to 0 dB than this produce exact unity coefficients.
const FLAT_GAIN_EPS_DB: f32 = 0.01;

/// Normalised biquad coefficients (`a*` feed-forward, `b*` feedback).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub a0: f32,
    pub a1: f32,
    pub a2: f32,
    pub b1: f32,
    pub b2: f32,
}

impl Default for BiquadCoeffs {
    fn default() -> Self {
        Self::unity()
    }
}

impl BiquadCoeffs {
    pub const fn unity() -> Self {
        Self {
            a0: 1.0,
            a1: 0.0,
            a2: 0.0,
            b1: 0.0,
            b2: 0.0,
        }
    }

    pub fn is_unity(&self) -> bool {
        *self == Self::unity()
    }

    fn normalized(b0: f32, b1: f32, b2: f32, a0: f32, a1: f32, a2: f32) -> Self {
        let inv_a0 = 1.0 / a0;
        Self {
            a0: b0 * inv_a0,
            a1: b1 * inv_a0,
            a2: b2 * inv_a0,
            b1: a1 * inv_a0,
            b2: a2 * inv_a0,
        }
    }

    // ---------------------------------------------------------------------
    // Filter design helpers (RBJ-style)
    // ---------------------------------------------------------------------

    pub fn hpf(cutoff: f32, q: f32, sr: f32) -> Self {
        let w0 = 2.0 * PI * cutoff / sr;
        let alpha = w0.sin() / (2.0 * q.max(1e-6));
        let cw0 = w0.cos();

        Self::normalized(
            (1.0 + cw0) * 0.5,
            -(1.0 + cw0),
            (1.0 + cw0) * 0.5,
            1.0 + alpha,
            -2.0 * cw0,
            1.0 - alpha,
        )
    }

    pub fn lpf(cutoff: f32, q: f32, sr: f32) -> Self {
        let w0 = 2.0 * PI * cutoff / sr;
        let alpha = w0.sin() / (2.0 * q.max(1e-6));
        let cw0 = w0.cos();

        Self::normalized(
            (1.0 - cw0) * 0.5,
            1.0 - cw0,
            (1.0 - cw0) * 0.5,
            1.0 + alpha,
            -2.0 * cw0,
            1.0 - alpha,
        )
    }

    pub fn low_shelf(cutoff: f32, q: f32, gain_db: f32, sr: f32) -> Self {
        // Bypass when effectively flat
        if gain_db.abs() < FLAT_GAIN_EPS_DB {
            return Self::unity();
        }

        let a = 10.0_f32.powf(gain_db / 40.0);
        let w0 = 2.0 * PI * cutoff / sr;
        let alpha = w0.sin() / (2.0 * q.max(1e-6));
        let cw0 = w0.cos();
        let sqrt_a = a.sqrt();

        Self::normalized(
            a * ((a + 1.0) - (a - 1.0) * cw0 + 2.0 * sqrt_a * alpha),
            2.0 * a * ((a - 1.0) - (a + 1.0) * cw0),
            a * ((a + 1.0) - (a - 1.0) * cw0 - 2.0 * sqrt_a * alpha),
            (a + 1.0) + (a - 1.0) * cw0 + 2.0 * sqrt_a * alpha,
            -2.0 * ((a - 1.0) + (a + 1.0) * cw0),
            (a + 1.0) + (a - 1.0) * cw0 - 2.0 * sqrt_a * alpha,
        )
    }

    pub fn high_shelf(cutoff: f32, q: f32, gain_db: f32, sr: f32) -> Self {
        if gain_db.abs() < FLAT_GAIN_EPS_DB {
            return Self::unity();
        }

        let a = 10.0_f32.powf(gain_db / 40.0);
        let w0 = 2.0 * PI * cutoff / sr;
        let alpha = w0.sin() / (2.0 * q.max(1e-6));
        let cw0 = w0.cos();
        let sqrt_a = a.sqrt();

        Self::normalized(
            a * ((a + 1.0) + (a - 1.0) * cw0 + 2.0 * sqrt_a * alpha),
            -2.0 * a * ((a - 1.0) + (a + 1.0) * cw0),
            a * ((a + 1.0) + (a - 1.0) * cw0 - 2.0 * sqrt_a * alpha),
            (a + 1.0) - (a - 1.0) * cw0 + 2.0 * sqrt_a * alpha,
            2.0 * ((a - 1.0) - (a + 1.0) * cw0),
            (a + 1.0) - (a - 1.0) * cw0 - 2.0 * sqrt_a * alpha,
        )
    }

    pub fn peaking(center: f32, q: f32, gain_db: f32, sr: f32) -> Self {
        if gain_db.abs() < FLAT_GAIN_EPS_DB {
            return Self::unity();
        }

        let a = 10.0_f32.powf(gain_db / 40.0);
        let w0 = 2.0 * PI * center / sr;
        let alpha = w0.sin() / (2.0 * q.max(1e-6));
        let cw0 = w0.cos();

        Self::normalized(
            1.0 + alpha * a,
            -2.0 * cw0,
            1.0 - alpha * a,
            1.0 + alpha / a,
            -2.0 * cw0,
            1.0 - alpha / a,
        )
    }

    /// Magnitude response in dB at `freq`, used by tests and diagnostics.
    pub fn magnitude_db(&self, freq: f32, sr: f32) -> f32 {
        let w = 2.0 * PI * freq / sr;
        let (c1, s1) = (w.cos(), w.sin());
        let (c2, s2) = ((2.0 * w).cos(), (2.0 * w).sin());

        let num_re = self.a0 + self.a1 * c1 + self.a2 * c2;
        let num_im = -(self.a1 * s1 + self.a2 * s2);
        let den_re = 1.0 + self.b1 * c1 + self.b2 * c2;
        let den_im = -(self.b1 * s1 + self.b2 * s2);

        let num = (num_re * num_re + num_im * num_im).sqrt();
        let den = (den_re * den_re + den_im * den_im).sqrt().max(1e-12);
        20.0 * (num / den).max(1e-12).log10()
    }
}

/// Biquad delay line running a set of coefficients.
#[derive(Debug, Clone, Copy, Default)]
pub struct Biquad {
    coeffs: BiquadCoeffs,
    z1: f32,
    z2: f32,
}

impl Biquad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_coeffs(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            z1: 0.0,
            z2: 0.0,
        }
    }

    /// Process a single sample
    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let c = &self.coeffs;
        let out = input * c.a0 + self.z1;

        self.z1 = flush_denormal(input * c.a1 + self.z2 - c.b1 * out);
        self.z2 = flush_denormal(input * c.a2 - c.b2 * out);

        out
    }

    /// Replace the coefficients, keeping the delay line.
    #[inline]
    pub fn set_coeffs(&mut self, coeffs: BiquadCoeffs) {
        self.coeffs = coeffs;
    }

    /// Explicitly clear filter delay state.
    ///
    /// This is NOT called by coefficient updates.
    #[inline]
    pub fn reset_state(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }

    /// True when the delay line holds energy from earlier samples.
    pub fn has_state(&self) -> bool {
        self.z1 != 0.0 || self.z2 != 0.0
    }
}
