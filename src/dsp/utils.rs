//! Shared DSP math helpers.
//!
//! Everything here is allocation-free except the window builders, which are
//! only called while a stage is being (re)allocated.

use std::f32::consts::PI;

/// Smallest linear magnitude considered when converting to dB.
pub const DB_EPS: f32 = 1e-6;

/// Magnitude floor for spectral bins.
pub const MAG_FLOOR: f32 = 1e-12;

/// Floor used by every dB reading published to the control surface.
pub const METER_FLOOR_DB: f32 = -120.0;

/// State values below this are flushed to zero.
const DENORMAL_THRESHOLD: f32 = 1e-20;

pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t.clamp(0.0, 1.0)
}

#[inline]
pub fn db_to_lin(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Linear magnitude to dB, floored at [`METER_FLOOR_DB`].
#[inline]
pub fn lin_to_db(lin: f32) -> f32 {
    (20.0 * lin.abs().max(DB_EPS).log10()).max(METER_FLOOR_DB)
}

/// Power (squared magnitude) to dB, floored at [`METER_FLOOR_DB`].
#[inline]
pub fn power_to_db(power: f32) -> f32 {
    if power <= 0.0 || !power.is_finite() {
        return METER_FLOOR_DB;
    }
    (10.0 * power.log10()).max(METER_FLOOR_DB)
}

/// One-pole smoothing coefficient for a time constant in milliseconds.
#[inline]
pub fn time_constant_coeff(time_ms: f32, sample_rate: f32) -> f32 {
    let samples = (time_ms.max(1e-3) * 0.001 * sample_rate).max(1e-3);
    (-1.0 / samples).exp()
}

#[inline]
pub fn flush_denormal(x: f32) -> f32 {
    if x.abs() < DENORMAL_THRESHOLD {
        0.0
    } else {
        x
    }
}

/// Square-root Hann window: used for both analysis and synthesis so the
/// product is a Hann window that overlap-adds to a constant.
pub fn make_sqrt_hann_window(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| {
            let phase = 2.0 * PI * i as f32 / len as f32;
            (0.5 - 0.5 * phase.cos()).max(0.0).sqrt()
        })
        .collect()
}

pub fn frame_rms(x: &[f32]) -> f32 {
    let mut s = 0.0f32;
    for &v in x {
        s += v * v;
    }
    (s / (x.len().max(1) as f32)).sqrt()
}

/// Maximum magnitude across the channels of one interleaved frame.
#[inline]
pub fn frame_max_abs(frame: &[f32]) -> f32 {
    let mut m = 0.0f32;
    for &v in frame {
        m = m.max(v.abs());
    }
    m
}

#[inline]
pub fn all_finite(x: &[f32]) -> bool {
    x.iter().all(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_conversions() {
        assert!((db_to_lin(0.0) - 1.0).abs() < 1e-7);
        assert!((db_to_lin(-20.0) - 0.1).abs() < 1e-6);
        assert!((lin_to_db(0.5) + 6.0206).abs() < 1e-3);
        assert!(lin_to_db(0.0) <= METER_FLOOR_DB + 1e-3);
        assert_eq!(power_to_db(f32::NAN), METER_FLOOR_DB);
    }

    #[test]
    fn test_sqrt_hann_overlap_adds_to_constant() {
        let n = 512;
        let hop = 128;
        let w = make_sqrt_hann_window(n);
        for i in 0..hop {
            let mut sum = 0.0;
            let mut k = i;
            while k < n {
                sum += w[k] * w[k];
                k += hop;
            }
            assert!((sum - 2.0).abs() < 1e-4, "sum {} at {}", sum, i);
        }
    }

    #[test]
    fn test_time_constant_coeff_is_monotonic() {
        let fast = time_constant_coeff(1.0, 48000.0);
        let slow = time_constant_coeff(100.0, 48000.0);
        assert!(fast < slow);
        assert!(slow < 1.0 && fast > 0.0);
    }
}
