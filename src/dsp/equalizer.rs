//! 10-Band Graphic Equalizer
//!
//! # Perceptual Contract
//! - **Target Source**: Voice after level normalisation.
//! - **Intended Effect**: Static tonal shaping with fixed ISO-style centers.
//! - **Failure Modes**:
//!   - Zipper noise if gains are swept very fast with coefficient caching off.
//!   - A click when the cascade order changes (delay lines are cleared).
//! - **Will Not Do**:
//!   - Dynamic or level-dependent EQ.
//!
//! # Lifecycle
//! - **Active**: One peaking biquad per band, cascaded per channel.
//! - **Bypassed**: Block is left untouched.
//!
//! # Coefficient Caching
//! With `precalc_coefficients` on, coefficients are recomputed only when a
//! band gain differs from the cached vector. With it off they are recomputed
//! at the top of every block.

use crate::dsp::biquad::{Biquad, BiquadCoeffs};
use crate::params::{sanitize_band_gains, BandOrder, EqParams, EQ_BANDS, EQ_CENTER_FREQS_HZ};

// Bands whose center sits above this fraction of the sample rate are skipped.
// Must not exceed 0.5 (Nyquist); lower values keep the peaking design stable.
const MAX_CENTER_FRACTION: f32 = 0.45;

pub struct Equalizer {
    sample_rate: f32,
    q: f32,
    channels: usize,

    // Delay lines indexed [channel * EQ_BANDS + band]
    sections: Vec<Biquad>,
    coeffs: [BiquadCoeffs; EQ_BANDS],
    band_active: [bool; EQ_BANDS],

    cached_gains: [f32; EQ_BANDS],
    coeffs_valid: bool,
    coefficient_updates: u64,

    order: [usize; EQ_BANDS],
}

impl Equalizer {
    pub fn new(sample_rate: f32, channels: usize, q: f32) -> Self {
        let channels = channels.max(1);
        let mut band_active = [false; EQ_BANDS];
        for (active, &f) in band_active.iter_mut().zip(EQ_CENTER_FREQS_HZ.iter()) {
            *active = f < MAX_CENTER_FRACTION * sample_rate;
        }

        Self {
            sample_rate,
            q,
            channels,
            sections: vec![Biquad::new(); channels * EQ_BANDS],
            coeffs: [BiquadCoeffs::unity(); EQ_BANDS],
            band_active,
            cached_gains: [0.0; EQ_BANDS],
            coeffs_valid: false,
            coefficient_updates: 0,
            order: ascending_order(),
        }
    }

    /// Run the cascade in place over an interleaved block.
    pub fn apply(&mut self, block: &mut [f32], params: &EqParams) {
        if !params.enabled {
            return;
        }

        // Audio-side guard: a poisoned gain must never reach a delay line
        let (gains, _) = sanitize_band_gains(&params.band_gains_db);

        let order = band_order(params.band_order, &gains);
        if order != self.order {
            // Reordering remaps state to different sections
            self.reset();
            self.order = order;
        }

        if !params.precalc_coefficients || !self.coeffs_valid || gains != self.cached_gains {
            self.update_coefficients(&gains);
        }

        let channels = self.channels;
        for frame in block.chunks_exact_mut(channels) {
            for (ch, sample) in frame.iter_mut().enumerate() {
                let chain = &mut self.sections[ch * EQ_BANDS..(ch + 1) * EQ_BANDS];
                let mut x = *sample;
                for &band in &self.order {
                    if self.band_active[band] {
                        x = chain[band].process(x);
                    }
                }
                *sample = x;
            }
        }
    }

    fn update_coefficients(&mut self, gains: &[f32; EQ_BANDS]) {
        for band in 0..EQ_BANDS {
            self.coeffs[band] = if self.band_active[band] {
                BiquadCoeffs::peaking(
                    EQ_CENTER_FREQS_HZ[band],
                    self.q,
                    gains[band],
                    self.sample_rate,
                )
            } else {
                BiquadCoeffs::unity()
            };
        }
        for ch in 0..self.channels {
            for band in 0..EQ_BANDS {
                self.sections[ch * EQ_BANDS + band].set_coeffs(self.coeffs[band]);
            }
        }
        self.cached_gains = *gains;
        self.coeffs_valid = true;
        self.coefficient_updates += 1;
    }

    /// Clear every delay line; coefficients are kept.
    pub fn reset(&mut self) {
        for s in self.sections.iter_mut() {
            s.reset_state();
        }
    }

    /// How many times the coefficient set has been recomputed.
    pub fn coefficient_updates(&self) -> u64 {
        self.coefficient_updates
    }

    pub fn current_order(&self) -> [usize; EQ_BANDS] {
        self.order
    }

    pub fn is_band_active(&self, band: usize) -> bool {
        self.band_active.get(band).copied().unwrap_or(false)
    }
}

fn ascending_order() -> [usize; EQ_BANDS] {
    std::array::from_fn(|i| i)
}

/// Band permutation for the requested cascade order. Gain ties fall back to
/// frequency order so the result is deterministic.
fn band_order(mode: BandOrder, gains: &[f32; EQ_BANDS]) -> [usize; EQ_BANDS] {
    let mut order = ascending_order();
    match mode {
        BandOrder::Ascending => {}
        BandOrder::Descending => order.reverse(),
        BandOrder::GainAscending => {
            order.sort_unstable_by(|&a, &b| gains[a].total_cmp(&gains[b]).then(a.cmp(&b)))
        }
        BandOrder::GainDescending => {
            order.sort_unstable_by(|&a, &b| gains[b].total_cmp(&gains[a]).then(a.cmp(&b)))
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::utils::{frame_rms, lin_to_db};

    const SR: f32 = 48000.0;

    fn sine(freq: f32, len: usize, amp: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amp * (2.0 * std::f32::consts::PI * freq * i as f32 / SR).sin())
            .collect()
    }

    fn enabled(gains: [f32; EQ_BANDS]) -> EqParams {
        EqParams {
            enabled: true,
            band_gains_db: gains,
            ..EqParams::default()
        }
    }

    #[test]
    fn test_flat_eq_is_identity() {
        let mut eq = Equalizer::new(SR, 1, 1.41);
        let input = sine(440.0, 4800, 0.5);
        let mut out = input.clone();
        eq.apply(&mut out, &enabled([0.0; EQ_BANDS]));
        assert_eq!(out, input);
    }

    #[test]
    fn test_boost_at_band_center() {
        let mut eq = Equalizer::new(SR, 1, 1.41);
        let mut gains = [0.0; EQ_BANDS];
        gains[5] = 6.0;

        let input = sine(1000.0, 48000, 0.1);
        let mut out = input.clone();
        eq.apply(&mut out, &enabled(gains));

        // Skip the settling part
        let gain_db = lin_to_db(frame_rms(&out[24000..])) - lin_to_db(frame_rms(&input[24000..]));
        assert!((gain_db - 6.0).abs() < 0.3, "got {}", gain_db);
    }

    #[test]
    fn test_precalc_only_recomputes_on_change() {
        let mut eq = Equalizer::new(SR, 2, 1.41);
        let mut block = vec![0.1; 256];
        let params = enabled([1.0; EQ_BANDS]);

        for _ in 0..10 {
            eq.apply(&mut block, &params);
        }
        assert_eq!(eq.coefficient_updates(), 1);

        let mut changed = params;
        changed.band_gains_db[3] = -4.0;
        eq.apply(&mut block, &changed);
        assert_eq!(eq.coefficient_updates(), 2);

        let always = EqParams {
            precalc_coefficients: false,
            ..changed
        };
        for _ in 0..5 {
            eq.apply(&mut block, &always);
        }
        assert_eq!(eq.coefficient_updates(), 7);
    }

    #[test]
    fn test_order_change_resets_delay_lines() {
        let mut eq = Equalizer::new(SR, 1, 1.41);
        let mut gains = [0.0; EQ_BANDS];
        gains[0] = 6.0;
        gains[9] = -3.0;

        let mut block = sine(60.0, 512, 0.5);
        eq.apply(&mut block, &enabled(gains));
        assert!(eq.sections[0].has_state());

        let reordered = EqParams {
            band_order: BandOrder::GainAscending,
            ..enabled(gains)
        };
        let mut silent = vec![0.0; 64];
        eq.apply(&mut silent, &reordered);

        // State was cleared before the silent block ran
        assert!(silent.iter().all(|&x| x == 0.0));
        assert_eq!(eq.current_order()[0], 9);
        assert_eq!(eq.current_order()[9], 0);
    }

    #[test]
    fn test_high_bands_skipped_at_low_rates() {
        let eq = Equalizer::new(16000.0, 1, 1.41);
        assert!(eq.is_band_active(7));
        assert!(!eq.is_band_active(8));
        assert!(!eq.is_band_active(9));
    }

    #[test]
    fn test_non_finite_gain_is_ignored() {
        let mut eq = Equalizer::new(SR, 1, 1.41);
        let mut gains = [0.0; EQ_BANDS];
        gains[4] = f32::NAN;
        let input = sine(500.0, 1024, 0.3);
        let mut out = input.clone();
        eq.apply(&mut out, &enabled(gains));
        assert_eq!(out, input);
    }
}
