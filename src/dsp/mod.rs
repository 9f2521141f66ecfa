pub mod agc;
pub mod biquad;
pub mod compressor;
pub mod envelope;
pub mod equalizer;
pub mod limiter;
pub mod noise_canceller;
pub mod utils;

pub use agc::Agc;
pub use biquad::{Biquad, BiquadCoeffs};
pub use compressor::Compressor;
pub use equalizer::Equalizer;
pub use limiter::Limiter;
pub use noise_canceller::NoiseCanceller;

use crate::params::VoiceGainParams;
use utils::db_to_lin;

/// Broadband voice gain between the equalizer and the noise canceller.
///
/// The linear gain is ramped across each block from the previous value, so a
/// parameter jump never produces a step. 0 dB is an exact unity multiply.
pub struct VoiceGain {
    channels: usize,
    current: f32,
}

impl VoiceGain {
    pub fn new(channels: usize) -> Self {
        Self {
            channels: channels.max(1),
            current: 1.0,
        }
    }

    pub fn apply(&mut self, block: &mut [f32], params: &VoiceGainParams) {
        let target = db_to_lin(params.gain_db.clamp(-12.0, 12.0));
        if target == 1.0 && self.current == 1.0 {
            return;
        }

        let frames = block.len() / self.channels;
        if frames == 0 {
            return;
        }

        let step = (target - self.current) / frames as f32;
        let mut g = self.current;
        for frame in block.chunks_exact_mut(self.channels) {
            g += step;
            for s in frame.iter_mut() {
                *s *= g;
            }
        }
        self.current = target;
    }

    pub fn reset(&mut self) {
        self.current = 1.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_db_is_exact() {
        let mut vg = VoiceGain::new(2);
        let input: Vec<f32> = (0..128).map(|i| (i as f32 * 0.1).cos()).collect();
        let mut out = input.clone();
        vg.apply(&mut out, &VoiceGainParams { gain_db: 0.0 });
        assert_eq!(out, input);
    }

    #[test]
    fn test_gain_ramps_to_target() {
        let mut vg = VoiceGain::new(1);
        let params = VoiceGainParams { gain_db: 6.0 };
        let mut block = vec![1.0; 100];
        vg.apply(&mut block, &params);

        let target = db_to_lin(6.0);
        assert!(block[0] < block[99]);
        assert!((block[99] - target).abs() < 1e-4);

        let mut steady = vec![1.0; 16];
        vg.apply(&mut steady, &params);
        assert!(steady.iter().all(|&s| (s - target).abs() < 1e-6));
    }
}
