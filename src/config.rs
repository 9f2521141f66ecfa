//! Construction-time configuration of a chain.

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainConfig {
    pub sample_rate: f32,
    /// Interleaved channel count.
    pub channels: usize,
    /// Largest block `process_block` is expected to see (sizes scratch
    /// buffers; larger blocks still work).
    pub max_block_frames: usize,
    /// Q shared by every EQ band.
    pub eq_q: f32,
    pub nc_fft_size: usize,
    pub nc_hop_size: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            channels: 1,
            max_block_frames: 512,
            eq_q: 1.41,
            nc_fft_size: 512,
            nc_hop_size: 128,
        }
    }
}

impl ChainConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let cfg: ChainConfig = serde_json::from_str(json).context("parsing chain config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.sample_rate.is_finite() && (8000.0..=192_000.0).contains(&self.sample_rate),
            "sample rate {} outside 8000..=192000 Hz",
            self.sample_rate
        );
        ensure!(
            (1..=8).contains(&self.channels),
            "channel count {} outside 1..=8",
            self.channels
        );
        ensure!(self.max_block_frames > 0, "max_block_frames must be > 0");
        ensure!(
            self.eq_q.is_finite() && self.eq_q > 0.0,
            "eq_q must be positive, got {}",
            self.eq_q
        );
        ensure!(
            self.nc_fft_size.is_power_of_two() && (64..=8192).contains(&self.nc_fft_size),
            "FFT size {} must be a power of two in 64..=8192",
            self.nc_fft_size
        );
        ensure!(
            self.nc_hop_size > 0
                && self.nc_fft_size % self.nc_hop_size == 0
                && self.nc_hop_size * 2 <= self.nc_fft_size,
            "hop {} must divide FFT size {} with at least 50% overlap",
            self.nc_hop_size,
            self.nc_fft_size
        );
        Ok(())
    }
}
