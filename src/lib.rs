//! voxchain: a real-time voice processing chain.
//!
//! Fixed topology, processed in place on interleaved `f32` blocks:
//!
//! ```text
//! AGC -> Equalizer -> Voice Gain -> Noise Canceller -> Compressor -> Limiter
//! ```
//!
//! The audio thread owns a [`VoiceChain`] and calls
//! [`VoiceChain::process_block`] from its callback. Any other thread holds a
//! [`ChainController`] to change parameters, request start/stop and read
//! [`TelemetrySnapshot`]s. Neither side ever blocks the other.
//!
//! ```no_run
//! use voxchain::{ChainConfig, Stage, VoiceChain};
//!
//! let (mut chain, controller) = VoiceChain::new(ChainConfig::default())?;
//! controller.set_stage_enabled(Stage::Compressor, true);
//! chain.start();
//!
//! let mut block = vec![0.0f32; 256];
//! chain.process_block(&mut block);
//! println!("{:?}", controller.telemetry());
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod chain;
pub mod config;
pub mod debug;
pub mod dsp;
pub mod ffi;
pub mod meters;
pub mod offline;
pub mod params;
pub mod presets;
pub mod snapshot;

pub use chain::{BlockOutcome, ChainController, ChainState, VoiceChain};
pub use config::ChainConfig;
pub use meters::TelemetrySnapshot;
pub use params::{
    AgcParams, BandOrder, ChainParams, CompressorParams, EqParams, LimiterParams,
    NoiseCancellerParams, Stage, VoiceGainParams, EQ_BANDS, EQ_CENTER_FREQS_HZ,
};
pub use presets::NoisePreset;
