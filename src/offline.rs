//! Offline rendering: run a whole buffer or WAV file through a chain.

use std::path::Path;

use anyhow::{bail, Context, Result};
use ebur128::{EbuR128, Mode};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::chain::{BlockOutcome, VoiceChain};
use crate::config::ChainConfig;
use crate::params::ChainParams;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderReport {
    pub frames: usize,
    pub channels: usize,
    pub sample_rate: u32,
    /// Integrated loudness in LUFS; `None` when the signal is too short or silent.
    pub input_lufs: Option<f64>,
    pub output_lufs: Option<f64>,
    pub silenced_blocks: usize,
    /// Frames of delay removed from the head of the output.
    pub latency_frames: usize,
}

struct Rendered {
    samples: Vec<f32>,
    silenced_blocks: usize,
    latency_frames: usize,
}

/// Process an interleaved buffer and return the output, time-aligned with the
/// input (processing latency is flushed out and trimmed).
pub fn render_interleaved(
    config: ChainConfig,
    params: ChainParams,
    input: &[f32],
) -> Result<Vec<f32>> {
    Ok(render(config, params, input)?.samples)
}

fn render(config: ChainConfig, params: ChainParams, input: &[f32]) -> Result<Rendered> {
    let (mut chain, _controller) = VoiceChain::with_params(config, params)?;
    chain.start();

    let channels = config.channels;
    if input.len() % channels != 0 {
        bail!(
            "input length {} is not a multiple of {} channels",
            input.len(),
            channels
        );
    }

    let latency = chain.latency_frames();
    let mut work = Vec::with_capacity(input.len() + latency * channels);
    work.extend_from_slice(input);
    work.resize(input.len() + latency * channels, 0.0);

    let mut silenced_blocks = 0;
    for block in work.chunks_mut(config.max_block_frames * channels) {
        if chain.process_block(block) == BlockOutcome::Silenced {
            silenced_blocks += 1;
        }
    }
    chain.stop();

    if silenced_blocks > 0 {
        log::warn!("{} block(s) silenced during render", silenced_blocks);
    }

    let samples = work.split_off(latency * channels);
    Ok(Rendered {
        samples,
        silenced_blocks,
        latency_frames: latency,
    })
}

/// Render a WAV file through the chain, writing 32-bit float output.
pub fn render_wav_file(input: &Path, output: &Path, params: ChainParams) -> Result<RenderReport> {
    let reader = WavReader::open(input)
        .with_context(|| format!("failed to open input WAV '{}'", input.display()))?;
    let spec = reader.spec();
    let samples = read_samples(reader)
        .with_context(|| format!("failed to decode '{}'", input.display()))?;

    let config = ChainConfig {
        sample_rate: spec.sample_rate as f32,
        channels: spec.channels as usize,
        ..ChainConfig::default()
    };
    log::info!(
        "rendering '{}': {} Hz, {} ch, {} frames",
        input.display(),
        spec.sample_rate,
        spec.channels,
        samples.len() / config.channels.max(1)
    );

    let rendered = render(config, params, &samples)?;

    let out_spec = WavSpec {
        channels: spec.channels,
        sample_rate: spec.sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(output, out_spec)
        .with_context(|| format!("failed to create output WAV '{}'", output.display()))?;
    for &s in &rendered.samples {
        writer.write_sample(s)?;
    }
    writer.finalize()?;

    Ok(RenderReport {
        frames: rendered.samples.len() / config.channels,
        channels: config.channels,
        sample_rate: spec.sample_rate,
        input_lufs: integrated_loudness(&samples, config.channels, spec.sample_rate),
        output_lufs: integrated_loudness(&rendered.samples, config.channels, spec.sample_rate),
        silenced_blocks: rendered.silenced_blocks,
        latency_frames: rendered.latency_frames,
    })
}

fn read_samples<R: std::io::Read>(reader: WavReader<R>) -> Result<Vec<f32>> {
    let spec = reader.spec();
    match spec.sample_format {
        SampleFormat::Float => Ok(reader.into_samples::<f32>().collect::<Result<Vec<_>, _>>()?),
        SampleFormat::Int => {
            if spec.bits_per_sample == 0 || spec.bits_per_sample > 32 {
                bail!("unsupported bit depth {}", spec.bits_per_sample);
            }
            let scale = 1.0 / (1u64 << (spec.bits_per_sample - 1)) as f32;
            Ok(reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<Vec<_>, _>>()?)
        }
    }
}

/// EBU R128 integrated loudness of an interleaved buffer.
pub fn integrated_loudness(samples: &[f32], channels: usize, sample_rate: u32) -> Option<f64> {
    let mut meter = EbuR128::new(channels as u32, sample_rate, Mode::I).ok()?;
    meter.add_frames_f32(samples).ok()?;
    meter.loudness_global().ok().filter(|l| l.is_finite())
}
