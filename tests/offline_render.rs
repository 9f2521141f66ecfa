use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use voxchain::offline::render_wav_file;
use voxchain::{ChainParams, LimiterParams};

#[test]
fn test_wav_round_trip_through_chain() {
    let dir = std::env::temp_dir();
    let input = dir.join(format!("voxchain_in_{}.wav", std::process::id()));
    let output = dir.join(format!("voxchain_out_{}.wav", std::process::id()));

    // Hot 16-bit stereo tone, two seconds
    let spec = WavSpec {
        channels: 2,
        sample_rate: 44100,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(&input, spec).unwrap();
    for i in 0..88200 {
        let phase = 2.0 * std::f32::consts::PI * 330.0 * i as f32 / 44100.0;
        let v = (0.95 * phase.sin() * i16::MAX as f32) as i16;
        writer.write_sample(v).unwrap();
        writer.write_sample(v / 2).unwrap();
    }
    writer.finalize().unwrap();

    let params = ChainParams {
        limiter: LimiterParams {
            enabled: true,
            threshold_db: -6.0,
            ..LimiterParams::default()
        },
        ..ChainParams::default()
    };
    let report = render_wav_file(&input, &output, params).unwrap();

    assert_eq!(report.channels, 2);
    assert_eq!(report.sample_rate, 44100);
    assert_eq!(report.frames, 88200);
    assert_eq!(report.silenced_blocks, 0);
    let (lufs_in, lufs_out) = (report.input_lufs.unwrap(), report.output_lufs.unwrap());
    assert!(lufs_out < lufs_in, "{} !< {}", lufs_out, lufs_in);

    let reader = WavReader::open(&output).unwrap();
    assert_eq!(reader.spec().sample_format, SampleFormat::Float);
    let ceiling = 10f32.powf(-6.0 / 20.0) + 1e-6;
    let samples: Vec<f32> = reader.into_samples::<f32>().map(|s| s.unwrap()).collect();
    assert_eq!(samples.len(), 88200 * 2);
    assert!(samples.iter().all(|s| s.abs() <= ceiling));

    let _ = std::fs::remove_file(&input);
    let _ = std::fs::remove_file(&output);
}

#[test]
fn test_missing_input_is_an_error() {
    let dir = std::env::temp_dir();
    let missing = dir.join("voxchain_definitely_missing.wav");
    let out = dir.join("voxchain_unused_out.wav");
    let err = render_wav_file(&missing, &out, ChainParams::default()).unwrap_err();
    assert!(format!("{:#}", err).contains("failed to open input WAV"));
}
