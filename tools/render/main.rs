use anyhow::{Context, Result};
use std::path::PathBuf;
use voxchain::offline::render_wav_file;
use voxchain::{ChainParams, NoisePreset};

fn list_presets() {
    for preset in NoisePreset::all_presets() {
        let v = preset.values();
        println!("{} {:<8} {}", preset.index(), preset.name(), preset.description());
        println!(
            "           strength {:.2}, floor {:.0} dB, attack {:.0} ms, release {:.0} ms",
            v.strength, v.spectral_floor_db, v.noise_attack_ms, v.noise_release_ms
        );
    }
}

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1).peekable();
    if args.peek().map(String::as_str) == Some("--presets") {
        list_presets();
        return Ok(());
    }
    let (Some(input), Some(output)) = (args.next(), args.next()) else {
        eprintln!("Usage: chain_render <input.wav> <output.wav> [params.json]");
        eprintln!("       chain_render --presets");
        std::process::exit(1);
    };
    let input = PathBuf::from(input);
    let output = PathBuf::from(output);

    let params = match args.next() {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read parameter file '{}'", path))?;
            ChainParams::from_json(&json)?
        }
        None => ChainParams::default(),
    };

    let report = render_wav_file(&input, &output, params)?;

    let lufs = |v: Option<f64>| v.map_or_else(|| "n/a".to_string(), |l| format!("{:.1} LUFS", l));
    println!("Rendered '{}' -> '{}'", input.display(), output.display());
    println!("  format           : {} ch, {} Hz", report.channels, report.sample_rate);
    println!("  frames           : {}", report.frames);
    println!("  latency trimmed  : {} frames", report.latency_frames);
    println!("  silenced blocks  : {}", report.silenced_blocks);
    println!("  loudness in      : {}", lufs(report.input_lufs));
    println!("  loudness out     : {}", lufs(report.output_lufs));
    Ok(())
}
