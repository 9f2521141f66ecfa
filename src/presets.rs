use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// =============================================================================
// NOISE CANCELLER PRESETS
// =============================================================================

/// Named parameter bundles for the noise canceller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum NoisePreset {
    #[serde(rename = "DEFAULT")]
    Default,
    #[serde(rename = "VOICE")]
    Voice,
    #[serde(rename = "OUTDOOR")]
    Outdoor,
    #[serde(rename = "OFFICE")]
    Office,
}

impl NoisePreset {
    pub fn all_presets() -> [NoisePreset; 4] {
        [
            NoisePreset::Default,
            NoisePreset::Voice,
            NoisePreset::Outdoor,
            NoisePreset::Office,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            NoisePreset::Default => "DEFAULT",
            NoisePreset::Voice => "VOICE",
            NoisePreset::Outdoor => "OUTDOOR",
            NoisePreset::Office => "OFFICE",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            NoisePreset::Default => "Balanced suppression for general use",
            NoisePreset::Voice => "Gentle suppression that keeps speech detail",
            NoisePreset::Outdoor => "Aggressive suppression for wind and traffic",
            NoisePreset::Office => "Slow tracking for steady HVAC and fan noise",
        }
    }

    pub fn index(&self) -> u32 {
        *self as u32
    }

    /// Bridge-side lookup; `None` for anything outside the table.
    pub fn from_index(index: i32) -> Option<Self> {
        match index {
            0 => Some(NoisePreset::Default),
            1 => Some(NoisePreset::Voice),
            2 => Some(NoisePreset::Outdoor),
            3 => Some(NoisePreset::Office),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::all_presets()
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
    }

    /// Values from the baked-in preset table.
    pub fn values(&self) -> NoisePresetValues {
        PRESETS.get(*self)
    }

    fn builtin_values(&self) -> NoisePresetValues {
        match self {
            NoisePreset::Default => NoisePresetValues {
                strength: 0.5,
                spectral_floor_db: -60.0,
                smoothing: 0.6,
                noise_attack_ms: 20.0,
                noise_release_ms: 400.0,
                residual_boost_db: 0.0,
                artifact_suppress: 0.5,
            },
            NoisePreset::Voice => NoisePresetValues {
                // Keep more residual so consonants survive
                strength: 0.6,
                spectral_floor_db: -50.0,
                smoothing: 0.7,
                noise_attack_ms: 15.0,
                noise_release_ms: 300.0,
                residual_boost_db: 1.5,
                artifact_suppress: 0.6,
            },
            NoisePreset::Outdoor => NoisePresetValues {
                strength: 0.85,
                spectral_floor_db: -65.0,
                smoothing: 0.5,
                noise_attack_ms: 10.0,
                noise_release_ms: 200.0,
                residual_boost_db: -1.0,
                artifact_suppress: 0.7,
            },
            NoisePreset::Office => NoisePresetValues {
                strength: 0.45,
                spectral_floor_db: -55.0,
                smoothing: 0.75,
                noise_attack_ms: 40.0,
                noise_release_ms: 800.0,
                residual_boost_db: 0.5,
                artifact_suppress: 0.4,
            },
        }
    }
}

impl Default for NoisePreset {
    fn default() -> Self {
        NoisePreset::Default
    }
}

/// Parameter values carried by a noise canceller preset
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoisePresetValues {
    pub strength: f32,
    pub spectral_floor_db: f32,
    pub smoothing: f32,
    pub noise_attack_ms: f32,
    pub noise_release_ms: f32,
    pub residual_boost_db: f32,
    pub artifact_suppress: f32,
}

static PRESETS: Lazy<PresetManager> = Lazy::new(PresetManager::new);

#[derive(Debug)]
pub struct PresetManager {
    presets: HashMap<NoisePreset, NoisePresetValues>,
}

impl PresetManager {
    /// Load presets from baked-in JSON. This is fallible but non-fatal.
    /// Falls back to the built-in table if parsing fails.
    pub fn new() -> Self {
        let presets_str = include_str!("../presets.json");
        match Self::from_json(presets_str) {
            Ok(manager) => manager,
            Err(err) => {
                log::warn!("preset table is malformed, using built-in values: {err:#}");
                Self::default()
            }
        }
    }

    /// Parse a preset table. Presets missing from the JSON keep their
    /// built-in values.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        use anyhow::Context;

        let parsed: HashMap<String, NoisePresetValues> =
            serde_json::from_str(json).context("parsing noise preset table")?;

        let mut manager = Self::default();
        for (name, values) in parsed {
            match NoisePreset::from_name(&name) {
                Some(preset) => {
                    manager.presets.insert(preset, values);
                }
                None => log::warn!("ignoring unknown noise preset '{name}'"),
            }
        }
        Ok(manager)
    }

    pub fn get(&self, preset: NoisePreset) -> NoisePresetValues {
        self.presets
            .get(&preset)
            .copied()
            .unwrap_or_else(|| preset.builtin_values())
    }
}

impl Default for PresetManager {
    fn default() -> Self {
        let presets = NoisePreset::all_presets()
            .into_iter()
            .map(|p| (p, p.builtin_values()))
            .collect();
        Self { presets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baked_table_matches_builtin_values() {
        let manager = PresetManager::new();
        for p in NoisePreset::all_presets() {
            assert_eq!(manager.get(p), p.builtin_values(), "{}", p.name());
        }
    }

    #[test]
    fn test_partial_json_keeps_missing_presets() {
        let json = r#"{ "VOICE": { "strength": 0.9, "spectralFloorDb": -40.0, "smoothing": 0.1,
            "noiseAttackMs": 5.0, "noiseReleaseMs": 50.0, "residualBoostDb": 0.0,
            "artifactSuppress": 0.0 } }"#;
        let manager = PresetManager::from_json(json).unwrap();
        assert_eq!(manager.get(NoisePreset::Voice).strength, 0.9);
        assert_eq!(
            manager.get(NoisePreset::Office),
            NoisePreset::Office.builtin_values()
        );
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(PresetManager::from_json("{ not json").is_err());
    }

    #[test]
    fn test_every_preset_is_described_once() {
        let presets = NoisePreset::all_presets();
        for (i, p) in presets.iter().enumerate() {
            assert!(!p.description().is_empty(), "{}", p.name());
            for q in &presets[i + 1..] {
                assert_ne!(p.description(), q.description());
            }
            assert_eq!(NoisePreset::from_name(&p.name().to_lowercase()), Some(*p));
        }
    }

    #[test]
    fn test_index_lookup() {
        assert_eq!(NoisePreset::from_index(2), Some(NoisePreset::Outdoor));
        assert_eq!(NoisePreset::from_index(4), None);
        assert_eq!(NoisePreset::from_index(-1), None);
        for p in NoisePreset::all_presets() {
            assert_eq!(NoisePreset::from_index(p.index() as i32), Some(p));
        }
    }
}
