// =============================================================================
// Settings — Hot-reloadable global trading settings with atomic save
// =============================================================================
//
// Mirrors the teacher's `RuntimeConfig`: every field carries `#[serde(default
// = "...")]` so that adding a field never breaks loading an older settings
// file, and persistence uses a tmp-then-rename write so a crash mid-write
// never corrupts the file on disk.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

fn default_trading_frequency_minutes() -> u32 {
    15
}

fn default_trading_fee_rate() -> f64 {
    0.001
}

/// Global settings shared by every model's cycle. Changes take effect on the
/// next cycle; they never interrupt one already in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// How often (in minutes) the scheduler wakes each enabled model. Must
    /// stay within `[1, 1440]`.
    #[serde(default = "default_trading_frequency_minutes")]
    pub trading_frequency_minutes: u32,

    /// Fee rate charged on both legs of a trade, e.g. 0.001 = 0.1%. Must stay
    /// within `[0, 0.01]`.
    #[serde(default = "default_trading_fee_rate")]
    pub trading_fee_rate: f64,

    /// Whether the system prompt is persisted as its own Conversation row.
    #[serde(default)]
    pub show_system_prompt: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            trading_frequency_minutes: default_trading_frequency_minutes(),
            trading_fee_rate: default_trading_fee_rate(),
            show_system_prompt: false,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse settings from {}", path.display()))?;
        info!(path = %path.display(), "settings loaded");
        Ok(settings)
    }

    /// Persist the current settings to `path` using an atomic write (write to
    /// `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).context("failed to serialise settings")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp settings to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp settings to {}", path.display()))?;

        info!(path = %path.display(), "settings saved (atomic)");
        Ok(())
    }

    /// Clamp a caller-supplied frequency into the valid range.
    pub fn clamp_frequency(minutes: u32) -> u32 {
        minutes.clamp(1, 1440)
    }

    /// Clamp a caller-supplied fee rate into the valid range.
    pub fn clamp_fee_rate(rate: f64) -> f64 {
        rate.clamp(0.0, 0.01)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_have_expected_values() {
        let s = Settings::default();
        assert_eq!(s.trading_frequency_minutes, 15);
        assert!((s.trading_fee_rate - 0.001).abs() < f64::EPSILON);
        assert!(!s.show_system_prompt);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let s: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(s.trading_frequency_minutes, 15);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading_frequency_minutes": 30 }"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(s.trading_frequency_minutes, 30);
        assert!((s.trading_fee_rate - 0.001).abs() < f64::EPSILON);
    }

    #[test]
    fn clamp_bounds() {
        assert_eq!(Settings::clamp_frequency(0), 1);
        assert_eq!(Settings::clamp_frequency(9999), 1440);
        assert_eq!(Settings::clamp_fee_rate(-1.0), 0.0);
        assert_eq!(Settings::clamp_fee_rate(1.0), 0.01);
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!(
            "nexus-settings-test-{:?}",
            std::thread::current().id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");

        let s = Settings {
            trading_frequency_minutes: 42,
            trading_fee_rate: 0.002,
            show_system_prompt: true,
        };
        s.save(&path).unwrap();
        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.trading_frequency_minutes, 42);
        assert!(loaded.show_system_prompt);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
