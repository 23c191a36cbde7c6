use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::StackerSettings;

pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("focusstack")
        .join("settings.json")
}

pub fn save_settings(settings: &StackerSettings) -> Result<()> {
    save_settings_to(settings, &settings_path())
}

pub fn save_settings_to(settings: &StackerSettings, settings_path: &Path) -> Result<()> {
    if let Some(parent) = settings_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(settings_path, json)
        .with_context(|| format!("writing {}", settings_path.display()))?;

    log::info!("Settings saved to: {}", settings_path.display());
    Ok(())
}

pub fn load_settings() -> StackerSettings {
    load_settings_from(&settings_path())
}

/// Never fails: a missing or unreadable file yields the defaults.
pub fn load_settings_from(settings_path: &Path) -> StackerSettings {
    if !settings_path.exists() {
        log::info!("No settings file found. Using defaults.");
        return StackerSettings::default();
    }

    match std::fs::read_to_string(settings_path) {
        Ok(json) => match serde_json::from_str::<StackerSettings>(&json) {
            Ok(settings) => {
                if let Err(e) = settings.fusion.validate() {
                    log::warn!("Ignoring invalid fusion settings: {}", e);
                    return StackerSettings {
                        fusion: StackerSettings::default().fusion,
                        ..settings
                    };
                }
                log::info!("Settings loaded from: {}", settings_path.display());
                settings
            }
            Err(e) => {
                log::warn!("Failed to parse settings file: {}. Using defaults.", e);
                StackerSettings::default()
            }
        },
        Err(e) => {
            log::warn!("Failed to read settings file: {}. Using defaults.", e);
            StackerSettings::default()
        }
    }
}
