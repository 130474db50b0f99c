//! Application settings

use std::path::{Path, PathBuf};

use amp_router::{AssignmentTable, DeviceAddress, RouterConfig};
use amp_sim::VirtualAmplifierConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Every device address the monitor has been pointed at
    pub known_devices: Vec<DeviceAddress>,
    /// Default device plus per-channel overrides
    pub assignments: AssignmentTable,
    /// Session timing and channel capacities
    pub router: RouterConfig,
    /// Virtual amplifier started by `--simulate`
    pub simulator: VirtualAmplifierConfig,
}

impl Settings {
    /// Get the XDG config directory for amp-monitor
    /// Uses $XDG_CONFIG_HOME/amp-monitor, falls back to ~/.config/amp-monitor
    fn config_dir() -> Option<PathBuf> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_config);
            if path.is_absolute() {
                return Some(path.join("amp-monitor"));
            }
        }

        dirs::home_dir().map(|h| h.join(".config").join("amp-monitor"))
    }

    /// Get the default settings file path
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.json"))
    }

    /// Load settings from `path`
    ///
    /// A missing file gives the defaults. A file that does not parse is
    /// reported and also gives the defaults.
    pub fn load_from(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => return Self::default(),
        };
        serde_json::from_str(&text).unwrap_or_else(|e| {
            warn!("Ignoring unreadable settings {}: {}", path.display(), e);
            Self::default()
        })
    }

    /// Save settings to `path`, creating its directory
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create settings directory {}", parent.display())
            })?;
        }

        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write settings {}", path.display()))?;
        Ok(())
    }

    /// Add every device the assignment table refers to to `known_devices`.
    /// Returns true if the list grew.
    pub fn remember_devices(&mut self) -> bool {
        let before = self.known_devices.len();
        for address in self.assignments.required_addresses() {
            if !self.known_devices.contains(&address) {
                self.known_devices.push(address);
            }
        }
        self.known_devices.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amp_router::DisplayChannel;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("amp-monitor-test-{}-{}", std::process::id(), name))
            .join("settings.json")
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"known_devices":["10.0.0.1"]}"#).unwrap();
        assert_eq!(settings.known_devices, vec![DeviceAddress::with_default_port("10.0.0.1")]);
        assert_eq!(settings.router, RouterConfig::default());
        assert_eq!(settings.assignments, AssignmentTable::new());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let path = scratch_path("round-trip");
        let mut settings = Settings::default();
        settings.assignments = AssignmentTable::with_default(DeviceAddress::new("10.0.0.1", 8234));
        settings
            .assignments
            .set_assignment(DisplayChannel::input(1), Some(DeviceAddress::new("10.0.0.2", 9000)))
            .unwrap();
        settings
            .assignments
            .set_channel_number(DisplayChannel::output(3), Some(1))
            .unwrap();
        settings.router.session.poll_interval_ms = 50;
        assert!(settings.remember_devices());

        settings.save_to(&path).unwrap();
        let loaded = Settings::load_from(&path);
        assert_eq!(loaded, settings);
        assert_eq!(loaded.known_devices.len(), 2);

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn test_unreadable_file_gives_defaults() {
        let path = scratch_path("garbage");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(Settings::load_from(&path), Settings::default());
        assert_eq!(
            Settings::load_from(&scratch_path("missing")),
            Settings::default()
        );

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_out_of_range_assignment_gives_defaults() {
        let path = scratch_path("bad-physical");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let text = r#"{"assignments":{"channels":{"input1":{"physical":9}}}}"#;
        std::fs::write(&path, text).unwrap();
        assert_eq!(Settings::load_from(&path), Settings::default());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_remember_devices_is_idempotent() {
        let mut settings = Settings::default();
        settings
            .assignments
            .set_default_address(Some(DeviceAddress::new("10.0.0.1", 8234)));
        assert!(settings.remember_devices());
        assert!(!settings.remember_devices());
        assert_eq!(settings.known_devices.len(), 1);
    }
}
