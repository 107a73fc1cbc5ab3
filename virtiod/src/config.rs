//! virtiod configuration

use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtiodConfig {
    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Emulated MMIO devices
    #[serde(default = "default_devices", rename = "device")]
    pub devices: Vec<DeviceConfig>,
}

impl Default for VirtiodConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            devices: default_devices(),
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bridge device node
    #[serde(default = "default_device_path")]
    pub device_path: String,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Longest single wait for SIGHVI before re-checking for shutdown (ms)
    #[serde(default = "default_signal_poll_ms")]
    pub signal_poll_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            device_path: default_device_path(),
            log_level: default_log_level(),
            signal_poll_ms: default_signal_poll_ms(),
        }
    }
}

/// Device model behind an MMIO window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// virtio-blk transport
    Block,
    /// virtio-net transport
    Net,
}

impl ModelKind {
    /// virtio device id reported by the transport
    pub fn device_id(self) -> u32 {
        match self {
            Self::Net => 1,
            Self::Block => 2,
        }
    }
}

/// One emulated MMIO window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,

    /// Cell whose accesses this window serves
    #[serde(default = "default_cell_id")]
    pub cell_id: u32,

    /// Guest physical base address
    pub base: u64,

    /// Window length in bytes
    #[serde(default = "default_window_len")]
    pub len: u64,

    /// Interrupt injected for this device
    pub irq: u64,

    pub model: ModelKind,
}

impl DeviceConfig {
    /// End of the window (exclusive)
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.len)
    }

    fn overlaps(&self, other: &DeviceConfig) -> bool {
        self.cell_id == other.cell_id && self.base < other.end() && other.base < self.end()
    }
}

// Default value functions
fn default_device_path() -> String {
    libhvisor::DEFAULT_DEVICE.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_signal_poll_ms() -> u64 {
    100
}

fn default_cell_id() -> u32 {
    1
}

fn default_window_len() -> u64 {
    0x200
}

fn default_devices() -> Vec<DeviceConfig> {
    vec![
        DeviceConfig {
            name: "blk0".to_string(),
            cell_id: default_cell_id(),
            base: 0xa003e00,
            len: default_window_len(),
            irq: 67,
            model: ModelKind::Block,
        },
        DeviceConfig {
            name: "net0".to_string(),
            cell_id: default_cell_id(),
            base: 0xa003c00,
            len: default_window_len(),
            irq: 68,
            model: ModelKind::Net,
        },
    ]
}

impl VirtiodConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject windows the dispatcher could not route unambiguously
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.daemon.signal_poll_ms == 0 {
            bail!("daemon.signal_poll_ms must be non-zero");
        }

        for (idx, dev) in self.devices.iter().enumerate() {
            if dev.len == 0 {
                bail!("device {} has a zero-length window", dev.name);
            }
            if dev.base.checked_add(dev.len).is_none() {
                bail!("device {} window wraps the address space", dev.name);
            }

            for other in &self.devices[idx + 1..] {
                if dev.name == other.name {
                    bail!("duplicate device name {}", dev.name);
                }
                if dev.overlaps(other) {
                    bail!(
                        "devices {} and {} overlap in cell {}",
                        dev.name,
                        other.name,
                        dev.cell_id
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = VirtiodConfig::default();
        config.validate().unwrap();
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.daemon.device_path, "/dev/hvisor");
    }

    #[test]
    fn test_parse_devices() {
        let config: VirtiodConfig = toml::from_str(
            r#"
            [daemon]
            log_level = "debug"

            [[device]]
            name = "blk1"
            cell_id = 2
            base = 0xa004000
            irq = 70
            model = "block"
            "#,
        )
        .unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.daemon.signal_poll_ms, 100);
        assert_eq!(config.devices.len(), 1);

        let dev = &config.devices[0];
        assert_eq!(dev.cell_id, 2);
        assert_eq!(dev.base, 0xa004000);
        assert_eq!(dev.len, 0x200);
        assert_eq!(dev.model, ModelKind::Block);
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_length_window_rejected() {
        let mut config = VirtiodConfig::default();
        config.devices[0].len = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overlap_only_within_cell() {
        let mut config = VirtiodConfig::default();
        config.devices[1].base = config.devices[0].base + 0x100;
        assert!(config.validate().is_err());

        config.devices[1].cell_id = 2;
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = VirtiodConfig::load(Path::new("/nonexistent/virtiod.toml")).unwrap();
        assert_eq!(config.devices.len(), 2);
    }

    #[test]
    fn test_save_round_trip() {
        let path = std::env::temp_dir().join(format!("virtiod-{}.toml", std::process::id()));
        let config = VirtiodConfig::default();
        config.save(&path).unwrap();

        let loaded = VirtiodConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded.devices[1].irq, 68);
        assert_eq!(loaded.devices[1].model, ModelKind::Net);
    }
}
