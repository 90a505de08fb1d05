//! Daemon configuration management, ambient per SPEC_FULL.md §2.
//!
//! This is runtime bootstrap configuration (log level, stub-mode default,
//! backend selection, timeouts) distinct from the settings-store tree of
//! §6.4, which persists policy rules rather than daemon config.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub daemon: DaemonSettings,
    pub usb: UsbSettings,
    pub attach: AttachSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    pub log_level: String,
    /// Mirrors the `stub-mode` positional argument of §6.6: when set, RPC
    /// registration and the initial policy load are skipped while hotplug
    /// events are still serviced.
    pub stub_mode: bool,
    /// The `ui_vm_uuid` the policy engine treats as the management-UI VM,
    /// §4.4.1.
    pub ui_vm_uuid: String,
    /// Where the settings-store tree (§6.4) is persisted; backs a
    /// [`crate::settings_bridge::FileSettingsStore`].
    pub settings_store_path: PathBuf,
    /// No real hypervisor coordination tree backend exists in this
    /// dependency stack (§1's "contract-only" framing), so the shared store
    /// is always [`crate::shared_store::InMemorySharedStore`]; this field is
    /// kept so the config shape has a place for a future backend selector
    /// without changing the TOML layout.
    pub shared_store_backend: String,
    pub state_wait_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// VID:PID allowlist applied by the bootstrap before a hotplug arrival
    /// reaches the core; empty means every device is considered. Same
    /// `0x1234:0x5678` / `0x1234:*` / `*:*` syntax as the starting
    /// repository's own device filters.
    #[serde(default)]
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachSettings {
    pub vm_root_prefix: String,
    pub backend_root: String,
    pub backend_domid: i32,
    pub add_id_path: PathBuf,
    pub remove_id_path: PathBuf,
}

/// Expands a leading `~` (or `~user`) the way the starting repository's
/// `load_config` does for its config path argument.
fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonSettings {
                log_level: "info".to_string(),
                stub_mode: false,
                ui_vm_uuid: "00000000-0000-0000-0000-000000000000".to_string(),
                settings_store_path: Self::default_settings_store_path(),
                shared_store_backend: "in-memory".to_string(),
                state_wait_timeout_secs: 5,
            },
            usb: UsbSettings {
                filters: Vec::new(),
            },
            attach: AttachSettings {
                vm_root_prefix: "/local/domain".to_string(),
                backend_root: "/local/domain/0".to_string(),
                backend_domid: 0,
                add_id_path: PathBuf::from("/sys/bus/usb/drivers/usb-xen-vusb/add-id"),
                remove_id_path: PathBuf::from("/sys/bus/usb/drivers/usb-xen-vusb/remove-id"),
            },
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the specified path, or the standard
    /// locations in order if none is given. `~` in the config path itself
    /// and in the paths it contains (settings-store, add-id/remove-id) is
    /// expanded the way the starting repository's `load_config` expands a
    /// `~`-prefixed path argument.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            expand_path(&p)
        } else {
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/usbmuxd/usbmuxd.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: DaemonConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.daemon.settings_store_path = expand_path(&config.daemon.settings_store_path);
        config.attach.add_id_path = expand_path(&config.attach.add_id_path);
        config.attach.remove_id_path = expand_path(&config.attach.remove_id_path);

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found.
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// The default configuration file path.
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbmuxd").join("usbmuxd.toml")
        } else {
            PathBuf::from(".config/usbmuxd/usbmuxd.toml")
        }
    }

    fn default_settings_store_path() -> PathBuf {
        if let Some(state_dir) = dirs::data_dir() {
            state_dir.join("usbmuxd").join("rules.toml")
        } else {
            PathBuf::from(".local/share/usbmuxd/rules.toml")
        }
    }

    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.daemon.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.daemon.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.daemon.ui_vm_uuid.is_empty() {
            return Err(anyhow!("daemon.ui_vm_uuid must not be empty"));
        }

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID).
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }
        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        if !id.starts_with("0x") && !id.starts_with("0X") {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            ));
        }

        let hex_part = &id[2..];
        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }

    /// Parses a single `VID:PID` filter into `(vendor, product)`, where
    /// `None` in either slot means "wildcard". Used by the bootstrap's
    /// hotplug-arrival filter, not by the core.
    pub fn parse_filter(filter: &str) -> Option<(Option<u16>, Option<u16>)> {
        let (vid, pid) = filter.split_once(':')?;
        let vendor = if vid == "*" {
            None
        } else {
            Some(u16::from_str_radix(vid.strip_prefix("0x").or(vid.strip_prefix("0X"))?, 16).ok()?)
        };
        let product = if pid == "*" {
            None
        } else {
            Some(u16::from_str_radix(pid.strip_prefix("0x").or(pid.strip_prefix("0X"))?, 16).ok()?)
        };
        Some((vendor, product))
    }
}
