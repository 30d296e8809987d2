//! Operator configuration loaded from `config.json`.
//!
//! Every field has a default, so a missing file is the same as `{}` apart
//! from the schema version.
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_SCHEMA_VERSION: u32 = 1;
pub const CONFIG_ENV: &str = "VMPREP_CONFIG";
pub const STATE_DIR_ENV: &str = "VMPREP_STATE_DIR";

const DEFAULT_VIRTIO_ISO_URL: &str = "https://fedorapeople.org/groups/virt/virtio-win/direct-downloads/stable-virtio/virtio-win.iso";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub schema_version: u32,
    /// Connection URI handed to `virsh` and `virt-install`.
    pub libvirt_uri: String,
    /// Where VM disks, scratch disks, and downloaded ISOs are placed.
    pub images_dir: PathBuf,
    /// libvirt hook directory; the qemu dispatcher lives directly inside it.
    pub hooks_dir: PathBuf,
    pub os_variant: String,
    pub virtio_iso_url: String,
    pub default_vm_name: String,
    /// Address the VNC display listens on after the spice swap.
    pub vnc_listen: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            libvirt_uri: "qemu:///system".to_string(),
            images_dir: PathBuf::from("/var/lib/libvirt/images"),
            hooks_dir: PathBuf::from("/etc/libvirt/hooks"),
            os_variant: "win11".to_string(),
            virtio_iso_url: DEFAULT_VIRTIO_ISO_URL.to_string(),
            default_vm_name: "Windows_VM".to_string(),
            vnc_listen: "0.0.0.0".to_string(),
        }
    }
}

/// Parse and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    let config: Config = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse config {}", path.display()))?;
    validate_config(&config).with_context(|| format!("validate config {}", path.display()))?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported config schema_version {}",
            config.schema_version
        ));
    }
    for (name, path) in [
        ("images_dir", &config.images_dir),
        ("hooks_dir", &config.hooks_dir),
    ] {
        if !path.is_absolute() {
            return Err(anyhow!("{name} must be an absolute path, got {}", path.display()));
        }
    }
    if config.libvirt_uri.trim().is_empty() {
        return Err(anyhow!("libvirt_uri must not be empty"));
    }
    if config.default_vm_name.trim().is_empty() {
        return Err(anyhow!("default_vm_name must not be empty"));
    }
    Ok(())
}

/// `--config`, then `VMPREP_CONFIG`, then `<state>/config.json` when present.
pub fn resolve_config_path(
    explicit: Option<&Path>,
    env_value: Option<&str>,
    state_config: &Path,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(value) = env_value.map(str::trim).filter(|value| !value.is_empty()) {
        return Some(PathBuf::from(value));
    }
    state_config.is_file().then(|| state_config.to_path_buf())
}

/// `--state-dir`, then `VMPREP_STATE_DIR`, then the XDG state dir.
pub fn resolve_state_dir(explicit: Option<&Path>, env_value: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(value) = env_value.map(str::trim).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(value));
    }
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|base| base.join("vmprep"))
        .ok_or_else(|| anyhow!("cannot determine a state directory; pass --state-dir"))
}

/// Pretty JSON of the defaults, for `vmprep config --default`.
pub fn config_stub() -> Result<String> {
    serde_json::to_string_pretty(&Config::default()).context("serialize default config")
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
