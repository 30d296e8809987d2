//! Typed paths for vmprep state and for the host being prepared.
//!
//! Centralizing path construction keeps file access consistent and lets the
//! whole host view be re-rooted under a sysroot for dry runs and tests.
use std::path::{Path, PathBuf};

/// Locations of the durable workflow state.
#[derive(Debug, Clone)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the `progress.json` path holding the active phase checkpoint.
    pub fn progress_path(&self) -> PathBuf {
        self.root.join("progress.json")
    }

    /// Return the `completed.json` path listing finished phases.
    pub fn completed_path(&self) -> PathBuf {
        self.root.join("completed.json")
    }

    /// Return the `history.jsonl` audit ledger path.
    pub fn history_path(&self) -> PathBuf {
        self.root.join("history.jsonl")
    }

    /// Return the advisory lock path guarding concurrent runs.
    pub fn lock_path(&self) -> PathBuf {
        self.root.join("vmprep.lock")
    }

    /// Return the default `config.json` path.
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Return the path a corrupt progress record is moved to.
    pub fn quarantine_path(&self, epoch_ms: u128) -> PathBuf {
        self.root.join(format!("progress.json.corrupt-{epoch_ms}"))
    }
}

/// Host filesystem locations, re-rooted under `sysroot`.
#[derive(Debug, Clone)]
pub struct HostPaths {
    sysroot: PathBuf,
}

impl HostPaths {
    pub fn new(sysroot: PathBuf) -> Self {
        Self { sysroot }
    }

    pub fn sysroot(&self) -> &Path {
        &self.sysroot
    }

    /// Map an absolute host path into the sysroot.
    pub fn resolve(&self, host_path: impl AsRef<Path>) -> PathBuf {
        let host_path = host_path.as_ref();
        let relative = host_path.strip_prefix("/").unwrap_or(host_path);
        self.sysroot.join(relative)
    }

    pub fn os_release(&self) -> PathBuf {
        self.resolve("/etc/os-release")
    }

    pub fn cpuinfo(&self) -> PathBuf {
        self.resolve("/proc/cpuinfo")
    }

    pub fn meminfo(&self) -> PathBuf {
        self.resolve("/proc/meminfo")
    }

    /// Per-boot random id; it changes on every reboot.
    pub fn boot_id(&self) -> PathBuf {
        self.resolve("/proc/sys/kernel/random/boot_id")
    }

    pub fn kernel_release(&self) -> PathBuf {
        self.resolve("/proc/sys/kernel/osrelease")
    }

    pub fn iommu_groups(&self) -> PathBuf {
        self.resolve("/sys/kernel/iommu_groups")
    }

    pub fn pci_devices(&self) -> PathBuf {
        self.resolve("/sys/bus/pci/devices")
    }

    pub fn proc_cmdline(&self) -> PathBuf {
        self.resolve("/proc/cmdline")
    }

    pub fn loader_entries(&self) -> PathBuf {
        self.resolve("/boot/loader/entries")
    }
}
