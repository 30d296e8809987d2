//! Shared fixtures for integration tests: a fake host tree and a state dir.

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

/// A Fedora-like host under a temp sysroot, driven with `--dry-run`.
pub struct Sandbox {
    pub sysroot: TempDir,
    pub state: TempDir,
}

impl Sandbox {
    pub fn fedora_intel() -> Self {
        let sandbox = Self {
            sysroot: tempfile::tempdir().expect("sysroot"),
            state: tempfile::tempdir().expect("state dir"),
        };
        sandbox.write(
            "/etc/os-release",
            "NAME=\"Fedora Linux\"\nID=fedora\nVERSION_ID=40\n",
        );
        sandbox.write(
            "/proc/cpuinfo",
            "processor\t: 0\nvendor_id\t: GenuineIntel\nphysical id\t: 0\nsiblings\t: 2\ncpu cores\t: 2\n\n",
        );
        sandbox.write("/proc/sys/kernel/osrelease", "6.8.5-301.fc40.x86_64\n");
        sandbox.write("/proc/cmdline", "BOOT_IMAGE=/vmlinuz root=/dev/nvme0n1p3 rhgb quiet\n");
        sandbox.write(
            "/etc/default/grub",
            "GRUB_TIMEOUT=5\nGRUB_CMDLINE_LINUX=\"rhgb quiet\"\n",
        );
        sandbox.set_boot_id("boot-1");
        sandbox
    }

    pub fn host_path(&self, host_path: &str) -> PathBuf {
        self.sysroot
            .path()
            .join(host_path.trim_start_matches('/'))
    }

    pub fn state_path(&self, name: &str) -> PathBuf {
        self.state.path().join(name)
    }

    pub fn write(&self, host_path: &str, contents: &str) {
        let path = self.host_path(host_path);
        fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
        fs::write(&path, contents).expect("write fake host file");
    }

    pub fn read(&self, host_path: &str) -> String {
        fs::read_to_string(self.host_path(host_path)).expect("read fake host file")
    }

    pub fn set_boot_id(&self, boot_id: &str) {
        self.write("/proc/sys/kernel/random/boot_id", &format!("{boot_id}\n"));
    }

    /// Simulate the kernel coming back up with the IOMMU enabled.
    pub fn reboot_with_iommu(&self, boot_id: &str) {
        self.set_boot_id(boot_id);
        fs::create_dir_all(self.host_path("/sys/kernel/iommu_groups/0")).expect("iommu group");
        self.write(
            "/proc/cmdline",
            "BOOT_IMAGE=/vmlinuz root=/dev/nvme0n1p3 rhgb quiet intel_iommu=on iommu=pt\n",
        );
    }

    /// Run vmprep against this sandbox, never touching the real host.
    pub fn vmprep(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_vmprep"))
            .arg("--sysroot")
            .arg(self.sysroot.path())
            .arg("--state-dir")
            .arg(self.state.path())
            .args(["--dry-run", "--unattended"])
            .args(args)
            .env_remove("VMPREP_CONFIG")
            .env_remove("VMPREP_STATE_DIR")
            .env("VMPREP_LOG", "warn")
            .output()
            .expect("spawn vmprep")
    }
}

pub fn code(output: &Output) -> i32 {
    output.status.code().expect("exit code")
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

pub fn json(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
        panic!("stdout is not JSON ({err}): {}", stdout(output))
    })
}
