//! libvirt lifecycle hooks that hand the GPU to the guest and back.
use super::probe::PciDevice;
use super::{Host, HostCommand};
use crate::templates;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const HOOK_MODE: u32 = 0o755;

/// Host paths written by the `install_hooks` step.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct HookReport {
    pub dispatcher: PathBuf,
    pub start: PathBuf,
    pub revert: PathBuf,
    pub devices: Vec<String>,
}

fn render(template: &str, vm: &str, marker: &str, lines: Vec<String>) -> String {
    template
        .replace("@@VM_NAME@@", vm)
        .replace(marker, &lines.join("\n"))
}

/// `prepare/begin` script detaching every passthrough function from the host.
pub fn render_start_hook(vm: &str, devices: &[PciDevice]) -> String {
    let lines = devices
        .iter()
        .map(|device| format!("virsh nodedev-detach {}", device.nodedev_name()))
        .collect();
    render(templates::START_HOOK_TEMPLATE, vm, "@@DETACH@@", lines)
}

/// `release/end` script reattaching the functions in reverse order.
pub fn render_revert_hook(vm: &str, devices: &[PciDevice]) -> String {
    let lines = devices
        .iter()
        .rev()
        .map(|device| format!("virsh nodedev-reattach {}", device.nodedev_name()))
        .collect();
    render(templates::REVERT_HOOK_TEMPLATE, vm, "@@REATTACH@@", lines)
}

fn check_vm_name(vm: &str) -> Result<()> {
    if vm.is_empty() || vm.contains('/') || vm == "." || vm == ".." {
        return Err(anyhow!("`{vm}` cannot be used as a hook directory name"));
    }
    Ok(())
}

fn install_script(host: &Host, path: &Path, contents: &str) -> Result<()> {
    host.write_file(path, contents)?;
    host.set_mode(path, HOOK_MODE)
}

/// Write the dispatcher and per-domain scripts, then restart libvirtd to load them.
pub fn install_hooks(host: &Host, vm: &str, devices: &[PciDevice]) -> Result<HookReport> {
    check_vm_name(vm)?;
    if devices.is_empty() {
        return Err(anyhow!("no passthrough devices recorded for `{vm}`"));
    }
    let hooks_dir = &host.config.hooks_dir;
    let dispatcher = hooks_dir.join("qemu");
    let domain_dir = hooks_dir.join("qemu.d").join(vm);
    let start = domain_dir.join("prepare/begin/start.sh");
    let revert = domain_dir.join("release/end/revert.sh");

    match host.read_optional(&dispatcher)? {
        Some(existing) if existing == templates::QEMU_HOOK_DISPATCHER => {}
        Some(_) => {
            tracing::warn!(path = %dispatcher.display(), "replacing existing qemu hook dispatcher");
            install_script(host, &dispatcher, templates::QEMU_HOOK_DISPATCHER)?;
        }
        None => install_script(host, &dispatcher, templates::QEMU_HOOK_DISPATCHER)?,
    }
    install_script(host, &start, &render_start_hook(vm, devices))?;
    install_script(host, &revert, &render_revert_hook(vm, devices))?;

    host.run(HostCommand::new("systemctl").args(["restart", "libvirtd"]))?;
    tracing::info!(vm, hooks = %domain_dir.display(), "lifecycle hooks installed");
    Ok(HookReport {
        dispatcher,
        start,
        revert,
        devices: devices.iter().map(PciDevice::nodedev_name).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::FakeHost;
    use crate::host::Distro;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn gpu() -> Vec<PciDevice> {
        ["0000:01:00.0", "0000:01:00.1"]
            .into_iter()
            .map(|address| PciDevice {
                address: address.to_string(),
                class: "0x030000".to_string(),
                vendor: "0x10de".to_string(),
                device: "0x2484".to_string(),
            })
            .collect()
    }

    #[test]
    fn start_detaches_in_order_and_revert_reattaches_in_reverse() {
        let start = render_start_hook("Gaming", &gpu());
        let first = start.find("nodedev-detach pci_0000_01_00_0").expect("video");
        let second = start.find("nodedev-detach pci_0000_01_00_1").expect("audio");
        assert!(first < second);
        assert!(start.contains("before Gaming boots"));
        assert!(!start.contains("@@"));

        let revert = render_revert_hook("Gaming", &gpu());
        let audio = revert.find("nodedev-reattach pci_0000_01_00_1").expect("audio");
        let video = revert.find("nodedev-reattach pci_0000_01_00_0").expect("video");
        assert!(audio < video);
        assert!(!revert.contains("@@"));
    }

    #[test]
    fn install_writes_executable_scripts_and_restarts_libvirtd() {
        let fake = FakeHost::new(Distro::Ubuntu);
        let report = install_hooks(&fake.host, "Gaming", &gpu()).expect("install");

        assert_eq!(report.dispatcher, PathBuf::from("/etc/libvirt/hooks/qemu"));
        assert_eq!(
            report.start,
            PathBuf::from("/etc/libvirt/hooks/qemu.d/Gaming/prepare/begin/start.sh")
        );
        assert_eq!(report.devices, vec!["pci_0000_01_00_0", "pci_0000_01_00_1"]);
        for path in [&report.dispatcher, &report.start, &report.revert] {
            let mode = fs::metadata(fake.host.paths.resolve(path))
                .expect("stat hook")
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755, "{}", path.display());
        }
        assert_eq!(fake.read("/etc/libvirt/hooks/qemu"), templates::QEMU_HOOK_DISPATCHER);
        assert_eq!(fake.runner.commands(), vec!["systemctl restart libvirtd"]);
    }

    #[test]
    fn names_that_escape_the_hook_tree_are_rejected() {
        let fake = FakeHost::new(Distro::Ubuntu);
        assert!(install_hooks(&fake.host, "../etc", &gpu()).is_err());
        assert!(install_hooks(&fake.host, "Gaming", &[]).is_err());
        assert!(fake.runner.commands().is_empty());
    }
}
