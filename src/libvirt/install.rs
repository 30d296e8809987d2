//! The `virt-install` invocation for a new Windows guest.
use super::xml::Element;
use crate::config::Config;
use crate::host::HostCommand;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Operator-chosen sizing, recorded as the `vm_config` artifact.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub name: String,
    pub memory_mib: u64,
    pub disk_gib: u64,
    pub sockets: u32,
    pub cores: u32,
    pub threads: u32,
}

impl VmConfig {
    pub fn vcpus(&self) -> u32 {
        self.sockets * self.cores * self.threads
    }
}

/// Everything `virt-install` needs, resolved against the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallPlan {
    pub uri: String,
    pub vm: VmConfig,
    pub iso: PathBuf,
    pub disk_path: PathBuf,
    pub os_variant: String,
}

impl InstallPlan {
    pub fn new(config: &Config, vm: VmConfig, iso: PathBuf) -> Self {
        let disk_path = config.images_dir.join(format!("{}.qcow2", vm.name));
        Self {
            uri: config.libvirt_uri.clone(),
            vm,
            iso,
            disk_path,
            os_variant: config.os_variant.clone(),
        }
    }

    /// q35 + UEFI + TPM 2.0 guest with a host-passthrough CPU, booting the installer over spice.
    pub fn virt_install(&self) -> HostCommand {
        let vm = &self.vm;
        HostCommand::new("virt-install")
            .arg("--connect")
            .arg(self.uri.as_str())
            .arg("--name")
            .arg(vm.name.as_str())
            .arg("--memory")
            .arg(vm.memory_mib.to_string())
            .arg("--vcpus")
            .arg(format!(
                "{},sockets={},cores={},threads={}",
                vm.vcpus(),
                vm.sockets,
                vm.cores,
                vm.threads
            ))
            .arg("--cdrom")
            .arg(self.iso.display().to_string())
            .arg("--disk")
            .arg(format!(
                "size={},path={},format=qcow2,bus=sata",
                vm.disk_gib,
                self.disk_path.display()
            ))
            .args([
                "--os-variant",
                self.os_variant.as_str(),
                "--network",
                "network=default",
                "--graphics",
                "spice",
                "--cpu",
                "host-passthrough",
                "--machine",
                "q35",
                "--boot",
                "uefi",
                "--tpm",
                "type=emulator,model=tpm-tis,version=2.0",
                "--noautoconsole",
            ])
            .inherit_output()
    }

    /// The definition `virt-install` would produce, for simulated runs.
    pub fn preview_xml(&self) -> Result<String> {
        let vm = &self.vm;
        if vm.vcpus() == 0 {
            return Err(anyhow!("VM `{}` needs at least one vCPU", vm.name));
        }
        let disk = |device: &str, format: &str, source: String, target: &str| {
            let element = Element::new("disk")
                .with_attr("type", "file")
                .with_attr("device", device)
                .with_child(
                    Element::new("driver")
                        .with_attr("name", "qemu")
                        .with_attr("type", format),
                )
                .with_child(Element::new("source").with_attr("file", source))
                .with_child(
                    Element::new("target")
                        .with_attr("dev", target)
                        .with_attr("bus", "sata"),
                );
            if device == "cdrom" {
                element.with_child(Element::new("readonly"))
            } else {
                element
            }
        };
        let redirdev = || {
            Element::new("redirdev")
                .with_attr("bus", "usb")
                .with_attr("type", "spicevmc")
        };
        let domain = Element::new("domain")
            .with_attr("type", "kvm")
            .with_child(Element::new("name").with_text(vm.name.as_str()))
            .with_child(
                Element::new("memory")
                    .with_attr("unit", "MiB")
                    .with_text(vm.memory_mib.to_string()),
            )
            .with_child(Element::new("vcpu").with_text(vm.vcpus().to_string()))
            .with_child(
                Element::new("os")
                    .with_attr("firmware", "efi")
                    .with_child(
                        Element::new("type")
                            .with_attr("arch", "x86_64")
                            .with_attr("machine", "q35")
                            .with_text("hvm"),
                    ),
            )
            .with_child(
                Element::new("cpu")
                    .with_attr("mode", "host-passthrough")
                    .with_child(
                        Element::new("topology")
                            .with_attr("sockets", vm.sockets.to_string())
                            .with_attr("cores", vm.cores.to_string())
                            .with_attr("threads", vm.threads.to_string()),
                    ),
            )
            .with_child(
                Element::new("devices")
                    .with_child(disk(
                        "disk",
                        "qcow2",
                        self.disk_path.display().to_string(),
                        "sda",
                    ))
                    .with_child(disk("cdrom", "raw", self.iso.display().to_string(), "sdb"))
                    .with_child(
                        Element::new("interface")
                            .with_attr("type", "network")
                            .with_child(Element::new("source").with_attr("network", "default")),
                    )
                    .with_child(
                        Element::new("channel").with_attr("type", "spicevmc").with_child(
                            Element::new("target")
                                .with_attr("type", "virtio")
                                .with_attr("name", "com.redhat.spice.0"),
                        ),
                    )
                    .with_child(
                        Element::new("graphics")
                            .with_attr("type", "spice")
                            .with_attr("autoport", "yes"),
                    )
                    .with_child(Element::new("audio").with_attr("id", "1").with_attr("type", "spice"))
                    .with_child(
                        Element::new("video")
                            .with_child(Element::new("model").with_attr("type", "qxl")),
                    )
                    .with_child(redirdev())
                    .with_child(redirdev())
                    .with_child(
                        Element::new("tpm").with_attr("model", "tpm-tis").with_child(
                            Element::new("backend")
                                .with_attr("type", "emulator")
                                .with_attr("version", "2.0"),
                        ),
                    ),
            );
        domain.to_xml()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libvirt::edits;

    fn plan() -> InstallPlan {
        InstallPlan::new(
            &Config::default(),
            VmConfig {
                name: "Gaming".to_string(),
                memory_mib: 16384,
                disk_gib: 120,
                sockets: 1,
                cores: 7,
                threads: 2,
            },
            PathBuf::from("/isos/win11.iso"),
        )
    }

    #[test]
    fn virt_install_argv_describes_the_guest() {
        let argv = plan().virt_install().argv();
        let after = |flag: &str| {
            argv.iter()
                .position(|arg| arg == flag)
                .and_then(|index| argv.get(index + 1))
                .cloned()
                .unwrap_or_default()
        };
        assert_eq!(argv[0], "virt-install");
        assert_eq!(after("--connect"), "qemu:///system");
        assert_eq!(after("--vcpus"), "14,sockets=1,cores=7,threads=2");
        assert_eq!(
            after("--disk"),
            "size=120,path=/var/lib/libvirt/images/Gaming.qcow2,format=qcow2,bus=sata"
        );
        assert_eq!(after("--boot"), "uefi");
        assert_eq!(after("--tpm"), "type=emulator,model=tpm-tis,version=2.0");
        assert_eq!(argv.last().map(String::as_str), Some("--noautoconsole"));
    }

    #[test]
    fn preview_matches_what_later_steps_edit() {
        let xml = plan().preview_xml().expect("preview");
        let domain = Element::parse(&xml).expect("parse preview");
        assert_eq!(edits::domain_name(&domain).as_deref(), Some("Gaming"));
        let disks = edits::disks(&domain).expect("disks");
        assert_eq!(
            disks[0].source.as_deref(),
            Some("/var/lib/libvirt/images/Gaming.qcow2")
        );
        assert_eq!(disks[1].device, "cdrom");
        assert!(xml.contains("spicevmc"));
    }
}
