//! Distribution detection and the per-distro tool choices derived from it.
//!
//! The distro is resolved once at startup; every step then asks it for the
//! package manager, boot loader and initramfs tool instead of branching on
//! raw os-release strings.
use super::runner::HostCommand;
use crate::paths::HostPaths;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::str::FromStr;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Distro {
    Ubuntu,
    Debian,
    LinuxMint,
    #[serde(rename = "pop")]
    PopOs,
    Fedora,
    OpenSuse,
    Arch,
    Manjaro,
    EndeavourOs,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Pacman,
    Dnf,
    Zypper,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BootLoader {
    /// Edit `GRUB_CMDLINE_LINUX` in `/etc/default/grub`, then regenerate.
    Grub { mkconfig: Vec<String> },
    /// Pop!_OS manages its command line through `kernelstub`.
    Kernelstub,
    /// Append to the `options` line of the matching loader entry.
    SystemdBoot,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InitramfsTool {
    InitramfsTools,
    Dracut,
    Mkinitcpio,
}

impl Distro {
    pub const ALL: [Distro; 9] = [
        Distro::Ubuntu,
        Distro::Debian,
        Distro::LinuxMint,
        Distro::PopOs,
        Distro::Fedora,
        Distro::OpenSuse,
        Distro::Arch,
        Distro::Manjaro,
        Distro::EndeavourOs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Distro::Ubuntu => "ubuntu",
            Distro::Debian => "debian",
            Distro::LinuxMint => "linuxmint",
            Distro::PopOs => "pop",
            Distro::Fedora => "fedora",
            Distro::OpenSuse => "opensuse",
            Distro::Arch => "arch",
            Distro::Manjaro => "manjaro",
            Distro::EndeavourOs => "endeavouros",
        }
    }

    /// Map an os-release `ID` value.
    pub fn from_id(id: &str) -> Option<Self> {
        let id = id.trim().to_ascii_lowercase();
        if id.starts_with("opensuse") {
            return Some(Distro::OpenSuse);
        }
        Distro::ALL.into_iter().find(|distro| distro.as_str() == id)
    }

    /// Resolve from os-release, falling back to `ID_LIKE` for derivatives.
    pub fn from_os_release(text: &str) -> Result<Self> {
        let fields = parse_os_release(text);
        let id = fields.get("ID").map(String::as_str).unwrap_or_default();
        if let Some(distro) = Distro::from_id(id) {
            return Ok(distro);
        }
        let like = fields.get("ID_LIKE").map(String::as_str).unwrap_or_default();
        for token in like.split_whitespace() {
            let family = match token {
                "ubuntu" => Some(Distro::Ubuntu),
                "debian" => Some(Distro::Debian),
                "fedora" | "rhel" | "centos" => Some(Distro::Fedora),
                "suse" | "opensuse" => Some(Distro::OpenSuse),
                "arch" => Some(Distro::Arch),
                _ => None,
            };
            if let Some(distro) = family {
                tracing::info!(id, like = token, "using distro family from ID_LIKE");
                return Ok(distro);
            }
        }
        Err(anyhow!(
            "distribution `{id}` is not supported (ID_LIKE: `{like}`); pass --distro to override"
        ))
    }

    pub fn detect(paths: &HostPaths) -> Result<Self> {
        let path = paths.os_release();
        let text =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        Distro::from_os_release(&text)
    }

    fn debian_family(&self) -> bool {
        matches!(
            self,
            Distro::Ubuntu | Distro::Debian | Distro::LinuxMint | Distro::PopOs
        )
    }

    pub fn arch_family(&self) -> bool {
        matches!(self, Distro::Arch | Distro::Manjaro | Distro::EndeavourOs)
    }

    pub fn package_manager(&self) -> PackageManager {
        match self {
            _ if self.debian_family() => PackageManager::Apt,
            _ if self.arch_family() => PackageManager::Pacman,
            Distro::OpenSuse => PackageManager::Zypper,
            _ => PackageManager::Dnf,
        }
    }

    pub fn packages(&self) -> &'static [&'static str] {
        const APT: &[&str] = &[
            "qemu-kvm",
            "libvirt-clients",
            "libvirt-daemon-system",
            "bridge-utils",
            "virt-manager",
            "ovmf",
            "swtpm-tools",
            "openssh-server",
        ];
        const ARCH: &[&str] = &[
            "virt-manager",
            "qemu-full",
            "vde2",
            "iptables-nft",
            "nftables",
            "dnsmasq",
            "bridge-utils",
            "edk2-ovmf",
            "swtpm",
            "openssh",
        ];
        const FEDORA: &[&str] = &["@virtualization", "swtpm", "openssh-server"];
        const SUSE: &[&str] = &[
            "libvirt",
            "libvirt-client",
            "libvirt-daemon",
            "virt-manager",
            "virt-install",
            "virt-viewer",
            "qemu",
            "qemu-kvm",
            "qemu-ovmf-x86_64",
            "qemu-tools",
            "swtpm",
            "openssh",
        ];
        match self.package_manager() {
            PackageManager::Apt => APT,
            PackageManager::Pacman => ARCH,
            PackageManager::Dnf => FEDORA,
            PackageManager::Zypper => SUSE,
        }
    }

    pub fn boot_loader(&self) -> BootLoader {
        let grub = |program: &str, output: &str| BootLoader::Grub {
            mkconfig: vec![program.to_string(), "-o".to_string(), output.to_string()],
        };
        match self {
            Distro::PopOs => BootLoader::Kernelstub,
            Distro::Arch => BootLoader::SystemdBoot,
            Distro::Fedora | Distro::OpenSuse => grub("grub2-mkconfig", "/boot/grub2/grub.cfg"),
            _ => grub("grub-mkconfig", "/boot/grub/grub.cfg"),
        }
    }

    pub fn initramfs_tool(&self) -> InitramfsTool {
        match self {
            _ if self.debian_family() => InitramfsTool::InitramfsTools,
            _ if self.arch_family() => InitramfsTool::Mkinitcpio,
            _ => InitramfsTool::Dracut,
        }
    }

    /// Systemd unit of the SSH daemon used for remote access once the GPU leaves the host.
    pub fn ssh_service(&self) -> &'static str {
        if self.debian_family() {
            "ssh"
        } else {
            "sshd"
        }
    }

    /// Owner libvirt's qemu driver runs guests as.
    pub fn qemu_owner(&self) -> &'static str {
        if self.debian_family() {
            "libvirt-qemu:kvm"
        } else {
            "qemu:qemu"
        }
    }
}

impl fmt::Display for Distro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Distro {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Distro::from_id(value).ok_or_else(|| {
            let known: Vec<_> = Distro::ALL.iter().map(Distro::as_str).collect();
            format!("unknown distro `{value}` (expected one of: {})", known.join(", "))
        })
    }
}

impl PackageManager {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageManager::Apt => "apt",
            PackageManager::Pacman => "pacman",
            PackageManager::Dnf => "dnf",
            PackageManager::Zypper => "zypper",
        }
    }

    /// Non-interactive install of `packages`.
    pub fn install_command(&self, packages: &[&str]) -> HostCommand {
        let command = match self {
            PackageManager::Apt => HostCommand::new("apt-get").args(["install", "-y"]),
            PackageManager::Pacman => {
                HostCommand::new("pacman").args(["-S", "--needed", "--noconfirm"])
            }
            PackageManager::Dnf => HostCommand::new("dnf").args(["install", "-y"]),
            PackageManager::Zypper => {
                HostCommand::new("zypper").args(["--non-interactive", "install"])
            }
        };
        command.args(packages.iter().copied()).inherit_output()
    }
}

impl InitramfsTool {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitramfsTool::InitramfsTools => "initramfs-tools",
            InitramfsTool::Dracut => "dracut",
            InitramfsTool::Mkinitcpio => "mkinitcpio",
        }
    }
}

impl BootLoader {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootLoader::Grub { .. } => "grub",
            BootLoader::Kernelstub => "kernelstub",
            BootLoader::SystemdBoot => "systemd-boot",
        }
    }
}

fn parse_os_release(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            (key.trim().to_string(), value.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_ids_and_derivatives() {
        let ubuntu = "NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\n";
        assert_eq!(Distro::from_os_release(ubuntu).expect("ubuntu"), Distro::Ubuntu);
        let pop = "ID=pop\nID_LIKE=\"ubuntu debian\"\n";
        assert_eq!(Distro::from_os_release(pop).expect("pop"), Distro::PopOs);
        let tumbleweed = "ID=\"opensuse-tumbleweed\"\nID_LIKE=\"opensuse suse\"\n";
        assert_eq!(
            Distro::from_os_release(tumbleweed).expect("suse"),
            Distro::OpenSuse
        );
        let garuda = "ID=garuda\nID_LIKE=arch\n";
        assert_eq!(Distro::from_os_release(garuda).expect("garuda"), Distro::Arch);
        let zorin = "ID=zorin\nID_LIKE=\"ubuntu debian\"\n";
        assert_eq!(Distro::from_os_release(zorin).expect("zorin"), Distro::Ubuntu);
    }

    #[test]
    fn unknown_distro_is_an_error() {
        let err = Distro::from_os_release("ID=haiku\n").expect_err("unsupported");
        assert!(err.to_string().contains("`haiku` is not supported"));
    }

    #[test]
    fn tool_choices_follow_the_family() {
        assert_eq!(Distro::PopOs.boot_loader(), BootLoader::Kernelstub);
        assert_eq!(Distro::Arch.boot_loader(), BootLoader::SystemdBoot);
        assert_eq!(Distro::Manjaro.boot_loader().as_str(), "grub");
        assert_eq!(
            Distro::Fedora.boot_loader(),
            BootLoader::Grub {
                mkconfig: vec![
                    "grub2-mkconfig".to_string(),
                    "-o".to_string(),
                    "/boot/grub2/grub.cfg".to_string()
                ]
            }
        );
        assert_eq!(Distro::Debian.initramfs_tool(), InitramfsTool::InitramfsTools);
        assert_eq!(Distro::OpenSuse.initramfs_tool(), InitramfsTool::Dracut);
        assert_eq!(Distro::EndeavourOs.initramfs_tool(), InitramfsTool::Mkinitcpio);
        assert_eq!(Distro::LinuxMint.package_manager(), PackageManager::Apt);
    }

    #[test]
    fn install_commands_are_non_interactive() {
        let command = PackageManager::Pacman.install_command(&["qemu-full", "swtpm"]);
        assert_eq!(
            command.to_string(),
            "pacman -S --needed --noconfirm qemu-full swtpm"
        );
        let command = PackageManager::Zypper.install_command(Distro::OpenSuse.packages());
        assert!(command.to_string().starts_with("zypper --non-interactive install libvirt "));
    }

    #[test]
    fn cli_names_round_trip() {
        for distro in Distro::ALL {
            assert_eq!(distro.as_str().parse::<Distro>(), Ok(distro));
        }
    }
}
