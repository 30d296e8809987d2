//! Read-only host inspection through procfs and sysfs.
//!
//! Everything here reads files under the sysroot, so tests drive it with a
//! fake tree instead of the running machine.
use crate::paths::HostPaths;
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ffi::CString;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CpuVendor {
    Amd,
    Intel,
    Unknown,
}

impl CpuVendor {
    pub fn from_cpuinfo(text: &str) -> Self {
        if text.contains("AuthenticAMD") {
            CpuVendor::Amd
        } else if text.contains("GenuineIntel") {
            CpuVendor::Intel
        } else {
            CpuVendor::Unknown
        }
    }

    /// Kernel parameters that turn the IOMMU on in passthrough mode.
    pub fn iommu_parameters(&self) -> Option<[&'static str; 2]> {
        match self {
            CpuVendor::Amd => Some(["amd_iommu=on", "iommu=pt"]),
            CpuVendor::Intel => Some(["intel_iommu=on", "iommu=pt"]),
            CpuVendor::Unknown => None,
        }
    }
}

/// Host capacity used to default and bound the VM sizing prompts.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SystemInfo {
    pub logical_cpus: u32,
    pub sockets: u32,
    pub cores_per_socket: u32,
    pub threads_per_core: u32,
    pub memory_mib: u64,
    pub free_disk_gib: f64,
}

/// CPU topology from `/proc/cpuinfo`.
pub fn cpu_topology(cpuinfo: &str) -> Result<(u32, u32, u32, u32)> {
    let mut logical = 0u32;
    let mut sockets = BTreeSet::new();
    let mut cores_per_socket = None;
    let mut siblings = None;
    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "processor" => logical += 1,
            "physical id" => {
                sockets.insert(value.to_string());
            }
            "cpu cores" => cores_per_socket = value.parse::<u32>().ok(),
            "siblings" => siblings = value.parse::<u32>().ok(),
            _ => {}
        }
    }
    if logical == 0 {
        return Err(anyhow!("no processors listed in cpuinfo"));
    }
    let sockets = u32::try_from(sockets.len()).unwrap_or(1).max(1);
    let cores = cores_per_socket.unwrap_or(logical / sockets).max(1);
    let threads = siblings
        .map(|siblings| (siblings / cores).max(1))
        .unwrap_or(1);
    Ok((logical, sockets, cores, threads))
}

pub fn total_memory_mib(meminfo: &str) -> Result<u64> {
    let line = meminfo
        .lines()
        .find(|line| line.starts_with("MemTotal:"))
        .ok_or_else(|| anyhow!("MemTotal missing from meminfo"))?;
    let kib: u64 = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("malformed MemTotal line: {line}"))?
        .parse()
        .with_context(|| format!("parse MemTotal line: {line}"))?;
    Ok(kib / 1024)
}

/// Free space available to unprivileged writers on the filesystem holding `path`.
pub fn free_disk_gib(path: &Path) -> Result<f64> {
    let existing = path
        .ancestors()
        .find(|candidate| candidate.exists())
        .ok_or_else(|| anyhow!("no existing ancestor of {}", path.display()))?;
    let c_path = CString::new(existing.as_os_str().as_bytes())
        .with_context(|| format!("encode {}", existing.display()))?;
    // SAFETY: statvfs only writes into the zeroed struct we own.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("statvfs {}", existing.display()));
    }
    let bytes = stat.f_bavail as f64 * stat.f_frsize as f64;
    Ok((bytes / (1024.0 * 1024.0 * 1024.0) * 10.0).floor() / 10.0)
}

pub fn system_info(paths: &HostPaths, images_dir: &Path) -> Result<SystemInfo> {
    let cpuinfo = read(&paths.cpuinfo())?;
    let (logical_cpus, sockets, cores_per_socket, threads_per_core) = cpu_topology(&cpuinfo)?;
    let memory_mib = total_memory_mib(&read(&paths.meminfo())?)?;
    let free_disk_gib = free_disk_gib(&paths.resolve(images_dir))?;
    Ok(SystemInfo {
        logical_cpus,
        sockets,
        cores_per_socket,
        threads_per_core,
        memory_mib,
        free_disk_gib,
    })
}

pub fn cpu_vendor(paths: &HostPaths) -> Result<CpuVendor> {
    Ok(CpuVendor::from_cpuinfo(&read(&paths.cpuinfo())?))
}

/// Random per-boot id; `None` when the kernel does not expose one.
pub fn boot_id(paths: &HostPaths) -> Option<String> {
    fs::read_to_string(paths.boot_id())
        .ok()
        .map(|text| text.trim().to_string())
        .filter(|id| !id.is_empty())
}

pub fn kernel_release(paths: &HostPaths) -> Option<String> {
    fs::read_to_string(paths.kernel_release())
        .ok()
        .map(|text| text.trim().to_string())
        .filter(|release| !release.is_empty())
}

/// `(major, minor)` of a release string like `6.8.0-45-generic`.
pub fn kernel_version(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

pub fn iommu_group_count(paths: &HostPaths) -> Result<usize> {
    let dir = paths.iommu_groups();
    match fs::read_dir(&dir) {
        Ok(entries) => Ok(entries.filter_map(|entry| entry.ok()).count()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err).with_context(|| format!("read {}", dir.display())),
    }
}

pub fn kernel_cmdline(paths: &HostPaths) -> Option<String> {
    fs::read_to_string(paths.proc_cmdline())
        .ok()
        .map(|text| text.trim().to_string())
}

/// One PCI function as seen in sysfs.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct PciDevice {
    pub address: String,
    pub class: String,
    pub vendor: String,
    pub device: String,
}

impl PciDevice {
    pub fn is_display(&self) -> bool {
        self.class.starts_with("0x03")
    }

    /// `0000:01:00` for `0000:01:00.1`.
    pub fn slot(&self) -> &str {
        self.address
            .rsplit_once('.')
            .map(|(slot, _)| slot)
            .unwrap_or(&self.address)
    }

    /// libvirt node device name, e.g. `pci_0000_01_00_0`.
    pub fn nodedev_name(&self) -> String {
        format!("pci_{}", self.address.replace([':', '.'], "_"))
    }

    /// `(domain, bus, slot, function)` as hex strings for domain XML.
    pub fn address_parts(&self) -> Result<(String, String, String, String)> {
        let pattern = Regex::new(
            r"^([0-9a-fA-F]{4}):([0-9a-fA-F]{2}):([0-9a-fA-F]{2})\.([0-7])$",
        )
        .context("compile PCI address pattern")?;
        let caps = pattern
            .captures(&self.address)
            .ok_or_else(|| anyhow!("malformed PCI address `{}`", self.address))?;
        Ok((
            format!("0x{}", &caps[1]),
            format!("0x{}", &caps[2]),
            format!("0x{}", &caps[3]),
            format!("0x{}", &caps[4]),
        ))
    }
}

pub fn pci_devices(paths: &HostPaths) -> Result<Vec<PciDevice>> {
    let dir = paths.pci_devices();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", dir.display())),
    };
    let mut devices = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        let attr = |name: &str| -> Result<String> {
            Ok(read(&entry.path().join(name))?.trim().to_ascii_lowercase())
        };
        devices.push(PciDevice {
            address: entry.file_name().to_string_lossy().into_owned(),
            class: attr("class")?,
            vendor: attr("vendor")?,
            device: attr("device")?,
        });
    }
    devices.sort_by(|a, b| a.address.cmp(&b.address));
    Ok(devices)
}

/// Display controllers grouped with the other functions on their slot (HDMI audio).
pub fn gpu_groups(devices: &[PciDevice]) -> Vec<Vec<PciDevice>> {
    devices
        .iter()
        .filter(|device| device.is_display())
        .map(|gpu| {
            devices
                .iter()
                .filter(|device| device.slot() == gpu.slot())
                .cloned()
                .collect()
        })
        .collect()
}

/// Address other machines on the LAN would use to reach this host.
pub fn local_ip() -> IpAddr {
    // Connecting a UDP socket sends nothing; it only selects the outbound interface.
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("10.255.255.255:1")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}
