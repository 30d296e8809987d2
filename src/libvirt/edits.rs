//! Pure transformations of a domain definition.
//!
//! Each edit is idempotent: applying it to its own output changes nothing,
//! which is what lets a failed step simply be run again.
use super::xml::{Element, Node};
use crate::host::probe::PciDevice;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// VNC passwords longer than this are silently cut by qemu.
pub const VNC_PASSWORD_MAX: usize = 8;

/// A disk or cdrom as listed in the domain.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct DiskRef {
    pub device: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskDevice {
    Disk,
    Cdrom,
}

/// A file-backed disk to attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    pub device: DiskDevice,
    pub source: String,
    pub bus: &'static str,
    pub format: &'static str,
}

impl DiskSpec {
    /// Target prefix and first letter libvirt accepts for the bus.
    fn target_range(&self) -> (&'static str, char) {
        match (self.bus, self.device) {
            ("virtio", _) => ("vd", 'a'),
            // sda/sdb belong to the install disk and install media.
            ("sata", DiskDevice::Cdrom) => ("sd", 'c'),
            _ => ("sd", 'a'),
        }
    }
}

/// What `spice_to_vnc` changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayChange {
    pub removed_spice_devices: usize,
    pub password_truncated: bool,
}

fn devices(domain: &Element) -> Result<&Element> {
    domain
        .child("devices")
        .ok_or_else(|| anyhow!("domain XML has no <devices> section"))
}

fn devices_mut(domain: &mut Element) -> Result<&mut Element> {
    domain
        .child_mut("devices")
        .ok_or_else(|| anyhow!("domain XML has no <devices> section"))
}

pub fn domain_name(domain: &Element) -> Option<String> {
    domain
        .child("name")
        .map(Element::text)
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

fn is_storage(element: &Element) -> bool {
    element.name == "disk" && matches!(element.attr("device"), Some("disk") | Some("cdrom"))
}

fn disk_source(disk: &Element) -> Option<String> {
    let source = disk.child("source")?;
    ["file", "dev", "volume", "name"]
        .iter()
        .find_map(|key| source.attr(key))
        .map(str::to_string)
}

fn disk_ref(disk: &Element) -> DiskRef {
    let target = disk.child("target");
    DiskRef {
        device: disk.attr("device").unwrap_or("disk").to_string(),
        target: target
            .and_then(|target| target.attr("dev"))
            .unwrap_or_default()
            .to_string(),
        bus: target
            .and_then(|target| target.attr("bus"))
            .map(str::to_string),
        source: disk_source(disk),
    }
}

/// Disks and cdroms in device order.
pub fn disks(domain: &Element) -> Result<Vec<DiskRef>> {
    Ok(devices(domain)?
        .elements()
        .filter(|element| is_storage(element))
        .map(disk_ref)
        .collect())
}

fn used_targets(devices: &Element) -> BTreeSet<String> {
    devices
        .children_named("disk")
        .filter_map(|disk| disk.child("target")?.attr("dev"))
        .map(str::to_string)
        .collect()
}

/// First `<prefix><letter>` from `first` onwards that is not in `used`.
pub fn free_target(used: &BTreeSet<String>, prefix: &str, first: char) -> Option<String> {
    ('a'..='z')
        .filter(|letter| *letter >= first)
        .map(|letter| format!("{prefix}{letter}"))
        .find(|target| !used.contains(target))
}

/// Move SATA system disks to VirtIO. Returns `(old_target, new_target)` pairs.
///
/// The SATA drive address is dropped so libvirt assigns a PCI slot.
pub fn sata_disks_to_virtio(domain: &mut Element) -> Result<Vec<(String, String)>> {
    let devices = devices_mut(domain)?;
    let mut used = used_targets(devices);
    let mut changed = Vec::new();
    for disk in devices.elements_mut() {
        if disk.name != "disk" || disk.attr("device") != Some("disk") {
            continue;
        }
        let Some(target) = disk.child_mut("target") else {
            continue;
        };
        if target.attr("bus") != Some("sata") {
            continue;
        }
        let old = target.attr("dev").unwrap_or_default().to_string();
        let new = free_target(&used, "vd", 'a')
            .ok_or_else(|| anyhow!("no free virtio target for disk `{old}`"))?;
        used.insert(new.clone());
        target.set_attr("dev", new.as_str());
        target.set_attr("bus", "virtio");
        disk.retain_elements(|child| child.name != "address");
        changed.push((old, new));
    }
    Ok(changed)
}

fn is_spice_device(element: &Element) -> bool {
    match element.name.as_str() {
        "channel" => {
            matches!(element.attr("type"), Some("spicevmc") | Some("spiceport"))
                || element
                    .child("target")
                    .and_then(|target| target.attr("name"))
                    .is_some_and(|name| name.to_ascii_lowercase().contains("spice"))
        }
        "audio" => element.attr("type") == Some("spice"),
        "redirdev" => element.attr("type") == Some("spicevmc"),
        _ => false,
    }
}

/// Replace the spice display with password-protected VNC and drop spice-only devices.
pub fn spice_to_vnc(domain: &mut Element, listen: &str, password: &str) -> Result<DisplayChange> {
    if password.is_empty() {
        return Err(anyhow!("VNC password must not be empty"));
    }
    let passwd: String = password.chars().take(VNC_PASSWORD_MAX).collect();
    let devices = devices_mut(domain)?;
    let removed_spice_devices = devices.retain_elements(|element| !is_spice_device(element));

    let graphics = Element::new("graphics")
        .with_attr("type", "vnc")
        .with_attr("port", "-1")
        .with_attr("autoport", "yes")
        .with_attr("listen", listen)
        .with_attr("passwd", passwd.as_str())
        .with_child(
            Element::new("listen")
                .with_attr("type", "address")
                .with_attr("address", listen),
        );
    let slot = devices
        .children
        .iter()
        .position(|node| matches!(node, Node::Element(element) if element.name == "graphics"));
    devices.retain_elements(|element| element.name != "graphics");
    match slot {
        Some(index) => devices
            .children
            .insert(index.min(devices.children.len()), Node::Element(graphics)),
        None => devices.push(graphics),
    }
    Ok(DisplayChange {
        removed_spice_devices,
        password_truncated: passwd.len() < password.len(),
    })
}

fn parse_hex(value: &str) -> Option<u32> {
    let digits = value.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).ok()
}

fn hostdev_address(hostdev: &Element) -> Option<[u32; 4]> {
    let address = hostdev.child("source")?.child("address")?;
    Some([
        parse_hex(address.attr("domain")?)?,
        parse_hex(address.attr("bus")?)?,
        parse_hex(address.attr("slot")?)?,
        parse_hex(address.attr("function")?)?,
    ])
}

/// Add managed PCI host devices; functions already passed through are skipped.
pub fn add_hostdevs(domain: &mut Element, pci: &[PciDevice]) -> Result<usize> {
    let devices = devices_mut(domain)?;
    let mut present: BTreeSet<[u32; 4]> = devices
        .children_named("hostdev")
        .filter_map(hostdev_address)
        .collect();
    let mut added = 0;
    for device in pci {
        let (dom, bus, slot, function) = device.address_parts()?;
        let key = [&dom, &bus, &slot, &function].map(|part| parse_hex(part).unwrap_or(u32::MAX));
        if !present.insert(key) {
            continue;
        }
        devices.push(
            Element::new("hostdev")
                .with_attr("mode", "subsystem")
                .with_attr("type", "pci")
                .with_attr("managed", "yes")
                .with_child(
                    Element::new("source").with_child(
                        Element::new("address")
                            .with_attr("domain", dom)
                            .with_attr("bus", bus)
                            .with_attr("slot", slot)
                            .with_attr("function", function),
                    ),
                ),
        );
        added += 1;
    }
    Ok(added)
}

/// Attach a file-backed disk unless one with the same source exists.
///
/// Returns the target of the attached or already present disk.
pub fn add_disk(domain: &mut Element, spec: &DiskSpec) -> Result<String> {
    let devices = devices_mut(domain)?;
    if let Some(existing) = devices
        .children_named("disk")
        .find(|disk| disk_source(disk).as_deref() == Some(spec.source.as_str()))
    {
        return Ok(disk_ref(existing).target);
    }
    let (prefix, first) = spec.target_range();
    let target = free_target(&used_targets(devices), prefix, first)
        .ok_or_else(|| anyhow!("no free {} target for {}", spec.bus, spec.source))?;
    let device = match spec.device {
        DiskDevice::Disk => "disk",
        DiskDevice::Cdrom => "cdrom",
    };
    let mut disk = Element::new("disk")
        .with_attr("type", "file")
        .with_attr("device", device)
        .with_child(
            Element::new("driver")
                .with_attr("name", "qemu")
                .with_attr("type", spec.format),
        )
        .with_child(Element::new("source").with_attr("file", spec.source.as_str()))
        .with_child(
            Element::new("target")
                .with_attr("dev", target.as_str())
                .with_attr("bus", spec.bus),
        );
    if spec.device == DiskDevice::Cdrom {
        disk.push(Element::new("readonly"));
    }
    // Keep storage grouped ahead of the other devices.
    let after_last_disk = devices
        .children
        .iter()
        .rposition(|node| matches!(node, Node::Element(element) if element.name == "disk"))
        .map_or(devices.children.len(), |index| index + 1);
    devices
        .children
        .insert(after_last_disk, Node::Element(disk));
    Ok(target)
}

/// Remove every disk and cdrom except the one backed by `main_disk`.
pub fn remove_disks_except(domain: &mut Element, main_disk: &str) -> Result<Vec<DiskRef>> {
    let devices = devices_mut(domain)?;
    let keep = |element: &Element| disk_source(element).as_deref() == Some(main_disk);
    if !devices
        .elements()
        .any(|element| is_storage(element) && keep(element))
    {
        return Err(anyhow!(
            "main disk {main_disk} is not attached; refusing to detach the remaining drives"
        ));
    }
    let removed: Vec<DiskRef> = devices
        .elements()
        .filter(|element| is_storage(element) && !keep(element))
        .map(disk_ref)
        .collect();
    devices.retain_elements(|element| !is_storage(element) || keep(element));
    Ok(removed)
}

/// Point disks backed by `from` at `to`. Returns how many were updated.
pub fn relocate_disk(domain: &mut Element, from: &str, to: &str) -> Result<usize> {
    let devices = devices_mut(domain)?;
    let mut updated = 0;
    for disk in devices.elements_mut() {
        if disk.name != "disk" || disk.attr("device") != Some("disk") {
            continue;
        }
        if let Some(source) = disk.child_mut("source") {
            if source.attr("file") == Some(from) {
                source.set_attr("file", to);
                updated += 1;
            }
        }
    }
    Ok(updated)
}

#[cfg(test)]
#[path = "edits_tests.rs"]
mod tests;
