//! IOMMU kernel parameters and VFIO initramfs modules.
//!
//! The text edits are pure functions over file contents; `apply_boot_parameters`
//! wires them to the distro's boot loader and initramfs tool. Every edit only
//! adds what is missing, so a retried step converges instead of duplicating.
use super::distro::{BootLoader, InitramfsTool};
use super::probe::{self, CpuVendor};
use super::{Host, HostCommand};
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;

pub const VFIO_MODULES: [&str; 3] = ["vfio", "vfio_iommu_type1", "vfio_pci"];
/// Folded into `vfio` in Linux 6.2; older kernels still need it listed.
const VFIO_VIRQFD: &str = "vfio_virqfd";

/// What the `boot_parameters` step changed, kept as its artifact.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BootReport {
    pub vendor: CpuVendor,
    pub kernel_parameters: Vec<String>,
    pub kernel_parameters_applied: bool,
    pub boot_loader: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_entry: Option<String>,
    pub initramfs: String,
    pub modules: Vec<String>,
}

/// VFIO modules for the running kernel; unknown kernels get the legacy module too.
pub fn vfio_modules(tool: InitramfsTool, kernel: Option<(u32, u32)>) -> Vec<&'static str> {
    let mut modules = VFIO_MODULES.to_vec();
    let legacy = match kernel {
        Some(version) => version < (6, 2),
        None => true,
    };
    // mkinitcpio aborts on unknown modules, so it never gets the legacy name.
    if legacy && tool != InitramfsTool::Mkinitcpio {
        modules.push(VFIO_VIRQFD);
    }
    modules
}

fn missing<'a>(present: &[&str], wanted: &[&'a str]) -> Vec<&'a str> {
    wanted
        .iter()
        .copied()
        .filter(|token| !present.contains(token))
        .collect()
}

fn with_trailing_newline(mut text: String) -> String {
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

/// Add `params` to `GRUB_CMDLINE_LINUX`, appending the variable if it is absent.
pub fn add_grub_cmdline(text: &str, params: &[&str]) -> Result<(String, bool)> {
    let pattern = Regex::new(r#"^GRUB_CMDLINE_LINUX=(["']?)(.*?)(["']?)\s*$"#)
        .context("compile GRUB_CMDLINE_LINUX pattern")?;
    let mut found = false;
    let mut changed = false;
    let mut lines = Vec::new();
    for line in text.lines() {
        let Some(caps) = pattern.captures(line).filter(|_| !found) else {
            lines.push(line.to_string());
            continue;
        };
        found = true;
        let quote = if caps[1].is_empty() { "\"" } else { &caps[1] };
        let current: Vec<&str> = caps[2].split_whitespace().collect();
        let added = missing(&current, params);
        if added.is_empty() {
            lines.push(line.to_string());
            continue;
        }
        changed = true;
        let joined = current
            .iter()
            .chain(added.iter())
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        lines.push(format!("GRUB_CMDLINE_LINUX={quote}{joined}{quote}"));
    }
    if !found {
        changed = true;
        lines.push(format!("GRUB_CMDLINE_LINUX=\"{}\"", params.join(" ")));
    }
    Ok((with_trailing_newline(lines.join("\n")), changed))
}

/// Add `params` to the `options` line of a systemd-boot entry.
pub fn add_loader_options(text: &str, params: &[&str]) -> (String, bool) {
    let mut found = false;
    let mut changed = false;
    let mut lines = Vec::new();
    for line in text.lines() {
        let Some(rest) = line.strip_prefix("options").filter(|_| !found) else {
            lines.push(line.to_string());
            continue;
        };
        if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
            lines.push(line.to_string());
            continue;
        }
        found = true;
        let current: Vec<&str> = rest.split_whitespace().collect();
        let added = missing(&current, params);
        if added.is_empty() {
            lines.push(line.to_string());
        } else {
            changed = true;
            lines.push(format!("{} {}", line.trim_end(), added.join(" ")));
        }
    }
    if !found {
        changed = true;
        lines.push(format!("options {}", params.join(" ")));
    }
    (with_trailing_newline(lines.join("\n")), changed)
}

/// Kernel flavor package name for a release, e.g. `linux-zen` for `6.9.1-zen1-1-zen`.
pub fn kernel_flavor(release: &str) -> &'static str {
    if release.contains("zen") {
        "linux-zen"
    } else if release.contains("hardened") {
        "linux-hardened"
    } else if release.contains("lts") {
        "linux-lts"
    } else {
        "linux"
    }
}

/// Pick the non-fallback loader entry booting `flavor`.
///
/// The entry's `linux` line is authoritative; the file name is only a fallback.
pub fn select_loader_entry<'a>(entries: &'a [(String, String)], flavor: &str) -> Option<&'a str> {
    let image = format!("vmlinuz-{flavor}");
    let candidates = || {
        entries
            .iter()
            .filter(|(name, _)| name.ends_with(".conf") && !name.contains("fallback"))
    };
    candidates()
        .find(|(_, text)| {
            text.lines().any(|line| {
                line.strip_prefix("linux")
                    .filter(|rest| rest.starts_with(char::is_whitespace))
                    .and_then(|rest| rest.trim().rsplit('/').next())
                    .is_some_and(|file| file == image)
            })
        })
        .or_else(|| candidates().find(|(name, _)| name.contains(flavor)))
        .map(|(name, _)| name.as_str())
}

/// Append missing module names to an initramfs-tools `modules` file.
pub fn add_module_lines(text: &str, modules: &[&str]) -> (String, bool) {
    let present: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_whitespace().next())
        .collect();
    let added = missing(&present, modules);
    if added.is_empty() {
        return (text.to_string(), false);
    }
    let mut out = if text.is_empty() {
        String::new()
    } else {
        with_trailing_newline(text.to_string())
    };
    for module in added {
        out.push_str(module);
        out.push('\n');
    }
    (out, true)
}

/// Prepend missing modules to `MODULES=(...)` so VFIO claims the GPU before its driver.
pub fn add_mkinitcpio_modules(text: &str, modules: &[&str]) -> Result<(String, bool)> {
    let pattern =
        Regex::new(r"^MODULES=\((.*)\)\s*$").context("compile mkinitcpio MODULES pattern")?;
    let mut found = false;
    let mut changed = false;
    let mut lines = Vec::new();
    for line in text.lines() {
        let Some(caps) = pattern.captures(line).filter(|_| !found) else {
            lines.push(line.to_string());
            continue;
        };
        found = true;
        let current: Vec<&str> = caps[1].split_whitespace().collect();
        let added = missing(&current, modules);
        if added.is_empty() {
            lines.push(line.to_string());
            continue;
        }
        changed = true;
        let joined = added
            .iter()
            .chain(current.iter())
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        lines.push(format!("MODULES=({joined})"));
    }
    if !found {
        changed = true;
        lines.push(format!("MODULES=({})", modules.join(" ")));
    }
    Ok((with_trailing_newline(lines.join("\n")), changed))
}

/// Drop-in telling dracut to include the VFIO drivers.
pub fn dracut_conf(modules: &[&str]) -> String {
    format!("add_drivers+=\" {} \"\n", modules.join(" "))
}

/// Set the IOMMU kernel parameters and VFIO initramfs modules for `host.distro`.
pub fn apply_boot_parameters(host: &Host) -> Result<BootReport> {
    let vendor = probe::cpu_vendor(&host.paths)?;
    let release = probe::kernel_release(&host.paths);
    let loader = host.distro.boot_loader();
    let tool = host.distro.initramfs_tool();
    let modules = vfio_modules(tool, release.as_deref().and_then(probe::kernel_version));

    let params = vendor.iommu_parameters();
    let mut boot_entry = None;
    match params {
        Some(params) => {
            let parameters = params.join(" ");
            tracing::info!(?vendor, %parameters, loader = loader.as_str(), "setting kernel parameters");
            boot_entry = set_kernel_parameters(host, &loader, &params, release.as_deref())?;
        }
        None => {
            tracing::warn!(
                "CPU vendor not recognized; kernel IOMMU parameters were not changed. \
                 Enable the IOMMU manually if verification fails after reboot"
            );
        }
    }

    install_vfio_modules(host, tool, &modules, release.as_deref())?;

    Ok(BootReport {
        vendor,
        kernel_parameters: params
            .map(|params| params.iter().map(|p| p.to_string()).collect())
            .unwrap_or_default(),
        kernel_parameters_applied: params.is_some(),
        boot_loader: loader.as_str().to_string(),
        boot_entry,
        initramfs: tool.as_str().to_string(),
        modules: modules.iter().map(|m| m.to_string()).collect(),
    })
}

fn set_kernel_parameters(
    host: &Host,
    loader: &BootLoader,
    params: &[&str],
    release: Option<&str>,
) -> Result<Option<String>> {
    match loader {
        BootLoader::Grub { mkconfig } => {
            let path = "/etc/default/grub";
            let text = host.read_optional(path)?.unwrap_or_default();
            let (updated, changed) = add_grub_cmdline(&text, params)?;
            if changed {
                host.write_file(path, &updated)?;
            }
            let (program, args) = mkconfig
                .split_first()
                .ok_or_else(|| anyhow!("empty grub regeneration command"))?;
            host.run(HostCommand::new(program.as_str()).args(args.iter().cloned()))?;
            Ok(None)
        }
        BootLoader::Kernelstub => {
            host.run(
                HostCommand::new("kernelstub")
                    .arg("--add-options")
                    .arg(params.join(" ")),
            )?;
            Ok(None)
        }
        BootLoader::SystemdBoot => {
            let flavor = kernel_flavor(release.unwrap_or_default());
            let dir = host.paths.loader_entries();
            let mut entries = Vec::new();
            for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
                let entry = entry.with_context(|| format!("read {}", dir.display()))?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let text = fs::read_to_string(entry.path())
                    .with_context(|| format!("read {}", entry.path().display()))?;
                entries.push((name, text));
            }
            entries.sort();
            let name = select_loader_entry(&entries, flavor)
                .ok_or_else(|| anyhow!("no boot entry in {} boots {flavor}", dir.display()))?
                .to_string();
            let text = entries
                .iter()
                .find(|(entry, _)| *entry == name)
                .map(|(_, text)| text.as_str())
                .unwrap_or_default();
            let (updated, changed) = add_loader_options(text, params);
            if changed {
                host.write_file(format!("/boot/loader/entries/{name}"), &updated)?;
            } else {
                tracing::info!(entry = %name, "IOMMU options already present");
            }
            Ok(Some(name))
        }
    }
}

fn install_vfio_modules(
    host: &Host,
    tool: InitramfsTool,
    modules: &[&str],
    release: Option<&str>,
) -> Result<()> {
    match tool {
        InitramfsTool::InitramfsTools => {
            let path = "/etc/initramfs-tools/modules";
            let text = host.read_optional(path)?.unwrap_or_default();
            let (updated, changed) = add_module_lines(&text, modules);
            if changed {
                host.write_file(path, &updated)?;
            }
            host.run(HostCommand::new("update-initramfs").arg("-u"))?;
        }
        InitramfsTool::Dracut => {
            host.write_file("/etc/dracut.conf.d/10-vfio.conf", &dracut_conf(modules))?;
            let command = match release {
                Some(release) => HostCommand::new("dracut").args(["-f", "--kver", release]),
                None => HostCommand::new("dracut").arg("-f"),
            };
            host.run(command)?;
        }
        InitramfsTool::Mkinitcpio => {
            let path = "/etc/mkinitcpio.conf";
            let text = host.read_optional(path)?.unwrap_or_default();
            let (updated, changed) = add_mkinitcpio_modules(&text, modules)?;
            if changed {
                host.write_file(path, &updated)?;
            }
            host.run(HostCommand::new("mkinitcpio").arg("-P"))?;
        }
    }
    let modules = modules.join(" ");
    tracing::info!(tool = tool.as_str(), %modules, "initramfs updated");
    Ok(())
}

#[cfg(test)]
#[path = "boot_tests.rs"]
mod tests;
