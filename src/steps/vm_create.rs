//! `vm-create`: define the Windows guest, then reshape it for passthrough.
//!
//! Every step after `create_vm` edits the persistent definition through
//! idempotent XML edits, so a failed step can be re-run as is.
use super::{parse_bounded, parse_existing_file};
use crate::engine::{Phase, Step, StepContext, StepOutput};
use crate::host::probe::{self, PciDevice};
use crate::host::{ask_parsed, download_file, ensure_qemu_can_read, install_hooks, HostCommand};
use crate::libvirt::edits::{self, DiskDevice, DiskSpec};
use crate::libvirt::{edit_domain, InstallPlan, VmConfig};
use anyhow::{anyhow, Context, Result};
use serde_json::json;
use std::path::PathBuf;

const WINDOWS_DOWNLOAD_URL: &str = "https://www.microsoft.com/software-download/windows11";
const DRIVER_ISO_NAME: &str = "virtio-win.iso";
const SCRATCH_DISK_SIZE: &str = "100M";
const MIN_MEMORY_MIB: u64 = 1024;

pub(super) fn steps() -> Vec<Step> {
    vec![
        Step::from_fn(Phase::VmCreate, "select_install_media", select_install_media)
            .summary("Choose the Windows installer ISO and let qemu read it")
            .produces(&["windows_iso"]),
        Step::from_fn(Phase::VmCreate, "configure_vm", configure_vm)
            .summary("Size the VM against host CPUs, memory and free disk")
            .produces(&["system_info", "vm_config"]),
        Step::from_fn(Phase::VmCreate, "create_vm", create_vm)
            .summary("Create the VM with virt-install and stop it for editing")
            .not_retriable()
            .requires(&["windows_iso", "vm_config"])
            .produces(&["domain", "main_disk"]),
        Step::from_fn(Phase::VmCreate, "attach_driver_media", attach_driver_media)
            .summary("Attach a VirtIO scratch disk and the VirtIO driver ISO")
            .requires(&["domain"])
            .produces(&["driver_iso"]),
        Step::from_fn(Phase::VmCreate, "modify_storage_bus", modify_storage_bus)
            .summary("Move the system disk from SATA to VirtIO")
            .requires(&["domain"]),
        Step::from_fn(Phase::VmCreate, "set_display_vnc", set_display_vnc)
            .summary("Replace spice with a password-protected VNC display")
            .requires(&["domain"])
            .produces(&["vnc"]),
        Step::from_fn(Phase::VmCreate, "attach_gpu", attach_gpu)
            .summary("Pass the GPU and the other functions on its slot through")
            .requires(&["domain"])
            .produces(&["gpu_devices"]),
        Step::from_fn(Phase::VmCreate, "install_hooks", install_lifecycle_hooks)
            .summary("Install libvirt hooks that hand the GPU over on start and back on stop")
            .requires(&["domain", "gpu_devices"])
            .produces(&["hooks"]),
        Step::from_fn(Phase::VmCreate, "cleanup_drives", cleanup_drives)
            .summary("Detach every drive except the system disk")
            .requires(&["domain", "main_disk"])
            .produces(&["detached_disks"]),
    ]
}

fn select_install_media(ctx: &StepContext<'_>) -> Result<StepOutput> {
    let prompter = ctx.host.prompter.as_ref();
    if !prompter.confirm(
        "have_windows_iso",
        "Have you downloaded a Windows installer ISO?",
        true,
    )? {
        return Err(anyhow!(
            "a Windows ISO is required; download one from {WINDOWS_DOWNLOAD_URL} and run again"
        ));
    }
    let iso = ask_parsed(
        prompter,
        "windows_iso",
        "Absolute path to the Windows ISO",
        None,
        |text| parse_existing_file(ctx.host, text),
    )?;
    let changed = ensure_qemu_can_read(ctx.host, &iso)?;
    tracing::info!(iso = %iso.display(), permissions_changed = changed.len(), "install media selected");
    StepOutput::new().with("windows_iso", iso)
}

fn parse_vm_name(text: &str) -> Result<String> {
    let valid = !text.is_empty()
        && !text.starts_with('.')
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(anyhow!(
            "`{text}` is not a usable VM name (letters, digits, `-`, `_`, `.`)"
        ));
    }
    Ok(text.to_string())
}

fn configure_vm(ctx: &StepContext<'_>) -> Result<StepOutput> {
    let prompter = ctx.host.prompter.as_ref();
    let info = probe::system_info(&ctx.host.paths, &ctx.config().images_dir)?;
    prompter.notice(&format!(
        "Host: {} logical CPUs ({} socket(s) x {} cores x {} threads), {} MiB memory, \
         {:.1} GiB free in {}",
        info.logical_cpus,
        info.sockets,
        info.cores_per_socket,
        info.threads_per_core,
        info.memory_mib,
        info.free_disk_gib,
        ctx.config().images_dir.display()
    ));
    if info.memory_mib < MIN_MEMORY_MIB {
        return Err(anyhow!(
            "host reports only {} MiB of memory; at least {MIN_MEMORY_MIB} MiB is needed",
            info.memory_mib
        ));
    }
    // Whole GiB only; truncation is intended.
    let max_disk_gib = info.free_disk_gib.floor() as u64;
    if max_disk_gib == 0 {
        return Err(anyhow!(
            "less than 1 GiB free in {}",
            ctx.config().images_dir.display()
        ));
    }

    let name = ask_parsed(
        prompter,
        "vm.name",
        "VM name",
        Some(ctx.config().default_vm_name.as_str()),
        parse_vm_name,
    )?;
    let memory_mib = ask_parsed(
        prompter,
        "vm.memory_mib",
        &format!("Memory for the VM in MiB (host total {})", info.memory_mib),
        None,
        |text| parse_bounded(text, MIN_MEMORY_MIB, info.memory_mib, "memory (MiB)"),
    )?;
    let disk_gib = ask_parsed(
        prompter,
        "vm.disk_gib",
        &format!("Disk size in GiB ({max_disk_gib} GiB free)"),
        None,
        |text| parse_bounded(text, 1, max_disk_gib, "disk size (GiB)"),
    )?;
    let sockets = ask_parsed(
        prompter,
        "vm.sockets",
        "CPU sockets",
        Some(info.sockets.to_string().as_str()),
        |text| parse_bounded(text, 1, info.sockets, "sockets"),
    )?;
    // Leave one core to the host by default.
    let default_cores = info.cores_per_socket.saturating_sub(1).max(1).to_string();
    let cores = ask_parsed(
        prompter,
        "vm.cores",
        "Cores per socket",
        Some(default_cores.as_str()),
        |text| parse_bounded(text, 1, info.cores_per_socket, "cores per socket"),
    )?;
    let threads = ask_parsed(
        prompter,
        "vm.threads",
        "Threads per core",
        Some(info.threads_per_core.to_string().as_str()),
        |text| parse_bounded(text, 1, info.threads_per_core, "threads per core"),
    )?;

    let vm = VmConfig {
        name,
        memory_mib,
        disk_gib,
        sockets,
        cores,
        threads,
    };
    tracing::info!(vm = %vm.name, memory_mib, disk_gib, vcpus = vm.vcpus(), "VM sized");
    StepOutput::new()
        .with("system_info", &info)?
        .with("vm_config", &vm)
}

fn virsh(ctx: &StepContext<'_>) -> HostCommand {
    HostCommand::new("virsh")
        .arg("--connect")
        .arg(ctx.config().libvirt_uri.as_str())
}

fn create_vm(ctx: &StepContext<'_>) -> Result<StepOutput> {
    let host = ctx.host;
    let vm: VmConfig = ctx.artifact("vm_config")?;
    let iso: PathBuf = ctx.artifact("windows_iso")?;

    if ctx.distro().arch_family() {
        host.run(HostCommand::new("systemctl").args(["enable", "--now", "libvirtd"]))?;
        // Fails when the network is already active, which is fine.
        if let Err(err) = host.run(virsh(ctx).args(["net-start", "default"])) {
            let error = format!("{err:#}");
            tracing::warn!(%error, "could not start the default network");
        }
        host.run(virsh(ctx).args(["net-autostart", "default"]))?;
    }

    if host.hypervisor.domain_exists(&vm.name)? {
        return Err(anyhow!(
            "a domain named `{}` already exists; pick another name or remove it with \
             `virsh undefine --nvram {}`",
            vm.name,
            vm.name
        ));
    }
    let plan = InstallPlan::new(ctx.config(), vm, iso);
    host.hypervisor
        .install(&plan)
        .with_context(|| format!("create VM `{}`", plan.vm.name))?;
    // virt-install boots the installer right away; the definition edits come first.
    if host.hypervisor.is_running(&plan.vm.name)? {
        host.hypervisor.destroy(&plan.vm.name)?;
    }
    host.prompter.notice(&format!(
        "VM `{}` created with its disk at {}. It has been powered off so its devices can be adjusted.",
        plan.vm.name,
        plan.disk_path.display()
    ));
    StepOutput::new()
        .with("domain", &plan.vm.name)?
        .with("main_disk", &plan.disk_path)
}

/// Download the VirtIO ISO into the images dir, or take a path from the operator.
fn driver_iso(ctx: &StepContext<'_>) -> Result<PathBuf> {
    let host = ctx.host;
    let url = &ctx.config().virtio_iso_url;
    if !host.prompter.confirm(
        "download_virtio_iso",
        &format!("Download the VirtIO driver ISO from {url}?"),
        true,
    )? {
        return ask_parsed(
            host.prompter.as_ref(),
            "virtio_iso",
            "Absolute path to the VirtIO driver ISO",
            None,
            |text| parse_existing_file(host, text),
        );
    }
    let iso = ctx.config().images_dir.join(DRIVER_ISO_NAME);
    let dest = host.paths.resolve(&iso);
    if dest.is_file() {
        tracing::info!(iso = %iso.display(), "driver ISO already downloaded");
    } else if host.dry_run() {
        tracing::info!(url = %url, iso = %iso.display(), "dry run: skip download");
    } else {
        download_file(url, &dest)?;
    }
    Ok(iso)
}

fn attach_driver_media(ctx: &StepContext<'_>) -> Result<StepOutput> {
    let host = ctx.host;
    let domain: String = ctx.artifact("domain")?;
    let iso = driver_iso(ctx)?;
    if host.paths.resolve(&iso).is_file() {
        ensure_qemu_can_read(host, &iso)?;
    }

    let scratch = ctx
        .config()
        .images_dir
        .join(format!("{domain}_virtio1.qcow2"));
    if host.paths.resolve(&scratch).exists() {
        tracing::info!(disk = %scratch.display(), "scratch disk already exists");
    } else {
        host.run(
            HostCommand::new("qemu-img")
                .args(["create", "-f", "qcow2"])
                .arg(scratch.display().to_string())
                .arg(SCRATCH_DISK_SIZE),
        )?;
    }

    let scratch_spec = DiskSpec {
        device: DiskDevice::Disk,
        source: scratch.display().to_string(),
        bus: "virtio",
        format: "qcow2",
    };
    let iso_spec = DiskSpec {
        device: DiskDevice::Cdrom,
        source: iso.display().to_string(),
        bus: "sata",
        format: "raw",
    };
    let (scratch_target, iso_target) =
        edit_domain(host.hypervisor.as_ref(), &domain, |definition| {
            Ok((
                edits::add_disk(definition, &scratch_spec)?,
                edits::add_disk(definition, &iso_spec)?,
            ))
        })?;

    host.prompter.notice(&format!(
        "Start `{domain}` from virt-manager and install Windows. When setup asks where to \
         install and shows no disk, load the storage driver from the VirtIO CD ({iso_target}). \
         Once Windows is running, open the VirtIO CD and run virtio-win-gt-x64.msi, then shut \
         the VM down."
    ));
    if !host.prompter.confirm(
        "windows_installed",
        "Is Windows installed with the VirtIO drivers, and is the VM shut down?",
        true,
    )? {
        return Err(anyhow!(
            "finish the Windows install and the VirtIO driver setup, then run `vmprep resume`"
        ));
    }
    StepOutput::new().with(
        "driver_iso",
        json!({
            "iso": iso,
            "iso_target": iso_target,
            "scratch_disk": scratch,
            "scratch_target": scratch_target,
        }),
    )
}

fn modify_storage_bus(ctx: &StepContext<'_>) -> Result<StepOutput> {
    let domain: String = ctx.artifact("domain")?;
    let changed = edit_domain(
        ctx.host.hypervisor.as_ref(),
        &domain,
        edits::sata_disks_to_virtio,
    )?;
    for (old, new) in &changed {
        tracing::info!(domain = %domain, from = %old, to = %new, "disk moved to virtio");
    }
    Ok(StepOutput::new())
}

fn set_display_vnc(ctx: &StepContext<'_>) -> Result<StepOutput> {
    let host = ctx.host;
    let domain: String = ctx.artifact("domain")?;
    let password = host.prompter.secret(
        "vnc_password",
        &format!(
            "VNC password (only the first {} characters are used)",
            edits::VNC_PASSWORD_MAX
        ),
    )?;
    if password.is_empty() {
        return Err(anyhow!("the VNC password must not be empty"));
    }
    let listen = ctx.config().vnc_listen.clone();
    let change = edit_domain(host.hypervisor.as_ref(), &domain, |definition| {
        edits::spice_to_vnc(definition, &listen, &password)
    })?;
    if change.password_truncated {
        tracing::warn!(
            max = edits::VNC_PASSWORD_MAX,
            "VNC password was truncated"
        );
    }

    let ssh = ctx.distro().ssh_service();
    host.run(HostCommand::new("systemctl").args(["enable", "--now", ssh]))?;
    let ip = probe::local_ip().to_string();
    host.prompter.notice(&format!(
        "`{domain}` now uses VNC. Start it and connect from another device to {ip} \
         (display port 5900 or the next free one). SSH ({ssh}) is enabled so the host \
         stays reachable once the GPU is handed to the VM."
    ));
    if !host.prompter.confirm(
        "vnc_verified",
        "Could you reach the VM over VNC from another device?",
        true,
    )? {
        return Err(anyhow!(
            "VNC must work before the GPU is passed through; fix the connection and run `vmprep resume`"
        ));
    }
    StepOutput::new().with(
        "vnc",
        json!({
            "listen": listen,
            "host_ip": ip,
            "ssh_service": ssh,
            "password_truncated": change.password_truncated,
            "removed_spice_devices": change.removed_spice_devices,
        }),
    )
}

fn describe_gpu(group: &[PciDevice]) -> String {
    group
        .iter()
        .map(|device| {
            format!(
                "{} [{}:{}]",
                device.address,
                device.vendor.trim_start_matches("0x"),
                device.device.trim_start_matches("0x")
            )
        })
        .collect::<Vec<_>>()
        .join(" + ")
}

fn attach_gpu(ctx: &StepContext<'_>) -> Result<StepOutput> {
    let host = ctx.host;
    let domain: String = ctx.artifact("domain")?;
    let groups = probe::gpu_groups(&probe::pci_devices(&host.paths)?);
    if groups.is_empty() {
        return Err(anyhow!(
            "no display controller found under /sys/bus/pci/devices"
        ));
    }
    let listing: Vec<String> = groups
        .iter()
        .enumerate()
        .map(|(index, group)| format!("  {}) {}", index + 1, describe_gpu(group)))
        .collect();
    host.prompter
        .notice(&format!("GPUs on this host:\n{}", listing.join("\n")));
    let choice = ask_parsed(
        host.prompter.as_ref(),
        "gpu",
        "Which GPU should the VM get?",
        Some("1"),
        |text| parse_bounded(text, 1, groups.len(), "GPU number"),
    )?;
    let selected = groups
        .get(choice - 1)
        .cloned()
        .ok_or_else(|| anyhow!("GPU {choice} is not listed"))?;
    let added = edit_domain(host.hypervisor.as_ref(), &domain, |definition| {
        edits::add_hostdevs(definition, &selected)
    })?;
    let gpu = describe_gpu(&selected);
    tracing::info!(domain = %domain, %gpu, added, "GPU attached");
    StepOutput::new().with("gpu_devices", &selected)
}

fn install_lifecycle_hooks(ctx: &StepContext<'_>) -> Result<StepOutput> {
    let domain: String = ctx.artifact("domain")?;
    let devices: Vec<PciDevice> = ctx.artifact("gpu_devices")?;
    let report = install_hooks(ctx.host, &domain, &devices)?;
    StepOutput::new().with("hooks", report)
}

fn cleanup_drives(ctx: &StepContext<'_>) -> Result<StepOutput> {
    let host = ctx.host;
    let domain: String = ctx.artifact("domain")?;
    let main_disk: PathBuf = ctx.artifact("main_disk")?;
    let main = main_disk.display().to_string();
    let removed = edit_domain(host.hypervisor.as_ref(), &domain, |definition| {
        edits::remove_disks_except(definition, &main)
    })?;
    for disk in &removed {
        let source = disk.source.as_deref().unwrap_or("-");
        tracing::info!(domain = %domain, target = %disk.target, source, "drive detached");
    }
    host.prompter.notice(&format!(
        "`{domain}` is ready. Starting it hands the GPU to Windows; connect over VNC or SSH \
         while the host display is released."
    ));
    StepOutput::new().with("detached_disks", removed)
}

#[cfg(test)]
#[path = "vm_create_tests.rs"]
mod tests;
