//! `vmprep move-disk`: relocate a stopped VM's disk image and repoint its definition.
use super::context::{load_host, state_paths};
use super::EXIT_SUCCESS;
use crate::cli::{GlobalArgs, MoveDiskArgs};
use crate::host::{Host, HostCommand};
use crate::libvirt::edits::{self, DiskRef};
use crate::libvirt::xml::Element;
use crate::libvirt::edit_domain;
use anyhow::{anyhow, Context, Result};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

const DISK_MODE: u32 = 0o660;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskMove {
    pub from: PathBuf,
    pub to: PathBuf,
    pub bytes: u64,
}

pub fn run_move_disk(global: &GlobalArgs, args: &MoveDiskArgs) -> Result<u8> {
    let state = state_paths(global)?;
    let host = load_host(global, &state)?;
    let moved = move_disk(&host, &args.vm, &args.dest)?;
    println!(
        "moved {} to {} ({} bytes)",
        moved.from.display(),
        moved.to.display(),
        moved.bytes
    );
    Ok(EXIT_SUCCESS)
}

/// Copy, redefine, fix ownership, and only then remove the original.
///
/// A failure before the redefine leaves the VM on its original disk.
pub fn move_disk(host: &Host, vm: &str, dest_dir: &Path) -> Result<DiskMove> {
    if !dest_dir.is_absolute() {
        return Err(anyhow!("destination {} is not absolute", dest_dir.display()));
    }
    if !host.paths.resolve(dest_dir).is_dir() {
        return Err(anyhow!("destination {} is not a directory", dest_dir.display()));
    }
    let hypervisor = host.hypervisor.as_ref();
    if hypervisor.is_running(vm)? {
        return Err(anyhow!("`{vm}` is running; shut it down before moving its disk"));
    }
    let xml = hypervisor.domain_xml(vm)?;
    let domain = Element::parse(&xml).with_context(|| format!("parse definition of `{vm}`"))?;
    let from = main_disk_source(&edits::disks(&domain)?, vm)?;
    let file_name = Path::new(&from)
        .file_name()
        .ok_or_else(|| anyhow!("disk source `{from}` has no file name"))?;
    let to = dest_dir.join(file_name);
    if to == Path::new(&from) {
        return Err(anyhow!("{from} is already in {}", dest_dir.display()));
    }
    if host.paths.resolve(&to).exists() {
        return Err(anyhow!("{} already exists; refusing to overwrite it", to.display()));
    }
    let to_text = to
        .to_str()
        .ok_or_else(|| anyhow!("destination {} is not valid UTF-8", to.display()))?
        .to_string();

    let bytes = host.copy_file(&from, &to)?;
    let updated = edit_domain(hypervisor, vm, |domain| {
        edits::relocate_disk(domain, &from, &to_text)
    });
    match updated {
        Ok(count) => tracing::info!(domain = vm, disks = count, to = %to_text, "definition repointed"),
        Err(err) => {
            // The VM still uses the original; drop the orphaned copy.
            if let Err(cleanup) = host.remove_file(&to) {
                let error = format!("{cleanup:#}");
                tracing::warn!(%error, "could not remove partial copy");
            }
            return Err(err.context(format!("repoint `{vm}` at {to_text}")));
        }
    }

    let owner = host.distro.qemu_owner();
    host.run(HostCommand::new("chown").args([owner, to_text.as_str()]))
        .with_context(|| format!("hand {to_text} to {owner}"))?;
    host.set_mode(&to, DISK_MODE)?;
    if !dest_dir.starts_with(&host.config.images_dir) {
        let dir = dest_dir.display().to_string();
        host.run(HostCommand::new("chown").args([owner, dir.as_str()]))
            .with_context(|| format!("hand {dir} to {owner}"))?;
    }
    host.remove_file(&from)?;
    Ok(DiskMove {
        from: PathBuf::from(from),
        to,
        bytes,
    })
}

/// The file-backed disk named after the VM, or the only one it has.
fn main_disk_source(disks: &[DiskRef], vm: &str) -> Result<String> {
    let files: Vec<&str> = disks
        .iter()
        .filter(|disk| disk.device == "disk")
        .filter_map(|disk| disk.source.as_deref())
        .collect();
    let preferred = format!("{vm}.qcow2");
    if let Some(found) = files
        .iter()
        .find(|source| Path::new(source).file_name() == Some(OsStr::new(&preferred)))
    {
        return Ok(found.to_string());
    }
    match files.as_slice() {
        [only] => Ok(only.to_string()),
        [] => Err(anyhow!("`{vm}` has no file-backed disk")),
        many => Err(anyhow!(
            "`{vm}` has several disks and none is named {preferred}: {}",
            many.join(", ")
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::host::testing::FakeHost;
    use crate::host::Distro;
    use crate::libvirt::{Hypervisor, InstallPlan, VmConfig};

    const ORIGINAL: &str = "/var/lib/libvirt/images/Gaming.qcow2";

    fn provisioned(distro: Distro) -> FakeHost {
        let fake = FakeHost::new(distro);
        fake.write(ORIGINAL, "disk image bytes");
        fake.mkdir("/mnt/fast");
        let plan = InstallPlan::new(
            &Config::default(),
            VmConfig {
                name: "Gaming".to_string(),
                memory_mib: 8192,
                disk_gib: 64,
                sockets: 1,
                cores: 4,
                threads: 2,
            },
            PathBuf::from("/isos/win11.iso"),
        );
        fake.hypervisor.install(&plan).expect("install");
        fake.hypervisor.destroy("Gaming").expect("stop");
        fake
    }

    #[test]
    fn disk_moves_and_definition_follows() {
        let fake = provisioned(Distro::Ubuntu);
        let moved = move_disk(&fake.host, "Gaming", Path::new("/mnt/fast")).expect("move");

        assert_eq!(moved.from, PathBuf::from(ORIGINAL));
        assert_eq!(moved.to, PathBuf::from("/mnt/fast/Gaming.qcow2"));
        assert_eq!(moved.bytes, 16);
        assert_eq!(fake.read("/mnt/fast/Gaming.qcow2"), "disk image bytes");
        assert!(!fake.path(ORIGINAL).exists());

        let xml = fake.hypervisor.domain_xml("Gaming").expect("xml");
        assert!(xml.contains("/mnt/fast/Gaming.qcow2"), "{xml}");
        assert!(!xml.contains(ORIGINAL), "{xml}");
        assert_eq!(
            fake.runner.commands(),
            vec![
                "chown libvirt-qemu:kvm /mnt/fast/Gaming.qcow2",
                "chown libvirt-qemu:kvm /mnt/fast",
            ]
        );
    }

    #[test]
    fn running_vm_is_left_alone() {
        let fake = provisioned(Distro::Fedora);
        fake.hypervisor
            .install(&InstallPlan::new(
                &Config::default(),
                VmConfig {
                    name: "Other".to_string(),
                    memory_mib: 4096,
                    disk_gib: 32,
                    sockets: 1,
                    cores: 2,
                    threads: 1,
                },
                PathBuf::from("/isos/win11.iso"),
            ))
            .expect("install");
        let err = move_disk(&fake.host, "Other", Path::new("/mnt/fast")).expect_err("running");
        assert!(err.to_string().contains("is running"), "{err}");
    }

    #[test]
    fn existing_destination_file_is_never_overwritten() {
        let fake = provisioned(Distro::Fedora);
        fake.write("/mnt/fast/Gaming.qcow2", "someone else's disk");
        let err = move_disk(&fake.host, "Gaming", Path::new("/mnt/fast")).expect_err("exists");
        assert!(err.to_string().contains("refusing to overwrite"), "{err}");
        assert_eq!(fake.read(ORIGINAL), "disk image bytes");
        assert_eq!(fake.read("/mnt/fast/Gaming.qcow2"), "someone else's disk");
    }

    #[test]
    fn main_disk_prefers_the_vm_named_image() {
        let disk = |target: &str, source: &str| DiskRef {
            device: "disk".to_string(),
            target: target.to_string(),
            bus: Some("virtio".to_string()),
            source: Some(source.to_string()),
        };
        let disks = vec![
            disk("vda", "/images/Gaming_virtio1.qcow2"),
            disk("vdb", "/images/Gaming.qcow2"),
        ];
        assert_eq!(
            main_disk_source(&disks, "Gaming").expect("main"),
            "/images/Gaming.qcow2"
        );
        assert!(main_disk_source(&disks, "Other").is_err());
        assert_eq!(
            main_disk_source(&disks[..1], "Other").expect("only disk"),
            "/images/Gaming_virtio1.qcow2"
        );
    }
}
