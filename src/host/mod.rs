//! Collaborators that touch the host: commands, files, probes, and prompts.
//!
//! `Host` bundles them so steps receive one handle. File access goes through
//! the sysroot; writes are suppressed only when a dry run targets the live
//! root filesystem.
mod boot;
mod distro;
mod hooks;
mod media;
pub mod probe;
mod prompt;
mod runner;
#[cfg(test)]
pub(crate) mod testing;

pub use boot::{apply_boot_parameters, BootReport};
pub use distro::{BootLoader, Distro, InitramfsTool, PackageManager};
pub use hooks::{install_hooks, HookReport};
pub use media::{download_file, ensure_qemu_can_read};
pub use prompt::{ask_parsed, Prompter, TerminalPrompter, UnattendedPrompter};
pub use runner::{CommandOutput, CommandRunner, DryRunRunner, HostCommand, SystemRunner};

use crate::config::Config;
use crate::libvirt::Hypervisor;
use crate::paths::HostPaths;
use crate::util::{publish_staged, stage_bytes};
use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

const DEFAULT_FILE_MODE: u32 = 0o644;

pub struct Host {
    pub paths: HostPaths,
    pub config: Config,
    pub distro: Distro,
    pub runner: Arc<dyn CommandRunner>,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub prompter: Box<dyn Prompter>,
}

impl Host {
    pub fn dry_run(&self) -> bool {
        self.runner.is_dry_run()
    }

    /// True when file edits would land on the live system during a dry run.
    fn suppress_writes(&self) -> bool {
        self.dry_run() && self.paths.sysroot() == Path::new("/")
    }

    pub fn run(&self, command: HostCommand) -> Result<CommandOutput> {
        self.runner.run(&command)
    }

    pub fn boot_id(&self) -> Option<String> {
        probe::boot_id(&self.paths)
    }

    pub fn read_to_string(&self, host_path: impl AsRef<Path>) -> Result<String> {
        let path = self.paths.resolve(host_path);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Read a file that may legitimately be absent.
    pub fn read_optional(&self, host_path: impl AsRef<Path>) -> Result<Option<String>> {
        let path = self.paths.resolve(host_path);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
        }
    }

    /// Atomically replace a host file, creating parent directories as needed.
    pub fn write_file(&self, host_path: impl AsRef<Path>, contents: &str) -> Result<()> {
        let host_path = host_path.as_ref();
        if self.suppress_writes() {
            tracing::info!(
                path = %host_path.display(),
                bytes = contents.len(),
                "dry run: skip write"
            );
            return Ok(());
        }
        let path = self.paths.resolve(host_path);
        // Replacing a config file must not tighten it to the temp file's 0600.
        let mode = fs::metadata(&path)
            .map(|meta| meta.permissions().mode() & 0o7777)
            .unwrap_or(DEFAULT_FILE_MODE);
        let staged = stage_bytes(&path, contents.as_bytes())?;
        staged
            .as_file()
            .set_permissions(fs::Permissions::from_mode(mode))
            .with_context(|| format!("chmod staged {}", path.display()))?;
        publish_staged(staged, &path)?;
        tracing::info!(path = %path.display(), "wrote file");
        Ok(())
    }

    /// OR `bits` into the mode of a host file or directory.
    pub fn add_mode_bits(&self, host_path: impl AsRef<Path>, bits: u32) -> Result<bool> {
        let path = self.paths.resolve(host_path);
        let mode = fs::metadata(&path)
            .with_context(|| format!("stat {}", path.display()))?
            .permissions()
            .mode();
        if mode & bits == bits {
            return Ok(false);
        }
        let octal = format!("{:o}", (mode | bits) & 0o7777);
        if self.suppress_writes() {
            tracing::info!(path = %path.display(), mode = %octal, "dry run: skip chmod");
            return Ok(true);
        }
        fs::set_permissions(&path, fs::Permissions::from_mode(mode | bits))
            .with_context(|| format!("chmod {}", path.display()))?;
        tracing::info!(path = %path.display(), mode = %octal, "permissions updated");
        Ok(true)
    }

    /// Copy a host file, publishing the copy only once it is complete and synced.
    pub fn copy_file(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<u64> {
        let (from, to) = (from.as_ref(), to.as_ref());
        if self.suppress_writes() {
            tracing::info!(from = %from.display(), to = %to.display(), "dry run: skip copy");
            return Ok(0);
        }
        let source = self.paths.resolve(from);
        let dest = self.paths.resolve(to);
        let mode = fs::metadata(&source)
            .with_context(|| format!("stat {}", source.display()))?
            .permissions()
            .mode()
            & 0o7777;
        let mut input =
            fs::File::open(&source).with_context(|| format!("open {}", source.display()))?;
        let mut staged = stage_bytes(&dest, &[])?;
        let bytes = io::copy(&mut input, &mut staged)
            .with_context(|| format!("copy {} to {}", source.display(), dest.display()))?;
        staged
            .as_file()
            .set_permissions(fs::Permissions::from_mode(mode))
            .with_context(|| format!("chmod staged {}", dest.display()))?;
        staged
            .as_file()
            .sync_all()
            .with_context(|| format!("sync staged {}", dest.display()))?;
        publish_staged(staged, &dest)?;
        tracing::info!(from = %source.display(), to = %dest.display(), bytes, "copied file");
        Ok(bytes)
    }

    pub fn remove_file(&self, host_path: impl AsRef<Path>) -> Result<()> {
        let host_path = host_path.as_ref();
        if self.suppress_writes() {
            tracing::info!(path = %host_path.display(), "dry run: skip remove");
            return Ok(());
        }
        let path = self.paths.resolve(host_path);
        fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))
    }

    pub fn set_mode(&self, host_path: impl AsRef<Path>, mode: u32) -> Result<()> {
        let path = self.paths.resolve(host_path);
        if self.suppress_writes() {
            return Ok(());
        }
        fs::set_permissions(&path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("chmod {}", path.display()))
    }
}
