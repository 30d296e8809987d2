//! Resolve state, config, and host collaborators from the global flags.
use crate::cli::GlobalArgs;
use crate::config::{self, Config, CONFIG_ENV, STATE_DIR_ENV};
use crate::engine::Phase;
use crate::host::{
    CommandRunner, Distro, DryRunRunner, Host, Prompter, SystemRunner, TerminalPrompter,
    UnattendedPrompter,
};
use crate::libvirt::{Hypervisor, MemoryHypervisor, Virsh};
use crate::paths::{HostPaths, StatePaths};
use crate::steps;
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

pub(crate) fn state_paths(global: &GlobalArgs) -> Result<StatePaths> {
    let env_value = std::env::var(STATE_DIR_ENV).ok();
    let root = config::resolve_state_dir(global.state_dir.as_deref(), env_value.as_deref())?;
    Ok(StatePaths::new(root))
}

/// The config in effect: explicit file, env file, state-dir file, or defaults.
pub(crate) fn effective_config(global: &GlobalArgs, state: &StatePaths) -> Result<Config> {
    let env_value = std::env::var(CONFIG_ENV).ok();
    match config::resolve_config_path(
        global.config.as_deref(),
        env_value.as_deref(),
        &state.config_path(),
    ) {
        Some(path) => {
            let loaded = config::load_config(&path)?;
            tracing::debug!(path = %path.display(), "config loaded");
            Ok(loaded)
        }
        None => Ok(Config::default()),
    }
}

/// Build the host handle: real commands and `virsh`, or a recorder and an
/// in-memory hypervisor for dry runs.
pub(crate) fn load_host(global: &GlobalArgs, state: &StatePaths) -> Result<Host> {
    if !global.sysroot.is_dir() {
        return Err(anyhow!(
            "sysroot {} is not a directory",
            global.sysroot.display()
        ));
    }
    let config = effective_config(global, state)?;
    let paths = HostPaths::new(global.sysroot.clone());
    let distro = match global.distro {
        Some(distro) => distro,
        None => Distro::detect(&paths)?,
    };

    let (runner, hypervisor): (Arc<dyn CommandRunner>, Arc<dyn Hypervisor>) = if global.dry_run
    {
        (
            Arc::new(DryRunRunner::new()),
            Arc::new(MemoryHypervisor::new()),
        )
    } else {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let hypervisor = Arc::new(Virsh::new(runner.clone(), &config.libvirt_uri));
        (runner, hypervisor)
    };
    let sysroot = paths.sysroot().display().to_string();
    tracing::debug!(%distro, %sysroot, dry_run = global.dry_run, "host loaded");

    Ok(Host {
        paths,
        config,
        distro,
        runner,
        hypervisor,
        prompter: prompter(global)?,
    })
}

fn prompter(global: &GlobalArgs) -> Result<Box<dyn Prompter>> {
    if let Some(path) = &global.answers {
        return Ok(Box::new(UnattendedPrompter::from_file(path)?));
    }
    if global.unattended {
        return Ok(Box::new(UnattendedPrompter::new(BTreeMap::new())));
    }
    Ok(Box::new(TerminalPrompter))
}

/// Refuse to start a real run that is bound to fail on its first command.
pub(crate) fn preflight(host: &Host, phase: Phase) -> Result<()> {
    if host.dry_run() {
        return Ok(());
    }
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(anyhow!(
            "{phase} changes system configuration; run vmprep as root (for example with sudo)"
        ));
    }
    let missing: Vec<String> = steps::required_tools(phase, host.distro)
        .into_iter()
        .filter(|tool| which::which(tool).is_err())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    let hint = match phase {
        Phase::HostPrep => "is this the distribution vmprep detected?",
        Phase::VmCreate => "run `vmprep run host-prep` first",
    };
    Err(anyhow!(
        "{phase} needs {} on PATH; {hint}",
        missing.join(", ")
    ))
}
