//! The standard step catalog for both phases.
//!
//! Steps only orchestrate: they ask the operator, call a host or libvirt
//! collaborator, and hand back the artifacts later steps read.
mod host_prep;
mod vm_create;

use crate::engine::{Phase, StepRegistry};
use crate::host::{Distro, Host};
use anyhow::{anyhow, Context, Result};
use std::ffi::OsStr;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

/// Both phases, validated.
pub fn standard_registry() -> Result<StepRegistry> {
    let mut steps = host_prep::steps();
    steps.extend(vm_create::steps());
    StepRegistry::new(steps).context("build standard step registry")
}

/// Executables a phase shells out to on a real host.
pub fn required_tools(phase: Phase, distro: Distro) -> Vec<String> {
    match phase {
        Phase::HostPrep => {
            let install = distro.package_manager().install_command(&[]);
            vec![install.program().to_string()]
        }
        Phase::VmCreate => ["virsh", "virt-install", "qemu-img", "systemctl"]
            .into_iter()
            .map(str::to_string)
            .collect(),
    }
}

/// Whole number in `min..=max`.
fn parse_bounded<T>(text: &str, min: T, max: T, what: &str) -> Result<T>
where
    T: FromStr + PartialOrd + Display + Copy,
{
    let value: T = text
        .parse()
        .map_err(|_| anyhow!("`{text}` is not a whole number"))?;
    if value < min || value > max {
        return Err(anyhow!("{what} must be between {min} and {max}, got {value}"));
    }
    Ok(value)
}

/// An absolute path to an existing file on the host.
fn parse_existing_file(host: &Host, text: &str) -> Result<PathBuf> {
    let path = PathBuf::from(text);
    if !path.is_absolute() {
        return Err(anyhow!("`{text}` is not an absolute path"));
    }
    if !host.paths.resolve(&path).is_file() {
        return Err(anyhow!("{} does not exist or is not a file", path.display()));
    }
    let is_iso = path
        .extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| ext.eq_ignore_ascii_case("iso"));
    if !is_iso {
        tracing::warn!(path = %path.display(), "file does not have an .iso extension");
    }
    Ok(path)
}
