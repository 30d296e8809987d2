//! Domain definition access: `virsh` for real hosts, an in-memory store for
//! simulated runs, and pure XML edits shared by both.
pub mod edits;
mod install;
pub mod xml;

pub use install::{InstallPlan, VmConfig};

use crate::host::{CommandRunner, HostCommand};
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use xml::Element;

pub trait Hypervisor: Send + Sync {
    /// Create and start the guest described by `plan`.
    fn install(&self, plan: &InstallPlan) -> Result<()>;

    /// Persistent (inactive) definition of `name`.
    fn domain_xml(&self, name: &str) -> Result<String>;

    /// Replace the persistent definition; takes effect on the next boot.
    fn define(&self, xml: &str) -> Result<()>;

    fn domain_exists(&self, name: &str) -> Result<bool>;

    fn is_running(&self, name: &str) -> Result<bool>;

    /// Power the guest off immediately.
    fn destroy(&self, name: &str) -> Result<()>;
}

/// Load, edit, and redefine `name`; nothing is written when the edit is a no-op.
pub fn edit_domain<T>(
    hypervisor: &dyn Hypervisor,
    name: &str,
    edit: impl FnOnce(&mut Element) -> Result<T>,
) -> Result<T> {
    let xml = hypervisor.domain_xml(name)?;
    let mut domain =
        Element::parse(&xml).with_context(|| format!("parse definition of `{name}`"))?;
    let before = domain.clone();
    let result = edit(&mut domain)?;
    if domain == before {
        tracing::info!(domain = name, "definition already up to date");
    } else {
        hypervisor.define(&domain.to_xml()?)?;
        tracing::info!(domain = name, "definition updated");
    }
    Ok(result)
}

/// Talks to libvirt through the `virsh` and `virt-install` CLIs.
pub struct Virsh {
    runner: Arc<dyn CommandRunner>,
    uri: String,
}

impl Virsh {
    pub fn new(runner: Arc<dyn CommandRunner>, uri: &str) -> Self {
        Self {
            runner,
            uri: uri.to_string(),
        }
    }

    fn virsh(&self) -> HostCommand {
        HostCommand::new("virsh")
            .arg("--connect")
            .arg(self.uri.as_str())
    }

    fn list(&self, extra: &[&str]) -> Result<Vec<String>> {
        let output = self
            .runner
            .run(&self.virsh().args(["list", "--name"]).args(extra.iter().copied()))?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

impl Hypervisor for Virsh {
    fn install(&self, plan: &InstallPlan) -> Result<()> {
        self.runner.run(&plan.virt_install())?;
        Ok(())
    }

    fn domain_xml(&self, name: &str) -> Result<String> {
        let output = self
            .runner
            .run(&self.virsh().args(["dumpxml", "--inactive", name]))?;
        if output.stdout.trim().is_empty() {
            return Err(anyhow!("virsh returned an empty definition for `{name}`"));
        }
        Ok(output.stdout)
    }

    fn define(&self, xml: &str) -> Result<()> {
        self.runner
            .run(&self.virsh().args(["define", "/dev/stdin"]).stdin(xml))?;
        Ok(())
    }

    fn domain_exists(&self, name: &str) -> Result<bool> {
        Ok(self.list(&["--all"])?.iter().any(|domain| domain == name))
    }

    fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self
            .list(&["--state-running"])?
            .iter()
            .any(|domain| domain == name))
    }

    fn destroy(&self, name: &str) -> Result<()> {
        self.runner.run(&self.virsh().args(["destroy", name]))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredDomain {
    xml: String,
    running: bool,
}

/// Keeps definitions in memory; dry runs and tests use it instead of libvirt.
#[derive(Debug, Default)]
pub struct MemoryHypervisor {
    domains: Mutex<BTreeMap<String, StoredDomain>>,
}

impl MemoryHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn domains(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, StoredDomain>>> {
        self.domains
            .lock()
            .map_err(|_| anyhow!("in-memory hypervisor lock poisoned"))
    }
}

impl Hypervisor for MemoryHypervisor {
    fn install(&self, plan: &InstallPlan) -> Result<()> {
        let xml = plan.preview_xml()?;
        let mut domains = self.domains()?;
        if domains.contains_key(&plan.vm.name) {
            return Err(anyhow!("domain `{}` already exists", plan.vm.name));
        }
        tracing::info!(domain = %plan.vm.name, "simulated install");
        domains.insert(plan.vm.name.clone(), StoredDomain { xml, running: true });
        Ok(())
    }

    fn domain_xml(&self, name: &str) -> Result<String> {
        self.domains()?
            .get(name)
            .map(|domain| domain.xml.clone())
            .ok_or_else(|| anyhow!("domain `{name}` not found"))
    }

    fn define(&self, xml: &str) -> Result<()> {
        let name = edits::domain_name(&Element::parse(xml)?)
            .ok_or_else(|| anyhow!("definition has no <name>"))?;
        let mut domains = self.domains()?;
        let running = domains.get(&name).is_some_and(|domain| domain.running);
        domains.insert(
            name,
            StoredDomain {
                xml: xml.to_string(),
                running,
            },
        );
        Ok(())
    }

    fn domain_exists(&self, name: &str) -> Result<bool> {
        Ok(self.domains()?.contains_key(name))
    }

    fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self.domains()?.get(name).is_some_and(|domain| domain.running))
    }

    fn destroy(&self, name: &str) -> Result<()> {
        let mut domains = self.domains()?;
        let domain = domains
            .get_mut(name)
            .ok_or_else(|| anyhow!("domain `{name}` not found"))?;
        if !domain.running {
            return Err(anyhow!("domain `{name}` is not running"));
        }
        domain.running = false;
        Ok(())
    }
}
