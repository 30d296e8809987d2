//! `host-prep`: packages, IOMMU boot parameters, then a post-reboot check.
use crate::engine::{Phase, Step, StepContext, StepOutput};
use crate::host::{apply_boot_parameters, probe, BootReport};
use anyhow::{anyhow, Context, Result};
use serde_json::json;

pub(super) fn steps() -> Vec<Step> {
    vec![
        Step::from_fn(Phase::HostPrep, "install_packages", install_packages)
            .summary("Install the virtualization stack with the distro package manager")
            .produces(&["packages"]),
        Step::from_fn(Phase::HostPrep, "boot_parameters", boot_parameters)
            .summary("Enable IOMMU kernel parameters and load VFIO from the initramfs")
            .reboot_after()
            .produces(&["boot_parameters"]),
        Step::from_fn(Phase::HostPrep, "verify_iommu", verify_iommu)
            .summary("Check that the rebooted kernel exposes IOMMU groups")
            .produces(&["iommu_groups"]),
    ]
}

fn install_packages(ctx: &StepContext<'_>) -> Result<StepOutput> {
    let distro = ctx.distro();
    let manager = distro.package_manager();
    let packages = distro.packages();
    ctx.host
        .run(manager.install_command(packages))
        .with_context(|| format!("install virtualization packages with {}", manager.as_str()))?;
    tracing::info!(manager = manager.as_str(), count = packages.len(), "packages installed");
    StepOutput::new().with(
        "packages",
        json!({"manager": manager.as_str(), "installed": packages}),
    )
}

fn boot_parameters(ctx: &StepContext<'_>) -> Result<StepOutput> {
    let report = apply_boot_parameters(ctx.host)?;
    StepOutput::new().with("boot_parameters", report)
}

fn verify_iommu(ctx: &StepContext<'_>) -> Result<StepOutput> {
    let count = probe::iommu_group_count(&ctx.host.paths)?;
    let cmdline = probe::kernel_cmdline(&ctx.host.paths).unwrap_or_default();
    if count == 0 {
        let boot: Option<BootReport> = ctx.artifact_opt("boot_parameters")?;
        let hint = match boot {
            Some(report) if !report.kernel_parameters_applied => {
                "the CPU vendor was not recognized, so add the IOMMU kernel parameters by hand"
                    .to_string()
            }
            Some(report) => format!(
                "expected `{}` on the kernel command line; check that VT-d/AMD-Vi is enabled in firmware",
                report.kernel_parameters.join(" ")
            ),
            None => "check that VT-d/AMD-Vi is enabled in firmware".to_string(),
        };
        return Err(anyhow!(
            "no IOMMU groups under /sys/kernel/iommu_groups (kernel command line: `{cmdline}`); {hint}"
        ));
    }
    tracing::info!(groups = count, "IOMMU is active");
    StepOutput::new().with("iommu_groups", json!({"count": count, "cmdline": cmdline}))
}
