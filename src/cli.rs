//! CLI argument parsing for vmprep.
//!
//! The CLI stays thin: it resolves state, config, and host collaborators,
//! then hands off to the workflow engine or a one-shot utility.
use crate::engine::Phase;
use crate::host::Distro;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "vmprep",
    version,
    about = "Resumable host preparation and VM provisioning for GPU passthrough",
    after_help = "Phases:\n  host-prep   Install packages, enable IOMMU boot parameters, verify after reboot\n  vm-create   Create the Windows VM, then rework it for passthrough and remote access\n\nExamples:\n  sudo vmprep run host-prep\n  sudo vmprep resume\n  vmprep status --json\n  sudo vmprep move-disk --vm Windows_VM --dest /mnt/fast",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Directory holding progress.json, completed.json, and history.jsonl
    #[arg(long, global = true, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    /// Root prefixed to every host path that is read or written
    #[arg(long, global = true, value_name = "DIR", default_value = "/")]
    pub sysroot: PathBuf,

    /// Config file (defaults to $VMPREP_CONFIG, then <state-dir>/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Skip /etc/os-release detection
    #[arg(long, global = true, value_name = "ID")]
    pub distro: Option<Distro>,

    /// Log host commands instead of running them and simulate libvirt
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Never prompt: confirmations answer yes, other questions use --answers or defaults
    #[arg(long, global = true)]
    pub unattended: bool,

    /// JSON object of prompt answers keyed by question id (implies --unattended)
    #[arg(long, global = true, value_name = "PATH")]
    pub answers: Option<PathBuf>,

    /// Debug logging (VMPREP_LOG or RUST_LOG take a full filter)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    Resume(ResumeArgs),
    Abandon(AbandonArgs),
    Status(StatusArgs),
    Steps(StepsArgs),
    MoveDisk(MoveDiskArgs),
    Config(ConfigArgs),
}

#[derive(Parser, Debug)]
#[command(about = "Run a phase from its first incomplete step")]
pub struct RunArgs {
    /// Phase to run (host-prep or vm-create)
    #[arg(value_name = "PHASE")]
    pub phase: Phase,

    /// Run the phase again even if it completed before
    #[arg(long)]
    pub rerun: bool,

    #[command(flatten)]
    pub checkpoint: RebootArgs,
}

#[derive(Parser, Debug)]
#[command(about = "Continue the phase that is in progress")]
pub struct ResumeArgs {
    #[command(flatten)]
    pub checkpoint: RebootArgs,
}

/// How to treat a reboot checkpoint.
#[derive(Args, Debug, Clone, Copy, Default)]
pub struct RebootArgs {
    /// Continue past a reboot checkpoint even though the boot id is unchanged
    #[arg(long)]
    pub assume_rebooted: bool,

    /// Reboot immediately when a step requires it instead of asking
    #[arg(long)]
    pub reboot: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Discard in-progress state so a phase can start over")]
pub struct AbandonArgs {
    /// Only abandon if this phase is the one in progress
    #[arg(long, value_name = "PHASE")]
    pub phase: Option<Phase>,
}

#[derive(Parser, Debug)]
#[command(about = "Show where the workflow stands and what to do next")]
pub struct StatusArgs {
    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "List the ordered steps of one or both phases")]
pub struct StepsArgs {
    /// Limit the listing to one phase
    #[arg(value_name = "PHASE")]
    pub phase: Option<Phase>,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Move a VM's main disk image to another directory")]
pub struct MoveDiskArgs {
    /// Domain whose disk is moved
    #[arg(long, value_name = "NAME")]
    pub vm: String,

    /// Destination directory
    #[arg(long, value_name = "DIR")]
    pub dest: PathBuf,
}

#[derive(Parser, Debug)]
#[command(about = "Print the effective configuration as JSON")]
pub struct ConfigArgs {
    /// Print the built-in defaults instead, as a starting config.json
    #[arg(long)]
    pub default: bool,
}
