//! Command handlers behind the CLI.
//!
//! Each handler resolves what it needs from the global flags, does one job,
//! and returns the process exit code.
mod context;
mod disk;
mod run;
mod status;

pub use disk::run_move_disk;
pub use run::{run_resume, run_run};
pub use status::{run_abandon, run_config, run_status, run_steps};

use crate::cli::{Command, RootArgs};
use crate::engine::WorkflowError;
use anyhow::Result;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_REBOOT_REQUIRED: u8 = 2;
pub const EXIT_CANCELLED: u8 = 130;

/// Route a parsed command line to its handler.
pub fn dispatch(args: &RootArgs) -> Result<u8> {
    let global = &args.global;
    match &args.command {
        Command::Run(run) => run_run(global, run),
        Command::Resume(resume) => run_resume(global, resume),
        Command::Abandon(abandon) => run_abandon(global, abandon),
        Command::Status(status) => run_status(global, status),
        Command::Steps(steps) => run_steps(steps),
        Command::MoveDisk(move_disk) => run_move_disk(global, move_disk),
        Command::Config(config) => run_config(global, config),
    }
}

/// Print a workflow error with its recovery hint and return its exit code.
pub(crate) fn report_workflow_error(err: &WorkflowError) -> u8 {
    eprintln!("error: {err}");
    if matches!(err, WorkflowError::StoreCorrupt { .. }) {
        eprintln!("hint: `vmprep abandon` moves the unreadable record aside so the phase can start over");
    }
    err.exit_code()
}
