//! `vmprep`: resumable GPU-passthrough host preparation and VM provisioning.
mod cli;
mod config;
mod engine;
mod host;
mod libvirt;
mod paths;
mod steps;
mod templates;
mod util;
mod workflow;

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "VMPREP_LOG";

fn main() -> ExitCode {
    let args = cli::RootArgs::parse();
    init_tracing(args.global.verbose);
    match workflow::dispatch(&args) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(workflow::EXIT_FAILURE)
        }
    }
}

/// Logs go to stderr so stdout stays parseable; `-v` wins over the env filter.
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        std::env::var(LOG_ENV)
            .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
            .ok()
            .and_then(|spec| EnvFilter::try_new(spec).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
