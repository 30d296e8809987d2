//! `vmprep run` and `vmprep resume`.
//!
//! The engine runs on a worker thread; the foreground thread renders its
//! events and turns Ctrl-C into a cancellation honored between steps.
use super::context::{load_host, preflight, state_paths};
use super::{report_workflow_error, EXIT_CANCELLED, EXIT_REBOOT_REQUIRED, EXIT_SUCCESS};
use crate::cli::{GlobalArgs, RebootArgs, ResumeArgs, RunArgs};
use crate::engine::{
    Engine, Phase, PhaseOutcome, ProgressStore, RunOptions, StepRegistry, WorkflowError,
    WorkflowEvent, WorkflowState,
};
use crate::host::{Host, HostCommand};
use crate::paths::StatePaths;
use crate::steps;
use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const EVENT_POLL: Duration = Duration::from_millis(200);

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
    // A second Ctrl-C falls through to the default action and ends the process.
    // SAFETY: signal() is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
    }
}

fn install_interrupt_handler() {
    let handler: extern "C" fn(libc::c_int) = on_interrupt;
    // SAFETY: the handler only stores to an atomic and resets the disposition.
    let previous = unsafe { libc::signal(libc::SIGINT, handler as libc::sighandler_t) };
    if previous == libc::SIG_ERR {
        tracing::warn!("SIGINT handler not installed; Ctrl-C will stop vmprep mid-step");
    }
}

/// Run a phase from its first incomplete step.
pub fn run_run(global: &GlobalArgs, args: &RunArgs) -> Result<u8> {
    let state = state_paths(global)?;
    let registry = steps::standard_registry()?;
    let options = RunOptions {
        rerun_completed: args.rerun,
        assume_rebooted: args.checkpoint.assume_rebooted,
        ..RunOptions::default()
    };
    drive(global, state, &registry, args.phase, options, args.checkpoint)
}

/// Continue whichever phase the progress record (or a first-step failure) names.
pub fn run_resume(global: &GlobalArgs, args: &ResumeArgs) -> Result<u8> {
    let state = state_paths(global)?;
    let registry = steps::standard_registry()?;
    let current = Engine::new(&registry, ProgressStore::new(state.clone())).state();
    let phase = match current {
        Ok(WorkflowState::InProgress { phase, .. })
        | Ok(WorkflowState::RebootPending { phase, .. })
        | Ok(WorkflowState::Failed { phase, .. }) => phase,
        Ok(WorkflowState::NotStarted) | Ok(WorkflowState::Complete { .. }) => {
            println!("nothing to resume; start a phase with `vmprep run <phase>`");
            return Ok(EXIT_SUCCESS);
        }
        Err(err) => return Ok(report_workflow_error(&err)),
    };
    let options = RunOptions {
        assume_rebooted: args.checkpoint.assume_rebooted,
        ..RunOptions::default()
    };
    drive(global, state, &registry, phase, options, args.checkpoint)
}

fn drive(
    global: &GlobalArgs,
    state: StatePaths,
    registry: &StepRegistry,
    phase: Phase,
    options: RunOptions,
    checkpoint: RebootArgs,
) -> Result<u8> {
    let host = load_host(global, &state)?;
    preflight(&host, phase)?;
    let engine = Engine::new(registry, ProgressStore::new(state));
    tracing::info!(%phase, distro = %host.distro, dry_run = host.dry_run(), "starting");

    install_interrupt_handler();
    let cancel = Arc::new(AtomicBool::new(false));
    let (sender, events) = mpsc::channel();
    let options = RunOptions {
        cancel: Some(cancel.clone()),
        events: Some(sender),
        ..options
    };

    let outcome = thread::scope(|scope| {
        let (engine, host) = (&engine, &host);
        // `options` moves into the worker so the channel closes when it returns.
        let worker = scope.spawn(move || engine.run_phase(phase, host, &options));
        loop {
            if INTERRUPTED.load(Ordering::SeqCst) && !cancel.swap(true, Ordering::SeqCst) {
                eprintln!("interrupt received; stopping after the current step (Ctrl-C again to abort)");
            }
            match events.recv_timeout(EVENT_POLL) {
                Ok(event) => render_event(&event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        worker
            .join()
            .map_err(|_| anyhow!("workflow worker thread panicked"))
    })?;
    finish(&host, outcome, checkpoint)
}

fn render_event(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::Resuming {
            phase,
            next_step,
            index,
            total,
        } => eprintln!("[{phase}] resuming at step {}/{total}: {next_step}", index + 1),
        WorkflowEvent::StepStarted {
            phase,
            step,
            index,
            total,
        } => eprintln!("[{phase} {}/{total}] {step}", index + 1),
        WorkflowEvent::StepCompleted {
            phase,
            step,
            elapsed_ms,
        } => eprintln!("[{phase}] {step} done in {elapsed_ms} ms"),
        WorkflowEvent::StepFailed { phase, step, error } => {
            eprintln!("[{phase}] {step} failed: {error}")
        }
        WorkflowEvent::RebootSuspended {
            phase,
            completed_step,
            next_step,
        } => eprintln!("[{phase}] {completed_step} needs a reboot before {next_step}"),
    }
}

fn finish(
    host: &Host,
    outcome: Result<PhaseOutcome, WorkflowError>,
    checkpoint: RebootArgs,
) -> Result<u8> {
    match outcome {
        Ok(PhaseOutcome::Complete {
            phase,
            already_complete: true,
            ..
        }) => {
            println!("{phase} is already complete; pass --rerun to run it again");
            Ok(EXIT_SUCCESS)
        }
        Ok(PhaseOutcome::Complete {
            phase,
            executed,
            reboot_recommended,
            ..
        }) => {
            println!("{phase} complete ({} steps run)", executed.len());
            if reboot_recommended {
                println!("reboot the host to apply the last changes");
            }
            if phase == Phase::HostPrep {
                println!("next: vmprep run vm-create");
            }
            Ok(EXIT_SUCCESS)
        }
        Ok(PhaseOutcome::RebootRequired {
            phase,
            completed_step,
            next_step,
        }) => {
            println!("{phase}: `{completed_step}` takes effect after a reboot; `{next_step}` runs next");
            println!("reboot, then run `vmprep resume`");
            offer_reboot(host, checkpoint)?;
            Ok(EXIT_REBOOT_REQUIRED)
        }
        Ok(PhaseOutcome::Cancelled { phase, next_step }) => {
            println!("{phase} stopped before `{next_step}`; run `vmprep resume` to continue");
            Ok(EXIT_CANCELLED)
        }
        Err(err) => Ok(report_workflow_error(&err)),
    }
}

fn offer_reboot(host: &Host, checkpoint: RebootArgs) -> Result<()> {
    let reboot = checkpoint.reboot
        || (host.prompter.interactive()
            && host
                .prompter
                .confirm("reboot_now", "Reboot now?", false)?);
    if reboot {
        host.run(HostCommand::new("systemctl").arg("reboot"))
            .context("reboot the host")?;
    }
    Ok(())
}
