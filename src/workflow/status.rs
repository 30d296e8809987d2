//! Read-mostly commands: `status`, `steps`, `abandon`, and `config`.
//!
//! Status is derived from the store alone and always names the next action.
use super::context::{effective_config, state_paths};
use super::{report_workflow_error, EXIT_SUCCESS};
use crate::cli::{AbandonArgs, ConfigArgs, GlobalArgs, StatusArgs, StepsArgs};
use crate::config::config_stub;
use crate::engine::{Engine, HistoryEntry, Phase, ProgressStore, StepInfo, WorkflowState};
use crate::steps;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

const STATUS_SCHEMA_VERSION: u32 = 1;
const RECENT_HISTORY: usize = 5;

/// Machine-readable status for `vmprep status --json`.
#[derive(Debug, Serialize)]
pub struct StatusSummary {
    pub schema_version: u32,
    pub state_dir: PathBuf,
    /// Absent when the progress record cannot be interpreted; see `problem`.
    pub workflow: Option<WorkflowState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
    pub completed: BTreeMap<Phase, u128>,
    pub next_action: Option<String>,
    pub recent_history: Vec<HistoryEntry>,
}

pub fn run_status(global: &GlobalArgs, args: &StatusArgs) -> Result<u8> {
    let state = state_paths(global)?;
    let registry = steps::standard_registry()?;
    let engine = Engine::new(&registry, ProgressStore::new(state.clone()));
    let store = engine.store();

    let (workflow, problem, exit_code) = match engine.state() {
        Ok(workflow) => (Some(workflow), None, EXIT_SUCCESS),
        Err(err) => (None, Some(err.to_string()), err.exit_code()),
    };
    let next_action = match &workflow {
        Some(workflow) => next_action(workflow),
        None => Some("vmprep abandon".to_string()),
    };
    let history = store.history()?;
    let skip = history.len().saturating_sub(RECENT_HISTORY);
    let summary = StatusSummary {
        schema_version: STATUS_SCHEMA_VERSION,
        state_dir: state.root().to_path_buf(),
        workflow,
        problem,
        completed: store.completed()?.phases,
        next_action,
        recent_history: history.into_iter().skip(skip).collect(),
    };

    if args.json {
        let text = serde_json::to_string_pretty(&summary).context("serialize status summary")?;
        println!("{text}");
    } else {
        for line in status_lines(&summary) {
            println!("{line}");
        }
    }
    Ok(exit_code)
}

/// What the operator should do next, if anything.
pub fn next_action(state: &WorkflowState) -> Option<String> {
    match state {
        WorkflowState::NotStarted => Some(format!("vmprep run {}", Phase::HostPrep)),
        WorkflowState::InProgress { .. } => Some("vmprep resume".to_string()),
        WorkflowState::RebootPending { .. } => Some("reboot, then vmprep resume".to_string()),
        WorkflowState::Failed { .. } => Some("fix the failure, then vmprep resume".to_string()),
        WorkflowState::Complete { phases } if !phases.contains(&Phase::VmCreate) => {
            Some(format!("vmprep run {}", Phase::VmCreate))
        }
        WorkflowState::Complete { .. } => None,
    }
}

pub fn status_lines(summary: &StatusSummary) -> Vec<String> {
    let mut lines = Vec::new();
    match &summary.workflow {
        Some(WorkflowState::NotStarted) => lines.push("state: not started".to_string()),
        Some(WorkflowState::InProgress {
            phase,
            last_completed_step,
            next_step,
            next_index,
            total,
        }) => {
            lines.push(format!("state: {phase} in progress"));
            lines.push(format!(
                "last completed: {last_completed_step} ({next_index}/{total})"
            ));
            if let Some(next) = next_step {
                lines.push(format!("next step: {next}"));
            }
        }
        Some(WorkflowState::RebootPending {
            phase,
            completed_step,
            next_step,
        }) => {
            lines.push(format!("state: {phase} waiting for a reboot"));
            lines.push(format!("last completed: {completed_step}"));
            if let Some(next) = next_step {
                lines.push(format!("next step: {next}"));
            }
        }
        Some(WorkflowState::Failed {
            phase,
            step,
            error,
            last_completed_step,
        }) => {
            lines.push(format!("state: {phase} failed at {step}"));
            lines.push(format!(
                "last completed: {}",
                last_completed_step.as_deref().unwrap_or("(none)")
            ));
            lines.push(format!("error: {error}"));
        }
        Some(WorkflowState::Complete { phases }) => {
            let names: Vec<&str> = phases.iter().map(Phase::as_str).collect();
            lines.push(format!("state: complete ({})", names.join(", ")));
        }
        None => lines.push("state: unknown".to_string()),
    }
    if let Some(problem) = &summary.problem {
        lines.push(format!("problem: {problem}"));
    }
    lines.push(format!(
        "next action: {}",
        summary.next_action.as_deref().unwrap_or("none")
    ));
    lines
}

pub fn run_steps(args: &StepsArgs) -> Result<u8> {
    let registry = steps::standard_registry()?;
    let phases: Vec<Phase> = match args.phase {
        Some(phase) => vec![phase],
        None => Phase::ALL.to_vec(),
    };
    if args.json {
        let infos: Vec<StepInfo> = phases
            .iter()
            .flat_map(|phase| registry.describe(*phase))
            .collect();
        let text = serde_json::to_string_pretty(&infos).context("serialize step list")?;
        println!("{text}");
        return Ok(EXIT_SUCCESS);
    }
    for phase in phases {
        println!("{phase}: {}", phase.describe());
        for info in registry.describe(phase) {
            let reboot = if info.requires_reboot_after {
                " (reboot after)"
            } else {
                ""
            };
            println!("  {}. {} - {}{reboot}", info.index + 1, info.name, info.summary);
        }
    }
    Ok(EXIT_SUCCESS)
}

pub fn run_abandon(global: &GlobalArgs, args: &AbandonArgs) -> Result<u8> {
    let state = state_paths(global)?;
    let registry = steps::standard_registry()?;
    let engine = Engine::new(&registry, ProgressStore::new(state));
    let outcome = engine
        .quarantine_corrupt(args.phase)
        .and_then(|moved| match moved {
            Some(path) => Ok(Some(format!(
                "moved the unreadable progress record to {}",
                path.display()
            ))),
            None => engine.abandon(args.phase).map(|record| {
                record.map(|record| {
                    format!(
                        "abandoned {} (last completed step: {})",
                        record.phase, record.last_completed_step
                    )
                })
            }),
        });
    match outcome {
        Ok(Some(message)) => println!("{message}"),
        Ok(None) => println!("nothing in progress"),
        Err(err) => return Ok(report_workflow_error(&err)),
    }
    Ok(EXIT_SUCCESS)
}

pub fn run_config(global: &GlobalArgs, args: &ConfigArgs) -> Result<u8> {
    let text = if args.default {
        config_stub()?
    } else {
        let state = state_paths(global)?;
        let config = effective_config(global, &state)?;
        serde_json::to_string_pretty(&config).context("serialize config")?
    };
    println!("{text}");
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod tests;
