use super::{next_action, status_lines, StatusSummary, STATUS_SCHEMA_VERSION};
use crate::engine::{Phase, WorkflowState};
use std::collections::BTreeMap;
use std::path::PathBuf;

fn summary(workflow: Option<WorkflowState>) -> StatusSummary {
    let next_action = workflow.as_ref().and_then(next_action);
    StatusSummary {
        schema_version: STATUS_SCHEMA_VERSION,
        state_dir: PathBuf::from("/var/lib/vmprep"),
        workflow,
        problem: None,
        completed: BTreeMap::new(),
        next_action,
        recent_history: Vec::new(),
    }
}

#[test]
fn next_action_walks_both_phases() {
    assert_eq!(
        next_action(&WorkflowState::NotStarted).as_deref(),
        Some("vmprep run host-prep")
    );
    assert_eq!(
        next_action(&WorkflowState::Complete {
            phases: vec![Phase::HostPrep]
        })
        .as_deref(),
        Some("vmprep run vm-create")
    );
    assert_eq!(
        next_action(&WorkflowState::Complete {
            phases: vec![Phase::HostPrep, Phase::VmCreate]
        }),
        None
    );
}

#[test]
fn in_progress_lines_name_the_resume_point() {
    let lines = status_lines(&summary(Some(WorkflowState::InProgress {
        phase: Phase::VmCreate,
        last_completed_step: "create_vm".to_string(),
        next_step: Some("attach_driver_media".to_string()),
        next_index: 3,
        total: 9,
    })));
    assert_eq!(
        lines,
        vec![
            "state: vm-create in progress",
            "last completed: create_vm (3/9)",
            "next step: attach_driver_media",
            "next action: vmprep resume",
        ]
    );
}

#[test]
fn failed_first_step_reports_no_completed_step() {
    let lines = status_lines(&summary(Some(WorkflowState::Failed {
        phase: Phase::HostPrep,
        step: "install_packages".to_string(),
        error: "dnf exited with status 1".to_string(),
        last_completed_step: None,
    })));
    assert!(lines.contains(&"state: host-prep failed at install_packages".to_string()));
    assert!(lines.contains(&"last completed: (none)".to_string()));
    assert!(lines.contains(&"error: dnf exited with status 1".to_string()));
}

#[test]
fn unreadable_state_points_at_abandon() {
    let mut unreadable = summary(None);
    unreadable.problem = Some("progress record is unreadable".to_string());
    unreadable.next_action = Some("vmprep abandon".to_string());
    let lines = status_lines(&unreadable);
    assert_eq!(lines[0], "state: unknown");
    assert_eq!(lines[1], "problem: progress record is unreadable");
    assert_eq!(lines[2], "next action: vmprep abandon");
}

#[test]
fn summary_json_tags_the_workflow_state() {
    let value = serde_json::to_value(summary(Some(WorkflowState::RebootPending {
        phase: Phase::HostPrep,
        completed_step: "boot_parameters".to_string(),
        next_step: Some("verify_iommu".to_string()),
    })))
    .expect("serialize");
    assert_eq!(value["workflow"]["state"], "reboot_pending");
    assert_eq!(value["workflow"]["phase"], "host-prep");
    assert_eq!(value["next_action"], "reboot, then vmprep resume");
    assert!(value.get("problem").is_none());
}
