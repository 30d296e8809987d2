//! Phase execution: resume point discovery, per-step checkpointing, reboot suspends.
//!
//! The engine keeps no progress in memory between calls. Every decision is
//! re-derived from the persisted record, so a cold start after a crash or a
//! reboot behaves exactly like a warm re-invocation.
use super::context::StepContext;
use super::registry::{Step, StepRegistry};
use super::store::{
    Artifacts, HistoryEntry, HistoryOutcome, ProgressRecord, ProgressStore, RebootMarker,
};
use super::{Phase, WorkflowError};
use crate::host::Host;
use crate::util::now_epoch_ms;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Instant;

/// Caller-controlled knobs for one `run_phase` call.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run a phase again even though the completion ledger lists it.
    pub rerun_completed: bool,
    /// Treat a pending reboot as done even if the boot id did not change.
    pub assume_rebooted: bool,
    /// Checked between steps only; a running step is never interrupted.
    pub cancel: Option<Arc<AtomicBool>>,
    pub events: Option<Sender<WorkflowEvent>>,
}

impl RunOptions {
    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Some(events) = &self.events {
            // A dropped observer must not fail the workflow.
            let _ = events.send(event);
        }
    }
}

/// Progress notifications for a foreground observer.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    Resuming {
        phase: Phase,
        next_step: String,
        index: usize,
        total: usize,
    },
    StepStarted {
        phase: Phase,
        step: String,
        index: usize,
        total: usize,
    },
    StepCompleted {
        phase: Phase,
        step: String,
        elapsed_ms: u128,
    },
    StepFailed {
        phase: Phase,
        step: String,
        error: String,
    },
    RebootSuspended {
        phase: Phase,
        completed_step: String,
        next_step: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PhaseOutcome {
    Complete {
        phase: Phase,
        executed: Vec<String>,
        /// The final step asked for a reboot; nothing is left to resume.
        reboot_recommended: bool,
        /// Nothing ran because the phase had already finished earlier.
        already_complete: bool,
    },
    RebootRequired {
        phase: Phase,
        completed_step: String,
        next_step: String,
    },
    Cancelled {
        phase: Phase,
        next_step: String,
    },
}

/// Observable workflow state, derived from the store and history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkflowState {
    NotStarted,
    InProgress {
        phase: Phase,
        last_completed_step: String,
        next_step: Option<String>,
        next_index: usize,
        total: usize,
    },
    RebootPending {
        phase: Phase,
        completed_step: String,
        next_step: Option<String>,
    },
    Failed {
        phase: Phase,
        step: String,
        error: String,
        last_completed_step: Option<String>,
    },
    Complete {
        phases: Vec<Phase>,
    },
}

/// Resets the in-process busy flag when a run ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, WorkflowError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| WorkflowError::WorkflowBusy {
                holder: "another run in this process".to_string(),
            })?;
        Ok(Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Engine<'r> {
    registry: &'r StepRegistry,
    store: ProgressStore,
    busy: AtomicBool,
}

impl<'r> Engine<'r> {
    pub fn new(registry: &'r StepRegistry, store: ProgressStore) -> Self {
        Self {
            registry,
            store,
            busy: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &StepRegistry {
        self.registry
    }

    pub fn store(&self) -> &ProgressStore {
        &self.store
    }

    /// Run `phase` from its first incomplete step.
    pub fn run_phase(
        &self,
        phase: Phase,
        host: &Host,
        options: &RunOptions,
    ) -> Result<PhaseOutcome, WorkflowError> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        let _lock = self.store.lock()?;
        let steps = self.registry.steps_for(phase);

        let (start, record) = match self.store.load()? {
            Some(record) if record.phase != phase => {
                return Err(WorkflowError::PhaseConflict {
                    requested: phase,
                    active: record.phase,
                    last_completed: record.last_completed_step,
                });
            }
            Some(record) => {
                let index = steps
                    .iter()
                    .position(|step| step.name() == record.last_completed_step)
                    .ok_or_else(|| WorkflowError::RegistryMismatch {
                        phase,
                        step: record.last_completed_step.clone(),
                    })?;
                (index + 1, Some(record))
            }
            None => {
                if self.store.is_completed(phase)? {
                    if !options.rerun_completed {
                        tracing::info!(%phase, "phase already complete");
                        return Ok(PhaseOutcome::Complete {
                            phase,
                            executed: Vec::new(),
                            reboot_recommended: false,
                            already_complete: true,
                        });
                    }
                    // The ledger only lists phases whose latest run finished.
                    self.store.forget_completed(phase)?;
                    tracing::info!(%phase, "rerunning completed phase");
                }
                (0, None)
            }
        };

        if let Some(record) = record.as_ref().filter(|r| r.reboot_marker.is_none()) {
            let repaired = self.repair_missing_marker(phase, record, &steps, host, options)?;
            if let Some(outcome) = repaired {
                return Ok(outcome);
            }
        }

        if let Some(marker) = record.as_ref().and_then(|r| r.reboot_marker.as_ref()) {
            if !options.assume_rebooted && same_boot(marker, host.boot_id().as_deref()) {
                let next_step = steps
                    .get(start)
                    .map(|step| step.name().to_string())
                    .unwrap_or_default();
                tracing::info!(%phase, step = %marker.step, next = %next_step, "still waiting for reboot");
                return Ok(PhaseOutcome::RebootRequired {
                    phase,
                    completed_step: marker.step.clone(),
                    next_step,
                });
            }
        }

        if let Some(next) = steps.get(start).filter(|_| record.is_some()) {
            tracing::info!(%phase, next = next.name(), index = start, "resuming");
            options.emit(WorkflowEvent::Resuming {
                phase,
                next_step: next.name().to_string(),
                index: start,
                total: steps.len(),
            });
        }

        let mut artifacts = record.map(|record| record.artifacts).unwrap_or_default();
        let mut executed = Vec::new();
        let mut reboot_recommended = false;
        for (index, step) in steps.iter().enumerate().skip(start) {
            if options.cancelled() {
                tracing::warn!(%phase, next = step.name(), "cancelled between steps");
                return Ok(PhaseOutcome::Cancelled {
                    phase,
                    next_step: step.name().to_string(),
                });
            }
            options.emit(WorkflowEvent::StepStarted {
                phase,
                step: step.name().to_string(),
                index,
                total: steps.len(),
            });
            let next = steps.get(index + 1).copied();
            let suspend_before = next.filter(|_| step.requires_reboot_after());
            artifacts = self.run_step(phase, step, suspend_before, artifacts, host, options)?;
            executed.push(step.name().to_string());

            if step.requires_reboot_after() {
                match next {
                    Some(next) => {
                        self.suspend_for_reboot(phase, step, next);
                        options.emit(WorkflowEvent::RebootSuspended {
                            phase,
                            completed_step: step.name().to_string(),
                            next_step: next.name().to_string(),
                        });
                        return Ok(PhaseOutcome::RebootRequired {
                            phase,
                            completed_step: step.name().to_string(),
                            next_step: next.name().to_string(),
                        });
                    }
                    None => reboot_recommended = true,
                }
            }
        }

        self.store.clear()?;
        self.store.mark_completed(phase)?;
        self.record_history(HistoryEntry::new(
            phase,
            None,
            HistoryOutcome::PhaseCompleted,
            now_epoch_ms()?,
        ));
        tracing::info!(%phase, executed = executed.len(), "phase complete");
        Ok(PhaseOutcome::Complete {
            phase,
            executed,
            reboot_recommended,
            already_complete: false,
        })
    }

    /// Execute one step and checkpoint its artifacts. Returns the merged set.
    ///
    /// With `suspend_before`, the same save also carries the reboot marker, so
    /// no crash can leave the step recorded without its pending reboot.
    fn run_step(
        &self,
        phase: Phase,
        step: &Step,
        suspend_before: Option<&Step>,
        artifacts: Artifacts,
        host: &Host,
        options: &RunOptions,
    ) -> Result<Artifacts, WorkflowError> {
        let started_ms = now_epoch_ms()?;
        let started = Instant::now();
        tracing::info!(%phase, step = step.name(), "step started");

        let result = match step
            .required_artifacts()
            .iter()
            .find(|key| !artifacts.contains_key(**key))
        {
            Some(missing) => Err(anyhow::anyhow!(
                "required artifact `{missing}` is missing from the progress record"
            )),
            None => {
                let ctx = StepContext {
                    phase,
                    step: step.name(),
                    artifacts: &artifacts,
                    host,
                };
                step.execute(&ctx).and_then(|output| {
                    match step
                        .produced_artifacts()
                        .iter()
                        .find(|key| !output.artifacts.contains_key(**key))
                    {
                        Some(missing) => Err(anyhow::anyhow!(
                            "step finished without producing artifact `{missing}`"
                        )),
                        None => Ok(output),
                    }
                })
            }
        };

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                let error = format!("{err:#}");
                tracing::error!(%phase, step = step.name(), error = %error, "step failed");
                self.record_history(
                    HistoryEntry::new(
                        phase,
                        Some(step.name()),
                        HistoryOutcome::StepFailed,
                        started_ms,
                    )
                    .map(|entry| entry.with_message(error.clone())),
                );
                options.emit(WorkflowEvent::StepFailed {
                    phase,
                    step: step.name().to_string(),
                    error: error.clone(),
                });
                return Err(WorkflowError::StepFailed {
                    phase,
                    step: step.name().to_string(),
                    error,
                    retriable: step.retriable(),
                });
            }
        };

        let mut merged = artifacts;
        merged.extend(output.artifacts);
        let mut record = ProgressRecord::new(phase, step.name(), merged)?;
        if suspend_before.is_some() {
            record.reboot_marker = Some(RebootMarker {
                step: step.name().to_string(),
                boot_id: host.boot_id(),
            });
        }
        self.store.save(&record)?;

        let elapsed_ms = started.elapsed().as_millis();
        tracing::info!(%phase, step = step.name(), elapsed_ms, "step completed");
        self.record_history(HistoryEntry::new(
            phase,
            Some(step.name()),
            HistoryOutcome::StepCompleted,
            started_ms,
        ));
        options.emit(WorkflowEvent::StepCompleted {
            phase,
            step: step.name().to_string(),
            elapsed_ms,
        });
        Ok(record.artifacts)
    }

    /// The marker was already saved with the step's checkpoint; this only reports it.
    fn suspend_for_reboot(&self, phase: Phase, step: &Step, next: &Step) {
        tracing::info!(%phase, step = step.name(), next = next.name(), "reboot required");
        self.record_history(
            now_epoch_ms().and_then(|at| {
                HistoryEntry::new(
                    phase,
                    Some(step.name()),
                    HistoryOutcome::RebootSuspended,
                    at,
                )
            })
            .map(|entry| entry.with_message(format!("next step: {}", next.name()))),
        );
    }

    /// A reboot step recorded without its marker gives no proof of a reboot.
    /// Stamp the current boot and wait for the next one.
    fn repair_missing_marker(
        &self,
        phase: Phase,
        record: &ProgressRecord,
        steps: &[&Step],
        host: &Host,
        options: &RunOptions,
    ) -> Result<Option<PhaseOutcome>, WorkflowError> {
        let Some(index) = steps
            .iter()
            .position(|step| step.name() == record.last_completed_step)
        else {
            return Ok(None);
        };
        let (step, Some(next)) = (steps[index], steps.get(index + 1)) else {
            return Ok(None);
        };
        if !step.requires_reboot_after() || options.assume_rebooted {
            return Ok(None);
        }
        let mut repaired = record.clone();
        repaired.reboot_marker = Some(RebootMarker {
            step: step.name().to_string(),
            boot_id: host.boot_id(),
        });
        self.store.save(&repaired)?;
        tracing::warn!(
            %phase,
            step = step.name(),
            "checkpoint had no reboot marker; waiting for a reboot"
        );
        self.suspend_for_reboot(phase, step, next);
        Ok(Some(PhaseOutcome::RebootRequired {
            phase,
            completed_step: step.name().to_string(),
            next_step: next.name().to_string(),
        }))
    }

    /// Drop the active record. `expected` guards against abandoning the wrong phase.
    ///
    /// An unreadable record is quarantined rather than deleted.
    pub fn abandon(
        &self,
        expected: Option<Phase>,
    ) -> Result<Option<ProgressRecord>, WorkflowError> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        let _lock = self.store.lock()?;
        let record = match self.store.load() {
            Ok(record) => record,
            Err(WorkflowError::StoreCorrupt { path, reason }) => {
                tracing::warn!(path = %path.display(), %reason, "abandoning unreadable progress");
                self.quarantine_locked(expected, &reason)?;
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let Some(record) = record else {
            return Ok(None);
        };
        if let Some(expected) = expected.filter(|phase| *phase != record.phase) {
            return Err(WorkflowError::PhaseConflict {
                requested: expected,
                active: record.phase,
                last_completed: record.last_completed_step,
            });
        }
        self.store.clear()?;
        tracing::info!(phase = %record.phase, step = %record.last_completed_step, "progress abandoned");
        self.record_history(
            HistoryEntry::new(
                record.phase,
                Some(&record.last_completed_step),
                HistoryOutcome::Abandoned,
                now_epoch_ms()?,
            )
            .map(|entry| entry.with_message("progress cleared by operator")),
        );
        Ok(Some(record))
    }

    /// Move a corrupt record aside so the next run starts fresh.
    pub fn quarantine_corrupt(
        &self,
        phase: Option<Phase>,
    ) -> Result<Option<PathBuf>, WorkflowError> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        let _lock = self.store.lock()?;
        match self.store.load() {
            Err(WorkflowError::StoreCorrupt { reason, .. }) => {
                self.quarantine_locked(phase, &reason)
            }
            Ok(_) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn quarantine_locked(
        &self,
        phase: Option<Phase>,
        reason: &str,
    ) -> Result<Option<PathBuf>, WorkflowError> {
        let moved = self.store.quarantine()?;
        if let Some(target) = &moved {
            tracing::warn!(target = %target.display(), "corrupt progress record quarantined");
            self.record_history(
                HistoryEntry::new(phase, None, HistoryOutcome::Quarantined, now_epoch_ms()?)
                    .map(|entry| {
                        entry.with_message(format!("{reason}; moved to {}", target.display()))
                    }),
            );
        }
        Ok(moved)
    }

    /// Report where the workflow stands without changing anything.
    pub fn state(&self) -> Result<WorkflowState, WorkflowError> {
        let record = self.store.load()?;
        let last = self.store.last_history()?;
        if let Some(record) = record {
            let steps = self.registry.steps_for(record.phase);
            let next_index = self
                .registry
                .position(record.phase, &record.last_completed_step)
                .map(|index| index + 1)
                .ok_or_else(|| WorkflowError::RegistryMismatch {
                    phase: record.phase,
                    step: record.last_completed_step.clone(),
                })?;
            let next_step = steps.get(next_index).map(|step| step.name().to_string());
            // A failure after the reboot outranks the stale marker.
            if let Some(failed) = last.and_then(|entry| failure_after(entry, &record)) {
                return Ok(failed);
            }
            if let Some(marker) = record.reboot_marker {
                return Ok(WorkflowState::RebootPending {
                    phase: record.phase,
                    completed_step: marker.step,
                    next_step,
                });
            }
            return Ok(WorkflowState::InProgress {
                phase: record.phase,
                last_completed_step: record.last_completed_step,
                next_step,
                next_index,
                total: steps.len(),
            });
        }

        if let Some(entry) = last.filter(|entry| entry.outcome == HistoryOutcome::StepFailed) {
            if let (Some(phase), Some(step)) = (entry.phase, entry.step) {
                return Ok(WorkflowState::Failed {
                    phase,
                    step,
                    error: entry.message.unwrap_or_default(),
                    last_completed_step: None,
                });
            }
        }
        let phases: Vec<Phase> = self.store.completed()?.phases.into_keys().collect();
        if phases.is_empty() {
            Ok(WorkflowState::NotStarted)
        } else {
            Ok(WorkflowState::Complete { phases })
        }
    }

    /// History is an audit trail, so a failed append is logged and never fatal.
    fn record_history(&self, entry: anyhow::Result<HistoryEntry>) {
        if let Err(err) = entry.and_then(|entry| self.store.append_history(&entry)) {
            let error = format!("{err:#}");
            tracing::warn!(%error, "history append failed");
        }
    }
}

fn same_boot(marker: &RebootMarker, current: Option<&str>) -> bool {
    match (marker.boot_id.as_deref(), current) {
        (Some(recorded), Some(current)) => recorded == current,
        // Without a boot id there is no way to tell; trust the operator's re-run.
        _ => false,
    }
}

fn failure_after(entry: HistoryEntry, record: &ProgressRecord) -> Option<WorkflowState> {
    if entry.outcome != HistoryOutcome::StepFailed
        || entry.phase != Some(record.phase)
        || entry.finished_at_epoch_ms < record.updated_at_epoch_ms
    {
        return None;
    }
    Some(WorkflowState::Failed {
        phase: record.phase,
        step: entry.step.unwrap_or_default(),
        error: entry.message.unwrap_or_default(),
        last_completed_step: Some(record.last_completed_step.clone()),
    })
}

#[cfg(test)]
#[path = "driver_tests.rs"]
mod tests;
