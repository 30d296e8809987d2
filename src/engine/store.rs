//! Durable progress record plus the completion and history ledgers.
//!
//! The progress record is the only working memory the engine has after a
//! crash or reboot, so every write goes through an atomic replace.
use super::{Phase, WorkflowError};
use crate::paths::StatePaths;
use crate::util::{now_epoch_ms, write_json_atomic};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

pub const PROGRESS_SCHEMA_VERSION: u32 = 1;
pub const COMPLETED_SCHEMA_VERSION: u32 = 1;
pub const HISTORY_SCHEMA_VERSION: u32 = 1;

/// Values produced by steps and consumed by later ones, keyed by name.
pub type Artifacts = BTreeMap<String, Value>;

/// Checkpoint of the active phase.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProgressRecord {
    pub schema_version: u32,
    pub phase: Phase,
    pub last_completed_step: String,
    #[serde(default)]
    pub artifacts: Artifacts,
    /// Present while a completed step still waits for the host to reboot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reboot_marker: Option<RebootMarker>,
    pub updated_at_epoch_ms: u128,
}

impl ProgressRecord {
    pub fn new(phase: Phase, last_completed_step: &str, artifacts: Artifacts) -> Result<Self> {
        Ok(Self {
            schema_version: PROGRESS_SCHEMA_VERSION,
            phase,
            last_completed_step: last_completed_step.to_string(),
            artifacts,
            reboot_marker: None,
            updated_at_epoch_ms: now_epoch_ms()?,
        })
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RebootMarker {
    pub step: String,
    /// Boot id observed when the suspend was recorded, if the host exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_id: Option<String>,
}

/// Phases that ran to the end, with their completion time.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct CompletionLedger {
    pub schema_version: u32,
    #[serde(default)]
    pub phases: BTreeMap<Phase, u128>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOutcome {
    StepCompleted,
    StepFailed,
    RebootSuspended,
    PhaseCompleted,
    Abandoned,
    Quarantined,
}

/// One line of `history.jsonl`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct HistoryEntry {
    pub schema_version: u32,
    pub started_at_epoch_ms: u128,
    pub finished_at_epoch_ms: u128,
    /// Absent only for records whose phase could not be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub outcome: HistoryOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HistoryEntry {
    pub fn new(
        phase: impl Into<Option<Phase>>,
        step: Option<&str>,
        outcome: HistoryOutcome,
        started_at_epoch_ms: u128,
    ) -> Result<Self> {
        Ok(Self {
            schema_version: HISTORY_SCHEMA_VERSION,
            started_at_epoch_ms,
            finished_at_epoch_ms: now_epoch_ms()?,
            phase: phase.into(),
            step: step.map(str::to_string),
            outcome,
            message: None,
        })
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Exclusive advisory lock on the state directory; released on drop.
#[derive(Debug)]
pub struct StoreLock {
    _file: fs::File,
}

/// File-backed progress store rooted at a state directory.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    paths: StatePaths,
}

impl ProgressStore {
    pub fn new(paths: StatePaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    /// Load the active record, or `None` when no phase is in progress.
    pub fn load(&self) -> Result<Option<ProgressRecord>, WorkflowError> {
        let path = self.paths.progress_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("read {}", path.display()))
                    .into())
            }
        };
        let record: ProgressRecord =
            serde_json::from_slice(&bytes).map_err(|err| WorkflowError::StoreCorrupt {
                path: path.clone(),
                reason: err.to_string(),
            })?;
        if record.schema_version > PROGRESS_SCHEMA_VERSION {
            return Err(WorkflowError::StoreCorrupt {
                path,
                reason: format!(
                    "schema version {} is newer than supported version {}",
                    record.schema_version, PROGRESS_SCHEMA_VERSION
                ),
            });
        }
        Ok(Some(record))
    }

    /// Persist the record via write-to-temp-then-rename.
    pub fn save(&self, record: &ProgressRecord) -> Result<(), WorkflowError> {
        let path = self.paths.progress_path();
        write_json_atomic(&path, record)
            .with_context(|| format!("save progress to {}", path.display()))?;
        tracing::debug!(
            phase = %record.phase,
            step = %record.last_completed_step,
            "progress saved"
        );
        Ok(())
    }

    /// Remove the active record. Returns whether one existed.
    pub fn clear(&self) -> Result<bool, WorkflowError> {
        let path = self.paths.progress_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("remove {}", path.display()))
                .into()),
        }
    }

    /// Move an unreadable record aside instead of deleting it.
    pub fn quarantine(&self) -> Result<Option<PathBuf>, WorkflowError> {
        let path = self.paths.progress_path();
        if !path.exists() {
            return Ok(None);
        }
        let target = self.paths.quarantine_path(now_epoch_ms()?);
        fs::rename(&path, &target)
            .with_context(|| format!("quarantine {}", path.display()))?;
        Ok(Some(target))
    }

    /// Take the cross-process run lock without blocking.
    pub fn lock(&self) -> Result<StoreLock, WorkflowError> {
        let path = self.paths.lock_path();
        fs::create_dir_all(self.paths.root())
            .with_context(|| format!("create {}", self.paths.root().display()))?;
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(WorkflowError::WorkflowBusy {
                    holder: lock_holder(&mut file, &path),
                });
            }
            return Err(anyhow::Error::new(err)
                .context(format!("lock {}", path.display()))
                .into());
        }
        file.set_len(0)
            .and_then(|()| file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|()| writeln!(file, "{}", std::process::id()))
            .with_context(|| format!("record lock holder in {}", path.display()))?;
        Ok(StoreLock { _file: file })
    }

    pub fn completed(&self) -> Result<CompletionLedger> {
        let path = self.paths.completed_path();
        if !path.is_file() {
            return Ok(CompletionLedger {
                schema_version: COMPLETED_SCHEMA_VERSION,
                phases: BTreeMap::new(),
            });
        }
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
    }

    pub fn is_completed(&self, phase: Phase) -> Result<bool> {
        Ok(self.completed()?.phases.contains_key(&phase))
    }

    pub fn mark_completed(&self, phase: Phase) -> Result<()> {
        let mut ledger = self.completed()?;
        ledger.schema_version = COMPLETED_SCHEMA_VERSION;
        ledger.phases.insert(phase, now_epoch_ms()?);
        write_json_atomic(&self.paths.completed_path(), &ledger)
    }

    /// Drop `phase` from the ledger. Returns whether it was listed.
    pub fn forget_completed(&self, phase: Phase) -> Result<bool> {
        let mut ledger = self.completed()?;
        if ledger.phases.remove(&phase).is_none() {
            return Ok(false);
        }
        ledger.schema_version = COMPLETED_SCHEMA_VERSION;
        write_json_atomic(&self.paths.completed_path(), &ledger)?;
        Ok(true)
    }

    /// Append a history entry as JSONL.
    pub fn append_history(&self, entry: &HistoryEntry) -> Result<()> {
        let path = self.paths.history_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        let line = serde_json::to_string(entry).context("serialize history entry")?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        file.write_all(b"\n")
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Read the whole history; unparsable lines (e.g. a torn final append) are skipped.
    pub fn history(&self) -> Result<Vec<HistoryEntry>> {
        let path = self.paths.history_path();
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        Ok(text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    pub fn last_history(&self) -> Result<Option<HistoryEntry>> {
        Ok(self.history()?.pop())
    }
}

fn lock_holder(file: &mut fs::File, path: &Path) -> String {
    let mut text = String::new();
    let _ = file.read_to_string(&mut text);
    match text.trim() {
        "" => format!("lock held on {}", path.display()),
        pid => format!("pid {pid} holds {}", path.display()),
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
