use super::*;
use crate::util::{publish_staged, stage_bytes};
use serde_json::json;

fn temp_store() -> (tempfile::TempDir, ProgressStore) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = ProgressStore::new(StatePaths::new(dir.path().join("state")));
    (dir, store)
}

fn record(step: &str) -> ProgressRecord {
    let mut artifacts = Artifacts::new();
    artifacts.insert("domain".to_string(), json!("Windows_VM"));
    artifacts.insert(
        "vm_config".to_string(),
        json!({"name": "Windows_VM", "memory_mib": 8192, "cores": [1, 2]}),
    );
    ProgressRecord::new(Phase::VmCreate, step, artifacts).expect("build record")
}

#[test]
fn load_without_record_is_absent() {
    let (_dir, store) = temp_store();
    assert_eq!(store.load().expect("load"), None);
}

#[test]
fn save_then_load_round_trips_losslessly() {
    let (_dir, store) = temp_store();
    let mut original = record("create_vm");
    original.reboot_marker = Some(RebootMarker {
        step: "create_vm".to_string(),
        boot_id: Some("c0ffee".to_string()),
    });
    store.save(&original).expect("save");
    let loaded = store.load().expect("load").expect("record present");
    assert_eq!(loaded, original);
}

#[test]
fn progress_file_uses_documented_field_names() {
    let (_dir, store) = temp_store();
    store.save(&record("configure_vm")).expect("save");
    let text = fs::read_to_string(store.paths().progress_path()).expect("read file");
    let value: Value = serde_json::from_str(&text).expect("parse json");
    assert_eq!(value["phase"], "vm-create");
    assert_eq!(value["last_completed_step"], "configure_vm");
    assert_eq!(value["artifacts"]["domain"], "Windows_VM");
}

#[test]
fn clear_is_idempotent() {
    let (_dir, store) = temp_store();
    store.save(&record("create_vm")).expect("save");
    assert!(store.clear().expect("first clear"));
    assert!(!store.clear().expect("second clear"));
    assert_eq!(store.load().expect("load"), None);
}

#[test]
fn interrupted_save_leaves_previous_record_readable() {
    let (_dir, store) = temp_store();
    let old = record("create_vm");
    store.save(&old).expect("save old");

    // Simulate a crash halfway through writing the next record: the staged
    // temp file is left behind and never renamed into place.
    let new = record("attach_driver_media");
    let bytes = serde_json::to_vec_pretty(&new).expect("serialize");
    let staged = stage_bytes(&store.paths().progress_path(), &bytes[..bytes.len() / 2])
        .expect("stage partial");
    let (_file, kept_path) = staged.keep().expect("keep temp file");
    assert!(kept_path.exists());

    let loaded = store.load().expect("load").expect("record present");
    assert_eq!(loaded, old);

    store.save(&new).expect("save after crash");
    assert_eq!(store.load().expect("load").expect("present"), new);
}

#[test]
fn staged_write_becomes_visible_only_after_publish() {
    let (_dir, store) = temp_store();
    let old = record("create_vm");
    store.save(&old).expect("save old");
    let new = record("modify_storage_bus");
    let bytes = serde_json::to_vec(&new).expect("serialize");
    let staged = stage_bytes(&store.paths().progress_path(), &bytes).expect("stage");
    assert_eq!(store.load().expect("load").expect("present"), old);
    publish_staged(staged, &store.paths().progress_path()).expect("publish");
    assert_eq!(store.load().expect("load").expect("present"), new);
}

#[test]
fn unparsable_record_is_reported_as_corrupt() {
    let (_dir, store) = temp_store();
    fs::create_dir_all(store.paths().root()).expect("create state dir");
    fs::write(store.paths().progress_path(), b"{\"phase\": \"host-prep\", \"last_").expect("write");
    match store.load() {
        Err(WorkflowError::StoreCorrupt { path, .. }) => {
            assert_eq!(path, store.paths().progress_path());
        }
        other => panic!("expected StoreCorrupt, got {other:?}"),
    }
}

#[test]
fn newer_schema_is_reported_as_corrupt() {
    let (_dir, store) = temp_store();
    let mut future = record("create_vm");
    future.schema_version = PROGRESS_SCHEMA_VERSION + 1;
    store.save(&future).expect("save");
    assert!(matches!(
        store.load(),
        Err(WorkflowError::StoreCorrupt { .. })
    ));
}

#[test]
fn quarantine_moves_the_record_aside() {
    let (_dir, store) = temp_store();
    fs::create_dir_all(store.paths().root()).expect("create state dir");
    fs::write(store.paths().progress_path(), b"garbage").expect("write");
    let moved = store.quarantine().expect("quarantine").expect("moved path");
    assert!(moved.is_file());
    assert_eq!(fs::read(&moved).expect("read moved"), b"garbage");
    assert_eq!(store.load().expect("load"), None);
    assert_eq!(store.quarantine().expect("second quarantine"), None);
}

#[test]
fn second_lock_is_rejected_as_busy() {
    let (_dir, store) = temp_store();
    let held = store.lock().expect("first lock");
    match store.lock() {
        Err(WorkflowError::WorkflowBusy { holder }) => {
            assert!(holder.contains(&std::process::id().to_string()));
        }
        other => panic!("expected WorkflowBusy, got {other:?}"),
    }
    drop(held);
    store.lock().expect("lock after release");
}

#[test]
fn completion_ledger_tracks_phases() {
    let (_dir, store) = temp_store();
    assert!(!store.is_completed(Phase::HostPrep).expect("check"));
    store.mark_completed(Phase::HostPrep).expect("mark");
    assert!(store.is_completed(Phase::HostPrep).expect("check"));
    assert!(!store.is_completed(Phase::VmCreate).expect("check"));

    assert!(store.forget_completed(Phase::HostPrep).expect("forget"));
    assert!(!store.is_completed(Phase::HostPrep).expect("check"));
    assert!(!store.forget_completed(Phase::HostPrep).expect("forget again"));
}

#[test]
fn history_skips_torn_trailing_line() {
    let (_dir, store) = temp_store();
    let entry = HistoryEntry::new(
        Phase::HostPrep,
        Some("install_packages"),
        HistoryOutcome::StepCompleted,
        1,
    )
    .expect("entry");
    store.append_history(&entry).expect("append");
    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(store.paths().history_path())
        .expect("open history");
    file.write_all(b"{\"schema_version\":1,\"sta").expect("torn write");

    let history = store.history().expect("history");
    assert_eq!(history, vec![entry.clone()]);
    assert_eq!(store.last_history().expect("last"), Some(entry));
}
