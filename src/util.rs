use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;

/// Current epoch time in milliseconds for record timestamps.
pub fn now_epoch_ms() -> Result<u128> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("compute timestamp")?
        .as_millis())
}

pub fn truncate_string(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut truncated = String::new();
    for ch in text.chars() {
        if truncated.len() + ch.len_utf8() > max_bytes {
            break;
        }
        truncated.push(ch);
    }
    truncated
}

/// Keep the tail of command output, which is where tools print the actual error.
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

/// Write `bytes` into a temp file next to `dest` and fsync it, without publishing.
///
/// The temp file lives in the destination directory so the later rename stays
/// on one filesystem.
pub fn stage_bytes(dest: &Path, bytes: &[u8]) -> Result<NamedTempFile> {
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", dest.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    let file_name = dest
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("staged");
    let mut staged = tempfile::Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(".tmp")
        .tempfile_in(parent)
        .with_context(|| format!("stage {}", dest.display()))?;
    staged
        .write_all(bytes)
        .with_context(|| format!("write staged {}", dest.display()))?;
    staged
        .as_file()
        .sync_all()
        .with_context(|| format!("sync staged {}", dest.display()))?;
    Ok(staged)
}

/// Rename a staged temp file over `dest` and sync the directory entry.
pub fn publish_staged(staged: NamedTempFile, dest: &Path) -> Result<()> {
    staged
        .persist(dest)
        .with_context(|| format!("publish {}", dest.display()))?;
    if let Some(parent) = dest.parent() {
        // The rename is in place; a failed directory sync only weakens durability.
        if let Err(err) = sync_dir(parent) {
            let error = err.to_string();
            tracing::warn!(dir = %parent.display(), %error, "directory sync failed after publish");
        }
    }
    Ok(())
}

/// Directory fsync makes a rename inside it durable across power loss.
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).and_then(|dir| dir.sync_all())
}

/// Replace `dest` atomically: readers see the old content or the new, never a mix.
pub fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    let staged = stage_bytes(dest, bytes)?;
    publish_staged(staged, dest)
}

pub fn write_json_atomic<T: serde::Serialize>(dest: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value).context("serialize JSON")?;
    bytes.push(b'\n');
    write_atomic(dest, &bytes)
}
