//! Install media handling: permissions for the qemu user and the driver ISO download.
use super::Host;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const OTHER_EXECUTE: u32 = 0o001;
const OTHER_READ: u32 = 0o004;
/// qemu reads the ISO as its own user.
const DOWNLOAD_MODE: u32 = 0o644;

/// Let the qemu user reach `iso`: o+x on every ancestor directory, o+r on the file.
///
/// Returns the host paths whose mode changed.
pub fn ensure_qemu_can_read(host: &Host, iso: &Path) -> Result<Vec<PathBuf>> {
    if !iso.is_absolute() {
        return Err(anyhow!("ISO path must be absolute, got {}", iso.display()));
    }
    let mut changed = Vec::new();
    for dir in iso.ancestors().skip(1) {
        if dir == Path::new("/") || dir.as_os_str().is_empty() {
            break;
        }
        if host.add_mode_bits(dir, OTHER_EXECUTE)? {
            changed.push(dir.to_path_buf());
        }
    }
    if host.add_mode_bits(iso, OTHER_READ)? {
        changed.push(iso.to_path_buf());
    }
    Ok(changed)
}

/// Stream `url` into `dest`, publishing the file only once the body is complete.
pub fn download_file(url: &str, dest: &Path) -> Result<u64> {
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow!("download target {} has no parent", dest.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;

    tracing::info!(url, dest = %dest.display(), "downloading");
    let response = ureq::get(url)
        .call()
        .with_context(|| format!("GET {url}"))?;
    let mut body = response.into_body().into_reader();

    let mut staged = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    let bytes = io::copy(&mut body, &mut staged).with_context(|| format!("download {url}"))?;
    staged.flush().context("flush download")?;
    staged
        .as_file()
        .set_permissions(fs::Permissions::from_mode(DOWNLOAD_MODE))
        .context("chmod download")?;
    staged
        .as_file()
        .sync_all()
        .context("sync download")?;
    staged
        .persist(dest)
        .map_err(|err| err.error)
        .with_context(|| format!("persist {}", dest.display()))?;
    tracing::info!(dest = %dest.display(), bytes, "download complete");
    Ok(bytes)
}
