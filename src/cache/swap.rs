//! Directory replacement for refreshed cache entries.
//!
//! The swap itself is `remove_entry` followed by a same-filesystem
//! `std::fs::rename`, done by the caller under an exclusive path lock. When a
//! fresh clone sits on another filesystem it is first copied into a hidden
//! staging directory next to the entry, so the locked step never copies.

use std::fs;
use std::io;
use std::path::Path;

use tempfile::TempDir;

/// Remove a cache entry. A missing entry is not an error.
pub fn remove_entry(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Whether `a` and `b` live on the same filesystem, so a rename between them
/// cannot fail with a cross-device error.
#[cfg(unix)]
pub fn same_filesystem(a: &Path, b: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    Ok(fs::metadata(a)?.dev() == fs::metadata(b)?.dev())
}

#[cfg(not(unix))]
pub fn same_filesystem(a: &Path, b: &Path) -> io::Result<bool> {
    let a = a.canonicalize()?;
    let b = b.canonicalize()?;
    Ok(a.components().next() == b.components().next())
}

/// Copy `src` into `dst` recursively. `dst` must already exist.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            fs::create_dir(&to)?;
            copy_tree(&from, &to)?;
        } else if file_type.is_symlink() {
            copy_symlink(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(from)?, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> io::Result<()> {
    fs::copy(from, to).map(|_| ())
}

/// Copy a finished clone into a fresh staging directory inside `parent`.
///
/// The staging directory is removed when the returned guard drops, unless it
/// has been renamed away first.
pub fn stage_in(parent: &Path, prefix: &str, src: &Path) -> io::Result<TempDir> {
    let staging = tempfile::Builder::new().prefix(prefix).tempdir_in(parent)?;
    copy_tree(src, staging.path())?;
    Ok(staging)
}
