//! Small file helpers shared by the stages that rewrite system files.

use crate::error::{AutounlockError, AutounlockResult};
use log::debug;
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::NamedTempFile;

/// Contents of `path`, or `None` when it does not exist.
pub fn read_optional(path: &Path) -> AutounlockResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(AutounlockError::Io(err)),
    }
}

/// Atomically replace `path` with `contents`.
///
/// An existing file keeps its mode; a new file gets `new_mode`.
pub fn write_atomic(path: &Path, contents: &[u8], new_mode: u32) -> AutounlockResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mode = fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o7777)
        .unwrap_or(new_mode);

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(contents)?;
    temp.as_file_mut().flush()?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(mode))?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .map_err(|err| AutounlockError::Io(err.error))?;
    sync_parent_dir(parent);
    Ok(())
}

/// Flush the directory entry of a freshly renamed file. Failure is logged, not returned.
pub(crate) fn sync_parent_dir(dir: &Path) {
    if let Err(err) = fsync_dir(dir) {
        debug!("could not fsync {}: {err}", dir.display());
    }
}

fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).and_then(|file| file.sync_all())
}

/// Remove `path`, treating an already-missing file as success.
pub fn remove_if_exists(path: &Path) -> AutounlockResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(AutounlockError::Io(err)),
    }
}
