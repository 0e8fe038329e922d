//! Key file generation and persistence.

use crate::error::{AutounlockError, AutounlockResult};
use crate::persist::{read_optional, sync_parent_dir};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

/// Mode applied to every key file: owner read, nothing else.
pub const KEY_FILE_MODE: u32 = 0o400;

/// Draw `size` bytes from the operating system CSPRNG.
pub fn generate_key(size: usize) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; size]);
    OsRng.fill_bytes(&mut key);
    key
}

/// SHA-256 of the key material, hex encoded. Safe to log.
pub fn fingerprint(key: &[u8]) -> String {
    hex::encode(Sha256::digest(key))
}

/// Current contents of `path`, or `None` when it does not exist.
pub fn read_existing(path: &Path) -> AutounlockResult<Option<Zeroizing<Vec<u8>>>> {
    Ok(read_optional(path)?.map(Zeroizing::new))
}

/// Write raw key material to `path` atomically, applying restrictive permissions.
///
/// An existing file keeps its owner and group.
pub fn write_raw_key_file(path: &Path, key: &[u8]) -> AutounlockResult<()> {
    let dest = resolve_write_path(path)?;
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let ownership = fs::metadata(&dest)
        .ok()
        .map(|meta| (meta.uid(), meta.gid()));

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(key)?;
    temp.as_file_mut().flush()?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(KEY_FILE_MODE))?;

    if let Some((uid, gid)) = ownership {
        let rc = unsafe { libc::fchown(temp.as_file().as_raw_fd(), uid, gid) };
        if rc != 0 {
            return Err(AutounlockError::Io(std::io::Error::last_os_error()));
        }
    }

    temp.as_file().sync_all()?;
    temp.persist(&dest)
        .map_err(|err| AutounlockError::Io(err.error))?;
    sync_parent_dir(parent);
    Ok(())
}

/// Force `path` to owner-read-only and confirm the size and mode stuck.
pub fn restrict_key_file(path: &Path, expected_len: usize) -> AutounlockResult<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(KEY_FILE_MODE))?;
    let meta = fs::metadata(path)?;
    let mode = meta.permissions().mode() & 0o777;
    if mode != KEY_FILE_MODE {
        return Err(AutounlockError::Provider(format!(
            "key file {} has mode {mode:o} after restricting it to {KEY_FILE_MODE:o}",
            path.display()
        )));
    }
    if meta.len() != expected_len as u64 {
        return Err(AutounlockError::Provider(format!(
            "key file {} is {} bytes, expected {expected_len}",
            path.display(),
            meta.len()
        )));
    }
    Ok(())
}

fn resolve_write_path(path: &Path) -> AutounlockResult<PathBuf> {
    let mut candidate = path.to_path_buf();
    for _ in 0..16 {
        let meta = match fs::symlink_metadata(&candidate) {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(candidate),
            Err(err) => return Err(AutounlockError::Io(err)),
        };

        if !meta.file_type().is_symlink() {
            return Ok(candidate);
        }

        let target = fs::read_link(&candidate)?;
        candidate = if target.is_absolute() {
            target
        } else {
            candidate
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."))
                .join(target)
        };
    }

    Err(AutounlockError::Provider(format!(
        "symlink resolution depth exceeded for {}",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generated_keys_have_requested_size_and_differ() {
        let a = generate_key(2048);
        let b = generate_key(2048);
        assert_eq!(a.len(), 2048);
        assert_ne!(&a[..], &b[..]);
    }

    #[test]
    fn write_raw_key_file_sets_permissions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("key.bin");
        let key = vec![0x42; 2048];
        write_raw_key_file(&path, &key).unwrap();
        assert_eq!(fs::read(&path).unwrap(), key);
        let metadata = fs::metadata(&path).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o400);
        restrict_key_file(&path, 2048).unwrap();
    }

    #[test]
    fn write_raw_key_file_replaces_read_only_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("key.bin");
        write_raw_key_file(&path, &[0x11; 16]).unwrap();
        write_raw_key_file(&path, &[0x22; 16]).unwrap();
        assert_eq!(fs::read(&path).unwrap(), vec![0x22; 16]);
    }

    #[test]
    fn write_raw_key_file_creates_parent() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested").join("key.bin");
        write_raw_key_file(&nested, &[0x11; 32]).unwrap();
        assert!(nested.exists());
    }

    #[test]
    fn restrict_rejects_short_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("key.bin");
        fs::write(&path, [0u8; 10]).unwrap();
        let err = restrict_key_file(&path, 2048).unwrap_err();
        assert!(err.to_string().contains("10 bytes"));
        assert_eq!(
            fs::metadata(&path).unwrap().permissions().mode() & 0o777,
            0o400
        );
    }

    #[test]
    fn read_existing_distinguishes_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("key.bin");
        assert!(read_existing(&path).unwrap().is_none());
        fs::write(&path, b"abc").unwrap();
        assert_eq!(&read_existing(&path).unwrap().unwrap()[..], b"abc");
    }

    #[test]
    fn fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
